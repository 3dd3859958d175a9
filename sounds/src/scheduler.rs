//! Playback scheduler.
//!
//! One [`PlaybackScheduler::pump`] cycle keeps every voice ahead of the
//! hardware: it recycles stopped voices, returns the slots of consumed buffers
//! to the pool, tops each decoding or playing voice back up to the low
//! watermark, and retires voices that have drained.
//!
//! Failures are contained per voice. A decode or device error stops the voice
//! that raised it and lands in the [`PumpReport`]; the other voices are pumped
//! as usual. Errors that are not voice-local point at an engine bug and are
//! logged as such.
//!
//! Paused voices are skipped: they take no buffers and cannot starve.

use crate::allocator::VoiceAllocator;
use crate::config::EngineDesc;
use crate::decoder::DecoderService;
use crate::error::{Result, SoundsError};
use crate::events::SoundEvent;
use crate::hardware::AudioHardware;
use crate::pool::BufferPool;
use crate::voice::{FillContext, FillOutcome, Voice, VoiceHandle, VoiceState};
use crossbeam_channel::Sender;
use std::time::Duration;

/// What one pump cycle did.
#[derive(Debug, Default)]
pub struct PumpReport {
    pub buffers_filled: usize,
    pub buffers_reclaimed: usize,
    pub voices_recycled: usize,
    pub voices_finished: usize,
    /// Voices stopped by an error during this cycle
    pub errors: Vec<(VoiceHandle, SoundsError)>,
    /// Output blocks the device rendered as silence since the previous cycle
    pub silent_blocks: u64,
}

impl PumpReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Errors that are not [voice-local](SoundsError::is_voice_local).
    pub fn internal_errors(&self) -> impl Iterator<Item = &(VoiceHandle, SoundsError)> {
        self.errors.iter().filter(|(_, error)| !error.is_voice_local())
    }
}

/// Everything a pump cycle touches, borrowed from the engine.
pub(crate) struct PumpContext<'a> {
    pub allocator: &'a mut VoiceAllocator,
    pub pool: &'a mut BufferPool,
    pub hardware: &'a mut dyn AudioHardware,
    pub decoders: &'a dyn DecoderService,
    pub events: &'a Sender<SoundEvent>,
}

#[derive(Debug)]
pub struct PlaybackScheduler {
    low_watermark: usize,
    max_fills_per_voice: usize,
    max_starved_cycles: u32,
    interval: Duration,
    cycles: u64,
}

impl PlaybackScheduler {
    pub fn new(desc: &EngineDesc) -> Self {
        Self {
            low_watermark: desc.low_watermark,
            max_fills_per_voice: desc.max_fills_per_voice,
            max_starved_cycles: desc.max_starved_cycles,
            interval: desc.pump_interval_or_default(),
            cycles: 0,
        }
    }

    /// Cadence at which [`PlaybackScheduler::pump`] should run.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Pump cycles run so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub(crate) fn pump(&mut self, ctx: PumpContext<'_>) -> PumpReport {
        let PumpContext {
            allocator,
            pool,
            hardware,
            decoders,
            events,
        } = ctx;

        self.cycles += 1;
        let mut report = PumpReport::default();

        match allocator.recycle_stopped() {
            Ok(recycled) => report.voices_recycled = recycled,
            Err(e) => log::error!("Failed to recycle stopped voices: {}", e),
        }

        for voice in allocator.voices_mut() {
            if !voice.state().is_active() || voice.is_paused() {
                continue;
            }

            let handle = voice.handle();
            let result = self
                .service_voice(voice, pool, hardware, decoders, events, &mut report)
                .and_then(|()| Self::drain_voice(voice, pool, hardware, events, &mut report));

            if let Err(e) = result {
                if e.is_voice_local() {
                    log::warn!("Stopping {} after error: {}", handle, e);
                } else {
                    log::error!("Stopping {} after internal error: {}", handle, e);
                }
                if let Err(flush) = voice.stop(pool, hardware) {
                    log::error!("Failed to flush {}: {}", handle, flush);
                }
                let _ = events.send(SoundEvent::VoiceFailed {
                    handle,
                    error: e.to_string(),
                });
                report.errors.push((handle, e));
            }
        }

        report.silent_blocks = hardware.take_silent_blocks();
        if report.silent_blocks > 0 {
            log::warn!(
                "Device rendered {} silent blocks while the mixer was busy",
                report.silent_blocks
            );
        }

        if report.buffers_filled > 0 || report.voices_finished > 0 {
            log::debug!(
                "Pump {}: {} filled, {} reclaimed, {} finished, {} in flight",
                self.cycles,
                report.buffers_filled,
                report.buffers_reclaimed,
                report.voices_finished,
                pool.in_flight_count()
            );
        }

        report
    }

    /// Reclaims consumed buffers and tops a Decoding/Playing voice up.
    fn service_voice(
        &self,
        voice: &mut Voice,
        pool: &mut BufferPool,
        hardware: &mut dyn AudioHardware,
        decoders: &dyn DecoderService,
        events: &Sender<SoundEvent>,
        report: &mut PumpReport,
    ) -> Result<()> {
        if !matches!(voice.state(), VoiceState::Decoding | VoiceState::Playing) {
            return Ok(());
        }

        let handle = voice.handle();
        let was_decoding = voice.state() == VoiceState::Decoding;
        report.buffers_reclaimed += voice.reclaim_consumed(pool, hardware)?;

        let mut ctx = FillContext {
            pool,
            hardware,
            decoders,
        };
        let mut fills = 0;
        while fills < self.max_fills_per_voice && voice.needs_buffer(self.low_watermark) {
            fills += 1;
            match voice.fill_one_buffer(&mut ctx)? {
                FillOutcome::Queued { .. } => report.buffers_filled += 1,
                FillOutcome::Looped { frames, loop_count } => {
                    if frames > 0 {
                        report.buffers_filled += 1;
                    }
                    let _ = events.send(SoundEvent::VoiceLooped { handle, loop_count });
                }
                FillOutcome::NextEntry { frames, entry } => {
                    if frames > 0 {
                        report.buffers_filled += 1;
                    }
                    let _ = events.send(SoundEvent::CueAdvanced { handle, entry });
                }
                FillOutcome::PoolExhausted => {
                    self.on_pool_exhausted(voice, events)?;
                    break;
                }
                FillOutcome::EndOfStream => {
                    voice.mark_finished()?;
                    let _ = events.send(SoundEvent::VoiceDraining { handle });
                    break;
                }
            }
        }

        if was_decoding && voice.state() != VoiceState::Decoding && voice.queued_buffers() > 0 {
            let _ = events.send(SoundEvent::VoiceStarted { handle });
        }
        Ok(())
    }

    /// Pool exhaustion is backpressure: the voice retries next cycle. Only a
    /// voice that has never started and keeps starving is given up on.
    fn on_pool_exhausted(&self, voice: &mut Voice, events: &Sender<SoundEvent>) -> Result<()> {
        let handle = voice.handle();
        if voice.state() == VoiceState::Decoding {
            let starved = voice.note_starved();
            if starved > self.max_starved_cycles {
                return Err(SoundsError::PoolExhausted(format!(
                    "{} got no buffer for {} pump cycles",
                    handle, starved
                )));
            }
        } else if voice.queued_buffers() == 0 {
            log::warn!("{} underrun: no buffer queued and the pool is empty", handle);
            let _ = events.send(SoundEvent::Underrun { handle });
        }
        Ok(())
    }

    /// Retires a Draining voice once the hardware has played everything.
    fn drain_voice(
        voice: &mut Voice,
        pool: &mut BufferPool,
        hardware: &mut dyn AudioHardware,
        events: &Sender<SoundEvent>,
        report: &mut PumpReport,
    ) -> Result<()> {
        if voice.state() != VoiceState::Draining {
            return Ok(());
        }

        report.buffers_reclaimed += voice.reclaim_consumed(pool, hardware)?;
        if voice.queued_buffers() == 0 {
            let handle = voice.handle();
            voice.finish_drain(hardware)?;
            report.voices_finished += 1;
            let _ = events.send(SoundEvent::VoiceFinished { handle });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{AssetId, AssetSource, FormatTag, SoundAsset, StreamInfo};
    use crate::config::PlayRequest;
    use crate::decoder::DefaultDecoderService;
    use crate::hardware::VirtualHardware;
    use crossbeam_channel::{Receiver, unbounded};
    use std::sync::Arc;

    /// Mono at 1kHz with 10-sample slots: one buffer is 10ms.
    struct Rig {
        scheduler: PlaybackScheduler,
        allocator: VoiceAllocator,
        pool: BufferPool,
        hw: VirtualHardware,
        decoders: DefaultDecoderService,
        events: Sender<SoundEvent>,
        received: Receiver<SoundEvent>,
    }

    impl Rig {
        fn new(voices: usize, slots: usize) -> Self {
            crate::init_test_logging();
            let desc = EngineDesc::new()
                .voice_count(voices)
                .buffer_count(slots)
                .buffer_size_bytes(40)
                .sample_rate(1000)
                .channels(1)
                .low_watermark(2)
                .max_fills_per_voice(2)
                .max_starved_cycles(2);
            let mut hw = VirtualHardware::new();
            let allocator = VoiceAllocator::new(&mut hw, voices).unwrap();
            let (events, received) = unbounded();
            Self {
                scheduler: PlaybackScheduler::new(&desc),
                allocator,
                pool: BufferPool::new(slots, desc.slot_samples()),
                hw,
                decoders: DefaultDecoderService::new(),
                events,
                received,
            }
        }

        fn play(&mut self, frames: usize, priority: i32) -> VoiceHandle {
            let samples: Arc<[f32]> = vec![0.25; frames].into();
            let asset = Arc::new(SoundAsset::new(
                "tone",
                AssetSource::Samples(samples),
                FormatTag::Pcm,
                StreamInfo {
                    channels: 1,
                    sample_rate: 1000,
                    total_frames: Some(frames as u64),
                },
            ));
            let request = PlayRequest::new(AssetId::from_index(0)).priority(priority);
            self.allocator
                .request_play(
                    &request,
                    vec![asset],
                    &self.decoders,
                    &mut self.pool,
                    &mut self.hw,
                    1.0,
                )
                .unwrap()
                .handle
        }

        fn pump(&mut self) -> PumpReport {
            self.scheduler.pump(PumpContext {
                allocator: &mut self.allocator,
                pool: &mut self.pool,
                hardware: &mut self.hw,
                decoders: &self.decoders,
                events: &self.events,
            })
        }

        fn state(&self, handle: VoiceHandle) -> VoiceState {
            self.allocator.voices()[handle.index()].state()
        }

        fn events(&self) -> Vec<SoundEvent> {
            self.received.try_iter().collect()
        }
    }

    #[test]
    fn test_pump_plays_to_the_end() {
        let mut rig = Rig::new(1, 4);
        let handle = rig.play(35, 0);

        let report = rig.pump();
        assert_eq!(report.buffers_filled, 2);
        assert_eq!(rig.state(handle), VoiceState::Playing);
        assert_eq!(rig.events(), vec![SoundEvent::VoiceStarted { handle }]);

        for _ in 0..10 {
            rig.hw.advance(Duration::from_millis(10));
            rig.pump();
            if rig.state(handle) == VoiceState::Stopped {
                break;
            }
        }
        assert_eq!(rig.state(handle), VoiceState::Stopped);
        assert_eq!(rig.pool.in_flight_count(), 0);

        let events = rig.events();
        assert!(events.contains(&SoundEvent::VoiceDraining { handle }));
        assert_eq!(events.last(), Some(&SoundEvent::VoiceFinished { handle }));

        // The next pump recycles the stopped voice.
        assert_eq!(rig.pump().voices_recycled, 1);
        assert_eq!(rig.allocator.voices()[0].state(), VoiceState::Idle);
    }

    #[test]
    fn test_fills_are_capped_per_cycle() {
        let mut rig = Rig::new(1, 8);
        rig.scheduler.low_watermark = 6;
        rig.play(1000, 0);

        assert_eq!(rig.pump().buffers_filled, 2);
        assert_eq!(rig.pump().buffers_filled, 2);
        assert_eq!(rig.pool.in_flight_count(), 4);
    }

    #[test]
    fn test_starved_voice_is_stopped_with_pool_exhausted() {
        // One slot, two voices: the second never gets a buffer.
        let mut rig = Rig::new(2, 1);
        let first = rig.play(1000, 0);
        rig.pump();
        let second = rig.play(1000, 0);

        assert!(rig.pump().is_clean());
        assert!(rig.pump().is_clean());
        let report = rig.pump();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, second);
        assert!(matches!(report.errors[0].1, SoundsError::PoolExhausted(_)));
        assert_eq!(rig.state(second), VoiceState::Stopped);
        assert_eq!(rig.state(first), VoiceState::Playing);
    }

    #[test]
    fn test_underrun_is_reported() {
        let mut rig = Rig::new(2, 2);
        let first = rig.play(1000, 0);
        rig.pump();
        assert_eq!(rig.pool.in_flight_count(), 2);

        // Let the first voice play out its queue; the second grabs the slots.
        rig.hw.advance(Duration::from_millis(25));
        let second = rig.play(1000, 0);
        rig.allocator.voices_mut()[second.index()]
            .reclaim_consumed(&mut rig.pool, &mut rig.hw)
            .unwrap();
        rig.allocator.voices_mut()[first.index()]
            .reclaim_consumed(&mut rig.pool, &mut rig.hw)
            .unwrap();
        let mut ctx = FillContext {
            pool: &mut rig.pool,
            hardware: &mut rig.hw,
            decoders: &rig.decoders,
        };
        let voice = &mut rig.allocator.voices_mut()[second.index()];
        voice.fill_one_buffer(&mut ctx).unwrap();
        voice.fill_one_buffer(&mut ctx).unwrap();
        rig.events();

        rig.pump();
        assert!(rig.events().contains(&SoundEvent::Underrun { handle: first }));
    }

    #[test]
    fn test_finished_voice_flushes_its_hardware_voice() {
        let mut rig = Rig::new(1, 4);
        let handle = rig.play(15, 0);
        rig.pump();
        let hw_voice = rig.allocator.voices()[0].hw_voice();

        rig.hw.advance(Duration::from_millis(15));
        rig.pump();
        assert_eq!(rig.state(handle), VoiceState::Stopped);
        assert_eq!(rig.hw.flushes(hw_voice), 1);
    }

    #[test]
    fn test_paused_voice_is_not_pumped() {
        let mut rig = Rig::new(1, 4);
        let handle = rig.play(1000, 0);
        rig.pump();
        rig.allocator.voices_mut()[0]
            .set_paused(true, &mut rig.hw)
            .unwrap();

        // Nothing is consumed or refilled, and a held voice never underruns.
        for _ in 0..5 {
            rig.hw.advance(Duration::from_millis(20));
            let report = rig.pump();
            assert_eq!(report.buffers_filled, 0);
            assert_eq!(report.buffers_reclaimed, 0);
        }
        assert_eq!(rig.state(handle), VoiceState::Playing);
        assert!(!rig.events().contains(&SoundEvent::Underrun { handle }));

        rig.allocator.voices_mut()[0]
            .set_paused(false, &mut rig.hw)
            .unwrap();
        rig.hw.advance(Duration::from_millis(10));
        let report = rig.pump();
        assert_eq!(report.buffers_reclaimed, 1);
        assert_eq!(report.buffers_filled, 1);
    }

    #[test]
    fn test_internal_errors_are_told_apart() {
        let local = VoiceHandle::new(0, 1);
        let broken = VoiceHandle::new(1, 1);
        let report = PumpReport {
            errors: vec![
                (local, SoundsError::CorruptStream("bad packet".into())),
                (
                    broken,
                    SoundsError::IllegalTransition {
                        from: "Idle",
                        to: "Stopped",
                    },
                ),
            ],
            ..PumpReport::default()
        };

        let internal: Vec<_> = report.internal_errors().map(|(h, _)| *h).collect();
        assert_eq!(internal, vec![broken]);
        assert!(!report.is_clean());
    }
}
