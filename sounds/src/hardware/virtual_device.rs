use crate::asset::frames_to_duration;
use crate::error::{Result, SoundsError};
use crate::hardware::{AudioHardware, HwVoiceId, PcmFormat};
use crate::math::{Pose, Vec3};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Hardware backend that plays nothing and consumes queued buffers against an
/// explicit clock.
///
/// Clones share the same device, so a test or headless host can keep one clone
/// to drive [`VirtualHardware::advance`] while the engine owns another.
#[derive(Clone, Default)]
pub struct VirtualHardware {
    state: Arc<Mutex<VirtualState>>,
}

#[derive(Default)]
struct VirtualState {
    voices: Vec<Option<VirtualVoice>>,
    listener: Pose,
    enqueued_total: u64,
}

struct VirtualVoice {
    /// Remaining play time of each queued buffer, front first
    queue: VecDeque<Duration>,
    consumed_unreported: usize,
    gain: f32,
    position: Option<Vec3>,
    playing: bool,
    paused: bool,
    underruns: u32,
    flushes: u32,
    played: Duration,
}

impl Default for VirtualVoice {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            consumed_unreported: 0,
            gain: 1.0,
            position: None,
            playing: false,
            paused: false,
            underruns: 0,
            flushes: 0,
            played: Duration::ZERO,
        }
    }
}

impl VirtualHardware {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VirtualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lets `elapsed` of playback time pass on every voice.
    ///
    /// A playing voice whose queue runs dry before the time is up records an
    /// underrun and stays silent until its next buffer arrives. Paused voices
    /// do not move.
    pub fn advance(&self, elapsed: Duration) {
        let mut state = self.lock();
        for voice in state.voices.iter_mut().flatten() {
            if !voice.playing || voice.paused {
                continue;
            }

            let mut budget = elapsed;
            while let Some(front) = voice.queue.front_mut() {
                if *front <= budget {
                    budget -= *front;
                    voice.played += *front;
                    voice.queue.pop_front();
                    voice.consumed_unreported += 1;
                } else {
                    *front -= budget;
                    voice.played += budget;
                    budget = Duration::ZERO;
                    break;
                }
            }

            if voice.queue.is_empty() && !budget.is_zero() {
                voice.playing = false;
                voice.underruns += 1;
            }
        }
    }

    /// Buffers still queued on a voice (including the one playing).
    pub fn queued_buffers(&self, voice: HwVoiceId) -> usize {
        self.with_voice(voice, |v| v.queue.len()).unwrap_or(0)
    }

    pub fn gain(&self, voice: HwVoiceId) -> Option<f32> {
        self.with_voice(voice, |v| v.gain)
    }

    pub fn position(&self, voice: HwVoiceId) -> Option<Vec3> {
        self.with_voice(voice, |v| v.position).flatten()
    }

    pub fn is_paused(&self, voice: HwVoiceId) -> bool {
        self.with_voice(voice, |v| v.paused).unwrap_or(false)
    }

    /// Times the voice was stopped and flushed.
    pub fn flushes(&self, voice: HwVoiceId) -> u32 {
        self.with_voice(voice, |v| v.flushes).unwrap_or(0)
    }

    pub fn underruns(&self, voice: HwVoiceId) -> u32 {
        self.with_voice(voice, |v| v.underruns).unwrap_or(0)
    }

    /// Total playback time a voice has rendered.
    pub fn played(&self, voice: HwVoiceId) -> Duration {
        self.with_voice(voice, |v| v.played).unwrap_or_default()
    }

    /// Buffers enqueued on any voice since the device was created.
    pub fn enqueued_total(&self) -> u64 {
        self.lock().enqueued_total
    }

    pub fn listener(&self) -> Pose {
        self.lock().listener
    }

    fn with_voice<T>(&self, voice: HwVoiceId, f: impl FnOnce(&VirtualVoice) -> T) -> Option<T> {
        let state = self.lock();
        state
            .voices
            .get(voice.index())
            .and_then(|v| v.as_ref())
            .map(f)
    }
}

fn voice_mut(state: &mut VirtualState, voice: HwVoiceId) -> Result<&mut VirtualVoice> {
    state
        .voices
        .get_mut(voice.index())
        .and_then(|v| v.as_mut())
        .ok_or_else(|| SoundsError::AudioDevice(format!("Unknown hardware voice {}", voice)))
}

impl AudioHardware for VirtualHardware {
    fn create_voice(&mut self) -> Result<HwVoiceId> {
        let mut state = self.lock();
        let id = HwVoiceId(state.voices.len() as u32);
        state.voices.push(Some(VirtualVoice::default()));
        Ok(id)
    }

    fn destroy_voice(&mut self, voice: HwVoiceId) {
        if let Some(slot) = self.lock().voices.get_mut(voice.index()) {
            *slot = None;
        }
    }

    fn enqueue(&mut self, voice: HwVoiceId, samples: &[f32], format: PcmFormat) -> Result<()> {
        let mut state = self.lock();
        let frames = format.frames(samples.len()) as u64;
        let target = voice_mut(&mut state, voice)?;
        target
            .queue
            .push_back(frames_to_duration(frames, format.sample_rate));
        target.playing = true;
        state.enqueued_total += 1;
        Ok(())
    }

    fn buffers_consumed(&mut self, voice: HwVoiceId) -> Result<usize> {
        let mut state = self.lock();
        let target = voice_mut(&mut state, voice)?;
        Ok(std::mem::take(&mut target.consumed_unreported))
    }

    fn set_gain(&mut self, voice: HwVoiceId, gain: f32) -> Result<()> {
        let mut state = self.lock();
        voice_mut(&mut state, voice)?.gain = gain;
        Ok(())
    }

    fn set_position(&mut self, voice: HwVoiceId, position: Option<Vec3>) -> Result<()> {
        let mut state = self.lock();
        voice_mut(&mut state, voice)?.position = position;
        Ok(())
    }

    fn set_listener(&mut self, pose: Pose) -> Result<()> {
        self.lock().listener = pose;
        Ok(())
    }

    fn set_paused(&mut self, voice: HwVoiceId, paused: bool) -> Result<()> {
        let mut state = self.lock();
        voice_mut(&mut state, voice)?.paused = paused;
        Ok(())
    }

    fn stop_and_flush(&mut self, voice: HwVoiceId) -> Result<()> {
        let mut state = self.lock();
        let target = voice_mut(&mut state, voice)?;
        target.queue.clear();
        target.consumed_unreported = 0;
        target.playing = false;
        target.paused = false;
        target.flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MONO_48K: PcmFormat = PcmFormat {
        channels: 1,
        sample_rate: 48000,
    };

    #[test]
    fn test_buffers_are_consumed_in_time() {
        let mut hw = VirtualHardware::new();
        let voice = hw.create_voice().unwrap();

        // Two 10ms buffers
        hw.enqueue(voice, &[0.0; 480], MONO_48K).unwrap();
        hw.enqueue(voice, &[0.0; 480], MONO_48K).unwrap();

        hw.advance(Duration::from_millis(5));
        assert_eq!(hw.buffers_consumed(voice).unwrap(), 0);

        hw.advance(Duration::from_millis(10));
        assert_eq!(hw.buffers_consumed(voice).unwrap(), 1);
        // Reported counts are not repeated.
        assert_eq!(hw.buffers_consumed(voice).unwrap(), 0);
        assert_eq!(hw.queued_buffers(voice), 1);
        assert_eq!(hw.underruns(voice), 0);

        hw.advance(Duration::from_millis(20));
        assert_eq!(hw.buffers_consumed(voice).unwrap(), 1);
        assert_eq!(hw.underruns(voice), 1);
        assert_eq!(hw.played(voice), Duration::from_millis(20));
    }

    #[test]
    fn test_flush_discards_queue() {
        let mut hw = VirtualHardware::new();
        let voice = hw.create_voice().unwrap();
        hw.enqueue(voice, &[0.0; 480], MONO_48K).unwrap();
        hw.enqueue(voice, &[0.0; 480], MONO_48K).unwrap();
        hw.advance(Duration::from_millis(10));

        hw.stop_and_flush(voice).unwrap();
        assert_eq!(hw.queued_buffers(voice), 0);
        assert_eq!(hw.buffers_consumed(voice).unwrap(), 0);
        assert_eq!(hw.enqueued_total(), 2);
    }

    #[test]
    fn test_paused_voice_holds_its_queue() {
        let mut hw = VirtualHardware::new();
        let voice = hw.create_voice().unwrap();
        hw.enqueue(voice, &[0.0; 480], MONO_48K).unwrap();

        hw.set_paused(voice, true).unwrap();
        hw.advance(Duration::from_millis(50));
        assert_eq!(hw.buffers_consumed(voice).unwrap(), 0);
        assert_eq!(hw.played(voice), Duration::ZERO);
        assert_eq!(hw.underruns(voice), 0);

        hw.set_paused(voice, false).unwrap();
        hw.advance(Duration::from_millis(10));
        assert_eq!(hw.buffers_consumed(voice).unwrap(), 1);

        hw.set_paused(voice, true).unwrap();
        hw.stop_and_flush(voice).unwrap();
        assert!(!hw.is_paused(voice));
        assert_eq!(hw.flushes(voice), 1);
    }

    #[test]
    fn test_clones_share_the_device() {
        let mut hw = VirtualHardware::new();
        let observer = hw.clone();
        let voice = hw.create_voice().unwrap();
        hw.set_gain(voice, 0.25).unwrap();
        hw.set_position(voice, Some(Vec3::X)).unwrap();

        assert_eq!(observer.gain(voice), Some(0.25));
        assert_eq!(observer.position(voice), Some(Vec3::X));
    }

    #[test]
    fn test_destroyed_voice_is_unknown() {
        let mut hw = VirtualHardware::new();
        let voice = hw.create_voice().unwrap();
        hw.destroy_voice(voice);
        assert!(hw.buffers_consumed(voice).is_err());
    }
}
