//! Voice allocator.
//!
//! Owns the fixed set of voices, one per hardware voice, and decides which
//! voice a play request gets: a free one if any, otherwise the lowest priority
//! active voice when the request outranks it strictly. Ties keep the sound that
//! is already playing.

use crate::asset::SoundAsset;
use crate::config::{PlayRequest, SoundCategory};
use crate::decoder::DecoderService;
use crate::error::{Result, SoundsError};
use crate::hardware::AudioHardware;
use crate::pool::BufferPool;
use crate::voice::{Voice, VoiceHandle, VoiceState};
use std::sync::Arc;

/// Voice taken from a lower priority sound to serve a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StolenVoice {
    pub handle: VoiceHandle,
    pub priority: i32,
}

/// Successful [`VoiceAllocator::request_play`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub handle: VoiceHandle,
    pub stolen: Option<StolenVoice>,
}

pub struct VoiceAllocator {
    voices: Vec<Voice>,
    next_bind: u64,
}

impl VoiceAllocator {
    /// Creates `count` hardware voices and wraps each in an idle [`Voice`].
    pub fn new(hardware: &mut dyn AudioHardware, count: usize) -> Result<Self> {
        let mut voices = Vec::with_capacity(count);
        for index in 0..count {
            let hw = hardware.create_voice()?;
            voices.push(Voice::new(index as u32, hw));
        }
        log::debug!("Created {} hardware voices", count);

        Ok(Self {
            voices,
            next_bind: 0,
        })
    }

    /// Binds the resolved `assets` of a request (one per cue entry) to a
    /// voice, stealing one if needed.
    ///
    /// The first entry's decoder is opened before any voice is stolen, so a
    /// request that fails to open never evicts a playing sound.
    pub(crate) fn request_play(
        &mut self,
        request: &PlayRequest,
        assets: Vec<Arc<SoundAsset>>,
        decoders: &dyn DecoderService,
        pool: &mut BufferPool,
        hardware: &mut dyn AudioHardware,
        mix_gain: f32,
    ) -> Result<Allocation> {
        let first = assets
            .first()
            .cloned()
            .ok_or_else(|| SoundsError::Configuration("Empty cue".into()))?;
        let target = self.pick_voice(request.priority)?;
        let decoder = decoders.open(&first)?;

        let voice = &mut self.voices[target];
        let stolen = if voice.state().is_active() {
            let victim = StolenVoice {
                handle: voice.handle(),
                priority: voice.priority(),
            };
            log::warn!(
                "Stealing {} (priority {}) for {} (priority {})",
                victim.handle,
                victim.priority,
                first.name(),
                request.priority
            );
            if let Err(e) = voice.stop(pool, hardware) {
                log::error!("Failed to flush stolen {}: {}", victim.handle, e);
            }
            Some(victim)
        } else {
            None
        };

        if voice.state() == VoiceState::Stopped {
            voice.recycle()?;
        }

        self.next_bind += 1;
        let handle = voice.bind(assets, decoder, request, self.next_bind)?;
        if let Err(e) = voice.apply_params(hardware, mix_gain) {
            let _ = voice.stop(pool, hardware);
            return Err(e);
        }

        Ok(Allocation { handle, stolen })
    }

    /// Index of the voice a request at `priority` would get.
    fn pick_voice(&self, priority: i32) -> Result<usize> {
        if let Some(free) = self.voices.iter().position(|v| v.state().is_free()) {
            return Ok(free);
        }

        // Lowest priority first, then the oldest binding.
        let victim = self
            .voices
            .iter()
            .enumerate()
            .filter(|(_, v)| v.state().is_active())
            .min_by_key(|(_, v)| (v.priority(), v.bound_at()));

        match victim {
            Some((index, voice)) if voice.priority() < priority => Ok(index),
            _ => Err(SoundsError::NoVoiceAvailable { priority }),
        }
    }

    /// Stops the sound behind `handle`. Returns `false` when the handle no
    /// longer addresses a bound sound, which is not an error.
    pub(crate) fn release(
        &mut self,
        handle: VoiceHandle,
        pool: &mut BufferPool,
        hardware: &mut dyn AudioHardware,
    ) -> Result<bool> {
        match self.get_mut(handle) {
            Some(voice) => {
                voice.stop(pool, hardware)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stops every active voice matching `filter`, returning their handles.
    pub(crate) fn stop_where(
        &mut self,
        pool: &mut BufferPool,
        hardware: &mut dyn AudioHardware,
        filter: impl Fn(&Voice) -> bool,
    ) -> Vec<VoiceHandle> {
        let mut stopped = Vec::new();
        for voice in self.voices.iter_mut() {
            if !voice.state().is_active() || !filter(&*voice) {
                continue;
            }
            let handle = voice.handle();
            if let Err(e) = voice.stop(pool, hardware) {
                log::error!("Failed to flush {}: {}", handle, e);
            }
            stopped.push(handle);
        }
        stopped
    }

    pub(crate) fn stop_all(
        &mut self,
        pool: &mut BufferPool,
        hardware: &mut dyn AudioHardware,
    ) -> Vec<VoiceHandle> {
        self.stop_where(pool, hardware, |_| true)
    }

    pub(crate) fn stop_category(
        &mut self,
        category: SoundCategory,
        pool: &mut BufferPool,
        hardware: &mut dyn AudioHardware,
    ) -> Vec<VoiceHandle> {
        self.stop_where(pool, hardware, |v| v.category() == category)
    }

    /// Returns Stopped voices to Idle. Returns how many were recycled.
    pub(crate) fn recycle_stopped(&mut self) -> Result<usize> {
        let mut recycled = 0;
        for voice in self.voices.iter_mut() {
            if voice.state() == VoiceState::Stopped {
                voice.recycle()?;
                recycled += 1;
            }
        }
        Ok(recycled)
    }

    pub fn get(&self, handle: VoiceHandle) -> Option<&Voice> {
        self.voices.get(handle.index()).filter(|v| v.matches(handle))
    }

    pub(crate) fn get_mut(&mut self, handle: VoiceHandle) -> Option<&mut Voice> {
        self.voices
            .get_mut(handle.index())
            .filter(|v| v.matches(handle))
    }

    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    pub(crate) fn voices_mut(&mut self) -> &mut [Voice] {
        &mut self.voices
    }

    /// Voices holding a sound (Decoding, Playing or Draining).
    pub fn active_count(&self) -> usize {
        self.voices.iter().filter(|v| v.state().is_active()).count()
    }

    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{AssetId, AssetSource, FormatTag, StreamInfo};
    use crate::decoder::DefaultDecoderService;
    use crate::hardware::VirtualHardware;

    fn pcm_asset(name: &str) -> Arc<SoundAsset> {
        let samples: Arc<[f32]> = vec![0.0; 100].into();
        Arc::new(SoundAsset::new(
            name,
            AssetSource::Samples(samples),
            FormatTag::Pcm,
            StreamInfo {
                channels: 1,
                sample_rate: 1000,
                total_frames: Some(100),
            },
        ))
    }

    struct Rig {
        allocator: VoiceAllocator,
        pool: BufferPool,
        hw: VirtualHardware,
        decoders: DefaultDecoderService,
    }

    impl Rig {
        fn new(voices: usize) -> Self {
            crate::init_test_logging();
            let mut hw = VirtualHardware::new();
            let allocator = VoiceAllocator::new(&mut hw, voices).unwrap();
            Self {
                allocator,
                pool: BufferPool::new(8, 10),
                hw,
                decoders: DefaultDecoderService::new(),
            }
        }

        fn play(&mut self, priority: i32) -> Result<Allocation> {
            self.play_asset(pcm_asset("sfx"), priority)
        }

        fn play_asset(&mut self, asset: Arc<SoundAsset>, priority: i32) -> Result<Allocation> {
            let request = PlayRequest::new(AssetId::from_index(0)).priority(priority);
            self.allocator.request_play(
                &request,
                vec![asset],
                &self.decoders,
                &mut self.pool,
                &mut self.hw,
                1.0,
            )
        }
    }

    #[test]
    fn test_free_voices_are_used_first() {
        let mut rig = Rig::new(2);
        let a = rig.play(5).unwrap();
        let b = rig.play(1).unwrap();
        assert_ne!(a.handle.index(), b.handle.index());
        assert!(a.stolen.is_none() && b.stolen.is_none());
        assert_eq!(rig.allocator.active_count(), 2);
    }

    #[test]
    fn test_steals_lowest_priority() {
        let mut rig = Rig::new(2);
        let high = rig.play(5).unwrap();
        let low = rig.play(1).unwrap();

        let incoming = rig.play(3).unwrap();
        assert_eq!(
            incoming.stolen,
            Some(StolenVoice {
                handle: low.handle,
                priority: 1
            })
        );
        assert_eq!(incoming.handle.index(), low.handle.index());
        assert!(rig.allocator.get(low.handle).is_none());
        assert!(rig.allocator.get(high.handle).is_some());
        assert_eq!(rig.allocator.active_count(), 2);
    }

    #[test]
    fn test_equal_priority_is_rejected() {
        let mut rig = Rig::new(2);
        let a = rig.play(2).unwrap();
        let b = rig.play(2).unwrap();

        assert!(matches!(
            rig.play(2),
            Err(SoundsError::NoVoiceAvailable { priority: 2 })
        ));
        assert!(rig.allocator.get(a.handle).is_some());
        assert!(rig.allocator.get(b.handle).is_some());
    }

    #[test]
    fn test_oldest_is_stolen_among_equals() {
        let mut rig = Rig::new(2);
        let first = rig.play(1).unwrap();
        let second = rig.play(1).unwrap();
        let incoming = rig.play(2).unwrap();
        assert_eq!(incoming.stolen.map(|s| s.handle), Some(first.handle));
        assert!(rig.allocator.get(second.handle).is_some());
    }

    #[test]
    fn test_failed_open_does_not_evict() {
        let mut rig = Rig::new(1);
        let playing = rig.play(1).unwrap();

        let broken = Arc::new(SoundAsset::new(
            "broken",
            AssetSource::Memory(vec![0u8; 4].into()),
            FormatTag::Pcm,
            StreamInfo {
                channels: 1,
                sample_rate: 1000,
                total_frames: None,
            },
        ));
        assert!(rig.play_asset(broken, 10).is_err());
        assert!(rig.allocator.get(playing.handle).is_some());
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut rig = Rig::new(1);
        let a = rig.play(1).unwrap();
        assert!(rig
            .allocator
            .release(a.handle, &mut rig.pool, &mut rig.hw)
            .unwrap());
        assert!(!rig
            .allocator
            .release(a.handle, &mut rig.pool, &mut rig.hw)
            .unwrap());

        // A stopped voice is reused without waiting for the pump.
        let b = rig.play(1).unwrap();
        assert_eq!(b.handle.index(), a.handle.index());
        assert!(!rig
            .allocator
            .release(a.handle, &mut rig.pool, &mut rig.hw)
            .unwrap());
        assert!(rig.allocator.get(b.handle).is_some());
    }

    #[test]
    fn test_stop_category() {
        let mut rig = Rig::new(3);
        let music = PlayRequest::new(AssetId::from_index(0)).category(SoundCategory(1));
        let m = rig
            .allocator
            .request_play(
                &music,
                vec![pcm_asset("music")],
                &rig.decoders,
                &mut rig.pool,
                &mut rig.hw,
                1.0,
            )
            .unwrap();
        let sfx = rig.play(0).unwrap();

        let stopped = rig
            .allocator
            .stop_category(SoundCategory(1), &mut rig.pool, &mut rig.hw);
        assert_eq!(stopped, vec![m.handle]);
        assert!(rig.allocator.get(sfx.handle).is_some());

        assert_eq!(rig.allocator.recycle_stopped().unwrap(), 1);
        let stopped = rig.allocator.stop_all(&mut rig.pool, &mut rig.hw);
        assert_eq!(stopped, vec![sfx.handle]);
    }
}
