use crate::error::{Result, SoundsError};
use std::time::Duration;

/// Configuration descriptor for a sound engine.
///
/// Every field is fixed once the engine is constructed. The buffer pool holds
/// `buffer_count` slots of `buffer_size_bytes` bytes of `f32` PCM each, shared by
/// all `voice_count` voices.
#[derive(Debug, Clone)]
pub struct EngineDesc {
    /// Number of hardware voices (maximum concurrently active sounds)
    pub voice_count: usize,
    /// Number of PCM buffer slots in the streaming pool
    pub buffer_count: usize,
    /// Size of one buffer slot in bytes
    pub buffer_size_bytes: usize,
    /// Pump cadence. `None` derives it from the buffer duration at the output format.
    pub pump_interval: Option<Duration>,
    /// A voice asks for more data while fewer than this many buffers are queued
    pub low_watermark: usize,
    /// Cap on buffers decoded for one voice in a single pump cycle
    pub max_fills_per_voice: usize,
    /// Pump cycles a freshly bound voice may wait for its first buffer slot
    pub max_starved_cycles: u32,
    /// Output sample rate of the hardware device
    pub sample_rate: u32,
    /// Output channel count of the hardware device
    pub channels: u16,
    /// Frames requested per device callback
    pub block_size: usize,
}

impl Default for EngineDesc {
    fn default() -> Self {
        Self {
            voice_count: 16,
            buffer_count: 48,
            buffer_size_bytes: 32768,
            pump_interval: None,
            low_watermark: 3,
            max_fills_per_voice: 2,
            max_starved_cycles: 8,
            sample_rate: 48000,
            channels: 2,
            block_size: 1024,
        }
    }
}

impl EngineDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn voice_count(mut self, count: usize) -> Self {
        self.voice_count = count;
        self
    }

    pub fn buffer_count(mut self, count: usize) -> Self {
        self.buffer_count = count;
        self
    }

    pub fn buffer_size_bytes(mut self, bytes: usize) -> Self {
        self.buffer_size_bytes = bytes;
        self
    }

    pub fn pump_interval(mut self, interval: Duration) -> Self {
        self.pump_interval = Some(interval);
        self
    }

    pub fn low_watermark(mut self, buffers: usize) -> Self {
        self.low_watermark = buffers;
        self
    }

    pub fn max_fills_per_voice(mut self, buffers: usize) -> Self {
        self.max_fills_per_voice = buffers;
        self
    }

    pub fn max_starved_cycles(mut self, cycles: u32) -> Self {
        self.max_starved_cycles = cycles;
        self
    }

    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Number of `f32` samples one buffer slot can hold.
    pub fn slot_samples(&self) -> usize {
        self.buffer_size_bytes / std::mem::size_of::<f32>()
    }

    /// Playback time covered by one full buffer at the output format.
    pub fn buffer_duration(&self) -> Duration {
        let frames = (self.slot_samples() / self.channels.max(1) as usize) as u64;
        Duration::from_nanos(frames * 1_000_000_000 / self.sample_rate.max(1) as u64)
    }

    /// Effective pump cadence: the configured interval, or half a buffer so the
    /// pump always runs at least twice before a queued buffer drains.
    pub fn pump_interval_or_default(&self) -> Duration {
        self.pump_interval
            .unwrap_or_else(|| self.buffer_duration() / 2)
    }

    pub fn validate(&self) -> Result<()> {
        if self.voice_count == 0 {
            return Err(SoundsError::Configuration(
                "voice_count must be greater than 0".into(),
            ));
        }
        if self.buffer_count == 0 {
            return Err(SoundsError::Configuration(
                "buffer_count must be greater than 0".into(),
            ));
        }
        if self.sample_rate == 0 || self.channels == 0 {
            return Err(SoundsError::Configuration(
                "sample_rate and channels must be greater than 0".into(),
            ));
        }
        // A slot must hold at least one frame of the widest layout we accept.
        if self.slot_samples() < MAX_SOURCE_CHANNELS {
            return Err(SoundsError::Configuration(format!(
                "buffer_size_bytes {} is too small to hold one frame",
                self.buffer_size_bytes
            )));
        }
        if self.low_watermark == 0 || self.max_fills_per_voice == 0 {
            return Err(SoundsError::Configuration(
                "low_watermark and max_fills_per_voice must be greater than 0".into(),
            ));
        }
        if self.low_watermark > self.buffer_count {
            return Err(SoundsError::Configuration(format!(
                "low_watermark {} exceeds buffer_count {}",
                self.low_watermark, self.buffer_count
            )));
        }
        if self.pump_interval == Some(Duration::ZERO) {
            return Err(SoundsError::Configuration(
                "pump_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Widest channel layout a sound asset may have.
pub(crate) const MAX_SOURCE_CHANNELS: usize = 8;
