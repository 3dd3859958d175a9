//! Read-only view of the engine for debug overlays and tooling.

use crate::asset::{AssetId, AssetRegistry, FormatTag};
use crate::config::SoundCategory;
use crate::pool::BufferPool;
use crate::voice::{Voice, VoiceHandle, VoiceState};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct VoiceSnapshot {
    pub handle: VoiceHandle,
    pub hardware_voice: u32,
    pub state: VoiceState,
    pub priority: i32,
    /// Name of the asset being decoded, `None` on a free voice
    pub asset: Option<String>,
    /// Cue entry being decoded, and the number of entries
    pub cue_entry: usize,
    pub cue_len: usize,
    pub paused: bool,
    pub queued_buffers: usize,
    pub cursor_frames: u64,
    pub gain: f32,
    pub category: SoundCategory,
}

impl VoiceSnapshot {
    pub(crate) fn of(voice: &Voice) -> Self {
        Self {
            handle: voice.handle(),
            hardware_voice: voice.hw_voice().0,
            state: voice.state(),
            priority: voice.priority(),
            asset: voice.asset().map(|asset| asset.name().to_string()),
            cue_entry: voice.cue_entry(),
            cue_len: voice.cue_len(),
            paused: voice.is_paused(),
            queued_buffers: voice.queued_buffers(),
            cursor_frames: voice.cursor_frames(),
            gain: voice.gain(),
            category: voice.category(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub capacity: usize,
    pub free: usize,
    pub in_flight: usize,
    pub slot_samples: usize,
}

impl PoolSnapshot {
    pub(crate) fn of(pool: &BufferPool) -> Self {
        Self {
            capacity: pool.capacity(),
            free: pool.free_count(),
            in_flight: pool.in_flight_count(),
            slot_samples: pool.slot_samples(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssetSnapshot {
    pub id: AssetId,
    pub name: String,
    pub format: FormatTag,
    pub channels: u16,
    pub sample_rate: u32,
    pub duration: Option<Duration>,
    pub streamed: bool,
}

/// State of the engine at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSnapshot {
    pub voices: Vec<VoiceSnapshot>,
    pub pool: PoolSnapshot,
    pub assets: Vec<AssetSnapshot>,
    pub pump_cycles: u64,
}

impl EngineSnapshot {
    pub(crate) fn capture(
        voices: &[Voice],
        pool: &BufferPool,
        assets: &AssetRegistry,
        pump_cycles: u64,
    ) -> Self {
        Self {
            voices: voices.iter().map(VoiceSnapshot::of).collect(),
            pool: PoolSnapshot::of(pool),
            assets: assets
                .iter()
                .map(|(id, asset)| AssetSnapshot {
                    id,
                    name: asset.name().to_string(),
                    format: asset.format(),
                    channels: asset.channels(),
                    sample_rate: asset.sample_rate(),
                    duration: asset.duration(),
                    streamed: asset.is_streamed(),
                })
                .collect(),
            pump_cycles,
        }
    }

    /// Voices currently holding a sound.
    pub fn active_voices(&self) -> usize {
        self.voices.iter().filter(|v| v.state.is_active()).count()
    }

    /// Buffers queued across all voices. Always equals `pool.in_flight`.
    pub fn queued_buffers(&self) -> usize {
        self.voices.iter().map(|v| v.queued_buffers).sum()
    }
}

impl std::fmt::Display for EngineSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "pump #{}: {}/{} voices active, pool {}/{} in flight",
            self.pump_cycles,
            self.active_voices(),
            self.voices.len(),
            self.pool.in_flight,
            self.pool.capacity
        )?;
        for voice in self.voices.iter().filter(|v| v.state.is_active()) {
            write!(
                f,
                "  {} {:<8} prio {:>3} {:>2} queued  {}",
                voice.handle,
                voice.state.name(),
                voice.priority,
                voice.queued_buffers,
                voice.asset.as_deref().unwrap_or("-")
            )?;
            if voice.cue_len > 1 {
                write!(f, " [{}/{}]", voice.cue_entry + 1, voice.cue_len)?;
            }
            if voice.paused {
                write!(f, " (paused)")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
