//! Event types for sounds

use crate::voice::VoiceHandle;

/// Notifications produced while pumping the engine.
///
/// Drained with [`SoundEngine::poll_events`](crate::SoundEngine::poll_events).
#[derive(Debug, Clone, PartialEq)]
pub enum SoundEvent {
    /// First buffer of a voice reached the hardware
    VoiceStarted { handle: VoiceHandle },
    VoiceLooped { handle: VoiceHandle, loop_count: u32 },
    /// Decoding moved on to cue entry `entry`
    CueAdvanced { handle: VoiceHandle, entry: usize },
    /// All data is decoded; queued buffers are still playing
    VoiceDraining { handle: VoiceHandle },
    /// Played to the end
    VoiceFinished { handle: VoiceHandle },
    /// Stopped by the client before the end
    VoiceStopped { handle: VoiceHandle },
    VoiceStolen {
        handle: VoiceHandle,
        victim_priority: i32,
        new_priority: i32,
    },
    /// Stopped by a decode or device error
    VoiceFailed { handle: VoiceHandle, error: String },
    /// A playing voice ran out of queued audio
    Underrun { handle: VoiceHandle },
}

impl SoundEvent {
    pub fn handle(&self) -> VoiceHandle {
        match self {
            Self::VoiceStarted { handle }
            | Self::VoiceLooped { handle, .. }
            | Self::CueAdvanced { handle, .. }
            | Self::VoiceDraining { handle }
            | Self::VoiceFinished { handle }
            | Self::VoiceStopped { handle }
            | Self::VoiceStolen { handle, .. }
            | Self::VoiceFailed { handle, .. }
            | Self::Underrun { handle } => *handle,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::VoiceFailed { .. } | Self::Underrun { .. })
    }

    /// Whether the event ends the voice's playback.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::VoiceFinished { .. }
                | Self::VoiceStopped { .. }
                | Self::VoiceStolen { .. }
                | Self::VoiceFailed { .. }
        )
    }
}
