//! Error types for sounds

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SoundsError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Corrupt stream: {0}")]
    CorruptStream(String),

    #[error("Seek unsupported: {0}")]
    SeekUnsupported(String),

    #[error("No voice available for priority {priority}")]
    NoVoiceAvailable { priority: i32 },

    #[error("Voice handle {0} no longer refers to a bound voice")]
    StaleHandle(String),

    #[error("Unknown asset: {0}")]
    UnknownAsset(String),

    #[error("Asset already registered: {0}")]
    DuplicateAsset(String),

    #[error("Illegal voice transition: {from} -> {to}")]
    IllegalTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("Buffer slot {0} released twice")]
    DoubleRelease(u32),

    #[error("Buffer slot {0} does not belong to this pool")]
    InvalidSlot(u32),

    #[error("Buffer pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio format error: {0}")]
    AudioFormat(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SoundsError {
    /// Errors that only affect the voice that raised them. The pump stops
    /// that voice and keeps going.
    pub fn is_voice_local(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedFormat(_)
                | Self::CorruptStream(_)
                | Self::SeekUnsupported(_)
                | Self::PoolExhausted(_)
                | Self::AudioDevice(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SoundsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_local_errors() {
        assert!(SoundsError::CorruptStream("bad packet".into()).is_voice_local());
        assert!(SoundsError::PoolExhausted("starved".into()).is_voice_local());
        assert!(SoundsError::AudioDevice("gone".into()).is_voice_local());

        assert!(!SoundsError::DoubleRelease(3).is_voice_local());
        assert!(!SoundsError::Engine("no decoder".into()).is_voice_local());
        assert!(
            !SoundsError::IllegalTransition {
                from: "Idle",
                to: "Draining"
            }
            .is_voice_local()
        );
    }
}
