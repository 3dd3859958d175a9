mod engine_desc;
mod play_request;

pub(crate) use engine_desc::MAX_SOURCE_CHANNELS;
pub use engine_desc::EngineDesc;
pub use play_request::{CueEntry, LoopMode, PlayRequest, SoundCategory, SpatialParams};
