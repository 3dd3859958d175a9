//! # sounds
//!
//! A streaming sound manager and player for games.
//!
//! `sounds` plays many sounds through a small, fixed set of hardware voices.
//! Compressed assets are decoded a buffer at a time into a fixed pool of PCM
//! slots, so memory stays bounded no matter how many sounds are requested, and
//! a periodic pump keeps every voice a few buffers ahead of the device.
//!
//! ## Quick Start
//!
//! ```no_run
//! use sounds::*;
//!
//! // Open the default output with 16 voices
//! let mut engine = SoundEngine::with_default_output(EngineDesc::default())?;
//!
//! // Register assets: streamed from disk, or decoded up front
//! let music = engine.register_file("music/theme.ogg")?;
//! let step = engine.preload_file("sfx/step.wav")?;
//!
//! // Play them; a cue chains assets on one voice
//! engine.request_play(PlayRequest::new(music).looping(true).priority(100))?;
//! engine.request_play(PlayRequest::new(step).then(step))?;
//! let handle = engine.request_play(
//!     PlayRequest::new(step).at_position(Vec3::new(2.0, 0.0, -1.0)),
//! )?;
//!
//! // Pump from your frame loop
//! loop {
//!     let report = engine.pump();
//!     for (voice, error) in &report.errors {
//!         eprintln!("{} stopped: {}", voice, error);
//!     }
//!     for event in engine.poll_events() {
//!         if let SoundEvent::VoiceFinished { handle } = event {
//!             println!("{} finished", handle);
//!         }
//!     }
//!     if !engine.is_playing(handle) {
//!         break;
//!     }
//!     std::thread::sleep(engine.pump_interval());
//! }
//! # Ok::<(), SoundsError>(())
//! ```
//!
//! ## Key Components
//!
//! - **[`SoundEngine`]**: the client API: assets, play requests, gains, events
//! - **[`VoiceAllocator`]**: fixed voice set with priority-based stealing
//! - **[`PlaybackScheduler`]**: the pump that feeds decoded buffers to the hardware
//! - **[`BufferPool`]**: fixed set of reusable PCM slots
//! - **[`AudioHardware`]**: queued-buffer device API, implemented by [`CpalHardware`]
//!   and [`VirtualHardware`]
//! - **[`DecoderService`]**: incremental decoders, [`DefaultDecoderService`] uses Symphonia
//! - **[`PumpThread`]**: pumps a shared engine on its own thread
//!
//! ## Threading
//!
//! The engine itself is single threaded. Either pump it from the host's update
//! loop, or hand it to a [`PumpThread`] and reach it through the
//! [`SharedSoundEngine`] mutex. The `cpal` backend renders on the device's own
//! callback thread and never blocks it: when the mixer state is locked by the
//! pump, the callback outputs silence for that block. The next pump reports
//! how many blocks went silent.

pub mod allocator;
pub mod asset;
pub mod config;
pub mod decoder;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod events;
pub mod hardware;
pub mod math;
pub mod pool;
pub mod runner;
pub mod scheduler;
pub mod voice;

pub use allocator::{Allocation, StolenVoice, VoiceAllocator};
pub use asset::{AssetId, AssetRegistry, AssetSource, FormatTag, SoundAsset, StreamInfo};
pub use config::{CueEntry, EngineDesc, LoopMode, PlayRequest, SoundCategory, SpatialParams};
pub use decoder::{AudioDecoder, DecodedChunk, DecoderService, DefaultDecoderService};
pub use diagnostics::{AssetSnapshot, EngineSnapshot, PoolSnapshot, VoiceSnapshot};
pub use engine::SoundEngine;
pub use error::SoundsError;
pub use events::SoundEvent;
pub use hardware::{AudioHardware, CpalHardware, HwVoiceId, PcmFormat, VirtualHardware};
pub use math::{Pose, Quat, Vec3};
pub use pool::{BufferPool, SlotId};
pub use runner::{PumpThread, SharedSoundEngine};
pub use scheduler::{PlaybackScheduler, PumpReport};
pub use voice::{FillOutcome, Voice, VoiceHandle, VoiceState};

/// Routes `log` output of unit tests through the test harness.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
