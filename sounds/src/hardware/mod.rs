//! Hardware audio source API.
//!
//! The engine talks to the output device only through [`AudioHardware`], in the
//! shape of a queued-buffer source API: each hardware voice plays the PCM buffers
//! enqueued on it in order, and reports how many of them it has finished since
//! the last query. Buffer data is copied on enqueue, so the engine may recycle its
//! slot as soon as the hardware reports it consumed.
//!
//! Two backends ship with the crate:
//! - [`CpalHardware`]: mixes all voices in software into the default output device
//! - [`VirtualHardware`]: consumes buffers against an explicit clock, for tests and
//!   headless hosts

mod cpal_device;
mod resampler;
mod spatial;
mod virtual_device;

use crate::error::Result;
use crate::math::{Pose, Vec3};
pub use cpal_device::CpalHardware;
pub use resampler::{ResamplerType, StreamingResampler};
pub use spatial::{distance_gain, pan_gains};
pub use virtual_device::VirtualHardware;

/// Identifier of a voice created on an [`AudioHardware`] backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HwVoiceId(pub u32);

impl HwVoiceId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for HwVoiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HwVoiceId({})", self.0)
    }
}

/// Layout of an enqueued PCM buffer (interleaved `f32`).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PcmFormat {
    pub channels: u16,
    pub sample_rate: u32,
}

impl PcmFormat {
    pub fn frames(&self, samples: usize) -> usize {
        samples / self.channels.max(1) as usize
    }
}

/// Queued-buffer audio source API.
///
/// Queries are synchronous and non-blocking; backends must not stall the
/// caller on device I/O once constructed.
pub trait AudioHardware: Send {
    fn create_voice(&mut self) -> Result<HwVoiceId>;

    fn destroy_voice(&mut self, voice: HwVoiceId);

    /// Appends a buffer to the voice's queue. Playback starts with the first buffer.
    fn enqueue(&mut self, voice: HwVoiceId, samples: &[f32], format: PcmFormat) -> Result<()>;

    /// Number of queued buffers fully played since the previous query.
    fn buffers_consumed(&mut self, voice: HwVoiceId) -> Result<usize>;

    fn set_gain(&mut self, voice: HwVoiceId, gain: f32) -> Result<()>;

    /// `None` plays the voice without positioning.
    fn set_position(&mut self, voice: HwVoiceId, position: Option<Vec3>) -> Result<()>;

    fn set_listener(&mut self, pose: Pose) -> Result<()>;

    /// Holds the voice where it is, or lets it continue. A paused voice keeps
    /// its queue and consumes nothing.
    fn set_paused(&mut self, voice: HwVoiceId, paused: bool) -> Result<()>;

    /// Stops the voice and discards its queue. Discarded buffers are not
    /// reported by later `buffers_consumed` queries. Anything the backend
    /// keeps per voice for the current sound is reset, and a pause is lifted.
    fn stop_and_flush(&mut self, voice: HwVoiceId) -> Result<()>;

    /// Output blocks rendered as silence because the device could not read
    /// the voices in time, since the previous query.
    fn take_silent_blocks(&mut self) -> u64 {
        0
    }
}
