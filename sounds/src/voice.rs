//! One playback channel bound to a hardware voice.
//!
//! A [`Voice`] walks a fixed state machine:
//!
//! ```text
//! Idle -> Decoding -> Playing -> Draining -> Stopped -> Idle
//!            |           |          |
//!            +-----------+----------+--> Stopped   (stop)
//! ```
//!
//! Every transition is a method that fails with `IllegalTransition` when called
//! from the wrong state, so a voice can never start a second sound without
//! passing through `Stopped` first. The entries of a cue are one sound: the
//! voice moves from one entry's decoder to the next while staying `Playing`.
//!
//! Pausing is orthogonal to the state machine. A paused voice keeps its state,
//! its queued buffers and its decoder; the scheduler leaves it alone until it
//! is resumed.

use crate::asset::{SoundAsset, frames_to_duration};
use crate::config::{LoopMode, PlayRequest, SoundCategory, SpatialParams};
use crate::decoder::{AudioDecoder, DecoderService};
use crate::error::{Result, SoundsError};
use crate::hardware::{AudioHardware, HwVoiceId, PcmFormat};
use crate::pool::{BufferPool, SlotId};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Handle returned by a successful play request.
///
/// The generation changes every time the voice is bound, so a handle kept
/// after its sound ended never addresses whatever plays on the voice next.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VoiceHandle {
    index: u32,
    generation: u32,
}

impl VoiceHandle {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for VoiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Voice({}#{})", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Idle,
    Decoding,
    Playing,
    Draining,
    Stopped,
}

impl VoiceState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Decoding => "Decoding",
            Self::Playing => "Playing",
            Self::Draining => "Draining",
            Self::Stopped => "Stopped",
        }
    }

    /// Holds a hardware voice for a sound: Decoding, Playing or Draining.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Decoding | Self::Playing | Self::Draining)
    }

    /// Free to take a new play request.
    pub fn is_free(&self) -> bool {
        matches!(self, Self::Idle | Self::Stopped)
    }
}

/// Result of [`Voice::fill_one_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// A buffer of `frames` frames was enqueued
    Queued { frames: usize },
    /// The stream ended and restarted from the top; `frames` were enqueued
    /// before the restart
    Looped { frames: usize, loop_count: u32 },
    /// The cue entry ended and entry `entry` was opened; `frames` were
    /// enqueued before the switch
    NextEntry { frames: usize, entry: usize },
    /// No free slot; retry next cycle
    PoolExhausted,
    /// The last cue entry has no more data and no loop is requested
    EndOfStream,
}

/// Everything a voice needs to fill one buffer.
pub(crate) struct FillContext<'a> {
    pub pool: &'a mut BufferPool,
    pub hardware: &'a mut dyn AudioHardware,
    pub decoders: &'a dyn DecoderService,
}

#[derive(Debug, Clone, Copy)]
struct QueuedSlot {
    slot: SlotId,
    frames: usize,
    sample_rate: u32,
}

/// An asset of the bound cue with its loop mode.
struct BoundEntry {
    asset: Arc<SoundAsset>,
    loop_mode: LoopMode,
}

pub struct Voice {
    index: u32,
    hw: HwVoiceId,
    state: VoiceState,
    generation: u32,
    /// Empty unless a sound is bound
    cue: Vec<BoundEntry>,
    /// Cue entry the decoder reads
    entry: usize,
    decoder: Option<Box<dyn AudioDecoder>>,
    priority: i32,
    gain: f32,
    spatial: Option<SpatialParams>,
    category: SoundCategory,
    paused: bool,
    queued: VecDeque<QueuedSlot>,
    /// Frames the hardware has finished playing, across loops and entries
    cursor_frames: u64,
    played: Duration,
    /// Passes of the current entry that reached end of stream
    completed_passes: u32,
    frames_this_pass: u64,
    /// Order of binding, used to pick the oldest voice among equals
    bound_at: u64,
    starved_cycles: u32,
}

impl Voice {
    pub fn new(index: u32, hw: HwVoiceId) -> Self {
        Self {
            index,
            hw,
            state: VoiceState::Idle,
            generation: 0,
            cue: Vec::new(),
            entry: 0,
            decoder: None,
            priority: 0,
            gain: 1.0,
            spatial: None,
            category: SoundCategory::default(),
            paused: false,
            queued: VecDeque::new(),
            cursor_frames: 0,
            played: Duration::ZERO,
            completed_passes: 0,
            frames_this_pass: 0,
            bound_at: 0,
            starved_cycles: 0,
        }
    }

    /// Idle -> Decoding, taking ownership of a decoder opened on the first
    /// asset. `assets` holds the resolved asset of every entry of the request.
    pub(crate) fn bind(
        &mut self,
        assets: Vec<Arc<SoundAsset>>,
        decoder: Box<dyn AudioDecoder>,
        request: &PlayRequest,
        bound_at: u64,
    ) -> Result<VoiceHandle> {
        self.expect_state(VoiceState::Idle, VoiceState::Decoding)?;
        if assets.is_empty() || assets.len() != request.entries.len() {
            return Err(SoundsError::Engine(format!(
                "{} assets resolved for a cue of {} entries",
                assets.len(),
                request.entries.len()
            )));
        }

        self.generation = self.generation.wrapping_add(1);
        self.cue = assets
            .into_iter()
            .zip(&request.entries)
            .map(|(asset, entry)| BoundEntry {
                asset,
                loop_mode: entry.loop_mode,
            })
            .collect();
        self.entry = 0;
        self.decoder = Some(decoder);
        self.priority = request.priority;
        self.gain = request.gain;
        self.spatial = request.spatial;
        self.category = request.category;
        self.paused = false;
        self.cursor_frames = 0;
        self.played = Duration::ZERO;
        self.completed_passes = 0;
        self.frames_this_pass = 0;
        self.bound_at = bound_at;
        self.starved_cycles = 0;
        self.state = VoiceState::Decoding;

        log::debug!("{} bound (priority {})", self.handle(), self.priority);
        Ok(self.handle())
    }

    /// Whether the scheduler should decode another buffer for this voice.
    pub fn needs_buffer(&self, low_watermark: usize) -> bool {
        !self.paused
            && matches!(self.state, VoiceState::Decoding | VoiceState::Playing)
            && self.queued.len() < low_watermark
    }

    /// Decodes one chunk into a fresh pool slot and enqueues it on the hardware.
    ///
    /// On any error the slot taken for this call goes back to the pool and the
    /// voice keeps its state; the caller decides whether to stop it.
    pub(crate) fn fill_one_buffer(&mut self, ctx: &mut FillContext<'_>) -> Result<FillOutcome> {
        if !matches!(self.state, VoiceState::Decoding | VoiceState::Playing) {
            return Err(self.illegal(VoiceState::Playing));
        }

        let asset = self
            .asset()
            .cloned()
            .ok_or_else(|| SoundsError::Engine(format!("{} has no asset bound", self.handle())))?;
        let channels = asset.channels().max(1) as usize;
        let capacity = ctx.pool.slot_samples() - ctx.pool.slot_samples() % channels;
        if capacity == 0 {
            return Err(SoundsError::AudioFormat(format!(
                "Buffer slots cannot hold one {}-channel frame",
                channels
            )));
        }

        let Some(slot) = ctx.pool.acquire() else {
            return Ok(FillOutcome::PoolExhausted);
        };

        let chunk = match self.decode_into(ctx.pool.samples_mut(slot), capacity) {
            Ok(chunk) => chunk,
            Err(e) => {
                ctx.pool.release(slot)?;
                return Err(e);
            }
        };

        let frames = chunk.samples / channels;
        if chunk.samples > 0 {
            let format = PcmFormat {
                channels: asset.channels(),
                sample_rate: asset.sample_rate(),
            };
            if let Err(e) = ctx
                .hardware
                .enqueue(self.hw, &ctx.pool.samples(slot)[..chunk.samples], format)
            {
                ctx.pool.release(slot)?;
                return Err(e);
            }

            self.queued.push_back(QueuedSlot {
                slot,
                frames,
                sample_rate: asset.sample_rate(),
            });
            self.frames_this_pass += frames as u64;
            self.starved_cycles = 0;
            if self.state == VoiceState::Decoding {
                self.state = VoiceState::Playing;
                log::debug!("{} playing", self.handle());
            }
        } else {
            ctx.pool.release(slot)?;
        }

        if chunk.end_of_stream {
            self.completed_passes += 1;
            // An empty pass would restart forever without producing audio.
            if self.frames_this_pass > 0 && self.loop_mode().should_restart(self.completed_passes) {
                self.restart(&asset, ctx.decoders)?;
                return Ok(FillOutcome::Looped {
                    frames,
                    loop_count: self.completed_passes,
                });
            }
            if self.entry + 1 < self.cue.len() {
                self.advance_entry(ctx.decoders)?;
                return Ok(FillOutcome::NextEntry {
                    frames,
                    entry: self.entry,
                });
            }
            return Ok(FillOutcome::EndOfStream);
        }

        if chunk.samples == 0 {
            return Err(SoundsError::CorruptStream(format!(
                "decoder for {} made no progress",
                asset.name()
            )));
        }

        Ok(FillOutcome::Queued { frames })
    }

    fn decode_into(
        &mut self,
        slot: &mut [f32],
        capacity: usize,
    ) -> Result<crate::decoder::DecodedChunk> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| SoundsError::Engine("voice has no decoder bound".into()))?;
        decoder.decode_next(&mut slot[..capacity])
    }

    /// Positions the decoder back at frame 0, reopening it if it cannot seek.
    fn restart(&mut self, asset: &SoundAsset, decoders: &dyn DecoderService) -> Result<()> {
        self.frames_this_pass = 0;
        let seeked = match self.decoder.as_mut() {
            Some(decoder) => decoder.seek(0),
            None => Err(SoundsError::SeekUnsupported("no decoder".into())),
        };

        match seeked {
            Ok(()) => Ok(()),
            Err(SoundsError::SeekUnsupported(_)) => {
                log::debug!("{} reopening {} to loop", self.handle(), asset.name());
                self.decoder = Some(decoders.open(asset)?);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Moves the decoder on to the next cue entry. On failure the voice stays
    /// on the entry that ended.
    fn advance_entry(&mut self, decoders: &dyn DecoderService) -> Result<()> {
        let next = &self.cue[self.entry + 1].asset;
        let decoder = decoders.open(next)?;
        log::debug!("{} moving on to {}", self.handle(), next.name());

        self.entry += 1;
        self.decoder = Some(decoder);
        self.completed_passes = 0;
        self.frames_this_pass = 0;
        Ok(())
    }

    /// Releases the slots of buffers the hardware has finished playing.
    ///
    /// Returns how many buffers were reclaimed.
    pub(crate) fn reclaim_consumed(
        &mut self,
        pool: &mut BufferPool,
        hardware: &mut dyn AudioHardware,
    ) -> Result<usize> {
        let consumed = hardware.buffers_consumed(self.hw)?;
        if consumed > self.queued.len() {
            log::warn!(
                "{} reported {} consumed buffers but only {} were queued",
                self.hw,
                consumed,
                self.queued.len()
            );
        }

        let count = consumed.min(self.queued.len());
        for queued in self.queued.drain(..count) {
            self.cursor_frames += queued.frames as u64;
            self.played += frames_to_duration(queued.frames as u64, queued.sample_rate);
            pool.release(queued.slot)?;
        }
        Ok(count)
    }

    /// Decoding/Playing -> Draining, once the decoder has nothing more to give.
    pub(crate) fn mark_finished(&mut self) -> Result<()> {
        if !matches!(self.state, VoiceState::Decoding | VoiceState::Playing) {
            return Err(self.illegal(VoiceState::Draining));
        }
        self.state = VoiceState::Draining;
        log::debug!(
            "{} draining ({} buffers queued)",
            self.handle(),
            self.queued.len()
        );
        Ok(())
    }

    /// Draining -> Stopped, once every queued buffer has played.
    ///
    /// The hardware voice is flushed as well, so nothing it still holds for
    /// this sound (such as resampler history) carries into the next one.
    pub(crate) fn finish_drain(&mut self, hardware: &mut dyn AudioHardware) -> Result<()> {
        if self.state != VoiceState::Draining || !self.queued.is_empty() {
            return Err(self.illegal(VoiceState::Stopped));
        }
        self.decoder = None;
        self.cue.clear();
        self.paused = false;
        self.state = VoiceState::Stopped;
        log::debug!("{} finished", self.handle());
        hardware.stop_and_flush(self.hw)
    }

    /// Forces any bound voice to Stopped, flushing the hardware queue and
    /// returning every slot and the decoder. Does nothing on a stopped voice.
    ///
    /// Resources are freed even when the hardware fails to flush; that error
    /// is returned afterwards.
    pub(crate) fn stop(
        &mut self,
        pool: &mut BufferPool,
        hardware: &mut dyn AudioHardware,
    ) -> Result<()> {
        match self.state {
            VoiceState::Stopped => return Ok(()),
            VoiceState::Idle => return Err(self.illegal(VoiceState::Stopped)),
            _ => {}
        }

        let flushed = hardware.stop_and_flush(self.hw);
        for queued in self.queued.drain(..) {
            if let Err(e) = pool.release(queued.slot) {
                log::error!("Failed to release {}: {}", queued.slot, e);
            }
        }
        self.decoder = None;
        self.cue.clear();
        self.paused = false;
        self.state = VoiceState::Stopped;
        log::debug!("{} stopped", self.handle());
        flushed
    }

    /// Stopped -> Idle.
    pub(crate) fn recycle(&mut self) -> Result<()> {
        self.expect_state(VoiceState::Stopped, VoiceState::Idle)?;
        self.priority = 0;
        self.gain = 1.0;
        self.spatial = None;
        self.entry = 0;
        self.category = SoundCategory::default();
        self.paused = false;
        self.starved_cycles = 0;
        self.state = VoiceState::Idle;
        Ok(())
    }

    /// Pushes gain (scaled by the category/master `mix_gain`) and position to the hardware.
    pub(crate) fn apply_params(&self, hardware: &mut dyn AudioHardware, mix_gain: f32) -> Result<()> {
        hardware.set_gain(self.hw, self.gain * mix_gain)?;
        hardware.set_position(self.hw, self.spatial.map(|s| s.position))
    }

    pub(crate) fn set_gain(&mut self, gain: f32) {
        self.gain = gain;
    }

    /// Moves a positional voice. Returns `false` for non-positional voices,
    /// which are left untouched.
    pub(crate) fn set_spatial(&mut self, spatial: SpatialParams) -> bool {
        match self.spatial.as_mut() {
            Some(current) => {
                *current = spatial;
                true
            }
            None => false,
        }
    }

    /// Holds or releases playback on the hardware. Returns `false` when the
    /// voice already was in the requested state.
    pub(crate) fn set_paused(
        &mut self,
        paused: bool,
        hardware: &mut dyn AudioHardware,
    ) -> Result<bool> {
        if !self.state.is_active() {
            return Err(self.illegal(self.state));
        }
        if self.paused == paused {
            return Ok(false);
        }
        hardware.set_paused(self.hw, paused)?;
        self.paused = paused;
        log::debug!(
            "{} {}",
            self.handle(),
            if paused { "paused" } else { "resumed" }
        );
        Ok(true)
    }

    /// Counts a pump cycle in which the voice could not get a slot.
    pub(crate) fn note_starved(&mut self) -> u32 {
        self.starved_cycles += 1;
        self.starved_cycles
    }

    pub fn handle(&self) -> VoiceHandle {
        VoiceHandle::new(self.index, self.generation)
    }

    /// Whether `handle` still addresses the sound currently bound to this voice.
    pub fn matches(&self, handle: VoiceHandle) -> bool {
        handle.index() == self.index as usize
            && handle.generation() == self.generation
            && !self.state.is_free()
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn hw_voice(&self) -> HwVoiceId {
        self.hw
    }

    /// Asset of the cue entry being decoded.
    pub fn asset(&self) -> Option<&Arc<SoundAsset>> {
        self.cue.get(self.entry).map(|entry| &entry.asset)
    }

    /// Index of the cue entry being decoded. Playback of the previous entry's
    /// last buffers may still be in progress.
    pub fn cue_entry(&self) -> usize {
        self.entry
    }

    pub fn cue_len(&self) -> usize {
        self.cue.len()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn spatial(&self) -> Option<SpatialParams> {
        self.spatial
    }

    pub fn category(&self) -> SoundCategory {
        self.category
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.cue
            .get(self.entry)
            .map_or(LoopMode::Once, |entry| entry.loop_mode)
    }

    pub fn queued_buffers(&self) -> usize {
        self.queued.len()
    }

    /// Frames the hardware has finished playing since the voice was bound.
    pub fn cursor_frames(&self) -> u64 {
        self.cursor_frames
    }

    /// Audio the hardware has finished playing since the voice was bound,
    /// each buffer counted at its own sample rate.
    pub fn played(&self) -> Duration {
        self.played
    }

    pub(crate) fn bound_at(&self) -> u64 {
        self.bound_at
    }

    fn expect_state(&self, from: VoiceState, to: VoiceState) -> Result<()> {
        if self.state == from {
            Ok(())
        } else {
            Err(self.illegal(to))
        }
    }

    fn illegal(&self, to: VoiceState) -> SoundsError {
        SoundsError::IllegalTransition {
            from: self.state.name(),
            to: to.name(),
        }
    }
}

impl std::fmt::Debug for Voice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Voice")
            .field("handle", &self.handle())
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("entry", &self.entry)
            .field("paused", &self.paused)
            .field("queued", &self.queued.len())
            .finish()
    }
}
