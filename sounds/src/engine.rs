use crate::allocator::VoiceAllocator;
use crate::asset::{AssetId, AssetRegistry, AssetSource, FormatTag, SoundAsset, StreamInfo};
use crate::config::{EngineDesc, MAX_SOURCE_CHANNELS, PlayRequest, SoundCategory};
use crate::decoder::{DecoderService, DefaultDecoderService, decode_to_end};
use crate::diagnostics::EngineSnapshot;
use crate::error::{Result, SoundsError};
use crate::events::SoundEvent;
use crate::hardware::{AudioHardware, CpalHardware};
use crate::math::{Pose, Vec3};
use crate::pool::BufferPool;
use crate::scheduler::{PlaybackScheduler, PumpContext, PumpReport};
use crate::voice::{VoiceHandle, VoiceState};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Streaming sound engine.
///
/// `SoundEngine` owns the asset registry, the buffer pool, the fixed set of
/// voices and the hardware backend. It is driven from a single thread: call
/// [`SoundEngine::pump`] at [`SoundEngine::pump_interval`] (from a game loop,
/// or through a [`PumpThread`](crate::PumpThread)) and everything else as needed.
///
/// # Architecture
///
/// - **Registry**: immutable [`SoundAsset`] descriptors, shared with the voices playing them
/// - **Allocator**: `voice_count` voices, handed out by priority with stealing
/// - **Scheduler**: keeps every voice a few buffers ahead of the hardware
/// - **Hardware**: any [`AudioHardware`]; [`CpalHardware`] for real output
pub struct SoundEngine {
    desc: EngineDesc,
    assets: AssetRegistry,
    decoders: Box<dyn DecoderService>,
    hardware: Box<dyn AudioHardware>,
    pool: BufferPool,
    allocator: VoiceAllocator,
    scheduler: PlaybackScheduler,
    category_gains: HashMap<SoundCategory, f32>,
    master_gain: f32,
    listener: Pose,
    event_sender: Sender<SoundEvent>,
    event_receiver: Receiver<SoundEvent>,
}

impl SoundEngine {
    /// Creates an engine on top of the given hardware backend and decoder service.
    ///
    /// The descriptor is validated here and cannot change afterwards.
    pub fn new<H, D>(desc: EngineDesc, hardware: H, decoders: D) -> Result<Self>
    where
        H: AudioHardware + 'static,
        D: DecoderService + 'static,
    {
        desc.validate()?;

        let mut hardware: Box<dyn AudioHardware> = Box::new(hardware);
        let allocator = VoiceAllocator::new(hardware.as_mut(), desc.voice_count)?;
        let pool = BufferPool::new(desc.buffer_count, desc.slot_samples());
        let scheduler = PlaybackScheduler::new(&desc);
        let (event_sender, event_receiver) = unbounded();

        log::info!(
            "Sound engine ready: {} voices, {} x {} byte buffers ({:?} each), pump every {:?}",
            desc.voice_count,
            desc.buffer_count,
            desc.buffer_size_bytes,
            desc.buffer_duration(),
            scheduler.interval()
        );

        Ok(Self {
            desc,
            assets: AssetRegistry::new(),
            decoders: Box::new(decoders),
            hardware,
            pool,
            allocator,
            scheduler,
            category_gains: HashMap::new(),
            master_gain: 1.0,
            listener: Pose::default(),
            event_sender,
            event_receiver,
        })
    }

    /// Creates an engine playing through the default output device.
    pub fn with_default_output(desc: EngineDesc) -> Result<Self> {
        desc.validate()?;
        let hardware = CpalHardware::open(&desc)?;
        Self::new(desc, hardware, DefaultDecoderService::new())
    }

    pub fn desc(&self) -> &EngineDesc {
        &self.desc
    }

    /// Cadence at which [`SoundEngine::pump`] should be called.
    pub fn pump_interval(&self) -> Duration {
        self.scheduler.interval()
    }

    /// Registers an encoded file for streaming playback.
    ///
    /// The format comes from the file extension and the stream layout is
    /// probed now; the file is read again each time the asset plays. The asset
    /// is named after its path.
    pub fn register_file(&mut self, path: impl AsRef<Path>) -> Result<AssetId> {
        let path = path.as_ref();
        let format = format_of(path)?;
        let source = AssetSource::File(path.to_path_buf());
        let info = self.probe(&source, format)?;
        self.insert_asset(SoundAsset::new(path.display().to_string(), source, format, info))
    }

    /// Registers encoded bytes held in memory.
    pub fn register_bytes(
        &mut self,
        name: impl Into<String>,
        bytes: impl Into<Arc<[u8]>>,
        format: FormatTag,
    ) -> Result<AssetId> {
        let source = AssetSource::Memory(bytes.into());
        let info = self.probe(&source, format)?;
        self.insert_asset(SoundAsset::new(name, source, format, info))
    }

    /// Registers decoded interleaved samples.
    pub fn register_samples(
        &mut self,
        name: impl Into<String>,
        samples: impl Into<Arc<[f32]>>,
        channels: u16,
        sample_rate: u32,
    ) -> Result<AssetId> {
        let samples: Arc<[f32]> = samples.into();
        check_layout(channels, sample_rate)?;
        if samples.len() % channels as usize != 0 {
            return Err(SoundsError::AudioFormat(format!(
                "{} samples do not divide into {} channels",
                samples.len(),
                channels
            )));
        }

        let info = StreamInfo {
            channels,
            sample_rate,
            total_frames: Some((samples.len() / channels as usize) as u64),
        };
        self.insert_asset(SoundAsset::new(
            name,
            AssetSource::Samples(samples),
            FormatTag::Pcm,
            info,
        ))
    }

    /// Decodes a whole file now and registers the samples.
    ///
    /// Meant for short, frequently played sounds; playing them costs no decode
    /// work afterwards.
    pub fn preload_file(&mut self, path: impl AsRef<Path>) -> Result<AssetId> {
        let path = path.as_ref();
        let format = format_of(path)?;
        let source = AssetSource::File(path.to_path_buf());
        let info = self.probe(&source, format)?;
        let name = path.display().to_string();

        let encoded = SoundAsset::new(name.clone(), source, format, info);
        let mut decoder = self.decoders.open(&encoded)?;
        let samples = decode_to_end(decoder.as_mut(), info.channels)?;
        log::info!(
            "Preloaded {} ({} frames)",
            name,
            samples.len() / info.channels as usize
        );

        self.register_samples(name, samples, info.channels, info.sample_rate)
    }

    /// Removes an asset from the registry. Voices playing it finish normally.
    pub fn unregister(&mut self, id: AssetId) -> Result<()> {
        let asset = self
            .assets
            .remove(id)
            .ok_or_else(|| SoundsError::UnknownAsset(id.to_string()))?;
        log::debug!("Unregistered {}", asset.name());
        Ok(())
    }

    pub fn find_asset(&self, name: &str) -> Option<AssetId> {
        self.assets.find(name)
    }

    pub fn asset(&self, id: AssetId) -> Result<Arc<SoundAsset>> {
        self.assets.get(id)
    }

    fn probe(&self, source: &AssetSource, format: FormatTag) -> Result<StreamInfo> {
        let info = self.decoders.probe(source, format)?;
        check_layout(info.channels, info.sample_rate)?;
        Ok(info)
    }

    fn insert_asset(&mut self, asset: SoundAsset) -> Result<AssetId> {
        let name = asset.name().to_string();
        let id = self.assets.insert(asset)?;
        log::debug!("Registered {} as {}", name, id);
        Ok(id)
    }

    /// Starts playing an asset, or every entry of a cue in turn.
    ///
    /// Returns immediately: either a voice was bound (possibly stolen from a
    /// strictly lower priority sound) or the request fails with
    /// `NoVoiceAvailable`. Every asset of the cue must be registered. Audio
    /// starts flowing on the next pump.
    pub fn request_play(&mut self, request: PlayRequest) -> Result<VoiceHandle> {
        request.validate()?;
        let assets = request
            .entries
            .iter()
            .map(|entry| self.assets.get(entry.asset))
            .collect::<Result<Vec<_>>>()?;
        let mix_gain = self.mix_gain(request.category);

        let allocation = self.allocator.request_play(
            &request,
            assets,
            self.decoders.as_ref(),
            &mut self.pool,
            self.hardware.as_mut(),
            mix_gain,
        )?;

        if let Some(victim) = allocation.stolen {
            self.emit(SoundEvent::VoiceStolen {
                handle: victim.handle,
                victim_priority: victim.priority,
                new_priority: request.priority,
            });
        }
        Ok(allocation.handle)
    }

    /// Stops a sound early. Releasing a handle whose sound already ended (or
    /// was released before) does nothing.
    pub fn release(&mut self, handle: VoiceHandle) -> Result<()> {
        if self
            .allocator
            .release(handle, &mut self.pool, self.hardware.as_mut())?
        {
            self.emit(SoundEvent::VoiceStopped { handle });
        }
        Ok(())
    }

    pub fn set_gain(&mut self, handle: VoiceHandle, gain: f32) -> Result<()> {
        let category = self.voice(handle)?.category();
        let mix_gain = self.mix_gain(category);
        let voice = self
            .allocator
            .get_mut(handle)
            .ok_or_else(|| stale(handle))?;
        voice.set_gain(gain);
        voice.apply_params(self.hardware.as_mut(), mix_gain)
    }

    /// Moves a positional sound. Does nothing for sounds played without a position.
    pub fn set_position(&mut self, handle: VoiceHandle, position: Vec3) -> Result<()> {
        let voice = self
            .allocator
            .get_mut(handle)
            .ok_or_else(|| stale(handle))?;
        let Some(mut spatial) = voice.spatial() else {
            return Ok(());
        };
        spatial.position = position;
        voice.set_spatial(spatial);
        self.hardware
            .set_position(voice.hw_voice(), Some(spatial.position))
    }

    /// Holds a sound where it is. Its voice stays taken and can still be stolen.
    pub fn pause(&mut self, handle: VoiceHandle) -> Result<()> {
        self.set_paused(handle, true)
    }

    /// Continues a paused sound. Does nothing for a sound that is not paused.
    pub fn resume(&mut self, handle: VoiceHandle) -> Result<()> {
        self.set_paused(handle, false)
    }

    pub fn is_paused(&self, handle: VoiceHandle) -> bool {
        self.allocator.get(handle).is_some_and(|voice| voice.is_paused())
    }

    fn set_paused(&mut self, handle: VoiceHandle, paused: bool) -> Result<()> {
        let voice = self
            .allocator
            .get_mut(handle)
            .ok_or_else(|| stale(handle))?;
        voice.set_paused(paused, self.hardware.as_mut())?;
        Ok(())
    }

    /// Whether the sound behind `handle` is still bound to its voice.
    pub fn is_playing(&self, handle: VoiceHandle) -> bool {
        self.allocator.get(handle).is_some()
    }

    /// State of the sound behind `handle`, `None` once the handle is stale.
    pub fn voice_state(&self, handle: VoiceHandle) -> Option<VoiceState> {
        self.allocator.get(handle).map(|voice| voice.state())
    }

    /// Audio played so far (across loops and cue entries), as reported by
    /// the hardware.
    pub fn playback_position(&self, handle: VoiceHandle) -> Option<Duration> {
        self.allocator.get(handle).map(|voice| voice.played())
    }

    pub fn set_category_gain(&mut self, category: SoundCategory, gain: f32) -> Result<()> {
        self.category_gains.insert(category, gain);
        self.reapply_gains(|voice_category| voice_category == category)
    }

    pub fn category_gain(&self, category: SoundCategory) -> f32 {
        self.category_gains.get(&category).copied().unwrap_or(1.0)
    }

    pub fn set_master_gain(&mut self, gain: f32) -> Result<()> {
        self.master_gain = gain;
        self.reapply_gains(|_| true)
    }

    pub fn master_gain(&self) -> f32 {
        self.master_gain
    }

    pub fn set_listener_pose(&mut self, pose: Pose) -> Result<()> {
        self.listener = pose;
        self.hardware.set_listener(pose)
    }

    pub fn listener_pose(&self) -> Pose {
        self.listener
    }

    /// Stops every sound. Returns how many were stopped.
    pub fn stop_all(&mut self) -> usize {
        let stopped = self
            .allocator
            .stop_all(&mut self.pool, self.hardware.as_mut());
        self.emit_stopped(&stopped);
        stopped.len()
    }

    /// Stops every sound of a category. Returns how many were stopped.
    pub fn stop_category(&mut self, category: SoundCategory) -> usize {
        let stopped =
            self.allocator
                .stop_category(category, &mut self.pool, self.hardware.as_mut());
        self.emit_stopped(&stopped);
        stopped.len()
    }

    /// Runs one scheduler cycle. Errors of individual voices are in the report;
    /// those voices have been stopped.
    pub fn pump(&mut self) -> PumpReport {
        self.scheduler.pump(PumpContext {
            allocator: &mut self.allocator,
            pool: &mut self.pool,
            hardware: self.hardware.as_mut(),
            decoders: self.decoders.as_ref(),
            events: &self.event_sender,
        })
    }

    /// Drains pending events.
    pub fn poll_events(&self) -> Vec<SoundEvent> {
        self.event_receiver.try_iter().collect()
    }

    /// A receiver for consuming events from another thread.
    pub fn event_receiver(&self) -> Receiver<SoundEvent> {
        self.event_receiver.clone()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot::capture(
            self.allocator.voices(),
            &self.pool,
            &self.assets,
            self.scheduler.cycles(),
        )
    }

    fn voice(&self, handle: VoiceHandle) -> Result<&crate::voice::Voice> {
        self.allocator.get(handle).ok_or_else(|| stale(handle))
    }

    fn mix_gain(&self, category: SoundCategory) -> f32 {
        self.category_gain(category) * self.master_gain
    }

    fn reapply_gains(&mut self, filter: impl Fn(SoundCategory) -> bool) -> Result<()> {
        for voice in self.allocator.voices() {
            if !voice.state().is_active() || !filter(voice.category()) {
                continue;
            }
            let mix_gain = self.category_gains.get(&voice.category()).copied().unwrap_or(1.0)
                * self.master_gain;
            voice.apply_params(self.hardware.as_mut(), mix_gain)?;
        }
        Ok(())
    }

    fn emit(&self, event: SoundEvent) {
        // The engine keeps a receiver, so sending cannot fail.
        let _ = self.event_sender.send(event);
    }

    fn emit_stopped(&self, handles: &[VoiceHandle]) {
        for &handle in handles {
            self.emit(SoundEvent::VoiceStopped { handle });
        }
    }
}

impl Drop for SoundEngine {
    fn drop(&mut self) {
        let stopped = self.stop_all();
        for voice in self.allocator.voices() {
            self.hardware.destroy_voice(voice.hw_voice());
        }
        log::info!("Sound engine shut down ({} sounds cut)", stopped);
    }
}

fn stale(handle: VoiceHandle) -> SoundsError {
    SoundsError::StaleHandle(handle.to_string())
}

fn format_of(path: &Path) -> Result<FormatTag> {
    FormatTag::from_path(path).ok_or_else(|| {
        SoundsError::UnsupportedFormat(format!("no known format for {}", path.display()))
    })
}

fn check_layout(channels: u16, sample_rate: u32) -> Result<()> {
    if channels == 0 || channels as usize > MAX_SOURCE_CHANNELS {
        return Err(SoundsError::UnsupportedFormat(format!(
            "{} channels (1 to {} supported)",
            channels, MAX_SOURCE_CHANNELS
        )));
    }
    if sample_rate == 0 {
        return Err(SoundsError::AudioFormat(
            "Sample rate must be greater than 0".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CueEntry;
    use crate::hardware::VirtualHardware;

    fn engine(voices: usize) -> (SoundEngine, VirtualHardware) {
        crate::init_test_logging();
        let hw = VirtualHardware::new();
        let desc = EngineDesc::new()
            .voice_count(voices)
            .buffer_count(8)
            .buffer_size_bytes(4000)
            .sample_rate(1000)
            .channels(1);
        let engine = SoundEngine::new(desc, hw.clone(), DefaultDecoderService::new()).unwrap();
        (engine, hw)
    }

    #[test]
    fn test_register_samples_validates_layout() {
        let (mut engine, _) = engine(1);
        assert!(engine.register_samples("odd", vec![0.0f32; 3], 2, 1000).is_err());
        assert!(engine.register_samples("wide", vec![0.0f32; 9], 9, 1000).is_err());

        let id = engine.register_samples("ok", vec![0.0f32; 4], 2, 1000).unwrap();
        assert_eq!(engine.find_asset("ok"), Some(id));
        assert_eq!(engine.asset(id).unwrap().total_frames(), Some(2));
        assert!(matches!(
            engine.register_samples("ok", vec![0.0f32; 4], 2, 1000),
            Err(SoundsError::DuplicateAsset(_))
        ));
    }

    #[test]
    fn test_unknown_extension_is_unsupported() {
        let (mut engine, _) = engine(1);
        assert!(matches!(
            engine.register_file("music.xm"),
            Err(SoundsError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_play_unknown_asset() {
        let (mut engine, _) = engine(1);
        let id = engine.register_samples("a", vec![0.0f32; 10], 1, 1000).unwrap();
        engine.unregister(id).unwrap();
        assert!(matches!(
            engine.request_play(PlayRequest::new(id)),
            Err(SoundsError::UnknownAsset(_))
        ));
        assert!(engine.unregister(id).is_err());
    }

    #[test]
    fn test_gains_combine() {
        let (mut engine, hw) = engine(2);
        let id = engine.register_samples("a", vec![0.0f32; 1000], 1, 1000).unwrap();
        let music = SoundCategory(2);
        let handle = engine
            .request_play(PlayRequest::new(id).gain(0.5).category(music))
            .unwrap();
        let hw_voice = engine.voice(handle).unwrap().hw_voice();
        assert_eq!(hw.gain(hw_voice), Some(0.5));

        engine.set_category_gain(music, 0.5).unwrap();
        assert_eq!(hw.gain(hw_voice), Some(0.25));
        engine.set_master_gain(0.5).unwrap();
        assert_eq!(hw.gain(hw_voice), Some(0.125));
        engine.set_gain(handle, 1.0).unwrap();
        assert_eq!(hw.gain(hw_voice), Some(0.25));

        // Other categories are not affected by the music gain.
        let other = engine.request_play(PlayRequest::new(id)).unwrap();
        let other_voice = engine.voice(other).unwrap().hw_voice();
        assert_eq!(hw.gain(other_voice), Some(0.5));
    }

    #[test]
    fn test_set_position() {
        let (mut engine, hw) = engine(2);
        let id = engine.register_samples("a", vec![0.0f32; 1000], 1, 1000).unwrap();

        let flat = engine.request_play(PlayRequest::new(id)).unwrap();
        engine.set_position(flat, Vec3::X).unwrap();
        let flat_voice = engine.voice(flat).unwrap().hw_voice();
        assert_eq!(hw.position(flat_voice), None);

        let placed = engine
            .request_play(PlayRequest::new(id).at_position(Vec3::Y))
            .unwrap();
        let placed_voice = engine.voice(placed).unwrap().hw_voice();
        assert_eq!(hw.position(placed_voice), Some(Vec3::Y));
        engine.set_position(placed, Vec3::Z).unwrap();
        assert_eq!(hw.position(placed_voice), Some(Vec3::Z));

        engine.release(placed).unwrap();
        assert!(matches!(
            engine.set_position(placed, Vec3::X),
            Err(SoundsError::StaleHandle(_))
        ));
    }

    #[test]
    fn test_release_emits_once() {
        let (mut engine, _) = engine(1);
        let id = engine.register_samples("a", vec![0.0f32; 1000], 1, 1000).unwrap();
        let handle = engine.request_play(PlayRequest::new(id)).unwrap();
        assert!(engine.is_playing(handle));

        engine.release(handle).unwrap();
        engine.release(handle).unwrap();
        assert!(!engine.is_playing(handle));
        assert_eq!(
            engine.poll_events(),
            vec![SoundEvent::VoiceStopped { handle }]
        );
    }

    #[test]
    fn test_stop_category_and_all() {
        let (mut engine, _) = engine(3);
        let id = engine.register_samples("a", vec![0.0f32; 1000], 1, 1000).unwrap();
        engine
            .request_play(PlayRequest::new(id).category(SoundCategory(1)))
            .unwrap();
        engine.request_play(PlayRequest::new(id)).unwrap();
        engine.request_play(PlayRequest::new(id)).unwrap();

        assert_eq!(engine.stop_category(SoundCategory(1)), 1);
        assert_eq!(engine.stop_all(), 2);
        assert_eq!(engine.snapshot().active_voices(), 0);
    }

    #[test]
    fn test_listener_reaches_hardware() {
        let (mut engine, hw) = engine(1);
        let pose = Pose::from_position(Vec3::new(1.0, 2.0, 3.0));
        engine.set_listener_pose(pose).unwrap();
        assert_eq!(hw.listener(), pose);
        assert_eq!(engine.listener_pose(), pose);
    }

    #[test]
    fn test_playback_position_follows_hardware() {
        let (mut engine, hw) = engine(1);
        let id = engine.register_samples("a", vec![0.0f32; 5000], 1, 1000).unwrap();
        let handle = engine.request_play(PlayRequest::new(id)).unwrap();
        engine.pump();
        assert_eq!(engine.playback_position(handle), Some(Duration::ZERO));

        // One 1000-frame buffer is one second at 1kHz.
        hw.advance(Duration::from_secs(1));
        engine.pump();
        assert_eq!(engine.playback_position(handle), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_cue_with_unknown_entry_is_rejected() {
        let (mut engine, _) = engine(1);
        let known = engine.register_samples("a", vec![0.0f32; 10], 1, 1000).unwrap();
        let gone = engine.register_samples("b", vec![0.0f32; 10], 1, 1000).unwrap();
        engine.unregister(gone).unwrap();

        assert!(matches!(
            engine.request_play(PlayRequest::new(known).then(gone)),
            Err(SoundsError::UnknownAsset(_))
        ));
        assert!(matches!(
            engine.request_play(PlayRequest::cue(Vec::<CueEntry>::new())),
            Err(SoundsError::Configuration(_))
        ));
        assert_eq!(engine.snapshot().active_voices(), 0);
    }

    #[test]
    fn test_pause_holds_playback() {
        let (mut engine, hw) = engine(1);
        let id = engine.register_samples("a", vec![0.0f32; 5000], 1, 1000).unwrap();
        let handle = engine.request_play(PlayRequest::new(id)).unwrap();
        engine.pump();
        hw.advance(Duration::from_secs(1));
        engine.pump();

        engine.pause(handle).unwrap();
        assert!(engine.is_paused(handle));
        assert!(hw.is_paused(engine.voice(handle).unwrap().hw_voice()));
        let enqueued = hw.enqueued_total();
        for _ in 0..3 {
            hw.advance(Duration::from_secs(1));
            engine.pump();
        }
        assert_eq!(engine.playback_position(handle), Some(Duration::from_secs(1)));
        assert_eq!(hw.enqueued_total(), enqueued);
        assert_eq!(engine.voice_state(handle), Some(VoiceState::Playing));

        engine.resume(handle).unwrap();
        engine.resume(handle).unwrap();
        assert!(!engine.is_paused(handle));
        hw.advance(Duration::from_secs(1));
        engine.pump();
        assert_eq!(engine.playback_position(handle), Some(Duration::from_secs(2)));

        engine.release(handle).unwrap();
        assert!(matches!(
            engine.pause(handle),
            Err(SoundsError::StaleHandle(_))
        ));
        assert!(!engine.is_paused(handle));
    }
}
