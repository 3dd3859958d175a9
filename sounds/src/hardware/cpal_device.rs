use crate::config::EngineDesc;
use crate::error::{Result, SoundsError};
use crate::hardware::resampler::{ResamplerType, StreamingResampler};
use crate::hardware::spatial::{distance_gain, pan_gains};
use crate::hardware::{AudioHardware, HwVoiceId, PcmFormat};
use crate::math::{Pose, Vec3};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use crossbeam_channel::{Sender, bounded};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

/// Frames per resampler chunk
const RESAMPLER_CHUNK_FRAMES: usize = 256;

/// Distance at which positional voices start to attenuate
const REFERENCE_DISTANCE: f32 = 1.0;
const ROLLOFF: f32 = 1.0;

/// Output actually opened on the device.
#[derive(Debug, Clone)]
pub struct OutputInfo {
    pub device_name: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// [`AudioHardware`] backend that mixes every voice in software into the
/// default `cpal` output device.
///
/// The `cpal::Stream` lives on a dedicated device thread; the audio callback
/// reads voice queues through a shared mutex and outputs silence whenever the
/// pump holds it. Such blocks are counted, never logged from the callback.
pub struct CpalHardware {
    mixer: Arc<Mutex<MixerState>>,
    resamplers: VoiceResamplers,
    silent_blocks: Arc<AtomicU64>,
    output: OutputInfo,
    shutdown: Option<Sender<()>>,
    device_thread: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct MixerState {
    voices: Vec<Option<MixVoice>>,
    listener: Pose,
}

struct MixVoice {
    queue: VecDeque<QueuedBuffer>,
    consumed: usize,
    gain: f32,
    position: Option<Vec3>,
    paused: bool,
}

impl Default for MixVoice {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            consumed: 0,
            gain: 1.0,
            position: None,
            paused: false,
        }
    }
}

struct QueuedBuffer {
    samples: Vec<f32>,
    channels: usize,
    /// Next frame to play
    cursor: usize,
}

impl QueuedBuffer {
    fn frames(&self) -> usize {
        self.samples.len() / self.channels
    }
}

/// Per-voice sample-rate conversion to the device rate.
///
/// A voice keeps its resampler across buffers of the same layout so the
/// filter state stays continuous within a sound.
struct VoiceResamplers {
    slots: Vec<Option<StreamingResampler>>,
    resampler_type: ResamplerType,
    target_sample_rate: u32,
}

impl VoiceResamplers {
    fn new(target_sample_rate: u32, resampler_type: ResamplerType) -> Self {
        Self {
            slots: Vec::new(),
            resampler_type,
            target_sample_rate,
        }
    }

    fn push(&mut self) {
        self.slots.push(None);
    }

    fn remove(&mut self, voice: HwVoiceId) {
        if let Some(slot) = self.slots.get_mut(voice.index()) {
            *slot = None;
        }
    }

    /// Drops carried input and filter history of the voice.
    fn reset(&mut self, voice: HwVoiceId) {
        if let Some(Some(resampler)) = self.slots.get_mut(voice.index()) {
            resampler.reset();
        }
    }

    /// Converts `samples` to the device rate, reusing the voice's resampler.
    fn convert(&mut self, voice: HwVoiceId, samples: &[f32], format: PcmFormat) -> Result<Vec<f32>> {
        if format.sample_rate == self.target_sample_rate {
            return Ok(samples.to_vec());
        }

        let slot = self
            .slots
            .get_mut(voice.index())
            .ok_or_else(|| unknown_voice(voice))?;

        let reusable = slot.as_ref().is_some_and(|r| {
            r.source_sample_rate() == format.sample_rate && r.channels() == format.channels as usize
        });
        if !reusable {
            *slot = Some(StreamingResampler::new(
                format.sample_rate,
                self.target_sample_rate,
                format.channels,
                RESAMPLER_CHUNK_FRAMES,
                self.resampler_type,
            )?);
        }

        let mut converted = Vec::new();
        if let Some(resampler) = slot.as_mut() {
            resampler.process_interleaved(samples, &mut converted)?;
        }
        Ok(converted)
    }
}

impl CpalHardware {
    /// Opens the default output device at the rate and layout of `desc`.
    pub fn open(desc: &EngineDesc) -> Result<Self> {
        Self::open_with_resampler(desc, ResamplerType::default())
    }

    pub fn open_with_resampler(desc: &EngineDesc, resampler_type: ResamplerType) -> Result<Self> {
        let mixer = Arc::new(Mutex::new(MixerState::default()));
        let silent_blocks = Arc::new(AtomicU64::new(0));
        let (ready_tx, ready_rx) = bounded::<Result<OutputInfo>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let stream_mixer = mixer.clone();
        let stream_silent = silent_blocks.clone();
        let stream_desc = desc.clone();
        let device_thread = std::thread::Builder::new()
            .name("sounds-device".to_string())
            .spawn(move || {
                // cpal::Stream is not Send, so it is created and dropped on this thread.
                let stream = match open_stream(&stream_desc, stream_mixer, stream_silent) {
                    Ok((stream, info)) => {
                        let _ = ready_tx.send(Ok(info));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let _ = shutdown_rx.recv();
                drop(stream);
                log::info!("Audio output stream closed");
            })
            .map_err(|e| SoundsError::AudioDevice(format!("Failed to spawn device thread: {}", e)))?;

        let output = match ready_rx.recv() {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                let _ = device_thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = device_thread.join();
                return Err(SoundsError::AudioDevice(
                    "Device thread exited before opening a stream".into(),
                ));
            }
        };

        log::info!(
            "Audio output opened: {} ({} Hz, {} channels)",
            output.device_name,
            output.sample_rate,
            output.channels
        );

        Ok(Self {
            mixer,
            resamplers: VoiceResamplers::new(output.sample_rate, resampler_type),
            silent_blocks,
            output,
            shutdown: Some(shutdown_tx),
            device_thread: Some(device_thread),
        })
    }

    pub fn output_info(&self) -> &OutputInfo {
        &self.output
    }

    pub fn device_name(&self) -> &str {
        &self.output.device_name
    }

    fn lock(&self) -> MutexGuard<'_, MixerState> {
        self.mixer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for CpalHardware {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.device_thread.take() {
            let _ = thread.join();
        }
    }
}

fn unknown_voice(voice: HwVoiceId) -> SoundsError {
    SoundsError::AudioDevice(format!("Unknown hardware voice {}", voice))
}

fn voice_mut(state: &mut MixerState, voice: HwVoiceId) -> Result<&mut MixVoice> {
    state
        .voices
        .get_mut(voice.index())
        .and_then(|v| v.as_mut())
        .ok_or_else(|| unknown_voice(voice))
}

impl AudioHardware for CpalHardware {
    fn create_voice(&mut self) -> Result<HwVoiceId> {
        let mut state = self.lock();
        let id = HwVoiceId(state.voices.len() as u32);
        state.voices.push(Some(MixVoice::default()));
        drop(state);
        self.resamplers.push();
        Ok(id)
    }

    fn destroy_voice(&mut self, voice: HwVoiceId) {
        if let Some(slot) = self.lock().voices.get_mut(voice.index()) {
            *slot = None;
        }
        self.resamplers.remove(voice);
    }

    fn enqueue(&mut self, voice: HwVoiceId, samples: &[f32], format: PcmFormat) -> Result<()> {
        if format.channels == 0 {
            return Err(SoundsError::AudioFormat(
                "Cannot enqueue a buffer with zero channels".into(),
            ));
        }

        let converted = self.resamplers.convert(voice, samples, format)?;
        let mut state = self.lock();
        voice_mut(&mut state, voice)?.queue.push_back(QueuedBuffer {
            samples: converted,
            channels: format.channels as usize,
            cursor: 0,
        });
        Ok(())
    }

    fn buffers_consumed(&mut self, voice: HwVoiceId) -> Result<usize> {
        let mut state = self.lock();
        let target = voice_mut(&mut state, voice)?;
        Ok(std::mem::take(&mut target.consumed))
    }

    fn set_gain(&mut self, voice: HwVoiceId, gain: f32) -> Result<()> {
        let mut state = self.lock();
        voice_mut(&mut state, voice)?.gain = gain;
        Ok(())
    }

    fn set_position(&mut self, voice: HwVoiceId, position: Option<Vec3>) -> Result<()> {
        let mut state = self.lock();
        voice_mut(&mut state, voice)?.position = position;
        Ok(())
    }

    fn set_listener(&mut self, pose: Pose) -> Result<()> {
        self.lock().listener = pose;
        Ok(())
    }

    fn set_paused(&mut self, voice: HwVoiceId, paused: bool) -> Result<()> {
        let mut state = self.lock();
        voice_mut(&mut state, voice)?.paused = paused;
        Ok(())
    }

    fn stop_and_flush(&mut self, voice: HwVoiceId) -> Result<()> {
        {
            let mut state = self.lock();
            let target = voice_mut(&mut state, voice)?;
            target.queue.clear();
            target.consumed = 0;
            target.paused = false;
        }
        self.resamplers.reset(voice);
        Ok(())
    }

    fn take_silent_blocks(&mut self) -> u64 {
        self.silent_blocks.swap(0, Ordering::Relaxed)
    }
}

fn open_stream(
    desc: &EngineDesc,
    mixer: Arc<Mutex<MixerState>>,
    silent_blocks: Arc<AtomicU64>,
) -> Result<(cpal::Stream, OutputInfo)> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or_else(|| {
        SoundsError::AudioDevice("No default output device available".into())
    })?;
    let device_name = device.name().unwrap_or_else(|_| "unknown device".to_string());

    let config = cpal::StreamConfig {
        channels: desc.channels,
        sample_rate: cpal::SampleRate(desc.sample_rate),
        buffer_size: cpal::BufferSize::Fixed(desc.block_size as u32),
    };

    let default_config = device.default_output_config().map_err(|e| {
        SoundsError::AudioDevice(format!("Failed to get default config: {}", e))
    })?;

    let stream = match default_config.sample_format() {
        cpal::SampleFormat::F32 => create_stream::<f32>(&device, &config, mixer, silent_blocks)?,
        cpal::SampleFormat::I16 => create_stream::<i16>(&device, &config, mixer, silent_blocks)?,
        cpal::SampleFormat::U16 => create_stream::<u16>(&device, &config, mixer, silent_blocks)?,
        format => {
            return Err(SoundsError::AudioFormat(format!(
                "Unsupported sample format: {}",
                format
            )));
        }
    };

    stream
        .play()
        .map_err(|e| SoundsError::AudioDevice(format!("Failed to start stream: {}", e)))?;

    Ok((
        stream,
        OutputInfo {
            device_name,
            sample_rate: desc.sample_rate,
            channels: desc.channels,
        },
    ))
}

fn create_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mixer: Arc<Mutex<MixerState>>,
    silent_blocks: Arc<AtomicU64>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut mix_buffer: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                // Grows on the first callback only; the block size is fixed.
                mix_buffer.resize(data.len(), 0.0);
                render_block(&mixer, &mut mix_buffer, channels, &silent_blocks);

                for (sample, value) in data.iter_mut().zip(&mix_buffer) {
                    *sample = T::from_sample(*value);
                }
            },
            move |err| {
                log::error!("Audio stream error: {}", err);
            },
            None,
        )
        .map_err(|e| SoundsError::AudioDevice(format!("Failed to build stream: {}", e)))
}

/// Mixes one output block into `out`, or leaves it silent and bumps
/// `silent_blocks` when the mixer state is held elsewhere. Never blocks.
fn render_block(mixer: &Mutex<MixerState>, out: &mut [f32], channels: usize, silent_blocks: &AtomicU64) {
    out.fill(0.0);
    match mixer.try_lock() {
        Ok(mut state) => mix_voices(&mut state, out, channels),
        Err(_) => {
            silent_blocks.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Adds every voice's next frames into `out` (interleaved, `channels` wide).
fn mix_voices(state: &mut MixerState, out: &mut [f32], channels: usize) {
    let listener = state.listener;
    for voice in state.voices.iter_mut().flatten().filter(|v| !v.paused) {
        mix_voice(voice, &listener, out, channels);
    }
}

fn mix_voice(voice: &mut MixVoice, listener: &Pose, out: &mut [f32], channels: usize) {
    let total_frames = out.len() / channels;
    let spatial = voice.position.map(|position| {
        let attenuation = distance_gain(
            listener.distance_to(position),
            REFERENCE_DISTANCE,
            ROLLOFF,
        );
        let (left, right) = pan_gains(listener, position);
        (left * attenuation, right * attenuation, attenuation)
    });

    let mut frame = 0;
    while let Some(buffer) = voice.queue.front_mut() {
        let buffer_frames = buffer.frames();
        while frame < total_frames && buffer.cursor < buffer_frames {
            let src_start = buffer.cursor * buffer.channels;
            let src = &buffer.samples[src_start..src_start + buffer.channels];
            let dst = &mut out[frame * channels..(frame + 1) * channels];
            match spatial {
                Some(gains) => mix_positional_frame(src, dst, voice.gain, gains),
                None => mix_frame(src, dst, voice.gain),
            }
            buffer.cursor += 1;
            frame += 1;
        }

        if buffer.cursor < buffer_frames {
            break;
        }
        voice.queue.pop_front();
        voice.consumed += 1;
    }
}

fn mix_frame(src: &[f32], dst: &mut [f32], gain: f32) {
    if dst.len() == 1 {
        let sum: f32 = src.iter().sum();
        dst[0] += sum / src.len() as f32 * gain;
        return;
    }
    for (ch, out) in dst.iter_mut().enumerate() {
        *out += src[ch % src.len()] * gain;
    }
}

/// Positional voices are folded to mono, then panned onto the first two outputs.
fn mix_positional_frame(src: &[f32], dst: &mut [f32], gain: f32, (left, right, attenuation): (f32, f32, f32)) {
    let mono = src.iter().sum::<f32>() / src.len() as f32 * gain;
    match dst {
        [only] => *only += mono * attenuation,
        [l, r, ..] => {
            *l += mono * left;
            *r += mono * right;
        }
        [] => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice_with(buffers: &[(&[f32], usize)]) -> MixVoice {
        let mut voice = MixVoice::default();
        for (samples, channels) in buffers {
            voice.queue.push_back(QueuedBuffer {
                samples: samples.to_vec(),
                channels: *channels,
                cursor: 0,
            });
        }
        voice
    }

    #[test]
    fn test_mono_voice_fills_both_channels() {
        let mut voice = voice_with(&[(&[0.5, 0.25], 1)]);
        voice.gain = 0.5;
        let mut out = vec![0.0; 6];
        mix_voice(&mut voice, &Pose::identity(), &mut out, 2);

        assert_eq!(out, vec![0.25, 0.25, 0.125, 0.125, 0.0, 0.0]);
        assert_eq!(voice.consumed, 1);
        assert!(voice.queue.is_empty());
    }

    #[test]
    fn test_buffers_play_across_callbacks() {
        let mut voice = voice_with(&[(&[1.0, 1.0, 1.0], 1), (&[2.0], 1)]);
        let mut out = vec![0.0; 2];
        mix_voice(&mut voice, &Pose::identity(), &mut out, 1);
        assert_eq!(out, vec![1.0, 1.0]);
        assert_eq!(voice.consumed, 0);

        let mut out = vec![0.0; 2];
        mix_voice(&mut voice, &Pose::identity(), &mut out, 1);
        assert_eq!(out, vec![1.0, 2.0]);
        assert_eq!(voice.consumed, 2);
    }

    #[test]
    fn test_empty_buffer_counts_as_consumed() {
        let mut voice = voice_with(&[(&[], 2)]);
        let mut out = vec![0.0; 4];
        mix_voice(&mut voice, &Pose::identity(), &mut out, 2);
        assert_eq!(voice.consumed, 1);
    }

    #[test]
    fn test_stereo_downmix_to_mono() {
        let mut voice = voice_with(&[(&[1.0, 0.0], 2)]);
        let mut out = vec![0.0; 1];
        mix_voice(&mut voice, &Pose::identity(), &mut out, 1);
        assert_eq!(out, vec![0.5]);
    }

    #[test]
    fn test_positional_voice_pans_right() {
        let mut voice = voice_with(&[(&[1.0], 1)]);
        voice.position = Some(Vec3::new(1.0, 0.0, 0.0));
        let mut out = vec![0.0; 2];
        mix_voice(&mut voice, &Pose::identity(), &mut out, 2);
        assert!(out[0].abs() < 1e-6);
        assert!((out[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_mix_voices_sums_sources() {
        let mut state = MixerState::default();
        state.voices.push(Some(voice_with(&[(&[0.25], 1)])));
        state.voices.push(None);
        state.voices.push(Some(voice_with(&[(&[0.5], 1)])));
        let mut out = vec![0.0; 1];
        mix_voices(&mut state, &mut out, 1);
        assert_eq!(out, vec![0.75]);
    }

    #[test]
    fn test_paused_voice_is_skipped() {
        let mut state = MixerState::default();
        let mut held = voice_with(&[(&[0.5], 1)]);
        held.paused = true;
        state.voices.push(Some(held));
        let mut out = vec![0.0; 1];
        mix_voices(&mut state, &mut out, 1);
        assert_eq!(out, vec![0.0]);

        let held = state.voices[0].as_mut().unwrap();
        assert_eq!(held.queue.len(), 1);
        assert_eq!(held.consumed, 0);
    }

    #[test]
    fn test_contended_block_is_silent_and_counted() {
        let mixer = Mutex::new(MixerState::default());
        mixer
            .lock()
            .unwrap()
            .voices
            .push(Some(voice_with(&[(&[1.0, 1.0], 1)])));
        let silent = AtomicU64::new(0);

        let guard = mixer.lock().unwrap();
        let mut out = vec![0.7; 2];
        render_block(&mixer, &mut out, 1, &silent);
        drop(guard);
        assert_eq!(out, vec![0.0, 0.0]);
        assert_eq!(silent.load(Ordering::Relaxed), 1);

        render_block(&mixer, &mut out, 1, &silent);
        assert_eq!(out, vec![1.0, 1.0]);
        assert_eq!(silent.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_reset_keeps_one_sound_out_of_the_next() {
        let mut resamplers = VoiceResamplers::new(48000, ResamplerType::Fast);
        resamplers.push();
        let voice = HwVoiceId(0);
        let format = PcmFormat {
            channels: 1,
            sample_rate: 24000,
        };

        // The first sound leaves part of a chunk and its filter history behind.
        let first = resamplers.convert(voice, &[1.0; 300], format).unwrap();
        assert!(!first.is_empty());

        resamplers.reset(voice);
        let second = resamplers.convert(voice, &[0.0; 256], format).unwrap();
        assert!(!second.is_empty());
        assert!(
            second.iter().all(|sample| sample.abs() < 1e-6),
            "first sound leaked into the second"
        );
    }

    #[test]
    fn test_device_rate_passes_through() {
        let mut resamplers = VoiceResamplers::new(48000, ResamplerType::Fast);
        resamplers.push();
        let format = PcmFormat {
            channels: 2,
            sample_rate: 48000,
        };
        let converted = resamplers
            .convert(HwVoiceId(0), &[0.25, -0.25], format)
            .unwrap();
        assert_eq!(converted, vec![0.25, -0.25]);

        let other_rate = PcmFormat {
            channels: 1,
            sample_rate: 24000,
        };
        assert!(resamplers.convert(HwVoiceId(3), &[0.0; 2], other_rate).is_err());
    }
}
