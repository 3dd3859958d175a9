use crate::error::{Result, SoundsError};
use rubato::{
    FastFixedIn, PolynomialDegree, Resampler, SincFixedIn, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};

/// Type of resampler algorithm to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResamplerType {
    /// Fast polynomial resampler - lower quality but cheap enough to run per voice
    #[default]
    Fast,
    /// Sinc interpolation resampler - higher quality but slower
    Sinc,
}

enum ResamplerImpl {
    Fast(FastFixedIn<f32>),
    Sinc(SincFixedIn<f32>),
}

impl ResamplerImpl {
    fn process(
        &mut self,
        input: &[Vec<f32>],
    ) -> std::result::Result<Vec<Vec<f32>>, rubato::ResampleError> {
        match self {
            Self::Fast(r) => r.process(input, None),
            Self::Sinc(r) => r.process(input, None),
        }
    }

    fn reset(&mut self) {
        match self {
            Self::Fast(r) => r.reset(),
            Self::Sinc(r) => r.reset(),
        }
    }
}

/// Streaming sample-rate converter for one voice.
///
/// Input arrives in buffers of any length. Whole chunks of `chunk_frames` are
/// converted as soon as they are complete; the remainder is carried into the
/// next call so the filter state stays continuous across buffer boundaries.
pub struct StreamingResampler {
    resampler: ResamplerImpl,
    source_sample_rate: u32,
    target_sample_rate: u32,
    channels: usize,
    chunk_frames: usize,
    /// Interleaved input not yet converted (less than one chunk)
    pending: Vec<f32>,
    /// De-interleaved scratch for one chunk
    chunk: Vec<Vec<f32>>,
}

impl StreamingResampler {
    pub fn new(
        source_sample_rate: u32,
        target_sample_rate: u32,
        channels: u16,
        chunk_frames: usize,
        resampler_type: ResamplerType,
    ) -> Result<Self> {
        if source_sample_rate == 0 || target_sample_rate == 0 {
            return Err(SoundsError::AudioFormat(
                "Sample rates must be greater than 0".to_string(),
            ));
        }

        if channels == 0 {
            return Err(SoundsError::AudioFormat(
                "Channel count must be greater than 0".to_string(),
            ));
        }

        if chunk_frames == 0 {
            return Err(SoundsError::AudioFormat(
                "Chunk frames must be greater than 0".to_string(),
            ));
        }

        // target/source (output/input)
        let resample_ratio = target_sample_rate as f64 / source_sample_rate as f64;

        log::debug!(
            "Creating {:?} resampler: {} Hz -> {} Hz ({} channels, {} frame chunks)",
            resampler_type,
            source_sample_rate,
            target_sample_rate,
            channels,
            chunk_frames
        );

        let resampler = match resampler_type {
            ResamplerType::Fast => {
                let fast = FastFixedIn::new(
                    resample_ratio,
                    1.0,
                    PolynomialDegree::Cubic,
                    chunk_frames,
                    channels as usize,
                )
                .map_err(|e| {
                    SoundsError::AudioFormat(format!("Failed to create fast resampler: {}", e))
                })?;
                ResamplerImpl::Fast(fast)
            }
            ResamplerType::Sinc => {
                let params = SincInterpolationParameters {
                    sinc_len: 128,
                    f_cutoff: 0.95,
                    interpolation: SincInterpolationType::Linear,
                    oversampling_factor: 128,
                    window: WindowFunction::BlackmanHarris2,
                };

                let sinc = SincFixedIn::new(
                    resample_ratio,
                    1.0,
                    params,
                    chunk_frames,
                    channels as usize,
                )
                .map_err(|e| {
                    SoundsError::AudioFormat(format!("Failed to create sinc resampler: {}", e))
                })?;
                ResamplerImpl::Sinc(sinc)
            }
        };

        Ok(Self {
            resampler,
            source_sample_rate,
            target_sample_rate,
            channels: channels as usize,
            chunk_frames,
            pending: Vec::with_capacity(chunk_frames * channels as usize),
            chunk: vec![Vec::with_capacity(chunk_frames); channels as usize],
        })
    }

    /// Converts interleaved `input` and appends the converted frames to `output`.
    ///
    /// Returns the number of frames appended, which may be zero while less than
    /// one chunk of input has accumulated.
    pub fn process_interleaved(&mut self, input: &[f32], output: &mut Vec<f32>) -> Result<usize> {
        if input.len() % self.channels != 0 {
            return Err(SoundsError::AudioFormat(format!(
                "Input of {} samples is not a whole number of {}-channel frames",
                input.len(),
                self.channels
            )));
        }

        let chunk_samples = self.chunk_frames * self.channels;
        let mut appended = 0;
        let mut remaining = input;

        while !remaining.is_empty() {
            let take = (chunk_samples - self.pending.len()).min(remaining.len());
            self.pending.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];

            if self.pending.len() == chunk_samples {
                appended += self.convert_pending(output)?;
            }
        }

        Ok(appended)
    }

    fn convert_pending(&mut self, output: &mut Vec<f32>) -> Result<usize> {
        // De-interleave
        for (ch, wave) in self.chunk.iter_mut().enumerate() {
            wave.clear();
            wave.extend(self.pending.iter().skip(ch).step_by(self.channels));
        }
        self.pending.clear();

        let output_waves = self
            .resampler
            .process(&self.chunk)
            .map_err(|e| SoundsError::AudioFormat(format!("Streaming resampling error: {}", e)))?;

        let output_frames = output_waves.first().map_or(0, |wave| wave.len());
        output.reserve(output_frames * self.channels);
        for frame_idx in 0..output_frames {
            for wave in &output_waves {
                output.push(wave[frame_idx]);
            }
        }

        Ok(output_frames)
    }

    /// Frames buffered while waiting for a complete chunk.
    pub fn pending_frames(&self) -> usize {
        self.pending.len() / self.channels
    }

    pub fn source_sample_rate(&self) -> u32 {
        self.source_sample_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    /// Drops carried input and the filter history.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.resampler.reset();
    }
}
