use crate::decoder::{AudioDecoder, DecodedChunk};
use crate::error::{Result, SoundsError};
use std::sync::Arc;

/// Decoder over samples that are already resident in memory.
///
/// Shares the sample storage with the asset, so opening one is cheap.
#[derive(Debug)]
pub struct PcmDecoder {
    samples: Arc<[f32]>,
    channels: usize,
    position: usize,
}

impl PcmDecoder {
    pub fn new(samples: Arc<[f32]>, channels: u16) -> Result<Self> {
        if channels == 0 {
            return Err(SoundsError::AudioFormat(
                "Channel count must be greater than 0".to_string(),
            ));
        }
        if samples.len() % channels as usize != 0 {
            return Err(SoundsError::CorruptStream(format!(
                "{} samples do not divide into {} channels",
                samples.len(),
                channels
            )));
        }

        Ok(Self {
            samples,
            channels: channels as usize,
            position: 0,
        })
    }
}

impl AudioDecoder for PcmDecoder {
    fn decode_next(&mut self, out: &mut [f32]) -> Result<DecodedChunk> {
        let capacity = out.len() - out.len() % self.channels;
        let remaining = self.samples.len() - self.position;
        let count = capacity.min(remaining);

        out[..count].copy_from_slice(&self.samples[self.position..self.position + count]);
        self.position += count;

        Ok(DecodedChunk {
            samples: count,
            end_of_stream: self.position >= self.samples.len(),
        })
    }

    fn seek(&mut self, frame: u64) -> Result<()> {
        let sample = (frame as usize).saturating_mul(self.channels);
        self.position = sample.min(self.samples.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_are_whole_frames() {
        let samples: Arc<[f32]> = (0..10).map(|i| i as f32).collect::<Vec<_>>().into();
        let mut decoder = PcmDecoder::new(samples, 2).unwrap();

        // 5 samples of room only fits 2 stereo frames
        let mut out = [0.0f32; 5];
        let chunk = decoder.decode_next(&mut out).unwrap();
        assert_eq!(chunk.samples, 4);
        assert!(!chunk.end_of_stream);
        assert_eq!(&out[..4], &[0.0, 1.0, 2.0, 3.0]);

        let mut out = [0.0f32; 8];
        let chunk = decoder.decode_next(&mut out).unwrap();
        assert_eq!(chunk.samples, 6);
        assert!(chunk.end_of_stream);
    }

    #[test]
    fn test_seek_back_to_start() {
        let samples: Arc<[f32]> = vec![1.0, 2.0, 3.0].into();
        let mut decoder = PcmDecoder::new(samples, 1).unwrap();
        let mut out = [0.0f32; 3];
        assert!(decoder.decode_next(&mut out).unwrap().end_of_stream);

        decoder.seek(0).unwrap();
        let chunk = decoder.decode_next(&mut out).unwrap();
        assert_eq!(chunk.samples, 3);
        assert_eq!(out, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_rejects_ragged_samples() {
        let samples: Arc<[f32]> = vec![0.0; 5].into();
        assert!(PcmDecoder::new(samples, 2).is_err());
    }
}
