//! Decoder adapter.
//!
//! A [`DecoderService`] opens one stateful [`AudioDecoder`] per playing voice. The
//! decoder hands out interleaved `f32` PCM one chunk at a time, so an asset is never
//! decoded in full just to be played. Closing a decoder is dropping it.
//!
//! Looping is not the decoder's business: on end of stream the voice seeks back
//! to frame 0, or reopens the decoder when the stream cannot seek.

mod pcm;
mod symphonia_decoder;

use crate::asset::{AssetSource, FormatTag, SoundAsset, StreamInfo};
use crate::error::{Result, SoundsError};
pub use pcm::PcmDecoder;
pub use symphonia_decoder::SymphoniaDecoder;

/// Result of one [`AudioDecoder::decode_next`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedChunk {
    /// Interleaved samples written to the output slice (always whole frames)
    pub samples: usize,
    /// No data follows this chunk
    pub end_of_stream: bool,
}

/// Incremental decoder bound to one asset.
pub trait AudioDecoder: Send {
    /// Decodes into `out`, writing at most `out.len()` samples.
    ///
    /// `out.len()` must be a multiple of the asset's channel count. Returns the
    /// number of samples written and whether the stream is exhausted; a chunk may
    /// carry data and the end-of-stream flag at once.
    fn decode_next(&mut self, out: &mut [f32]) -> Result<DecodedChunk>;

    /// Repositions the stream at `frame`. Fails with `SeekUnsupported` on
    /// non-seekable streams.
    fn seek(&mut self, frame: u64) -> Result<()>;
}

/// Factory for decoders. Format support is fixed when the service is built.
pub trait DecoderService: Send {
    /// Reads the stream layout of a source without decoding it.
    fn probe(&self, source: &AssetSource, format: FormatTag) -> Result<StreamInfo>;

    /// Opens a fresh decoder positioned at the start of the asset.
    fn open(&self, asset: &SoundAsset) -> Result<Box<dyn AudioDecoder>>;
}

/// Decoder service shipped with the crate: in-memory PCM plus the compressed
/// formats handled by Symphonia.
#[derive(Debug, Clone)]
pub struct DefaultDecoderService {
    formats: Vec<FormatTag>,
}

impl Default for DefaultDecoderService {
    fn default() -> Self {
        Self {
            formats: FormatTag::ALL.to_vec(),
        }
    }
}

impl DefaultDecoderService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the service to the given formats.
    pub fn with_formats(formats: &[FormatTag]) -> Self {
        Self {
            formats: formats.to_vec(),
        }
    }

    pub fn supports(&self, format: FormatTag) -> bool {
        self.formats.contains(&format)
    }

    fn check_supported(&self, format: FormatTag) -> Result<()> {
        if self.supports(format) {
            Ok(())
        } else {
            Err(SoundsError::UnsupportedFormat(format!(
                "{:?} is not enabled in this decoder service",
                format
            )))
        }
    }
}

impl DecoderService for DefaultDecoderService {
    fn probe(&self, source: &AssetSource, format: FormatTag) -> Result<StreamInfo> {
        self.check_supported(format)?;
        match (format, source) {
            (FormatTag::Pcm, AssetSource::Samples(_)) => Err(SoundsError::AudioFormat(
                "PCM sources carry their own layout and are not probed".into(),
            )),
            (FormatTag::Pcm, _) | (_, AssetSource::Samples(_)) => Err(
                SoundsError::UnsupportedFormat(format!("{:?} cannot decode this source", format)),
            ),
            _ => SymphoniaDecoder::probe(source, format),
        }
    }

    fn open(&self, asset: &SoundAsset) -> Result<Box<dyn AudioDecoder>> {
        self.check_supported(asset.format())?;
        match (asset.format(), asset.source()) {
            (FormatTag::Pcm, AssetSource::Samples(samples)) => Ok(Box::new(PcmDecoder::new(
                samples.clone(),
                asset.channels(),
            )?)),
            (FormatTag::Pcm, _) | (_, AssetSource::Samples(_)) => {
                Err(SoundsError::UnsupportedFormat(format!(
                    "{:?} cannot decode the source of {}",
                    asset.format(),
                    asset.name()
                )))
            }
            _ => Ok(Box::new(SymphoniaDecoder::open(asset)?)),
        }
    }
}

/// Decodes an asset from start to end into memory.
///
/// Used to turn short streamed assets into resident PCM.
pub fn decode_to_end(decoder: &mut dyn AudioDecoder, channels: u16) -> Result<Vec<f32>> {
    const CHUNK_FRAMES: usize = 4096;

    let mut samples = Vec::new();
    let mut chunk = vec![0.0f32; CHUNK_FRAMES * channels.max(1) as usize];
    loop {
        let decoded = decoder.decode_next(&mut chunk)?;
        samples.extend_from_slice(&chunk[..decoded.samples]);
        if decoded.end_of_stream {
            break;
        }
        if decoded.samples == 0 {
            return Err(SoundsError::CorruptStream(
                "decoder made no progress before end of stream".into(),
            ));
        }
    }
    Ok(samples)
}
