use crate::asset::{AssetSource, FormatTag, SoundAsset, StreamInfo};
use crate::config::MAX_SOURCE_CHANNELS;
use crate::decoder::{AudioDecoder, DecodedChunk};
use crate::error::{Result, SoundsError};
use std::fs::File;
use std::io::Cursor;
use symphonia::{
    core::{
        audio::SampleBuffer,
        codecs::{CODEC_TYPE_NULL, CodecParameters, Decoder, DecoderOptions},
        errors::Error,
        formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
        io::{MediaSource, MediaSourceStream},
        meta::MetadataOptions,
        probe::Hint,
        units::Time,
    },
    default::{get_codecs, get_probe},
};

/// Isolated corrupt packets are skipped; this many in a row fail the stream.
const MAX_CONSECUTIVE_DECODE_ERRORS: u32 = 8;

/// Streaming decoder for compressed assets, built on Symphonia.
///
/// Packets are decoded on demand and buffered only until the caller has taken
/// their samples, so memory use is bounded by one packet regardless of the
/// asset length.
pub struct SymphoniaDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    channels: u16,
    sample_rate: u32,
    sample_buf: Option<SampleBuffer<f32>>,
    sample_buf_frames: u64,
    pending: Vec<f32>,
    pending_pos: usize,
    finished: bool,
    consecutive_errors: u32,
}

impl SymphoniaDecoder {
    /// Reads the stream layout of an encoded source.
    pub fn probe(source: &AssetSource, format: FormatTag) -> Result<StreamInfo> {
        let reader = open_format(source, format)?;
        let (_, params) = select_track(reader.as_ref())?;
        stream_info(&params)
    }

    pub fn open(asset: &SoundAsset) -> Result<Self> {
        let format = open_format(asset.source(), asset.format())?;
        let (track_id, params) = select_track(format.as_ref())?;
        let info = stream_info(&params)?;
        if info.channels != asset.channels() {
            return Err(SoundsError::CorruptStream(format!(
                "{} now has {} channels, registered with {}",
                asset.name(),
                info.channels,
                asset.channels()
            )));
        }

        let decoder = get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| SoundsError::UnsupportedFormat(format!("Failed to create decoder: {}", e)))?;

        log::debug!(
            "Opened decoder for {} (track {}, {} Hz, {} channels)",
            asset.name(),
            track_id,
            info.sample_rate,
            info.channels
        );

        Ok(Self {
            format,
            decoder,
            track_id,
            channels: info.channels,
            sample_rate: info.sample_rate,
            sample_buf: None,
            sample_buf_frames: 0,
            pending: Vec::new(),
            pending_pos: 0,
            finished: false,
            consecutive_errors: 0,
        })
    }

    /// Decodes the next packet of our track into `pending`.
    /// Returns `false` at end of stream.
    fn decode_packet(&mut self) -> Result<bool> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(Error::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(false);
                }
                Err(Error::ResetRequired) => {
                    // Chained stream with new headers; the layout must not change.
                    self.decoder.reset();
                    continue;
                }
                Err(e) => {
                    return Err(SoundsError::CorruptStream(format!(
                        "Error reading packet: {}",
                        e
                    )));
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    self.consecutive_errors = 0;
                    let spec = *decoded.spec();
                    if spec.channels.count() != self.channels as usize {
                        return Err(SoundsError::CorruptStream(format!(
                            "Channel count changed mid-stream: {} -> {}",
                            self.channels,
                            spec.channels.count()
                        )));
                    }

                    let frames = decoded.capacity() as u64;
                    if self.sample_buf.is_none() || self.sample_buf_frames < frames {
                        self.sample_buf = Some(SampleBuffer::<f32>::new(frames, spec));
                        self.sample_buf_frames = frames;
                    }

                    if let Some(buf) = self.sample_buf.as_mut() {
                        buf.copy_interleaved_ref(decoded);
                        self.pending.clear();
                        self.pending.extend_from_slice(buf.samples());
                        self.pending_pos = 0;
                    }
                    return Ok(true);
                }
                Err(Error::IoError(_)) => return Ok(false), // also EOF in some formats
                Err(Error::DecodeError(msg)) => {
                    self.consecutive_errors += 1;
                    log::warn!(
                        "Skipping corrupt packet ({} in a row): {}",
                        self.consecutive_errors,
                        msg
                    );
                    if self.consecutive_errors > MAX_CONSECUTIVE_DECODE_ERRORS {
                        return Err(SoundsError::CorruptStream(format!(
                            "{} consecutive packets failed to decode",
                            self.consecutive_errors
                        )));
                    }
                }
                Err(e) => {
                    return Err(SoundsError::CorruptStream(format!(
                        "Error decoding packet: {}",
                        e
                    )));
                }
            }
        }
    }
}

impl AudioDecoder for SymphoniaDecoder {
    fn decode_next(&mut self, out: &mut [f32]) -> Result<DecodedChunk> {
        let channels = self.channels as usize;
        let capacity = out.len() - out.len() % channels;
        let mut written = 0;

        loop {
            let available = self.pending.len() - self.pending_pos;
            if available > 0 {
                // `pending` always holds whole frames, and so does `capacity`.
                let count = available.min(capacity - written);
                out[written..written + count]
                    .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + count]);
                self.pending_pos += count;
                written += count;
            }

            if written == capacity {
                return Ok(DecodedChunk {
                    samples: written,
                    end_of_stream: false,
                });
            }

            if self.finished || !self.decode_packet()? {
                self.finished = true;
                return Ok(DecodedChunk {
                    samples: written,
                    end_of_stream: true,
                });
            }
        }
    }

    fn seek(&mut self, frame: u64) -> Result<()> {
        let rate = self.sample_rate.max(1) as u64;
        let time = Time::new(frame / rate, (frame % rate) as f64 / rate as f64);

        self.format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time,
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| match e {
                Error::SeekError(kind) => SoundsError::SeekUnsupported(format!("{:?}", kind)),
                Error::Unsupported(msg) => SoundsError::SeekUnsupported(msg.to_string()),
                other => SoundsError::CorruptStream(format!("Seek failed: {}", other)),
            })?;

        self.decoder.reset();
        self.pending.clear();
        self.pending_pos = 0;
        self.finished = false;
        self.consecutive_errors = 0;
        Ok(())
    }
}

fn open_format(source: &AssetSource, format: FormatTag) -> Result<Box<dyn FormatReader>> {
    let media: Box<dyn MediaSource> = match source {
        AssetSource::File(path) => Box::new(File::open(path)?),
        AssetSource::Memory(bytes) => Box::new(Cursor::new(bytes.clone())),
        AssetSource::Samples(_) => {
            return Err(SoundsError::UnsupportedFormat(
                "Decoded samples need no compressed decoder".into(),
            ));
        }
    };

    let mss = MediaSourceStream::new(media, Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = format.extension() {
        hint.with_extension(ext);
    }

    let probed = get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| match e {
            Error::Unsupported(msg) => {
                SoundsError::UnsupportedFormat(format!("Failed to probe audio format: {}", msg))
            }
            Error::IoError(e) if e.kind() != std::io::ErrorKind::UnexpectedEof => {
                SoundsError::Io(e)
            }
            other => SoundsError::CorruptStream(format!("Failed to probe audio format: {}", other)),
        })?;

    Ok(probed.format)
}

fn select_track(format: &dyn FormatReader) -> Result<(u32, CodecParameters)> {
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| SoundsError::UnsupportedFormat("No audio tracks found".to_string()))?;
    Ok((track.id, track.codec_params.clone()))
}

fn stream_info(params: &CodecParameters) -> Result<StreamInfo> {
    let sample_rate = params
        .sample_rate
        .ok_or_else(|| SoundsError::UnsupportedFormat("Sample rate not found".to_string()))?;

    let channels = params
        .channels
        .ok_or_else(|| SoundsError::UnsupportedFormat("Channel count not found".to_string()))?
        .count();
    if channels == 0 || channels > MAX_SOURCE_CHANNELS {
        return Err(SoundsError::UnsupportedFormat(format!(
            "{} channels are not supported",
            channels
        )));
    }

    Ok(StreamInfo {
        channels: channels as u16,
        sample_rate,
        total_frames: params.n_frames,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Builds a 16-bit PCM WAV file in memory.
    fn wav_bytes(frames: &[i16], channels: u16, sample_rate: u32) -> Arc<[u8]> {
        let data_len = (frames.len() * 2) as u32;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&channels.to_le_bytes());
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&(sample_rate * channels as u32 * 2).to_le_bytes());
        bytes.extend_from_slice(&(channels * 2).to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for sample in frames {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes.into()
    }

    fn wav_asset(samples: &[i16], channels: u16) -> SoundAsset {
        let source = AssetSource::Memory(wav_bytes(samples, channels, 22050));
        let info = SymphoniaDecoder::probe(&source, FormatTag::Wav).unwrap();
        SoundAsset::new("tone", source, FormatTag::Wav, info)
    }

    #[test]
    fn test_wav_layout_is_read_at_registration() {
        let asset = wav_asset(&[0i16; 2000], 2);
        assert_eq!(asset.channels(), 2);
        assert_eq!(asset.sample_rate(), 22050);
        assert_eq!(asset.total_frames(), Some(1000));
    }

    #[test]
    fn test_incremental_decode_covers_whole_stream() {
        let samples: Vec<i16> = (0..3000).map(|i| (i % 100) as i16 * 100).collect();
        let asset = wav_asset(&samples, 1);
        let mut decoder = SymphoniaDecoder::open(&asset).unwrap();

        let mut out = vec![0.0f32; 256];
        let mut total = 0;
        loop {
            let chunk = decoder.decode_next(&mut out).unwrap();
            assert!(chunk.samples <= out.len());
            total += chunk.samples;
            if chunk.end_of_stream {
                break;
            }
        }
        assert_eq!(total, 3000);
    }

    #[test]
    fn test_seek_to_start_replays() {
        let samples: Vec<i16> = (0..1000).map(|i| i as i16).collect();
        let asset = wav_asset(&samples, 1);
        let mut decoder = SymphoniaDecoder::open(&asset).unwrap();

        let mut first = vec![0.0f32; 64];
        decoder.decode_next(&mut first).unwrap();
        let mut rest = vec![0.0f32; 4096];
        while !decoder.decode_next(&mut rest).unwrap().end_of_stream {}

        decoder.seek(0).unwrap();
        let mut again = vec![0.0f32; 64];
        let chunk = decoder.decode_next(&mut again).unwrap();
        assert_eq!(chunk.samples, 64);
        assert_eq!(first, again);
    }
}
