//! Sound assets and the registry that owns them.
//!
//! A [`SoundAsset`] is an immutable descriptor: where the bytes live, how they are
//! encoded, and the stream layout discovered when the asset was registered. Voices
//! hold an `Arc` to the asset they play, so unregistering an asset never cuts a
//! sound that is still playing.

use crate::error::{Result, SoundsError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Handle to an asset registered in an [`AssetRegistry`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AssetId(u32);

impl AssetId {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for AssetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AssetId({})", self.0)
    }
}

/// Encoding of an asset's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatTag {
    /// Ogg Vorbis
    Vorbis,
    Wav,
    Flac,
    /// Already decoded interleaved `f32` samples
    Pcm,
}

impl FormatTag {
    pub const ALL: [FormatTag; 4] = [Self::Vorbis, Self::Wav, Self::Flac, Self::Pcm];

    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "ogg" | "oga" => Some(Self::Vorbis),
            "wav" | "wave" => Some(Self::Wav),
            "flac" => Some(Self::Flac),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    /// Container extension used as a probing hint.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Self::Vorbis => Some("ogg"),
            Self::Wav => Some("wav"),
            Self::Flac => Some("flac"),
            Self::Pcm => None,
        }
    }
}

/// Where an asset's data lives.
#[derive(Debug, Clone)]
pub enum AssetSource {
    /// Encoded file on disk, streamed as it plays
    File(PathBuf),
    /// Encoded bytes held in memory
    Memory(Arc<[u8]>),
    /// Decoded interleaved samples held in memory
    Samples(Arc<[f32]>),
}

/// Stream layout reported by a decoder service when probing a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub channels: u16,
    pub sample_rate: u32,
    /// `None` for streams whose length is unknown
    pub total_frames: Option<u64>,
}

/// Immutable descriptor of a playable sound.
#[derive(Debug)]
pub struct SoundAsset {
    name: String,
    source: AssetSource,
    format: FormatTag,
    info: StreamInfo,
}

impl SoundAsset {
    pub fn new(
        name: impl Into<String>,
        source: AssetSource,
        format: FormatTag,
        info: StreamInfo,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            format,
            info,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &AssetSource {
        &self.source
    }

    pub fn format(&self) -> FormatTag {
        self.format
    }

    pub fn channels(&self) -> u16 {
        self.info.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.info.sample_rate
    }

    pub fn total_frames(&self) -> Option<u64> {
        self.info.total_frames
    }

    pub fn info(&self) -> StreamInfo {
        self.info
    }

    /// Total duration, `None` when the stream length is unknown.
    pub fn duration(&self) -> Option<Duration> {
        self.info
            .total_frames
            .map(|frames| frames_to_duration(frames, self.info.sample_rate))
    }

    /// Whether the asset streams from an encoded source rather than memory PCM.
    pub fn is_streamed(&self) -> bool {
        !matches!(self.source, AssetSource::Samples(_))
    }
}

pub(crate) fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let rate = sample_rate as u64;
    Duration::from_secs(frames / rate)
        + Duration::from_nanos((frames % rate) * 1_000_000_000 / rate)
}

/// Arena of registered assets.
///
/// Ids are never reused, so an id kept past [`AssetRegistry::remove`] reports
/// `UnknownAsset` instead of silently addressing a different sound.
#[derive(Debug, Default)]
pub struct AssetRegistry {
    slots: Vec<Option<Arc<SoundAsset>>>,
    by_name: HashMap<String, AssetId>,
}

impl AssetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, asset: SoundAsset) -> Result<AssetId> {
        if self.by_name.contains_key(asset.name()) {
            return Err(SoundsError::DuplicateAsset(asset.name().to_string()));
        }

        let id = AssetId::from_index(self.slots.len());
        self.by_name.insert(asset.name().to_string(), id);
        self.slots.push(Some(Arc::new(asset)));
        Ok(id)
    }

    pub fn get(&self, id: AssetId) -> Result<Arc<SoundAsset>> {
        self.slots
            .get(id.index())
            .and_then(|slot| slot.clone())
            .ok_or_else(|| SoundsError::UnknownAsset(id.to_string()))
    }

    pub fn find(&self, name: &str) -> Option<AssetId> {
        self.by_name.get(name).copied()
    }

    /// Drops the registry's reference. Voices still playing the asset keep theirs.
    pub fn remove(&mut self, id: AssetId) -> Option<Arc<SoundAsset>> {
        let asset = self.slots.get_mut(id.index())?.take()?;
        self.by_name.remove(asset.name());
        Some(asset)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (AssetId, &Arc<SoundAsset>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|asset| (AssetId::from_index(index), asset)))
    }
}
