use crate::asset::AssetId;
use crate::error::{Result, SoundsError};
use crate::math::Vec3;

/// Loop mode for a played sound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    /// Play once and stop
    #[default]
    Once,
    /// Loop until released or stolen
    Infinite,
    /// Play the asset this many times in total
    Count(u32),
}

impl LoopMode {
    /// Whether a voice that just finished its `completed`-th pass should start again.
    pub fn should_restart(&self, completed: u32) -> bool {
        match self {
            Self::Once => false,
            Self::Infinite => true,
            Self::Count(total) => completed < *total,
        }
    }
}

/// Mixing category of a sound (SFX, dialog, music, ...). The meaning of each
/// value is up to the host; the engine only keeps a gain per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SoundCategory(pub u16);

impl std::fmt::Display for SoundCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SoundCategory({})", self.0)
    }
}

/// Placement of a positional sound
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SpatialParams {
    pub position: Vec3,
}

impl SpatialParams {
    pub fn at(position: Vec3) -> Self {
        Self { position }
    }
}

/// One asset of a cue and how many times it plays before the next one starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CueEntry {
    pub asset: AssetId,
    pub loop_mode: LoopMode,
}

impl CueEntry {
    pub fn new(asset: AssetId) -> Self {
        Self {
            asset,
            loop_mode: LoopMode::Once,
        }
    }

    pub fn loop_mode(mut self, loop_mode: LoopMode) -> Self {
        self.loop_mode = loop_mode;
        self
    }
}

/// A request to start playing an asset, or a cue of assets chained on one voice.
///
/// Consumed immediately by [`SoundEngine::request_play`](crate::SoundEngine::request_play).
/// Entries of a cue play back to back without a gap; the voice drains only
/// after the last one. An entry looping forever never hands over to the next.
///
/// ```no_run
/// # use sounds::*;
/// # fn demo(engine: &mut SoundEngine, asset: AssetId, intro: AssetId, theme: AssetId) -> sounds::error::Result<()> {
/// let handle = engine.request_play(
///     PlayRequest::new(asset)
///         .priority(10)
///         .at_position(Vec3::new(2.0, 0.0, -1.0))
///         .looping(true),
/// )?;
///
/// // Intro once, then the theme forever
/// engine.request_play(PlayRequest::new(intro).then(theme).looping(true))?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PlayRequest {
    /// Assets in play order; never empty for a request built with `new`
    pub entries: Vec<CueEntry>,
    /// Higher wins when voices are contended
    pub priority: i32,
    /// `None` plays the sound without positioning
    pub spatial: Option<SpatialParams>,
    pub gain: f32,
    pub category: SoundCategory,
}

impl PlayRequest {
    pub fn new(asset: AssetId) -> Self {
        Self::cue([CueEntry::new(asset)])
    }

    pub fn cue(entries: impl IntoIterator<Item = CueEntry>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
            priority: 0,
            spatial: None,
            gain: 1.0,
            category: SoundCategory::default(),
        }
    }

    /// Appends `asset` to the cue, played once.
    pub fn then(mut self, asset: AssetId) -> Self {
        self.entries.push(CueEntry::new(asset));
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn at_position(mut self, position: Vec3) -> Self {
        self.spatial = Some(SpatialParams::at(position));
        self
    }

    pub fn spatial(mut self, spatial: SpatialParams) -> Self {
        self.spatial = Some(spatial);
        self
    }

    /// Loops the last entry forever, or plays it once.
    pub fn looping(self, looping: bool) -> Self {
        self.loop_mode(if looping {
            LoopMode::Infinite
        } else {
            LoopMode::Once
        })
    }

    /// Sets the loop mode of the last entry.
    pub fn loop_mode(mut self, loop_mode: LoopMode) -> Self {
        if let Some(last) = self.entries.last_mut() {
            last.loop_mode = loop_mode;
        }
        self
    }

    pub fn gain(mut self, gain: f32) -> Self {
        self.gain = gain;
        self
    }

    pub fn category(mut self, category: SoundCategory) -> Self {
        self.category = category;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.entries.is_empty() {
            return Err(SoundsError::Configuration(
                "A play request needs at least one asset".into(),
            ));
        }
        Ok(())
    }
}
