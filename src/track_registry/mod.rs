//! TrackRegistry - Per-track vehicle state machine
//!
//! ## Responsibilities
//!
//! - Follow externally-identified tracks across frames
//! - Count frames of absence for tracks that disappeared
//! - On eviction, commit the track's majority class to the aggregate exactly once
//!
//! No I/O. The aggregate is persisted by `BucketAggregator`.

use crate::models::VehicleClass;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Default number of absent frames a track survives
pub const DEFAULT_MAX_FRAMES_ABSENT: u32 = 10;

/// Externally assigned track identifier
pub type TrackId = u64;

/// Tracker tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// A track is evicted once its absence count exceeds this value
    pub max_frames_absent: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_frames_absent: DEFAULT_MAX_FRAMES_ABSENT,
        }
    }
}

/// Per-class counts for one bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCountSet {
    counts: BTreeMap<VehicleClass, u32>,
}

impl AggregateCountSet {
    /// All classes seeded at zero
    pub fn zeroed() -> Self {
        Self {
            counts: VehicleClass::ALL.iter().map(|c| (*c, 0)).collect(),
        }
    }

    pub fn get(&self, class: VehicleClass) -> u32 {
        self.counts.get(&class).copied().unwrap_or(0)
    }

    pub fn set(&mut self, class: VehicleClass, count: u32) {
        self.counts.insert(class, count);
    }

    pub fn increment(&mut self, class: VehicleClass) {
        *self.counts.entry(class).or_insert(0) += 1;
    }

    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }

    /// Counts in class-index order
    pub fn iter(&self) -> impl Iterator<Item = (VehicleClass, u32)> + '_ {
        self.counts.iter().map(|(c, n)| (*c, *n))
    }

    /// Vehicle classes only, for log lines
    pub fn vehicle_summary(&self) -> BTreeMap<&'static str, u32> {
        self.iter()
            .filter(|(c, _)| c.is_vehicle())
            .map(|(c, n)| (c.as_str(), n))
            .collect()
    }
}

impl Default for AggregateCountSet {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl FromIterator<(VehicleClass, u32)> for AggregateCountSet {
    fn from_iter<I: IntoIterator<Item = (VehicleClass, u32)>>(iter: I) -> Self {
        let mut set = Self::zeroed();
        for (class, count) in iter {
            set.set(class, count);
        }
        set
    }
}

/// One followed object
#[derive(Debug, Clone)]
struct Track {
    /// class -> observation count
    classes: BTreeMap<VehicleClass, u32>,
    frame_count: u32,
    absent_frames: u32,
}

impl Track {
    fn new(class: VehicleClass) -> Self {
        let mut classes = BTreeMap::new();
        classes.insert(class, 1);
        Self {
            classes,
            frame_count: 1,
            absent_frames: 0,
        }
    }

    fn observe(&mut self, class: VehicleClass) {
        *self.classes.entry(class).or_insert(0) += 1;
        self.frame_count += 1;
        self.absent_frames = 0;
    }

    /// Class seen most often; ties go to the lowest class index
    fn majority_class(&self) -> Option<VehicleClass> {
        let mut best: Option<(VehicleClass, u32)> = None;
        // BTreeMap iterates in class-index order, so strict `>` keeps the lowest index on ties
        for (class, count) in &self.classes {
            match best {
                Some((_, best_count)) if *count <= best_count => {}
                _ => best = Some((*class, *count)),
            }
        }
        best.map(|(class, _)| class)
    }
}

/// Result of one `advance` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvanceOutcome {
    /// (track, committed class) for every track evicted this frame
    pub evicted: Vec<(TrackId, VehicleClass)>,
}

/// Track registry for one stream
#[derive(Debug, Clone)]
pub struct TrackRegistry {
    config: TrackerConfig,
    tracks: HashMap<TrackId, Track>,
    aggregate: AggregateCountSet,
}

impl TrackRegistry {
    pub fn new(config: TrackerConfig) -> Self {
        Self::with_aggregate(config, AggregateCountSet::zeroed())
    }

    /// Registry whose aggregate starts from persisted counts
    pub fn with_aggregate(config: TrackerConfig, aggregate: AggregateCountSet) -> Self {
        Self {
            config,
            tracks: HashMap::new(),
            aggregate,
        }
    }

    /// Record one sighting of a track
    pub fn observe(&mut self, track_id: TrackId, class: VehicleClass) {
        match self.tracks.get_mut(&track_id) {
            Some(track) => track.observe(class),
            None => {
                self.tracks.insert(track_id, Track::new(class));
            }
        }
    }

    /// Close out a frame. Must be called once per frame, also when nothing was detected.
    pub fn advance(&mut self, visible: &HashSet<TrackId>) -> AdvanceOutcome {
        let max_absent = self.config.max_frames_absent;
        let mut expired = Vec::new();

        for (id, track) in self.tracks.iter_mut() {
            if visible.contains(id) {
                continue;
            }
            track.absent_frames += 1;
            if track.absent_frames > max_absent {
                expired.push(*id);
            }
        }

        // Deterministic commit order regardless of hash order
        expired.sort_unstable();

        let mut outcome = AdvanceOutcome::default();
        for id in expired {
            if let Some(track) = self.tracks.remove(&id) {
                if let Some(class) = track.majority_class() {
                    self.aggregate.increment(class);
                    tracing::trace!(
                        track_id = id,
                        class = %class,
                        frames = track.frame_count,
                        "Track evicted"
                    );
                    outcome.evicted.push((id, class));
                }
            }
        }
        outcome
    }

    /// Observe every detection of a frame, then advance
    pub fn update_frame(&mut self, detections: &[(TrackId, VehicleClass)]) -> AdvanceOutcome {
        let mut visible = HashSet::with_capacity(detections.len());
        for (id, class) in detections {
            self.observe(*id, *class);
            visible.insert(*id);
        }
        self.advance(&visible)
    }

    /// Current aggregate, not mutated
    pub fn snapshot(&self) -> AggregateCountSet {
        self.aggregate.clone()
    }

    /// Zero the aggregate for a new bucket; live tracks are kept
    pub fn reset_aggregate(&mut self) {
        self.aggregate = AggregateCountSet::zeroed();
    }

    pub fn active_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }
}

impl Default for TrackRegistry {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}
