//! Track Edit Library - Core of an interactive GPS track editor
//!
//! This library keeps an editable collection of GPX-like track documents with
//! transactional, persistent undo/redo, maintains route statistics at every
//! level of each document's hierarchy, and builds multi-resolution
//! simplification hierarchies for point-level editing and route reduction.
//!
//! # Architecture
//!
//! - **[`Document`]**: File → Track → Segment → Point, File → Waypoint
//! - **[`ItemRef`]**: typed address of any node, stale once its target is gone
//! - **[`MutationLog`]**: structural patches with exact inverses, bounded history
//! - **[`SelectionTree`]**: sparse selection with ancestor/descendant queries
//! - **[`StatisticsTree`]**: per-node cached statistics and selection merges
//! - **[`SimplificationIndex`]**: per-segment recursive RDP hierarchies
//! - **[`EditorContext`]**: the single object tying the components together
//!
//! # Concurrency
//!
//! One writer at a time goes through the mutation log. Readers work on an
//! `Arc` snapshot of one collection version and never wait for derived caches
//! to be rebuilt.

mod collection;
mod context;
mod document;
mod history;
mod import;
mod item;
mod patch;
mod selection;
mod simplify;
mod statistics;
pub mod storage;
pub mod utils;

// Public API exports
pub use collection::{CollectionDraft, CollectionInfo, DocumentCollection, DocumentsDraft};
pub use context::{ChangeEvent, EditorContext, ListenerId, MutationOutcome};
pub use document::{
    Document, DocumentId, DocumentMetadata, PointExtensions, Segment, Track, TrackPoint, Waypoint,
};
pub use history::{LogEntry, MutationLog, Transition};
pub use import::document_from_gpx;
pub use item::{ItemPath, ItemRef, PathStep};
pub use patch::{Patch, PatchOp, PatchPath, PatchValue, diff};
pub use selection::{Clipboard, SelectionTree};
pub use simplify::{
    PointTag, ResolutionScale, SegmentHierarchy, SimplificationIndex, SimplifyConfig,
    TaggedIndex, WebMercatorZoom, build_tags,
};
pub use statistics::{
    Average, DocumentStatistics, ProfileSample, SpeedSample, Statistics, StatisticsTree,
    TrackStatistics,
};
pub use storage::{FileStore, KvStore, MemoryStore, StorageError, WriteBatch};

use serde::{Deserialize, Serialize};

/// Error types for editing operations
#[derive(Debug, thiserror::Error)]
pub enum EditError {
    #[error("Mutation failed: {reason}")]
    MutationFailed { reason: String },

    #[error("Index {path} out of range (length {len})")]
    IndexViolation { path: String, len: usize },

    #[error("Patch does not apply: {0}")]
    PatchMismatch(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl EditError {
    /// Shorthand for mutators rejecting an edit
    pub fn mutation(reason: impl Into<String>) -> Self {
        Self::MutationFailed {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EditError>;

/// Configuration for an [`EditorContext`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of undoable entries kept in the log
    pub history_capacity: usize,
    /// Tolerances of the simplification hierarchy
    pub simplification: SimplifyConfig,
    /// Speed (m/s) above which time counts as moving
    pub moving_speed_threshold: f64,
    /// Rebuild statistics and hierarchies on the rayon pool instead of
    /// inline after each commit
    pub background_rebuild: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            simplification: SimplifyConfig::default(),
            moving_speed_threshold: 0.5,
            background_rebuild: false,
        }
    }
}
