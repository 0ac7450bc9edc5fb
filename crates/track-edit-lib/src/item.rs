//! Typed addresses of hierarchy nodes

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::document::{Document, DocumentId};

/// Address of a node in a document without holding a pointer to it.
///
/// A reference becomes stale when its target is removed; resolving a stale
/// reference yields `None`, never an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ItemRef {
    Document(DocumentId),
    Track {
        document: DocumentId,
        track: usize,
    },
    Segment {
        document: DocumentId,
        track: usize,
        segment: usize,
    },
    /// All waypoints of a document
    Waypoints(DocumentId),
    Waypoint {
        document: DocumentId,
        waypoint: usize,
    },
}

/// One step of an [`ItemRef`] path below the collection root
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathStep {
    Document(DocumentId),
    Track(usize),
    Segment(usize),
    Waypoints,
    Waypoint(usize),
}

pub type ItemPath = SmallVec<[PathStep; 3]>;

impl ItemRef {
    pub fn track(document: DocumentId, track: usize) -> Self {
        Self::Track { document, track }
    }

    pub fn segment(document: DocumentId, track: usize, segment: usize) -> Self {
        Self::Segment {
            document,
            track,
            segment,
        }
    }

    pub fn waypoint(document: DocumentId, waypoint: usize) -> Self {
        Self::Waypoint { document, waypoint }
    }

    /// The document this reference lives in
    #[inline]
    pub fn document(&self) -> DocumentId {
        match *self {
            Self::Document(document)
            | Self::Waypoints(document)
            | Self::Track { document, .. }
            | Self::Segment { document, .. }
            | Self::Waypoint { document, .. } => document,
        }
    }

    /// Depth in the hierarchy: documents are 0, tracks and the waypoint
    /// group 1, segments and single waypoints 2.
    #[inline]
    pub fn level(&self) -> usize {
        match self {
            Self::Document(_) => 0,
            Self::Track { .. } | Self::Waypoints(_) => 1,
            Self::Segment { .. } | Self::Waypoint { .. } => 2,
        }
    }

    pub fn parent(&self) -> Option<ItemRef> {
        match *self {
            Self::Document(_) => None,
            Self::Track { document, .. } | Self::Waypoints(document) => {
                Some(Self::Document(document))
            }
            Self::Segment {
                document, track, ..
            } => Some(Self::Track { document, track }),
            Self::Waypoint { document, .. } => Some(Self::Waypoints(document)),
        }
    }

    /// Strict ancestors, nearest first
    pub fn ancestors(&self) -> impl Iterator<Item = ItemRef> {
        std::iter::successors(self.parent(), ItemRef::parent)
    }

    /// True when `self` is a strict ancestor of `other`
    pub fn is_ancestor_of(&self, other: &ItemRef) -> bool {
        other.ancestors().any(|a| a == *self)
    }

    /// Path of steps from the collection root down to this node
    pub fn path(&self) -> ItemPath {
        let mut path = ItemPath::new();
        path.push(PathStep::Document(self.document()));
        match *self {
            Self::Document(_) => {}
            Self::Track { track, .. } => path.push(PathStep::Track(track)),
            Self::Segment { track, segment, .. } => {
                path.push(PathStep::Track(track));
                path.push(PathStep::Segment(segment));
            }
            Self::Waypoints(_) => path.push(PathStep::Waypoints),
            Self::Waypoint { waypoint, .. } => {
                path.push(PathStep::Waypoints);
                path.push(PathStep::Waypoint(waypoint));
            }
        }
        path
    }

    /// Rebuild a reference from a root path, if the path is well formed
    pub fn from_path(path: &[PathStep]) -> Option<ItemRef> {
        match *path {
            [PathStep::Document(document)] => Some(Self::Document(document)),
            [PathStep::Document(document), PathStep::Track(track)] => {
                Some(Self::Track { document, track })
            }
            [
                PathStep::Document(document),
                PathStep::Track(track),
                PathStep::Segment(segment),
            ] => Some(Self::Segment {
                document,
                track,
                segment,
            }),
            [PathStep::Document(document), PathStep::Waypoints] => Some(Self::Waypoints(document)),
            [
                PathStep::Document(document),
                PathStep::Waypoints,
                PathStep::Waypoint(waypoint),
            ] => Some(Self::Waypoint { document, waypoint }),
            _ => None,
        }
    }

    /// Ordering key inside one document: level first, then indices.
    pub(crate) fn sort_key(&self) -> (usize, u8, usize, usize) {
        match *self {
            Self::Document(_) => (0, 0, 0, 0),
            Self::Track { track, .. } => (1, 0, track, 0),
            Self::Waypoints(_) => (1, 1, 0, 0),
            Self::Segment { track, segment, .. } => (2, 0, track, segment),
            Self::Waypoint { waypoint, .. } => (2, 1, waypoint, 0),
        }
    }

    /// Whether this reference points at an existing node of `document`
    pub fn resolves_in(&self, document: &Document) -> bool {
        if document.id() != self.document() {
            return false;
        }
        match *self {
            Self::Document(_) | Self::Waypoints(_) => true,
            Self::Track { track, .. } => document.track(track).is_some(),
            Self::Segment { track, segment, .. } => document.segment(track, segment).is_some(),
            Self::Waypoint { waypoint, .. } => document.waypoint(waypoint).is_some(),
        }
    }
}
