//! Document model: File → Track → Segment → Point, File → Waypoint
//!
//! Documents are plain values. The collection stores them behind `Arc`s and
//! segments keep their point arrays behind an `Arc` as well, so two versions
//! of a collection share every subtree an edit did not touch.

use geo::Point;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use time::OffsetDateTime;

use crate::utils;

/// Stable, unique identifier of a document
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub u64);

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doc-{}", self.0)
    }
}

/// Document-level metadata
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub name: String,
    pub description: Option<String>,
    /// Whether the document is drawn at all
    pub visible: bool,
}

impl Default for DocumentMetadata {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: None,
            visible: true,
        }
    }
}

/// A GPS track document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    id: DocumentId,
    pub metadata: DocumentMetadata,
    pub tracks: Vec<Track>,
    pub waypoints: Vec<Waypoint>,
}

impl Document {
    /// Create an empty document
    pub fn new(id: DocumentId, name: impl Into<String>) -> Self {
        Self {
            id,
            metadata: DocumentMetadata {
                name: name.into(),
                ..DocumentMetadata::default()
            },
            tracks: Vec::new(),
            waypoints: Vec::new(),
        }
    }

    /// The document id. It cannot change for the lifetime of the document.
    #[inline]
    pub fn id(&self) -> DocumentId {
        self.id
    }

    #[inline]
    pub fn track(&self, track_index: usize) -> Option<&Track> {
        self.tracks.get(track_index)
    }

    #[inline]
    pub fn segment(&self, track_index: usize, segment_index: usize) -> Option<&Segment> {
        self.tracks.get(track_index)?.segments.get(segment_index)
    }

    #[inline]
    pub fn segment_mut(&mut self, track_index: usize, segment_index: usize) -> Option<&mut Segment> {
        self.tracks
            .get_mut(track_index)?
            .segments
            .get_mut(segment_index)
    }

    #[inline]
    pub fn waypoint(&self, waypoint_index: usize) -> Option<&Waypoint> {
        self.waypoints.get(waypoint_index)
    }

    /// Total number of track points across all tracks and segments
    pub fn total_points(&self) -> usize {
        self.tracks
            .iter()
            .flat_map(|t| &t.segments)
            .map(Segment::len)
            .sum()
    }
}

/// An ordered sequence of segments
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub name: Option<String>,
    pub description: Option<String>,
    pub segments: Vec<Segment>,
}

impl Track {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self {
            segments,
            ..Self::default()
        }
    }
}

/// An ordered sequence of track points
///
/// The points live behind an `Arc`: cloning a segment is cheap, and
/// [`Segment::points_mut`] detaches the array before writing. A segment whose
/// array was never written keeps its identity across collection versions.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Segment {
    points: Arc<Vec<TrackPoint>>,
}

impl Segment {
    pub fn new(points: Vec<TrackPoint>) -> Self {
        Self {
            points: Arc::new(points),
        }
    }

    #[inline]
    pub fn points(&self) -> &[TrackPoint] {
        &self.points
    }

    /// Mutable access to the points; detaches shared storage first.
    #[inline]
    pub fn points_mut(&mut self) -> &mut Vec<TrackPoint> {
        Arc::make_mut(&mut self.points)
    }

    /// Replace the whole point sequence
    pub fn set_points(&mut self, points: Vec<TrackPoint>) {
        self.points = Arc::new(points);
    }

    /// Shared handle to the point array
    #[inline]
    pub fn shared_points(&self) -> &Arc<Vec<TrackPoint>> {
        &self.points
    }

    /// True when both segments share the very same point array
    #[inline]
    pub fn shares_points_with(&self, other: &Segment) -> bool {
        Arc::ptr_eq(&self.points, &other.points)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        self.shares_points_with(other) || self.points == other.points
    }
}

/// Optional sensor readings attached to a track point
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PointExtensions {
    /// Beats per minute
    pub heart_rate: Option<u16>,
    /// Revolutions per minute
    pub cadence: Option<u16>,
    /// Watts
    pub power: Option<u16>,
    /// Degrees Celsius
    pub temperature: Option<f64>,
}

/// A single track point
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    /// Position, x = longitude, y = latitude (as in `gpx`)
    pub position: Point<f64>,
    /// Elevation in meters
    pub elevation: Option<f64>,
    pub time: Option<OffsetDateTime>,
    pub extensions: PointExtensions,
}

impl TrackPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            position: Point::new(lon, lat),
            elevation: None,
            time: None,
            extensions: PointExtensions::default(),
        }
    }

    pub fn with_elevation(mut self, elevation: f64) -> Self {
        self.elevation = Some(elevation);
        self
    }

    pub fn with_time(mut self, time: OffsetDateTime) -> Self {
        self.time = Some(time);
        self
    }

    #[inline]
    pub fn lat(&self) -> f64 {
        self.position.y()
    }

    #[inline]
    pub fn lon(&self) -> f64 {
        self.position.x()
    }

    /// Great-circle distance to another point in meters
    #[inline]
    pub fn distance_to(&self, other: &TrackPoint) -> f64 {
        utils::haversine_distance(self.lat(), self.lon(), other.lat(), other.lon())
    }
}

/// A standalone point of interest
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    /// Position, x = longitude, y = latitude
    pub position: Point<f64>,
    pub elevation: Option<f64>,
    pub time: Option<OffsetDateTime>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub symbol: Option<String>,
}

impl Waypoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            position: Point::new(lon, lat),
            elevation: None,
            time: None,
            name: None,
            description: None,
            symbol: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[inline]
    pub fn lat(&self) -> f64 {
        self.position.y()
    }

    #[inline]
    pub fn lon(&self) -> f64 {
        self.position.x()
    }
}
