//! Multi-resolution simplification of segments
//!
//! Each segment gets a hierarchy built by recursive Ramer–Douglas–Peucker:
//! pass `k` runs RDP with tolerance `initial / 2^k` between every pair of
//! consecutive anchors found so far, and the points it retains become anchors
//! for the next pass. Passes stop once the tolerance drops below the minimum.
//!
//! Every point is tagged with the distance that justified its retention and
//! with a view resolution level derived from a caller supplied
//! [`ResolutionScale`]. Hierarchies are cached per segment and rebuilt only
//! when the segment's point array is replaced.

use crate::collection::DocumentCollection;
use crate::document::{DocumentId, Segment, TrackPoint};
use crate::item::ItemRef;
use crate::utils;

use dashmap::DashMap;
use geo::Coord;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Tolerances of the simplification passes, in meters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimplifyConfig {
    /// Tolerance of the first pass
    pub initial_tolerance: f64,
    /// Passes stop once the (halved) tolerance drops below this value
    pub min_tolerance: f64,
}

impl Default for SimplifyConfig {
    fn default() -> Self {
        Self {
            initial_tolerance: 1000.0,
            min_tolerance: 50.0,
        }
    }
}

/// Maps a retained distance onto a view resolution level.
///
/// Implementations must be non-increasing: a larger distance never maps to a
/// finer level than a smaller one.
pub trait ResolutionScale: Send + Sync {
    fn level_for_distance(&self, distance: f64) -> u32;
}

impl<F> ResolutionScale for F
where
    F: Fn(f64) -> u32 + Send + Sync,
{
    fn level_for_distance(&self, distance: f64) -> u32 {
        self(distance)
    }
}

/// Web map zoom levels: the first zoom at which `distance` spans at least
/// one pixel of a `tile_size` tile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WebMercatorZoom {
    pub tile_size: f64,
    pub max_level: u32,
}

impl Default for WebMercatorZoom {
    fn default() -> Self {
        Self {
            tile_size: 256.0,
            max_level: 22,
        }
    }
}

impl ResolutionScale for WebMercatorZoom {
    fn level_for_distance(&self, distance: f64) -> u32 {
        if distance <= 0.0 || distance.is_nan() {
            return self.max_level;
        }
        let zoom = (utils::EARTH_SIZE_METERS / (self.tile_size * distance))
            .log2()
            .ceil();
        if zoom <= 0.0 {
            0
        } else {
            (zoom as u32).min(self.max_level)
        }
    }
}

/// Derived, non-persisted tag of one point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointTag {
    /// Retained by some pass (endpoints always are)
    pub anchor: bool,
    /// Pass depth that retained the point; endpoints are depth 0
    pub depth: Option<u32>,
    /// Perpendicular distance that justified retention, capped by the
    /// distances of the anchors bounding it. For points never retained, the
    /// last distance measured for them. Endpoints carry infinity.
    pub distance: f64,
    /// View resolution level at which the anchor is exposed
    pub level: Option<u32>,
}

impl PointTag {
    const ENDPOINT: PointTag = PointTag {
        anchor: true,
        depth: Some(0),
        distance: f64::INFINITY,
        level: Some(0),
    };

    const UNRETAINED: PointTag = PointTag {
        anchor: false,
        depth: None,
        distance: 0.0,
        level: None,
    };
}

/// Point index together with its tag
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaggedIndex {
    pub index: usize,
    pub tag: PointTag,
}

/// Simplification hierarchy of one segment
#[derive(Clone)]
pub struct SegmentHierarchy {
    /// The point array the hierarchy was built from
    source: Arc<Vec<TrackPoint>>,
    tags: Vec<PointTag>,
}

impl fmt::Debug for SegmentHierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentHierarchy")
            .field("points", &self.source.len())
            .field("anchors", &self.tags.iter().filter(|t| t.anchor).count())
            .finish()
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl SegmentHierarchy {
    /// Build the hierarchy of a segment
    pub fn build(segment: &Segment, config: &SimplifyConfig, scale: &dyn ResolutionScale) -> Self {
        let source = segment.shared_points().clone();
        let coords = utils::project_local(source.iter().map(|p| (p.lat(), p.lon())));
        let tags = build_tags(&coords, config, scale);
        Self { source, tags }
    }

    /// Whether this hierarchy was built from the segment's current points
    #[inline]
    pub fn is_current_for(&self, segment: &Segment) -> bool {
        Arc::ptr_eq(&self.source, segment.shared_points())
    }

    #[inline]
    pub fn tags(&self) -> &[PointTag] {
        &self.tags
    }

    #[inline]
    pub fn points(&self) -> &[TrackPoint] {
        &self.source
    }

    /// Anchors exposed at view resolution `level` or coarser
    pub fn anchors_at_or_below(&self, level: u32) -> Vec<TaggedIndex> {
        self.tags
            .iter()
            .enumerate()
            .filter(|(_, tag)| tag.anchor && tag.level.is_some_and(|l| l <= level))
            .map(|(index, tag)| TaggedIndex { index, tag: *tag })
            .collect()
    }

    /// Indices of points whose retained distance is at least `tolerance`
    pub fn points_above_tolerance(&self, tolerance: f64) -> Vec<usize> {
        self.tags
            .iter()
            .enumerate()
            .filter(|(_, tag)| tag.distance >= tolerance)
            .map(|(index, _)| index)
            .collect()
    }
}

/// Tag planar coordinates with the recursive RDP hierarchy.
///
/// Degenerate input (0 or 1 point) yields a trivial hierarchy.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn build_tags(
    coords: &[Coord<f64>],
    config: &SimplifyConfig,
    scale: &dyn ResolutionScale,
) -> Vec<PointTag> {
    let n = coords.len();
    if n == 0 {
        return Vec::new();
    }
    let mut tags = vec![PointTag::UNRETAINED; n];
    tags[0] = PointTag::ENDPOINT;
    tags[n - 1] = PointTag::ENDPOINT;
    if n <= 2 {
        return tags;
    }

    let mut anchors = vec![0, n - 1];
    let mut tolerance = config.initial_tolerance;
    let mut depth = 1;
    while tolerance > 0.0 && tolerance >= config.min_tolerance {
        let mut retained = Vec::new();
        for pair in anchors.windows(2) {
            rdp_pass(coords, pair[0], pair[1], tolerance, depth, scale, &mut tags, &mut retained);
        }
        if !retained.is_empty() {
            anchors.extend(retained);
            anchors.sort_unstable();
        }
        if anchors.windows(2).all(|pair| pair[1] - pair[0] < 2) {
            break;
        }
        tolerance /= 2.0;
        depth += 1;
    }
    tags
}

/// One RDP run at a fixed tolerance between two anchors
#[allow(clippy::too_many_arguments)]
fn rdp_pass(
    coords: &[Coord<f64>],
    start: usize,
    end: usize,
    tolerance: f64,
    depth: u32,
    scale: &dyn ResolutionScale,
    tags: &mut [PointTag],
    retained: &mut Vec<usize>,
) {
    let mut stack = vec![(start, end)];
    while let Some((a, b)) = stack.pop() {
        if b - a < 2 {
            continue;
        }
        let cap = tags[a].distance.min(tags[b].distance);
        let mut farthest = a;
        let mut max_distance = -1.0;
        for i in a + 1..b {
            let d = utils::perpendicular_distance(coords[i], coords[a], coords[b]);
            tags[i].distance = d.min(cap);
            if d > max_distance {
                max_distance = d;
                farthest = i;
            }
        }

        if max_distance > tolerance {
            let distance = max_distance.min(cap);
            tags[farthest] = PointTag {
                anchor: true,
                depth: Some(depth),
                distance,
                level: Some(scale.level_for_distance(distance)),
            };
            retained.push(farthest);
            stack.push((a, farthest));
            stack.push((farthest, b));
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct SegmentKey {
    document: DocumentId,
    track: usize,
    segment: usize,
}

impl SegmentKey {
    fn from_item(item: &ItemRef) -> Option<Self> {
        match *item {
            ItemRef::Segment {
                document,
                track,
                segment,
            } => Some(Self {
                document,
                track,
                segment,
            }),
            _ => None,
        }
    }
}

/// Per-segment cache of simplification hierarchies.
///
/// Readers never wait on each other: a missing or outdated hierarchy is built
/// by the reader that needs it and published for the others.
pub struct SimplificationIndex {
    config: SimplifyConfig,
    scale: Arc<dyn ResolutionScale>,
    hierarchies: DashMap<SegmentKey, Arc<SegmentHierarchy>>,
}

impl fmt::Debug for SimplificationIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimplificationIndex")
            .field("config", &self.config)
            .field("cached", &self.hierarchies.len())
            .finish()
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl SimplificationIndex {
    pub fn new(config: SimplifyConfig, scale: Arc<dyn ResolutionScale>) -> Self {
        Self {
            config,
            scale,
            hierarchies: DashMap::new(),
        }
    }

    /// Hierarchy of the segment `item` points at, built on demand.
    ///
    /// Returns `None` for stale or non-segment references.
    pub fn hierarchy(
        &self,
        item: &ItemRef,
        collection: &DocumentCollection,
    ) -> Option<Arc<SegmentHierarchy>> {
        let key = SegmentKey::from_item(item)?;
        let segment = collection.segment(item)?;

        if let Some(cached) = self.hierarchies.get(&key)
            && cached.is_current_for(segment)
        {
            return Some(cached.clone());
        }

        let built = Arc::new(SegmentHierarchy::build(segment, &self.config, self.scale.as_ref()));
        tracing::debug!(
            "Built simplification hierarchy for {:?} ({} points)",
            item,
            segment.len()
        );
        self.hierarchies.insert(key, built.clone());
        Some(built)
    }

    /// Anchors of a segment exposed at view resolution `level` or coarser
    pub fn anchors_at_or_below(
        &self,
        item: &ItemRef,
        level: u32,
        collection: &DocumentCollection,
    ) -> Vec<TaggedIndex> {
        self.hierarchy(item, collection)
            .map(|h| h.anchors_at_or_below(level))
            .unwrap_or_default()
    }

    /// Indices of a segment's points whose retained distance is at least `tolerance`
    pub fn points_above_tolerance(
        &self,
        item: &ItemRef,
        tolerance: f64,
        collection: &DocumentCollection,
    ) -> Vec<usize> {
        self.hierarchy(item, collection)
            .map(|h| h.points_above_tolerance(tolerance))
            .unwrap_or_default()
    }

    /// Build missing or outdated hierarchies of every segment of `documents`
    pub fn rebuild_documents(&self, documents: &[DocumentId], collection: &DocumentCollection) {
        let items: Vec<ItemRef> = documents
            .iter()
            .filter_map(|id| collection.get(*id))
            .flat_map(|doc| {
                doc.tracks.iter().enumerate().flat_map(move |(t, track)| {
                    (0..track.segments.len()).map(move |s| ItemRef::segment(doc.id(), t, s))
                })
            })
            .collect();
        items.par_iter().for_each(|item| {
            self.hierarchy(item, collection);
        });
    }

    /// Drop cached hierarchies of `documents` that no longer match `collection`
    pub fn prune(&self, documents: &BTreeSet<DocumentId>, collection: &DocumentCollection) {
        self.hierarchies.retain(|key, hierarchy| {
            if !documents.contains(&key.document) {
                return true;
            }
            collection
                .get(key.document)
                .and_then(|doc| doc.segment(key.track, key.segment))
                .is_some_and(|segment| hierarchy.is_current_for(segment))
        });
    }

    pub fn clear(&self) {
        self.hierarchies.clear();
    }

    /// Number of cached hierarchies
    pub fn len(&self) -> usize {
        self.hierarchies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hierarchies.is_empty()
    }
}
