//! Route statistics cached at every level of a document's hierarchy
//!
//! A [`DocumentStatistics`] node tree is built from one document version and
//! replaced whole when that document changes. [`StatisticsTree`] keeps the
//! latest tree per document and answers merged queries over item references.

use crate::collection::DocumentCollection;
use crate::document::{Document, DocumentId, TrackPoint, Waypoint};
use crate::item::ItemRef;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use geo::{Coord, Rect};
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Running mean kept as sum and count so merging stays exact
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Average {
    pub sum: f64,
    pub count: u64,
}

impl Average {
    #[inline]
    pub fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    #[inline]
    pub fn merge(&mut self, other: &Average) {
        self.sum += other.sum;
        self.count += other.count;
    }

    pub fn value(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Elevation at a distance along the route
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileSample {
    /// Meters from the start of the statistics range
    pub distance: f64,
    /// Meters
    pub elevation: f64,
}

/// Speed at a distance along the route
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedSample {
    /// Meters from the start of the statistics range
    pub distance: f64,
    /// Meters per second
    pub speed: f64,
}

/// Metrics of one hierarchy node, or of a merged selection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statistics {
    /// Meters
    pub distance: f64,
    /// Bounding box in (lon, lat) degrees
    pub bounds: Option<Rect<f64>>,
    pub elevation_gain: f64,
    pub elevation_loss: f64,
    pub elevation_min: Option<f64>,
    pub elevation_max: Option<f64>,
    pub elevation_profile: Vec<ProfileSample>,
    /// Seconds between the first and last timestamp of each segment
    pub total_time: f64,
    /// Seconds spent above the moving speed threshold
    pub moving_time: f64,
    pub speed: Vec<SpeedSample>,
    pub point_count: usize,
    pub waypoint_count: usize,
    pub heart_rate: Average,
    pub cadence: Average,
    pub power: Average,
    pub temperature: Average,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl Statistics {
    /// Statistics of one segment's points
    pub fn from_points(points: &[TrackPoint], moving_speed_threshold: f64) -> Self {
        let mut stats = Statistics {
            point_count: points.len(),
            ..Self::default()
        };

        let mut prev: Option<&TrackPoint> = None;
        let mut prev_elevation: Option<f64> = None;
        let mut first_time = None;
        let mut last_time = None;

        for point in points {
            if let Some(p) = prev {
                let step = p.distance_to(point);
                stats.distance += step;

                if let (Some(t0), Some(t1)) = (p.time, point.time) {
                    let dt = (t1 - t0).as_seconds_f64();
                    if dt > 0.0 {
                        let speed = step / dt;
                        stats.speed.push(SpeedSample {
                            distance: stats.distance,
                            speed,
                        });
                        if speed > moving_speed_threshold {
                            stats.moving_time += dt;
                        }
                    }
                }
            }

            if let Some(elevation) = point.elevation {
                if let Some(previous) = prev_elevation {
                    let delta = elevation - previous;
                    if delta > 0.0 {
                        stats.elevation_gain += delta;
                    } else {
                        stats.elevation_loss -= delta;
                    }
                }
                prev_elevation = Some(elevation);
                stats.elevation_min = Some(stats.elevation_min.map_or(elevation, |m| m.min(elevation)));
                stats.elevation_max = Some(stats.elevation_max.map_or(elevation, |m| m.max(elevation)));
                stats.elevation_profile.push(ProfileSample {
                    distance: stats.distance,
                    elevation,
                });
            }

            if let Some(time) = point.time {
                first_time.get_or_insert(time);
                last_time = Some(time);
            }

            let ext = &point.extensions;
            if let Some(hr) = ext.heart_rate {
                stats.heart_rate.add(f64::from(hr));
            }
            if let Some(cad) = ext.cadence {
                stats.cadence.add(f64::from(cad));
            }
            if let Some(power) = ext.power {
                stats.power.add(f64::from(power));
            }
            if let Some(temp) = ext.temperature {
                stats.temperature.add(temp);
            }

            stats.bounds = Some(union_bounds(stats.bounds, point.position.0));
            prev = Some(point);
        }

        if let (Some(first), Some(last)) = (first_time, last_time) {
            stats.total_time = (last - first).as_seconds_f64().max(0.0);
        }
        stats
    }

    /// Statistics of a group of waypoints: count and bounds only
    pub fn from_waypoints(waypoints: &[Waypoint]) -> Self {
        let mut stats = Statistics {
            waypoint_count: waypoints.len(),
            ..Self::default()
        };
        for waypoint in waypoints {
            stats.bounds = Some(union_bounds(stats.bounds, waypoint.position.0));
        }
        stats
    }

    /// Append `other` after `self`.
    ///
    /// Scalars add up, bounds and elevation extremes combine, and the series
    /// of `other` are shifted by the distance already covered.
    pub fn combine(&mut self, other: &Statistics) {
        let offset = self.distance;
        self.elevation_profile
            .extend(other.elevation_profile.iter().map(|s| ProfileSample {
                distance: s.distance + offset,
                elevation: s.elevation,
            }));
        self.speed.extend(other.speed.iter().map(|s| SpeedSample {
            distance: s.distance + offset,
            speed: s.speed,
        }));

        self.distance += other.distance;
        self.bounds = match (self.bounds, other.bounds) {
            (Some(a), Some(b)) => Some(union_rects(a, b)),
            (a, b) => a.or(b),
        };
        self.elevation_gain += other.elevation_gain;
        self.elevation_loss += other.elevation_loss;
        self.elevation_min = min_option(self.elevation_min, other.elevation_min);
        self.elevation_max = max_option(self.elevation_max, other.elevation_max);
        self.total_time += other.total_time;
        self.moving_time += other.moving_time;
        self.point_count += other.point_count;
        self.waypoint_count += other.waypoint_count;
        self.heart_rate.merge(&other.heart_rate);
        self.cadence.merge(&other.cadence);
        self.power.merge(&other.power);
        self.temperature.merge(&other.temperature);
    }

    /// Fold a sequence of statistics in order
    pub fn combine_all<'a>(parts: impl IntoIterator<Item = &'a Statistics>) -> Statistics {
        let mut total = Statistics::default();
        for part in parts {
            total.combine(part);
        }
        total
    }

    /// Meters per second over the total time
    pub fn average_speed(&self) -> Option<f64> {
        (self.total_time > 0.0).then(|| self.distance / self.total_time)
    }

    /// Meters per second over the moving time
    pub fn moving_speed(&self) -> Option<f64> {
        (self.moving_time > 0.0).then(|| self.distance / self.moving_time)
    }

    /// True when nothing contributed to these statistics
    pub fn is_empty(&self) -> bool {
        self.point_count == 0 && self.waypoint_count == 0
    }
}

fn union_bounds(bounds: Option<Rect<f64>>, coord: Coord<f64>) -> Rect<f64> {
    match bounds {
        Some(rect) => union_rects(rect, Rect::new(coord, coord)),
        None => Rect::new(coord, coord),
    }
}

fn union_rects(a: Rect<f64>, b: Rect<f64>) -> Rect<f64> {
    Rect::new(
        Coord {
            x: a.min().x.min(b.min().x),
            y: a.min().y.min(b.min().y),
        },
        Coord {
            x: a.max().x.max(b.max().x),
            y: a.max().y.max(b.max().y),
        },
    )
}

fn min_option(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, y) => x.or(y),
    }
}

fn max_option(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, y) => x.or(y),
    }
}

/// Statistics of a track and of each of its segments
#[derive(Debug, Clone, Default)]
pub struct TrackStatistics {
    pub total: Statistics,
    pub segments: Vec<Statistics>,
}

/// Statistics node tree of one document version
#[derive(Debug, Clone, Default)]
pub struct DocumentStatistics {
    /// Collection version the tree was built from
    pub version: u64,
    /// Tracks followed by the waypoint group
    pub total: Statistics,
    pub tracks: Vec<TrackStatistics>,
    /// The waypoint group
    pub waypoints: Statistics,
    pub waypoint_items: Vec<Statistics>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl DocumentStatistics {
    /// Build the whole tree from scratch
    pub fn build(document: &Document, version: u64, moving_speed_threshold: f64) -> Self {
        #[cfg(feature = "profiling")]
        profiling::scope!("statistics::build_document");

        let tracks: Vec<TrackStatistics> = document
            .tracks
            .par_iter()
            .map(|track| {
                let segments: Vec<Statistics> = track
                    .segments
                    .iter()
                    .map(|s| Statistics::from_points(s.points(), moving_speed_threshold))
                    .collect();
                TrackStatistics {
                    total: Statistics::combine_all(&segments),
                    segments,
                }
            })
            .collect();

        let waypoint_items: Vec<Statistics> = document
            .waypoints
            .iter()
            .map(|w| Statistics::from_waypoints(std::slice::from_ref(w)))
            .collect();
        let waypoints = Statistics::from_waypoints(&document.waypoints);

        let mut total = Statistics::combine_all(tracks.iter().map(|t| &t.total));
        total.combine(&waypoints);

        Self {
            version,
            total,
            tracks,
            waypoints,
            waypoint_items,
        }
    }

    /// Cached node for `item`, if it resolves inside this tree
    pub fn node(&self, item: &ItemRef) -> Option<&Statistics> {
        match *item {
            ItemRef::Document(_) => Some(&self.total),
            ItemRef::Track { track, .. } => self.tracks.get(track).map(|t| &t.total),
            ItemRef::Segment { track, segment, .. } => {
                self.tracks.get(track)?.segments.get(segment)
            }
            ItemRef::Waypoints(_) => Some(&self.waypoints),
            ItemRef::Waypoint { waypoint, .. } => self.waypoint_items.get(waypoint),
        }
    }
}

/// Latest statistics tree per document
#[derive(Debug)]
pub struct StatisticsTree {
    nodes: DashMap<DocumentId, Arc<DocumentStatistics>>,
    /// Version at which a document was last seen removed
    removed: DashMap<DocumentId, u64>,
    moving_speed_threshold: f64,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl StatisticsTree {
    pub fn new(moving_speed_threshold: f64) -> Self {
        Self {
            nodes: DashMap::new(),
            removed: DashMap::new(),
            moving_speed_threshold,
        }
    }

    /// Cached tree of a document
    pub fn document(&self, id: DocumentId) -> Option<Arc<DocumentStatistics>> {
        self.nodes.get(&id).map(|n| n.clone())
    }

    /// Cached statistics of one node, or zero statistics if it does not resolve
    pub fn statistics_for(&self, item: &ItemRef) -> Statistics {
        self.nodes
            .get(&item.document())
            .and_then(|tree| tree.node(item).cloned())
            .unwrap_or_default()
    }

    /// Merge the statistics of several references.
    ///
    /// References are put in canonical order first (documents as in
    /// `document_order`, then by level and index). Exact duplicates and
    /// references whose ancestor is also present are dropped. Within a
    /// document, only the first waypoint-group reference contributes the
    /// group totals, and single waypoints of a group already counted are
    /// skipped.
    pub fn merge(&self, items: &[ItemRef], document_order: &[DocumentId]) -> Statistics {
        let position: HashMap<DocumentId, usize> = document_order
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();

        let mut refs = items.to_vec();
        refs.sort_by_key(|item| {
            (
                position.get(&item.document()).copied().unwrap_or(usize::MAX),
                item.document(),
                item.sort_key(),
            )
        });
        refs.dedup();
        let present: HashSet<ItemRef> = refs.iter().copied().collect();
        refs.retain(|item| !item.ancestors().any(|a| present.contains(&a)));

        let mut counted_groups: HashSet<DocumentId> = HashSet::new();
        let mut merged = Statistics::default();
        for item in &refs {
            match *item {
                ItemRef::Waypoints(document) => {
                    if !counted_groups.insert(document) {
                        continue;
                    }
                }
                ItemRef::Waypoint { document, .. } if counted_groups.contains(&document) => {
                    continue;
                }
                _ => {}
            }
            merged.combine(&self.statistics_for(item));
        }
        merged
    }

    /// Rebuild the trees of `documents` from `collection`.
    ///
    /// Trees of documents absent from the collection are dropped. A tree is
    /// only replaced by one built from a newer version, and never installed
    /// for a document removed at a newer version.
    pub fn rebuild(&self, documents: &BTreeSet<DocumentId>, collection: &DocumentCollection) {
        #[cfg(feature = "profiling")]
        profiling::scope!("statistics::rebuild");

        let version = collection.version();
        let present: Vec<Arc<Document>> = documents
            .iter()
            .filter_map(|id| match collection.get(*id) {
                Some(doc) => Some(doc.clone()),
                None => {
                    self.nodes
                        .remove_if(id, |_, tree| tree.version <= version);
                    self.removed
                        .entry(*id)
                        .and_modify(|v| *v = (*v).max(version))
                        .or_insert(version);
                    None
                }
            })
            .collect();

        let built: Vec<(DocumentId, DocumentStatistics)> = present
            .par_iter()
            .map(|doc| {
                (
                    doc.id(),
                    DocumentStatistics::build(doc, version, self.moving_speed_threshold),
                )
            })
            .collect();

        for (id, tree) in built {
            if self
                .removed
                .get(&id)
                .is_some_and(|removed_at| *removed_at >= tree.version)
            {
                continue;
            }
            self.removed
                .remove_if(&id, |_, removed_at| *removed_at < tree.version);
            match self.nodes.entry(id) {
                Entry::Occupied(mut entry) => {
                    if entry.get().version <= tree.version {
                        entry.insert(Arc::new(tree));
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(Arc::new(tree));
                }
            }
        }
        tracing::debug!(
            "Rebuilt statistics of {} documents at version {}",
            documents.len(),
            version
        );
    }

    /// Build the trees of documents of `collection` that have none yet
    pub fn ensure(
        &self,
        documents: impl IntoIterator<Item = DocumentId>,
        collection: &DocumentCollection,
    ) {
        let missing: BTreeSet<DocumentId> = documents
            .into_iter()
            .filter(|id| collection.contains(*id) && !self.nodes.contains_key(id))
            .collect();
        if !missing.is_empty() {
            self.rebuild(&missing, collection);
        }
    }

    /// Rebuild every document of `collection` and forget all others
    pub fn rebuild_all(&self, collection: &DocumentCollection) {
        self.nodes.retain(|id, _| collection.contains(*id));
        let ids: BTreeSet<DocumentId> = collection.order().iter().copied().collect();
        self.rebuild(&ids, collection);
    }

    pub fn clear(&self) {
        self.nodes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{PointExtensions, Segment, Track};
    use time::OffsetDateTime;

    fn point(lat: f64, ele: f64, secs: i64) -> TrackPoint {
        let mut p = TrackPoint::new(lat, 7.0)
            .with_elevation(ele)
            .with_time(OffsetDateTime::from_unix_timestamp(1_700_000_000 + secs).unwrap());
        p.extensions = PointExtensions {
            heart_rate: Some(120),
            ..PointExtensions::default()
        };
        p
    }

    fn create_test_document(id: u64) -> Document {
        let mut doc = Document::new(DocumentId(id), "stats");
        let base = 45.0 + id as f64;
        // ~111 m per step, 60 s per step
        let climb = Segment::new(vec![
            point(base, 100.0, 0),
            point(base + 0.001, 110.0, 60),
            point(base + 0.002, 105.0, 120),
        ]);
        let flat = Segment::new(vec![point(base + 0.003, 105.0, 600), point(base + 0.004, 105.0, 660)]);
        doc.tracks.push(Track::new(vec![climb, flat]));
        doc.tracks.push(Track::new(vec![Segment::new(vec![
            point(base + 0.01, 50.0, 1000),
            point(base + 0.011, 60.0, 1030),
        ])]));
        doc.waypoints.push(Waypoint::new(base - 0.5, 6.0));
        doc.waypoints.push(Waypoint::new(base + 0.5, 8.0));
        doc
    }

    fn create_test_tree(ids: &[u64]) -> (StatisticsTree, DocumentCollection) {
        let collection =
            DocumentCollection::from_documents(ids.iter().map(|id| create_test_document(*id)))
                .unwrap();
        let tree = StatisticsTree::new(0.5);
        tree.rebuild_all(&collection);
        (tree, collection)
    }

    fn assert_close(a: &Statistics, b: &Statistics) {
        let eps = 1e-6;
        assert!((a.distance - b.distance).abs() < eps, "{} vs {}", a.distance, b.distance);
        assert_eq!(a.bounds, b.bounds);
        assert!((a.elevation_gain - b.elevation_gain).abs() < eps);
        assert!((a.elevation_loss - b.elevation_loss).abs() < eps);
        assert!((a.total_time - b.total_time).abs() < eps);
        assert!((a.moving_time - b.moving_time).abs() < eps);
        assert_eq!(a.point_count, b.point_count);
        assert_eq!(a.waypoint_count, b.waypoint_count);
        assert_eq!(a.heart_rate, b.heart_rate);
        assert_eq!(a.elevation_profile.len(), b.elevation_profile.len());
        for (x, y) in a.elevation_profile.iter().zip(&b.elevation_profile) {
            assert!((x.distance - y.distance).abs() < eps);
            assert_eq!(x.elevation, y.elevation);
        }
        assert_eq!(a.speed.len(), b.speed.len());
        for (x, y) in a.speed.iter().zip(&b.speed) {
            assert!((x.distance - y.distance).abs() < eps);
            assert!((x.speed - y.speed).abs() < eps);
        }
    }

    #[test]
    fn test_segment_statistics() {
        let doc = create_test_document(0);
        let stats = Statistics::from_points(doc.segment(0, 0).unwrap().points(), 0.5);

        assert_eq!(stats.point_count, 3);
        assert!(stats.distance > 220.0 && stats.distance < 225.0, "{}", stats.distance);
        assert_eq!(stats.elevation_gain, 10.0);
        assert_eq!(stats.elevation_loss, 5.0);
        assert_eq!(stats.elevation_min, Some(100.0));
        assert_eq!(stats.elevation_max, Some(110.0));
        assert_eq!(stats.total_time, 120.0);
        assert_eq!(stats.moving_time, 120.0);
        assert_eq!(stats.elevation_profile.len(), 3);
        assert_eq!(stats.speed.len(), 2);
        assert_eq!(stats.heart_rate.value(), Some(120.0));
        assert!(stats.average_speed().unwrap() > 1.8);
    }

    #[test]
    fn test_empty_and_untimed_segments() {
        let empty = Statistics::from_points(&[], 0.5);
        assert!(empty.is_empty());
        assert_eq!(empty.bounds, None);

        let untimed = Statistics::from_points(
            &[TrackPoint::new(0.0, 0.0), TrackPoint::new(0.001, 0.0)],
            0.5,
        );
        assert_eq!(untimed.total_time, 0.0);
        assert!(untimed.speed.is_empty());
        assert_eq!(untimed.average_speed(), None);
        assert!(untimed.elevation_profile.is_empty());
    }

    #[test]
    fn test_series_offset_on_combine() {
        let doc = create_test_document(0);
        let tree = DocumentStatistics::build(&doc, 0, 0.5);
        let track = &tree.tracks[0];
        let first_len = track.segments[0].distance;
        let second_profile_start = track.total.elevation_profile[3].distance;
        assert!((second_profile_start - first_len).abs() < 1e-9);
        // Series stay monotonic
        for pair in track.total.elevation_profile.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
    }

    #[test]
    fn test_node_lookup_and_stale_references() {
        let (tree, _) = create_test_tree(&[0]);
        let doc = DocumentId(0);

        let document = tree.statistics_for(&ItemRef::Document(doc));
        assert_eq!(document.point_count, 7);
        assert_eq!(document.waypoint_count, 2);
        assert_eq!(tree.statistics_for(&ItemRef::track(doc, 1)).point_count, 2);
        assert_eq!(tree.statistics_for(&ItemRef::segment(doc, 0, 1)).point_count, 2);
        assert_eq!(tree.statistics_for(&ItemRef::waypoint(doc, 1)).waypoint_count, 1);

        assert_eq!(tree.statistics_for(&ItemRef::track(doc, 5)), Statistics::default());
        assert_eq!(
            tree.statistics_for(&ItemRef::Document(DocumentId(9))),
            Statistics::default()
        );
    }

    #[test]
    fn test_merge_is_commutative() {
        let (tree, collection) = create_test_tree(&[0, 1]);
        let a = ItemRef::track(DocumentId(0), 0);
        let b = ItemRef::segment(DocumentId(1), 1, 0);
        let ab = tree.merge(&[a, b], collection.order());
        let ba = tree.merge(&[b, a], collection.order());
        assert_eq!(ab, ba);
        assert_eq!(ab.point_count, 7);
    }

    #[test]
    fn test_merge_is_associative() {
        let (tree, collection) = create_test_tree(&[0, 1]);
        let parts = [
            tree.statistics_for(&ItemRef::track(DocumentId(0), 0)),
            tree.statistics_for(&ItemRef::track(DocumentId(0), 1)),
            tree.statistics_for(&ItemRef::Document(DocumentId(1))),
        ];

        let mut left = parts[0].clone();
        left.combine(&parts[1]);
        left.combine(&parts[2]);

        let mut right_tail = parts[1].clone();
        right_tail.combine(&parts[2]);
        let mut right = parts[0].clone();
        right.combine(&right_tail);

        assert_close(&left, &right);

        let merged = tree.merge(
            &[
                ItemRef::track(DocumentId(0), 0),
                ItemRef::track(DocumentId(0), 1),
                ItemRef::Document(DocumentId(1)),
            ],
            collection.order(),
        );
        assert_close(&merged, &left);
    }

    #[test]
    fn test_merge_of_all_tracks_matches_document_without_waypoints() {
        let (tree, collection) = create_test_tree(&[0]);
        let doc = DocumentId(0);
        let tracks = tree.merge(
            &[ItemRef::track(doc, 0), ItemRef::track(doc, 1)],
            collection.order(),
        );
        let mut document = tree.statistics_for(&ItemRef::Document(doc));
        assert_eq!(tracks.point_count, document.point_count);
        assert!((tracks.distance - document.distance).abs() < 1e-9);
        document.waypoint_count = 0;
        assert_eq!(tracks.waypoint_count, document.waypoint_count);
    }

    #[test]
    fn test_merge_drops_duplicates_and_covered_references() {
        let (tree, collection) = create_test_tree(&[0]);
        let doc = DocumentId(0);
        let whole = tree.statistics_for(&ItemRef::Document(doc));
        let merged = tree.merge(
            &[
                ItemRef::Document(doc),
                ItemRef::track(doc, 0),
                ItemRef::Document(doc),
            ],
            collection.order(),
        );
        assert_close(&merged, &whole);
    }

    #[test]
    fn test_waypoint_group_counted_once() {
        let (tree, collection) = create_test_tree(&[0]);
        let doc = DocumentId(0);
        let merged = tree.merge(
            &[
                ItemRef::waypoint(doc, 0),
                ItemRef::Waypoints(doc),
                ItemRef::Waypoints(doc),
            ],
            collection.order(),
        );
        assert_eq!(merged.waypoint_count, 2);

        let single = tree.merge(&[ItemRef::waypoint(doc, 1)], collection.order());
        assert_eq!(single.waypoint_count, 1);
    }

    #[test]
    fn test_rebuild_only_touches_given_documents() {
        let (tree, collection) = create_test_tree(&[0, 1]);
        let untouched = tree.document(DocumentId(1)).unwrap();

        let mut draft = collection.draft();
        draft.get_mut(DocumentId(0)).unwrap().tracks.pop();
        let next = draft.finish(1);
        tree.rebuild(&BTreeSet::from([DocumentId(0)]), &next);

        assert_eq!(tree.statistics_for(&ItemRef::Document(DocumentId(0))).point_count, 5);
        assert!(Arc::ptr_eq(&untouched, &tree.document(DocumentId(1)).unwrap()));
    }

    #[test]
    fn test_older_rebuild_does_not_replace_newer_tree() {
        let (tree, collection) = create_test_tree(&[0]);
        let mut draft = collection.draft();
        draft.get_mut(DocumentId(0)).unwrap().tracks.pop();
        let newer = draft.finish(5);
        tree.rebuild(&BTreeSet::from([DocumentId(0)]), &newer);
        tree.rebuild(&BTreeSet::from([DocumentId(0)]), &collection);
        assert_eq!(tree.document(DocumentId(0)).unwrap().version, 5);
    }

    #[test]
    fn test_removed_document_is_forgotten() {
        let (tree, collection) = create_test_tree(&[0, 1]);
        let mut draft = collection.draft();
        draft.remove(DocumentId(1));
        let next = draft.finish(1);
        tree.rebuild(&BTreeSet::from([DocumentId(1)]), &next);
        assert!(tree.document(DocumentId(1)).is_none());
    }

    #[test]
    fn test_late_rebuild_does_not_restore_removed_document() {
        let (tree, collection) = create_test_tree(&[0, 1]);
        let mut draft = collection.draft();
        draft.remove(DocumentId(1));
        let removed = draft.finish(3);
        tree.rebuild(&BTreeSet::from([DocumentId(1)]), &removed);

        // A rebuild of an older version finishing after the removal
        let stale = collection.clone().with_version(2);
        tree.rebuild(&BTreeSet::from([DocumentId(1)]), &stale);
        assert!(tree.document(DocumentId(1)).is_none());

        // The document coming back at a newer version is tracked again
        let restored = collection.clone().with_version(4);
        tree.rebuild(&BTreeSet::from([DocumentId(1)]), &restored);
        assert_eq!(tree.document(DocumentId(1)).unwrap().version, 4);
    }

    #[test]
    fn test_ensure_builds_only_missing_trees() {
        let (tree, collection) = create_test_tree(&[0, 1]);
        let kept = tree.document(DocumentId(0)).unwrap();
        tree.clear();
        tree.ensure([DocumentId(1), DocumentId(7)], &collection);
        assert!(tree.document(DocumentId(0)).is_none());
        assert_eq!(tree.statistics_for(&ItemRef::Document(DocumentId(1))).point_count, 7);
        assert!(tree.document(DocumentId(7)).is_none());

        tree.ensure(collection.order().iter().copied(), &collection);
        let rebuilt = tree.document(DocumentId(0)).unwrap();
        assert!(!Arc::ptr_eq(&kept, &rebuilt));
        assert_eq!(rebuilt.total.point_count, kept.total.point_count);
    }
}
