//! Statistics, selection and simplification queries through the editor context

use std::sync::Arc;
use std::time::{Duration, Instant};

use geo::Coord;
use time::OffsetDateTime;
use track_edit_lib::{
    Config, Document, DocumentId, EditorContext, ItemRef, MemoryStore, Segment, SimplifyConfig,
    Statistics, Track, TrackPoint, Waypoint, build_tags,
};

fn create_test_document(id: u64) -> Document {
    let start = OffsetDateTime::from_unix_timestamp(1_600_000_000).unwrap();
    let mut doc = Document::new(DocumentId(id), format!("ride {id}"));
    for t in 0..3 {
        let segments = (0..2)
            .map(|s| {
                let points = (0..8)
                    .map(|i| {
                        let step = (t * 16 + s * 8 + i) as i64;
                        TrackPoint::new(44.0 + id as f64 * 0.1 + step as f64 * 0.0005, 6.0)
                            .with_elevation(200.0 + (step % 5) as f64 * 3.0)
                            .with_time(start + time::Duration::seconds(step * 20))
                    })
                    .collect();
                Segment::new(points)
            })
            .collect();
        doc.tracks.push(Track::new(segments));
    }
    doc.waypoints.push(Waypoint::new(44.0, 6.0));
    doc.waypoints.push(Waypoint::new(44.2, 6.2));
    doc.waypoints.push(Waypoint::new(44.4, 6.4));
    doc
}

fn create_test_context() -> EditorContext {
    let ctx = EditorContext::in_memory(Config::default());
    for id in 0..3 {
        ctx.insert_document(create_test_document(id)).unwrap();
    }
    ctx
}

fn assert_statistics_close(a: &Statistics, b: &Statistics) {
    let eps = 1e-6;
    assert!((a.distance - b.distance).abs() < eps);
    assert!((a.elevation_gain - b.elevation_gain).abs() < eps);
    assert!((a.elevation_loss - b.elevation_loss).abs() < eps);
    assert!((a.total_time - b.total_time).abs() < eps);
    assert_eq!(a.bounds, b.bounds);
    assert_eq!(a.point_count, b.point_count);
    assert_eq!(a.waypoint_count, b.waypoint_count);
    assert_eq!(a.elevation_profile.len(), b.elevation_profile.len());
    assert_eq!(a.speed.len(), b.speed.len());
}

#[test]
fn test_merge_is_commutative_for_disjoint_references() {
    let ctx = create_test_context();
    let a = ItemRef::track(DocumentId(0), 2);
    let b = ItemRef::segment(DocumentId(2), 0, 1);
    let c = ItemRef::waypoint(DocumentId(1), 2);

    assert_eq!(ctx.merge_selection(&[a, b]), ctx.merge_selection(&[b, a]));
    assert_eq!(ctx.merge_selection(&[a, b, c]), ctx.merge_selection(&[c, a, b]));
}

#[test]
fn test_merge_is_associative_under_any_split() {
    let ctx = create_test_context();
    let refs = [
        ItemRef::track(DocumentId(0), 0),
        ItemRef::track(DocumentId(0), 1),
        ItemRef::segment(DocumentId(1), 2, 0),
        ItemRef::Document(DocumentId(2)),
    ];
    let whole = ctx.merge_selection(&refs);

    for split in 1..refs.len() {
        let mut combined = ctx.merge_selection(&refs[..split]);
        combined.combine(&ctx.merge_selection(&refs[split..]));
        assert_statistics_close(&combined, &whole);
    }
    assert_eq!(whole.point_count, 16 + 16 + 8 + 48);
    assert_eq!(whole.waypoint_count, 3);
}

#[test]
fn test_document_statistics_match_merged_children() {
    let ctx = create_test_context();
    let doc = DocumentId(1);
    let document = ctx.statistics_for(&ItemRef::Document(doc));
    let children = ctx.merge_selection(&[
        ItemRef::track(doc, 0),
        ItemRef::track(doc, 1),
        ItemRef::track(doc, 2),
        ItemRef::Waypoints(doc),
    ]);
    assert_statistics_close(&document, &children);
    assert_eq!(document.total_time, 6.0 * 7.0 * 20.0);
    assert!(document.average_speed().is_some());
}

#[test]
fn test_stale_references_fail_soft() {
    let ctx = create_test_context();
    let stale = ItemRef::segment(DocumentId(0), 2, 1);
    assert_eq!(ctx.statistics_for(&stale).point_count, 8);

    ctx.apply_to_documents(&[DocumentId(0)], |draft| {
        draft.get_mut(DocumentId(0)).unwrap().tracks.truncate(1);
        Ok(())
    })
    .unwrap();

    assert_eq!(ctx.statistics_for(&stale), Statistics::default());
    assert!(ctx.points_above_tolerance(&stale, 0.0).is_empty());
    assert!(ctx.anchors_at_or_below(&stale, 22).is_empty());
    let merged = ctx.merge_selection(&[stale, ItemRef::track(DocumentId(0), 0)]);
    assert_eq!(merged.point_count, 16);
}

#[test]
fn test_track_selection_covers_current_segments() {
    let ctx = create_test_context();
    let track = ItemRef::track(DocumentId(1), 1);
    ctx.select(&track);

    for s in 0..2 {
        let segment = ItemRef::segment(DocumentId(1), 1, s);
        assert!(ctx.has_selected_ancestor(&segment));
        assert!(!ctx.is_selected(&segment));
    }
    assert!(ctx.has_selected_descendant(&ItemRef::Document(DocumentId(1))));

    // Segments added later are covered as well
    ctx.apply_to_documents(&[DocumentId(1)], |draft| {
        let doc = draft.get_mut(DocumentId(1)).unwrap();
        doc.tracks[1].segments.push(Segment::new(vec![TrackPoint::new(0.0, 0.0)]));
        Ok(())
    })
    .unwrap();
    assert!(ctx.has_selected_ancestor(&ItemRef::segment(DocumentId(1), 1, 2)));

    let stats = ctx.selection_statistics();
    assert_eq!(stats.point_count, 17);
}

#[test]
fn test_deselecting_track_keeps_explicit_segment() {
    let ctx = create_test_context();
    let segment = ItemRef::segment(DocumentId(0), 0, 1);
    let track = ItemRef::track(DocumentId(0), 0);
    ctx.add_select(&segment);
    ctx.add_select(&track);
    ctx.deselect(&track);

    assert!(ctx.is_selected(&segment));
    assert!(!ctx.has_selected_ancestor(&segment));
    assert_eq!(ctx.ordered_selection(false), vec![segment]);
}

#[test]
fn test_simplification_tolerance_extremes() {
    let ctx = create_test_context();
    let segment = ItemRef::segment(DocumentId(2), 1, 0);
    assert_eq!(ctx.points_above_tolerance(&segment, 0.0).len(), 8);
    assert_eq!(ctx.points_above_tolerance(&segment, f64::INFINITY), vec![0, 7]);

    let coarse = ctx.anchors_at_or_below(&segment, 0);
    assert_eq!(coarse.iter().map(|a| a.index).collect::<Vec<_>>(), vec![0, 7]);
    assert!(coarse.iter().all(|a| a.tag.level == Some(0)));
}

#[test]
fn test_outlier_scenario() {
    // Five collinear points and one outlier 200 units off the line
    let coords: Vec<Coord<f64>> = [
        (0.0, 0.0),
        (100.0, 0.0),
        (200.0, 0.0),
        (1000.0, 200.0),
        (1900.0, 0.0),
        (2000.0, 0.0),
    ]
    .into_iter()
    .map(|(x, y)| Coord { x, y })
    .collect();
    let scale = |distance: f64| -> u32 { if distance > 500.0 { 1 } else { 2 } };
    let tags = build_tags(&coords, &SimplifyConfig::default(), &scale);

    let above = |tolerance: f64| -> Vec<usize> {
        tags.iter()
            .enumerate()
            .filter(|(_, t)| t.distance >= tolerance)
            .map(|(i, _)| i)
            .collect()
    };
    assert_eq!(above(100.0), vec![0, 3, 5]);
    assert_eq!(above(300.0), vec![0, 5]);
    assert_eq!(tags[0].level, Some(0));
    assert_eq!(tags[5].level, Some(0));
    assert_eq!(tags[3].level, Some(2));
}

#[test]
fn test_custom_resolution_scale() {
    let scale = Arc::new(|_: f64| 5u32);
    let ctx =
        EditorContext::open_with_scale(Arc::new(MemoryStore::new()), Config::default(), scale)
            .unwrap();
    let mut doc = Document::new(DocumentId(0), "zigzag");
    doc.tracks.push(Track::new(vec![Segment::new(
        (0..30)
            .map(|i| TrackPoint::new(45.0 + i as f64 * 0.001, if i % 2 == 0 { 7.0 } else { 7.03 }))
            .collect(),
    )]));
    ctx.insert_document(doc).unwrap();

    let segment = ItemRef::segment(DocumentId(0), 0, 0);
    assert_eq!(ctx.anchors_at_or_below(&segment, 4).len(), 2);
    assert!(ctx.anchors_at_or_below(&segment, 5).len() > 2);
}

#[test]
fn test_background_rebuild_eventually_refreshes_statistics() {
    let config = Config {
        background_rebuild: true,
        ..Config::default()
    };
    let ctx = EditorContext::in_memory(config);
    ctx.insert_document(create_test_document(0)).unwrap();

    let item = ItemRef::Document(DocumentId(0));
    let deadline = Instant::now() + Duration::from_secs(10);
    while ctx.statistics_for(&item).point_count != 48 {
        assert!(Instant::now() < deadline, "statistics were never rebuilt");
        std::thread::sleep(Duration::from_millis(5));
    }
}
