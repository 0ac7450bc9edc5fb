//! Conversion of parsed GPX data into documents
//!
//! Parsing stays with the caller (`gpx::read`); this only maps the parsed
//! structure onto the document model. GPX routes become single-segment tracks.

use crate::document::{Document, DocumentId, DocumentMetadata, Segment, Track, TrackPoint, Waypoint};
use time::OffsetDateTime;

/// Build a document from parsed GPX data
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn document_from_gpx(id: DocumentId, gpx_data: gpx::Gpx, fallback_name: &str) -> Document {
    let (name, description) = match gpx_data.metadata {
        Some(meta) => (meta.name, meta.description),
        None => (None, None),
    };
    let mut document = Document::new(id, name.unwrap_or_else(|| fallback_name.to_string()));
    document.metadata = DocumentMetadata {
        description,
        ..document.metadata
    };

    for track in gpx_data.tracks {
        document.tracks.push(Track {
            name: track.name,
            description: track.description,
            segments: track
                .segments
                .into_iter()
                .map(|segment| Segment::new(segment.points.into_iter().map(track_point).collect()))
                .collect(),
        });
    }

    for route in gpx_data.routes {
        document.tracks.push(Track {
            name: route.name,
            description: route.description,
            segments: vec![Segment::new(
                route.points.into_iter().map(track_point).collect(),
            )],
        });
    }

    document.waypoints = gpx_data
        .waypoints
        .into_iter()
        .map(|wpt| Waypoint {
            position: wpt.point(),
            elevation: wpt.elevation,
            time: wpt.time.map(OffsetDateTime::from),
            name: wpt.name,
            description: wpt.description,
            symbol: wpt.symbol,
        })
        .collect();

    tracing::debug!(
        "Imported {} with {} tracks, {} points and {} waypoints",
        id,
        document.tracks.len(),
        document.total_points(),
        document.waypoints.len()
    );
    document
}

fn track_point(wpt: gpx::Waypoint) -> TrackPoint {
    TrackPoint {
        position: wpt.point(),
        elevation: wpt.elevation,
        time: wpt.time.map(OffsetDateTime::from),
        extensions: Default::default(),
    }
}
