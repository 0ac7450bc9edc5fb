//! Structural patches between collection versions
//!
//! A patch is an ordered list of set/remove operations addressed by path.
//! The first path component is always the affected document id (except for
//! the collection-level document order), so the set of changed documents can
//! be read off a patch without comparing full states.
//!
//! [`diff`] derives the forward patch and its exact inverse in one pass over
//! two versions, skipping every subtree the versions still share.

use crate::collection::DocumentCollection;
use crate::document::{Document, DocumentId, DocumentMetadata, Segment, Track, Waypoint};
use crate::{EditError, Result};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Address of a patchable node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchPath {
    Document(DocumentId),
    Metadata(DocumentId),
    Track {
        document: DocumentId,
        index: usize,
    },
    Segment {
        document: DocumentId,
        track: usize,
        index: usize,
    },
    Waypoint {
        document: DocumentId,
        index: usize,
    },
    /// Display order of the documents
    Order,
}

impl PatchPath {
    /// The document named by the first path component
    pub fn document(&self) -> Option<DocumentId> {
        match *self {
            Self::Document(document)
            | Self::Metadata(document)
            | Self::Track { document, .. }
            | Self::Segment { document, .. }
            | Self::Waypoint { document, .. } => Some(document),
            Self::Order => None,
        }
    }
}

impl fmt::Display for PatchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Document(d) => write!(f, "/{}", d.0),
            Self::Metadata(d) => write!(f, "/{}/metadata", d.0),
            Self::Track { document, index } => write!(f, "/{}/tracks/{index}", document.0),
            Self::Segment {
                document,
                track,
                index,
            } => write!(f, "/{}/tracks/{track}/segments/{index}", document.0),
            Self::Waypoint { document, index } => {
                write!(f, "/{}/waypoints/{index}", document.0)
            }
            Self::Order => write!(f, "/order"),
        }
    }
}

/// Value stored by a set operation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PatchValue {
    Document(Arc<Document>),
    Metadata(DocumentMetadata),
    Track(Track),
    Segment(Segment),
    Waypoint(Waypoint),
    Order(Vec<DocumentId>),
}

/// Primitive patch operation
///
/// Setting a list element at index `len` appends to the list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PatchOp {
    Set { path: PatchPath, value: PatchValue },
    Remove { path: PatchPath },
}

impl PatchOp {
    pub fn path(&self) -> &PatchPath {
        match self {
            Self::Set { path, .. } | Self::Remove { path } => path,
        }
    }
}

/// Ordered list of patch operations
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch {
    ops: Vec<PatchOp>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl Patch {
    pub fn new(ops: Vec<PatchOp>) -> Self {
        Self { ops }
    }

    #[inline]
    pub fn ops(&self) -> &[PatchOp] {
        &self.ops
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Documents touched by this patch
    pub fn affected_documents(&self) -> BTreeSet<DocumentId> {
        self.ops.iter().filter_map(|op| op.path().document()).collect()
    }

    /// Apply the patch to `base`, producing a new collection.
    ///
    /// The version number is left unchanged; the caller assigns it.
    pub fn apply(&self, base: &DocumentCollection) -> Result<DocumentCollection> {
        let mut next = base.clone();
        for op in &self.ops {
            apply_op(&mut next, op)?;
        }
        Ok(next)
    }
}

fn apply_op(collection: &mut DocumentCollection, op: &PatchOp) -> Result<()> {
    match op {
        PatchOp::Set {
            path: PatchPath::Order,
            value: PatchValue::Order(order),
        } => {
            let mut sorted = order.clone();
            sorted.sort();
            sorted.dedup();
            if sorted.len() != order.len()
                || !sorted.iter().copied().eq(collection.documents.keys().copied())
            {
                return Err(EditError::PatchMismatch(
                    "document order is not a permutation of the documents".to_string(),
                ));
            }
            collection.order = order.clone();
        }
        PatchOp::Set {
            path: PatchPath::Document(id),
            value: PatchValue::Document(document),
        } => {
            if document.id() != *id {
                return Err(EditError::PatchMismatch(format!(
                    "document {} stored at {}",
                    document.id(),
                    op.path()
                )));
            }
            if collection.documents.insert(*id, document.clone()).is_none() {
                collection.order.push(*id);
            }
            collection.reserve_id(*id);
        }
        PatchOp::Remove {
            path: PatchPath::Document(id),
        } => {
            if collection.documents.remove(id).is_none() {
                return Err(missing(op.path()));
            }
            collection.order.retain(|d| d != id);
        }
        PatchOp::Set {
            path: PatchPath::Metadata(id),
            value: PatchValue::Metadata(metadata),
        } => {
            document_mut(collection, *id, op.path())?.metadata = metadata.clone();
        }
        PatchOp::Set {
            path: PatchPath::Track { document, index },
            value: PatchValue::Track(track),
        } => {
            let doc = document_mut(collection, *document, op.path())?;
            set_element(&mut doc.tracks, *index, track.clone(), op.path())?;
        }
        PatchOp::Remove {
            path: PatchPath::Track { document, index },
        } => {
            let doc = document_mut(collection, *document, op.path())?;
            remove_element(&mut doc.tracks, *index, op.path())?;
        }
        PatchOp::Set {
            path:
                PatchPath::Segment {
                    document,
                    track,
                    index,
                },
            value: PatchValue::Segment(segment),
        } => {
            let doc = document_mut(collection, *document, op.path())?;
            let track = doc.tracks.get_mut(*track).ok_or_else(|| missing(op.path()))?;
            set_element(&mut track.segments, *index, segment.clone(), op.path())?;
        }
        PatchOp::Remove {
            path:
                PatchPath::Segment {
                    document,
                    track,
                    index,
                },
        } => {
            let doc = document_mut(collection, *document, op.path())?;
            let track = doc.tracks.get_mut(*track).ok_or_else(|| missing(op.path()))?;
            remove_element(&mut track.segments, *index, op.path())?;
        }
        PatchOp::Set {
            path: PatchPath::Waypoint { document, index },
            value: PatchValue::Waypoint(waypoint),
        } => {
            let doc = document_mut(collection, *document, op.path())?;
            set_element(&mut doc.waypoints, *index, waypoint.clone(), op.path())?;
        }
        PatchOp::Remove {
            path: PatchPath::Waypoint { document, index },
        } => {
            let doc = document_mut(collection, *document, op.path())?;
            remove_element(&mut doc.waypoints, *index, op.path())?;
        }
        _ => {
            return Err(EditError::PatchMismatch(format!(
                "operation does not fit path {}",
                op.path()
            )));
        }
    }
    Ok(())
}

fn missing(path: &PatchPath) -> EditError {
    EditError::PatchMismatch(format!("nothing at {path}"))
}

fn document_mut<'a>(
    collection: &'a mut DocumentCollection,
    id: DocumentId,
    path: &PatchPath,
) -> Result<&'a mut Document> {
    collection
        .documents
        .get_mut(&id)
        .map(Arc::make_mut)
        .ok_or_else(|| missing(path))
}

fn set_element<T>(list: &mut Vec<T>, index: usize, value: T, path: &PatchPath) -> Result<()> {
    match index.cmp(&list.len()) {
        std::cmp::Ordering::Less => list[index] = value,
        std::cmp::Ordering::Equal => list.push(value),
        std::cmp::Ordering::Greater => {
            return Err(EditError::IndexViolation {
                path: path.to_string(),
                len: list.len(),
            });
        }
    }
    Ok(())
}

fn remove_element<T>(list: &mut Vec<T>, index: usize, path: &PatchPath) -> Result<()> {
    if index >= list.len() {
        return Err(EditError::IndexViolation {
            path: path.to_string(),
            len: list.len(),
        });
    }
    list.remove(index);
    Ok(())
}

/// Forward ops are kept in application order. Inverse ops are collected in
/// the same order and reversed at the end, so index-dependent removals and
/// appends replay correctly.
#[derive(Default)]
struct PatchBuilder {
    forward: Vec<PatchOp>,
    inverse: Vec<PatchOp>,
}

impl PatchBuilder {
    fn push(&mut self, forward: PatchOp, inverse: PatchOp) {
        self.forward.push(forward);
        self.inverse.push(inverse);
    }

    fn set(&mut self, path: PatchPath, new: PatchValue, old: PatchValue) {
        self.push(
            PatchOp::Set { path, value: new },
            PatchOp::Set { path, value: old },
        );
    }
}

/// Compute the forward patch from `base` to `next` and its exact inverse
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn diff(base: &DocumentCollection, next: &DocumentCollection) -> (Patch, Patch) {
    let mut builder = PatchBuilder::default();

    for id in base.order() {
        if !next.contains(*id)
            && let Some(old) = base.get(*id)
        {
            builder.push(
                PatchOp::Remove {
                    path: PatchPath::Document(*id),
                },
                PatchOp::Set {
                    path: PatchPath::Document(*id),
                    value: PatchValue::Document(old.clone()),
                },
            );
        }
    }

    for new in next.iter() {
        match base.get(new.id()) {
            None => builder.push(
                PatchOp::Set {
                    path: PatchPath::Document(new.id()),
                    value: PatchValue::Document(new.clone()),
                },
                PatchOp::Remove {
                    path: PatchPath::Document(new.id()),
                },
            ),
            Some(old) if !Arc::ptr_eq(old, new) && old != new => {
                diff_document(old, new, &mut builder);
            }
            Some(_) => {}
        }
    }

    let PatchBuilder {
        mut forward,
        mut inverse,
    } = builder;
    inverse.reverse();

    if base.order() != next.order() {
        forward.push(PatchOp::Set {
            path: PatchPath::Order,
            value: PatchValue::Order(next.order().to_vec()),
        });
        inverse.push(PatchOp::Set {
            path: PatchPath::Order,
            value: PatchValue::Order(base.order().to_vec()),
        });
    }

    (Patch::new(forward), Patch::new(inverse))
}

fn diff_document(old: &Document, new: &Document, builder: &mut PatchBuilder) {
    let document = new.id();

    if old.metadata != new.metadata {
        builder.set(
            PatchPath::Metadata(document),
            PatchValue::Metadata(new.metadata.clone()),
            PatchValue::Metadata(old.metadata.clone()),
        );
    }

    diff_list(
        &old.tracks,
        &new.tracks,
        builder,
        |index| PatchPath::Track { document, index },
        PatchValue::Track,
        |index, old_track, new_track, builder| {
            let same_shape = old_track.name == new_track.name
                && old_track.description == new_track.description
                && old_track.segments.len() == new_track.segments.len();
            if !same_shape {
                return false;
            }
            for (segment_index, (a, b)) in old_track
                .segments
                .iter()
                .zip(&new_track.segments)
                .enumerate()
            {
                if a != b {
                    builder.set(
                        PatchPath::Segment {
                            document,
                            track: index,
                            index: segment_index,
                        },
                        PatchValue::Segment(b.clone()),
                        PatchValue::Segment(a.clone()),
                    );
                }
            }
            true
        },
    );

    diff_list(
        &old.waypoints,
        &new.waypoints,
        builder,
        |index| PatchPath::Waypoint { document, index },
        PatchValue::Waypoint,
        |_, _, _, _| false,
    );
}

/// Element-wise list diff using only set (replace/append) and tail removes.
///
/// `refine` may emit finer-grained operations for a changed element and
/// return `true`; otherwise the element is replaced whole.
fn diff_list<T, P, V, R>(
    old: &[T],
    new: &[T],
    builder: &mut PatchBuilder,
    path: P,
    value: V,
    mut refine: R,
) where
    T: Clone + PartialEq,
    P: Fn(usize) -> PatchPath,
    V: Fn(T) -> PatchValue,
    R: FnMut(usize, &T, &T, &mut PatchBuilder) -> bool,
{
    let common = old.len().min(new.len());
    for index in 0..common {
        let (a, b) = (&old[index], &new[index]);
        if a != b && !refine(index, a, b, builder) {
            builder.set(path(index), value(b.clone()), value(a.clone()));
        }
    }
    for (index, b) in new.iter().enumerate().skip(common) {
        builder.push(
            PatchOp::Set {
                path: path(index),
                value: value(b.clone()),
            },
            PatchOp::Remove { path: path(index) },
        );
    }
    for index in (new.len()..old.len()).rev() {
        builder.push(
            PatchOp::Remove { path: path(index) },
            PatchOp::Set {
                path: path(index),
                value: value(old[index].clone()),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::TrackPoint;

    fn create_test_segment(n: usize, lat: f64) -> Segment {
        Segment::new(
            (0..n)
                .map(|i| TrackPoint::new(lat + i as f64 * 0.001, 7.0))
                .collect(),
        )
    }

    fn create_test_document(id: u64, tracks: usize) -> Document {
        let mut doc = Document::new(DocumentId(id), format!("doc {id}"));
        for t in 0..tracks {
            doc.tracks.push(Track::new(vec![
                create_test_segment(3, t as f64),
                create_test_segment(2, t as f64 + 0.5),
            ]));
        }
        doc.waypoints.push(Waypoint::new(1.0, 2.0));
        doc
    }

    fn create_test_collection() -> DocumentCollection {
        DocumentCollection::from_documents([create_test_document(0, 3), create_test_document(1, 1)])
            .unwrap()
    }

    fn assert_same_content(a: &DocumentCollection, b: &DocumentCollection) {
        assert_eq!(a.order(), b.order());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x, y);
        }
    }

    fn edit(
        base: &DocumentCollection,
        f: impl FnOnce(&mut crate::collection::CollectionDraft),
    ) -> DocumentCollection {
        let mut draft = base.draft();
        f(&mut draft);
        draft.finish(base.version() + 1)
    }

    fn check_roundtrip(base: &DocumentCollection, next: &DocumentCollection) -> (Patch, Patch) {
        let (forward, inverse) = diff(base, next);
        assert_same_content(&forward.apply(base).unwrap(), next);
        assert_same_content(&inverse.apply(next).unwrap(), base);
        (forward, inverse)
    }

    #[test]
    fn test_no_change_gives_empty_patch() {
        let base = create_test_collection();
        let next = edit(&base, |_| {});
        let (forward, inverse) = diff(&base, &next);
        assert!(forward.is_empty());
        assert!(inverse.is_empty());
    }

    #[test]
    fn test_single_segment_edit_is_a_segment_op() {
        let base = create_test_collection();
        let next = edit(&base, |d| {
            d.get_mut(DocumentId(0))
                .unwrap()
                .segment_mut(1, 0)
                .unwrap()
                .points_mut()
                .pop();
        });
        let (forward, _) = check_roundtrip(&base, &next);
        assert_eq!(forward.len(), 1);
        assert_eq!(
            forward.ops()[0].path(),
            &PatchPath::Segment {
                document: DocumentId(0),
                track: 1,
                index: 0
            }
        );
        assert_eq!(
            forward.affected_documents().into_iter().collect::<Vec<_>>(),
            vec![DocumentId(0)]
        );
    }

    #[test]
    fn test_track_removal_in_the_middle() {
        let base = create_test_collection();
        let next = edit(&base, |d| {
            d.get_mut(DocumentId(0)).unwrap().tracks.remove(0);
        });
        check_roundtrip(&base, &next);
    }

    #[test]
    fn test_track_insertion_and_waypoint_changes() {
        let base = create_test_collection();
        let next = edit(&base, |d| {
            let doc = d.get_mut(DocumentId(1)).unwrap();
            doc.tracks.insert(0, Track::new(vec![create_test_segment(4, 9.0)]));
            doc.waypoints.clear();
            doc.metadata.visible = false;
        });
        check_roundtrip(&base, &next);
    }

    #[test]
    fn test_document_add_remove_and_reorder() {
        let base = create_test_collection();
        let next = edit(&base, |d| {
            d.remove(DocumentId(0));
            d.insert_at(0, create_test_document(7, 1)).unwrap();
            d.insert(create_test_document(8, 2)).unwrap();
            d.move_to(DocumentId(8), 0);
        });
        let (forward, _) = check_roundtrip(&base, &next);
        let affected: Vec<_> = forward.affected_documents().into_iter().collect();
        assert_eq!(affected, vec![DocumentId(0), DocumentId(7), DocumentId(8)]);
    }

    #[test]
    fn test_out_of_range_set_is_an_index_violation() {
        let base = create_test_collection();
        let patch = Patch::new(vec![PatchOp::Set {
            path: PatchPath::Track {
                document: DocumentId(1),
                index: 5,
            },
            value: PatchValue::Track(Track::default()),
        }]);
        assert!(matches!(
            patch.apply(&base),
            Err(EditError::IndexViolation { len: 1, .. })
        ));
    }

    #[test]
    fn test_mismatched_value_is_rejected() {
        let base = create_test_collection();
        let patch = Patch::new(vec![PatchOp::Set {
            path: PatchPath::Metadata(DocumentId(0)),
            value: PatchValue::Order(vec![]),
        }]);
        assert!(matches!(patch.apply(&base), Err(EditError::PatchMismatch(_))));
    }

    #[test]
    fn test_patch_json_roundtrip() {
        let base = create_test_collection();
        let next = edit(&base, |d| {
            d.get_mut(DocumentId(0)).unwrap().tracks.truncate(1);
        });
        let (forward, inverse) = diff(&base, &next);
        let json = serde_json::to_string(&(&forward, &inverse)).unwrap();
        let (f2, i2): (Patch, Patch) = serde_json::from_str(&json).unwrap();
        assert_eq!(f2, forward);
        assert_same_content(&i2.apply(&next).unwrap(), &base);
    }
}
