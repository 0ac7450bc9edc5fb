//! DocumentCollection - immutable, versioned snapshot of all open documents
//!
//! A collection is cheap to clone: documents are shared through `Arc`s and a
//! new version only copies the documents an edit touched. Mutators never see
//! a collection directly; they work on a [`CollectionDraft`] (or the
//! restricted [`DocumentsDraft`]) that is turned into the next version.

use crate::document::{Document, DocumentId, Segment};
use crate::item::ItemRef;
use crate::{EditError, Result};

use std::collections::BTreeMap;
use std::sync::Arc;

/// Information about the collection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionInfo {
    /// Number of documents
    pub document_count: usize,
    /// Total number of track points
    pub total_points: usize,
    /// Total number of waypoints
    pub total_waypoints: usize,
}

/// One version of the document collection
#[derive(Clone, Debug, Default)]
pub struct DocumentCollection {
    pub(crate) documents: BTreeMap<DocumentId, Arc<Document>>,
    pub(crate) order: Vec<DocumentId>,
    pub(crate) version: u64,
    /// Lower bound for the next fresh id; never decreases
    pub(crate) next_id: u64,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl DocumentCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a collection from documents in the given order
    pub fn from_documents(documents: impl IntoIterator<Item = Document>) -> Result<Self> {
        let mut draft = CollectionDraft::default();
        for document in documents {
            draft.insert(document)?;
        }
        Ok(draft.finish(0))
    }

    #[inline]
    pub fn get(&self, id: DocumentId) -> Option<&Arc<Document>> {
        self.documents.get(&id)
    }

    #[inline]
    pub fn contains(&self, id: DocumentId) -> bool {
        self.documents.contains_key(&id)
    }

    /// Documents in display order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Document>> {
        self.order.iter().filter_map(|id| self.documents.get(id))
    }

    /// Document ids in display order
    #[inline]
    pub fn order(&self) -> &[DocumentId] {
        &self.order
    }

    /// Monotonic version number, bumped by every commit, undo and redo
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Whether `item` points at an existing node
    pub fn resolves(&self, item: &ItemRef) -> bool {
        self.get(item.document())
            .is_some_and(|doc| item.resolves_in(doc))
    }

    /// Resolve a segment reference; other reference kinds yield `None`
    pub fn segment(&self, item: &ItemRef) -> Option<&Segment> {
        match *item {
            ItemRef::Segment {
                document,
                track,
                segment,
            } => self.get(document)?.segment(track, segment),
            _ => None,
        }
    }

    /// Id the next new document gets.
    ///
    /// Ids of deleted documents are never handed out again.
    pub fn next_document_id(&self) -> DocumentId {
        DocumentId(self.next_id)
    }

    /// Summary counts
    pub fn info(&self) -> CollectionInfo {
        CollectionInfo {
            document_count: self.documents.len(),
            total_points: self.documents.values().map(|d| d.total_points()).sum(),
            total_waypoints: self.documents.values().map(|d| d.waypoints.len()).sum(),
        }
    }

    pub(crate) fn draft(&self) -> CollectionDraft {
        CollectionDraft {
            documents: self.iter().cloned().collect(),
            next_id: self.next_id,
        }
    }

    pub(crate) fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Raise the id counter to at least `next_id`
    pub(crate) fn with_next_id(mut self, next_id: u64) -> Self {
        self.next_id = self.next_id.max(next_id);
        self
    }

    pub(crate) fn reserve_id(&mut self, id: DocumentId) {
        self.next_id = self.next_id.max(id.0 + 1);
    }
}

/// Content equality; the version number and id counter are ignored
impl PartialEq for DocumentCollection {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order && self.documents == other.documents
    }
}

/// Writable view over a whole collection, handed to global mutators.
///
/// Untouched documents keep sharing storage with the base version.
#[derive(Debug, Default)]
pub struct CollectionDraft {
    documents: Vec<Arc<Document>>,
    next_id: u64,
}

impl CollectionDraft {
    pub fn get(&self, id: DocumentId) -> Option<&Document> {
        self.documents
            .iter()
            .find(|d| d.id() == id)
            .map(|d| d.as_ref())
    }

    /// Mutable access; copies the document on first write
    pub fn get_mut(&mut self, id: DocumentId) -> Option<&mut Document> {
        self.documents
            .iter_mut()
            .find(|d| d.id() == id)
            .map(Arc::make_mut)
    }

    /// Append a document. Fails when the id is already present.
    pub fn insert(&mut self, document: Document) -> Result<()> {
        let index = self.documents.len();
        self.insert_at(index, document)
    }

    /// Insert a document at a display position (clamped to the end)
    pub fn insert_at(&mut self, index: usize, document: Document) -> Result<()> {
        if self.get(document.id()).is_some() {
            return Err(EditError::MutationFailed {
                reason: format!("duplicate document id {}", document.id()),
            });
        }
        let index = index.min(self.documents.len());
        self.next_id = self.next_id.max(document.id().0 + 1);
        self.documents.insert(index, Arc::new(document));
        Ok(())
    }

    /// Remove a document, returning it if it was present
    pub fn remove(&mut self, id: DocumentId) -> Option<Document> {
        let position = self.documents.iter().position(|d| d.id() == id)?;
        let removed = self.documents.remove(position);
        Some(Arc::unwrap_or_clone(removed))
    }

    /// Move a document to a new display position (clamped to the end)
    pub fn move_to(&mut self, id: DocumentId, index: usize) -> bool {
        let Some(position) = self.documents.iter().position(|d| d.id() == id) else {
            return false;
        };
        let document = self.documents.remove(position);
        let index = index.min(self.documents.len());
        self.documents.insert(index, document);
        true
    }

    /// Document ids in current draft order
    pub fn ids(&self) -> Vec<DocumentId> {
        self.documents.iter().map(|d| d.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Fresh id: above every id this collection has ever held
    pub fn next_document_id(&self) -> DocumentId {
        DocumentId(self.next_id)
    }

    pub(crate) fn finish(self, version: u64) -> DocumentCollection {
        let order = self.documents.iter().map(|d| d.id()).collect();
        let documents = self.documents.into_iter().map(|d| (d.id(), d)).collect();
        DocumentCollection {
            documents,
            order,
            version,
            next_id: self.next_id,
        }
    }
}

/// Writable view restricted to a set of documents.
///
/// Ids outside the scope, or unknown to the collection, are invisible.
#[derive(Debug)]
pub struct DocumentsDraft<'a> {
    draft: &'a mut CollectionDraft,
    scope: Vec<DocumentId>,
}

impl<'a> DocumentsDraft<'a> {
    pub(crate) fn new(draft: &'a mut CollectionDraft, ids: &[DocumentId]) -> Self {
        let mut scope: Vec<DocumentId> = Vec::with_capacity(ids.len());
        for &id in ids {
            if draft.get(id).is_some() && !scope.contains(&id) {
                scope.push(id);
            }
        }
        Self { draft, scope }
    }

    /// Ids in scope that are still present
    pub fn ids(&self) -> &[DocumentId] {
        &self.scope
    }

    pub fn get(&self, id: DocumentId) -> Option<&Document> {
        if self.scope.contains(&id) {
            self.draft.get(id)
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, id: DocumentId) -> Option<&mut Document> {
        if self.scope.contains(&id) {
            self.draft.get_mut(id)
        } else {
            None
        }
    }

    /// Run `f` on every document in scope, stopping at the first error
    pub fn try_for_each_mut<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut Document) -> Result<()>,
    {
        for id in self.scope.clone() {
            if let Some(document) = self.draft.get_mut(id) {
                f(document)?;
            }
        }
        Ok(())
    }

    /// Remove a document in scope; it will be reported as absent
    pub fn remove(&mut self, id: DocumentId) -> Option<Document> {
        let position = self.scope.iter().position(|s| *s == id)?;
        self.scope.remove(position);
        self.draft.remove(id)
    }
}
