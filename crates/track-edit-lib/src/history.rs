//! Mutation log: bounded undo/redo history over the document collection
//!
//! Every commit, undo and redo writes one [`WriteBatch`] holding the changed
//! document records, the log entries and the cursor. The in-memory log and
//! state only move once the store has accepted the batch.
//!
//! Persisted layout:
//! - `doc/<id>` one JSON document per record
//! - `order` the display order of documents
//! - `log/<index>` one `{forward, inverse}` entry per absolute log index
//! - `cursor` absolute index of the next entry to redo (or to write)
//! - `next_id` the document id counter, so deleted ids stay retired

use crate::collection::DocumentCollection;
use crate::document::{Document, DocumentId};
use crate::patch::{Patch, diff};
use crate::storage::{KvStore, WriteBatch, load_json, parse_json};
use crate::{EditError, Result};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

const DOC_PREFIX: &str = "doc/";
const LOG_PREFIX: &str = "log/";
const CURSOR_KEY: &str = "cursor";
const ORDER_KEY: &str = "order";
const NEXT_ID_KEY: &str = "next_id";

fn doc_key(id: DocumentId) -> String {
    format!("{DOC_PREFIX}{:020}", id.0)
}

fn log_key(index: u64) -> String {
    format!("{LOG_PREFIX}{index:020}")
}

/// A forward patch and its exact inverse
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub forward: Patch,
    pub inverse: Patch,
}

/// Result of a commit, undo or redo
#[derive(Clone, Debug)]
pub struct Transition {
    /// The new current collection
    pub collection: Arc<DocumentCollection>,
    /// The collection it replaced
    pub previous: Arc<DocumentCollection>,
    /// Documents whose content, presence or position changed
    pub affected: BTreeSet<DocumentId>,
}

/// Bounded log of patch pairs with a cursor, persisted in a [`KvStore`]
pub struct MutationLog {
    store: Arc<dyn KvStore>,
    capacity: usize,
    entries: VecDeque<LogEntry>,
    /// Absolute index of `entries[0]`
    first_index: u64,
    /// Absolute index of the next entry; entries before it can be undone
    cursor: u64,
    state: Arc<DocumentCollection>,
}

impl std::fmt::Debug for MutationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationLog")
            .field("capacity", &self.capacity)
            .field("entries", &self.entries.len())
            .field("first_index", &self.first_index)
            .field("cursor", &self.cursor)
            .field("version", &self.state.version())
            .finish()
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl MutationLog {
    /// Empty log over a fresh [`MemoryStore`](crate::MemoryStore)
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            store: Arc::new(crate::storage::MemoryStore::new()),
            capacity,
            entries: VecDeque::new(),
            first_index: 0,
            cursor: 0,
            state: Arc::new(DocumentCollection::new()),
        }
    }

    /// Restore documents, order, history and cursor from `store`
    pub fn open(store: Arc<dyn KvStore>, capacity: usize) -> Result<Self> {
        let mut documents: BTreeMap<DocumentId, Document> = BTreeMap::new();
        for (_, value) in store.scan_prefix(DOC_PREFIX)? {
            let document: Document = parse_json(&value)?;
            documents.insert(document.id(), document);
        }

        let stored_order: Vec<DocumentId> = load_json(store.as_ref(), ORDER_KEY)?.unwrap_or_default();
        let mut ordered = Vec::with_capacity(documents.len());
        for id in stored_order {
            if let Some(document) = documents.remove(&id) {
                ordered.push(document);
            }
        }
        // Records missing from the order go last, by id
        ordered.extend(documents.into_values());
        let next_id: u64 = load_json(store.as_ref(), NEXT_ID_KEY)?.unwrap_or(0);
        let state = DocumentCollection::from_documents(ordered)?.with_next_id(next_id);

        let mut entries = VecDeque::new();
        let mut first_index = None;
        for (key, value) in store.scan_prefix(LOG_PREFIX)? {
            let index: u64 = key[LOG_PREFIX.len()..]
                .parse()
                .map_err(|_| EditError::PatchMismatch(format!("malformed log key {key}")))?;
            let expected = first_index.unwrap_or(index) + entries.len() as u64;
            if index != expected {
                return Err(EditError::PatchMismatch(format!(
                    "log gap: expected entry {expected}, found {index}"
                )));
            }
            first_index.get_or_insert(index);
            entries.push_back(parse_json::<LogEntry>(&value)?);
        }

        let stored_cursor: Option<u64> = load_json(store.as_ref(), CURSOR_KEY)?;
        let first_index = first_index.or(stored_cursor).unwrap_or(0);
        let head = first_index + entries.len() as u64;
        let cursor = stored_cursor.unwrap_or(head);
        if cursor < first_index || cursor > head {
            return Err(EditError::PatchMismatch(format!(
                "cursor {cursor} outside log range {first_index}..={head}"
            )));
        }

        tracing::info!(
            "Opened mutation log: {} documents, {} entries, cursor {}",
            state.len(),
            entries.len(),
            cursor
        );

        Ok(Self {
            store,
            capacity,
            entries,
            first_index,
            cursor,
            state: Arc::new(state),
        })
    }

    /// Current collection
    pub fn state(&self) -> &Arc<DocumentCollection> {
        &self.state
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > self.first_index
    }

    pub fn can_redo(&self) -> bool {
        self.cursor < self.head()
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Absolute cursor position
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    fn head(&self) -> u64 {
        self.first_index + self.entries.len() as u64
    }

    fn entry(&self, index: u64) -> Option<&LogEntry> {
        let offset = index.checked_sub(self.first_index)?;
        self.entries.get(usize::try_from(offset).ok()?)
    }

    /// Commit `next` as the new state.
    ///
    /// The forward patch and its inverse are derived by diffing against the
    /// current state. Redo entries past the cursor are discarded and the
    /// oldest entries are evicted beyond the capacity. Returns `None` when
    /// `next` does not differ from the current state.
    pub fn commit(&mut self, next: DocumentCollection) -> Result<Option<Transition>> {
        let (forward, inverse) = diff(&self.state, &next);
        if forward.is_empty() {
            return Ok(None);
        }

        let next = next.with_version(self.state.version() + 1);
        let affected = forward.affected_documents();
        let entry = LogEntry { forward, inverse };

        let retained = self.cursor - self.first_index + 1;
        let evicted = retained.saturating_sub(self.capacity as u64);

        let mut batch = WriteBatch::new();
        self.write_state(&mut batch, &affected, &next)?;
        for index in self.cursor..self.head() {
            batch.delete(log_key(index));
        }
        batch.put_json(log_key(self.cursor), &entry)?;
        for index in self.first_index..self.first_index + evicted {
            batch.delete(log_key(index));
        }
        batch.put_json(CURSOR_KEY, &(self.cursor + 1))?;
        self.store.transact(batch).inspect_err(|e| {
            tracing::warn!("Commit rejected by storage, state unchanged: {}", e);
        })?;

        let discarded = self.head() - self.cursor;
        self.entries.truncate((self.cursor - self.first_index) as usize);
        self.entries.push_back(entry);
        for _ in 0..evicted {
            self.entries.pop_front();
        }
        self.first_index += evicted;
        self.cursor += 1;

        tracing::debug!(
            "Committed version {} ({} documents, {} redo entries discarded, {} evicted)",
            next.version(),
            affected.len(),
            discarded,
            evicted
        );
        Ok(Some(self.advance(next, affected)))
    }

    /// Apply the inverse patch before the cursor. Returns `None` if there is
    /// nothing to undo.
    pub fn undo(&mut self) -> Result<Option<Transition>> {
        if !self.can_undo() {
            return Ok(None);
        }
        let index = self.cursor - 1;
        let patch = self
            .entry(index)
            .map(|e| e.inverse.clone())
            .ok_or_else(|| EditError::PatchMismatch(format!("missing log entry {index}")))?;
        let transition = self.replay(&patch, index)?;
        tracing::debug!("Undo to version {}", transition.collection.version());
        Ok(Some(transition))
    }

    /// Apply the forward patch at the cursor. Returns `None` if there is
    /// nothing to redo.
    pub fn redo(&mut self) -> Result<Option<Transition>> {
        if !self.can_redo() {
            return Ok(None);
        }
        let index = self.cursor;
        let patch = self
            .entry(index)
            .map(|e| e.forward.clone())
            .ok_or_else(|| EditError::PatchMismatch(format!("missing log entry {index}")))?;
        let transition = self.replay(&patch, index + 1)?;
        tracing::debug!("Redo to version {}", transition.collection.version());
        Ok(Some(transition))
    }

    fn replay(&mut self, patch: &Patch, cursor: u64) -> Result<Transition> {
        let next = patch
            .apply(&self.state)?
            .with_version(self.state.version() + 1);
        let affected = patch.affected_documents();

        let mut batch = WriteBatch::new();
        self.write_state(&mut batch, &affected, &next)?;
        batch.put_json(CURSOR_KEY, &cursor)?;
        self.store.transact(batch).inspect_err(|e| {
            tracing::warn!("History move rejected by storage, state unchanged: {}", e);
        })?;

        self.cursor = cursor;
        Ok(self.advance(next, affected))
    }

    fn write_state(
        &self,
        batch: &mut WriteBatch,
        affected: &BTreeSet<DocumentId>,
        next: &DocumentCollection,
    ) -> Result<()> {
        for id in affected {
            match next.get(*id) {
                Some(document) => {
                    batch.put_json(doc_key(*id), document.as_ref())?;
                }
                None => {
                    batch.delete(doc_key(*id));
                }
            }
        }
        if next.order() != self.state.order() {
            batch.put_json(ORDER_KEY, &next.order())?;
        }
        if next.next_document_id() != self.state.next_document_id() {
            batch.put_json(NEXT_ID_KEY, &next.next_document_id().0)?;
        }
        Ok(())
    }

    fn advance(&mut self, next: DocumentCollection, affected: BTreeSet<DocumentId>) -> Transition {
        let next = Arc::new(next);
        let previous = std::mem::replace(&mut self.state, next.clone());
        Transition {
            collection: next,
            previous,
            affected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Segment, Track, TrackPoint};
    use crate::storage::{MemoryStore, StorageError, StorageResult};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn create_test_document(id: u64) -> Document {
        let mut doc = Document::new(DocumentId(id), format!("doc {id}"));
        doc.tracks.push(Track::new(vec![Segment::new(vec![
            TrackPoint::new(10.0, 10.0),
            TrackPoint::new(10.1, 10.1),
        ])]));
        doc
    }

    fn add_document(log: &mut MutationLog, id: u64) -> Transition {
        let mut draft = log.state().draft();
        draft.insert(create_test_document(id)).unwrap();
        log.commit(draft.finish(0)).unwrap().unwrap()
    }

    fn rename(log: &mut MutationLog, id: u64, name: &str) -> Transition {
        let mut draft = log.state().draft();
        draft.get_mut(DocumentId(id)).unwrap().metadata.name = name.to_string();
        log.commit(draft.finish(0)).unwrap().unwrap()
    }

    /// Store that rejects batches while `fail` is set
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail: AtomicBool,
    }

    impl KvStore for FlakyStore {
        fn get(&self, key: &str) -> StorageResult<Option<String>> {
            self.inner.get(key)
        }

        fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, String)>> {
            self.inner.scan_prefix(prefix)
        }

        fn transact(&self, batch: WriteBatch) -> StorageResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StorageError::Io("disk full".into()));
            }
            self.inner.transact(batch)
        }
    }

    #[test]
    fn test_commit_undo_redo() {
        let mut log = MutationLog::open(Arc::new(MemoryStore::new()), 100).unwrap();
        let empty = log.state().clone();
        add_document(&mut log, 0);
        let after_add = log.state().clone();
        rename(&mut log, 0, "renamed");

        assert_eq!(log.len(), 2);
        assert!(log.can_undo());
        assert!(!log.can_redo());

        let undone = log.undo().unwrap().unwrap();
        assert_eq!(*undone.collection, *after_add);
        assert_eq!(undone.affected, BTreeSet::from([DocumentId(0)]));
        log.undo().unwrap();
        assert_eq!(**log.state(), *empty);
        assert!(log.undo().unwrap().is_none());

        log.redo().unwrap();
        assert_eq!(**log.state(), *after_add);
        assert_eq!(log.state().version(), 5);
    }

    #[test]
    fn test_empty_change_is_not_recorded() {
        let mut log = MutationLog::open(Arc::new(MemoryStore::new()), 100).unwrap();
        add_document(&mut log, 0);
        let draft = log.state().draft();
        assert!(log.commit(draft.finish(0)).unwrap().is_none());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_new_commit_discards_redo() {
        let store = Arc::new(MemoryStore::new());
        let mut log = MutationLog::open(store.clone(), 100).unwrap();
        add_document(&mut log, 0);
        rename(&mut log, 0, "a");
        rename(&mut log, 0, "b");
        log.undo().unwrap();
        log.undo().unwrap();
        rename(&mut log, 0, "c");

        assert!(!log.can_redo());
        assert_eq!(log.len(), 2);
        assert_eq!(store.scan_prefix(LOG_PREFIX).unwrap().len(), 2);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let store = Arc::new(MemoryStore::new());
        let mut log = MutationLog::open(store.clone(), 3).unwrap();
        add_document(&mut log, 0);
        for i in 0..5 {
            rename(&mut log, 0, &format!("name {i}"));
        }
        assert_eq!(log.len(), 3);
        assert_eq!(store.scan_prefix(LOG_PREFIX).unwrap().len(), 3);

        let mut undone = 0;
        while log.undo().unwrap().is_some() {
            undone += 1;
        }
        assert_eq!(undone, 3);
        // The document creation fell off the undo horizon
        assert!(log.state().contains(DocumentId(0)));
        assert_eq!(log.state().get(DocumentId(0)).unwrap().metadata.name, "name 1");
    }

    #[test]
    fn test_storage_failure_leaves_log_untouched() {
        let store = Arc::new(FlakyStore::default());
        let mut log = MutationLog::open(store.clone(), 100).unwrap();
        add_document(&mut log, 0);
        let before = log.state().clone();

        store.fail.store(true, Ordering::SeqCst);
        let mut draft = log.state().draft();
        draft.insert(create_test_document(1)).unwrap();
        let result = log.commit(draft.finish(0));
        assert!(matches!(result, Err(EditError::Storage(_))));
        assert!(log.undo().is_err());

        assert!(Arc::ptr_eq(log.state(), &before));
        assert_eq!(log.len(), 1);
        assert_eq!(log.cursor(), 1);

        store.fail.store(false, Ordering::SeqCst);
        log.undo().unwrap();
        assert!(log.state().is_empty());
    }

    #[test]
    fn test_reopen_restores_state_and_cursor() {
        let store = Arc::new(MemoryStore::new());
        {
            let mut log = MutationLog::open(store.clone(), 100).unwrap();
            add_document(&mut log, 3);
            add_document(&mut log, 1);
            let mut draft = log.state().draft();
            draft.move_to(DocumentId(1), 0);
            log.commit(draft.finish(0)).unwrap();
            rename(&mut log, 3, "x");
            log.undo().unwrap();
        }

        let mut log = MutationLog::open(store, 100).unwrap();
        assert_eq!(log.state().order(), &[DocumentId(1), DocumentId(3)]);
        assert_eq!(log.state().get(DocumentId(3)).unwrap().metadata.name, "doc 3");
        assert_eq!(log.cursor(), 3);
        assert!(log.can_redo());

        log.redo().unwrap();
        assert_eq!(log.state().get(DocumentId(3)).unwrap().metadata.name, "x");
        log.undo().unwrap();
        log.undo().unwrap();
        assert_eq!(log.state().order(), &[DocumentId(3), DocumentId(1)]);
    }

    #[test]
    fn test_reopen_keeps_deleted_ids_retired() {
        let store = Arc::new(MemoryStore::new());
        {
            let mut log = MutationLog::open(store.clone(), 100).unwrap();
            add_document(&mut log, 0);
            add_document(&mut log, 1);
            let mut draft = log.state().draft();
            draft.remove(DocumentId(1));
            log.commit(draft.finish(0)).unwrap();
            assert_eq!(log.state().next_document_id(), DocumentId(2));
        }

        let mut log = MutationLog::open(store, 100).unwrap();
        assert_eq!(log.state().len(), 1);
        assert_eq!(log.state().next_document_id(), DocumentId(2));

        // Undoing the deletion restores the document under its own id
        log.undo().unwrap();
        assert!(log.state().contains(DocumentId(1)));
        assert_eq!(log.state().next_document_id(), DocumentId(2));
    }

    #[test]
    fn test_corrupt_cursor_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        store.put(CURSOR_KEY, "7").unwrap();
        store.put(&log_key(2), "{\"forward\":[],\"inverse\":[]}").unwrap();
        assert!(matches!(
            MutationLog::open(store, 100),
            Err(EditError::PatchMismatch(_))
        ));
    }
}
