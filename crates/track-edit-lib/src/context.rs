//! EditorContext - the single entry point shared by every collaborator
//!
//! The context owns the mutation log (single writer), the published
//! collection snapshot, the selection, the clipboard and the derived caches.
//! After every commit, undo or redo it publishes the new snapshot, prunes the
//! selection, refreshes the caches of the affected documents and notifies
//! subscribers.

use crate::collection::{CollectionDraft, DocumentCollection, DocumentsDraft};
use crate::document::{Document, DocumentId, TrackPoint};
use crate::history::{MutationLog, Transition};
use crate::import::document_from_gpx;
use crate::item::ItemRef;
use crate::selection::{Clipboard, SelectionTree};
use crate::simplify::{ResolutionScale, SimplificationIndex, TaggedIndex, WebMercatorZoom};
use crate::statistics::{DocumentStatistics, Statistics, StatisticsTree};
use crate::storage::KvStore;
use crate::{Config, EditError, Result};

use std::collections::BTreeSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Handle returned by [`EditorContext::subscribe`]
pub type ListenerId = u64;

/// Notification sent to subscribers after a commit, undo or redo.
///
/// Events are delivered after the writer is released, so edits racing on
/// different threads may notify out of order. Listeners that keep state
/// should ignore events older than the last `version` they handled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Version of the collection now published
    pub version: u64,
    /// Documents whose content, presence or position changed
    pub documents: BTreeSet<DocumentId>,
}

type Listener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// What an edit did to the documents it was given
#[derive(Clone, Debug, Default)]
pub struct MutationOutcome {
    /// Version of the collection after the edit
    pub version: u64,
    /// Requested (or touched) documents that still exist, as committed
    pub updated: Vec<Arc<Document>>,
    /// Requested (or touched) documents that no longer exist
    pub removed: Vec<DocumentId>,
}

impl MutationOutcome {
    fn from_transition(ids: &[DocumentId], transition: Option<&Transition>, current: &DocumentCollection) -> Self {
        let mut seen = BTreeSet::new();
        let ids: Vec<DocumentId> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        match transition {
            Some(t) => Self {
                version: t.collection.version(),
                updated: ids.iter().filter_map(|id| t.collection.get(*id).cloned()).collect(),
                removed: ids
                    .iter()
                    .copied()
                    .filter(|id| t.previous.contains(*id) && !t.collection.contains(*id))
                    .collect(),
            },
            None => Self {
                version: current.version(),
                updated: ids.iter().filter_map(|id| current.get(*id).cloned()).collect(),
                removed: Vec::new(),
            },
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    config: Config,
    writer: Mutex<MutationLog>,
    state: RwLock<Arc<DocumentCollection>>,
    selection: RwLock<SelectionTree>,
    clipboard: RwLock<Clipboard>,
    statistics: StatisticsTree,
    simplification: SimplificationIndex,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
}

impl Shared {
    fn snapshot(&self) -> Arc<DocumentCollection> {
        read(&self.state).clone()
    }

    /// The log only moves after a successful commit, so a panic elsewhere
    /// under the lock leaves it consistent
    fn lock_writer(&self) -> MutexGuard<'_, MutationLog> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs under the writer lock so snapshots are published in version order
    fn publish(&self, transition: &Transition) {
        *write(&self.state) = transition.collection.clone();
        let pruned = write(&self.selection).prune(&transition.collection);
        if pruned > 0 {
            tracing::debug!("Dropped {} selections of removed documents", pruned);
        }
    }

    fn refresh(self: &Arc<Self>, transition: Transition) {
        let event = ChangeEvent {
            version: transition.collection.version(),
            documents: transition.affected.clone(),
        };
        if self.config.background_rebuild {
            let shared = Arc::clone(self);
            rayon::spawn(move || {
                shared.rebuild_derived(&transition.affected, &transition.collection, true);
            });
        } else {
            self.rebuild_derived(&transition.affected, &transition.collection, false);
        }
        self.notify(&event);
    }

    fn rebuild_derived(&self, affected: &BTreeSet<DocumentId>, collection: &DocumentCollection, eager: bool) {
        #[cfg(feature = "profiling")]
        profiling::scope!("context::rebuild_derived");

        self.statistics.rebuild(affected, collection);
        self.simplification.prune(affected, collection);
        if eager {
            let ids: Vec<DocumentId> = affected.iter().copied().collect();
            self.simplification.rebuild_documents(&ids, collection);
        }
    }

    fn notify(&self, event: &ChangeEvent) {
        let listeners: Vec<Listener> = read(&self.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }
}

/// Shared editing state of one session.
///
/// Cloning the context is cheap and every clone refers to the same state.
#[derive(Clone)]
pub struct EditorContext {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for EditorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditorContext")
            .field("config", &self.shared.config)
            .field("version", &self.version())
            .field("simplification", &self.shared.simplification)
            .finish()
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl EditorContext {
    /// Restore a session from `store`, using web map zoom levels for anchors
    pub fn open(store: Arc<dyn KvStore>, config: Config) -> Result<Self> {
        Self::open_with_scale(store, config, Arc::new(WebMercatorZoom::default()))
    }

    /// Restore a session from `store` with a custom distance → level mapping
    pub fn open_with_scale(
        store: Arc<dyn KvStore>,
        config: Config,
        scale: Arc<dyn ResolutionScale>,
    ) -> Result<Self> {
        let log = MutationLog::open(store, config.history_capacity)?;
        Ok(Self::from_log(log, config, scale))
    }

    /// Fresh session whose history lives in memory only
    pub fn in_memory(config: Config) -> Self {
        let log = MutationLog::in_memory(config.history_capacity);
        Self::from_log(log, config, Arc::new(WebMercatorZoom::default()))
    }

    fn from_log(log: MutationLog, config: Config, scale: Arc<dyn ResolutionScale>) -> Self {
        let state = log.state().clone();
        let statistics = StatisticsTree::new(config.moving_speed_threshold);
        statistics.rebuild_all(&state);
        let simplification = SimplificationIndex::new(config.simplification, scale);

        tracing::info!(
            "Editor context ready: {} documents at version {}",
            state.len(),
            state.version()
        );
        Self {
            shared: Arc::new(Shared {
                config,
                writer: Mutex::new(log),
                state: RwLock::new(state),
                selection: RwLock::new(SelectionTree::new()),
                clipboard: RwLock::new(Clipboard::default()),
                statistics,
                simplification,
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    // ---- Document reads ----

    /// The current collection version; every read through it is consistent
    pub fn snapshot(&self) -> Arc<DocumentCollection> {
        self.shared.snapshot()
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version()
    }

    pub fn get_document(&self, id: DocumentId) -> Option<Arc<Document>> {
        self.snapshot().get(id).cloned()
    }

    /// Visit every document of one snapshot in display order
    pub fn for_each_document<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Document>),
    {
        let snapshot = self.snapshot();
        for document in snapshot.iter() {
            f(document);
        }
    }

    // ---- Mutation ----

    fn run<F>(&self, op: F) -> Result<Option<Transition>>
    where
        F: FnOnce(&mut MutationLog) -> Result<Option<Transition>>,
    {
        let transition = {
            let mut writer = self.shared.lock_writer();
            let transition = op(&mut *writer)?;
            if let Some(t) = &transition {
                self.shared.publish(t);
            }
            transition
        };
        if let Some(t) = &transition {
            self.shared.refresh(t.clone());
        }
        Ok(transition)
    }

    fn outcome(&self, ids: &[DocumentId], transition: Option<Transition>) -> MutationOutcome {
        MutationOutcome::from_transition(ids, transition.as_ref(), &self.snapshot())
    }

    /// Run `mutator` on the documents `ids` and commit the result.
    ///
    /// Unknown ids are ignored. If the mutator fails nothing is recorded and
    /// the state does not change.
    pub fn apply_to_documents<F>(&self, ids: &[DocumentId], mutator: F) -> Result<MutationOutcome>
    where
        F: FnOnce(&mut DocumentsDraft<'_>) -> Result<()>,
    {
        let transition = self
            .run(|log| {
                let mut draft = log.state().draft();
                run_mutator(|| mutator(&mut DocumentsDraft::new(&mut draft, ids)))?;
                log.commit(draft.finish(0))
            })
            .inspect_err(|e| tracing::debug!("Document edit rejected: {}", e))?;
        Ok(self.outcome(ids, transition))
    }

    /// Run `mutator` on the whole collection and commit the result
    pub fn apply_globally<F>(&self, mutator: F) -> Result<MutationOutcome>
    where
        F: FnOnce(&mut CollectionDraft) -> Result<()>,
    {
        let transition = self
            .run(|log| {
                let mut draft = log.state().draft();
                run_mutator(|| mutator(&mut draft))?;
                log.commit(draft.finish(0))
            })
            .inspect_err(|e| tracing::debug!("Collection edit rejected: {}", e))?;
        let ids: Vec<DocumentId> = transition
            .as_ref()
            .map(|t| t.affected.iter().copied().collect())
            .unwrap_or_default();
        Ok(self.outcome(&ids, transition))
    }

    /// Step back once. Returns false when there is nothing to undo.
    pub fn undo(&self) -> Result<bool> {
        Ok(self.run(MutationLog::undo)?.is_some())
    }

    /// Step forward once. Returns false when there is nothing to redo.
    pub fn redo(&self) -> Result<bool> {
        Ok(self.run(MutationLog::redo)?.is_some())
    }

    pub fn can_undo(&self) -> bool {
        self.shared.lock_writer().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.shared.lock_writer().can_redo()
    }

    // ---- Editing intents ----

    /// Add a document at the end of the collection
    pub fn insert_document(&self, document: Document) -> Result<MutationOutcome> {
        self.apply_globally(|draft| draft.insert(document))
    }

    /// Convert parsed GPX data into a new document with a fresh id
    pub fn import_gpx(&self, gpx_data: gpx::Gpx, fallback_name: &str) -> Result<DocumentId> {
        let mut assigned = None;
        self.apply_globally(|draft| {
            let id = draft.next_document_id();
            draft.insert(document_from_gpx(id, gpx_data, fallback_name))?;
            assigned = Some(id);
            Ok(())
        })?;
        assigned.ok_or_else(|| EditError::mutation("import did not produce a document"))
    }

    /// Delete `items` in one transaction, deepest first.
    ///
    /// References that do not resolve are skipped.
    pub fn delete_items(&self, items: &[ItemRef]) -> Result<MutationOutcome> {
        let transition = self.run(|log| {
            let base = log.state().clone();
            let mut plan = SelectionTree::new();
            for item in items.iter().filter(|item| base.resolves(item)) {
                plan.add_select(item);
            }
            let ordered = plan.get_selected_ordered(base.order(), true);
            if ordered.is_empty() {
                return Ok(None);
            }

            let mut draft = base.draft();
            for item in &ordered {
                remove_item(&mut draft, item);
            }
            log.commit(draft.finish(0))
        })?;
        let ids: Vec<DocumentId> = transition
            .as_ref()
            .map(|t| t.affected.iter().copied().collect())
            .unwrap_or_default();
        Ok(self.outcome(&ids, transition))
    }

    /// Delete the current selection and clear it
    pub fn delete_selection(&self) -> Result<MutationOutcome> {
        let items = self.ordered_selection(true);
        let outcome = self.delete_items(&items)?;
        self.clear_selection();
        Ok(outcome)
    }

    /// Replace a segment's points by a list supplied by a routing or
    /// elevation collaborator
    pub fn replace_segment_points(&self, item: &ItemRef, points: Vec<TrackPoint>) -> Result<MutationOutcome> {
        let (document, track, segment) = segment_address(item)?;
        self.apply_to_documents(&[document], |draft| {
            let target = draft
                .get_mut(document)
                .and_then(|doc| doc.segment_mut(track, segment))
                .ok_or_else(|| EditError::mutation(format!("segment {item:?} no longer exists")))?;
            target.set_points(points);
            Ok(())
        })
    }

    /// Keep only the points of a segment whose retained distance is at
    /// least `tolerance`
    pub fn reduce_segment(&self, item: &ItemRef, tolerance: f64) -> Result<MutationOutcome> {
        let (document, track, segment) = segment_address(item)?;
        let simplification = &self.shared.simplification;
        let transition = self.run(|log| {
            let base = log.state().clone();
            let hierarchy = simplification
                .hierarchy(item, &base)
                .ok_or_else(|| EditError::mutation(format!("segment {item:?} no longer exists")))?;
            let kept = hierarchy.points_above_tolerance(tolerance);
            if kept.len() == hierarchy.points().len() {
                return Ok(None);
            }
            let points: Vec<TrackPoint> = kept
                .iter()
                .filter_map(|&i| hierarchy.points().get(i).cloned())
                .collect();

            let mut draft = base.draft();
            if let Some(target) = draft
                .get_mut(document)
                .and_then(|doc| doc.segment_mut(track, segment))
            {
                tracing::info!(
                    "Reducing {:?} from {} to {} points",
                    item,
                    target.len(),
                    points.len()
                );
                target.set_points(points);
            }
            log.commit(draft.finish(0))
        })?;
        Ok(self.outcome(&[document], transition))
    }

    // ---- Selection ----

    /// Replace the selection by `item`. Stale references are ignored.
    pub fn select(&self, item: &ItemRef) {
        if self.snapshot().resolves(item) {
            write(&self.shared.selection).select(item);
        }
    }

    /// Add `item` to the selection. Stale references are ignored.
    pub fn add_select(&self, item: &ItemRef) {
        if self.snapshot().resolves(item) {
            write(&self.shared.selection).add_select(item);
        }
    }

    /// Flip the explicit selection of `item`, returning the new flag
    pub fn toggle(&self, item: &ItemRef) -> bool {
        let mut selection = write(&self.shared.selection);
        if !selection.is_selected(item) && !self.snapshot().resolves(item) {
            return false;
        }
        selection.toggle(item)
    }

    pub fn deselect(&self, item: &ItemRef) {
        write(&self.shared.selection).set(item, false);
    }

    pub fn clear_selection(&self) {
        write(&self.shared.selection).clear();
    }

    /// Select every sibling of `anchor` at its level
    pub fn select_all(&self, anchor: &ItemRef) {
        let snapshot = self.snapshot();
        write(&self.shared.selection).select_all(anchor, &snapshot);
    }

    pub fn is_selected(&self, item: &ItemRef) -> bool {
        read(&self.shared.selection).is_selected(item)
    }

    pub fn has_selected_ancestor(&self, item: &ItemRef) -> bool {
        read(&self.shared.selection).has_selected_ancestor(item)
    }

    pub fn has_selected_descendant(&self, item: &ItemRef) -> bool {
        read(&self.shared.selection).has_selected_descendant(item)
    }

    /// Selected references in document order; `reverse` gives deepest first
    pub fn ordered_selection(&self, reverse: bool) -> Vec<ItemRef> {
        let snapshot = self.snapshot();
        read(&self.shared.selection).get_selected_ordered(snapshot.order(), reverse)
    }

    // ---- Clipboard ----

    /// Snapshot the selection into the clipboard
    pub fn copy(&self) -> Clipboard {
        self.fill_clipboard(false)
    }

    /// Snapshot the selection into the clipboard, flagged as cut
    pub fn cut(&self) -> Clipboard {
        self.fill_clipboard(true)
    }

    fn fill_clipboard(&self, cut: bool) -> Clipboard {
        let clipboard = Clipboard {
            items: self.ordered_selection(false),
            cut,
        };
        *write(&self.shared.clipboard) = clipboard.clone();
        clipboard
    }

    pub fn clipboard(&self) -> Clipboard {
        read(&self.shared.clipboard).clone()
    }

    pub fn clear_clipboard(&self) {
        *write(&self.shared.clipboard) = Clipboard::default();
    }

    // ---- Statistics ----

    /// Cached statistics of `item`, zero if it does not resolve
    pub fn statistics_for(&self, item: &ItemRef) -> Statistics {
        let snapshot = self.snapshot();
        if !snapshot.resolves(item) {
            return Statistics::default();
        }
        self.shared.statistics.ensure([item.document()], &snapshot);
        self.shared.statistics.statistics_for(item)
    }

    /// Merged statistics of several references; stale ones are skipped
    pub fn merge_selection(&self, items: &[ItemRef]) -> Statistics {
        let snapshot = self.snapshot();
        let live: Vec<ItemRef> = items
            .iter()
            .copied()
            .filter(|item| snapshot.resolves(item))
            .collect();
        self.shared
            .statistics
            .ensure(live.iter().map(|item| item.document()), &snapshot);
        self.shared.statistics.merge(&live, snapshot.order())
    }

    /// Merged statistics of the current selection
    pub fn selection_statistics(&self) -> Statistics {
        self.merge_selection(&self.ordered_selection(false))
    }

    /// Cached statistics tree of a whole document
    pub fn document_statistics(&self, id: DocumentId) -> Option<Arc<DocumentStatistics>> {
        self.shared.statistics.ensure([id], &self.snapshot());
        self.shared.statistics.document(id)
    }

    // ---- Simplification ----

    /// Anchors of a segment exposed at view `level` or coarser
    pub fn anchors_at_or_below(&self, segment: &ItemRef, level: u32) -> Vec<TaggedIndex> {
        self.shared
            .simplification
            .anchors_at_or_below(segment, level, &self.snapshot())
    }

    /// Indices of a segment's points retained at `tolerance`
    pub fn points_above_tolerance(&self, segment: &ItemRef, tolerance: f64) -> Vec<usize> {
        self.shared
            .simplification
            .points_above_tolerance(segment, tolerance, &self.snapshot())
    }

    /// Points [`EditorContext::reduce_segment`] would keep
    pub fn reduction_preview(&self, segment: &ItemRef, tolerance: f64) -> Vec<TrackPoint> {
        self.shared
            .simplification
            .hierarchy(segment, &self.snapshot())
            .map(|h| {
                h.points_above_tolerance(tolerance)
                    .into_iter()
                    .filter_map(|i| h.points().get(i).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    // ---- Notifications ----

    /// Register `listener` for change events
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        write(&self.shared.listeners).push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = write(&self.shared.listeners);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Release subscriptions, selection, clipboard and derived caches.
    ///
    /// Documents and history stay in the store; caches are rebuilt on demand
    /// if the context keeps being used.
    pub fn dispose(&self) {
        write(&self.shared.listeners).clear();
        self.clear_selection();
        self.clear_clipboard();
        self.shared.statistics.clear();
        self.shared.simplification.clear();
        tracing::debug!("Editor context disposed");
    }
}

/// Run a mutator, turning a panic into a rejected edit
fn run_mutator<F>(mutator: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    catch_unwind(AssertUnwindSafe(mutator)).unwrap_or_else(|payload| {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::warn!("Mutator panicked, edit discarded: {}", reason);
        Err(EditError::mutation(format!("mutator panicked: {reason}")))
    })
}

fn segment_address(item: &ItemRef) -> Result<(DocumentId, usize, usize)> {
    match *item {
        ItemRef::Segment {
            document,
            track,
            segment,
        } => Ok((document, track, segment)),
        _ => Err(EditError::mutation(format!("{item:?} is not a segment"))),
    }
}

fn remove_item(draft: &mut CollectionDraft, item: &ItemRef) {
    match *item {
        ItemRef::Document(id) => {
            draft.remove(id);
        }
        ItemRef::Track { document, track } => {
            if let Some(doc) = draft.get_mut(document)
                && track < doc.tracks.len()
            {
                doc.tracks.remove(track);
            }
        }
        ItemRef::Segment {
            document,
            track,
            segment,
        } => {
            if let Some(t) = draft
                .get_mut(document)
                .and_then(|doc| doc.tracks.get_mut(track))
                && segment < t.segments.len()
            {
                t.segments.remove(segment);
            }
        }
        ItemRef::Waypoints(document) => {
            if let Some(doc) = draft.get_mut(document) {
                doc.waypoints.clear();
            }
        }
        ItemRef::Waypoint { document, waypoint } => {
            if let Some(doc) = draft.get_mut(document)
                && waypoint < doc.waypoints.len()
            {
                doc.waypoints.remove(waypoint);
            }
        }
    }
}
