//! Sparse tree of selected hierarchy nodes
//!
//! Only explicitly selected nodes and the path leading to them are stored.
//! Selecting a coarse node covers its descendants for queries without
//! creating entries for them, and explicit flags of children are kept
//! independently of their ancestors' flags.

use crate::collection::DocumentCollection;
use crate::document::DocumentId;
use crate::item::{ItemRef, PathStep};

use std::collections::{BTreeMap, HashMap};

#[derive(Clone, Debug, Default)]
struct SelectionNode {
    selected: bool,
    /// Explicitly selected nodes strictly below this one
    selected_descendants: usize,
    children: BTreeMap<PathStep, SelectionNode>,
}

impl SelectionNode {
    fn is_vacant(&self) -> bool {
        !self.selected && self.children.is_empty()
    }

    fn selected_count(&self) -> usize {
        usize::from(self.selected) + self.selected_descendants
    }
}

/// Set of selected item references across any number of documents.
///
/// Every operation walks at most one root path, so its cost is bounded by
/// the depth of the hierarchy (three steps).
#[derive(Clone, Debug, Default)]
pub struct SelectionTree {
    root: SelectionNode,
}

fn set_at(node: &mut SelectionNode, path: &[PathStep], selected: bool) -> bool {
    let Some((step, rest)) = path.split_first() else {
        let changed = node.selected != selected;
        node.selected = selected;
        return changed;
    };

    if !selected && !node.children.contains_key(step) {
        return false;
    }
    let child = node.children.entry(*step).or_default();
    let changed = set_at(child, rest, selected);
    let vacant = child.is_vacant();
    if vacant {
        node.children.remove(step);
    }
    if changed {
        if selected {
            node.selected_descendants += 1;
        } else {
            node.selected_descendants -= 1;
        }
    }
    changed
}

fn collect(node: &SelectionNode, path: &mut Vec<PathStep>, out: &mut Vec<ItemRef>) {
    if node.selected
        && let Some(item) = ItemRef::from_path(path)
    {
        out.push(item);
    }
    for (step, child) in &node.children {
        path.push(*step);
        collect(child, path, out);
        path.pop();
    }
}

impl SelectionTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, item: &ItemRef) -> Option<&SelectionNode> {
        item.path()
            .iter()
            .try_fold(&self.root, |node, step| node.children.get(step))
    }

    /// Set the explicit flag of `item`. Returns whether anything changed.
    pub fn set(&mut self, item: &ItemRef, selected: bool) -> bool {
        set_at(&mut self.root, &item.path(), selected)
    }

    /// Flip the explicit flag of `item`, returning the new flag
    pub fn toggle(&mut self, item: &ItemRef) -> bool {
        let selected = !self.is_selected(item);
        self.set(item, selected);
        selected
    }

    /// Replace the whole selection by `item`
    pub fn select(&mut self, item: &ItemRef) {
        self.clear();
        self.set(item, true);
    }

    /// Add `item` to the selection
    pub fn add_select(&mut self, item: &ItemRef) {
        self.set(item, true);
    }

    /// Replace the selection by every sibling of `anchor` at its level.
    ///
    /// A document anchor selects all documents, a track all tracks of its
    /// document, a segment all segments of its track and a waypoint all
    /// waypoints of its document. The waypoint group has no siblings of its
    /// kind and is selected alone.
    pub fn select_all(&mut self, anchor: &ItemRef, collection: &DocumentCollection) {
        self.clear();
        let siblings: Vec<ItemRef> = match *anchor {
            ItemRef::Document(_) => collection
                .order()
                .iter()
                .map(|id| ItemRef::Document(*id))
                .collect(),
            ItemRef::Track { document, .. } => collection
                .get(document)
                .map(|doc| {
                    (0..doc.tracks.len())
                        .map(|t| ItemRef::track(document, t))
                        .collect()
                })
                .unwrap_or_default(),
            ItemRef::Segment { document, track, .. } => collection
                .get(document)
                .and_then(|doc| doc.track(track))
                .map(|t| {
                    (0..t.segments.len())
                        .map(|s| ItemRef::segment(document, track, s))
                        .collect()
                })
                .unwrap_or_default(),
            ItemRef::Waypoints(document) => collection
                .contains(document)
                .then_some(ItemRef::Waypoints(document))
                .into_iter()
                .collect(),
            ItemRef::Waypoint { document, .. } => collection
                .get(document)
                .map(|doc| {
                    (0..doc.waypoints.len())
                        .map(|w| ItemRef::waypoint(document, w))
                        .collect()
                })
                .unwrap_or_default(),
        };
        for item in &siblings {
            self.set(item, true);
        }
    }

    pub fn clear(&mut self) {
        self.root = SelectionNode::default();
    }

    /// Explicit flag of `item`; descendants of a selected node are not
    /// explicitly selected themselves.
    pub fn is_selected(&self, item: &ItemRef) -> bool {
        self.node(item).is_some_and(|n| n.selected)
    }

    /// True when a strict ancestor of `item` is selected
    pub fn has_selected_ancestor(&self, item: &ItemRef) -> bool {
        let path = item.path();
        let mut node = &self.root;
        for step in &path[..path.len() - 1] {
            match node.children.get(step) {
                Some(child) if child.selected => return true,
                Some(child) => node = child,
                None => return false,
            }
        }
        false
    }

    /// True when a strict descendant of `item` is selected
    pub fn has_selected_descendant(&self, item: &ItemRef) -> bool {
        self.node(item).is_some_and(|n| n.selected_descendants > 0)
    }

    /// Selected either explicitly or through an ancestor
    pub fn is_covered(&self, item: &ItemRef) -> bool {
        self.is_selected(item) || self.has_selected_ancestor(item)
    }

    /// Number of explicitly selected nodes
    pub fn len(&self) -> usize {
        self.root.selected_count()
    }

    pub fn is_empty(&self) -> bool {
        self.root.selected_descendants == 0
    }

    /// Every explicitly selected reference in tree order
    pub fn selected_items(&self) -> Vec<ItemRef> {
        let mut out = Vec::with_capacity(self.len());
        collect(&self.root, &mut Vec::with_capacity(3), &mut out);
        out
    }

    /// Selected references grouped by document in `document_order`, each
    /// group ordered by level and index.
    ///
    /// With `reverse` the whole list is returned deepest-first (last document
    /// first, highest index first), so that removing the items one by one
    /// never shifts an index that has not been processed yet. Documents
    /// missing from `document_order` are skipped.
    pub fn get_selected_ordered(&self, document_order: &[DocumentId], reverse: bool) -> Vec<ItemRef> {
        let position: HashMap<DocumentId, usize> = document_order
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();

        let mut items: Vec<(usize, ItemRef)> = self
            .selected_items()
            .into_iter()
            .filter_map(|item| position.get(&item.document()).map(|p| (*p, item)))
            .collect();
        items.sort_by_key(|(p, item)| (*p, item.sort_key()));

        let ordered = items.into_iter().map(|(_, item)| item);
        if reverse {
            ordered.rev().collect()
        } else {
            ordered.collect()
        }
    }

    /// Drop every entry below documents for which `keep` returns false.
    /// Returns the number of explicit selections removed.
    pub fn retain_documents<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(DocumentId) -> bool,
    {
        let mut removed = 0;
        self.root.children.retain(|step, child| match step {
            PathStep::Document(id) if !keep(*id) => {
                removed += child.selected_count();
                false
            }
            _ => true,
        });
        self.root.selected_descendants -= removed;
        removed
    }

    /// Drop entries of documents absent from `collection`
    pub fn prune(&mut self, collection: &DocumentCollection) -> usize {
        self.retain_documents(|id| collection.contains(id))
    }
}

/// Snapshot of an ordered selection for copy/cut and paste
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Clipboard {
    pub items: Vec<ItemRef>,
    pub cut: bool,
}

impl Clipboard {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
