//! Whole-tree diffing for hot reloads.
//!
//! When the external runtime restarts (source edit, crash recovery), the
//! new instance produces a fresh tree with its own node ids. Connected
//! viewers must not resynchronize from scratch: [`diff_snapshots`]
//! computes a minimal patch between the retained canonical tree and the
//! new one, and [`replay`] feeds that patch back through the ordinary
//! mutation path so the per-connection diff machinery is reused as-is.
//!
//! Ids are the hard part. The new instance may reuse an id that is still
//! live in viewers for a *different* node. The differ therefore runs a
//! second pass over its own ops against a working copy of the tree,
//! minting a fresh client-facing id wherever an introduced id would
//! collide, and records the internal→client-facing pairs so later live
//! mutations from the new instance translate correctly.
//!
//! Ops address nodes by child-index *path* from the root, evaluated
//! against the tree state at the moment the op is applied. Paths dodge
//! the id question entirely: they are valid in both id spaces.

use std::collections::HashSet;

use crate::mutation::{RawMutation, TreeMutation};
use crate::tree::{NodeId, NodeSnapshot, NodeStore, TreeError};

/// One reload-time id translation: the new runtime instance knows the
/// node as `internal`, connected viewers as `client_facing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeIdRemapping {
    pub internal: NodeId,
    pub client_facing: NodeId,
}

/// A single patch step. Paths are child-index chains from the document
/// root (`[]` is the root itself) and refer to the tree as patched by
/// all preceding ops.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOp {
    SetAttribute {
        path: Vec<usize>,
        attribute: String,
        value: Option<String>,
    },
    SetText {
        path: Vec<usize>,
        text: Option<String>,
    },
    /// Insert `node` as child `index` of the node at `path`.
    InsertChild {
        path: Vec<usize>,
        index: usize,
        node: NodeSnapshot,
    },
    /// Remove child `index` of the node at `path`, subtree included.
    RemoveChild {
        path: Vec<usize>,
        index: usize,
    },
    /// Replace child `index` of the node at `path` with `node`.
    ReplaceChild {
        path: Vec<usize>,
        index: usize,
        node: NodeSnapshot,
    },
    /// The node at `path` keeps its position, attributes, text, and
    /// children but changes id. Viewers observe this as the subtree
    /// being removed and re-added under the new id.
    ReplaceNodeId {
        path: Vec<usize>,
        node_id: NodeId,
    },
}

/// The outcome of diffing the retained tree against a reloaded one.
#[derive(Debug, Clone, PartialEq)]
pub struct ReloadDiff {
    pub ops: Vec<PatchOp>,
    pub remappings: Vec<NodeIdRemapping>,
    /// Minting floor for the store after replay: above every id in
    /// either tree and every minted id.
    pub next_node_id: NodeId,
}

impl ReloadDiff {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Diff the retained canonical tree (`before`) against the reloaded
/// runtime's tree (`after`).
///
/// The returned ops are in client-facing id space, collision-free
/// against `before`, and applying them via [`replay`] transforms the
/// store into `after` modulo the recorded remappings.
pub fn diff_snapshots(before: &NodeSnapshot, after: &NodeSnapshot) -> ReloadDiff {
    let mut ops = Vec::new();
    if before.tag != after.tag {
        log::warn!(
            "reload changed the root tag from <{}> to <{}>; diffing in place",
            before.tag,
            after.tag
        );
    }
    // The root keeps its client-facing id unconditionally: an id change
    // there is absorbed by a remapping alone, no op.
    diff_matched(&mut Vec::new(), before, after, true, &mut ops);

    let mut state = RemapState::new(before, after);
    if before.node_id != after.node_id {
        state.remappings.push(NodeIdRemapping {
            internal: after.node_id,
            client_facing: before.node_id,
        });
    }
    let mut working = before.clone();
    for op in &mut ops {
        state.admit(&mut working, op);
    }
    ReloadDiff {
        ops,
        remappings: state.remappings,
        next_node_id: state.next,
    }
}

/// Apply a reload diff to the live store, emitting the canonical
/// mutations viewers must observe. Installs the diff's remappings and
/// raises the minting floor; previous remappings die with the old
/// runtime instance.
pub fn replay(store: &mut NodeStore, diff: &ReloadDiff) -> Result<Vec<TreeMutation>, TreeError> {
    store.clear_remappings();
    let mut out = Vec::new();
    for op in &diff.ops {
        match op {
            PatchOp::SetAttribute {
                path,
                attribute,
                value,
            } => {
                let target = node_at_path(store, path)?;
                out.push(store.apply_raw(&RawMutation::Attributes {
                    target,
                    attribute: attribute.clone(),
                    value: value.clone(),
                })?);
            }
            PatchOp::SetText { path, text } => {
                let target = node_at_path(store, path)?;
                out.push(store.apply_raw(&RawMutation::CharacterData {
                    target,
                    text: text.clone(),
                })?);
            }
            PatchOp::InsertChild { path, index, node } => {
                let parent = node_at_path(store, path)?;
                let previous_sibling = sibling_before(store, parent, *index)?;
                out.push(store.apply_raw(&RawMutation::ChildList {
                    target: parent,
                    added: vec![node.clone()],
                    removed: vec![],
                    previous_sibling,
                })?);
            }
            PatchOp::RemoveChild { path, index } => {
                let parent = node_at_path(store, path)?;
                let child = child_at(store, parent, *index)?;
                out.push(store.apply_raw(&RawMutation::ChildList {
                    target: parent,
                    added: vec![],
                    removed: vec![child],
                    previous_sibling: None,
                })?);
            }
            PatchOp::ReplaceChild { path, index, node } => {
                let parent = node_at_path(store, path)?;
                let child = child_at(store, parent, *index)?;
                let previous_sibling = sibling_before(store, parent, *index)?;
                out.push(store.apply_raw(&RawMutation::ChildList {
                    target: parent,
                    added: vec![],
                    removed: vec![child],
                    previous_sibling: None,
                })?);
                out.push(store.apply_raw(&RawMutation::ChildList {
                    target: parent,
                    added: vec![node.clone()],
                    removed: vec![],
                    previous_sibling,
                })?);
            }
            PatchOp::ReplaceNodeId { path, node_id } => {
                let old = node_at_path(store, path)?;
                let parent = store
                    .get(old)?
                    .parent
                    .ok_or(TreeError::NodeNotFound(old))?;
                let index = store
                    .get(parent)?
                    .children
                    .iter()
                    .position(|c| *c == old)
                    .ok_or(TreeError::SiblingNotFound {
                        parent,
                        sibling: old,
                    })?;
                let previous_sibling = sibling_before(store, parent, index)?;
                let mut subtree = store.snapshot_of(old)?;
                subtree.node_id = *node_id;
                out.push(store.apply_raw(&RawMutation::ChildList {
                    target: parent,
                    added: vec![],
                    removed: vec![old],
                    previous_sibling: None,
                })?);
                out.push(store.apply_raw(&RawMutation::ChildList {
                    target: parent,
                    added: vec![subtree],
                    removed: vec![],
                    previous_sibling,
                })?);
            }
        }
    }
    for remapping in &diff.remappings {
        store.install_remapping(remapping.internal, remapping.client_facing);
    }
    store.raise_minting_floor(diff.next_node_id);
    Ok(out)
}

fn node_at_path(store: &NodeStore, path: &[usize]) -> Result<NodeId, TreeError> {
    let mut current = store.root().ok_or(TreeError::NotLoaded)?;
    for &index in path {
        current = child_at(store, current, index)?;
    }
    Ok(current)
}

fn child_at(store: &NodeStore, parent: NodeId, index: usize) -> Result<NodeId, TreeError> {
    store
        .get(parent)?
        .children
        .get(index)
        .copied()
        .ok_or(TreeError::ChildIndexOutOfBounds { parent, index })
}

fn sibling_before(
    store: &NodeStore,
    parent: NodeId,
    index: usize,
) -> Result<Option<NodeId>, TreeError> {
    if index == 0 {
        return Ok(None);
    }
    Ok(Some(child_at(store, parent, index - 1)?))
}

// ── diff construction ─────────────────────────────────────────────────

fn diff_matched(
    path: &mut Vec<usize>,
    before: &NodeSnapshot,
    after: &NodeSnapshot,
    is_root: bool,
    ops: &mut Vec<PatchOp>,
) {
    if !is_root && before.node_id != after.node_id {
        ops.push(PatchOp::ReplaceNodeId {
            path: path.clone(),
            node_id: after.node_id,
        });
    }
    for (name, value) in &after.attributes {
        if before.attribute(name) != Some(value.as_str()) {
            ops.push(PatchOp::SetAttribute {
                path: path.clone(),
                attribute: name.clone(),
                value: Some(value.clone()),
            });
        }
    }
    for (name, _) in &before.attributes {
        if after.attribute(name).is_none() {
            ops.push(PatchOp::SetAttribute {
                path: path.clone(),
                attribute: name.clone(),
                value: None,
            });
        }
    }
    if before.text != after.text {
        ops.push(PatchOp::SetText {
            path: path.clone(),
            text: after.text.clone(),
        });
    }
    diff_children(path, before, after, ops);
}

/// Merge-walk the two child lists along a tag-keyed common subsequence.
/// `cursor` tracks positions in the evolving (patched) list, so indices
/// stay valid under sequential application. An unmatched removal paired
/// with an unmatched insertion at the same spot coalesces into a
/// replacement.
fn diff_children(
    path: &mut Vec<usize>,
    before: &NodeSnapshot,
    after: &NodeSnapshot,
    ops: &mut Vec<PatchOp>,
) {
    let matches = common_children(&before.children, &after.children);
    let mut cursor = GapCursor::default();
    for (mb, ma) in matches {
        cursor.emit_gap(path, &after.children, mb, ma, ops);
        path.push(cursor.position);
        diff_matched(
            path,
            &before.children[cursor.bi],
            &after.children[cursor.ai],
            false,
            ops,
        );
        path.pop();
        cursor.bi += 1;
        cursor.ai += 1;
        cursor.position += 1;
    }
    cursor.emit_gap(
        path,
        &after.children,
        before.children.len(),
        after.children.len(),
        ops,
    );
}

#[derive(Default)]
struct GapCursor {
    /// Index into the evolving (patched) child list.
    position: usize,
    bi: usize,
    ai: usize,
}

impl GapCursor {
    fn emit_gap(
        &mut self,
        path: &[usize],
        after_children: &[NodeSnapshot],
        b_end: usize,
        a_end: usize,
        ops: &mut Vec<PatchOp>,
    ) {
        while self.bi < b_end && self.ai < a_end {
            ops.push(PatchOp::ReplaceChild {
                path: path.to_vec(),
                index: self.position,
                node: after_children[self.ai].clone(),
            });
            self.bi += 1;
            self.ai += 1;
            self.position += 1;
        }
        while self.bi < b_end {
            ops.push(PatchOp::RemoveChild {
                path: path.to_vec(),
                index: self.position,
            });
            self.bi += 1;
        }
        while self.ai < a_end {
            ops.push(PatchOp::InsertChild {
                path: path.to_vec(),
                index: self.position,
                node: after_children[self.ai].clone(),
            });
            self.ai += 1;
            self.position += 1;
        }
    }
}

/// Longest common subsequence over child tags. Child lists are small,
/// the quadratic table is fine.
fn common_children(before: &[NodeSnapshot], after: &[NodeSnapshot]) -> Vec<(usize, usize)> {
    let n = before.len();
    let m = after.len();
    let mut table = vec![0u32; (n + 1) * (m + 1)];
    let at = |i: usize, j: usize| i * (m + 1) + j;
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[at(i, j)] = if before[i].tag == after[j].tag {
                table[at(i + 1, j + 1)] + 1
            } else {
                table[at(i + 1, j)].max(table[at(i, j + 1)])
            };
        }
    }
    let mut pairs = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if before[i].tag == after[j].tag {
            pairs.push((i, j));
            i += 1;
            j += 1;
        } else if table[at(i + 1, j)] >= table[at(i, j + 1)] {
            i += 1;
        } else {
            j += 1;
        }
    }
    pairs
}

// ── collision minting ─────────────────────────────────────────────────

struct RemapState {
    live: HashSet<NodeId>,
    next: NodeId,
    remappings: Vec<NodeIdRemapping>,
}

impl RemapState {
    fn new(before: &NodeSnapshot, after: &NodeSnapshot) -> Self {
        let mut live = Vec::new();
        before.collect_ids(&mut live);
        Self {
            live: live.into_iter().collect(),
            next: before.max_node_id().max(after.max_node_id()) + 1,
            remappings: Vec::new(),
        }
    }

    /// Rewrite one op so every id it introduces is free, updating the
    /// working tree and the live-id set to match its application.
    fn admit(&mut self, working: &mut NodeSnapshot, op: &mut PatchOp) {
        match op {
            PatchOp::SetAttribute { .. } | PatchOp::SetText { .. } => {}
            PatchOp::InsertChild { path, index, node } => {
                self.mint_into(node);
                let parent = snapshot_at_mut(working, path);
                parent.children.insert(*index, node.clone());
            }
            PatchOp::RemoveChild { path, index } => {
                let parent = snapshot_at_mut(working, path);
                let removed = parent.children.remove(*index);
                self.release(&removed);
            }
            PatchOp::ReplaceChild { path, index, node } => {
                let parent = snapshot_at_mut(working, path);
                let removed = parent.children[*index].clone();
                self.release(&removed);
                self.mint_into(node);
                let parent = snapshot_at_mut(working, path);
                parent.children[*index] = node.clone();
            }
            PatchOp::ReplaceNodeId { path, node_id } => {
                let target = snapshot_at_mut(working, path);
                let old = target.node_id;
                // The subtree's other ids stay live through the swap, so
                // the new id may only reuse the one being dropped.
                if *node_id != old && self.live.contains(node_id) {
                    let minted = self.next;
                    self.next += 1;
                    log::debug!(
                        "reload reuses live id {node_id}, minted client-facing id {minted}"
                    );
                    self.remappings.push(NodeIdRemapping {
                        internal: *node_id,
                        client_facing: minted,
                    });
                    *node_id = minted;
                }
                self.live.remove(&old);
                self.live.insert(*node_id);
                target.node_id = *node_id;
            }
        }
    }

    fn mint_into(&mut self, node: &mut NodeSnapshot) {
        if self.live.contains(&node.node_id) {
            let minted = self.next;
            self.next += 1;
            log::debug!(
                "reload reuses live id {}, minted client-facing id {minted}",
                node.node_id
            );
            self.remappings.push(NodeIdRemapping {
                internal: node.node_id,
                client_facing: minted,
            });
            node.node_id = minted;
        }
        self.live.insert(node.node_id);
        for child in &mut node.children {
            self.mint_into(child);
        }
    }

    fn release(&mut self, node: &NodeSnapshot) {
        let mut ids = Vec::new();
        node.collect_ids(&mut ids);
        for id in ids {
            self.live.remove(&id);
        }
    }
}

fn snapshot_at_mut<'a>(root: &'a mut NodeSnapshot, path: &[usize]) -> &'a mut NodeSnapshot {
    let mut current = root;
    for &index in path {
        current = &mut current.children[index];
    }
    current
}
