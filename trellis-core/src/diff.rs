//! Per-connection diff computation.
//!
//! One [`TreeMutation`] plus one connection's [`ConnectionView`] yields at
//! most one abstract [`Diff`], updating the view's visible-set in place.
//! The diff value is wire-format agnostic: protocol adapters own
//! serialization and connection-id bookkeeping, nothing here does.
//!
//! The guarantees this module enforces:
//!
//! - a node id is added to the visible-set exactly when a diff first
//!   describes it, and removed exactly when a removal diff is emitted;
//! - subtrees rooted at an invisible node are never visited, so no diff
//!   ever references a node the connection has not observed;
//! - insertion anchors skip siblings the connection cannot see.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::mutation::TreeMutation;
use crate::subjectivity::{
    parse_connection_id_list, ConnectionId, VisibilityPolicy, NOBODY_CONNECTION_ID,
};
use crate::tree::{is_reserved_attribute, NodeId, NodeStore, TreeError, VISIBLE_TO_ATTRIBUTE};

/// A node as transmitted to one connection: subjectivity-filtered
/// children, reserved attributes stripped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescription {
    pub node_id: NodeId,
    pub tag: String,
    pub attributes: Vec<(String, String)>,
    pub text: Option<String>,
    pub children: Vec<NodeDescription>,
}

/// Which reserved visibility attribute changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityMode {
    VisibleTo,
    HiddenFrom,
}

/// One per-connection change, ready for a protocol adapter to serialize.
#[derive(Debug, Clone, PartialEq)]
pub enum Diff {
    /// Full visible tree (new connection, or first load).
    Snapshot {
        root: NodeDescription,
        document_time: u64,
    },
    AttributesChanged {
        node_id: NodeId,
        attribute: String,
        /// `None` means the attribute was removed.
        value: Option<String>,
    },
    /// Children added and/or removed under `node_id`. Also the shape of
    /// the reload-replay placeholder (both lists empty, document time
    /// attached).
    ChildrenChanged {
        node_id: NodeId,
        /// Insertion anchor: first preceding sibling visible to this
        /// connection, or `None` for the front.
        previous_node_id: Option<NodeId>,
        added: Vec<NodeDescription>,
        removed: Vec<NodeId>,
        document_time: Option<u64>,
    },
    TextChanged {
        node_id: NodeId,
        text: String,
    },
    /// A reserved visibility attribute changed on a node that stays
    /// visible. Serialized by the current dialect only; the legacy
    /// dialect drops it (the attribute itself is never transmitted).
    VisibilityModeChanged {
        node_id: NodeId,
        mode: VisibilityMode,
        connections: Vec<ConnectionId>,
    },
}

/// One connection's materialized view: the external ids it authenticates
/// as, the hidden-from policy its dialect uses, and the set of node ids
/// it has been shown.
#[derive(Debug)]
pub struct ConnectionView {
    pub external_ids: BTreeSet<ConnectionId>,
    pub policy: VisibilityPolicy,
    pub visible: HashSet<NodeId>,
}

impl ConnectionView {
    pub fn new(policy: VisibilityPolicy) -> Self {
        Self {
            external_ids: BTreeSet::new(),
            policy,
            visible: HashSet::new(),
        }
    }

    pub fn with_ids(policy: VisibilityPolicy, ids: &[ConnectionId]) -> Self {
        Self {
            external_ids: ids.iter().copied().collect(),
            policy,
            visible: HashSet::new(),
        }
    }

    /// Whether this connection may reference `node_id` (remote event
    /// validation).
    pub fn can_reference(&self, node_id: NodeId) -> bool {
        self.visible.contains(&node_id)
    }
}

/// Describe the full visible tree for a connection, rebuilding its
/// visible-set from scratch.
pub fn snapshot_view(
    store: &NodeStore,
    view: &mut ConnectionView,
) -> Result<NodeDescription, TreeError> {
    let root = store.root().ok_or(TreeError::NotLoaded)?;
    view.visible.clear();
    describe(store, view, root)
}

/// Translate one canonical mutation into this connection's diff, if any.
pub fn apply_mutation(
    store: &NodeStore,
    view: &mut ConnectionView,
    mutation: &TreeMutation,
) -> Result<Option<Diff>, TreeError> {
    match mutation {
        TreeMutation::Attributes {
            target,
            attribute,
            value,
        } => apply_attributes(store, view, *target, attribute, value.as_deref()),
        TreeMutation::ChildList {
            target,
            added,
            removed,
            previous_sibling,
        } => apply_child_list(store, view, *target, added, removed, *previous_sibling),
        TreeMutation::CharacterData { target, text } => {
            if view.visible.contains(target) {
                Ok(Some(Diff::TextChanged {
                    node_id: *target,
                    text: text.clone().unwrap_or_default(),
                }))
            } else {
                Ok(None)
            }
        }
    }
}

fn apply_attributes(
    store: &NodeStore,
    view: &mut ConnectionView,
    target: NodeId,
    attribute: &str,
    value: Option<&str>,
) -> Result<Option<Diff>, TreeError> {
    let was = view.visible.contains(&target);
    let node = store.get(target)?;
    let parent_visible = match node.parent {
        Some(parent) => view.visible.contains(&parent),
        None => true,
    };
    let should =
        parent_visible && store.is_visible_to(target, &view.external_ids, view.policy)?;
    match (was, should) {
        (true, true) => {
            if is_reserved_attribute(attribute) {
                let mode = if attribute == VISIBLE_TO_ATTRIBUTE {
                    VisibilityMode::VisibleTo
                } else {
                    VisibilityMode::HiddenFrom
                };
                let mut connections: Vec<ConnectionId> = value
                    .and_then(parse_connection_id_list)
                    .map(|ids| {
                        ids.into_iter()
                            .filter(|id| *id != NOBODY_CONNECTION_ID)
                            .collect()
                    })
                    .unwrap_or_default();
                connections.sort_unstable();
                Ok(Some(Diff::VisibilityModeChanged {
                    node_id: target,
                    mode,
                    connections,
                }))
            } else {
                Ok(Some(Diff::AttributesChanged {
                    node_id: target,
                    attribute: attribute.to_string(),
                    value: value.map(str::to_string),
                }))
            }
        }
        (false, true) => {
            let Some(parent) = node.parent else {
                return Ok(None);
            };
            let anchor = anchor_before_child(store, view, parent, target)?;
            let description = describe(store, view, target)?;
            Ok(Some(Diff::ChildrenChanged {
                node_id: parent,
                previous_node_id: anchor,
                added: vec![description],
                removed: vec![],
                document_time: None,
            }))
        }
        (true, false) => {
            let Some(parent) = node.parent else {
                return Ok(None);
            };
            for id in store.subtree_ids(target)? {
                view.visible.remove(&id);
            }
            Ok(Some(Diff::ChildrenChanged {
                node_id: parent,
                previous_node_id: None,
                added: vec![],
                removed: vec![target],
                document_time: None,
            }))
        }
        (false, false) => Ok(None),
    }
}

fn apply_child_list(
    store: &NodeStore,
    view: &mut ConnectionView,
    target: NodeId,
    added: &[NodeId],
    removed: &[crate::mutation::RemovedSubtree],
    previous_sibling: Option<NodeId>,
) -> Result<Option<Diff>, TreeError> {
    let parent_visible = view.visible.contains(&target);
    let mut removed_out = Vec::new();
    for subtree in removed {
        if view.visible.remove(&subtree.root) {
            removed_out.push(subtree.root);
        }
        for id in &subtree.node_ids {
            view.visible.remove(id);
        }
    }
    if !parent_visible {
        return Ok(None);
    }
    let mut added_out = Vec::new();
    for &child in added {
        if store.is_visible_to(child, &view.external_ids, view.policy)? {
            added_out.push(describe(store, view, child)?);
        }
    }
    if added_out.is_empty() && removed_out.is_empty() {
        return Ok(None);
    }
    let anchor = if added_out.is_empty() {
        None
    } else {
        anchor_from_sibling(store, view, target, previous_sibling)?
    };
    Ok(Some(Diff::ChildrenChanged {
        node_id: target,
        previous_node_id: anchor,
        added: added_out,
        removed: removed_out,
        document_time: None,
    }))
}

/// Recompute an existing view after its external-id set changed
/// (user connect/disconnect on a multiplexed socket), emitting
/// reveal/hide diffs for exactly the visibility boundary.
pub fn resync_view(
    store: &NodeStore,
    view: &mut ConnectionView,
) -> Result<Vec<Diff>, TreeError> {
    let root = store.root().ok_or(TreeError::NotLoaded)?;
    let mut diffs = Vec::new();
    if view.visible.contains(&root) {
        resync_children(store, view, root, &mut diffs)?;
    }
    Ok(diffs)
}

fn resync_children(
    store: &NodeStore,
    view: &mut ConnectionView,
    parent: NodeId,
    diffs: &mut Vec<Diff>,
) -> Result<(), TreeError> {
    let children = store.get(parent)?.children.clone();
    for child in children {
        let was = view.visible.contains(&child);
        let should = store.is_visible_to(child, &view.external_ids, view.policy)?;
        match (was, should) {
            (true, true) => resync_children(store, view, child, diffs)?,
            (false, false) => {}
            (false, true) => {
                let anchor = anchor_before_child(store, view, parent, child)?;
                let description = describe(store, view, child)?;
                diffs.push(Diff::ChildrenChanged {
                    node_id: parent,
                    previous_node_id: anchor,
                    added: vec![description],
                    removed: vec![],
                    document_time: None,
                });
            }
            (true, false) => {
                for id in store.subtree_ids(child)? {
                    view.visible.remove(&id);
                }
                diffs.push(Diff::ChildrenChanged {
                    node_id: parent,
                    previous_node_id: None,
                    added: vec![],
                    removed: vec![child],
                    document_time: None,
                });
            }
        }
    }
    Ok(())
}

/// Depth-first pre-order description. Every visited node id is added to
/// the visible-set as it is emitted; children failing subjectivity are
/// skipped along with their subtrees.
pub fn describe(
    store: &NodeStore,
    view: &mut ConnectionView,
    node_id: NodeId,
) -> Result<NodeDescription, TreeError> {
    let node = store.get(node_id)?;
    view.visible.insert(node_id);
    let mut children = Vec::with_capacity(node.children.len());
    for &child in &node.children {
        if store.is_visible_to(child, &view.external_ids, view.policy)? {
            children.push(describe(store, view, child)?);
        }
    }
    Ok(NodeDescription {
        node_id,
        tag: node.tag.clone(),
        attributes: node
            .attributes
            .iter()
            .filter(|(k, _)| !is_reserved_attribute(k))
            .cloned()
            .collect(),
        text: node.text.clone(),
        children,
    })
}

/// First sibling before `child` (exclusive) that this connection can see.
fn anchor_before_child(
    store: &NodeStore,
    view: &ConnectionView,
    parent: NodeId,
    child: NodeId,
) -> Result<Option<NodeId>, TreeError> {
    let children = &store.get(parent)?.children;
    let position = children
        .iter()
        .position(|c| *c == child)
        .ok_or(TreeError::SiblingNotFound {
            parent,
            sibling: child,
        })?;
    Ok(children[..position]
        .iter()
        .rev()
        .find(|c| view.visible.contains(c))
        .copied())
}

/// First sibling at or before `from` that this connection can see
/// (`None` means the insertion happened at the front).
fn anchor_from_sibling(
    store: &NodeStore,
    view: &ConnectionView,
    parent: NodeId,
    from: Option<NodeId>,
) -> Result<Option<NodeId>, TreeError> {
    let Some(from) = from else {
        return Ok(None);
    };
    let children = &store.get(parent)?.children;
    let position = children
        .iter()
        .position(|c| *c == from)
        .ok_or(TreeError::SiblingNotFound {
            parent,
            sibling: from,
        })?;
    Ok(children[..=position]
        .iter()
        .rev()
        .find(|c| view.visible.contains(c))
        .copied())
}
