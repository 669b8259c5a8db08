//! The shared mutation vocabulary.
//!
//! Live mutations from the document runtime and replayed reload
//! operations both funnel into [`TreeMutation`] — one record shape, so
//! the per-connection diffing path is reused verbatim across the two
//! flows. Mutation kinds are a closed enum: adding a dialect that forgets
//! a kind fails to compile.

use crate::tree::{NodeId, NodeSnapshot};

/// A mutation as reported by the external document runtime, in the
/// runtime's own (internal) node-id space. Exactly one record is
/// delivered per callback, in causal order.
#[derive(Debug, Clone, PartialEq)]
pub enum RawMutation {
    /// An attribute was set or removed on `target`.
    Attributes {
        target: NodeId,
        attribute: String,
        /// `None` means the attribute was removed.
        value: Option<String>,
    },
    /// Children were added and/or removed under `target`.
    ChildList {
        target: NodeId,
        /// Full subtree snapshots for newly inserted children, in
        /// insertion order.
        added: Vec<NodeSnapshot>,
        /// Ids of removed children (their subtrees go with them).
        removed: Vec<NodeId>,
        /// Sibling immediately before the insertion point, if any.
        previous_sibling: Option<NodeId>,
    },
    /// Text content of `target` changed.
    CharacterData {
        target: NodeId,
        text: Option<String>,
    },
}

/// A removed child together with every node id in its detached subtree,
/// captured before the nodes were dropped from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedSubtree {
    pub root: NodeId,
    /// Pre-order id list, `root` included.
    pub node_ids: Vec<NodeId>,
}

/// A canonical mutation in client-facing id space, produced by applying a
/// [`RawMutation`] to the node store (or by replaying a reload
/// operation). This is what the diff engine consumes, once per
/// connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeMutation {
    Attributes {
        target: NodeId,
        attribute: String,
        value: Option<String>,
    },
    ChildList {
        target: NodeId,
        /// Client-facing ids of inserted children, in insertion order.
        added: Vec<NodeId>,
        removed: Vec<RemovedSubtree>,
        previous_sibling: Option<NodeId>,
    },
    CharacterData {
        target: NodeId,
        text: Option<String>,
    },
}

impl TreeMutation {
    /// The node the mutation applies to (the parent, for child-list
    /// mutations).
    pub fn target(&self) -> NodeId {
        match self {
            TreeMutation::Attributes { target, .. }
            | TreeMutation::ChildList { target, .. }
            | TreeMutation::CharacterData { target, .. } => *target,
        }
    }
}
