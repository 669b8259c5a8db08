//! Canonical document tree for one document instance.
//!
//! The [`NodeStore`] mirrors the external runtime's tree 1:1, but keyed
//! by *client-facing* node ids. The runtime's ids are unique only within
//! one instance lifetime; after a hot reload a new instance may mint ids
//! that collide with ids still live in connected viewers, so every
//! inbound reference passes through the remap tables
//! ([`NodeStore::resolve_inbound`] / [`NodeStore::resolve_outbound`]).
//!
//! Missing nodes are a synchronization bug upstream, never recovered
//! silently: lookups return [`TreeError`] and callers escalate.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::mutation::{RawMutation, RemovedSubtree, TreeMutation};
use crate::subjectivity::{
    parse_connection_id_list, ConnectionId, SubjectivityArena, SubjectivityKey,
    SubjectivityRecord, VisibilityIndex, VisibilityPolicy, NOBODY_CONNECTION_ID,
    UNRESTRICTED_KEY,
};

/// Node id. Assigned by the runtime; remapped client-side when reuse
/// would collide.
pub type NodeId = u64;

/// Reserved attribute naming the connections a subtree is shown to.
pub const VISIBLE_TO_ATTRIBUTE: &str = "visible-to";
/// Reserved attribute naming the connections a subtree is withheld from.
pub const HIDDEN_FROM_ATTRIBUTE: &str = "hidden-from";

/// True for the two reserved visibility attributes, which are consumed
/// here and stripped before transmission.
pub fn is_reserved_attribute(name: &str) -> bool {
    name == VISIBLE_TO_ATTRIBUTE || name == HIDDEN_FROM_ATTRIBUTE
}

/// Internal consistency failures. These indicate the canonical tree and
/// the runtime's mutation stream have diverged and must not be masked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    NodeNotFound(NodeId),
    SiblingNotFound { parent: NodeId, sibling: NodeId },
    ChildIndexOutOfBounds { parent: NodeId, index: usize },
    NotLoaded,
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeNotFound(id) => write!(f, "node {id} not found in canonical tree"),
            Self::SiblingNotFound { parent, sibling } => {
                write!(f, "sibling {sibling} not found under node {parent}")
            }
            Self::ChildIndexOutOfBounds { parent, index } => {
                write!(f, "child index {index} out of bounds under node {parent}")
            }
            Self::NotLoaded => write!(f, "no document tree loaded"),
        }
    }
}

impl std::error::Error for TreeError {}

/// One node of the canonical tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub node_id: NodeId,
    pub tag: String,
    /// Ordered attribute list; order is preserved on the wire.
    pub attributes: Vec<(String, String)>,
    pub text: Option<String>,
    pub children: Vec<NodeId>,
    pub parent: Option<NodeId>,
    /// Effective subjectivity record (shared with the parent unless this
    /// node declares its own visibility attributes).
    pub subjectivity: SubjectivityKey,
}

impl Node {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn set_attribute(&mut self, name: &str, value: Option<&str>) {
        match value {
            Some(v) => {
                if let Some(entry) = self.attributes.iter_mut().find(|(k, _)| k == name) {
                    entry.1 = v.to_string();
                } else {
                    self.attributes.push((name.to_string(), v.to_string()));
                }
            }
            None => self.attributes.retain(|(k, _)| k != name),
        }
    }
}

/// Owned deep copy of a subtree, as delivered by the runtime in
/// snapshots and child-list additions, and as consumed by the reload
/// differ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_id: NodeId,
    pub tag: String,
    pub attributes: Vec<(String, String)>,
    pub text: Option<String>,
    pub children: Vec<NodeSnapshot>,
}

impl NodeSnapshot {
    pub fn new(node_id: NodeId, tag: impl Into<String>) -> Self {
        Self {
            node_id,
            tag: tag.into(),
            attributes: Vec::new(),
            text: None,
            children: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }

    pub fn with_child(mut self, child: NodeSnapshot) -> Self {
        self.children.push(child);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Largest node id in the subtree.
    pub fn max_node_id(&self) -> NodeId {
        self.children
            .iter()
            .map(NodeSnapshot::max_node_id)
            .fold(self.node_id, NodeId::max)
    }

    /// Pre-order id list, self included.
    pub fn collect_ids(&self, out: &mut Vec<NodeId>) {
        out.push(self.node_id);
        for child in &self.children {
            child.collect_ids(out);
        }
    }
}

/// Canonical tree, subjectivity arena, visibility index, and the
/// internal↔client-facing remap tables for one document instance.
///
/// All state is scoped here — per document, explicit create/drop, no
/// process-wide tables.
#[derive(Debug)]
pub struct NodeStore {
    nodes: HashMap<NodeId, Node>,
    root: Option<NodeId>,
    arena: SubjectivityArena,
    index: VisibilityIndex,
    /// runtime-internal id → client-facing id (entries exist only where
    /// they differ).
    inbound: HashMap<NodeId, NodeId>,
    /// client-facing id → runtime-internal id.
    outbound: HashMap<NodeId, NodeId>,
    /// Next id minted on collision; monotonically increasing, never
    /// reused within a document's lifetime.
    next_minted_id: NodeId,
}

impl NodeStore {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            root: None,
            arena: SubjectivityArena::new(),
            index: VisibilityIndex::new(),
            inbound: HashMap::new(),
            outbound: HashMap::new(),
            next_minted_id: 1,
        }
    }

    /// Rebuild the tree from a full runtime snapshot (initial load).
    /// Ids map through unchanged — the store is empty, nothing collides.
    pub fn load_snapshot(&mut self, snapshot: &NodeSnapshot) {
        self.nodes.clear();
        self.arena = SubjectivityArena::new();
        self.index = VisibilityIndex::new();
        self.inbound.clear();
        self.outbound.clear();
        self.next_minted_id = snapshot.max_node_id() + 1;
        let root = self.insert_subtree(snapshot, None, UNRESTRICTED_KEY);
        self.root = Some(root);
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    pub fn get(&self, node_id: NodeId) -> Result<&Node, TreeError> {
        self.nodes.get(&node_id).ok_or(TreeError::NodeNotFound(node_id))
    }

    /// Translate a runtime-internal id to its client-facing id (identity
    /// when unmapped).
    pub fn resolve_inbound(&self, internal: NodeId) -> NodeId {
        self.inbound.get(&internal).copied().unwrap_or(internal)
    }

    /// Translate a client-facing id back to the runtime's id (identity
    /// when unmapped). Used when dispatching remote events.
    pub fn resolve_outbound(&self, client_facing: NodeId) -> NodeId {
        self.outbound.get(&client_facing).copied().unwrap_or(client_facing)
    }

    /// Register a reload-time remapping pair.
    pub fn install_remapping(&mut self, internal: NodeId, client_facing: NodeId) {
        self.inbound.insert(internal, client_facing);
        self.outbound.insert(client_facing, internal);
    }

    /// Drop all remap entries (the id space they translated is gone with
    /// its runtime instance).
    pub fn clear_remappings(&mut self) {
        self.inbound.clear();
        self.outbound.clear();
    }

    /// Raise the minting floor so fresh ids stay above both id spaces.
    pub fn raise_minting_floor(&mut self, floor: NodeId) {
        if floor > self.next_minted_id {
            self.next_minted_id = floor;
        }
    }

    /// Apply one runtime mutation to the canonical tree, returning the
    /// equivalent record in client-facing id space.
    pub fn apply_raw(&mut self, raw: &RawMutation) -> Result<TreeMutation, TreeError> {
        match raw {
            RawMutation::Attributes {
                target,
                attribute,
                value,
            } => {
                let target = self.resolve_inbound(*target);
                let is_root = self.root == Some(target);
                let node = self
                    .nodes
                    .get_mut(&target)
                    .ok_or(TreeError::NodeNotFound(target))?;
                node.set_attribute(attribute, value.as_deref());
                // Visibility attributes on the root are stripped but have
                // no structural effect: the root is visible to everyone.
                if is_reserved_attribute(attribute) && !is_root {
                    self.refresh_subjectivity(target)?;
                }
                Ok(TreeMutation::Attributes {
                    target,
                    attribute: attribute.clone(),
                    value: value.clone(),
                })
            }
            RawMutation::ChildList {
                target,
                added,
                removed,
                previous_sibling,
            } => {
                let target = self.resolve_inbound(*target);
                if !self.nodes.contains_key(&target) {
                    return Err(TreeError::NodeNotFound(target));
                }
                let mut removed_out = Vec::with_capacity(removed.len());
                for r in removed {
                    let root = self.resolve_inbound(*r);
                    let node_ids = self.detach_subtree(root)?;
                    removed_out.push(RemovedSubtree { root, node_ids });
                }
                let previous_sibling = previous_sibling.map(|p| self.resolve_inbound(p));
                let (mut insert_at, parent_key) = {
                    let parent = self.get(target)?;
                    let at = match previous_sibling {
                        Some(prev) => {
                            parent
                                .children
                                .iter()
                                .position(|c| *c == prev)
                                .ok_or(TreeError::SiblingNotFound {
                                    parent: target,
                                    sibling: prev,
                                })?
                                + 1
                        }
                        None => 0,
                    };
                    (at, parent.subjectivity)
                };
                let mut added_out = Vec::with_capacity(added.len());
                for snapshot in added {
                    let child = self.insert_subtree(snapshot, Some(target), parent_key);
                    if let Some(parent) = self.nodes.get_mut(&target) {
                        parent.children.insert(insert_at, child);
                    }
                    insert_at += 1;
                    added_out.push(child);
                }
                Ok(TreeMutation::ChildList {
                    target,
                    added: added_out,
                    removed: removed_out,
                    previous_sibling,
                })
            }
            RawMutation::CharacterData { target, text } => {
                let target = self.resolve_inbound(*target);
                let node = self
                    .nodes
                    .get_mut(&target)
                    .ok_or(TreeError::NodeNotFound(target))?;
                node.text = text.clone();
                Ok(TreeMutation::CharacterData {
                    target,
                    text: text.clone(),
                })
            }
        }
    }

    /// Subjectivity evaluation entry point for one node.
    pub fn is_visible_to(
        &self,
        node_id: NodeId,
        ids: &BTreeSet<ConnectionId>,
        policy: VisibilityPolicy,
    ) -> Result<bool, TreeError> {
        let node = self.get(node_id)?;
        if node.parent.is_none() {
            // Document root is always visible.
            return Ok(true);
        }
        let fast_path = self.index.is_specifically_visible(node_id, ids);
        Ok(self
            .arena
            .is_visible_to(node.subjectivity, ids, policy, fast_path))
    }

    /// Pre-order id list of the subtree rooted at `node_id`.
    pub fn subtree_ids(&self, node_id: NodeId) -> Result<Vec<NodeId>, TreeError> {
        let mut out = Vec::new();
        self.collect_subtree_ids(node_id, &mut out)?;
        Ok(out)
    }

    fn collect_subtree_ids(&self, node_id: NodeId, out: &mut Vec<NodeId>) -> Result<(), TreeError> {
        let node = self.get(node_id)?;
        out.push(node_id);
        for child in &node.children {
            self.collect_subtree_ids(*child, out)?;
        }
        Ok(())
    }

    /// Owned deep copy of the whole tree, for the reload differ.
    pub fn snapshot_tree(&self) -> Result<NodeSnapshot, TreeError> {
        let root = self.root.ok_or(TreeError::NotLoaded)?;
        self.snapshot_subtree(root)
    }

    /// Owned deep copy of one subtree.
    pub fn snapshot_of(&self, node_id: NodeId) -> Result<NodeSnapshot, TreeError> {
        self.snapshot_subtree(node_id)
    }

    fn snapshot_subtree(&self, node_id: NodeId) -> Result<NodeSnapshot, TreeError> {
        let node = self.get(node_id)?;
        let mut children = Vec::with_capacity(node.children.len());
        for child in &node.children {
            children.push(self.snapshot_subtree(*child)?);
        }
        Ok(NodeSnapshot {
            node_id,
            tag: node.tag.clone(),
            attributes: node.attributes.clone(),
            text: node.text.clone(),
            children,
        })
    }

    // ── internals ─────────────────────────────────────────────────────

    /// Insert a subtree, minting a client-facing id for any node whose
    /// runtime id is already live (possible after a reload installed
    /// remappings).
    fn insert_subtree(
        &mut self,
        snapshot: &NodeSnapshot,
        parent: Option<NodeId>,
        parent_key: SubjectivityKey,
    ) -> NodeId {
        let client_facing = if self.nodes.contains_key(&snapshot.node_id) {
            let minted = self.next_minted_id;
            self.next_minted_id += 1;
            log::debug!(
                "node id {} already live, minted client-facing id {minted}",
                snapshot.node_id
            );
            self.install_remapping(snapshot.node_id, minted);
            minted
        } else {
            if snapshot.node_id >= self.next_minted_id {
                self.next_minted_id = snapshot.node_id + 1;
            }
            snapshot.node_id
        };
        let key = if parent.is_none() {
            UNRESTRICTED_KEY
        } else {
            self.make_subjectivity(client_facing, &snapshot.attributes, parent_key)
        };
        self.nodes.insert(
            client_facing,
            Node {
                node_id: client_facing,
                tag: snapshot.tag.clone(),
                attributes: snapshot.attributes.clone(),
                text: snapshot.text.clone(),
                children: Vec::new(),
                parent,
                subjectivity: key,
            },
        );
        let mut child_ids = Vec::with_capacity(snapshot.children.len());
        for child in &snapshot.children {
            child_ids.push(self.insert_subtree(child, Some(client_facing), key));
        }
        if let Some(node) = self.nodes.get_mut(&client_facing) {
            node.children = child_ids;
        }
        client_facing
    }

    fn make_subjectivity(
        &mut self,
        node_id: NodeId,
        attributes: &[(String, String)],
        parent_key: SubjectivityKey,
    ) -> SubjectivityKey {
        let visible_to = attributes
            .iter()
            .find(|(k, _)| k == VISIBLE_TO_ATTRIBUTE)
            .and_then(|(_, v)| parse_connection_id_list(v));
        let hidden_from = attributes
            .iter()
            .find(|(k, _)| k == HIDDEN_FROM_ATTRIBUTE)
            .and_then(|(_, v)| parse_connection_id_list(v));
        if visible_to.is_none() && hidden_from.is_none() {
            return parent_key;
        }
        if let Some(ids) = &visible_to {
            for id in ids {
                if *id != NOBODY_CONNECTION_ID {
                    self.index.grant(*id, node_id);
                }
            }
        }
        self.arena.insert(SubjectivityRecord {
            visible_to,
            hidden_from,
            ancestor: Some(parent_key),
            owner: node_id,
        })
    }

    /// Re-derive a node's subjectivity after one of the reserved
    /// attributes changed, propagating the copy-on-write key swap to
    /// exactly the descendants still sharing the previous key.
    fn refresh_subjectivity(&mut self, node_id: NodeId) -> Result<(), TreeError> {
        let (visible_to, hidden_from, old_key, children) = {
            let node = self.get(node_id)?;
            (
                node.attribute(VISIBLE_TO_ATTRIBUTE)
                    .and_then(parse_connection_id_list),
                node.attribute(HIDDEN_FROM_ATTRIBUTE)
                    .and_then(parse_connection_id_list),
                node.subjectivity,
                node.children.clone(),
            )
        };
        let owns = old_key != UNRESTRICTED_KEY
            && self.arena.get(old_key).map(|r| r.owner) == Some(node_id);

        self.index.remove_node(node_id);
        if let Some(ids) = &visible_to {
            for id in ids {
                if *id != NOBODY_CONNECTION_ID {
                    self.index.grant(*id, node_id);
                }
            }
        }

        if visible_to.is_none() && hidden_from.is_none() {
            if owns {
                // The node no longer declares anything: fold back onto the
                // ancestor's record.
                let new_key = self
                    .arena
                    .remove(old_key)
                    .and_then(|r| r.ancestor)
                    .unwrap_or(UNRESTRICTED_KEY);
                if let Some(node) = self.nodes.get_mut(&node_id) {
                    node.subjectivity = new_key;
                }
                self.propagate_key(children, old_key, new_key);
            }
            return Ok(());
        }

        if owns {
            // Rewrite the owned record in place: the key (identity) is
            // unchanged, so sharers are untouched.
            if let Some(record) = self.arena.get_mut(old_key) {
                record.visible_to = visible_to;
                record.hidden_from = hidden_from;
            }
        } else {
            // First declaration: split off an own record; descendants
            // sharing the old key now inherit through this node.
            let new_key = self.arena.insert(SubjectivityRecord {
                visible_to,
                hidden_from,
                ancestor: Some(old_key),
                owner: node_id,
            });
            if let Some(node) = self.nodes.get_mut(&node_id) {
                node.subjectivity = new_key;
            }
            self.propagate_key(children, old_key, new_key);
        }
        Ok(())
    }

    /// Rewrite descendants still pointing at `old_key` to `new_key`;
    /// descendants owning distinct records only get their ancestor
    /// back-reference updated, and the walk stops there.
    fn propagate_key(
        &mut self,
        start: Vec<NodeId>,
        old_key: SubjectivityKey,
        new_key: SubjectivityKey,
    ) {
        let mut stack = start;
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            if node.subjectivity == old_key {
                node.subjectivity = new_key;
                stack.extend(node.children.iter().copied());
            } else {
                let key = node.subjectivity;
                if let Some(record) = self.arena.get_mut(key) {
                    if record.ancestor == Some(old_key) {
                        record.ancestor = Some(new_key);
                    }
                }
            }
        }
    }

    /// Detach a subtree, returning every removed id in pre-order. Owned
    /// subjectivity records, index grants, and remap entries go with the
    /// nodes.
    fn detach_subtree(&mut self, node_id: NodeId) -> Result<Vec<NodeId>, TreeError> {
        let parent = self.get(node_id)?.parent;
        if let Some(parent) = parent {
            if let Some(parent_node) = self.nodes.get_mut(&parent) {
                parent_node.children.retain(|c| *c != node_id);
            }
        }
        let ids = self.subtree_ids(node_id)?;
        for id in &ids {
            let node = self
                .nodes
                .remove(id)
                .ok_or(TreeError::NodeNotFound(*id))?;
            if node.subjectivity != UNRESTRICTED_KEY
                && self.arena.get(node.subjectivity).map(|r| r.owner) == Some(*id)
            {
                self.arena.remove(node.subjectivity);
            }
            self.index.remove_node(*id);
            if let Some(internal) = self.outbound.remove(id) {
                self.inbound.remove(&internal);
            }
        }
        Ok(ids)
    }
}

impl Default for NodeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subjectivity::VisibilityPolicy::PerConnection;

    fn conn(list: &[ConnectionId]) -> BTreeSet<ConnectionId> {
        list.iter().copied().collect()
    }

    /// root(0) ── cube(1, visible-to="1") ── sphere(2)
    ///         └─ light(3)
    fn sample_store() -> NodeStore {
        let snapshot = NodeSnapshot::new(0, "m-group")
            .with_child(
                NodeSnapshot::new(1, "m-cube")
                    .with_attribute("visible-to", "1")
                    .with_attribute("color", "red")
                    .with_child(NodeSnapshot::new(2, "m-sphere")),
            )
            .with_child(NodeSnapshot::new(3, "m-light"));
        let mut store = NodeStore::new();
        store.load_snapshot(&snapshot);
        store
    }

    #[test]
    fn test_load_snapshot_builds_tree() {
        let store = sample_store();
        assert_eq!(store.root(), Some(0));
        assert_eq!(store.node_count(), 4);
        let root = store.get(0).unwrap();
        assert_eq!(root.children, vec![1, 3]);
        assert_eq!(store.get(2).unwrap().parent, Some(1));
    }

    #[test]
    fn test_missing_node_is_an_error() {
        let store = sample_store();
        assert_eq!(store.get(99), Err(TreeError::NodeNotFound(99)));
    }

    #[test]
    fn test_child_inherits_parent_subjectivity_by_key() {
        let store = sample_store();
        // sphere declares nothing: it shares cube's record.
        assert_eq!(
            store.get(2).unwrap().subjectivity,
            store.get(1).unwrap().subjectivity
        );
        assert_ne!(store.get(1).unwrap().subjectivity, UNRESTRICTED_KEY);
        assert_eq!(store.get(3).unwrap().subjectivity, UNRESTRICTED_KEY);
    }

    #[test]
    fn test_visibility_evaluation_through_store() {
        let store = sample_store();
        assert!(store.is_visible_to(1, &conn(&[1]), PerConnection).unwrap());
        assert!(!store.is_visible_to(1, &conn(&[2]), PerConnection).unwrap());
        // Inherited restriction applies to the sphere.
        assert!(store.is_visible_to(2, &conn(&[1]), PerConnection).unwrap());
        assert!(!store.is_visible_to(2, &conn(&[2]), PerConnection).unwrap());
        assert!(store.is_visible_to(3, &conn(&[2]), PerConnection).unwrap());
    }

    #[test]
    fn test_attribute_mutation_updates_tree() {
        let mut store = sample_store();
        let mutation = store
            .apply_raw(&RawMutation::Attributes {
                target: 1,
                attribute: "color".into(),
                value: Some("green".into()),
            })
            .unwrap();
        assert_eq!(store.get(1).unwrap().attribute("color"), Some("green"));
        assert_eq!(
            mutation,
            TreeMutation::Attributes {
                target: 1,
                attribute: "color".into(),
                value: Some("green".into()),
            }
        );
    }

    #[test]
    fn test_visible_to_change_rewrites_record_in_place() {
        let mut store = sample_store();
        let key_before = store.get(1).unwrap().subjectivity;
        store
            .apply_raw(&RawMutation::Attributes {
                target: 1,
                attribute: VISIBLE_TO_ATTRIBUTE.into(),
                value: Some("2".into()),
            })
            .unwrap();
        // Identity preserved: sharers (the sphere) follow automatically.
        assert_eq!(store.get(1).unwrap().subjectivity, key_before);
        assert!(!store.is_visible_to(2, &conn(&[1]), PerConnection).unwrap());
        assert!(store.is_visible_to(2, &conn(&[2]), PerConnection).unwrap());
    }

    #[test]
    fn test_gaining_own_record_splits_from_shared_key() {
        let mut store = sample_store();
        let shared = store.get(2).unwrap().subjectivity;
        store
            .apply_raw(&RawMutation::Attributes {
                target: 2,
                attribute: HIDDEN_FROM_ATTRIBUTE.into(),
                value: Some("1".into()),
            })
            .unwrap();
        let own = store.get(2).unwrap().subjectivity;
        assert_ne!(own, shared);
        // Cube keeps the old shared record.
        assert_eq!(store.get(1).unwrap().subjectivity, shared);
        assert!(!store.is_visible_to(2, &conn(&[1]), PerConnection).unwrap());
    }

    #[test]
    fn test_dropping_attributes_folds_back_to_ancestor() {
        let mut store = sample_store();
        store
            .apply_raw(&RawMutation::Attributes {
                target: 1,
                attribute: VISIBLE_TO_ATTRIBUTE.into(),
                value: None,
            })
            .unwrap();
        assert_eq!(store.get(1).unwrap().subjectivity, UNRESTRICTED_KEY);
        assert_eq!(store.get(2).unwrap().subjectivity, UNRESTRICTED_KEY);
        assert!(store.is_visible_to(1, &conn(&[2]), PerConnection).unwrap());
    }

    #[test]
    fn test_cow_propagation_skips_owning_descendants() {
        let mut store = sample_store();
        // Sphere declares its own record first.
        store
            .apply_raw(&RawMutation::Attributes {
                target: 2,
                attribute: VISIBLE_TO_ATTRIBUTE.into(),
                value: Some("1".into()),
            })
            .unwrap();
        let sphere_key = store.get(2).unwrap().subjectivity;
        // Cube drops its restriction: sphere's key must survive, with its
        // ancestor reference rewired past the removed record.
        store
            .apply_raw(&RawMutation::Attributes {
                target: 1,
                attribute: VISIBLE_TO_ATTRIBUTE.into(),
                value: None,
            })
            .unwrap();
        assert_eq!(store.get(2).unwrap().subjectivity, sphere_key);
        assert!(store.is_visible_to(2, &conn(&[1]), PerConnection).unwrap());
        assert!(!store.is_visible_to(2, &conn(&[2]), PerConnection).unwrap());
    }

    #[test]
    fn test_child_list_add_and_remove() {
        let mut store = sample_store();
        let mutation = store
            .apply_raw(&RawMutation::ChildList {
                target: 0,
                added: vec![NodeSnapshot::new(4, "m-plane")],
                removed: vec![1],
                previous_sibling: Some(3),
            })
            .unwrap();
        match mutation {
            TreeMutation::ChildList {
                target,
                added,
                removed,
                previous_sibling,
            } => {
                assert_eq!(target, 0);
                assert_eq!(added, vec![4]);
                assert_eq!(removed.len(), 1);
                assert_eq!(removed[0].root, 1);
                assert_eq!(removed[0].node_ids, vec![1, 2]);
                assert_eq!(previous_sibling, Some(3));
            }
            other => panic!("expected ChildList, got {other:?}"),
        }
        assert_eq!(store.get(0).unwrap().children, vec![3, 4]);
        assert!(!store.contains(1));
        assert!(!store.contains(2));
    }

    #[test]
    fn test_insertion_order_with_previous_sibling() {
        let mut store = sample_store();
        store
            .apply_raw(&RawMutation::ChildList {
                target: 0,
                added: vec![NodeSnapshot::new(5, "m-a"), NodeSnapshot::new(6, "m-b")],
                removed: vec![],
                previous_sibling: Some(1),
            })
            .unwrap();
        assert_eq!(store.get(0).unwrap().children, vec![1, 5, 6, 3]);
    }

    #[test]
    fn test_insertion_at_front_without_previous_sibling() {
        let mut store = sample_store();
        store
            .apply_raw(&RawMutation::ChildList {
                target: 0,
                added: vec![NodeSnapshot::new(7, "m-first")],
                removed: vec![],
                previous_sibling: None,
            })
            .unwrap();
        assert_eq!(store.get(0).unwrap().children, vec![7, 1, 3]);
    }

    #[test]
    fn test_character_data_mutation() {
        let mut store = sample_store();
        store
            .apply_raw(&RawMutation::CharacterData {
                target: 3,
                text: Some("hello".into()),
            })
            .unwrap();
        assert_eq!(store.get(3).unwrap().text.as_deref(), Some("hello"));
    }

    #[test]
    fn test_collision_minting_after_remapping() {
        let mut store = sample_store();
        // Pretend a reload left id 2 mapped; a later runtime add reusing a
        // live id must mint.
        let mutation = store
            .apply_raw(&RawMutation::ChildList {
                target: 0,
                added: vec![NodeSnapshot::new(3, "m-dupe")],
                removed: vec![],
                previous_sibling: None,
            })
            .unwrap();
        let added = match mutation {
            TreeMutation::ChildList { added, .. } => added,
            other => panic!("expected ChildList, got {other:?}"),
        };
        assert_eq!(added.len(), 1);
        let minted = added[0];
        assert!(minted > 3, "minted id {minted} must exceed the high-water mark");
        assert_eq!(store.resolve_inbound(3), minted);
        assert_eq!(store.resolve_outbound(minted), 3);
        // The original node 3 is untouched.
        assert_eq!(store.get(3).unwrap().tag, "m-light");
        assert_eq!(store.get(minted).unwrap().tag, "m-dupe");
    }

    #[test]
    fn test_detach_drops_remap_entries() {
        let mut store = sample_store();
        store
            .apply_raw(&RawMutation::ChildList {
                target: 0,
                added: vec![NodeSnapshot::new(3, "m-dupe")],
                removed: vec![],
                previous_sibling: None,
            })
            .unwrap();
        let minted = store.resolve_inbound(3);
        store
            .apply_raw(&RawMutation::ChildList {
                target: 0,
                // The runtime still names it by its own id.
                added: vec![],
                removed: vec![3],
                previous_sibling: None,
            })
            .unwrap();
        // The remapped node (not the original light) was removed.
        assert!(!store.contains(minted));
        assert_eq!(store.resolve_inbound(3), 3);
        assert!(store.contains(3));
    }

    #[test]
    fn test_snapshot_tree_round_trip() {
        let store = sample_store();
        let snapshot = store.snapshot_tree().unwrap();
        let mut rebuilt = NodeStore::new();
        rebuilt.load_snapshot(&snapshot);
        assert_eq!(rebuilt.node_count(), store.node_count());
        assert_eq!(rebuilt.get(0).unwrap().children, vec![1, 3]);
        assert_eq!(
            rebuilt.get(1).unwrap().attribute("visible-to"),
            Some("1")
        );
    }

    #[test]
    fn test_root_visibility_attributes_are_inert() {
        let mut store = sample_store();
        store
            .apply_raw(&RawMutation::Attributes {
                target: 0,
                attribute: VISIBLE_TO_ATTRIBUTE.into(),
                value: Some("42".into()),
            })
            .unwrap();
        assert!(store.is_visible_to(0, &conn(&[1]), PerConnection).unwrap());
        assert!(store.is_visible_to(3, &conn(&[7]), PerConnection).unwrap());
    }
}
