//! Per-connection visibility rules ("subjectivity").
//!
//! Visibility is controlled by two reserved node attributes:
//!
//! - `visible-to` — the node (and its subtree) is shown only to the listed
//!   connection ids.
//! - `hidden-from` — the node is withheld from the listed connection ids.
//!
//! A node that sets neither attribute shares its nearest restricted
//! ancestor's [`SubjectivityRecord`] — sharing is by arena key, so a
//! subtree-wide rule change touches one record, not every descendant.
//! Key equality is the identity test used by the copy-on-write
//! propagation in the node store.
//!
//! The two wire dialects disagree on `hidden-from`: the legacy dialect
//! suppresses hidden nodes for every connection, the current dialect
//! evaluates the exclusion per connection. [`VisibilityPolicy`] captures
//! that difference so the evaluation here stays wire-format agnostic.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::tree::NodeId;

/// External (client-supplied) connection id.
pub type ConnectionId = u64;

/// Arena key for a [`SubjectivityRecord`]. Key equality is identity.
pub type SubjectivityKey = u64;

/// Key of the shared "no restrictions" record every tree starts from.
pub const UNRESTRICTED_KEY: SubjectivityKey = 0;

/// Sentinel produced by a non-empty `visible-to` list containing no valid
/// ids. It matches no real connection, so the node is visible to nobody —
/// deliberately distinct from an absent attribute (visible to all).
pub const NOBODY_CONNECTION_ID: ConnectionId = u64::MAX;

/// How `hidden-from` is interpreted during evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityPolicy {
    /// Legacy behavior: any `hidden-from` on the chain suppresses the
    /// node for every connection.
    SuppressHidden,
    /// Current behavior: `hidden-from` excludes only the listed
    /// connection ids.
    PerConnection,
}

/// One visibility rule, attached to the node that declared it and shared
/// (by key) with every descendant that declares nothing of its own.
#[derive(Debug, Clone)]
pub struct SubjectivityRecord {
    /// Parsed `visible-to` list; `None` means no restriction at this level.
    pub visible_to: Option<HashSet<ConnectionId>>,
    /// Parsed `hidden-from` list; `None` means no exclusion at this level.
    pub hidden_from: Option<HashSet<ConnectionId>>,
    /// Nearest restricted ancestor's record. Chains only point rootward,
    /// so they cannot cycle.
    pub ancestor: Option<SubjectivityKey>,
    /// Node that owns (declared) this record.
    pub owner: NodeId,
}

/// Parse a `visible-to`/`hidden-from` attribute value.
///
/// Ids are split on spaces and commas. An absent or token-free value
/// yields `None` (no restriction). Invalid tokens are skipped, but a
/// non-empty token list with zero valid ids yields the
/// [`NOBODY_CONNECTION_ID`] sentinel rather than an empty set.
pub fn parse_connection_id_list(raw: &str) -> Option<HashSet<ConnectionId>> {
    let tokens: Vec<&str> = raw
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.is_empty() {
        return None;
    }
    let ids: HashSet<ConnectionId> = tokens
        .iter()
        .filter_map(|t| t.parse::<ConnectionId>().ok())
        .collect();
    if ids.is_empty() {
        let mut nobody = HashSet::new();
        nobody.insert(NOBODY_CONNECTION_ID);
        Some(nobody)
    } else {
        Some(ids)
    }
}

/// Arena of subjectivity records for one document instance.
///
/// Scoped to the owning `NodeStore` — never process-wide — so multiple
/// documents can run in one process without interference.
#[derive(Debug)]
pub struct SubjectivityArena {
    records: HashMap<SubjectivityKey, SubjectivityRecord>,
    next_key: SubjectivityKey,
}

impl SubjectivityArena {
    pub fn new() -> Self {
        let mut records = HashMap::new();
        records.insert(
            UNRESTRICTED_KEY,
            SubjectivityRecord {
                visible_to: None,
                hidden_from: None,
                ancestor: None,
                owner: 0,
            },
        );
        Self {
            records,
            next_key: UNRESTRICTED_KEY + 1,
        }
    }

    /// Allocate a new record, returning its key.
    pub fn insert(&mut self, record: SubjectivityRecord) -> SubjectivityKey {
        let key = self.next_key;
        self.next_key += 1;
        self.records.insert(key, record);
        key
    }

    pub fn get(&self, key: SubjectivityKey) -> Option<&SubjectivityRecord> {
        self.records.get(&key)
    }

    pub fn get_mut(&mut self, key: SubjectivityKey) -> Option<&mut SubjectivityRecord> {
        if key == UNRESTRICTED_KEY {
            return None;
        }
        self.records.get_mut(&key)
    }

    /// Remove an owned record. The shared unrestricted record is never
    /// removed.
    pub fn remove(&mut self, key: SubjectivityKey) -> Option<SubjectivityRecord> {
        if key == UNRESTRICTED_KEY {
            return None;
        }
        self.records.remove(&key)
    }

    /// True iff no restriction exists anywhere up the chain. Under
    /// [`VisibilityPolicy::SuppressHidden`] a `hidden-from` at any level
    /// also counts as a restriction.
    pub fn is_visible_to_all(&self, key: SubjectivityKey, policy: VisibilityPolicy) -> bool {
        let mut cursor = Some(key);
        while let Some(k) = cursor {
            let Some(record) = self.records.get(&k) else {
                return true;
            };
            if record.visible_to.is_some() {
                return false;
            }
            if policy == VisibilityPolicy::SuppressHidden && record.hidden_from.is_some() {
                return false;
            }
            cursor = record.ancestor;
        }
        true
    }

    /// Evaluate visibility of a record chain for a connection's external
    /// id set.
    ///
    /// `skip_first_visible_to` is the fast path taken when the caller
    /// already knows (via the [`VisibilityIndex`]) that the first record's
    /// `visible-to` names one of the ids.
    pub fn is_visible_to(
        &self,
        key: SubjectivityKey,
        ids: &BTreeSet<ConnectionId>,
        policy: VisibilityPolicy,
        skip_first_visible_to: bool,
    ) -> bool {
        // Fast path only for a wholly unrestricted chain. The legacy
        // rule counts any hidden-from as a restriction, which makes it
        // the conservative test under either policy.
        if self.is_visible_to_all(key, VisibilityPolicy::SuppressHidden) {
            return true;
        }
        let mut cursor = Some(key);
        let mut first = true;
        while let Some(k) = cursor {
            let Some(record) = self.records.get(&k) else {
                break;
            };
            if let Some(visible_to) = &record.visible_to {
                let listed = (first && skip_first_visible_to)
                    || ids.iter().any(|id| visible_to.contains(id));
                if !listed {
                    return false;
                }
            }
            if let Some(hidden_from) = &record.hidden_from {
                match policy {
                    VisibilityPolicy::SuppressHidden => return false,
                    VisibilityPolicy::PerConnection => {
                        // Hidden only when every id on the socket is excluded.
                        if !ids.is_empty() && ids.iter().all(|id| hidden_from.contains(id)) {
                            return false;
                        }
                    }
                }
            }
            first = false;
            cursor = record.ancestor;
        }
        true
    }
}

impl Default for SubjectivityArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection sets of nodes that *specifically* name that connection
/// in `visible-to`. Used as the fast path before set intersection during
/// evaluation.
#[derive(Debug, Default)]
pub struct VisibilityIndex {
    by_connection: HashMap<ConnectionId, HashSet<NodeId>>,
}

impl VisibilityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `node` explicitly lists `connection` in `visible-to`.
    pub fn grant(&mut self, connection: ConnectionId, node: NodeId) {
        self.by_connection.entry(connection).or_default().insert(node);
    }

    /// Drop every grant held by `node`.
    pub fn remove_node(&mut self, node: NodeId) {
        self.by_connection.retain(|_, nodes| {
            nodes.remove(&node);
            !nodes.is_empty()
        });
    }

    /// True iff `node` explicitly lists one of `ids`.
    pub fn is_specifically_visible(&self, node: NodeId, ids: &BTreeSet<ConnectionId>) -> bool {
        ids.iter().any(|id| {
            self.by_connection
                .get(id)
                .is_some_and(|nodes| nodes.contains(&node))
        })
    }

    /// Nodes explicitly visible to `connection`.
    pub fn nodes_for(&self, connection: ConnectionId) -> Option<&HashSet<NodeId>> {
        self.by_connection.get(&connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[ConnectionId]) -> BTreeSet<ConnectionId> {
        list.iter().copied().collect()
    }

    #[test]
    fn test_parse_absent_and_blank_are_unrestricted() {
        assert_eq!(parse_connection_id_list(""), None);
        assert_eq!(parse_connection_id_list("   "), None);
        assert_eq!(parse_connection_id_list(" , ,, "), None);
    }

    #[test]
    fn test_parse_space_and_comma_separated() {
        let set = parse_connection_id_list("1 2,3, 4").unwrap();
        assert_eq!(set.len(), 4);
        assert!(set.contains(&1) && set.contains(&2) && set.contains(&3) && set.contains(&4));
    }

    #[test]
    fn test_parse_skips_invalid_tokens() {
        let set = parse_connection_id_list("1 bogus -2 3").unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&1) && set.contains(&3));
    }

    #[test]
    fn test_parse_all_invalid_is_nobody_sentinel() {
        let set = parse_connection_id_list("alice bob").unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains(&NOBODY_CONNECTION_ID));
    }

    #[test]
    fn test_unrestricted_record_visible_to_all() {
        let arena = SubjectivityArena::new();
        assert!(arena.is_visible_to_all(UNRESTRICTED_KEY, VisibilityPolicy::PerConnection));
        assert!(arena.is_visible_to(
            UNRESTRICTED_KEY,
            &ids(&[7]),
            VisibilityPolicy::PerConnection,
            false
        ));
    }

    #[test]
    fn test_visible_to_restriction() {
        let mut arena = SubjectivityArena::new();
        let key = arena.insert(SubjectivityRecord {
            visible_to: parse_connection_id_list("1 2"),
            hidden_from: None,
            ancestor: Some(UNRESTRICTED_KEY),
            owner: 10,
        });
        assert!(!arena.is_visible_to_all(key, VisibilityPolicy::PerConnection));
        assert!(arena.is_visible_to(key, &ids(&[1]), VisibilityPolicy::PerConnection, false));
        assert!(arena.is_visible_to(key, &ids(&[2, 9]), VisibilityPolicy::PerConnection, false));
        assert!(!arena.is_visible_to(key, &ids(&[3]), VisibilityPolicy::PerConnection, false));
    }

    #[test]
    fn test_hidden_from_per_connection() {
        let mut arena = SubjectivityArena::new();
        let key = arena.insert(SubjectivityRecord {
            visible_to: None,
            hidden_from: parse_connection_id_list("2"),
            ancestor: Some(UNRESTRICTED_KEY),
            owner: 10,
        });
        assert!(arena.is_visible_to(key, &ids(&[1]), VisibilityPolicy::PerConnection, false));
        assert!(!arena.is_visible_to(key, &ids(&[2]), VisibilityPolicy::PerConnection, false));
        // A socket hosting an excluded and a non-excluded id still sees it.
        assert!(arena.is_visible_to(key, &ids(&[1, 2]), VisibilityPolicy::PerConnection, false));
    }

    #[test]
    fn test_hidden_from_suppresses_globally_in_legacy_policy() {
        let mut arena = SubjectivityArena::new();
        let key = arena.insert(SubjectivityRecord {
            visible_to: None,
            hidden_from: parse_connection_id_list("2"),
            ancestor: Some(UNRESTRICTED_KEY),
            owner: 10,
        });
        assert!(!arena.is_visible_to(key, &ids(&[1]), VisibilityPolicy::SuppressHidden, false));
        assert!(!arena.is_visible_to_all(key, VisibilityPolicy::SuppressHidden));
    }

    #[test]
    fn test_ancestor_restriction_applies_to_descendants() {
        let mut arena = SubjectivityArena::new();
        let parent = arena.insert(SubjectivityRecord {
            visible_to: parse_connection_id_list("1"),
            hidden_from: None,
            ancestor: Some(UNRESTRICTED_KEY),
            owner: 10,
        });
        let child = arena.insert(SubjectivityRecord {
            visible_to: parse_connection_id_list("1 2"),
            hidden_from: None,
            ancestor: Some(parent),
            owner: 11,
        });
        // Connection 2 passes the child's own list but fails the ancestor's.
        assert!(!arena.is_visible_to(child, &ids(&[2]), VisibilityPolicy::PerConnection, false));
        assert!(arena.is_visible_to(child, &ids(&[1]), VisibilityPolicy::PerConnection, false));
    }

    #[test]
    fn test_nobody_sentinel_matches_no_connection() {
        let mut arena = SubjectivityArena::new();
        let key = arena.insert(SubjectivityRecord {
            visible_to: parse_connection_id_list("garbage"),
            hidden_from: None,
            ancestor: Some(UNRESTRICTED_KEY),
            owner: 10,
        });
        assert!(!arena.is_visible_to(key, &ids(&[0]), VisibilityPolicy::PerConnection, false));
        assert!(!arena.is_visible_to(key, &ids(&[1, 2, 3]), VisibilityPolicy::PerConnection, false));
    }

    #[test]
    fn test_visibility_index_grant_and_remove() {
        let mut index = VisibilityIndex::new();
        index.grant(1, 10);
        index.grant(1, 11);
        index.grant(2, 10);

        assert!(index.is_specifically_visible(10, &ids(&[1])));
        assert!(index.is_specifically_visible(10, &ids(&[2, 9])));
        assert!(!index.is_specifically_visible(11, &ids(&[2])));

        index.remove_node(10);
        assert!(!index.is_specifically_visible(10, &ids(&[1])));
        assert!(index.is_specifically_visible(11, &ids(&[1])));
    }

    #[test]
    fn test_fast_path_skips_first_level_intersection() {
        let mut arena = SubjectivityArena::new();
        let key = arena.insert(SubjectivityRecord {
            visible_to: parse_connection_id_list("1"),
            hidden_from: None,
            ancestor: Some(UNRESTRICTED_KEY),
            owner: 10,
        });
        // The caller vouches for the first level; ancestors still apply.
        assert!(arena.is_visible_to(key, &ids(&[1]), VisibilityPolicy::PerConnection, true));
    }
}
