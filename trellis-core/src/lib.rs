//! # trellis-core — Server-authoritative document tree synchronization
//!
//! The canonical tree, per-connection visibility, and the diff machinery
//! shared by every network transport.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  RawMutation   ┌─────────────┐  TreeMutation   ┌──────────────┐
//! │ Document     │ ─────────────► │ NodeStore   │ ──────────────► │ DiffEngine   │
//! │ runtime      │                │ (canonical) │    per conn     │ (per view)   │
//! └──────────────┘                └──────┬──────┘                 └──────┬───────┘
//!        │ reload                        │                               │
//!        ▼                               ▼                               ▼
//! ┌──────────────┐   PatchOp      ┌─────────────┐                 ┌──────────────┐
//! │ ReloadDiffer │ ─────────────► │ replay()    │                 │ Diff stream  │
//! │ (tree diff)  │   + remaps     │ (same path) │                 │ (to adapter) │
//! └──────────────┘                └─────────────┘                 └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`tree`] — Canonical [`NodeStore`] with internal↔client-facing id remapping
//! - [`subjectivity`] — `visible-to` / `hidden-from` evaluation, shared by key
//! - [`mutation`] — The mutation vocabulary both live edits and reloads reduce to
//! - [`diff`] — Per-connection view maintenance and diff computation
//! - [`reload`] — Whole-tree diffing with collision-free id minting

pub mod diff;
pub mod mutation;
pub mod reload;
pub mod subjectivity;
pub mod tree;

// Re-exports for convenience
pub use diff::{
    apply_mutation, resync_view, snapshot_view, ConnectionView, Diff, NodeDescription,
    VisibilityMode,
};
pub use mutation::{RawMutation, RemovedSubtree, TreeMutation};
pub use reload::{diff_snapshots, replay, NodeIdRemapping, PatchOp, ReloadDiff};
pub use subjectivity::{
    parse_connection_id_list, ConnectionId, SubjectivityKey, VisibilityPolicy,
    NOBODY_CONNECTION_ID,
};
pub use tree::{
    is_reserved_attribute, Node, NodeId, NodeSnapshot, NodeStore, TreeError,
    HIDDEN_FROM_ATTRIBUTE, VISIBLE_TO_ATTRIBUTE,
};
