//! The external document runtime interface.
//!
//! The sandboxed runtime that executes document logic is an opaque
//! collaborator: it emits exactly one [`DomRuntimeMessage`] per callback
//! in causal order (mutations one at a time, never batched) and accepts
//! dispatched remote events. Documents talk to it exclusively through
//! [`DomRuntimeFactory`] so tests can substitute a scripted fake.

use trellis_core::subjectivity::ConnectionId;
use trellis_core::tree::{NodeId, NodeSnapshot};
use trellis_core::RawMutation;

use crate::document::RuntimeSender;

/// A client-originated event dispatched into the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEvent {
    /// Target node, in the runtime's own id space.
    pub node_id: NodeId,
    pub name: String,
    pub bubbles: bool,
    /// Raw JSON text; the engine never interprets it.
    pub params: String,
}

/// One runtime callback. Mutation records arrive one at a time: the
/// per-connection diffing reconstructs intermediate states and relies on
/// single-mutation granularity.
#[derive(Debug, Clone)]
pub enum DomRuntimeMessage {
    /// Full tree. The first one marks the instance as loaded; the
    /// engine does not expect another from the same instance.
    Snapshot {
        root: NodeSnapshot,
        document_time: u64,
    },
    Mutation(RawMutation),
    /// Elapsed document time, passed through to viewers.
    DocumentTime(u64),
    /// Console output from document scripts, forwarded to the log
    /// facade.
    Log { level: log::Level, message: String },
}

/// A live runtime instance. Dropped (via [`ObservableDom::dispose`])
/// when the document reloads or is disposed; messages it sends after
/// that are discarded by generation tag.
pub trait ObservableDom: Send {
    fn dispatch_remote_event(&mut self, connection_id: ConnectionId, event: RemoteEvent);
    fn dispose(&mut self);
}

/// Starts runtime instances. `events` is pre-tagged with the instance
/// generation; the implementation just calls
/// [`RuntimeSender::send`] from wherever its callbacks fire.
pub trait DomRuntimeFactory: Send + Sync + 'static {
    fn spawn(&self, source: &str, events: RuntimeSender) -> Box<dyn ObservableDom>;
}
