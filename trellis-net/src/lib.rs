//! # trellis-net — Connection layer for synchronized document trees
//!
//! Wires the `trellis-core` engine to real viewers: wire dialects,
//! per-socket sessions, the document orchestrator actor, and WebSocket
//! attachment.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket    ┌──────────────┐   Command      ┌───────────────┐
//! │ Viewer      │ ◄────────────► │ ws reader/   │ ─────────────► │ Document      │
//! │ (v0.1/v0.2) │  negotiated    │ writer tasks │                │ actor (1 task │
//! └─────────────┘  subprotocol   └──────────────┘                │ per document) │
//!                                                                └──────┬────────┘
//!                                   ┌──────────────┐  DomRuntime        │
//!                                   │ External DOM │  Message           │
//!                                   │ runtime      │ ──────────────────►│
//!                                   └──────────────┘  (generation tag)  ▼
//!                                                               trellis-core
//!                                                               (store + diffs)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Abstract message vocabulary and dialect negotiation
//! - [`v01`] — Legacy JSON dialect (`networked-dom-v0.1`)
//! - [`v02`] — Binary length-prefixed dialect (`networked-dom-v0.2`)
//! - [`session`] — Per-socket view, batching, and codec selection
//! - [`runtime`] — The opaque document-runtime collaborator interface
//! - [`document`] — [`NetworkedDocument`] / [`EditableNetworkedDocument`] actor
//! - [`ws`] — `tokio-tungstenite` socket attachment

pub mod document;
pub mod protocol;
pub mod runtime;
pub mod session;
pub mod v01;
pub mod v02;
pub mod ws;

// Re-exports for convenience
pub use document::{DocumentConfig, EditableNetworkedDocument, NetworkedDocument, RuntimeSender};
pub use protocol::{
    ClientMessage, InboundFrame, OutboundFrame, ProtocolError, ProtocolVersion, ServerMessage,
    SUBPROTOCOL_V01, SUBPROTOCOL_V02,
};
pub use runtime::{DomRuntimeFactory, DomRuntimeMessage, ObservableDom, RemoteEvent};
