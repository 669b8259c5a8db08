//! Dialect-independent protocol layer.
//!
//! Diff computation is wire-agnostic: the engine produces abstract
//! [`ServerMessage`] values and consumes abstract [`ClientMessage`]
//! values, and each dialect module ([`crate::v01`], [`crate::v02`]) owns
//! nothing but serialization and its connection-id conventions.

use std::fmt;

use trellis_core::diff::{Diff, NodeDescription, VisibilityMode};
use trellis_core::subjectivity::{ConnectionId, VisibilityPolicy};
use trellis_core::tree::NodeId;

/// Subprotocol token for the legacy JSON dialect.
pub const SUBPROTOCOL_V01: &str = "networked-dom-v0.1";
/// Subprotocol token for the binary dialect.
pub const SUBPROTOCOL_V02: &str = "networked-dom-v0.2";

/// Wire dialect for one socket, fixed at negotiation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// JSON text frames, one fixed external connection id (1).
    V01,
    /// Length-prefixed binary frames, multiplexed connection ids.
    V02,
}

impl ProtocolVersion {
    /// Pick the first mutually supported subprotocol from the client's
    /// offer list. `None` means nothing matched; the caller treats that
    /// as a warning-worthy legacy client and falls back to
    /// [`ProtocolVersion::V01`].
    pub fn negotiate<'a>(offered: impl IntoIterator<Item = &'a str>) -> Option<ProtocolVersion> {
        offered.into_iter().find_map(|token| match token.trim() {
            SUBPROTOCOL_V01 => Some(ProtocolVersion::V01),
            SUBPROTOCOL_V02 => Some(ProtocolVersion::V02),
            _ => None,
        })
    }

    pub fn subprotocol(self) -> &'static str {
        match self {
            ProtocolVersion::V01 => SUBPROTOCOL_V01,
            ProtocolVersion::V02 => SUBPROTOCOL_V02,
        }
    }

    /// The hidden-from evaluation rule this dialect mandates: v0.1
    /// suppresses hidden nodes for everyone, v0.2 evaluates per
    /// connection.
    pub fn visibility_policy(self) -> VisibilityPolicy {
        match self {
            ProtocolVersion::V01 => VisibilityPolicy::SuppressHidden,
            ProtocolVersion::V02 => VisibilityPolicy::PerConnection,
        }
    }
}

/// Protocol errors. Client-caused variants are recovered locally
/// (structured reply or log-and-ignore); they never close the socket.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    /// Frame type does not fit the negotiated dialect (binary on v0.1,
    /// text on v0.2).
    UnexpectedFrameType,
    /// A length prefix pointed past the end of the frame.
    TruncatedFrame,
    UnknownMessageType(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "deserialization error: {e}"),
            Self::UnexpectedFrameType => write!(f, "frame type does not match negotiated dialect"),
            Self::TruncatedFrame => write!(f, "length-prefixed frame truncated"),
            Self::UnknownMessageType(t) => write!(f, "unknown message type: {t}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// A frame as read off the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// A frame ready to hand to the transport writer.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Server-to-client message, pre-serialization. Each dialect encodes
/// the subset it can express and drops the rest.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Snapshot {
        root: NodeDescription,
        document_time: u64,
    },
    AttributesChanged {
        node_id: NodeId,
        attribute: String,
        value: Option<String>,
    },
    ChildrenChanged {
        node_id: NodeId,
        previous_node_id: Option<NodeId>,
        added: Vec<NodeDescription>,
        removed: Vec<NodeId>,
        document_time: Option<u64>,
    },
    TextChanged {
        node_id: NodeId,
        text: String,
    },
    /// v0.2 only; v0.1 drops these (the reserved attributes are never
    /// transmitted there at all).
    ChangeVisibleTo {
        node_id: NodeId,
        connection_ids: Vec<ConnectionId>,
    },
    ChangeHiddenFrom {
        node_id: NodeId,
        connection_ids: Vec<ConnectionId>,
    },
    /// Elapsed document time, no reply expected.
    DocumentTime { document_time: u64 },
    /// Heartbeat; clients answer with [`ClientMessage::Pong`].
    Ping { ping_id: u64, document_time: u64 },
    Error { message: String },
    Warning { message: String },
}

impl ServerMessage {
    /// Lift an engine diff into the wire vocabulary.
    pub fn from_diff(diff: Diff) -> ServerMessage {
        match diff {
            Diff::Snapshot {
                root,
                document_time,
            } => ServerMessage::Snapshot {
                root,
                document_time,
            },
            Diff::AttributesChanged {
                node_id,
                attribute,
                value,
            } => ServerMessage::AttributesChanged {
                node_id,
                attribute,
                value,
            },
            Diff::ChildrenChanged {
                node_id,
                previous_node_id,
                added,
                removed,
                document_time,
            } => ServerMessage::ChildrenChanged {
                node_id,
                previous_node_id,
                added,
                removed,
                document_time,
            },
            Diff::TextChanged { node_id, text } => ServerMessage::TextChanged { node_id, text },
            Diff::VisibilityModeChanged {
                node_id,
                mode,
                connections,
            } => match mode {
                VisibilityMode::VisibleTo => ServerMessage::ChangeVisibleTo {
                    node_id,
                    connection_ids: connections,
                },
                VisibilityMode::HiddenFrom => ServerMessage::ChangeHiddenFrom {
                    node_id,
                    connection_ids: connections,
                },
            },
        }
    }
}

/// Client-to-server message, post-deserialization.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// v0.2 only: add external connection ids to this socket.
    ConnectUsers { connection_ids: Vec<ConnectionId> },
    /// v0.2 only: remove external connection ids from this socket.
    DisconnectUsers { connection_ids: Vec<ConnectionId> },
    /// Remote event targeting a node in the sender's view. On v0.1 the
    /// adapter fills `connection_id` with the fixed id 1.
    Event {
        connection_id: ConnectionId,
        node_id: NodeId,
        name: String,
        bubbles: bool,
        /// Raw JSON text, passed through to the runtime untouched.
        params: String,
    },
    Pong { ping_id: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiation_picks_first_supported() {
        assert_eq!(
            ProtocolVersion::negotiate(["networked-dom-v0.2", "networked-dom-v0.1"]),
            Some(ProtocolVersion::V02)
        );
        assert_eq!(
            ProtocolVersion::negotiate(["bogus", "networked-dom-v0.1"]),
            Some(ProtocolVersion::V01)
        );
        assert_eq!(ProtocolVersion::negotiate(["bogus"]), None);
        assert_eq!(ProtocolVersion::negotiate([]), None);
    }

    #[test]
    fn test_visibility_policy_per_dialect() {
        assert_eq!(
            ProtocolVersion::V01.visibility_policy(),
            VisibilityPolicy::SuppressHidden
        );
        assert_eq!(
            ProtocolVersion::V02.visibility_policy(),
            VisibilityPolicy::PerConnection
        );
    }

    #[test]
    fn test_visibility_diff_maps_to_change_messages() {
        let msg = ServerMessage::from_diff(Diff::VisibilityModeChanged {
            node_id: 4,
            mode: VisibilityMode::VisibleTo,
            connections: vec![1, 2],
        });
        assert_eq!(
            msg,
            ServerMessage::ChangeVisibleTo {
                node_id: 4,
                connection_ids: vec![1, 2],
            }
        );
    }
}
