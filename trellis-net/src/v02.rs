//! Binary dialect (`networked-dom-v0.2`).
//!
//! Wire format, per socket message:
//! ```text
//! ┌──────────┬────────────────┬──────────┬──────────────┬─ ─ ─
//! │ len: u32 │ msg (bincode)  │ len: u32 │ msg (bincode)│ ...
//! │ LE       │                │ LE       │              │
//! └──────────┴────────────────┴──────────┴──────────────┴─ ─ ─
//! ```
//!
//! Several messages produced synchronously share one socket message,
//! wrapped in `BatchStart`/`BatchEnd`; the envelope is elided when
//! exactly one message is pending (framing overhead only, identical
//! delivery semantics). Event params stay raw JSON text inside the
//! binary frame: bincode is not self-describing and cannot carry free
//! form values.

use serde::{Deserialize, Serialize};

use trellis_core::diff::NodeDescription;
use trellis_core::subjectivity::ConnectionId;
use trellis_core::tree::NodeId;

use crate::protocol::{ClientMessage, OutboundFrame, ProtocolError, ServerMessage};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
enum WireMessage {
    Snapshot {
        root: NodeDescription,
        document_time: u64,
    },
    AttributesChanged {
        node_id: NodeId,
        attribute: String,
        value: Option<String>,
    },
    /// Empty `added` with a document time is the reload placeholder.
    ChildrenAdded {
        node_id: NodeId,
        previous_node_id: Option<NodeId>,
        added: Vec<NodeDescription>,
        document_time: Option<u64>,
    },
    ChildrenRemoved {
        node_id: NodeId,
        removed: Vec<NodeId>,
    },
    TextChanged {
        node_id: NodeId,
        text: String,
    },
    ChangeVisibleTo {
        node_id: NodeId,
        connection_ids: Vec<ConnectionId>,
    },
    ChangeHiddenFrom {
        node_id: NodeId,
        connection_ids: Vec<ConnectionId>,
    },
    DocumentTime {
        document_time: u64,
    },
    Ping {
        ping_id: u64,
        document_time: u64,
    },
    Error {
        message: String,
    },
    Warning {
        message: String,
    },
    BatchStart,
    BatchEnd,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
enum WireClientMessage {
    ConnectUsers {
        connection_ids: Vec<ConnectionId>,
    },
    DisconnectUsers {
        connection_ids: Vec<ConnectionId>,
    },
    Event {
        connection_id: ConnectionId,
        node_id: NodeId,
        name: String,
        bubbles: bool,
        params: String,
    },
    Pong {
        ping_id: u64,
    },
}

/// One abstract message can expand to several wire messages: a combined
/// children diff is sent as removal then addition (the insertion anchor
/// is computed post-removal).
fn to_wire(message: ServerMessage, out: &mut Vec<WireMessage>) {
    match message {
        ServerMessage::Snapshot {
            root,
            document_time,
        } => out.push(WireMessage::Snapshot {
            root,
            document_time,
        }),
        ServerMessage::AttributesChanged {
            node_id,
            attribute,
            value,
        } => out.push(WireMessage::AttributesChanged {
            node_id,
            attribute,
            value,
        }),
        ServerMessage::ChildrenChanged {
            node_id,
            previous_node_id,
            added,
            removed,
            document_time,
        } => {
            if !removed.is_empty() {
                out.push(WireMessage::ChildrenRemoved { node_id, removed });
            }
            if !added.is_empty() || document_time.is_some() {
                out.push(WireMessage::ChildrenAdded {
                    node_id,
                    previous_node_id,
                    added,
                    document_time,
                });
            }
        }
        ServerMessage::TextChanged { node_id, text } => {
            out.push(WireMessage::TextChanged { node_id, text })
        }
        ServerMessage::ChangeVisibleTo {
            node_id,
            connection_ids,
        } => out.push(WireMessage::ChangeVisibleTo {
            node_id,
            connection_ids,
        }),
        ServerMessage::ChangeHiddenFrom {
            node_id,
            connection_ids,
        } => out.push(WireMessage::ChangeHiddenFrom {
            node_id,
            connection_ids,
        }),
        ServerMessage::DocumentTime { document_time } => {
            out.push(WireMessage::DocumentTime { document_time })
        }
        ServerMessage::Ping {
            ping_id,
            document_time,
        } => out.push(WireMessage::Ping {
            ping_id,
            document_time,
        }),
        ServerMessage::Error { message } => out.push(WireMessage::Error { message }),
        ServerMessage::Warning { message } => out.push(WireMessage::Warning { message }),
    }
}

fn push_framed(buffer: &mut Vec<u8>, message: &WireMessage) -> Result<(), ProtocolError> {
    let encoded = bincode::serde::encode_to_vec(message, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    buffer.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
    buffer.extend_from_slice(&encoded);
    Ok(())
}

/// Serialize a batch into one binary socket message. The batch envelope
/// is elided for a single message.
pub fn encode_batch(messages: Vec<ServerMessage>) -> Result<Option<OutboundFrame>, ProtocolError> {
    let mut wire = Vec::with_capacity(messages.len());
    for message in messages {
        to_wire(message, &mut wire);
    }
    if wire.is_empty() {
        return Ok(None);
    }
    let mut buffer = Vec::new();
    let batched = wire.len() > 1;
    if batched {
        push_framed(&mut buffer, &WireMessage::BatchStart)?;
    }
    for message in &wire {
        push_framed(&mut buffer, message)?;
    }
    if batched {
        push_framed(&mut buffer, &WireMessage::BatchEnd)?;
    }
    Ok(Some(OutboundFrame::Binary(buffer)))
}

/// Parse one inbound binary frame into its client messages. A decode
/// failure abandons the rest of the frame (framing is lost at that
/// point) but is reported for a structured reply, not a disconnect.
pub fn decode_frame(bytes: &[u8]) -> Result<Vec<ClientMessage>, ProtocolError> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        if offset + 4 > bytes.len() {
            return Err(ProtocolError::TruncatedFrame);
        }
        let len = u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]) as usize;
        offset += 4;
        if offset + len > bytes.len() {
            return Err(ProtocolError::TruncatedFrame);
        }
        let (message, _): (WireClientMessage, usize) =
            bincode::serde::decode_from_slice(&bytes[offset..offset + len], bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        offset += len;
        out.push(match message {
            WireClientMessage::ConnectUsers { connection_ids } => {
                ClientMessage::ConnectUsers { connection_ids }
            }
            WireClientMessage::DisconnectUsers { connection_ids } => {
                ClientMessage::DisconnectUsers { connection_ids }
            }
            WireClientMessage::Event {
                connection_id,
                node_id,
                name,
                bubbles,
                params,
            } => ClientMessage::Event {
                connection_id,
                node_id,
                name,
                bubbles,
                params,
            },
            WireClientMessage::Pong { ping_id } => ClientMessage::Pong { ping_id },
        });
    }
    Ok(out)
}

/// Encode client messages the way a v0.2 client would (test harnesses
/// and the in-process client side of integration suites).
pub fn encode_client_messages(messages: &[ClientMessage]) -> Result<Vec<u8>, ProtocolError> {
    let mut buffer = Vec::new();
    for message in messages {
        let wire = match message.clone() {
            ClientMessage::ConnectUsers { connection_ids } => {
                WireClientMessage::ConnectUsers { connection_ids }
            }
            ClientMessage::DisconnectUsers { connection_ids } => {
                WireClientMessage::DisconnectUsers { connection_ids }
            }
            ClientMessage::Event {
                connection_id,
                node_id,
                name,
                bubbles,
                params,
            } => WireClientMessage::Event {
                connection_id,
                node_id,
                name,
                bubbles,
                params,
            },
            ClientMessage::Pong { ping_id } => WireClientMessage::Pong { ping_id },
        };
        let encoded = bincode::serde::encode_to_vec(&wire, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        buffer.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        buffer.extend_from_slice(&encoded);
    }
    Ok(buffer)
}

/// Decode a server frame, client side. Returns the abstract messages
/// with any batch envelope stripped, plus whether one was present. The
/// removed/added halves of a split children diff come back as two
/// separate `ChildrenChanged` values.
pub fn decode_server_frame(
    bytes: &[u8],
) -> Result<(Vec<ServerMessage>, bool), ProtocolError> {
    let mut wire = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        if offset + 4 > bytes.len() {
            return Err(ProtocolError::TruncatedFrame);
        }
        let len = u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]) as usize;
        offset += 4;
        if offset + len > bytes.len() {
            return Err(ProtocolError::TruncatedFrame);
        }
        let (message, _): (WireMessage, usize) =
            bincode::serde::decode_from_slice(&bytes[offset..offset + len], bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        offset += len;
        wire.push(message);
    }
    let batched = wire.first() == Some(&WireMessage::BatchStart);
    if batched {
        if wire.last() != Some(&WireMessage::BatchEnd) {
            return Err(ProtocolError::TruncatedFrame);
        }
        wire.remove(0);
        wire.pop();
    }
    let messages = wire
        .into_iter()
        .map(|message| match message {
            WireMessage::Snapshot {
                root,
                document_time,
            } => ServerMessage::Snapshot {
                root,
                document_time,
            },
            WireMessage::AttributesChanged {
                node_id,
                attribute,
                value,
            } => ServerMessage::AttributesChanged {
                node_id,
                attribute,
                value,
            },
            WireMessage::ChildrenAdded {
                node_id,
                previous_node_id,
                added,
                document_time,
            } => ServerMessage::ChildrenChanged {
                node_id,
                previous_node_id,
                added,
                removed: vec![],
                document_time,
            },
            WireMessage::ChildrenRemoved { node_id, removed } => ServerMessage::ChildrenChanged {
                node_id,
                previous_node_id: None,
                added: vec![],
                removed,
                document_time: None,
            },
            WireMessage::TextChanged { node_id, text } => {
                ServerMessage::TextChanged { node_id, text }
            }
            WireMessage::ChangeVisibleTo {
                node_id,
                connection_ids,
            } => ServerMessage::ChangeVisibleTo {
                node_id,
                connection_ids,
            },
            WireMessage::ChangeHiddenFrom {
                node_id,
                connection_ids,
            } => ServerMessage::ChangeHiddenFrom {
                node_id,
                connection_ids,
            },
            WireMessage::DocumentTime { document_time } => {
                ServerMessage::DocumentTime { document_time }
            }
            WireMessage::Ping {
                ping_id,
                document_time,
            } => ServerMessage::Ping {
                ping_id,
                document_time,
            },
            WireMessage::Error { message } => ServerMessage::Error { message },
            WireMessage::Warning { message } => ServerMessage::Warning { message },
            WireMessage::BatchStart | WireMessage::BatchEnd => ServerMessage::Warning {
                message: "nested batch envelope".into(),
            },
        })
        .collect();
    Ok((messages, batched))
}
