//! Legacy JSON dialect (`networked-dom-v0.1`).
//!
//! Text frames only. Each outbound frame is one JSON array of tagged
//! message objects; inbound frames are the same shape. One external
//! connection id per socket, fixed at 1. No batching primitive and no
//! incremental visibility messages: `ChangeVisibleTo`/`ChangeHiddenFrom`
//! are dropped here (the reserved attributes never reach a v0.1 wire in
//! any form).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use trellis_core::diff::NodeDescription;
use trellis_core::tree::NodeId;

use crate::protocol::{ClientMessage, OutboundFrame, ProtocolError, ServerMessage};

/// The one external connection id a v0.1 socket carries.
pub const FIXED_CONNECTION_ID: u64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct JsonNode {
    node_id: NodeId,
    tag: String,
    /// Ordered attribute pairs; an object would not preserve order.
    attributes: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    children: Vec<JsonNode>,
}

impl From<NodeDescription> for JsonNode {
    fn from(node: NodeDescription) -> Self {
        Self {
            node_id: node.node_id,
            tag: node.tag,
            attributes: node.attributes,
            text: node.text,
            children: node.children.into_iter().map(JsonNode::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
#[serde(rename_all_fields = "camelCase")]
enum WireMessage {
    Snapshot {
        document_root: JsonNode,
        document_time: u64,
    },
    AttributeChange {
        node_id: NodeId,
        attribute: String,
        new_value: Option<String>,
    },
    ChildrenChanged {
        node_id: NodeId,
        previous_node_id: Option<NodeId>,
        added_nodes: Vec<JsonNode>,
        removed_nodes: Vec<NodeId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        document_time: Option<u64>,
    },
    TextChanged {
        node_id: NodeId,
        text: String,
    },
    DocumentTime {
        document_time: u64,
    },
    Ping {
        ping: u64,
        document_time: u64,
    },
    Error {
        message: String,
    },
    Warning {
        message: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
#[serde(rename_all_fields = "camelCase")]
enum WireClientMessage {
    Event {
        node_id: NodeId,
        name: String,
        #[serde(default)]
        bubbles: bool,
        #[serde(default)]
        params: Value,
    },
    Pong {
        pong: u64,
    },
}

fn to_wire(message: ServerMessage) -> Option<WireMessage> {
    match message {
        ServerMessage::Snapshot {
            root,
            document_time,
        } => Some(WireMessage::Snapshot {
            document_root: root.into(),
            document_time,
        }),
        ServerMessage::AttributesChanged {
            node_id,
            attribute,
            value,
        } => Some(WireMessage::AttributeChange {
            node_id,
            attribute,
            new_value: value,
        }),
        ServerMessage::ChildrenChanged {
            node_id,
            previous_node_id,
            added,
            removed,
            document_time,
        } => Some(WireMessage::ChildrenChanged {
            node_id,
            previous_node_id,
            added_nodes: added.into_iter().map(JsonNode::from).collect(),
            removed_nodes: removed,
            document_time,
        }),
        ServerMessage::TextChanged { node_id, text } => {
            Some(WireMessage::TextChanged { node_id, text })
        }
        // No v0.1 equivalent; the node stays visible, nothing to say.
        ServerMessage::ChangeVisibleTo { .. } | ServerMessage::ChangeHiddenFrom { .. } => None,
        ServerMessage::DocumentTime { document_time } => {
            Some(WireMessage::DocumentTime { document_time })
        }
        ServerMessage::Ping {
            ping_id,
            document_time,
        } => Some(WireMessage::Ping {
            ping: ping_id,
            document_time,
        }),
        ServerMessage::Error { message } => Some(WireMessage::Error { message }),
        ServerMessage::Warning { message } => Some(WireMessage::Warning { message }),
    }
}

/// Serialize a batch of messages as one JSON-array text frame. Returns
/// `None` when every message was dropped (nothing expressible in this
/// dialect).
pub fn encode_batch(messages: Vec<ServerMessage>) -> Result<Option<OutboundFrame>, ProtocolError> {
    let wire: Vec<WireMessage> = messages.into_iter().filter_map(to_wire).collect();
    if wire.is_empty() {
        return Ok(None);
    }
    let text =
        serde_json::to_string(&wire).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    Ok(Some(OutboundFrame::Text(text)))
}

/// Parse one inbound text frame. Individually malformed elements are
/// logged and skipped; only an unparseable frame is an error.
pub fn decode_frame(text: &str) -> Result<Vec<ClientMessage>, ProtocolError> {
    let elements: Vec<Value> = serde_json::from_str(text)
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    let mut out = Vec::with_capacity(elements.len());
    for element in elements {
        match serde_json::from_value::<WireClientMessage>(element) {
            Ok(WireClientMessage::Event {
                node_id,
                name,
                bubbles,
                params,
            }) => out.push(ClientMessage::Event {
                connection_id: FIXED_CONNECTION_ID,
                node_id,
                name,
                bubbles,
                params: params.to_string(),
            }),
            Ok(WireClientMessage::Pong { pong }) => {
                out.push(ClientMessage::Pong { ping_id: pong })
            }
            Err(e) => log::warn!("ignoring malformed v0.1 client message: {e}"),
        }
    }
    Ok(out)
}
