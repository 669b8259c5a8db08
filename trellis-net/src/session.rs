//! Per-socket session state.
//!
//! A session owns one connection's materialized view, its negotiated
//! dialect, and the outbound frame channel. Messages queue up during a
//! processing step and are flushed as one socket message, which is what
//! lets v0.2 batch synchronously-produced diffs.

use tokio::sync::mpsc::UnboundedSender;

use trellis_core::diff::{ConnectionView, Diff};

use crate::protocol::{
    ClientMessage, InboundFrame, OutboundFrame, ProtocolError, ProtocolVersion, ServerMessage,
};
use crate::{v01, v02};

pub struct Session {
    pub internal_id: u64,
    pub version: ProtocolVersion,
    pub view: ConnectionView,
    outbound: UnboundedSender<OutboundFrame>,
    pending: Vec<ServerMessage>,
}

impl Session {
    pub fn new(
        internal_id: u64,
        version: ProtocolVersion,
        outbound: UnboundedSender<OutboundFrame>,
    ) -> Self {
        let mut view = ConnectionView::new(version.visibility_policy());
        if version == ProtocolVersion::V01 {
            view.external_ids.insert(v01::FIXED_CONNECTION_ID);
        }
        Self {
            internal_id,
            version,
            view,
            outbound,
            pending: Vec::new(),
        }
    }

    pub fn queue(&mut self, message: ServerMessage) {
        self.pending.push(message);
    }

    pub fn queue_diff(&mut self, diff: Diff) {
        self.queue(ServerMessage::from_diff(diff));
    }

    /// Serialize and send everything queued since the last flush as one
    /// socket message. Send failures mean the socket is gone; the
    /// detach notification is already in flight, so they are only
    /// logged.
    pub fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let messages = std::mem::take(&mut self.pending);
        let frame = match self.version {
            ProtocolVersion::V01 => v01::encode_batch(messages),
            ProtocolVersion::V02 => v02::encode_batch(messages),
        };
        match frame {
            Ok(Some(frame)) => {
                if self.outbound.send(frame).is_err() {
                    log::debug!("session {} outbound channel closed", self.internal_id);
                }
            }
            Ok(None) => {}
            Err(e) => log::error!("session {} failed to serialize batch: {e}", self.internal_id),
        }
    }

    /// Decode one inbound frame according to the negotiated dialect.
    pub fn decode(&self, frame: &InboundFrame) -> Result<Vec<ClientMessage>, ProtocolError> {
        match (self.version, frame) {
            (ProtocolVersion::V01, InboundFrame::Text(text)) => v01::decode_frame(text),
            (ProtocolVersion::V02, InboundFrame::Binary(bytes)) => v02::decode_frame(bytes),
            _ => Err(ProtocolError::UnexpectedFrameType),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn test_v01_session_carries_the_fixed_id() {
        let (tx, _rx) = unbounded_channel();
        let session = Session::new(1, ProtocolVersion::V01, tx);
        assert!(session.view.external_ids.contains(&v01::FIXED_CONNECTION_ID));

        let (tx, _rx) = unbounded_channel();
        let session = Session::new(2, ProtocolVersion::V02, tx);
        assert!(session.view.external_ids.is_empty());
    }

    #[test]
    fn test_flush_coalesces_into_one_frame() {
        let (tx, mut rx) = unbounded_channel();
        let mut session = Session::new(1, ProtocolVersion::V02, tx);
        session.queue(ServerMessage::TextChanged {
            node_id: 1,
            text: "a".into(),
        });
        session.queue(ServerMessage::TextChanged {
            node_id: 2,
            text: "b".into(),
        });
        session.flush();
        let frame = rx.try_recv().unwrap();
        assert!(matches!(frame, OutboundFrame::Binary(_)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_flush_without_pending_sends_nothing() {
        let (tx, mut rx) = unbounded_channel();
        let mut session = Session::new(1, ProtocolVersion::V01, tx);
        session.flush();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dialect_frame_type_mismatch() {
        let (tx, _rx) = unbounded_channel();
        let session = Session::new(1, ProtocolVersion::V01, tx);
        assert!(matches!(
            session.decode(&InboundFrame::Binary(vec![0])),
            Err(ProtocolError::UnexpectedFrameType)
        ));
    }
}
