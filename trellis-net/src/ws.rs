//! WebSocket attachment.
//!
//! Bridges a `tokio-tungstenite` stream onto a document actor: performs
//! subprotocol negotiation during the HTTP upgrade, then runs a
//! reader/writer task pair. Listener binding and TLS stay with the
//! caller; this module only owns the per-socket plumbing.

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::unbounded_channel;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::Message;

use crate::document::{Command, NetworkedDocument};
use crate::protocol::{InboundFrame, OutboundFrame, ProtocolVersion};

/// Accept WebSocket connections on `bind_addr` and attach each to the
/// document. Runs until the listener fails.
pub async fn serve(
    document: NetworkedDocument,
    bind_addr: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(bind_addr).await?;
    log::info!("document server listening on {bind_addr}");
    loop {
        let (stream, addr) = listener.accept().await?;
        log::debug!("new TCP connection from {addr}");
        let document = document.clone();
        tokio::spawn(async move {
            if let Err(e) = accept_socket(document, stream).await {
                log::error!("connection error from {addr}: {e}");
            }
        });
    }
}

/// Upgrade one TCP stream and run it against the document until either
/// side closes.
pub async fn accept_socket(
    document: NetworkedDocument,
    stream: TcpStream,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut negotiated: Option<ProtocolVersion> = None;
    let callback = |request: &Request, mut response: Response| {
        let offered = request
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        if let Some(version) = ProtocolVersion::negotiate(offered.split(',')) {
            response.headers_mut().insert(
                SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_static(version.subprotocol()),
            );
            negotiated = Some(version);
        }
        Ok(response)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let version = negotiated.unwrap_or_else(|| {
        log::warn!("no mutually supported subprotocol, assuming legacy v0.1 client");
        ProtocolVersion::V01
    });

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = unbounded_channel::<OutboundFrame>();
    let session_id = document.attach_socket(version, outbound_tx);
    log::info!("session {session_id} negotiated {}", version.subprotocol());

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let message = match frame {
                OutboundFrame::Text(text) => Message::Text(text.into()),
                OutboundFrame::Binary(bytes) => Message::Binary(bytes.into()),
            };
            if let Err(e) = ws_sender.send(message).await {
                log::debug!("session {session_id} write failed: {e}");
                break;
            }
        }
    });

    while let Some(message) = ws_receiver.next().await {
        let frame = match message {
            Ok(Message::Text(text)) => InboundFrame::Text(text.as_str().to_owned()),
            Ok(Message::Binary(data)) => InboundFrame::Binary(data.into()),
            Ok(Message::Close(_)) => break,
            // tungstenite answers pings itself
            Ok(_) => continue,
            Err(e) => {
                log::debug!("session {session_id} read failed: {e}");
                break;
            }
        };
        if !document.try_command(Command::Frame { session_id, frame }) {
            // Document disposed while the socket was open.
            break;
        }
    }

    document.try_command(Command::Detach { session_id });
    writer.abort();
    Ok(())
}
