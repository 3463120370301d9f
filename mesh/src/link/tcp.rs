//! TCP transport with length-delimited JSON frames.
//!
//! The dialing side must send a `Presence` message as its first frame; the
//! accepting side reads it to learn who connected before registering the
//! link.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use super::{Connection, PeerLink, Transport};
use crate::error::LinkError;
use crate::message::MeshMessage;
use crate::protocol::MessageType;

type FrameReader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
type FrameWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

/// Dials peers over TCP.
#[derive(Debug, Default, Clone)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, peer_id: &str, address: &str) -> Result<Connection, LinkError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| LinkError::ConnectionFailed(format!("{peer_id} at {address}: {e}")))?;
        let (read, write) = stream.into_split();
        Ok(pump(
            FramedRead::new(read, LengthDelimitedCodec::new()),
            FramedWrite::new(write, LengthDelimitedCodec::new()),
        ))
    }
}

/// Accept inbound connections and register them on `link`.
pub async fn serve(listener: TcpListener, link: Arc<PeerLink>) -> std::io::Result<()> {
    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let link = Arc::clone(&link);
        tokio::spawn(async move {
            let (read, write) = stream.into_split();
            let mut reader = FramedRead::new(read, LengthDelimitedCodec::new());

            let hello = match reader.next().await {
                Some(Ok(bytes)) => MeshMessage::from_bytes(&bytes),
                _ => {
                    tracing::debug!(%remote_addr, "Connection closed before hello");
                    return;
                }
            };
            let hello = match hello {
                Ok(message) if message.message_type == MessageType::Presence && message.verify() => {
                    message
                }
                Ok(message) => {
                    tracing::warn!(%remote_addr, message_type = message.message_type.as_str(), "First frame was not a valid presence");
                    return;
                }
                Err(e) => {
                    tracing::warn!(%remote_addr, "Undecodable hello frame: {}", e);
                    return;
                }
            };

            let peer_id = hello.sender.clone();
            let connection = pump(reader, FramedWrite::new(write, LengthDelimitedCodec::new()));
            link.attach(&peer_id, connection);
            link.deliver(&peer_id, hello);
        });
    }
}

/// Bridge framed halves to message channels.
fn pump(mut reader: FrameReader, mut writer: FrameWriter) -> Connection {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<MeshMessage>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<MeshMessage>();

    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            match message.to_bytes() {
                Ok(bytes) => {
                    if let Err(e) = writer.send(axum::body::Bytes::from(bytes)).await {
                        tracing::warn!("Failed to write frame: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize message: {}", e);
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(frame) = reader.next().await {
            let message = match frame {
                Ok(bytes) => MeshMessage::from_bytes(&bytes),
                Err(e) => {
                    tracing::warn!("Read error: {}", e);
                    break;
                }
            };
            match message {
                Ok(message) => {
                    if inbound_tx.send(message).is_err() {
                        break;
                    }
                }
                // A malformed frame costs only itself
                Err(e) => tracing::warn!("Dropping undecodable frame: {}", e),
            }
        }
    });

    Connection {
        sender: outbound_tx,
        receiver: inbound_rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkEvent;
    use crate::protocol::{Announcement, Capabilities, MeshPayload};

    #[tokio::test]
    async fn tcp_handshake_registers_dialer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let (acceptor, mut acceptor_events) = PeerLink::new("laptop", Arc::new(TcpTransport));
        tokio::spawn(serve(listener, Arc::clone(&acceptor)));

        let (dialer, _dialer_events) = PeerLink::new("phone", Arc::new(TcpTransport));
        dialer.connect("laptop", &address).await.unwrap();

        let hello = MeshMessage::addressed(
            "phone",
            "laptop",
            &MeshPayload::Presence {
                node: Announcement {
                    id: "phone".into(),
                    name: "Phone".into(),
                    address: None,
                    capabilities: Capabilities::default(),
                },
            },
            1_000,
        )
        .unwrap();
        dialer.send("laptop", hello.clone()).unwrap();

        assert!(matches!(acceptor_events.recv().await, Some(LinkEvent::Connected(p)) if p == "phone"));
        match acceptor_events.recv().await {
            Some(LinkEvent::Message { from, message }) => {
                assert_eq!(from, "phone");
                assert_eq!(message, hello);
            }
            other => panic!("expected hello, got {other:?}"),
        }
        assert!(acceptor.is_connected("phone"));
    }
}
