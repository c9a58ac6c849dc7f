/// Streaming transport: one TCP connection carrying length-prefixed JSON frames
use super::protocol::{Control, Frame, InboundEvent, OutboundEvent, Packet, PROTOCOL_VERSION};
use super::{Credential, Link, TransportKind, LINK_BUFFER};
use crate::error::{ChatError, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub struct StreamConnector {
    addr: SocketAddr,
    handshake_timeout: Duration,
}

impl StreamConnector {
    pub fn new(addr: SocketAddr, handshake_timeout: Duration) -> Self {
        Self {
            addr,
            handshake_timeout,
        }
    }

    /// Connect, authenticate and start the frame pump
    pub async fn open(&self, credential: &Credential) -> Result<Link> {
        let mut stream = timeout(self.handshake_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| ChatError::Timeout(format!("Connect to {} timed out", self.addr)))?
            .map_err(|e| ChatError::Connection(format!("Connect to {} failed: {}", self.addr, e)))?;
        stream.set_nodelay(true)?;

        let session_id = perform_handshake(&mut stream, credential, self.handshake_timeout).await?;
        info!(
            "Stream transport connected to {} (session {})",
            self.addr, session_id
        );

        let (inbound_tx, inbound_rx) = mpsc::channel(LINK_BUFFER);
        let (outbound_tx, outbound_rx) = mpsc::channel(LINK_BUFFER);
        let task = tokio::spawn(run_stream(stream, inbound_tx, outbound_rx));

        Ok(Link::new(
            TransportKind::Stream,
            outbound_tx,
            inbound_rx,
            Some(task),
        ))
    }
}

/// Send our credential and wait for the server's verdict
async fn perform_handshake(
    stream: &mut TcpStream,
    credential: &Credential,
    wait: Duration,
) -> Result<String> {
    let hello = Control::Handshake {
        user_id: credential.user_id.clone(),
        token: credential.token.clone(),
        protocol_version: PROTOCOL_VERSION,
    };
    Frame::new(hello.to_bytes()?).write_to(stream).await?;

    let frame = timeout(wait, Frame::read_from(stream))
        .await
        .map_err(|_| ChatError::Timeout("Handshake ack timeout".to_string()))??
        .ok_or_else(|| ChatError::Connection("Server closed during handshake".to_string()))?;

    match Packet::decode(&frame.payload)? {
        Packet::Control(Control::HandshakeAck { session_id }) => Ok(session_id),
        Packet::Control(Control::HandshakeReject { reason }) => Err(ChatError::Connection(
            format!("Handshake rejected: {}", reason),
        )),
        other => Err(ChatError::Protocol(format!(
            "Expected handshake ack, got {:?}",
            other
        ))),
    }
}

/// Pump frames in both directions until either side stops
async fn run_stream(
    stream: TcpStream,
    inbound_tx: mpsc::Sender<InboundEvent>,
    mut outbound_rx: mpsc::Receiver<OutboundEvent>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (control_tx, mut control_rx) = mpsc::channel::<Control>(8);

    let read_side = async move {
        loop {
            let frame = match Frame::read_from(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("Server closed the stream");
                    break;
                }
                Err(e) => {
                    warn!("Stream read error: {}", e);
                    break;
                }
            };

            match Packet::decode(&frame.payload) {
                Ok(Packet::Event(event)) => {
                    if inbound_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(Packet::Control(Control::Ping { timestamp })) => {
                    let _ = control_tx.send(Control::Pong { timestamp }).await;
                }
                Ok(Packet::Control(Control::Close { reason })) => {
                    info!("Server closed connection: {}", reason);
                    break;
                }
                Ok(Packet::Control(other)) => {
                    debug!("Ignoring control packet {:?}", other);
                }
                Err(e) => {
                    debug!("Dropping malformed packet: {}", e);
                }
            }
        }
    };

    let write_side = async move {
        loop {
            let encoded = tokio::select! {
                Some(event) = outbound_rx.recv() => event.to_bytes(),
                Some(control) = control_rx.recv() => control.to_bytes(),
                else => break,
            };
            let bytes = match encoded {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to encode outbound packet: {}", e);
                    continue;
                }
            };
            if let Err(e) = Frame::new(bytes).write_to(&mut writer).await {
                warn!("Stream write error: {}", e);
                break;
            }
        }
    };

    tokio::select! {
        _ = read_side => {},
        _ = write_side => {},
    }
}
