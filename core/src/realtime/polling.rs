/// Long-polling transport over plain HTTP, used when the stream cannot be established
use super::protocol::{InboundEvent, OutboundEvent, PROTOCOL_VERSION};
use super::{Credential, Link, TransportKind, LINK_BUFFER};
use crate::error::{ChatError, Result};
use crate::http::HttpClient;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Slack on top of the server's poll window before a poll counts as lost
const POLL_GRACE: Duration = Duration::from_secs(10);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HandshakeRequest<'a> {
    user_id: &'a str,
    protocol_version: u8,
}

#[derive(Deserialize)]
struct HandshakeResponse {
    sid: String,
}

pub struct PollingConnector {
    base: String,
    /// How long the server may hold a poll open before answering `[]`
    poll_timeout: Duration,
}

impl PollingConnector {
    pub fn new(base: impl Into<String>, poll_timeout: Duration) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            poll_timeout,
        }
    }

    /// Open a polling session and start the poll/emit loop
    pub async fn open(&self, credential: &Credential) -> Result<Link> {
        let http = HttpClient::new(credential.token.clone());
        let handshake: HandshakeResponse = http
            .post_json(
                &format!("{}/socket/handshake", self.base),
                &HandshakeRequest {
                    user_id: &credential.user_id,
                    protocol_version: PROTOCOL_VERSION,
                },
            )
            .await
            .map_err(|e| ChatError::Connection(format!("Polling handshake failed: {}", e)))?;
        info!("Polling transport connected (session {})", handshake.sid);

        let sid = urlencoding::encode(&handshake.sid).into_owned();
        let poll_url = format!(
            "{}/socket/poll?sid={}&timeout={}",
            self.base,
            sid,
            self.poll_timeout.as_millis()
        );
        let emit_url = format!("{}/socket/emit?sid={}", self.base, sid);

        let (inbound_tx, inbound_rx) = mpsc::channel(LINK_BUFFER);
        let (outbound_tx, outbound_rx) = mpsc::channel(LINK_BUFFER);
        let poll_timeout = self.poll_timeout;
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = poll_loop(http.clone(), poll_url, inbound_tx, poll_timeout) => {},
                _ = emit_loop(http, emit_url, outbound_rx) => {},
            }
        });

        Ok(Link::new(
            TransportKind::Polling,
            outbound_tx,
            inbound_rx,
            Some(task),
        ))
    }
}

async fn poll_loop(
    http: HttpClient,
    url: String,
    inbound_tx: mpsc::Sender<InboundEvent>,
    poll_timeout: Duration,
) {
    // the server closes each window with `[]`; cancelling a poll early
    // would lose whatever batch it already took off its queue
    let deadline = poll_timeout + POLL_GRACE;
    loop {
        let batch = match timeout(deadline, http.get_json::<Vec<serde_json::Value>>(&url)).await {
            Ok(Ok(batch)) => batch,
            Ok(Err(e)) => {
                warn!("Poll failed: {}", e);
                return;
            }
            Err(_) => {
                warn!("No poll response within {:?}, dropping link", deadline);
                return;
            }
        };
        if batch.is_empty() {
            debug!("Poll window closed empty, re-polling");
        }

        for raw in batch {
            match decode_polled(raw) {
                Ok(event) => {
                    if inbound_tx.send(event).await.is_err() {
                        return;
                    }
                }
                Err(e) => debug!("Dropping malformed polled event: {}", e),
            }
        }
    }
}

async fn emit_loop(http: HttpClient, url: String, mut outbound_rx: mpsc::Receiver<OutboundEvent>) {
    while let Some(event) = outbound_rx.recv().await {
        if let Err(e) = http.post_json::<serde_json::Value, _>(&url, &event).await {
            warn!("Emit of {} failed: {}", event, e);
            return;
        }
    }
}

fn decode_polled(raw: serde_json::Value) -> Result<InboundEvent> {
    let event: InboundEvent = serde_json::from_value(raw)?;
    event.validate()?;
    Ok(event)
}
