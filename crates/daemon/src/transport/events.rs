//! WebSocket listener for the presence service's event stream.
//!
//! Connects, waits for `hello`, then forwards every `presence_update` to a
//! broadcast channel and answers `ping` frames.  On disconnect it
//! reconnects with the supervisor's jittered back-off and never gives up;
//! only the shutdown token ends it.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pk_domain::PresenceEvent;
use pk_protocol::EventFrame;
use pk_supervisor::BackoffPolicy;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::StreamStatus;

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

pub struct EventStream {
    url: String,
    token: Option<String>,
    events: broadcast::Sender<PresenceEvent>,
    status: StreamStatus,
    backoff: BackoffPolicy,
}

impl EventStream {
    pub(crate) fn new(
        url: String,
        token: Option<String>,
        events: broadcast::Sender<PresenceEvent>,
        status: StreamStatus,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            url,
            token,
            events,
            status,
            backoff,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Connect-and-listen loop.  Returns when `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut attempt: u32 = 0;

        loop {
            let result = tokio::select! {
                r = self.connect_and_run() => r,
                _ = shutdown.cancelled() => break,
            };
            self.status.set_connected(false);

            match result {
                Ok(welcomed) => {
                    tracing::info!(welcomed, "event stream closed");
                    if welcomed {
                        attempt = 0;
                    }
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "event stream lost");
                }
            }

            let delay = self.backoff.delay_for_attempt(attempt);
            tracing::info!(
                delay_ms = delay.as_millis() as u64,
                attempt = attempt + 1,
                "reconnecting event stream"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => break,
            }
            attempt = attempt.saturating_add(1);
        }

        self.status.set_connected(false);
        tracing::debug!("event stream stopped");
    }

    /// One connection lifetime.  `Ok(true)` when `hello` was received
    /// before the stream closed.
    async fn connect_and_run(&self) -> anyhow::Result<bool> {
        tracing::info!(url = %self.url, "connecting to event stream");
        let (ws, _response) = tokio_tungstenite::connect_async(self.request()?).await?;
        let (mut sink, mut stream) = ws.split();

        // ── Wait for hello ───────────────────────────────────────────
        let hello = tokio::time::timeout(HELLO_TIMEOUT, async {
            while let Some(msg) = stream.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(_) => continue,
                    Err(e) => return Err(anyhow::Error::from(e)),
                };
                if let Ok(EventFrame::Hello {
                    server_version,
                    identity,
                }) = serde_json::from_str(&text)
                {
                    return Ok((server_version, identity));
                }
            }
            Err(anyhow::anyhow!("event stream closed before hello"))
        })
        .await;

        let (server_version, identity) = match hello {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("event stream hello timeout")),
        };
        tracing::info!(
            server_version = %server_version,
            identity = identity.as_deref().unwrap_or("-"),
            "event stream attached"
        );
        self.status.set_connected(true);

        // ── Message loop ─────────────────────────────────────────────
        while let Some(msg) = stream.next().await {
            match msg? {
                Message::Text(text) => match serde_json::from_str::<EventFrame>(&text) {
                    Ok(frame) => {
                        if let Some(reply) = self.dispatch(frame) {
                            sink.send(Message::Text(serde_json::to_string(&reply)?))
                                .await?;
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, "unparseable event frame"),
                },
                Message::Close(_) => {
                    tracing::info!("presence service closed event stream");
                    break;
                }
                _ => {}
            }
        }

        Ok(true)
    }

    /// Handle one frame; returns the frame to send back, if any.
    fn dispatch(&self, frame: EventFrame) -> Option<EventFrame> {
        match frame {
            EventFrame::Ping { timestamp } => Some(EventFrame::Pong { timestamp }),
            EventFrame::Pong { .. } => {
                tracing::trace!("received pong");
                None
            }
            EventFrame::Hello { server_version, .. } => {
                tracing::debug!(server_version = %server_version, "repeated hello");
                None
            }
            update @ EventFrame::PresenceUpdate { .. } => {
                if let Some(event) = update.into_presence_event() {
                    tracing::debug!(
                        group_id = %event.group_id,
                        identity = %event.identity,
                        "presence update"
                    );
                    // No receivers is fine: nobody is listening yet.
                    let _ = self.events.send(event);
                }
                None
            }
        }
    }

    fn request(&self) -> anyhow::Result<Request> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(request)
    }
}
