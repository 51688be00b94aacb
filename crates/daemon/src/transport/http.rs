//! REST implementation of [`PresenceTransport`].
//!
//! `HttpPresenceTransport` wraps a `reqwest::Client` and maps every trait
//! method onto one call against the presence service.  Status codes are
//! folded into [`TransportError`] so the supervisor can tell a timeout
//! (which may still have succeeded) from a rejection.

use async_trait::async_trait;
use pk_domain::config::ServiceConfig;
use pk_domain::{GroupId, PresenceEvent, SessionFlags, Target, TargetId};
use pk_protocol::{ErrorBody, OpenSessionRequest, OpenSessionResponse, PresenceResponse, TargetInfo};
use pk_supervisor::{BackoffPolicy, PresenceTransport, SessionHandle, TransportError};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use tokio::sync::broadcast;

use super::events::EventStream;
use super::StreamStatus;

const EVENT_CAPACITY: usize = 256;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HttpPresenceTransport {
    http: Client,
    base_url: Url,
    token: Option<String>,
    events: broadcast::Sender<PresenceEvent>,
    status: StreamStatus,
}

impl HttpPresenceTransport {
    /// Build a client from the `[service]` section.  `token` is sent as a
    /// bearer token on every request and on the event stream.
    pub fn new(cfg: &ServiceConfig, token: Option<String>) -> Result<Self, TransportError> {
        let base_url = Url::parse(cfg.base_url.trim())
            .map_err(|e| TransportError::Protocol(format!("invalid base_url {}: {e}", cfg.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(TransportError::Protocol(format!(
                "base_url {} cannot carry a path",
                cfg.base_url
            )));
        }

        let http = Client::builder()
            .timeout(cfg.request_timeout())
            .build()
            .map_err(|e| TransportError::Unavailable(format!("building HTTP client: {e}")))?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            http,
            base_url,
            token,
            events,
            status: StreamStatus::default(),
        })
    }

    /// Connectedness of the event stream, for health reporting.
    pub fn stream_status(&self) -> StreamStatus {
        self.status.clone()
    }

    /// The listener feeding [`PresenceTransport::subscribe`].  Nothing is
    /// delivered to subscribers until it is spawned.
    pub fn event_stream(&self, url: impl Into<String>, backoff: BackoffPolicy) -> EventStream {
        EventStream::new(
            url.into(),
            self.token.clone(),
            self.events.clone(),
            self.status.clone(),
            backoff,
        )
    }

    // ── request helpers ──────────────────────────────────────────────

    /// `base_url` with `segments` appended, each percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn decorate(&self, rb: RequestBuilder) -> RequestBuilder {
        let rb = rb.header("X-Client-Type", "presence-keeper");
        match &self.token {
            Some(token) => rb.bearer_auth(token),
            None => rb,
        }
    }

    async fn send(&self, endpoint: &str, rb: RequestBuilder) -> Result<Response, TransportError> {
        let resp = self.decorate(rb).send().await.map_err(request_error)?;
        tracing::debug!(endpoint, status = resp.status().as_u16(), "presence service call");
        Ok(resp)
    }
}

#[async_trait]
impl PresenceTransport for HttpPresenceTransport {
    async fn open_session(
        &self,
        target: &Target,
        flags: SessionFlags,
    ) -> Result<SessionHandle, TransportError> {
        let url = self.endpoint(&["v1", "groups", target.group_id.as_str(), "sessions"]);
        let body = OpenSessionRequest::new(target, flags);
        let resp = self
            .send("open_session", self.http.post(url).json(&body))
            .await?;

        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }
        let opened: OpenSessionResponse = resp
            .json()
            .await
            .map_err(|e| TransportError::Protocol(format!("open_session response: {e}")))?;
        Ok(SessionHandle::new(opened.session_id))
    }

    async fn close_session(&self, handle: &SessionHandle) -> Result<(), TransportError> {
        let url = self.endpoint(&["v1", "sessions", handle.as_str()]);
        let resp = self.send("close_session", self.http.delete(url)).await?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            // Already gone on the service side.
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(status_error(resp).await),
        }
    }

    async fn resolve_target(&self, target_id: &TargetId) -> Result<Option<Target>, TransportError> {
        let url = self.endpoint(&["v1", "targets", target_id.as_str()]);
        let resp = self.send("resolve_target", self.http.get(url)).await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let info: TargetInfo = resp
                    .json()
                    .await
                    .map_err(|e| TransportError::Protocol(format!("target response: {e}")))?;
                Ok(info.into_target())
            }
            _ => Err(status_error(resp).await),
        }
    }

    async fn query_presence(
        &self,
        group: &GroupId,
        identity: &str,
    ) -> Result<Option<TargetId>, TransportError> {
        let url = self.endpoint(&["v1", "groups", group.as_str(), "members", identity, "presence"]);
        let resp = self.send("query_presence", self.http.get(url)).await?;

        match resp.status() {
            // Not a member: attached to nothing.
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let presence: PresenceResponse = resp
                    .json()
                    .await
                    .map_err(|e| TransportError::Protocol(format!("presence response: {e}")))?;
                Ok(presence.target())
            }
            _ => Err(status_error(resp).await),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }
}

// ── error mapping ───────────────────────────────────────────────────

fn request_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_decode() {
        TransportError::Protocol(e.to_string())
    } else {
        TransportError::Unavailable(e.to_string())
    }
}

async fn status_error(resp: Response) -> TransportError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error)
        .unwrap_or(body);
    classify_status(status, detail)
}

fn classify_status(status: StatusCode, detail: String) -> TransportError {
    let msg = format!("{}: {detail}", status.as_u16());
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => TransportError::Timeout(msg),
        s if s.is_server_error() => TransportError::Unavailable(msg),
        _ => TransportError::Rejected(msg),
    }
}
