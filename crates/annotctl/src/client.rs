//! HTTP client for the annotd daemon.

use annot_core::aggregate::Recount;
use annot_core::{Block, BlockOverlay, Run, StreamEvent};
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: annotd\n  → or set ANNOTD_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} {code} - {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("unauthorized: check ANNOTD_TOKEN env var or --token flag")]
    Unauthorized,

    #[error(
        "daemon not ready after {timeout_ms}ms at {addr}\n  → ensure annotd is running\n  → check ANNOTD_TOKEN if auth is enabled"
    )]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl ClientError {
    /// The overlay moved on (lease lost, already reported, changed by a
    /// reviewer).
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Api { code, .. } if code == "stale_state_conflict")
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::Api {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                code: "transport".to_string(),
                message: e.to_string(),
            }
        }
    }
}

/// Request payload for POST /runs.
#[derive(Debug, Serialize)]
pub struct CreateRunRequest {
    pub conv_uid: String,
    pub schema_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    run: Run,
}

#[derive(Debug, Deserialize)]
struct ListRunsResponse {
    runs: Vec<Run>,
}

#[derive(Debug, Deserialize)]
struct OverlayResponse {
    overlay: BlockOverlay,
}

#[derive(Debug, Deserialize)]
struct OverlaysResponse {
    overlays: Vec<BlockOverlay>,
}

#[derive(Debug, Deserialize)]
struct ListBlocksResponse {
    blocks: Vec<Block>,
}

#[derive(Debug, Deserialize)]
struct ImportBlocksResponse {
    imported: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SkippedBlock {
    pub block_uid: String,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmSummary {
    pub confirmed: Vec<String>,
    pub skipped: Vec<SkippedBlock>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvariantViolation {
    pub block_uid: String,
    pub problem: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditReport {
    pub stored: Recount,
    pub actual: Recount,
    pub violations: Vec<InvariantViolation>,
    pub consistent: bool,
    pub repaired: bool,
}

/// Error response from API.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    code: String,
}

/// Default total timeout for daemon readiness check.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

/// Initial backoff delay for readiness check.
const INITIAL_BACKOFF_MS: u64 = 200;

/// HTTP client for annotd.
#[derive(Debug, Clone)]
pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    /// Returns the daemon address (for error messages).
    pub fn addr(&self) -> &str {
        &self.base_url
    }

    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    /// Probe /health with exponential backoff for up to 5s.
    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        self.wait_for_ready_with_timeout(DEFAULT_READY_TIMEOUT_MS)
            .await
    }

    pub async fn wait_for_ready_with_timeout(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.check_health().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    let elapsed = start.elapsed().as_millis() as u64;
                    if elapsed >= timeout_ms {
                        return Err(ClientError::DaemonNotReady {
                            addr: self.base_url.clone(),
                            timeout_ms,
                        });
                    }

                    eprintln!(
                        "waiting for daemon at {} (retrying in {}ms)",
                        self.base_url, backoff_ms
                    );

                    let remaining = timeout_ms.saturating_sub(elapsed);
                    let sleep_ms = backoff_ms.min(remaining);
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }

    /// Build headers with optional auth token.
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    fn run_url(&self, run_id: &str, suffix: &str) -> String {
        format!(
            "{}/runs/{}{}",
            self.base_url,
            urlencoding::encode(run_id),
            suffix
        )
    }

    fn block_url(&self, run_id: &str, block_uid: &str, action: &str) -> String {
        self.run_url(
            run_id,
            &format!("/blocks/{}/{}", urlencoding::encode(block_uid), action),
        )
    }

    /// Handle error response from API.
    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return ClientError::Unauthorized;
        }

        let body = response.json::<ErrorResponse>().await.ok();
        if status == StatusCode::NOT_FOUND {
            let message = body.map_or_else(|| "resource not found".to_string(), |b| b.error);
            return ClientError::NotFound(message);
        }

        let (code, message) = body.map_or_else(
            || (String::new(), "unknown error".to_string()),
            |b| (b.code, b.error),
        );
        ClientError::Api {
            status: status.as_u16(),
            code,
            message,
        }
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ClientError> {
        let response = request.headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// PUT /documents/{conv_uid}/blocks
    pub async fn import_blocks(&self, conv_uid: &str, blocks: &[Block]) -> Result<usize, ClientError> {
        let url = format!(
            "{}/documents/{}/blocks",
            self.base_url,
            urlencoding::encode(conv_uid)
        );
        let body: ImportBlocksResponse = self
            .send_json(self.http.put(&url).json(&serde_json::json!({ "blocks": blocks })))
            .await?;
        Ok(body.imported)
    }

    /// GET /documents/{conv_uid}/blocks
    pub async fn list_blocks(&self, conv_uid: &str) -> Result<Vec<Block>, ClientError> {
        let url = format!(
            "{}/documents/{}/blocks",
            self.base_url,
            urlencoding::encode(conv_uid)
        );
        let body: ListBlocksResponse = self.send_json(self.http.get(&url)).await?;
        Ok(body.blocks)
    }

    /// POST /runs
    pub async fn create_run(&self, req: &CreateRunRequest) -> Result<Run, ClientError> {
        let url = format!("{}/runs", self.base_url);
        let body: RunResponse = self.send_json(self.http.post(&url).json(req)).await?;
        Ok(body.run)
    }

    /// GET /runs?conv_uid=...
    pub async fn list_runs(&self, conv_uid: Option<&str>) -> Result<Vec<Run>, ClientError> {
        let mut url = format!("{}/runs", self.base_url);
        if let Some(conv) = conv_uid {
            url = format!("{}?conv_uid={}", url, urlencoding::encode(conv));
        }
        let body: ListRunsResponse = self.send_json(self.http.get(&url)).await?;
        Ok(body.runs)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Run, ClientError> {
        let body: RunResponse = self.send_json(self.http.get(self.run_url(run_id, ""))).await?;
        Ok(body.run)
    }

    pub async fn cancel_run(&self, run_id: &str) -> Result<Run, ClientError> {
        let body: RunResponse = self
            .send_json(self.http.post(self.run_url(run_id, "/cancel")))
            .await?;
        Ok(body.run)
    }

    pub async fn delete_run(&self, run_id: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(self.run_url(run_id, ""))
            .headers(self.headers())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    pub async fn list_overlays(&self, run_id: &str) -> Result<Vec<BlockOverlay>, ClientError> {
        let body: OverlaysResponse = self
            .send_json(self.http.get(self.run_url(run_id, "/overlays")))
            .await?;
        Ok(body.overlays)
    }

    /// POST /runs/{id}/claim with a batch size. Empty when there is no work.
    pub async fn claim_batch(
        &self,
        run_id: &str,
        worker_id: &str,
        batch_size: u32,
        lease_sec: Option<u64>,
    ) -> Result<Vec<BlockOverlay>, ClientError> {
        let response = self
            .http
            .post(self.run_url(run_id, "/claim"))
            .headers(self.headers())
            .json(&serde_json::json!({
                "worker_id": worker_id,
                "batch_size": batch_size,
                "lease_sec": lease_sec,
            }))
            .send()
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        let body: OverlaysResponse = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body.overlays)
    }

    pub async fn report_success(
        &self,
        run_id: &str,
        block_uid: &str,
        attempt: u32,
        staging_payload: &Value,
    ) -> Result<BlockOverlay, ClientError> {
        let body: OverlayResponse = self
            .send_json(
                self.http
                    .post(self.block_url(run_id, block_uid, "success"))
                    .json(&serde_json::json!({
                        "attempt": attempt,
                        "staging_payload": staging_payload,
                    })),
            )
            .await?;
        Ok(body.overlay)
    }

    pub async fn report_failure(
        &self,
        run_id: &str,
        block_uid: &str,
        attempt: u32,
        error: &str,
    ) -> Result<BlockOverlay, ClientError> {
        let body: OverlayResponse = self
            .send_json(
                self.http
                    .post(self.block_url(run_id, block_uid, "failure"))
                    .json(&serde_json::json!({ "attempt": attempt, "error": error })),
            )
            .await?;
        Ok(body.overlay)
    }

    pub async fn confirm_block(
        &self,
        run_id: &str,
        block_uid: &str,
        confirmed_by: &str,
    ) -> Result<BlockOverlay, ClientError> {
        let body: OverlayResponse = self
            .send_json(
                self.http
                    .post(self.block_url(run_id, block_uid, "confirm"))
                    .json(&serde_json::json!({ "confirmed_by": confirmed_by })),
            )
            .await?;
        Ok(body.overlay)
    }

    /// POST /runs/{id}/confirm - every ai_complete block, or `block_uids`.
    pub async fn confirm_all(
        &self,
        run_id: &str,
        confirmed_by: &str,
        block_uids: Option<&[String]>,
    ) -> Result<ConfirmSummary, ClientError> {
        let mut body = serde_json::json!({ "confirmed_by": confirmed_by });
        if let Some(uids) = block_uids {
            body["block_uids"] = serde_json::json!(uids);
        }
        self.send_json(self.http.post(self.run_url(run_id, "/confirm")).json(&body))
            .await
    }

    /// `lease_sec` of 0 hands the new attempt to the run's workers.
    pub async fn regenerate(
        &self,
        run_id: &str,
        block_uid: &str,
        requested_by: Option<&str>,
        lease_sec: Option<u64>,
    ) -> Result<BlockOverlay, ClientError> {
        let body: OverlayResponse = self
            .send_json(
                self.http
                    .post(self.block_url(run_id, block_uid, "regenerate"))
                    .json(&serde_json::json!({
                        "requested_by": requested_by,
                        "lease_sec": lease_sec,
                    })),
            )
            .await?;
        Ok(body.overlay)
    }

    /// GET /runs/{id}/export - newline-delimited JSON, returned verbatim.
    pub async fn export(&self, run_id: &str) -> Result<String, ClientError> {
        let response = self
            .http
            .get(self.run_url(run_id, "/export"))
            .headers(self.headers())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response
            .text()
            .await
            .map_err(|e| ClientError::IoError(e.to_string()))
    }

    pub async fn audit(&self, run_id: &str, repair: bool) -> Result<AuditReport, ClientError> {
        let suffix = format!("/audit?repair={repair}");
        self.send_json(self.http.post(self.run_url(run_id, &suffix)))
            .await
    }

    /// GET /runs/{id}/subscribe (SSE)
    pub async fn subscribe(&self, run_id: &str) -> Result<EventStream, ClientError> {
        let response = self
            .http
            .get(self.run_url(run_id, "/subscribe"))
            .headers(self.headers())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Ok(EventStream {
            chunks,
            buffer: String::new(),
        })
    }
}

/// Decoded server-sent events from one subscription.
pub struct EventStream {
    chunks: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: String,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl EventStream {
    /// Next decoded event, or None when the server closed the stream.
    pub async fn next_event(&mut self) -> Result<Option<StreamEvent>, ClientError> {
        loop {
            while let Some(end) = self.buffer.find("\n\n") {
                let raw: String = self.buffer.drain(..end + 2).collect();
                if let Some(event) = parse_sse_event(&raw)? {
                    return Ok(Some(event));
                }
            }
            match self.chunks.next().await {
                Some(chunk) => {
                    let chunk = chunk.map_err(|e| ClientError::IoError(e.to_string()))?;
                    self.buffer.push_str(&String::from_utf8_lossy(&chunk));
                }
                None => return Ok(None),
            }
        }
    }
}

/// Parse one SSE frame. Comments, keep-alives and unknown event types yield
/// None.
fn parse_sse_event(raw: &str) -> Result<Option<StreamEvent>, ClientError> {
    let mut event_type = None;
    let mut data = String::new();

    for line in raw.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim());
        } else if let Some(value) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(value.trim());
        }
    }

    let Some(event_type) = event_type else {
        return Ok(None);
    };
    StreamEvent::decode(event_type, &data).map_err(|e| ClientError::InvalidResponse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_resync_event() {
        let raw = "event: resync\ndata: {\"run_id\":\"r1\",\"reason\":\"missed 3 transitions\"}\n\n";
        match parse_sse_event(raw).unwrap() {
            Some(StreamEvent::Resync(payload)) => {
                assert_eq!(payload.run_id.0, "r1");
                assert!(payload.reason.contains("missed"));
            }
            other => panic!("expected resync, got {other:?}"),
        }
    }

    #[test]
    fn parse_ignores_keepalive_and_unknown_events() {
        assert!(parse_sse_event(":\n\n").unwrap().is_none());
        assert!(parse_sse_event("event: status\ndata: {}\n\n")
            .unwrap()
            .is_none());
    }

    #[test]
    fn parse_rejects_malformed_data() {
        let raw = "event: transition\ndata: not json\n\n";
        assert!(matches!(
            parse_sse_event(raw),
            Err(ClientError::InvalidResponse(_))
        ));
    }

    #[test]
    fn client_trims_trailing_slash() {
        let client = Client::new("http://localhost:7710/", None);
        assert_eq!(client.addr(), "http://localhost:7710");
    }

    #[test]
    fn block_urls_are_encoded() {
        let client = Client::new("http://localhost:7710", None);
        assert_eq!(
            client.block_url("r1", "para 1/a", "claim"),
            "http://localhost:7710/runs/r1/blocks/para%201%2Fa/claim"
        );
    }

    #[test]
    fn client_headers_include_auth_when_token_set() {
        let client = Client::new("http://localhost:7710", Some("test-token"));
        let headers = client.headers();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer test-token");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn client_headers_omit_auth_when_no_token() {
        let client = Client::new("http://localhost:7710", None);
        assert!(client.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn stale_conflict_is_recognised() {
        let err = ClientError::Api {
            status: 409,
            code: "stale_state_conflict".to_string(),
            message: "stale".to_string(),
        };
        assert!(err.is_stale());
        assert!(!ClientError::Unauthorized.is_stale());
    }

    #[tokio::test]
    async fn wait_for_ready_times_out_when_daemon_not_running() {
        let client = Client::new("http://127.0.0.1:19998", None);
        match client.wait_for_ready_with_timeout(100).await {
            Err(ClientError::DaemonNotReady { addr, timeout_ms }) => {
                assert_eq!(addr, "http://127.0.0.1:19998");
                assert_eq!(timeout_ms, 100);
            }
            other => panic!("expected DaemonNotReady error, got {other:?}"),
        }
    }

    #[test]
    fn unauthorized_error_suggests_token_options() {
        let msg = ClientError::Unauthorized.to_string();
        assert!(msg.contains("ANNOTD_TOKEN"));
        assert!(msg.contains("--token"));
    }
}
