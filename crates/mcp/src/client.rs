//! MCP client used for health probes.
//!
//! Supports both transports a backend may advertise: streamable HTTP (single
//! endpoint, responses either plain JSON or SSE-framed) and the older
//! HTTP+SSE pair (event stream down, message endpoint up). One client probes
//! one server; the supervisor builds a fresh client per probe cycle.

use std::time::Duration;

use futures_util::StreamExt;
use http::{HeaderMap, HeaderValue};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::Url;

use shared::error::CommonError;

use crate::protocol::{
    InitializeParams, InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_TOOLS_LIST, SESSION_ID_HEADER, ToolDescriptor,
    ToolsListResult, TransportKind,
};

#[derive(Error, Debug)]
pub enum McpClientError {
    /// The backend rejected the gateway's credentials (401/403). The server
    /// is reachable; the supervisor maps this to `healthy-auth-expired`.
    #[error("backend rejected credentials with status {status}")]
    AuthRejected { status: u16 },
    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("json-rpc error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("probe deadline exceeded")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl From<McpClientError> for CommonError {
    fn from(e: McpClientError) -> Self {
        CommonError::Upstream {
            msg: e.to_string(),
            source: Some(anyhow::Error::from(e)),
        }
    }
}

impl McpClientError {
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, McpClientError::AuthRejected { .. })
    }
}

/// Resolve the concrete endpoint to probe for a service base URL. Bases are
/// normalized with a trailing slash by the registry; the well-known transport
/// suffix is appended unless the operator already pointed at it.
pub fn probe_endpoint(base_url: &Url, transport: TransportKind) -> Result<Url, McpClientError> {
    let suffix = match transport {
        TransportKind::Sse => "sse",
        TransportKind::StreamableHttp => "mcp",
    };

    let path = base_url.path().trim_end_matches('/');
    if path.ends_with(&format!("/{suffix}")) || path == suffix {
        return Ok(base_url.clone());
    }

    base_url
        .join(suffix)
        .map_err(|e| McpClientError::Protocol(format!("cannot derive probe endpoint: {e}")))
}

pub struct McpClient {
    http: reqwest::Client,
    endpoint: Url,
    transport: TransportKind,
    timeout: Duration,
    session_id: Option<String>,
    next_id: i64,
    sse: Option<SseSession>,
}

impl McpClient {
    pub fn new(
        base_url: &Url,
        transport: TransportKind,
        extra_headers: HeaderMap,
        timeout: Duration,
    ) -> Result<Self, McpClientError> {
        let endpoint = probe_endpoint(base_url, transport)?;
        let http = reqwest::Client::builder()
            .default_headers(extra_headers)
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            endpoint,
            transport,
            timeout,
            session_id: None,
            next_id: 0,
            sse: None,
        })
    }

    /// Full probe handshake: `initialize`, `notifications/initialized`, then
    /// a paginated `tools/list`.
    pub async fn handshake_and_list_tools(
        &mut self,
    ) -> Result<(InitializeResult, Vec<ToolDescriptor>), McpClientError> {
        let init = self.initialize().await?;
        self.notify(METHOD_INITIALIZED).await?;
        let tools = self.list_tools().await?;
        Ok((init, tools))
    }

    pub async fn initialize(&mut self) -> Result<InitializeResult, McpClientError> {
        let params = serde_json::to_value(InitializeParams::for_gateway())
            .map_err(|e| McpClientError::Protocol(e.to_string()))?;
        let result = self.rpc(METHOD_INITIALIZE, Some(params)).await?;
        serde_json::from_value(result)
            .map_err(|e| McpClientError::Protocol(format!("bad initialize result: {e}")))
    }

    pub async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>, McpClientError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));
            let result = self.rpc(METHOD_TOOLS_LIST, params).await?;
            let page: ToolsListResult = serde_json::from_value(result)
                .map_err(|e| McpClientError::Protocol(format!("bad tools/list result: {e}")))?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(c) if !c.is_empty() => cursor = Some(c),
                _ => break,
            }
        }

        Ok(tools)
    }

    async fn rpc(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, McpClientError> {
        self.next_id += 1;
        let request = JsonRpcRequest::new(self.next_id, method, params);

        let response = tokio::time::timeout(self.timeout, async {
            match self.transport {
                TransportKind::StreamableHttp => self.rpc_streamable(&request).await,
                TransportKind::Sse => self.rpc_sse(&request).await,
            }
        })
        .await
        .map_err(|_| McpClientError::Timeout)??;

        if let Some(err) = response.error {
            return Err(McpClientError::Rpc(err));
        }
        response
            .result
            .ok_or_else(|| McpClientError::Protocol("response carries neither result nor error".to_string()))
    }

    async fn notify(&mut self, method: &str) -> Result<(), McpClientError> {
        let request = JsonRpcRequest::notification(method);
        tokio::time::timeout(self.timeout, async {
            match self.transport {
                TransportKind::StreamableHttp => {
                    let endpoint = self.endpoint.clone();
                    self.post_message(&endpoint, &request).await?;
                    Ok(())
                }
                TransportKind::Sse => {
                    let message_url = self.sse_message_url().await?;
                    self.post_message(&message_url, &request).await?;
                    Ok(())
                }
            }
        })
        .await
        .map_err(|_| McpClientError::Timeout)?
    }

    // ------------------------------------------------------------------
    // Streamable HTTP
    // ------------------------------------------------------------------

    async fn rpc_streamable(
        &mut self,
        request: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse, McpClientError> {
        let endpoint = self.endpoint.clone();
        let response = self.post_message(&endpoint, request).await?;

        let content_type = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let body = response.text().await?;

        if content_type.starts_with("text/event-stream") {
            // The endpoint streamed the reply; take the frame answering us.
            for data in sse_data_frames(&body) {
                if let Ok(parsed) = serde_json::from_str::<JsonRpcResponse>(&data) {
                    if parsed.id == request.id {
                        return Ok(parsed);
                    }
                }
            }
            Err(McpClientError::Protocol(
                "event stream closed without a response to our request".to_string(),
            ))
        } else {
            serde_json::from_str(&body)
                .map_err(|e| McpClientError::Protocol(format!("unparseable response body: {e}")))
        }
    }

    /// POST a message, propagating the session header both ways.
    async fn post_message(
        &mut self,
        url: &Url,
        request: &JsonRpcRequest,
    ) -> Result<reqwest::Response, McpClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        if let Some(session_id) = &self.session_id {
            if let Ok(value) = HeaderValue::from_str(session_id) {
                headers.insert(SESSION_ID_HEADER, value);
            }
        }

        let response = self
            .http
            .post(url.clone())
            .headers(headers)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status == http::StatusCode::UNAUTHORIZED || status == http::StatusCode::FORBIDDEN {
            return Err(McpClientError::AuthRejected {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpClientError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }

        if let Some(session_id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(session_id.to_string());
        }

        Ok(response)
    }

    // ------------------------------------------------------------------
    // HTTP + SSE
    // ------------------------------------------------------------------

    async fn rpc_sse(
        &mut self,
        request: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse, McpClientError> {
        let message_url = self.sse_message_url().await?;
        self.post_message(&message_url, request).await?;

        let session = self
            .sse
            .as_mut()
            .ok_or_else(|| McpClientError::Protocol("sse session lost".to_string()))?;

        while let Some(event) = session.stream.next_event().await? {
            if event.event != "message" {
                continue;
            }
            if let Ok(parsed) = serde_json::from_str::<JsonRpcResponse>(&event.data) {
                if parsed.id == request.id {
                    return Ok(parsed);
                }
            }
        }

        Err(McpClientError::Protocol(
            "event stream closed without a response to our request".to_string(),
        ))
    }

    /// Open the SSE stream if not already open and return the message URL
    /// announced by the server's `endpoint` event.
    async fn sse_message_url(&mut self) -> Result<Url, McpClientError> {
        if let Some(session) = &self.sse {
            return Ok(session.message_url.clone());
        }

        let response = self
            .http
            .get(self.endpoint.clone())
            .header(http::header::ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = response.status();
        if status == http::StatusCode::UNAUTHORIZED || status == http::StatusCode::FORBIDDEN {
            return Err(McpClientError::AuthRejected {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(McpClientError::UnexpectedStatus {
                status: status.as_u16(),
                body: String::new(),
            });
        }

        let mut stream = EventStream::new(response);
        let endpoint_event = loop {
            match stream.next_event().await? {
                Some(event) if event.event == "endpoint" => break event,
                Some(_) => continue,
                None => {
                    return Err(McpClientError::Protocol(
                        "sse stream closed before announcing its endpoint".to_string(),
                    ));
                }
            }
        };

        let message_url = self
            .endpoint
            .join(endpoint_event.data.trim())
            .map_err(|e| McpClientError::Protocol(format!("bad endpoint event: {e}")))?;
        debug!(%message_url, "sse message endpoint resolved");

        self.sse = Some(SseSession {
            message_url: message_url.clone(),
            stream,
        });
        Ok(message_url)
    }
}

struct SseSession {
    message_url: Url,
    stream: EventStream,
}

#[derive(Debug, PartialEq)]
struct SseEvent {
    event: String,
    data: String,
}

/// Incremental SSE frame parser over a reqwest byte stream.
struct EventStream {
    inner: futures_util::stream::BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    buffer: String,
}

impl EventStream {
    fn new(response: reqwest::Response) -> Self {
        Self {
            inner: response.bytes_stream().boxed(),
            buffer: String::new(),
        }
    }

    async fn next_event(&mut self) -> Result<Option<SseEvent>, McpClientError> {
        loop {
            if let Some(event) = take_frame(&mut self.buffer) {
                return Ok(Some(event));
            }
            match self.inner.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    self.buffer.push_str(&String::from_utf8_lossy(&chunk));
                }
                None => return Ok(None),
            }
        }
    }
}

/// Pop one complete `event`/`data` frame off the front of the buffer.
fn take_frame(buffer: &mut String) -> Option<SseEvent> {
    let normalized = buffer.replace("\r\n", "\n");
    *buffer = normalized;

    let end = buffer.find("\n\n")?;
    let frame: String = buffer[..end].to_string();
    buffer.drain(..end + 2);

    let mut event = "message".to_string();
    let mut data_lines = Vec::new();
    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        }
    }

    Some(SseEvent {
        event,
        data: data_lines.join("\n"),
    })
}

/// All `data:` payloads in an already-complete SSE body.
fn sse_data_frames(body: &str) -> Vec<String> {
    let mut buffer = format!("{body}\n\n");
    let mut frames = Vec::new();
    while let Some(event) = take_frame(&mut buffer) {
        if !event.data.is_empty() {
            frames.push(event.data);
        }
    }
    frames
}
