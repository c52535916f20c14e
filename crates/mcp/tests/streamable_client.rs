//! Drives the probe client against a minimal in-process streamable-HTTP MCP
//! server to cover the full handshake path.

use axum::{
    Json, Router,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use serde_json::json;
use url::Url;

use mcp::client::McpClient;
use mcp::protocol::{
    JsonRpcRequest, JsonRpcResponse, METHOD_INITIALIZE, METHOD_TOOLS_LIST, SESSION_ID_HEADER,
    TransportKind,
};

const TEST_SESSION: &str = "sess-0001";

async fn mcp_handler(headers: HeaderMap, Json(req): Json<JsonRpcRequest>) -> Response {
    // After initialize, every call must echo the session we handed out.
    if req.method != METHOD_INITIALIZE {
        let got = headers
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if got != TEST_SESSION {
            return (StatusCode::BAD_REQUEST, "missing session").into_response();
        }
    }

    if req.is_notification() {
        return StatusCode::ACCEPTED.into_response();
    }

    let result = match req.method.as_str() {
        METHOD_INITIALIZE => json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "stub-server", "version": "0.0.1"}
        }),
        METHOD_TOOLS_LIST => json!({
            "tools": [
                {
                    "name": "current_time_by_timezone",
                    "description": "Current time for an IANA timezone",
                    "inputSchema": {"type": "object"}
                },
                {
                    "name": "list_timezones",
                    "description": "Enumerate known timezones",
                    "inputSchema": {"type": "object"}
                }
            ]
        }),
        other => {
            return Json(JsonRpcResponse::failure(req.id, -32601, format!("no {other}")))
                .into_response();
        }
    };

    let mut response = Json(JsonRpcResponse::success(req.id, result)).into_response();
    response.headers_mut().insert(
        SESSION_ID_HEADER,
        http::HeaderValue::from_static(TEST_SESSION),
    );
    response
}

async fn spawn_stub() -> Url {
    let app = Router::new().route("/mcp", post(mcp_handler));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Url::parse(&format!("http://{addr}/")).unwrap()
}

#[tokio::test]
async fn handshake_lists_tools_and_tracks_session() {
    let base = spawn_stub().await;

    let mut client = McpClient::new(
        &base,
        TransportKind::StreamableHttp,
        http::HeaderMap::new(),
        std::time::Duration::from_secs(5),
    )
    .unwrap();

    let (init, tools) = client.handshake_and_list_tools().await.unwrap();
    assert_eq!(init.protocol_version, "2025-03-26");
    assert_eq!(tools.len(), 2);
    assert_eq!(tools[0].name, "current_time_by_timezone");
}

#[tokio::test]
async fn unauthorized_backend_reports_auth_rejection() {
    let app = Router::new().route(
        "/mcp",
        post(|| async { (StatusCode::UNAUTHORIZED, "expired").into_response() }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    let base = Url::parse(&format!("http://{addr}/")).unwrap();

    let mut client = McpClient::new(
        &base,
        TransportKind::StreamableHttp,
        http::HeaderMap::new(),
        std::time::Duration::from_secs(5),
    )
    .unwrap();

    let err = client.handshake_and_list_tools().await.unwrap_err();
    assert!(err.is_auth_rejection());
}
