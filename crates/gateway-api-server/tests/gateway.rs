//! End-to-end router tests: the seed scenarios driven through the axum
//! surface with `tower::ServiceExt::oneshot`.

use std::time::Duration;

use axum::Router;
use axum::body::Body;
use http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use gateway_api_server::config::{EmbeddingsConfig, EmbeddingsMode, GatewayConfig};
use gateway_api_server::factory::create_api_service;
use gateway_api_server::router::initiate_api_router;
use gateway_api_server::ApiService;
use identity::logic::config::KeycloakConfig;
use identity::logic::session::SESSION_COOKIE_NAME;
use scopes::store::ServerGrant;
use shared::identity::IdProvider;
use shared::test_utils::test_session_user;

const SECRET: &str = "0123456789abcdef0123456789abcdef";

struct TestGateway {
    api: ApiService,
    router: Router,
    #[allow(dead_code)]
    temp_dir: tempfile::TempDir,
}

async fn setup_gateway() -> TestGateway {
    let temp_dir = tempfile::TempDir::new().unwrap();

    let config = GatewayConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        secret_key: SECRET.as_bytes().to_vec(),
        auth_provider: IdProvider::Keycloak,
        cognito: None,
        keycloak: Some(KeycloakConfig {
            url: "https://kc.example.com".to_string(),
            realm: "mcp-gateway".to_string(),
            client_id: "gateway-web".to_string(),
            client_secret: Some("web-secret".to_string()),
            admin_client_id: Some("gateway-admin".to_string()),
            admin_client_secret: Some("admin-secret".to_string()),
        }),
        external_url: "https://gateway.example.com".to_string(),
        registry_dir: temp_dir.path().join("servers"),
        scopes_paths: vec![
            temp_dir.path().join("container/scopes.yml"),
            temp_dir.path().join("host/scopes.yml"),
        ],
        proxy_config_path: temp_dir.path().join("nginx/mcpgw.locations.conf"),
        proxy_reload_cmd: None,
        embeddings: EmbeddingsConfig {
            mode: EmbeddingsMode::Hash,
            url: None,
            model: "hash-projection".to_string(),
            dim: 256,
        },
        health_interval: Duration::from_secs(3600),
        probe_timeout: Duration::from_secs(1),
        session_ttl: Duration::from_secs(1800),
        m2m_secrets_dir: temp_dir.path().join("secrets"),
    };

    let api = create_api_service(&config).await.unwrap();
    api.registry
        .register_service(
            serde_json::from_value(json!({
                "path": "/currenttime",
                "server_name": "Current Time",
                "proxy_pass_url": "http://currenttime:8000/",
                "tool_list": [{
                    "name": "current_time_by_timezone",
                    "description": "Current time for an IANA timezone",
                    "inputSchema": {"type": "object"}
                }],
            }))
            .unwrap(),
        )
        .await
        .unwrap();

    let router = initiate_api_router(api.clone());
    TestGateway {
        api,
        router,
        temp_dir,
    }
}

fn session_cookie(api: &ApiService, groups: &[&str]) -> String {
    let cookie = api
        .auth
        .issue_session(&test_session_user("alice", groups))
        .unwrap();
    format!("{SESSION_COOKIE_NAME}={cookie}")
}

fn tools_call_body(tool: &str) -> String {
    json!({
        "jsonrpc": "2.0", "id": 1, "method": "tools/call",
        "params": {"name": tool, "arguments": {"tz_name": "Asia/Tokyo"}}
    })
    .to_string()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

#[tokio::test]
async fn anonymous_mcpgw_request_is_rejected() {
    let gw = setup_gateway().await;

    let response = gw
        .router
        .oneshot(
            Request::post("/mcpgw/mcp")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"], "no_credentials");
}

#[tokio::test]
async fn wildcard_group_passes_validate() {
    let gw = setup_gateway().await;

    let response = gw
        .router
        .oneshot(
            Request::post("/validate")
                .header("cookie", session_cookie(&gw.api, &["mcp-servers-unrestricted/execute"]))
                .header("x-original-uri", "/currenttime/mcp")
                .header("x-original-method", "POST")
                .body(Body::from(tools_call_body("current_time_by_timezone")))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-principal-id").unwrap(),
        "alice"
    );
    assert_eq!(response.headers().get("x-idp").unwrap(), "keycloak");
}

#[tokio::test]
async fn scoped_group_grants_exact_tool_only() {
    let gw = setup_gateway().await;

    gw.api.scopes.create_group("mcp-servers-time/read").await.unwrap();
    gw.api
        .scopes
        .add_server_to_groups(
            ServerGrant {
                server_name: "/currenttime".to_string(),
                tools: vec!["current_time_by_timezone".to_string()],
                known_service: true,
            },
            &["mcp-servers-time/read".to_string()],
        )
        .await
        .unwrap();

    // Correct tool: allowed.
    let response = gw
        .router
        .clone()
        .oneshot(
            Request::post("/validate")
                .header("cookie", session_cookie(&gw.api, &["mcp-servers-time/read"]))
                .header("x-original-uri", "/currenttime/mcp")
                .body(Body::from(tools_call_body("current_time_by_timezone")))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Same group, different tool: denied with the tool reason.
    let response = gw
        .router
        .oneshot(
            Request::post("/validate")
                .header("cookie", session_cookie(&gw.api, &["mcp-servers-time/read"]))
                .header("x-original-uri", "/currenttime/mcp")
                .body(Body::from(tools_call_body("other_tool")))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["error"], "tool_not_permitted");
}

#[tokio::test]
async fn admin_api_is_capability_gated() {
    let gw = setup_gateway().await;

    // The bootstrap admin role may list.
    let response = gw
        .router
        .clone()
        .oneshot(
            Request::get("/api/list_services")
                .header("cookie", session_cookie(&gw.api, &["mcp-registry-admin"]))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["services"][0]["path"], "/currenttime");

    // A plain scope group may not.
    let response = gw
        .router
        .oneshot(
            Request::get("/api/list_services")
                .header("cookie", session_cookie(&gw.api, &["mcp-servers-time/read"]))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["error"], "ui_capability_missing");
}

#[tokio::test]
async fn vended_token_flows_back_through_validate() {
    let gw = setup_gateway().await;

    let response = gw
        .router
        .clone()
        .oneshot(
            Request::post("/tokens/generate")
                .header("cookie", session_cookie(&gw.api, &["mcp-servers-unrestricted/execute"]))
                .header("content-type", "application/json")
                .body(Body::from(json!({"description": "agent", "expires_in_hours": 2}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let token = body["access_token"].as_str().unwrap().to_string();
    assert_eq!(body["expires_in"], 7200);

    let response = gw
        .router
        .oneshot(
            Request::post("/validate")
                .header("x-authorization", format!("Bearer {token}"))
                .header("x-original-uri", "/currenttime/mcp")
                .body(Body::from(tools_call_body("current_time_by_timezone")))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn mcpgw_tool_finder_and_group_tools() {
    let gw = setup_gateway().await;
    let admin_cookie = session_cookie(&gw.api, &["mcp-registry-admin"]);

    // Index the persisted inventory, then search it through the MCP tool.
    gw.api.discovery.rebuild().await.unwrap();

    let call = |name: &str, arguments: Value| {
        json!({
            "jsonrpc": "2.0", "id": 7, "method": "tools/call",
            "params": {"name": name, "arguments": arguments}
        })
        .to_string()
    };

    let response = gw
        .router
        .clone()
        .oneshot(
            Request::post("/mcpgw/mcp")
                .header("cookie", admin_cookie.clone())
                .header("content-type", "application/json")
                .body(Body::from(call(
                    "intelligent_tool_finder",
                    json!({"query": "current time in Tokyo timezone"}),
                )))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let matches = &body["result"]["structuredContent"]["matches"];
    assert_eq!(matches[0]["tool_name"], "current_time_by_timezone");
    assert_eq!(matches[0]["service_path"], "/currenttime");

    // tools/list advertises the full admin surface.
    let response = gw
        .router
        .clone()
        .oneshot(
            Request::post("/mcpgw/mcp")
                .header("cookie", admin_cookie.clone())
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    let tools = body["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 11);

    // Scope mutations through the MCP surface.
    let response = gw
        .router
        .clone()
        .oneshot(
            Request::post("/mcpgw/mcp")
                .header("cookie", admin_cookie.clone())
                .header("content-type", "application/json")
                .body(Body::from(call(
                    "add_server_to_scopes_groups",
                    json!({
                        "server_name": "/currenttime",
                        "group_names": ["mcp-servers-unrestricted/read"]
                    }),
                )))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["result"]["isError"], false);

    let snapshot = gw.api.scopes.snapshot();
    let entries = snapshot.groups.get("mcp-servers-unrestricted/read").unwrap();
    assert!(entries.iter().any(|p| p.server == "/currenttime"));
}

#[tokio::test]
async fn liveness_needs_no_credentials() {
    let gw = setup_gateway().await;
    let response = gw
        .router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn register_and_remove_roundtrip_through_the_admin_api() {
    let gw = setup_gateway().await;
    let admin_cookie = session_cookie(&gw.api, &["mcp-registry-admin"]);

    let response = gw
        .router
        .clone()
        .oneshot(
            Request::post("/api/register")
                .header("cookie", admin_cookie.clone())
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "path": "/fininfo",
                        "server_name": "Financial Info",
                        "proxy_pass_url": "http://fininfo:8000"
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Unknown keys are rejected, not ignored.
    let response = gw
        .router
        .clone()
        .oneshot(
            Request::post("/api/register")
                .header("cookie", admin_cookie.clone())
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "path": "/typo",
                        "server_name": "Typo",
                        "proxy_pass_url": "http://typo:8000",
                        "proxy_pas_url": "oops"
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let response = gw
        .router
        .oneshot(
            Request::post("/api/remove")
                .header("cookie", admin_cookie)
                .header("content-type", "application/json")
                .body(Body::from(json!({"path": "/fininfo"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(gw.api.registry.server_details("/fininfo").await.is_err());
}
