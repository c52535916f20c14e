//! The gateway's own MCP server at `/mcpgw/mcp`: the admin surface exposed
//! as tools over streamable HTTP, authorized exactly like the HTTP admin
//! endpoints.

use axum::{
    Json, Router,
    extract::State,
    response::{IntoResponse, Response},
    routing::post,
};
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use mcp::protocol::{
    JsonRpcRequest, JsonRpcResponse, MCP_PROTOCOL_VERSION, METHOD_INITIALIZE, METHOD_NOT_FOUND,
    METHOD_PING, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST, PARSE_ERROR,
};
use scopes::logic::UiCapability;
use shared::error::CommonError;
use shared::identity::Principal;

use crate::ApiService;

pub fn create_router() -> Router<ApiService> {
    Router::new().route("/mcpgw/mcp", post(handle_rpc))
}

async fn handle_rpc(State(ctx): State<ApiService>, headers: HeaderMap, body: Bytes) -> Response {
    // Unauthenticated callers get an HTTP-level rejection, same as any
    // proxied service.
    let principal = match ctx.auth.resolve_principal(&headers).await {
        Ok(principal) => principal,
        Err(e) => return e.into_response(),
    };

    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return Json(JsonRpcResponse::failure(
                None,
                PARSE_ERROR,
                format!("body is not JSON-RPC: {e}"),
            ))
            .into_response();
        }
    };

    if request.is_notification() {
        return StatusCode::ACCEPTED.into_response();
    }

    let id = request.id.clone();
    let result = match request.method.as_str() {
        METHOD_INITIALIZE => Ok(json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "mcpgw", "version": env!("CARGO_PKG_VERSION")},
        })),
        METHOD_PING => Ok(json!({})),
        METHOD_TOOLS_LIST => Ok(json!({ "tools": tool_definitions() })),
        METHOD_TOOLS_CALL => {
            let params = request.params.unwrap_or(Value::Null);
            match call_tool(&ctx, &principal, params).await {
                Ok(value) => Ok(tool_result(value)),
                // Auth failures escalate to HTTP status; everything else is
                // a tool-level error result.
                Err(e @ CommonError::Authentication { .. })
                | Err(e @ CommonError::Authorization { .. }) => return e.into_response(),
                Err(e) => Ok(tool_error(&e)),
            }
        }
        other => Err((METHOD_NOT_FOUND, format!("method '{other}' is not supported"))),
    };

    let response = match result {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err((code, message)) => JsonRpcResponse::failure(id, code, message),
    };
    Json(response).into_response()
}

fn tool_result(value: Value) -> Value {
    json!({
        "content": [{"type": "text", "text": value.to_string()}],
        "structuredContent": value,
        "isError": false,
    })
}

fn tool_error(error: &CommonError) -> Value {
    json!({
        "content": [{"type": "text", "text": json!({
            "success": false,
            "error": error.code(),
            "detail": error.to_string(),
        }).to_string()}],
        "isError": true,
    })
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

async fn call_tool(
    ctx: &ApiService,
    principal: &Principal,
    params: Value,
) -> Result<Value, CommonError> {
    let call: ToolCallParams = serde_json::from_value(params)
        .map_err(|e| CommonError::validation(format!("bad tools/call params: {e}")))?;
    let args = call.arguments;

    match call.name.as_str() {
        "register_service" => {
            let record: registry::ServiceRecord = parse_args(args)?;
            ctx.auth
                .require_ui(principal, UiCapability::RegisterService, Some(&record.path))?;
            let service = ctx.registry.register_service(record).await?;
            Ok(json!({"success": true, "service": service}))
        }
        "remove_service" => {
            #[derive(Deserialize)]
            #[serde(deny_unknown_fields)]
            struct Args {
                path: String,
            }
            let args: Args = parse_args(args)?;
            ctx.auth
                .require_ui(principal, UiCapability::ModifyService, Some(&args.path))?;
            let removed = ctx.registry.remove_service(&args.path).await?;
            Ok(json!({"success": true, "removed": removed.path}))
        }
        "toggle_service" => {
            #[derive(Deserialize)]
            #[serde(deny_unknown_fields)]
            struct Args {
                path: String,
                enabled: bool,
            }
            let args: Args = parse_args(args)?;
            ctx.auth
                .require_ui(principal, UiCapability::ToggleService, Some(&args.path))?;
            let service = ctx.registry.toggle_service(&args.path, args.enabled).await?;
            Ok(json!({"success": true, "service": service}))
        }
        "healthcheck" => {
            ctx.auth
                .require_ui(principal, UiCapability::HealthCheckService, None)?;
            Ok(json!({"success": true, "statuses": ctx.health.snapshot()}))
        }
        "intelligent_tool_finder" => {
            #[derive(Deserialize)]
            #[serde(deny_unknown_fields)]
            struct Args {
                query: String,
                #[serde(default = "default_top_k")]
                top_k_services: usize,
                #[serde(default = "default_top_n")]
                top_n_tools: usize,
                #[serde(default)]
                tags: Option<Vec<String>>,
            }
            fn default_top_k() -> usize {
                3
            }
            fn default_top_n() -> usize {
                1
            }
            let args: Args = parse_args(args)?;
            ctx.auth
                .require_ui(principal, UiCapability::ListService, None)?;
            let matches = ctx
                .discovery
                .intelligent_tool_finder(
                    &args.query,
                    args.top_k_services,
                    args.top_n_tools,
                    args.tags,
                )
                .await?;
            Ok(json!({"success": true, "matches": matches}))
        }
        "list_groups" => {
            ctx.auth
                .require_ui(principal, UiCapability::ListService, None)?;
            let groups = ctx.group_sync.list_groups().await?;
            Ok(json!({"success": true, "groups": groups}))
        }
        "create_group" => {
            #[derive(Deserialize)]
            #[serde(deny_unknown_fields)]
            struct Args {
                name: String,
                #[serde(default)]
                description: Option<String>,
            }
            let args: Args = parse_args(args)?;
            ctx.auth
                .require_ui(principal, UiCapability::ModifyService, None)?;
            ctx.group_sync
                .create_group(&args.name, args.description.as_deref())
                .await?;
            Ok(json!({"success": true, "group": args.name}))
        }
        "delete_group" => {
            #[derive(Deserialize)]
            #[serde(deny_unknown_fields)]
            struct Args {
                name: String,
            }
            let args: Args = parse_args(args)?;
            ctx.auth
                .require_ui(principal, UiCapability::ModifyService, None)?;
            ctx.group_sync.delete_group(&args.name).await?;
            Ok(json!({"success": true, "group": args.name}))
        }
        "add_server_to_scopes_groups" => {
            let args: ServerGroupsArgs = parse_args(args)?;
            ctx.auth
                .require_ui(principal, UiCapability::ModifyService, Some(&args.server_name))?;
            let report = ctx
                .group_sync
                .add_server_to_groups(&args.server_name, &args.group_names)
                .await?;
            Ok(json!({"success": true, "report": report}))
        }
        "remove_server_from_scopes_groups" => {
            let args: ServerGroupsArgs = parse_args(args)?;
            ctx.auth
                .require_ui(principal, UiCapability::ModifyService, Some(&args.server_name))?;
            let report = ctx
                .group_sync
                .remove_server_from_groups(&args.server_name, &args.group_names)
                .await?;
            Ok(json!({"success": true, "report": report}))
        }
        "create_m2m_user" => {
            #[derive(Deserialize)]
            #[serde(deny_unknown_fields)]
            struct Args {
                name: String,
                #[serde(default)]
                groups: Vec<String>,
                #[serde(default)]
                description: Option<String>,
            }
            let args: Args = parse_args(args)?;
            ctx.auth
                .require_ui(principal, UiCapability::ModifyService, None)?;
            let created = ctx
                .group_sync
                .create_m2m_user(&args.name, &args.groups, args.description.as_deref())
                .await?;
            Ok(json!({"success": true, "credential": created}))
        }
        other => {
            debug!(tool = other, "unknown mcpgw tool");
            Err(CommonError::NotFound {
                msg: format!("no such tool '{other}'"),
                lookup_id: other.to_string(),
                source: None,
            })
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServerGroupsArgs {
    server_name: String,
    group_names: Vec<String>,
}

fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, CommonError> {
    serde_json::from_value(args)
        .map_err(|e| CommonError::validation(format!("bad tool arguments: {e}")))
}

fn tool_definitions() -> Vec<Value> {
    let string = |desc: &str| json!({"type": "string", "description": desc});
    let string_array = |desc: &str| {
        json!({"type": "array", "items": {"type": "string"}, "description": desc})
    };
    let object = |props: Value, required: Vec<&str>| {
        json!({"type": "object", "properties": props, "required": required})
    };

    vec![
        json!({
            "name": "register_service",
            "description": "Register a new MCP server behind the gateway",
            "inputSchema": object(json!({
                "path": string("Unique URL path prefix, starting with /"),
                "server_name": string("Display name"),
                "proxy_pass_url": string("Backend base URL"),
                "description": string("Free-form description"),
                "tags": string_array("Classification tags"),
            }), vec!["path", "server_name", "proxy_pass_url"]),
        }),
        json!({
            "name": "remove_service",
            "description": "Unregister a service and drop its routes and scopes",
            "inputSchema": object(json!({"path": string("Service path")}), vec!["path"]),
        }),
        json!({
            "name": "toggle_service",
            "description": "Enable or disable routing for a service",
            "inputSchema": object(json!({
                "path": string("Service path"),
                "enabled": {"type": "boolean"},
            }), vec!["path", "enabled"]),
        }),
        json!({
            "name": "healthcheck",
            "description": "Health snapshot of every registered service",
            "inputSchema": object(json!({}), vec![]),
        }),
        json!({
            "name": "intelligent_tool_finder",
            "description": "Semantic search over the tools of healthy services",
            "inputSchema": object(json!({
                "query": string("Natural-language description of the needed capability"),
                "top_k_services": {"type": "integer", "default": 3},
                "top_n_tools": {"type": "integer", "default": 1},
                "tags": string_array("Restrict stage one to services sharing a tag"),
            }), vec!["query"]),
        }),
        json!({
            "name": "list_groups",
            "description": "IdP and scope-policy groups with their sync state",
            "inputSchema": object(json!({}), vec![]),
        }),
        json!({
            "name": "create_group",
            "description": "Create a group in the IdP and the scope policy",
            "inputSchema": object(json!({
                "name": string("Group name"),
                "description": string("Optional description"),
            }), vec!["name"]),
        }),
        json!({
            "name": "delete_group",
            "description": "Delete a group from the scope policy and the IdP",
            "inputSchema": object(json!({"name": string("Group name")}), vec!["name"]),
        }),
        json!({
            "name": "add_server_to_scopes_groups",
            "description": "Grant a server (with its current tools) to groups",
            "inputSchema": object(json!({
                "server_name": string("Service path or display name"),
                "group_names": string_array("Groups to grant"),
            }), vec!["server_name", "group_names"]),
        }),
        json!({
            "name": "remove_server_from_scopes_groups",
            "description": "Revoke a server from groups",
            "inputSchema": object(json!({
                "server_name": string("Service path or display name"),
                "group_names": string_array("Groups to revoke"),
            }), vec!["server_name", "group_names"]),
        }),
        json!({
            "name": "create_m2m_user",
            "description": "Provision a machine credential assigned to groups",
            "inputSchema": object(json!({
                "name": string("Service-account name"),
                "groups": string_array("Groups to assign"),
                "description": string("Optional description"),
            }), vec!["name"]),
        }),
    ]
}
