//! The authorization decision behind `/validate`.
//!
//! Inputs are the policy snapshot, the current routing table, the resolved
//! principal, and the original request (URI + body). The decision is pure:
//! no I/O, no locks, bounded work, so `/validate` stays inside its budget.

use mcp::protocol::{METHOD_TOOLS_CALL, RpcShape, classify_rpc_body};
use registry::ServiceRecord;

use scopes::logic::{READ_METHODS, ScopePolicy, UiCapability};
use shared::error::{CommonError, reason};
use shared::identity::Principal;

pub const HEADER_PRINCIPAL_ID: &str = "x-principal-id";
pub const HEADER_PRINCIPAL_GROUPS: &str = "x-principal-groups";
pub const HEADER_IDP: &str = "x-idp";

/// A positive decision plus the identity headers the proxy injects upstream.
#[derive(Debug, Clone)]
pub struct ValidateDecision {
    pub principal: Principal,
    pub service_path: String,
    pub identity_headers: Vec<(&'static str, String)>,
}

/// Longest-prefix match of a request URI against the routing table, honoring
/// segment boundaries so `/fin` never captures `/fininfo` traffic.
pub fn match_service<'a>(records: &'a [ServiceRecord], uri: &str) -> Option<&'a ServiceRecord> {
    let uri = if uri.is_empty() { "/" } else { uri };
    records
        .iter()
        .filter(|r| {
            let prefix = r.path.trim_end_matches('/');
            uri == prefix || uri == r.path || uri.starts_with(&format!("{prefix}/"))
        })
        .max_by_key(|r| r.path.trim_end_matches('/').len())
}

/// Answer "may this principal invoke this MCP request on this service".
pub fn authorize_request(
    policy: &ScopePolicy,
    records: &[ServiceRecord],
    principal: &Principal,
    uri: &str,
    body: &[u8],
) -> Result<ValidateDecision, CommonError> {
    let record = match_service(records, uri).ok_or_else(|| {
        CommonError::unauthorized(
            reason::UNKNOWN_SERVICE,
            format!("no enabled service is registered for '{uri}'"),
        )
    })?;
    if !record.enabled {
        return Err(CommonError::unauthorized(
            reason::UNKNOWN_SERVICE,
            format!("service '{}' is disabled", record.path),
        ));
    }

    let shape = classify_rpc_body(body);
    check_scopes(policy, record, principal, &shape)?;

    Ok(ValidateDecision {
        principal: principal.clone(),
        service_path: record.path.clone(),
        identity_headers: identity_headers(principal),
    })
}

pub fn identity_headers(principal: &Principal) -> Vec<(&'static str, String)> {
    vec![
        (HEADER_PRINCIPAL_ID, principal.sub.clone()),
        (HEADER_PRINCIPAL_GROUPS, principal.groups.join(",")),
        (HEADER_IDP, principal.idp.as_str().to_string()),
    ]
}

fn check_scopes(
    policy: &ScopePolicy,
    record: &ServiceRecord,
    principal: &Principal,
    shape: &RpcShape,
) -> Result<(), CommonError> {
    let direct: Vec<_> = policy
        .permissions_for(&principal.groups, &record.path, &record.server_name)
        .collect();

    // Groups granted nothing for this service: fall back to the default
    // group for the principal's auth kind.
    let fallback_groups;
    let permissions = if direct.is_empty() {
        let auth_kind = principal.source.auth_kind();
        match policy.default_scopes.get(auth_kind) {
            Some(default_group) => {
                fallback_groups = vec![default_group.clone()];
                policy
                    .permissions_for(&fallback_groups, &record.path, &record.server_name)
                    .collect()
            }
            None => Vec::new(),
        }
    } else {
        direct
    };

    match shape {
        RpcShape::Call { method, tool_name } if method == METHOD_TOOLS_CALL => {
            let method_allowed = permissions.iter().any(|p| p.allows_method(method));
            if !method_allowed {
                return Err(CommonError::unauthorized(
                    reason::METHOD_NOT_PERMITTED,
                    format!("no scope permits '{method}' on '{}'", record.path),
                ));
            }
            let Some(tool) = tool_name else {
                return Err(CommonError::unauthorized(
                    reason::TOOL_NOT_PERMITTED,
                    "tools/call without params.name cannot be authorized",
                ));
            };
            let tool_allowed = permissions
                .iter()
                .any(|p| p.allows_method(method) && p.allows_tool(tool));
            if !tool_allowed {
                return Err(CommonError::unauthorized(
                    reason::TOOL_NOT_PERMITTED,
                    format!("no scope permits tool '{tool}' on '{}'", record.path),
                ));
            }
            Ok(())
        }
        RpcShape::Call { method, .. } => {
            if permissions.iter().any(|p| p.allows_method(method)) {
                Ok(())
            } else {
                Err(CommonError::unauthorized(
                    reason::METHOD_NOT_PERMITTED,
                    format!("no scope permits '{method}' on '{}'", record.path),
                ))
            }
        }
        // Unparseable or empty bodies can only be handshake traffic: allow
        // when any read method is in scope, never a tool call.
        RpcShape::Malformed | RpcShape::Empty => {
            let read_allowed = permissions
                .iter()
                .any(|p| READ_METHODS.iter().any(|m| p.allows_method(m)));
            if read_allowed {
                Ok(())
            } else {
                Err(CommonError::unauthorized(
                    reason::METHOD_NOT_PERMITTED,
                    format!("no scope permits reading '{}'", record.path),
                ))
            }
        }
    }
}

/// Gate an admin endpoint on a UI capability from the policy's `UI-Scopes`.
pub fn require_ui_capability(
    policy: &ScopePolicy,
    principal: &Principal,
    capability: UiCapability,
    target: Option<&str>,
) -> Result<(), CommonError> {
    if policy.ui_allows(&principal.groups, capability, target) {
        Ok(())
    } else {
        Err(CommonError::unauthorized(
            reason::UI_CAPABILITY_MISSING,
            format!(
                "principal '{}' lacks the '{}' capability",
                principal.sub,
                capability.as_str()
            ),
        ))
    }
}
