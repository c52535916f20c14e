//! Scope-policy document model.
//!
//! The policy is a single YAML document with three regions: `UI-Scopes`
//! (browser capabilities per UI role), `Default-Scopes` (fallback group per
//! auth kind), and any number of user-defined groups mapping to per-server
//! permissions. Group membership comes from IdP token claims; this document
//! decides what a group may do.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Groups that must always exist and can never be deleted.
pub const GROUP_UNRESTRICTED_READ: &str = "mcp-servers-unrestricted/read";
pub const GROUP_UNRESTRICTED_EXECUTE: &str = "mcp-servers-unrestricted/execute";
pub const UI_ROLE_ADMIN: &str = "mcp-registry-admin";

/// Methods granted when a server is added to a group.
pub const STANDARD_METHODS: [&str; 4] = ["initialize", "ping", "tools/list", "tools/call"];

/// Matches any server, tool, or UI target.
pub const WILDCARD: &str = "*";

/// Read-only MCP methods permitted to read-flavored grants.
pub const READ_METHODS: [&str; 3] = ["initialize", "ping", "tools/list"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ServerPermission {
    /// Service path (`/currenttime`) or display name; `*` matches all.
    pub server: String,
    #[serde(default)]
    pub methods: Vec<String>,
    /// Tools callable through `tools/call`. Absent means tool calls are
    /// denied even when the method list would allow them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
}

impl ServerPermission {
    /// Whether this entry applies to the given service (by path or name).
    pub fn matches_server(&self, path: &str, server_name: &str) -> bool {
        self.server == WILDCARD
            || self.server == path
            || self.server == path.trim_end_matches('/')
            || self.server == server_name
    }

    pub fn allows_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method || m == WILDCARD)
    }

    pub fn allows_tool(&self, tool: &str) -> bool {
        match &self.tools {
            Some(tools) => tools.iter().any(|t| t == tool || t == WILDCARD),
            None => false,
        }
    }
}

/// Per-role UI capability lists. Each list names the services the role may
/// apply the capability to, `*` for all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct UiScope {
    #[serde(default)]
    pub list_service: Vec<String>,
    #[serde(default)]
    pub register_service: Vec<String>,
    #[serde(default)]
    pub health_check_service: Vec<String>,
    #[serde(default)]
    pub toggle_service: Vec<String>,
    #[serde(default)]
    pub modify_service: Vec<String>,
    #[serde(default)]
    pub observability: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiCapability {
    ListService,
    RegisterService,
    HealthCheckService,
    ToggleService,
    ModifyService,
    Observability,
}

impl UiCapability {
    pub fn as_str(&self) -> &'static str {
        match self {
            UiCapability::ListService => "list_service",
            UiCapability::RegisterService => "register_service",
            UiCapability::HealthCheckService => "health_check_service",
            UiCapability::ToggleService => "toggle_service",
            UiCapability::ModifyService => "modify_service",
            UiCapability::Observability => "observability",
        }
    }
}

impl UiScope {
    fn targets(&self, capability: UiCapability) -> &[String] {
        match capability {
            UiCapability::ListService => &self.list_service,
            UiCapability::RegisterService => &self.register_service,
            UiCapability::HealthCheckService => &self.health_check_service,
            UiCapability::ToggleService => &self.toggle_service,
            UiCapability::ModifyService => &self.modify_service,
            UiCapability::Observability => &self.observability,
        }
    }

    /// `target = None` asks "may the role use the capability at all".
    pub fn allows(&self, capability: UiCapability, target: Option<&str>) -> bool {
        let targets = self.targets(capability);
        match target {
            None => !targets.is_empty(),
            Some(t) => targets.iter().any(|x| x == WILDCARD || x == t),
        }
    }

    fn admin() -> Self {
        let all = vec![WILDCARD.to_string()];
        Self {
            list_service: all.clone(),
            register_service: all.clone(),
            health_check_service: all.clone(),
            toggle_service: all.clone(),
            modify_service: all.clone(),
            observability: all,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ScopePolicy {
    #[serde(rename = "UI-Scopes", default)]
    pub ui_scopes: BTreeMap<String, UiScope>,
    /// auth kind (`session`, `ingress`) → group applied when none of the
    /// principal's groups grant anything.
    #[serde(rename = "Default-Scopes", default)]
    pub default_scopes: BTreeMap<String, String>,
    /// Every other top-level key is a group.
    #[serde(flatten)]
    pub groups: BTreeMap<String, Vec<ServerPermission>>,
}

impl ScopePolicy {
    /// Policy synthesized when no document exists yet: the two unrestricted
    /// groups, the admin UI role, and read-by-default ingress callers.
    pub fn bootstrap() -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(
            GROUP_UNRESTRICTED_READ.to_string(),
            vec![ServerPermission {
                server: WILDCARD.to_string(),
                methods: READ_METHODS.iter().map(|m| m.to_string()).collect(),
                tools: None,
            }],
        );
        groups.insert(
            GROUP_UNRESTRICTED_EXECUTE.to_string(),
            vec![ServerPermission {
                server: WILDCARD.to_string(),
                methods: STANDARD_METHODS.iter().map(|m| m.to_string()).collect(),
                tools: Some(vec![WILDCARD.to_string()]),
            }],
        );

        let mut ui_scopes = BTreeMap::new();
        ui_scopes.insert(UI_ROLE_ADMIN.to_string(), UiScope::admin());

        let mut default_scopes = BTreeMap::new();
        default_scopes.insert("ingress".to_string(), GROUP_UNRESTRICTED_READ.to_string());
        default_scopes.insert("session".to_string(), GROUP_UNRESTRICTED_READ.to_string());

        Self {
            ui_scopes,
            default_scopes,
            groups,
        }
    }

    /// Boot invariant: the protected groups and the admin UI role exist.
    pub fn check_invariants(&self) -> Result<(), String> {
        for required in [GROUP_UNRESTRICTED_READ, GROUP_UNRESTRICTED_EXECUTE] {
            if !self.groups.contains_key(required) {
                return Err(format!("required group '{required}' is missing"));
            }
        }
        if !self.ui_scopes.contains_key(UI_ROLE_ADMIN) {
            return Err(format!("required UI role '{UI_ROLE_ADMIN}' is missing"));
        }
        Ok(())
    }

    pub fn is_protected_group(name: &str) -> bool {
        name == GROUP_UNRESTRICTED_READ || name == GROUP_UNRESTRICTED_EXECUTE
    }

    /// Permission entries matching a service, across the given groups.
    /// Groups the policy does not know are skipped.
    pub fn permissions_for<'a>(
        &'a self,
        groups: &'a [String],
        path: &'a str,
        server_name: &'a str,
    ) -> impl Iterator<Item = &'a ServerPermission> {
        groups
            .iter()
            .filter_map(|g| self.groups.get(g))
            .flatten()
            .filter(move |p| p.matches_server(path, server_name))
    }

    /// UI capability check across a principal's groups. IdP groups double as
    /// UI roles; a group that is not a UI role contributes nothing.
    pub fn ui_allows(
        &self,
        groups: &[String],
        capability: UiCapability,
        target: Option<&str>,
    ) -> bool {
        groups
            .iter()
            .filter_map(|g| self.ui_scopes.get(g))
            .any(|scope| scope.allows(capability, target))
    }
}
