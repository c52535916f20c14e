//! Service-record model, validation, and normalization.

pub mod service;

use mcp::protocol::{ToolDescriptor, TransportKind};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use shared::error::CommonError;

/// Authentication scheme the backend expects from the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(from = "String", into = "String")]
pub enum AuthProvider {
    None,
    Cognito,
    Keycloak,
    BedrockAgentcore,
    /// Any other OAuth-style provider name, passed through as-is.
    Other(String),
}

impl Default for AuthProvider {
    fn default() -> Self {
        AuthProvider::None
    }
}

impl From<String> for AuthProvider {
    fn from(s: String) -> Self {
        match s.as_str() {
            "" | "none" => AuthProvider::None,
            "cognito" => AuthProvider::Cognito,
            "keycloak" => AuthProvider::Keycloak,
            "bedrock-agentcore" => AuthProvider::BedrockAgentcore,
            _ => AuthProvider::Other(s),
        }
    }
}

impl From<AuthProvider> for String {
    fn from(p: AuthProvider) -> Self {
        p.as_str().to_string()
    }
}

impl AuthProvider {
    pub fn as_str(&self) -> &str {
        match self {
            AuthProvider::None => "none",
            AuthProvider::Cognito => "cognito",
            AuthProvider::Keycloak => "keycloak",
            AuthProvider::BedrockAgentcore => "bedrock-agentcore",
            AuthProvider::Other(name) => name,
        }
    }
}

/// Static header the proxy injects toward this backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct HeaderSpec {
    pub name: String,
    pub value: String,
}

fn default_enabled() -> bool {
    true
}

fn default_transports() -> Vec<TransportKind> {
    vec![TransportKind::StreamableHttp]
}

/// One registered MCP server. `path` is the identity; everything else may
/// change over the record's lifetime. Unknown keys are rejected so admin
/// payload typos fail loudly instead of persisting silently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct ServiceRecord {
    pub path: String,
    pub server_name: String,
    pub proxy_pass_url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub is_python: bool,
    #[serde(default)]
    pub num_stars: u32,
    #[serde(default)]
    pub num_tools: u32,
    #[serde(default)]
    pub auth_provider: AuthProvider,
    #[serde(default = "default_transports")]
    pub supported_transports: Vec<TransportKind>,
    #[serde(default)]
    pub headers: Vec<HeaderSpec>,
    /// Last known inventory; the health supervisor is the authority.
    #[serde(default)]
    pub tool_list: Vec<ToolDescriptor>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ServiceRecord {
    /// First advertised transport, used by health probes.
    pub fn probe_transport(&self) -> TransportKind {
        self.supported_transports
            .first()
            .copied()
            .unwrap_or(TransportKind::StreamableHttp)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tool_list.iter().map(|t| t.name.clone()).collect()
    }
}

/// Partial update for `edit_service`. The path is the record's identity and
/// cannot be patched.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct ServicePatch {
    pub server_name: Option<String>,
    pub proxy_pass_url: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub license: Option<String>,
    pub is_python: Option<bool>,
    pub num_stars: Option<u32>,
    pub auth_provider: Option<AuthProvider>,
    pub supported_transports: Option<Vec<TransportKind>>,
    pub headers: Option<Vec<HeaderSpec>>,
}

impl ServicePatch {
    pub fn apply(self, record: &mut ServiceRecord) {
        if let Some(v) = self.server_name {
            record.server_name = v;
        }
        if let Some(v) = self.proxy_pass_url {
            record.proxy_pass_url = v;
        }
        if let Some(v) = self.description {
            record.description = v;
        }
        if let Some(v) = self.tags {
            record.tags = v;
        }
        if let Some(v) = self.license {
            record.license = v;
        }
        if let Some(v) = self.is_python {
            record.is_python = v;
        }
        if let Some(v) = self.num_stars {
            record.num_stars = v;
        }
        if let Some(v) = self.auth_provider {
            record.auth_provider = v;
        }
        if let Some(v) = self.supported_transports {
            record.supported_transports = v;
        }
        if let Some(v) = self.headers {
            record.headers = v;
        }
    }
}

/// Validate and normalize a record in place. Returns field-level errors.
pub fn validate_and_normalize(record: &mut ServiceRecord) -> Result<(), CommonError> {
    if !record.path.starts_with('/') || record.path.len() < 2 {
        return Err(CommonError::validation_field(
            "path",
            "path must start with '/' and name at least one segment",
        ));
    }
    if record.path.contains(char::is_whitespace) {
        return Err(CommonError::validation_field(
            "path",
            "path must not contain whitespace",
        ));
    }
    if record.server_name.trim().is_empty() {
        return Err(CommonError::validation_field(
            "server_name",
            "server_name must not be empty",
        ));
    }

    let mut parsed = url::Url::parse(&record.proxy_pass_url).map_err(|e| {
        CommonError::validation_field("proxy_pass_url", format!("not an absolute URL: {e}"))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(CommonError::validation_field(
            "proxy_pass_url",
            "scheme must be http or https",
        ));
    }

    if record.auth_provider == AuthProvider::BedrockAgentcore {
        // Agentcore endpoints are addressed at their root; a copied `/mcp`
        // suffix would double up once the proxy appends the request path.
        let trimmed = parsed
            .path()
            .trim_end_matches('/')
            .trim_end_matches("/mcp")
            .to_string();
        parsed.set_path(&trimmed);
        if !record.path.ends_with('/') {
            record.path.push('/');
        }
    }

    if !parsed.path().ends_with('/') {
        parsed.set_path(&format!("{}/", parsed.path()));
    }
    record.proxy_pass_url = parsed.to_string();

    if record.supported_transports.is_empty() {
        return Err(CommonError::validation_field(
            "supported_transports",
            "at least one transport is required",
        ));
    }

    record.num_tools = record.tool_list.len() as u32;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, url: &str) -> ServiceRecord {
        ServiceRecord {
            path: path.to_string(),
            server_name: "Test".to_string(),
            proxy_pass_url: url.to_string(),
            description: String::new(),
            tags: vec![],
            license: String::new(),
            is_python: false,
            num_stars: 0,
            num_tools: 0,
            auth_provider: AuthProvider::None,
            supported_transports: default_transports(),
            headers: vec![],
            tool_list: vec![],
            enabled: true,
        }
    }

    #[test]
    fn normalization_appends_trailing_slash() {
        let mut r = record("/currenttime", "http://backend:8000/api");
        validate_and_normalize(&mut r).unwrap();
        assert_eq!(r.proxy_pass_url, "http://backend:8000/api/");
    }

    #[test]
    fn rejects_bad_paths() {
        for bad in ["currenttime", "/", "/a b"] {
            let mut r = record(bad, "http://backend:8000/");
            let err = validate_and_normalize(&mut r).unwrap_err();
            assert!(matches!(err, CommonError::Validation { .. }), "{bad}");
        }
    }

    #[test]
    fn rejects_non_http_schemes() {
        let mut r = record("/x", "ftp://backend/");
        assert!(validate_and_normalize(&mut r).is_err());
    }

    #[test]
    fn bedrock_agentcore_strips_mcp_suffix() {
        let mut r = record("/agentcore", "https://runtime.example.com/invocations/mcp/");
        r.auth_provider = AuthProvider::BedrockAgentcore;
        validate_and_normalize(&mut r).unwrap();
        assert_eq!(r.path, "/agentcore/");
        assert_eq!(
            r.proxy_pass_url,
            "https://runtime.example.com/invocations/"
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = serde_json::json!({
            "path": "/x",
            "server_name": "X",
            "proxy_pass_url": "http://x/",
            "bogus_key": 1
        });
        assert!(serde_json::from_value::<ServiceRecord>(raw).is_err());
    }

    #[test]
    fn auth_provider_accepts_generic_names() {
        let p: AuthProvider = serde_json::from_value(serde_json::json!("atlassian")).unwrap();
        assert_eq!(p, AuthProvider::Other("atlassian".to_string()));
        assert_eq!(
            serde_json::to_value(AuthProvider::BedrockAgentcore).unwrap(),
            serde_json::json!("bedrock-agentcore")
        );
    }
}
