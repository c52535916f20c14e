//! Startup configuration, read once from the environment. A missing or
//! malformed required key is a `Config` error and exit code 2.

use std::path::PathBuf;
use std::time::Duration;

use identity::logic::config::{CognitoConfig, KeycloakConfig};
use shared::error::CommonError;
use shared::identity::IdProvider;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbeddingsMode {
    /// External sentence-encoder endpoint.
    Http,
    /// Deterministic hash projection, for tests and air-gapped runs.
    Hash,
}

#[derive(Debug, Clone)]
pub struct EmbeddingsConfig {
    pub mode: EmbeddingsMode,
    pub url: Option<String>,
    pub model: String,
    pub dim: usize,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub secret_key: Vec<u8>,
    pub auth_provider: IdProvider,
    pub cognito: Option<CognitoConfig>,
    pub keycloak: Option<KeycloakConfig>,
    pub external_url: String,
    pub registry_dir: PathBuf,
    /// Replicated scope-policy targets, primary first.
    pub scopes_paths: Vec<PathBuf>,
    pub proxy_config_path: PathBuf,
    pub proxy_reload_cmd: Option<String>,
    pub embeddings: EmbeddingsConfig,
    pub health_interval: Duration,
    pub probe_timeout: Duration,
    pub session_ttl: Duration,
    pub m2m_secrets_dir: PathBuf,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, CommonError> {
        let secret_key = required("SECRET_KEY")?.into_bytes();
        if secret_key.len() < 32 {
            return Err(config_error("SECRET_KEY must be at least 32 bytes"));
        }

        let auth_provider = match required("AUTH_PROVIDER")?.as_str() {
            "cognito" => IdProvider::Cognito,
            "keycloak" => IdProvider::Keycloak,
            other => {
                return Err(config_error(format!(
                    "AUTH_PROVIDER must be 'cognito' or 'keycloak', got '{other}'"
                )));
            }
        };

        let cognito = optional("COGNITO_USER_POOL_ID").map(|user_pool_id| {
            Ok::<_, CommonError>(CognitoConfig {
                region: optional("COGNITO_REGION")
                    .or_else(|| user_pool_id.split('_').next().map(str::to_string))
                    .ok_or_else(|| config_error("COGNITO_REGION is required"))?,
                user_pool_id,
                client_id: required("COGNITO_CLIENT_ID")?,
                client_secret: optional("COGNITO_CLIENT_SECRET"),
                domain: optional("COGNITO_DOMAIN"),
            })
        });
        let cognito = cognito.transpose()?;

        let keycloak = optional("KEYCLOAK_URL").map(|url| {
            Ok::<_, CommonError>(KeycloakConfig {
                url,
                realm: required("KEYCLOAK_REALM")?,
                client_id: required("KEYCLOAK_CLIENT_ID")?,
                client_secret: optional("KEYCLOAK_CLIENT_SECRET"),
                admin_client_id: optional("KEYCLOAK_ADMIN_CLIENT_ID"),
                admin_client_secret: optional("KEYCLOAK_ADMIN_CLIENT_SECRET"),
            })
        });
        let keycloak = keycloak.transpose()?;

        match auth_provider {
            IdProvider::Cognito if cognito.is_none() => {
                return Err(config_error(
                    "AUTH_PROVIDER=cognito requires COGNITO_USER_POOL_ID and COGNITO_CLIENT_ID",
                ));
            }
            IdProvider::Keycloak if keycloak.is_none() => {
                return Err(config_error(
                    "AUTH_PROVIDER=keycloak requires KEYCLOAK_URL, KEYCLOAK_REALM and KEYCLOAK_CLIENT_ID",
                ));
            }
            _ => {}
        }

        let registry_dir = PathBuf::from(
            optional("REGISTRY_DIR").unwrap_or_else(|| "/opt/mcpgw/servers".to_string()),
        );
        let scopes_paths: Vec<PathBuf> = optional("SCOPES_PATHS")
            .unwrap_or_else(|| "/opt/mcpgw/auth/scopes.yml".to_string())
            .split(':')
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect();
        if scopes_paths.is_empty() {
            return Err(config_error("SCOPES_PATHS names no usable path"));
        }

        let embeddings_mode = match optional("EMBEDDINGS_MODE").as_deref() {
            None | Some("http") => EmbeddingsMode::Http,
            Some("hash") => EmbeddingsMode::Hash,
            Some(other) => {
                return Err(config_error(format!(
                    "EMBEDDINGS_MODE must be 'http' or 'hash', got '{other}'"
                )));
            }
        };
        let embeddings_url = optional("EMBEDDINGS_URL");
        if embeddings_mode == EmbeddingsMode::Http && embeddings_url.is_none() {
            return Err(config_error("EMBEDDINGS_URL is required unless EMBEDDINGS_MODE=hash"));
        }
        let embeddings = EmbeddingsConfig {
            mode: embeddings_mode,
            url: embeddings_url,
            model: optional("EMBEDDINGS_MODEL")
                .unwrap_or_else(|| "sentence-transformers/all-MiniLM-L6-v2".to_string()),
            dim: parse_number("EMBEDDINGS_DIM", 384)?,
        };

        Ok(Self {
            bind_addr: optional("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8888".to_string()),
            secret_key,
            auth_provider,
            cognito,
            keycloak,
            external_url: optional("AUTH_SERVER_EXTERNAL_URL")
                .unwrap_or_else(|| "http://localhost:8888".to_string()),
            registry_dir,
            scopes_paths,
            proxy_config_path: PathBuf::from(
                optional("PROXY_CONFIG_PATH")
                    .unwrap_or_else(|| "/opt/mcpgw/nginx/mcpgw.locations.conf".to_string()),
            ),
            proxy_reload_cmd: optional("PROXY_RELOAD_CMD"),
            embeddings,
            health_interval: parse_duration("HEALTH_CHECK_INTERVAL", "30s")?,
            probe_timeout: parse_duration("HEALTH_CHECK_TIMEOUT", "10s")?,
            session_ttl: parse_duration("SESSION_TTL", "30m")?,
            m2m_secrets_dir: PathBuf::from(
                optional("M2M_SECRETS_DIR").unwrap_or_else(|| "/opt/mcpgw/secrets".to_string()),
            ),
        })
    }
}

fn required(key: &str) -> Result<String, CommonError> {
    optional(key).ok_or_else(|| config_error(format!("{key} is required")))
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_duration(key: &str, default: &str) -> Result<Duration, CommonError> {
    let raw = optional(key).unwrap_or_else(|| default.to_string());
    humantime::parse_duration(&raw)
        .map_err(|e| config_error(format!("{key} is not a duration: {e}")))
}

fn parse_number(key: &str, default: usize) -> Result<usize, CommonError> {
    match optional(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| config_error(format!("{key} is not a number: {e}"))),
    }
}

fn config_error(msg: impl Into<String>) -> CommonError {
    CommonError::Config {
        msg: msg.into(),
        source: None,
    }
}
