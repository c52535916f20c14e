//! The 3LO login flow: Authorization Code + PKCE against the configured IdP.
//!
//! State values are single-use and expire after ten minutes; a background
//! sweeper evicts entries abandoned mid-flow.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use oauth2::{AuthUrl, ClientId, CsrfToken, PkceCodeChallenge, RedirectUrl, Scope, TokenUrl};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use shared::error::{CommonError, reason};
use shared::identity::IdProvider;

pub const LOGIN_STATE_TTL: Duration = Duration::from_secs(600);

/// State stashed between `/login` and `/callback`.
#[derive(Debug, Clone)]
pub struct PendingLogin {
    pub code_verifier: String,
    pub redirect_back: String,
    pub provider: IdProvider,
    pub created_at: Instant,
}

#[derive(Default)]
pub struct PendingLoginMap {
    entries: DashMap<String, PendingLogin>,
}

impl PendingLoginMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, state: String, pending: PendingLogin) {
        self.entries.insert(state, pending);
    }

    /// One-time take: the state is consumed whether or not it is still
    /// fresh, so a replayed callback always fails.
    pub fn take(&self, state: &str) -> Option<PendingLogin> {
        let (_, pending) = self.entries.remove(state)?;
        if pending.created_at.elapsed() > LOGIN_STATE_TTL {
            return None;
        }
        Some(pending)
    }

    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, p| p.created_at.elapsed() <= LOGIN_STATE_TTL);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Periodic eviction of abandoned login attempts.
pub async fn run_login_sweeper(
    map: std::sync::Arc<PendingLoginMap>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) -> Result<(), CommonError> {
    let mut timer = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = timer.tick() => {
                let evicted = map.sweep();
                if evicted > 0 {
                    debug!(evicted, "swept expired login states");
                }
            }
            _ = shutdown_rx.recv() => return Ok(()),
        }
    }
}

/// Query parameters the IdP sends back to `/callback`.
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub code: Option<String>,
    pub state: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

pub struct AuthorizeUrlParams<'a> {
    pub authorization_endpoint: &'a str,
    pub token_endpoint: &'a str,
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub scopes: &'a [&'a str],
    pub pkce_challenge: &'a PkceCodeChallenge,
    pub csrf_state: &'a CsrfToken,
}

/// Build the IdP authorize URL for the redirect.
pub fn build_authorize_url(params: AuthorizeUrlParams<'_>) -> Result<String, CommonError> {
    let auth_url = AuthUrl::new(params.authorization_endpoint.to_string()).map_err(|e| {
        CommonError::validation(format!("invalid authorization endpoint: {e}"))
    })?;
    let token_url = TokenUrl::new(params.token_endpoint.to_string())
        .map_err(|e| CommonError::validation(format!("invalid token endpoint: {e}")))?;
    let redirect_url = RedirectUrl::new(params.redirect_uri.to_string())
        .map_err(|e| CommonError::validation(format!("invalid redirect URI: {e}")))?;

    let client = oauth2::basic::BasicClient::new(ClientId::new(params.client_id.to_string()))
        .set_auth_uri(auth_url)
        .set_token_uri(token_url)
        .set_redirect_uri(redirect_url);

    let csrf_for_closure = params.csrf_state.clone();
    let mut auth_request = client.authorize_url(move || csrf_for_closure.clone());
    for scope in params.scopes {
        auth_request = auth_request.add_scope(Scope::new(scope.to_string()));
    }
    auth_request = auth_request.set_pkce_challenge(params.pkce_challenge.clone());

    let (url, _) = auth_request.url();
    Ok(url.to_string())
}

/// Exchange the authorization code for tokens. Confidential clients use
/// basic auth, which both Cognito and Keycloak accept.
pub async fn exchange_code_for_tokens(
    http: &reqwest::Client,
    token_endpoint: &str,
    client_id: &str,
    client_secret: Option<&str>,
    redirect_uri: &str,
    code: &str,
    code_verifier: &str,
) -> Result<Map<String, Value>, CommonError> {
    let form_params = vec![
        ("grant_type", "authorization_code".to_string()),
        ("code", code.to_string()),
        ("redirect_uri", redirect_uri.to_string()),
        ("client_id", client_id.to_string()),
        ("code_verifier", code_verifier.to_string()),
    ];

    let mut request = http
        .post(token_endpoint)
        .timeout(Duration::from_secs(10))
        .form(&form_params);
    if let Some(secret) = client_secret {
        request = request.basic_auth(client_id, Some(secret));
    }

    let response = request.send().await.map_err(|e| CommonError::Upstream {
        msg: "token exchange request failed".to_string(),
        source: Some(e.into()),
    })?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(CommonError::unauthenticated(
            reason::INVALID_TOKEN,
            format!("token exchange failed: HTTP {status} - {body}"),
        ));
    }

    let token_response: Value = response.json().await.map_err(|e| CommonError::Upstream {
        msg: "token response did not parse".to_string(),
        source: Some(e.into()),
    })?;

    match token_response {
        Value::Object(obj) => Ok(obj),
        _ => Err(CommonError::upstream("token response is not a JSON object")),
    }
}
