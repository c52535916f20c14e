//! The auth plane: one object answering "who is this" and "may they do
//! this", plus the login flow that creates browser sessions.

use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use oauth2::{CsrfToken, PkceCodeChallenge};
use tracing::info;

use registry::RegistryService;
use scopes::ScopePolicyStore;
use scopes::logic::UiCapability;
use shared::error::{CommonError, reason};
use shared::identity::{
    CredentialSource, IdProvider, Principal, PrincipalType, RequestAuthenticatorLike,
};

use crate::logic::authorize::{ValidateDecision, authorize_request, require_ui_capability};
use crate::logic::config::{CognitoConfig, KeycloakConfig, cognito_issuer, keycloak_issuer};
use crate::logic::jwks::JwksRegistry;
use crate::logic::login::{
    AuthorizeUrlParams, CallbackParams, PendingLogin, PendingLoginMap, build_authorize_url,
    exchange_code_for_tokens,
};
use crate::logic::session::{SESSION_COOKIE_NAME, TokenSigner};
use crate::logic::tokens::{GenerateTokenRequest, GeneratedToken, vend_token, verify_vended};
use crate::logic::validators::{CognitoValidator, KeycloakValidator, VerifiedToken};

// Ingress credential headers for programmatic callers.
pub const HEADER_X_AUTHORIZATION: &str = "x-authorization";
pub const HEADER_X_USER_POOL_ID: &str = "x-user-pool-id";
pub const HEADER_X_CLIENT_ID: &str = "x-client-id";
pub const HEADER_X_REGION: &str = "x-region";
pub const HEADER_X_KEYCLOAK_URL: &str = "x-keycloak-url";
pub const HEADER_X_KEYCLOAK_REALM: &str = "x-keycloak-realm";

#[derive(Clone)]
pub struct AuthServiceConfig {
    /// Provider used for the 3LO login flow.
    pub provider: IdProvider,
    pub cognito: Option<CognitoConfig>,
    pub keycloak: Option<KeycloakConfig>,
    /// Externally reachable base URL, for the OAuth redirect URI.
    pub external_url: String,
    pub session_ttl: Duration,
}

pub struct AuthService {
    config: AuthServiceConfig,
    signer: TokenSigner,
    jwks: JwksRegistry,
    pending: Arc<PendingLoginMap>,
    scope_store: Arc<ScopePolicyStore>,
    registry: Arc<RegistryService>,
    http: reqwest::Client,
}

impl AuthService {
    pub fn new(
        config: AuthServiceConfig,
        secret_key: &[u8],
        scope_store: Arc<ScopePolicyStore>,
        registry: Arc<RegistryService>,
    ) -> Result<Self, CommonError> {
        match config.provider {
            IdProvider::Cognito if config.cognito.is_none() => {
                return Err(CommonError::Config {
                    msg: "AUTH_PROVIDER=cognito but no Cognito configuration given".to_string(),
                    source: None,
                });
            }
            IdProvider::Keycloak if config.keycloak.is_none() => {
                return Err(CommonError::Config {
                    msg: "AUTH_PROVIDER=keycloak but no Keycloak configuration given".to_string(),
                    source: None,
                });
            }
            _ => {}
        }

        let signer = TokenSigner::new(secret_key, config.session_ttl)?;
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            jwks: JwksRegistry::new(http.clone()),
            pending: Arc::new(PendingLoginMap::new()),
            config,
            signer,
            scope_store,
            registry,
            http,
        })
    }

    pub fn pending_logins(&self) -> Arc<PendingLoginMap> {
        self.pending.clone()
    }

    pub fn scope_store(&self) -> &Arc<ScopePolicyStore> {
        &self.scope_store
    }

    pub fn registry(&self) -> &Arc<RegistryService> {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Credential resolution
    // ------------------------------------------------------------------

    /// Resolve a principal from the request headers, in the documented
    /// order: session cookie, then the `X-Authorization` ingress channel.
    /// A bare `Authorization` bearer is the egress token for the backend
    /// and never authenticates the caller.
    pub async fn resolve_principal(&self, headers: &HeaderMap) -> Result<Principal, CommonError> {
        if let Some(cookie) = session_cookie(headers) {
            return self.signer.verify_session(&cookie);
        }

        if let Some(token) = bearer(headers, HEADER_X_AUTHORIZATION) {
            if TokenSigner::looks_self_issued(&token) {
                return verify_vended(&self.signer, &token);
            }
            return self.verify_ingress_jwt(&token, headers).await;
        }

        Err(CommonError::unauthenticated(
            reason::NO_CREDENTIALS,
            "no session cookie or X-Authorization header present",
        ))
    }

    /// Verify an IdP JWT from the ingress header, selecting the IdP from
    /// the discriminator headers. When both sets are present, Keycloak wins
    /// only if the named URL matches the configured realm.
    async fn verify_ingress_jwt(
        &self,
        token: &str,
        headers: &HeaderMap,
    ) -> Result<Principal, CommonError> {
        let keycloak_url = header_str(headers, HEADER_X_KEYCLOAK_URL);
        let pool_id = header_str(headers, HEADER_X_USER_POOL_ID);

        let use_keycloak = match (&keycloak_url, &pool_id) {
            (Some(url), Some(_)) => self
                .config
                .keycloak
                .as_ref()
                .is_some_and(|kc| kc.url.trim_end_matches('/') == url.trim_end_matches('/')),
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => self.config.provider == IdProvider::Keycloak,
        };

        if use_keycloak {
            let configured = self.config.keycloak.as_ref();
            let url = keycloak_url
                .or_else(|| configured.map(|c| c.url.clone()))
                .ok_or_else(|| no_idp_config("Keycloak"))?;
            let realm = header_str(headers, HEADER_X_KEYCLOAK_REALM)
                .or_else(|| configured.map(|c| c.realm.clone()))
                .ok_or_else(|| no_idp_config("Keycloak"))?;
            let client_id = header_str(headers, HEADER_X_CLIENT_ID)
                .or_else(|| configured.map(|c| c.client_id.clone()))
                .ok_or_else(|| no_idp_config("Keycloak"))?;

            let issuer = keycloak_issuer(&url, &realm);
            let jwks = self
                .jwks
                .for_url(&format!("{issuer}/protocol/openid-connect/certs"));
            let verified = KeycloakValidator::new(issuer, client_id, jwks)
                .verify(token)
                .await?;
            return Ok(ingress_principal(verified, IdProvider::Keycloak));
        }

        let configured = self.config.cognito.as_ref();
        let pool = pool_id
            .or_else(|| configured.map(|c| c.user_pool_id.clone()))
            .ok_or_else(|| no_idp_config("Cognito"))?;
        let region = header_str(headers, HEADER_X_REGION)
            .or_else(|| configured.map(|c| c.region.clone()))
            .or_else(|| pool.split('_').next().map(str::to_string))
            .ok_or_else(|| no_idp_config("Cognito"))?;
        let client_id = header_str(headers, HEADER_X_CLIENT_ID)
            .or_else(|| configured.map(|c| c.client_id.clone()))
            .ok_or_else(|| no_idp_config("Cognito"))?;

        let issuer = cognito_issuer(&region, &pool);
        let jwks = self.jwks.for_url(&format!("{issuer}/.well-known/jwks.json"));
        let verified = CognitoValidator::new(issuer, client_id, jwks)
            .verify(token)
            .await?;
        Ok(ingress_principal(verified, IdProvider::Cognito))
    }

    // ------------------------------------------------------------------
    // /validate
    // ------------------------------------------------------------------

    /// The auth-subrequest decision: authenticate, then authorize against
    /// the current policy and routing-table snapshots.
    pub async fn validate(
        &self,
        headers: &HeaderMap,
        original_uri: &str,
        body: &[u8],
    ) -> Result<ValidateDecision, CommonError> {
        let principal = self.resolve_principal(headers).await?;
        let policy = self.scope_store.snapshot();
        let records = self.registry.list_services().await;
        authorize_request(&policy, &records, &principal, original_uri, body)
    }

    /// Gate an admin operation on a UI capability.
    pub fn require_ui(
        &self,
        principal: &Principal,
        capability: UiCapability,
        target: Option<&str>,
    ) -> Result<(), CommonError> {
        let policy = self.scope_store.snapshot();
        require_ui_capability(&policy, principal, capability, target)
    }

    // ------------------------------------------------------------------
    // 3LO login
    // ------------------------------------------------------------------

    /// Start the Authorization Code + PKCE flow; returns the IdP URL to
    /// redirect the browser to.
    pub fn start_login(
        &self,
        provider: Option<IdProvider>,
        redirect_back: Option<String>,
    ) -> Result<String, CommonError> {
        let provider = provider.unwrap_or(self.config.provider);
        let (authorization_endpoint, token_endpoint, client_id) = self.login_endpoints(provider)?;

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let csrf_state = CsrfToken::new_random();
        let redirect_uri = self.callback_uri();

        let authorize_url = build_authorize_url(AuthorizeUrlParams {
            authorization_endpoint: &authorization_endpoint,
            token_endpoint: &token_endpoint,
            client_id: &client_id,
            redirect_uri: &redirect_uri,
            scopes: &["openid", "email", "profile"],
            pkce_challenge: &pkce_challenge,
            csrf_state: &csrf_state,
        })?;

        self.pending.insert(
            csrf_state.secret().to_string(),
            PendingLogin {
                code_verifier: pkce_verifier.secret().to_string(),
                redirect_back: redirect_back.unwrap_or_else(|| "/".to_string()),
                provider,
                created_at: std::time::Instant::now(),
            },
        );

        Ok(authorize_url)
    }

    /// Complete the flow: state check, code exchange, ID-token verification,
    /// session mint. Returns the cookie value and where to send the browser.
    pub async fn handle_callback(
        &self,
        params: CallbackParams,
    ) -> Result<(String, String), CommonError> {
        if let Some(error) = &params.error {
            return Err(CommonError::unauthenticated(
                reason::INVALID_TOKEN,
                format!(
                    "IdP returned an error: {error} - {}",
                    params.error_description.as_deref().unwrap_or("no description")
                ),
            ));
        }

        let pending = self.pending.take(&params.state).ok_or_else(|| {
            CommonError::unauthenticated(reason::INVALID_TOKEN, "unknown or expired login state")
        })?;
        let code = params.code.as_deref().ok_or_else(|| {
            CommonError::unauthenticated(reason::INVALID_TOKEN, "callback carried no code")
        })?;

        let (_, token_endpoint, client_id) = self.login_endpoints(pending.provider)?;
        let client_secret = match pending.provider {
            IdProvider::Cognito => self
                .config
                .cognito
                .as_ref()
                .and_then(|c| c.client_secret.clone()),
            IdProvider::Keycloak => self
                .config
                .keycloak
                .as_ref()
                .and_then(|c| c.client_secret.clone()),
        };

        let tokens = exchange_code_for_tokens(
            &self.http,
            &token_endpoint,
            &client_id,
            client_secret.as_deref(),
            &self.callback_uri(),
            code,
            &pending.code_verifier,
        )
        .await?;

        let id_token = tokens
            .get("id_token")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                CommonError::unauthenticated(reason::INVALID_TOKEN, "IdP returned no id_token")
            })?;

        let verified = self.verify_id_token(pending.provider, id_token).await?;
        let principal = Principal {
            sub: verified.sub,
            principal_type: PrincipalType::User,
            groups: verified.groups,
            source: CredentialSource::Session,
            idp: pending.provider,
        };

        let cookie = self.issue_session(&principal)?;
        info!(sub = %principal.sub, idp = %principal.idp.as_str(), "login completed");
        Ok((cookie, pending.redirect_back))
    }

    /// Mint a session cookie for an already-verified principal.
    pub fn issue_session(&self, principal: &Principal) -> Result<String, CommonError> {
        self.signer.mint_session(principal)
    }

    async fn verify_id_token(
        &self,
        provider: IdProvider,
        id_token: &str,
    ) -> Result<VerifiedToken, CommonError> {
        match provider {
            IdProvider::Cognito => {
                let cfg = self.config.cognito.as_ref().ok_or_else(|| no_idp_config("Cognito"))?;
                let jwks = self.jwks.for_url(&cfg.jwks_url());
                CognitoValidator::new(cfg.issuer(), cfg.client_id.clone(), jwks)
                    .verify(id_token)
                    .await
            }
            IdProvider::Keycloak => {
                let cfg = self
                    .config
                    .keycloak
                    .as_ref()
                    .ok_or_else(|| no_idp_config("Keycloak"))?;
                let jwks = self.jwks.for_url(&cfg.jwks_url());
                KeycloakValidator::new(cfg.issuer(), cfg.client_id.clone(), jwks)
                    .verify(id_token)
                    .await
            }
        }
    }

    fn login_endpoints(
        &self,
        provider: IdProvider,
    ) -> Result<(String, String, String), CommonError> {
        match provider {
            IdProvider::Cognito => {
                let cfg = self.config.cognito.as_ref().ok_or_else(|| no_idp_config("Cognito"))?;
                match (cfg.authorize_endpoint(), cfg.token_endpoint()) {
                    (Some(authorize), Some(token)) => Ok((authorize, token, cfg.client_id.clone())),
                    _ => Err(CommonError::validation(
                        "COGNITO_DOMAIN is required for browser login against Cognito",
                    )),
                }
            }
            IdProvider::Keycloak => {
                let cfg = self
                    .config
                    .keycloak
                    .as_ref()
                    .ok_or_else(|| no_idp_config("Keycloak"))?;
                Ok((
                    cfg.authorize_endpoint(),
                    cfg.token_endpoint(),
                    cfg.client_id.clone(),
                ))
            }
        }
    }

    fn callback_uri(&self) -> String {
        format!("{}/callback", self.config.external_url.trim_end_matches('/'))
    }

    // ------------------------------------------------------------------
    // Token vending
    // ------------------------------------------------------------------

    /// Vend a token for a live browser session. Header-authenticated callers
    /// are refused; they already hold a programmatic credential.
    pub async fn generate_token(
        &self,
        headers: &HeaderMap,
        request: GenerateTokenRequest,
    ) -> Result<GeneratedToken, CommonError> {
        let principal = self.resolve_principal(headers).await?;
        if principal.source != CredentialSource::Session {
            return Err(CommonError::unauthenticated(
                reason::NO_CREDENTIALS,
                "token vending requires a live browser session",
            ));
        }
        vend_token(&self.signer, &principal, request)
    }
}

impl RequestAuthenticatorLike for AuthService {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, CommonError> {
        self.resolve_principal(headers).await
    }
}

fn ingress_principal(verified: VerifiedToken, idp: IdProvider) -> Principal {
    Principal {
        sub: verified.sub,
        principal_type: verified.principal_type,
        groups: verified.groups,
        source: CredentialSource::IngressHeader,
        idp,
    }
}

fn no_idp_config(which: &str) -> CommonError {
    CommonError::unauthenticated(
        reason::INVALID_TOKEN,
        format!("{which} is not configured on this gateway and no discriminator headers supplied it"),
    )
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn bearer(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = header_str(headers, name)?;
    raw.strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .map(|t| t.trim().to_string())
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all(http::header::COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for pair in raw.split(';') {
            let pair = pair.trim();
            if let Some(v) = pair.strip_prefix(&format!("{SESSION_COOKIE_NAME}=")) {
                return Some(v.to_string());
            }
        }
    }
    None
}
