//! IdP endpoint configuration. Built once at startup from the environment;
//! per-request discriminator headers may name a different pool or realm,
//! which is resolved against these shapes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CognitoConfig {
    pub region: String,
    pub user_pool_id: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Hosted-UI domain for the 3LO flow, e.g.
    /// `https://my-pool.auth.us-east-1.amazoncognito.com`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl CognitoConfig {
    pub fn issuer(&self) -> String {
        cognito_issuer(&self.region, &self.user_pool_id)
    }

    pub fn jwks_url(&self) -> String {
        format!("{}/.well-known/jwks.json", self.issuer())
    }

    pub fn authorize_endpoint(&self) -> Option<String> {
        self.domain.as_ref().map(|d| format!("{d}/oauth2/authorize"))
    }

    pub fn token_endpoint(&self) -> Option<String> {
        self.domain.as_ref().map(|d| format!("{d}/oauth2/token"))
    }
}

pub fn cognito_issuer(region: &str, user_pool_id: &str) -> String {
    format!("https://cognito-idp.{region}.amazonaws.com/{user_pool_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeycloakConfig {
    /// Base URL of the Keycloak deployment, no trailing slash.
    pub url: String,
    pub realm: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Separate confidential client used for realm administration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_client_secret: Option<String>,
}

impl KeycloakConfig {
    pub fn issuer(&self) -> String {
        keycloak_issuer(&self.url, &self.realm)
    }

    pub fn jwks_url(&self) -> String {
        format!("{}/protocol/openid-connect/certs", self.issuer())
    }

    pub fn authorize_endpoint(&self) -> String {
        format!("{}/protocol/openid-connect/auth", self.issuer())
    }

    pub fn token_endpoint(&self) -> String {
        format!("{}/protocol/openid-connect/token", self.issuer())
    }

    pub fn admin_base(&self) -> String {
        format!(
            "{}/admin/realms/{}",
            self.url.trim_end_matches('/'),
            self.realm
        )
    }
}

pub fn keycloak_issuer(url: &str, realm: &str) -> String {
    format!("{}/realms/{}", url.trim_end_matches('/'), realm)
}
