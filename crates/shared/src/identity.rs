use http::HeaderMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::CommonError;

/// Kind of principal resolved from a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ToSchema, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum PrincipalType {
    User,
    ServiceAccount,
}

impl PrincipalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalType::User => "user",
            PrincipalType::ServiceAccount => "service-account",
        }
    }
}

/// Which credential channel the principal came in on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ToSchema, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialSource {
    Session,
    IngressHeader,
    AuthorizationBearer,
}

impl CredentialSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialSource::Session => "session",
            CredentialSource::IngressHeader => "ingress-header",
            CredentialSource::AuthorizationBearer => "authorization-bearer",
        }
    }

    /// Auth kind used for the `Default-Scopes` fallback lookup.
    pub fn auth_kind(&self) -> &'static str {
        match self {
            CredentialSource::Session => "session",
            CredentialSource::IngressHeader | CredentialSource::AuthorizationBearer => "ingress",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ToSchema, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IdProvider {
    Cognito,
    Keycloak,
}

impl IdProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdProvider::Cognito => "cognito",
            IdProvider::Keycloak => "keycloak",
        }
    }

    pub fn parse(s: &str) -> Option<IdProvider> {
        match s {
            "cognito" => Some(IdProvider::Cognito),
            "keycloak" => Some(IdProvider::Keycloak),
            _ => None,
        }
    }
}

/// Identity resolved at authorization time. Everything downstream of
/// credential verification (scope matching, identity header injection,
/// token vending) consumes this and never the raw token.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, JsonSchema)]
pub struct Principal {
    pub sub: String,
    pub principal_type: PrincipalType,
    pub groups: Vec<String>,
    pub source: CredentialSource,
    pub idp: IdProvider,
}

impl Principal {
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

/// Something that answers "who is making this request" from an incoming
/// header set. The gateway front depends on this seam rather than on the
/// concrete validator stack so tests can substitute a fixed principal.
#[allow(async_fn_in_trait)]
pub trait RequestAuthenticatorLike {
    /// Resolve a principal from the request headers, or an authentication
    /// error when no usable credential is present.
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, CommonError>;
}

impl<T: RequestAuthenticatorLike + Send + Sync> RequestAuthenticatorLike for std::sync::Arc<T> {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, CommonError> {
        (**self).authenticate(headers).await
    }
}
