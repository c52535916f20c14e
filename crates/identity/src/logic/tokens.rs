//! Token vending: short-lived self-issued tokens carrying a subset of the
//! logged-in user's scopes, for handing to agents that cannot run a browser
//! flow.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use shared::error::{CommonError, reason};
use shared::identity::{CredentialSource, IdProvider, Principal, PrincipalType};

use crate::logic::session::{TOKEN_USE_VENDED, TokenSigner};

pub const MIN_EXPIRES_IN_HOURS: u32 = 1;
pub const MAX_EXPIRES_IN_HOURS: u32 = 24;

fn default_expires_in_hours() -> u32 {
    8
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct GenerateTokenRequest {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_expires_in_hours")]
    pub expires_in_hours: u32,
    /// Subset of the caller's current scopes; absent means all of them.
    #[serde(default)]
    pub requested_scopes: Option<Vec<String>>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct GeneratedToken {
    pub access_token: String,
    pub expires_in: u64,
    pub scopes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VendedClaims {
    pub sub: String,
    pub scopes: Vec<String>,
    pub idp: String,
    pub token_use: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

/// Mint a vended token for the session principal. Scopes not currently held
/// are refused, never silently dropped.
pub fn vend_token(
    signer: &TokenSigner,
    principal: &Principal,
    request: GenerateTokenRequest,
) -> Result<GeneratedToken, CommonError> {
    if !(MIN_EXPIRES_IN_HOURS..=MAX_EXPIRES_IN_HOURS).contains(&request.expires_in_hours) {
        return Err(CommonError::validation_field(
            "expires_in_hours",
            format!("must be between {MIN_EXPIRES_IN_HOURS} and {MAX_EXPIRES_IN_HOURS}"),
        ));
    }

    let scopes = match request.requested_scopes {
        None => principal.groups.clone(),
        Some(requested) => {
            for scope in &requested {
                if !principal.in_group(scope) {
                    return Err(CommonError::unauthorized(
                        reason::SCOPE_NOT_HELD,
                        format!("scope '{scope}' is not held by the current session"),
                    ));
                }
            }
            requested
        }
    };

    let now = Utc::now();
    let expires_in = u64::from(request.expires_in_hours) * 3600;
    let claims = VendedClaims {
        sub: principal.sub.clone(),
        scopes: scopes.clone(),
        idp: principal.idp.as_str().to_string(),
        token_use: TOKEN_USE_VENDED.to_string(),
        description: request.description,
        iat: now.timestamp(),
        exp: now.timestamp() + expires_in as i64,
    };

    Ok(GeneratedToken {
        access_token: signer.sign(&claims)?,
        expires_in,
        scopes,
    })
}

/// Verify a vended token arriving on the ingress header channel.
pub fn verify_vended(signer: &TokenSigner, token: &str) -> Result<Principal, CommonError> {
    let claims: VendedClaims = signer.verify(token, reason::TOKEN_EXPIRED)?;
    if claims.token_use != TOKEN_USE_VENDED {
        return Err(CommonError::unauthenticated(
            reason::INVALID_TOKEN,
            "not a vended credential",
        ));
    }
    Ok(Principal {
        sub: claims.sub,
        principal_type: PrincipalType::User,
        groups: claims.scopes,
        source: CredentialSource::IngressHeader,
        idp: IdProvider::parse(&claims.idp).unwrap_or(IdProvider::Keycloak),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::test_utils::test_session_user;

    fn signer() -> TokenSigner {
        TokenSigner::new(
            b"0123456789abcdef0123456789abcdef",
            std::time::Duration::from_secs(1800),
        )
        .unwrap()
    }

    #[test]
    fn vended_token_defaults_to_all_scopes() {
        let signer = signer();
        let principal = test_session_user("alice", &["g/read", "g/execute"]);

        let request: GenerateTokenRequest = serde_json::from_value(serde_json::json!({
            "description": "ci agent"
        }))
        .unwrap();
        let token = vend_token(&signer, &principal, request).unwrap();
        assert_eq!(token.scopes, principal.groups);
        assert_eq!(token.expires_in, 8 * 3600);

        let restored = verify_vended(&signer, &token.access_token).unwrap();
        assert_eq!(restored.sub, "alice");
        assert_eq!(restored.groups, principal.groups);
        assert_eq!(
            restored.source,
            shared::identity::CredentialSource::IngressHeader
        );
    }

    #[test]
    fn requested_scope_must_be_held() {
        let signer = signer();
        let principal = test_session_user("alice", &["g/read"]);

        let request: GenerateTokenRequest = serde_json::from_value(serde_json::json!({
            "requested_scopes": ["g/read", "g/execute"]
        }))
        .unwrap();
        let err = vend_token(&signer, &principal, request).unwrap_err();
        assert_eq!(err.code(), reason::SCOPE_NOT_HELD);
    }

    #[test]
    fn expiry_bounds_are_enforced() {
        let signer = signer();
        let principal = test_session_user("alice", &["g/read"]);

        for bad_hours in [0u32, 25] {
            let request: GenerateTokenRequest = serde_json::from_value(serde_json::json!({
                "expires_in_hours": bad_hours
            }))
            .unwrap();
            let err = vend_token(&signer, &principal, request).unwrap_err();
            assert!(matches!(err, CommonError::Validation { .. }));
        }
    }

    #[test]
    fn session_cookie_is_not_a_vended_token() {
        let signer = signer();
        let principal = test_session_user("alice", &["g/read"]);
        let cookie = signer.mint_session(&principal).unwrap();
        assert!(verify_vended(&signer, &cookie).is_err());
    }
}
