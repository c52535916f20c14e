//! Server-issued credentials signed with the process-wide `SECRET_KEY`:
//! browser session cookies and vended access tokens. Both are HS256 JWTs,
//! independent of any IdP-issued token.

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use shared::error::{CommonError, reason};
use shared::identity::{CredentialSource, IdProvider, Principal, PrincipalType};

pub const SESSION_COOKIE_NAME: &str = "mcpgw_session";
pub const TOKEN_USE_SESSION: &str = "session";
pub const TOKEN_USE_VENDED: &str = "vended";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub groups: Vec<String>,
    pub idp: String,
    pub token_use: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    session_ttl: Duration,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("session_ttl", &self.session_ttl)
            .finish()
    }
}

impl TokenSigner {
    pub fn new(secret_key: &[u8], session_ttl: std::time::Duration) -> Result<Self, CommonError> {
        if secret_key.len() < 32 {
            return Err(CommonError::Config {
                msg: "SECRET_KEY must be at least 32 bytes".to_string(),
                source: None,
            });
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret_key),
            decoding: DecodingKey::from_secret(secret_key),
            session_ttl: Duration::from_std(session_ttl).unwrap_or_else(|_| Duration::minutes(30)),
        })
    }

    pub fn mint_session(&self, principal: &Principal) -> Result<String, CommonError> {
        let now = Utc::now();
        let claims = SessionClaims {
            sub: principal.sub.clone(),
            groups: principal.groups.clone(),
            idp: principal.idp.as_str().to_string(),
            token_use: TOKEN_USE_SESSION.to_string(),
            iat: now.timestamp(),
            exp: (now + self.session_ttl).timestamp(),
        };
        self.sign(&claims)
    }

    /// Verify a session cookie and reconstruct its principal.
    pub fn verify_session(&self, token: &str) -> Result<Principal, CommonError> {
        let claims: SessionClaims = self.verify(token, reason::SESSION_EXPIRED)?;
        if claims.token_use != TOKEN_USE_SESSION {
            return Err(CommonError::unauthenticated(
                reason::INVALID_TOKEN,
                "not a session credential",
            ));
        }
        Ok(Principal {
            sub: claims.sub,
            principal_type: PrincipalType::User,
            groups: claims.groups,
            source: CredentialSource::Session,
            idp: IdProvider::parse(&claims.idp).unwrap_or(IdProvider::Keycloak),
        })
    }

    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String, CommonError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding).map_err(|e| {
            CommonError::Unknown(anyhow::anyhow!("failed to sign token: {e}"))
        })
    }

    pub fn verify<T: serde::de::DeserializeOwned>(
        &self,
        token: &str,
        expired_reason: &str,
    ) -> Result<T, CommonError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        decode::<T>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    CommonError::unauthenticated(expired_reason, "credential has expired")
                }
                _ => CommonError::unauthenticated(
                    reason::INVALID_TOKEN,
                    format!("credential rejected: {e}"),
                ),
            })
    }

    /// Is this compact JWT one of ours (HS256)? Lets the credential resolver
    /// route self-issued tokens away from the IdP validators without a
    /// signature check.
    pub fn looks_self_issued(token: &str) -> bool {
        jsonwebtoken::decode_header(token)
            .map(|h| h.alg == Algorithm::HS256)
            .unwrap_or(false)
    }
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
    fn short_secret_is_a_config_error() {
        let err = TokenSigner::new(b"short", std::time::Duration::from_secs(60)).unwrap_err();
        assert!(matches!(err, CommonError::Config { .. }));
    }

    #[test]
    fn session_roundtrip_preserves_principal() {
        let signer = signer();
        let principal = test_session_user("alice", &["mcp-servers-finance/read"]);

        let cookie = signer.mint_session(&principal).unwrap();
        assert!(TokenSigner::looks_self_issued(&cookie));

        let restored = signer.verify_session(&cookie).unwrap();
        assert_eq!(restored.sub, "alice");
        assert_eq!(restored.groups, principal.groups);
        assert_eq!(restored.source, shared::identity::CredentialSource::Session);
    }

    #[test]
    fn expired_session_reports_session_expired() {
        let signer = signer();
        let claims = SessionClaims {
            sub: "alice".to_string(),
            groups: vec![],
            idp: "keycloak".to_string(),
            token_use: TOKEN_USE_SESSION.to_string(),
            iat: Utc::now().timestamp() - 7200,
            exp: Utc::now().timestamp() - 3600,
        };
        let stale = signer.sign(&claims).unwrap();

        let err = signer.verify_session(&stale).unwrap_err();
        assert_eq!(err.code(), reason::SESSION_EXPIRED);
    }

    #[test]
    fn tampered_cookie_is_rejected() {
        let signer = signer();
        let principal = test_session_user("alice", &[]);
        let mut cookie = signer.mint_session(&principal).unwrap();
        cookie.push('x');
        assert!(signer.verify_session(&cookie).is_err());
    }

    #[test]
    fn foreign_rs256_tokens_are_not_self_issued() {
        // Header advertises RS256, so the resolver must route it to an IdP.
        let header = "eyJhbGciOiJSUzI1NiIsImtpZCI6ImsxIn0";
        let fake = format!("{header}.e30.sig");
        assert!(!TokenSigner::looks_self_issued(&fake));
    }
}
