//! IdP token verification: Cognito and Keycloak RS256 access/id tokens
//! against their published JWKS.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde_json::Value;

use shared::error::{CommonError, reason};
use shared::identity::PrincipalType;

use crate::logic::jwks::RemoteJwks;

/// Outcome of verifying a raw token, independent of which IdP issued it.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub sub: String,
    pub groups: Vec<String>,
    pub principal_type: PrincipalType,
    pub expires_at: DateTime<Utc>,
}

pub struct CognitoValidator {
    issuer: String,
    client_id: String,
    jwks: Arc<RemoteJwks>,
}

impl CognitoValidator {
    pub fn new(issuer: String, client_id: String, jwks: Arc<RemoteJwks>) -> Self {
        Self {
            issuer,
            client_id,
            jwks,
        }
    }

    pub async fn verify(&self, token: &str) -> Result<VerifiedToken, CommonError> {
        let claims = verify_rs256(token, &self.jwks, &self.issuer).await?;

        let token_use = claims.get("token_use").and_then(Value::as_str);
        if !matches!(token_use, Some("access") | Some("id")) {
            return Err(CommonError::unauthenticated(
                reason::INVALID_TOKEN,
                "token_use must be access or id",
            ));
        }

        // Access tokens carry client_id; id tokens carry aud.
        let client_matches = claims
            .get("client_id")
            .and_then(Value::as_str)
            .map(|c| c == self.client_id)
            .or_else(|| Some(audience_contains(&claims, &self.client_id)))
            .unwrap_or(false);
        if !client_matches {
            return Err(CommonError::unauthenticated(
                reason::INVALID_TOKEN,
                "token was issued for a different app client",
            ));
        }

        let sub = required_sub(&claims)?;
        let groups = string_array(&claims, "cognito:groups");

        // Client-credentials tokens have no user behind them: their subject
        // is the app client itself.
        let principal_type = if sub == self.client_id && groups.is_empty() {
            PrincipalType::ServiceAccount
        } else {
            PrincipalType::User
        };

        Ok(VerifiedToken {
            sub,
            groups,
            principal_type,
            expires_at: expiry(&claims),
        })
    }
}

pub struct KeycloakValidator {
    issuer: String,
    client_id: String,
    jwks: Arc<RemoteJwks>,
}

impl KeycloakValidator {
    pub fn new(issuer: String, client_id: String, jwks: Arc<RemoteJwks>) -> Self {
        Self {
            issuer,
            client_id,
            jwks,
        }
    }

    pub async fn verify(&self, token: &str) -> Result<VerifiedToken, CommonError> {
        let claims = verify_rs256(token, &self.jwks, &self.issuer).await?;

        // Keycloak access tokens may omit aud entirely; when present it has
        // to name us (or the built-in account client).
        if claims.get("aud").is_some()
            && !audience_contains(&claims, &self.client_id)
            && !audience_contains(&claims, "account")
        {
            return Err(CommonError::unauthenticated(
                reason::INVALID_TOKEN,
                "token audience does not include this client",
            ));
        }

        let sub = required_sub(&claims)?;
        // The realm's group mapper is configured with full-path=false, but a
        // leading slash from a differently configured mapper is tolerated.
        let groups = string_array(&claims, "groups")
            .into_iter()
            .map(|g| g.trim_start_matches('/').to_string())
            .collect();

        let principal_type = if claims
            .get("preferred_username")
            .and_then(Value::as_str)
            .is_some_and(|u| u.starts_with("service-account-"))
        {
            PrincipalType::ServiceAccount
        } else {
            PrincipalType::User
        };

        Ok(VerifiedToken {
            sub,
            groups,
            principal_type,
            expires_at: expiry(&claims),
        })
    }
}

/// RS256 signature + issuer + expiry verification. A signature or key-id
/// miss forces one JWKS refresh before giving up, covering IdP key rotation
/// between cache refreshes.
async fn verify_rs256(
    token: &str,
    jwks: &RemoteJwks,
    issuer: &str,
) -> Result<Value, CommonError> {
    let header = decode_header(token).map_err(|e| {
        CommonError::unauthenticated(reason::INVALID_TOKEN, format!("malformed token: {e}"))
    })?;
    if header.alg != Algorithm::RS256 {
        return Err(CommonError::unauthenticated(
            reason::INVALID_TOKEN,
            "only RS256 tokens are accepted from IdPs",
        ));
    }
    let kid = header.kid.ok_or_else(|| {
        CommonError::unauthenticated(reason::INVALID_TOKEN, "token header has no key id")
    })?;

    let key = jwks.decoding_key(&kid, false).await.map_err(as_auth_error)?;
    match decode_claims(token, &key, issuer) {
        Ok(claims) => Ok(claims),
        Err(e) if matches!(e.kind(), jsonwebtoken::errors::ErrorKind::InvalidSignature) => {
            let key = jwks.decoding_key(&kid, true).await.map_err(as_auth_error)?;
            decode_claims(token, &key, issuer).map_err(map_jwt_error)
        }
        Err(e) => Err(map_jwt_error(e)),
    }
}

fn decode_claims(
    token: &str,
    key: &DecodingKey,
    issuer: &str,
) -> Result<Value, jsonwebtoken::errors::Error> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_issuer(&[issuer]);
    validation.validate_aud = false;
    validation.leeway = 0;
    Ok(decode::<Value>(token, key, &validation)?.claims)
}

fn map_jwt_error(e: jsonwebtoken::errors::Error) -> CommonError {
    match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
            CommonError::unauthenticated(reason::TOKEN_EXPIRED, "token has expired")
        }
        _ => CommonError::unauthenticated(reason::INVALID_TOKEN, format!("token rejected: {e}")),
    }
}

/// Upstream failures reaching the key set still mean "we cannot trust this
/// token" on the request path.
fn as_auth_error(e: CommonError) -> CommonError {
    match e {
        CommonError::Authentication { .. } => e,
        other => CommonError::Authentication {
            reason: reason::INVALID_TOKEN.to_string(),
            msg: "token key set is unavailable".to_string(),
            source: Some(anyhow::Error::from(other)),
        },
    }
}

fn required_sub(claims: &Value) -> Result<String, CommonError> {
    claims
        .get("sub")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CommonError::unauthenticated(reason::INVALID_TOKEN, "token has no subject"))
}

fn string_array(claims: &Value, key: &str) -> Vec<String> {
    claims
        .get(key)
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn audience_contains(claims: &Value, client_id: &str) -> bool {
    match claims.get("aud") {
        Some(Value::String(aud)) => aud == client_id,
        Some(Value::Array(auds)) => auds.iter().filter_map(Value::as_str).any(|a| a == client_id),
        _ => false,
    }
}

fn expiry(claims: &Value) -> DateTime<Utc> {
    claims
        .get("exp")
        .and_then(Value::as_i64)
        .and_then(|t| Utc.timestamp_opt(t, 0).single())
        .unwrap_or_else(Utc::now)
}
