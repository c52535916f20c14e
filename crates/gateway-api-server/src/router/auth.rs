//! Auth-plane endpoints: the proxy's `/validate` subrequest hook, the 3LO
//! login flow, and token vending.

use std::time::Duration;

use axum::{
    Json,
    extract::{Query, State},
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};
use serde::Deserialize;
use tracing::debug;
use utoipa_axum::{router::OpenApiRouter, routes};

use identity::logic::login::CallbackParams;
use identity::logic::session::SESSION_COOKIE_NAME;
use identity::logic::tokens::{GenerateTokenRequest, GeneratedToken};
use shared::adapters::openapi::JsonResponse;
use shared::error::{CommonError, reason};
use shared::identity::IdProvider;

use crate::ApiService;

/// `/validate` must answer inside this budget; a stalled JWKS fetch falls
/// back to cached keys, anything slower is treated as unverifiable.
pub const VALIDATE_BUDGET: Duration = Duration::from_millis(250);

pub fn create_router() -> OpenApiRouter<ApiService> {
    OpenApiRouter::new()
        .routes(routes!(validate))
        .routes(routes!(login))
        .routes(routes!(callback))
        .routes(routes!(logout))
        .routes(routes!(generate_token))
}

/// The reverse proxy passes the original request line in headers and the
/// original body as the subrequest body.
fn original_uri(headers: &HeaderMap) -> String {
    let raw = headers
        .get("x-original-uri")
        .or_else(|| headers.get("x-forwarded-uri"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("/");
    // Strip the query string; routing is by path prefix.
    raw.split('?').next().unwrap_or("/").to_string()
}

#[utoipa::path(
    post,
    path = "/validate",
    request_body = Vec<u8>,
    responses(
        (status = 200, description = "Allowed; identity headers attached"),
        (status = 401, description = "Unauthenticated", body = CommonError),
        (status = 403, description = "Unauthorized", body = CommonError),
    )
)]
async fn validate(State(ctx): State<ApiService>, headers: HeaderMap, body: Bytes) -> Response {
    let uri = original_uri(&headers);

    let decision =
        match tokio::time::timeout(VALIDATE_BUDGET, ctx.auth.validate(&headers, &uri, &body)).await
        {
            Err(_) => {
                return CommonError::unauthenticated(
                    reason::INVALID_TOKEN,
                    "credential verification exceeded the validation budget",
                )
                .into_response();
            }
            Ok(Err(e)) => {
                debug!(uri, "validate denied: {e}");
                return e.into_response();
            }
            Ok(Ok(decision)) => decision,
        };

    let mut response = StatusCode::OK.into_response();
    for (name, value) in &decision.identity_headers {
        if let Ok(value) = HeaderValue::from_str(value) {
            response.headers_mut().insert(*name, value);
        }
    }
    response
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
struct LoginQuery {
    /// `cognito` or `keycloak`; defaults to the configured provider.
    provider: Option<String>,
    /// Where to send the browser after a completed login.
    redirect_uri: Option<String>,
}

#[utoipa::path(
    get,
    path = "/login",
    params(LoginQuery),
    responses(
        (status = 307, description = "Redirect to the IdP authorize endpoint"),
        (status = 400, description = "Bad provider", body = CommonError),
    )
)]
async fn login(State(ctx): State<ApiService>, Query(query): Query<LoginQuery>) -> Response {
    let provider = match query.provider.as_deref() {
        None => None,
        Some(raw) => match IdProvider::parse(raw) {
            Some(p) => Some(p),
            None => {
                return CommonError::validation_field(
                    "provider",
                    format!("unknown provider '{raw}'"),
                )
                .into_response();
            }
        },
    };

    match ctx.auth.start_login(provider, query.redirect_uri) {
        Ok(url) => Redirect::temporary(&url).into_response(),
        Err(e) => e.into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/callback",
    responses(
        (status = 303, description = "Session minted; redirect back"),
        (status = 401, description = "Login failed", body = CommonError),
    )
)]
async fn callback(
    State(ctx): State<ApiService>,
    jar: CookieJar,
    Query(params): Query<CallbackParams>,
) -> Response {
    match ctx.auth.handle_callback(params).await {
        Ok((cookie_value, redirect_back)) => {
            let cookie = Cookie::build((SESSION_COOKIE_NAME, cookie_value))
                .path("/")
                .http_only(true)
                .same_site(SameSite::Lax)
                .build();
            (jar.add(cookie), Redirect::to(&redirect_back)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/logout",
    responses((status = 200, description = "Session cookie cleared"))
)]
async fn logout(jar: CookieJar) -> Response {
    let cookie = Cookie::build((SESSION_COOKIE_NAME, ""))
        .path("/")
        .build();
    (
        jar.remove(cookie),
        Json(serde_json::json!({"success": true})),
    )
        .into_response()
}

#[utoipa::path(
    post,
    path = "/tokens/generate",
    request_body = GenerateTokenRequest,
    responses(
        (status = 200, description = "Token minted", body = GeneratedToken),
        (status = 401, description = "No live session", body = CommonError),
        (status = 403, description = "Scope not held", body = CommonError),
    )
)]
async fn generate_token(
    State(ctx): State<ApiService>,
    headers: HeaderMap,
    Json(request): Json<GenerateTokenRequest>,
) -> JsonResponse<GeneratedToken, CommonError> {
    JsonResponse::from(ctx.auth.generate_token(&headers, request).await)
}
