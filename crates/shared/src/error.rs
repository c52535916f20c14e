use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use serde::Serialize;
use thiserror::Error;

pub type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Stable machine-readable reason codes carried on authentication and
/// authorization denials. These appear verbatim in the error envelope and in
/// logs, so clients can branch on them.
pub mod reason {
    pub const NO_CREDENTIALS: &str = "no_credentials";
    pub const INVALID_TOKEN: &str = "invalid_token";
    pub const TOKEN_EXPIRED: &str = "token_expired";
    pub const SESSION_EXPIRED: &str = "session_expired";
    pub const METHOD_NOT_PERMITTED: &str = "method_not_permitted";
    pub const TOOL_NOT_PERMITTED: &str = "tool_not_permitted";
    pub const UNKNOWN_SERVICE: &str = "unknown_service";
    pub const SCOPE_NOT_HELD: &str = "scope_not_held";
    pub const UI_CAPABILITY_MISSING: &str = "ui_capability_missing";
}

#[derive(Error, Debug, Serialize)]
pub enum CommonError {
    #[error("invalid configuration: {msg}")]
    Config {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("request failed validation: {msg}")]
    Validation {
        msg: String,
        /// Field the validation failure refers to, when one applies.
        field: Option<String>,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("caller is not authenticated: {reason}")]
    Authentication {
        reason: String,
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("caller is not authorized: {reason}")]
    Authorization {
        reason: String,
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("could not find resource: {msg}")]
    NotFound {
        msg: String,
        lookup_id: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("conflicting state: {msg}")]
    Conflict {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("upstream dependency failed: {msg}")]
    Upstream {
        msg: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("persisted state is corrupt: {msg}")]
    Corruption {
        msg: String,
        path: String,
        #[serde(skip)]
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("unknown error")]
    Unknown(
        #[serde(skip)]
        #[from]
        anyhow::Error,
    ),
    #[error("io error")]
    IoError {
        #[serde(skip)]
        #[from]
        #[source]
        source: std::io::Error,
    },
    #[error("url parse error")]
    UrlParseError {
        #[serde(skip)]
        #[from]
        #[source]
        source: url::ParseError,
    },
    #[error("serde json error")]
    SerdeSerializationError {
        #[serde(skip)]
        #[from]
        #[source]
        source: serde_json::Error,
    },
    #[error("serde yaml error")]
    YamlSerializationError {
        #[serde(skip)]
        #[from]
        #[source]
        source: serde_yaml::Error,
    },
    #[error("axum error")]
    AxumError {
        #[serde(skip)]
        #[from]
        #[source]
        source: axum::Error,
    },
    #[error("address parse error")]
    AddrParseError {
        #[serde(skip)]
        #[from]
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("var error")]
    VarError {
        #[serde(skip)]
        #[from]
        #[source]
        source: std::env::VarError,
    },
    #[error("tokio channel error")]
    TokioChannelError {
        #[serde(skip)]
        #[source]
        source: DynError,
    },
    #[error("reqwest error")]
    ReqwestError {
        #[serde(skip)]
        #[from]
        #[source]
        source: reqwest::Error,
    },
}

impl CommonError {
    pub fn unauthenticated(reason: &str, msg: impl Into<String>) -> Self {
        CommonError::Authentication {
            reason: reason.to_string(),
            msg: msg.into(),
            source: None,
        }
    }

    pub fn unauthorized(reason: &str, msg: impl Into<String>) -> Self {
        CommonError::Authorization {
            reason: reason.to_string(),
            msg: msg.into(),
            source: None,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        CommonError::Validation {
            msg: msg.into(),
            field: None,
            source: None,
        }
    }

    pub fn validation_field(field: &str, msg: impl Into<String>) -> Self {
        CommonError::Validation {
            msg: msg.into(),
            field: Some(field.to_string()),
            source: None,
        }
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        CommonError::Upstream {
            msg: msg.into(),
            source: None,
        }
    }

    /// Whether a retry of the same call can reasonably succeed. Only
    /// idempotent callers consult this.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CommonError::Upstream { .. }
                | CommonError::ReqwestError { .. }
                | CommonError::IoError { .. }
                | CommonError::TokioChannelError { .. }
        )
    }

    /// Short stable code used in the error envelope.
    pub fn code(&self) -> &str {
        match self {
            CommonError::Config { .. } => "config_error",
            CommonError::Validation { .. } => "validation_error",
            CommonError::Authentication { reason, .. } => reason,
            CommonError::Authorization { reason, .. } => reason,
            CommonError::NotFound { .. } => "not_found",
            CommonError::Conflict { .. } => "conflict",
            CommonError::Upstream { .. } | CommonError::ReqwestError { .. } => "upstream_error",
            CommonError::Corruption { .. } => "state_corrupt",
            _ => "internal_error",
        }
    }
}

impl<T: Send + Sync + 'static> From<tokio::sync::mpsc::error::SendError<T>> for CommonError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        CommonError::TokioChannelError {
            source: Box::new(e),
        }
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for CommonError {
    fn from(e: tokio::sync::oneshot::error::RecvError) -> Self {
        CommonError::TokioChannelError {
            source: Box::new(e),
        }
    }
}

impl<T: Send + Sync + 'static + std::fmt::Debug> From<tokio::sync::broadcast::error::SendError<T>>
    for CommonError
{
    fn from(e: tokio::sync::broadcast::error::SendError<T>) -> Self {
        CommonError::TokioChannelError {
            source: Box::new(e),
        }
    }
}

impl From<tokio::sync::broadcast::error::RecvError> for CommonError {
    fn from(e: tokio::sync::broadcast::error::RecvError) -> Self {
        CommonError::TokioChannelError {
            source: Box::new(e),
        }
    }
}

/// JSON error envelope returned by every endpoint.
#[derive(Serialize)]
pub struct ErrorEnvelope {
    pub error: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl utoipa::ToSchema for CommonError {
    fn name() -> std::borrow::Cow<'static, str> {
        std::borrow::Cow::Borrowed("Error")
    }

    fn schemas(
        _schemas: &mut Vec<(
            String,
            utoipa::openapi::RefOr<utoipa::openapi::schema::Schema>,
        )>,
    ) {
        // nothing by default
    }
}

impl utoipa::PartialSchema for CommonError {
    fn schema() -> utoipa::openapi::RefOr<utoipa::openapi::schema::Schema> {
        utoipa::openapi::ObjectBuilder::new()
            .property(
                "error",
                utoipa::openapi::ObjectBuilder::new()
                    .schema_type(utoipa::openapi::schema::Type::String),
            )
            .required("error")
            .property(
                "detail",
                utoipa::openapi::ObjectBuilder::new()
                    .schema_type(utoipa::openapi::schema::Type::String),
            )
            .required("detail")
            .into()
    }
}

impl utoipa::IntoResponses for CommonError {
    fn responses() -> std::collections::BTreeMap<
        String,
        utoipa::openapi::RefOr<utoipa::openapi::response::Response>,
    > {
        use utoipa::PartialSchema;
        let mut responses = std::collections::BTreeMap::new();

        let error_content = utoipa::openapi::ContentBuilder::new()
            .schema(Some(CommonError::schema()))
            .build();

        for (status, description) in [
            ("400", "Request failed validation"),
            ("401", "Authentication error"),
            ("403", "Authorization error"),
            ("404", "Resource not found"),
            ("409", "Conflicting state"),
            ("502", "Upstream dependency failed"),
            ("500", "Server error"),
        ] {
            responses.insert(
                status.to_string(),
                utoipa::openapi::ResponseBuilder::new()
                    .description(description)
                    .content("application/json", error_content.clone())
                    .into(),
            );
        }

        responses
    }
}

impl IntoResponse for CommonError {
    fn into_response(self) -> Response {
        let status = match self {
            CommonError::Validation { .. } => StatusCode::BAD_REQUEST,
            CommonError::Authentication { .. } => StatusCode::UNAUTHORIZED,
            CommonError::Authorization { .. } => StatusCode::FORBIDDEN,
            CommonError::NotFound { .. } => StatusCode::NOT_FOUND,
            CommonError::Conflict { .. } => StatusCode::CONFLICT,
            CommonError::Upstream { .. } | CommonError::ReqwestError { .. } => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let field = match &self {
            CommonError::Validation { field, .. } => field.clone(),
            _ => None,
        };

        let body = Json(ErrorEnvelope {
            error: self.code().to_string(),
            detail: self.to_string(),
            field,
        });

        let mut response = (status, body).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                http::header::WWW_AUTHENTICATE,
                http::HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_carry_reason_codes() {
        let e = CommonError::unauthenticated(reason::NO_CREDENTIALS, "no usable credential");
        assert_eq!(e.code(), "no_credentials");

        let e = CommonError::unauthorized(reason::TOOL_NOT_PERMITTED, "tool not in scope");
        assert_eq!(e.code(), "tool_not_permitted");
    }

    #[test]
    fn transient_classification() {
        assert!(CommonError::upstream("idp timeout").is_transient());
        assert!(!CommonError::validation("bad path").is_transient());
        assert!(!CommonError::unauthenticated(reason::INVALID_TOKEN, "sig").is_transient());
    }
}
