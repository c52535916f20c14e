//! Registry admin API. Reads need the `list_service` capability, writes
//! `register_service`/`toggle_service`/`modify_service`, health reads
//! `health_check_service` — all resolved from the policy's `UI-Scopes`.

use std::collections::BTreeMap;

use axum::{
    Json,
    extract::{Path, State},
};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

use health::HealthReport;
use registry::{ServicePatch, ServiceRecord};
use scopes::logic::UiCapability;
use shared::adapters::openapi::JsonResponse;
use shared::error::CommonError;

use crate::ApiService;

pub fn create_router() -> OpenApiRouter<ApiService> {
    OpenApiRouter::new()
        .routes(routes!(list_services))
        .routes(routes!(register_service))
        .routes(routes!(remove_service))
        .routes(routes!(health_status))
        // Wildcard segments (service paths may be nested) are registered as
        // plain routes; the OpenAPI document covers the flat endpoints.
        .route(
            "/api/server_details/{*path}",
            axum::routing::get(server_details),
        )
        .route("/api/toggle/{*path}", axum::routing::post(toggle_service))
        .route("/api/edit/{*path}", axum::routing::post(edit_service))
}

fn normalize_path(raw: &str) -> String {
    if raw.starts_with('/') {
        raw.to_string()
    } else {
        format!("/{raw}")
    }
}

async fn authorize(
    ctx: &ApiService,
    headers: &HeaderMap,
    capability: UiCapability,
    target: Option<&str>,
) -> Result<(), CommonError> {
    let principal = ctx.auth.resolve_principal(headers).await?;
    ctx.auth.require_ui(&principal, capability, target)
}

#[derive(Debug, Serialize, ToSchema)]
struct ListServicesResponse {
    services: Vec<ServiceRecord>,
}

#[utoipa::path(
    get,
    path = "/api/list_services",
    responses(
        (status = 200, description = "All registered services", body = ListServicesResponse),
        (status = 401, description = "Unauthenticated", body = CommonError),
        (status = 403, description = "Capability missing", body = CommonError),
    )
)]
async fn list_services(
    State(ctx): State<ApiService>,
    headers: HeaderMap,
) -> JsonResponse<ListServicesResponse, CommonError> {
    let result = async {
        authorize(&ctx, &headers, UiCapability::ListService, None).await?;
        Ok(ListServicesResponse {
            services: ctx.registry.list_services().await,
        })
    }
    .await;
    JsonResponse::from(result)
}

#[derive(Debug, Serialize, ToSchema)]
struct ServerDetailsResponse {
    service: ServiceRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    health: Option<HealthReport>,
}

async fn server_details(
    State(ctx): State<ApiService>,
    headers: HeaderMap,
    Path(path): Path<String>,
) -> JsonResponse<serde_json::Value, CommonError> {
    let result = async {
        // `all` is the UI's bulk load.
        if path == "all" {
            authorize(&ctx, &headers, UiCapability::ListService, None).await?;
            let mut details = Vec::new();
            for service in ctx.registry.list_services().await {
                let health = ctx.health.status_for(&service.path);
                details.push(ServerDetailsResponse { service, health });
            }
            return Ok(serde_json::to_value(details)?);
        }

        let path = normalize_path(&path);
        authorize(&ctx, &headers, UiCapability::ListService, Some(&path)).await?;
        let service = ctx.registry.server_details(&path).await?;
        let health = ctx.health.status_for(&path);
        Ok(serde_json::to_value(ServerDetailsResponse {
            service,
            health,
        })?)
    }
    .await;
    JsonResponse::from(result)
}

#[derive(Debug, Serialize, ToSchema)]
struct MutationResponse {
    success: bool,
    service: ServiceRecord,
}

#[utoipa::path(
    post,
    path = "/api/register",
    request_body = ServiceRecord,
    responses(
        (status = 200, description = "Service registered", body = MutationResponse),
        (status = 400, description = "Validation failure", body = CommonError),
        (status = 409, description = "Duplicate path", body = CommonError),
    )
)]
async fn register_service(
    State(ctx): State<ApiService>,
    headers: HeaderMap,
    Json(record): Json<ServiceRecord>,
) -> JsonResponse<MutationResponse, CommonError> {
    let result = async {
        authorize(
            &ctx,
            &headers,
            UiCapability::RegisterService,
            Some(&record.path),
        )
        .await?;
        let service = ctx.registry.register_service(record).await?;
        Ok(MutationResponse {
            success: true,
            service,
        })
    }
    .await;
    JsonResponse::from(result)
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
struct ToggleRequest {
    enabled: bool,
}

async fn toggle_service(
    State(ctx): State<ApiService>,
    headers: HeaderMap,
    Path(path): Path<String>,
    Json(request): Json<ToggleRequest>,
) -> JsonResponse<MutationResponse, CommonError> {
    let result = async {
        let path = normalize_path(&path);
        authorize(&ctx, &headers, UiCapability::ToggleService, Some(&path)).await?;
        let service = ctx.registry.toggle_service(&path, request.enabled).await?;
        Ok(MutationResponse {
            success: true,
            service,
        })
    }
    .await;
    JsonResponse::from(result)
}

async fn edit_service(
    State(ctx): State<ApiService>,
    headers: HeaderMap,
    Path(path): Path<String>,
    Json(patch): Json<ServicePatch>,
) -> JsonResponse<MutationResponse, CommonError> {
    let result = async {
        let path = normalize_path(&path);
        authorize(&ctx, &headers, UiCapability::ModifyService, Some(&path)).await?;
        let service = ctx.registry.edit_service(&path, patch).await?;
        Ok(MutationResponse {
            success: true,
            service,
        })
    }
    .await;
    JsonResponse::from(result)
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
struct RemoveRequest {
    path: String,
}

#[derive(Debug, Serialize, ToSchema)]
struct RemoveResponse {
    success: bool,
    removed: String,
}

#[utoipa::path(
    post,
    path = "/api/remove",
    request_body = RemoveRequest,
    responses(
        (status = 200, description = "Service removed", body = RemoveResponse),
        (status = 404, description = "Unknown service", body = CommonError),
    )
)]
async fn remove_service(
    State(ctx): State<ApiService>,
    headers: HeaderMap,
    Json(request): Json<RemoveRequest>,
) -> JsonResponse<RemoveResponse, CommonError> {
    let result = async {
        let path = normalize_path(&request.path);
        authorize(&ctx, &headers, UiCapability::ModifyService, Some(&path)).await?;
        let removed = ctx.registry.remove_service(&path).await?;
        Ok(RemoveResponse {
            success: true,
            removed: removed.path,
        })
    }
    .await;
    JsonResponse::from(result)
}

#[derive(Debug, Serialize, ToSchema)]
struct HealthStatusResponse {
    statuses: BTreeMap<String, HealthReport>,
    /// Records quarantined at boot: present on disk, unusable, excluded
    /// from routing.
    quarantined: Vec<QuarantinedEntry>,
}

#[derive(Debug, Serialize, ToSchema)]
struct QuarantinedEntry {
    file: String,
    error: String,
}

#[utoipa::path(
    get,
    path = "/api/health_status",
    responses(
        (status = 200, description = "Supervisor snapshot", body = HealthStatusResponse),
        (status = 403, description = "Capability missing", body = CommonError),
    )
)]
async fn health_status(
    State(ctx): State<ApiService>,
    headers: HeaderMap,
) -> JsonResponse<HealthStatusResponse, CommonError> {
    let result = async {
        authorize(&ctx, &headers, UiCapability::HealthCheckService, None).await?;
        Ok(HealthStatusResponse {
            statuses: ctx.health.snapshot(),
            quarantined: ctx
                .registry
                .quarantined()
                .iter()
                .map(|q| QuarantinedEntry {
                    file: q.file.clone(),
                    error: q.error.clone(),
                })
                .collect(),
        })
    }
    .await;
    JsonResponse::from(result)
}
