use axum::Router;
use tower_http::trace::TraceLayer;
use utoipa::openapi::{Info, OpenApi};

use crate::ApiService;

pub(crate) mod admin;
pub(crate) mod auth;
pub(crate) mod mcpgw;
pub(crate) mod system;

pub fn initiate_api_router(api_service: ApiService) -> Router {
    let mut router = Router::new();

    // auth router: /validate, login flow, token vending
    let (auth_router, _) = auth::create_router().split_for_parts();
    router = router.merge(auth_router.with_state(api_service.clone()));

    // registry admin router
    let (admin_router, _) = admin::create_router().split_for_parts();
    router = router.merge(admin_router.with_state(api_service.clone()));

    // gateway's own MCP endpoint
    router = router.merge(mcpgw::create_router().with_state(api_service.clone()));

    // liveness
    router = router.merge(system::create_router().with_state(api_service));

    router.layer(TraceLayer::new_for_http())
}

pub fn generate_openapi_spec() -> OpenApi {
    let (_, mut spec) = auth::create_router().split_for_parts();
    let (_, admin_spec) = admin::create_router().split_for_parts();
    spec.merge(admin_spec);

    let mut info = Info::new("mcpgw", "MCP gateway and registry");
    info.version = "v1".to_string();
    spec.info = info;
    spec
}
