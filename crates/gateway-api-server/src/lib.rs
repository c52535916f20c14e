use std::sync::Arc;

use discovery::DiscoveryService;
use group_sync::GroupSyncService;
use health::HealthSupervisor;
use identity::AuthService;
use registry::RegistryService;
use scopes::ScopePolicyStore;
use shared::events::GatewayEventTx;

pub mod config;
pub mod factory;
pub mod router;
pub mod subsystems;

/// Everything the HTTP surface needs, wired once at startup.
#[derive(Clone)]
pub struct ApiService {
    pub auth: Arc<AuthService>,
    pub registry: Arc<RegistryService>,
    pub scopes: Arc<ScopePolicyStore>,
    pub health: HealthSupervisor,
    pub discovery: Arc<DiscoveryService>,
    pub group_sync: Arc<GroupSyncService>,
    pub events: GatewayEventTx,
}
