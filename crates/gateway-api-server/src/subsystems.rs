//! Background subsystems: spawned after the API service is built, drained on
//! shutdown.

use tokio::sync::broadcast;

use shared::subsystem::{SubsystemHandle, spawn_subsystem};

use crate::ApiService;
use crate::config::GatewayConfig;

pub fn start_subsystems(
    api_service: &ApiService,
    config: &GatewayConfig,
    shutdown_tx: &broadcast::Sender<()>,
) -> Vec<SubsystemHandle> {
    let mut handles = Vec::new();

    {
        let health = api_service.health.clone();
        let events = api_service.events.subscribe();
        let shutdown = shutdown_tx.subscribe();
        handles.push(spawn_subsystem("health-supervisor", async move {
            health.run(events, shutdown).await
        }));
    }

    {
        let discovery = api_service.discovery.clone();
        let events = api_service.events.subscribe();
        let shutdown = shutdown_tx.subscribe();
        handles.push(spawn_subsystem("index-rebuilder", async move {
            discovery.run_rebuilder(events, shutdown).await
        }));
    }

    {
        let scopes = api_service.scopes.clone();
        let events = api_service.events.subscribe();
        let shutdown = shutdown_tx.subscribe();
        handles.push(spawn_subsystem("scope-event-listener", async move {
            scopes::store::run_scope_event_listener(scopes, events, shutdown).await
        }));
    }

    {
        let reload_cmd = config.proxy_reload_cmd.clone();
        let events = api_service.events.subscribe();
        let shutdown = shutdown_tx.subscribe();
        handles.push(spawn_subsystem("proxy-reload-adapter", async move {
            registry::proxy::run_proxy_reload_adapter(reload_cmd, events, shutdown).await
        }));
    }

    {
        let pending = api_service.auth.pending_logins();
        let shutdown = shutdown_tx.subscribe();
        handles.push(spawn_subsystem("login-sweeper", async move {
            identity::logic::login::run_login_sweeper(pending, shutdown).await
        }));
    }

    handles
}
