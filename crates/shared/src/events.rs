use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use utoipa::ToSchema;

/// Health of a registered service as observed by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    /// The service answered, but rejected the gateway's credentials.
    /// Reachability is intact and the last known inventory is kept.
    HealthyAuthExpired,
    Unknown,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
            HealthState::HealthyAuthExpired => "healthy-auth-expired",
            HealthState::Unknown => "unknown",
        }
    }

    /// Whether the service's inventory is trustworthy enough to index.
    pub fn has_usable_inventory(&self) -> bool {
        matches!(self, HealthState::Healthy | HealthState::HealthyAuthExpired)
    }
}

/// Typed events connecting the subsystems. The registry, scope store, and
/// health supervisor emit; the tool index, proxy-reload adapter, and health
/// supervisor subscribe. Side effects the original deployment scripts used
/// to perform live in small adapter tasks driven by these events.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    ServiceRegistered { path: String },
    ServiceRemoved { path: String, server_name: String },
    ServiceToggled { path: String, enabled: bool },
    ServiceEdited { path: String },
    HealthChanged { path: String, status: HealthState },
    InventoryUpdated { path: String },
    ScopesReloaded,
    ProxyReload,
}

pub type GatewayEventTx = broadcast::Sender<GatewayEvent>;
pub type GatewayEventRx = broadcast::Receiver<GatewayEvent>;

pub fn create_event_channel(capacity: usize) -> (GatewayEventTx, GatewayEventRx) {
    broadcast::channel(capacity)
}

/// Publish without failing when nobody is subscribed yet (startup ordering).
pub fn publish(tx: &GatewayEventTx, event: GatewayEvent) {
    if let Err(e) = tx.send(event) {
        tracing::debug!("event dropped, no subscribers: {:?}", e.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_inventory_states() {
        assert!(HealthState::Healthy.has_usable_inventory());
        assert!(HealthState::HealthyAuthExpired.has_usable_inventory());
        assert!(!HealthState::Unhealthy.has_usable_inventory());
        assert!(!HealthState::Unknown.has_usable_inventory());
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let (tx, rx) = create_event_channel(8);
        drop(rx);
        publish(
            &tx,
            GatewayEvent::ServiceRegistered {
                path: "/currenttime".to_string(),
            },
        );
    }
}
