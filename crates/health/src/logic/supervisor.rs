//! The health supervisor: one worker per enabled service, probing on a fixed
//! period, feeding status to the API and inventory to the tool index.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use registry::RegistryService;
use shared::error::CommonError;
use shared::events::{GatewayEvent, GatewayEventRx, GatewayEventTx, HealthState, publish};

use crate::logic::HealthReport;
use crate::logic::probe::{ProbeOutcome, probe_service};

pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

struct SupervisorInner {
    statuses: DashMap<String, HealthReport>,
    workers: DashMap<String, CancellationToken>,
    registry: Arc<RegistryService>,
    events: GatewayEventTx,
    interval: Duration,
    probe_timeout: Duration,
}

#[derive(Clone)]
pub struct HealthSupervisor {
    inner: Arc<SupervisorInner>,
}

impl HealthSupervisor {
    pub fn new(
        registry: Arc<RegistryService>,
        events: GatewayEventTx,
        interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                statuses: DashMap::new(),
                workers: DashMap::new(),
                registry,
                events,
                interval,
                probe_timeout,
            }),
        }
    }

    /// Current status of every supervised service.
    pub fn snapshot(&self) -> BTreeMap<String, HealthReport> {
        self.inner
            .statuses
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn status_for(&self, path: &str) -> Option<HealthReport> {
        self.inner.statuses.get(path).map(|e| e.value().clone())
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    /// Run until shutdown: start a worker per enabled service, then follow
    /// registry events to keep the worker set in sync.
    pub async fn run(
        &self,
        mut events: GatewayEventRx,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<(), CommonError> {
        for record in self.inner.registry.list_services().await {
            if record.enabled {
                self.spawn_worker(&record.path);
            }
        }
        info!(workers = self.worker_count(), "health supervisor started");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(GatewayEvent::ServiceRegistered { path }) => self.spawn_worker(&path),
                    Ok(GatewayEvent::ServiceToggled { path, enabled }) => {
                        if enabled {
                            self.spawn_worker(&path);
                        } else {
                            self.stop_worker(&path, false);
                        }
                    }
                    Ok(GatewayEvent::ServiceRemoved { path, .. }) => self.stop_worker(&path, true),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("health supervisor lagged by {n} events, resyncing workers");
                        self.resync_workers().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown_rx.recv() => break,
            }
        }

        for entry in self.inner.workers.iter() {
            entry.value().cancel();
        }
        self.inner.workers.clear();
        info!("health supervisor stopped");
        Ok(())
    }

    /// Rebuild the worker set from the registry after an event gap.
    async fn resync_workers(&self) {
        let records = self.inner.registry.list_services().await;
        let enabled: std::collections::BTreeSet<String> = records
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.path.clone())
            .collect();

        let running: Vec<String> = self.inner.workers.iter().map(|e| e.key().clone()).collect();
        for path in running {
            if !enabled.contains(&path) {
                self.stop_worker(&path, true);
            }
        }
        for path in enabled {
            self.spawn_worker(&path);
        }
    }

    fn spawn_worker(&self, path: &str) {
        if self.inner.workers.contains_key(path) {
            return;
        }
        let token = CancellationToken::new();
        self.inner.workers.insert(path.to_string(), token.clone());
        self.inner
            .statuses
            .entry(path.to_string())
            .or_insert_with(HealthReport::unknown);

        let supervisor = self.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            supervisor.worker_loop(path, token).await;
        });
    }

    fn stop_worker(&self, path: &str, forget_status: bool) {
        if let Some((_, token)) = self.inner.workers.remove(path) {
            token.cancel();
            debug!(path, "health worker stopped");
        }
        if forget_status {
            self.inner.statuses.remove(path);
        }
    }

    /// One worker: a probe per period until cancelled, first probe
    /// immediately so a freshly registered service shows up fast.
    async fn worker_loop(&self, path: String, token: CancellationToken) {
        let mut timer = tokio::time::interval(self.inner.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    // Re-read the record each cycle so URL or header edits
                    // take effect without a worker restart.
                    let record = match self.inner.registry.server_details(&path).await {
                        Ok(record) if record.enabled => record,
                        _ => {
                            self.stop_worker(&path, false);
                            return;
                        }
                    };
                    self.probe_once(&record).await;
                }
                _ = token.cancelled() => return,
            }
        }
    }

    async fn probe_once(&self, record: &registry::ServiceRecord) {
        let path = record.path.clone();
        let outcome = probe_service(record, self.inner.probe_timeout).await;

        let (report, tools) = match outcome {
            ProbeOutcome::Success { tools, latency_ms } => (
                HealthReport {
                    status: HealthState::Healthy,
                    last_checked: Utc::now(),
                    num_tools: tools.len() as u32,
                    latency_ms: Some(latency_ms),
                    error: None,
                },
                Some(tools),
            ),
            ProbeOutcome::AuthExpired { latency_ms, error } => (
                HealthReport {
                    status: HealthState::HealthyAuthExpired,
                    last_checked: Utc::now(),
                    // Inventory is stale but still known.
                    num_tools: record.num_tools,
                    latency_ms: Some(latency_ms),
                    error: Some(error),
                },
                None,
            ),
            ProbeOutcome::Failure { latency_ms, error } => (
                HealthReport {
                    status: HealthState::Unhealthy,
                    last_checked: Utc::now(),
                    num_tools: record.num_tools,
                    latency_ms: Some(latency_ms),
                    error: Some(error),
                },
                None,
            ),
        };

        let status = report.status;
        let previous = self
            .inner
            .statuses
            .insert(path.clone(), report)
            .map(|r| r.status);

        if previous != Some(status) {
            info!(path, from = ?previous, to = ?status, "health transition");
            publish(
                &self.inner.events,
                GatewayEvent::HealthChanged {
                    path: path.clone(),
                    status,
                },
            );
        }

        if let Some(tools) = tools {
            let first_success = previous != Some(HealthState::Healthy);
            match self.inner.registry.update_tool_inventory(&path, tools).await {
                Ok(changed) => {
                    if changed || first_success {
                        publish(
                            &self.inner.events,
                            GatewayEvent::InventoryUpdated { path: path.clone() },
                        );
                    }
                }
                Err(e) => warn!(path, "failed to persist inventory: {e}"),
            }
        }
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::post};
    use mcp::protocol::{JsonRpcRequest, JsonRpcResponse};
    use registry::proxy::ProxyConfigWriter;
    use registry::repository::FileRepository;
    use shared::events::create_event_channel;

    async fn stub_mcp_server(tool_names: Vec<&'static str>) -> String {
        let app = Router::new().route(
            "/mcp",
            post(move |Json(req): Json<JsonRpcRequest>| {
                let tool_names = tool_names.clone();
                async move {
                    if req.is_notification() {
                        return StatusCode::ACCEPTED.into_response();
                    }
                    let result = match req.method.as_str() {
                        "initialize" => serde_json::json!({
                            "protocolVersion": "2025-03-26", "capabilities": {}
                        }),
                        "tools/list" => serde_json::json!({
                            "tools": tool_names.iter().map(|n| serde_json::json!({
                                "name": n, "description": "stub", "inputSchema": {}
                            })).collect::<Vec<_>>()
                        }),
                        _ => serde_json::json!({}),
                    };
                    Json(JsonRpcResponse::success(req.id, result)).into_response()
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    struct TestContext {
        registry: Arc<RegistryService>,
        supervisor: HealthSupervisor,
        events: GatewayEventTx,
        shutdown_tx: tokio::sync::broadcast::Sender<()>,
        #[allow(dead_code)]
        temp_dir: tempfile::TempDir,
    }

    async fn setup_supervisor() -> TestContext {
        shared::setup_test!();

        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let (events, _rx) = create_event_channel(64);
        let registry = Arc::new(
            RegistryService::load(
                FileRepository::new(temp_dir.path().join("records")),
                ProxyConfigWriter::new(temp_dir.path().join("mcpgw.conf"), events.clone()),
                events.clone(),
            )
            .await
            .unwrap(),
        );

        let supervisor = HealthSupervisor::new(
            registry.clone(),
            events.clone(),
            Duration::from_millis(150),
            Duration::from_secs(2),
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let run_supervisor = supervisor.clone();
        let run_events = events.subscribe();
        let run_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            run_supervisor.run(run_events, run_shutdown).await.unwrap();
        });

        TestContext {
            registry,
            supervisor,
            events,
            shutdown_tx,
            temp_dir,
        }
    }

    fn record(path: &str, url: &str) -> registry::ServiceRecord {
        serde_json::from_value(serde_json::json!({
            "path": path,
            "server_name": path.trim_matches('/'),
            "proxy_pass_url": url,
        }))
        .unwrap()
    }

    async fn wait_for_status(
        supervisor: &HealthSupervisor,
        path: &str,
        expected: HealthState,
    ) -> HealthReport {
        for _ in 0..50 {
            if let Some(report) = supervisor.status_for(path) {
                if report.status == expected {
                    return report;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("service {path} never reached {expected:?}");
    }

    #[tokio::test]
    async fn healthy_service_reports_tools() {
        let ctx = setup_supervisor().await;
        let url = stub_mcp_server(vec!["current_time_by_timezone"]).await;
        ctx.registry
            .register_service(record("/currenttime", &url))
            .await
            .unwrap();

        let report = wait_for_status(&ctx.supervisor, "/currenttime", HealthState::Healthy).await;
        assert_eq!(report.num_tools, 1);
        assert!(report.error.is_none());

        let persisted = ctx.registry.server_details("/currenttime").await.unwrap();
        assert_eq!(persisted.tool_names(), vec!["current_time_by_timezone"]);

        let _ = ctx.shutdown_tx.send(());
    }

    #[tokio::test]
    async fn unreachable_service_goes_unhealthy_and_toggle_stops_worker() {
        let ctx = setup_supervisor().await;
        ctx.registry
            .register_service(record("/dead", "http://192.0.2.1:9/"))
            .await
            .unwrap();

        let report = wait_for_status(&ctx.supervisor, "/dead", HealthState::Unhealthy).await;
        assert!(report.error.is_some());

        ctx.registry.toggle_service("/dead", false).await.unwrap();
        for _ in 0..50 {
            if ctx.supervisor.worker_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(ctx.supervisor.worker_count(), 0);
        // Status is retained for a disabled service, dropped on removal.
        assert!(ctx.supervisor.status_for("/dead").is_some());

        let _ = ctx.shutdown_tx.send(());
    }

    #[tokio::test]
    async fn removed_service_disappears_from_the_status_map() {
        let ctx = setup_supervisor().await;
        let url = stub_mcp_server(vec!["t"]).await;
        ctx.registry
            .register_service(record("/gone", &url))
            .await
            .unwrap();
        wait_for_status(&ctx.supervisor, "/gone", HealthState::Healthy).await;

        ctx.registry.remove_service("/gone").await.unwrap();
        for _ in 0..50 {
            if ctx.supervisor.status_for("/gone").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(ctx.supervisor.status_for("/gone").is_none());

        let _ = ctx.shutdown_tx.send(());
    }

    #[tokio::test]
    async fn auth_rejection_is_a_distinct_state() {
        let ctx = setup_supervisor().await;

        let app = Router::new().route(
            "/mcp",
            post(|| async { (StatusCode::UNAUTHORIZED, "expired").into_response() }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        ctx.registry
            .register_service(record("/authy", &format!("http://{addr}/")))
            .await
            .unwrap();

        wait_for_status(&ctx.supervisor, "/authy", HealthState::HealthyAuthExpired).await;

        let _ = ctx.shutdown_tx.send(());
    }

    #[tokio::test]
    async fn inventory_updates_are_published() {
        let ctx = setup_supervisor().await;
        let mut inventory_rx = ctx.events.subscribe();

        let url = stub_mcp_server(vec!["a", "b"]).await;
        ctx.registry
            .register_service(record("/inv", &url))
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .expect("no InventoryUpdated event arrived");
            match tokio::time::timeout(remaining, inventory_rx.recv()).await {
                Ok(Ok(GatewayEvent::InventoryUpdated { path })) if path == "/inv" => break,
                Ok(_) => continue,
                Err(_) => panic!("no InventoryUpdated event arrived"),
            }
        }

        let _ = ctx.shutdown_tx.send(());
    }
}
