//! Registry operations over the in-memory routing table and its file-backed
//! persistence. Mutations are totally ordered by the write half of the
//! records lock; persistence failures abort before any in-memory change.

use std::collections::BTreeMap;

use mcp::protocol::ToolDescriptor;
use tokio::sync::RwLock;
use tracing::{info, warn};

use shared::error::CommonError;
use shared::events::{GatewayEvent, GatewayEventTx, publish};

use crate::logic::{ServicePatch, ServiceRecord, validate_and_normalize};
use crate::proxy::ProxyConfigWriter;
use crate::repository::{FileRepository, QuarantinedRecord};

pub struct RegistryService {
    records: RwLock<BTreeMap<String, ServiceRecord>>,
    quarantined: Vec<QuarantinedRecord>,
    repository: FileRepository,
    proxy_writer: ProxyConfigWriter,
    events: GatewayEventTx,
}

impl RegistryService {
    /// Import every persisted record and materialize the initial proxy
    /// fragment. Records that fail validation join the quarantine next to
    /// the ones that failed to parse.
    pub async fn load(
        repository: FileRepository,
        proxy_writer: ProxyConfigWriter,
        events: GatewayEventTx,
    ) -> Result<Self, CommonError> {
        let (loaded, mut quarantined) = repository.load_all().await?;

        let mut records = BTreeMap::new();
        for mut record in loaded {
            if let Err(e) = validate_and_normalize(&mut record) {
                warn!(path = %record.path, "quarantining invalid service record: {e}");
                quarantined.push(QuarantinedRecord {
                    file: record.path.clone(),
                    error: e.to_string(),
                });
                continue;
            }
            if records.contains_key(&record.path) {
                warn!(path = %record.path, "duplicate service path on disk, keeping the first");
                quarantined.push(QuarantinedRecord {
                    file: record.path.clone(),
                    error: "duplicate path".to_string(),
                });
                continue;
            }
            records.insert(record.path.clone(), record);
        }

        let service = Self {
            records: RwLock::new(records),
            quarantined,
            repository,
            proxy_writer,
            events,
        };

        {
            let records = service.records.read().await;
            if let Err(e) = service.proxy_writer.regenerate(&records).await {
                warn!("initial proxy config generation failed: {e}");
            }
        }

        Ok(service)
    }

    pub async fn register_service(
        &self,
        mut record: ServiceRecord,
    ) -> Result<ServiceRecord, CommonError> {
        validate_and_normalize(&mut record)?;

        let mut records = self.records.write().await;
        if records.contains_key(&record.path) {
            return Err(CommonError::Conflict {
                msg: format!("a service is already registered at '{}'", record.path),
                source: None,
            });
        }

        self.repository.save(&record).await?;
        records.insert(record.path.clone(), record.clone());

        if let Err(e) = self.proxy_writer.regenerate(&records).await {
            warn!("proxy config regeneration failed: {e}");
        }
        publish(
            &self.events,
            GatewayEvent::ServiceRegistered {
                path: record.path.clone(),
            },
        );
        info!(path = %record.path, "service registered");
        Ok(record)
    }

    pub async fn remove_service(&self, path: &str) -> Result<ServiceRecord, CommonError> {
        let mut records = self.records.write().await;
        if !records.contains_key(path) {
            return Err(not_found(path));
        }

        self.repository.delete(path).await?;
        let Some(removed) = records.remove(path) else {
            return Err(not_found(path));
        };

        if let Err(e) = self.proxy_writer.regenerate(&records).await {
            warn!("proxy config regeneration failed: {e}");
        }
        publish(
            &self.events,
            GatewayEvent::ServiceRemoved {
                path: path.to_string(),
                server_name: removed.server_name.clone(),
            },
        );
        info!(path, "service removed");
        Ok(removed)
    }

    pub async fn toggle_service(
        &self,
        path: &str,
        enabled: bool,
    ) -> Result<ServiceRecord, CommonError> {
        let mut records = self.records.write().await;
        let record = records.get(path).ok_or_else(|| not_found(path))?;

        let mut updated = record.clone();
        updated.enabled = enabled;
        self.repository.save(&updated).await?;
        records.insert(path.to_string(), updated.clone());

        if let Err(e) = self.proxy_writer.regenerate(&records).await {
            warn!("proxy config regeneration failed: {e}");
        }
        publish(
            &self.events,
            GatewayEvent::ServiceToggled {
                path: path.to_string(),
                enabled,
            },
        );
        info!(path, enabled, "service toggled");
        Ok(updated)
    }

    pub async fn edit_service(
        &self,
        path: &str,
        patch: ServicePatch,
    ) -> Result<ServiceRecord, CommonError> {
        let mut records = self.records.write().await;
        let record = records.get(path).ok_or_else(|| not_found(path))?;

        let mut updated = record.clone();
        patch.apply(&mut updated);
        validate_and_normalize(&mut updated)?;

        self.repository.save(&updated).await?;
        records.insert(path.to_string(), updated.clone());

        if let Err(e) = self.proxy_writer.regenerate(&records).await {
            warn!("proxy config regeneration failed: {e}");
        }
        publish(
            &self.events,
            GatewayEvent::ServiceEdited {
                path: path.to_string(),
            },
        );
        Ok(updated)
    }

    pub async fn list_services(&self) -> Vec<ServiceRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn server_details(&self, path: &str) -> Result<ServiceRecord, CommonError> {
        self.records
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| not_found(path))
    }

    /// Resolve a record by path or display name, the two forms scope entries
    /// may reference.
    pub async fn resolve(&self, path_or_name: &str) -> Option<ServiceRecord> {
        let records = self.records.read().await;
        if let Some(r) = records.get(path_or_name) {
            return Some(r.clone());
        }
        records
            .values()
            .find(|r| r.server_name == path_or_name)
            .cloned()
    }

    /// Health-supervisor write path: replace a record's inventory. Returns
    /// whether the inventory actually changed. Does not touch the routing
    /// table, so no proxy regeneration happens here.
    pub async fn update_tool_inventory(
        &self,
        path: &str,
        tools: Vec<ToolDescriptor>,
    ) -> Result<bool, CommonError> {
        let mut records = self.records.write().await;
        let record = records.get(path).ok_or_else(|| not_found(path))?;

        if record.tool_list == tools {
            return Ok(false);
        }

        let mut updated = record.clone();
        updated.tool_list = tools;
        updated.num_tools = updated.tool_list.len() as u32;
        self.repository.save(&updated).await?;
        records.insert(path.to_string(), updated);
        Ok(true)
    }

    pub fn quarantined(&self) -> &[QuarantinedRecord] {
        &self.quarantined
    }
}

fn not_found(path: &str) -> CommonError {
    CommonError::NotFound {
        msg: format!("no service registered at '{path}'"),
        lookup_id: path.to_string(),
        source: None,
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use shared::events::create_event_channel;

    struct TestContext {
        service: RegistryService,
        proxy_path: std::path::PathBuf,
        #[allow(dead_code)]
        temp_dir: tempfile::TempDir,
    }

    async fn setup_registry() -> TestContext {
        shared::setup_test!();

        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let proxy_path = temp_dir.path().join("mcpgw.locations.conf");
        let (tx, _rx) = create_event_channel(32);

        let service = RegistryService::load(
            FileRepository::new(temp_dir.path().join("records")),
            ProxyConfigWriter::new(&proxy_path, tx.clone()),
            tx,
        )
        .await
        .unwrap();

        TestContext {
            service,
            proxy_path,
            temp_dir,
        }
    }

    fn record(path: &str) -> ServiceRecord {
        serde_json::from_value(serde_json::json!({
            "path": path,
            "server_name": format!("{} server", path.trim_matches('/')),
            "proxy_pass_url": format!("http://{}:8000", path.trim_matches('/')),
            "description": "test service",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn register_persists_and_routes() {
        let ctx = setup_registry().await;
        ctx.service
            .register_service(record("/currenttime"))
            .await
            .unwrap();

        let listed = ctx.service.list_services().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].proxy_pass_url, "http://currenttime:8000/");

        let fragment = std::fs::read_to_string(&ctx.proxy_path).unwrap();
        assert!(fragment.contains("location /currenttime "));
    }

    #[tokio::test]
    async fn duplicate_path_is_a_conflict() {
        let ctx = setup_registry().await;
        ctx.service
            .register_service(record("/currenttime"))
            .await
            .unwrap();
        let err = ctx
            .service
            .register_service(record("/currenttime"))
            .await
            .unwrap_err();
        assert!(matches!(err, CommonError::Conflict { .. }));
    }

    #[tokio::test]
    async fn toggle_removes_route_but_keeps_record() {
        let ctx = setup_registry().await;
        ctx.service
            .register_service(record("/currenttime"))
            .await
            .unwrap();

        ctx.service
            .toggle_service("/currenttime", false)
            .await
            .unwrap();

        let fragment = std::fs::read_to_string(&ctx.proxy_path).unwrap();
        assert!(!fragment.contains("location /currenttime"));
        assert!(!ctx.service.server_details("/currenttime").await.unwrap().enabled);
    }

    #[tokio::test]
    async fn register_then_remove_restores_disk_state() {
        let ctx = setup_registry().await;
        let records_dir = ctx.temp_dir.path().join("records");

        ctx.service
            .register_service(record("/currenttime"))
            .await
            .unwrap();
        assert!(records_dir.join("currenttime.json").exists());

        ctx.service.remove_service("/currenttime").await.unwrap();
        assert!(!records_dir.join("currenttime.json").exists());
        assert!(ctx.service.list_services().await.is_empty());

        let fragment = std::fs::read_to_string(&ctx.proxy_path).unwrap();
        assert!(!fragment.contains("location /currenttime"));
    }

    #[tokio::test]
    async fn edit_applies_patch_and_revalidates() {
        let ctx = setup_registry().await;
        ctx.service
            .register_service(record("/currenttime"))
            .await
            .unwrap();

        let patch: ServicePatch = serde_json::from_value(serde_json::json!({
            "description": "updated",
            "proxy_pass_url": "http://elsewhere:9000"
        }))
        .unwrap();
        let updated = ctx
            .service
            .edit_service("/currenttime", patch)
            .await
            .unwrap();
        assert_eq!(updated.description, "updated");
        assert_eq!(updated.proxy_pass_url, "http://elsewhere:9000/");

        let bad_patch: Result<ServicePatch, _> =
            serde_json::from_value(serde_json::json!({"path": "/other"}));
        assert!(bad_patch.is_err(), "path must not be patchable");
    }

    #[tokio::test]
    async fn inventory_update_reports_changes_only() {
        let ctx = setup_registry().await;
        ctx.service
            .register_service(record("/currenttime"))
            .await
            .unwrap();

        let tools: Vec<mcp::protocol::ToolDescriptor> = serde_json::from_value(serde_json::json!([
            {"name": "current_time_by_timezone", "description": "tz time", "inputSchema": {}}
        ]))
        .unwrap();

        assert!(
            ctx.service
                .update_tool_inventory("/currenttime", tools.clone())
                .await
                .unwrap()
        );
        assert!(
            !ctx.service
                .update_tool_inventory("/currenttime", tools)
                .await
                .unwrap()
        );

        let details = ctx.service.server_details("/currenttime").await.unwrap();
        assert_eq!(details.num_tools, 1);
    }

    #[tokio::test]
    async fn concurrent_registration_keeps_paths_unique() {
        let ctx = setup_registry().await;
        let service = std::sync::Arc::new(ctx.service);

        let mut attempts = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            attempts.push(tokio::spawn(async move {
                service.register_service(record("/contended")).await.is_ok()
            }));
        }

        let mut successes = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1, "exactly one registration may win");
        assert_eq!(service.list_services().await.len(), 1);
    }

    #[tokio::test]
    async fn boot_reimports_persisted_records() {
        let ctx = setup_registry().await;
        ctx.service
            .register_service(record("/currenttime"))
            .await
            .unwrap();

        let (tx, _rx) = create_event_channel(8);
        let reloaded = RegistryService::load(
            FileRepository::new(ctx.temp_dir.path().join("records")),
            ProxyConfigWriter::new(ctx.temp_dir.path().join("regen.conf"), tx.clone()),
            tx,
        )
        .await
        .unwrap();

        assert_eq!(reloaded.list_services().await.len(), 1);
    }

    #[tokio::test]
    async fn resolve_by_path_or_name() {
        let ctx = setup_registry().await;
        ctx.service
            .register_service(record("/currenttime"))
            .await
            .unwrap();

        assert!(ctx.service.resolve("/currenttime").await.is_some());
        assert!(ctx.service.resolve("currenttime server").await.is_some());
        assert!(ctx.service.resolve("/missing").await.is_none());
    }
}
