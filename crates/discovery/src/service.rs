//! Discovery service: owns the live index snapshot, rebuilds it when
//! inventories move, and answers `intelligent_tool_finder` queries.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use health::HealthSupervisor;
use registry::RegistryService;
use shared::error::CommonError;
use shared::events::{GatewayEvent, GatewayEventRx};

use crate::logic::embedder::Embedder;
use crate::logic::index::{IndexableService, ToolIndex, ToolMatch, normalize};

/// Inventory changes arriving within this window collapse into one rebuild.
pub const REBUILD_COALESCE_WINDOW: Duration = Duration::from_secs(2);

const MATRIX_FILE: &str = "toolindex.bin";
const META_FILE: &str = "toolindex.meta.json";

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    model: String,
    meta: crate::logic::index::IndexMetadata,
}

pub struct DiscoveryService {
    embedder: Arc<dyn Embedder>,
    index: ArcSwap<ToolIndex>,
    registry: Arc<RegistryService>,
    health: HealthSupervisor,
    cache_dir: PathBuf,
}

impl DiscoveryService {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        registry: Arc<RegistryService>,
        health: HealthSupervisor,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        let dim = embedder.dim();
        Self {
            embedder,
            index: ArcSwap::from_pointee(ToolIndex::empty(dim)),
            registry,
            health,
            cache_dir: cache_dir.into(),
        }
    }

    /// Services worth indexing: enabled, and either observed usable by the
    /// supervisor or (before the first probe lands) carrying a persisted
    /// inventory from the last run.
    async fn collect(&self) -> Vec<IndexableService> {
        let mut services = Vec::new();
        for record in self.registry.list_services().await {
            if !record.enabled {
                continue;
            }
            let auth_expired = match self.health.status_for(&record.path) {
                Some(report) if report.status.has_usable_inventory() => {
                    report.status == shared::events::HealthState::HealthyAuthExpired
                }
                Some(_) => continue,
                // Not probed yet: trust the persisted inventory.
                None => false,
            };
            if record.tool_list.is_empty() {
                continue;
            }
            services.push(IndexableService {
                path: record.path.clone(),
                name: record.server_name.clone(),
                description: record.description.clone(),
                tags: record.tags.clone(),
                tools: record.tool_list.clone(),
                auth_expired,
            });
        }
        services
    }

    pub async fn rebuild(&self) -> Result<(), CommonError> {
        let services = self.collect().await;
        let index = ToolIndex::build(self.embedder.as_ref(), &services).await?;
        info!(
            services = index.service_count(),
            tools = index.tool_count(),
            "tool index rebuilt"
        );

        if let Err(e) = self.write_cache(&index).await {
            warn!("failed to write tool-index cache: {e}");
        }
        self.index.store(Arc::new(index));
        Ok(())
    }

    /// Startup path: reuse the on-disk index when it matches the current
    /// inventory, otherwise embed from scratch.
    pub async fn load_cache_or_rebuild(&self) -> Result<(), CommonError> {
        let services = self.collect().await;
        let digest =
            ToolIndex::compute_digest(self.embedder.model_id(), self.embedder.dim(), &services);

        match self.try_load_cache(&digest).await {
            Ok(Some(index)) => {
                info!(
                    services = index.service_count(),
                    tools = index.tool_count(),
                    "tool index loaded from cache"
                );
                self.index.store(Arc::new(index));
                Ok(())
            }
            Ok(None) => self.rebuild().await,
            Err(e) => {
                warn!("tool-index cache unusable, rebuilding: {e}");
                self.rebuild().await
            }
        }
    }

    async fn try_load_cache(&self, want_digest: &str) -> Result<Option<ToolIndex>, CommonError> {
        let meta_path = self.cache_dir.join(META_FILE);
        let matrix_path = self.cache_dir.join(MATRIX_FILE);
        if !meta_path.exists() || !matrix_path.exists() {
            return Ok(None);
        }

        let cache: CacheFile =
            serde_json::from_str(&tokio::fs::read_to_string(&meta_path).await?)?;
        if cache.meta.digest != want_digest
            || cache.meta.dim != self.embedder.dim()
            || cache.model != self.embedder.model_id()
        {
            debug!("tool-index cache is stale");
            return Ok(None);
        }

        let raw = tokio::fs::read(&matrix_path).await?;
        let blob = bincode::deserialize(&raw)
            .map_err(|e| CommonError::Unknown(anyhow::anyhow!("cache blob corrupt: {e}")))?;
        Ok(Some(ToolIndex::from_cache_parts(cache.meta, blob)?))
    }

    async fn write_cache(&self, index: &ToolIndex) -> Result<(), CommonError> {
        let (blob, meta) = index.to_cache_parts();
        let blob = bincode::serialize(&blob)
            .map_err(|e| CommonError::Unknown(anyhow::anyhow!("cache encode failed: {e}")))?;
        let meta = serde_json::to_vec_pretty(&CacheFile {
            model: self.embedder.model_id().to_string(),
            meta,
        })?;

        shared::fs::write_atomic(&self.cache_dir.join(MATRIX_FILE), &blob).await?;
        shared::fs::write_atomic(&self.cache_dir.join(META_FILE), &meta).await?;
        Ok(())
    }

    /// Semantic two-stage lookup. The query is embedded once; readers work
    /// on an immutable snapshot, so concurrent rebuilds never disturb an
    /// in-flight search.
    pub async fn intelligent_tool_finder(
        &self,
        query: &str,
        top_k_services: usize,
        top_n_tools: usize,
        tags: Option<Vec<String>>,
    ) -> Result<Vec<ToolMatch>, CommonError> {
        if query.trim().is_empty() {
            return Err(CommonError::validation_field("query", "query is empty"));
        }

        let mut vectors = self.embedder.encode(&[query.to_string()]).await?;
        let query_vec = normalize(vectors.pop().ok_or_else(|| {
            CommonError::upstream("encoder returned no vector for the query")
        })?);

        let index = self.index.load_full();
        Ok(index.query(&query_vec, top_k_services, top_n_tools, tags.as_deref()))
    }

    /// Event-driven rebuild loop with coalescing.
    pub async fn run_rebuilder(
        &self,
        mut events: GatewayEventRx,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<(), CommonError> {
        let mut pending: Option<tokio::time::Instant> = None;

        loop {
            let deadline = pending
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = tokio::time::sleep_until(deadline), if pending.is_some() => {
                    pending = None;
                    if let Err(e) = self.rebuild().await {
                        warn!("scheduled index rebuild failed: {e}");
                    }
                }
                event = events.recv() => match event {
                    Ok(
                        GatewayEvent::InventoryUpdated { .. }
                        | GatewayEvent::ServiceRemoved { .. }
                        | GatewayEvent::ServiceToggled { .. }
                        | GatewayEvent::ServiceEdited { .. }
                        | GatewayEvent::HealthChanged { .. },
                    ) => {
                        pending.get_or_insert_with(|| {
                            tokio::time::Instant::now() + REBUILD_COALESCE_WINDOW
                        });
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        pending.get_or_insert_with(|| {
                            tokio::time::Instant::now() + REBUILD_COALESCE_WINDOW
                        });
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                },
                _ = shutdown_rx.recv() => return Ok(()),
            }
        }
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use crate::logic::embedder::HashEmbedder;
    use registry::proxy::ProxyConfigWriter;
    use registry::repository::FileRepository;
    use shared::events::create_event_channel;

    struct TestContext {
        discovery: DiscoveryService,
        registry: Arc<RegistryService>,
        #[allow(dead_code)]
        temp_dir: tempfile::TempDir,
    }

    async fn setup_discovery() -> TestContext {
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
        let health = HealthSupervisor::new(
            registry.clone(),
            events.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(1),
        );

        let discovery = DiscoveryService::new(
            Arc::new(HashEmbedder::new(256)),
            registry.clone(),
            health,
            temp_dir.path().join("cache"),
        );

        TestContext {
            discovery,
            registry,
            temp_dir,
        }
    }

    async fn register_fixture(registry: &RegistryService) {
        for (path, name, tool, desc) in [
            (
                "/currenttime",
                "Current Time",
                "current_time_by_timezone",
                "Current time in a given IANA timezone such as Tokyo",
            ),
            (
                "/fininfo",
                "Financial Info",
                "get_stock_aggregates",
                "Stock price aggregates for a ticker",
            ),
        ] {
            registry
                .register_service(
                    serde_json::from_value(serde_json::json!({
                        "path": path,
                        "server_name": name,
                        "proxy_pass_url": format!("http://{}:8000/", name.replace(' ', "-")),
                        "tool_list": [
                            {"name": tool, "description": desc, "inputSchema": {"type": "object"}}
                        ],
                    }))
                    .unwrap(),
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn finder_surfaces_the_semantically_closest_tool() {
        let ctx = setup_discovery().await;
        register_fixture(&ctx.registry).await;
        ctx.discovery.rebuild().await.unwrap();

        let matches = ctx
            .discovery
            .intelligent_tool_finder("current time in Tokyo timezone", 3, 1, None)
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].tool_name, "current_time_by_timezone");
        assert_eq!(matches[0].service_path, "/currenttime");
    }

    #[tokio::test]
    async fn empty_query_is_a_validation_error() {
        let ctx = setup_discovery().await;
        let err = ctx
            .discovery
            .intelligent_tool_finder("  ", 3, 1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CommonError::Validation { .. }));
    }

    #[tokio::test]
    async fn cache_roundtrip_avoids_reembedding() {
        let ctx = setup_discovery().await;
        register_fixture(&ctx.registry).await;
        ctx.discovery.rebuild().await.unwrap();

        assert!(ctx.temp_dir.path().join("cache").join(MATRIX_FILE).exists());
        assert!(ctx.temp_dir.path().join("cache").join(META_FILE).exists());

        // Fresh service over the same records dir: the cache must satisfy it.
        let (events, _rx) = create_event_channel(8);
        let registry2 = Arc::new(
            RegistryService::load(
                FileRepository::new(ctx.temp_dir.path().join("records")),
                ProxyConfigWriter::new(ctx.temp_dir.path().join("other.conf"), events.clone()),
                events.clone(),
            )
            .await
            .unwrap(),
        );
        let health2 = HealthSupervisor::new(
            registry2.clone(),
            events.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(1),
        );
        let discovery2 = DiscoveryService::new(
            Arc::new(HashEmbedder::new(256)),
            registry2,
            health2,
            ctx.temp_dir.path().join("cache"),
        );
        discovery2.load_cache_or_rebuild().await.unwrap();

        let matches = discovery2
            .intelligent_tool_finder("stock price aggregates", 3, 1, None)
            .await
            .unwrap();
        assert_eq!(matches[0].tool_name, "get_stock_aggregates");
    }

    #[tokio::test]
    async fn disabled_services_leave_the_index_on_rebuild() {
        let ctx = setup_discovery().await;
        register_fixture(&ctx.registry).await;
        ctx.discovery.rebuild().await.unwrap();

        ctx.registry
            .toggle_service("/currenttime", false)
            .await
            .unwrap();
        ctx.discovery.rebuild().await.unwrap();

        let matches = ctx
            .discovery
            .intelligent_tool_finder("current time in Tokyo timezone", 3, 5, None)
            .await
            .unwrap();
        assert!(matches.iter().all(|m| m.service_path != "/currenttime"));
    }
}
