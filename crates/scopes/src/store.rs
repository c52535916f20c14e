//! Durable store for the scope-policy document.
//!
//! Single writer, many readers. Readers take a lock-free snapshot; every
//! mutation rebuilds the document, persists it atomically to each replica
//! path in order, and only then publishes the new snapshot.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};
use utoipa::ToSchema;

use shared::error::CommonError;
use shared::events::{GatewayEvent, GatewayEventRx, GatewayEventTx, publish};

use crate::logic::{STANDARD_METHODS, ScopePolicy, ServerPermission, WILDCARD};

/// What a caller wants attached when a server joins groups. The caller
/// resolves the tool list from the registry; the store does not reach back
/// into it (references are by name, never by ownership).
#[derive(Debug, Clone)]
pub struct ServerGrant {
    pub server_name: String,
    /// Current tool inventory; empty falls back to the wildcard.
    pub tools: Vec<String>,
    /// Whether the registry currently knows this server.
    pub known_service: bool,
}

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct MutationReport {
    pub changed_groups: Vec<String>,
    pub unknown_groups: Vec<String>,
    /// Set when the grant referenced a server the registry does not know.
    /// The mutation still applies; the reference is dangling, not fatal.
    pub dangling_server: bool,
}

pub struct ScopePolicyStore {
    snapshot: ArcSwap<ScopePolicy>,
    write_lock: Mutex<()>,
    paths: Vec<PathBuf>,
    events: GatewayEventTx,
}

impl ScopePolicyStore {
    /// Load the document from the first replica that exists, or bootstrap a
    /// fresh one. An existing but unparseable or invariant-violating
    /// document is corruption and aborts boot.
    pub async fn load_or_bootstrap(
        paths: Vec<PathBuf>,
        events: GatewayEventTx,
    ) -> Result<Self, CommonError> {
        if paths.is_empty() {
            return Err(CommonError::Config {
                msg: "at least one scope-policy path is required".to_string(),
                source: None,
            });
        }

        let existing = paths.iter().find(|p| p.exists());
        let policy = match existing {
            Some(path) => {
                let raw = tokio::fs::read_to_string(path).await?;
                let policy: ScopePolicy =
                    serde_yaml::from_str(&raw).map_err(|e| CommonError::Corruption {
                        msg: format!("scope policy does not parse: {e}"),
                        path: path.display().to_string(),
                        source: Some(e.into()),
                    })?;
                policy
                    .check_invariants()
                    .map_err(|msg| CommonError::Corruption {
                        msg,
                        path: path.display().to_string(),
                        source: None,
                    })?;
                info!(path = %path.display(), "loaded scope policy");
                policy
            }
            None => {
                let policy = ScopePolicy::bootstrap();
                persist_all(&paths, &policy).await?;
                info!("no scope policy found, bootstrapped defaults");
                policy
            }
        };

        Ok(Self {
            snapshot: ArcSwap::from_pointee(policy),
            write_lock: Mutex::new(()),
            paths,
            events,
        })
    }

    /// Cheap immutable view. Never blocks, never observes a partial write.
    pub fn snapshot(&self) -> Arc<ScopePolicy> {
        self.snapshot.load_full()
    }

    pub async fn create_group(&self, name: &str) -> Result<(), CommonError> {
        if name.trim().is_empty() {
            return Err(CommonError::validation_field("name", "group name is empty"));
        }
        let name = name.to_string();
        self.mutate(move |policy| {
            if policy.groups.contains_key(&name) {
                return Err(CommonError::Conflict {
                    msg: format!("group '{name}' already exists"),
                    source: None,
                });
            }
            policy.groups.insert(name, Vec::new());
            Ok(())
        })
        .await
    }

    pub async fn delete_group(&self, name: &str) -> Result<(), CommonError> {
        let name = name.to_string();
        self.mutate(move |policy| {
            if ScopePolicy::is_protected_group(&name) {
                return Err(CommonError::validation_field(
                    "name",
                    format!("group '{name}' is a protected default and cannot be deleted"),
                ));
            }
            if policy.groups.remove(&name).is_none() {
                return Err(CommonError::NotFound {
                    msg: format!("group '{name}' does not exist"),
                    lookup_id: name,
                    source: None,
                });
            }
            Ok(())
        })
        .await
    }

    /// Add a server to each named group with the standard method set and the
    /// grant's tool list. Idempotent per (group, server): an existing entry
    /// for the server is replaced, never duplicated.
    pub async fn add_server_to_groups(
        &self,
        grant: ServerGrant,
        groups: &[String],
    ) -> Result<MutationReport, CommonError> {
        let groups = groups.to_vec();
        self.mutate(move |policy| {
            let mut report = MutationReport {
                dangling_server: !grant.known_service,
                ..Default::default()
            };

            let tools = if grant.tools.is_empty() {
                vec![WILDCARD.to_string()]
            } else {
                grant.tools.clone()
            };
            let permission = ServerPermission {
                server: grant.server_name.clone(),
                methods: STANDARD_METHODS.iter().map(|m| m.to_string()).collect(),
                tools: Some(tools),
            };

            for group in &groups {
                match policy.groups.get_mut(group) {
                    Some(entries) => {
                        entries.retain(|p| p.server != grant.server_name);
                        entries.push(permission.clone());
                        report.changed_groups.push(group.clone());
                    }
                    None => report.unknown_groups.push(group.clone()),
                }
            }

            if report.dangling_server {
                warn!(
                    server = %grant.server_name,
                    "granting scopes for a server the registry does not know"
                );
            }

            Ok(report)
        })
        .await
    }

    /// Remove a server's entries from each named group. Idempotent.
    pub async fn remove_server_from_groups(
        &self,
        server_name: &str,
        groups: &[String],
    ) -> Result<MutationReport, CommonError> {
        let server_name = server_name.to_string();
        let groups = groups.to_vec();
        self.mutate(move |policy| {
            let mut report = MutationReport::default();
            for group in &groups {
                match policy.groups.get_mut(group) {
                    Some(entries) => {
                        let before = entries.len();
                        entries.retain(|p| p.server != server_name);
                        if entries.len() != before {
                            report.changed_groups.push(group.clone());
                        }
                    }
                    None => report.unknown_groups.push(group.clone()),
                }
            }
            Ok(report)
        })
        .await
    }

    /// Drop every reference to a removed service, across all groups. Matches
    /// by path or display name, the two forms entries may use.
    pub async fn purge_server(&self, path: &str, server_name: &str) -> Result<(), CommonError> {
        let path = path.to_string();
        let server_name = server_name.to_string();
        self.mutate(move |policy| {
            for entries in policy.groups.values_mut() {
                entries.retain(|p| p.server != path && p.server != server_name);
            }
            Ok(())
        })
        .await
    }

    async fn mutate<R, F>(&self, f: F) -> Result<R, CommonError>
    where
        F: FnOnce(&mut ScopePolicy) -> Result<R, CommonError>,
    {
        let _guard = self.write_lock.lock().await;

        let mut next = (**self.snapshot.load()).clone();
        let result = f(&mut next)?;

        next.check_invariants().map_err(CommonError::validation)?;

        // Persist before publish: a reader must never observe a snapshot
        // that a crash could roll back.
        persist_all(&self.paths, &next).await?;
        self.snapshot.store(Arc::new(next));
        publish(&self.events, GatewayEvent::ScopesReloaded);

        Ok(result)
    }
}

async fn persist_all(paths: &[PathBuf], policy: &ScopePolicy) -> Result<(), CommonError> {
    let yaml = serde_yaml::to_string(policy)?;
    for path in paths {
        shared::fs::write_atomic(path, yaml.as_bytes()).await?;
    }
    Ok(())
}

/// Event listener that keeps the policy free of references to services that
/// no longer exist.
pub async fn run_scope_event_listener(
    store: Arc<ScopePolicyStore>,
    mut events: GatewayEventRx,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) -> Result<(), CommonError> {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(GatewayEvent::ServiceRemoved { path, server_name }) => {
                    if let Err(e) = store.purge_server(&path, &server_name).await {
                        warn!("failed to purge scope entries for {path}: {e}");
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("scope event listener lagged by {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown_rx.recv() => break,
        }
    }
    Ok(())
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use shared::events::create_event_channel;

    struct TestContext {
        store: ScopePolicyStore,
        paths: Vec<PathBuf>,
        #[allow(dead_code)]
        temp_dir: tempfile::TempDir,
    }

    async fn setup_store() -> TestContext {
        shared::setup_test!();

        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let paths = vec![
            temp_dir.path().join("container/scopes.yml"),
            temp_dir.path().join("host/scopes.yml"),
        ];
        let (tx, _rx) = create_event_channel(16);
        let store = ScopePolicyStore::load_or_bootstrap(paths.clone(), tx)
            .await
            .unwrap();

        TestContext {
            store,
            paths,
            temp_dir,
        }
    }

    fn grant(server: &str, tools: &[&str]) -> ServerGrant {
        ServerGrant {
            server_name: server.to_string(),
            tools: tools.iter().map(|t| t.to_string()).collect(),
            known_service: true,
        }
    }

    #[tokio::test]
    async fn bootstrap_writes_every_replica() {
        let ctx = setup_store().await;
        for path in &ctx.paths {
            let raw = std::fs::read_to_string(path).unwrap();
            let parsed: ScopePolicy = serde_yaml::from_str(&raw).unwrap();
            parsed.check_invariants().unwrap();
        }
    }

    #[tokio::test]
    async fn create_then_delete_group() {
        let ctx = setup_store().await;

        ctx.store.create_group("mcp-servers-x/read").await.unwrap();
        assert!(
            ctx.store
                .snapshot()
                .groups
                .contains_key("mcp-servers-x/read")
        );

        ctx.store.delete_group("mcp-servers-x/read").await.unwrap();
        assert!(
            !ctx.store
                .snapshot()
                .groups
                .contains_key("mcp-servers-x/read")
        );
    }

    #[tokio::test]
    async fn duplicate_group_is_a_conflict() {
        let ctx = setup_store().await;
        ctx.store.create_group("mcp-servers-x/read").await.unwrap();
        let err = ctx
            .store
            .create_group("mcp-servers-x/read")
            .await
            .unwrap_err();
        assert!(matches!(err, CommonError::Conflict { .. }));
    }

    #[tokio::test]
    async fn protected_groups_cannot_be_deleted() {
        let ctx = setup_store().await;
        let err = ctx
            .store
            .delete_group(crate::logic::GROUP_UNRESTRICTED_READ)
            .await
            .unwrap_err();
        assert!(matches!(err, CommonError::Validation { .. }));
        // Snapshot unchanged after the failed mutation.
        ctx.store.snapshot().check_invariants().unwrap();
    }

    #[tokio::test]
    async fn add_server_twice_equals_once() {
        let ctx = setup_store().await;
        ctx.store.create_group("mcp-servers-x/read").await.unwrap();
        let groups = vec!["mcp-servers-x/read".to_string()];

        ctx.store
            .add_server_to_groups(grant("/currenttime", &["current_time_by_timezone"]), &groups)
            .await
            .unwrap();
        ctx.store
            .add_server_to_groups(grant("/currenttime", &["current_time_by_timezone"]), &groups)
            .await
            .unwrap();

        let snapshot = ctx.store.snapshot();
        let entries = snapshot.groups.get("mcp-servers-x/read").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].server, "/currenttime");
        assert_eq!(
            entries[0].tools,
            Some(vec!["current_time_by_timezone".to_string()])
        );
        assert_eq!(entries[0].methods.len(), STANDARD_METHODS.len());
    }

    #[tokio::test]
    async fn unknown_groups_and_dangling_servers_are_reported() {
        let ctx = setup_store().await;
        let report = ctx
            .store
            .add_server_to_groups(
                ServerGrant {
                    server_name: "/ghost".to_string(),
                    tools: vec![],
                    known_service: false,
                },
                &["nonexistent-group".to_string()],
            )
            .await
            .unwrap();

        assert!(report.dangling_server);
        assert_eq!(report.unknown_groups, vec!["nonexistent-group".to_string()]);
        assert!(report.changed_groups.is_empty());
    }

    #[tokio::test]
    async fn remove_server_is_idempotent() {
        let ctx = setup_store().await;
        ctx.store.create_group("mcp-servers-x/read").await.unwrap();
        let groups = vec!["mcp-servers-x/read".to_string()];

        ctx.store
            .add_server_to_groups(grant("/currenttime", &[]), &groups)
            .await
            .unwrap();

        let first = ctx
            .store
            .remove_server_from_groups("/currenttime", &groups)
            .await
            .unwrap();
        assert_eq!(first.changed_groups, groups);

        let second = ctx
            .store
            .remove_server_from_groups("/currenttime", &groups)
            .await
            .unwrap();
        assert!(second.changed_groups.is_empty());
    }

    #[tokio::test]
    async fn purge_drops_references_across_all_groups() {
        let ctx = setup_store().await;
        ctx.store.create_group("mcp-servers-a/read").await.unwrap();
        ctx.store.create_group("mcp-servers-b/read").await.unwrap();
        for g in ["mcp-servers-a/read", "mcp-servers-b/read"] {
            ctx.store
                .add_server_to_groups(grant("/currenttime", &[]), &[g.to_string()])
                .await
                .unwrap();
        }

        ctx.store
            .purge_server("/currenttime", "Current Time")
            .await
            .unwrap();

        let snapshot = ctx.store.snapshot();
        for g in ["mcp-servers-a/read", "mcp-servers-b/read"] {
            assert!(snapshot.groups.get(g).unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn corrupt_document_aborts_load() {
        shared::setup_test!();
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("scopes.yml");
        std::fs::write(&path, "groups: [unbalanced").unwrap();

        let (tx, _rx) = create_event_channel(4);
        let err = ScopePolicyStore::load_or_bootstrap(vec![path], tx)
            .await
            .unwrap_err();
        assert!(matches!(err, CommonError::Corruption { .. }));
    }

    #[tokio::test]
    async fn concurrent_mutations_never_tear_the_document() {
        let ctx = setup_store().await;
        let store = std::sync::Arc::new(ctx.store);

        let mut writers = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            writers.push(tokio::spawn(async move {
                store
                    .create_group(&format!("mcp-servers-{i}/read"))
                    .await
                    .unwrap();
            }));
        }
        // A reader racing the writers must always observe a well-formed
        // document whose group set is a prefix of the mutation history.
        for _ in 0..50 {
            let snapshot = store.snapshot();
            snapshot.check_invariants().unwrap();
            tokio::task::yield_now().await;
        }
        for writer in writers {
            writer.await.unwrap();
        }

        let snapshot = store.snapshot();
        for i in 0..8 {
            assert!(snapshot.groups.contains_key(&format!("mcp-servers-{i}/read")));
        }

        // Disk agrees with the final snapshot on every replica.
        for path in &ctx.paths {
            let on_disk: ScopePolicy =
                serde_yaml::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
            assert_eq!(on_disk, *snapshot);
        }
    }

    #[tokio::test]
    async fn replicas_stay_in_lockstep_after_mutations() {
        let ctx = setup_store().await;
        ctx.store.create_group("mcp-servers-x/read").await.unwrap();

        let a = std::fs::read_to_string(&ctx.paths[0]).unwrap();
        let b = std::fs::read_to_string(&ctx.paths[1]).unwrap();
        assert_eq!(a, b);
        assert!(a.contains("mcp-servers-x/read"));
    }
}
