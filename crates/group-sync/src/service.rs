//! Keeps IdP groups and the scope policy coherent through the admin
//! mutations, with rollback on partial failure and drift markers where
//! rollback itself fails.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use registry::RegistryService;
use scopes::ScopePolicyStore;
use scopes::store::{MutationReport, ServerGrant};
use shared::error::CommonError;
use shared::retry::{BackoffPolicy, retry_with_backoff};

use crate::idp::IdpAdminClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GroupSyncState {
    Synchronized,
    IdpOnly,
    PolicyOnly,
    Drift,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct GroupRow {
    pub name: String,
    pub state: GroupSyncState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift_detail: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreatedM2mUser {
    pub client_id: String,
    /// Returned exactly once; not retrievable later.
    pub client_secret: String,
    pub assigned_groups: Vec<String>,
    pub secret_file: String,
}

pub struct GroupSyncService {
    idp: Arc<dyn IdpAdminClient>,
    scopes: Arc<ScopePolicyStore>,
    registry: Arc<RegistryService>,
    secrets_dir: PathBuf,
    backoff: BackoffPolicy,
    /// group name → human-readable description of the inconsistency.
    drift: DashMap<String, String>,
}

impl GroupSyncService {
    pub fn new(
        idp: Arc<dyn IdpAdminClient>,
        scopes: Arc<ScopePolicyStore>,
        registry: Arc<RegistryService>,
        secrets_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            idp,
            scopes,
            registry,
            secrets_dir: secrets_dir.into(),
            backoff: BackoffPolicy::default(),
            drift: DashMap::new(),
        }
    }

    /// IdP first, then policy; a policy failure rolls the IdP group back.
    pub async fn create_group(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<(), CommonError> {
        let idp = self.idp.clone();
        retry_with_backoff(self.backoff, "idp create_group", || {
            let idp = idp.clone();
            async move { idp.create_group(name, description).await }
        })
        .await?;

        if let Err(policy_err) = self.scopes.create_group(name).await {
            warn!(name, "policy create failed after IdP create, rolling back: {policy_err}");
            let idp = self.idp.clone();
            let rollback = retry_with_backoff(self.backoff, "idp rollback delete_group", || {
                let idp = idp.clone();
                async move { idp.delete_group(name).await }
            })
            .await;
            if let Err(rollback_err) = rollback {
                error!(name, "rollback failed, flagging drift: {rollback_err}");
                self.drift.insert(
                    name.to_string(),
                    format!("created in IdP but not in policy; rollback failed: {rollback_err}"),
                );
            }
            return Err(policy_err);
        }

        self.drift.remove(name);
        info!(name, "group created in IdP and policy");
        Ok(())
    }

    /// Policy first, then IdP. An IdP failure leaves the group flagged as
    /// drift; `list_groups` surfaces it until a later delete converges.
    pub async fn delete_group(&self, name: &str) -> Result<(), CommonError> {
        self.scopes.delete_group(name).await?;

        let idp = self.idp.clone();
        let result = retry_with_backoff(self.backoff, "idp delete_group", || {
            let idp = idp.clone();
            async move { idp.delete_group(name).await }
        })
        .await;

        if let Err(e) = result {
            error!(name, "IdP deletion failed after policy deletion, flagging drift: {e}");
            self.drift.insert(
                name.to_string(),
                format!("removed from policy but still present in IdP: {e}"),
            );
            return Ok(());
        }

        self.drift.remove(name);
        info!(name, "group deleted from policy and IdP");
        Ok(())
    }

    /// Pure policy mutation; the IdP is not involved. The server's current
    /// tool inventory becomes the grant's tool list.
    pub async fn add_server_to_groups(
        &self,
        server: &str,
        groups: &[String],
    ) -> Result<MutationReport, CommonError> {
        let grant = match self.registry.resolve(server).await {
            Some(record) => ServerGrant {
                server_name: record.path.clone(),
                tools: record.tool_names(),
                known_service: true,
            },
            None => ServerGrant {
                server_name: server.to_string(),
                tools: Vec::new(),
                known_service: false,
            },
        };
        self.scopes.add_server_to_groups(grant, groups).await
    }

    pub async fn remove_server_from_groups(
        &self,
        server: &str,
        groups: &[String],
    ) -> Result<MutationReport, CommonError> {
        let server_name = self
            .registry
            .resolve(server)
            .await
            .map(|r| r.path)
            .unwrap_or_else(|| server.to_string());
        self.scopes
            .remove_server_from_groups(&server_name, groups)
            .await
    }

    /// Join of IdP groups and policy groups, with sync state per row.
    pub async fn list_groups(&self) -> Result<Vec<GroupRow>, CommonError> {
        let idp = self.idp.clone();
        let idp_groups = retry_with_backoff(self.backoff, "idp list_groups", || {
            let idp = idp.clone();
            async move { idp.list_groups().await }
        })
        .await?;

        let policy = self.scopes.snapshot();
        let mut rows: Vec<GroupRow> = Vec::new();
        let mut seen = std::collections::BTreeSet::new();

        for group in &idp_groups {
            seen.insert(group.name.clone());
            let in_policy = policy.groups.contains_key(&group.name);
            let drift_detail = self.drift.get(&group.name).map(|d| d.value().clone());
            rows.push(GroupRow {
                name: group.name.clone(),
                state: if drift_detail.is_some() {
                    GroupSyncState::Drift
                } else if in_policy {
                    GroupSyncState::Synchronized
                } else {
                    GroupSyncState::IdpOnly
                },
                description: group.description.clone(),
                drift_detail,
            });
        }

        for name in policy.groups.keys() {
            if seen.contains(name) {
                continue;
            }
            let drift_detail = self.drift.get(name).map(|d| d.value().clone());
            rows.push(GroupRow {
                name: name.clone(),
                state: if drift_detail.is_some() {
                    GroupSyncState::Drift
                } else {
                    GroupSyncState::PolicyOnly
                },
                description: None,
                drift_detail,
            });
        }

        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    /// Provision a machine credential, persist it for the deployment, and
    /// hand the secret back exactly once.
    pub async fn create_m2m_user(
        &self,
        name: &str,
        groups: &[String],
        description: Option<&str>,
    ) -> Result<CreatedM2mUser, CommonError> {
        if name.trim().is_empty() {
            return Err(CommonError::validation_field("name", "name is empty"));
        }

        let idp = self.idp.clone();
        let account = retry_with_backoff(self.backoff, "idp create_service_account", || {
            let idp = idp.clone();
            let groups = groups.to_vec();
            async move {
                idp.create_service_account(name, &groups, description)
                    .await
            }
        })
        .await?;

        let secret_file = self.secrets_dir.join(format!("{name}.json"));
        let payload = serde_json::to_vec_pretty(&serde_json::json!({
            "client_id": account.client_id,
            "client_secret": account.client_secret,
            "groups": account.assigned_groups,
            "description": description,
        }))?;
        shared::fs::write_atomic(&secret_file, &payload).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&secret_file, std::fs::Permissions::from_mode(0o600))
                .await?;
        }

        info!(name, file = %secret_file.display(), "m2m credential provisioned");
        Ok(CreatedM2mUser {
            client_id: account.client_id,
            client_secret: account.client_secret,
            assigned_groups: account.assigned_groups,
            secret_file: secret_file.display().to_string(),
        })
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use crate::idp::{CreatedServiceAccount, IdpGroup};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use registry::proxy::ProxyConfigWriter;
    use registry::repository::FileRepository;
    use shared::events::create_event_channel;

    /// In-memory IdP with switchable failure injection.
    #[derive(Default)]
    struct FakeIdp {
        groups: Mutex<Vec<IdpGroup>>,
        fail_delete: Mutex<bool>,
    }

    #[async_trait]
    impl IdpAdminClient for FakeIdp {
        async fn create_group(
            &self,
            name: &str,
            description: Option<&str>,
        ) -> Result<(), CommonError> {
            let mut groups = self.groups.lock();
            if groups.iter().any(|g| g.name == name) {
                return Err(CommonError::Conflict {
                    msg: format!("group '{name}' exists"),
                    source: None,
                });
            }
            groups.push(IdpGroup {
                name: name.to_string(),
                description: description.map(str::to_string),
            });
            Ok(())
        }

        async fn delete_group(&self, name: &str) -> Result<(), CommonError> {
            if *self.fail_delete.lock() {
                return Err(CommonError::validation("idp offline"));
            }
            self.groups.lock().retain(|g| g.name != name);
            Ok(())
        }

        async fn list_groups(&self) -> Result<Vec<IdpGroup>, CommonError> {
            Ok(self.groups.lock().clone())
        }

        async fn create_service_account(
            &self,
            name: &str,
            groups: &[String],
            _description: Option<&str>,
        ) -> Result<CreatedServiceAccount, CommonError> {
            Ok(CreatedServiceAccount {
                client_id: name.to_string(),
                client_secret: "s3cr3t".to_string(),
                assigned_groups: groups.to_vec(),
            })
        }
    }

    struct TestContext {
        sync: GroupSyncService,
        idp: Arc<FakeIdp>,
        scopes: Arc<ScopePolicyStore>,
        #[allow(dead_code)]
        temp_dir: tempfile::TempDir,
    }

    async fn setup_sync() -> TestContext {
        shared::setup_test!();

        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let (events, _rx) = create_event_channel(32);

        let scopes = Arc::new(
            ScopePolicyStore::load_or_bootstrap(
                vec![temp_dir.path().join("scopes.yml")],
                events.clone(),
            )
            .await
            .unwrap(),
        );
        let registry = Arc::new(
            RegistryService::load(
                FileRepository::new(temp_dir.path().join("records")),
                ProxyConfigWriter::new(temp_dir.path().join("mcpgw.conf"), events.clone()),
                events,
            )
            .await
            .unwrap(),
        );
        registry
            .register_service(
                serde_json::from_value(serde_json::json!({
                    "path": "/currenttime",
                    "server_name": "Current Time",
                    "proxy_pass_url": "http://ct:8000/",
                    "tool_list": [
                        {"name": "current_time_by_timezone", "description": "tz", "inputSchema": {}}
                    ],
                }))
                .unwrap(),
            )
            .await
            .unwrap();

        let idp = Arc::new(FakeIdp::default());
        let sync = GroupSyncService::new(
            idp.clone(),
            scopes.clone(),
            registry,
            temp_dir.path().join("secrets"),
        );

        TestContext {
            sync,
            idp,
            scopes,
            temp_dir,
        }
    }

    #[tokio::test]
    async fn group_mutation_roundtrip() {
        let ctx = setup_sync().await;

        ctx.sync
            .create_group("mcp-servers-x/read", Some("x readers"))
            .await
            .unwrap();
        ctx.sync
            .add_server_to_groups("/currenttime", &["mcp-servers-x/read".to_string()])
            .await
            .unwrap();

        let rows = ctx.sync.list_groups().await.unwrap();
        let row = rows.iter().find(|r| r.name == "mcp-servers-x/read").unwrap();
        assert_eq!(row.state, GroupSyncState::Synchronized);

        let snapshot = ctx.scopes.snapshot();
        let entries = snapshot.groups.get("mcp-servers-x/read").unwrap();
        assert_eq!(entries[0].tools, Some(vec!["current_time_by_timezone".to_string()]));

        ctx.sync.delete_group("mcp-servers-x/read").await.unwrap();
        let rows = ctx.sync.list_groups().await.unwrap();
        assert!(rows.iter().all(|r| r.name != "mcp-servers-x/read"));
    }

    #[tokio::test]
    async fn policy_failure_rolls_back_the_idp_group() {
        let ctx = setup_sync().await;

        // Group pre-exists in policy only, so the policy step conflicts.
        ctx.scopes.create_group("mcp-servers-y/read").await.unwrap();
        let err = ctx
            .sync
            .create_group("mcp-servers-y/read", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CommonError::Conflict { .. }));

        // Rollback removed it from the IdP again.
        assert!(ctx.idp.list_groups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_idp_delete_is_reported_as_drift() {
        let ctx = setup_sync().await;
        ctx.sync.create_group("mcp-servers-z/read", None).await.unwrap();

        *ctx.idp.fail_delete.lock() = true;
        ctx.sync.delete_group("mcp-servers-z/read").await.unwrap();

        let rows = ctx.sync.list_groups().await.unwrap();
        let row = rows.iter().find(|r| r.name == "mcp-servers-z/read").unwrap();
        assert_eq!(row.state, GroupSyncState::Drift);
        assert!(row.drift_detail.is_some());
    }

    #[tokio::test]
    async fn unknown_server_grant_is_dangling_not_fatal() {
        let ctx = setup_sync().await;
        ctx.sync.create_group("mcp-servers-x/read", None).await.unwrap();

        let report = ctx
            .sync
            .add_server_to_groups("/ghost", &["mcp-servers-x/read".to_string()])
            .await
            .unwrap();
        assert!(report.dangling_server);
        assert_eq!(report.changed_groups, vec!["mcp-servers-x/read".to_string()]);
    }

    #[tokio::test]
    async fn m2m_user_secret_is_persisted_once() {
        let ctx = setup_sync().await;
        ctx.sync.create_group("mcp-servers-x/read", None).await.unwrap();

        let created = ctx
            .sync
            .create_m2m_user("ci-agent", &["mcp-servers-x/read".to_string()], Some("ci"))
            .await
            .unwrap();
        assert_eq!(created.client_secret, "s3cr3t");

        let on_disk: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(ctx.temp_dir.path().join("secrets/ci-agent.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(on_disk["client_id"], "ci-agent");
        assert_eq!(on_disk["client_secret"], "s3cr3t");
    }
}
