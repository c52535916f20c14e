//! Builds the fully wired [`ApiService`] from startup configuration.

use std::sync::Arc;

use tracing::{debug, info, trace};

use discovery::logic::embedder::{Embedder, HashEmbedder, HttpEmbedder};
use discovery::DiscoveryService;
use group_sync::GroupSyncService;
use group_sync::idp::IdpAdminClient;
use group_sync::idp::cognito::CognitoAdminClient;
use group_sync::idp::keycloak::KeycloakAdminClient;
use health::HealthSupervisor;
use identity::AuthService;
use identity::service::AuthServiceConfig;
use registry::RegistryService;
use registry::proxy::ProxyConfigWriter;
use registry::repository::FileRepository;
use scopes::ScopePolicyStore;
use shared::error::CommonError;
use shared::events::create_event_channel;
use shared::identity::IdProvider;

use crate::ApiService;
use crate::config::{EmbeddingsMode, GatewayConfig};

pub async fn create_api_service(config: &GatewayConfig) -> Result<ApiService, CommonError> {
    let (events, _events_rx) = create_event_channel(256);

    trace!("loading scope policy");
    let scopes = Arc::new(
        ScopePolicyStore::load_or_bootstrap(config.scopes_paths.clone(), events.clone()).await?,
    );

    trace!("loading service records");
    let registry = Arc::new(
        RegistryService::load(
            FileRepository::new(&config.registry_dir),
            ProxyConfigWriter::new(&config.proxy_config_path, events.clone()),
            events.clone(),
        )
        .await?,
    );

    let health = HealthSupervisor::new(
        registry.clone(),
        events.clone(),
        config.health_interval,
        config.probe_timeout,
    );

    let embedder: Arc<dyn Embedder> = match config.embeddings.mode {
        EmbeddingsMode::Hash => Arc::new(HashEmbedder::new(config.embeddings.dim)),
        EmbeddingsMode::Http => {
            let url = config.embeddings.url.as_deref().ok_or_else(|| {
                CommonError::Config {
                    msg: "EMBEDDINGS_URL is required unless EMBEDDINGS_MODE=hash".to_string(),
                    source: None,
                }
            })?;
            Arc::new(HttpEmbedder::new(
                url,
                config.embeddings.model.as_str(),
                config.embeddings.dim,
            )?)
        }
    };
    let discovery = Arc::new(DiscoveryService::new(
        embedder,
        registry.clone(),
        health.clone(),
        &config.registry_dir,
    ));
    debug!("warming tool index");
    discovery.load_cache_or_rebuild().await?;

    let idp: Arc<dyn IdpAdminClient> = match config.auth_provider {
        IdProvider::Keycloak => {
            let kc = config.keycloak.clone().ok_or_else(|| CommonError::Config {
                msg: "Keycloak configuration missing".to_string(),
                source: None,
            })?;
            Arc::new(KeycloakAdminClient::new(kc)?)
        }
        IdProvider::Cognito => {
            let cg = config.cognito.clone().ok_or_else(|| CommonError::Config {
                msg: "Cognito configuration missing".to_string(),
                source: None,
            })?;
            Arc::new(CognitoAdminClient::from_env(cg.user_pool_id).await)
        }
    };
    let group_sync = Arc::new(GroupSyncService::new(
        idp,
        scopes.clone(),
        registry.clone(),
        &config.m2m_secrets_dir,
    ));

    let auth = Arc::new(AuthService::new(
        AuthServiceConfig {
            provider: config.auth_provider,
            cognito: config.cognito.clone(),
            keycloak: config.keycloak.clone(),
            external_url: config.external_url.clone(),
            session_ttl: config.session_ttl,
        },
        &config.secret_key,
        scopes.clone(),
        registry.clone(),
    )?);

    info!("api service initialized");
    Ok(ApiService {
        auth,
        registry,
        scopes,
        health,
        discovery,
        group_sync,
        events,
    })
}
