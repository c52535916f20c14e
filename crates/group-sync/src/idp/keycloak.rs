//! Keycloak realm administration over the admin REST API, authenticated
//! with a confidential admin client via client credentials.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use identity::logic::config::KeycloakConfig;
use shared::error::CommonError;

use crate::idp::{CreatedServiceAccount, IdpAdminClient, IdpGroup};

const ADMIN_CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct KeycloakAdminClient {
    http: reqwest::Client,
    config: KeycloakConfig,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Debug, Deserialize)]
struct GroupRepresentation {
    id: String,
    name: String,
    #[serde(default)]
    attributes: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ClientRepresentation {
    id: String,
    #[serde(rename = "clientId")]
    client_id: String,
}

impl KeycloakAdminClient {
    pub fn new(config: KeycloakConfig) -> Result<Self, CommonError> {
        if config.admin_client_id.is_none() || config.admin_client_secret.is_none() {
            return Err(CommonError::Config {
                msg: "Keycloak group sync requires KEYCLOAK_ADMIN_CLIENT_ID and KEYCLOAK_ADMIN_CLIENT_SECRET".to_string(),
                source: None,
            });
        }
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            config,
            token: Mutex::new(None),
        })
    }

    /// Admin access token, cached until shortly before expiry.
    async fn admin_token(&self) -> Result<String, CommonError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.token.clone());
            }
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: u64,
        }

        let client_id = self.config.admin_client_id.as_deref().unwrap_or_default();
        let client_secret = self.config.admin_client_secret.as_deref().unwrap_or_default();

        let response = self
            .http
            .post(self.config.token_endpoint())
            .timeout(ADMIN_CALL_TIMEOUT)
            .basic_auth(client_id, Some(client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?
            .error_for_status()
            .map_err(|e| CommonError::Upstream {
                msg: "Keycloak admin token request rejected".to_string(),
                source: Some(e.into()),
            })?;

        let token: TokenResponse = response.json().await.map_err(|e| CommonError::Upstream {
            msg: "Keycloak token response did not parse".to_string(),
            source: Some(e.into()),
        })?;

        let entry = CachedToken {
            token: token.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(token.expires_in.saturating_sub(60)),
        };
        *cached = Some(entry);
        Ok(token.access_token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, CommonError> {
        let token = self.admin_token().await?;
        let response = self
            .http
            .get(url)
            .timeout(ADMIN_CALL_TIMEOUT)
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| CommonError::Upstream {
                msg: format!("Keycloak admin GET {url} failed"),
                source: Some(e.into()),
            })?;
        response.json().await.map_err(|e| CommonError::Upstream {
            msg: format!("Keycloak admin GET {url} returned an unparseable body"),
            source: Some(e.into()),
        })
    }

    async fn find_group(&self, name: &str) -> Result<Option<GroupRepresentation>, CommonError> {
        let url = format!(
            "{}/groups?search={}&exact=true",
            self.config.admin_base(),
            urlencoding_encode(name)
        );
        let groups: Vec<GroupRepresentation> = self.get_json(&url).await?;
        Ok(groups.into_iter().find(|g| g.name == name))
    }
}

#[async_trait]
impl IdpAdminClient for KeycloakAdminClient {
    async fn create_group(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<(), CommonError> {
        let token = self.admin_token().await?;
        let mut body = json!({ "name": name });
        if let Some(description) = description {
            body["attributes"] = json!({ "description": [description] });
        }

        let response = self
            .http
            .post(format!("{}/groups", self.config.admin_base()))
            .timeout(ADMIN_CALL_TIMEOUT)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => Ok(()),
            reqwest::StatusCode::CONFLICT => Err(CommonError::Conflict {
                msg: format!("Keycloak group '{name}' already exists"),
                source: None,
            }),
            s => Err(CommonError::upstream(format!(
                "Keycloak group creation failed with {s}: {}",
                response.text().await.unwrap_or_default()
            ))),
        }
    }

    async fn delete_group(&self, name: &str) -> Result<(), CommonError> {
        let Some(group) = self.find_group(name).await? else {
            debug!(name, "Keycloak group already absent");
            return Ok(());
        };

        let token = self.admin_token().await?;
        self.http
            .delete(format!("{}/groups/{}", self.config.admin_base(), group.id))
            .timeout(ADMIN_CALL_TIMEOUT)
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| CommonError::Upstream {
                msg: format!("Keycloak group '{name}' deletion failed"),
                source: Some(e.into()),
            })?;
        Ok(())
    }

    async fn list_groups(&self) -> Result<Vec<IdpGroup>, CommonError> {
        let url = format!("{}/groups?max=1000", self.config.admin_base());
        let groups: Vec<GroupRepresentation> = self.get_json(&url).await?;
        Ok(groups
            .into_iter()
            .map(|g| IdpGroup {
                description: g
                    .attributes
                    .as_ref()
                    .and_then(|a| a.get("description"))
                    .and_then(|d| d.get(0))
                    .and_then(|d| d.as_str())
                    .map(str::to_string),
                name: g.name,
            })
            .collect())
    }

    async fn create_service_account(
        &self,
        name: &str,
        groups: &[String],
        description: Option<&str>,
    ) -> Result<CreatedServiceAccount, CommonError> {
        let token = self.admin_token().await?;
        let base = self.config.admin_base();

        // Confidential client with service accounts enabled.
        let body = json!({
            "clientId": name,
            "description": description,
            "publicClient": false,
            "serviceAccountsEnabled": true,
            "standardFlowEnabled": false,
            "directAccessGrantsEnabled": false,
        });
        let response = self
            .http
            .post(format!("{base}/clients"))
            .timeout(ADMIN_CALL_TIMEOUT)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::CONFLICT {
            return Err(CommonError::Conflict {
                msg: format!("Keycloak client '{name}' already exists"),
                source: None,
            });
        }
        response.error_for_status_ref().map_err(|e| CommonError::Upstream {
            msg: format!("Keycloak client '{name}' creation failed"),
            source: Some(e.into()),
        })?;

        let clients: Vec<ClientRepresentation> = self
            .get_json(&format!("{base}/clients?clientId={}", urlencoding_encode(name)))
            .await?;
        let client = clients
            .into_iter()
            .find(|c| c.client_id == name)
            .ok_or_else(|| CommonError::upstream("created client not found on readback"))?;

        #[derive(Deserialize)]
        struct SecretRepresentation {
            value: String,
        }
        let secret: SecretRepresentation = self
            .get_json(&format!("{base}/clients/{}/client-secret", client.id))
            .await?;

        // Put the backing service-account user into the groups so its
        // tokens carry them.
        #[derive(Deserialize)]
        struct UserRepresentation {
            id: String,
        }
        let user: UserRepresentation = self
            .get_json(&format!("{base}/clients/{}/service-account-user", client.id))
            .await?;

        let mut assigned = Vec::new();
        for group_name in groups {
            let Some(group) = self.find_group(group_name).await? else {
                continue;
            };
            let token = self.admin_token().await?;
            let put = self
                .http
                .put(format!("{base}/users/{}/groups/{}", user.id, group.id))
                .timeout(ADMIN_CALL_TIMEOUT)
                .bearer_auth(token)
                .send()
                .await?;
            if put.status().is_success() {
                assigned.push(group_name.clone());
            }
        }

        Ok(CreatedServiceAccount {
            client_id: name.to_string(),
            client_secret: secret.value,
            assigned_groups: assigned,
        })
    }
}

fn urlencoding_encode(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}
