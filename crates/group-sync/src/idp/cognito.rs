//! Cognito user-pool administration through the AWS SDK.

use async_trait::async_trait;

use shared::error::CommonError;

use crate::idp::{CreatedServiceAccount, IdpAdminClient, IdpGroup};

pub struct CognitoAdminClient {
    client: aws_sdk_cognitoidentityprovider::Client,
    user_pool_id: String,
}

impl CognitoAdminClient {
    /// Credentials and region come from the ambient AWS environment
    /// (instance role, env vars, or shared config).
    pub async fn from_env(user_pool_id: impl Into<String>) -> Self {
        let config = aws_config::load_from_env().await;
        Self {
            client: aws_sdk_cognitoidentityprovider::Client::new(&config),
            user_pool_id: user_pool_id.into(),
        }
    }

    pub fn new(
        client: aws_sdk_cognitoidentityprovider::Client,
        user_pool_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            user_pool_id: user_pool_id.into(),
        }
    }
}

#[async_trait]
impl IdpAdminClient for CognitoAdminClient {
    async fn create_group(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<(), CommonError> {
        let result = self
            .client
            .create_group()
            .user_pool_id(&self.user_pool_id)
            .group_name(name)
            .set_description(description.map(str::to_string))
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_group_exists_exception() {
                    Err(CommonError::Conflict {
                        msg: format!("Cognito group '{name}' already exists"),
                        source: None,
                    })
                } else {
                    Err(CommonError::Upstream {
                        msg: format!("Cognito group '{name}' creation failed"),
                        source: Some(anyhow::Error::new(service_error)),
                    })
                }
            }
        }
    }

    async fn delete_group(&self, name: &str) -> Result<(), CommonError> {
        let result = self
            .client
            .delete_group()
            .user_pool_id(&self.user_pool_id)
            .group_name(name)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_resource_not_found_exception() {
                    Ok(())
                } else {
                    Err(CommonError::Upstream {
                        msg: format!("Cognito group '{name}' deletion failed"),
                        source: Some(anyhow::Error::new(service_error)),
                    })
                }
            }
        }
    }

    async fn list_groups(&self) -> Result<Vec<IdpGroup>, CommonError> {
        let mut groups = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let page = self
                .client
                .list_groups()
                .user_pool_id(&self.user_pool_id)
                .set_next_token(next_token)
                .send()
                .await
                .map_err(|e| CommonError::Upstream {
                    msg: "Cognito group listing failed".to_string(),
                    source: Some(anyhow::Error::new(e.into_service_error())),
                })?;

            for group in page.groups() {
                if let Some(name) = group.group_name() {
                    groups.push(IdpGroup {
                        name: name.to_string(),
                        description: group.description().map(str::to_string),
                    });
                }
            }

            next_token = page.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        Ok(groups)
    }

    async fn create_service_account(
        &self,
        name: &str,
        _groups: &[String],
        _description: Option<&str>,
    ) -> Result<CreatedServiceAccount, CommonError> {
        // Cognito machine identities are app clients with a generated
        // secret. App clients cannot join pool groups, so their access
        // rides on the scope policy alone.
        let created = self
            .client
            .create_user_pool_client()
            .user_pool_id(&self.user_pool_id)
            .client_name(name)
            .generate_secret(true)
            .send()
            .await
            .map_err(|e| CommonError::Upstream {
                msg: format!("Cognito app client '{name}' creation failed"),
                source: Some(anyhow::Error::new(e.into_service_error())),
            })?;

        let client = created.user_pool_client().ok_or_else(|| {
            CommonError::upstream("Cognito returned no client representation")
        })?;

        Ok(CreatedServiceAccount {
            client_id: client.client_id().unwrap_or_default().to_string(),
            client_secret: client.client_secret().unwrap_or_default().to_string(),
            assigned_groups: Vec::new(),
        })
    }
}
