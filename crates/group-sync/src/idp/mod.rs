//! IdP administration seam. The sync service works against this trait;
//! Keycloak and Cognito provide the real implementations.

pub mod cognito;
pub mod keycloak;

use async_trait::async_trait;

use shared::error::CommonError;

#[derive(Debug, Clone, PartialEq)]
pub struct IdpGroup {
    pub name: String,
    pub description: Option<String>,
}

/// A provisioned machine credential. The secret leaves this struct exactly
/// once, in the creation response.
#[derive(Debug, Clone)]
pub struct CreatedServiceAccount {
    pub client_id: String,
    pub client_secret: String,
    /// Groups actually assigned in the IdP; providers that cannot put
    /// service accounts into groups return an empty list.
    pub assigned_groups: Vec<String>,
}

#[async_trait]
pub trait IdpAdminClient: Send + Sync {
    /// Create a group; `Conflict` when it already exists.
    async fn create_group(&self, name: &str, description: Option<&str>)
    -> Result<(), CommonError>;

    /// Delete a group; deleting an absent group is not an error.
    async fn delete_group(&self, name: &str) -> Result<(), CommonError>;

    async fn list_groups(&self) -> Result<Vec<IdpGroup>, CommonError>;

    /// Create a machine credential and, where the provider supports it,
    /// assign its service account to the given groups.
    async fn create_service_account(
        &self,
        name: &str,
        groups: &[String],
        description: Option<&str>,
    ) -> Result<CreatedServiceAccount, CommonError>;
}
