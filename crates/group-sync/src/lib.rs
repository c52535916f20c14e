pub mod idp;
pub mod service;

pub use idp::IdpAdminClient;
pub use service::GroupSyncService;
