pub mod logic;
pub mod proxy;
pub mod repository;

pub use logic::{AuthProvider, ServicePatch, ServiceRecord};
pub use logic::service::RegistryService;
