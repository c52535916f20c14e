pub mod logic;
pub mod store;

pub use logic::{ScopePolicy, ServerPermission, UiScope};
pub use store::ScopePolicyStore;
