pub mod adapters;
pub mod env;
pub mod error;
pub mod events;
pub mod fs;
pub mod identity;
pub mod logging;
pub mod retry;
pub mod subsystem;
pub mod test_utils;
