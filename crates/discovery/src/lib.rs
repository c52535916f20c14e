pub mod logic;
pub mod service;

pub use logic::embedder::{Embedder, HashEmbedder, HttpEmbedder};
pub use logic::index::{ToolIndex, ToolMatch};
pub use service::DiscoveryService;
