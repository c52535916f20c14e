pub mod client;
pub mod protocol;

pub use client::{McpClient, McpClientError};
pub use protocol::{ToolDescriptor, TransportKind};
