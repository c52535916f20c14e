pub mod probe;
pub mod supervisor;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use shared::events::HealthState;

/// Supervisor's view of one service.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthReport {
    pub status: HealthState,
    pub last_checked: DateTime<Utc>,
    pub num_tools: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Last failure message; cleared on a successful probe.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    pub fn unknown() -> Self {
        Self {
            status: HealthState::Unknown,
            last_checked: Utc::now(),
            num_tools: 0,
            latency_ms: None,
            error: None,
        }
    }
}
