//! One MCP probe against one service: handshake, tool listing, latency.

use std::time::{Duration, Instant};

use http::{HeaderMap, HeaderName, HeaderValue};
use mcp::client::McpClient;
use mcp::protocol::ToolDescriptor;
use registry::ServiceRecord;
use tracing::debug;
use url::Url;

/// What a single probe observed.
#[derive(Debug)]
pub enum ProbeOutcome {
    Success {
        tools: Vec<ToolDescriptor>,
        latency_ms: u64,
    },
    /// Reachable, but the backend rejected our credentials.
    AuthExpired { latency_ms: u64, error: String },
    Failure { latency_ms: u64, error: String },
}

pub async fn probe_service(record: &ServiceRecord, timeout: Duration) -> ProbeOutcome {
    let started = Instant::now();
    let elapsed = |s: Instant| s.elapsed().as_millis() as u64;

    let base_url = match Url::parse(&record.proxy_pass_url) {
        Ok(url) => url,
        Err(e) => {
            return ProbeOutcome::Failure {
                latency_ms: elapsed(started),
                error: format!("record URL does not parse: {e}"),
            };
        }
    };

    let mut client = match McpClient::new(
        &base_url,
        record.probe_transport(),
        static_headers(record),
        timeout,
    ) {
        Ok(client) => client,
        Err(e) => {
            return ProbeOutcome::Failure {
                latency_ms: elapsed(started),
                error: e.to_string(),
            };
        }
    };

    match client.handshake_and_list_tools().await {
        Ok((init, tools)) => {
            debug!(
                path = %record.path,
                protocol = %init.protocol_version,
                tools = tools.len(),
                "probe succeeded"
            );
            ProbeOutcome::Success {
                tools,
                latency_ms: elapsed(started),
            }
        }
        Err(e) if e.is_auth_rejection() => ProbeOutcome::AuthExpired {
            latency_ms: elapsed(started),
            error: e.to_string(),
        },
        Err(e) => ProbeOutcome::Failure {
            latency_ms: elapsed(started),
            error: e.to_string(),
        },
    }
}

/// The record's static header injections also apply to probes, so a backend
/// keyed on an API header sees the same traffic shape as proxied requests.
fn static_headers(record: &ServiceRecord) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for spec in &record.headers {
        let Ok(name) = spec.name.parse::<HeaderName>() else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(&spec.value) else {
            continue;
        };
        headers.insert(name, value);
    }
    headers
}
