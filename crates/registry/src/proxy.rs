//! Derived reverse-proxy configuration.
//!
//! The gateway does not move proxied bytes itself; an off-the-shelf reverse
//! proxy does, driven by a config fragment this module materializes. Every
//! registry mutation regenerates the fragment; a small adapter task turns the
//! resulting `ProxyReload` events into the operator-configured reload
//! command.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use tracing::{error, info, warn};

use shared::error::CommonError;
use shared::events::{GatewayEvent, GatewayEventRx, GatewayEventTx, publish};

use crate::logic::{HeaderSpec, ServiceRecord};

/// One route binding in the fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyRoute {
    pub path_prefix: String,
    pub upstream_url: String,
    pub inject_headers: Vec<HeaderSpec>,
    pub auth_mode: String,
}

/// Routes for every enabled record, longest prefix first so the proxy's
/// first match wins deterministically.
pub fn routes_from_records<'a>(
    records: impl Iterator<Item = &'a ServiceRecord>,
) -> Vec<ProxyRoute> {
    let mut routes: Vec<ProxyRoute> = records
        .filter(|r| r.enabled)
        .map(|r| ProxyRoute {
            path_prefix: r.path.clone(),
            upstream_url: r.proxy_pass_url.clone(),
            inject_headers: r.headers.clone(),
            auth_mode: r.auth_provider.as_str().to_string(),
        })
        .collect();
    routes.sort_by(|a, b| {
        b.path_prefix
            .len()
            .cmp(&a.path_prefix.len())
            .then_with(|| a.path_prefix.cmp(&b.path_prefix))
    });
    routes
}

/// Render the nginx-style fragment. Output is deterministic for a given
/// record set so repeated regenerations are byte-identical.
pub fn render_fragment(routes: &[ProxyRoute]) -> String {
    let mut out = String::from("# generated by mcpgw - do not edit\n");
    for route in routes {
        out.push_str(&format!("\n# auth_mode: {}\n", route.auth_mode));
        out.push_str(&format!("location {} {{\n", route.path_prefix));
        out.push_str("    auth_request /validate;\n");
        out.push_str("    auth_request_set $principal_id $upstream_http_x_principal_id;\n");
        out.push_str("    auth_request_set $principal_groups $upstream_http_x_principal_groups;\n");
        out.push_str("    proxy_set_header X-Principal-Id $principal_id;\n");
        out.push_str("    proxy_set_header X-Principal-Groups $principal_groups;\n");
        for header in &route.inject_headers {
            out.push_str(&format!(
                "    proxy_set_header {} \"{}\";\n",
                header.name, header.value
            ));
        }
        // SSE/streamable responses must not be buffered, and the MCP session
        // header has to survive both directions.
        out.push_str("    proxy_http_version 1.1;\n");
        out.push_str("    proxy_buffering off;\n");
        out.push_str("    proxy_set_header Connection \"\";\n");
        out.push_str(&format!("    proxy_pass {};\n", route.upstream_url));
        out.push_str("}\n");
    }
    out
}

#[derive(Clone)]
pub struct ProxyConfigWriter {
    path: PathBuf,
    events: GatewayEventTx,
}

impl ProxyConfigWriter {
    pub fn new(path: impl Into<PathBuf>, events: GatewayEventTx) -> Self {
        Self {
            path: path.into(),
            events,
        }
    }

    /// Regenerate and signal a reload. Callers hold the registry write lock,
    /// so observers never see a fragment from a half-applied mutation.
    pub async fn regenerate(
        &self,
        records: &BTreeMap<String, ServiceRecord>,
    ) -> Result<(), CommonError> {
        let routes = routes_from_records(records.values());
        let fragment = render_fragment(&routes);
        shared::fs::write_atomic(&self.path, fragment.as_bytes()).await?;
        info!(routes = routes.len(), path = %self.path.display(), "proxy config regenerated");
        publish(&self.events, GatewayEvent::ProxyReload);
        Ok(())
    }
}

/// Adapter turning `ProxyReload` events into the configured reload command.
/// Failures are logged; the next regeneration converges the proxy.
pub async fn run_proxy_reload_adapter(
    reload_cmd: Option<String>,
    mut events: GatewayEventRx,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) -> Result<(), CommonError> {
    let Some(cmd) = reload_cmd else {
        info!("no proxy reload command configured, reload events will be ignored");
        loop {
            tokio::select! {
                event = events.recv() => {
                    if matches!(event, Err(tokio::sync::broadcast::error::RecvError::Closed)) {
                        return Ok(());
                    }
                }
                _ = shutdown_rx.recv() => return Ok(()),
            }
        }
    };

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(GatewayEvent::ProxyReload) => {
                    if let Err(e) = signal_reload(&cmd).await {
                        error!("proxy reload failed: {e}");
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    // A reload is idempotent; one catch-up run covers the gap.
                    warn!("reload adapter lagged by {n} events, reloading once");
                    if let Err(e) = signal_reload(&cmd).await {
                        error!("proxy reload failed: {e}");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            },
            _ = shutdown_rx.recv() => return Ok(()),
        }
    }
}

async fn signal_reload(cmd: &str) -> Result<(), CommonError> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        return Err(CommonError::upstream(format!(
            "reload command exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    info!("proxy reload signalled");
    Ok(())
}
