use tokio::sync::oneshot;
use tracing::{error, info};

use crate::error::CommonError;

/// Completion handle for a spawned background subsystem (health supervisor,
/// index rebuilder, proxy-reload adapter, ...). Subsystems watch the
/// process-wide shutdown broadcast themselves; the owner holds these handles
/// and awaits them during the drain window before exiting.
pub struct SubsystemHandle {
    name: String,
    done_rx: oneshot::Receiver<()>,
}

impl SubsystemHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolve once the subsystem has fully stopped.
    pub async fn wait_for_shutdown(self) {
        match self.done_rx.await {
            Ok(()) => info!("{} subsystem stopped gracefully", self.name),
            Err(_) => error!("{} subsystem stopped without signaling completion", self.name),
        }
    }
}

/// Spawn a subsystem task. The task is expected to observe the shutdown
/// broadcast it was handed at construction and return once drained; an
/// `Err` return is logged, never propagated.
pub fn spawn_subsystem<F>(name: impl Into<String>, task: F) -> SubsystemHandle
where
    F: futures::Future<Output = Result<(), CommonError>> + Send + 'static,
{
    let name = name.into();
    let (done_tx, done_rx) = oneshot::channel();

    let task_name = name.clone();
    tokio::spawn(async move {
        match task.await {
            Ok(()) => info!("{task_name}: stopped gracefully"),
            Err(e) => error!("{task_name} stopped with error: {e:?}"),
        }
        let _ = done_tx.send(());
    });

    SubsystemHandle { name, done_rx }
}
