//! Lifecycle coordination context
//!
//! Construction, activation, teardown and platform notifications all run on
//! one tokio task, fed by an unbounded channel. Commands are applied strictly
//! in arrival order, so a configuration update that arrives while another is
//! reconciling waits behind it.
//!
//! Dispatch does not go through the coordinator; callers use the shared
//! [`KitManager`] directly from any thread.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::manager::{KitManager, LifecycleNotice, ReconcileReport};

enum Command {
    UpdateKits {
        snapshot: Vec<serde_json::Value>,
        ack: Option<oneshot::Sender<ReconcileReport>>,
    },
    Notify(LifecycleNotice),
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Cloneable handle for sending work to the coordination task.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<Command>,
}

/// Start the coordination task on the current tokio runtime.
pub fn spawn(manager: Arc<KitManager>) -> (CoordinatorHandle, JoinHandle<()>) {
    let (commands, receiver) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(manager, receiver));
    (CoordinatorHandle { commands }, task)
}

async fn run(manager: Arc<KitManager>, mut receiver: mpsc::UnboundedReceiver<Command>) {
    tracing::debug!("Kit coordinator started");
    while let Some(command) = receiver.recv().await {
        match command {
            Command::UpdateKits { snapshot, ack } => {
                let report = manager.reconcile(&snapshot);
                if let Some(ack) = ack {
                    let _ = ack.send(report);
                }
            }
            Command::Notify(notice) => manager.notify(&notice),
            Command::Shutdown { ack } => {
                manager.shutdown();
                let _ = ack.send(());
                break;
            }
        }
    }
    tracing::debug!("Kit coordinator stopped");
}

impl CoordinatorHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::CoordinatorClosed)
    }

    /// Queue a configuration snapshot for reconciliation.
    pub fn update_kits(&self, snapshot: Vec<serde_json::Value>) -> Result<()> {
        self.send(Command::UpdateKits {
            snapshot,
            ack: None,
        })
    }

    /// Queue a snapshot and wait until it has been applied.
    pub async fn update_kits_and_wait(
        &self,
        snapshot: Vec<serde_json::Value>,
    ) -> Result<ReconcileReport> {
        let (ack, done) = oneshot::channel();
        self.send(Command::UpdateKits {
            snapshot,
            ack: Some(ack),
        })?;
        done.await.map_err(|_| Error::CoordinatorClosed)
    }

    /// Queue a platform lifecycle notification.
    pub fn notify(&self, notice: LifecycleNotice) -> Result<()> {
        self.send(Command::Notify(notice))
    }

    /// Tear down every kit and stop the task once earlier commands are done.
    pub async fn shutdown(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(Command::Shutdown { ack })?;
        done.await.map_err(|_| Error::CoordinatorClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::host::StaticHost;
    use crate::kit::KitFactory;
    use crate::kits::recording::RecordingKit;
    use crate::manager::KitSignal;
    use crate::reporting::MemorySink;
    use crate::types::Capability;
    use serde_json::json;

    fn manager_with_kits(ids: &[i32]) -> Arc<KitManager> {
        let mut factory = KitFactory::new();
        for id in ids {
            let kit = Arc::new(RecordingKit::new(*id, Capability::all_bits()));
            RecordingKit::register(&mut factory, kit);
        }
        Arc::new(KitManager::new(
            factory,
            Arc::new(StaticHost::new()),
            Arc::new(MemorySink::new()),
            &EngineConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_updates_apply_in_arrival_order() {
        let manager = manager_with_kits(&[1, 2]);
        let mut signals = manager.subscribe();
        let (handle, task) = spawn(Arc::clone(&manager));

        handle.update_kits(vec![json!({"id": 1})]).unwrap();
        handle.update_kits(vec![json!({"id": 2})]).unwrap();
        let report = handle
            .update_kits_and_wait(vec![json!({"id": 2})])
            .await
            .unwrap();

        assert!(report.created.is_empty());
        assert_eq!(report.updated, vec![2]);
        assert_eq!(manager.active_kit_ids(), vec![2]);

        assert_eq!(signals.recv().await.unwrap(), KitSignal::Activated(1));
        assert_eq!(signals.recv().await.unwrap(), KitSignal::Activated(2));
        assert_eq!(signals.recv().await.unwrap(), KitSignal::Deactivated(1));

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_and_closes() {
        let manager = manager_with_kits(&[1]);
        let (handle, task) = spawn(Arc::clone(&manager));

        handle.update_kits_and_wait(vec![json!({"id": 1})]).await.unwrap();
        assert!(manager.is_kit_active(1));

        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(manager.active_kit_ids().is_empty());
        assert!(matches!(
            handle.update_kits(vec![]),
            Err(Error::CoordinatorClosed)
        ));
    }
}
