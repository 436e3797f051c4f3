//! Asynchronous completion task
//!
//! Plays the role of a bus driver's interrupt path: it receives the ids of
//! transactions the [`VirtualBus`](crate::VirtualBus) accepted as pending
//! and, after a simulated transfer delay, reports them done to the
//! scheduler from its own task.

use std::sync::Arc;
use std::time::Duration;

use mcp_txnq::{TxnId, TxnScheduler, TxnStatus};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info};

/// Commands accepted by the completion task
#[derive(Debug, Clone)]
pub enum CompletionCommand {
    /// Change the simulated transfer delay
    SetLatency(Duration),
    /// Fail every following completion with `TxnStatus::Error`
    SetFailing(bool),
    /// Stop the task
    Shutdown,
}

/// Run the completion task until shutdown or until the bus side goes away
pub async fn run_completion_task(
    scheduler: Arc<TxnScheduler>,
    mut pending_rx: mpsc::UnboundedReceiver<TxnId>,
    mut cmd_rx: mpsc::Receiver<CompletionCommand>,
    mut latency: Duration,
) {
    let mut failing = false;
    info!("Starting bus completion task ({:?} latency)", latency);

    loop {
        tokio::select! {
            id = pending_rx.recv() => {
                let Some(id) = id else {
                    debug!("Bus side closed; completion task exiting");
                    break;
                };
                if !latency.is_zero() {
                    sleep(latency).await;
                }
                let status = if failing { TxnStatus::Error } else { TxnStatus::Complete };
                debug!("Completing {} as {:?}", id, status);
                scheduler.txn_done(id, status);
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(CompletionCommand::SetLatency(d)) => latency = d,
                    Some(CompletionCommand::SetFailing(f)) => failing = f,
                    Some(CompletionCommand::Shutdown) | None => {
                        info!("Bus completion task shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Spawn the completion task on the current runtime
pub fn spawn_completion_task(
    scheduler: Arc<TxnScheduler>,
    pending_rx: mpsc::UnboundedReceiver<TxnId>,
    latency: Duration,
) -> (mpsc::Sender<CompletionCommand>, tokio::task::JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let handle = tokio::spawn(run_completion_task(scheduler, pending_rx, cmd_rx, latency));
    (cmd_tx, handle)
}
