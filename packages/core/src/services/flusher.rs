//! Background Flush Processor
//!
//! Drains the repository's dirty set into the persistent store:
//!
//! - Woken by `create` (and by failed synchronous writes) through a
//!   cloneable [`FlushWaker`]
//! - Repeats `save()` until the dirty set is empty
//! - A failed or dropped save schedules a delayed wake after
//!   `flush.retry_delay_ms`, so nothing recorded in the dirty set is lost
//!   while the process keeps running
//! - On shutdown makes one last save attempt
//!
//! Wakes are coalesced: any number of wakes while a flush is pending result
//! in a single drain.

use crate::config::FlushConfig;
use crate::services::repository::{NoteRepository, SaveOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Handle to wake the flush processor
#[derive(Clone, Debug)]
pub struct FlushWaker {
    trigger_tx: mpsc::Sender<()>,
}

impl FlushWaker {
    /// Non-blocking; a no-op if a wake is already pending
    pub fn wake(&self) {
        match self.trigger_tx.try_send(()) {
            Ok(_) => {
                tracing::debug!("FlushProcessor wake signal sent");
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("FlushProcessor already has pending wake");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("FlushProcessor has shut down, wake ignored");
            }
        }
    }
}

/// Receiving end of a flush channel, consumed by [`FlushProcessor::start`]
#[derive(Debug)]
pub struct FlushSignal {
    trigger_rx: mpsc::Receiver<()>,
    trigger_tx: mpsc::Sender<()>,
}

/// Create a connected waker/signal pair.
///
/// The waker goes to the repository, the signal to the processor.
pub fn flush_channel() -> (FlushWaker, FlushSignal) {
    let (trigger_tx, trigger_rx) = mpsc::channel::<()>(1);
    (
        FlushWaker {
            trigger_tx: trigger_tx.clone(),
        },
        FlushSignal {
            trigger_rx,
            trigger_tx,
        },
    )
}

/// Background task draining the dirty set
pub struct FlushProcessor {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl FlushProcessor {
    pub fn start(repository: Arc<NoteRepository>, signal: FlushSignal, config: FlushConfig) -> Self {
        tracing::info!("FlushProcessor starting");

        let FlushSignal {
            mut trigger_rx,
            trigger_tx,
        } = signal;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let retry_delay = config.retry_delay();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => {
                        tracing::info!("FlushProcessor shutting down");
                        if let Err(e) = repository.save().await {
                            tracing::warn!("Final flush failed: {}", e);
                        }
                        break;
                    }

                    Some(_) = trigger_rx.recv() => {
                        while trigger_rx.try_recv().is_ok() {}

                        if !Self::drain(&repository).await {
                            let tx = trigger_tx.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(retry_delay).await;
                                let _ = tx.try_send(());
                            });
                            tracing::debug!("Scheduled flush retry in {:?}", retry_delay);
                        }
                    }
                }
            }
        });

        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Save until the dirty set is empty.
    ///
    /// Returns false when a save failed or was dropped and a retry is needed.
    async fn drain(repository: &NoteRepository) -> bool {
        const MAX_ROUNDS: usize = 8;

        for _ in 0..MAX_ROUNDS {
            if repository.pending_writes().await == 0 {
                return true;
            }
            match repository.save().await {
                Ok(SaveOutcome::Saved { notes, folders }) => {
                    tracing::debug!("Flushed {} notes and {} folders", notes, folders);
                }
                Ok(SaveOutcome::Skipped) => {
                    tracing::debug!("Save already in progress, flush deferred");
                    return false;
                }
                Err(e) => {
                    tracing::warn!("Background save failed, will retry: {}", e);
                    return false;
                }
            }
            tokio::task::yield_now().await;
        }

        repository.pending_writes().await == 0
    }

    /// Stop the processor after one last flush attempt
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.handle.await {
            tracing::warn!("FlushProcessor task ended abnormally: {}", e);
        }
    }

    /// Wait up to `timeout` for the dirty set to drain
    pub async fn wait_idle(repository: &NoteRepository, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if repository.pending_writes().await == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        repository.pending_writes().await == 0
    }
}
