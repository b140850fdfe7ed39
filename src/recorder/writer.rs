//! Dedicated writer task
//!
//! One task per recorder drains a bounded queue into the active backend, so a
//! slow store turns into queue pressure instead of blocking host threads.

use super::Shared;
use crate::models::ActivityEvent;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Capacity of the queue between host callbacks and the writer task
pub const WRITE_QUEUE_CAPACITY: usize = 1024;

pub(crate) enum WriterCommand {
    Persist(ActivityEvent),
    /// Acknowledged once every command queued before it has been handled
    Flush(oneshot::Sender<()>),
    Shutdown,
}

pub(crate) async fn run_writer(shared: Arc<Shared>, mut rx: mpsc::Receiver<WriterCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Persist(event) => write_event(&shared, event).await,
            WriterCommand::Flush(done) => {
                let _ = done.send(());
            }
            WriterCommand::Shutdown => break,
        }
    }
    tracing::debug!("Writer task stopped");
}

async fn write_event(shared: &Shared, event: ActivityEvent) {
    if shared.config.load().paused {
        shared.counters.filtered_events.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "Logging paused, dropping queued event for {}",
            event.full_url()
        );
        return;
    }

    let request_size = event.request_size();
    let capture_second = event.capture_second();
    let transaction_id = event.transaction_id.clone();

    match shared.backend.persist(event).await {
        Ok(()) => {
            shared.stats.record(request_size, capture_second);
            shared.counters.persisted_events.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) if err.is_persistent() => {
            shared.counters.failed_writes.fetch_add(1, Ordering::Relaxed);
            shared.pause_after_failure(err.to_string());
        }
        Err(err) => {
            shared.counters.failed_writes.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "Dropping event for transaction {}: {}",
                transaction_id,
                err
            );
        }
    }
}
