//! Request/response correlation
//!
//! The host reports a request and, possibly much later or never, its response.
//! Request-side events wait in a pending table keyed by transaction id until
//! the response arrives or they grow too old, in which case they are handed
//! back as response-less events. Expiry is checked lazily on new requests.

use crate::models::{ActivityEvent, ResponseFields};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Age after which an unanswered request is flushed without a response
pub const DEFAULT_PENDING_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// Minimum spacing between two sweeps of the pending table
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

struct PendingTransaction {
    event: ActivityEvent,
    created_at: Instant,
}

struct PendingTable {
    entries: HashMap<String, PendingTransaction>,
    last_sweep: Instant,
}

pub struct EventCorrelator {
    pending: Mutex<PendingTable>,
    max_age: Duration,
}

impl Default for EventCorrelator {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_MAX_AGE)
    }
}

impl EventCorrelator {
    pub fn new(max_age: Duration) -> Self {
        Self {
            pending: Mutex::new(PendingTable {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
            max_age,
        }
    }

    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a request-side event. Returns the entries that expired and must
    /// be flushed as response-less events.
    pub fn on_request_observed(&self, event: ActivityEvent) -> Vec<ActivityEvent> {
        self.on_request_observed_at(event, Instant::now())
    }

    pub fn on_request_observed_at(
        &self,
        event: ActivityEvent,
        now: Instant,
    ) -> Vec<ActivityEvent> {
        let mut table = self.table();
        let sweep_due =
            now.saturating_duration_since(table.last_sweep) >= SWEEP_INTERVAL.min(self.max_age);
        let expired = if sweep_due {
            table.last_sweep = now;
            Self::sweep_locked(&mut table, now, self.max_age)
        } else {
            Vec::new()
        };

        let transaction_id = event.transaction_id.clone();
        let previous = table.entries.insert(
            transaction_id.clone(),
            PendingTransaction {
                event,
                created_at: now,
            },
        );
        if previous.is_some() {
            tracing::trace!(
                "Replaced stale pending entry for transaction {}",
                transaction_id
            );
        }
        expired
    }

    /// Merge a response into its pending request. Returns `None` when the
    /// transaction is unknown or already expired.
    pub fn on_response_observed(
        &self,
        transaction_id: &str,
        response: ResponseFields,
    ) -> Option<ActivityEvent> {
        let pending = self.table().entries.remove(transaction_id);
        match pending {
            Some(PendingTransaction { mut event, .. }) => {
                event.response = Some(response);
                Some(event)
            }
            None => {
                tracing::trace!(
                    "Dropping response for unknown transaction {}",
                    transaction_id
                );
                None
            }
        }
    }

    /// Remove and return every entry older than the configured age.
    pub fn sweep_expired(&self, now: Instant) -> Vec<ActivityEvent> {
        let mut table = self.table();
        table.last_sweep = now;
        Self::sweep_locked(&mut table, now, self.max_age)
    }

    fn sweep_locked(
        table: &mut PendingTable,
        now: Instant,
        max_age: Duration,
    ) -> Vec<ActivityEvent> {
        let expired_ids: Vec<String> = table
            .entries
            .iter()
            .filter(|(_, pending)| now.saturating_duration_since(pending.created_at) >= max_age)
            .map(|(id, _)| id.clone())
            .collect();

        let mut expired: Vec<ActivityEvent> = expired_ids
            .iter()
            .filter_map(|id| table.entries.remove(id))
            .map(|pending| pending.event)
            .collect();
        expired.sort_by_key(|event| event.captured_at_ms);

        if !expired.is_empty() {
            tracing::trace!("Flushing {} expired pending transactions", expired.len());
        }
        expired
    }

    /// Remove every pending entry, oldest first. Used at shutdown.
    pub fn drain(&self) -> Vec<ActivityEvent> {
        let mut events: Vec<ActivityEvent> = self
            .table()
            .entries
            .drain()
            .map(|(_, pending)| pending.event)
            .collect();
        events.sort_by_key(|event| event.captured_at_ms);
        events
    }

    pub fn pending_count(&self) -> usize {
        self.table().entries.len()
    }
}
