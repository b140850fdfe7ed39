//! Activity recorder
//!
//! Wires the host's request/response callbacks through filtering and
//! correlation into a storage backend, and answers the UI's statistics and
//! configuration requests.
//!
//! Host callbacks are synchronous and never wait on storage: completed events
//! are handed to a single writer task through a bounded queue (see
//! [`writer`]).

mod writer;

pub use writer::WRITE_QUEUE_CAPACITY;

use crate::correlator::{EventCorrelator, DEFAULT_PENDING_MAX_AGE};
use crate::error::RecorderError;
use crate::filter;
use crate::models::{
    ActivityEvent, BackendKind, DbStats, FilterConfig, RemoteConnectionParams,
    RequestDescriptor, ResponseFields,
};
use crate::settings::{self, PreferenceStore, RecorderSettings};
use crate::stats::StatsEngine;
use crate::storage::{EmbeddedStore, RemoteStore, StorageBackend, DEFAULT_STORE_FILE_NAME};
use arc_swap::ArcSwap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use writer::WriterCommand;

/// Decides whether a target host belongs to the user's testing scope.
pub trait ScopeOracle: Send + Sync {
    fn is_in_scope(&self, host: &str) -> bool;
}

impl<F> ScopeOracle for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_in_scope(&self, host: &str) -> bool {
        self(host)
    }
}

/// Scope that contains every host
pub struct AllInScope;

impl ScopeOracle for AllInScope {
    fn is_in_scope(&self, _host: &str) -> bool {
        true
    }
}

#[derive(Default)]
struct RecorderCounters {
    filtered_events: AtomicU64,
    orphan_responses: AtomicU64,
    expired_transactions: AtomicU64,
    queue_overflows: AtomicU64,
    failed_writes: AtomicU64,
    persisted_events: AtomicU64,
}

/// State shared between the recorder handle and its writer task
struct Shared {
    config: ArcSwap<FilterConfig>,
    stats: StatsEngine,
    backend: Arc<dyn StorageBackend>,
    counters: RecorderCounters,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn set_last_error(&self, message: Option<String>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = message;
    }

    fn set_paused(&self, paused: bool) {
        self.config.rcu(|current| {
            let mut next = FilterConfig::clone(current);
            next.paused = paused;
            next
        });
    }

    fn pause_after_failure(&self, message: String) {
        self.set_paused(true);
        tracing::error!(
            "Logging paused, the {} store cannot accept writes: {}",
            self.backend.kind(),
            message
        );
        self.set_last_error(Some(message));
    }
}

/// Point-in-time health of the recorder
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecorderStatus {
    pub paused: bool,
    pub backend: BackendKind,
    pub pending_transactions: usize,
    pub persisted_events: u64,
    pub filtered_events: u64,
    /// Responses with no tracked request: unknown or expired ids, and
    /// requests the filters rejected when they were observed
    pub orphan_responses: u64,
    pub expired_transactions: u64,
    pub queue_overflows: u64,
    pub failed_writes: u64,
    /// Last persistent storage failure or configuration notice
    pub last_error: Option<String>,
}

pub struct ActivityRecorder {
    shared: Arc<Shared>,
    correlator: EventCorrelator,
    scope: Arc<dyn ScopeOracle>,
    prefs: Option<Arc<dyn PreferenceStore>>,
    queue: mpsc::Sender<WriterCommand>,
    writer: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ActivityRecorder {
    /// Attach `backend`, seed statistics from it and spawn the writer task.
    /// Must be called from within a tokio runtime.
    pub async fn start(
        backend: Arc<dyn StorageBackend>,
        config: FilterConfig,
        scope: Arc<dyn ScopeOracle>,
    ) -> Self {
        Self::start_with_max_age(backend, config, scope, DEFAULT_PENDING_MAX_AGE).await
    }

    /// Like [`start`](Self::start) with a custom lifetime for unanswered requests.
    pub async fn start_with_max_age(
        backend: Arc<dyn StorageBackend>,
        mut config: FilterConfig,
        scope: Arc<dyn ScopeOracle>,
        pending_max_age: Duration,
    ) -> Self {
        let mut last_error = None;
        let stats = match backend.query_stats().await {
            Ok(stats) => StatsEngine::seeded(stats),
            Err(err) => {
                tracing::warn!(
                    "Could not read statistics from the {} store: {}",
                    backend.kind(),
                    err
                );
                if err.is_persistent() {
                    config.paused = true;
                    last_error = Some(err.to_string());
                }
                StatsEngine::new()
            }
        };

        let shared = Arc::new(Shared {
            config: ArcSwap::from_pointee(config),
            stats,
            backend,
            counters: RecorderCounters::default(),
            last_error: Mutex::new(last_error),
        });
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let handle = tokio::spawn(writer::run_writer(Arc::clone(&shared), rx));

        tracing::info!(
            "Activity recorder started on the {} backend (paused: {})",
            shared.backend.kind(),
            shared.config.load().paused
        );

        Self {
            shared,
            correlator: EventCorrelator::new(pending_max_age),
            scope,
            prefs: None,
            queue: tx,
            writer: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        }
    }

    /// Persist configuration changes made through this recorder to `prefs`.
    pub fn with_preferences(mut self, prefs: Arc<dyn PreferenceStore>) -> Self {
        self.prefs = Some(prefs);
        self
    }

    /// Build a recorder from the host's stored preferences.
    ///
    /// With the embedded backend and no usable store location, logging starts
    /// paused on the default store and a notice is left in
    /// [`RecorderStatus::last_error`] until the user picks a location.
    pub async fn bootstrap(
        prefs: Arc<dyn PreferenceStore>,
        scope: Arc<dyn ScopeOracle>,
    ) -> Result<Self, RecorderError> {
        Self::bootstrap_with_fallback(prefs, scope, default_store_path()).await
    }

    /// [`bootstrap`](Self::bootstrap) with an explicit store to open when no
    /// usable location is configured.
    pub async fn bootstrap_with_fallback(
        prefs: Arc<dyn PreferenceStore>,
        scope: Arc<dyn ScopeOracle>,
        fallback_store: PathBuf,
    ) -> Result<Self, RecorderError> {
        let RecorderSettings {
            mut filter,
            store_location,
            remote,
        } = RecorderSettings::load(prefs.as_ref());
        let mut notice = None;

        let backend: Arc<dyn StorageBackend> = match filter.backend {
            BackendKind::Embedded => {
                let path = match store_location {
                    Some(path) if path.exists() => path,
                    missing => {
                        if !filter.paused {
                            let message = match &missing {
                                Some(path) => format!(
                                    "Previously stored DB file does not exist anymore ('{}'), logging is paused",
                                    path.display()
                                ),
                                None => "No DB is selected for this project, logging is paused"
                                    .to_string(),
                            };
                            tracing::warn!("{}", message);
                            filter.paused = true;
                            prefs.set_bool(settings::PAUSE_LOGGING, true);
                            notice = Some(message);
                        }
                        fallback_store
                    }
                };
                let store = tokio::task::spawn_blocking(move || EmbeddedStore::open(&path))
                    .await
                    .map_err(|e| {
                        RecorderError::Configuration(format!("store open task failed: {}", e))
                    })??;
                Arc::new(store)
            }
            BackendKind::Remote => {
                remote.validate().map_err(RecorderError::Configuration)?;
                Arc::new(RemoteStore::connect_lazy(&remote)?)
            }
        };

        let recorder = Self::start(backend, filter, scope)
            .await
            .with_preferences(prefs);
        if notice.is_some() {
            recorder.shared.set_last_error(notice);
        }
        Ok(recorder)
    }

    /// Host callback for an outgoing request. Rejected requests are not tracked.
    pub fn on_request_observed(&self, transaction_id: &str, request: RequestDescriptor) {
        let in_scope = self.scope.is_in_scope(&request.host);
        let event = ActivityEvent::from_request(transaction_id, request, in_scope);

        if let Some(reason) = filter::evaluate(&event, &self.shared.config.load()) {
            self.shared.counters.filtered_events.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "Not recording {} {}: {}",
                event.method,
                event.full_url(),
                reason.as_str()
            );
            return;
        }

        let expired = self.correlator.on_request_observed(event);
        self.submit_expired(expired);
    }

    /// Host callback for a response. Completes the pending transaction, if any.
    pub fn on_response_observed(&self, transaction_id: &str, response: ResponseFields) {
        match self.correlator.on_response_observed(transaction_id, response) {
            Some(event) => self.submit(event),
            None => {
                self.shared.counters.orphan_responses.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Flush transactions that have waited longer than the pending lifetime
    /// as response-less events. Also happens lazily on incoming requests.
    pub fn sweep_expired(&self, now: Instant) {
        let expired = self.correlator.sweep_expired(now);
        self.submit_expired(expired);
    }

    fn submit_expired(&self, expired: Vec<ActivityEvent>) {
        if expired.is_empty() {
            return;
        }
        self.shared
            .counters
            .expired_transactions
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        tracing::debug!(
            "{} transaction(s) expired without a response",
            expired.len()
        );
        for event in expired {
            self.submit(event);
        }
    }

    fn submit(&self, event: ActivityEvent) {
        let config = self.shared.config.load();
        if let Some(reason) = filter::evaluate(&event, &config) {
            self.shared.counters.filtered_events.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "Not recording transaction {}: {}",
                event.transaction_id,
                reason.as_str()
            );
            return;
        }
        let event = filter::prepare_for_storage(event, &config);

        match self.queue.try_send(WriterCommand::Persist(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.counters.queue_overflows.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Write queue is full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) if self.closed.load(Ordering::SeqCst) => {
                tracing::debug!("Recorder is shut down, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.shared.counters.failed_writes.fetch_add(1, Ordering::Relaxed);
                self.shared
                    .pause_after_failure("the writer task stopped unexpectedly".to_string());
            }
        }
    }

    /// Statistics over everything persisted so far.
    pub fn get_stats(&self) -> DbStats {
        DbStats {
            size_on_disk: self.shared.backend.size_on_disk(),
            ..self.shared.stats.snapshot()
        }
    }

    pub fn filter_config(&self) -> FilterConfig {
        FilterConfig::clone(&self.shared.config.load())
    }

    /// Replace the whole configuration. The backend preference is saved but
    /// only takes effect on the next start.
    pub fn set_filter_config(&self, config: FilterConfig) {
        tracing::info!(
            "Filter configuration updated (paused: {}, scope only: {}, exclude images: {}, tool filter: {})",
            config.paused,
            config.scope_only,
            config.exclude_images,
            config.tool_filter_enabled
        );
        if let Some(prefs) = &self.prefs {
            settings::save_filter_config(prefs.as_ref(), &config);
        }
        self.shared.config.store(Arc::new(config));
    }

    /// Read-modify-write of the configuration; `f` may run more than once
    /// under contention.
    pub fn update_filter_config<F>(&self, f: F)
    where
        F: Fn(&mut FilterConfig),
    {
        let previous = self.shared.config.rcu(|current| {
            let mut next = FilterConfig::clone(current);
            f(&mut next);
            next
        });
        let current = self.shared.config.load();
        if *previous != **current {
            tracing::debug!("Filter configuration changed");
            if let Some(prefs) = &self.prefs {
                settings::save_filter_config(prefs.as_ref(), &current);
            }
        }
    }

    pub fn pause(&self) {
        self.update_filter_config(|config| config.paused = true);
        tracing::info!("Logging paused");
    }

    /// Resume logging and clear any pending failure notice.
    pub fn resume(&self) {
        self.update_filter_config(|config| config.paused = false);
        self.shared.set_last_error(None);
        tracing::info!("Logging resumed");
    }

    /// Move the embedded store to `target`. Logging must be paused first.
    pub async fn relocate_embedded_store(&self, target: &Path) -> Result<(), RecorderError> {
        if !self.shared.config.load().paused {
            return Err(RecorderError::PreconditionViolation(
                "Logging must be paused before changing the store location".to_string(),
            ));
        }
        let backend = &self.shared.backend;
        if !backend.supports_relocation() {
            return Err(RecorderError::PreconditionViolation(format!(
                "The {} store cannot be relocated",
                backend.kind()
            )));
        }

        self.flush().await;
        backend.relocate(target).await?;
        let stats = backend.query_stats().await?;
        self.shared.stats.seed(stats);

        if let Some(prefs) = &self.prefs {
            prefs.set_string(settings::DB_FILE_CUSTOM_LOCATION, &target.to_string_lossy());
        }
        tracing::info!("Store location changed to {}", target.display());
        Ok(())
    }

    /// Save a backend choice for the next start. The running backend is kept.
    pub fn set_backend_kind(
        &self,
        kind: BackendKind,
        remote: &RemoteConnectionParams,
    ) -> Result<(), RecorderError> {
        if kind == BackendKind::Remote {
            remote.validate().map_err(RecorderError::Configuration)?;
        }
        let prefs = self.prefs.as_ref().ok_or_else(|| {
            RecorderError::Configuration("no preference store is attached".to_string())
        })?;
        settings::save_backend_selection(prefs.as_ref(), kind, remote);
        self.shared.config.rcu(|current| {
            let mut next = FilterConfig::clone(current);
            next.backend = kind;
            next
        });
        tracing::info!("Backend set to {}, effective on next start", kind);
        Ok(())
    }

    pub fn status(&self) -> RecorderStatus {
        let counters = &self.shared.counters;
        RecorderStatus {
            paused: self.shared.config.load().paused,
            backend: self.shared.backend.kind(),
            pending_transactions: self.correlator.pending_count(),
            persisted_events: counters.persisted_events.load(Ordering::Relaxed),
            filtered_events: counters.filtered_events.load(Ordering::Relaxed),
            orphan_responses: counters.orphan_responses.load(Ordering::Relaxed),
            expired_transactions: counters.expired_transactions.load(Ordering::Relaxed),
            queue_overflows: counters.queue_overflows.load(Ordering::Relaxed),
            failed_writes: counters.failed_writes.load(Ordering::Relaxed),
            last_error: self
                .shared
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    /// Wait until every event queued before this call has been handled.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.queue.send(WriterCommand::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    /// Record still-pending transactions without a response, drain the queue
    /// and close the backend. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let pending = self.correlator.drain();
        if !pending.is_empty() {
            tracing::info!(
                "Recording {} unanswered transaction(s) before shutdown",
                pending.len()
            );
        }
        for event in pending {
            self.submit(event);
        }

        if self.queue.send(WriterCommand::Shutdown).await.is_ok() {
            let handle = self
                .writer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(handle) = handle {
                if let Err(e) = handle.await {
                    tracing::error!("Writer task failed: {}", e);
                }
            }
        }

        self.shared.backend.close().await;
        tracing::info!("Activity recorder stopped");
    }
}

/// `<home>/ProxyActivityLog.db`, or the working directory without a home.
pub fn default_store_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_STORE_FILE_NAME)
}
