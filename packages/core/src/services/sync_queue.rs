//! Sync Queue
//!
//! Pushes unsynchronized notes to a remote endpoint. Each note moves through
//! `Unsynced -> Syncing -> Synced | Unsynced`; a failed note simply stays
//! unsynced and is retried by the next cycle.
//!
//! A cycle:
//!
//! 1. checks the store connection (bounded by `open_timeout_ms`)
//! 2. reads every note record (bounded by `query_timeout_ms`)
//! 3. pushes each record with `synced == false`, one at a time
//! 4. on success, sets `synced = true` on the stored note in one conditional
//!    write that applies only if the note still exists at the pushed version,
//!    then notifies the [`SyncObserver`]
//!
//! Store calls run on their own task. A call that exceeds its bound is
//! reported as a timeout but keeps running to completion.
//!
//! Nothing escapes a cycle: per-note failures are counted and a total
//! failure (store unavailable) is logged and returned inside the
//! [`SyncReport`].

use crate::config::{StoreConfig, SyncConfig};
use crate::db::{note_version, Collection, EntityStore, StoreError};
use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Upper bound on a single push
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure of a single note push
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Push of note {note_id} failed: {reason}")]
    PushFailed { note_id: String, reason: String },

    #[error("Push of note {note_id} timed out after {after:?}")]
    Timeout { note_id: String, after: Duration },
}

impl SyncError {
    pub fn push_failed(note_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PushFailed {
            note_id: note_id.into(),
            reason: reason.into(),
        }
    }
}

/// The remote side of synchronization
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    async fn push_note(&self, note_id: &str) -> Result<(), SyncError>;
}

/// Stand-in remote with random latency and a synthetic failure rate
#[derive(Debug, Clone)]
pub struct SimulatedRemote {
    latency_min: Duration,
    latency_max: Duration,
    failure_rate: f64,
}

impl SimulatedRemote {
    pub fn new(config: &SyncConfig) -> Self {
        let (min, max) = if config.latency_min_ms <= config.latency_max_ms {
            (config.latency_min_ms, config.latency_max_ms)
        } else {
            (config.latency_max_ms, config.latency_min_ms)
        };
        let failure_rate = if config.failure_rate.is_nan() {
            0.0
        } else {
            config.failure_rate.clamp(0.0, 1.0)
        };
        Self {
            latency_min: Duration::from_millis(min),
            latency_max: Duration::from_millis(max),
            failure_rate,
        }
    }

    /// No latency, never fails
    pub fn reliable() -> Self {
        Self {
            latency_min: Duration::ZERO,
            latency_max: Duration::ZERO,
            failure_rate: 0.0,
        }
    }
}

#[async_trait]
impl RemoteEndpoint for SimulatedRemote {
    async fn push_note(&self, note_id: &str) -> Result<(), SyncError> {
        let (latency, fail) = {
            let mut rng = rand::rng();
            (
                rng.random_range(self.latency_min..=self.latency_max),
                rng.random_bool(self.failure_rate),
            )
        };

        tokio::time::sleep(latency).await;

        if fail {
            return Err(SyncError::push_failed(note_id, "simulated network failure"));
        }
        Ok(())
    }
}

/// Receives successful pushes so in-memory copies can converge
#[async_trait]
pub trait SyncObserver: Send + Sync {
    /// `version` is the note version that was pushed
    async fn note_synced(&self, note_id: &str, version: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    Unsynced,
    Syncing,
    Synced,
}

/// Outcome of one sync cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Notes a push was attempted for
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    /// Pushed, but edited during the push; left for the next cycle
    pub superseded: usize,
    /// Another cycle was running, nothing was done
    pub skipped: bool,
    /// Set when the cycle could not run at all
    pub error: Option<String>,
}

impl SyncReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    pub fn is_total_failure(&self) -> bool {
        self.error.is_some()
    }
}

struct Candidate {
    id: String,
    version: u64,
}

/// Wait at most `limit` for a store call spawned onto its own task.
///
/// The task is detached on timeout, never cancelled, so a transaction it
/// started always commits or rolls back.
async fn bounded<T, F>(operation: &'static str, limit: Duration, fut: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, StoreError>> + Send + 'static,
{
    match tokio::time::timeout(limit, tokio::spawn(fut)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(StoreError::transaction(format!("{} task failed: {}", operation, e))),
        Err(_) => Err(StoreError::timeout(operation, limit)),
    }
}

/// The sync queue
pub struct SyncQueue {
    store: Arc<dyn EntityStore>,
    remote: Arc<dyn RemoteEndpoint>,
    observer: Option<Arc<dyn SyncObserver>>,
    open_timeout: Duration,
    query_timeout: Duration,
    push_timeout: Duration,
    running: Mutex<()>,
    states: RwLock<HashMap<String, SyncState>>,
    last_report: RwLock<Option<SyncReport>>,
}

impl SyncQueue {
    pub fn new(
        store: Arc<dyn EntityStore>,
        remote: Arc<dyn RemoteEndpoint>,
        config: &StoreConfig,
    ) -> Self {
        Self {
            store,
            remote,
            observer: None,
            open_timeout: config.open_timeout(),
            query_timeout: config.query_timeout(),
            push_timeout: DEFAULT_PUSH_TIMEOUT,
            running: Mutex::new(()),
            states: RwLock::new(HashMap::new()),
            last_report: RwLock::new(None),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_push_timeout(mut self, timeout: Duration) -> Self {
        self.push_timeout = timeout;
        self
    }

    /// State of a note as seen by the most recent cycles.
    ///
    /// Notes never seen by a cycle report `None`.
    pub async fn state_of(&self, note_id: &str) -> Option<SyncState> {
        self.states.read().await.get(note_id).copied()
    }

    pub async fn last_report(&self) -> Option<SyncReport> {
        self.last_report.read().await.clone()
    }

    async fn set_state(&self, note_id: &str, state: SyncState) {
        self.states.write().await.insert(note_id.to_string(), state);
    }

    /// Run one sync cycle. Never fails; see [`SyncReport`].
    pub async fn run_cycle(&self) -> SyncReport {
        let Ok(_running) = self.running.try_lock() else {
            tracing::debug!("Sync cycle already running, trigger ignored");
            return SyncReport::skipped();
        };

        let report = match self.collect_candidates().await {
            Ok(candidates) => self.push_all(candidates).await,
            Err(e) => {
                tracing::error!("Sync cycle failed: {}", e);
                SyncReport {
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };

        *self.last_report.write().await = Some(report.clone());
        report
    }

    async fn collect_candidates(&self) -> Result<Vec<Candidate>, StoreError> {
        let store = Arc::clone(&self.store);
        bounded("open", self.open_timeout, async move { store.ping().await }).await?;

        let store = Arc::clone(&self.store);
        let records = bounded("get_all", self.query_timeout, async move {
            store.get_all(Collection::Notes).await
        })
        .await?;

        let mut candidates = Vec::new();
        let mut states = self.states.write().await;
        for record in &records {
            let Some(id) = record.get("id").and_then(Value::as_str) else {
                tracing::warn!("Skipping note record without an id");
                continue;
            };
            if record.get("synced").and_then(Value::as_bool) == Some(true) {
                states.insert(id.to_string(), SyncState::Synced);
                continue;
            }
            states.insert(id.to_string(), SyncState::Unsynced);
            candidates.push(Candidate {
                id: id.to_string(),
                version: note_version(record),
            });
        }
        Ok(candidates)
    }

    async fn push_all(&self, candidates: Vec<Candidate>) -> SyncReport {
        let mut report = SyncReport {
            attempted: candidates.len(),
            ..Default::default()
        };

        for candidate in candidates {
            self.set_state(&candidate.id, SyncState::Syncing).await;

            let pushed = match tokio::time::timeout(
                self.push_timeout,
                self.remote.push_note(&candidate.id),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout {
                    note_id: candidate.id.clone(),
                    after: self.push_timeout,
                }),
            };

            if let Err(e) = pushed {
                tracing::warn!("{}", e);
                report.failed += 1;
                self.set_state(&candidate.id, SyncState::Unsynced).await;
                continue;
            }

            match self.mark_synced(&candidate).await {
                Ok(true) => {
                    report.synced += 1;
                    self.set_state(&candidate.id, SyncState::Synced).await;
                    if let Some(observer) = &self.observer {
                        observer.note_synced(&candidate.id, candidate.version).await;
                    }
                }
                Ok(false) => {
                    tracing::debug!(id = %candidate.id, "Note changed during push, left unsynced");
                    report.superseded += 1;
                    self.set_state(&candidate.id, SyncState::Unsynced).await;
                }
                Err(e) => {
                    tracing::warn!("Failed to record sync of note {}: {}", candidate.id, e);
                    report.failed += 1;
                    self.set_state(&candidate.id, SyncState::Unsynced).await;
                }
            }
        }

        tracing::info!(
            "Sync cycle finished: {} synced, {} failed, {} superseded",
            report.synced,
            report.failed,
            report.superseded
        );
        report
    }

    /// Returns false when the note was edited or deleted during the push
    async fn mark_synced(&self, candidate: &Candidate) -> Result<bool, StoreError> {
        let store = Arc::clone(&self.store);
        let id = candidate.id.clone();
        let version = candidate.version;
        bounded("mark_synced", self.query_timeout, async move {
            store.mark_synced(&id, version).await
        })
        .await
    }

    /// Start a background task running a cycle whenever triggered, and every
    /// `interval` if one is given
    pub fn spawn(self: Arc<Self>, interval: Option<Duration>) -> SyncWorker {
        let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(1);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let queue = self;

        let handle = tokio::spawn(async move {
            let mut ticker = interval.map(|period| {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker
            });

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => {
                        tracing::info!("Sync worker shutting down");
                        break;
                    }

                    Some(_) = trigger_rx.recv() => {
                        while trigger_rx.try_recv().is_ok() {}
                        queue.run_cycle().await;
                    }

                    _ = async {
                        match ticker.as_mut() {
                            Some(ticker) => {
                                ticker.tick().await;
                            }
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        queue.run_cycle().await;
                    }
                }
            }
        });

        SyncWorker {
            trigger: SyncTrigger { trigger_tx },
            shutdown_tx,
            handle,
        }
    }
}

/// Requests a sync cycle from a running [`SyncWorker`]
#[derive(Debug, Clone)]
pub struct SyncTrigger {
    trigger_tx: mpsc::Sender<()>,
}

impl SyncTrigger {
    /// Non-blocking; requests made while one is pending are merged
    pub fn request(&self) {
        match self.trigger_tx.try_send(()) {
            Ok(_) => tracing::debug!("Sync requested"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("Sync already requested");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("Sync worker has shut down, request ignored");
            }
        }
    }
}

/// Background task created by [`SyncQueue::spawn`]
pub struct SyncWorker {
    trigger: SyncTrigger,
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl SyncWorker {
    pub fn trigger(&self) -> SyncTrigger {
        self.trigger.clone()
    }

    /// Stop the worker, letting a running cycle finish first
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.handle.await {
            tracing::warn!("Sync worker ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    /// Remote that fails a fixed set of notes
    struct ScriptedRemote {
        failing: HashSet<String>,
        delay: Duration,
        pushed: StdMutex<Vec<String>>,
    }

    impl ScriptedRemote {
        fn failing(ids: &[&str]) -> Self {
            Self {
                failing: ids.iter().map(|s| s.to_string()).collect(),
                delay: Duration::ZERO,
                pushed: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RemoteEndpoint for ScriptedRemote {
        async fn push_note(&self, note_id: &str) -> Result<(), SyncError> {
            tokio::time::sleep(self.delay).await;
            self.pushed.lock().unwrap().push(note_id.to_string());
            if self.failing.contains(note_id) {
                return Err(SyncError::push_failed(note_id, "scripted"));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        seen: StdMutex<Vec<(String, u64)>>,
    }

    #[async_trait]
    impl SyncObserver for RecordingObserver {
        async fn note_synced(&self, note_id: &str, version: u64) {
            self.seen.lock().unwrap().push((note_id.to_string(), version));
        }
    }

    fn record(id: &str, synced: bool) -> Value {
        json!({"id": id, "title": id, "synced": synced, "metadata": {"version": 1}})
    }

    fn store_with(records: Vec<Value>) -> MemoryStore {
        MemoryStore::with_records(records, Vec::new()).unwrap()
    }

    #[tokio::test]
    async fn test_partial_failure() {
        let store = store_with(vec![record("a", false), record("b", false), record("c", true)]);
        let remote = Arc::new(ScriptedRemote::failing(&["b"]));
        let observer = Arc::new(RecordingObserver::default());
        let queue = SyncQueue::new(Arc::new(store.clone()), remote.clone(), &StoreConfig::default())
            .with_observer(observer.clone());

        let report = queue.run_cycle().await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.synced, 1);
        assert_eq!(report.failed, 1);
        assert!(!report.skipped);
        assert_eq!(*remote.pushed.lock().unwrap(), vec!["a", "b"]);

        let a = store.get(Collection::Notes, "a").await.unwrap().unwrap();
        let b = store.get(Collection::Notes, "b").await.unwrap().unwrap();
        assert_eq!(a["synced"], json!(true));
        assert_eq!(b["synced"], json!(false));

        assert_eq!(queue.state_of("a").await, Some(SyncState::Synced));
        assert_eq!(queue.state_of("b").await, Some(SyncState::Unsynced));
        assert_eq!(queue.state_of("c").await, Some(SyncState::Synced));
        assert_eq!(*observer.seen.lock().unwrap(), vec![("a".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_failed_notes_retried_next_cycle() {
        let store = store_with(vec![record("a", false)]);
        let queue = SyncQueue::new(
            Arc::new(store.clone()),
            Arc::new(ScriptedRemote::failing(&["a"])),
            &StoreConfig::default(),
        );
        assert_eq!(queue.run_cycle().await.failed, 1);

        let queue = SyncQueue::new(
            Arc::new(store.clone()),
            Arc::new(SimulatedRemote::reliable()),
            &StoreConfig::default(),
        );
        let report = queue.run_cycle().await;
        assert_eq!(report.synced, 1);
        assert_eq!(queue.run_cycle().await.attempted, 0);
    }

    #[tokio::test]
    async fn test_total_failure_is_contained() {
        let store = store_with(vec![record("a", false)]);
        store.set_fail_reads(true);
        let queue = SyncQueue::new(
            Arc::new(store),
            Arc::new(SimulatedRemote::reliable()),
            &StoreConfig::default(),
        );

        let report = queue.run_cycle().await;
        assert!(report.is_total_failure());
        assert_eq!(report.attempted, 0);
        assert_eq!(queue.last_report().await, Some(report));
    }

    #[tokio::test]
    async fn test_edit_during_push_is_superseded() {
        let store = store_with(vec![record("a", false)]);
        let remote = Arc::new(ScriptedRemote {
            failing: HashSet::new(),
            delay: Duration::from_millis(50),
            pushed: StdMutex::new(Vec::new()),
        });
        let queue = SyncQueue::new(Arc::new(store.clone()), remote, &StoreConfig::default());

        let (report, _) = tokio::join!(queue.run_cycle(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let mut edited = record("a", false);
            edited["metadata"]["version"] = json!(2);
            store.put(Collection::Notes, edited).await.unwrap();
        });

        assert_eq!(report.superseded, 1);
        assert_eq!(report.synced, 0);
        let a = store.get(Collection::Notes, "a").await.unwrap().unwrap();
        assert_eq!(a["synced"], json!(false));
    }

    #[tokio::test]
    async fn test_concurrent_cycle_is_skipped() {
        let store = store_with(vec![record("a", false)]);
        let remote = Arc::new(ScriptedRemote {
            failing: HashSet::new(),
            delay: Duration::from_millis(50),
            pushed: StdMutex::new(Vec::new()),
        });
        let queue = SyncQueue::new(Arc::new(store), remote, &StoreConfig::default());

        let (first, second) = tokio::join!(queue.run_cycle(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            queue.run_cycle().await
        });
        assert_eq!(first.synced, 1);
        assert!(second.skipped);
    }

    #[tokio::test]
    async fn test_push_timeout() {
        let store = store_with(vec![record("a", false)]);
        let remote = Arc::new(ScriptedRemote {
            failing: HashSet::new(),
            delay: Duration::from_millis(200),
            pushed: StdMutex::new(Vec::new()),
        });
        let queue = SyncQueue::new(Arc::new(store), remote, &StoreConfig::default())
            .with_push_timeout(Duration::from_millis(20));

        let report = queue.run_cycle().await;
        assert_eq!(report.failed, 1);
        assert_eq!(queue.state_of("a").await, Some(SyncState::Unsynced));
    }

    #[tokio::test]
    async fn test_worker_runs_on_request() {
        let store = store_with(vec![record("a", false)]);
        let queue = Arc::new(SyncQueue::new(
            Arc::new(store),
            Arc::new(SimulatedRemote::reliable()),
            &StoreConfig::default(),
        ));

        let worker = Arc::clone(&queue).spawn(None);
        worker.trigger().request();

        let deadline = Instant::now() + Duration::from_secs(2);
        while queue.last_report().await.is_none() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        worker.shutdown().await;

        let report = queue.last_report().await.unwrap();
        assert_eq!(report.synced, 1);
    }

    #[tokio::test]
    async fn test_worker_runs_on_configured_interval() {
        let store = store_with(vec![record("a", false)]);
        let queue = Arc::new(SyncQueue::new(
            Arc::new(store.clone()),
            Arc::new(SimulatedRemote::reliable()),
            &StoreConfig::default(),
        ));
        let config = SyncConfig {
            interval_secs: Some(1),
            ..Default::default()
        };

        // No request is ever made; only the tick can start a cycle
        let worker = Arc::clone(&queue).spawn(config.interval());
        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.last_report().await.is_none() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        worker.shutdown().await;

        assert_eq!(queue.last_report().await.map(|r| r.synced), Some(1));
        let a = store.get(Collection::Notes, "a").await.unwrap().unwrap();
        assert_eq!(a["synced"], json!(true));
    }

    #[tokio::test]
    async fn test_timed_out_store_call_still_completes() {
        let store = MemoryStore::new();
        store.set_latency(Duration::from_millis(100));

        let writer = store.clone();
        let result = bounded("put", Duration::from_millis(10), async move {
            writer.put(Collection::Notes, record("late", false)).await
        })
        .await;
        assert!(matches!(result, Err(StoreError::Timeout { .. })));

        tokio::time::sleep(Duration::from_millis(250)).await;
        store.set_latency(Duration::ZERO);
        assert!(store.get(Collection::Notes, "late").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_deleted_note_is_not_marked() {
        let store = store_with(vec![record("a", false)]);
        let remote = Arc::new(ScriptedRemote {
            failing: HashSet::new(),
            delay: Duration::from_millis(50),
            pushed: StdMutex::new(Vec::new()),
        });
        let observer = Arc::new(RecordingObserver::default());
        let queue = SyncQueue::new(Arc::new(store.clone()), remote, &StoreConfig::default())
            .with_observer(observer.clone());

        let (report, _) = tokio::join!(queue.run_cycle(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            store.delete(Collection::Notes, "a").await.unwrap();
        });

        assert_eq!(report.synced, 0);
        assert_eq!(report.superseded, 1);
        assert!(store.get(Collection::Notes, "a").await.unwrap().is_none());
        assert!(observer.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_simulated_remote_config_is_sanitized() {
        let remote = SimulatedRemote::new(&SyncConfig {
            latency_min_ms: 900,
            latency_max_ms: 100,
            failure_rate: f64::NAN,
            interval_secs: None,
        });
        assert!(remote.latency_min <= remote.latency_max);
        assert_eq!(remote.failure_rate, 0.0);
    }
}
