//! Shutdown drain controller.
//!
//! ## State machine
//!
//! ```text
//! Running ──trigger──► Draining ──► Finalizing ──► Stopped
//!                          │                          ▲
//!                          └──── hard deadline ───────┘
//! ```
//!
//! Triggers (signals, process faults) only flip a flag through
//! [`ShutdownTrigger`]. The drain itself runs on a supervising task that
//! awaits [`DrainController::run`], outside any signal context.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DrainConfig;
use crate::coordinator::Coordinator;
use crate::session::{FinalWrite, LiveSession};
use crate::store::{Namespace, StoreResult};
use crate::types::{ClosingReason, ProviderResult, SHUTDOWN_REASON, SessionRecord};

/// Key prefix of incomplete-drain flags in the session namespace.
pub const INCOMPLETE_DRAIN_KEY_PREFIX: &str = "drain/";

/// Upper bound on the single incomplete-drain flag write after the deadline.
const FLAG_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DrainPhase {
    Running = 0,
    Draining = 1,
    Finalizing = 2,
    Stopped = 3,
}

impl DrainPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => DrainPhase::Running,
            1 => DrainPhase::Draining,
            2 => DrainPhase::Finalizing,
            _ => DrainPhase::Stopped,
        }
    }
}

/// Why shutdown was requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ShutdownReason {
    /// A termination signal, by name.
    Signal(String),
    /// An unrecoverable process fault.
    Fault(String),
    /// Explicit request from the embedding program.
    Requested,
}

/// Process lifecycle shared by the coordinator and the drain controller.
#[derive(Debug, Default)]
pub struct Lifecycle {
    phase: AtomicU8,
    requested: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> DrainPhase {
        DrainPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// New sessions are accepted only while running and before any trigger.
    pub fn is_accepting(&self) -> bool {
        self.phase() == DrainPhase::Running && !self.requested.is_cancelled()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.is_cancelled()
    }

    /// Record the first shutdown reason and wake the supervisor.
    pub fn request_shutdown(&self, reason: ShutdownReason) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.requested.cancel();
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().clone()
    }

    /// Resolves once shutdown has been requested.
    pub async fn shutdown_requested(&self) {
        self.requested.cancelled().await
    }

    fn transition(&self, from: DrainPhase, to: DrainPhase) -> bool {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn force(&self, to: DrainPhase) {
        self.phase.store(to as u8, Ordering::SeqCst);
    }
}

/// Cloneable, non-async handle for requesting shutdown.
///
/// Safe to call from signal listeners and task supervisors: it never awaits
/// and never touches the store.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    lifecycle: Arc<Lifecycle>,
}

impl ShutdownTrigger {
    pub fn new(lifecycle: Arc<Lifecycle>) -> Self {
        Self { lifecycle }
    }

    pub fn trigger(&self, reason: ShutdownReason) {
        self.lifecycle.request_shutdown(reason);
    }

    pub fn is_triggered(&self) -> bool {
        self.lifecycle.is_shutdown_requested()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainOutcome {
    Completed,
    /// The hard deadline elapsed before every drained session was written.
    DeadlineExceeded,
}

/// Summary of the one drain sequence a process runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrainReport {
    pub reason: Option<ShutdownReason>,
    pub outcome: DrainOutcome,
    /// Sessions closed by the drain.
    pub drained: usize,
    /// Drained sessions whose final write succeeded.
    pub finalized: usize,
    /// Drained sessions whose final write failed after every retry.
    pub failed_writes: usize,
    pub incomplete_flag_written: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug, Default)]
struct DrainProgress {
    drained: usize,
    finalized: usize,
    failed_writes: usize,
    closed: Vec<Arc<LiveSession>>,
}

/// Closes in-flight sessions on shutdown and releases the store.
pub struct DrainController {
    coordinator: Arc<Coordinator>,
    config: DrainConfig,
    instance_id: String,
    finalize_sequences: AtomicUsize,
}

impl DrainController {
    pub fn new(coordinator: Arc<Coordinator>, config: DrainConfig) -> Self {
        Self {
            coordinator,
            config,
            instance_id: uuid::Uuid::new_v4().to_string(),
            finalize_sequences: AtomicUsize::new(0),
        }
    }

    /// Override the id used for the incomplete-drain flag key.
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn trigger_handle(&self) -> ShutdownTrigger {
        ShutdownTrigger::new(self.coordinator.lifecycle())
    }

    pub fn phase(&self) -> DrainPhase {
        self.coordinator.lifecycle().phase()
    }

    /// Number of drain sequences started. Never exceeds 1.
    pub fn finalize_sequences(&self) -> usize {
        self.finalize_sequences.load(Ordering::SeqCst)
    }

    /// Store key of the incomplete-drain flag, in the session namespace.
    pub fn incomplete_flag_key(&self) -> String {
        format!("{}{}", INCOMPLETE_DRAIN_KEY_PREFIX, self.instance_id)
    }

    /// Supervisor loop: wait for a trigger, then drain.
    pub async fn run(&self) -> Option<DrainReport> {
        self.coordinator.lifecycle().shutdown_requested().await;
        self.drain().await
    }

    /// Run the drain sequence. Any call after the first returns `None`.
    pub async fn drain(&self) -> Option<DrainReport> {
        let lifecycle = self.coordinator.lifecycle();
        if !lifecycle.transition(DrainPhase::Running, DrainPhase::Draining) {
            debug!(phase = ?lifecycle.phase(), "Drain already started, ignoring trigger");
            return None;
        }
        self.finalize_sequences.fetch_add(1, Ordering::SeqCst);
        lifecycle.request_shutdown(ShutdownReason::Requested);

        let reason = lifecycle.reason();
        let started = Instant::now();
        let deadline = started + self.config.hard_deadline();
        info!(
            reason = ?reason,
            active = self.coordinator.active().len(),
            deadline_ms = self.config.hard_deadline_ms,
            "Draining sessions"
        );

        let mut progress = DrainProgress::default();
        let outcome = match timeout_at(deadline, self.drain_sessions(&mut progress)).await {
            Ok(()) => DrainOutcome::Completed,
            Err(_) => {
                warn!(
                    drained = progress.drained,
                    finalized = progress.finalized,
                    "Drain deadline exceeded, stopping"
                );
                DrainOutcome::DeadlineExceeded
            }
        };
        lifecycle.force(DrainPhase::Stopped);

        // Callers still waiting on a write the deadline cut short.
        for session in &progress.closed {
            session.report_final_write(FinalWrite::Failed("drain deadline exceeded".into()));
        }

        let incomplete_flag_written = match outcome {
            DrainOutcome::DeadlineExceeded => self.write_incomplete_flag(&progress, &reason).await,
            DrainOutcome::Completed => false,
        };

        if let Err(e) = self.coordinator.store().close().await {
            warn!(error = %e, "Failed to release store connection");
        }

        let report = DrainReport {
            reason,
            outcome,
            drained: progress.drained,
            finalized: progress.finalized,
            failed_writes: progress.failed_writes,
            incomplete_flag_written,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            outcome = ?report.outcome,
            drained = report.drained,
            finalized = report.finalized,
            failed_writes = report.failed_writes,
            elapsed_ms = report.elapsed_ms,
            "Drain finished"
        );
        Some(report)
    }

    async fn drain_sessions(&self, progress: &mut DrainProgress) {
        let active = self.coordinator.active();
        let grace = Instant::now() + self.config.settle_grace();
        if !active.wait_idle(grace).await {
            debug!(remaining = active.len(), "Settle grace elapsed");
        }

        // No provider is started from here on; sessions close with what they have.
        let synthesizer = self.coordinator.synthesizer();
        let store = self.coordinator.store();
        let interrupted = ProviderResult::failure(SHUTDOWN_REASON, true);
        let mut closed = Vec::new();
        for session in active.list() {
            let now = store.now();
            let finalized = session.try_finalize(|record, configured| {
                for name in configured {
                    record
                        .provider_results
                        .insert_once(name, interrupted.clone(), now);
                }
                record.synthesized_analysis =
                    Some(synthesizer.synthesize(&record.provider_results, configured, now));
                record.closing_recommendations =
                    Some(synthesizer.close(record, ClosingReason::Shutdown, now));
            });
            if let Some(record) = finalized {
                debug!(session_id = %record.session_id, "Closed session for shutdown");
                progress.drained += 1;
                progress.closed.push(session.clone());
                closed.push((session, record));
            }
        }

        self.coordinator
            .lifecycle()
            .transition(DrainPhase::Draining, DrainPhase::Finalizing);

        for (session, record) in &closed {
            match self.persist(record).await {
                Ok(()) => {
                    progress.finalized += 1;
                    session.report_final_write(FinalWrite::Persisted);
                }
                Err(e) => {
                    progress.failed_writes += 1;
                    session.report_final_write(FinalWrite::Failed(e.to_string()));
                }
            }
        }
    }

    /// Write with bounded retries. Returns the last error once they run out.
    async fn persist(&self, record: &SessionRecord) -> StoreResult<()> {
        let store = self.coordinator.store();
        let attempts = self.config.finalize_retries.saturating_add(1);
        let mut attempt = 1;
        loop {
            match store.save_session(record).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        session_id = %record.session_id,
                        attempt,
                        attempts,
                        error = %e,
                        "Final session write failed"
                    );
                    if attempt >= attempts {
                        return Err(e);
                    }
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_backoff()).await;
                }
            }
        }
    }

    async fn write_incomplete_flag(
        &self,
        progress: &DrainProgress,
        reason: &Option<ShutdownReason>,
    ) -> bool {
        let store = self.coordinator.store();
        let flag = json!({
            "instance_id": self.instance_id,
            "reason": reason,
            "drained": progress.drained,
            "finalized": progress.finalized,
            "failed_writes": progress.failed_writes,
            "recorded_at": store.now(),
        });
        let key = self.incomplete_flag_key();
        let ttl = store.default_ttl(Namespace::Session);

        let write = async {
            store.ping().await?;
            store.put(Namespace::Session, &key, flag, ttl).await
        };
        match timeout(FLAG_WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => {
                info!(key = %key, "Recorded incomplete drain");
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Store unreachable, incomplete drain not recorded");
                false
            }
            Err(_) => {
                warn!("Timed out recording incomplete drain");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoordinatorConfig, StoreConfig};
    use crate::consent::StaticConsentSource;
    use crate::error::{Error, StoreError};
    use crate::provider::AnalysisProvider;
    use crate::store::{MemoryBackend, SessionStore, StoreBackend, StoreEntry, StoreResult};
    use crate::testing::FakeProvider;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Notify;

    /// Memory backend that logs every write and can stall session writes.
    ///
    /// With `hold_next` set, the next session write blocks until the store
    /// is closed and then reports success.
    #[derive(Debug, Default)]
    struct TestBackend {
        inner: MemoryBackend,
        stall: AtomicBool,
        hold_next: AtomicBool,
        released: Notify,
        writes: Mutex<Vec<StoreEntry>>,
    }

    impl TestBackend {
        fn last_session_write(&self, session_id: &str) -> Option<SessionRecord> {
            let writes = self.writes.lock();
            let entry = writes.iter().rev().find(|e| e.key == session_id)?;
            serde_json::from_value(entry.value.clone()).ok()
        }

        fn written_keys(&self) -> Vec<String> {
            self.writes.lock().iter().map(|e| e.key.clone()).collect()
        }
    }

    #[async_trait]
    impl StoreBackend for TestBackend {
        async fn put_entry(&self, entry: StoreEntry) -> StoreResult<()> {
            let is_flag = entry.key.starts_with(INCOMPLETE_DRAIN_KEY_PREFIX);
            if !is_flag && self.stall.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if !is_flag && self.hold_next.swap(false, Ordering::SeqCst) {
                self.released.notified().await;
                self.writes.lock().push(entry);
                return Ok(());
            }
            self.inner.put_entry(entry.clone()).await?;
            self.writes.lock().push(entry);
            Ok(())
        }

        async fn get_entry(&self, namespace: Namespace, key: &str) -> StoreResult<Option<StoreEntry>> {
            self.inner.get_entry(namespace, key).await
        }

        async fn delete_entry(&self, namespace: Namespace, key: &str) -> StoreResult<()> {
            self.inner.delete_entry(namespace, key).await
        }

        async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
            self.inner.purge_expired(now).await
        }

        async fn ping(&self) -> StoreResult<()> {
            self.inner.ping().await
        }

        async fn close(&self) -> StoreResult<()> {
            self.released.notify_one();
            self.inner.close().await
        }
    }

    fn coordinator_with(
        backend: Arc<dyn StoreBackend>,
        providers: Vec<Arc<dyn AnalysisProvider>>,
    ) -> Arc<Coordinator> {
        let store = Arc::new(SessionStore::new(backend, StoreConfig::default()));
        let config = CoordinatorConfig {
            provider_timeout_ms: 120_000,
            session_timeout_ms: 300_000,
            ..CoordinatorConfig::default()
        };
        Arc::new(
            Coordinator::new(store, Arc::new(StaticConsentSource::new()), providers, config)
                .unwrap(),
        )
    }

    fn drain_config(settle_grace_ms: u64) -> DrainConfig {
        DrainConfig {
            hard_deadline_ms: 10_000,
            settle_grace_ms,
            finalize_retries: 2,
            retry_backoff_ms: 100,
        }
    }

    fn spawn_session(
        coordinator: &Arc<Coordinator>,
        subject_id: &'static str,
    ) -> tokio::task::JoinHandle<crate::Result<SessionRecord>> {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run_session(subject_id).await })
    }

    #[test]
    fn test_first_shutdown_reason_wins() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.is_accepting());

        let mut waiter = tokio_test::task::spawn(lifecycle.shutdown_requested());
        tokio_test::assert_pending!(waiter.poll());

        lifecycle.request_shutdown(ShutdownReason::Fault("intake panicked".into()));
        lifecycle.request_shutdown(ShutdownReason::Requested);
        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());

        assert!(!lifecycle.is_accepting());
        assert_eq!(lifecycle.phase(), DrainPhase::Running);
        assert_eq!(
            lifecycle.reason(),
            Some(ShutdownReason::Fault("intake panicked".into()))
        );
    }

    #[tokio::test]
    async fn test_second_drain_is_noop() {
        let coordinator = coordinator_with(Arc::new(MemoryBackend::new()), Vec::new());
        let controller = DrainController::new(coordinator, drain_config(0));
        let trigger = controller.trigger_handle();

        trigger.trigger(ShutdownReason::Signal("SIGTERM".into()));
        trigger.trigger(ShutdownReason::Signal("SIGINT".into()));
        assert!(trigger.is_triggered());
        let (first, second) = tokio::join!(controller.drain(), controller.drain());

        assert_eq!(controller.finalize_sequences(), 1);
        assert!(first.is_some() != second.is_some());
        let report = first.or(second).unwrap();
        assert_eq!(report.reason, Some(ShutdownReason::Signal("SIGTERM".into())));
        assert_eq!(report.outcome, DrainOutcome::Completed);

        assert!(controller.drain().await.is_none());
        assert_eq!(controller.finalize_sequences(), 1);
        assert_eq!(controller.phase(), DrainPhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_closes_in_flight_session() {
        let fast = FakeProvider::succeeding("fast").with_delay(Duration::from_millis(100));
        let slow = FakeProvider::succeeding("slow").with_delay(Duration::from_secs(60));
        let backend = Arc::new(TestBackend::default());
        let coordinator = coordinator_with(backend.clone(), vec![Arc::new(fast), Arc::new(slow)]);
        let controller = Arc::new(DrainController::new(coordinator.clone(), drain_config(1_000)));

        let supervisor = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.run().await })
        };
        let session = spawn_session(&coordinator, "subject-1");

        tokio::time::sleep(Duration::from_secs(1)).await;
        let session_id = coordinator.active().list()[0].session_id().to_string();

        controller
            .trigger_handle()
            .trigger(ShutdownReason::Signal("SIGTERM".into()));
        let err = coordinator.run_session("subject-2").await.unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));

        let report = supervisor.await.unwrap().unwrap();
        assert_eq!(report.outcome, DrainOutcome::Completed);
        assert_eq!(report.drained, 1);
        assert_eq!(report.finalized, 1);
        assert_eq!(report.failed_writes, 0);

        let record = backend.last_session_write(&session_id).unwrap();
        assert!(record.is_finalized());
        assert_eq!(record.provider_results.len(), 2);
        assert!(record.provider_results.get("fast").unwrap().is_success());
        assert_eq!(
            record.provider_results.get("slow"),
            Some(&ProviderResult::failure(SHUTDOWN_REASON, true))
        );
        assert_eq!(
            record.closing_recommendations.as_ref().unwrap().reason,
            ClosingReason::Shutdown
        );
        assert_eq!(
            record.synthesized_analysis.as_ref().unwrap().contributors,
            vec!["fast"]
        );

        // The caller gets the record the drain persisted.
        let returned = session.await.unwrap().unwrap();
        assert_eq!(returned.session_id, session_id);
        assert_eq!(returned.provider_results, record.provider_results);
        assert!(matches!(
            coordinator.store().ping().await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_settling_within_grace_completes_normally() {
        let provider = FakeProvider::succeeding("a").with_delay(Duration::from_millis(500));
        let coordinator = coordinator_with(Arc::new(MemoryBackend::new()), vec![Arc::new(provider)]);
        let controller = DrainController::new(coordinator.clone(), drain_config(3_000));

        let session = spawn_session(&coordinator, "subject-1");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let report = controller.drain().await.unwrap();
        assert_eq!(report.drained, 0);

        let record = session.await.unwrap().unwrap();
        assert_eq!(
            record.closing_recommendations.unwrap().reason,
            ClosingReason::Completed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_final_writes_use_bounded_retries() {
        let provider = FakeProvider::succeeding("slow").with_delay(Duration::from_secs(60));
        let backend = Arc::new(MemoryBackend::new());
        let coordinator = coordinator_with(backend.clone(), vec![Arc::new(provider)]);
        let controller = DrainController::new(coordinator.clone(), drain_config(0));

        let _session = spawn_session(&coordinator, "subject-1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        backend.set_available(false);

        let started = Instant::now();
        let report = controller.drain().await.unwrap();
        assert_eq!(report.outcome, DrainOutcome::Completed);
        assert_eq!(report.drained, 1);
        assert_eq!(report.finalized, 0);
        assert_eq!(report.failed_writes, 1);
        assert!(!report.incomplete_flag_written);

        // Three attempts separated by two backoffs.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_forces_stop_and_records_flag() {
        let provider = FakeProvider::succeeding("slow").with_delay(Duration::from_secs(600));
        let backend = Arc::new(TestBackend::default());
        let coordinator = coordinator_with(backend.clone(), vec![Arc::new(provider)]);
        let controller = DrainController::new(
            coordinator.clone(),
            DrainConfig {
                hard_deadline_ms: 2_000,
                ..drain_config(500)
            },
        )
        .with_instance_id("worker-7");

        let _session = spawn_session(&coordinator, "subject-1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        backend.stall.store(true, Ordering::SeqCst);

        let started = Instant::now();
        let report = controller.drain().await.unwrap();
        assert_eq!(report.outcome, DrainOutcome::DeadlineExceeded);
        assert_eq!(report.drained, 1);
        assert_eq!(report.finalized, 0);
        assert!(report.incomplete_flag_written);
        assert_eq!(controller.phase(), DrainPhase::Stopped);

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3));
        assert!(backend.written_keys().contains(&"drain/worker-7".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_registered_after_drain_is_refused() {
        let provider = FakeProvider::succeeding("a");
        let calls = provider.call_counter();
        let backend = Arc::new(TestBackend::default());
        backend.hold_next.store(true, Ordering::SeqCst);
        let coordinator = coordinator_with(backend.clone(), vec![Arc::new(provider)]);
        let controller = DrainController::new(coordinator.clone(), drain_config(0));

        // Passes the acceptance check, then sits in its initial write.
        let session = spawn_session(&coordinator, "subject-1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(coordinator.active().is_empty());

        let report = controller.drain().await.unwrap();
        assert_eq!(report.drained, 0);
        assert_eq!(controller.phase(), DrainPhase::Stopped);

        let err = session.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(coordinator.active().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_leaves_in_flight_provider_running() {
        let provider = FakeProvider::succeeding("slow").with_delay(Duration::from_secs(5));
        let completions = provider.completion_counter();
        let coordinator = coordinator_with(Arc::new(MemoryBackend::new()), vec![Arc::new(provider)]);
        let controller = DrainController::new(coordinator.clone(), drain_config(0));

        let session = spawn_session(&coordinator, "subject-1");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let report = controller.drain().await.unwrap();
        assert_eq!(report.drained, 1);
        assert_eq!(report.finalized, 1);

        let record = session.await.unwrap().unwrap();
        assert_eq!(
            record.provider_results.get("slow"),
            Some(&ProviderResult::failure(SHUTDOWN_REASON, true))
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_final_write_reaches_caller() {
        let provider = FakeProvider::succeeding("slow").with_delay(Duration::from_secs(60));
        let backend = Arc::new(MemoryBackend::new());
        let coordinator = coordinator_with(backend.clone(), vec![Arc::new(provider)]);
        let controller = DrainController::new(coordinator.clone(), drain_config(0));

        let session = spawn_session(&coordinator, "subject-1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        let session_id = coordinator.active().list()[0].session_id().to_string();
        backend.set_available(false);

        let report = controller.drain().await.unwrap();
        assert_eq!(report.failed_writes, 1);

        let err = session.await.unwrap().unwrap_err();
        assert!(err.is_store());
        assert!(!err.is_recoverable());
        match err {
            Error::Store(StoreError::NotPersisted { session_id: id, reason }) => {
                assert_eq!(id, session_id);
                assert!(reason.contains("unavailable"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fails_waiting_caller() {
        let provider = FakeProvider::succeeding("slow").with_delay(Duration::from_secs(600));
        let backend = Arc::new(TestBackend::default());
        let coordinator = coordinator_with(backend.clone(), vec![Arc::new(provider)]);
        let controller = DrainController::new(
            coordinator.clone(),
            DrainConfig {
                hard_deadline_ms: 1_000,
                ..drain_config(0)
            },
        );

        let session = spawn_session(&coordinator, "subject-1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        backend.stall.store(true, Ordering::SeqCst);

        let report = controller.drain().await.unwrap();
        assert_eq!(report.outcome, DrainOutcome::DeadlineExceeded);

        let err = session.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::Store(StoreError::NotPersisted { ref reason, .. }) if reason == "drain deadline exceeded"
        ));
    }

    #[tokio::test]
    async fn test_unreachable_store_skips_flag() {
        let backend = Arc::new(MemoryBackend::new());
        let coordinator = coordinator_with(backend.clone(), Vec::new());
        let controller = DrainController::new(coordinator, drain_config(0));

        backend.set_available(false);
        let progress = DrainProgress::default();
        assert!(!controller.write_incomplete_flag(&progress, &None).await);
    }
}
