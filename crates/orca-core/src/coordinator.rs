//! Orchestration coordinator.
//!
//! ## Session flow
//!
//! ```text
//! run_session(subject)
//!   │
//!   ├─► Lifecycle accepting?            no ─► Error::ShuttingDown
//!   ├─► ConsentGate::authorize          denied ─► Error::ConsentDenied
//!   ├─► session slot (admission)        timeout ─► Error::Saturated
//!   ├─► load snapshot, create + save record
//!   ├─► register, accepting still?      no ─► Error::ShuttingDown
//!   │
//!   ├─► fan out: one task per provider
//!   │     each: provider slot ─► shutdown requested? ─► not started
//!   │           invoke under its own timeout
//!   │           panic / error / timeout ─► ProviderResult::Failure
//!   │
//!   ├─► global session timeout ─► cancel stragglers, record timeouts
//!   │
//!   └─► synthesize + close ─► save ─► SessionRecord
//! ```
//!
//! Provider failures never escape as errors. Only consent denial, admission
//! and store writes do. When the drain controller closes a session first,
//! the caller gets the outcome of the drain's final write.

use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigValidationError, CoordinatorConfig};
use crate::consent::{Authorization, ConsentGate, ConsentSource};
use crate::drain::{Lifecycle, ShutdownTrigger};
use crate::error::{Error, Result, StoreError};
use crate::provider::{self, AnalysisProvider};
use crate::session::{ActiveSessions, FinalWrite, LiveSession};
use crate::store::{Namespace, SessionStore};
use crate::synthesis::{MergeSynthesizer, Synthesizer};
use crate::types::{
    ClosingReason, ProviderResult, SHUTDOWN_REASON, SessionRecord, SubjectSnapshot,
};

/// Failure reason recorded when a provider panics.
pub const PANIC_REASON: &str = "provider panicked";

/// Failure reason recorded when the session timeout elapsed before a
/// provider slot became free.
pub const SATURATED_REASON: &str = "no provider slot available";

/// Failure reason recorded when a provider task vanished without settling.
pub const LOST_REASON: &str = "provider task lost";

/// Runs consent-gated provider fan-out sessions.
pub struct Coordinator {
    store: Arc<SessionStore>,
    gate: ConsentGate,
    providers: Vec<Arc<dyn AnalysisProvider>>,
    synthesizer: Arc<dyn Synthesizer>,
    config: CoordinatorConfig,
    session_slots: Arc<Semaphore>,
    provider_slots: Arc<Semaphore>,
    active: Arc<ActiveSessions>,
    lifecycle: Arc<Lifecycle>,
}

impl Coordinator {
    /// Create a coordinator over an explicitly constructed store.
    pub fn new(
        store: Arc<SessionStore>,
        consent: Arc<dyn ConsentSource>,
        providers: Vec<Arc<dyn AnalysisProvider>>,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        provider_names(&providers)?;
        if config.max_concurrent_sessions == 0 || config.max_inflight_providers == 0 {
            return Err(Error::Config(ConfigValidationError::InvalidValue {
                field: "coordinator".into(),
                message: "concurrency bounds must be greater than 0".into(),
            }));
        }

        Ok(Self {
            store,
            gate: ConsentGate::new(consent),
            providers,
            synthesizer: Arc::new(MergeSynthesizer),
            session_slots: Arc::new(Semaphore::new(config.max_concurrent_sessions)),
            provider_slots: Arc::new(Semaphore::new(config.max_inflight_providers)),
            config,
            active: Arc::new(ActiveSessions::new()),
            lifecycle: Arc::new(Lifecycle::new()),
        })
    }

    /// Replace the default [`MergeSynthesizer`].
    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn Synthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn providers(&self) -> &[Arc<dyn AnalysisProvider>] {
        &self.providers
    }

    pub fn synthesizer(&self) -> &Arc<dyn Synthesizer> {
        &self.synthesizer
    }

    pub fn active(&self) -> &Arc<ActiveSessions> {
        &self.active
    }

    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        self.lifecycle.clone()
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger::new(self.lifecycle.clone())
    }

    /// Union of the permissions the configured providers require.
    pub fn required_permissions(&self) -> Vec<String> {
        provider::required_permissions(&self.providers)
    }

    /// Run one session for `subject_id` against the configured providers.
    pub async fn run_session(&self, subject_id: &str) -> Result<SessionRecord> {
        self.run_session_with(subject_id, &self.providers).await
    }

    /// Run one session against an explicit provider set.
    ///
    /// Every call creates a new record; records from earlier calls for the
    /// same subject are never touched.
    pub async fn run_session_with(
        &self,
        subject_id: &str,
        providers: &[Arc<dyn AnalysisProvider>],
    ) -> Result<SessionRecord> {
        if !self.lifecycle.is_accepting() {
            return Err(Error::ShuttingDown);
        }
        let names = provider_names(providers)?;

        let required = provider::required_permissions(providers);
        if let Authorization::Denied(missing) = self.gate.authorize(subject_id, &required).await {
            return Err(Error::consent_denied(subject_id, missing));
        }

        let _slot = self.admit().await?;
        if !self.lifecycle.is_accepting() {
            return Err(Error::ShuttingDown);
        }

        let snapshot = Arc::new(self.load_snapshot(subject_id).await);
        let now = self.store.now();
        let expires_at = self.store.default_ttl(Namespace::Session).expires_at(now);
        let record = SessionRecord::new(subject_id, now, expires_at);
        self.store.save_session(&record).await?;

        let session = Arc::new(LiveSession::new(record, names));
        let _registration = self.active.register(session.clone());

        // A drain that started before registration cannot see this session.
        if !self.lifecycle.is_accepting() {
            return self.abandon(&session).await;
        }

        info!(
            session_id = %session.session_id(),
            subject_id = %subject_id,
            providers = providers.len(),
            "Session started"
        );

        self.fan_out(&session, snapshot, providers).await;
        self.complete(&session).await
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit> {
        let wait = self.config.admission_timeout();
        match timeout(wait, self.session_slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(Error::ShuttingDown),
            Err(_) => {
                warn!(waited_ms = self.config.admission_timeout_ms, "No session slot available");
                Err(Error::Saturated {
                    waited_ms: self.config.admission_timeout_ms,
                })
            }
        }
    }

    /// Stored snapshot for the subject, or a minimal one.
    async fn load_snapshot(&self, subject_id: &str) -> SubjectSnapshot {
        match self.store.load_profile(subject_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => SubjectSnapshot::minimal(subject_id),
            Err(e) => {
                warn!(subject_id = %subject_id, error = %e, "Snapshot load failed, using minimal snapshot");
                SubjectSnapshot::minimal(subject_id)
            }
        }
    }

    async fn fan_out(
        &self,
        session: &Arc<LiveSession>,
        snapshot: Arc<SubjectSnapshot>,
        providers: &[Arc<dyn AnalysisProvider>],
    ) {
        let deadline = Instant::now() + self.config.session_timeout();
        let cancel = CancellationToken::new();
        let started = Arc::new(Mutex::new(HashSet::new()));
        let mut tasks = JoinSet::new();

        for provider in providers {
            let call = ProviderCall {
                provider: provider.clone(),
                snapshot: snapshot.clone(),
                slots: self.provider_slots.clone(),
                limit: provider.timeout().unwrap_or(self.config.provider_timeout()),
                cancel: cancel.child_token(),
                lifecycle: self.lifecycle.clone(),
                started: started.clone(),
            };
            let session = session.clone();
            let store = self.store.clone();

            tasks.spawn(async move {
                let result = call.run().await;
                let name = call.provider.name();
                if !session.record_result(name, result, store.now()) {
                    debug!(session_id = %session.session_id(), provider = %name, "Late provider result discarded");
                }
            });
        }

        loop {
            let next = tokio::select! {
                next = timeout_at(deadline, tasks.join_next()) => next,
                _ = session.closed().cancelled() => {
                    // In-flight providers run on until they finish or hit their own timeout.
                    debug!(
                        session_id = %session.session_id(),
                        in_flight = tasks.len(),
                        "Session closed by drain, detaching providers"
                    );
                    tasks.detach_all();
                    break;
                }
            };
            match next {
                Ok(Some(Ok(()))) => {}
                Ok(Some(Err(e))) => {
                    error!(session_id = %session.session_id(), error = %e, "Provider task failed");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        session_id = %session.session_id(),
                        pending = tasks.len(),
                        "Session timeout elapsed, cancelling pending providers"
                    );
                    cancel.cancel();
                    tasks.abort_all();
                    let started = started.lock().clone();
                    let timed_out = session.fill_missing_with(
                        |name| {
                            if started.contains(name) {
                                ProviderResult::timed_out()
                            } else {
                                ProviderResult::failure(SATURATED_REASON, true)
                            }
                        },
                        self.store.now(),
                    );
                    debug!(session_id = %session.session_id(), providers = ?timed_out, "Recorded session timeouts");
                    break;
                }
            }
        }

        let lost = session.fill_missing(&ProviderResult::failure(LOST_REASON, false), self.store.now());
        if !lost.is_empty() {
            warn!(session_id = %session.session_id(), providers = ?lost, "Providers never settled");
        }
    }

    /// Synthesize, close and persist. If the drain controller closed the
    /// session first, wait for its final write instead.
    async fn complete(&self, session: &LiveSession) -> Result<SessionRecord> {
        let now = self.store.now();
        let synthesizer = &self.synthesizer;
        let finalized = session.try_finalize(|record, configured| {
            record.synthesized_analysis =
                Some(synthesizer.synthesize(&record.provider_results, configured, now));
            record.closing_recommendations =
                Some(synthesizer.close(record, ClosingReason::Completed, now));
        });

        let Some(record) = finalized else {
            debug!(session_id = %session.session_id(), "Session was closed by drain, awaiting its final write");
            return drained_result(session).await;
        };

        if let Err(e) = self.store.save_session(&record).await {
            error!(session_id = %record.session_id, error = %e, "Failed to persist session");
            return Err(e.into());
        }

        info!(
            session_id = %record.session_id,
            succeeded = record.provider_results.successes().count(),
            failed = record.provider_results.failure_count(),
            "Session finalized"
        );
        Ok(record)
    }

    /// Give up on a session registered after shutdown began.
    ///
    /// If the drain already claimed it, its final write decides the result.
    async fn abandon(&self, session: &LiveSession) -> Result<SessionRecord> {
        if session.try_finalize(|_, _| {}).is_none() {
            return drained_result(session).await;
        }

        debug!(session_id = %session.session_id(), "Session refused after shutdown began");
        if let Err(e) = self.store.delete_session(session.session_id()).await {
            debug!(session_id = %session.session_id(), error = %e, "Could not remove abandoned session record");
        }
        Err(Error::ShuttingDown)
    }
}

/// Result for a caller whose session was closed by the drain controller.
async fn drained_result(session: &LiveSession) -> Result<SessionRecord> {
    match session.final_write().await {
        FinalWrite::Persisted => Ok(session.snapshot()),
        FinalWrite::Failed(reason) => Err(Error::Store(StoreError::NotPersisted {
            session_id: session.session_id().to_string(),
            reason,
        })),
    }
}

/// One provider invocation inside a session.
struct ProviderCall {
    provider: Arc<dyn AnalysisProvider>,
    snapshot: Arc<SubjectSnapshot>,
    slots: Arc<Semaphore>,
    limit: Duration,
    cancel: CancellationToken,
    lifecycle: Arc<Lifecycle>,
    started: Arc<Mutex<HashSet<String>>>,
}

impl ProviderCall {
    /// Invoke the provider, converting every outcome into a [`ProviderResult`].
    ///
    /// The provider timeout starts once a provider slot is held. No call is
    /// started after shutdown has been requested.
    async fn run(&self) -> ProviderResult {
        let name = self.provider.name();
        let _permit = tokio::select! {
            permit = self.slots.clone().acquire_owned() => permit,
            _ = self.cancel.cancelled() => {
                return ProviderResult::failure(SATURATED_REASON, true);
            }
        };

        if self.lifecycle.is_shutdown_requested() {
            debug!(provider = %name, "Shutdown requested, provider not started");
            return ProviderResult::failure(SHUTDOWN_REASON, true);
        }
        self.started.lock().insert(name.to_string());

        let call = AssertUnwindSafe(self.provider.invoke(&self.snapshot, self.cancel.clone()))
            .catch_unwind();
        match timeout(self.limit, call).await {
            Ok(Ok(Ok(payload))) => ProviderResult::success(payload),
            Ok(Ok(Err(e))) => {
                debug!(provider = %name, error = %e, "Provider failed");
                ProviderResult::failure(e.to_string(), e.is_recoverable())
            }
            Ok(Err(_)) => {
                error!(provider = %name, "Provider panicked");
                ProviderResult::failure(PANIC_REASON, false)
            }
            Err(_) => {
                self.cancel.cancel();
                debug!(provider = %name, timeout_ms = self.limit.as_millis() as u64, "Provider timed out");
                ProviderResult::timed_out()
            }
        }
    }
}

/// Provider names in configuration order. Names must be unique.
fn provider_names(providers: &[Arc<dyn AnalysisProvider>]) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut names = Vec::with_capacity(providers.len());
    for provider in providers {
        let name = provider.name().to_string();
        if !seen.insert(name.clone()) {
            return Err(Error::Config(ConfigValidationError::InvalidValue {
                field: "providers".into(),
                message: format!("duplicate provider name '{}'", name),
            }));
        }
        names.push(name);
    }
    Ok(names)
}
