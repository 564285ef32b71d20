//! Fakes shared by the unit tests.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::consent::{ConsentSource, StaticConsentSource};
use crate::error::{Error, ProviderError, Result};
use crate::provider::AnalysisProvider;
use crate::types::{ConsentRecord, SubjectSnapshot};

#[derive(Debug, Clone)]
enum Behavior {
    Succeed(Value),
    Fail(ProviderError),
    Panic,
}

/// Provider that sleeps for a fixed delay, then succeeds, fails or panics.
#[derive(Debug, Clone)]
pub struct FakeProvider {
    name: String,
    permissions: Vec<String>,
    delay: Duration,
    timeout: Option<Duration>,
    behavior: Behavior,
    calls: Arc<AtomicUsize>,
    completions: Arc<AtomicUsize>,
}

impl FakeProvider {
    fn with_behavior(name: &str, behavior: Behavior) -> Self {
        Self {
            name: name.to_string(),
            permissions: Vec::new(),
            delay: Duration::ZERO,
            timeout: None,
            behavior,
            calls: Arc::new(AtomicUsize::new(0)),
            completions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn succeeding(name: &str) -> Self {
        Self::with_behavior(name, Behavior::Succeed(json!({ "provider": name })))
    }

    pub fn succeeding_with(name: &str, payload: Value) -> Self {
        Self::with_behavior(name, Behavior::Succeed(payload))
    }

    pub fn failing(name: &str, error: ProviderError) -> Self {
        Self::with_behavior(name, Behavior::Fail(error))
    }

    pub fn panicking(name: &str) -> Self {
        Self::with_behavior(name, Behavior::Panic)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_permissions(mut self, permissions: &[&str]) -> Self {
        self.permissions = permissions.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Shared invocation counter, readable after the provider moved into an Arc.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    /// Calls that ran their full delay without being cancelled.
    pub fn completion_counter(&self) -> Arc<AtomicUsize> {
        self.completions.clone()
    }
}

#[async_trait]
impl AnalysisProvider for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_permissions(&self) -> Vec<String> {
        self.permissions.clone()
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn invoke(
        &self,
        _snapshot: &SubjectSnapshot,
        cancel: CancellationToken,
    ) -> std::result::Result<Value, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => {
                    return Err(ProviderError::Cancelled(self.name.clone()));
                }
            }
        }
        self.completions.fetch_add(1, Ordering::SeqCst);

        match &self.behavior {
            Behavior::Succeed(payload) => Ok(payload.clone()),
            Behavior::Fail(err) => Err(err.clone()),
            Behavior::Panic => panic!("{} exploded", self.name),
        }
    }
}

/// Consent source that counts fetches and can be switched to fail.
#[derive(Debug, Default)]
pub struct CountingConsentSource {
    inner: StaticConsentSource,
    fetches: AtomicUsize,
    failing: bool,
}

impl CountingConsentSource {
    pub fn with_records(records: impl IntoIterator<Item = ConsentRecord>) -> Self {
        Self {
            inner: StaticConsentSource::from_records(records),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConsentSource for CountingConsentSource {
    async fn fetch_consent(&self, subject_id: &str) -> Result<Option<ConsentRecord>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(Error::Other("consent service unreachable".into()));
        }
        self.inner.fetch_consent(subject_id).await
    }
}
