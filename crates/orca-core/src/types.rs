//! Shared types for orca-core.
//!
//! These are the records that move between the consent gate, the coordinator,
//! the drain controller and the session store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Failure reason recorded for providers that ran out of time.
pub const TIMEOUT_REASON: &str = "timeout";

/// Failure reason recorded for providers that were still pending when the
/// process drained.
pub const SHUTDOWN_REASON: &str = "interrupted by shutdown";

// ─────────────────────────────────────────────────────────────────────────────
// Subject Types
// ─────────────────────────────────────────────────────────────────────────────

/// Snapshot of the permission flags a subject granted at request time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub subject_id: String,
    pub permissions: BTreeMap<String, bool>,
    pub captured_at: DateTime<Utc>,
}

impl ConsentRecord {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            permissions: BTreeMap::new(),
            captured_at: Utc::now(),
        }
    }

    /// Set a permission flag
    pub fn with_permission(mut self, name: impl Into<String>, granted: bool) -> Self {
        self.permissions.insert(name.into(), granted);
        self
    }

    /// A permission counts as granted only when explicitly set to true.
    pub fn is_granted(&self, permission: &str) -> bool {
        self.permissions.get(permission).copied().unwrap_or(false)
    }

    /// Required permissions not granted by this record, in input order.
    pub fn missing<'a>(&self, required: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        required
            .into_iter()
            .filter(|p| !self.is_granted(p))
            .cloned()
            .collect()
    }
}

/// Subject data handed to every provider of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectSnapshot {
    pub subject_id: String,
    #[serde(default)]
    pub attributes: Value,
    pub captured_at: DateTime<Utc>,
}

impl SubjectSnapshot {
    /// Snapshot carrying nothing but the subject id.
    pub fn minimal(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            attributes: Value::Null,
            captured_at: Utc::now(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider Results
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of one provider for one session.
///
/// The payload is opaque to the coordinator; only a synthesizer reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProviderResult {
    Success { payload: Value },
    Failure { reason: String, recoverable: bool },
}

impl ProviderResult {
    pub fn success(payload: Value) -> Self {
        Self::Success { payload }
    }

    pub fn failure(reason: impl Into<String>, recoverable: bool) -> Self {
        Self::Failure {
            reason: reason.into(),
            recoverable,
        }
    }

    /// Recorded when a per-provider or global timeout elapses.
    pub fn timed_out() -> Self {
        Self::failure(TIMEOUT_REASON, true)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Success { payload } => Some(payload),
            Self::Failure { .. } => None,
        }
    }
}

/// A settled provider slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderOutcome {
    pub provider: String,
    pub result: ProviderResult,
    pub settled_at: DateTime<Utc>,
}

/// Provider results of a session, in completion order.
///
/// Each provider name occupies at most one slot and a filled slot is never
/// overwritten.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderResults(Vec<ProviderOutcome>);

impl ProviderResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill the slot for `provider`. Returns false if it was already filled.
    pub fn insert_once(
        &mut self,
        provider: &str,
        result: ProviderResult,
        settled_at: DateTime<Utc>,
    ) -> bool {
        if self.contains(provider) {
            return false;
        }
        self.0.push(ProviderOutcome {
            provider: provider.to_string(),
            result,
            settled_at,
        });
        true
    }

    pub fn get(&self, provider: &str) -> Option<&ProviderResult> {
        self.0
            .iter()
            .find(|o| o.provider == provider)
            .map(|o| &o.result)
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.0.iter().any(|o| o.provider == provider)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProviderOutcome> {
        self.0.iter()
    }

    /// Successful payloads keyed by provider name.
    pub fn successes(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0
            .iter()
            .filter_map(|o| o.result.payload().map(|p| (o.provider.as_str(), p)))
    }

    pub fn failure_count(&self) -> usize {
        self.0.iter().filter(|o| !o.result.is_success()).count()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Synthesis
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisStatus {
    /// Every configured provider contributed.
    Complete,
    /// Some providers failed; the analysis covers the rest.
    Partial,
    /// No provider succeeded.
    InsufficientData,
}

/// Merged view over the successful provider payloads of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesizedAnalysis {
    pub status: SynthesisStatus,
    /// Providers whose payloads were merged, sorted by name.
    pub contributors: Vec<String>,
    /// Payloads keyed by provider name.
    pub findings: BTreeMap<String, Value>,
    /// Fraction of configured providers that contributed.
    pub coverage: f64,
    pub synthesized_at: DateTime<Utc>,
}

impl SynthesizedAnalysis {
    pub fn is_insufficient(&self) -> bool {
        self.status == SynthesisStatus::InsufficientData
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosingReason {
    /// The session settled normally.
    Completed,
    /// The drain controller closed the session during shutdown.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosingRecommendations {
    pub reason: ClosingReason,
    pub recommendations: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Providers are still running.
    Active,
    /// Every provider slot is filled.
    Settled,
    /// Closing recommendations attached; no further mutation.
    Finalized,
}

/// One orchestration run for a single subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub subject_id: String,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub provider_results: ProviderResults,
    pub synthesized_analysis: Option<SynthesizedAnalysis>,
    pub closing_recommendations: Option<ClosingRecommendations>,
    /// None when the session namespace is configured without expiry.
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// Create a fresh record with a new session id.
    pub fn new(
        subject_id: impl Into<String>,
        created_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            subject_id: subject_id.into(),
            created_at,
            status: SessionStatus::Active,
            provider_results: ProviderResults::new(),
            synthesized_analysis: None,
            closing_recommendations: None,
            expires_at,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.status == SessionStatus::Finalized
    }
}
