//! A session whose providers may still be running.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::types::{ProviderResult, SessionRecord, SessionStatus};

/// Outcome of the final write of a session closed by the drain controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalWrite {
    Persisted,
    Failed(String),
}

/// Shared, lock-protected view of one running session.
///
/// Provider slots are write-once and the record is frozen once finalized;
/// both rules are enforced here, under one lock.
#[derive(Debug)]
pub struct LiveSession {
    session_id: String,
    configured: Vec<String>,
    record: Mutex<SessionRecord>,
    closed: CancellationToken,
    final_write: watch::Sender<Option<FinalWrite>>,
}

impl LiveSession {
    pub fn new(record: SessionRecord, configured: Vec<String>) -> Self {
        Self {
            session_id: record.session_id.clone(),
            configured,
            record: Mutex::new(record),
            closed: CancellationToken::new(),
            final_write: watch::Sender::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Provider names this session was started with.
    pub fn configured(&self) -> &[String] {
        &self.configured
    }

    /// Cancelled once the session is finalized.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Fill the slot for `provider`.
    ///
    /// Returns false when the slot was already filled, the provider is not
    /// part of this session, or the session is finalized.
    pub fn record_result(&self, provider: &str, result: ProviderResult, at: DateTime<Utc>) -> bool {
        if !self.configured.iter().any(|name| name == provider) {
            return false;
        }

        let mut record = self.record.lock();
        if record.is_finalized() {
            return false;
        }
        let inserted = record.provider_results.insert_once(provider, result, at);
        if inserted && record.provider_results.len() == self.configured.len() {
            record.status = SessionStatus::Settled;
        }
        inserted
    }

    /// Fill every empty slot with `result` and return the providers affected.
    pub fn fill_missing(&self, result: &ProviderResult, at: DateTime<Utc>) -> Vec<String> {
        self.fill_missing_with(|_| result.clone(), at)
    }

    /// Fill every empty slot with `result_for(provider)`.
    pub fn fill_missing_with(
        &self,
        result_for: impl Fn(&str) -> ProviderResult,
        at: DateTime<Utc>,
    ) -> Vec<String> {
        let mut record = self.record.lock();
        if record.is_finalized() {
            return Vec::new();
        }

        let mut filled = Vec::new();
        for name in &self.configured {
            if record.provider_results.insert_once(name, result_for(name), at) {
                filled.push(name.clone());
            }
        }
        if record.provider_results.len() == self.configured.len() {
            record.status = SessionStatus::Settled;
        }
        filled
    }

    /// Apply `close` and mark the record finalized, unless someone already did.
    ///
    /// Returns the finalized record to the caller that won.
    pub fn try_finalize(
        &self,
        close: impl FnOnce(&mut SessionRecord, &[String]),
    ) -> Option<SessionRecord> {
        let mut record = self.record.lock();
        if record.is_finalized() {
            return None;
        }
        close(&mut record, &self.configured);
        record.status = SessionStatus::Finalized;
        self.closed.cancel();
        Some(record.clone())
    }

    /// Record how the drain's final write ended. Only the first report counts.
    pub fn report_final_write(&self, outcome: FinalWrite) -> bool {
        self.final_write.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    /// Wait for [`LiveSession::report_final_write`].
    pub async fn final_write(&self) -> FinalWrite {
        let mut outcome = self.final_write.subscribe();
        let reported = match outcome.wait_for(Option::is_some).await {
            Ok(reported) => reported.clone(),
            Err(_) => None,
        };
        reported.unwrap_or_else(|| FinalWrite::Failed("final write never reported".into()))
    }

    pub fn snapshot(&self) -> SessionRecord {
        self.record.lock().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.record.lock().status
    }
}
