//! Consent gate.
//!
//! Authorization is evaluated once per session against the union of the
//! permissions the provider set requires. It fails closed: one missing
//! permission denies the whole session, and so does a subject without a
//! consent record.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::SessionStore;
use crate::types::ConsentRecord;

/// Read-only source of consent records.
///
/// Any caching is the source's own business.
#[async_trait]
pub trait ConsentSource: Send + Sync {
    /// `Ok(None)` when the subject has no consent record.
    async fn fetch_consent(&self, subject_id: &str) -> Result<Option<ConsentRecord>>;
}

/// Outcome of [`ConsentGate::authorize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Granted,
    /// Permissions that were required but not granted.
    Denied(Vec<String>),
}

impl Authorization {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

pub struct ConsentGate {
    source: Arc<dyn ConsentSource>,
}

impl ConsentGate {
    pub fn new(source: Arc<dyn ConsentSource>) -> Self {
        Self { source }
    }

    /// Check that `subject_id` granted every permission in `required`.
    ///
    /// An empty requirement list authorizes without consulting the source.
    /// A source error is treated like a missing record.
    pub async fn authorize(&self, subject_id: &str, required: &[String]) -> Authorization {
        if required.is_empty() {
            return Authorization::Granted;
        }

        let missing = match self.source.fetch_consent(subject_id).await {
            Ok(Some(record)) => record.missing(required),
            Ok(None) => {
                debug!(subject_id = %subject_id, "No consent record on file");
                required.to_vec()
            }
            Err(e) => {
                warn!(subject_id = %subject_id, error = %e, "Consent lookup failed, denying");
                required.to_vec()
            }
        };

        if missing.is_empty() {
            Authorization::Granted
        } else {
            info!(subject_id = %subject_id, missing = ?missing, "Consent denied");
            Authorization::Denied(missing)
        }
    }
}

/// In-memory consent records, keyed by subject.
#[derive(Debug, Default)]
pub struct StaticConsentSource {
    records: RwLock<HashMap<String, ConsentRecord>>,
}

impl StaticConsentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = ConsentRecord>) -> Self {
        let source = Self::new();
        for record in records {
            source.insert(record);
        }
        source
    }

    /// Add or replace the record for `record.subject_id`.
    pub fn insert(&self, record: ConsentRecord) {
        self.records.write().insert(record.subject_id.clone(), record);
    }
}

#[async_trait]
impl ConsentSource for StaticConsentSource {
    async fn fetch_consent(&self, subject_id: &str) -> Result<Option<ConsentRecord>> {
        Ok(self.records.read().get(subject_id).cloned())
    }
}

/// Consent records kept in the profile namespace of the session store.
pub struct StoredConsentSource {
    store: Arc<SessionStore>,
}

impl StoredConsentSource {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ConsentSource for StoredConsentSource {
    async fn fetch_consent(&self, subject_id: &str) -> Result<Option<ConsentRecord>> {
        Ok(self.store.load_consent(subject_id).await?)
    }
}
