//! Analysis provider contract.
//!
//! A provider turns a subject snapshot into one opaque payload. The
//! coordinator runs every configured provider concurrently, so
//! implementations must tolerate concurrent invocation and should return
//! promptly once `cancel` fires.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use orca_core::provider::AnalysisProvider;
//! use orca_core::{ProviderError, SubjectSnapshot};
//! use serde_json::{json, Value};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl AnalysisProvider for Echo {
//!     fn name(&self) -> &str {
//!         "echo"
//!     }
//!
//!     fn required_permissions(&self) -> Vec<String> {
//!         vec!["profile.read".into()]
//!     }
//!
//!     async fn invoke(
//!         &self,
//!         snapshot: &SubjectSnapshot,
//!         _cancel: CancellationToken,
//!     ) -> Result<Value, ProviderError> {
//!         Ok(json!({ "subject": snapshot.subject_id }))
//!     }
//! }
//! ```

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::types::SubjectSnapshot;

#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// Unique name; used as the key in a session's provider results.
    fn name(&self) -> &str;

    /// Consent permissions this provider needs.
    fn required_permissions(&self) -> Vec<String> {
        Vec::new()
    }

    /// Per-provider timeout override. `None` uses the coordinator default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn invoke(
        &self,
        snapshot: &SubjectSnapshot,
        cancel: CancellationToken,
    ) -> Result<Value, ProviderError>;
}

/// Sorted, de-duplicated union of the permissions a provider set requires.
pub fn required_permissions(providers: &[Arc<dyn AnalysisProvider>]) -> Vec<String> {
    providers
        .iter()
        .flat_map(|p| p.required_permissions())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
