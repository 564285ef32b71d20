//! orca-core - Core library for Orca
//!
//! Consent-gated session orchestration:
//!
//! - **consent**: Session-level authorization against a consent source
//! - **coordinator**: Concurrent provider fan-out with partial-failure tolerance
//! - **synthesis**: Pluggable merge of provider payloads
//! - **store**: Namespaced, TTL-aware session store (memory / SQLite backends)
//! - **drain**: Graceful shutdown state machine
//! - **session**: Tracking of in-flight sessions
//! - **provider**: Analysis provider contract

pub mod clock;
pub mod config;
pub mod consent;
pub mod coordinator;
pub mod drain;
pub mod error;
pub mod provider;
pub mod session;
pub mod store;
pub mod synthesis;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::OrcaConfig;
pub use consent::{Authorization, ConsentGate, ConsentSource};
pub use coordinator::Coordinator;
pub use drain::{DrainController, DrainOutcome, DrainReport, ShutdownReason, ShutdownTrigger};
pub use error::{Error, ProviderError, Result, StoreError};
pub use provider::AnalysisProvider;
pub use store::{Namespace, SessionStore, Ttl};
pub use types::{
    ConsentRecord, ProviderResult, ProviderResults, SessionRecord, SubjectSnapshot,
    SynthesizedAnalysis,
};
