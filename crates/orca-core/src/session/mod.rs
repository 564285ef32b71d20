//! In-flight session tracking.
//!
//! ## Ownership
//!
//! ```text
//! Coordinator::run_session
//!   │
//!   ├─► register LiveSession ──────────────┐
//!   │                                      │
//!   ├─► provider tasks ─► record_result    │  ActiveSessions
//!   │                                      │  (read by the drain
//!   ├─► try_finalize(Completed)            │   controller)
//!   │                                      │
//!   └─► Registration dropped ─► unregister ┘
//!
//! DrainController
//!   └─► try_finalize(Shutdown) on whatever is still registered
//! ```
//!
//! Whoever wins `try_finalize` owns the final write; the loser leaves the
//! record alone. When the drain wins, it reports the write outcome through
//! `report_final_write` and the coordinator returns that to its caller.

mod live;
mod registry;

pub use live::{FinalWrite, LiveSession};
pub use registry::{ActiveSessions, Registration};
