//! gilliam-scheduler — capacity accounting, leases and the reconciliation loop.
//!
//! # Architecture
//!
//! ```text
//! Scheduler
//!   ├── Ledger (per-node locks, atomic reserve/release)
//!   ├── LoopState (one async lock)
//!   │   ├── WorkQueue (every work unit, pending ordered by priority)
//!   │   ├── LeaseManager (active leases, expiry)
//!   │   └── TokenBucket (optional dispatch limit)
//!   └── StateStore (every transition written through)
//! ```
//!
//! Placement decisions come from `gilliam-placement` and are only advisory
//! until the lease manager commits them against the ledger.

pub mod error;
pub mod lease;
pub mod ledger;
pub mod queue;
pub mod rate_limit;
mod recovery;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use lease::{LeaseError, LeaseManager};
pub use ledger::{Ledger, LedgerError, Reservation};
pub use queue::WorkQueue;
pub use rate_limit::TokenBucket;
pub use scheduler::{CycleReport, Placement, Scheduler};
