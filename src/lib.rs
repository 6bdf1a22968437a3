//! Cash Operations Backend Library
//!
//! Finance-grade cash operations core: ingestion and canonicalization of
//! AR/AP/bank data, tiered bank reconciliation, probabilistic cash
//! forecasting, snapshot lock workflow, the seven-check invariant engine,
//! the 13-week cash calendar and the trust report with lock gates.

pub mod calendar;
pub mod config;
pub mod connectors;
pub mod error;
pub mod forecast;
pub mod ingest;
pub mod invariants;
pub mod matching;
pub mod models;
pub mod store;
pub mod trust;
pub mod workflow;

// Re-export the engines and the store handle for binaries and tests.
pub use calendar::CashCalendarBuilder;
pub use config::Config;
pub use error::{DomainError, Result};
pub use forecast::ForecastEngine;
pub use ingest::{promote_dataset, SyncOrchestrator};
pub use invariants::InvariantEngine;
pub use matching::MatchingEngine;
pub use store::Store;
pub use trust::TrustEngine;
pub use workflow::SnapshotWorkflow;
