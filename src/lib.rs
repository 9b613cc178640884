//! Session-scoped market matrix pipeline
//!
//! Live NxN benchmark grids are staged, committed atomically per tick, and
//! used to derive percent-change, delta and anchor-relative matrices. Every
//! row is partitioned by session.
//!
//! Modules:
//! - `stage` / `commit`: two-phase write path over `matrices_staging` → `matrices`
//! - `stamps`: opening/snapshot/trade anchor stamps
//! - `derived`: derived metric engine over a `BenchmarkProvider`
//! - `store`: per-tick transaction protocol and read-side payload
//! - `pipeline`: universe → snapshot → persist → read orchestration
//! - `freeze`: unchanged-value streaks for presentation

pub mod commit;
pub mod config;
pub mod db;
pub mod derived;
pub mod error;
pub mod freeze;
pub mod pipeline;
pub mod provider;
pub mod query;
pub mod snapshot;
pub mod stage;
pub mod stamps;
pub mod store;
pub mod types;
pub mod universe;
pub mod view;

pub use commit::CommitReport;
pub use derived::{BenchmarkProvider, DerivedEngine, DerivedMatrices};
pub use error::{MatrixError, MatrixResult};
pub use freeze::{FreezeBucket, FreezeTracker};
pub use pipeline::MatrixPipeline;
pub use snapshot::{HttpSnapshotProvider, LiveSnapshotProvider};
pub use stamps::{LocalStampCache, StampCache, StampCoordinator, StampResult};
pub use store::{MatrixStore, TickReport};
pub use types::{LiveSnapshot, MatrixGrid, MatrixType, SessionContext, SessionKey, StampFlags};
pub use universe::{CoinUniverse, CoinUniverseResolver, StaticUniverseResolver};
pub use view::{MatrixSnapshotView, MatrixView, ViewMeta};
