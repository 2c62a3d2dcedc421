//! Keyward sync engine.
//!
//! Zero-knowledge synchronization of one vault with one remote provider:
//! - Sealed snapshots only; providers never see plaintext or keys
//! - Version comparison before every upload
//! - Last-write-wins merge with accurate conflict reporting
//! - Timeouts, bounded retry with backoff, and cancellation on lock
//! - Local staging of blobs that could not be uploaded, with bounded
//!   follow-up attempts

pub mod conflict;
pub mod engine;
pub mod retry;
pub mod scheduler;
pub mod staging;
pub mod state;

pub use conflict::{
    ConflictReport, ConflictResolver, ConflictStrategy, EntryConflict, MergeOutcome, Side,
};
pub use engine::{SyncEngine, SyncEngineConfig, SyncOutcome};
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{RetryScheduler, ScheduleOutcome};
pub use staging::{StagedUpload, StagingArea};
pub use state::{SyncState, SyncStatus};
