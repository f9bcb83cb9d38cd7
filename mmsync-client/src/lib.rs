//! mmsync Client - Element synchronization
//!
//! The network-facing half of mmsync. [`ElementService`] coalesces
//! identical reads, admits requests by priority, saves edits with
//! optimistic-concurrency conflict handling and groups bulk saves by
//! project and ref. All state it touches lives in `mmsync-storage`.

pub mod bulk;
pub mod conflict;
pub mod context;
pub mod coordinator;
pub mod http;
pub mod scheduler;
pub mod service;
pub mod status;

pub use bulk::{BulkReport, BulkUpdateGrouper};
pub use conflict::{
    is_real_conflict, ConflictChoice, ConflictResolver, PendingConflict, SaveOptions, SaveOutcome,
};
pub use context::SyncContext;
pub use coordinator::{EpochToken, RequestCoordinator, SharedResult};
pub use http::HttpTransport;
pub use scheduler::{PriorityScheduler, SchedulerPermit, Ticket};
pub use service::{ElementService, GetOptions, OutdatedStatus};
pub use status::{MmsStatusTranslator, StatusTranslator};
