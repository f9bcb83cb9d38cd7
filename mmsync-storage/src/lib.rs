//! mmsync Storage - Client-side element state
//!
//! Holds everything the sync layer keeps in memory between requests:
//! the aliased element cache, edit overlays layered on top of it, and the
//! registry of open edits. Nothing here performs I/O.

pub mod cache;
pub mod overlay;
pub mod shared;
pub mod tracker;

pub use cache::{CacheStats, ElementCache, WriteSeq};
pub use overlay::{restore_user_fields, EditOverlayStore};
pub use shared::{ElementRef, HistoryRef, Shared};
pub use tracker::{EditTracker, EditTrackerEvent, TrackerKey};
