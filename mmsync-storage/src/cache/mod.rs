//! Multi-key element cache.
//!
//! One canonical slot exists per real element identity. Requests made in a
//! different context (another ref name, a later commit that did not touch
//! the element, a `"latest"` alias) store an alias pointing at that slot, so
//! every reader converges on the same [`ElementRef`](crate::ElementRef).
//!
//! # Write ordering
//!
//! Writes carry a [`WriteSeq`] taken from [`ElementCache::next_seq`]. Reads
//! take theirs when the request is issued, saves when they commit. Under
//! [`StaleWritePolicy::RejectOlder`](mmsync_core::StaleWritePolicy) a read
//! result that was issued before the value already in the slot is dropped.

pub mod element_cache;
pub mod stats;

pub use element_cache::{ElementCache, WriteSeq};
pub use stats::CacheStats;
