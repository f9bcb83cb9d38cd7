//! mmsync Core - Element Types
//!
//! Pure data structures and collaborator contracts shared by every other
//! mmsync crate. Caching, edit overlays and the save protocol live in
//! `mmsync-storage` and `mmsync-client`; this crate only describes the
//! shapes they exchange.

pub mod config;
pub mod element;
pub mod error;
pub mod key;
pub mod transport;
pub mod wire;

pub use config::{StaleWritePolicy, SyncConfig};
pub use element::{
    CommitRecord, Element, ElementRequest, ElementType, ElementsRequest, RefScope, Timestamp,
    DEFAULT_REF, LATEST,
};
pub use error::{
    ConfigError, FailureReason, StorageError, SyncError, SyncResult, TransportFailure,
    ValidationError,
};
pub use key::{CacheKey, HistoryKey, KeyVariant};
pub use transport::{SourceProvider, StaticSource, Transport};
pub use wire::{CommitsResponse, ElementsPost, ElementsResponse, IdRef, Priority, Rejection};
