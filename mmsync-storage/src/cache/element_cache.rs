//! In-memory element cache with aliases, commit snapshots and tombstones.

use super::stats::CacheStats;
use crate::shared::{ElementRef, HistoryRef};
use mmsync_core::{
    CacheKey, CommitRecord, Element, HistoryKey, KeyVariant, StaleWritePolicy, StorageError,
    LATEST,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::{debug, warn};

/// Monotonic write sequence number. Higher means issued later.
pub type WriteSeq = u64;

#[derive(Debug, Clone)]
enum Slot {
    Value { element: ElementRef, seq: WriteSeq },
    Alias(CacheKey),
}

fn poisoned<G>(_: G) -> StorageError {
    StorageError::LockPoisoned {
        what: "element cache",
    }
}

/// Process-scoped element cache.
///
/// Lookups follow at most one alias hop. Values are [`ElementRef`] handles
/// that are replaced in place on rewrite, so a handle obtained earlier
/// keeps tracking the slot.
#[derive(Debug)]
pub struct ElementCache {
    slots: RwLock<HashMap<CacheKey, Slot>>,
    histories: RwLock<HashMap<HistoryKey, HistoryRef>>,
    policy: StaleWritePolicy,
    seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for ElementCache {
    fn default() -> Self {
        Self::new(StaleWritePolicy::RejectOlder)
    }
}

impl ElementCache {
    pub fn new(policy: StaleWritePolicy) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            histories: RwLock::new(HashMap::new()),
            policy,
            seq: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> StaleWritePolicy {
        self.policy
    }

    /// Take the next write sequence number.
    pub fn next_seq(&self) -> WriteSeq {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    // ========================================================================
    // ELEMENT SLOTS
    // ========================================================================

    pub fn get(&self, key: &CacheKey) -> Result<Option<ElementRef>, StorageError> {
        let slots = self.slots.read().map_err(poisoned)?;
        let found = resolve(&slots, key);
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(found)
    }

    pub fn exists(&self, key: &CacheKey) -> Result<bool, StorageError> {
        let slots = self.slots.read().map_err(poisoned)?;
        Ok(resolve(&slots, key).is_some())
    }

    /// Store `element` as the answer to `requested`.
    ///
    /// The value lands at the canonical key derived from the element's own
    /// identity. When that differs from `requested`, an alias is stored at
    /// `requested`. A read through `"latest"` also records a snapshot under
    /// the element's concrete commit.
    pub fn put(
        &self,
        requested: &CacheKey,
        element: Element,
        seq: WriteSeq,
    ) -> Result<ElementRef, StorageError> {
        let canonical = canonical_key(requested, &element);
        let snapshot = snapshot_key(requested, &canonical, &element).map(|k| (k, element.clone()));

        let mut slots = self.slots.write().map_err(poisoned)?;
        let handle = self.write_value(&mut slots, &canonical, element, seq)?;
        if let Some((key, copy)) = snapshot {
            self.write_value(&mut slots, &key, copy, seq)?;
        }
        if *requested != canonical {
            debug!(requested = %requested, canonical = %canonical, "Caching alias");
            slots.insert(requested.clone(), Slot::Alias(canonical));
        }
        Ok(handle)
    }

    /// Record that the element behind `requested` was deleted.
    ///
    /// `element` is the last known version. It is stored at its commit key
    /// and the deleted-variant of `requested` aliases it.
    pub fn put_deleted(
        &self,
        requested: &CacheKey,
        element: Element,
        seq: WriteSeq,
    ) -> Result<ElementRef, StorageError> {
        let commit = if element.commit_id.is_empty() {
            requested.commit_id.clone()
        } else {
            element.commit_id.clone()
        };
        let base = requested.with_variant(KeyVariant::Read).with_commit(commit);
        let canonical = canonical_key(&base, &element);

        let mut slots = self.slots.write().map_err(poisoned)?;
        let handle = self.write_value(&mut slots, &canonical, element, seq)?;
        let tombstone = requested.with_variant(KeyVariant::Deleted);
        debug!(tombstone = %tombstone, version = %canonical, "Caching tombstone");
        slots.insert(tombstone, Slot::Alias(canonical));
        Ok(handle)
    }

    /// Last known version of an element the server reported as deleted.
    pub fn get_deleted(&self, requested: &CacheKey) -> Result<Option<ElementRef>, StorageError> {
        self.get(&requested.with_variant(KeyVariant::Deleted))
    }

    /// Remove a slot. Removing an alias also removes the slot it points at.
    pub fn remove(&self, key: &CacheKey) -> Result<Option<ElementRef>, StorageError> {
        let mut slots = self.slots.write().map_err(poisoned)?;
        Ok(match slots.remove(key) {
            Some(Slot::Value { element, .. }) => Some(element),
            Some(Slot::Alias(target)) => match slots.remove(&target) {
                Some(Slot::Value { element, .. }) => Some(element),
                _ => None,
            },
            None => None,
        })
    }

    fn write_value(
        &self,
        slots: &mut HashMap<CacheKey, Slot>,
        key: &CacheKey,
        element: Element,
        seq: WriteSeq,
    ) -> Result<ElementRef, StorageError> {
        if let Some(Slot::Value {
            element: existing,
            seq: current,
        }) = slots.get_mut(key)
        {
            if key.variant == KeyVariant::Read
                && self.policy == StaleWritePolicy::RejectOlder
                && seq < *current
            {
                warn!(key = %key, seq, current = *current, "Dropping stale cache write");
                return Ok(existing.clone());
            }
            existing.replace(element)?;
            *current = (*current).max(seq);
            return Ok(existing.clone());
        }
        let handle = ElementRef::new(element);
        slots.insert(
            key.clone(),
            Slot::Value {
                element: handle.clone(),
                seq,
            },
        );
        Ok(handle)
    }

    // ========================================================================
    // HISTORY LISTS
    // ========================================================================

    pub fn history(&self, key: &HistoryKey) -> Result<Option<HistoryRef>, StorageError> {
        let histories = self.histories.read().map_err(poisoned)?;
        Ok(histories.get(key).cloned())
    }

    pub fn put_history(
        &self,
        key: HistoryKey,
        commits: Vec<CommitRecord>,
    ) -> Result<HistoryRef, StorageError> {
        let mut histories = self.histories.write().map_err(poisoned)?;
        if let Some(existing) = histories.get(&key) {
            existing.replace(commits)?;
            return Ok(existing.clone());
        }
        let handle = HistoryRef::new(commits);
        histories.insert(key, handle.clone());
        Ok(handle)
    }

    /// Prepend `record` to the cached list, if one is cached.
    ///
    /// Returns whether a list was updated.
    pub fn push_history_entry(
        &self,
        key: &HistoryKey,
        record: CommitRecord,
    ) -> Result<bool, StorageError> {
        let Some(list) = self.history(key)? else {
            return Ok(false);
        };
        list.update(|commits| {
            if commits.first().map(|head| head.id.as_str()) != Some(record.id.as_str())
                || record.id == LATEST
            {
                commits.insert(0, record);
            }
        })?;
        Ok(true)
    }

    // ========================================================================
    // HOUSEKEEPING
    // ========================================================================

    /// Drop every slot and history list.
    pub fn clear(&self) -> Result<(), StorageError> {
        self.slots.write().map_err(poisoned)?.clear();
        self.histories.write().map_err(poisoned)?.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> Result<CacheStats, StorageError> {
        let slots = self.slots.read().map_err(poisoned)?;
        let aliases = slots
            .values()
            .filter(|slot| matches!(slot, Slot::Alias(_)))
            .count() as u64;
        let history_count = self.histories.read().map_err(poisoned)?.len() as u64;
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: slots.len() as u64 - aliases,
            alias_count: aliases,
            history_count,
        })
    }
}

fn resolve(slots: &HashMap<CacheKey, Slot>, key: &CacheKey) -> Option<ElementRef> {
    match slots.get(key)? {
        Slot::Value { element, .. } => Some(element.clone()),
        Slot::Alias(target) => match slots.get(target)? {
            Slot::Value { element, .. } => Some(element.clone()),
            Slot::Alias(_) => None,
        },
    }
}

fn pick(own: &str, fallback: &str) -> String {
    if own.is_empty() {
        fallback.to_string()
    } else {
        own.to_string()
    }
}

/// Key implied by the element's identity in the requested context.
fn canonical_key(requested: &CacheKey, element: &Element) -> CacheKey {
    let commit_id = if requested.is_latest() {
        LATEST.to_string()
    } else {
        pick(&element.commit_id, &requested.commit_id)
    };
    CacheKey {
        project_id: pick(&element.project_id, &requested.project_id),
        ref_id: pick(&element.ref_id, &requested.ref_id),
        element_id: pick(&element.id, &requested.element_id),
        commit_id,
        variant: requested.variant,
    }
}

fn snapshot_key(requested: &CacheKey, canonical: &CacheKey, element: &Element) -> Option<CacheKey> {
    let concrete = !element.commit_id.is_empty() && element.commit_id != LATEST;
    (requested.variant == KeyVariant::Read && requested.is_latest() && concrete)
        .then(|| canonical.with_commit(element.commit_id.clone()))
}

// =============================================================================
// TESTS
// =============================================================================
