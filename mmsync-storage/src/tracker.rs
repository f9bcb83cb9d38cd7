//! Registry of open edits.
//!
//! Collaborators use it to warn about unsaved work and to drive "save
//! all". Every mutation is announced on a broadcast channel.

use crate::shared::ElementRef;
use mmsync_core::{Element, ElementRequest, StorageError, ValidationError};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

/// Registry key, printed as `elementId|projectId|refId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackerKey {
    pub element_id: String,
    pub project_id: String,
    pub ref_id: String,
}

impl TrackerKey {
    pub fn new(
        element_id: impl Into<String>,
        project_id: impl Into<String>,
        ref_id: impl Into<String>,
    ) -> Self {
        Self {
            element_id: element_id.into(),
            project_id: project_id.into(),
            ref_id: ref_id.into(),
        }
    }

    pub fn of(element: &Element) -> Self {
        Self::new(&element.id, &element.project_id, &element.ref_id)
    }

    pub fn for_request(request: &ElementRequest) -> Self {
        let request = request.clone().normalized();
        Self::new(request.element_id, request.project_id, request.ref_id)
    }
}

impl fmt::Display for TrackerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.element_id, self.project_id, self.ref_id)
    }
}

impl FromStr for TrackerKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('|');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(id), Some(project), Some(ref_id), None)
                if !id.is_empty() && !project.is_empty() && !ref_id.is_empty() =>
            {
                Ok(Self::new(id, project, ref_id))
            }
            _ => Err(ValidationError::InvalidValue {
                field: "tracker_key".to_string(),
                reason: format!("expected elementId|projectId|refId, got {s:?}"),
            }),
        }
    }
}

/// Registry change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditTrackerEvent {
    Added { key: TrackerKey, open_edits: usize },
    Updated { key: TrackerKey },
    Removed { key: TrackerKey, open_edits: usize },
    Cleared,
}

pub struct EditTracker {
    edits: RwLock<BTreeMap<TrackerKey, ElementRef>>,
    tx: broadcast::Sender<EditTrackerEvent>,
}

fn poisoned<G>(_: G) -> StorageError {
    StorageError::LockPoisoned {
        what: "edit tracker",
    }
}

impl EditTracker {
    /// Create a tracker whose event channel buffers `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            edits: RwLock::new(BTreeMap::new()),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EditTrackerEvent> {
        self.tx.subscribe()
    }

    fn emit(&self, event: EditTrackerEvent) {
        // no subscribers is fine
        if let Ok(receivers) = self.tx.send(event) {
            debug!(receivers, "Broadcast edit tracker event");
        }
    }

    pub fn add_or_update(&self, key: TrackerKey, overlay: ElementRef) -> Result<(), StorageError> {
        let (replaced, open_edits) = {
            let mut edits = self.edits.write().map_err(poisoned)?;
            let replaced = edits.insert(key.clone(), overlay).is_some();
            (replaced, edits.len())
        };
        self.emit(if replaced {
            EditTrackerEvent::Updated { key }
        } else {
            EditTrackerEvent::Added { key, open_edits }
        });
        Ok(())
    }

    /// Remove `key`. Emits nothing when it was not registered.
    pub fn remove(&self, key: &TrackerKey) -> Result<Option<ElementRef>, StorageError> {
        let (removed, open_edits) = {
            let mut edits = self.edits.write().map_err(poisoned)?;
            let removed = edits.remove(key);
            (removed, edits.len())
        };
        if removed.is_some() {
            self.emit(EditTrackerEvent::Removed {
                key: key.clone(),
                open_edits,
            });
        }
        Ok(removed)
    }

    pub fn get(&self, key: &TrackerKey) -> Result<Option<ElementRef>, StorageError> {
        Ok(self.edits.read().map_err(poisoned)?.get(key).cloned())
    }

    pub fn contains(&self, key: &TrackerKey) -> Result<bool, StorageError> {
        Ok(self.edits.read().map_err(poisoned)?.contains_key(key))
    }

    /// All open edits, ordered by key.
    pub fn get_all(&self) -> Result<Vec<(TrackerKey, ElementRef)>, StorageError> {
        let edits = self.edits.read().map_err(poisoned)?;
        Ok(edits
            .iter()
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect())
    }

    pub fn open_edits_count(&self) -> Result<usize, StorageError> {
        Ok(self.edits.read().map_err(poisoned)?.len())
    }

    pub fn reset(&self) -> Result<(), StorageError> {
        self.edits.write().map_err(poisoned)?.clear();
        self.emit(EditTrackerEvent::Cleared);
        Ok(())
    }
}

impl fmt::Debug for EditTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EditTracker")
            .field("open_edits", &self.open_edits_count().ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn overlay(id: &str) -> ElementRef {
        ElementRef::new(Element::new(id, "p1", "master", "Class"))
    }

    #[test]
    fn test_key_display_and_parse() {
        let key = TrackerKey::new("e1", "p1", "master");
        assert_eq!(key.to_string(), "e1|p1|master");
        assert_eq!("e1|p1|master".parse::<TrackerKey>().unwrap(), key);
        assert!("e1|p1".parse::<TrackerKey>().is_err());
        assert!("e1||master".parse::<TrackerKey>().is_err());
        assert!("a|b|c|d".parse::<TrackerKey>().is_err());
    }

    #[test]
    fn test_for_request_normalizes_ref() {
        let mut req = ElementRequest::new("p1", "e1");
        req.ref_id.clear();
        assert_eq!(TrackerKey::for_request(&req).ref_id, "master");
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let tracker = EditTracker::new(16);
        let mut rx = tracker.subscribe();
        let key = TrackerKey::new("e1", "p1", "master");

        tracker.add_or_update(key.clone(), overlay("e1")).unwrap();
        tracker.add_or_update(key.clone(), overlay("e1")).unwrap();
        tracker.remove(&key).unwrap();
        tracker.remove(&key).unwrap();
        tracker.reset().unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            EditTrackerEvent::Added {
                key: key.clone(),
                open_edits: 1
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            EditTrackerEvent::Updated { key: key.clone() }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            EditTrackerEvent::Removed {
                key,
                open_edits: 0
            }
        );
        // second remove was a no-op
        assert_eq!(rx.recv().await.unwrap(), EditTrackerEvent::Cleared);
    }

    #[test]
    fn test_get_all_ordered() {
        let tracker = EditTracker::new(4);
        tracker
            .add_or_update(TrackerKey::new("b", "p1", "master"), overlay("b"))
            .unwrap();
        tracker
            .add_or_update(TrackerKey::new("a", "p1", "master"), overlay("a"))
            .unwrap();
        let ids: Vec<String> = tracker
            .get_all()
            .unwrap()
            .into_iter()
            .map(|(k, _)| k.element_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8),
        Remove(u8),
        Reset,
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0u8..8).prop_map(Op::Add),
            3 => (0u8..8).prop_map(Op::Remove),
            1 => Just(Op::Reset),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// The count always equals the number of distinct live keys.
        #[test]
        fn prop_count_matches_distinct_keys(ops in proptest::collection::vec(arb_op(), 0..40)) {
            let tracker = EditTracker::new(64);
            let mut model = HashSet::new();
            for op in ops {
                match op {
                    Op::Add(n) => {
                        let id = format!("e{n}");
                        tracker.add_or_update(TrackerKey::new(&id, "p1", "master"), overlay(&id)).unwrap();
                        model.insert(n);
                    }
                    Op::Remove(n) => {
                        tracker.remove(&TrackerKey::new(format!("e{n}"), "p1", "master")).unwrap();
                        model.remove(&n);
                    }
                    Op::Reset => {
                        tracker.reset().unwrap();
                        model.clear();
                    }
                }
                prop_assert_eq!(tracker.open_edits_count().unwrap(), model.len());
                prop_assert_eq!(tracker.get_all().unwrap().len(), model.len());
            }
        }
    }
}
