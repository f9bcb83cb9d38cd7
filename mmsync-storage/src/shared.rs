//! Shared, mutable handles to cached values.
//!
//! Every reader of a slot holds the same [`Shared`] handle. Writes replace
//! the contents behind the handle, never the handle itself, so anything
//! bound to it observes the new value.

use mmsync_core::{CommitRecord, Element, StorageError};
use std::fmt;
use std::sync::{Arc, RwLock};

pub struct Shared<T> {
    inner: Arc<RwLock<T>>,
    what: &'static str,
}

/// Handle to a cached element (canonical or overlay).
pub type ElementRef = Shared<Element>;

/// Handle to a cached commit-history list.
pub type HistoryRef = Shared<Vec<CommitRecord>>;

impl<T> Shared<T> {
    fn with_label(value: T, what: &'static str) -> Self {
        Self {
            inner: Arc::new(RwLock::new(value)),
            what,
        }
    }

    /// Read through the handle.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, StorageError> {
        let guard = self
            .inner
            .read()
            .map_err(|_| StorageError::LockPoisoned { what: self.what })?;
        Ok(f(&guard))
    }

    /// Mutate in place. Every holder of this handle sees the change.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, StorageError> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| StorageError::LockPoisoned { what: self.what })?;
        Ok(f(&mut guard))
    }

    pub fn replace(&self, value: T) -> Result<(), StorageError> {
        self.update(|slot| *slot = value)
    }

    /// True when both handles address the same slot.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone> Shared<T> {
    /// Owned copy of the current value.
    pub fn snapshot(&self) -> Result<T, StorageError> {
        self.with(T::clone)
    }
}

impl Shared<Element> {
    pub fn new(element: Element) -> Self {
        Self::with_label(element, "element slot")
    }
}

impl Shared<Vec<CommitRecord>> {
    pub fn new(commits: Vec<CommitRecord>) -> Self {
        Self::with_label(commits, "history slot")
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            what: self.what,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_read() {
            Ok(value) => f.debug_tuple("Shared").field(&*value).finish(),
            Err(_) => f.debug_tuple("Shared").field(&"<locked>").finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_is_visible_through_clones() {
        let handle = ElementRef::new(Element::new("e1", "p1", "master", "Class"));
        let other = handle.clone();
        handle.update(|el| el.set_name("renamed")).unwrap();
        assert_eq!(other.snapshot().unwrap().name(), Some("renamed"));
        assert!(handle.ptr_eq(&other));
    }

    #[test]
    fn test_replace_keeps_identity() {
        let handle = ElementRef::new(Element::new("e1", "p1", "master", "Class"));
        let before = handle.clone();
        handle
            .replace(Element::new("e1", "p1", "master", "Class").with_read("r2"))
            .unwrap();
        assert!(before.ptr_eq(&handle));
        assert_eq!(before.with(|el| el.read.clone()).unwrap().as_deref(), Some("r2"));
    }

    #[test]
    fn test_distinct_handles_are_not_ptr_eq() {
        let a = ElementRef::new(Element::new("e1", "p1", "master", "Class"));
        let b = ElementRef::new(Element::new("e1", "p1", "master", "Class"));
        assert!(!a.ptr_eq(&b));
    }

    #[test]
    fn test_poisoned_lock_reported() {
        let handle = HistoryRef::new(Vec::new());
        let poisoner = handle.clone();
        let _ = std::thread::spawn(move || {
            let _ = poisoner.update(|_| panic!("poison"));
        })
        .join();
        assert!(matches!(
            handle.snapshot(),
            Err(StorageError::LockPoisoned { what: "history slot" })
        ));
    }
}
