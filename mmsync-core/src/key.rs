//! Normalized cache keys.
//!
//! A [`CacheKey`] is the tuple `(project, ref, element, commit, variant)`.
//! Two different request contexts can normalize to different keys while
//! naming the same stored element; the cache resolves that with aliases, so
//! the key type itself stays a plain value.

use crate::element::{Element, ElementRequest, LATEST};
use std::fmt;

/// Which slot family a key addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyVariant {
    /// Canonical server state, read-only for UI code.
    Read,
    /// Independently mutable edit overlay.
    Edit,
    /// Tombstone marker for an element the server reported as deleted.
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub project_id: String,
    pub ref_id: String,
    pub element_id: String,
    pub commit_id: String,
    pub variant: KeyVariant,
}

impl CacheKey {
    /// Key a request asks for. The request is normalized first.
    pub fn for_request(request: &ElementRequest, variant: KeyVariant) -> Self {
        let request = request.clone().normalized();
        Self {
            project_id: request.project_id,
            ref_id: request.ref_id,
            element_id: request.element_id,
            commit_id: request.commit_id,
            variant,
        }
    }

    /// Key implied by the element's own identity at the given commit.
    pub fn for_element(element: &Element, commit_id: impl Into<String>, variant: KeyVariant) -> Self {
        Self {
            project_id: element.project_id.clone(),
            ref_id: element.ref_id.clone(),
            element_id: element.id.clone(),
            commit_id: commit_id.into(),
            variant,
        }
    }

    /// Key of the element's live slot on its own ref.
    pub fn latest_of(element: &Element, variant: KeyVariant) -> Self {
        Self::for_element(element, LATEST, variant)
    }

    pub fn with_variant(&self, variant: KeyVariant) -> Self {
        Self {
            variant,
            ..self.clone()
        }
    }

    pub fn with_commit(&self, commit_id: impl Into<String>) -> Self {
        Self {
            commit_id: commit_id.into(),
            ..self.clone()
        }
    }

    pub fn is_latest(&self) -> bool {
        self.commit_id == LATEST
    }

    pub fn is_edit(&self) -> bool {
        self.variant == KeyVariant::Edit
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.project_id, self.ref_id, self.element_id, self.commit_id
        )?;
        match self.variant {
            KeyVariant::Read => Ok(()),
            KeyVariant::Edit => f.write_str("|edit"),
            KeyVariant::Deleted => f.write_str("|deleted"),
        }
    }
}

/// Key of a cached commit-history list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HistoryKey {
    pub project_id: String,
    pub ref_id: String,
    pub element_id: String,
}

impl HistoryKey {
    pub fn for_request(request: &ElementRequest) -> Self {
        let request = request.clone().normalized();
        Self {
            project_id: request.project_id,
            ref_id: request.ref_id,
            element_id: request.element_id,
        }
    }

    pub fn of(element: &Element) -> Self {
        Self {
            project_id: element.project_id.clone(),
            ref_id: element.ref_id.clone(),
            element_id: element.id.clone(),
        }
    }
}

impl fmt::Display for HistoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "history|{}|{}|{}",
            self.project_id, self.ref_id, self.element_id
        )
    }
}
