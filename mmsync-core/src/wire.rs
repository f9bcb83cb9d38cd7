//! Envelopes exchanged with the element repository.

use crate::element::{CommitRecord, Element};
use serde::{Deserialize, Serialize};

/// Status code the server uses to reject a write that changes nothing.
pub const NO_CHANGE: u16 = 304;

/// Response body of every element read and write endpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ElementsResponse {
    #[serde(default)]
    pub elements: Vec<Element>,
    #[serde(default)]
    pub rejected: Vec<Rejection>,
    #[serde(default)]
    pub deleted: Vec<Element>,
}

impl ElementsResponse {
    pub fn of(elements: Vec<Element>) -> Self {
        Self {
            elements,
            ..Default::default()
        }
    }

    /// The element matching `id`, falling back to the first one.
    pub fn pick(&self, id: &str) -> Option<&Element> {
        self.elements
            .iter()
            .find(|e| e.id == id)
            .or_else(|| self.elements.first())
    }

    /// The deleted-version record for `id`, if the server sent one.
    pub fn deleted_version(&self, id: &str) -> Option<&Element> {
        self.deleted.first().filter(|e| e.id == id)
    }
}

/// A per-element rejection inside an otherwise successful write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Element>,
}

impl Rejection {
    /// A "nothing to change" rejection that still carries the stored element.
    pub fn unchanged_object(&self) -> Option<&Element> {
        if self.code == NO_CHANGE {
            self.object.as_ref()
        } else {
            None
        }
    }
}

/// Body of an element write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementsPost {
    pub elements: Vec<Element>,
    /// Provenance marker identifying the writing application.
    pub source: String,
}

/// Body of a batch read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRef {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommitsResponse {
    #[serde(default)]
    pub commits: Vec<CommitRecord>,
}

/// Scheduling weight of a read. Higher runs first when requests queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    Immediate = 2,
}

impl Priority {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Low,
            1 => Self::Normal,
            _ => Self::Immediate,
        }
    }
}
