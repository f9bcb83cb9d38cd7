//! Edit overlays.
//!
//! An overlay is an independently owned copy of a canonical element, kept
//! under the edit variant of its key. UI code mutates the overlay; the
//! canonical slot only changes when the server confirms a write.

use crate::cache::ElementCache;
use crate::shared::ElementRef;
use mmsync_core::{CacheKey, Element, ElementType, KeyVariant, StorageError};
use mmsync_core::element::DISPLAY_ONLY_FIELDS;
use std::sync::Arc;

/// Payload key that is only sent back when the caller included it.
const CHILD_VIEWS_FIELD: &str = "_childViews";

pub struct EditOverlayStore {
    cache: Arc<ElementCache>,
}

impl EditOverlayStore {
    pub fn new(cache: Arc<ElementCache>) -> Self {
        Self { cache }
    }

    fn edit_key(key: &CacheKey) -> CacheKey {
        key.with_variant(KeyVariant::Edit)
    }

    /// The overlay for `key`, if one is open.
    pub fn existing(&self, key: &CacheKey) -> Result<Option<ElementRef>, StorageError> {
        self.cache.get(&Self::edit_key(key))
    }

    /// Open an overlay for `key`, cloning `canonical` if none exists yet.
    ///
    /// Repeated calls return the same handle.
    pub fn open(&self, key: &CacheKey, canonical: &Element) -> Result<ElementRef, StorageError> {
        if let Some(overlay) = self.existing(key)? {
            return Ok(overlay);
        }
        self.cache
            .put(&Self::edit_key(key), canonical.clone(), self.cache.next_seq())
    }

    /// Overwrite the overlay with `element`, creating it if needed.
    pub fn adopt(&self, key: &CacheKey, element: Element) -> Result<ElementRef, StorageError> {
        self.cache
            .put(&Self::edit_key(key), element, self.cache.next_seq())
    }

    /// Close the overlay for `key`.
    ///
    /// Holders of the removed handle see its user-visible fields restored
    /// from `canonical`.
    pub fn discard(
        &self,
        key: &CacheKey,
        canonical: Option<&Element>,
    ) -> Result<Option<ElementRef>, StorageError> {
        let removed = self.cache.remove(&Self::edit_key(key))?;
        if let (Some(overlay), Some(canonical)) = (&removed, canonical) {
            overlay.update(|edit| restore_user_fields(edit, canonical))?;
        }
        Ok(removed)
    }

    /// Whether the overlay differs from `canonical` in anything a user edits.
    pub fn has_edits(&self, key: &CacheKey, canonical: &Element) -> Result<bool, StorageError> {
        match self.existing(key)? {
            Some(overlay) => overlay.with(|edit| differs_in_user_fields(edit, canonical)),
            None => Ok(false),
        }
    }

    /// Body to send for `submitted`.
    ///
    /// Fields the caller left out are taken from the open overlay. Display
    /// bookkeeping is stripped and the commit id cleared so the server
    /// applies the write to the ref head.
    pub fn fill_in(&self, submitted: &Element) -> Result<Element, StorageError> {
        let mut body = submitted.clone();
        let key = CacheKey::latest_of(submitted, KeyVariant::Edit);
        if let Some(overlay) = self.cache.get(&key)? {
            overlay.with(|edit| merge_missing(&mut body, edit))?;
        }
        for field in DISPLAY_ONLY_FIELDS {
            body.remove_field(field);
        }
        if submitted.field(CHILD_VIEWS_FIELD).is_none() {
            body.remove_field(CHILD_VIEWS_FIELD);
        }
        body.commit_id.clear();
        Ok(body)
    }
}

fn merge_missing(body: &mut Element, edit: &Element) {
    for (key, value) in &edit.fields {
        body.fields
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
    if body.element_type == ElementType::default() {
        body.element_type = edit.element_type.clone();
    }
    body.read = body.read.take().or_else(|| edit.read.clone());
    body.modified = body.modified.or(edit.modified);
    body.modifier = body.modifier.take().or_else(|| edit.modifier.clone());
    body.creator = body.creator.take().or_else(|| edit.creator.clone());
    body.created = body.created.or(edit.created);
}

fn user_fields(element_type: &ElementType) -> impl Iterator<Item = &'static str> + '_ {
    ["name", "documentation"]
        .into_iter()
        .chain(element_type.value_fields().iter().copied())
}

/// Copy name, documentation and the type's value fields from `canonical`.
///
/// The name is only restored when the canonical element has one.
pub fn restore_user_fields(edit: &mut Element, canonical: &Element) {
    for field in user_fields(&canonical.element_type) {
        match canonical.field(field) {
            Some(value) => edit.set_field(field, value.clone()),
            None if field == "name" => {}
            None => {
                edit.remove_field(field);
            }
        }
    }
}

fn differs_in_user_fields(edit: &Element, canonical: &Element) -> bool {
    user_fields(&canonical.element_type).any(|field| edit.field(field) != canonical.field(field))
}
