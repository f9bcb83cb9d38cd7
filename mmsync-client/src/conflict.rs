//! Single-element saves with optimistic-concurrency conflict handling.
//!
//! A save walks a small state machine:
//!
//! ```text
//! Attempt ──ok──────────────► Committed
//!    │  └─409, no overlap───► Attempt (rebased, budget - 1)
//!    │  └─409, overlap/spent► UserChoice { KeepServer | Force | Cancel }
//!    └─other error──────────► Failed
//! ```
//!
//! Nothing in the cache changes while a conflict waits for a choice.

use crate::context::SyncContext;
use futures_util::future::{BoxFuture, FutureExt};
use mmsync_core::{
    CacheKey, Element, ElementsResponse, KeyVariant, Rejection, SyncError, SyncResult,
    TransportFailure, ValidationError,
};
use mmsync_storage::ElementRef;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const CONFLICT: u16 = 409;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// Resolve with [`SaveOutcome::Empty`] instead of failing when the
    /// server answers with no element.
    pub allow_empty: bool,
}

pub enum SaveOutcome {
    Committed(ElementRef),
    /// The user chose the server's version over their edit.
    KeptServer(ElementRef),
    Empty,
    Conflict(PendingConflict),
}

impl fmt::Debug for SaveOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Committed(handle) => f.debug_tuple("Committed").field(handle).finish(),
            Self::KeptServer(handle) => f.debug_tuple("KeptServer").field(handle).finish(),
            Self::Empty => f.write_str("Empty"),
            Self::Conflict(pending) => f.debug_tuple("Conflict").field(pending).finish(),
        }
    }
}

impl SaveOutcome {
    /// The saved element handle, for committed and kept-server outcomes.
    pub fn element(&self) -> Option<&ElementRef> {
        match self {
            Self::Committed(handle) | Self::KeptServer(handle) => Some(handle),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    KeepServer,
    Force,
    Cancel,
}

impl ConflictChoice {
    pub fn label(&self) -> &'static str {
        match self {
            Self::KeepServer => "Discard my changes",
            Self::Force => "Force save",
            Self::Cancel => "Cancel",
        }
    }
}

/// A conflicting save waiting for the user.
pub struct PendingConflict {
    resolver: ConflictResolver,
    edit: Element,
    base: Element,
    server: Element,
    opts: SaveOptions,
}

impl PendingConflict {
    pub fn edit(&self) -> &Element {
        &self.edit
    }

    pub fn base(&self) -> &Element {
        &self.base
    }

    pub fn server(&self) -> &Element {
        &self.server
    }

    pub fn choices(&self) -> [ConflictChoice; 3] {
        [
            ConflictChoice::KeepServer,
            ConflictChoice::Force,
            ConflictChoice::Cancel,
        ]
    }

    pub async fn resolve(self, choice: ConflictChoice) -> SyncResult<SaveOutcome> {
        match choice {
            ConflictChoice::KeepServer => {
                info!(id = %self.server.id, "Keeping server version");
                let handle = self.resolver.ctx.adopt_server(self.server)?;
                Ok(SaveOutcome::KeptServer(handle))
            }
            ConflictChoice::Force => {
                info!(id = %self.edit.id, "Forcing save over server version");
                let forced = self.edit.rebased_onto(&self.server);
                self.resolver.attempt(forced, self.opts, 0).await
            }
            ConflictChoice::Cancel => Err(SyncError::Cancelled),
        }
    }
}

impl fmt::Debug for PendingConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingConflict")
            .field("edit", &self.edit)
            .field("base", &self.base)
            .field("server", &self.server)
            .field("opts", &self.opts)
            .finish()
    }
}

/// True when a field the user changed was also changed on the server.
///
/// Fields whose names start with `_` (concurrency tokens, provenance,
/// server-computed metadata) never count.
pub fn is_real_conflict(edit: &Element, base: &Element, server: &Element) -> bool {
    if edit.element_type != base.element_type && base.element_type != server.element_type {
        return true;
    }
    let keys: BTreeSet<&String> = edit.fields.keys().chain(base.fields.keys()).collect();
    keys.into_iter()
        .filter(|key| !key.starts_with('_'))
        .any(|key| {
            let base_value = base.field(key);
            edit.field(key) != base_value && base_value != server.field(key)
        })
}

/// Copy onto `edit` every field that changed between two overlay states.
fn apply_flushed(edit: &mut Element, before: &Element, after: &Element) {
    let keys: BTreeSet<&String> = before.fields.keys().chain(after.fields.keys()).collect();
    for key in keys {
        match (before.field(key), after.field(key)) {
            (old, new) if old == new => {}
            (_, Some(value)) => edit.set_field(key.clone(), value.clone()),
            (_, None) => {
                edit.remove_field(key);
            }
        }
    }
}

#[derive(Clone)]
pub struct ConflictResolver {
    ctx: Arc<SyncContext>,
}

impl ConflictResolver {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    /// Save one edited element.
    pub async fn save(&self, edit: Element, opts: SaveOptions) -> SyncResult<SaveOutcome> {
        if edit.id.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "id".to_string(),
            }
            .into());
        }
        let delay = self.ctx.config.save_grace_delay();
        let edit = if delay.is_zero() {
            edit
        } else {
            self.after_grace(edit, delay).await?
        };
        self.attempt(edit, opts, self.ctx.config.max_auto_rebase).await
    }

    /// Wait out the grace delay, then take whatever the editor flushed into
    /// the open overlay meanwhile.
    async fn after_grace(&self, mut edit: Element, delay: Duration) -> SyncResult<Element> {
        let overlay = self
            .ctx
            .overlays
            .existing(&CacheKey::latest_of(&edit, KeyVariant::Read))?;
        let before = overlay.as_ref().map(|handle| handle.snapshot()).transpose()?;
        tokio::time::sleep(delay).await;
        if let (Some(overlay), Some(before)) = (overlay, before) {
            let after = overlay.snapshot()?;
            apply_flushed(&mut edit, &before, &after);
        }
        Ok(edit)
    }

    fn attempt(
        &self,
        edit: Element,
        opts: SaveOptions,
        budget: u32,
    ) -> BoxFuture<'_, SyncResult<SaveOutcome>> {
        async move {
            let body = self.ctx.overlays.fill_in(&edit)?;
            let post = self.ctx.post_body(vec![body.clone()]);
            match self
                .ctx
                .transport
                .post_elements(&edit.scope(), &post, None)
                .await
            {
                Ok(response) => self.accepted(&edit, response, opts),
                Err(failure) if failure.status == CONFLICT => {
                    self.conflicted(edit, &body, failure, opts, budget).await
                }
                Err(failure) => Err(SyncError::Request(self.ctx.translate(failure))),
            }
        }
        .boxed()
    }

    fn accepted(
        &self,
        edit: &Element,
        response: ElementsResponse,
        opts: SaveOptions,
    ) -> SyncResult<SaveOutcome> {
        if let Some(unchanged) = response.rejected.first().and_then(Rejection::unchanged_object) {
            info!(id = %unchanged.id, "Save accepted with no change");
            return Ok(SaveOutcome::Committed(self.ctx.commit_saved(unchanged.clone())?));
        }
        if let Some(saved) = response.pick(&edit.id) {
            info!(id = %saved.id, commit = %saved.commit_id, "Element saved");
            return Ok(SaveOutcome::Committed(self.ctx.commit_saved(saved.clone())?));
        }
        if let Some(rejection) = response.rejected.first() {
            let failure = TransportFailure::new(rejection.code, rejection.message.clone())
                .with_body(response.clone());
            return Err(SyncError::Request(self.ctx.translate(failure)));
        }
        if opts.allow_empty {
            Ok(SaveOutcome::Empty)
        } else {
            Err(SyncError::EmptyResponse)
        }
    }

    async fn conflicted(
        &self,
        edit: Element,
        sent: &Element,
        failure: TransportFailure,
        opts: SaveOptions,
        budget: u32,
    ) -> SyncResult<SaveOutcome> {
        let server = failure
            .body
            .as_ref()
            .and_then(|body| body.elements.first())
            .cloned();
        let base = self
            .ctx
            .cache
            .get(&CacheKey::latest_of(&edit, KeyVariant::Read))?
            .map(|handle| handle.snapshot())
            .transpose()?;
        let (Some(server), Some(base)) = (server, base) else {
            return Err(SyncError::Request(self.ctx.translate(failure)));
        };

        if budget > 0 && !is_real_conflict(sent, &base, &server) {
            info!(id = %edit.id, budget, "Conflict does not overlap, resubmitting");
            return self.attempt(edit.rebased_onto(&server), opts, budget - 1).await;
        }

        warn!(id = %edit.id, "Save conflicts with server version");
        Ok(SaveOutcome::Conflict(PendingConflict {
            resolver: self.clone(),
            edit,
            base,
            server,
            opts,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn element() -> Element {
        Element::new("e1", "p1", "master", "Class")
            .with_name("X")
            .with_documentation("doc")
            .with_read("r1")
    }

    #[test]
    fn test_disjoint_changes_do_not_conflict() {
        let base = element();
        let edit = base.clone().with_name("Y");
        let server = base.clone().with_documentation("server doc").with_read("r2");
        assert!(!is_real_conflict(&edit, &base, &server));
    }

    #[test]
    fn test_same_field_changes_conflict() {
        let base = element();
        let edit = base.clone().with_name("Y");
        let server = base.clone().with_name("Z");
        assert!(is_real_conflict(&edit, &base, &server));
    }

    #[test]
    fn test_token_and_metadata_fields_ignored() {
        let base = element().with_field("_qualifiedName", "a/b");
        let edit = base.clone().with_read("r9").with_field("_qualifiedName", "a/c");
        let server = base.clone().with_read("r2").with_field("_qualifiedName", "a/d");
        assert!(!is_real_conflict(&edit, &base, &server));
    }

    #[test]
    fn test_removed_field_conflicts_with_server_change() {
        let base = element().with_field("defaultValue", json!(1));
        let mut edit = base.clone();
        edit.remove_field("defaultValue");
        let server = base.clone().with_field("defaultValue", json!(2));
        assert!(is_real_conflict(&edit, &base, &server));
    }

    #[test]
    fn test_flushed_overlay_changes_reach_edit() {
        let before = element().with_field("defaultValue", json!(1));
        let mut after = before.clone().with_documentation("flushed");
        after.remove_field("defaultValue");
        let mut edit = before.clone().with_name("Y");

        apply_flushed(&mut edit, &before, &after);
        assert_eq!(edit.name(), Some("Y"));
        assert_eq!(edit.documentation(), Some("flushed"));
        assert!(edit.field("defaultValue").is_none());
    }

    #[test]
    fn test_choice_labels() {
        assert_eq!(ConflictChoice::Cancel.label(), "Cancel");
        assert_ne!(ConflictChoice::KeepServer.label(), ConflictChoice::Force.label());
    }
}
