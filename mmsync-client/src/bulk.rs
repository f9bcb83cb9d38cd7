//! Grouped bulk saves.
//!
//! Edits are partitioned by (project, ref), one write per partition. All
//! partitions settle independently; the report collects what was saved and
//! why the rest failed.

use crate::context::SyncContext;
use futures_util::future::join_all;
use mmsync_core::{
    Element, FailureReason, RefScope, SyncResult, TransportFailure, ValidationError,
};
use mmsync_storage::ElementRef;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of a bulk save.
#[derive(Default)]
pub struct BulkReport {
    pub succeeded: Vec<ElementRef>,
    pub failed: Vec<FailureReason>,
}

impl BulkReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn absorb(&mut self, other: BulkReport) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
    }
}

impl fmt::Debug for BulkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkReport")
            .field("succeeded", &self.succeeded.len())
            .field("failed", &self.failed)
            .finish()
    }
}

pub struct BulkUpdateGrouper {
    ctx: Arc<SyncContext>,
}

impl BulkUpdateGrouper {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    pub async fn update_many(&self, edits: Vec<Element>) -> SyncResult<BulkReport> {
        let missing: Vec<String> = edits
            .iter()
            .filter(|edit| !edit.has_identity())
            .map(|edit| {
                if edit.id.is_empty() {
                    "<no id>".to_string()
                } else {
                    edit.id.clone()
                }
            })
            .collect();
        if !missing.is_empty() {
            return Err(ValidationError::MissingIdentity { ids: missing }.into());
        }

        let mut groups: BTreeMap<RefScope, Vec<Element>> = BTreeMap::new();
        for edit in &edits {
            groups
                .entry(edit.scope())
                .or_default()
                .push(self.ctx.overlays.fill_in(edit)?);
        }

        let settled = join_all(
            groups
                .into_iter()
                .map(|(scope, elements)| self.post_group(scope, elements)),
        )
        .await;

        let mut report = BulkReport::default();
        for group in settled {
            report.absorb(group);
        }
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Bulk update settled"
        );
        Ok(report)
    }

    async fn post_group(&self, scope: RefScope, elements: Vec<Element>) -> BulkReport {
        let count = elements.len();
        let body = self.ctx.post_body(elements);
        let timeout = self.ctx.config.bulk_timeout();
        let sent = tokio::time::timeout(
            timeout,
            self.ctx.transport.post_elements(&scope, &body, Some(timeout)),
        )
        .await;

        let mut report = BulkReport::default();
        let response = match sent {
            Err(_) => {
                warn!(scope = %scope, count, "Bulk partition timed out");
                report.failed.push(
                    self.ctx
                        .translate(TransportFailure::new(408, "bulk partition timed out")),
                );
                return report;
            }
            Ok(Err(failure)) => {
                warn!(scope = %scope, status = failure.status, "Bulk partition failed");
                report.failed.push(self.ctx.translate(failure));
                return report;
            }
            Ok(Ok(response)) => response,
        };

        for saved in response.elements {
            self.commit_into(&mut report, saved);
        }
        for rejection in response.rejected {
            match rejection.unchanged_object() {
                Some(unchanged) => {
                    warn!(
                        id = %unchanged.id,
                        code = rejection.code,
                        message = %rejection.message,
                        "Bulk update partially rejected"
                    );
                    self.commit_into(&mut report, unchanged.clone());
                }
                None => {
                    let failure = TransportFailure::new(rejection.code, rejection.message.clone());
                    report.failed.push(self.ctx.translate(failure));
                }
            }
        }
        info!(
            scope = %scope,
            sent = count,
            saved = report.succeeded.len(),
            "Bulk partition saved"
        );
        report
    }

    /// Cache one saved element. A cache failure only fails this element.
    fn commit_into(&self, report: &mut BulkReport, saved: Element) {
        let id = saved.id.clone();
        match self.ctx.commit_saved(saved) {
            Ok(handle) => report.succeeded.push(handle),
            Err(error) => {
                warn!(id = %id, error = %error, "Saved element could not be cached");
                report
                    .failed
                    .push(FailureReason::new(500, format!("{id}: {error}")));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(status: u16) -> FailureReason {
        FailureReason {
            status,
            data: None,
            message: "Failed".to_string(),
        }
    }

    #[test]
    fn test_report_absorbs_partitions() {
        let mut report = BulkReport::default();
        assert!(report.is_complete());

        report.absorb(BulkReport {
            succeeded: vec![ElementRef::new(Element::default())],
            failed: Vec::new(),
        });
        assert!(report.is_complete());

        report.absorb(BulkReport {
            succeeded: vec![ElementRef::new(Element::default())],
            failed: vec![reason(500)],
        });
        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert!(!report.is_complete());
    }

    #[test]
    fn test_report_debug_counts_successes() {
        let report = BulkReport {
            succeeded: vec![ElementRef::new(Element::default())],
            failed: Vec::new(),
        };
        assert_eq!(
            format!("{report:?}"),
            "BulkReport { succeeded: 1, failed: [] }"
        );
    }
}
