//! Translation of raw transport failures into caller-facing reasons.

use mmsync_core::{FailureReason, TransportFailure};

pub trait StatusTranslator: Send + Sync + 'static {
    fn translate(&self, failure: TransportFailure) -> FailureReason;
}

/// Status messages used by the MMS front end.
#[derive(Debug, Clone, Copy, Default)]
pub struct MmsStatusTranslator;

impl MmsStatusTranslator {
    pub fn message_for(status: u16) -> &'static str {
        match status {
            404 => "Not Found",
            401 | 403 => "Permission Error",
            409 => "Conflict",
            400 => "Bad Request",
            410 => "Deleted",
            408 | 0 => "Timed Out",
            500 => "Server Error",
            304 => "No Change",
            _ => "Failed",
        }
    }
}

impl StatusTranslator for MmsStatusTranslator {
    fn translate(&self, failure: TransportFailure) -> FailureReason {
        FailureReason {
            status: failure.status,
            data: failure.body,
            message: Self::message_for(failure.status).to_string(),
        }
    }
}
