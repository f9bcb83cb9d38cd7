//! Error types for mmsync operations

use crate::element::Element;
use crate::wire::ElementsResponse;
use thiserror::Error;

/// Cache and registry errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage lock poisoned: {what}")]
    LockPoisoned { what: &'static str },

    #[error("Alias at {key} points at missing slot {target}")]
    DanglingAlias { key: String, target: String },
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Some of the elements do not have id, _projectId, _refId: {ids:?}")]
    MissingIdentity { ids: Vec<String> },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read config file: {reason}")]
    Io { reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },
}

/// Raw failure reported by a transport, before status translation.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("HTTP {status}: {message}")]
pub struct TransportFailure {
    /// HTTP status, or 0 when no response arrived.
    pub status: u16,
    /// Decoded response body, when the server sent one.
    pub body: Option<ElementsResponse>,
    pub message: String,
}

impl TransportFailure {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: None,
            message: message.into(),
        }
    }

    pub fn with_body(mut self, body: ElementsResponse) -> Self {
        self.body = Some(body);
        self
    }
}

/// Uniform rejection reason handed to callers: `{status, data, message}`.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message} ({status})")]
pub struct FailureReason {
    pub status: u16,
    pub data: Option<ElementsResponse>,
    pub message: String,
}

impl FailureReason {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            data: None,
            message: message.into(),
        }
    }

    pub fn with_data(mut self, data: ElementsResponse) -> Self {
        self.data = Some(data);
        self
    }
}

/// Master error type for all mmsync errors.
///
/// `Clone` so a single in-flight failure can be handed to every waiter.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("Request failed: {0}")]
    Request(FailureReason),

    #[error("Element {} was deleted", .recent_version.id)]
    Gone { recent_version: Box<Element> },

    #[error("Server Error: empty response")]
    EmptyResponse,

    #[error("Save cancelled")]
    Cancelled,

    #[error("Session was reset while the request was in flight")]
    SessionReset,

    #[error("Background task failed: {reason}")]
    TaskFailed { reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Status code in the uniform reason shape, where one applies.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Request(reason) => Some(reason.status),
            Self::Gone { .. } => Some(410),
            Self::EmptyResponse => Some(500),
            Self::Validation(_) => Some(400),
            _ => None,
        }
    }
}

impl From<FailureReason> for SyncError {
    fn from(reason: FailureReason) -> Self {
        Self::Request(reason)
    }
}

/// Result type alias for mmsync operations.
pub type SyncResult<T> = Result<T, SyncError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display_missing_identity() {
        let err = ValidationError::MissingIdentity {
            ids: vec!["e1".to_string(), "<no id>".to_string()],
        };
        let msg = format!("{}", err);
        assert!(msg.contains("_projectId"));
        assert!(msg.contains("e1"));
    }

    #[test]
    fn test_failure_reason_display() {
        let reason = FailureReason::new(404, "Not Found");
        let msg = format!("{}", reason);
        assert!(msg.contains("Not Found"));
        assert!(msg.contains("404"));
    }

    #[test]
    fn test_gone_display_names_element() {
        let err = SyncError::Gone {
            recent_version: Box::new(Element::new("e9", "p1", "master", "Class")),
        };
        assert!(format!("{}", err).contains("e9"));
        assert_eq!(err.status(), Some(410));
    }

    #[test]
    fn test_sync_error_from_variants() {
        let storage = SyncError::from(StorageError::LockPoisoned { what: "cache" });
        assert!(matches!(storage, SyncError::Storage(_)));

        let validation = SyncError::from(ValidationError::RequiredFieldMissing {
            field: "id".to_string(),
        });
        assert!(matches!(validation, SyncError::Validation(_)));
        assert_eq!(validation.status(), Some(400));

        let config = SyncError::from(ConfigError::MissingRequired {
            field: "api_base_url".to_string(),
        });
        assert!(matches!(config, SyncError::Config(_)));

        let request = SyncError::from(FailureReason::new(500, "Server Error"));
        assert_eq!(request.status(), Some(500));
        assert_eq!(SyncError::Cancelled.status(), None);
    }

    #[test]
    fn test_storage_error_display_lock_poisoned() {
        let err = StorageError::LockPoisoned { what: "tracker" };
        let msg = format!("{}", err);
        assert!(msg.contains("lock poisoned"));
        assert!(msg.contains("tracker"));
    }
}
