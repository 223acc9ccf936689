//! Error types for the lock manager.
//!
//! Uses thiserror for derive macros. Every variant is returned to the
//! immediate caller; nothing here is retried inside the core.

use crate::exit_codes;
use thiserror::Error;

/// Main error type for lock manager operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DlmError {
    /// No resource with this name is registered on the master.
    #[error("unknown resource '{0}'")]
    UnknownResource(String),

    /// The holder has no lock on the resource.
    #[error("{holder} does not hold a lock on '{resource}'")]
    NotHolder { resource: String, holder: String },

    /// The holder already holds (or is waiting for) a lock on the resource.
    #[error("{holder} already holds a lock on '{resource}'")]
    AlreadyHolder { resource: String, holder: String },

    /// A conversion is already outstanding for this holder.
    #[error("a conversion is already in progress for {holder} on '{resource}'")]
    ConversionInProgress { resource: String, holder: String },

    /// A message crossed a recovery event and was dropped.
    #[error("stale generation {got} for '{resource}' (current {current})")]
    StaleGeneration {
        resource: String,
        got: u32,
        current: u32,
    },

    /// The master changed mid-flight; resubmit, nothing was applied.
    #[error("master for '{0}' changed, retry the request")]
    RetryMaster(String),

    /// The caller-supplied deadline elapsed with no response.
    #[error("timed out waiting for master response on '{0}'")]
    Timeout(String),

    /// The master is down and no replacement was assigned in time.
    #[error("master node {master} for '{resource}' is unreachable")]
    MasterUnreachable { resource: String, master: u32 },

    /// The dispatcher could not deliver a message.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Malformed wire frame.
    #[error("malformed message: {0}")]
    Codec(String),

    /// Invalid configuration, arguments, or scenario script.
    #[error("{0}")]
    UserError(String),
}

impl DlmError {
    /// Returns the appropriate exit code for this error type.
    pub fn exit_code(&self) -> i32 {
        match self {
            DlmError::UserError(_) => exit_codes::USER_ERROR,
            DlmError::UnknownResource(_)
            | DlmError::NotHolder { .. }
            | DlmError::AlreadyHolder { .. }
            | DlmError::ConversionInProgress { .. } => exit_codes::LOCK_REFUSED,
            DlmError::RetryMaster(_) | DlmError::StaleGeneration { .. } => exit_codes::RETRYABLE,
            DlmError::Timeout(_) | DlmError::MasterUnreachable { .. } => exit_codes::UNREACHABLE,
            DlmError::Transport(_) | DlmError::Codec(_) => exit_codes::PROTOCOL_ERROR,
        }
    }

    /// Whether the caller should simply resubmit the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DlmError::RetryMaster(_))
    }
}

/// Result type alias for lock manager operations.
pub type Result<T> = std::result::Result<T, DlmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_error_has_correct_exit_code() {
        let err = DlmError::UserError("bad argument".to_string());
        assert_eq!(err.exit_code(), exit_codes::USER_ERROR);
    }

    #[test]
    fn refusals_share_exit_code() {
        let err = DlmError::ConversionInProgress {
            resource: "R".to_string(),
            holder: "1:7".to_string(),
        };
        assert_eq!(err.exit_code(), exit_codes::LOCK_REFUSED);
        assert_eq!(
            DlmError::UnknownResource("R".to_string()).exit_code(),
            exit_codes::LOCK_REFUSED
        );
    }

    #[test]
    fn retry_master_is_the_only_retryable_error() {
        assert!(DlmError::RetryMaster("R".to_string()).is_retryable());
        assert!(!DlmError::Timeout("R".to_string()).is_retryable());
        assert_eq!(
            DlmError::RetryMaster("R".to_string()).exit_code(),
            exit_codes::RETRYABLE
        );
    }

    #[test]
    fn error_messages_are_descriptive() {
        let err = DlmError::MasterUnreachable {
            resource: "inode:12".to_string(),
            master: 3,
        };
        assert_eq!(
            err.to_string(),
            "master node 3 for 'inode:12' is unreachable"
        );

        let err = DlmError::StaleGeneration {
            resource: "R".to_string(),
            got: 1,
            current: 2,
        };
        assert_eq!(err.to_string(), "stale generation 1 for 'R' (current 2)");
    }
}
