//! Error taxonomy for the listener subsystem

use thiserror::Error;
use uuid::Uuid;

/// Stable error codes surfaced in logs and to error hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    DbError,
    MessageHandlingFailed,
    MessageErrorHandlingFailed,
    GivingUpMessageHandling,
    PoisonousMessage,
    ConflictingMessageHandlers,
    NoMessageHandlerRegistered,
    ListenerStopped,
    Timeout,
    MessageStorageFailed,
    BatchProcessingError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DbError => "DB_ERROR",
            Self::MessageHandlingFailed => "MESSAGE_HANDLING_FAILED",
            Self::MessageErrorHandlingFailed => "MESSAGE_ERROR_HANDLING_FAILED",
            Self::GivingUpMessageHandling => "GIVING_UP_MESSAGE_HANDLING",
            Self::PoisonousMessage => "POISONOUS_MESSAGE",
            Self::ConflictingMessageHandlers => "CONFLICTING_MESSAGE_HANDLERS",
            Self::NoMessageHandlerRegistered => "NO_MESSAGE_HANDLER_REGISTERED",
            Self::ListenerStopped => "LISTENER_STOPPED",
            Self::Timeout => "TIMEOUT",
            Self::MessageStorageFailed => "MESSAGE_STORAGE_FAILED",
            Self::BatchProcessingError => "BATCH_PROCESSING_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while storing or processing messages
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("handling of message {message_id} failed: {source}")]
    MessageHandlingFailed {
        message_id: Uuid,
        #[source]
        source: anyhow::Error,
    },

    #[error("error handling of message {message_id} failed: {source}")]
    MessageErrorHandlingFailed {
        message_id: Uuid,
        #[source]
        source: anyhow::Error,
    },

    #[error("giving up on message {message_id} after {finished_attempts} finished attempts")]
    GivingUp {
        message_id: Uuid,
        finished_attempts: i32,
    },

    #[error(
        "message {message_id} is poisonous ({started_attempts} started, {finished_attempts} finished attempts)"
    )]
    Poisonous {
        message_id: Uuid,
        started_attempts: i32,
        finished_attempts: i32,
    },

    #[error("conflicting handlers registered for {aggregate_type}.{message_type}")]
    ConflictingMessageHandlers {
        aggregate_type: String,
        message_type: String,
    },

    #[error("no message handler registered")]
    NoMessageHandlerRegistered,

    #[error("listener stopped")]
    ListenerStopped,

    #[error("processing of message {message_id} timed out after {timeout_ms} ms")]
    Timeout { message_id: Uuid, timeout_ms: u64 },

    #[error("storing message {message_id} failed: {source}")]
    MessageStorageFailed {
        message_id: Uuid,
        #[source]
        source: sqlx::Error,
    },

    #[error("batch processing error: {0}")]
    BatchProcessing(String),
}

impl ListenerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Db(_) => ErrorCode::DbError,
            Self::MessageHandlingFailed { .. } => ErrorCode::MessageHandlingFailed,
            Self::MessageErrorHandlingFailed { .. } => ErrorCode::MessageErrorHandlingFailed,
            Self::GivingUp { .. } => ErrorCode::GivingUpMessageHandling,
            Self::Poisonous { .. } => ErrorCode::PoisonousMessage,
            Self::ConflictingMessageHandlers { .. } => ErrorCode::ConflictingMessageHandlers,
            Self::NoMessageHandlerRegistered => ErrorCode::NoMessageHandlerRegistered,
            Self::ListenerStopped => ErrorCode::ListenerStopped,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::MessageStorageFailed { .. } => ErrorCode::MessageStorageFailed,
            Self::BatchProcessing(_) => ErrorCode::BatchProcessingError,
        }
    }

    fn sqlstate(&self) -> Option<String> {
        let err = match self {
            Self::Db(err) | Self::MessageStorageFailed { source: err, .. } => err,
            _ => return None,
        };
        err.as_database_error()
            .and_then(|db| db.code().map(|code| code.to_string()))
    }

    /// Serialization failure or deadlock; the transaction is worth retrying.
    pub fn is_serialization_error(&self) -> bool {
        matches!(self.sqlstate().as_deref(), Some("40001" | "40P01"))
    }

    /// `FOR … NOWAIT` lost the race for the row lock
    pub fn is_lock_not_available(&self) -> bool {
        matches!(self.sqlstate().as_deref(), Some("55P03"))
    }
}

/// Result type alias for listener operations
pub type ListenerResult<T> = Result<T, ListenerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_have_wire_spellings() {
        assert_eq!(ErrorCode::DbError.as_str(), "DB_ERROR");
        assert_eq!(
            ErrorCode::GivingUpMessageHandling.as_str(),
            "GIVING_UP_MESSAGE_HANDLING"
        );
        assert_eq!(ErrorCode::PoisonousMessage.as_str(), "POISONOUS_MESSAGE");
        assert_eq!(ErrorCode::BatchProcessingError.as_str(), "BATCH_PROCESSING_ERROR");
    }

    #[test]
    fn variant_maps_to_code() {
        let err = ListenerError::NoMessageHandlerRegistered;
        assert_eq!(err.code(), ErrorCode::NoMessageHandlerRegistered);

        let err = ListenerError::Timeout {
            message_id: Uuid::new_v4(),
            timeout_ms: 100,
        };
        assert_eq!(err.code(), ErrorCode::Timeout);
    }

    #[test]
    fn non_database_errors_are_not_retryable() {
        assert!(!ListenerError::ListenerStopped.is_serialization_error());
        assert!(!ListenerError::NoMessageHandlerRegistered.is_lock_not_available());
    }
}
