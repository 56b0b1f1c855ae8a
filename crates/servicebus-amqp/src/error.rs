//! Error types for link, settlement and renewal operations.
//!
//! Raw transport failures arrive as [`TransportError`] values carrying the AMQP
//! error condition symbol. Every policy decision in this crate (reconnect,
//! abandon, surface) is taken on a [`ReceiverError`] produced by [`translate`],
//! never on the raw error.

use crate::config::ReceiveMode;
use crate::message::{DeliveryId, LinkName};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

/// AMQP error condition symbols understood by [`translate`].
pub mod conditions {
    pub const INTERNAL_ERROR: &str = "amqp:internal-error";
    pub const NOT_FOUND: &str = "amqp:not-found";
    pub const UNAUTHORIZED_ACCESS: &str = "amqp:unauthorized-access";
    pub const DECODE_ERROR: &str = "amqp:decode-error";
    pub const RESOURCE_LIMIT_EXCEEDED: &str = "amqp:resource-limit-exceeded";
    pub const NOT_ALLOWED: &str = "amqp:not-allowed";
    pub const NOT_IMPLEMENTED: &str = "amqp:not-implemented";
    pub const PRECONDITION_FAILED: &str = "amqp:precondition-failed";
    pub const CONNECTION_FORCED: &str = "amqp:connection:forced";
    pub const FRAMING_ERROR: &str = "amqp:connection:framing-error";
    pub const DETACH_FORCED: &str = "amqp:link:detach-forced";
    pub const LINK_STOLEN: &str = "amqp:link:stolen";
    pub const SERVER_BUSY: &str = "com.microsoft:server-busy";
    pub const TIMEOUT: &str = "com.microsoft:timeout";
    pub const SERVICE_UNAVAILABLE: &str = "com.microsoft:service-unavailable";
    pub const ENTITY_DISABLED: &str = "com.microsoft:entity-disabled";
    pub const MESSAGE_LOCK_LOST: &str = "com.microsoft:message-lock-lost";
    pub const SESSION_LOCK_LOST: &str = "com.microsoft:session-lock-lost";
    pub const SESSION_CANNOT_BE_LOCKED: &str = "com.microsoft:session-cannot-be-locked";
    pub const MESSAGE_NOT_FOUND: &str = "com.microsoft:message-not-found";
    pub const DEAD_LETTER: &str = "com.microsoft:dead-letter";
    /// Socket level failure reported by the transport without an AMQP condition.
    pub const SYSTEM_IO: &str = "system:io";
}

// ============================================================================
// Transport Errors
// ============================================================================

/// Raw, protocol-level error as reported by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub condition: String,
    pub description: String,
}

impl TransportError {
    /// Create a transport error from an AMQP condition symbol
    pub fn new(condition: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            description: description.into(),
        }
    }

    /// Create a socket-level error
    pub fn io(description: impl Into<String>) -> Self {
        Self::new(conditions::SYSTEM_IO, description)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.condition, self.description)
    }
}

impl std::error::Error for TransportError {}

// ============================================================================
// Error Conditions
// ============================================================================

/// Domain classification of a transport error condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCondition {
    ServiceUnavailable,
    ServerBusy,
    InternalServerError,
    OperationTimeout,
    ConnectionForced,
    DetachForced,
    FramingError,
    ConnectionLost,
    Unauthorized,
    EntityNotFound,
    EntityDisabled,
    QuotaExceeded,
    InvalidOperation,
    NotImplemented,
    PreconditionFailed,
    DecodeError,
    MessageLockLost,
    SessionLockLost,
    SessionCannotBeLocked,
    MessageNotFound,
    LinkStolen,
    Unknown,
}

impl ErrorCondition {
    /// Map an AMQP condition symbol to its domain classification
    pub fn from_amqp(condition: &str) -> Self {
        match condition {
            conditions::SERVICE_UNAVAILABLE => Self::ServiceUnavailable,
            conditions::SERVER_BUSY => Self::ServerBusy,
            conditions::INTERNAL_ERROR => Self::InternalServerError,
            conditions::TIMEOUT => Self::OperationTimeout,
            conditions::CONNECTION_FORCED => Self::ConnectionForced,
            conditions::DETACH_FORCED => Self::DetachForced,
            conditions::FRAMING_ERROR => Self::FramingError,
            conditions::SYSTEM_IO => Self::ConnectionLost,
            conditions::UNAUTHORIZED_ACCESS => Self::Unauthorized,
            conditions::NOT_FOUND => Self::EntityNotFound,
            conditions::ENTITY_DISABLED => Self::EntityDisabled,
            conditions::RESOURCE_LIMIT_EXCEEDED => Self::QuotaExceeded,
            conditions::NOT_ALLOWED => Self::InvalidOperation,
            conditions::NOT_IMPLEMENTED => Self::NotImplemented,
            conditions::PRECONDITION_FAILED => Self::PreconditionFailed,
            conditions::DECODE_ERROR => Self::DecodeError,
            conditions::MESSAGE_LOCK_LOST => Self::MessageLockLost,
            conditions::SESSION_LOCK_LOST => Self::SessionLockLost,
            conditions::SESSION_CANNOT_BE_LOCKED => Self::SessionCannotBeLocked,
            conditions::MESSAGE_NOT_FOUND => Self::MessageNotFound,
            conditions::LINK_STOLEN => Self::LinkStolen,
            _ => Self::Unknown,
        }
    }

    /// Stable code reported to applications
    pub fn code(&self) -> &'static str {
        match self {
            Self::ServiceUnavailable => "ServiceUnavailableError",
            Self::ServerBusy => "ServerBusyError",
            Self::InternalServerError => "InternalServerError",
            Self::OperationTimeout => "OperationTimeoutError",
            Self::ConnectionForced => "ConnectionForcedError",
            Self::DetachForced => "DetachForcedError",
            Self::FramingError => "FramingError",
            Self::ConnectionLost => "ConnectionLostError",
            Self::Unauthorized => "UnauthorizedError",
            Self::EntityNotFound => "MessagingEntityNotFoundError",
            Self::EntityDisabled => "MessagingEntityDisabledError",
            Self::QuotaExceeded => "QuotaExceededError",
            Self::InvalidOperation => "InvalidOperationError",
            Self::NotImplemented => "NotImplementedError",
            Self::PreconditionFailed => "PreconditionFailedError",
            Self::DecodeError => "DecodeError",
            Self::MessageLockLost => "MessageLockLostError",
            Self::SessionLockLost => "SessionLockLostError",
            Self::SessionCannotBeLocked => "SessionCannotBeLockedError",
            Self::MessageNotFound => "MessageNotFoundError",
            Self::LinkStolen => "ReceiverDisconnectedError",
            Self::Unknown => "UnknownError",
        }
    }

    /// Check if an operation failing with this condition may be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ServiceUnavailable => true,
            Self::ServerBusy => true,
            Self::InternalServerError => true,
            Self::OperationTimeout => true,
            Self::ConnectionForced => true,
            Self::DetachForced => true,
            Self::FramingError => true,
            Self::ConnectionLost => true,
            Self::Unauthorized => false,
            Self::EntityNotFound => false,
            Self::EntityDisabled => false,
            Self::QuotaExceeded => false,
            Self::InvalidOperation => false,
            Self::NotImplemented => false,
            Self::PreconditionFailed => false,
            Self::DecodeError => false,
            Self::MessageLockLost => false,
            Self::SessionLockLost => false,
            Self::SessionCannotBeLocked => false,
            Self::MessageNotFound => false,
            Self::LinkStolen => false,
            Self::Unknown => false,
        }
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// ============================================================================
// Receiver Errors
// ============================================================================

/// Comprehensive error type for link, settlement and renewal operations
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("{condition}: {description}")]
    Amqp {
        condition: ErrorCondition,
        description: String,
        retryable: bool,
    },

    #[error("Invalid settlement kind '{kind}': expected complete, abandon, defer or deadletter")]
    InvalidSettlementKind { kind: String },

    #[error("Delivery {delivery} already has a settlement in flight")]
    SettlementInFlight { delivery: DeliveryId },

    #[error("Message {sequence_number} has already been settled")]
    AlreadySettled { sequence_number: i64 },

    #[error("Operation '{operation}' is not supported in {mode} mode")]
    UnsupportedInMode {
        mode: ReceiveMode,
        operation: String,
    },

    #[error("Link '{name}' is closed")]
    ReceiverClosed { name: LinkName },

    #[error("Link '{name}' is already connecting")]
    AlreadyConnecting { name: LinkName },

    #[error("A {role} receiver is already active for '{entity}'")]
    RoleOccupied { role: String, entity: String },

    #[error("A batch receive is already in progress on '{name}'")]
    BatchInProgress { name: LinkName },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Message handler failed: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl ReceiverError {
    /// Build a domain error for a condition with the condition's retry rule
    pub fn amqp(condition: ErrorCondition, description: impl Into<String>) -> Self {
        Self::Amqp {
            condition,
            description: description.into(),
            retryable: condition.is_retryable(),
        }
    }

    /// Recover a domain error from an application handler failure.
    ///
    /// Handlers that fail with a `ReceiverError` (for example a lock-lost error
    /// returned from a settlement call) keep their classification.
    pub fn from_handler(error: anyhow::Error) -> Self {
        match error.downcast::<ReceiverError>() {
            Ok(receiver_error) => receiver_error,
            Err(other) => Self::Handler(other.into()),
        }
    }

    /// Condition carried by a translated transport error
    pub fn condition(&self) -> Option<ErrorCondition> {
        match self {
            Self::Amqp { condition, .. } => Some(*condition),
            _ => None,
        }
    }

    /// Stable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            Self::Amqp { condition, .. } => condition.code(),
            Self::InvalidSettlementKind { .. } => "InvalidSettlementKindError",
            Self::SettlementInFlight { .. } => "SettlementInFlightError",
            Self::AlreadySettled { .. } => "MessageAlreadySettledError",
            Self::UnsupportedInMode { .. } => "InvalidOperationError",
            Self::ReceiverClosed { .. } => "ReceiverClosedError",
            Self::AlreadyConnecting { .. } => "AlreadyConnectingError",
            Self::RoleOccupied { .. } => "ReceiverAlreadyActiveError",
            Self::BatchInProgress { .. } => "BatchInProgressError",
            Self::Timeout { .. } => "OperationTimeoutError",
            Self::Handler(_) => "HandlerError",
            Self::Configuration(_) => "ConfigurationError",
            Self::Validation(_) => "ValidationError",
        }
    }

    /// Check if the failed operation may be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Amqp { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            Self::AlreadyConnecting { .. } => true,
            _ => false,
        }
    }

    /// Check if the error reports a lock that is already gone
    pub fn is_lock_lost(&self) -> bool {
        matches!(
            self.condition(),
            Some(ErrorCondition::MessageLockLost) | Some(ErrorCondition::SessionLockLost)
        )
    }
}

impl From<TransportError> for ReceiverError {
    fn from(error: TransportError) -> Self {
        translate(&error)
    }
}

/// Translate a raw transport error into a domain error.
pub fn translate(error: &TransportError) -> ReceiverError {
    ReceiverError::amqp(
        ErrorCondition::from_amqp(&error.condition),
        error.description.clone(),
    )
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}
