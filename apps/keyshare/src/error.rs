//! Error types for the keyshare server.
//!
//! All errors implement `ResponseError` for Actix-web integration,
//! converting domain errors into appropriate HTTP status codes.
//!
//! The variants fall into four families: configuration (fatal at startup),
//! authentication (wrong PIN, lockout), integrity (unknown storage key,
//! tampered container) and storage (backend unavailable, timeouts,
//! exhausted compare-and-set retries).

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Service error type with structured error responses.
#[derive(Error, Debug)]
pub enum KeyshareError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    // User errors
    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("User already exists: {0}")]
    UserExists(String),

    // Authentication errors
    #[error("Incorrect PIN ({remaining_attempts} attempts remaining)")]
    PinIncorrect {
        remaining_attempts: u32,
        /// Set when this attempt triggered a lockout.
        locked: bool,
        /// Lockout length in seconds when `locked` is set.
        lockout_secs: u64,
    },

    #[error("Account locked, retry in {retry_after_secs} seconds")]
    PinLocked { retry_after_secs: u64 },

    #[error("Invalid PIN format: {0}")]
    InvalidPin(String),

    // Integrity errors
    #[error("Secure container sealed under unknown storage key {0}")]
    UnknownStorageKey(u32),

    #[error("Secure container failed authentication")]
    ContainerTampered,

    #[error("Malformed secure container: {0}")]
    MalformedContainer(String),

    // Assertion errors
    #[error("Assertion signing failed: {0}")]
    Signing(String),

    #[error("Invalid assertion: {0}")]
    InvalidAssertion(String),

    #[error("Assertion expired")]
    AssertionExpired,

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage operation timed out after {0} ms")]
    StorageTimeout(u64),

    #[error("Concurrent update conflict for {0}, retries exhausted")]
    StorageConflict(String),

    // Request errors
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl KeyshareError {
    /// True for errors that indicate storage corruption or a key rotation
    /// mistake rather than anything the user did.
    pub fn is_integrity_fault(&self) -> bool {
        matches!(
            self,
            Self::UnknownStorageKey(_) | Self::ContainerTampered | Self::MalformedContainer(_)
        )
    }

    /// True for errors the caller may resolve by retrying the whole request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::StorageTimeout(_) | Self::StorageConflict(_)
        )
    }

    /// Get the error code for structured error responses.
    fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::Config(_) | Self::InvalidKeyMaterial(_) | Self::TlsConfig(_) => {
                Some("CONFIGURATION_ERROR")
            }
            Self::UserNotFound(_) => Some("USER_NOT_FOUND"),
            Self::UserExists(_) => Some("USER_EXISTS"),
            Self::PinIncorrect { .. } => Some("PIN_INCORRECT"),
            Self::PinLocked { .. } => Some("PIN_LOCKED"),
            Self::InvalidPin(_) => Some("INVALID_PIN"),
            Self::UnknownStorageKey(_) | Self::ContainerTampered | Self::MalformedContainer(_) => {
                Some("INTEGRITY_FAULT")
            }
            Self::Signing(_) => Some("SIGNING_FAILED"),
            Self::InvalidAssertion(_) => Some("INVALID_ASSERTION"),
            Self::AssertionExpired => Some("ASSERTION_EXPIRED"),
            Self::Storage(_) => Some("STORAGE_ERROR"),
            Self::StorageTimeout(_) => Some("STORAGE_TIMEOUT"),
            Self::StorageConflict(_) => Some("STORAGE_CONFLICT"),
            Self::Unauthorized => Some("UNAUTHORIZED"),
            Self::InvalidInput(_) => Some("INVALID_INPUT"),
            Self::Serialization(_) => Some("SERIALIZATION_ERROR"),
            Self::Deserialization(_) => Some("DESERIALIZATION_ERROR"),
            Self::Internal(_) => None, // Don't expose internal error codes
        }
    }

    /// Message shown to API callers.
    ///
    /// Integrity and configuration details stay in the server logs.
    fn public_message(&self) -> String {
        if self.is_integrity_fault() {
            "Internal integrity error".to_string()
        } else if matches!(
            self,
            Self::Config(_) | Self::InvalidKeyMaterial(_) | Self::TlsConfig(_)
        ) {
            "Internal configuration error".to_string()
        } else {
            self.to_string()
        }
    }
}

impl ResponseError for KeyshareError {
    fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request - Client errors
            Self::InvalidInput(_)
            | Self::InvalidPin(_)
            | Self::Serialization(_)
            | Self::Deserialization(_) => StatusCode::BAD_REQUEST,

            // 401 Unauthorized
            Self::Unauthorized
            | Self::PinIncorrect { .. }
            | Self::InvalidAssertion(_)
            | Self::AssertionExpired => StatusCode::UNAUTHORIZED,

            // 403 Forbidden
            Self::PinLocked { .. } => StatusCode::FORBIDDEN,

            // 404 Not Found
            Self::UserNotFound(_) => StatusCode::NOT_FOUND,

            // 409 Conflict - State conflicts
            Self::UserExists(_) | Self::StorageConflict(_) => StatusCode::CONFLICT,

            // 503 Service Unavailable - Retryable backend errors
            Self::StorageTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,

            // 500 Internal Server Error - Everything else
            Self::Config(_)
            | Self::InvalidKeyMaterial(_)
            | Self::TlsConfig(_)
            | Self::UnknownStorageKey(_)
            | Self::ContainerTampered
            | Self::MalformedContainer(_)
            | Self::Signing(_)
            | Self::Storage(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = ErrorResponse {
            error: self.public_message(),
            code: self.error_code().map(String::from),
        };

        HttpResponse::build(self.status_code()).json(body)
    }
}

// Conversion from common error types

impl From<std::io::Error> for KeyshareError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for KeyshareError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::Deserialization(err.to_string())
        } else {
            Self::Serialization(err.to_string())
        }
    }
}

impl From<redb::Error> for KeyshareError {
    fn from(err: redb::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::DatabaseError> for KeyshareError {
    fn from(err: redb::DatabaseError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::TableError> for KeyshareError {
    fn from(err: redb::TableError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::TransactionError> for KeyshareError {
    fn from(err: redb::TransactionError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::CommitError> for KeyshareError {
    fn from(err: redb::CommitError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::StorageError> for KeyshareError {
    fn from(err: redb::StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for KeyshareError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::AssertionExpired,
            // All other JWT errors are treated as invalid assertions
            _ => Self::InvalidAssertion(err.to_string()),
        }
    }
}

/// Result type alias for keyshare operations.
pub type KeyshareResult<T> = Result<T, KeyshareError>;
