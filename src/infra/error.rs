//! Error types for the fiscal registry

use thiserror::Error;

use crate::crypto::{CustodyError, SignatureError};
use crate::document::DocumentError;
use crate::domain::{EntryId, TenantId, TransmissionState};
use crate::transport::TransportError;

/// Errors surfaced by registry operations
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Missing master key, unparseable settings, tenant without certificate.
    /// Fatal; never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Tenant compliance is disabled
    #[error("compliance registry not enabled for tenant {0}")]
    NotEnabled(TenantId),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Chain mismatch or failed authentication of stored secrets.
    /// Fatal for the entry; never silently repaired.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Required document elements missing
    #[error("validation error: missing required elements {missing:?}")]
    Validation { missing: Vec<String> },

    /// Timeout, connection failure or remote 5xx; retried with backoff
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote service explicitly rejected the document
    #[error("rejected by remote service: [{code}] {message}")]
    Rejection { code: String, message: String },

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("malformed document: {0}")]
    MalformedDocument(String),

    #[error("invalid state transition for entry {entry_id}: {from} -> {to}")]
    InvalidStateTransition {
        entry_id: EntryId,
        from: TransmissionState,
        to: TransmissionState,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        RegistryError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether the failure may clear up on its own (scheduled retry)
    pub fn is_retryable(&self) -> bool {
        match self {
            RegistryError::Transport(_) => true,
            RegistryError::Database(e) => super::retry::is_retryable_db_error(e),
            _ => false,
        }
    }

    /// Whether an entry failing with this error must stop being retried
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RegistryError::Rejection { .. }
                | RegistryError::Validation { .. }
                | RegistryError::MalformedDocument(_)
                | RegistryError::Integrity(_)
        )
    }

    /// Stable label for metrics and event payloads
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::Configuration(_) => "configuration",
            RegistryError::NotEnabled(_) => "not_enabled",
            RegistryError::NotFound { .. } => "not_found",
            RegistryError::Integrity(_) => "integrity",
            RegistryError::Validation { .. } => "validation",
            RegistryError::Transport(_) => "transport",
            RegistryError::Rejection { .. } => "rejection",
            RegistryError::InvalidCertificate(_) => "invalid_certificate",
            RegistryError::MalformedDocument(_) => "malformed_document",
            RegistryError::InvalidStateTransition { .. } => "invalid_state_transition",
            RegistryError::Database(_) => "database",
            RegistryError::Internal(_) => "internal",
        }
    }
}

impl From<CustodyError> for RegistryError {
    fn from(e: CustodyError) -> Self {
        match e {
            CustodyError::Configuration(msg) => RegistryError::Configuration(msg),
            CustodyError::Integrity => RegistryError::Integrity(e.to_string()),
            CustodyError::MalformedBundle(_) => RegistryError::Integrity(e.to_string()),
            CustodyError::EncryptionFailed(msg) => RegistryError::Internal(msg),
        }
    }
}

impl From<SignatureError> for RegistryError {
    fn from(e: SignatureError) -> Self {
        match e {
            SignatureError::InvalidCertificate(msg) => RegistryError::InvalidCertificate(msg),
            SignatureError::MalformedDocument(msg) => RegistryError::MalformedDocument(msg),
            SignatureError::SigningFailed(msg) => RegistryError::Internal(msg),
        }
    }
}

impl From<DocumentError> for RegistryError {
    fn from(e: DocumentError) -> Self {
        match e {
            DocumentError::Malformed(msg) => RegistryError::MalformedDocument(msg),
            DocumentError::Write(msg) => RegistryError::Internal(msg),
        }
    }
}

impl From<TransportError> for RegistryError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Configuration(msg) => RegistryError::Configuration(msg),
            TransportError::Identity(msg) => RegistryError::InvalidCertificate(msg),
            other => RegistryError::Transport(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(e: serde_json::Error) -> Self {
        RegistryError::Internal(format!("serialization: {e}"))
    }
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;
