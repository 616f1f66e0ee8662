//! Transport client for the remote compliance service
//!
//! - [`endpoints`]: the `(mode, environment)` endpoint table with seal variants
//! - [`response`]: classification into accepted / failed / rejected
//! - [`http`]: mutually-authenticated HTTPS client
//! - [`circuit_breaker`]: per-endpoint fail-fast protection

pub mod circuit_breaker;
mod endpoints;
mod http;
mod response;

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::SigningMaterial;
use crate::domain::{RegistryEntry, TenantComplianceConfig};

pub use endpoints::*;
pub use http::HttpTransport;
pub use response::*;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport configuration error: {0}")]
    Configuration(String),

    /// The client identity could not be built from the given material
    #[error("invalid client identity: {0}")]
    Identity(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    /// 5xx or unexpected status
    #[error("remote service returned HTTP {status}")]
    Http { status: u16, body: String },

    #[error("circuit open for endpoint {0}")]
    CircuitOpen(String),

    #[error("unparseable response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    /// Whether this error says something about endpoint health
    pub fn counts_against_endpoint(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_) | TransportError::Connection(_) | TransportError::Http { .. }
        )
    }
}

/// Identification of a registered document for status queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentIdentity {
    pub issuer_tax_id: String,
    pub document_number: String,
    pub issue_date: NaiveDate,
}

impl From<&RegistryEntry> for DocumentIdentity {
    fn from(entry: &RegistryEntry) -> Self {
        Self {
            issuer_tax_id: entry.issuer_tax_id.clone(),
            document_number: entry.document_number.clone(),
            issue_date: entry.issue_date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityReport {
    pub success: bool,
    pub endpoint: String,
    pub latency: Duration,
    pub http_status: Option<u16>,
    pub error: Option<String>,
}

/// Submission of signed documents to the remote service.
///
/// `identity` authenticates the client (mutual TLS): the seal credential
/// when the tenant submits in seal mode, its signing certificate otherwise.
/// Any response the service actually sent is `Ok`, rejections included;
/// `Err` means the outcome is unknown and the submission must be retried.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SubmissionTransport: Send + Sync {
    async fn submit(
        &self,
        signed_xml: &str,
        config: &TenantComplianceConfig,
        identity: &SigningMaterial,
    ) -> Result<SubmissionResponse, TransportError>;

    async fn query(
        &self,
        document: &DocumentIdentity,
        config: &TenantComplianceConfig,
        identity: &SigningMaterial,
    ) -> Result<QueryResponse, TransportError>;

    async fn test_connectivity(
        &self,
        config: &TenantComplianceConfig,
        identity: &SigningMaterial,
    ) -> Result<ConnectivityReport, TransportError>;
}
