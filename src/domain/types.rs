//! Core identifiers and enumerations for the fiscal registry.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tenant identifier (one invoicing company)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub uuid::Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn from_uuid(id: uuid::Uuid) -> Self {
        Self(id)
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Invoice identifier, owned by the invoicing collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvoiceId(pub uuid::Uuid);

impl InvoiceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn from_uuid(id: uuid::Uuid) -> Self {
        Self(id)
    }
}

impl Default for InvoiceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry entry identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub uuid::Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn from_uuid(id: uuid::Uuid) -> Self {
        Self(id)
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned when parsing one of the persisted enum labels fails
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}: {value}")]
pub struct ParseLabelError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseLabelError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Whether the invoice was issued by the tenant or received from a supplier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceDirection {
    Issued,
    Received,
}

impl InvoiceDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceDirection::Issued => "issued",
            InvoiceDirection::Received => "received",
        }
    }
}

impl FromStr for InvoiceDirection {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "issued" => Ok(Self::Issued),
            "received" => Ok(Self::Received),
            other => Err(ParseLabelError::new("invoice direction", other)),
        }
    }
}

impl fmt::Display for InvoiceDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Submission regime.
///
/// `Verifiable` records are remitted continuously to the authority as they are
/// created; `OnDemand` records are kept and only submitted when requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubmissionMode {
    Verifiable,
    OnDemand,
}

impl SubmissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionMode::Verifiable => "verifiable",
            SubmissionMode::OnDemand => "on-demand",
        }
    }
}

impl FromStr for SubmissionMode {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verifiable" => Ok(Self::Verifiable),
            "on-demand" | "on_demand" => Ok(Self::OnDemand),
            other => Err(ParseLabelError::new("submission mode", other)),
        }
    }
}

impl fmt::Display for SubmissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote service environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceEnvironment {
    Test,
    Production,
}

impl ServiceEnvironment {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceEnvironment::Test => "test",
            ServiceEnvironment::Production => "production",
        }
    }
}

impl FromStr for ServiceEnvironment {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "test" => Ok(Self::Test),
            "production" => Ok(Self::Production),
            other => Err(ParseLabelError::new("service environment", other)),
        }
    }
}

impl fmt::Display for ServiceEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transmission state of a registry entry.
///
/// ```text
/// pending ──► sending ──► sent
///    ▲           │
///    │           ├──► error ──► sending (retry, once next_retry_at elapses)
///    │           └──► rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmissionState {
    Pending,
    Sending,
    Sent,
    Error,
    Rejected,
}

impl TransmissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransmissionState::Pending => "pending",
            TransmissionState::Sending => "sending",
            TransmissionState::Sent => "sent",
            TransmissionState::Error => "error",
            TransmissionState::Rejected => "rejected",
        }
    }

    /// No further automatic transitions happen from these states.
    pub fn is_final(&self) -> bool {
        matches!(self, TransmissionState::Sent | TransmissionState::Rejected)
    }
}

impl FromStr for TransmissionState {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "error" => Ok(Self::Error),
            "rejected" => Ok(Self::Rejected),
            other => Err(ParseLabelError::new("transmission state", other)),
        }
    }
}

impl fmt::Display for TransmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
