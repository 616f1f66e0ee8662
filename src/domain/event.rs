//! Append-only compliance audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{EntryId, ParseLabelError, TenantId};

/// Compliance event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceEventType {
    Created,
    Signed,
    Sent,
    Error,
    Rejected,
}

impl ComplianceEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceEventType::Created => "created",
            ComplianceEventType::Signed => "signed",
            ComplianceEventType::Sent => "sent",
            ComplianceEventType::Error => "error",
            ComplianceEventType::Rejected => "rejected",
        }
    }
}

impl FromStr for ComplianceEventType {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "signed" => Ok(Self::Signed),
            "sent" => Ok(Self::Sent),
            "error" => Ok(Self::Error),
            "rejected" => Ok(Self::Rejected),
            other => Err(ParseLabelError {
                kind: "compliance event type",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ComplianceEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit event. Never mutated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceEvent {
    pub id: Uuid,
    pub entry_id: EntryId,
    pub tenant_id: TenantId,
    pub event_type: ComplianceEventType,
    /// Opaque, event-type specific
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ComplianceEvent {
    pub fn new(
        entry_id: EntryId,
        tenant_id: TenantId,
        event_type: ComplianceEventType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entry_id,
            tenant_id,
            event_type,
            payload,
            created_at: Utc::now(),
        }
    }
}
