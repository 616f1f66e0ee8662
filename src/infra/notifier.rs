//! Compliance notifications for operators and the notification layer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::domain::{EntryId, TenantId};

use super::traits::ComplianceNotifier;
use super::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComplianceNotification {
    CertificateExpiring {
        tenant_id: TenantId,
        days_remaining: i64,
        valid_until: DateTime<Utc>,
    },
    CertificateExpired {
        tenant_id: TenantId,
        valid_until: DateTime<Utc>,
    },
    /// A tenant's queue could not be drained (missing certificate, bad passphrase bundle, ...)
    TenantBlocked { tenant_id: TenantId, reason: String },
    /// Retries exhausted; the entry needs manual intervention
    SubmissionFailed {
        tenant_id: TenantId,
        entry_id: EntryId,
        sequence_number: u64,
        attempts: u32,
        last_error: String,
    },
    SubmissionRejected {
        tenant_id: TenantId,
        entry_id: EntryId,
        sequence_number: u64,
        code: String,
        message: String,
    },
    ChainIntegrityViolation {
        tenant_id: TenantId,
        first_broken_at: Option<u64>,
    },
}

impl ComplianceNotification {
    pub fn tenant_id(&self) -> TenantId {
        match self {
            ComplianceNotification::CertificateExpiring { tenant_id, .. }
            | ComplianceNotification::CertificateExpired { tenant_id, .. }
            | ComplianceNotification::TenantBlocked { tenant_id, .. }
            | ComplianceNotification::SubmissionFailed { tenant_id, .. }
            | ComplianceNotification::SubmissionRejected { tenant_id, .. }
            | ComplianceNotification::ChainIntegrityViolation { tenant_id, .. } => *tenant_id,
        }
    }
}

/// Emits notifications as structured log records
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl ComplianceNotifier for TracingNotifier {
    async fn notify(&self, notification: ComplianceNotification) -> Result<()> {
        let tenant_id = notification.tenant_id();
        match &notification {
            ComplianceNotification::CertificateExpiring {
                days_remaining,
                valid_until,
                ..
            } => tracing::warn!(
                %tenant_id,
                days_remaining,
                %valid_until,
                "Signing certificate expiring soon"
            ),
            ComplianceNotification::CertificateExpired { valid_until, .. } => {
                tracing::error!(%tenant_id, %valid_until, "Signing certificate expired")
            }
            ComplianceNotification::TenantBlocked { reason, .. } => {
                tracing::error!(%tenant_id, reason = %reason, "Tenant submission queue blocked")
            }
            ComplianceNotification::SubmissionFailed {
                entry_id,
                sequence_number,
                attempts,
                last_error,
                ..
            } => tracing::error!(
                %tenant_id,
                %entry_id,
                sequence_number,
                attempts,
                last_error = %last_error,
                "Submission failed after max retries"
            ),
            ComplianceNotification::SubmissionRejected {
                entry_id,
                sequence_number,
                code,
                message,
                ..
            } => tracing::error!(
                %tenant_id,
                %entry_id,
                sequence_number,
                code = %code,
                message = %message,
                "Submission rejected by remote service"
            ),
            ComplianceNotification::ChainIntegrityViolation {
                first_broken_at, ..
            } => tracing::error!(
                %tenant_id,
                first_broken_at = ?first_broken_at,
                "Registry chain integrity violation"
            ),
        }
        Ok(())
    }
}

/// Keeps notifications in memory; for tests and embedding
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    received: Mutex<Vec<ComplianceNotification>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn received(&self) -> Vec<ComplianceNotification> {
        self.received.lock().await.clone()
    }
}

#[async_trait]
impl ComplianceNotifier for CollectingNotifier {
    async fn notify(&self, notification: ComplianceNotification) -> Result<()> {
        self.received.lock().await.push(notification);
        Ok(())
    }
}
