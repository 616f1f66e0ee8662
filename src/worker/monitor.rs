//! Periodic certificate expiry check

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;

use crate::custody::{CustodyService, ExpirationStatus};
use crate::domain::TenantId;
use crate::infra::{ComplianceNotification, Result};
use crate::metrics::metric_names;
use crate::registry::RegistryManager;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateCheck {
    pub tenant_id: TenantId,
    pub status: ExpirationStatus,
}

/// Notifies operators about expiring and expired signing certificates
pub struct CertificateMonitor {
    registry: Arc<RegistryManager>,
    custody: Arc<CustodyService>,
}

impl CertificateMonitor {
    pub fn new(registry: Arc<RegistryManager>, custody: Arc<CustodyService>) -> Self {
        Self { registry, custody }
    }

    /// Check every enabled tenant holding a certificate
    #[instrument(skip(self))]
    pub async fn check_all(&self, now: DateTime<Utc>) -> Result<Vec<CertificateCheck>> {
        let tenants = self.registry.store().list_certificate_tenants().await?;
        let mut checks = Vec::with_capacity(tenants.len());
        let mut attention = 0u64;

        for config in tenants {
            let tenant_id = config.tenant_id;
            let status = match self.custody.check_expiration(tenant_id, now).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(%tenant_id, error = %e, "Could not check certificate expiry");
                    continue;
                }
            };

            if status.expired {
                attention += 1;
                self.registry
                    .notify(ComplianceNotification::CertificateExpired {
                        tenant_id,
                        valid_until: status.valid_until,
                    })
                    .await;
            } else if status.expiring_soon {
                attention += 1;
                self.registry
                    .notify(ComplianceNotification::CertificateExpiring {
                        tenant_id,
                        days_remaining: status.days_remaining,
                        valid_until: status.valid_until,
                    })
                    .await;
            }

            checks.push(CertificateCheck { tenant_id, status });
        }

        if let Some(metrics) = self.registry.metrics() {
            metrics
                .set_gauge(metric_names::CERTIFICATES_EXPIRING, attention)
                .await;
        }
        tracing::info!(
            checked = checks.len(),
            needing_attention = attention,
            "Certificate expiry check complete"
        );
        Ok(checks)
    }
}
