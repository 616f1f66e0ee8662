//! Submission worker
//!
//! Background service that drains each tenant's queue of pending and
//! retryable registry entries:
//!
//! 1. Skips tenants still inside their flow-control window
//! 2. Loads the tenant's signing material once per pass
//! 3. Per entry, in chain order: render, validate, sign, submit, record outcome
//! 4. Waits at least the tenant's flow-control delay between submissions
//!
//! Tenants are processed with bounded parallelism; entries of one tenant are
//! always processed sequentially. Every pass first releases claims that have
//! sat in `sending` longer than the claim timeout, left behind by a crashed
//! process or a store outage. A housekeeping timer checks certificate expiry
//! and applies the retention policy.
//!
//! # Configuration
//!
//! - `REGISTRY_WORKER_INTERVAL_SECS` - How often to drain queues (default: 60)
//! - `REGISTRY_WORKER_TENANT_PARALLELISM` - Tenants processed at once (default: 4)
//! - `REGISTRY_SIGN_TIMEOUT_SECS` - Upper bound on one signing operation (default: 15)
//! - `REGISTRY_CERT_CHECK_INTERVAL_SECS` - Housekeeping period (default: 86400)
//! - `REGISTRY_RETENTION_DAYS` - Purge `sent` entries older than this (default: off)
//! - `REGISTRY_CLAIM_TIMEOUT_SECS` - Age at which an entry left in `sending` is
//!   released for retry (default: 900)

mod monitor;
mod submitter;

use std::time::Duration;

use serde::Serialize;

use crate::domain::TenantId;

pub use monitor::{CertificateCheck, CertificateMonitor};
pub use submitter::{spawn_worker, SubmissionWorker};

const MAX_RETENTION_DAYS: u64 = 36_500;

/// Configuration for the submission worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub interval: Duration,
    pub tenant_parallelism: usize,
    pub sign_timeout: Duration,
    pub certificate_check_interval: Duration,
    /// Age after which `sent` entries are purged; `None` keeps everything
    pub retention: Option<chrono::Duration>,
    /// Must stay well above `sign_timeout` plus the transport timeout
    pub claim_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            tenant_parallelism: 4,
            sign_timeout: Duration::from_secs(15),
            certificate_check_interval: Duration::from_secs(86_400),
            retention: None,
            claim_timeout: Duration::from_secs(900),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let interval = env_u64("REGISTRY_WORKER_INTERVAL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.interval);

        let tenant_parallelism = env_u64("REGISTRY_WORKER_TENANT_PARALLELISM")
            .map(|n| n.max(1) as usize)
            .unwrap_or(defaults.tenant_parallelism);

        let sign_timeout = env_u64("REGISTRY_SIGN_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.sign_timeout);

        let certificate_check_interval = env_u64("REGISTRY_CERT_CHECK_INTERVAL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.certificate_check_interval);

        let retention = env_u64("REGISTRY_RETENTION_DAYS")
            .filter(|days| *days > 0)
            .map(|days| chrono::Duration::days(days.min(MAX_RETENTION_DAYS) as i64));

        let claim_timeout = env_u64("REGISTRY_CLAIM_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.claim_timeout);

        Self {
            interval,
            tenant_parallelism,
            sign_timeout,
            certificate_check_interval,
            retention,
            claim_timeout,
        }
    }
}

fn env_u64(var: &str) -> Option<u64> {
    std::env::var(var).ok().and_then(|s| s.trim().parse().ok())
}

/// Message types for worker control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMessage {
    /// Drain queues now instead of waiting for the next interval
    TickNow,
    /// Run the certificate expiry check now
    CheckCertificates,
    /// Stop after the current pass
    Shutdown,
}

/// What happened to one entry during a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOutcome {
    Sent,
    SentWithWarning,
    /// Marked `error` with a retry scheduled
    Retrying,
    /// Marked `error` without further automatic retries
    Failed,
    Rejected,
    /// Claimed by someone else or no longer due
    Skipped,
}

/// Result of draining one tenant's queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantReport {
    pub tenant_id: TenantId,
    pub throttled: bool,
    /// Why the queue could not be drained at all
    pub blocked: Option<String>,
    pub sent: u32,
    pub warnings: u32,
    pub retrying: u32,
    pub failed: u32,
    pub rejected: u32,
    pub skipped: u32,
}

impl TenantReport {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            throttled: false,
            blocked: None,
            sent: 0,
            warnings: 0,
            retrying: 0,
            failed: 0,
            rejected: 0,
            skipped: 0,
        }
    }

    pub fn record(&mut self, outcome: EntryOutcome) {
        match outcome {
            EntryOutcome::Sent => self.sent += 1,
            EntryOutcome::SentWithWarning => {
                self.sent += 1;
                self.warnings += 1;
            }
            EntryOutcome::Retrying => self.retrying += 1,
            EntryOutcome::Failed => self.failed += 1,
            EntryOutcome::Rejected => self.rejected += 1,
            EntryOutcome::Skipped => self.skipped += 1,
        }
    }

    /// Entries this pass handed to the remote service or finished otherwise
    pub fn processed(&self) -> u32 {
        self.sent + self.retrying + self.failed + self.rejected
    }
}

/// Totals of one worker tick
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub tenants: u32,
    pub throttled: u32,
    pub blocked: u32,
    pub sent: u32,
    pub warnings: u32,
    pub retrying: u32,
    pub failed: u32,
    pub rejected: u32,
}

impl TickReport {
    pub fn absorb(&mut self, tenant: &TenantReport) {
        self.tenants += 1;
        self.throttled += u32::from(tenant.throttled);
        self.blocked += u32::from(tenant.blocked.is_some());
        self.sent += tenant.sent;
        self.warnings += tenant.warnings;
        self.retrying += tenant.retrying;
        self.failed += tenant.failed;
        self.rejected += tenant.rejected;
    }

    pub fn processed(&self) -> u32 {
        self.sent + self.retrying + self.failed + self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.tenant_parallelism, 4);
        assert_eq!(config.sign_timeout, Duration::from_secs(15));
        assert!(config.retention.is_none());
    }

    #[test]
    fn test_tick_report_absorbs_tenants() {
        let mut a = TenantReport::new(TenantId::new());
        a.record(EntryOutcome::Sent);
        a.record(EntryOutcome::SentWithWarning);
        a.record(EntryOutcome::Retrying);
        a.record(EntryOutcome::Skipped);

        let mut b = TenantReport::new(TenantId::new());
        b.throttled = true;

        let mut tick = TickReport::default();
        tick.absorb(&a);
        tick.absorb(&b);

        assert_eq!(tick.tenants, 2);
        assert_eq!(tick.throttled, 1);
        assert_eq!(tick.sent, 2);
        assert_eq!(tick.warnings, 1);
        assert_eq!(tick.processed(), 3);
        assert_eq!(a.skipped, 1);
    }
}
