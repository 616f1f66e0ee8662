//! Trait definitions for registry storage and collaborators

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;

use crate::domain::{
    ComplianceEvent, EntryId, Invoice, InvoiceDirection, InvoiceId, NewRegistryEntry,
    PartyIdentity, RegistryEntry, TenantComplianceConfig, TenantId, TransmissionState,
};

use super::notifier::ComplianceNotification;
use super::Result;

/// Persistence of the registry ledger, tenant configuration and audit trail.
///
/// Invariant: per tenant, sequence numbers are allocated by exactly one
/// writer at a time and `last_sequence_number` equals the highest issued.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn get_config(&self, tenant_id: TenantId) -> Result<Option<TenantComplianceConfig>>;

    /// Insert or replace a tenant configuration.
    ///
    /// Never lowers `last_sequence_number` or moves `last_submission_at`
    /// backwards.
    async fn upsert_config(&self, config: &TenantComplianceConfig) -> Result<()>;

    /// Enabled tenants with automatic submission
    async fn list_submission_tenants(&self) -> Result<Vec<TenantComplianceConfig>>;

    /// Enabled tenants holding a certificate
    async fn list_certificate_tenants(&self) -> Result<Vec<TenantComplianceConfig>>;

    /// Atomically allocate the next sequence number, link the draft after the
    /// tenant's last entry, persist it as `pending` and append its `created`
    /// event.
    ///
    /// Fails with `NotEnabled` if the tenant's configuration is missing or disabled.
    async fn append_entry(&self, draft: NewRegistryEntry) -> Result<RegistryEntry>;

    async fn get_entry(&self, entry_id: EntryId) -> Result<Option<RegistryEntry>>;

    /// Entries with `sequence_number > after_sequence`, ascending
    async fn list_entries(
        &self,
        tenant_id: TenantId,
        after_sequence: u64,
        limit: u32,
    ) -> Result<Vec<RegistryEntry>>;

    /// Latest entry recorded for an invoice, if any
    async fn find_by_invoice(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        direction: InvoiceDirection,
    ) -> Result<Option<RegistryEntry>>;

    /// `pending` entries plus `error` entries whose `next_retry_at <= now`,
    /// ascending by sequence number
    async fn pending_and_retryable(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<RegistryEntry>>;

    /// `sending` entries of any tenant last updated before `claimed_before`,
    /// oldest first
    async fn stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<RegistryEntry>>;

    /// Persist the mutable columns of `entry` and append `event` (if any), but
    /// only if the stored state is still one of `expected`.
    ///
    /// Returns `false` (and writes nothing) when the stored state differs.
    async fn transition_entry(
        &self,
        entry: &RegistryEntry,
        expected: &[TransmissionState],
        event: Option<ComplianceEvent>,
    ) -> Result<bool>;

    /// Stamp the tenant's last submission time (flow control)
    async fn record_submission_attempt(&self, tenant_id: TenantId, at: DateTime<Utc>)
        -> Result<()>;

    async fn list_events(&self, entry_id: EntryId) -> Result<Vec<ComplianceEvent>>;

    /// Delete `sent` entries sent before `cutoff`, returning how many went.
    ///
    /// Only a prefix of the chain may be purged: entries after the first
    /// non-`sent` entry are kept.
    async fn purge_sent_before(&self, tenant_id: TenantId, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Read access to the invoicing collaborator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InvoiceSource: Send + Sync {
    /// A finalized invoice
    async fn load_invoice(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        direction: InvoiceDirection,
    ) -> Result<Option<Invoice>>;

    /// The invoice's counterparty (client for issued, provider for received)
    async fn load_counterparty(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        direction: InvoiceDirection,
    ) -> Result<Option<PartyIdentity>>;

    /// The tenant's own legal identity
    async fn load_tenant_identity(&self, tenant_id: TenantId) -> Result<Option<PartyIdentity>>;
}

/// Outbound notification seam (certificate expiry, exhausted retries, ...)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ComplianceNotifier: Send + Sync {
    async fn notify(&self, notification: ComplianceNotification) -> Result<()>;
}
