use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::instrument;

use crate::crypto::{verify_chain_segment, ChainBreak, ChainVerification};
use crate::document::QrConfig;
use crate::domain::{
    ComplianceEvent, ComplianceEventType, EntryId, InvoiceDirection, InvoiceId, InvoiceSnapshot,
    NewRegistryEntry, RegistryEntry, TenantComplianceConfig, TenantId, TransmissionState,
};
use crate::infra::{
    BackoffPolicy, ComplianceNotification, ComplianceNotifier, InvoiceSource, RegistryError,
    RegistryStore, Result,
};
use crate::metrics::{metric_names, MetricsRegistry};

/// States the worker may claim an entry from
const CLAIMABLE: &[TransmissionState] = &[TransmissionState::Pending, TransmissionState::Error];

/// States a failure may be recorded from
const FAILABLE: &[TransmissionState] = &[TransmissionState::Pending, TransmissionState::Sending];

const VERIFY_PAGE_SIZE: u32 = 500;

const STALE_CLAIM_BATCH: u32 = 500;

/// Owns the registry ledger.
///
/// Sequence allocation and chaining happen inside [`RegistryStore::append_entry`];
/// every later change is a compare-and-set on the entry's transmission state,
/// so two workers can never both record an outcome for the same attempt.
pub struct RegistryManager {
    store: Arc<dyn RegistryStore>,
    invoices: Arc<dyn InvoiceSource>,
    notifier: Arc<dyn ComplianceNotifier>,
    backoff: BackoffPolicy,
    qr: QrConfig,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl RegistryManager {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        invoices: Arc<dyn InvoiceSource>,
        notifier: Arc<dyn ComplianceNotifier>,
        backoff: BackoffPolicy,
        qr: QrConfig,
    ) -> Self {
        Self {
            store,
            invoices,
            notifier,
            backoff,
            qr,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<dyn RegistryStore> {
        &self.store
    }

    pub fn notifier(&self) -> &Arc<dyn ComplianceNotifier> {
        &self.notifier
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub fn metrics(&self) -> Option<&Arc<MetricsRegistry>> {
        self.metrics.as_ref()
    }

    async fn count(&self, name: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_counter(name).await;
        }
    }

    /// Deliver a notification; delivery failures are logged, never propagated
    pub async fn notify(&self, notification: ComplianceNotification) {
        if let Err(e) = self.notifier.notify(notification).await {
            tracing::warn!(error = %e, "Failed to deliver compliance notification");
        }
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    pub async fn tenant_config(&self, tenant_id: TenantId) -> Result<TenantComplianceConfig> {
        self.store
            .get_config(tenant_id)
            .await?
            .ok_or_else(|| RegistryError::not_found("tenant compliance config", tenant_id))
    }

    pub async fn get_entry(&self, entry_id: EntryId) -> Result<RegistryEntry> {
        self.store
            .get_entry(entry_id)
            .await?
            .ok_or_else(|| RegistryError::not_found("registry entry", entry_id))
    }

    pub async fn find_by_invoice(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        direction: InvoiceDirection,
    ) -> Result<Option<RegistryEntry>> {
        self.store
            .find_by_invoice(tenant_id, invoice_id, direction)
            .await
    }

    /// Audit trail of an entry, oldest first
    pub async fn entry_events(&self, entry_id: EntryId) -> Result<Vec<ComplianceEvent>> {
        self.store.list_events(entry_id).await
    }

    /// `pending` entries plus `error` entries whose retry deadline has passed,
    /// in chain order
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn get_pending_and_retryable(
        &self,
        tenant_id: TenantId,
        limit: u32,
    ) -> Result<Vec<RegistryEntry>> {
        self.store
            .pending_and_retryable(tenant_id, Utc::now(), limit)
            .await
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Record a finalized invoice in the tenant's ledger.
    ///
    /// Fails with `NotEnabled` for a missing or disabled configuration and
    /// with `NotFound` when the invoice, its counterparty or the tenant's
    /// identity cannot be loaded. For received invoices the provider is the
    /// issuer and the tenant is the counterparty.
    #[instrument(
        skip(self),
        fields(tenant_id = %tenant_id, invoice_id = %invoice_id, direction = %direction)
    )]
    pub async fn create_entry(
        &self,
        invoice_id: InvoiceId,
        direction: InvoiceDirection,
        tenant_id: TenantId,
    ) -> Result<RegistryEntry> {
        let config = self
            .store
            .get_config(tenant_id)
            .await?
            .filter(|c| c.enabled)
            .ok_or(RegistryError::NotEnabled(tenant_id))?;

        let invoice = self
            .invoices
            .load_invoice(tenant_id, invoice_id, direction)
            .await?
            .ok_or_else(|| RegistryError::not_found("invoice", invoice_id))?;
        let counterparty = self
            .invoices
            .load_counterparty(tenant_id, invoice_id, direction)
            .await?
            .ok_or_else(|| RegistryError::not_found("invoice counterparty", invoice_id))?;
        let tenant = self
            .invoices
            .load_tenant_identity(tenant_id)
            .await?
            .ok_or_else(|| RegistryError::not_found("tenant identity", tenant_id))?;

        let (issuer, counterparty) = match direction {
            InvoiceDirection::Issued => (tenant, counterparty),
            InvoiceDirection::Received => (counterparty, tenant),
        };
        let snapshot = InvoiceSnapshot {
            invoice,
            issuer,
            counterparty,
        };

        let qr_base = self.qr.base_url(config.mode, config.environment).clone();
        let draft = NewRegistryEntry::new(tenant_id, invoice_id, direction, snapshot, qr_base);
        let entry = self.store.append_entry(draft).await?;

        self.count(metric_names::ENTRIES_CREATED).await;
        tracing::info!(
            entry_id = %entry.id,
            sequence_number = entry.sequence_number,
            current_hash = %entry.current_hash,
            "Registry entry created"
        );
        Ok(entry)
    }

    // ========================================================================
    // Transmission lifecycle
    // ========================================================================

    /// Persist `updated` if the stored state is still one of `expected`
    async fn commit(
        &self,
        updated: RegistryEntry,
        expected: &[TransmissionState],
        event: Option<ComplianceEvent>,
    ) -> Result<RegistryEntry> {
        if self.store.transition_entry(&updated, expected, event).await? {
            return Ok(updated);
        }

        let current = self.get_entry(updated.id).await?;
        tracing::warn!(
            entry_id = %updated.id,
            from = %current.transmission_state,
            to = %updated.transmission_state,
            "Registry entry changed concurrently"
        );
        Err(RegistryError::InvalidStateTransition {
            entry_id: updated.id,
            from: current.transmission_state,
            to: updated.transmission_state,
        })
    }

    fn ensure_state(
        entry: &RegistryEntry,
        allowed: &[TransmissionState],
        to: TransmissionState,
    ) -> Result<()> {
        if allowed.contains(&entry.transmission_state) {
            return Ok(());
        }
        tracing::warn!(
            entry_id = %entry.id,
            state = %entry.transmission_state,
            requested = %to,
            "Refusing registry state transition"
        );
        Err(RegistryError::InvalidStateTransition {
            entry_id: entry.id,
            from: entry.transmission_state,
            to,
        })
    }

    /// Claim an entry for submission (`pending|error -> sending`).
    ///
    /// Returns `None` when the entry is no longer claimable: another worker
    /// took it, it reached a final state, or its retries are exhausted.
    #[instrument(skip(self), fields(entry_id = %entry_id))]
    pub async fn begin_submission(&self, entry_id: EntryId) -> Result<Option<RegistryEntry>> {
        let entry = self.get_entry(entry_id).await?;
        let exhausted =
            entry.transmission_state == TransmissionState::Error && entry.next_retry_at.is_none();
        if !CLAIMABLE.contains(&entry.transmission_state) || exhausted {
            tracing::debug!(state = %entry.transmission_state, "Entry not claimable");
            return Ok(None);
        }

        let mut claimed = entry;
        claimed.transmission_state = TransmissionState::Sending;
        claimed.updated_at = Utc::now();

        if self.store.transition_entry(&claimed, CLAIMABLE, None).await? {
            Ok(Some(claimed))
        } else {
            Ok(None)
        }
    }

    /// Store the rendered and signed documents of an entry being sent
    #[instrument(skip_all, fields(entry_id = %entry.id))]
    pub async fn record_signed(
        &self,
        entry: RegistryEntry,
        rendered: String,
        signed: String,
    ) -> Result<RegistryEntry> {
        Self::ensure_state(&entry, &[TransmissionState::Sending], TransmissionState::Sending)?;

        let digest = hex::encode(Sha256::digest(signed.as_bytes()));
        let mut updated = entry;
        updated.rendered_document = Some(rendered);
        updated.signed_document = Some(signed);
        updated.updated_at = Utc::now();

        let event = ComplianceEvent::new(
            updated.id,
            updated.tenant_id,
            ComplianceEventType::Signed,
            serde_json::json!({ "signed_document_sha256": digest }),
        );
        let updated = self
            .commit(updated, &[TransmissionState::Sending], Some(event))
            .await?;
        self.count(metric_names::ENTRIES_SIGNED).await;
        Ok(updated)
    }

    /// `sending -> sent`.
    ///
    /// `warning` carries the remote service's message on a partial acceptance.
    /// Calling this on an entry that is not `sending` is refused and logged.
    #[instrument(skip(self, raw_response, warning), fields(entry_id = %entry_id))]
    pub async fn mark_sent(
        &self,
        entry_id: EntryId,
        confirmation_code: &str,
        raw_response: &str,
        warning: Option<String>,
    ) -> Result<RegistryEntry> {
        let entry = self.get_entry(entry_id).await?;
        Self::ensure_state(&entry, &[TransmissionState::Sending], TransmissionState::Sent)?;

        let now = Utc::now();
        let mut sent = entry;
        sent.transmission_state = TransmissionState::Sent;
        sent.external_confirmation_code = Some(confirmation_code.to_string());
        sent.last_response = Some(raw_response.to_string());
        sent.last_error = None;
        sent.next_retry_at = None;
        sent.sent_at = Some(now);
        sent.updated_at = now;

        let has_warning = warning.is_some();
        let event = ComplianceEvent::new(
            sent.id,
            sent.tenant_id,
            ComplianceEventType::Sent,
            serde_json::json!({
                "confirmation_code": confirmation_code,
                "attempt": sent.retry_count + 1,
                "warning": warning,
            }),
        );
        let sent = self
            .commit(sent, &[TransmissionState::Sending], Some(event))
            .await?;

        self.count(metric_names::ENTRIES_SENT).await;
        if has_warning {
            self.count(metric_names::SUBMISSION_WARNINGS).await;
        }
        tracing::info!(
            tenant_id = %sent.tenant_id,
            sequence_number = sent.sequence_number,
            confirmation_code = %confirmation_code,
            has_warning,
            "Registry entry sent"
        );
        Ok(sent)
    }

    /// Record a retryable failure: bump `retry_count`, schedule the next
    /// attempt with capped exponential backoff and move to `error`.
    ///
    /// Once retries are exhausted `next_retry_at` stays empty and operators
    /// are notified.
    #[instrument(skip(self, message), fields(entry_id = %entry_id))]
    pub async fn mark_error(&self, entry_id: EntryId, message: &str) -> Result<RegistryEntry> {
        self.record_failure(entry_id, message, "retryable", true).await
    }

    /// Record a failure that must not be retried automatically (invalid
    /// document, broken certificate material). Leaves the entry in `error`
    /// with no retry deadline.
    #[instrument(skip(self, error), fields(entry_id = %entry_id, kind = error.kind()))]
    pub async fn mark_failed(
        &self,
        entry_id: EntryId,
        error: &RegistryError,
    ) -> Result<RegistryEntry> {
        self.record_failure(entry_id, &error.to_string(), error.kind(), false)
            .await
    }

    async fn record_failure(
        &self,
        entry_id: EntryId,
        message: &str,
        kind: &str,
        retry: bool,
    ) -> Result<RegistryEntry> {
        let entry = self.get_entry(entry_id).await?;
        self.fail_entry(entry, message, kind, retry).await
    }

    async fn fail_entry(
        &self,
        entry: RegistryEntry,
        message: &str,
        kind: &str,
        retry: bool,
    ) -> Result<RegistryEntry> {
        Self::ensure_state(&entry, FAILABLE, TransmissionState::Error)?;

        let now = Utc::now();
        let mut failed = entry;
        failed.retry_count = failed.retry_count.saturating_add(1);
        failed.next_retry_at = if retry {
            self.backoff.next_retry_at(now, failed.retry_count)
        } else {
            None
        };
        failed.transmission_state = TransmissionState::Error;
        failed.last_error = Some(message.to_string());
        failed.updated_at = now;

        let terminal = failed.next_retry_at.is_none();
        let event = ComplianceEvent::new(
            failed.id,
            failed.tenant_id,
            ComplianceEventType::Error,
            serde_json::json!({
                "kind": kind,
                "message": message,
                "retry_count": failed.retry_count,
                "next_retry_at": failed.next_retry_at,
                "terminal": terminal,
            }),
        );
        let failed = self.commit(failed, FAILABLE, Some(event)).await?;
        self.count(metric_names::ENTRIES_ERRORED).await;

        if terminal {
            self.count(metric_names::ENTRIES_EXHAUSTED).await;
            tracing::error!(
                tenant_id = %failed.tenant_id,
                sequence_number = failed.sequence_number,
                retry_count = failed.retry_count,
                error = %message,
                "Registry entry needs manual intervention"
            );
            self.notify(ComplianceNotification::SubmissionFailed {
                tenant_id: failed.tenant_id,
                entry_id: failed.id,
                sequence_number: failed.sequence_number,
                attempts: failed.retry_count,
                last_error: message.to_string(),
            })
            .await;
        } else {
            tracing::warn!(
                tenant_id = %failed.tenant_id,
                sequence_number = failed.sequence_number,
                retry_count = failed.retry_count,
                next_retry_at = ?failed.next_retry_at,
                error = %message,
                "Registry entry submission failed, retry scheduled"
            );
        }
        Ok(failed)
    }

    /// `sending -> rejected`; final, never retried
    #[instrument(skip(self, message, raw_response), fields(entry_id = %entry_id, code = %code))]
    pub async fn mark_rejected(
        &self,
        entry_id: EntryId,
        code: &str,
        message: &str,
        raw_response: &str,
    ) -> Result<RegistryEntry> {
        let entry = self.get_entry(entry_id).await?;
        Self::ensure_state(
            &entry,
            &[TransmissionState::Sending],
            TransmissionState::Rejected,
        )?;

        let now = Utc::now();
        let mut rejected = entry;
        rejected.transmission_state = TransmissionState::Rejected;
        rejected.last_error = Some(format!("[{code}] {message}"));
        rejected.last_response = Some(raw_response.to_string());
        rejected.next_retry_at = None;
        rejected.updated_at = now;

        let event = ComplianceEvent::new(
            rejected.id,
            rejected.tenant_id,
            ComplianceEventType::Rejected,
            serde_json::json!({
                "code": code,
                "message": message,
                "terminal": true,
            }),
        );
        let rejected = self
            .commit(rejected, &[TransmissionState::Sending], Some(event))
            .await?;

        self.count(metric_names::ENTRIES_REJECTED).await;
        tracing::error!(
            tenant_id = %rejected.tenant_id,
            sequence_number = rejected.sequence_number,
            code = %code,
            message = %message,
            "Registry entry rejected"
        );
        self.notify(ComplianceNotification::SubmissionRejected {
            tenant_id: rejected.tenant_id,
            entry_id: rejected.id,
            sequence_number: rejected.sequence_number,
            code: code.to_string(),
            message: message.to_string(),
        })
        .await;
        Ok(rejected)
    }

    /// Operator action: put an `error` entry (or one left in `sending` by a
    /// crashed worker) back into the queue with a fresh retry budget.
    ///
    /// Rejected entries cannot be requeued.
    #[instrument(skip(self), fields(entry_id = %entry_id))]
    pub async fn requeue(&self, entry_id: EntryId) -> Result<RegistryEntry> {
        const REQUEUEABLE: &[TransmissionState] =
            &[TransmissionState::Error, TransmissionState::Sending];

        let entry = self.get_entry(entry_id).await?;
        Self::ensure_state(&entry, REQUEUEABLE, TransmissionState::Pending)?;

        let mut requeued = entry;
        requeued.transmission_state = TransmissionState::Pending;
        requeued.retry_count = 0;
        requeued.next_retry_at = None;
        requeued.updated_at = Utc::now();

        let requeued = self.commit(requeued, REQUEUEABLE, None).await?;
        tracing::info!(
            tenant_id = %requeued.tenant_id,
            sequence_number = requeued.sequence_number,
            "Registry entry requeued"
        );
        Ok(requeued)
    }

    /// Release claims left in `sending` since before `claimed_before`.
    ///
    /// Each one is recorded as a retryable failure, so it gets a retry
    /// deadline and goes back into the queue ahead of later sequence numbers.
    /// Returns how many claims were released.
    #[instrument(skip(self), fields(claimed_before = %claimed_before))]
    pub async fn release_stale_claims(&self, claimed_before: DateTime<Utc>) -> Result<usize> {
        let stale = self
            .store
            .stale_claims(claimed_before, STALE_CLAIM_BATCH)
            .await?;

        let mut released = 0;
        for entry in stale {
            let entry_id = entry.id;
            let claimed_at = entry.updated_at;
            let message = format!("submission claimed at {claimed_at} never recorded an outcome");
            match self.fail_entry(entry, &message, "stale_claim", true).await {
                Ok(_) => released += 1,
                Err(RegistryError::InvalidStateTransition { .. }) => {
                    tracing::debug!(%entry_id, "Stale claim settled concurrently");
                }
                Err(e) => {
                    tracing::warn!(%entry_id, error = %e, "Failed to release stale claim");
                }
            }
        }
        if released > 0 {
            if let Some(metrics) = &self.metrics {
                metrics
                    .add_counter(metric_names::CLAIMS_RELEASED, released as u64)
                    .await;
            }
            tracing::warn!(released, "Released stale submission claims");
        }
        Ok(released)
    }

    // ========================================================================
    // Integrity and retention
    // ========================================================================

    /// Re-verify the tenant's whole retained ledger.
    ///
    /// A retained tail (after a retention purge) is anchored on its first
    /// entry's stored previous hash; the last entry must be the highest
    /// sequence number ever issued. A violation is reported to operators.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn verify_tenant_chain(&self, tenant_id: TenantId) -> Result<ChainVerification> {
        let config = self.tenant_config(tenant_id).await?;

        let mut anchor: Option<String> = None;
        let mut after = 0u64;
        let mut checked = 0u64;

        loop {
            let page = self
                .store
                .list_entries(tenant_id, after, VERIFY_PAGE_SIZE)
                .await?;
            let Some(last) = page.last() else {
                break;
            };

            if after == 0 && page[0].sequence_number > 1 {
                match &page[0].previous_hash {
                    Some(previous) => anchor = Some(previous.clone()),
                    None => {
                        let report = ChainVerification {
                            valid: false,
                            entries_checked: 1,
                            first_broken_at: Some(page[0].sequence_number),
                            reason: Some(ChainBreak::BrokenLink),
                        };
                        return self.chain_broken(tenant_id, report).await;
                    }
                }
            }

            let mut report = verify_chain_segment(&page, anchor.as_deref());
            report.entries_checked += checked;
            if !report.valid {
                return self.chain_broken(tenant_id, report).await;
            }

            checked = report.entries_checked;
            anchor = Some(last.current_hash.clone());
            after = last.sequence_number;
            if page.len() < VERIFY_PAGE_SIZE as usize {
                break;
            }
        }

        if after != config.last_sequence_number {
            let report = ChainVerification {
                valid: false,
                entries_checked: checked,
                first_broken_at: Some(after.min(config.last_sequence_number) + 1),
                reason: Some(ChainBreak::BrokenLink),
            };
            return self.chain_broken(tenant_id, report).await;
        }

        tracing::info!(entries_checked = checked, "Registry chain verified");
        Ok(ChainVerification {
            valid: true,
            entries_checked: checked,
            first_broken_at: None,
            reason: None,
        })
    }

    async fn chain_broken(
        &self,
        tenant_id: TenantId,
        report: ChainVerification,
    ) -> Result<ChainVerification> {
        self.count(metric_names::CHAIN_VIOLATIONS).await;
        tracing::error!(
            %tenant_id,
            first_broken_at = ?report.first_broken_at,
            reason = ?report.reason,
            "Registry chain integrity violation"
        );
        self.notify(ComplianceNotification::ChainIntegrityViolation {
            tenant_id,
            first_broken_at: report.first_broken_at,
        })
        .await;
        Ok(report)
    }

    /// Retention: delete `sent` entries sent before `cutoff`.
    ///
    /// Only a prefix of the chain goes and the chain head always stays.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, cutoff = %cutoff))]
    pub async fn purge_sent_before(
        &self,
        tenant_id: TenantId,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let purged = self.store.purge_sent_before(tenant_id, cutoff).await?;
        if purged > 0 {
            if let Some(metrics) = &self.metrics {
                metrics
                    .add_counter(metric_names::ENTRIES_PURGED, purged)
                    .await;
            }
            tracing::info!(purged, "Purged sent registry entries past retention");
        }
        Ok(purged)
    }
}
