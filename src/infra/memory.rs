//! In-memory implementations of the storage and collaborator traits.
//!
//! A single mutex serializes every operation, which gives the same
//! per-tenant single-writer guarantee the Postgres store gets from row locks.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    ComplianceEvent, ComplianceEventType, EntryId, Invoice, InvoiceDirection, InvoiceId,
    NewRegistryEntry, PartyIdentity, RegistryEntry, TenantComplianceConfig, TenantId,
    TransmissionState,
};

use super::traits::{InvoiceSource, RegistryStore};
use super::{RegistryError, Result};

#[derive(Default)]
struct State {
    configs: HashMap<TenantId, TenantComplianceConfig>,
    /// Keyed by (tenant, sequence number) so range scans come out in chain order
    entries: BTreeMap<(TenantId, u64), RegistryEntry>,
    by_id: HashMap<EntryId, (TenantId, u64)>,
    events: Vec<ComplianceEvent>,
}

impl State {
    fn tenant_entries(&self, tenant_id: TenantId) -> impl DoubleEndedIterator<Item = &RegistryEntry> {
        self.entries
            .range((tenant_id, 0)..=(tenant_id, u64::MAX))
            .map(|(_, entry)| entry)
    }
}

/// Registry store backed by process memory
#[derive(Default)]
pub struct InMemoryRegistryStore {
    state: Mutex<State>,
}

impl InMemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a stored entry without any checks; for tamper tests
    pub async fn overwrite_entry(&self, entry: RegistryEntry) {
        let mut state = self.state.lock().await;
        let key = (entry.tenant_id, entry.sequence_number);
        state.by_id.insert(entry.id, key);
        state.entries.insert(key, entry);
    }

    pub async fn entry_count(&self, tenant_id: TenantId) -> usize {
        self.state.lock().await.tenant_entries(tenant_id).count()
    }
}

#[async_trait]
impl RegistryStore for InMemoryRegistryStore {
    async fn get_config(&self, tenant_id: TenantId) -> Result<Option<TenantComplianceConfig>> {
        Ok(self.state.lock().await.configs.get(&tenant_id).cloned())
    }

    async fn upsert_config(&self, config: &TenantComplianceConfig) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut config = config.clone().normalize();
        if let Some(existing) = state.configs.get(&config.tenant_id) {
            config.last_sequence_number = config
                .last_sequence_number
                .max(existing.last_sequence_number);
            config.last_submission_at = config.last_submission_at.max(existing.last_submission_at);
        }
        config.updated_at = Utc::now();
        state.configs.insert(config.tenant_id, config);
        Ok(())
    }

    async fn list_submission_tenants(&self) -> Result<Vec<TenantComplianceConfig>> {
        let state = self.state.lock().await;
        let mut tenants: Vec<_> = state
            .configs
            .values()
            .filter(|c| c.enabled && c.auto_submit)
            .cloned()
            .collect();
        tenants.sort_by_key(|c| c.tenant_id);
        Ok(tenants)
    }

    async fn list_certificate_tenants(&self) -> Result<Vec<TenantComplianceConfig>> {
        let state = self.state.lock().await;
        let mut tenants: Vec<_> = state
            .configs
            .values()
            .filter(|c| c.enabled && c.has_certificate())
            .cloned()
            .collect();
        tenants.sort_by_key(|c| c.tenant_id);
        Ok(tenants)
    }

    async fn append_entry(&self, draft: NewRegistryEntry) -> Result<RegistryEntry> {
        let mut state = self.state.lock().await;
        let tenant_id = draft.tenant_id;

        let config = state
            .configs
            .get(&tenant_id)
            .filter(|c| c.enabled)
            .cloned()
            .ok_or(RegistryError::NotEnabled(tenant_id))?;

        let head = state.tenant_entries(tenant_id).next_back();
        let head_sequence = head.map_or(0, |e| e.sequence_number);
        if head_sequence != config.last_sequence_number {
            return Err(RegistryError::Integrity(format!(
                "chain head {} does not match last issued sequence {}",
                head_sequence, config.last_sequence_number
            )));
        }
        let previous_hash = head.map(|e| e.current_hash.clone());

        let sequence_number = config.last_sequence_number + 1;
        let entry = draft.seal(sequence_number, previous_hash, Utc::now());

        let event = ComplianceEvent::new(
            entry.id,
            tenant_id,
            ComplianceEventType::Created,
            serde_json::json!({
                "sequence_number": sequence_number,
                "current_hash": entry.current_hash,
            }),
        );

        let key = (tenant_id, sequence_number);
        state.by_id.insert(entry.id, key);
        state.entries.insert(key, entry.clone());
        state.events.push(event);
        if let Some(config) = state.configs.get_mut(&tenant_id) {
            config.last_sequence_number = sequence_number;
            config.updated_at = Utc::now();
        }

        Ok(entry)
    }

    async fn get_entry(&self, entry_id: EntryId) -> Result<Option<RegistryEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .by_id
            .get(&entry_id)
            .and_then(|key| state.entries.get(key))
            .cloned())
    }

    async fn list_entries(
        &self,
        tenant_id: TenantId,
        after_sequence: u64,
        limit: u32,
    ) -> Result<Vec<RegistryEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .tenant_entries(tenant_id)
            .filter(|e| e.sequence_number > after_sequence)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn find_by_invoice(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        direction: InvoiceDirection,
    ) -> Result<Option<RegistryEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .tenant_entries(tenant_id)
            .filter(|e| e.invoice_id == invoice_id && e.direction == direction)
            .last()
            .cloned())
    }

    async fn pending_and_retryable(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<RegistryEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .tenant_entries(tenant_id)
            .filter(|e| e.is_due(now))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<RegistryEntry>> {
        let state = self.state.lock().await;
        let mut stale: Vec<_> = state
            .entries
            .values()
            .filter(|e| {
                e.transmission_state == TransmissionState::Sending && e.updated_at < claimed_before
            })
            .cloned()
            .collect();
        stale.sort_by_key(|e| e.updated_at);
        stale.truncate(limit as usize);
        Ok(stale)
    }

    async fn transition_entry(
        &self,
        entry: &RegistryEntry,
        expected: &[TransmissionState],
        event: Option<ComplianceEvent>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let key = state
            .by_id
            .get(&entry.id)
            .copied()
            .ok_or_else(|| RegistryError::not_found("registry entry", entry.id))?;
        let Some(stored) = state.entries.get_mut(&key) else {
            return Err(RegistryError::not_found("registry entry", entry.id));
        };
        if !expected.contains(&stored.transmission_state) {
            return Ok(false);
        }

        stored.rendered_document = entry.rendered_document.clone();
        stored.signed_document = entry.signed_document.clone();
        stored.transmission_state = entry.transmission_state;
        stored.retry_count = entry.retry_count;
        stored.next_retry_at = entry.next_retry_at;
        stored.last_error = entry.last_error.clone();
        stored.external_confirmation_code = entry.external_confirmation_code.clone();
        stored.last_response = entry.last_response.clone();
        stored.updated_at = entry.updated_at;
        stored.sent_at = entry.sent_at;

        state.events.extend(event);
        Ok(true)
    }

    async fn record_submission_attempt(
        &self,
        tenant_id: TenantId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let config = state
            .configs
            .get_mut(&tenant_id)
            .ok_or_else(|| RegistryError::not_found("tenant compliance config", tenant_id))?;
        config.last_submission_at = Some(at);
        Ok(())
    }

    async fn list_events(&self, entry_id: EntryId) -> Result<Vec<ComplianceEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.entry_id == entry_id)
            .cloned()
            .collect())
    }

    async fn purge_sent_before(&self, tenant_id: TenantId, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let entries: Vec<&RegistryEntry> = state.tenant_entries(tenant_id).collect();
        let Some(head) = entries.last().map(|e| e.sequence_number) else {
            return Ok(0);
        };

        let doomed: Vec<(EntryId, u64)> = entries
            .iter()
            .take_while(|e| {
                e.transmission_state == TransmissionState::Sent
                    && e.sent_at.is_some_and(|at| at < cutoff)
            })
            .filter(|e| e.sequence_number != head)
            .map(|e| (e.id, e.sequence_number))
            .collect();

        for (id, sequence_number) in &doomed {
            state.entries.remove(&(tenant_id, *sequence_number));
            state.by_id.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}

// ============================================================================
// Invoice source
// ============================================================================

#[derive(Clone)]
struct StoredInvoice {
    invoice: Invoice,
    counterparty: Option<PartyIdentity>,
}

/// Invoice collaborator backed by process memory
#[derive(Default)]
pub struct InMemoryInvoiceSource {
    tenants: Mutex<HashMap<TenantId, PartyIdentity>>,
    invoices: Mutex<HashMap<(TenantId, InvoiceId, InvoiceDirection), StoredInvoice>>,
}

impl InMemoryInvoiceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_tenant(&self, tenant_id: TenantId, identity: PartyIdentity) {
        self.tenants.lock().await.insert(tenant_id, identity);
    }

    pub async fn add_invoice(
        &self,
        tenant_id: TenantId,
        direction: InvoiceDirection,
        invoice: Invoice,
        counterparty: Option<PartyIdentity>,
    ) {
        self.invoices.lock().await.insert(
            (tenant_id, invoice.id, direction),
            StoredInvoice {
                invoice,
                counterparty,
            },
        );
    }
}

#[async_trait]
impl InvoiceSource for InMemoryInvoiceSource {
    async fn load_invoice(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        direction: InvoiceDirection,
    ) -> Result<Option<Invoice>> {
        let invoices = self.invoices.lock().await;
        Ok(invoices
            .get(&(tenant_id, invoice_id, direction))
            .map(|s| s.invoice.clone()))
    }

    async fn load_counterparty(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        direction: InvoiceDirection,
    ) -> Result<Option<PartyIdentity>> {
        let invoices = self.invoices.lock().await;
        Ok(invoices
            .get(&(tenant_id, invoice_id, direction))
            .and_then(|s| s.counterparty.clone()))
    }

    async fn load_tenant_identity(&self, tenant_id: TenantId) -> Result<Option<PartyIdentity>> {
        Ok(self.tenants.lock().await.get(&tenant_id).cloned())
    }
}
