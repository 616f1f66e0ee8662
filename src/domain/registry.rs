//! Registry entries: one tamper-evident compliance record per invoice submission.

use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Url;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{
    EntryId, InvoiceDirection, InvoiceId, InvoiceSnapshot, TenantId, TransmissionState,
};
use crate::crypto::{compute_hash, ChainFields};
use crate::document::QrCode;

/// A persisted registry entry.
///
/// `current_hash` is a pure function of the chain fields and `previous_hash`
/// (see [`crate::crypto::compute_hash`]); the chain fields are stored as
/// columns so the ledger can be re-verified without any other table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub id: EntryId,
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub direction: InvoiceDirection,
    /// Strictly increasing per tenant, starting at 1
    pub sequence_number: u64,

    // Chain fields, as captured at creation
    pub issuer_tax_id: String,
    pub document_number: String,
    pub issue_date: NaiveDate,
    pub counterparty_tax_id: String,
    pub total_amount: Decimal,

    /// `None` only for the tenant's first entry
    pub previous_hash: Option<String>,
    pub current_hash: String,

    pub snapshot: InvoiceSnapshot,

    pub rendered_document: Option<String>,
    pub signed_document: Option<String>,

    // Derived, safe to regenerate
    pub qr_payload: String,
    pub qr_target_url: String,

    pub transmission_state: TransmissionState,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Set only once the entry is `sent`
    pub external_confirmation_code: Option<String>,
    pub last_response: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl RegistryEntry {
    /// The fields covered by the chain hash
    pub fn chain_fields(&self) -> ChainFields {
        ChainFields {
            issuer_tax_id: self.issuer_tax_id.clone(),
            document_number: self.document_number.clone(),
            issue_date: self.issue_date,
            counterparty_tax_id: self.counterparty_tax_id.clone(),
            total_amount: self.total_amount,
        }
    }

    /// Recompute this entry's hash from its stored fields
    pub fn recompute_hash(&self) -> String {
        compute_hash(&self.chain_fields(), self.previous_hash.as_deref())
    }

    /// Whether the worker may pick this entry up at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.transmission_state {
            TransmissionState::Pending => true,
            TransmissionState::Error => self.next_retry_at.is_some_and(|at| at <= now),
            _ => false,
        }
    }

    /// Rebuild the QR payload/URL pair against a (possibly different) base URL
    pub fn qr_code(&self, base_url: &Url) -> QrCode {
        QrCode::build(
            base_url,
            &self.issuer_tax_id,
            &self.document_number,
            self.issue_date,
            self.total_amount,
            &self.current_hash,
        )
    }
}

/// Input to the store's atomic append; sequence number and hashes are
/// assigned by the store while it holds the tenant's sequence lock.
#[derive(Debug, Clone)]
pub struct NewRegistryEntry {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub direction: InvoiceDirection,
    pub snapshot: InvoiceSnapshot,
    /// Base URL of the authority's QR verification page
    pub qr_base_url: Url,
}

impl NewRegistryEntry {
    pub fn new(
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        direction: InvoiceDirection,
        snapshot: InvoiceSnapshot,
        qr_base_url: Url,
    ) -> Self {
        Self {
            tenant_id,
            invoice_id,
            direction,
            snapshot,
            qr_base_url,
        }
    }

    pub fn chain_fields(&self) -> ChainFields {
        let invoice = &self.snapshot.invoice;
        ChainFields {
            issuer_tax_id: self.snapshot.issuer.tax_id.clone(),
            document_number: invoice.number.clone(),
            issue_date: invoice.issue_date,
            counterparty_tax_id: self.snapshot.counterparty.tax_id.clone(),
            total_amount: invoice.total_amount,
        }
    }

    /// Link this draft after `previous_hash` at `sequence_number`.
    ///
    /// Must only be called while the caller holds the tenant's sequence lock.
    pub fn seal(
        self,
        sequence_number: u64,
        previous_hash: Option<String>,
        now: DateTime<Utc>,
    ) -> RegistryEntry {
        let fields = self.chain_fields();
        let current_hash = compute_hash(&fields, previous_hash.as_deref());
        let qr = QrCode::build(
            &self.qr_base_url,
            &fields.issuer_tax_id,
            &fields.document_number,
            fields.issue_date,
            fields.total_amount,
            &current_hash,
        );

        RegistryEntry {
            id: EntryId::new(),
            tenant_id: self.tenant_id,
            invoice_id: self.invoice_id,
            direction: self.direction,
            sequence_number,
            issuer_tax_id: fields.issuer_tax_id,
            document_number: fields.document_number,
            issue_date: fields.issue_date,
            counterparty_tax_id: fields.counterparty_tax_id,
            total_amount: fields.total_amount,
            previous_hash,
            current_hash,
            snapshot: self.snapshot,
            rendered_document: None,
            signed_document: None,
            qr_payload: qr.payload,
            qr_target_url: qr.url,
            transmission_state: TransmissionState::Pending,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            external_confirmation_code: None,
            last_response: None,
            created_at: now,
            updated_at: now,
            sent_at: None,
        }
    }
}
