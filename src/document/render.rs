//! Compliance XML rendering

use std::collections::BTreeMap;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use super::DocumentError;
use crate::crypto::{normalize_amount, normalize_tax_id};
use crate::domain::{
    Invoice, InvoiceLine, PartyIdentity, RegistryEntry, SubmissionMode, TenantComplianceConfig,
};

pub const SUBMISSION_NAMESPACE: &str = "urn:fiscal-registry:submission:v1";

/// Fixed document type code (complete invoice)
pub const DOCUMENT_TYPE_CODE: &str = "F1";

/// Fixed tax regime code (general regime)
pub const REGIME_CODE: &str = "01";

/// One tax-breakdown group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxGroup {
    /// Percent
    pub rate: Decimal,
    pub base: Decimal,
    pub tax: Decimal,
}

/// Group invoice lines by tax rate, summing bases and taxes per rate.
///
/// Rates compare numerically (`21` and `21.00` share a group). Groups come
/// out in ascending rate order. Amounts are rounded to cents half away from
/// zero after summing.
pub fn tax_breakdown(lines: &[InvoiceLine]) -> Vec<TaxGroup> {
    let mut bases: BTreeMap<Decimal, Decimal> = BTreeMap::new();
    for line in lines {
        *bases.entry(line.tax_rate.normalize()).or_default() += line.base();
    }

    bases
        .into_iter()
        .map(|(rate, base)| {
            let tax = base * rate / Decimal::ONE_HUNDRED;
            TaxGroup {
                rate,
                base: round_cents(base),
                tax: round_cents(tax),
            }
        })
        .collect()
}

fn round_cents(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Render the submission document of `entry` from its frozen snapshot
pub fn render_entry(
    entry: &RegistryEntry,
    config: &TenantComplianceConfig,
) -> Result<String, DocumentError> {
    let snapshot = &entry.snapshot;
    render(
        entry,
        config,
        &snapshot.issuer,
        &snapshot.invoice,
        &snapshot.counterparty,
    )
}

/// Render the submission document.
///
/// Identification and chain fields come from `entry` (as hashed); lines and
/// party names from the collaborator records.
pub fn render(
    entry: &RegistryEntry,
    config: &TenantComplianceConfig,
    tenant: &PartyIdentity,
    invoice: &Invoice,
    counterparty: &PartyIdentity,
) -> Result<String, DocumentError> {
    let mut doc = XmlBuilder::new();

    doc.decl()?;
    doc.open_with("ComplianceSubmission", &[("xmlns", SUBMISSION_NAMESPACE)])?;

    doc.open("Header")?;
    doc.open("Issuer")?;
    doc.leaf("Name", &tenant.name)?;
    doc.leaf("TaxId", &normalize_tax_id(&entry.issuer_tax_id))?;
    doc.close("Issuer")?;
    if config.mode == SubmissionMode::Verifiable {
        doc.leaf("VoluntaryRemission", "S")?;
    }
    doc.leaf("Environment", config.environment.as_str())?;
    doc.close("Header")?;

    doc.open("RegistrationRecord")?;

    doc.open("DocumentId")?;
    doc.leaf("IssuerTaxId", &normalize_tax_id(&entry.issuer_tax_id))?;
    doc.leaf("DocumentNumber", entry.document_number.trim())?;
    doc.leaf("IssueDate", &entry.issue_date.format("%d-%m-%Y").to_string())?;
    doc.close("DocumentId")?;

    doc.leaf("Direction", entry.direction.as_str())?;
    doc.leaf("DocumentType", DOCUMENT_TYPE_CODE)?;
    doc.leaf("RegimeCode", REGIME_CODE)?;
    let description = invoice
        .description
        .as_deref()
        .filter(|d| !d.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Invoice {}", entry.document_number.trim()));
    doc.leaf("Description", &description)?;

    let groups = tax_breakdown(&invoice.lines);
    doc.open("TaxBreakdown")?;
    for group in &groups {
        doc.open("TaxDetail")?;
        doc.leaf("TaxRate", &normalize_amount(group.rate))?;
        doc.leaf("TaxBase", &normalize_amount(group.base))?;
        doc.leaf("TaxAmount", &normalize_amount(group.tax))?;
        doc.close("TaxDetail")?;
    }
    doc.close("TaxBreakdown")?;

    let total_tax: Decimal = groups.iter().map(|g| g.tax).sum();
    doc.leaf("TotalTax", &normalize_amount(total_tax))?;
    doc.leaf("TotalAmount", &normalize_amount(entry.total_amount))?;

    doc.open("Counterparty")?;
    doc.leaf("Name", &counterparty.name)?;
    doc.leaf("TaxId", &normalize_tax_id(&entry.counterparty_tax_id))?;
    if let Some(country) = counterparty.country_code.as_deref() {
        doc.leaf("CountryCode", country)?;
    }
    doc.close("Counterparty")?;

    doc.open("Chain")?;
    doc.leaf("SequenceNumber", &entry.sequence_number.to_string())?;
    if let Some(previous) = entry.previous_hash.as_deref() {
        doc.leaf("PreviousHash", previous)?;
    }
    doc.leaf("CurrentHash", &entry.current_hash)?;
    doc.close("Chain")?;

    doc.leaf("RecordTimestamp", &entry.created_at.to_rfc3339())?;

    doc.close("RegistrationRecord")?;
    doc.close("ComplianceSubmission")?;

    doc.finish()
}

// ============================================================================
// Writer helpers
// ============================================================================

struct XmlBuilder {
    writer: Writer<Vec<u8>>,
}

impl XmlBuilder {
    fn new() -> Self {
        Self {
            writer: Writer::new_with_indent(Vec::new(), b' ', 2),
        }
    }

    fn write(&mut self, event: Event<'_>) -> Result<(), DocumentError> {
        self.writer
            .write_event(event)
            .map_err(|e| DocumentError::Write(e.to_string()))
    }

    fn decl(&mut self) -> Result<(), DocumentError> {
        self.write(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
    }

    fn open(&mut self, name: &str) -> Result<(), DocumentError> {
        self.write(Event::Start(BytesStart::new(name)))
    }

    fn open_with(&mut self, name: &str, attributes: &[(&str, &str)]) -> Result<(), DocumentError> {
        let mut start = BytesStart::new(name);
        for attr in attributes {
            start.push_attribute(*attr);
        }
        self.write(Event::Start(start))
    }

    fn close(&mut self, name: &str) -> Result<(), DocumentError> {
        self.write(Event::End(BytesEnd::new(name)))
    }

    fn leaf(&mut self, name: &str, text: &str) -> Result<(), DocumentError> {
        self.open(name)?;
        self.write(Event::Text(BytesText::new(text)))?;
        self.close(name)
    }

    fn finish(self) -> Result<String, DocumentError> {
        String::from_utf8(self.writer.into_inner())
            .map_err(|e| DocumentError::Write(format!("non UTF-8 output: {e}")))
    }
}
