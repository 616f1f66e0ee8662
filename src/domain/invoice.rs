//! Invoice data consumed from the invoicing collaborator.
//!
//! These types describe the interface boundary only: the CRUD surface that
//! produces them lives outside this crate. A snapshot of them is frozen into
//! each registry entry at creation time so later rendering is reproducible.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::InvoiceId;

/// Legal identity of a party (the tenant itself or its counterparty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyIdentity {
    /// Registered legal name
    pub name: String,
    /// Tax identification number, as entered by the user
    pub tax_id: String,
    /// ISO 3166-1 alpha-2 country code, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
}

impl PartyIdentity {
    pub fn new(name: impl Into<String>, tax_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tax_id: tax_id.into(),
            country_code: None,
        }
    }

    pub fn with_country(mut self, country_code: impl Into<String>) -> Self {
        self.country_code = Some(country_code.into());
        self
    }
}

/// One line of a finalized invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    /// Tax rate in percent (`21` means 21 %)
    pub tax_rate: Decimal,
}

impl InvoiceLine {
    pub fn new(
        description: impl Into<String>,
        quantity: Decimal,
        unit_price: Decimal,
        tax_rate: Decimal,
    ) -> Self {
        Self {
            description: description.into(),
            quantity,
            unit_price,
            tax_rate,
        }
    }

    /// Taxable base of the line (quantity × unit price), unrounded
    pub fn base(&self) -> Decimal {
        self.quantity * self.unit_price
    }
}

/// A finalized invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    /// Series + number as printed on the document
    pub number: String,
    pub issue_date: NaiveDate,
    /// Grand total including taxes
    pub total_amount: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub lines: Vec<InvoiceLine>,
}

/// Frozen copy of everything needed to render an entry's document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceSnapshot {
    pub invoice: Invoice,
    /// The tenant's legal identity at creation time
    pub issuer: PartyIdentity,
    pub counterparty: PartyIdentity,
}
