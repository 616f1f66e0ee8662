//! Read-only access to the invoicing collaborator's data.
//!
//! The invoicing system owns its tables; this crate only depends on two
//! views it is expected to publish in the same database:
//!
//! ```sql
//! registry_invoice_feed (
//!     tenant_id UUID, invoice_id UUID, direction TEXT,   -- 'issued' | 'received'
//!     number TEXT, issue_date DATE, total_amount NUMERIC, description TEXT,
//!     lines JSONB,                                       -- [{description, quantity, unit_price, tax_rate}]
//!     finalized BOOLEAN,
//!     counterparty_name TEXT, counterparty_tax_id TEXT, counterparty_country TEXT
//! )
//! registry_tenant_identity (tenant_id UUID, name TEXT, tax_id TEXT, country_code TEXT)
//! ```

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use tracing::instrument;
use uuid::Uuid;

use crate::domain::{Invoice, InvoiceDirection, InvoiceId, InvoiceLine, PartyIdentity, TenantId};
use crate::infra::{InvoiceSource, Result};

/// [`InvoiceSource`] over the collaborator's views
#[derive(Clone)]
pub struct PgInvoiceSource {
    pool: PgPool,
}

impl PgInvoiceSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct InvoiceRow {
    invoice_id: Uuid,
    number: String,
    issue_date: NaiveDate,
    total_amount: Decimal,
    description: Option<String>,
    lines: serde_json::Value,
}

#[derive(FromRow)]
struct PartyRow {
    name: Option<String>,
    tax_id: Option<String>,
    country_code: Option<String>,
}

impl PartyRow {
    /// Both name and tax id are required for a usable identity
    fn into_identity(self) -> Option<PartyIdentity> {
        let name = self.name.filter(|n| !n.trim().is_empty())?;
        let tax_id = self.tax_id.filter(|t| !t.trim().is_empty())?;
        let identity = PartyIdentity::new(name, tax_id);
        Some(match self.country_code {
            Some(code) if !code.is_empty() => identity.with_country(code),
            _ => identity,
        })
    }
}

#[async_trait]
impl InvoiceSource for PgInvoiceSource {
    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    async fn load_invoice(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        direction: InvoiceDirection,
    ) -> Result<Option<Invoice>> {
        let row: Option<InvoiceRow> = sqlx::query_as(
            r#"
            SELECT invoice_id, number, issue_date, total_amount, description, lines
            FROM registry_invoice_feed
            WHERE tenant_id = $1 AND invoice_id = $2 AND direction = $3 AND finalized
            "#,
        )
        .bind(tenant_id.0)
        .bind(invoice_id.0)
        .bind(direction.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let lines: Vec<InvoiceLine> = serde_json::from_value(row.lines)?;

        Ok(Some(Invoice {
            id: InvoiceId(row.invoice_id),
            number: row.number,
            issue_date: row.issue_date,
            total_amount: row.total_amount,
            description: row.description,
            lines,
        }))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    async fn load_counterparty(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        direction: InvoiceDirection,
    ) -> Result<Option<PartyIdentity>> {
        let row: Option<PartyRow> = sqlx::query_as(
            r#"
            SELECT counterparty_name AS name,
                   counterparty_tax_id AS tax_id,
                   counterparty_country AS country_code
            FROM registry_invoice_feed
            WHERE tenant_id = $1 AND invoice_id = $2 AND direction = $3
            "#,
        )
        .bind(tenant_id.0)
        .bind(invoice_id.0)
        .bind(direction.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(PartyRow::into_identity))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn load_tenant_identity(&self, tenant_id: TenantId) -> Result<Option<PartyIdentity>> {
        let row: Option<PartyRow> = sqlx::query_as(
            "SELECT name, tax_id, country_code FROM registry_tenant_identity WHERE tenant_id = $1",
        )
        .bind(tenant_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(PartyRow::into_identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_identity_is_missing() {
        let row = PartyRow {
            name: Some("Acme SL".into()),
            tax_id: Some("  ".into()),
            country_code: None,
        };
        assert!(row.into_identity().is_none());

        let row = PartyRow {
            name: Some("Acme SL".into()),
            tax_id: Some("B12345678".into()),
            country_code: Some("ES".into()),
        };
        let identity = row.into_identity().unwrap();
        assert_eq!(identity.tax_id, "B12345678");
        assert_eq!(identity.country_code.as_deref(), Some("ES"));
    }
}
