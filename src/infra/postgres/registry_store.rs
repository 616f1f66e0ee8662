//! PostgreSQL registry store
//!
//! # Sequence allocation
//!
//! Appending an entry locks the tenant's configuration row:
//! ```sql
//! BEGIN;
//! SELECT ... FROM tenant_compliance_configs WHERE tenant_id = $1 FOR UPDATE;
//! -- read chain head, insert entry + created event, advance last_sequence_number
//! COMMIT;
//! ```
//! so concurrent creators for one tenant serialize, while different tenants
//! never contend. `UNIQUE (tenant_id, sequence_number)` backs the lock up.
//!
//! # State transitions
//!
//! Updates are compare-and-set on `transmission_state`; the audit event is
//! written in the same transaction as the state change.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPool;
use sqlx::{FromRow, Postgres, Transaction};
use tracing::instrument;
use uuid::Uuid;

use crate::domain::{
    ComplianceEvent, ComplianceEventType, EncryptedPassphrase, EntryId, InvoiceDirection,
    InvoiceId, NewRegistryEntry, ParseLabelError, RegistryEntry, SealCredential,
    TenantComplianceConfig, TenantId, TransmissionState,
};
use crate::infra::{RegistryError, RegistryStore, Result};

const ENTRY_COLUMNS: &str = r#"
    id, tenant_id, invoice_id, direction, sequence_number,
    issuer_tax_id, document_number, issue_date, counterparty_tax_id, total_amount,
    previous_hash, current_hash, snapshot, rendered_document, signed_document,
    qr_payload, qr_target_url, transmission_state, retry_count, next_retry_at,
    last_error, external_confirmation_code, last_response,
    created_at, updated_at, sent_at
"#;

const CONFIG_COLUMNS: &str = r#"
    tenant_id, enabled, mode, environment, certificate_locator,
    passphrase_ciphertext, passphrase_iv, passphrase_salt, passphrase_auth_tag,
    certificate_uploaded_at, certificate_valid_until, use_seal_credential,
    seal_certificate_locator, seal_passphrase_ciphertext, seal_passphrase_iv,
    seal_passphrase_salt, seal_passphrase_auth_tag,
    seal_certificate_uploaded_at, seal_certificate_valid_until,
    flow_control_seconds, max_records_per_batch, auto_submit,
    last_sequence_number, last_submission_at, updated_at
"#;

/// PostgreSQL-backed registry store
#[derive(Clone)]
pub struct PgRegistryStore {
    pool: PgPool,
}

impl PgRegistryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create from connection string
    pub async fn from_url(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_config(
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: TenantId,
    ) -> Result<Option<TenantComplianceConfig>> {
        let row: Option<ConfigRow> = sqlx::query_as(&format!(
            "SELECT {CONFIG_COLUMNS} FROM tenant_compliance_configs WHERE tenant_id = $1 FOR UPDATE"
        ))
        .bind(tenant_id.0)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn chain_head(
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: TenantId,
    ) -> Result<Option<(u64, String)>> {
        let row: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT sequence_number, current_hash
            FROM registry_entries
            WHERE tenant_id = $1
            ORDER BY sequence_number DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id.0)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row.map(|(seq, hash)| (seq as u64, hash)))
    }

    async fn insert_event(
        tx: &mut Transaction<'_, Postgres>,
        event: &ComplianceEvent,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO compliance_events (id, entry_id, tenant_id, event_type, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(event.entry_id.0)
        .bind(event.tenant_id.0)
        .bind(event.event_type.as_str())
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for PgRegistryStore {
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn get_config(&self, tenant_id: TenantId) -> Result<Option<TenantComplianceConfig>> {
        let row: Option<ConfigRow> = sqlx::query_as(&format!(
            "SELECT {CONFIG_COLUMNS} FROM tenant_compliance_configs WHERE tenant_id = $1"
        ))
        .bind(tenant_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    #[instrument(skip(self, config), fields(tenant_id = %config.tenant_id))]
    async fn upsert_config(&self, config: &TenantComplianceConfig) -> Result<()> {
        let config = config.clone().normalize();
        let bundle = config.encrypted_passphrase.as_ref();
        let seal = config.seal_credential.as_ref();

        sqlx::query(
            r#"
            INSERT INTO tenant_compliance_configs (
                tenant_id, enabled, mode, environment, certificate_locator,
                passphrase_ciphertext, passphrase_iv, passphrase_salt, passphrase_auth_tag,
                certificate_uploaded_at, certificate_valid_until, use_seal_credential,
                seal_certificate_locator, seal_passphrase_ciphertext, seal_passphrase_iv,
                seal_passphrase_salt, seal_passphrase_auth_tag,
                seal_certificate_uploaded_at, seal_certificate_valid_until,
                flow_control_seconds, max_records_per_batch, auto_submit,
                last_sequence_number, last_submission_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                $13, $14, $15, $16, $17, $18, $19,
                $20, $21, $22, $23, $24, NOW()
            )
            ON CONFLICT (tenant_id) DO UPDATE SET
                enabled = EXCLUDED.enabled,
                mode = EXCLUDED.mode,
                environment = EXCLUDED.environment,
                certificate_locator = EXCLUDED.certificate_locator,
                passphrase_ciphertext = EXCLUDED.passphrase_ciphertext,
                passphrase_iv = EXCLUDED.passphrase_iv,
                passphrase_salt = EXCLUDED.passphrase_salt,
                passphrase_auth_tag = EXCLUDED.passphrase_auth_tag,
                certificate_uploaded_at = EXCLUDED.certificate_uploaded_at,
                certificate_valid_until = EXCLUDED.certificate_valid_until,
                use_seal_credential = EXCLUDED.use_seal_credential,
                seal_certificate_locator = EXCLUDED.seal_certificate_locator,
                seal_passphrase_ciphertext = EXCLUDED.seal_passphrase_ciphertext,
                seal_passphrase_iv = EXCLUDED.seal_passphrase_iv,
                seal_passphrase_salt = EXCLUDED.seal_passphrase_salt,
                seal_passphrase_auth_tag = EXCLUDED.seal_passphrase_auth_tag,
                seal_certificate_uploaded_at = EXCLUDED.seal_certificate_uploaded_at,
                seal_certificate_valid_until = EXCLUDED.seal_certificate_valid_until,
                flow_control_seconds = EXCLUDED.flow_control_seconds,
                max_records_per_batch = EXCLUDED.max_records_per_batch,
                auto_submit = EXCLUDED.auto_submit,
                last_sequence_number = GREATEST(
                    tenant_compliance_configs.last_sequence_number,
                    EXCLUDED.last_sequence_number
                ),
                last_submission_at = GREATEST(
                    tenant_compliance_configs.last_submission_at,
                    EXCLUDED.last_submission_at
                ),
                updated_at = NOW()
            "#,
        )
        .bind(config.tenant_id.0)
        .bind(config.enabled)
        .bind(config.mode.as_str())
        .bind(config.environment.as_str())
        .bind(&config.certificate_locator)
        .bind(bundle.map(|b| b.ciphertext.as_str()))
        .bind(bundle.map(|b| b.iv.as_str()))
        .bind(bundle.map(|b| b.salt.as_str()))
        .bind(bundle.map(|b| b.auth_tag.as_str()))
        .bind(config.certificate_uploaded_at)
        .bind(config.certificate_valid_until)
        .bind(config.use_seal_credential)
        .bind(seal.map(|c| c.certificate_locator.as_str()))
        .bind(seal.map(|c| c.encrypted_passphrase.ciphertext.as_str()))
        .bind(seal.map(|c| c.encrypted_passphrase.iv.as_str()))
        .bind(seal.map(|c| c.encrypted_passphrase.salt.as_str()))
        .bind(seal.map(|c| c.encrypted_passphrase.auth_tag.as_str()))
        .bind(seal.map(|c| c.uploaded_at))
        .bind(seal.map(|c| c.valid_until))
        .bind(config.flow_control_seconds as i32)
        .bind(config.max_records_per_batch as i32)
        .bind(config.auto_submit)
        .bind(config.last_sequence_number as i64)
        .bind(config.last_submission_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_submission_tenants(&self) -> Result<Vec<TenantComplianceConfig>> {
        let rows: Vec<ConfigRow> = sqlx::query_as(&format!(
            r#"
            SELECT {CONFIG_COLUMNS} FROM tenant_compliance_configs
            WHERE enabled AND auto_submit
            ORDER BY tenant_id
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_certificate_tenants(&self) -> Result<Vec<TenantComplianceConfig>> {
        let rows: Vec<ConfigRow> = sqlx::query_as(&format!(
            r#"
            SELECT {CONFIG_COLUMNS} FROM tenant_compliance_configs
            WHERE enabled
              AND certificate_locator IS NOT NULL
              AND passphrase_ciphertext IS NOT NULL
            ORDER BY tenant_id
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    #[instrument(skip(self, draft), fields(tenant_id = %draft.tenant_id, invoice_id = %draft.invoice_id))]
    async fn append_entry(&self, draft: NewRegistryEntry) -> Result<RegistryEntry> {
        let tenant_id = draft.tenant_id;
        let mut tx = self.pool.begin().await?;

        let config = Self::lock_config(&mut tx, tenant_id)
            .await?
            .filter(|c| c.enabled)
            .ok_or(RegistryError::NotEnabled(tenant_id))?;

        let head = Self::chain_head(&mut tx, tenant_id).await?;
        let head_sequence = head.as_ref().map_or(0, |(seq, _)| *seq);
        if head_sequence != config.last_sequence_number {
            return Err(RegistryError::Integrity(format!(
                "chain head {} does not match last issued sequence {}",
                head_sequence, config.last_sequence_number
            )));
        }

        let sequence_number = config.last_sequence_number + 1;
        let entry = draft.seal(sequence_number, head.map(|(_, hash)| hash), Utc::now());
        let snapshot = serde_json::to_value(&entry.snapshot)?;

        sqlx::query(&format!(
            r#"
            INSERT INTO registry_entries ({ENTRY_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26)
            "#
        ))
        .bind(entry.id.0)
        .bind(entry.tenant_id.0)
        .bind(entry.invoice_id.0)
        .bind(entry.direction.as_str())
        .bind(entry.sequence_number as i64)
        .bind(&entry.issuer_tax_id)
        .bind(&entry.document_number)
        .bind(entry.issue_date)
        .bind(&entry.counterparty_tax_id)
        .bind(entry.total_amount)
        .bind(&entry.previous_hash)
        .bind(&entry.current_hash)
        .bind(&snapshot)
        .bind(&entry.rendered_document)
        .bind(&entry.signed_document)
        .bind(&entry.qr_payload)
        .bind(&entry.qr_target_url)
        .bind(entry.transmission_state.as_str())
        .bind(entry.retry_count as i32)
        .bind(entry.next_retry_at)
        .bind(&entry.last_error)
        .bind(&entry.external_confirmation_code)
        .bind(&entry.last_response)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .bind(entry.sent_at)
        .execute(&mut *tx)
        .await?;

        let event = ComplianceEvent::new(
            entry.id,
            tenant_id,
            ComplianceEventType::Created,
            serde_json::json!({
                "sequence_number": sequence_number,
                "current_hash": entry.current_hash,
            }),
        );
        Self::insert_event(&mut tx, &event).await?;

        sqlx::query(
            r#"
            UPDATE tenant_compliance_configs
            SET last_sequence_number = $2, updated_at = NOW()
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id.0)
        .bind(sequence_number as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(sequence_number, entry_id = %entry.id, "Registry entry appended");
        Ok(entry)
    }

    async fn get_entry(&self, entry_id: EntryId) -> Result<Option<RegistryEntry>> {
        let row: Option<EntryRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM registry_entries WHERE id = $1"
        ))
        .bind(entry_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list_entries(
        &self,
        tenant_id: TenantId,
        after_sequence: u64,
        limit: u32,
    ) -> Result<Vec<RegistryEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ENTRY_COLUMNS} FROM registry_entries
            WHERE tenant_id = $1 AND sequence_number > $2
            ORDER BY sequence_number ASC
            LIMIT $3
            "#
        ))
        .bind(tenant_id.0)
        .bind(after_sequence as i64)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn find_by_invoice(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        direction: InvoiceDirection,
    ) -> Result<Option<RegistryEntry>> {
        let row: Option<EntryRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ENTRY_COLUMNS} FROM registry_entries
            WHERE tenant_id = $1 AND invoice_id = $2 AND direction = $3
            ORDER BY sequence_number DESC
            LIMIT 1
            "#
        ))
        .bind(tenant_id.0)
        .bind(invoice_id.0)
        .bind(direction.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn pending_and_retryable(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<RegistryEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ENTRY_COLUMNS} FROM registry_entries
            WHERE tenant_id = $1
              AND (transmission_state = 'pending'
                   OR (transmission_state = 'error' AND next_retry_at <= $2))
            ORDER BY sequence_number ASC
            LIMIT $3
            "#
        ))
        .bind(tenant_id.0)
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<RegistryEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ENTRY_COLUMNS} FROM registry_entries
            WHERE transmission_state = 'sending' AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#
        ))
        .bind(claimed_before)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    #[instrument(
        skip(self, entry, expected, event),
        fields(entry_id = %entry.id, to = %entry.transmission_state)
    )]
    async fn transition_entry(
        &self,
        entry: &RegistryEntry,
        expected: &[TransmissionState],
        event: Option<ComplianceEvent>,
    ) -> Result<bool> {
        let expected: Vec<String> = expected.iter().map(|s| s.as_str().to_string()).collect();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE registry_entries SET
                rendered_document = $3,
                signed_document = $4,
                transmission_state = $5,
                retry_count = $6,
                next_retry_at = $7,
                last_error = $8,
                external_confirmation_code = $9,
                last_response = $10,
                updated_at = $11,
                sent_at = $12
            WHERE id = $1 AND transmission_state = ANY($2)
            "#,
        )
        .bind(entry.id.0)
        .bind(&expected)
        .bind(&entry.rendered_document)
        .bind(&entry.signed_document)
        .bind(entry.transmission_state.as_str())
        .bind(entry.retry_count as i32)
        .bind(entry.next_retry_at)
        .bind(&entry.last_error)
        .bind(&entry.external_confirmation_code)
        .bind(&entry.last_response)
        .bind(entry.updated_at)
        .bind(entry.sent_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<(Uuid,)> =
                sqlx::query_as("SELECT id FROM registry_entries WHERE id = $1")
                    .bind(entry.id.0)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;
            return match exists {
                Some(_) => Ok(false),
                None => Err(RegistryError::not_found("registry entry", entry.id)),
            };
        }

        if let Some(event) = &event {
            Self::insert_event(&mut tx, event).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn record_submission_attempt(
        &self,
        tenant_id: TenantId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE tenant_compliance_configs
            SET last_submission_at = $2, updated_at = NOW()
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id.0)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::not_found("tenant compliance config", tenant_id));
        }
        Ok(())
    }

    async fn list_events(&self, entry_id: EntryId) -> Result<Vec<ComplianceEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT id, entry_id, tenant_id, event_type, payload, created_at
            FROM compliance_events
            WHERE entry_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(entry_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn purge_sent_before(&self, tenant_id: TenantId, cutoff: DateTime<Utc>) -> Result<u64> {
        // Everything below the first entry that must stay (not sent, or sent
        // after the cutoff) goes; the chain head always stays.
        let result = sqlx::query(
            r#"
            WITH boundary AS (
                SELECT COALESCE(
                    MIN(sequence_number) FILTER (
                        WHERE transmission_state <> 'sent'
                           OR sent_at IS NULL
                           OR sent_at >= $2
                    ),
                    MAX(sequence_number)
                ) AS seq
                FROM registry_entries
                WHERE tenant_id = $1
            )
            DELETE FROM registry_entries
            WHERE tenant_id = $1
              AND sequence_number < (SELECT seq FROM boundary)
            "#,
        )
        .bind(tenant_id.0)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn label<T>(value: &str) -> Result<T>
where
    T: FromStr<Err = ParseLabelError>,
{
    value
        .parse()
        .map_err(|e: ParseLabelError| RegistryError::Internal(format!("corrupt row: {e}")))
}

#[derive(Debug, FromRow)]
struct ConfigRow {
    tenant_id: Uuid,
    enabled: bool,
    mode: String,
    environment: String,
    certificate_locator: Option<String>,
    passphrase_ciphertext: Option<String>,
    passphrase_iv: Option<String>,
    passphrase_salt: Option<String>,
    passphrase_auth_tag: Option<String>,
    certificate_uploaded_at: Option<DateTime<Utc>>,
    certificate_valid_until: Option<DateTime<Utc>>,
    use_seal_credential: bool,
    seal_certificate_locator: Option<String>,
    seal_passphrase_ciphertext: Option<String>,
    seal_passphrase_iv: Option<String>,
    seal_passphrase_salt: Option<String>,
    seal_passphrase_auth_tag: Option<String>,
    seal_certificate_uploaded_at: Option<DateTime<Utc>>,
    seal_certificate_valid_until: Option<DateTime<Utc>>,
    flow_control_seconds: i32,
    max_records_per_batch: i32,
    auto_submit: bool,
    last_sequence_number: i64,
    last_submission_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ConfigRow> for TenantComplianceConfig {
    type Error = RegistryError;

    fn try_from(row: ConfigRow) -> Result<Self> {
        let encrypted_passphrase = match (
            row.passphrase_ciphertext,
            row.passphrase_iv,
            row.passphrase_salt,
            row.passphrase_auth_tag,
        ) {
            (Some(ciphertext), Some(iv), Some(salt), Some(auth_tag)) => Some(EncryptedPassphrase {
                ciphertext,
                iv,
                salt,
                auth_tag,
            }),
            _ => None,
        };

        let seal_credential = match (
            row.seal_certificate_locator,
            row.seal_passphrase_ciphertext,
            row.seal_passphrase_iv,
            row.seal_passphrase_salt,
            row.seal_passphrase_auth_tag,
            row.seal_certificate_uploaded_at,
            row.seal_certificate_valid_until,
        ) {
            (
                Some(certificate_locator),
                Some(ciphertext),
                Some(iv),
                Some(salt),
                Some(auth_tag),
                Some(uploaded_at),
                Some(valid_until),
            ) => Some(SealCredential {
                certificate_locator,
                encrypted_passphrase: EncryptedPassphrase {
                    ciphertext,
                    iv,
                    salt,
                    auth_tag,
                },
                uploaded_at,
                valid_until,
            }),
            _ => None,
        };

        Ok(TenantComplianceConfig {
            tenant_id: TenantId::from_uuid(row.tenant_id),
            enabled: row.enabled,
            mode: label(&row.mode)?,
            environment: label(&row.environment)?,
            certificate_locator: row.certificate_locator,
            encrypted_passphrase,
            certificate_uploaded_at: row.certificate_uploaded_at,
            certificate_valid_until: row.certificate_valid_until,
            use_seal_credential: row.use_seal_credential,
            seal_credential,
            flow_control_seconds: row.flow_control_seconds.max(0) as u32,
            max_records_per_batch: row.max_records_per_batch.max(0) as u32,
            auto_submit: row.auto_submit,
            last_sequence_number: row.last_sequence_number.max(0) as u64,
            last_submission_at: row.last_submission_at,
            updated_at: row.updated_at,
        }
        .normalize())
    }
}

#[derive(Debug, FromRow)]
struct EntryRow {
    id: Uuid,
    tenant_id: Uuid,
    invoice_id: Uuid,
    direction: String,
    sequence_number: i64,
    issuer_tax_id: String,
    document_number: String,
    issue_date: NaiveDate,
    counterparty_tax_id: String,
    total_amount: Decimal,
    previous_hash: Option<String>,
    current_hash: String,
    snapshot: serde_json::Value,
    rendered_document: Option<String>,
    signed_document: Option<String>,
    qr_payload: String,
    qr_target_url: String,
    transmission_state: String,
    retry_count: i32,
    next_retry_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    external_confirmation_code: Option<String>,
    last_response: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
}

impl TryFrom<EntryRow> for RegistryEntry {
    type Error = RegistryError;

    fn try_from(row: EntryRow) -> Result<Self> {
        Ok(RegistryEntry {
            id: EntryId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            invoice_id: InvoiceId::from_uuid(row.invoice_id),
            direction: label(&row.direction)?,
            sequence_number: row.sequence_number as u64,
            issuer_tax_id: row.issuer_tax_id,
            document_number: row.document_number,
            issue_date: row.issue_date,
            counterparty_tax_id: row.counterparty_tax_id,
            total_amount: row.total_amount,
            // CHAR(64) pads; hashes are fixed width so trimming is lossless
            previous_hash: row.previous_hash.map(|h| h.trim_end().to_string()),
            current_hash: row.current_hash.trim_end().to_string(),
            snapshot: serde_json::from_value(row.snapshot)?,
            rendered_document: row.rendered_document,
            signed_document: row.signed_document,
            qr_payload: row.qr_payload,
            qr_target_url: row.qr_target_url,
            transmission_state: label(&row.transmission_state)?,
            retry_count: row.retry_count.max(0) as u32,
            next_retry_at: row.next_retry_at,
            last_error: row.last_error,
            external_confirmation_code: row.external_confirmation_code,
            last_response: row.last_response,
            created_at: row.created_at,
            updated_at: row.updated_at,
            sent_at: row.sent_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    id: Uuid,
    entry_id: Uuid,
    tenant_id: Uuid,
    event_type: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for ComplianceEvent {
    type Error = RegistryError;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(ComplianceEvent {
            id: row.id,
            entry_id: EntryId::from_uuid(row.entry_id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            event_type: label(&row.event_type)?,
            payload: row.payload,
            created_at: row.created_at,
        })
    }
}
