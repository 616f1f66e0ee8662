//! Common test utilities and fixtures for integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use tokio::sync::Mutex;

use fiscal_registry::crypto::{MasterKey, SigningMaterial};
use fiscal_registry::custody::{CustodyConfig, CustodyService, InMemoryCertificateVault};
use fiscal_registry::document::QrConfig;
use fiscal_registry::domain::{Invoice, InvoiceLine, NewRegistryEntry};
use fiscal_registry::infra::{
    BackoffPolicy, CollectingNotifier, InMemoryInvoiceSource, InMemoryRegistryStore,
    RegistryError, RegistryStore, ShutdownCoordinator,
};
use fiscal_registry::metrics::MetricsRegistry;
use fiscal_registry::registry::RegistryManager;
use fiscal_registry::transport::{
    ConnectivityReport, DocumentIdentity, QueryResponse, RemoteError, RemoteState,
    SubmissionOutcome, SubmissionResponse, SubmissionTransport, TransportError,
};
use fiscal_registry::worker::{SubmissionWorker, WorkerConfig};
use fiscal_registry::{
    ComplianceEvent, EntryId, InvoiceDirection, InvoiceId, PartyIdentity,
    RegistryEntry, ServiceEnvironment, SubmissionMode, TenantComplianceConfig, TenantId,
    TransmissionState,
};

pub const CERT_PASSPHRASE: &str = "correct horse battery staple";
pub const TENANT_TAX_ID: &str = "B12345678";
pub const SIGNER_CN: &str = "Acme SL Signer";
pub const SEAL_CN: &str = "Acme SL Transport Seal";

// ============================================================================
// Certificates
// ============================================================================

pub fn ec_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

/// Self-signed certificate valid from yesterday for `days_valid` days
pub fn self_signed(key: &PKey<Private>, days_valid: i64) -> X509 {
    self_signed_named(key, SIGNER_CN, days_valid)
}

pub fn self_signed_named(key: &PKey<Private>, common_name: &str, days_valid: i64) -> X509 {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", common_name).unwrap();
    let name = name.build();

    let now = Utc::now().timestamp();
    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(77).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(key).unwrap();
    builder
        .set_not_before(&Asn1Time::from_unix(now - 86_400).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::from_unix(now + days_valid * 86_400).unwrap())
        .unwrap();
    builder.sign(key, MessageDigest::sha256()).unwrap();
    builder.build()
}

/// PKCS#12 bundle protected by [`CERT_PASSPHRASE`]
pub fn test_bundle(days_valid: i64) -> Vec<u8> {
    test_bundle_named(SIGNER_CN, days_valid)
}

pub fn test_bundle_named(common_name: &str, days_valid: i64) -> Vec<u8> {
    let key = ec_key();
    let cert = self_signed_named(&key, common_name, days_valid);
    Pkcs12::builder()
        .name("registry-test")
        .pkey(&key)
        .cert(&cert)
        .build2(CERT_PASSPHRASE)
        .unwrap()
        .to_der()
        .unwrap()
}

pub fn passphrase() -> SecretString {
    SecretString::from(CERT_PASSPHRASE.to_string())
}

pub fn test_material() -> SigningMaterial {
    SigningMaterial::from_bundle(&test_bundle(365), &passphrase()).unwrap()
}

// ============================================================================
// Scripted transport
// ============================================================================

/// What the fake remote service answers next
#[derive(Debug, Clone)]
pub enum Reply {
    Accept(String),
    AcceptWithWarning(String, RemoteError),
    Fail(RemoteError),
    Reject(RemoteError),
    /// Connection-level failure; outcome unknown
    Unreachable,
}

pub fn remote_error(code: &str, message: &str) -> RemoteError {
    RemoteError {
        code: code.to_string(),
        message: message.to_string(),
    }
}

/// One document handed to the fake service
#[derive(Debug, Clone)]
pub struct Submission {
    pub signed_xml: String,
    pub tenant_id: TenantId,
    /// Subject of the client identity the transport was handed
    pub identity_subject: String,
    pub at: tokio::time::Instant,
}

/// Transport that answers from a script; once the script runs out every
/// submission is accepted with a generated confirmation code.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    submissions: Mutex<Vec<Submission>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, reply: Reply) {
        self.replies.lock().await.push_back(reply);
    }

    pub async fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().await.clone()
    }
}

#[async_trait]
impl SubmissionTransport for ScriptedTransport {
    async fn submit(
        &self,
        signed_xml: &str,
        config: &TenantComplianceConfig,
        identity: &SigningMaterial,
    ) -> Result<SubmissionResponse, TransportError> {
        let identity_subject = identity.certificate_info(Utc::now()).unwrap().subject;
        let count = {
            let mut submissions = self.submissions.lock().await;
            submissions.push(Submission {
                signed_xml: signed_xml.to_string(),
                tenant_id: config.tenant_id,
                identity_subject,
                at: tokio::time::Instant::now(),
            });
            submissions.len()
        };

        let reply = self
            .replies
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Reply::Accept(format!("CSV-{count:04}")));

        let (outcome, http_status) = match reply {
            Reply::Accept(code) => (
                SubmissionOutcome::Accepted {
                    confirmation_code: code,
                    warning: None,
                },
                200,
            ),
            Reply::AcceptWithWarning(code, warning) => (
                SubmissionOutcome::Accepted {
                    confirmation_code: code,
                    warning: Some(warning),
                },
                200,
            ),
            Reply::Fail(e) => (SubmissionOutcome::Failed(e), 200),
            Reply::Reject(e) => (SubmissionOutcome::Rejected(e), 422),
            Reply::Unreachable => {
                return Err(TransportError::Connection("connection refused".to_string()))
            }
        };

        Ok(SubmissionResponse {
            outcome,
            http_status,
            raw_response: format!("<Response seq=\"{count}\"/>"),
        })
    }

    async fn query(
        &self,
        _document: &DocumentIdentity,
        _config: &TenantComplianceConfig,
        _identity: &SigningMaterial,
    ) -> Result<QueryResponse, TransportError> {
        Ok(QueryResponse {
            state: RemoteState::NotFound,
            confirmation_code: None,
            raw_response: String::new(),
        })
    }

    async fn test_connectivity(
        &self,
        _config: &TenantComplianceConfig,
        _identity: &SigningMaterial,
    ) -> Result<ConnectivityReport, TransportError> {
        Ok(ConnectivityReport {
            success: true,
            endpoint: "scripted".to_string(),
            latency: Duration::ZERO,
            http_status: Some(200),
            error: None,
        })
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Backoff small enough that tests can reason about it
pub fn fast_backoff(max_attempts: u32) -> BackoffPolicy {
    BackoffPolicy {
        initial_delay: Duration::from_secs(60),
        max_delay: Duration::from_secs(600),
        multiplier: 2.0,
        max_attempts,
    }
}

// ============================================================================
// Failing store
// ============================================================================

/// In-memory store whose flow-control stamps fail on demand
pub struct FlakyStore {
    inner: Arc<InMemoryRegistryStore>,
    failing_stamps: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: Arc<InMemoryRegistryStore>) -> Self {
        Self {
            inner,
            failing_stamps: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` calls to `record_submission_attempt`
    pub fn fail_stamps(&self, n: u32) {
        self.failing_stamps.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl RegistryStore for FlakyStore {
    async fn get_config(
        &self,
        tenant_id: TenantId,
    ) -> fiscal_registry::infra::Result<Option<TenantComplianceConfig>> {
        self.inner.get_config(tenant_id).await
    }

    async fn upsert_config(
        &self,
        config: &TenantComplianceConfig,
    ) -> fiscal_registry::infra::Result<()> {
        self.inner.upsert_config(config).await
    }

    async fn list_submission_tenants(
        &self,
    ) -> fiscal_registry::infra::Result<Vec<TenantComplianceConfig>> {
        self.inner.list_submission_tenants().await
    }

    async fn list_certificate_tenants(
        &self,
    ) -> fiscal_registry::infra::Result<Vec<TenantComplianceConfig>> {
        self.inner.list_certificate_tenants().await
    }

    async fn append_entry(
        &self,
        entry: NewRegistryEntry,
    ) -> fiscal_registry::infra::Result<RegistryEntry> {
        self.inner.append_entry(entry).await
    }

    async fn get_entry(
        &self,
        entry_id: EntryId,
    ) -> fiscal_registry::infra::Result<Option<RegistryEntry>> {
        self.inner.get_entry(entry_id).await
    }

    async fn list_entries(
        &self,
        tenant_id: TenantId,
        after_sequence: u64,
        limit: u32,
    ) -> fiscal_registry::infra::Result<Vec<RegistryEntry>> {
        self.inner.list_entries(tenant_id, after_sequence, limit).await
    }

    async fn find_by_invoice(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        direction: InvoiceDirection,
    ) -> fiscal_registry::infra::Result<Option<RegistryEntry>> {
        self.inner.find_by_invoice(tenant_id, invoice_id, direction).await
    }

    async fn pending_and_retryable(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
        limit: u32,
    ) -> fiscal_registry::infra::Result<Vec<RegistryEntry>> {
        self.inner.pending_and_retryable(tenant_id, now, limit).await
    }

    async fn stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        limit: u32,
    ) -> fiscal_registry::infra::Result<Vec<RegistryEntry>> {
        self.inner.stale_claims(claimed_before, limit).await
    }

    async fn transition_entry(
        &self,
        entry: &RegistryEntry,
        expected: &[TransmissionState],
        event: Option<ComplianceEvent>,
    ) -> fiscal_registry::infra::Result<bool> {
        self.inner.transition_entry(entry, expected, event).await
    }

    async fn record_submission_attempt(
        &self,
        tenant_id: TenantId,
        at: DateTime<Utc>,
    ) -> fiscal_registry::infra::Result<()> {
        let failing = self
            .failing_stamps
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RegistryError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.record_submission_attempt(tenant_id, at).await
    }

    async fn list_events(
        &self,
        entry_id: EntryId,
    ) -> fiscal_registry::infra::Result<Vec<ComplianceEvent>> {
        self.inner.list_events(entry_id).await
    }

    async fn purge_sent_before(
        &self,
        tenant_id: TenantId,
        cutoff: DateTime<Utc>,
    ) -> fiscal_registry::infra::Result<u64> {
        self.inner.purge_sent_before(tenant_id, cutoff).await
    }
}

/// One tenant wired against in-memory collaborators
pub struct Harness {
    pub tenant_id: TenantId,
    /// Backing store; the registry may see it through a wrapper
    pub store: Arc<InMemoryRegistryStore>,
    pub invoices: Arc<InMemoryInvoiceSource>,
    pub notifier: Arc<CollectingNotifier>,
    pub metrics: Arc<MetricsRegistry>,
    pub registry: Arc<RegistryManager>,
    pub custody: Arc<CustodyService>,
    pub transport: Arc<ScriptedTransport>,
    pub coordinator: ShutdownCoordinator,
}

impl Harness {
    pub async fn new(backoff: BackoffPolicy) -> Self {
        Self::with_store(backoff, |store| store).await
    }

    /// Harness whose registry and custody reach the store through `wrap`
    pub async fn with_store<F>(backoff: BackoffPolicy, wrap: F) -> Self
    where
        F: FnOnce(Arc<InMemoryRegistryStore>) -> Arc<dyn RegistryStore>,
    {
        let store = Arc::new(InMemoryRegistryStore::new());
        let invoices = Arc::new(InMemoryInvoiceSource::new());
        let notifier = Arc::new(CollectingNotifier::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let seen: Arc<dyn RegistryStore> = wrap(store.clone());

        let registry = Arc::new(
            RegistryManager::new(
                seen.clone(),
                invoices.clone(),
                notifier.clone(),
                backoff,
                QrConfig::new().unwrap(),
            )
            .with_metrics(metrics.clone()),
        );
        let mut custody_config = CustodyConfig::new(MasterKey::from_bytes([42u8; 32]), "unused");
        // Keeps the PBKDF2 cost low in tests
        custody_config.kdf_iterations = 1_000;
        let custody = Arc::new(CustodyService::new(
            custody_config,
            Arc::new(InMemoryCertificateVault::new()),
            seen,
        ));

        let harness = Self {
            tenant_id: TenantId::new(),
            store,
            invoices,
            notifier,
            metrics,
            registry,
            custody,
            transport: Arc::new(ScriptedTransport::new()),
            coordinator: ShutdownCoordinator::new(),
        };
        harness.add_tenant(harness.tenant_id).await;
        harness
    }

    /// Register an enabled tenant with its legal identity
    pub async fn add_tenant(&self, tenant_id: TenantId) {
        self.store
            .upsert_config(
                &TenantComplianceConfig::new(
                    tenant_id,
                    SubmissionMode::Verifiable,
                    ServiceEnvironment::Test,
                )
                .enabled(),
            )
            .await
            .unwrap();
        self.invoices
            .add_tenant(tenant_id, PartyIdentity::new("Acme SL", TENANT_TAX_ID))
            .await;
    }

    pub async fn upload_certificate(&self, tenant_id: TenantId) {
        self.custody
            .store_certificate(tenant_id, &test_bundle(365), passphrase())
            .await
            .unwrap();
    }

    pub async fn upload_seal_certificate(&self, tenant_id: TenantId) {
        self.custody
            .store_seal_certificate(tenant_id, &test_bundle_named(SEAL_CN, 365), passphrase())
            .await
            .unwrap();
    }

    /// Add a finalized issued invoice of 100.00 + 21 % tax
    pub async fn add_invoice(&self, tenant_id: TenantId, number: &str) -> InvoiceId {
        self.add_invoice_with(tenant_id, number, InvoiceDirection::Issued, dec!(100))
            .await
    }

    pub async fn add_invoice_with(
        &self,
        tenant_id: TenantId,
        number: &str,
        direction: InvoiceDirection,
        base: Decimal,
    ) -> InvoiceId {
        let invoice = Invoice {
            id: InvoiceId::new(),
            number: number.to_string(),
            issue_date: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            total_amount: (base * dec!(1.21)).round_dp(2),
            description: Some("Consulting services".to_string()),
            lines: vec![InvoiceLine::new("Consulting", dec!(1), base, dec!(21))],
        };
        let id = invoice.id;
        self.invoices
            .add_invoice(
                tenant_id,
                direction,
                invoice,
                Some(PartyIdentity::new("Client SA", "A87654321")),
            )
            .await;
        id
    }

    pub fn worker(&self) -> SubmissionWorker {
        self.worker_with(WorkerConfig::default())
    }

    pub fn worker_with(&self, config: WorkerConfig) -> SubmissionWorker {
        SubmissionWorker::new(
            config,
            self.registry.clone(),
            self.custody.clone(),
            self.transport.clone(),
            &self.coordinator,
        )
    }

    pub async fn config(&self, tenant_id: TenantId) -> TenantComplianceConfig {
        self.registry.tenant_config(tenant_id).await.unwrap()
    }

    /// Forget the last submission time so the next tick is not throttled
    pub async fn open_flow_window(&self, tenant_id: TenantId) {
        let mut config = self.config(tenant_id).await;
        config.last_submission_at = Some(Utc::now() - chrono::Duration::hours(1));
        self.store.upsert_config(&config).await.unwrap();
    }
}
