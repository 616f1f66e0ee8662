use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::crypto::{self, SigningMaterial};
use crate::custody::CustodyService;
use crate::document::{render_entry, validate_required_elements};
use crate::domain::{
    EntryId, RegistryEntry, TenantComplianceConfig, TenantId, MIN_FLOW_CONTROL_SECONDS,
};
use crate::infra::{
    ComplianceNotification, InFlightTracker, RegistryError, Result, ShutdownCoordinator,
    ShutdownSignal,
};
use crate::metrics::metric_names;
use crate::registry::RegistryManager;
use crate::transport::{SubmissionOutcome, SubmissionTransport};

use super::{
    CertificateMonitor, EntryOutcome, TenantReport, TickReport, WorkerConfig, WorkerMessage,
};

/// Material loaded once per tenant pass
struct Credentials {
    signing: Arc<SigningMaterial>,
    /// Client identity presented to the remote service
    identity: Arc<SigningMaterial>,
}

struct Shared {
    config: WorkerConfig,
    registry: Arc<RegistryManager>,
    custody: Arc<CustodyService>,
    transport: Arc<dyn SubmissionTransport>,
    shutdown: ShutdownSignal,
    in_flight: Arc<InFlightTracker>,
}

/// Submission worker
///
/// Runs as a background task; see the module docs for the per-tenant state
/// machine.
pub struct SubmissionWorker {
    shared: Arc<Shared>,
    monitor: CertificateMonitor,
    control_tx: mpsc::Sender<WorkerMessage>,
    control_rx: mpsc::Receiver<WorkerMessage>,
}

impl SubmissionWorker {
    pub fn new(
        config: WorkerConfig,
        registry: Arc<RegistryManager>,
        custody: Arc<CustodyService>,
        transport: Arc<dyn SubmissionTransport>,
        shutdown: &ShutdownCoordinator,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::channel(16);
        let monitor = CertificateMonitor::new(registry.clone(), custody.clone());
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                custody,
                transport,
                shutdown: shutdown.signal(),
                in_flight: shutdown.in_flight(),
            }),
            monitor,
            control_tx,
            control_rx,
        }
    }

    /// Get a sender handle for controlling the worker
    pub fn control_handle(&self) -> mpsc::Sender<WorkerMessage> {
        self.control_tx.clone()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.shared.config
    }

    pub fn monitor(&self) -> &CertificateMonitor {
        &self.monitor
    }

    /// Run until shutdown is signalled or a `Shutdown` message arrives
    pub async fn run(mut self) {
        info!(
            interval_secs = self.shared.config.interval.as_secs(),
            tenant_parallelism = self.shared.config.tenant_parallelism,
            "Starting submission worker"
        );

        let mut ticker = interval(self.shared.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut housekeeping = interval(self.shared.config.certificate_check_interval);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shared.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    info!("Submission worker shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_tick().await;
                }
                _ = housekeeping.tick() => {
                    self.housekeeping().await;
                }
                Some(msg) = self.control_rx.recv() => {
                    match msg {
                        WorkerMessage::TickNow => {
                            info!("Forced submission pass");
                            self.run_tick().await;
                        }
                        WorkerMessage::CheckCertificates => {
                            self.check_certificates().await;
                        }
                        WorkerMessage::Shutdown => {
                            info!("Submission worker shutting down");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn run_tick(&self) {
        if let Err(e) = self.tick().await {
            error!(error = %e, "Submission pass failed");
        }
    }

    /// Drain every auto-submitting tenant's queue once
    pub async fn tick(&self) -> Result<TickReport> {
        self.shared.release_stale_claims().await;

        let tenants = self
            .shared
            .registry
            .store()
            .list_submission_tenants()
            .await?;
        debug!(tenants = tenants.len(), "Starting submission pass");

        let semaphore = Arc::new(Semaphore::new(self.shared.config.tenant_parallelism.max(1)));
        let mut tasks = JoinSet::new();

        for config in tenants {
            if self.shared.shutdown.is_shutdown() {
                break;
            }
            let shared = Arc::clone(&self.shared);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let tenant_id = config.tenant_id;
                match semaphore.acquire_owned().await {
                    Ok(_permit) => shared.process_tenant(config).await,
                    Err(_) => TenantReport::new(tenant_id),
                }
            });
        }

        let mut report = TickReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(tenant) => report.absorb(&tenant),
                Err(e) => error!(error = %e, "Tenant drain task failed"),
            }
        }

        self.shared.count(metric_names::WORKER_TICKS).await;
        if report.processed() > 0 || report.blocked > 0 {
            info!(
                tenants = report.tenants,
                sent = report.sent,
                retrying = report.retrying,
                failed = report.failed,
                rejected = report.rejected,
                throttled = report.throttled,
                blocked = report.blocked,
                "Submission pass complete"
            );
        }
        Ok(report)
    }

    /// Drain one tenant's queue now, outside the regular schedule
    pub async fn process_tenant(&self, config: TenantComplianceConfig) -> TenantReport {
        self.shared.process_tenant(config).await
    }

    async fn check_certificates(&self) {
        if let Err(e) = self.monitor.check_all(Utc::now()).await {
            error!(error = %e, "Certificate expiry check failed");
        }
    }

    /// Certificate expiry check plus retention purge
    pub async fn housekeeping(&self) {
        self.check_certificates().await;

        let Some(retention) = self.shared.config.retention else {
            return;
        };
        let cutoff = Utc::now() - retention;
        let tenants = match self.shared.registry.store().list_submission_tenants().await {
            Ok(tenants) => tenants,
            Err(e) => {
                error!(error = %e, "Failed to list tenants for retention");
                return;
            }
        };
        for config in tenants {
            if let Err(e) = self
                .shared
                .registry
                .purge_sent_before(config.tenant_id, cutoff)
                .await
            {
                warn!(tenant_id = %config.tenant_id, error = %e, "Retention purge failed");
            }
        }
    }
}

impl Shared {
    async fn count(&self, name: &str) {
        if let Some(metrics) = self.registry.metrics() {
            metrics.inc_counter(name).await;
        }
    }

    async fn observe(&self, name: &str, started: Instant) {
        if let Some(metrics) = self.registry.metrics() {
            metrics
                .observe_histogram(name, started.elapsed().as_secs_f64())
                .await;
        }
    }

    async fn release_stale_claims(&self) {
        let Ok(timeout) = chrono::Duration::from_std(self.config.claim_timeout) else {
            return;
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(timeout) else {
            return;
        };
        if let Err(e) = self.registry.release_stale_claims(cutoff).await {
            error!(error = %e, "Failed to release stale submission claims");
        }
    }

    async fn process_tenant(&self, config: TenantComplianceConfig) -> TenantReport {
        let tenant_id = config.tenant_id;
        let mut report = TenantReport::new(tenant_id);
        let now = Utc::now();

        if config.is_throttled(now) {
            debug!(
                %tenant_id,
                last_submission_at = ?config.last_submission_at,
                "Tenant inside flow-control window, skipping"
            );
            report.throttled = true;
            self.count(metric_names::TENANTS_THROTTLED).await;
            return report;
        }

        let entries = match self
            .registry
            .get_pending_and_retryable(tenant_id, config.max_records_per_batch)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                error!(%tenant_id, error = %e, "Failed to load submission queue");
                report.blocked = Some(e.to_string());
                return report;
            }
        };
        if entries.is_empty() {
            return report;
        }

        let credentials = match self.credentials(&config).await {
            Ok(credentials) => credentials,
            Err(reason) => {
                report.blocked = Some(reason);
                return report;
            }
        };

        debug!(%tenant_id, queued = entries.len(), "Draining tenant queue");
        let mut last_submitted = false;

        for entry in entries {
            if self.shutdown.is_shutdown() {
                info!(%tenant_id, "Shutdown requested, leaving remaining entries queued");
                break;
            }
            if last_submitted && !self.wait_flow_control(&config).await {
                break;
            }

            let _in_flight = self.in_flight.start();
            let sequence_number = entry.sequence_number;
            match self.submit_entry(&config, &credentials, entry).await {
                Ok((outcome, submitted)) => {
                    report.record(outcome);
                    last_submitted = submitted;
                }
                Err(e) => {
                    // The entry may still be claimed; later sequence numbers
                    // wait for stale-claim recovery
                    error!(
                        %tenant_id,
                        sequence_number,
                        error = %e,
                        "Submission attempt left unresolved, stopping tenant pass"
                    );
                    report.blocked = Some(e.to_string());
                    break;
                }
            }
        }

        report
    }

    /// Sleep out the flow-control delay; `false` if shutdown interrupted it
    async fn wait_flow_control(&self, config: &TenantComplianceConfig) -> bool {
        let delay = config
            .flow_control()
            .to_std()
            .unwrap_or(Duration::from_secs(u64::from(MIN_FLOW_CONTROL_SECONDS)));
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.wait() => false,
        }
    }

    /// Load and check the tenant's signing material and transport identity,
    /// or explain why the queue is blocked
    async fn credentials(
        &self,
        config: &TenantComplianceConfig,
    ) -> std::result::Result<Credentials, String> {
        let tenant_id = config.tenant_id;
        let material = match self.custody.load_signing_material(config).await {
            Ok(material) => material,
            Err(e) => return Err(self.block(tenant_id, e.to_string()).await),
        };

        let signing = match material.not_after() {
            Ok(valid_until) if valid_until <= Utc::now() => {
                warn!(%tenant_id, %valid_until, "Signing certificate expired, queue blocked");
                self.count(metric_names::TENANTS_BLOCKED).await;
                self.registry
                    .notify(ComplianceNotification::CertificateExpired {
                        tenant_id,
                        valid_until,
                    })
                    .await;
                return Err(format!("signing certificate expired at {valid_until}"));
            }
            Ok(_) => Arc::new(material),
            Err(e) => return Err(self.block(tenant_id, e.to_string()).await),
        };

        if !config.use_seal_credential {
            return Ok(Credentials {
                identity: Arc::clone(&signing),
                signing,
            });
        }

        let seal = match self.custody.load_seal_material(config).await {
            Ok(seal) => seal,
            Err(e) => return Err(self.block(tenant_id, e.to_string()).await),
        };
        match seal.not_after() {
            Ok(valid_until) if valid_until <= Utc::now() => Err(self
                .block(tenant_id, format!("seal certificate expired at {valid_until}"))
                .await),
            Ok(_) => Ok(Credentials {
                signing,
                identity: Arc::new(seal),
            }),
            Err(e) => Err(self.block(tenant_id, e.to_string()).await),
        }
    }

    async fn block(&self, tenant_id: TenantId, reason: String) -> String {
        warn!(%tenant_id, reason = %reason, "Tenant submission queue blocked");
        self.count(metric_names::TENANTS_BLOCKED).await;
        self.registry
            .notify(ComplianceNotification::TenantBlocked {
                tenant_id,
                reason: reason.clone(),
            })
            .await;
        reason
    }

    /// Claim, prepare, submit and record one entry.
    ///
    /// The flag is true when the document was handed to the transport. Once
    /// the entry is claimed, any failure to carry the attempt through still
    /// releases it as a retryable error.
    async fn submit_entry(
        &self,
        config: &TenantComplianceConfig,
        credentials: &Credentials,
        entry: RegistryEntry,
    ) -> Result<(EntryOutcome, bool)> {
        let Some(claimed) = self.registry.begin_submission(entry.id).await? else {
            return Ok((EntryOutcome::Skipped, false));
        };
        let entry_id = claimed.id;

        let mut submitted = false;
        match self
            .deliver(config, credentials, claimed, &mut submitted)
            .await
        {
            Ok(outcome) => Ok((outcome, submitted)),
            Err(e) => {
                warn!(
                    tenant_id = %config.tenant_id,
                    %entry_id,
                    submitted,
                    error = %e,
                    "Submission attempt interrupted, releasing claim"
                );
                let failed = self
                    .registry
                    .mark_error(entry_id, &format!("submission interrupted: {e}"))
                    .await?;
                Ok((retry_outcome(&failed), submitted))
            }
        }
    }

    async fn deliver(
        &self,
        config: &TenantComplianceConfig,
        credentials: &Credentials,
        claimed: RegistryEntry,
        submitted: &mut bool,
    ) -> Result<EntryOutcome> {
        let entry_id = claimed.id;

        let (rendered, signed) = match self.prepare(config, &credentials.signing, &claimed).await {
            Ok(prepared) => prepared,
            Err(e) => return self.fail(entry_id, e).await,
        };
        self.registry
            .record_signed(claimed, rendered, signed.clone())
            .await?;

        self.registry
            .store()
            .record_submission_attempt(config.tenant_id, Utc::now())
            .await?;

        let started = Instant::now();
        *submitted = true;
        let result = self
            .transport
            .submit(&signed, config, &credentials.identity)
            .await;
        self.observe(metric_names::SUBMIT_LATENCY, started).await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                let failed = self.registry.mark_error(entry_id, &e.to_string()).await?;
                return Ok(retry_outcome(&failed));
            }
        };

        match response.outcome {
            SubmissionOutcome::Accepted {
                confirmation_code,
                warning,
            } => {
                let warning = warning.map(|w| format!("[{}] {}", w.code, w.message));
                let outcome = if warning.is_some() {
                    EntryOutcome::SentWithWarning
                } else {
                    EntryOutcome::Sent
                };
                if let Err(e) = self
                    .registry
                    .mark_sent(entry_id, &confirmation_code, &response.raw_response, warning)
                    .await
                {
                    error!(
                        tenant_id = %config.tenant_id,
                        %entry_id,
                        confirmation_code = %confirmation_code,
                        error = %e,
                        "Accepted submission could not be recorded"
                    );
                    return Err(e);
                }
                Ok(outcome)
            }
            SubmissionOutcome::Failed(remote) => {
                let message = format!("[{}] {}", remote.code, remote.message);
                let failed = self.registry.mark_error(entry_id, &message).await?;
                Ok(retry_outcome(&failed))
            }
            SubmissionOutcome::Rejected(remote) => {
                self.registry
                    .mark_rejected(
                        entry_id,
                        &remote.code,
                        &remote.message,
                        &response.raw_response,
                    )
                    .await?;
                Ok(EntryOutcome::Rejected)
            }
        }
    }

    /// Render, check required elements and sign
    async fn prepare(
        &self,
        config: &TenantComplianceConfig,
        material: &Arc<SigningMaterial>,
        entry: &RegistryEntry,
    ) -> Result<(String, String)> {
        let rendered = render_entry(entry, config)?;
        let report = validate_required_elements(&rendered)?;
        if !report.valid {
            return Err(RegistryError::Validation {
                missing: report.missing_elements,
            });
        }
        let signed = self.sign(rendered.clone(), Arc::clone(material)).await?;
        Ok((rendered, signed))
    }

    /// Sign off the async runtime, bounded by the sign timeout, and verify
    /// the result before it leaves the process
    async fn sign(&self, xml: String, material: Arc<SigningMaterial>) -> Result<String> {
        let timeout = self.config.sign_timeout;
        let started = Instant::now();

        let task = tokio::task::spawn_blocking(move || -> Result<String> {
            let signed = crypto::sign(&xml, &material)?;
            let check = crypto::validate_signature(&signed, Utc::now())?;
            if !check.cryptographically_verified {
                return Err(RegistryError::Integrity(format!(
                    "signature self-check failed: {}",
                    check.warnings.join("; ")
                )));
            }
            Ok(signed)
        });

        let result = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(RegistryError::Internal(format!("signing task failed: {e}"))),
            Err(_) => Err(RegistryError::Transport(format!(
                "signing timed out after {timeout:?}"
            ))),
        };
        self.observe(metric_names::SIGN_LATENCY, started).await;
        result
    }

    async fn fail(&self, entry_id: EntryId, error: RegistryError) -> Result<EntryOutcome> {
        if error.is_terminal() {
            self.registry.mark_failed(entry_id, &error).await?;
            Ok(EntryOutcome::Failed)
        } else {
            let failed = self
                .registry
                .mark_error(entry_id, &error.to_string())
                .await?;
            Ok(retry_outcome(&failed))
        }
    }
}

fn retry_outcome(entry: &RegistryEntry) -> EntryOutcome {
    if entry.next_retry_at.is_some() {
        EntryOutcome::Retrying
    } else {
        EntryOutcome::Failed
    }
}

/// Spawn the submission worker as a background task
pub fn spawn_worker(
    worker: SubmissionWorker,
) -> (tokio::task::JoinHandle<()>, mpsc::Sender<WorkerMessage>) {
    let control_handle = worker.control_handle();
    let handle = tokio::spawn(worker.run());
    (handle, control_handle)
}
