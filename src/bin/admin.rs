use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{Duration, Utc};
use secrecy::SecretString;
use uuid::Uuid;

use fiscal_registry::custody::{CustodyConfig, CustodyService};
use fiscal_registry::document::QrConfig;
use fiscal_registry::infra::{
    BackoffPolicy, PgInvoiceSource, PgRegistryStore, RegistryStore, ShutdownCoordinator,
    TracingNotifier,
};
use fiscal_registry::registry::RegistryManager;
use fiscal_registry::server::connect;
use fiscal_registry::transport::{HttpTransport, SubmissionTransport, TransportConfig};
use fiscal_registry::worker::{SubmissionWorker, WorkerConfig};
use fiscal_registry::{
    EntryId, InvoiceDirection, InvoiceId, ServiceEnvironment, SubmissionMode,
    TenantComplianceConfig, TenantId,
};

fn print_help() {
    eprintln!(
        "\
fiscal-registry-admin

USAGE:
  fiscal-registry-admin <command> [options]

COMMANDS:
  migrate                         Run database migrations
  configure-tenant                Create or update a tenant's compliance configuration
  upload-certificate              Store a tenant's signing certificate (PKCS#12)
  remove-certificate              Delete a tenant's signing certificate
  upload-seal-certificate         Store a tenant's seal credential (PKCS#12)
  remove-seal-certificate         Delete a tenant's seal credential and leave seal mode
  create-entry                    Register a finalized invoice
  show-entry                      Print an entry and its audit events
  requeue                         Reset an errored or stuck entry to pending
  verify-chain                    Verify a tenant's hash chain
  tick                            Run one submission pass over all tenants
  check-certificates              Report expiring and expired certificates
  test-connectivity               Probe the remote service with a tenant's certificate
  purge-retention                 Delete sent entries older than the retention window

COMMON OPTIONS:
  --database-url <postgres_url>    (defaults to env DATABASE_URL)

configure-tenant OPTIONS:
  --tenant-id <uuid>              (required)
  --mode <verifiable|on-demand>   (default: verifiable; only for new tenants)
  --environment <test|production> (default: test; only for new tenants)
  --enable / --disable
  --flow-control-secs <n>         (minimum 60)
  --max-batch <n>
  --auto-submit <true|false>
  --seal <true|false>             Submit through the seal endpoints with the seal
                                  credential (upload it first)

upload-certificate / upload-seal-certificate OPTIONS:
  --tenant-id <uuid>              (required)
  --file <path>                   (required) PKCS#12 bundle
  --passphrase-env <VAR>          (default: REGISTRY_CERT_PASSPHRASE)

remove-certificate / remove-seal-certificate / verify-chain / test-connectivity OPTIONS:
  --tenant-id <uuid>              (required)

create-entry OPTIONS:
  --tenant-id <uuid>              (required)
  --invoice-id <uuid>             (required)
  --direction <issued|received>   (default: issued)

show-entry / requeue OPTIONS:
  --entry-id <uuid>               (required)

purge-retention OPTIONS:
  --tenant-id <uuid>              (required)
  --days <n>                      (required) Keep entries sent within the last n days

ENV:
  REGISTRY_MASTER_KEY             Required by commands touching certificates
"
    );
}

/// Options shared by every command
#[derive(Default)]
struct Options {
    database_url: Option<String>,
    tenant_id: Option<TenantId>,
    entry_id: Option<EntryId>,
    invoice_id: Option<InvoiceId>,
    direction: Option<InvoiceDirection>,
    mode: Option<SubmissionMode>,
    environment: Option<ServiceEnvironment>,
    enabled: Option<bool>,
    flow_control_secs: Option<u32>,
    max_batch: Option<u32>,
    auto_submit: Option<bool>,
    seal: Option<bool>,
    file: Option<String>,
    passphrase_env: Option<String>,
    days: Option<i64>,
}

/// Bundle bytes from `--file` and its passphrase from the named variable
async fn read_bundle(
    file: Option<String>,
    passphrase_env: Option<String>,
) -> anyhow::Result<(Vec<u8>, SecretString)> {
    let file = require(file, "--file")?;
    let var = passphrase_env.unwrap_or_else(|| "REGISTRY_CERT_PASSPHRASE".to_string());
    let passphrase = SecretString::from(
        std::env::var(&var).map_err(|_| anyhow::anyhow!("{var} is not set"))?,
    );
    let bundle = tokio::fs::read(&file).await?;
    Ok((bundle, passphrase))
}

fn value(args: &mut VecDeque<String>, flag: &str) -> anyhow::Result<String> {
    args.pop_front()
        .ok_or_else(|| anyhow::anyhow!("missing value for {flag}"))
}

fn parse_options(mut args: VecDeque<String>) -> anyhow::Result<Option<Options>> {
    let mut opts = Options::default();
    while let Some(arg) = args.pop_front() {
        match arg.as_str() {
            "--database-url" => opts.database_url = Some(value(&mut args, &arg)?),
            "--tenant-id" => {
                opts.tenant_id = Some(TenantId(Uuid::parse_str(&value(&mut args, &arg)?)?))
            }
            "--entry-id" => {
                opts.entry_id = Some(EntryId(Uuid::parse_str(&value(&mut args, &arg)?)?))
            }
            "--invoice-id" => {
                opts.invoice_id = Some(InvoiceId(Uuid::parse_str(&value(&mut args, &arg)?)?))
            }
            "--direction" => opts.direction = Some(value(&mut args, &arg)?.parse()?),
            "--mode" => opts.mode = Some(value(&mut args, &arg)?.parse()?),
            "--environment" => opts.environment = Some(value(&mut args, &arg)?.parse()?),
            "--enable" => opts.enabled = Some(true),
            "--disable" => opts.enabled = Some(false),
            "--flow-control-secs" => {
                opts.flow_control_secs = Some(value(&mut args, &arg)?.parse()?)
            }
            "--max-batch" => opts.max_batch = Some(value(&mut args, &arg)?.parse()?),
            "--auto-submit" => opts.auto_submit = Some(value(&mut args, &arg)?.parse()?),
            "--seal" => opts.seal = Some(value(&mut args, &arg)?.parse()?),
            "--file" => opts.file = Some(value(&mut args, &arg)?),
            "--passphrase-env" => opts.passphrase_env = Some(value(&mut args, &arg)?),
            "--days" => opts.days = Some(value(&mut args, &arg)?.parse()?),
            "-h" | "--help" => return Ok(None),
            other => anyhow::bail!("unexpected argument: {other}"),
        }
    }
    Ok(Some(opts))
}

fn require_database_url(database_url: Option<String>) -> anyhow::Result<String> {
    database_url
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required (or pass --database-url)"))
}

fn require<T>(value: Option<T>, flag: &str) -> anyhow::Result<T> {
    value.ok_or_else(|| anyhow::anyhow!("{flag} is required"))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Services wired against the configured database
struct Admin {
    store: Arc<PgRegistryStore>,
    registry: Arc<RegistryManager>,
}

impl Admin {
    async fn connect(database_url: Option<String>) -> anyhow::Result<Self> {
        let database_url = require_database_url(database_url)?;
        let pool = connect(&database_url, 5).await?;
        let store = Arc::new(PgRegistryStore::new(pool.clone()));
        let registry = Arc::new(RegistryManager::new(
            store.clone(),
            Arc::new(PgInvoiceSource::new(pool)),
            Arc::new(TracingNotifier),
            BackoffPolicy::from_env()?,
            QrConfig::from_env()?,
        ));
        Ok(Self { store, registry })
    }

    fn custody(&self) -> anyhow::Result<Arc<CustodyService>> {
        Ok(Arc::new(CustodyService::with_fs_vault(
            CustodyConfig::from_env()?,
            self.store.clone(),
        )))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args: VecDeque<String> = std::env::args().skip(1).collect();
    let Some(command) = args.pop_front() else {
        print_help();
        return Ok(());
    };

    if matches!(command.as_str(), "-h" | "--help" | "help") {
        print_help();
        return Ok(());
    }

    let Some(opts) = parse_options(args)? else {
        print_help();
        return Ok(());
    };

    match command.as_str() {
        "migrate" => {
            let database_url = require_database_url(opts.database_url)?;
            let pool = connect(&database_url, 5).await?;
            fiscal_registry::migrations::run_postgres(&pool).await?;
            println!("ok: migrations applied");
            Ok(())
        }
        "configure-tenant" => {
            let tenant_id = require(opts.tenant_id, "--tenant-id")?;
            let admin = Admin::connect(opts.database_url).await?;

            let mut config = match admin.store.get_config(tenant_id).await? {
                Some(existing) => existing,
                None => TenantComplianceConfig::new(
                    tenant_id,
                    opts.mode.unwrap_or(SubmissionMode::Verifiable),
                    opts.environment.unwrap_or(ServiceEnvironment::Test),
                ),
            };
            if let Some(enabled) = opts.enabled {
                config.enabled = enabled;
            }
            if let Some(secs) = opts.flow_control_secs {
                config.flow_control_seconds = secs;
            }
            if let Some(max) = opts.max_batch {
                config.max_records_per_batch = max;
            }
            if let Some(auto_submit) = opts.auto_submit {
                config.auto_submit = auto_submit;
            }
            if let Some(seal) = opts.seal {
                if seal && config.seal_credential.is_none() {
                    anyhow::bail!(
                        "tenant {tenant_id} has no seal certificate; run upload-seal-certificate first"
                    );
                }
                config.use_seal_credential = seal;
            }
            let mut config = config.normalize();
            config.updated_at = Utc::now();
            admin.store.upsert_config(&config).await?;

            println!(
                "ok: tenant {tenant_id} enabled={} mode={} environment={} flow_control={}s batch={}",
                config.enabled,
                config.mode,
                config.environment,
                config.flow_control_seconds,
                config.max_records_per_batch
            );
            Ok(())
        }
        "upload-certificate" => {
            let tenant_id = require(opts.tenant_id, "--tenant-id")?;
            let (bundle, passphrase) = read_bundle(opts.file, opts.passphrase_env).await?;
            let admin = Admin::connect(opts.database_url).await?;
            let info = admin
                .custody()?
                .store_certificate(tenant_id, &bundle, passphrase)
                .await?;
            print_json(&info)
        }
        "upload-seal-certificate" => {
            let tenant_id = require(opts.tenant_id, "--tenant-id")?;
            let (bundle, passphrase) = read_bundle(opts.file, opts.passphrase_env).await?;
            let admin = Admin::connect(opts.database_url).await?;
            let info = admin
                .custody()?
                .store_seal_certificate(tenant_id, &bundle, passphrase)
                .await?;
            print_json(&info)
        }
        "remove-seal-certificate" => {
            let tenant_id = require(opts.tenant_id, "--tenant-id")?;
            let admin = Admin::connect(opts.database_url).await?;
            admin.custody()?.remove_seal_certificate(tenant_id).await?;
            println!("ok: seal certificate removed for tenant {tenant_id}");
            Ok(())
        }
        "remove-certificate" => {
            let tenant_id = require(opts.tenant_id, "--tenant-id")?;
            let admin = Admin::connect(opts.database_url).await?;
            admin.custody()?.remove_certificate(tenant_id).await?;
            println!("ok: certificate removed for tenant {tenant_id}");
            Ok(())
        }
        "create-entry" => {
            let tenant_id = require(opts.tenant_id, "--tenant-id")?;
            let invoice_id = require(opts.invoice_id, "--invoice-id")?;
            let direction = opts.direction.unwrap_or(InvoiceDirection::Issued);
            let admin = Admin::connect(opts.database_url).await?;
            let entry = admin
                .registry
                .create_entry(invoice_id, direction, tenant_id)
                .await?;
            println!(
                "ok: entry {} sequence={} hash={}",
                entry.id, entry.sequence_number, entry.current_hash
            );
            Ok(())
        }
        "show-entry" => {
            let entry_id = require(opts.entry_id, "--entry-id")?;
            let admin = Admin::connect(opts.database_url).await?;
            let entry = admin.registry.get_entry(entry_id).await?;
            let events = admin.registry.entry_events(entry_id).await?;
            print_json(&serde_json::json!({ "entry": entry, "events": events }))
        }
        "requeue" => {
            let entry_id = require(opts.entry_id, "--entry-id")?;
            let admin = Admin::connect(opts.database_url).await?;
            let entry = admin.registry.requeue(entry_id).await?;
            println!(
                "ok: entry {} is {}",
                entry.id, entry.transmission_state
            );
            Ok(())
        }
        "verify-chain" => {
            let tenant_id = require(opts.tenant_id, "--tenant-id")?;
            let admin = Admin::connect(opts.database_url).await?;
            let report = admin.registry.verify_tenant_chain(tenant_id).await?;
            print_json(&report)?;
            if !report.valid {
                std::process::exit(2);
            }
            Ok(())
        }
        "tick" => {
            let admin = Admin::connect(opts.database_url).await?;
            let coordinator = ShutdownCoordinator::new();
            let worker = SubmissionWorker::new(
                WorkerConfig::from_env(),
                admin.registry.clone(),
                admin.custody()?,
                Arc::new(HttpTransport::new(TransportConfig::from_env()?)),
                &coordinator,
            );
            let report = worker.tick().await?;
            print_json(&report)
        }
        "check-certificates" => {
            let admin = Admin::connect(opts.database_url).await?;
            let coordinator = ShutdownCoordinator::new();
            let worker = SubmissionWorker::new(
                WorkerConfig::from_env(),
                admin.registry.clone(),
                admin.custody()?,
                Arc::new(HttpTransport::new(TransportConfig::from_env()?)),
                &coordinator,
            );
            let checks = worker.monitor().check_all(Utc::now()).await?;
            print_json(&checks)
        }
        "test-connectivity" => {
            let tenant_id = require(opts.tenant_id, "--tenant-id")?;
            let admin = Admin::connect(opts.database_url).await?;
            let config = admin.registry.tenant_config(tenant_id).await?;
            let identity = admin.custody()?.load_transport_identity(&config).await?;
            let transport = HttpTransport::new(TransportConfig::from_env()?);
            let report = transport.test_connectivity(&config, &identity).await?;
            print_json(&report)?;
            if !report.success {
                std::process::exit(2);
            }
            Ok(())
        }
        "purge-retention" => {
            let tenant_id = require(opts.tenant_id, "--tenant-id")?;
            let days = require(opts.days, "--days")?;
            if days <= 0 {
                anyhow::bail!("--days must be positive");
            }
            let admin = Admin::connect(opts.database_url).await?;
            let cutoff = Utc::now() - Duration::days(days);
            let purged = admin.registry.purge_sent_before(tenant_id, cutoff).await?;
            println!("ok: purged {purged} entries sent before {cutoff}");
            Ok(())
        }
        other => {
            print_help();
            anyhow::bail!("unknown command: {other}")
        }
    }
}
