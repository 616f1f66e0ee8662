//! Certificate custody
//!
//! Owns the lifecycle of each tenant's signing certificate and of the
//! optional seal credential used as transport identity: upload (with
//! rotation of the previous bundle), loading the material for the worker,
//! and expiry checks. A passphrase only ever exists in clear inside a
//! [`SecretString`] for the duration of a call.

mod vault;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::crypto::{
    CertificateInfo, MasterKey, PassphraseCipher, SigningMaterial, DEFAULT_KDF_ITERATIONS,
    MIN_KDF_ITERATIONS,
};
use crate::domain::{SealCredential, TenantComplianceConfig, TenantId};
use crate::infra::{RegistryError, RegistryStore, Result};

pub use vault::{CertificateVault, FsCertificateVault, InMemoryCertificateVault};

/// Days before expiry at which a certificate counts as expiring soon
pub const DEFAULT_EXPIRY_WARNING_DAYS: i64 = 30;

/// Custody settings; see [`CustodyConfig::from_env`]
#[derive(Debug)]
pub struct CustodyConfig {
    pub master_key: MasterKey,
    pub kdf_iterations: u32,
    pub certificate_dir: PathBuf,
    pub expiry_warning_days: i64,
}

impl CustodyConfig {
    pub fn new(master_key: MasterKey, certificate_dir: impl Into<PathBuf>) -> Self {
        Self {
            master_key,
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            certificate_dir: certificate_dir.into(),
            expiry_warning_days: DEFAULT_EXPIRY_WARNING_DAYS,
        }
    }

    /// Read `REGISTRY_MASTER_KEY` (required), `REGISTRY_KDF_ITERATIONS`,
    /// `REGISTRY_CERTIFICATE_DIR` and `REGISTRY_CERT_EXPIRY_WARNING_DAYS`.
    ///
    /// A missing master key is a configuration error; there is no fallback.
    pub fn from_env() -> Result<Self> {
        let master_key = match std::env::var("REGISTRY_MASTER_KEY") {
            Ok(value) if !value.trim().is_empty() => MasterKey::parse(&value)?,
            _ => {
                return Err(RegistryError::Configuration(
                    "REGISTRY_MASTER_KEY is not set".to_string(),
                ))
            }
        };

        let kdf_iterations = match std::env::var("REGISTRY_KDF_ITERATIONS") {
            Ok(value) => {
                let iterations: u32 = value.trim().parse().map_err(|e| {
                    RegistryError::Configuration(format!("invalid REGISTRY_KDF_ITERATIONS: {e}"))
                })?;
                if iterations < MIN_KDF_ITERATIONS {
                    return Err(RegistryError::Configuration(format!(
                        "REGISTRY_KDF_ITERATIONS must be at least {MIN_KDF_ITERATIONS}"
                    )));
                }
                iterations
            }
            Err(_) => DEFAULT_KDF_ITERATIONS,
        };

        let certificate_dir = std::env::var("REGISTRY_CERTIFICATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./certificates"));

        let expiry_warning_days = match std::env::var("REGISTRY_CERT_EXPIRY_WARNING_DAYS") {
            Ok(value) => value.trim().parse().map_err(|e| {
                RegistryError::Configuration(format!(
                    "invalid REGISTRY_CERT_EXPIRY_WARNING_DAYS: {e}"
                ))
            })?,
            Err(_) => DEFAULT_EXPIRY_WARNING_DAYS,
        };

        Ok(Self {
            master_key,
            kdf_iterations,
            certificate_dir,
            expiry_warning_days,
        })
    }
}

/// Result of an expiry check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationStatus {
    pub expired: bool,
    pub expiring_soon: bool,
    /// Whole days until `valid_until`; negative once expired
    pub days_remaining: i64,
    pub valid_until: DateTime<Utc>,
}

impl ExpirationStatus {
    pub fn evaluate(valid_until: DateTime<Utc>, now: DateTime<Utc>, warning_days: i64) -> Self {
        let remaining = valid_until.signed_duration_since(now);
        let expired = remaining <= chrono::Duration::zero();
        Self {
            expired,
            expiring_soon: !expired && remaining < chrono::Duration::days(warning_days),
            days_remaining: remaining.num_days(),
            valid_until,
        }
    }
}

/// Certificate custody for all tenants
pub struct CustodyService {
    cipher: PassphraseCipher,
    vault: Arc<dyn CertificateVault>,
    store: Arc<dyn RegistryStore>,
    expiry_warning_days: i64,
}

impl CustodyService {
    pub fn new(
        config: CustodyConfig,
        vault: Arc<dyn CertificateVault>,
        store: Arc<dyn RegistryStore>,
    ) -> Self {
        Self {
            cipher: PassphraseCipher::new(config.master_key, config.kdf_iterations),
            vault,
            store,
            expiry_warning_days: config.expiry_warning_days,
        }
    }

    /// Filesystem vault under `config.certificate_dir`
    pub fn with_fs_vault(config: CustodyConfig, store: Arc<dyn RegistryStore>) -> Self {
        let vault = Arc::new(FsCertificateVault::new(config.certificate_dir.clone()));
        Self::new(config, vault, store)
    }

    pub fn expiry_warning_days(&self) -> i64 {
        self.expiry_warning_days
    }

    async fn require_config(&self, tenant_id: TenantId) -> Result<TenantComplianceConfig> {
        self.store
            .get_config(tenant_id)
            .await?
            .ok_or_else(|| RegistryError::not_found("tenant compliance config", tenant_id))
    }

    /// Open `bundle` and make sure it is usable at `now`
    fn check_bundle(
        bundle: &[u8],
        passphrase: &SecretString,
        now: DateTime<Utc>,
    ) -> Result<CertificateInfo> {
        let material = SigningMaterial::from_bundle(bundle, passphrase)?;
        let info = material.certificate_info(now)?;
        if info.not_after <= now {
            return Err(RegistryError::InvalidCertificate(format!(
                "certificate expired at {}",
                info.not_after
            )));
        }
        Ok(info)
    }

    /// Persist `config` now pointing at `locator`, then drop the bundle it
    /// replaced. If the write fails the new bundle is removed instead.
    async fn commit_bundle(
        &self,
        config: &TenantComplianceConfig,
        locator: &str,
        previous: Option<String>,
    ) -> Result<()> {
        if let Err(e) = self.store.upsert_config(config).await {
            if let Err(cleanup) = self.vault.delete(locator).await {
                tracing::error!(error = %cleanup, "Failed to remove orphaned certificate bundle");
            }
            return Err(e);
        }

        if let Some(previous) = previous.filter(|p| p != locator) {
            if let Err(e) = self.vault.delete(&previous).await {
                tracing::error!(error = %e, "Failed to delete previous certificate bundle");
            }
        }
        Ok(())
    }

    /// Validate and store a new certificate bundle for a tenant.
    ///
    /// The bundle must open with `passphrase` and must not be expired. On
    /// success the tenant row points at the new bundle and the previous
    /// bundle is deleted; on failure nothing of the new bundle is left behind.
    #[instrument(skip(self, bundle, passphrase), fields(tenant_id = %tenant_id))]
    pub async fn store_certificate(
        &self,
        tenant_id: TenantId,
        bundle: &[u8],
        passphrase: SecretString,
    ) -> Result<CertificateInfo> {
        let now = Utc::now();
        let info = Self::check_bundle(bundle, &passphrase, now)?;

        let mut config = self.require_config(tenant_id).await?;
        let encrypted = self.cipher.encrypt(&passphrase, tenant_id)?;

        let locator = self.vault.put(tenant_id, bundle).await?;
        let previous = config.certificate_locator.replace(locator.clone());
        config.encrypted_passphrase = Some(encrypted);
        config.certificate_uploaded_at = Some(now);
        config.certificate_valid_until = Some(info.not_after);
        self.commit_bundle(&config, &locator, previous).await?;

        tracing::info!(
            subject = %info.subject,
            valid_until = %info.not_after,
            "Signing certificate stored"
        );
        Ok(info)
    }

    /// Validate and store the tenant's seal credential, replacing any
    /// previous one. Same checks and rotation as [`Self::store_certificate`].
    #[instrument(skip(self, bundle, passphrase), fields(tenant_id = %tenant_id))]
    pub async fn store_seal_certificate(
        &self,
        tenant_id: TenantId,
        bundle: &[u8],
        passphrase: SecretString,
    ) -> Result<CertificateInfo> {
        let now = Utc::now();
        let info = Self::check_bundle(bundle, &passphrase, now)?;

        let mut config = self.require_config(tenant_id).await?;
        let encrypted = self.cipher.encrypt(&passphrase, tenant_id)?;

        let locator = self.vault.put(tenant_id, bundle).await?;
        let previous = config
            .seal_credential
            .replace(SealCredential {
                certificate_locator: locator.clone(),
                encrypted_passphrase: encrypted,
                uploaded_at: now,
                valid_until: info.not_after,
            })
            .map(|seal| seal.certificate_locator);
        self.commit_bundle(&config, &locator, previous).await?;

        tracing::info!(
            subject = %info.subject,
            valid_until = %info.not_after,
            "Seal certificate stored"
        );
        Ok(info)
    }

    /// Drop a tenant's seal credential. Seal mode is switched off with it.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn remove_seal_certificate(&self, tenant_id: TenantId) -> Result<()> {
        let mut config = self.require_config(tenant_id).await?;
        let previous = config.seal_credential.take();
        config.use_seal_credential = false;
        self.store.upsert_config(&config).await?;

        if let Some(previous) = previous {
            self.vault.delete(&previous.certificate_locator).await?;
        }
        Ok(())
    }

    /// Drop a tenant's certificate and passphrase bundle
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn remove_certificate(&self, tenant_id: TenantId) -> Result<()> {
        let mut config = self.require_config(tenant_id).await?;
        let previous = config.certificate_locator.take();
        config.encrypted_passphrase = None;
        config.certificate_uploaded_at = None;
        config.certificate_valid_until = None;
        self.store.upsert_config(&config).await?;

        if let Some(previous) = previous {
            self.vault.delete(&previous).await?;
        }
        Ok(())
    }

    /// Decrypt the passphrase and open the tenant's bundle
    #[instrument(skip(self, config), fields(tenant_id = %config.tenant_id))]
    pub async fn load_signing_material(
        &self,
        config: &TenantComplianceConfig,
    ) -> Result<SigningMaterial> {
        let (Some(locator), Some(encrypted)) = (
            config.certificate_locator.as_deref(),
            config.encrypted_passphrase.as_ref(),
        ) else {
            return Err(RegistryError::Configuration(format!(
                "tenant {} has no signing certificate",
                config.tenant_id
            )));
        };

        let passphrase = self.cipher.decrypt(encrypted, config.tenant_id)?;
        let bundle = self.vault.get(locator).await?;
        Ok(SigningMaterial::from_bundle(&bundle, &passphrase)?)
    }

    /// Decrypt the seal passphrase and open the seal bundle
    #[instrument(skip(self, config), fields(tenant_id = %config.tenant_id))]
    pub async fn load_seal_material(
        &self,
        config: &TenantComplianceConfig,
    ) -> Result<SigningMaterial> {
        let Some(seal) = config.seal_credential.as_ref() else {
            return Err(RegistryError::Configuration(format!(
                "tenant {} submits with the seal credential but has no seal certificate",
                config.tenant_id
            )));
        };

        let passphrase = self
            .cipher
            .decrypt(&seal.encrypted_passphrase, config.tenant_id)?;
        let bundle = self.vault.get(&seal.certificate_locator).await?;
        Ok(SigningMaterial::from_bundle(&bundle, &passphrase)?)
    }

    /// The client identity presented to the remote service: the seal
    /// credential in seal mode, the signing certificate otherwise
    pub async fn load_transport_identity(
        &self,
        config: &TenantComplianceConfig,
    ) -> Result<SigningMaterial> {
        if config.use_seal_credential {
            self.load_seal_material(config).await
        } else {
            self.load_signing_material(config).await
        }
    }

    /// Expiry state of the tenant's certificate at `now`
    pub async fn check_expiration(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> Result<ExpirationStatus> {
        let config = self.require_config(tenant_id).await?;
        let valid_until = config.certificate_valid_until.ok_or_else(|| {
            RegistryError::Configuration(format!("tenant {tenant_id} has no signing certificate"))
        })?;
        Ok(ExpirationStatus::evaluate(
            valid_until,
            now,
            self.expiry_warning_days,
        ))
    }
}
