//! Storage of certificate bundles

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::Mutex;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::domain::TenantId;
use crate::infra::{RegistryError, Result};

/// Opaque store of certificate bundles.
///
/// Locators are produced by the vault and only meaningful to it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertificateVault: Send + Sync {
    /// Store a new bundle; never overwrites an existing one
    async fn put(&self, tenant_id: TenantId, bundle: &[u8]) -> Result<String>;

    async fn get(&self, locator: &str) -> Result<Zeroizing<Vec<u8>>>;

    /// Remove a bundle. Removing a missing bundle is not an error.
    async fn delete(&self, locator: &str) -> Result<()>;
}

// ============================================================================
// Filesystem vault
// ============================================================================

/// Bundles as `<root>/<tenant_id>/<uuid>.p12`, owner-readable only
#[derive(Debug, Clone)]
pub struct FsCertificateVault {
    root: PathBuf,
}

impl FsCertificateVault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a locator, refusing anything that would escape the root
    fn path_for(&self, locator: &str) -> Result<PathBuf> {
        let mut parts = locator.split('/');
        let (Some(tenant), Some(file), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(RegistryError::Integrity(format!(
                "malformed certificate locator {locator:?}"
            )));
        };
        let valid_tenant = Uuid::parse_str(tenant).is_ok();
        let valid_file = file
            .strip_suffix(".p12")
            .is_some_and(|stem| Uuid::parse_str(stem).is_ok());
        if !valid_tenant || !valid_file {
            return Err(RegistryError::Integrity(format!(
                "malformed certificate locator {locator:?}"
            )));
        }
        Ok(self.root.join(tenant).join(file))
    }
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> RegistryError {
    RegistryError::Internal(format!("failed to {action} {}: {e}", path.display()))
}

#[async_trait]
impl CertificateVault for FsCertificateVault {
    async fn put(&self, tenant_id: TenantId, bundle: &[u8]) -> Result<String> {
        let locator = format!("{tenant_id}/{}.p12", Uuid::new_v4());
        let path = self.path_for(&locator)?;

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| io_error("create", dir, e))?;
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options
            .open(&path)
            .await
            .map_err(|e| io_error("create", &path, e))?;
        tokio::io::AsyncWriteExt::write_all(&mut file, bundle)
            .await
            .map_err(|e| io_error("write", &path, e))?;
        file.sync_all()
            .await
            .map_err(|e| io_error("sync", &path, e))?;

        Ok(locator)
    }

    async fn get(&self, locator: &str) -> Result<Zeroizing<Vec<u8>>> {
        let path = self.path_for(locator)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Zeroizing::new(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RegistryError::not_found("certificate bundle", locator))
            }
            Err(e) => Err(io_error("read", &path, e)),
        }
    }

    async fn delete(&self, locator: &str) -> Result<()> {
        let path = self.path_for(locator)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("delete", &path, e)),
        }
    }
}

// ============================================================================
// In-memory vault
// ============================================================================

/// Vault held in process memory; for tests and embedding
#[derive(Default)]
pub struct InMemoryCertificateVault {
    bundles: Mutex<HashMap<String, Zeroizing<Vec<u8>>>>,
}

impl InMemoryCertificateVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.bundles.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bundles.lock().await.is_empty()
    }
}

#[async_trait]
impl CertificateVault for InMemoryCertificateVault {
    async fn put(&self, tenant_id: TenantId, bundle: &[u8]) -> Result<String> {
        let locator = format!("{tenant_id}/{}.p12", Uuid::new_v4());
        self.bundles
            .lock()
            .await
            .insert(locator.clone(), Zeroizing::new(bundle.to_vec()));
        Ok(locator)
    }

    async fn get(&self, locator: &str) -> Result<Zeroizing<Vec<u8>>> {
        self.bundles
            .lock()
            .await
            .get(locator)
            .cloned()
            .ok_or_else(|| RegistryError::not_found("certificate bundle", locator))
    }

    async fn delete(&self, locator: &str) -> Result<()> {
        self.bundles.lock().await.remove(locator);
        Ok(())
    }
}
