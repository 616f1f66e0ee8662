//! Per-tenant compliance configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ServiceEnvironment, SubmissionMode, TenantId};

/// Minimum delay between two submissions for the same tenant
pub const MIN_FLOW_CONTROL_SECONDS: u32 = 60;

/// Default cap on entries drained per tenant per worker tick
pub const DEFAULT_MAX_RECORDS_PER_BATCH: u32 = 50;

/// Authenticated-encryption bundle for a certificate passphrase.
///
/// All components are base64 (standard alphabet). Never contains the
/// plaintext; see [`crate::crypto::PassphraseCipher`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPassphrase {
    pub ciphertext: String,
    pub iv: String,
    pub salt: String,
    pub auth_tag: String,
}

impl std::fmt::Debug for EncryptedPassphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedPassphrase")
            .field("salt", &self.salt)
            .finish_non_exhaustive()
    }
}

/// Certificate-bound transport identity ("seal" credential), kept apart
/// from the signing certificate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealCredential {
    /// Opaque vault locator of the seal bundle
    pub certificate_locator: String,
    pub encrypted_passphrase: EncryptedPassphrase,
    pub uploaded_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

/// One per tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantComplianceConfig {
    pub tenant_id: TenantId,
    pub enabled: bool,
    pub mode: SubmissionMode,
    pub environment: ServiceEnvironment,

    /// Opaque vault locator of the signing certificate bundle
    pub certificate_locator: Option<String>,
    pub encrypted_passphrase: Option<EncryptedPassphrase>,
    pub certificate_uploaded_at: Option<DateTime<Utc>>,
    pub certificate_valid_until: Option<DateTime<Utc>>,
    /// Submit through the seal endpoints, presenting `seal_credential` as
    /// the client identity
    pub use_seal_credential: bool,
    pub seal_credential: Option<SealCredential>,

    /// Never below [`MIN_FLOW_CONTROL_SECONDS`]
    pub flow_control_seconds: u32,
    pub max_records_per_batch: u32,
    pub auto_submit: bool,

    /// Highest sequence number issued for the tenant
    pub last_sequence_number: u64,
    /// Last time a document was handed to the remote service
    pub last_submission_at: Option<DateTime<Utc>>,

    pub updated_at: DateTime<Utc>,
}

impl TenantComplianceConfig {
    /// A disabled configuration with policy defaults
    pub fn new(tenant_id: TenantId, mode: SubmissionMode, environment: ServiceEnvironment) -> Self {
        Self {
            tenant_id,
            enabled: false,
            mode,
            environment,
            certificate_locator: None,
            encrypted_passphrase: None,
            certificate_uploaded_at: None,
            certificate_valid_until: None,
            use_seal_credential: false,
            seal_credential: None,
            flow_control_seconds: MIN_FLOW_CONTROL_SECONDS,
            max_records_per_batch: DEFAULT_MAX_RECORDS_PER_BATCH,
            auto_submit: true,
            last_sequence_number: 0,
            last_submission_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn enabled(mut self) -> Self {
        self.enabled = true;
        self
    }

    pub fn with_flow_control(mut self, seconds: u32) -> Self {
        self.flow_control_seconds = seconds;
        self.normalize()
    }

    pub fn with_max_records_per_batch(mut self, max: u32) -> Self {
        self.max_records_per_batch = max;
        self.normalize()
    }

    /// Clamp policy values into their allowed ranges
    pub fn normalize(mut self) -> Self {
        self.flow_control_seconds = self.flow_control_seconds.max(MIN_FLOW_CONTROL_SECONDS);
        self.max_records_per_batch = self.max_records_per_batch.max(1);
        self
    }

    pub fn flow_control(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(
            self.flow_control_seconds.max(MIN_FLOW_CONTROL_SECONDS),
        ))
    }

    pub fn has_certificate(&self) -> bool {
        self.certificate_locator.is_some() && self.encrypted_passphrase.is_some()
    }

    /// Whether the flow-control window since the last submission is still open
    pub fn is_throttled(&self, now: DateTime<Utc>) -> bool {
        self.last_submission_at
            .is_some_and(|last| now.signed_duration_since(last) < self.flow_control())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_control_is_clamped_to_policy_minimum() {
        let config = TenantComplianceConfig::new(
            TenantId::new(),
            SubmissionMode::Verifiable,
            ServiceEnvironment::Test,
        )
        .with_flow_control(5);
        assert_eq!(config.flow_control_seconds, MIN_FLOW_CONTROL_SECONDS);
    }

    #[test]
    fn test_throttled_only_inside_window() {
        let now = Utc::now();
        let mut config = TenantComplianceConfig::new(
            TenantId::new(),
            SubmissionMode::Verifiable,
            ServiceEnvironment::Test,
        );
        assert!(!config.is_throttled(now));

        config.last_submission_at = Some(now - chrono::Duration::seconds(30));
        assert!(config.is_throttled(now));

        config.last_submission_at = Some(now - chrono::Duration::seconds(61));
        assert!(!config.is_throttled(now));
    }
}
