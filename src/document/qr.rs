//! QR payload and verification URL printed on rendered invoices.

use chrono::NaiveDate;
use reqwest::Url;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::crypto::{normalize_amount, normalize_tax_id};
use crate::domain::{ServiceEnvironment, SubmissionMode};
use crate::infra::{RegistryError, Result};

pub const DEFAULT_QR_BASE_VERIFIABLE_TEST: &str =
    "https://prewww2.aeat.es/wlpl/TIKE-CONT/ValidarQR";
pub const DEFAULT_QR_BASE_VERIFIABLE_PRODUCTION: &str =
    "https://www2.agenciatributaria.gob.es/wlpl/TIKE-CONT/ValidarQR";
pub const DEFAULT_QR_BASE_ON_DEMAND_TEST: &str =
    "https://prewww2.aeat.es/wlpl/TIKE-CONT/ValidarQRNoVerifactu";
pub const DEFAULT_QR_BASE_ON_DEMAND_PRODUCTION: &str =
    "https://www2.agenciatributaria.gob.es/wlpl/TIKE-CONT/ValidarQRNoVerifactu";

/// Number of leading hash characters embedded in the QR
pub const QR_HASH_PREFIX_LEN: usize = 8;

/// Derived, non-authoritative QR data; safe to regenerate at any time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrCode {
    pub payload: String,
    pub url: String,
}

impl QrCode {
    pub fn build(
        base_url: &Url,
        issuer_tax_id: &str,
        document_number: &str,
        issue_date: NaiveDate,
        total_amount: Decimal,
        current_hash: &str,
    ) -> Self {
        let tax_id = normalize_tax_id(issuer_tax_id);
        let number = document_number.trim();
        let date = issue_date.format("%d-%m-%Y").to_string();
        let amount = normalize_amount(total_amount);
        let hash: String = current_hash.chars().take(QR_HASH_PREFIX_LEN).collect();

        let payload = format!("{tax_id}|{number}|{date}|{amount}|{hash}");

        let mut url = base_url.clone();
        url.query_pairs_mut()
            .append_pair("nif", &tax_id)
            .append_pair("numserie", number)
            .append_pair("fecha", &date)
            .append_pair("importe", &amount)
            .append_pair("huella", &hash);

        Self {
            payload,
            url: url.to_string(),
        }
    }
}

/// QR verification base URLs per `(mode, environment)`
#[derive(Debug, Clone)]
pub struct QrConfig {
    pub verifiable_test: Url,
    pub verifiable_production: Url,
    pub on_demand_test: Url,
    pub on_demand_production: Url,
}

impl QrConfig {
    /// Built-in authority URLs
    pub fn new() -> Result<Self> {
        Ok(Self {
            verifiable_test: parse_url("QR base", DEFAULT_QR_BASE_VERIFIABLE_TEST)?,
            verifiable_production: parse_url("QR base", DEFAULT_QR_BASE_VERIFIABLE_PRODUCTION)?,
            on_demand_test: parse_url("QR base", DEFAULT_QR_BASE_ON_DEMAND_TEST)?,
            on_demand_production: parse_url("QR base", DEFAULT_QR_BASE_ON_DEMAND_PRODUCTION)?,
        })
    }

    /// Built-in URLs overridden by `REGISTRY_QR_BASE_<MODE>_<ENV>`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new()?;
        let overrides = [
            ("REGISTRY_QR_BASE_VERIFIABLE_TEST", &mut config.verifiable_test),
            ("REGISTRY_QR_BASE_VERIFIABLE_PRODUCTION", &mut config.verifiable_production),
            ("REGISTRY_QR_BASE_ON_DEMAND_TEST", &mut config.on_demand_test),
            ("REGISTRY_QR_BASE_ON_DEMAND_PRODUCTION", &mut config.on_demand_production),
        ];
        for (var, slot) in overrides {
            if let Ok(value) = std::env::var(var) {
                *slot = parse_url(var, &value)?;
            }
        }
        Ok(config)
    }

    pub fn base_url(&self, mode: SubmissionMode, environment: ServiceEnvironment) -> &Url {
        match (mode, environment) {
            (SubmissionMode::Verifiable, ServiceEnvironment::Test) => &self.verifiable_test,
            (SubmissionMode::Verifiable, ServiceEnvironment::Production) => {
                &self.verifiable_production
            }
            (SubmissionMode::OnDemand, ServiceEnvironment::Test) => &self.on_demand_test,
            (SubmissionMode::OnDemand, ServiceEnvironment::Production) => {
                &self.on_demand_production
            }
        }
    }
}

pub(crate) fn parse_url(name: &str, value: &str) -> Result<Url> {
    Url::parse(value.trim())
        .map_err(|e| RegistryError::Configuration(format!("invalid {name} URL {value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_payload_and_url_carry_hash_prefix() {
        let config = QrConfig::new().unwrap();
        let qr = QrCode::build(
            config.base_url(SubmissionMode::Verifiable, ServiceEnvironment::Test),
            "b-12345678",
            "2024/A 7",
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            dec!(121.5),
            "0123456789ABCDEF",
        );

        assert_eq!(qr.payload, "B12345678|2024/A 7|15-03-2024|121.50|01234567");
        assert!(qr.url.starts_with(DEFAULT_QR_BASE_VERIFIABLE_TEST));
        assert!(qr.url.contains("numserie=2024%2FA+7"));
        assert!(qr.url.contains("huella=01234567"));
    }

    #[test]
    fn test_mode_selects_base_url() {
        let config = QrConfig::new().unwrap();
        assert_eq!(
            config
                .base_url(SubmissionMode::OnDemand, ServiceEnvironment::Production)
                .as_str(),
            DEFAULT_QR_BASE_ON_DEMAND_PRODUCTION
        );
    }
}
