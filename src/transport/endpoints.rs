//! Remote service endpoint table and transport settings

use std::time::Duration;

use reqwest::Url;

use crate::domain::{ServiceEnvironment, SubmissionMode, TenantComplianceConfig};

use super::circuit_breaker::CircuitBreakerConfig;
use super::TransportError;

pub const DEFAULT_ENDPOINT_VERIFIABLE_TEST: &str =
    "https://prewww1.aeat.es/wlpl/TIKE-CONT/ws/SistemaFacturacion/VerifactuSOAP";
pub const DEFAULT_ENDPOINT_VERIFIABLE_TEST_SEAL: &str =
    "https://prewww10.aeat.es/wlpl/TIKE-CONT/ws/SistemaFacturacion/VerifactuSOAP";
pub const DEFAULT_ENDPOINT_VERIFIABLE_PRODUCTION: &str =
    "https://www1.agenciatributaria.gob.es/wlpl/TIKE-CONT/ws/SistemaFacturacion/VerifactuSOAP";
pub const DEFAULT_ENDPOINT_VERIFIABLE_PRODUCTION_SEAL: &str =
    "https://www10.agenciatributaria.gob.es/wlpl/TIKE-CONT/ws/SistemaFacturacion/VerifactuSOAP";
pub const DEFAULT_ENDPOINT_ON_DEMAND_TEST: &str =
    "https://prewww1.aeat.es/wlpl/TIKE-CONT/ws/SistemaFacturacion/RequerimientoSOAP";
pub const DEFAULT_ENDPOINT_ON_DEMAND_TEST_SEAL: &str =
    "https://prewww10.aeat.es/wlpl/TIKE-CONT/ws/SistemaFacturacion/RequerimientoSOAP";
pub const DEFAULT_ENDPOINT_ON_DEMAND_PRODUCTION: &str =
    "https://www1.agenciatributaria.gob.es/wlpl/TIKE-CONT/ws/SistemaFacturacion/RequerimientoSOAP";
pub const DEFAULT_ENDPOINT_ON_DEMAND_PRODUCTION_SEAL: &str =
    "https://www10.agenciatributaria.gob.es/wlpl/TIKE-CONT/ws/SistemaFacturacion/RequerimientoSOAP";

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Standard and seal-credential URL for one `(mode, environment)` pair
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointPair {
    pub standard: Url,
    pub seal: Url,
}

impl EndpointPair {
    fn parse(standard: &str, seal: &str) -> Result<Self, TransportError> {
        Ok(Self {
            standard: parse_endpoint("endpoint", standard)?,
            seal: parse_endpoint("seal endpoint", seal)?,
        })
    }
}

/// Endpoint table indexed by `(mode, environment)`
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointTable {
    pub verifiable_test: EndpointPair,
    pub verifiable_production: EndpointPair,
    pub on_demand_test: EndpointPair,
    pub on_demand_production: EndpointPair,
}

impl EndpointTable {
    /// Built-in authority endpoints
    pub fn new() -> Result<Self, TransportError> {
        Ok(Self {
            verifiable_test: EndpointPair::parse(
                DEFAULT_ENDPOINT_VERIFIABLE_TEST,
                DEFAULT_ENDPOINT_VERIFIABLE_TEST_SEAL,
            )?,
            verifiable_production: EndpointPair::parse(
                DEFAULT_ENDPOINT_VERIFIABLE_PRODUCTION,
                DEFAULT_ENDPOINT_VERIFIABLE_PRODUCTION_SEAL,
            )?,
            on_demand_test: EndpointPair::parse(
                DEFAULT_ENDPOINT_ON_DEMAND_TEST,
                DEFAULT_ENDPOINT_ON_DEMAND_TEST_SEAL,
            )?,
            on_demand_production: EndpointPair::parse(
                DEFAULT_ENDPOINT_ON_DEMAND_PRODUCTION,
                DEFAULT_ENDPOINT_ON_DEMAND_PRODUCTION_SEAL,
            )?,
        })
    }

    /// Every endpoint pointed at one base URL; for tests and local stubs
    pub fn uniform(url: Url) -> Self {
        let pair = EndpointPair {
            standard: url.clone(),
            seal: url,
        };
        Self {
            verifiable_test: pair.clone(),
            verifiable_production: pair.clone(),
            on_demand_test: pair.clone(),
            on_demand_production: pair,
        }
    }

    pub fn pair(&self, mode: SubmissionMode, environment: ServiceEnvironment) -> &EndpointPair {
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

    /// The endpoint a tenant submits to
    pub fn resolve(&self, config: &TenantComplianceConfig) -> &Url {
        let pair = self.pair(config.mode, config.environment);
        if config.use_seal_credential {
            &pair.seal
        } else {
            &pair.standard
        }
    }
}

/// Transport client settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub endpoints: EndpointTable,
    /// Deadline for one request, connection included
    pub timeout: Duration,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl TransportConfig {
    pub fn new() -> Result<Self, TransportError> {
        Ok(Self {
            endpoints: EndpointTable::new()?,
            timeout: DEFAULT_HTTP_TIMEOUT,
            circuit_breaker: CircuitBreakerConfig::default(),
        })
    }

    /// Defaults overridden by `REGISTRY_ENDPOINT_<MODE>_<ENV>[_SEAL]`,
    /// `REGISTRY_HTTP_TIMEOUT_SECS`, `REGISTRY_CIRCUIT_FAILURE_THRESHOLD` and
    /// `REGISTRY_CIRCUIT_OPEN_SECS`.
    pub fn from_env() -> Result<Self, TransportError> {
        let mut config = Self::new()?;

        let table = &mut config.endpoints;
        let overrides = [
            ("REGISTRY_ENDPOINT_VERIFIABLE_TEST", &mut table.verifiable_test.standard),
            ("REGISTRY_ENDPOINT_VERIFIABLE_TEST_SEAL", &mut table.verifiable_test.seal),
            ("REGISTRY_ENDPOINT_VERIFIABLE_PRODUCTION", &mut table.verifiable_production.standard),
            ("REGISTRY_ENDPOINT_VERIFIABLE_PRODUCTION_SEAL", &mut table.verifiable_production.seal),
            ("REGISTRY_ENDPOINT_ON_DEMAND_TEST", &mut table.on_demand_test.standard),
            ("REGISTRY_ENDPOINT_ON_DEMAND_TEST_SEAL", &mut table.on_demand_test.seal),
            ("REGISTRY_ENDPOINT_ON_DEMAND_PRODUCTION", &mut table.on_demand_production.standard),
            ("REGISTRY_ENDPOINT_ON_DEMAND_PRODUCTION_SEAL", &mut table.on_demand_production.seal),
        ];
        for (var, slot) in overrides {
            if let Ok(value) = std::env::var(var) {
                *slot = parse_endpoint(var, &value)?;
            }
        }

        if let Some(secs) = env_u64("REGISTRY_HTTP_TIMEOUT_SECS")? {
            config.timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(threshold) = env_u64("REGISTRY_CIRCUIT_FAILURE_THRESHOLD")? {
            config.circuit_breaker.failure_threshold = threshold.clamp(1, u64::from(u32::MAX)) as u32;
        }
        if let Some(secs) = env_u64("REGISTRY_CIRCUIT_OPEN_SECS")? {
            config.circuit_breaker.open_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

fn parse_endpoint(name: &str, value: &str) -> Result<Url, TransportError> {
    let url = Url::parse(value.trim())
        .map_err(|e| TransportError::Configuration(format!("invalid {name} URL {value:?}: {e}")))?;
    match url.scheme() {
        "https" | "http" => Ok(url),
        other => Err(TransportError::Configuration(format!(
            "{name} URL must be http(s), got {other}"
        ))),
    }
}

fn env_u64(var: &str) -> Result<Option<u64>, TransportError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| TransportError::Configuration(format!("invalid {var}: {e}"))),
        Err(_) => Ok(None),
    }
}
