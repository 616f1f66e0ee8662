//! Fiscal Registry Library
//!
//! Tamper-evident registry of invoice compliance records. Every finalized
//! invoice gets a hash-chained entry per tenant; a background worker renders,
//! signs and submits the entries to the tax authority's web service under
//! per-tenant flow control.
//!
//! ## Modules
//!
//! - [`domain`] - Core domain types (entries, tenant configuration, events)
//! - [`crypto`] - Hash chain, passphrase custody, XML signatures
//! - [`custody`] - Certificate upload and signing-material access
//! - [`document`] - Compliance XML rendering, validation and QR payloads
//! - [`registry`] - Entry lifecycle and chain verification
//! - [`transport`] - Client for the remote compliance service
//! - [`worker`] - Scheduled submission and certificate monitoring
//! - [`infra`] - Storage implementations (PostgreSQL, in-memory), errors, retry
//! - [`metrics`] - Counters, gauges and latency histograms
//! - [`telemetry`] - Logging and OpenTelemetry integration
//! - [`server`] - Service bootstrap

pub mod crypto;
pub mod custody;
pub mod document;
pub mod domain;
pub mod infra;
pub mod metrics;
pub mod migrations;
pub mod registry;
pub mod server;
pub mod telemetry;
pub mod transport;
pub mod worker;

// Re-export commonly used types
pub use domain::{
    ComplianceEvent, ComplianceEventType, EntryId, Invoice, InvoiceDirection, InvoiceId,
    PartyIdentity, RegistryEntry, ServiceEnvironment, SubmissionMode, TenantComplianceConfig,
    TenantId, TransmissionState,
};

pub use infra::{InvoiceSource, RegistryError, RegistryStore, Result};
pub use registry::RegistryManager;
pub use worker::{spawn_worker, SubmissionWorker, WorkerConfig};
