//! Domain model for the fiscal registry
//!
//! - [`RegistryEntry`]: one hash-chained compliance record per invoice submission
//! - [`TenantComplianceConfig`]: per-tenant submission policy and certificate custody state
//! - [`ComplianceEvent`]: append-only audit trail
//! - [`Invoice`] / [`PartyIdentity`]: inputs from the invoicing collaborator

mod config;
mod event;
mod invoice;
mod registry;
mod types;

pub use config::*;
pub use event::*;
pub use invoice::*;
pub use registry::*;
pub use types::*;
