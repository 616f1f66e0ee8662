//! Infrastructure layer for the fiscal registry
//!
//! Contains trait definitions and implementations for:
//! - Registry storage (PostgreSQL, in-memory)
//! - Error taxonomy shared by every component
//! - Scheduled submission backoff and in-process retry
//! - Compliance notifications
//! - Graceful shutdown (in-flight submission draining)

mod error;
mod graceful_shutdown;
mod memory;
mod notifier;
pub mod postgres;
mod retry;
mod traits;

pub use error::*;
pub use graceful_shutdown::{
    shutdown_signal, InFlightGuard, InFlightTracker, ShutdownCoordinator, ShutdownSignal,
};
pub use memory::{InMemoryInvoiceSource, InMemoryRegistryStore};
pub use notifier::{CollectingNotifier, ComplianceNotification, TracingNotifier};
pub use postgres::{PgInvoiceSource, PgRegistryStore};
pub use retry::{is_retryable_db_error, BackoffPolicy, Retry, RetryConfig, RetryResult};
pub use traits::*;
