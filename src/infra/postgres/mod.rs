//! PostgreSQL implementations for production registry storage

mod invoice_source;
mod registry_store;

pub use invoice_source::PgInvoiceSource;
pub use registry_store::*;
