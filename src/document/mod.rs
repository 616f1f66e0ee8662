//! Compliance document generation
//!
//! Renders the submission XML for a registry entry, checks it for required
//! elements before it is signed, and derives the QR payload printed on
//! invoices.

mod qr;
mod render;
mod validate;

pub use qr::*;
pub use render::*;
pub use validate::*;

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("malformed XML: {0}")]
    Malformed(String),

    #[error("failed to write XML: {0}")]
    Write(String),
}
