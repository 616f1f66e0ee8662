//! Cryptographic building blocks of the fiscal registry
//!
//! Provides:
//! - Registry hash chain (normalized fields, SHA-256, chain validation)
//! - Certificate passphrase encryption at rest (PBKDF2 + AES-256-GCM)
//! - Deterministic XML canonical form
//! - Enveloped XML signatures with full verification

pub mod canonical;
mod chain;
mod custody;
pub mod signature;

pub use chain::*;
pub use custody::*;
pub use signature::{
    sign, validate_signature, CertificateInfo, SignatureError, SignatureValidation,
    SigningMaterial,
};
