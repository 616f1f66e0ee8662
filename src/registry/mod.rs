//! Registry lifecycle
//!
//! [`RegistryManager`] is the only writer of registry entries: it creates them
//! when an invoice is finalized and records every transmission outcome the
//! submission worker reports back.

mod manager;

pub use manager::*;
