//! certloop operator - keeps a serving TLS certificate Secret valid and current

#![deny(missing_docs)]

/// Certificate authority resolution and CA Secret generation
pub mod authority;
/// Command line configuration
pub mod config;
/// Certificate reconciliation
pub mod controller;
/// Controller construction and startup bootstrap
pub mod controller_runner;
/// Secret storage seam
pub mod store;

pub use certloop_common::{Error, Result};
