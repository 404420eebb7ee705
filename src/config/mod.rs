//! Configuration module.
//!
//! Handles layered configuration loading (defaults → system file → local
//! file → env) and secure secret storage.

pub mod secrets;
mod types;

pub use secrets::SecretString;
pub use types::*;
