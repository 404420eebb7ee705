//! Secure secret management.
//!
//! Wraps sensitive configuration values (provider API keys, `chrome_cdp`
//! bearer tokens) so they are zeroized from memory on drop and never show up
//! verbatim in `Debug`/`Display` output or logs.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A secure string that zeroizes its contents on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct SecretString {
    inner: String,
}

impl SecretString {
    pub fn new(value: String) -> Self {
        Self { inner: value }
    }

    /// Get a reference to the inner string.
    ///
    /// # Security warning
    /// Exposes the sensitive data — avoid logging or displaying the result.
    pub fn expose_secret(&self) -> &str {
        &self.inner
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString(***REDACTED***)")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "***REDACTED***")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_prints_secret() {
        let s = SecretString::new("sk-super-secret".to_string());
        let debug = format!("{s:?}");
        assert!(!debug.contains("sk-super-secret"));
        assert_eq!(s.expose_secret(), "sk-super-secret");
    }

    #[test]
    fn display_never_prints_secret() {
        let s = SecretString::new("sk-super-secret".to_string());
        assert_eq!(format!("{s}"), "***REDACTED***");
    }
}
