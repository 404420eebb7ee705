//! Recognized `[browser]` configuration options (spec §4.7).

use crate::config::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DevicePreset {
    Clear,
    Laptop,
    IphoneX,
}

impl DevicePreset {
    /// Unknown friendly names fall back to `Clear` rather than erroring —
    /// device emulation is cosmetic, never load-bearing.
    pub fn from_friendly_name(name: &str) -> Self {
        match name {
            "laptop" => DevicePreset::Laptop,
            "iphone-x" => DevicePreset::IphoneX,
            _ => DevicePreset::Clear,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BubblewrapConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bwrap_path")]
    pub bwrap_path: String,
    #[serde(default)]
    pub gpu: bool,
    #[serde(default)]
    pub extra_ro_bind: Vec<PathBuf>,
    #[serde(default)]
    pub extra_bind: Vec<PathBuf>,
}

fn default_bwrap_path() -> String {
    "bwrap".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    #[serde(default = "default_browser_dir")]
    pub dir: PathBuf,
    #[serde(default)]
    pub auto_download: bool,
    #[serde(default)]
    pub revision: String,
    #[serde(default = "default_true")]
    pub headless: bool,
    #[serde(default)]
    pub no_sandbox: bool,
    #[serde(default = "default_profile_name")]
    pub default_profile: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub stealth: bool,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default)]
    pub profile_domains: HashMap<String, String>,
    /// CDP endpoint for attaching to the user's own running browser instead
    /// of launching one. Wrapped since it may carry an auth token.
    #[serde(default)]
    pub chrome_cdp: Option<SecretString>,
    #[serde(default)]
    pub allow_agent_profiles: bool,
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    #[serde(default)]
    pub bubblewrap: BubblewrapConfig,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            dir: default_browser_dir(),
            auto_download: false,
            revision: String::new(),
            headless: true,
            no_sandbox: false,
            default_profile: default_profile_name(),
            timeout_secs: default_timeout_secs(),
            stealth: false,
            device: default_device(),
            profile_domains: HashMap::new(),
            chrome_cdp: None,
            allow_agent_profiles: false,
            workspace: None,
            bubblewrap: BubblewrapConfig::default(),
        }
    }
}

impl BrowserConfig {
    pub fn device_preset(&self) -> DevicePreset {
        DevicePreset::from_friendly_name(&self.device)
    }

    /// Picks a profile for `domain` using exact match, then `*.suffix`, then
    /// the catch-all `*` entry, in that precedence order.
    pub fn profile_for_domain(&self, domain: &str) -> Option<&str> {
        if let Some(profile) = self.profile_domains.get(domain) {
            return Some(profile.as_str());
        }
        let mut best: Option<(&str, usize)> = None;
        for (pattern, profile) in &self.profile_domains {
            if let Some(suffix) = pattern.strip_prefix("*.")
                && (domain == suffix || domain.ends_with(&format!(".{suffix}")))
                && best.map(|(_, len)| suffix.len() > len).unwrap_or(true)
            {
                best = Some((profile.as_str(), suffix.len()));
            }
        }
        if let Some((profile, _)) = best {
            return Some(profile);
        }
        self.profile_domains.get("*").map(|s| s.as_str())
    }
}

fn default_browser_dir() -> PathBuf {
    crate::config::clawcore_home().join("browser")
}

fn default_profile_name() -> String {
    "default".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_device() -> String {
    "clear".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_device_name_falls_back_to_clear() {
        assert_eq!(DevicePreset::from_friendly_name("pixel-7"), DevicePreset::Clear);
        assert_eq!(DevicePreset::from_friendly_name("iphone-x"), DevicePreset::IphoneX);
    }

    #[test]
    fn profile_domain_precedence_exact_then_wildcard_then_star() {
        let mut config = BrowserConfig::default();
        config.profile_domains.insert("docs.example.com".to_string(), "docs-profile".to_string());
        config.profile_domains.insert("*.example.com".to_string(), "example-profile".to_string());
        config.profile_domains.insert("*".to_string(), "default-profile".to_string());

        assert_eq!(config.profile_for_domain("docs.example.com"), Some("docs-profile"));
        assert_eq!(config.profile_for_domain("api.example.com"), Some("example-profile"));
        assert_eq!(config.profile_for_domain("other.org"), Some("default-profile"));
    }
}
