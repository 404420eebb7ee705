//! SSRF guard for every navigation the browser tool performs (spec §4.7
//! "URL safety").
//!
//! Resolve-then-check, never check-then-resolve: the raw host is parsed as a
//! literal IP first, and if it isn't one, actually resolved via
//! `tokio::net::lookup_host` so redirect-to-loopback domains and decimal/hex/
//! octal IP encodings can't slip past a regex over the unresolved string.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use url::Url;

const BLOCKED_HOSTNAMES: &[&str] = &[
    "metadata.google.internal",
    "metadata.goog",
    "kubernetes.default.svc",
    "kubernetes.default",
    "metadata",
];

const CLOUD_METADATA_IP: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);

#[derive(Debug, thiserror::Error)]
pub enum UrlGuardError {
    #[error("URL blocked: {0}")]
    Malformed(String),

    #[error("URL blocked: scheme not allowed: {0:?}")]
    SchemeNotAllowed(String),

    #[error("URL blocked: cloud metadata hostname {0:?}")]
    HostnameBlocked(String),

    #[error("URL blocked: DNS resolution failed for {0:?}")]
    NoResolution(String),

    #[error("URL blocked: {1} address {0}")]
    AddressBlocked(IpAddr, &'static str),
}

/// Validates `raw_url` against the SSRF policy. Must be called immediately
/// before every navigation — never cache the result across requests, since
/// DNS can be re-pointed between calls.
pub async fn check_url(raw_url: &str) -> Result<Url, UrlGuardError> {
    let url = Url::parse(raw_url).map_err(|e| UrlGuardError::Malformed(e.to_string()))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(UrlGuardError::SchemeNotAllowed(url.scheme().to_string()));
    }

    let host = url
        .host_str()
        .ok_or_else(|| UrlGuardError::Malformed("empty hostname".to_string()))?
        .to_string();

    check_hostname_blocklist(&host)?;

    if let Ok(ip) = host.parse::<IpAddr>() {
        check_ip(ip)?;
        return Ok(url);
    }

    let port = url.port_or_known_default().unwrap_or(80);
    let addrs = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|_| UrlGuardError::NoResolution(host.clone()))?;

    let mut any = false;
    for addr in addrs {
        any = true;
        check_ip(addr.ip())?;
    }
    if !any {
        return Err(UrlGuardError::NoResolution(host));
    }

    Ok(url)
}

fn check_hostname_blocklist(host: &str) -> Result<(), UrlGuardError> {
    let lower = host.to_ascii_lowercase();
    for blocked in BLOCKED_HOSTNAMES {
        if lower == *blocked || lower.ends_with(&format!(".{blocked}")) {
            return Err(UrlGuardError::HostnameBlocked(host.to_string()));
        }
    }
    Ok(())
}

fn check_ip(ip: IpAddr) -> Result<(), UrlGuardError> {
    let ip = unwrap_mapped(ip);

    if ip.is_loopback() {
        return Err(UrlGuardError::AddressBlocked(ip, "loopback"));
    }
    if ip.is_unspecified() {
        return Err(UrlGuardError::AddressBlocked(ip, "unspecified"));
    }
    if ip.is_multicast() {
        return Err(UrlGuardError::AddressBlocked(ip, "multicast"));
    }

    match ip {
        IpAddr::V4(v4) => {
            if v4 == CLOUD_METADATA_IP {
                return Err(UrlGuardError::AddressBlocked(ip, "cloud metadata"));
            }
            if is_private_v4(v4) {
                return Err(UrlGuardError::AddressBlocked(ip, "private network"));
            }
            if v4.is_link_local() {
                return Err(UrlGuardError::AddressBlocked(ip, "link-local"));
            }
        }
        IpAddr::V6(v6) => {
            if is_unique_local_v6(v6) {
                return Err(UrlGuardError::AddressBlocked(ip, "private network"));
            }
            if is_link_local_v6(v6) {
                return Err(UrlGuardError::AddressBlocked(ip, "link-local"));
            }
        }
    }

    Ok(())
}

/// Unwraps an IPv4-mapped IPv6 address (`::ffff:a.b.c.d`) so the IPv4 checks
/// below can't be bypassed by the mapped form.
fn unwrap_mapped(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        other => other,
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_private()
}

/// fc00::/7
fn is_unique_local_v6(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

/// fe80::/10
fn is_link_local_v6(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("ftp://example.com")]
    #[case("file:///etc/passwd")]
    #[tokio::test]
    async fn disallowed_schemes_are_blocked(#[case] raw: &str) {
        let err = check_url(raw).await.unwrap_err();
        assert!(matches!(err, UrlGuardError::SchemeNotAllowed(_)));
    }

    #[tokio::test]
    async fn loopback_literal_is_blocked() {
        let err = check_url("http://127.0.0.1/").await.unwrap_err();
        assert!(matches!(err, UrlGuardError::AddressBlocked(_, "loopback")));
    }

    #[tokio::test]
    async fn loopback_shorthand_127_1_is_blocked() {
        let err = check_url("http://127.1/").await.unwrap_err();
        assert!(matches!(err, UrlGuardError::AddressBlocked(_, "loopback")));
    }

    #[tokio::test]
    async fn cloud_metadata_literal_is_blocked() {
        let err = check_url("http://169.254.169.254/latest/meta-data/").await.unwrap_err();
        assert!(matches!(err, UrlGuardError::AddressBlocked(_, "cloud metadata")));
    }

    #[tokio::test]
    async fn private_rfc1918_literal_is_blocked() {
        let err = check_url("http://10.0.0.5/").await.unwrap_err();
        assert!(matches!(err, UrlGuardError::AddressBlocked(_, "private network")));
    }

    #[tokio::test]
    async fn link_local_literal_is_blocked() {
        let err = check_url("http://169.254.1.1/").await.unwrap_err();
        assert!(matches!(err, UrlGuardError::AddressBlocked(_, "link-local")));
    }

    #[tokio::test]
    async fn metadata_hostname_and_subdomains_are_blocked() {
        assert!(check_url("http://metadata.google.internal/").await.is_err());
        assert!(check_url("http://evil.metadata.google.internal/").await.is_err());
        assert!(check_url("http://kubernetes.default.svc/").await.is_err());
    }

    #[tokio::test]
    async fn blocked_errors_begin_with_url_blocked_and_name_their_reason() {
        let err = check_url("http://metadata.google.internal/").await.unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("URL blocked:"));
        assert!(message.contains("cloud metadata hostname"));

        let err = check_url("http://169.254.169.254/").await.unwrap_err();
        assert!(err.to_string().starts_with("URL blocked:"));

        let err = check_url("ftp://example.com").await.unwrap_err();
        assert!(err.to_string().starts_with("URL blocked:"));
    }

    #[tokio::test]
    async fn ipv4_mapped_ipv6_loopback_is_caught() {
        let err = check_url("http://[::ffff:127.0.0.1]/").await.unwrap_err();
        assert!(matches!(err, UrlGuardError::AddressBlocked(_, "loopback")));
    }

    #[tokio::test]
    async fn public_https_url_is_allowed() {
        // No live DNS in CI-safe unit tests: use a literal public IP instead
        // of resolving a real hostname.
        let url = check_url("https://93.184.216.34/").await.unwrap();
        assert_eq!(url.scheme(), "https");
    }
}
