//! Shared outbound-URL hardening.
//!
//! The XMLTV fetcher, the M3U parser, and the Upstream Probe all accept
//! operator-supplied URLs that this process then fetches itself, so all three
//! share the same SSRF guard rather than re-deriving it.

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct SsrfError(pub String);

/// Validate a URL before this process fetches it.
///
/// Blocks non-HTTP(S) schemes, localhost, and private/link-local IP ranges.
/// In test mode (`IPTV_TEST_MODE=1`) localhost is allowed so integration
/// tests can point at a local mock server.
pub fn validate_url_for_ssrf(url_str: &str) -> Result<(), SsrfError> {
    let test_mode = std::env::var("IPTV_TEST_MODE").unwrap_or_default() == "1";
    let parsed = url::Url::parse(url_str).map_err(|e| SsrfError(format!("Invalid URL: {}", e)))?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(SsrfError(format!(
            "URL scheme '{}' is not allowed. Use http or https.",
            parsed.scheme()
        )));
    }

    if let Some(host) = parsed.host_str() {
        let host_lower = host.to_lowercase();

        if !test_mode
            && (host_lower == "localhost"
                || host_lower == "127.0.0.1"
                || host_lower.starts_with("127.")
                || host_lower == "::1"
                || host_lower == "0.0.0.0")
        {
            return Err(SsrfError("Localhost URLs are not allowed".into()));
        }

        if host_lower.starts_with("10.")
            || host_lower.starts_with("192.168.")
            || is_172_private(&host_lower)
            || host_lower.starts_with("169.254.")
        {
            return Err(SsrfError("Private IP addresses are not allowed".into()));
        }
    }

    Ok(())
}

fn is_172_private(host: &str) -> bool {
    if !host.starts_with("172.") {
        return false;
    }
    let parts: Vec<&str> = host.split('.').collect();
    if parts.len() < 2 {
        return false;
    }
    if let Ok(second_octet) = parts[1].parse::<u8>() {
        return (16..=31).contains(&second_octet);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_http_https_urls_pass() {
        assert!(validate_url_for_ssrf("https://example.com/playlist.m3u").is_ok());
        assert!(validate_url_for_ssrf("http://example.com/epg.xml").is_ok());
    }

    #[test]
    fn localhost_variants_blocked() {
        assert!(validate_url_for_ssrf("http://localhost/x").is_err());
        assert!(validate_url_for_ssrf("http://127.0.0.1/x").is_err());
        assert!(validate_url_for_ssrf("http://0.0.0.0/x").is_err());
    }

    #[test]
    fn private_ip_ranges_blocked() {
        assert!(validate_url_for_ssrf("http://10.0.0.1/x").is_err());
        assert!(validate_url_for_ssrf("http://192.168.1.1/x").is_err());
        assert!(validate_url_for_ssrf("http://172.16.0.1/x").is_err());
        assert!(validate_url_for_ssrf("http://172.31.255.255/x").is_err());
        assert!(validate_url_for_ssrf("http://169.254.1.1/x").is_err());
    }

    #[test]
    fn public_172_range_allowed() {
        assert!(validate_url_for_ssrf("http://172.32.0.1/x").is_ok());
        assert!(validate_url_for_ssrf("http://172.15.0.1/x").is_ok());
    }

    #[test]
    fn non_http_schemes_blocked() {
        assert!(validate_url_for_ssrf("ftp://example.com/x").is_err());
        assert!(validate_url_for_ssrf("file:///etc/passwd").is_err());
    }
}
