//! Outbound fetch guard.
//!
//! Every URL fetched on behalf of a model or a query is checked here first.
//! Hostnames are resolved and every resolved address must be public.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use reqwest::{redirect, Url};
use tracing::warn;

use super::ToolError;

/// Per-request timeout for page fetches
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_REDIRECTS: usize = 5;

/// Private, loopback, link-local and unspecified ranges
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_blocked_v4(mapped);
            }
            v6.is_loopback() || v6.is_unspecified() || is_link_local_v6(v6)
        }
    }
}

fn is_blocked_v4(ip: Ipv4Addr) -> bool {
    // 10/8, 172.16/12, 192.168/16, 127/8, 169.254/16
    ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
}

fn is_link_local_v6(ip: Ipv6Addr) -> bool {
    // fe80::/10
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// Parse a URL and make sure it points at a public address.
///
/// IP-literal hosts are checked without any network access.
pub async fn check_public_url(raw: &str) -> Result<Url, ToolError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| ToolError::InvalidInput(format!("Invalid URL: {}", e)))?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(ToolError::Blocked(format!(
                "URL scheme '{}' is not allowed",
                scheme
            )))
        }
    }

    let host = url
        .host()
        .ok_or_else(|| ToolError::InvalidInput("Invalid URL".to_string()))?;

    let literal = match host {
        url::Host::Ipv4(v4) => Some(IpAddr::V4(v4)),
        url::Host::Ipv6(v6) => Some(IpAddr::V6(v6)),
        url::Host::Domain(_) => None,
    };

    if let Some(ip) = literal {
        if is_blocked_ip(ip) {
            warn!(url = %url, ip = %ip, "Blocked fetch of internal address");
            return Err(ToolError::Blocked(
                "Cannot fetch internal/private URLs".to_string(),
            ));
        }
        return Ok(url);
    }

    let domain = url.host_str().unwrap_or_default().to_string();
    if domain.eq_ignore_ascii_case("localhost") || domain.to_ascii_lowercase().ends_with(".localhost") {
        return Err(ToolError::Blocked(
            "Cannot fetch internal/private URLs".to_string(),
        ));
    }

    let port = url.port_or_known_default().unwrap_or(443);
    let resolved: Vec<_> = tokio::net::lookup_host((domain.as_str(), port))
        .await
        .map_err(|_| ToolError::Network("Could not resolve hostname".to_string()))?
        .collect();

    if resolved.is_empty() {
        return Err(ToolError::Network("Could not resolve hostname".to_string()));
    }

    if let Some(addr) = resolved.iter().find(|a| is_blocked_ip(a.ip())) {
        warn!(url = %url, ip = %addr.ip(), "Blocked fetch: hostname resolves to internal address");
        return Err(ToolError::Blocked(
            "Cannot fetch internal/private URLs".to_string(),
        ));
    }

    Ok(url)
}

/// HTTP client for guarded fetches. Redirects to IP-literal internal hosts
/// are refused.
pub fn fetch_client(user_agent: &str) -> reqwest::Result<reqwest::Client> {
    let policy = redirect::Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        let blocked = match attempt.url().host() {
            Some(url::Host::Ipv4(v4)) => is_blocked_ip(IpAddr::V4(v4)),
            Some(url::Host::Ipv6(v6)) => is_blocked_ip(IpAddr::V6(v6)),
            Some(url::Host::Domain(d)) => d.eq_ignore_ascii_case("localhost"),
            None => true,
        };
        if blocked {
            attempt.error("redirect to internal address")
        } else {
            attempt.follow()
        }
    });

    reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(FETCH_TIMEOUT)
        .redirect(policy)
        .build()
}

/// Read at most `cap` bytes of a response body
pub async fn read_capped(mut response: reqwest::Response, cap: usize) -> Result<Vec<u8>, ToolError> {
    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| ToolError::Network(format!("Failed to fetch: {}", e)))?
    {
        let room = cap.saturating_sub(body.len());
        if chunk.len() >= room {
            body.extend_from_slice(&chunk[..room]);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}
