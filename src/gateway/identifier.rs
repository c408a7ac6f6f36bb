//! Client identifier extraction.

use std::net::SocketAddr;

use http::HeaderMap;

/// Identifier used when nothing about the client is known.
pub const ANONYMOUS: &str = "anonymous";

/// Derive the rate limit key for a request.
///
/// Prefers the first `X-Forwarded-For` hop, then `X-Real-IP`, then the
/// address of the peer socket, then [`ANONYMOUS`].
pub fn client_identifier(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| ANONYMOUS.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn peer() -> Option<SocketAddr> {
        Some("10.0.0.9:51234".parse().unwrap())
    }

    #[test]
    fn test_first_forwarded_hop_wins() {
        let h = headers(&[
            ("x-forwarded-for", " 203.0.113.7 , 10.0.0.1, 10.0.0.2"),
            ("x-real-ip", "198.51.100.1"),
        ]);
        assert_eq!(client_identifier(&h, peer()), "203.0.113.7");
    }

    #[test]
    fn test_real_ip_when_no_forwarded_for() {
        let h = headers(&[("x-real-ip", "198.51.100.1")]);
        assert_eq!(client_identifier(&h, peer()), "198.51.100.1");
    }

    #[test]
    fn test_empty_forwarded_for_is_skipped() {
        let h = headers(&[("x-forwarded-for", " , 10.0.0.1"), ("x-real-ip", "198.51.100.1")]);
        assert_eq!(client_identifier(&h, peer()), "198.51.100.1");
    }

    #[test]
    fn test_peer_address_without_headers() {
        assert_eq!(client_identifier(&HeaderMap::new(), peer()), "10.0.0.9");
    }

    #[test]
    fn test_anonymous_when_nothing_known() {
        assert_eq!(client_identifier(&HeaderMap::new(), None), ANONYMOUS);
    }

    #[test]
    fn test_ipv6_peer() {
        let peer: SocketAddr = "[::1]:8080".parse().unwrap();
        assert_eq!(client_identifier(&HeaderMap::new(), Some(peer)), "::1");
    }
}
