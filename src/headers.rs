//! Request header inspection: client identity, admin credentials, and body
//! guards for admin requests.

use std::net::{IpAddr, SocketAddr};

use hyper::header::{HeaderMap, HeaderName};

/// Header carrying the administrative secret.
pub const ADMIN_TOKEN_HEADER: HeaderName = HeaderName::from_static("x-admin-token");

/// Response header telling whether the record came from the cache.
pub const CACHE_STATUS_HEADER: HeaderName = HeaderName::from_static("x-cache");

/// Who is calling, derived per request and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIdentity<'a> {
    pub ip: IpAddr,
    pub origin: Option<&'a str>,
}

impl<'a> ClientIdentity<'a> {
    pub fn resolve(headers: &'a HeaderMap, peer: SocketAddr, trusted_hops: usize) -> Self {
        Self {
            ip: client_ip(headers, peer, trusted_hops),
            origin: origin(headers),
        }
    }
}

/// Resolves the client IP for admission and rate limiting.
///
/// With `trusted_hops == 0` the TCP peer address is used. Otherwise the
/// `X-Forwarded-For` entry `trusted_hops` places from the right is taken:
/// each trusted proxy appends the address it saw, so everything further
/// left was written by the client and cannot be trusted. A chain shorter
/// than `trusted_hops` or an unparseable entry falls back to the peer.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr, trusted_hops: usize) -> IpAddr {
    if trusted_hops == 0 {
        return peer.ip();
    }

    let chain: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|val| val.to_str().ok())
        .flat_map(|val| val.split(','))
        .map(str::trim)
        .collect();

    chain
        .len()
        .checked_sub(trusted_hops)
        .and_then(|idx| chain[idx].parse::<IpAddr>().ok())
        .unwrap_or_else(|| peer.ip())
}

/// Returns the `Origin` header, treating an empty value as absent.
pub fn origin(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(hyper::header::ORIGIN)
        .and_then(|val| val.to_str().ok())
        .map(str::trim)
        .filter(|val| !val.is_empty())
}

/// Returns the admin token presented by the caller, if any.
pub fn admin_token(headers: &HeaderMap) -> Option<&[u8]> {
    headers.get(ADMIN_TOKEN_HEADER).map(|val| val.as_bytes())
}

/// Returns `true` if the request contains both `Content-Length` and
/// `Transfer-Encoding` headers, which is a request smuggling indicator
/// per RFC 7230 Section 3.3.3.
pub fn is_smuggling_attempt(headers: &HeaderMap) -> bool {
    headers.contains_key(hyper::header::CONTENT_LENGTH)
        && headers.contains_key(hyper::header::TRANSFER_ENCODING)
}

/// Returns `true` if the `Content-Length` header value exceeds the given
/// maximum body size in bytes.
///
/// Returns `false` if no `Content-Length` is present or the value is
/// unparseable (hyper handles malformed content-length at the protocol level).
pub fn content_length_exceeds(headers: &HeaderMap, max_bytes: u64) -> bool {
    headers
        .get(hyper::header::CONTENT_LENGTH)
        .and_then(|val| val.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .is_some_and(|len| len > max_bytes)
}

#[cfg(test)]
mod tests {
    use hyper::header::HeaderValue;

    use super::*;

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        pairs
            .iter()
            .fold(HeaderMap::new(), |mut map, (name, value)| {
                map.insert(
                    HeaderName::from_bytes(name.as_bytes()).unwrap(),
                    HeaderValue::from_str(value).unwrap(),
                );
                map
            })
    }

    fn peer() -> SocketAddr {
        "192.168.1.10:5000".parse().unwrap()
    }

    #[test]
    fn peer_address_used_by_default() {
        let headers = header_map(&[("x-forwarded-for", "10.0.0.1")]);
        assert_eq!(client_ip(&headers, peer(), 0), peer().ip());
    }

    #[test]
    fn rightmost_forwarded_entry_used_with_one_proxy() {
        let headers = header_map(&[("x-forwarded-for", "10.0.0.7, 203.0.113.50")]);
        assert_eq!(
            client_ip(&headers, peer(), 1),
            "203.0.113.50".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn hops_count_from_the_right() {
        let headers = header_map(&[("x-forwarded-for", "1.1.1.1, 10.0.0.1, 10.0.0.2")]);
        assert_eq!(
            client_ip(&headers, peer(), 2),
            "10.0.0.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn repeated_forwarded_headers_form_one_chain() {
        let mut headers = header_map(&[("x-forwarded-for", "10.0.0.7")]);
        headers.append("x-forwarded-for", HeaderValue::from_static("203.0.113.50"));
        assert_eq!(
            client_ip(&headers, peer(), 1),
            "203.0.113.50".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn falls_back_to_peer_without_usable_forwarded_header() {
        let headers = header_map(&[("x-forwarded-for", "10.0.0.1, unknown")]);
        assert_eq!(client_ip(&headers, peer(), 1), peer().ip());
        assert_eq!(client_ip(&HeaderMap::new(), peer(), 1), peer().ip());

        let short = header_map(&[("x-forwarded-for", "10.0.0.1")]);
        assert_eq!(client_ip(&short, peer(), 2), peer().ip());
    }

    #[test]
    fn empty_origin_is_absent() {
        assert_eq!(origin(&header_map(&[("origin", "")])), None);
        assert_eq!(origin(&HeaderMap::new()), None);
        assert_eq!(
            origin(&header_map(&[("origin", "https://app.example")])),
            Some("https://app.example")
        );
    }

    #[test]
    fn identity_combines_ip_and_origin() {
        let headers = header_map(&[
            ("x-forwarded-for", "10.0.0.1"),
            ("origin", "https://app.example"),
        ]);
        let identity = ClientIdentity::resolve(&headers, peer(), 1);
        assert_eq!(identity.ip, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(identity.origin, Some("https://app.example"));
    }

    #[test]
    fn reads_admin_token() {
        let headers = header_map(&[("x-admin-token", "s3cret")]);
        assert_eq!(admin_token(&headers), Some(&b"s3cret"[..]));
        assert_eq!(admin_token(&HeaderMap::new()), None);
    }

    #[test]
    fn detects_smuggling_attempt() {
        let headers = header_map(&[("content-length", "42"), ("transfer-encoding", "chunked")]);
        assert!(is_smuggling_attempt(&headers));
        assert!(!is_smuggling_attempt(&header_map(&[("content-length", "42")])));
    }

    #[test]
    fn content_length_limit() {
        assert!(content_length_exceeds(&header_map(&[("content-length", "2048")]), 1024));
        assert!(!content_length_exceeds(&header_map(&[("content-length", "512")]), 1024));
        assert!(!content_length_exceeds(&HeaderMap::new(), 1024));
        assert!(!content_length_exceeds(
            &header_map(&[("content-length", "not-a-number")]),
            1024
        ));
    }
}
