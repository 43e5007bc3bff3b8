//! Best-effort resolution of a request's external network address.
//!
//! The registration protocol keys on the external IPv4 address shared by
//! devices behind the same NAT, so resolution walks the proxy header chain
//! before falling back to the transport peer. Resolution is pure; callers
//! decide what to do with the result.

use core::fmt;
use std::error::Error;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Transport metadata a handler receives alongside the request body.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    /// `X-Forwarded-For` header value, a comma-separated proxy chain.
    pub forwarded_for: Option<String>,
    /// `X-Real-IP` header value.
    pub real_ip: Option<String>,
    /// Address of the transport peer.
    pub remote_addr: Option<IpAddr>,
}

impl RequestMeta {
    pub fn from_remote_addr(addr: IpAddr) -> Self {
        RequestMeta {
            forwarded_for: None,
            real_ip: None,
            remote_addr: Some(addr),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// No candidate address could be extracted from the request.
    Missing,
    /// Best candidate is not publicly routable and strict mode is on.
    NotRoutable(IpAddr),
    /// IPv6 addresses cannot participate in the local-network heuristics.
    UnsupportedFamily(Ipv6Addr),
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressError::Missing => write!(f, "no client address in request"),
            AddressError::NotRoutable(ip) => {
                write!(f, "External IP address is not routable: {}", ip)
            }
            AddressError::UnsupportedFamily(ip) => {
                write!(f, "External IPv6 address is not supported: {}", ip)
            }
        }
    }
}

impl Error for AddressError {}

/// Resolve the requester's external address from `meta`.
///
/// Walks the forwarded-for chain left to right, then `X-Real-IP`, then the
/// transport peer, preferring the first routable candidate. With `strict`
/// set (non-debug deployments) a non-routable result is an error; otherwise
/// it is returned unchanged. IPv6 is rejected in both modes.
pub fn resolve_external_address(meta: &RequestMeta, strict: bool) -> Result<Ipv4Addr, AddressError> {
    let candidates = candidate_addresses(meta);
    let best = candidates
        .iter()
        .copied()
        .find(|ip| is_routable(ip))
        .or_else(|| candidates.first().copied())
        .ok_or(AddressError::Missing)?;

    let v4 = match best {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(v6) => return Err(AddressError::UnsupportedFamily(v6)),
    };
    if strict && !is_routable(&best) {
        return Err(AddressError::NotRoutable(best));
    }
    Ok(v4)
}

fn candidate_addresses(meta: &RequestMeta) -> Vec<IpAddr> {
    let mut out = Vec::new();
    if let Some(chain) = meta.forwarded_for.as_deref() {
        for entry in chain.split(',') {
            if let Ok(ip) = entry.trim().parse::<IpAddr>() {
                out.push(ip);
            }
        }
    }
    if let Some(ip) = meta.real_ip.as_deref().and_then(|s| s.trim().parse::<IpAddr>().ok()) {
        out.push(ip);
    }
    if let Some(ip) = meta.remote_addr {
        out.push(ip);
    }
    out
}

fn is_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_multicast()
                || v4.is_unspecified())
        }
        IpAddr::V6(v6) => !(v6.is_loopback() || v6.is_multicast() || v6.is_unspecified()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_with_remote(ip: &str) -> RequestMeta {
        RequestMeta::from_remote_addr(ip.parse().unwrap())
    }

    #[test]
    fn private_address_fails_in_strict_mode() {
        let meta = meta_with_remote("10.0.0.1");
        assert_eq!(
            resolve_external_address(&meta, true),
            Err(AddressError::NotRoutable("10.0.0.1".parse().unwrap()))
        );
    }

    #[test]
    fn private_address_passes_unchanged_in_relaxed_mode() {
        let meta = meta_with_remote("10.0.0.1");
        assert_eq!(
            resolve_external_address(&meta, false).unwrap(),
            "10.0.0.1".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn ipv6_is_rejected_in_both_modes() {
        let meta = meta_with_remote("2001:db8::1");
        assert!(matches!(
            resolve_external_address(&meta, true),
            Err(AddressError::UnsupportedFamily(_))
        ));
        assert!(matches!(
            resolve_external_address(&meta, false),
            Err(AddressError::UnsupportedFamily(_))
        ));
    }

    #[test]
    fn forwarded_chain_prefers_first_routable_hop() {
        let meta = RequestMeta {
            forwarded_for: Some("192.168.1.20, 203.0.113.5, 198.51.100.7".to_string()),
            real_ip: None,
            remote_addr: Some("127.0.0.1".parse().unwrap()),
        };
        assert_eq!(
            resolve_external_address(&meta, true).unwrap(),
            "203.0.113.5".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn falls_back_to_real_ip_then_peer() {
        let meta = RequestMeta {
            forwarded_for: None,
            real_ip: Some("198.51.100.7".to_string()),
            remote_addr: Some("10.1.2.3".parse().unwrap()),
        };
        assert_eq!(
            resolve_external_address(&meta, true).unwrap(),
            "198.51.100.7".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn empty_request_is_missing() {
        assert_eq!(
            resolve_external_address(&RequestMeta::default(), false),
            Err(AddressError::Missing)
        );
    }

    #[test]
    fn garbage_header_entries_are_skipped() {
        let meta = RequestMeta {
            forwarded_for: Some("unknown, 203.0.113.5".to_string()),
            real_ip: None,
            remote_addr: None,
        };
        assert_eq!(
            resolve_external_address(&meta, true).unwrap(),
            "203.0.113.5".parse::<Ipv4Addr>().unwrap()
        );
    }
}
