//! Utility helpers shared across the crate

use std::sync::OnceLock;

use regex::Regex;

/// Pattern a session id (and therefore an on-disk HLS directory name) must
/// match before anything touches the filesystem with it
const SAFE_ID_PATTERN: &str = r"^[A-Za-z0-9_\-]{8,}$";

fn safe_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(SAFE_ID_PATTERN).expect("static pattern compiles"))
}

/// Whether `id` is safe to use as a session id / directory name
pub fn is_safe_session_id(id: &str) -> bool {
    safe_id_regex().is_match(id)
}

/// Mint a fresh safe session id
pub fn new_session_id() -> String {
    format!("sess_{}", uuid::Uuid::new_v4().simple())
}

/// Check an outbound URL against the configured allowlist.
///
/// Empty allow dimensions are wildcards; a populated dimension must match.
/// Hosts match exactly; IPv4 hosts additionally match the CIDR list.
pub fn outbound_allowed(url: &str, allow: &crate::config::schema::OutboundAllow) -> bool {
    let Some((scheme, rest)) = url.split_once("://") else {
        return false;
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => {
            match p.parse::<u16>() {
                Ok(port) => (h, port),
                Err(_) => return false,
            }
        }
        _ => (
            authority,
            if scheme == "https" { 443 } else { 80 },
        ),
    };
    if host.is_empty() {
        return false;
    }

    if !allow.schemes.is_empty() && !allow.schemes.iter().any(|s| s == scheme) {
        return false;
    }
    if !allow.ports.is_empty() && !allow.ports.contains(&port) {
        return false;
    }
    if allow.hosts.is_empty() && allow.cidrs.is_empty() {
        return true;
    }
    if allow.hosts.iter().any(|h| h.eq_ignore_ascii_case(host)) {
        return true;
    }
    if let Ok(ip) = host.parse::<std::net::Ipv4Addr>() {
        return allow.cidrs.iter().any(|cidr| ipv4_in_cidr(ip, cidr));
    }
    false
}

fn ipv4_in_cidr(ip: std::net::Ipv4Addr, cidr: &str) -> bool {
    let (net, bits) = match cidr.split_once('/') {
        Some((net, bits)) => match (net.parse::<std::net::Ipv4Addr>(), bits.parse::<u32>()) {
            (Ok(net), Ok(bits)) if bits <= 32 => (net, bits),
            _ => return false,
        },
        None => match cidr.parse::<std::net::Ipv4Addr>() {
            Ok(net) => (net, 32),
            Err(_) => return false,
        },
    };
    let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
    (u32::from(ip) & mask) == (u32::from(net) & mask)
}
