// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Egress filter for outbound HTTP.
//!
//! Every URL a tool wants to fetch passes through [`check_url`] before any
//! socket is opened.  Rejected: non-HTTP(S) schemes, loopback and its
//! aliases, `.local`/`.internal` names, RFC1918 and reserved IPv4 ranges,
//! decimal/octal/hex-encoded IPv4 forms of the above, IPv6 link-local, ULA,
//! loopback, and IPv4-mapped addresses.

use std::net::{Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

use crate::error::SafetyError;

/// Validate an outbound URL.  `Ok(())` means the target is a public address
/// reached over HTTP(S).
pub fn check_url(raw: &str) -> Result<(), SafetyError> {
    let url =
        Url::parse(raw).map_err(|e| SafetyError::UrlBlocked(format!("{raw}: {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(SafetyError::UrlBlocked(format!(
                "scheme {other} not allowed"
            )))
        }
    }

    match url.host() {
        None => Err(SafetyError::UrlBlocked(format!("{raw}: no host"))),
        Some(Host::Ipv4(ip)) => check_ipv4(ip),
        Some(Host::Ipv6(ip)) => check_ipv6(ip),
        Some(Host::Domain(domain)) => check_domain(domain),
    }
}

fn check_domain(domain: &str) -> Result<(), SafetyError> {
    let d = domain.trim_end_matches('.').to_ascii_lowercase();

    if d == "localhost"
        || d.ends_with(".localhost")
        || d == "localhost.localdomain"
        || d == "ip6-localhost"
        || d == "ip6-loopback"
    {
        return Err(SafetyError::UrlBlocked(format!("loopback alias {domain}")));
    }
    if d.ends_with(".local") || d.ends_with(".internal") || d == "internal" {
        return Err(SafetyError::UrlBlocked(format!(
            "internal-only name {domain}"
        )));
    }
    // Numeric hosts the URL parser left as "domains": single-integer decimal,
    // octal (0177.0.0.1) and hex (0x7f000001) encodings all re-parse to an
    // IPv4 address that must pass the same range checks.
    if let Some(ip) = parse_numeric_ipv4(&d) {
        return check_ipv4(ip);
    }
    Ok(())
}

fn check_ipv4(ip: Ipv4Addr) -> Result<(), SafetyError> {
    let blocked = ip.is_loopback()          // 127.0.0.0/8
        || ip.is_private()                  // RFC1918
        || ip.is_link_local()               // 169.254.0.0/16
        || ip.is_unspecified()              // 0.0.0.0
        || ip.is_broadcast()                // 255.255.255.255
        || ip.is_multicast()                // 224.0.0.0/4
        || ip.is_documentation()
        || in_range(ip, [0, 0, 0, 0], 8)    // "this network"
        || in_range(ip, [100, 64, 0, 0], 10) // CGNAT
        || in_range(ip, [192, 0, 0, 0], 24)
        || in_range(ip, [198, 18, 0, 0], 15) // benchmarking
        || in_range(ip, [240, 0, 0, 0], 4); // reserved
    if blocked {
        return Err(SafetyError::UrlBlocked(format!(
            "private/reserved address {ip}"
        )));
    }
    Ok(())
}

fn check_ipv6(ip: Ipv6Addr) -> Result<(), SafetyError> {
    if ip.is_loopback() || ip.is_unspecified() {
        return Err(SafetyError::UrlBlocked(format!("loopback address {ip}")));
    }
    let segments = ip.segments();
    // fe80::/10 link-local
    if segments[0] & 0xffc0 == 0xfe80 {
        return Err(SafetyError::UrlBlocked(format!("link-local address {ip}")));
    }
    // fc00::/7 unique-local
    if segments[0] & 0xfe00 == 0xfc00 {
        return Err(SafetyError::UrlBlocked(format!("unique-local address {ip}")));
    }
    // IPv4-mapped (::ffff:a.b.c.d) re-checks the embedded IPv4.
    if let Some(v4) = ip.to_ipv4_mapped() {
        return check_ipv4(v4);
    }
    Ok(())
}

fn in_range(ip: Ipv4Addr, net: [u8; 4], prefix: u32) -> bool {
    let ip = u32::from(ip);
    let net = u32::from(Ipv4Addr::from(net));
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    ip & mask == net & mask
}

/// Parse decimal / octal / hex IPv4 encodings, dotted or single-integer.
///
/// Handles `2130706433`, `0x7f000001`, `0177.0.0.1`, `127.1`, and mixed
/// forms, per the inet_aton rules attackers rely on.
fn parse_numeric_ipv4(host: &str) -> Option<Ipv4Addr> {
    let parts: Vec<&str> = host.split('.').collect();
    if parts.is_empty() || parts.len() > 4 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    let mut values = Vec::with_capacity(parts.len());
    for part in &parts {
        values.push(parse_ipv4_component(part)?);
    }
    // inet_aton semantics: the final component fills the remaining bytes.
    let ip: u32 = match values.as_slice() {
        [a] => *a,
        [a, b] => {
            if *a > 0xff || *b > 0xff_ffff {
                return None;
            }
            (a << 24) | b
        }
        [a, b, c] => {
            if *a > 0xff || *b > 0xff || *c > 0xffff {
                return None;
            }
            (a << 24) | (b << 16) | c
        }
        [a, b, c, d] => {
            if values.iter().any(|v| *v > 0xff) {
                return None;
            }
            (a << 24) | (b << 16) | (c << 8) | d
        }
        _ => return None,
    };
    Some(Ipv4Addr::from(ip))
}

fn parse_ipv4_component(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if s.len() > 1 && s.starts_with('0') {
        u32::from_str_radix(s, 8).ok()
    } else if s.chars().all(|c| c.is_ascii_digit()) {
        s.parse().ok()
    } else {
        None
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
