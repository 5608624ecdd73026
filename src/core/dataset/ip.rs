//! IP address / CIDR validation and expansion for the block and allow
//! lists. Grounded on
//! `original_source/erddaputil/erddap/datasets.py::_validate_ip_address`,
//! `_expand_ip_addresses`, `_erddap_range_to_ips`, `_subnet_to_erddap_range`.
//!
//! The data server's own notation is not RFC CIDR: a bare `a.b.c.*` or
//! `a.b.*.*` wildcard stands in for a `/24` or `/16` block.

use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::{Ipv4Net, Ipv6Net};

use crate::core::errors::CoreError;

/// Individually-enumerated blocks below this many addresses are kept as
/// single entries rather than flattened to a wildcard line.
const FLATTEN_TO_SLASH_24_THRESHOLD: u32 = 256;
/// At or above this many addresses a block is flattened all the way to a
/// `/16` wildcard line.
const FLATTEN_TO_SLASH_16_THRESHOLD: u32 = 65536;

/// Validates a single allow/block-list entry: a plain IPv4/IPv6 address, an
/// IPv4 CIDR (`a.b.c.d/n`), or the data server's wildcard notation
/// (`a.b.c.*` or `a.b.*.*`). A `*` in the third octet requires a `*` in the
/// fourth (the original's "can't narrow the host range further" rule).
pub fn validate_ip_entry(entry: &str) -> Result<(), CoreError> {
    let entry = entry.trim();
    if entry.is_empty() {
        return Err(CoreError::validation("IP entry must not be empty"));
    }

    if let Some((_, prefix)) = entry.split_once('/') {
        let net = Ipv4Net::from_str(entry)
            .map_err(|_| CoreError::validation(format!("'{entry}' is not a valid CIDR block")))?;
        let _ = net;
        let _: u8 = prefix
            .parse()
            .map_err(|_| CoreError::validation(format!("'{entry}' has an invalid prefix length")))?;
        return Ok(());
    }

    if entry.contains('*') {
        return validate_wildcard_v4(entry);
    }

    if entry.parse::<std::net::IpAddr>().is_ok() {
        return Ok(());
    }

    Err(CoreError::validation(format!("'{entry}' is not a valid IP address or CIDR block")))
}

fn validate_wildcard_v4(entry: &str) -> Result<(), CoreError> {
    let parts: Vec<&str> = entry.split('.').collect();
    if parts.len() != 4 {
        return Err(CoreError::validation(format!("'{entry}' is not a valid wildcard address")));
    }
    let mut seen_wildcard = false;
    for (idx, part) in parts.iter().enumerate() {
        if *part == "*" {
            seen_wildcard = true;
            if idx == 2 && parts[3] != "*" {
                return Err(CoreError::validation(format!(
                    "'{entry}': a wildcard in the third octet requires one in the fourth"
                )));
            }
            continue;
        }
        if seen_wildcard {
            return Err(CoreError::validation(format!(
                "'{entry}': concrete octets may not follow a wildcard"
            )));
        }
        let value: u16 = part
            .parse()
            .map_err(|_| CoreError::validation(format!("'{entry}' is not a valid wildcard address")))?;
        if value > 255 {
            return Err(CoreError::validation(format!("'{entry}' has an octet out of range")));
        }
    }
    Ok(())
}

/// Validates a free-form email entry for the subscription block list: a
/// single `user@host` pair (no display names, no commas).
pub fn validate_email(entry: &str) -> Result<(), CoreError> {
    let entry = entry.trim();
    let (local, domain) = entry
        .split_once('@')
        .ok_or_else(|| CoreError::validation(format!("'{entry}' is not a valid email address")))?;
    if local.is_empty() || domain.is_empty() || !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err(CoreError::validation(format!("'{entry}' is not a valid email address")));
    }
    if entry.chars().any(char::is_whitespace) {
        return Err(CoreError::validation(format!("'{entry}' is not a valid email address")));
    }
    Ok(())
}

/// Expands a validated entry for the IP block list (`allow_ranges = true`):
/// individual addresses below [`FLATTEN_TO_SLASH_24_THRESHOLD`], `/24`
/// wildcard lines (`a.b.c.*`) between that and
/// [`FLATTEN_TO_SLASH_16_THRESHOLD`], and `/16` wildcard lines (`a.b.*.*`)
/// at or above it. Entries already in wildcard notation are already in
/// this list's preferred form and pass through unchanged.
///
/// For the unlimited-allow list (`allow_ranges = false`) every entry is
/// expanded to individual addresses and no `*`-bearing line is ever
/// emitted: `a.b.c.*` becomes 256 entries, `a.b.*.*` becomes 65536, and a
/// CIDR block expands fully regardless of its size.
///
/// IPv6 CIDRs always expand to individual addresses, on both lists.
pub fn expand_ip_addresses(entries: &[String], allow_ranges: bool) -> Result<Vec<String>, CoreError> {
    let mut out = Vec::new();
    for entry in entries {
        validate_ip_entry(entry)?;
        out.extend(expand_one(entry, allow_ranges)?);
    }
    out.sort();
    out.dedup();
    Ok(out)
}

fn expand_one(entry: &str, allow_ranges: bool) -> Result<Vec<String>, CoreError> {
    if let Some(net) = parse_v4_wildcard(entry) {
        return Ok(if allow_ranges {
            vec![entry.to_string()]
        } else {
            erddap_range_to_ips(net)
        });
    }

    if entry.contains('/') {
        if let Ok(net) = Ipv6Net::from_str(entry) {
            return Ok(net.hosts().map(|ip| ip.to_string()).collect());
        }
        let net = Ipv4Net::from_str(entry)
            .map_err(|_| CoreError::validation(format!("'{entry}' is not a valid CIDR block")))?;
        return Ok(if allow_ranges {
            subnet_to_erddap_range(net)
        } else {
            erddap_range_to_ips(net)
        });
    }

    Ok(vec![entry.to_string()])
}

/// Parses the data server's wildcard notation (`a.b.c.*` or `a.b.*.*`)
/// into the equivalent `/24`/`/16` network, so it can be expanded the same
/// way a CIDR block is.
fn parse_v4_wildcard(entry: &str) -> Option<Ipv4Net> {
    let parts: Vec<&str> = entry.split('.').collect();
    if parts.len() != 4 || !parts.iter().any(|p| *p == "*") {
        return None;
    }
    let prefix_len = if parts[3] == "*" && parts[2] == "*" {
        16
    } else if parts[3] == "*" {
        24
    } else {
        return None;
    };
    let filled: Vec<&str> = parts.iter().map(|p| if *p == "*" { "0" } else { *p }).collect();
    let base: Ipv4Addr = filled.join(".").parse().ok()?;
    Ipv4Net::new(base, prefix_len).ok()
}

fn subnet_to_erddap_range(net: Ipv4Net) -> Vec<String> {
    let host_count: u32 = 1u32 << (32 - net.prefix_len() as u32);
    if host_count < FLATTEN_TO_SLASH_24_THRESHOLD {
        erddap_range_to_ips(net)
    } else if host_count < FLATTEN_TO_SLASH_16_THRESHOLD {
        slash_24_lines(net)
    } else {
        slash_16_lines(net)
    }
}

/// Walks every address in `net`, network and broadcast included — the
/// original expands both `a.b.c.*` (`range(0, 256)`) and a CIDR block
/// (`for subnet_ip in subnet`) inclusive of `.0`/`.255`
/// (`datasets.py:558-563,580-582`), unlike `Ipv4Net::hosts()` which excludes
/// them.
fn erddap_range_to_ips(net: Ipv4Net) -> Vec<String> {
    (u32::from(net.network())..=u32::from(net.broadcast()))
        .map(|n| Ipv4Addr::from(n).to_string())
        .collect()
}

fn slash_24_lines(net: Ipv4Net) -> Vec<String> {
    let network = net.network();
    let broadcast = net.broadcast();
    let first_24 = u32::from(network) >> 8;
    let last_24 = u32::from(broadcast) >> 8;
    (first_24..=last_24)
        .map(|block| {
            let base = Ipv4Addr::from(block << 8);
            let octets = base.octets();
            format!("{}.{}.{}.*", octets[0], octets[1], octets[2])
        })
        .collect()
}

fn slash_16_lines(net: Ipv4Net) -> Vec<String> {
    let network = net.network();
    let broadcast = net.broadcast();
    let first_16 = u32::from(network) >> 16;
    let last_16 = u32::from(broadcast) >> 16;
    (first_16..=last_16)
        .map(|block| {
            let base = Ipv4Addr::from(block << 16);
            let octets = base.octets();
            format!("{}.{}.*.*", octets[0], octets[1])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_plain_addresses_and_wildcards() {
        assert!(validate_ip_entry("192.168.1.1").is_ok());
        assert!(validate_ip_entry("192.168.1.*").is_ok());
        assert!(validate_ip_entry("192.168.*.*").is_ok());
        assert!(validate_ip_entry("192.168.*.5").is_err());
        assert!(validate_ip_entry("10.0.0.0/24").is_ok());
        assert!(validate_ip_entry("not-an-ip").is_err());
        assert!(validate_ip_entry("::1").is_ok());
    }

    #[test]
    fn validates_email_shape() {
        assert!(validate_email("person@example.com").is_ok());
        assert!(validate_email("not-an-email").is_err());
        assert!(validate_email("person@").is_err());
        assert!(validate_email("person@localhost").is_err());
    }

    #[test]
    fn small_subnet_expands_to_individual_addresses() {
        let expanded = expand_ip_addresses(&["203.0.113.0/30".to_string()], true).unwrap();
        // /30 = 4 addresses; the original includes network and broadcast.
        assert_eq!(expanded.len(), 4);
        assert!(expanded.iter().all(|ip| !ip.contains('*')));
    }

    #[test]
    fn slash_16_sized_subnet_flattens_to_slash_24_lines() {
        let expanded = expand_ip_addresses(&["10.0.0.0/20".to_string()], true).unwrap();
        assert!(expanded.iter().all(|ip| ip.ends_with(".*") && !ip.ends_with(".*.*")));
        assert_eq!(expanded.len(), 16);
    }

    #[test]
    fn huge_subnet_flattens_to_slash_16_lines() {
        let expanded = expand_ip_addresses(&["10.0.0.0/8".to_string()], true).unwrap();
        assert!(expanded.iter().all(|ip| ip.ends_with(".*.*")));
    }

    #[test]
    fn unlimited_allow_list_never_emits_wildcard_or_cidr_lines() {
        let expanded = expand_ip_addresses(&["10.0.0.0/30".to_string()], false).unwrap();
        assert_eq!(expanded.len(), 4);
        assert!(expanded.iter().all(|ip| !ip.contains('*') && !ip.contains('/')));
    }

    #[test]
    fn unlimited_allow_list_expands_wildcards_fully() {
        let expanded = expand_ip_addresses(&["192.168.1.*".to_string()], false).unwrap();
        assert_eq!(expanded.len(), 256);
        assert!(expanded.iter().all(|ip| !ip.contains('*')));
    }

    #[test]
    fn block_list_leaves_existing_wildcard_entries_unchanged() {
        let expanded = expand_ip_addresses(&["192.168.1.*".to_string()], true).unwrap();
        assert_eq!(expanded, vec!["192.168.1.*".to_string()]);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

        /// Every address a `/24` block expands to on the unlimited-allow
        /// list is a distinct, wildcard-free host within that block,
        /// including the network and broadcast addresses (the original
        /// enumerates `range(0, 256)`/`for subnet_ip in subnet` inclusive).
        #[test]
        fn slash_24_expansion_stays_within_the_block(a in 0u8..=255, b in 0u8..=255, c in 0u8..=255) {
            let entry = format!("{a}.{b}.{c}.0/24");
            let expanded = expand_ip_addresses(&[entry], false).unwrap();

            prop_assert_eq!(expanded.len(), 256);
            let mut seen = std::collections::HashSet::new();
            for ip in &expanded {
                let addr: Ipv4Addr = ip.parse().expect("expansion must only emit plain addresses");
                prop_assert_eq!(addr.octets()[0], a);
                prop_assert_eq!(addr.octets()[1], b);
                prop_assert_eq!(addr.octets()[2], c);
                prop_assert!(seen.insert(addr), "expansion must not repeat an address");
            }
        }

        /// The block list's own wildcard notation round-trips through
        /// validation and expansion unchanged, whatever octets it names.
        #[test]
        fn wildcard_slash_24_entry_passes_through_the_block_list_unchanged(a in 0u8..=255, b in 0u8..=255, c in 0u8..=255) {
            let entry = format!("{a}.{b}.{c}.*");
            prop_assert!(validate_ip_entry(&entry).is_ok());
            let expanded = expand_ip_addresses(&[entry.clone()], true).unwrap();
            prop_assert_eq!(expanded, vec![entry]);
        }
    }
}
