// Copyright 2024 Guanhao Yin <sopium@mysterious.site>

// This file is part of wgdash.

// wgdash is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// wgdash is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with wgdash.  If not, see <https://www.gnu.org/licenses/>.

use crate::error::{Error, Result};
use crate::utils::split_list;
use ipnet::{IpNet, Ipv6Net};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv6Addr};

/// IPv6 suggestions unless everything is asked for.
const V6_SUGGESTIONS: usize = 255;
/// Hard ceiling for IPv6 networks even when everything is asked for.
const V6_CEILING: usize = 65536;

pub fn parse_cidr_list(list: &str) -> Result<Vec<IpNet>> {
    split_list(list)
        .map(|s| {
            s.parse::<IpNet>()
                .or_else(|_| s.parse::<IpAddr>().map(IpNet::from))
                .map_err(|_| Error::validation(format!("invalid CIDR {}", s)))
        })
        .collect()
}

/// Host addresses named by a CIDR list, e.g. the configuration's own
/// addresses or a peer's allowed IPs. Unparsable items are skipped.
pub fn host_addresses(list: &str) -> Vec<IpAddr> {
    split_list(list)
        .filter_map(|s| {
            s.parse::<IpNet>()
                .map(|n| n.addr())
                .or_else(|_| s.parse::<IpAddr>())
                .ok()
        })
        .collect()
}

pub fn host_cidr(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(a) => format!("{}/32", a),
        IpAddr::V6(a) => format!("{}/128", a),
    }
}

/// Whether every host of `allowed` lies in one of `networks`.
pub fn within(networks: &[IpNet], allowed: &[IpNet]) -> bool {
    allowed
        .iter()
        .all(|a| networks.iter().any(|n| n.trunc().contains(&a.addr())))
}

/// Free host addresses of `networks` as `/32` or `/128` CIDRs.
pub fn available(networks: &[IpNet], used: &HashSet<IpAddr>, all: bool) -> Vec<String> {
    let mut out = Vec::new();
    for net in networks {
        let net = net.trunc();
        match net {
            IpNet::V4(n) => {
                out.extend(
                    n.hosts()
                        .map(IpAddr::V4)
                        .filter(|a| !used.contains(a))
                        .map(host_cidr),
                );
            }
            IpNet::V6(n) => {
                let limit = if all { V6_CEILING } else { V6_SUGGESTIONS };
                out.extend(
                    n.hosts()
                        .skip(1)
                        .map(IpAddr::V6)
                        .filter(|a| !used.contains(a))
                        .take(limit)
                        .map(host_cidr),
                );
            }
        }
    }
    out
}

/// Deterministic unique local address replacing a link-local one.
pub fn ula_for(name: &str, prefix_len: u8) -> String {
    let digest = Sha256::digest(name.as_bytes());
    let h = u16::from_be_bytes([digest[0], digest[1]]);
    format!("fd42:{:04x}:42::1/{}", h, prefix_len)
}

fn is_link_local(a: &Ipv6Addr) -> bool {
    (a.segments()[0] & 0xffc0) == 0xfe80
}

/// Rewrite every `fe80::/10` address of an `Address` value to its ULA.
pub fn rewrite_link_local(name: &str, address: &str) -> String {
    split_list(address)
        .map(|s| match s.parse::<Ipv6Net>() {
            Ok(n) if is_link_local(&n.addr()) => ula_for(name, n.prefix_len()),
            _ => s.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_30_has_one_free_host() {
        let nets = parse_cidr_list("10.9.0.1/30").unwrap();
        let used: HashSet<_> = host_addresses("10.9.0.1/30").into_iter().collect();
        assert_eq!(available(&nets, &used, false), vec!["10.9.0.2/32".to_string()]);
    }

    #[test]
    fn v6_is_capped_unless_all() {
        let nets = parse_cidr_list("fd00::1/112").unwrap();
        let used: HashSet<_> = host_addresses("fd00::1/112").into_iter().collect();
        let some = available(&nets, &used, false);
        assert_eq!(some.len(), 255);
        assert_eq!(some[0], "fd00::2/128");
        assert_eq!(available(&nets, &used, true).len(), 65534);
    }

    #[test]
    fn containment() {
        let nets = parse_cidr_list("10.9.0.1/24, fd00::1/64").unwrap();
        assert!(within(&nets, &parse_cidr_list("10.9.0.7/32, fd00::7/128").unwrap()));
        assert!(!within(&nets, &parse_cidr_list("10.9.1.7/32").unwrap()));
        assert!(parse_cidr_list("10.9.0.300/32").is_err());
        assert_eq!(parse_cidr_list("10.9.0.2").unwrap()[0].prefix_len(), 32);
    }

    #[test]
    fn link_local_rewrite() {
        let r = rewrite_link_local("wg-a", "10.9.0.1/24, fe80::1/64");
        let ula = ula_for("wg-a", 64);
        assert_eq!(r, format!("10.9.0.1/24, {}", ula));
        assert!(ula.starts_with("fd42:") && ula.ends_with(":42::1/64"));
        assert_eq!(rewrite_link_local("wg-a", "fd00::1/64"), "fd00::1/64");
        assert_eq!(ula_for("wg-a", 64), ula_for("wg-a", 64));
    }
}
