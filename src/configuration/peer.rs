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

//! Peer requests and their validation.

use super::addresses;
use crate::cps::format;
use crate::cps::Patterns;
use crate::error::{Error, Result};
use crate::keys::is_valid_key;
use crate::utils::split_list;
use serde::Deserialize;
use std::net::IpAddr;

pub const MAX_MTU: i64 = 1460;

/// A peer to add. Missing keys are generated, missing addresses are
/// allocated and missing client settings come from the peer defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct NewPeer {
    pub name: String,
    pub public_key: String,
    pub private_key: String,
    pub preshared_key: String,
    pub allowed_ips: Vec<String>,
    #[serde(rename = "DNS")]
    pub dns: Option<String>,
    pub endpoint_allowed_ip: Option<String>,
    pub mtu: Option<i64>,
    pub keepalive: Option<i64>,
    pub cps_patterns: Patterns,
}

impl NewPeer {
    pub fn with_key(public_key: &str, allowed_ips: &[&str]) -> NewPeer {
        NewPeer {
            public_key: public_key.into(),
            allowed_ips: allowed_ips.iter().map(|s| s.to_string()).collect(),
            ..NewPeer::default()
        }
    }
}

/// New settings of an existing peer. Every field is applied.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PeerUpdate {
    pub id: String,
    pub name: String,
    pub private_key: String,
    pub preshared_key: String,
    pub allowed_ip: String,
    #[serde(rename = "DNS")]
    pub dns: String,
    pub endpoint_allowed_ip: String,
    pub mtu: i64,
    pub keepalive: i64,
    pub cps_patterns: Patterns,
}

pub fn validate_dns(dns: &str) -> Result<()> {
    for d in split_list(dns) {
        if d.parse::<IpAddr>().is_err() {
            return Err(Error::validation(format!("DNS format is incorrect: {}", d)));
        }
    }
    Ok(())
}

pub fn validate_endpoint_allowed_ip(list: &str) -> Result<()> {
    let nets = addresses::parse_cidr_list(list)
        .map_err(|_| Error::validation("endpoint allowed IPs format is incorrect"))?;
    if nets.is_empty() {
        return Err(Error::validation("endpoint allowed IPs must not be empty"));
    }
    Ok(())
}

pub fn validate_mtu(mtu: i64) -> Result<()> {
    if !(0..=MAX_MTU).contains(&mtu) {
        return Err(Error::validation(format!("MTU must be within 0..={}", MAX_MTU)));
    }
    Ok(())
}

pub fn validate_keepalive(keepalive: i64) -> Result<()> {
    if keepalive < 0 {
        return Err(Error::validation("persistent keepalive must not be negative"));
    }
    Ok(())
}

pub fn validate_preshared_key(psk: &str) -> Result<()> {
    if !psk.is_empty() && !is_valid_key(psk) {
        return Err(Error::validation("preshared key format is incorrect"));
    }
    Ok(())
}

/// Normalize and check `I1..I5`.
pub fn normalize_cps(patterns: &Patterns) -> Result<Patterns> {
    let mut out = Patterns::default();
    for (k, p) in patterns.iter().enumerate() {
        let n = format::normalize(p);
        format::validate(&n).map_err(|e| Error::validation(format!("I{}: {}", k + 1, e)))?;
        out[k] = n;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_validation() {
        assert!(validate_dns("1.1.1.1, 2606:4700:4700::1111").is_ok());
        assert!(validate_dns("").is_ok());
        assert!(validate_dns("dns.example").is_err());
        assert!(validate_endpoint_allowed_ip("0.0.0.0/0, ::/0").is_ok());
        assert!(validate_endpoint_allowed_ip("").is_err());
        assert!(validate_endpoint_allowed_ip("nope").is_err());
        assert!(validate_mtu(0).is_ok());
        assert!(validate_mtu(1460).is_ok());
        assert!(validate_mtu(1461).is_err());
        assert!(validate_mtu(-1).is_err());
        assert!(validate_keepalive(0).is_ok());
        assert!(validate_keepalive(-5).is_err());
        assert!(validate_preshared_key("").is_ok());
        assert!(validate_preshared_key("short").is_err());
    }

    #[test]
    fn cps_normalization() {
        let mut p = Patterns::default();
        p[0] = "0xabcd".into();
        p[4] = "<c><t>".into();
        let n = normalize_cps(&p).unwrap();
        assert_eq!(n[0], "<b 0xabcd>");
        assert_eq!(n[4], "<c><t>");
        p[2] = "<r 0>".into();
        let e = normalize_cps(&p).unwrap_err();
        assert!(e.to_string().starts_with("I3:"));
    }
}
