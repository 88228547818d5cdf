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

use super::Configuration;
use crate::conf_file::{ConfFile, PeerSection, CPS_KEYS, OBFUSCATION_KEYS};
use crate::cps::format::{scramble, scramble_seed};
use crate::error::{Error, Result};
use crate::utils::sanitize_filename;
use serde::Serialize;

/// Client side config file of one peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerExport {
    pub file_name: String,
    pub content: String,
}

impl Configuration {
    pub fn export_peer(&self, id: &str) -> Result<PeerExport> {
        let (_, p) = self
            .store
            .find(id)?
            .ok_or_else(|| Error::NotFound(format!("peer {}", id)))?;
        let settings = self.settings();

        let mut entries: Vec<(&str, String)> = vec![
            ("PrivateKey", p.private_key.clone()),
            ("Address", p.allowed_ip.clone()),
        ];
        if p.mtu > 0 {
            entries.push(("MTU", p.mtu.to_string()));
        }
        entries.push(("DNS", p.dns.clone()));
        if self.protocol().is_obfuscated() {
            for k in OBFUSCATION_KEYS {
                if let Some(v) = settings.obfuscation.get(k) {
                    entries.push((k, v.clone()));
                }
            }
            for (k, key) in CPS_KEYS.iter().enumerate() {
                let value = if !p.cps_patterns[k].is_empty() {
                    p.cps_patterns[k].clone()
                } else if !settings.cps_patterns[k].is_empty() {
                    scramble(
                        &settings.cps_patterns[k],
                        &scramble_seed(self.name(), &p.id, k + 1),
                    )
                } else {
                    continue;
                };
                entries.push((key, value));
            }
        }
        let borrowed: Vec<(&str, &str)> = entries.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let mut conf = ConfFile::with_interface(&borrowed);

        let remote = if p.remote_endpoint.is_empty() {
            &self.ctx.config.peers.remote_endpoint
        } else {
            &p.remote_endpoint
        };
        let endpoint = match (remote.is_empty(), settings.listen_port) {
            (false, Some(port)) => format!("{}:{}", remote, port),
            (false, None) => remote.clone(),
            (true, _) => String::new(),
        };
        conf.append_peer(&PeerSection {
            public_key: self.public_key(),
            preshared_key: p.preshared_key.clone(),
            allowed_ips: p.endpoint_allowed_ip.clone(),
            endpoint,
            persistent_keepalive: p.keepalive.to_string(),
            name: String::new(),
        });

        let base = if p.name.is_empty() {
            "UntitledPeer"
        } else {
            p.name.as_str()
        };
        Ok(PeerExport {
            file_name: format!("{}_{}", sanitize_filename(base), self.name()),
            content: conf.render(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{obfuscated_spec, spec};
    use super::super::NewPeer;
    use crate::testing::{TestEnv, KEY_A, PRIVATE_KEY, PSK};

    #[tokio::test]
    async fn plain_export() {
        let mut env = TestEnv::new();
        env.config.peers.remote_endpoint = "vpn.example.com".into();
        let core = env.core().await;
        let c = core
            .create_configuration(spec("wg-a", "10.9.0.1/24", 51820))
            .await
            .unwrap();
        let mut p = NewPeer::with_key(KEY_A, &["10.9.0.2/32"]);
        p.name = "Bob's phone".into();
        p.preshared_key = PSK.into();
        p.private_key = String::new();
        c.add_peers(vec![p]).await.unwrap();

        let e = c.export_peer(KEY_A).unwrap();
        assert_eq!(e.file_name, "Bob_s_phone_wg-a");
        assert_eq!(
            e.content,
            format!(
                "[Interface]\nAddress = 10.9.0.2/32\nMTU = 1420\nDNS = 1.1.1.1\n\n[Peer]\nPublicKey = {}\nPresharedKey = {}\nAllowedIPs = 0.0.0.0/0\nEndpoint = vpn.example.com:51820\nPersistentKeepalive = 21\n",
                c.public_key(),
                PSK
            )
        );
        assert!(c.export_peer(PRIVATE_KEY).is_err());
    }

    #[tokio::test]
    async fn obfuscated_export_scrambles_per_peer() {
        let env = TestEnv::new();
        let core = env.core().await;
        let c = core
            .create_configuration(obfuscated_spec("awg-a"))
            .await
            .unwrap();
        c.add_peers(vec![NewPeer::with_key(KEY_A, &["10.8.0.2/32"])])
            .await
            .unwrap();
        let e = c.export_peer(KEY_A).unwrap();
        assert_eq!(e.file_name, "UntitledPeer_awg-a");
        assert!(e.content.contains("Jc = 4\n"));
        let i1 = e
            .content
            .lines()
            .find(|l| l.starts_with("I1 = "))
            .unwrap()
            .to_string();
        let interface_i1 = c.read_file().unwrap().interface_value("I1").unwrap().to_string();
        assert_ne!(i1, format!("I1 = {}", interface_i1));
        assert!(e.content.contains("I3 = "));
        assert!(!e.content.contains("I2 = "));
        // Deterministic.
        assert_eq!(c.export_peer(KEY_A).unwrap(), e);
    }
}
