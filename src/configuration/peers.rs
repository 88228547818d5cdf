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

//! Peer operations of a configuration.
//!
//! With the interface up, peers are changed through `set` and the file is
//! rewritten by `-quick save`. With the interface down, the file is edited
//! directly.

use super::addresses::{available, host_addresses, parse_cidr_list, within};
use super::peer::{self, NewPeer, PeerUpdate};
use super::{now, Configuration};
use crate::conf_file::{ConfFile, PeerSection};
use crate::cps::Patterns;
use crate::error::{Error, Result};
use crate::keys::{derive_public_key, generate_private_key, is_valid_key};
use crate::peer_store::{Peer, PeerSet};
use crate::tools::QuickAction;
use crate::types::{BatchResult, CounterKind, PeerStatus};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

fn not_running(name: &str) -> Error {
    Error::validation(format!("configuration {} is not running", name))
}

fn section_of(p: &Peer) -> PeerSection {
    PeerSection {
        public_key: p.id.clone(),
        preshared_key: p.preshared_key.clone(),
        allowed_ips: p.allowed_ip.clone(),
        name: p.name.clone(),
        ..PeerSection::default()
    }
}

impl Configuration {
    /// Host addresses that are taken: the interface's own and those of
    /// active and restricted peers, except `except`.
    fn used_addresses(&self, except: Option<&str>) -> HashSet<IpAddr> {
        let mut used: HashSet<IpAddr> = host_addresses(&self.settings().address).into_iter().collect();
        for set in [PeerSet::Active, PeerSet::Restricted] {
            for p in self.store.list(set) {
                if Some(p.id.as_str()) != except {
                    used.extend(host_addresses(&p.allowed_ip));
                }
            }
        }
        used
    }

    pub fn available_ips(&self, all: bool) -> Result<Vec<String>> {
        let networks = parse_cidr_list(&self.settings().address)?;
        Ok(available(&networks, &self.used_addresses(None), all))
    }

    /// Check `allowed_ip` against the configuration's networks and the
    /// addresses in `used`.
    fn check_allowed_ip(&self, allowed_ip: &str, used: &HashSet<IpAddr>) -> Result<()> {
        let networks = parse_cidr_list(&self.settings().address)?;
        let allowed = parse_cidr_list(allowed_ip)?;
        if allowed.is_empty() {
            return Err(Error::validation("allowed IPs must not be empty"));
        }
        if !within(&networks, &allowed) {
            return Err(Error::validation(format!(
                "allowed IPs {} are outside of {}",
                allowed_ip,
                self.settings().address
            )));
        }
        for a in allowed {
            if used.contains(&a.addr()) {
                return Err(Error::AlreadyExists(format!("allowed IP {}", a)));
            }
        }
        Ok(())
    }

    async fn prepare_peer(&self, new: NewPeer, used: &mut HashSet<IpAddr>) -> Result<Peer> {
        let tools = &self.ctx.tools;
        let public_key = new.public_key.trim().to_string();
        let private_key = new.private_key.trim().to_string();
        let (public_key, private_key) = match (public_key.is_empty(), private_key.is_empty()) {
            (true, true) => {
                let sk = generate_private_key(tools)
                    .await
                    .ok_or_else(|| Error::validation("failed to generate private key"))?;
                let pk = derive_public_key(tools, &sk)
                    .await
                    .ok_or_else(|| Error::validation("failed to derive public key"))?;
                (pk, sk)
            }
            (true, false) => {
                if !is_valid_key(&private_key) {
                    return Err(Error::validation("private key format is incorrect"));
                }
                let pk = derive_public_key(tools, &private_key)
                    .await
                    .ok_or_else(|| Error::validation("failed to derive public key"))?;
                (pk, private_key)
            }
            (false, true) => (public_key, private_key),
            (false, false) => {
                if derive_public_key(tools, &private_key).await.as_deref() != Some(public_key.as_str()) {
                    return Err(Error::validation("private key does not match public key"));
                }
                (public_key, private_key)
            }
        };
        if !is_valid_key(&public_key) {
            return Err(Error::validation("public key format is incorrect"));
        }
        if self.store.find(&public_key)?.is_some() {
            return Err(Error::AlreadyExists(format!("peer {}", public_key)));
        }
        peer::validate_preshared_key(new.preshared_key.trim())?;

        let allowed_ip = if new.allowed_ips.is_empty() {
            let networks = parse_cidr_list(&self.settings().address)?;
            let picked: Vec<String> = networks
                .iter()
                .filter_map(|n| available(&[*n], used, false).into_iter().next())
                .collect();
            if picked.is_empty() {
                return Err(Error::validation("no available IP address"));
            }
            picked.join(", ")
        } else {
            let joined = new.allowed_ips.join(", ");
            self.check_allowed_ip(&joined, used)?;
            joined
        };
        used.extend(host_addresses(&allowed_ip));

        let defaults = &self.ctx.config.peers;
        let dns = new.dns.unwrap_or_else(|| defaults.dns.clone());
        peer::validate_dns(&dns)?;
        let endpoint_allowed_ip = new
            .endpoint_allowed_ip
            .unwrap_or_else(|| defaults.endpoint_allowed_ip.clone());
        peer::validate_endpoint_allowed_ip(&endpoint_allowed_ip)?;
        let mtu = new.mtu.unwrap_or_else(|| defaults.mtu.into());
        peer::validate_mtu(mtu)?;
        let keepalive = new.keepalive.unwrap_or_else(|| defaults.keepalive.into());
        peer::validate_keepalive(keepalive)?;
        let cps_patterns = if self.protocol().is_obfuscated() {
            peer::normalize_cps(&new.cps_patterns)?
        } else {
            Patterns::default()
        };

        let mut p = Peer {
            id: public_key,
            name: new.name.trim().into(),
            private_key,
            preshared_key: new.preshared_key.trim().into(),
            allowed_ip,
            dns,
            endpoint_allowed_ip,
            mtu,
            keepalive,
            remote_endpoint: defaults.remote_endpoint.clone(),
            cps_patterns,
            ..Peer::default()
        };
        p.derive_addresses();
        Ok(p)
    }

    /// `-quick save`, then put back the `#Name#` comments the tool drops.
    pub(crate) async fn save_locked(&self) -> Result<()> {
        self.ctx
            .tools
            .quick(self.protocol(), QuickAction::Save, self.name())
            .await?;
        let mut conf = self.read_file()?;
        conf.set_peer_names(&self.peer_names(None));
        self.write_file(&conf)
    }

    fn peer_names(&self, changed: Option<(&str, &str)>) -> HashMap<String, String> {
        let mut names: HashMap<String, String> = self
            .store
            .list(PeerSet::Active)
            .into_iter()
            .map(|p| (p.id, p.name))
            .collect();
        if let Some((id, name)) = changed {
            names.insert(id.into(), name.into());
        }
        names.retain(|_, n| !n.is_empty());
        names
    }

    async fn save_after_batch(&self, result: &BatchResult) {
        if result.succeeded.is_empty() {
            return;
        }
        if let Err(e) = self.save_locked().await {
            warn!("{}: failed to save configuration: {}", self.name(), e);
        }
    }

    async fn set_in_kernel(&self, p: &Peer) -> Result<()> {
        self.ctx
            .tools
            .set_peer(
                self.protocol(),
                self.name(),
                &p.id,
                &p.allowed_ip,
                Some(&p.preshared_key),
            )
            .await
    }

    pub async fn add_peers(&self, peers: Vec<NewPeer>) -> Result<BatchResult> {
        let _serial = self.serial.lock().await;
        let mut result = BatchResult::default();
        let mut used = self.used_addresses(None);
        let mut seen = HashSet::new();
        let mut prepared = Vec::new();
        for new in peers {
            let label = if new.public_key.is_empty() {
                new.name.clone()
            } else {
                new.public_key.clone()
            };
            if !new.public_key.is_empty() && !seen.insert(new.public_key.clone()) {
                result.fail(label, Error::AlreadyExists(format!("peer {}", new.public_key)));
                continue;
            }
            match self.prepare_peer(new, &mut used).await {
                Ok(p) => prepared.push(p),
                Err(e) => result.fail(label, e),
            }
        }
        if prepared.is_empty() {
            return Ok(result);
        }
        self.store.bulk_insert(PeerSet::Active, &prepared)?;

        if self.is_up() {
            for p in &prepared {
                info!("{}: adding peer {}", self.name(), p.id);
                match self.set_in_kernel(p).await {
                    Ok(()) => result.ok(&p.id),
                    Err(e) => {
                        self.store.delete(PeerSet::Active, &p.id)?;
                        result.fail(&p.id, e);
                    }
                }
            }
            self.save_after_batch(&result).await;
        } else {
            let mut conf = self.read_file()?;
            for p in &prepared {
                info!("{}: adding peer {} to the config file", self.name(), p.id);
                conf.append_peer(&section_of(p));
            }
            if let Err(e) = self.write_file(&conf) {
                for p in &prepared {
                    self.store.delete(PeerSet::Active, &p.id)?;
                }
                return Err(e);
            }
            for p in &prepared {
                result.ok(&p.id);
            }
        }
        Ok(result)
    }

    /// Remove peers from the interface, keeping them in the restricted set.
    pub async fn restrict_peers<S: AsRef<str>>(&self, ids: &[S]) -> Result<BatchResult> {
        let _serial = self.serial.lock().await;
        if !self.is_up() {
            return Err(not_running(self.name()));
        }
        let mut result = BatchResult::default();
        for id in ids.iter().map(AsRef::as_ref) {
            let p = match self.store.get(PeerSet::Active, id)? {
                Some(p) => p,
                None => {
                    result.fail(id, Error::NotFound(format!("peer {}", id)));
                    continue;
                }
            };
            info!("{}: restricting peer {}", self.name(), id);
            if let Err(e) = self
                .ctx
                .tools
                .remove_peer(self.protocol(), self.name(), id)
                .await
            {
                result.fail(id, e);
                continue;
            }
            let moved = self
                .store
                .move_peer(id, PeerSet::Active, PeerSet::Restricted)
                .and_then(|_| {
                    self.store
                        .update(PeerSet::Restricted, id, |p| p.status = PeerStatus::Stopped)
                });
            match moved {
                Ok(_) => {
                    if let Err(e) = self.store.record_transfer(&p, now()) {
                        warn!("{}: failed to record transfer of {}: {}", self.name(), id, e);
                    }
                    result.ok(id);
                }
                Err(e) => result.fail(id, e),
            }
        }
        self.save_after_batch(&result).await;
        Ok(result)
    }

    /// Put restricted peers back on the interface.
    pub async fn allow_access_peers<S: AsRef<str>>(&self, ids: &[S]) -> Result<BatchResult> {
        let _serial = self.serial.lock().await;
        if !self.is_up() {
            return Err(not_running(self.name()));
        }
        let mut result = BatchResult::default();
        for id in ids.iter().map(AsRef::as_ref) {
            let p = match self.store.move_peer(id, PeerSet::Restricted, PeerSet::Active) {
                Ok(p) => p,
                Err(e) => {
                    result.fail(id, e);
                    continue;
                }
            };
            info!("{}: allowing peer {}", self.name(), id);
            match self.set_in_kernel(&p).await {
                Ok(()) => result.ok(id),
                Err(e) => {
                    self.store
                        .move_peer(id, PeerSet::Active, PeerSet::Restricted)?;
                    result.fail(id, e);
                }
            }
        }
        self.save_after_batch(&result).await;
        Ok(result)
    }

    /// Remove peers for good. Their rows are archived in the deleted set.
    pub async fn delete_peers<S: AsRef<str>>(&self, ids: &[S]) -> Result<BatchResult> {
        let _serial = self.serial.lock().await;
        let up = self.is_up();
        let mut result = BatchResult::default();
        let mut targets = Vec::new();
        for id in ids.iter().map(AsRef::as_ref) {
            match self.store.find(id)? {
                Some(found) => targets.push(found),
                None => result.fail(id, Error::NotFound(format!("peer {}", id))),
            }
        }

        let mut removed = Vec::new();
        if up {
            for (set, p) in targets {
                info!("{}: deleting peer {}", self.name(), p.id);
                if set == PeerSet::Active {
                    if let Err(e) = self
                        .ctx
                        .tools
                        .remove_peer(self.protocol(), self.name(), &p.id)
                        .await
                    {
                        result.fail(&p.id, e);
                        continue;
                    }
                    if p.has_rate_limit() {
                        if let Err(e) = self.clear_shaping(&p).await {
                            warn!("{}: failed to remove rate limit of {}: {}", self.name(), p.id, e);
                        }
                    }
                }
                removed.push((set, p));
            }
        } else {
            let mut conf = self.read_file()?;
            for (_, p) in &targets {
                info!("{}: deleting peer {} from the config file", self.name(), p.id);
                conf.remove_peer(&p.id);
            }
            self.write_file(&conf)?;
            removed = targets;
        }

        for (set, p) in removed {
            let archived = self
                .store
                .record_transfer(&p, now())
                .and_then(|_| self.store.delete(set, &p.id))
                .and_then(|_| self.store.insert(PeerSet::Deleted, &p));
            match archived {
                Ok(()) => result.ok(&p.id),
                Err(e) => result.fail(&p.id, e),
            }
        }
        if up {
            self.save_after_batch(&result).await;
        }
        Ok(result)
    }

    /// Apply new settings to one peer. All or nothing.
    pub async fn update_peer(&self, update: PeerUpdate) -> Result<Peer> {
        let _serial = self.serial.lock().await;
        let (set, old) = self
            .store
            .find(&update.id)?
            .ok_or_else(|| Error::NotFound(format!("peer {}", update.id)))?;

        let allowed_ip = update.allowed_ip.trim().to_string();
        self.check_allowed_ip(&allowed_ip, &self.used_addresses(Some(update.id.as_str())))?;
        peer::validate_endpoint_allowed_ip(&update.endpoint_allowed_ip)?;
        peer::validate_dns(&update.dns)?;
        peer::validate_mtu(update.mtu)?;
        peer::validate_keepalive(update.keepalive)?;
        peer::validate_preshared_key(update.preshared_key.trim())?;
        let private_key = update.private_key.trim().to_string();
        if !private_key.is_empty()
            && derive_public_key(&self.ctx.tools, &private_key).await.as_deref() != Some(update.id.as_str())
        {
            return Err(Error::validation("private key does not match public key"));
        }
        let cps_patterns = if self.protocol().is_obfuscated() {
            peer::normalize_cps(&update.cps_patterns)?
        } else {
            Patterns::default()
        };

        let mut new = old.clone();
        new.name = update.name.trim().into();
        new.private_key = private_key;
        new.preshared_key = update.preshared_key.trim().into();
        new.allowed_ip = allowed_ip;
        new.dns = update.dns.trim().into();
        new.endpoint_allowed_ip = update.endpoint_allowed_ip.trim().into();
        new.mtu = update.mtu;
        new.keepalive = update.keepalive;
        new.cps_patterns = cps_patterns;
        new.derive_addresses();

        if set == PeerSet::Active {
            if self.is_up() {
                info!("{}: updating peer {}", self.name(), new.id);
                if !old.preshared_key.is_empty() && new.preshared_key.is_empty() {
                    // `set` cannot unset a preshared key.
                    self.ctx
                        .tools
                        .remove_peer(self.protocol(), self.name(), &new.id)
                        .await?;
                }
                self.set_in_kernel(&new).await?;
                self.store.insert(set, &new)?;
                self.save_locked().await?;
            } else {
                info!("{}: updating peer {} in the config file", self.name(), new.id);
                let mut conf = self.read_file()?;
                conf.set_peer_value(&new.id, "AllowedIPs", &new.allowed_ip);
                conf.set_peer_value(&new.id, "PresharedKey", &new.preshared_key);
                conf.set_peer_names(&self.peer_names(Some((&new.id, &new.name))));
                self.write_file(&conf)?;
                self.store.insert(set, &new)?;
            }
        } else {
            self.store.insert(set, &new)?;
        }
        Ok(new)
    }

    /// Clear counters of a peer. A running peer is re-added so the kernel
    /// counters start over too.
    pub async fn reset_peer_data(&self, id: &str, kind: CounterKind) -> Result<Peer> {
        let _serial = self.serial.lock().await;
        let p = self.store.reset_counters(id, kind)?;
        if self.is_up() {
            self.ctx
                .tools
                .remove_peer(self.protocol(), self.name(), id)
                .await?;
            self.set_in_kernel(&p).await?;
        }
        info!("{}: reset {:?} data of peer {}", self.name(), kind, id);
        Ok(p)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::spec;
    use super::*;
    use crate::testing::{TestEnv, KEY_A, KEY_B, KEY_C, PSK};
    use std::sync::Arc;

    fn file_peer_ids(conf: &ConfFile) -> Vec<String> {
        conf.peers().into_iter().map(|p| p.public_key).collect()
    }

    async fn running(env: &TestEnv) -> Arc<Configuration> {
        let core = env.core().await;
        let c = core
            .create_configuration(spec("wg-a", "10.9.0.1/24", 51820))
            .await
            .unwrap();
        c.toggle().await.unwrap();
        env.clear_calls();
        c
    }

    #[tokio::test]
    async fn create_and_add() {
        let env = TestEnv::new();
        let core = env.core().await;
        let c = core
            .create_configuration(spec("wg-a", "10.9.0.1/24", 51820))
            .await
            .unwrap();
        let r = c
            .add_peers(vec![NewPeer::with_key(KEY_A, &["10.9.0.2/32"])])
            .await
            .unwrap();
        assert!(r.is_complete());

        let conf = ConfFile::parse(&env.read_conf("wg-a")).unwrap();
        let keys: Vec<_> = conf.interface_entries().into_iter().map(|e| e.0).collect();
        assert_eq!(keys, ["PrivateKey", "Address", "ListenPort", "SaveConfig"]);
        assert_eq!(
            conf.peers(),
            vec![PeerSection {
                public_key: KEY_A.into(),
                allowed_ips: "10.9.0.2/32".into(),
                ..PeerSection::default()
            }]
        );

        let p = c.store().get(PeerSet::Active, KEY_A).unwrap().unwrap();
        assert_eq!(p.allowed_ip, "10.9.0.2/32");
        assert_eq!(p.status, PeerStatus::Stopped);
    }

    #[tokio::test]
    async fn add_while_running_goes_through_set_and_save() {
        let env = TestEnv::new();
        let c = running(&env).await;
        let mut named = NewPeer::with_key(KEY_A, &["10.9.0.2/32"]);
        named.name = "laptop".into();
        named.preshared_key = PSK.into();
        let r = c.add_peers(vec![named]).await.unwrap();
        assert!(r.is_complete());
        let calls = env.calls();
        assert!(calls[0].starts_with(&format!(
            "wg set wg-a peer {} allowed-ips 10.9.0.2/32 preshared-key ",
            KEY_A
        )));
        assert_eq!(calls[1], "wg-quick save wg-a");
    }

    #[tokio::test]
    async fn add_allocates_and_rejects() {
        let env = TestEnv::new();
        let core = env.core().await;
        let c = core
            .create_configuration(spec("wg-a", "10.9.0.1/30", 51820))
            .await
            .unwrap();
        let r = c
            .add_peers(vec![
                NewPeer::with_key(KEY_A, &[]),
                NewPeer::with_key(KEY_B, &[]),
                NewPeer::with_key(KEY_C, &["10.9.1.2/32"]),
                NewPeer::with_key("bogus", &["10.9.0.2/32"]),
            ])
            .await
            .unwrap();
        assert_eq!(r.succeeded, vec![KEY_A.to_string()]);
        assert_eq!(r.failed.len(), 3);
        let p = c.store().get(PeerSet::Active, KEY_A).unwrap().unwrap();
        assert_eq!(p.allowed_ip, "10.9.0.2/32");
        assert_eq!(p.keepalive, 21);

        let again = c
            .add_peers(vec![NewPeer::with_key(KEY_A, &["10.9.0.2/32"])])
            .await
            .unwrap();
        assert!(again.succeeded.is_empty());
        assert!(c.available_ips(false).unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_generates_keys() {
        let env = TestEnv::new();
        let core = env.core().await;
        let c = core
            .create_configuration(spec("wg-a", "10.9.0.1/24", 51820))
            .await
            .unwrap();
        let r = c.add_peers(vec![NewPeer::default()]).await.unwrap();
        assert_eq!(r.succeeded.len(), 1);
        let p = c.store().get(PeerSet::Active, &r.succeeded[0]).unwrap().unwrap();
        assert!(!p.private_key.is_empty());
        assert_eq!(p.allowed_ip, "10.9.0.2/32");
    }

    #[tokio::test]
    async fn failed_set_leaves_no_row() {
        let env = TestEnv::new();
        let c = running(&env).await;
        env.fail("set");
        let r = c
            .add_peers(vec![NewPeer::with_key(KEY_A, &["10.9.0.2/32"])])
            .await
            .unwrap();
        assert_eq!(r.failed.len(), 1);
        assert!(c.store().find(KEY_A).unwrap().is_none());
        assert!(!env.calls().iter().any(|c| c.contains("save")));
    }

    #[tokio::test]
    async fn restrict_and_allow_are_inverse() {
        let env = TestEnv::new();
        let c = running(&env).await;
        c.add_peers(vec![
            NewPeer::with_key(KEY_A, &["10.9.0.2/32"]),
            NewPeer::with_key(KEY_B, &["10.9.0.3/32"]),
        ])
        .await
        .unwrap();
        let before = c.store().get(PeerSet::Active, KEY_A).unwrap().unwrap();

        let r = c.restrict_peers(&[KEY_A, KEY_C]).await.unwrap();
        assert_eq!(r.succeeded, vec![KEY_A.to_string()]);
        assert_eq!(r.failed[0].0, KEY_C);
        assert!(c.store().get(PeerSet::Active, KEY_A).unwrap().is_none());
        assert!(c.store().get(PeerSet::Restricted, KEY_A).unwrap().is_some());
        assert!(env
            .calls()
            .contains(&format!("wg set wg-a peer {} remove", KEY_A)));
        // Restricted addresses stay reserved.
        assert!(!c.available_ips(false).unwrap().contains(&"10.9.0.2/32".to_string()));

        let r = c.allow_access_peers(&[KEY_A]).await.unwrap();
        assert!(r.is_complete());
        assert!(c.store().get(PeerSet::Restricted, KEY_A).unwrap().is_none());
        assert_eq!(c.store().get(PeerSet::Active, KEY_A).unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn restrict_needs_running_interface() {
        let env = TestEnv::new();
        let core = env.core().await;
        let c = core
            .create_configuration(spec("wg-a", "10.9.0.1/24", 51820))
            .await
            .unwrap();
        assert!(matches!(
            c.restrict_peers(&[KEY_A]).await,
            Err(Error::ValidationFailed(_))
        ));
    }

    #[tokio::test]
    async fn delete_archives_rows() {
        let env = TestEnv::new();
        let c = running(&env).await;
        c.add_peers(vec![
            NewPeer::with_key(KEY_A, &["10.9.0.2/32"]),
            NewPeer::with_key(KEY_B, &["10.9.0.3/32"]),
        ])
        .await
        .unwrap();
        c.restrict_peers(&[KEY_B]).await.unwrap();
        let r = c.delete_peers(&[KEY_A, KEY_B, KEY_C]).await.unwrap();
        assert_eq!(r.succeeded.len(), 2);
        assert_eq!(r.failed.len(), 1);
        assert!(c.store().find(KEY_A).unwrap().is_none());
        assert!(c.store().find(KEY_B).unwrap().is_none());
        assert!(c.store().get(PeerSet::Deleted, KEY_A).unwrap().is_some());
        assert_eq!(c.store().transfer_history(KEY_A).len(), 1);
    }

    #[tokio::test]
    async fn offline_edits_touch_the_file() {
        let env = TestEnv::new();
        let core = env.core().await;
        let c = core
            .create_configuration(spec("wg-a", "10.9.0.1/24", 51820))
            .await
            .unwrap();
        c.add_peers(vec![
            NewPeer::with_key(KEY_A, &["10.9.0.2/32"]),
            NewPeer::with_key(KEY_B, &["10.9.0.3/32"]),
        ])
        .await
        .unwrap();

        let mut u = PeerUpdate {
            id: KEY_A.into(),
            name: "phone".into(),
            allowed_ip: "10.9.0.3/32".into(),
            endpoint_allowed_ip: "0.0.0.0/0".into(),
            mtu: 1420,
            keepalive: 25,
            ..PeerUpdate::default()
        };
        assert!(matches!(
            c.update_peer(u.clone()).await,
            Err(Error::AlreadyExists(_))
        ));
        u.allowed_ip = "10.9.0.9/32".into();
        u.mtu = 1500;
        assert!(matches!(
            c.update_peer(u.clone()).await,
            Err(Error::ValidationFailed(_))
        ));
        u.mtu = 1420;
        let p = c.update_peer(u).await.unwrap();
        assert_eq!(p.address_v4, "10.9.0.9/32");
        assert_eq!(p.keepalive, 25);

        let conf = ConfFile::parse(&env.read_conf("wg-a")).unwrap();
        let a = conf.peers().into_iter().find(|s| s.public_key == KEY_A).unwrap();
        assert_eq!(a.allowed_ips, "10.9.0.9/32");
        assert_eq!(a.name, "phone");
        assert!(env.calls().iter().all(|c| !c.contains(" set ")));

        c.delete_peers(&[KEY_B]).await.unwrap();
        assert_eq!(file_peer_ids(&c.read_file().unwrap()), vec![KEY_A.to_string()]);
    }

    #[tokio::test]
    async fn save_keeps_names() {
        let env = TestEnv::new();
        let c = running(&env).await;
        let mut named = NewPeer::with_key(KEY_A, &["10.9.0.2/32"]);
        named.name = "laptop".into();
        c.add_peers(vec![named]).await.unwrap();
        // The stub's save leaves the file as is, the names come from the store.
        let conf = c.read_file().unwrap();
        assert_eq!(conf.peers().len(), 0);
        let mut with_peer = conf.clone();
        with_peer.append_peer(&PeerSection {
            public_key: KEY_A.into(),
            allowed_ips: "10.9.0.2/32".into(),
            ..PeerSection::default()
        });
        c.write_file(&with_peer).unwrap();
        let _serial = c.serial.lock().await;
        c.save_locked().await.unwrap();
        assert_eq!(c.read_file().unwrap().peers()[0].name, "laptop");
    }

    #[tokio::test]
    async fn reset_re_adds_running_peer() {
        let env = TestEnv::new();
        let c = running(&env).await;
        c.add_peers(vec![NewPeer::with_key(KEY_A, &["10.9.0.2/32"])])
            .await
            .unwrap();
        c.store()
            .update(PeerSet::Active, KEY_A, |p| {
                p.total_sent = 2.;
                p.cumu_sent = 3.;
                p.total_receive = 1.;
            })
            .unwrap();
        env.clear_calls();
        let p = c.reset_peer_data(KEY_A, CounterKind::Sent).await.unwrap();
        assert_eq!((p.total_sent, p.cumu_sent, p.total_receive), (0., 0., 1.));
        let calls = env.calls();
        assert_eq!(calls[0], format!("wg set wg-a peer {} remove", KEY_A));
        assert!(calls[1].starts_with(&format!("wg set wg-a peer {} allowed-ips", KEY_A)));
    }
}
