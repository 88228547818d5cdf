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

//! One tunnel: its config file, its peer store tables and the live
//! interface, kept in sync.

pub mod addresses;
mod export;
pub mod peer;
mod peers;

pub use export::PeerExport;
pub use peer::{NewPeer, PeerUpdate};

use crate::backup::{referenced_scripts, BackupInfo};
use crate::conf_file::{ConfFile, CPS_KEYS, OBFUSCATION_KEYS};
use crate::core::Context;
use crate::cps::format::{normalize, scramble, scramble_seed};
use crate::cps::{CpsAdaptation, Patterns};
use crate::error::{Error, Result};
use crate::keys::{generate_private_key, is_valid_key, KeyStore};
use crate::peer_store::{Peer, PeerSet, PeerStore, TABLE_SUFFIXES};
use crate::tools::QuickAction;
use crate::types::{PeerStatus, Protocol};
use crate::utils::{atomic_write, is_valid_name, split_list};
use chrono::NaiveDateTime;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Table of per-configuration settings that the config file does not carry.
pub const INFO_TABLE: &str = "@configuration_info";

const CONF_MODE: u32 = 0o600;
const SCRIPT_MODE: u32 = 0o755;

pub(crate) fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// `[Interface]` settings of a configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct InterfaceSettings {
    pub private_key: String,
    pub address: String,
    pub listen_port: Option<u16>,
    #[serde(rename = "DNS")]
    pub dns: String,
    pub table: String,
    #[serde(rename = "MTU")]
    pub mtu: Option<u32>,
    pub pre_up: String,
    pub post_up: String,
    pub pre_down: String,
    pub post_down: String,
    /// `Jc..H4`.
    pub obfuscation: BTreeMap<String, String>,
    /// Base (normalized, unscrambled) `I1..I5`.
    pub cps_patterns: Patterns,
}

impl InterfaceSettings {
    pub fn from_conf(conf: &ConfFile) -> InterfaceSettings {
        let get = |k: &str| conf.interface_value(k).unwrap_or_default().to_string();
        InterfaceSettings {
            private_key: get("PrivateKey"),
            address: get("Address"),
            listen_port: conf.interface_value("ListenPort").and_then(|p| p.parse().ok()),
            dns: get("DNS"),
            table: get("Table"),
            mtu: conf.interface_value("MTU").and_then(|m| m.parse().ok()),
            pre_up: get("PreUp"),
            post_up: get("PostUp"),
            pre_down: get("PreDown"),
            post_down: get("PostDown"),
            obfuscation: OBFUSCATION_KEYS
                .iter()
                .filter_map(|k| conf.interface_value(k).map(|v| (k.to_string(), v.to_string())))
                .collect(),
            cps_patterns: Patterns::default(),
        }
    }

    pub fn protocol(&self) -> Protocol {
        if self.obfuscation.values().any(|v| !v.trim().is_empty()) {
            Protocol::Obfuscated
        } else {
            Protocol::Plain
        }
    }

    /// Entries of a fresh `[Interface]` section, without `I1..I5`.
    fn entries(&self) -> Vec<(&'static str, String)> {
        let mut v = vec![
            ("PrivateKey", self.private_key.clone()),
            ("Address", self.address.clone()),
            (
                "ListenPort",
                self.listen_port.map(|p| p.to_string()).unwrap_or_default(),
            ),
            ("DNS", self.dns.clone()),
            ("Table", self.table.clone()),
            ("MTU", self.mtu.map(|m| m.to_string()).unwrap_or_default()),
            ("PreUp", self.pre_up.clone()),
            ("PostUp", self.post_up.clone()),
            ("PreDown", self.pre_down.clone()),
            ("PostDown", self.post_down.clone()),
            ("SaveConfig", "true".into()),
        ];
        for k in OBFUSCATION_KEYS {
            if let Some(value) = self.obfuscation.get(k) {
                v.push((k, value.clone()));
            }
        }
        v
    }

    pub fn validate(&self) -> Result<()> {
        if !self.private_key.is_empty() && !is_valid_key(&self.private_key) {
            return Err(Error::validation("private key format is incorrect"));
        }
        if addresses::parse_cidr_list(&self.address)?.is_empty() {
            return Err(Error::validation("address must not be empty"));
        }
        if !self.dns.is_empty() {
            peer::validate_dns(&self.dns)?;
        }
        for (k, v) in &self.obfuscation {
            if !OBFUSCATION_KEYS.contains(&k.as_str()) {
                return Err(Error::validation(format!("unknown obfuscation parameter {}", k)));
            }
            if v.trim().parse::<u64>().is_err() {
                return Err(Error::validation(format!("{} must be a non-negative integer", k)));
            }
        }
        Ok(())
    }
}

/// A configuration to create.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConfigurationSpec {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(flatten)]
    pub settings: InterfaceSettings,
    /// Restore this backup of `name` instead of writing a fresh file.
    #[serde(rename = "Backup")]
    pub backup: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigurationInfo {
    pub cps_patterns: Patterns,
    /// Library pattern ids the base patterns came from, if any.
    pub cps_library_ids: Patterns,
    pub autostart: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigurationSummary {
    pub name: String,
    pub protocol: Protocol,
    pub status: bool,
    pub autostart: bool,
    pub public_key: String,
    pub address: String,
    pub listen_port: Option<u16>,
    pub active_peers: usize,
    pub restricted_peers: usize,
    pub running_peers: usize,
    pub total_receive: f64,
    pub total_sent: f64,
    pub total_data: f64,
}

#[derive(Debug, Default)]
struct State {
    settings: InterfaceSettings,
    keys: KeyStore,
    info: ConfigurationInfo,
}

pub struct Configuration {
    pub(crate) ctx: Arc<Context>,
    name: String,
    protocol: Protocol,
    path: PathBuf,
    state: RwLock<State>,
    pub(crate) store: PeerStore,
    pub(crate) adaptation: CpsAdaptation,
    /// Held by every mutation, across tool invocations.
    pub(crate) serial: tokio::sync::Mutex<()>,
    pub(crate) rates: parking_lot::Mutex<crate::sampler::RateState>,
}

impl std::fmt::Debug for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configuration")
            .field("name", &self.name)
            .field("protocol", &self.protocol)
            .field("path", &self.path)
            .finish()
    }
}

fn read_conf(name: &str, path: &Path) -> Result<ConfFile> {
    let text = std::fs::read_to_string(path)?;
    ConfFile::parse(&text).map_err(|e| Error::invalid_config(name, e))
}

fn interface_seed(name: &str, k: usize) -> String {
    scramble_seed(name, "interface", k + 1)
}

/// `I_k` lines as written to the config file of `name`.
fn scrambled_lines(name: &str, base: &Patterns) -> Patterns {
    let mut out = Patterns::default();
    for (k, p) in base.iter().enumerate() {
        if !p.is_empty() {
            out[k] = scramble(p, &interface_seed(name, k));
        }
    }
    out
}

fn write_cps_lines(conf: &mut ConfFile, name: &str, base: &Patterns) {
    for (k, line) in scrambled_lines(name, base).iter().enumerate() {
        conf.set_interface(CPS_KEYS[k], line);
    }
}

impl Configuration {
    fn new(ctx: Arc<Context>, name: &str, protocol: Protocol, path: PathBuf) -> Configuration {
        Configuration {
            store: PeerStore::new(ctx.db.clone(), name),
            adaptation: CpsAdaptation::new(ctx.db.clone(), name),
            ctx,
            name: name.into(),
            protocol,
            path,
            state: RwLock::new(State::default()),
            serial: tokio::sync::Mutex::new(()),
            rates: parking_lot::Mutex::new(Default::default()),
        }
    }

    /// Load a configuration from its config file, adopting peers that the
    /// peer store does not know yet.
    pub async fn load(ctx: Arc<Context>, path: &Path) -> Result<Configuration> {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !is_valid_name(&name) {
            return Err(Error::invalid_config(&name, "invalid configuration name"));
        }
        let conf = read_conf(&name, path)?;
        let c = Configuration::new(ctx, &name, conf.protocol(), path.into());
        c.store.create_tables()?;
        c.refresh(&conf).await?;
        Ok(c)
    }

    /// Write a new config file (or restore a backup of the same name) and
    /// load it.
    pub async fn create(ctx: Arc<Context>, mut spec: ConfigurationSpec) -> Result<Configuration> {
        if !is_valid_name(&spec.name) {
            return Err(Error::validation(format!("invalid configuration name {:?}", spec.name)));
        }
        let name = spec.name.clone();
        if let Some(id) = spec.backup.take() {
            return Configuration::create_from_backup(ctx, &name, &id).await;
        }
        let settings = &mut spec.settings;
        if settings.private_key.is_empty() {
            settings.private_key = generate_private_key(&ctx.tools)
                .await
                .ok_or_else(|| Error::validation("failed to generate private key"))?;
        }
        settings.validate()?;
        let protocol = settings.protocol();
        let base = if protocol.is_obfuscated() {
            peer::normalize_cps(&settings.cps_patterns)?
        } else {
            Patterns::default()
        };
        let path = ctx.config.conf_dir(protocol).join(format!("{}.conf", name));
        if path.exists() {
            return Err(Error::AlreadyExists(format!("configuration {}", name)));
        }

        let entries = settings.entries();
        let entries: Vec<(&str, &str)> = entries.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let mut conf = ConfFile::with_interface(&entries);
        write_cps_lines(&mut conf, &name, &base);

        let store = PeerStore::new(ctx.db.clone(), &name);
        store.drop_tables()?;
        store.create_tables()?;
        ctx.db.put(
            INFO_TABLE,
            &name,
            &ConfigurationInfo {
                cps_patterns: base,
                ..ConfigurationInfo::default()
            },
        )?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        atomic_write(&path, conf.render().as_bytes(), CONF_MODE)?;
        info!("{}: created {} configuration", name, protocol);
        Configuration::load(ctx, &path).await
    }

    async fn create_from_backup(ctx: Arc<Context>, name: &str, id: &str) -> Result<Configuration> {
        let content = ctx.backups.load(name, id)?;
        let conf = ConfFile::parse(&content.conf).map_err(|e| Error::invalid_config(name, e))?;
        let path = ctx
            .config
            .conf_dir(conf.protocol())
            .join(format!("{}.conf", name));
        if path.exists() {
            return Err(Error::AlreadyExists(format!("configuration {}", name)));
        }
        let c = Configuration::new(ctx, name, conf.protocol(), path);
        c.restore_content(&conf, &content)?;
        c.refresh(&conf).await?;
        info!("{}: created from backup {}", name, id);
        Ok(c)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn store(&self) -> &PeerStore {
        &self.store
    }

    pub fn adaptation(&self) -> &CpsAdaptation {
        &self.adaptation
    }

    pub fn settings(&self) -> InterfaceSettings {
        self.state.read().settings.clone()
    }

    pub fn public_key(&self) -> String {
        self.state.read().keys.public_key().into()
    }

    pub fn info(&self) -> ConfigurationInfo {
        self.state.read().info.clone()
    }

    /// Whether the interface exists on the host.
    pub fn is_up(&self) -> bool {
        self.ctx.config.paths.interfaces_path.join(&self.name).exists()
    }

    pub fn autostart(&self) -> bool {
        self.state.read().info.autostart || self.ctx.config.general.autostart.contains(&self.name)
    }

    pub fn set_autostart(&self, autostart: bool) -> Result<()> {
        let mut info = self.info();
        info.autostart = autostart;
        self.ctx.db.put(INFO_TABLE, &self.name, &info)?;
        self.state.write().info = info;
        Ok(())
    }

    pub fn summary(&self) -> ConfigurationSummary {
        let active = self.store.list(PeerSet::Active);
        let settings = self.settings();
        let sum = |f: fn(&Peer) -> f64| active.iter().map(f).sum::<f64>();
        ConfigurationSummary {
            name: self.name.clone(),
            protocol: self.protocol,
            status: self.is_up(),
            autostart: self.autostart(),
            public_key: self.public_key(),
            address: settings.address,
            listen_port: settings.listen_port,
            active_peers: active.len(),
            restricted_peers: self.store.list(PeerSet::Restricted).len(),
            running_peers: active
                .iter()
                .filter(|p| p.status == PeerStatus::Running)
                .count(),
            total_receive: sum(|p| p.total_receive + p.cumu_receive),
            total_sent: sum(|p| p.total_sent + p.cumu_sent),
            total_data: sum(|p| p.total_data + p.cumu_data),
        }
    }

    pub(crate) fn read_file(&self) -> Result<ConfFile> {
        read_conf(&self.name, &self.path)
    }

    pub(crate) fn write_file(&self, conf: &ConfFile) -> Result<()> {
        atomic_write(&self.path, conf.render().as_bytes(), CONF_MODE)?;
        Ok(())
    }

    /// Re-read settings from the parsed file, reconcile the base CPS
    /// patterns and adopt unknown peers.
    async fn refresh(&self, conf: &ConfFile) -> Result<()> {
        let mut settings = InterfaceSettings::from_conf(conf);
        let stored: Option<ConfigurationInfo> = self.ctx.db.get_as(INFO_TABLE, &self.name)?;
        let mut info = stored.clone().unwrap_or_default();
        let expected = scrambled_lines(&self.name, &info.cps_patterns);
        for (k, key) in CPS_KEYS.iter().enumerate() {
            let in_file = conf.interface_value(key).unwrap_or_default();
            if in_file != expected[k] {
                // Edited outside of us: the file value becomes the new base.
                info.cps_patterns[k] = normalize(in_file);
                info.cps_library_ids[k].clear();
            }
        }
        if stored.as_ref() != Some(&info) {
            self.ctx.db.put(INFO_TABLE, &self.name, &info)?;
        }
        settings.cps_patterns = info.cps_patterns.clone();
        let keys = KeyStore::new(&self.ctx.tools, &settings.private_key).await;
        if keys.public_key().is_empty() {
            warn!("{}: could not derive the public key", self.name);
        }
        self.adopt_peers(conf)?;
        *self.state.write() = State {
            settings,
            keys,
            info,
        };
        Ok(())
    }

    fn adopt_peers(&self, conf: &ConfFile) -> Result<()> {
        let defaults = &self.ctx.config.peers;
        let mut adopted = Vec::new();
        for section in conf.peers() {
            if self.store.find(&section.public_key)?.is_some() {
                continue;
            }
            let mut p = Peer {
                id: section.public_key.clone(),
                name: section.name.clone(),
                preshared_key: section.preshared_key.clone(),
                allowed_ip: section.allowed_ips.clone(),
                dns: defaults.dns.clone(),
                endpoint_allowed_ip: defaults.endpoint_allowed_ip.clone(),
                mtu: defaults.mtu.into(),
                keepalive: defaults.keepalive.into(),
                remote_endpoint: defaults.remote_endpoint.clone(),
                ..Peer::default()
            };
            p.derive_addresses();
            adopted.push(p);
        }
        if !adopted.is_empty() {
            info!("{}: adopting {} peers from the config file", self.name, adopted.len());
            self.store.bulk_insert(PeerSet::Active, &adopted)?;
        }
        Ok(())
    }

    /// Bring the interface up or down. Returns the new status.
    pub async fn toggle(&self) -> Result<bool> {
        let _serial = self.serial.lock().await;
        if self.is_up() {
            self.down_locked().await?;
            Ok(false)
        } else {
            self.up_locked().await?;
            Ok(true)
        }
    }

    pub async fn start(&self) -> Result<()> {
        let _serial = self.serial.lock().await;
        if !self.is_up() {
            self.up_locked().await?;
        }
        Ok(())
    }

    pub(crate) async fn down_locked(&self) -> Result<()> {
        info!("{}: bringing interface down", self.name);
        self.ctx
            .tools
            .quick(self.protocol, QuickAction::Down, &self.name)
            .await?;
        let mut conf = self.read_file()?;
        if let Some(address) = conf.interface_value("Address").map(String::from) {
            let rewritten = addresses::rewrite_link_local(&self.name, &address);
            if rewritten != address {
                info!("{}: replacing link local address with {}", self.name, rewritten);
                conf.set_interface("Address", &rewritten);
                self.write_file(&conf)?;
                self.state.write().settings.address = rewritten;
            }
        }
        Ok(())
    }

    pub(crate) async fn up_locked(&self) -> Result<()> {
        if self.protocol.is_obfuscated() {
            self.adapt_cps_locked()?;
        }
        let conf = self.read_file()?;
        let address = conf.interface_value("Address").unwrap_or_default().to_string();

        info!("{}: bringing interface up", self.name);
        let started = Instant::now();
        let result = self
            .ctx
            .tools
            .quick(self.protocol, QuickAction::Up, &self.name)
            .await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.;
        if self.protocol.is_obfuscated() {
            self.record_cps_attempt(result.is_ok(), latency_ms);
        }
        result?;

        let v6: Vec<&str> = split_list(&address).filter(|a| a.contains(':')).collect();
        if !v6.is_empty() {
            if let Err(e) = self.ctx.tools.flush_ipv6(&self.name).await {
                warn!("{}: failed to flush IPv6 addresses: {}", self.name, e);
            }
            for a in v6 {
                if let Err(e) = self.ctx.tools.add_address(&self.name, a).await {
                    warn!("{}: failed to add address {}: {}", self.name, a, e);
                }
            }
        }
        Ok(())
    }

    fn record_cps_attempt(&self, success: bool, latency_ms: f64) {
        let info = self.info();
        if info.cps_patterns.iter().all(String::is_empty) {
            return;
        }
        let ids = if info.cps_library_ids.iter().any(|i| !i.is_empty()) {
            Some(&info.cps_library_ids)
        } else {
            None
        };
        if let Err(e) = self
            .adaptation
            .record(&info.cps_patterns, success, latency_ms, 0., ids, now())
        {
            warn!("{}: failed to record CPS attempt: {}", self.name, e);
        }
    }

    /// Replace poorly performing base patterns before bringing the interface
    /// up.
    fn adapt_cps_locked(&self) -> Result<()> {
        let info = self.info();
        if info.cps_patterns.iter().all(String::is_empty)
            || !self.adaptation.should_adapt(&info.cps_patterns)
        {
            return Ok(());
        }
        let s = self
            .adaptation
            .suggest_improved(&info.cps_patterns, self.ctx.library.as_ref());
        if s.patterns == info.cps_patterns {
            return Ok(());
        }
        info!("{}: switching to better performing CPS patterns", self.name);
        self.apply_cps_locked(&s.patterns, &s.library_ids)
    }

    /// Store new base `I1..I5` and write their scrambled lines.
    pub async fn set_cps_patterns(&self, patterns: &Patterns) -> Result<()> {
        if !self.protocol.is_obfuscated() {
            return Err(Error::validation("CPS patterns need an obfuscated configuration"));
        }
        let base = peer::normalize_cps(patterns)?;
        let _serial = self.serial.lock().await;
        self.apply_cps_locked(&base, &Patterns::default())
    }

    fn apply_cps_locked(&self, base: &Patterns, library_ids: &Patterns) -> Result<()> {
        let mut conf = self.read_file()?;
        write_cps_lines(&mut conf, &self.name, base);
        let mut info = self.info();
        info.cps_patterns = base.clone();
        info.cps_library_ids = library_ids.clone();
        self.ctx.db.put(INFO_TABLE, &self.name, &info)?;
        self.write_file(&conf)?;
        let mut state = self.state.write();
        state.settings.cps_patterns = base.clone();
        state.info = info;
        Ok(())
    }

    pub fn raw_file(&self) -> Result<String> {
        Ok(std::fs::read_to_string(&self.path)?)
    }

    /// Replace the config file. The interface is restarted with the new
    /// file; if that fails the previous file is put back and restarted.
    pub async fn update_raw_file(&self, text: &str) -> Result<()> {
        let conf = ConfFile::parse(text).map_err(|e| Error::invalid_config(&self.name, e))?;
        if conf.protocol() != self.protocol {
            return Err(Error::validation("the protocol of a configuration cannot change"));
        }
        let _serial = self.serial.lock().await;
        let snapshot = self.backup_locked()?;
        let previous = std::fs::read_to_string(&snapshot.conf_file)
            .map_err(|e| Error::backup(format!("failed to read snapshot: {}", e)))?;

        if self.is_up() {
            self.down_locked().await?;
        }
        atomic_write(&self.path, text.as_bytes(), CONF_MODE)?;
        if let Err(e) = self.up_locked().await {
            warn!("{}: new config file failed to start, restoring the previous one", self.name);
            atomic_write(&self.path, previous.as_bytes(), CONF_MODE)?;
            if let Err(e2) = self.up_locked().await {
                warn!("{}: previous config file failed to start: {}", self.name, e2);
            }
            return Err(e);
        }
        self.refresh(&conf).await
    }

    pub async fn backup(&self) -> Result<BackupInfo> {
        let _serial = self.serial.lock().await;
        self.backup_locked()
    }

    fn backup_locked(&self) -> Result<BackupInfo> {
        self.ctx.backups.backup(
            &self.store,
            &self.path,
            &self.ctx.config.paths.iptables_path,
            now(),
        )
    }

    pub fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        self.ctx.backups.list(&self.name)
    }

    pub fn delete_backup(&self, id: &str) -> Result<()> {
        self.ctx.backups.delete(&self.name, id)
    }

    pub fn export_backup(&self, id: &str, dest: &Path) -> Result<Vec<String>> {
        self.ctx.backups.export_archive(&self.name, id, dest)
    }

    /// Restore a backup over the current state. The current state is backed
    /// up first and the interface is left down.
    pub async fn restore(&self, id: &str) -> Result<()> {
        let _serial = self.serial.lock().await;
        let content = self.ctx.backups.load(&self.name, id)?;
        let conf = ConfFile::parse(&content.conf).map_err(|e| Error::invalid_config(&self.name, e))?;
        if conf.protocol() != self.protocol {
            return Err(Error::validation("backup has a different protocol"));
        }
        self.backup_locked()?;
        if self.is_up() {
            self.down_locked().await?;
        }
        self.restore_content(&conf, &content)?;
        self.refresh(&conf).await?;
        info!("{}: restored backup {}", self.name, id);
        Ok(())
    }

    fn restore_content(&self, conf: &ConfFile, content: &crate::backup::BackupContent) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        atomic_write(&self.path, content.conf.as_bytes(), CONF_MODE)?;
        self.store.drop_tables()?;
        self.store.create_tables()?;
        let name = &self.name;
        self.ctx.db.transaction(|tx| {
            for r in &content.records {
                let suffix = r.table.strip_prefix(name.as_str());
                match suffix {
                    Some(s) if TABLE_SUFFIXES.contains(&s) => {
                        tx.put_value(&r.table, &r.key, r.value.clone())
                    }
                    _ => warn!("{}: skipping backup record of table {}", name, r.table),
                }
            }
            Ok(())
        })?;
        self.store.migrate()?;
        for (key, path) in referenced_scripts(conf, &self.ctx.config.paths.iptables_path) {
            if let Some(script) = content.scripts.get(key) {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                atomic_write(&path, script.as_bytes(), SCRIPT_MODE)?;
                info!("{}: restored {}", name, path.display());
            }
        }
        Ok(())
    }

    /// Move the file and every table to `new_name`. The caller loads the
    /// renamed configuration.
    pub(crate) async fn rename_to(&self, new_name: &str) -> Result<PathBuf> {
        if !is_valid_name(new_name) {
            return Err(Error::validation(format!("invalid configuration name {:?}", new_name)));
        }
        let _serial = self.serial.lock().await;
        let new_path = self.path.with_file_name(format!("{}.conf", new_name));
        if new_path.exists() {
            return Err(Error::AlreadyExists(format!("configuration {}", new_name)));
        }
        if self.is_up() {
            self.down_locked().await?;
        }
        let mut conf = self.read_file()?;
        let info = self.info();
        write_cps_lines(&mut conf, new_name, &info.cps_patterns);
        self.store.copy_tables(new_name)?;
        self.ctx.db.put(INFO_TABLE, new_name, &info)?;
        atomic_write(&new_path, conf.render().as_bytes(), CONF_MODE)?;
        std::fs::remove_file(&self.path)?;
        self.store.drop_tables()?;
        self.ctx.db.remove(INFO_TABLE, &self.name)?;
        info!("{}: renamed to {}", self.name, new_name);
        Ok(new_path)
    }

    /// Bring down, remove the file and every table.
    pub(crate) async fn destroy(&self) -> Result<()> {
        let _serial = self.serial.lock().await;
        if self.is_up() {
            self.down_locked().await?;
        }
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => (),
        }
        self.store.drop_tables()?;
        self.ctx.db.remove(INFO_TABLE, &self.name)?;
        info!("{}: deleted", self.name);
        Ok(())
    }
}
