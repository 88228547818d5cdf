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

//! The registry of configurations, with the job scheduler and share links
//! that refer to them by name.

use crate::backup::BackupEngine;
use crate::cli::Config;
use crate::configuration::addresses::parse_cidr_list;
use crate::configuration::{now, Configuration, ConfigurationSpec, ConfigurationSummary};
use crate::cps::{JsonPatternLibrary, PatternLibrary, Suggestion};
use crate::db::Db;
use crate::error::{Error, Result};
use crate::jobs::JobScheduler;
use crate::peer_store::cleanup_orphans;
use crate::share::ShareLinks;
use crate::tools::Tools;
use crate::types::Protocol;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What every configuration shares.
pub struct Context {
    pub config: Config,
    pub tools: Tools,
    pub db: Arc<Db>,
    pub library: Arc<dyn PatternLibrary>,
    pub backups: BackupEngine,
}

pub struct Core {
    ctx: Arc<Context>,
    configurations: RwLock<BTreeMap<String, Arc<Configuration>>>,
    // Serializes create/delete/rename/rescan.
    admin: tokio::sync::Mutex<()>,
    jobs: JobScheduler,
    shares: ShareLinks,
}

impl Core {
    /// Load every configuration, then drop peer store tables no
    /// configuration owns.
    pub async fn open(config: Config) -> Result<Arc<Core>> {
        let db = Arc::new(Db::open(&config.paths.db_path)?);
        let ctx = Arc::new(Context {
            tools: Tools::new(&config.tools),
            library: Arc::new(JsonPatternLibrary::new(&config.paths.cps_library_path)),
            backups: BackupEngine::new(config.backup_root()),
            db: db.clone(),
            config,
        });
        let core = Arc::new(Core {
            jobs: JobScheduler::new(db.clone()),
            shares: ShareLinks::new(db.clone()),
            ctx,
            configurations: RwLock::new(BTreeMap::new()),
            admin: tokio::sync::Mutex::new(()),
        });
        core.rescan().await?;
        // A file that failed to parse still owns its tables.
        let names: Vec<String> = core
            .conf_files()?
            .iter()
            .filter_map(|p| p.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .collect();
        cleanup_orphans(&db, &names)?;
        Ok(core)
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn tools(&self) -> &Tools {
        &self.ctx.tools
    }

    pub fn backups(&self) -> &BackupEngine {
        &self.ctx.backups
    }

    pub fn jobs(&self) -> &JobScheduler {
        &self.jobs
    }

    pub fn shares(&self) -> &ShareLinks {
        &self.shares
    }

    pub fn get(&self, name: &str) -> Result<Arc<Configuration>> {
        self.configurations
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("configuration {}", name)))
    }

    /// Configurations ordered by name.
    pub fn list(&self) -> Vec<Arc<Configuration>> {
        self.configurations.read().values().cloned().collect()
    }

    pub fn summaries(&self) -> Vec<ConfigurationSummary> {
        self.list().iter().map(|c| c.summary()).collect()
    }

    /// Every `*.conf` in both config directories, parsable or not.
    fn conf_files(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for protocol in [Protocol::Plain, Protocol::Obfuscated] {
            let dir = self.ctx.config.conf_dir(protocol);
            let read_dir = match dir.read_dir() {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                r => r?,
            };
            for entry in read_dir {
                let path = entry?.path();
                if path.extension() == Some(OsStr::new("conf")) && path.is_file() {
                    found.push(path);
                }
            }
        }
        Ok(found)
    }

    /// Load config files that are not registered yet and forget those whose
    /// file is gone. Returns the newly loaded names.
    pub async fn rescan(&self) -> Result<Vec<String>> {
        let _admin = self.admin.lock().await;
        let found = self.conf_files()?;

        let gone: Vec<String> = self
            .configurations
            .read()
            .iter()
            .filter(|(_, c)| !c.path().exists())
            .map(|(n, _)| n.clone())
            .collect();
        for name in gone {
            info!("{}: config file is gone, forgetting it", name);
            self.configurations.write().remove(&name);
        }

        let mut loaded = Vec::new();
        for path in found {
            if self.is_registered_path(&path) {
                continue;
            }
            let stem = path.file_stem().unwrap_or_default().to_string_lossy();
            if self.configurations.read().contains_key(stem.as_ref()) {
                warn!(
                    "{}: ignoring {}, a configuration of that name is loaded",
                    stem,
                    path.display()
                );
                continue;
            }
            match Configuration::load(self.ctx.clone(), &path).await {
                Ok(c) => {
                    if let Err(e) = c.store().migrate() {
                        warn!("{}: peer store migration failed: {}", c.name(), e);
                    }
                    info!("{}: loaded {}", c.name(), path.display());
                    loaded.push(c.name().to_string());
                    self.configurations
                        .write()
                        .insert(c.name().to_string(), Arc::new(c));
                }
                Err(e) => warn!("skipping {}: {}", path.display(), e),
            }
        }
        Ok(loaded)
    }

    fn is_registered_path(&self, path: &Path) -> bool {
        self.configurations
            .read()
            .values()
            .any(|c| c.path() == path)
    }

    /// Bring up every configuration marked autostart.
    pub async fn autostart(&self) {
        for c in self.list().into_iter().filter(|c| c.autostart()) {
            info!("{}: autostart", c.name());
            if let Err(e) = c.start().await {
                warn!("{}: failed to start: {}", c.name(), e);
            }
        }
    }

    /// Name, listen port and address networks must all be unused.
    pub async fn create_configuration(&self, spec: ConfigurationSpec) -> Result<Arc<Configuration>> {
        let _admin = self.admin.lock().await;
        if self.configurations.read().contains_key(&spec.name) {
            return Err(Error::AlreadyExists(format!("configuration {}", spec.name)));
        }
        if spec.backup.is_none() {
            let networks = parse_cidr_list(&spec.settings.address)?;
            for c in self.list() {
                let s = c.settings();
                if spec.settings.listen_port.is_some() && s.listen_port == spec.settings.listen_port {
                    return Err(Error::AlreadyExists(format!(
                        "listen port {} used by {}",
                        s.listen_port.unwrap_or_default(),
                        c.name()
                    )));
                }
                let theirs = parse_cidr_list(&s.address).unwrap_or_default();
                let overlap = networks.iter().any(|a| {
                    theirs
                        .iter()
                        .any(|b| a.contains(&b.network()) || b.contains(&a.network()))
                });
                if overlap {
                    return Err(Error::AlreadyExists(format!(
                        "address {} overlaps {}",
                        spec.settings.address,
                        c.name()
                    )));
                }
            }
        }
        let c = Arc::new(Configuration::create(self.ctx.clone(), spec).await?);
        self.configurations
            .write()
            .insert(c.name().to_string(), c.clone());
        Ok(c)
    }

    pub async fn delete_configuration(&self, name: &str) -> Result<()> {
        let _admin = self.admin.lock().await;
        let c = self.get(name)?;
        c.destroy().await?;
        self.configurations.write().remove(name);
        let now = now();
        self.jobs.drop_configuration(name, now)?;
        self.shares.expire_all(name, now)?;
        Ok(())
    }

    /// Move a configuration with its tables, jobs and share links.
    pub async fn rename_configuration(&self, old: &str, new: &str) -> Result<Arc<Configuration>> {
        let _admin = self.admin.lock().await;
        if self.configurations.read().contains_key(new) {
            return Err(Error::AlreadyExists(format!("configuration {}", new)));
        }
        let c = self.get(old)?;
        let path = c.rename_to(new).await?;
        self.configurations.write().remove(old);
        let jobs = self.jobs.rename_configuration(old, new)?;
        let links = self.shares.rename_configuration(old, new)?;
        debug!("{}: moved {} jobs and {} share links", new, jobs, links);
        let renamed = Arc::new(Configuration::load(self.ctx.clone(), &path).await?);
        self.configurations
            .write()
            .insert(new.to_string(), renamed.clone());
        Ok(renamed)
    }

    /// Poll handshakes, transfer and endpoints of every running
    /// configuration.
    pub async fn sample_all(&self) {
        let swap = self.ctx.config.sampler.swap_detection;
        for c in self.list().into_iter().filter(|c| c.is_up()) {
            match c.sample(swap).await {
                Ok(rates) => debug!(
                    "{}: sent {:.0} bit/s, received {:.0} bit/s",
                    c.name(),
                    rates.sent_bps,
                    rates.receive_bps
                ),
                Err(e) => warn!("{}: sampling failed: {}", c.name(), e),
            }
        }
    }

    pub async fn tick_jobs(&self) -> usize {
        self.jobs.tick_at(self, now()).await
    }

    /// Suggest better patterns for obfuscated configurations whose recorded
    /// pattern sets perform poorly. Suggestions are only logged; they are
    /// applied the next time the interface comes up.
    pub fn cps_check(&self) -> Vec<(String, Suggestion)> {
        let mut out = Vec::new();
        for c in self.list() {
            if !c.protocol().is_obfuscated() {
                continue;
            }
            let current = c.info().cps_patterns;
            if let Some(s) = c
                .adaptation()
                .periodic_check(&current, self.ctx.library.as_ref())
            {
                if s.patterns != current {
                    info!("{}: better CPS patterns available: {:?}", c.name(), s.library_ids);
                    out.push((c.name().to_string(), s));
                }
            }
        }
        out
    }
}
