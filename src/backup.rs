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

//! Timestamped backups of a configuration and checksummed archives of them.
//!
//! A backup `ID` of configuration `NAME` is three files in `ROOT/NAME/`:
//!
//! * `NAME_ID.conf`, a copy of the config file,
//! * `NAME_ID.redis`, the peer store tables as `INSERT INTO` lines,
//! * `NAME_ID_iptables.json`, present when the lifecycle hooks reference
//!   shell scripts, holding their content.

use crate::conf_file::ConfFile;
use crate::error::{Error, Result};
use crate::peer_store::{PeerStore, TABLE_SUFFIXES};
use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use tempfile::TempDir;

const ID_FORMAT: &str = "%Y%m%d%H%M%S";
const MANIFEST: &str = "manifest.json";

/// Hook keys of the config file and the keys their scripts are bundled
/// under.
pub const SCRIPT_KEYS: [(&str, &str); 4] = [
    ("PreUp", "preup_script"),
    ("PostUp", "postup_script"),
    ("PreDown", "predown_script"),
    ("PostDown", "postdown_script"),
];

fn io_failure(what: &str, path: &Path, e: std::io::Error) -> Error {
    Error::backup(format!("{} {}: {}", what, path.display(), e))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupInfo {
    pub configuration: String,
    pub id: String,
    pub created: NaiveDateTime,
    pub conf_file: PathBuf,
    pub has_redis: bool,
    pub has_iptables: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub table: String,
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackupContent {
    pub conf: String,
    pub records: Vec<Record>,
    /// Script content by bundle key (`postup_script`, …).
    pub scripts: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Manifest {
    configuration: String,
    backup_id: String,
    files: BTreeMap<String, String>,
    combined_checksum: String,
}

#[derive(Debug)]
pub struct VerifiedArchive {
    pub configuration: String,
    pub backup_id: String,
    pub files: Vec<String>,
    base: PathBuf,
    _dir: TempDir,
}

/// The script file referenced by a hook value: the first word ending in
/// `.sh`. Relative references are looked up in `scripts_dir`.
pub fn referenced_script(value: &str, scripts_dir: &Path) -> Option<PathBuf> {
    let word = value
        .split(|c: char| c.is_whitespace() || c == ';')
        .map(|w| w.trim_matches(|c| c == '"' || c == '\''))
        .find(|w| w.ends_with(".sh"))?;
    let p = Path::new(word);
    if p.is_absolute() {
        Some(p.into())
    } else {
        p.file_name().map(|f| scripts_dir.join(f))
    }
}

/// `(bundle key, path)` of every script referenced by the hooks of `conf`.
pub fn referenced_scripts(conf: &ConfFile, scripts_dir: &Path) -> Vec<(&'static str, PathBuf)> {
    SCRIPT_KEYS
        .iter()
        .filter_map(|(hook, key)| {
            let v = conf.interface_value(hook)?;
            referenced_script(v, scripts_dir).map(|p| (*key, p))
        })
        .collect()
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Every table of the configuration as `INSERT INTO` lines.
pub fn dump_records(store: &PeerStore) -> Result<String> {
    let mut out = String::new();
    for suffix in TABLE_SUFFIXES {
        let table = format!("{}{}", store.name(), suffix);
        for (k, v) in store.db().list(&table) {
            out.push_str(&format!(
                "INSERT INTO \"{}\" VALUES ({}, {});\n",
                table,
                quote(&k),
                quote(&serde_json::to_string(&v)?)
            ));
        }
    }
    Ok(out)
}

fn record_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^INSERT INTO "([^"]+)" VALUES \('((?:[^']|'')*)', '((?:[^']|'')*)'\);$"#)
            .unwrap()
    })
}

pub fn parse_records(text: &str) -> Result<Vec<Record>> {
    let mut out = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let c = record_regex()
            .captures(line)
            .ok_or_else(|| Error::backup(format!("malformed record on line {}", n + 1)))?;
        let value = serde_json::from_str(&c[3].replace("''", "'"))
            .map_err(|e| Error::backup(format!("malformed record on line {}: {}", n + 1, e)))?;
        out.push(Record {
            table: c[1].to_string(),
            key: c[2].replace("''", "'"),
            value,
        });
    }
    Ok(out)
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn combined_checksum(files: &BTreeMap<String, String>) -> String {
    let mut entries: Vec<String> = files.iter().map(|(n, s)| format!("{}:{}", n, s)).collect();
    entries.sort();
    sha256_hex(entries.concat().as_bytes())
}

fn is_plain_relative(name: &str) -> bool {
    !name.is_empty()
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

#[derive(Debug, Clone)]
pub struct BackupEngine {
    root: PathBuf,
}

impl BackupEngine {
    pub fn new(root: impl Into<PathBuf>) -> BackupEngine {
        BackupEngine { root: root.into() }
    }

    pub fn dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn files(&self, name: &str, id: &str) -> [PathBuf; 3] {
        let dir = self.dir(name);
        [
            dir.join(format!("{}_{}.conf", name, id)),
            dir.join(format!("{}_{}.redis", name, id)),
            dir.join(format!("{}_{}_iptables.json", name, id)),
        ]
    }

    /// A timestamp id not used yet, later than `now` if `now` is taken.
    fn fresh_id(&self, name: &str, now: NaiveDateTime) -> String {
        let mut t = now;
        loop {
            let id = t.format(ID_FORMAT).to_string();
            if self.files(name, &id).iter().all(|p| !p.exists()) {
                return id;
            }
            t += chrono::Duration::seconds(1);
        }
    }

    pub fn backup(
        &self,
        store: &PeerStore,
        conf_path: &Path,
        scripts_dir: &Path,
        now: NaiveDateTime,
    ) -> Result<BackupInfo> {
        let name = store.name();
        let dir = self.dir(name);
        std::fs::create_dir_all(&dir).map_err(|e| io_failure("create", &dir, e))?;
        let id = self.fresh_id(name, now);
        let [conf_dst, redis_dst, iptables_dst] = self.files(name, &id);

        let conf = std::fs::read_to_string(conf_path).map_err(|e| io_failure("read", conf_path, e))?;
        std::fs::write(&conf_dst, &conf).map_err(|e| io_failure("write", &conf_dst, e))?;
        std::fs::write(&redis_dst, dump_records(store)?).map_err(|e| io_failure("write", &redis_dst, e))?;

        let mut scripts = BTreeMap::new();
        match ConfFile::parse(&conf) {
            Ok(parsed) => {
                for (key, path) in referenced_scripts(&parsed, scripts_dir) {
                    match std::fs::read_to_string(&path) {
                        Ok(s) => {
                            scripts.insert(key.to_string(), s);
                        }
                        Err(e) => warn!("{}: not bundling {}: {}", name, path.display(), e),
                    }
                }
            }
            Err(e) => warn!("{}: backing up unparsable config file: {}", name, e),
        }
        if !scripts.is_empty() {
            let json = serde_json::to_vec_pretty(&scripts)?;
            std::fs::write(&iptables_dst, json).map_err(|e| io_failure("write", &iptables_dst, e))?;
        }
        info!("{}: created backup {}", name, id);
        self.get(name, &id)
    }

    pub fn get(&self, name: &str, id: &str) -> Result<BackupInfo> {
        let created = NaiveDateTime::parse_from_str(id, ID_FORMAT)
            .map_err(|_| Error::NotFound(format!("backup {} of {}", id, name)))?;
        let [conf, redis, iptables] = self.files(name, id);
        if !conf.exists() {
            return Err(Error::NotFound(format!("backup {} of {}", id, name)));
        }
        Ok(BackupInfo {
            configuration: name.into(),
            id: id.into(),
            created,
            conf_file: conf,
            has_redis: redis.exists(),
            has_iptables: iptables.exists(),
        })
    }

    /// Backups of `name`, newest first.
    pub fn list(&self, name: &str) -> Result<Vec<BackupInfo>> {
        let dir = self.dir(name);
        let entries = match dir.read_dir() {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_failure("list", &dir, e)),
        };
        let re = Regex::new(&format!(r"^{}_(\d{{14}})\.conf$", regex::escape(name)))
            .map_err(|e| Error::backup(e))?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_failure("list", &dir, e))?;
            let file_name = entry.file_name();
            let id = match re.captures(&file_name.to_string_lossy()) {
                Some(c) => c[1].to_string(),
                None => continue,
            };
            if let Ok(info) = self.get(name, &id) {
                out.push(info);
            }
        }
        out.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(out)
    }

    pub fn load(&self, name: &str, id: &str) -> Result<BackupContent> {
        let info = self.get(name, id)?;
        let [conf_p, redis_p, iptables_p] = self.files(name, id);
        let conf = std::fs::read_to_string(&conf_p).map_err(|e| io_failure("read", &conf_p, e))?;
        let records = if info.has_redis {
            let text = std::fs::read_to_string(&redis_p).map_err(|e| io_failure("read", &redis_p, e))?;
            parse_records(&text)?
        } else {
            Vec::new()
        };
        let scripts = if info.has_iptables {
            let bytes = std::fs::read(&iptables_p).map_err(|e| io_failure("read", &iptables_p, e))?;
            serde_json::from_slice(&bytes)
                .map_err(|e| Error::backup(format!("malformed {}: {}", iptables_p.display(), e)))?
        } else {
            BTreeMap::new()
        };
        Ok(BackupContent {
            conf,
            records,
            scripts,
        })
    }

    pub fn delete(&self, name: &str, id: &str) -> Result<()> {
        self.get(name, id)?;
        for p in self.files(name, id) {
            match std::fs::remove_file(&p) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    return Err(io_failure("remove", &p, e))
                }
                _ => (),
            }
        }
        let dir = self.dir(name);
        let empty = dir
            .read_dir()
            .map(|mut d| d.next().is_none())
            .unwrap_or(false);
        if empty {
            std::fs::remove_dir(&dir).map_err(|e| io_failure("remove", &dir, e))?;
        }
        info!("{}: deleted backup {}", name, id);
        Ok(())
    }

    /// Bundle a backup and a checksum manifest into a 7z archive at `dest`.
    /// Returns the bundled file names.
    pub fn export_archive(&self, name: &str, id: &str, dest: &Path) -> Result<Vec<String>> {
        let content = self.load(name, id)?;
        let staging = tempfile::tempdir().map_err(|e| Error::backup(e))?;
        let mut files = BTreeMap::new();
        let mut put = |rel: String, bytes: &[u8]| -> Result<()> {
            let p = staging.path().join(&rel);
            if let Some(parent) = p.parent() {
                std::fs::create_dir_all(parent).map_err(|e| io_failure("create", parent, e))?;
            }
            std::fs::write(&p, bytes).map_err(|e| io_failure("write", &p, e))?;
            files.insert(rel, sha256_hex(bytes));
            Ok(())
        };
        for p in self.files(name, id).iter().filter(|p| p.exists()) {
            let bytes = std::fs::read(p).map_err(|e| io_failure("read", p, e))?;
            let rel = p
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default();
            put(rel, &bytes)?;
        }
        if let Ok(conf) = ConfFile::parse(&content.conf) {
            for (key, path) in referenced_scripts(&conf, Path::new("")) {
                if let (Some(script), Some(file_name)) = (content.scripts.get(key), path.file_name()) {
                    put(
                        format!("scripts/{}", file_name.to_string_lossy()),
                        script.as_bytes(),
                    )?;
                }
            }
        }
        let manifest = Manifest {
            configuration: name.into(),
            backup_id: id.into(),
            combined_checksum: combined_checksum(&files),
            files,
        };
        let json = serde_json::to_vec_pretty(&manifest)?;
        std::fs::write(staging.path().join(MANIFEST), json)
            .map_err(|e| io_failure("write", &staging.path().join(MANIFEST), e))?;
        // Never leave a partial archive behind.
        let partial = scopeguard::guard(dest, |d| {
            let _ = std::fs::remove_file(d);
        });
        sevenz_rust::compress_to_path(staging.path(), dest)
            .map_err(|e| Error::backup(format!("failed to write archive {}: {}", dest.display(), e)))?;
        scopeguard::ScopeGuard::into_inner(partial);
        info!("{}: exported backup {} to {}", name, id, dest.display());
        Ok(manifest.files.into_keys().collect())
    }

    /// Verify an archive and store it as a new backup of the configuration
    /// named in its manifest.
    pub fn import_archive(&self, archive: &Path, now: NaiveDateTime) -> Result<BackupInfo> {
        let verified = verify_archive(archive)?;
        let name = verified.configuration.clone();
        if !crate::utils::is_valid_name(&name) {
            return Err(Error::backup(format!("invalid configuration name {:?} in manifest", name)));
        }
        let dir = self.dir(&name);
        std::fs::create_dir_all(&dir).map_err(|e| io_failure("create", &dir, e))?;
        let id = self.fresh_id(&name, now);
        let old = [
            format!("{}_{}.conf", name, verified.backup_id),
            format!("{}_{}.redis", name, verified.backup_id),
            format!("{}_{}_iptables.json", name, verified.backup_id),
        ];
        if !verified.files.contains(&old[0]) {
            return Err(Error::backup("archive holds no config file"));
        }
        for (src, dst) in old.iter().zip(self.files(&name, &id).iter()) {
            if verified.files.contains(src) {
                let from = verified.base.join(src);
                std::fs::copy(&from, dst).map_err(|e| io_failure("copy", &from, e))?;
            }
        }
        info!("{}: imported archive {} as backup {}", name, archive.display(), id);
        self.get(&name, &id)
    }
}

fn find_manifest(dir: &Path, depth: usize) -> Option<PathBuf> {
    let direct = dir.join(MANIFEST);
    if direct.is_file() {
        return Some(direct);
    }
    if depth == 0 {
        return None;
    }
    dir.read_dir()
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .find_map(|p| find_manifest(&p, depth - 1))
}

/// Check every file of an archive against its manifest.
pub fn verify_archive(archive: &Path) -> Result<VerifiedArchive> {
    let dir = tempfile::tempdir().map_err(|e| Error::backup(e))?;
    sevenz_rust::decompress_file(archive, dir.path())
        .map_err(|e| Error::backup(format!("failed to read archive {}: {}", archive.display(), e)))?;
    let manifest_path = find_manifest(dir.path(), 2)
        .ok_or_else(|| Error::backup("archive holds no manifest"))?;
    let base = manifest_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| dir.path().into());
    let manifest: Manifest = std::fs::read(&manifest_path)
        .ok()
        .and_then(|b| serde_json::from_slice(&b).ok())
        .ok_or_else(|| Error::backup("malformed manifest"))?;

    let mut actual = BTreeMap::new();
    for (file, expected) in &manifest.files {
        if !is_plain_relative(file) {
            return Err(Error::backup(format!("invalid file name in manifest: {}", file)));
        }
        let bytes = std::fs::read(base.join(file))
            .map_err(|_| Error::backup(format!("Missing file: {}", file)))?;
        let sha = sha256_hex(&bytes);
        if &sha != expected {
            return Err(Error::backup(format!("Checksum mismatch for file: {}", file)));
        }
        actual.insert(file.clone(), sha);
    }
    if combined_checksum(&actual) != manifest.combined_checksum {
        return Err(Error::backup("Combined checksum mismatch"));
    }
    Ok(VerifiedArchive {
        configuration: manifest.configuration,
        backup_id: manifest.backup_id,
        files: manifest.files.into_keys().collect(),
        base,
        _dir: dir,
    })
}
