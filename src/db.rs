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

//! A small persistent table store: every table is a JSON object of records
//! in `DIR/TABLE.json`, mirrored in memory.
//!
//! Writes go through [`Db::transaction`]. Tables touched by a transaction are
//! copied on first write and only swapped in after every touched file has
//! been written, so readers never observe half of a transaction.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub type Table = BTreeMap<String, Value>;

pub struct Db {
    dir: PathBuf,
    tables: RwLock<BTreeMap<String, Table>>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").field("dir", &self.dir).finish()
    }
}

const EXT: &str = "json";

impl Db {
    pub fn open(dir: &Path) -> Result<Db> {
        std::fs::create_dir_all(dir)?;
        let mut tables = BTreeMap::new();
        for entry in dir.read_dir()? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXT) {
                continue;
            }
            let name = match path.file_stem().and_then(|s| s.to_str()) {
                Some(n) if !n.starts_with('.') => n.to_string(),
                _ => continue,
            };
            tables.insert(name, read_table(&path)?);
        }
        debug!("opened peer store at {} with {} tables", dir.display(), tables.len());
        Ok(Db {
            dir: dir.into(),
            tables: RwLock::new(tables),
        })
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", table, EXT))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.read().contains_key(table)
    }

    pub fn get(&self, table: &str, key: &str) -> Option<Value> {
        self.tables.read().get(table)?.get(key).cloned()
    }

    pub fn get_as<T: DeserializeOwned>(&self, table: &str, key: &str) -> Result<Option<T>> {
        match self.get(table, key) {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    /// All records of a table in key order. A missing table is empty.
    pub fn list(&self, table: &str) -> Vec<(String, Value)> {
        match self.tables.read().get(table) {
            Some(t) => t.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            None => Vec::new(),
        }
    }

    /// Records that fail to deserialize are skipped with a warning.
    pub fn list_as<T: DeserializeOwned>(&self, table: &str) -> Vec<(String, T)> {
        self.list(table)
            .into_iter()
            .filter_map(|(k, v)| match serde_json::from_value(v) {
                Ok(t) => Some((k, t)),
                Err(e) => {
                    warn!("skipping malformed record {} in {}: {}", k, table, e);
                    None
                }
            })
            .collect()
    }

    pub fn put<T: Serialize>(&self, table: &str, key: &str, value: &T) -> Result<()> {
        self.transaction(|tx| tx.put(table, key, value))
    }

    pub fn remove(&self, table: &str, key: &str) -> Result<Option<Value>> {
        self.transaction(|tx| Ok(tx.remove(table, key)))
    }

    pub fn create_table(&self, table: &str) -> Result<()> {
        self.transaction(|tx| {
            tx.create_table(table);
            Ok(())
        })
    }

    pub fn drop_table(&self, table: &str) -> Result<()> {
        self.transaction(|tx| {
            tx.drop_table(table);
            Ok(())
        })
    }

    /// Run `f` against a copy-on-write view of the store. Nothing is visible
    /// or written if `f` fails.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut Tx<'_>) -> Result<T>) -> Result<T> {
        let mut guard = self.tables.write();
        let (r, changes) = {
            let mut tx = Tx {
                base: &guard,
                changes: BTreeMap::new(),
            };
            let r = f(&mut tx)?;
            (r, tx.changes)
        };
        if changes.is_empty() {
            return Ok(r);
        }
        if let Err(e) = self.persist(&changes) {
            // Some files may already be written. Keep memory equal to disk.
            for name in changes.keys() {
                let path = self.table_path(name);
                if !path.exists() {
                    guard.remove(name);
                    continue;
                }
                match read_table(&path) {
                    Ok(t) => {
                        guard.insert(name.clone(), t);
                    }
                    Err(e) => warn!("failed to reload table {}: {}", name, e),
                }
            }
            return Err(Error::transient(format!("failed to write tables: {}", e)));
        }
        for (name, table) in changes {
            match table {
                Some(t) => {
                    guard.insert(name, t);
                }
                None => {
                    guard.remove(&name);
                }
            }
        }
        Ok(r)
    }

    fn persist(&self, changes: &BTreeMap<String, Option<Table>>) -> std::io::Result<()> {
        for (name, table) in changes {
            let path = self.table_path(name);
            match table {
                Some(t) => {
                    let bytes = serde_json::to_vec(t).map_err(std::io::Error::from)?;
                    crate::utils::atomic_write(&path, &bytes, 0o600)?;
                }
                None => match std::fs::remove_file(&path) {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
                    _ => (),
                },
            }
        }
        Ok(())
    }
}

fn read_table(path: &Path) -> Result<Table> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::transient(format!("corrupted table {}: {}", path.display(), e)))
}

/// Pending changes of a [`Db::transaction`]. `None` marks a dropped table.
pub struct Tx<'a> {
    base: &'a BTreeMap<String, Table>,
    changes: BTreeMap<String, Option<Table>>,
}

impl<'a> Tx<'a> {
    fn table(&self, table: &str) -> Option<&Table> {
        match self.changes.get(table) {
            Some(t) => t.as_ref(),
            None => self.base.get(table),
        }
    }

    fn table_mut(&mut self, table: &str) -> &mut Table {
        let base = self.base;
        self.changes
            .entry(table.to_string())
            .or_insert_with(|| base.get(table).cloned())
            .get_or_insert_with(Table::new)
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.table(table).is_some()
    }

    pub fn create_table(&mut self, table: &str) {
        self.table_mut(table);
    }

    pub fn drop_table(&mut self, table: &str) {
        self.changes.insert(table.to_string(), None);
    }

    pub fn get(&self, table: &str, key: &str) -> Option<&Value> {
        self.table(table)?.get(key)
    }

    pub fn get_as<T: DeserializeOwned>(&self, table: &str, key: &str) -> Result<Option<T>> {
        match self.get(table, key) {
            Some(v) => Ok(Some(T::deserialize(v)?)),
            None => Ok(None),
        }
    }

    pub fn keys(&self, table: &str) -> Vec<String> {
        self.table(table)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn list(&self, table: &str) -> Vec<(String, Value)> {
        self.table(table)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn put<T: Serialize>(&mut self, table: &str, key: &str, value: &T) -> Result<()> {
        let v = serde_json::to_value(value)?;
        self.put_value(table, key, v);
        Ok(())
    }

    pub fn put_value(&mut self, table: &str, key: &str, value: Value) {
        self.table_mut(table).insert(key.to_string(), value);
    }

    pub fn remove(&mut self, table: &str, key: &str) -> Option<Value> {
        if self.table(table)?.contains_key(key) {
            self.table_mut(table).remove(key)
        } else {
            None
        }
    }
}
