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

//! Peers of one configuration, partitioned into the active, restricted,
//! deleted and transfer history sets.

use crate::db::{Db, Tx};
use crate::error::{Error, Result};
use crate::types::{CounterKind, PeerStatus, SchedulerKind};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub const RESTRICTED_SUFFIX: &str = "_restrict_access";
pub const TRANSFER_SUFFIX: &str = "_transfer";
pub const DELETED_SUFFIX: &str = "_deleted";
pub const CPS_ADAPTATION_SUFFIX: &str = "_cps_adaptation";

/// Snapshots kept per peer in the transfer history.
pub const TRANSFER_HISTORY_LIMIT: usize = 64;

/// Every table a configuration owns is its name followed by one of these.
pub const TABLE_SUFFIXES: [&str; 5] = [
    "",
    RESTRICTED_SUFFIX,
    TRANSFER_SUFFIX,
    DELETED_SUFFIX,
    CPS_ADAPTATION_SUFFIX,
];

/// Columns added after the first schema. Records missing them are filled in
/// by [`PeerStore::migrate`].
const MIGRATED_COLUMNS: [&str; 5] = [
    "address_v4",
    "address_v6",
    "upload_rate_limit",
    "download_rate_limit",
    "scheduler_type",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSet {
    Active,
    Restricted,
    Deleted,
}

impl PeerSet {
    fn suffix(self) -> &'static str {
        match self {
            PeerSet::Active => "",
            PeerSet::Restricted => RESTRICTED_SUFFIX,
            PeerSet::Deleted => DELETED_SUFFIX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Peer {
    pub id: String,
    pub name: String,
    pub private_key: String,
    pub preshared_key: String,
    pub allowed_ip: String,
    pub address_v4: String,
    pub address_v6: String,
    #[serde(rename = "DNS")]
    pub dns: String,
    pub endpoint_allowed_ip: String,
    pub mtu: i64,
    pub keepalive: i64,
    pub remote_endpoint: String,
    pub endpoint: String,
    pub status: PeerStatus,
    pub latest_handshake: String,
    pub total_receive: f64,
    pub total_sent: f64,
    pub total_data: f64,
    pub cumu_receive: f64,
    pub cumu_sent: f64,
    pub cumu_data: f64,
    pub upload_rate_limit: i64,
    pub download_rate_limit: i64,
    pub scheduler_type: Option<SchedulerKind>,
    /// Per-peer CPS overrides `I1..I5`. Empty means the configuration's
    /// scrambled value is exported.
    pub cps_patterns: [String; 5],
}

impl Default for Peer {
    fn default() -> Peer {
        Peer {
            id: String::new(),
            name: String::new(),
            private_key: String::new(),
            preshared_key: String::new(),
            allowed_ip: String::new(),
            address_v4: String::new(),
            address_v6: String::new(),
            dns: String::new(),
            endpoint_allowed_ip: String::new(),
            mtu: 0,
            keepalive: 0,
            remote_endpoint: String::new(),
            endpoint: "N/A".into(),
            status: PeerStatus::Stopped,
            latest_handshake: "No Handshake".into(),
            total_receive: 0.,
            total_sent: 0.,
            total_data: 0.,
            cumu_receive: 0.,
            cumu_sent: 0.,
            cumu_data: 0.,
            upload_rate_limit: 0,
            download_rate_limit: 0,
            scheduler_type: None,
            cps_patterns: Default::default(),
        }
    }
}

/// Transfer counters of a peer, in GiB.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Counters {
    pub total_receive: f64,
    pub total_sent: f64,
    pub cumu_receive: f64,
    pub cumu_sent: f64,
}

impl Counters {
    pub fn total_data(&self) -> f64 {
        self.total_receive + self.total_sent
    }

    pub fn cumu_data(&self) -> f64 {
        self.cumu_receive + self.cumu_sent
    }
}

impl Peer {
    pub fn counters(&self) -> Counters {
        Counters {
            total_receive: self.total_receive,
            total_sent: self.total_sent,
            cumu_receive: self.cumu_receive,
            cumu_sent: self.cumu_sent,
        }
    }

    pub fn set_counters(&mut self, c: &Counters) {
        self.total_receive = c.total_receive;
        self.total_sent = c.total_sent;
        self.total_data = c.total_data();
        self.cumu_receive = c.cumu_receive;
        self.cumu_sent = c.cumu_sent;
        self.cumu_data = c.cumu_data();
    }

    /// Refresh `address_v4`/`address_v6` from `allowed_ip`.
    pub fn derive_addresses(&mut self) {
        let (v4, v6) = split_addresses(&self.allowed_ip);
        self.address_v4 = v4;
        self.address_v6 = v6;
    }

    pub fn has_rate_limit(&self) -> bool {
        self.upload_rate_limit > 0 || self.download_rate_limit > 0
    }
}

/// Split a comma separated CIDR list into its IPv4 and IPv6 parts.
pub fn split_addresses(allowed_ip: &str) -> (String, String) {
    let (v6, v4): (Vec<&str>, Vec<&str>) = crate::utils::split_list(allowed_ip)
        .into_iter()
        .partition(|a| a.contains(':'));
    (v4.join(", "), v6.join(", "))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSnapshot {
    pub id: String,
    pub total_receive: f64,
    pub total_sent: f64,
    pub total_data: f64,
    pub cumu_receive: f64,
    pub cumu_sent: f64,
    pub cumu_data: f64,
    pub time: NaiveDateTime,
}

#[derive(Clone)]
pub struct PeerStore {
    db: Arc<Db>,
    name: String,
}

impl std::fmt::Debug for PeerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerStore").field("name", &self.name).finish()
    }
}

impl PeerStore {
    pub fn new(db: Arc<Db>, name: &str) -> PeerStore {
        PeerStore {
            db,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    fn table(&self, set: PeerSet) -> String {
        format!("{}{}", self.name, set.suffix())
    }

    fn transfer_table(&self) -> String {
        format!("{}{}", self.name, TRANSFER_SUFFIX)
    }

    pub fn create_tables(&self) -> Result<()> {
        self.db.transaction(|tx| {
            for suffix in TABLE_SUFFIXES {
                tx.create_table(&format!("{}{}", self.name, suffix));
            }
            Ok(())
        })
    }

    pub fn drop_tables(&self) -> Result<()> {
        self.db.transaction(|tx| {
            for suffix in TABLE_SUFFIXES {
                tx.drop_table(&format!("{}{}", self.name, suffix));
            }
            Ok(())
        })
    }

    /// Copy every table to `new_name`, replacing whatever is there.
    pub fn copy_tables(&self, new_name: &str) -> Result<PeerStore> {
        self.db.transaction(|tx| {
            for suffix in TABLE_SUFFIXES {
                let src = format!("{}{}", self.name, suffix);
                let dst = format!("{}{}", new_name, suffix);
                let records = tx.list(&src);
                tx.drop_table(&dst);
                tx.create_table(&dst);
                for (k, v) in records {
                    tx.put_value(&dst, &k, v);
                }
            }
            Ok(())
        })?;
        Ok(PeerStore::new(self.db.clone(), new_name))
    }

    /// Insert or replace.
    pub fn insert(&self, set: PeerSet, peer: &Peer) -> Result<()> {
        self.db.put(&self.table(set), &peer.id, peer)
    }

    pub fn bulk_insert(&self, set: PeerSet, peers: &[Peer]) -> Result<()> {
        let table = self.table(set);
        self.db.transaction(|tx| {
            for p in peers {
                tx.put(&table, &p.id, p)?;
            }
            Ok(())
        })
    }

    pub fn get(&self, set: PeerSet, id: &str) -> Result<Option<Peer>> {
        self.db.get_as(&self.table(set), id)
    }

    pub fn list(&self, set: PeerSet) -> Vec<Peer> {
        self.db
            .list_as::<Peer>(&self.table(set))
            .into_iter()
            .map(|(_, p)| p)
            .collect()
    }

    /// Look a peer up in the active set, then the restricted set.
    pub fn find(&self, id: &str) -> Result<Option<(PeerSet, Peer)>> {
        for set in [PeerSet::Active, PeerSet::Restricted] {
            if let Some(p) = self.get(set, id)? {
                return Ok(Some((set, p)));
            }
        }
        Ok(None)
    }

    pub fn update(&self, set: PeerSet, id: &str, f: impl FnOnce(&mut Peer)) -> Result<Peer> {
        let table = self.table(set);
        self.db.transaction(|tx| {
            let mut peer: Peer = tx
                .get_as(&table, id)?
                .ok_or_else(|| Error::NotFound(format!("peer {}", id)))?;
            f(&mut peer);
            peer.id = id.into();
            tx.put(&table, id, &peer)?;
            Ok(peer)
        })
    }

    /// Deleting a missing peer is not an error.
    pub fn delete(&self, set: PeerSet, id: &str) -> Result<Option<Peer>> {
        match self.db.remove(&self.table(set), id)? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    pub fn move_peer(&self, id: &str, src: PeerSet, dst: PeerSet) -> Result<Peer> {
        let moved = self.bulk_move(&[id], src, dst)?;
        moved
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("peer {}", id)))
    }

    /// Move the peers found in `src` to `dst` in one transaction. Returns the
    /// moved peers; ids missing from `src` are skipped.
    pub fn bulk_move<S: AsRef<str>>(&self, ids: &[S], src: PeerSet, dst: PeerSet) -> Result<Vec<Peer>> {
        let (src_t, dst_t) = (self.table(src), self.table(dst));
        self.db.transaction(|tx| {
            let mut moved = Vec::new();
            for id in ids {
                let id = id.as_ref();
                if let Some(v) = tx.remove(&src_t, id) {
                    let peer: Peer = serde_json::from_value(v)?;
                    tx.put(&dst_t, id, &peer)?;
                    moved.push(peer);
                }
            }
            Ok(moved)
        })
    }

    pub fn reset_counters(&self, id: &str, kind: CounterKind) -> Result<Peer> {
        self.update(PeerSet::Active, id, |p| {
            let mut c = p.counters();
            if kind != CounterKind::Sent {
                c.total_receive = 0.;
                c.cumu_receive = 0.;
            }
            if kind != CounterKind::Receive {
                c.total_sent = 0.;
                c.cumu_sent = 0.;
            }
            p.set_counters(&c);
        })
    }

    /// Snapshot a peer's counters into the transfer history.
    pub fn record_transfer(&self, peer: &Peer, time: NaiveDateTime) -> Result<()> {
        self.batch(|b| b.record_transfer(peer, time))
    }

    /// Run `f` with every write going to one transaction, so a sampler tick
    /// rewrites each table once.
    pub fn batch<T>(&self, f: impl FnOnce(&mut Batch<'_, '_>) -> Result<T>) -> Result<T> {
        self.db.transaction(|tx| f(&mut Batch { store: self, tx }))
    }

    /// Snapshots of one peer, oldest first.
    pub fn transfer_history(&self, id: &str) -> Vec<TransferSnapshot> {
        let prefix = format!("{}#", id);
        let mut v: Vec<TransferSnapshot> = self
            .db
            .list_as::<TransferSnapshot>(&self.transfer_table())
            .into_iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, s)| s)
            .collect();
        v.sort_by_key(|s| s.time);
        v
    }

    /// Add the columns introduced after the first schema to every record that
    /// lacks them. Returns how many records were rewritten; running it again
    /// rewrites nothing.
    pub fn migrate(&self) -> Result<usize> {
        let tables: Vec<String> = [PeerSet::Active, PeerSet::Restricted, PeerSet::Deleted]
            .iter()
            .map(|s| self.table(*s))
            .collect();
        self.db.transaction(|tx| {
            let mut n = 0;
            for table in &tables {
                for (k, mut v) in tx.list(table) {
                    if migrate_record(&mut v) {
                        tx.put_value(table, &k, v);
                        n += 1;
                    }
                }
            }
            Ok(n)
        })
    }
}

/// Writes to a [`PeerStore`] inside one [`Db::transaction`].
pub struct Batch<'a, 'b> {
    store: &'a PeerStore,
    tx: &'a mut Tx<'b>,
}

impl Batch<'_, '_> {
    pub fn get(&self, set: PeerSet, id: &str) -> Result<Option<Peer>> {
        self.tx.get_as(&self.store.table(set), id)
    }

    /// Update an active peer. Returns `None` when it is not in the active
    /// set.
    fn update_active(&mut self, id: &str, f: impl FnOnce(&mut Peer)) -> Result<Option<Peer>> {
        let table = self.store.table(PeerSet::Active);
        let mut peer: Peer = match self.tx.get_as(&table, id)? {
            Some(p) => p,
            None => return Ok(None),
        };
        f(&mut peer);
        self.tx.put(&table, id, &peer)?;
        Ok(Some(peer))
    }

    pub fn update_handshake(&mut self, id: &str, text: &str, status: PeerStatus) -> Result<bool> {
        Ok(self
            .update_active(id, |p| {
                p.latest_handshake = text.into();
                p.status = status;
            })?
            .is_some())
    }

    pub fn update_transfer(&mut self, id: &str, counters: &Counters) -> Result<bool> {
        Ok(self.update_active(id, |p| p.set_counters(counters))?.is_some())
    }

    pub fn update_endpoint(&mut self, id: &str, endpoint: &str) -> Result<bool> {
        Ok(self
            .update_active(id, |p| p.endpoint = endpoint.into())?
            .is_some())
    }

    /// Keeps the newest [`TRANSFER_HISTORY_LIMIT`] snapshots of the peer.
    pub fn record_transfer(&mut self, peer: &Peer, time: NaiveDateTime) -> Result<()> {
        let snapshot = TransferSnapshot {
            id: peer.id.clone(),
            total_receive: peer.total_receive,
            total_sent: peer.total_sent,
            total_data: peer.total_data,
            cumu_receive: peer.cumu_receive,
            cumu_sent: peer.cumu_sent,
            cumu_data: peer.cumu_data,
            time,
        };
        let table = self.store.transfer_table();
        let prefix = format!("{}#", peer.id);
        let key = format!("{}{}", prefix, time.format("%Y%m%d%H%M%S%.6f"));
        self.tx.put(&table, &key, &snapshot)?;

        // Keys sort by time within a peer.
        let keys: Vec<String> = self
            .tx
            .keys(&table)
            .into_iter()
            .filter(|k| k.starts_with(&prefix))
            .collect();
        let excess = keys.len().saturating_sub(TRANSFER_HISTORY_LIMIT);
        for k in &keys[..excess] {
            self.tx.remove(&table, k);
        }
        Ok(())
    }
}

fn migrate_record(v: &mut Value) -> bool {
    let obj = match v.as_object_mut() {
        Some(o) => o,
        None => return false,
    };
    if MIGRATED_COLUMNS.iter().all(|c| obj.contains_key(*c)) {
        return false;
    }
    let allowed_ip = obj
        .get("allowed_ip")
        .and_then(|a| a.as_str())
        .unwrap_or_default()
        .to_string();
    let (v4, v6) = split_addresses(&allowed_ip);
    obj.entry("address_v4").or_insert(Value::String(v4));
    obj.entry("address_v6").or_insert(Value::String(v6));
    obj.entry("upload_rate_limit").or_insert(Value::from(0));
    obj.entry("download_rate_limit").or_insert(Value::from(0));
    obj.entry("scheduler_type").or_insert(Value::Null);
    true
}

/// Whether `table` belongs to one of the configurations in `names`. Global
/// tables start with `@` and always belong.
fn is_owned(table: &str, names: &[String]) -> bool {
    table.starts_with('@')
        || names.iter().any(|n| {
            table
                .strip_prefix(n.as_str())
                .map_or(false, |rest| TABLE_SUFFIXES.contains(&rest))
        })
}

/// Drop every table not owned by an existing configuration. Returns the
/// dropped tables.
pub fn cleanup_orphans(db: &Db, names: &[String]) -> Result<Vec<String>> {
    let orphans: Vec<String> = db
        .table_names()
        .into_iter()
        .filter(|t| !is_owned(t, names))
        .collect();
    if orphans.is_empty() {
        return Ok(orphans);
    }
    db.transaction(|tx| {
        for t in &orphans {
            tx.drop_table(t);
        }
        Ok(())
    })?;
    for t in &orphans {
        info!("dropped orphaned peer store table {}", t);
    }
    Ok(orphans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{KEY_A, KEY_B, KEY_C};
    use serde_json::json;

    fn store() -> (tempfile::TempDir, PeerStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Db::open(dir.path()).unwrap());
        let s = PeerStore::new(db, "wg-a");
        s.create_tables().unwrap();
        (dir, s)
    }

    fn peer(id: &str, ip: &str) -> Peer {
        let mut p = Peer {
            id: id.into(),
            allowed_ip: ip.into(),
            ..Peer::default()
        };
        p.derive_addresses();
        p
    }

    #[test]
    fn insert_is_idempotent() {
        let (_d, s) = store();
        let p = peer(KEY_A, "10.9.0.2/32");
        s.insert(PeerSet::Active, &p).unwrap();
        s.insert(PeerSet::Active, &p).unwrap();
        assert_eq!(s.list(PeerSet::Active), vec![p.clone()]);
        assert_eq!(s.get(PeerSet::Active, KEY_A).unwrap(), Some(p));
        assert_eq!(s.delete(PeerSet::Active, KEY_A).unwrap().map(|p| p.id), Some(KEY_A.to_string()));
        assert_eq!(s.delete(PeerSet::Active, KEY_A).unwrap(), None);
    }

    #[test]
    fn moves_keep_sets_disjoint() {
        let (_d, s) = store();
        s.bulk_insert(
            PeerSet::Active,
            &[peer(KEY_A, "10.9.0.2/32"), peer(KEY_B, "10.9.0.3/32")],
        )
        .unwrap();
        let moved = s
            .bulk_move(&[KEY_A, KEY_C], PeerSet::Active, PeerSet::Restricted)
            .unwrap();
        assert_eq!(moved.len(), 1);
        assert!(s.get(PeerSet::Active, KEY_A).unwrap().is_none());
        assert_eq!(s.find(KEY_A).unwrap().unwrap().0, PeerSet::Restricted);
        assert!(matches!(
            s.move_peer(KEY_C, PeerSet::Active, PeerSet::Restricted),
            Err(Error::NotFound(_))
        ));
        s.move_peer(KEY_A, PeerSet::Restricted, PeerSet::Active).unwrap();
        assert_eq!(s.list(PeerSet::Active).len(), 2);
        assert!(s.list(PeerSet::Restricted).is_empty());
    }

    #[test]
    fn counters_and_reset() {
        let (_d, s) = store();
        s.insert(PeerSet::Active, &peer(KEY_A, "10.9.0.2/32")).unwrap();
        let updated = s
            .batch(|b| {
                b.update_transfer(
                    KEY_A,
                    &Counters {
                        total_receive: 1.,
                        total_sent: 2.,
                        cumu_receive: 3.,
                        cumu_sent: 4.,
                    },
                )
            })
            .unwrap();
        assert!(updated);
        let p = s.get(PeerSet::Active, KEY_A).unwrap().unwrap();
        assert_eq!((p.total_data, p.cumu_data), (3., 7.));

        let p = s.reset_counters(KEY_A, CounterKind::Receive).unwrap();
        assert_eq!((p.total_receive, p.cumu_receive), (0., 0.));
        assert_eq!((p.total_sent, p.cumu_sent), (2., 4.));
        assert_eq!((p.total_data, p.cumu_data), (2., 4.));

        let p = s.reset_counters(KEY_A, CounterKind::Total).unwrap();
        assert_eq!(p.counters(), Counters::default());
    }

    #[test]
    fn migration_adds_columns_once() {
        let (_d, s) = store();
        s.db()
            .put(
                "wg-a",
                KEY_A,
                &json!({"id": KEY_A, "allowed_ip": "10.9.0.2/32, fd00::2/128", "name": "old"}),
            )
            .unwrap();
        assert_eq!(s.migrate().unwrap(), 1);
        assert_eq!(s.migrate().unwrap(), 0);
        let raw = s.db().get("wg-a", KEY_A).unwrap();
        assert_eq!(raw["address_v4"], json!("10.9.0.2/32"));
        assert_eq!(raw["address_v6"], json!("fd00::2/128"));
        assert_eq!(raw["scheduler_type"], Value::Null);
        let p = s.get(PeerSet::Active, KEY_A).unwrap().unwrap();
        assert_eq!(p.name, "old");
        assert_eq!(p.upload_rate_limit, 0);
    }

    #[test]
    fn copy_and_orphans() {
        let (_d, s) = store();
        s.insert(PeerSet::Active, &peer(KEY_A, "10.9.0.2/32")).unwrap();
        s.db().put("@peer_jobs", "j", &1).unwrap();
        let t = s.copy_tables("wg-b").unwrap();
        assert_eq!(t.list(PeerSet::Active).len(), 1);

        let dropped = cleanup_orphans(s.db(), &["wg-b".to_string()]).unwrap();
        assert!(dropped.contains(&"wg-a".to_string()));
        assert!(dropped.contains(&"wg-a_cps_adaptation".to_string()));
        assert!(s.db().has_table("@peer_jobs"));
        assert!(s.db().has_table("wg-b_restrict_access"));
        assert!(cleanup_orphans(s.db(), &["wg-b".to_string()]).unwrap().is_empty());
    }

    #[test]
    fn history_is_per_peer() {
        let (_d, s) = store();
        let a = peer(KEY_A, "10.9.0.2/32");
        let b = peer(KEY_B, "10.9.0.3/32");
        let t0 = chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        s.record_transfer(&a, t0 + chrono::Duration::seconds(5)).unwrap();
        s.record_transfer(&a, t0).unwrap();
        s.record_transfer(&b, t0).unwrap();
        let h = s.transfer_history(KEY_A);
        assert_eq!(h.len(), 2);
        assert!(h[0].time < h[1].time);
    }

    #[test]
    fn history_is_capped() {
        let (_d, s) = store();
        let a = peer(KEY_A, "10.9.0.2/32");
        let t0 = chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        s.batch(|b| {
            for i in 0..TRANSFER_HISTORY_LIMIT + 3 {
                b.record_transfer(&a, t0 + chrono::Duration::minutes(i as i64))?;
            }
            Ok(())
        })
        .unwrap();
        let h = s.transfer_history(KEY_A);
        assert_eq!(h.len(), TRANSFER_HISTORY_LIMIT);
        assert_eq!(h[0].time, t0 + chrono::Duration::minutes(3));
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let (_d, s) = store();
        s.insert(PeerSet::Active, &peer(KEY_A, "10.9.0.2/32")).unwrap();
        let r: Result<()> = s.batch(|b| {
            assert!(b.update_endpoint(KEY_A, "192.0.2.1:51820")?);
            assert!(!b.update_endpoint(KEY_B, "192.0.2.2:51820")?);
            Err(Error::transient("disk full"))
        });
        assert!(r.is_err());
        let p = s.get(PeerSet::Active, KEY_A).unwrap().unwrap();
        assert_ne!(p.endpoint, "192.0.2.1:51820");
    }
}
