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

//! Links through which a peer's client config can be fetched without
//! logging in.

use crate::db::Db;
use crate::error::{Error, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const SHARE_TABLE: &str = "@peer_share_links";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShareLink {
    #[serde(rename = "ShareID")]
    pub share_id: String,
    pub configuration: String,
    pub peer: String,
    pub share_date: NaiveDateTime,
    /// `None` never expires.
    pub expire_date: Option<NaiveDateTime>,
}

impl ShareLink {
    pub fn is_active(&self, now: NaiveDateTime) -> bool {
        self.expire_date.map_or(true, |e| e > now)
    }
}

#[derive(Debug, Clone)]
pub struct ShareLinks {
    db: Arc<Db>,
}

impl ShareLinks {
    pub fn new(db: Arc<Db>) -> ShareLinks {
        ShareLinks { db }
    }

    fn all(&self) -> Vec<ShareLink> {
        let mut v: Vec<ShareLink> = self
            .db
            .list_as(SHARE_TABLE)
            .into_iter()
            .map(|(_, l)| l)
            .collect();
        v.sort_by_key(|l| l.share_date);
        v
    }

    /// Active links of a peer.
    pub fn links_of(&self, configuration: &str, peer: &str, now: NaiveDateTime) -> Vec<ShareLink> {
        self.all()
            .into_iter()
            .filter(|l| l.configuration == configuration && l.peer == peer && l.is_active(now))
            .collect()
    }

    /// A peer has at most one active link.
    pub fn create(
        &self,
        configuration: &str,
        peer: &str,
        expire_date: Option<NaiveDateTime>,
        now: NaiveDateTime,
    ) -> Result<ShareLink> {
        if !self.links_of(configuration, peer, now).is_empty() {
            return Err(Error::AlreadyExists(format!("share link of peer {}", peer)));
        }
        if expire_date.map_or(false, |e| e <= now) {
            return Err(Error::validation("expire date must be in the future"));
        }
        let link = ShareLink {
            share_id: hex::encode(rand::random::<[u8; 16]>()),
            configuration: configuration.into(),
            peer: peer.into(),
            share_date: now,
            expire_date,
        };
        self.db.put(SHARE_TABLE, &link.share_id, &link)?;
        info!("{}: sharing peer {}", configuration, peer);
        Ok(link)
    }

    /// Expired links do not resolve.
    pub fn resolve(&self, share_id: &str, now: NaiveDateTime) -> Result<ShareLink> {
        self.db
            .get_as::<ShareLink>(SHARE_TABLE, share_id)?
            .filter(|l| l.is_active(now))
            .ok_or_else(|| Error::NotFound(format!("share link {}", share_id)))
    }

    pub fn update_expiry(
        &self,
        share_id: &str,
        expire_date: Option<NaiveDateTime>,
        now: NaiveDateTime,
    ) -> Result<ShareLink> {
        let mut link = self.resolve(share_id, now)?;
        if expire_date.map_or(false, |e| e < now) {
            return Err(Error::validation("expire date must not be in the past"));
        }
        link.expire_date = expire_date;
        self.db.put(SHARE_TABLE, share_id, &link)?;
        Ok(link)
    }

    /// Expire every active link of a configuration.
    pub fn expire_all(&self, configuration: &str, now: NaiveDateTime) -> Result<usize> {
        self.db.transaction(|tx| {
            let mut n = 0;
            for key in tx.keys(SHARE_TABLE) {
                if let Some(mut link) = tx.get_as::<ShareLink>(SHARE_TABLE, &key)? {
                    if link.configuration == configuration && link.is_active(now) {
                        link.expire_date = Some(now);
                        tx.put(SHARE_TABLE, &key, &link)?;
                        n += 1;
                    }
                }
            }
            Ok(n)
        })
    }

    pub fn rename_configuration(&self, old: &str, new: &str) -> Result<usize> {
        self.db.transaction(|tx| {
            let mut n = 0;
            for key in tx.keys(SHARE_TABLE) {
                if let Some(mut link) = tx.get_as::<ShareLink>(SHARE_TABLE, &key)? {
                    if link.configuration == old {
                        link.configuration = new.into();
                        tx.put(SHARE_TABLE, &key, &link)?;
                        n += 1;
                    }
                }
            }
            Ok(n)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn links() -> (tempfile::TempDir, ShareLinks) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Db::open(dir.path()).unwrap());
        (dir, ShareLinks::new(db))
    }

    #[test]
    fn one_active_link_per_peer() {
        let (_dir, s) = links();
        let l = s.create("wg-a", "P", Some(now() + Duration::hours(1)), now()).unwrap();
        assert_eq!(l.share_id.len(), 32);
        assert!(matches!(
            s.create("wg-a", "P", None, now()),
            Err(Error::AlreadyExists(_))
        ));
        s.create("wg-a", "Q", None, now()).unwrap();

        // Once expired, a new link may be created.
        let later = now() + Duration::hours(2);
        assert!(matches!(s.resolve(&l.share_id, later), Err(Error::NotFound(_))));
        s.create("wg-a", "P", None, later).unwrap();
        assert!(s.create("wg-a", "R", Some(now()), now()).is_err());
    }

    #[test]
    fn expiry_and_rename() {
        let (_dir, s) = links();
        let l = s.create("wg-a", "P", None, now()).unwrap();
        let e = now() + Duration::days(1);
        assert_eq!(s.update_expiry(&l.share_id, Some(e), now()).unwrap().expire_date, Some(e));
        assert!(s.update_expiry(&l.share_id, Some(now() - Duration::days(1)), now()).is_err());

        assert_eq!(s.rename_configuration("wg-a", "wg-b").unwrap(), 1);
        assert_eq!(s.resolve(&l.share_id, now()).unwrap().configuration, "wg-b");
        assert_eq!(s.links_of("wg-b", "P", now()).len(), 1);

        assert_eq!(s.expire_all("wg-b", now()).unwrap(), 1);
        assert!(s.resolve(&l.share_id, now()).is_err());
        assert!(s.links_of("wg-b", "P", now()).is_empty());
    }
}
