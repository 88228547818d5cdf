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

//! Per-peer rate limits through the traffic shaping helper.
//!
//! Every peer shaped on one interface must use the same scheduler: the
//! first scheduler in use locks the interface until no shaped peer is left.

use crate::configuration::Configuration;
use crate::error::{Error, Result};
use crate::peer_store::{Peer, PeerSet};
use crate::types::SchedulerKind;

impl Configuration {
    /// `(scheduler, locked)`: the scheduler of the first shaped active peer,
    /// or unlocked `htb`.
    pub fn interface_scheduler(&self) -> (SchedulerKind, bool) {
        self.store
            .list(PeerSet::Active)
            .iter()
            .filter(|p| p.has_rate_limit())
            .find_map(|p| p.scheduler_type)
            .map(|s| (s, true))
            .unwrap_or((SchedulerKind::default(), false))
    }

    /// Limit a peer, in the helper's rate unit. Both rates zero removes the
    /// limit.
    pub async fn set_rate_limit(
        &self,
        id: &str,
        upload: i64,
        download: i64,
        scheduler: SchedulerKind,
    ) -> Result<Peer> {
        if upload < 0 || download < 0 {
            return Err(Error::validation("rates must not be negative"));
        }
        if upload == 0 && download == 0 {
            return self.remove_rate_limit(id).await;
        }
        let _serial = self.serial.lock().await;
        let p = self
            .store
            .get(PeerSet::Active, id)?
            .ok_or_else(|| Error::NotFound(format!("peer {}", id)))?;
        let (current, locked) = self.interface_scheduler();
        let only_shaped = p.has_rate_limit()
            && self
                .store
                .list(PeerSet::Active)
                .iter()
                .filter(|o| o.has_rate_limit())
                .count()
                == 1;
        if locked && current != scheduler && !only_shaped {
            return Err(Error::validation(format!(
                "interface {} is locked to scheduler {}",
                self.name(),
                current
            )));
        }

        let upload_s = upload.to_string();
        let download_s = download.to_string();
        let allowed_ips = p.allowed_ip.replace(' ', "");
        self.ctx
            .tools
            .tc_helper(&[
                "-interface",
                self.name(),
                "-peer",
                id,
                "-upload-rate",
                &upload_s,
                "-download-rate",
                &download_s,
                "-protocol",
                self.protocol().tc_flag(),
                "-scheduler",
                scheduler.as_str(),
                "-allowed-ips",
                &allowed_ips,
            ])
            .await?;
        info!(
            "{}: limited peer {} to {}/{} with {}",
            self.name(),
            id,
            upload,
            download,
            scheduler
        );
        self.store.update(PeerSet::Active, id, |p| {
            p.upload_rate_limit = upload;
            p.download_rate_limit = download;
            p.scheduler_type = Some(scheduler);
        })
    }

    pub async fn remove_rate_limit(&self, id: &str) -> Result<Peer> {
        let _serial = self.serial.lock().await;
        let p = self
            .store
            .get(PeerSet::Active, id)?
            .ok_or_else(|| Error::NotFound(format!("peer {}", id)))?;
        self.clear_shaping(&p).await?;
        info!("{}: removed rate limit of peer {}", self.name(), id);
        self.store.update(PeerSet::Active, id, |p| {
            p.upload_rate_limit = 0;
            p.download_rate_limit = 0;
            p.scheduler_type = None;
        })
    }

    pub(crate) async fn clear_shaping(&self, p: &Peer) -> Result<()> {
        self.ctx
            .tools
            .tc_helper(&[
                "-interface",
                self.name(),
                "-peer",
                &p.id,
                "-protocol",
                self.protocol().tc_flag(),
                "--remove",
            ])
            .await?;
        Ok(())
    }

    /// Remove every shaping rule of the interface.
    pub async fn nuke_rate_limits(&self) -> Result<()> {
        let _serial = self.serial.lock().await;
        self.ctx
            .tools
            .tc_helper(&["-interface", self.name(), "--nuke"])
            .await?;
        let shaped: Vec<String> = self
            .store
            .list(PeerSet::Active)
            .into_iter()
            .filter(|p| p.has_rate_limit())
            .map(|p| p.id)
            .collect();
        for id in shaped {
            self.store.update(PeerSet::Active, &id, |p| {
                p.upload_rate_limit = 0;
                p.download_rate_limit = 0;
                p.scheduler_type = None;
            })?;
        }
        info!("{}: removed all rate limits", self.name());
        Ok(())
    }
}
