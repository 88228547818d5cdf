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

//! Peer jobs: restrict, allow, delete or rate limit a peer when its traffic
//! crosses a threshold, at a date, or during weekly windows.
//!
//! Jobs are never removed. A finished job gets an `ExpireDate` and stays in
//! the table as history.

use crate::core::Core;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::peer_store::{Peer, PeerSet};
use crate::types::BatchResult;
use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub const JOBS_TABLE: &str = "@peer_jobs";
pub const JOB_LOGS_TABLE: &str = "@peer_job_logs";

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    TotalReceive,
    TotalSent,
    TotalData,
    Date,
    Weekly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Neq,
    /// Greater than.
    Lgt,
    /// Less than.
    Lst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Restrict,
    Allow,
    Delete,
    RateLimit,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Field::TotalReceive => "total_receive",
            Field::TotalSent => "total_sent",
            Field::TotalData => "total_data",
            Field::Date => "date",
            Field::Weekly => "weekly",
        })
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operator::Eq => "eq",
            Operator::Neq => "neq",
            Operator::Lgt => "lgt",
            Operator::Lst => "lst",
        })
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Restrict => "restrict",
            Action::Allow => "allow",
            Action::Delete => "delete",
            Action::RateLimit => "rate_limit",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PeerJob {
    #[serde(rename = "JobID")]
    pub job_id: String,
    pub configuration: String,
    pub peer: String,
    pub field: Field,
    pub operator: Operator,
    pub value: String,
    pub creation_date: NaiveDateTime,
    pub expire_date: Option<NaiveDateTime>,
    pub action: Action,
}

/// A job to create.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NewJob {
    pub configuration: String,
    pub peer: String,
    pub field: Field,
    pub operator: Operator,
    pub value: String,
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobLog {
    #[serde(rename = "LogID")]
    pub log_id: String,
    #[serde(rename = "JobID")]
    pub job_id: String,
    pub log_date: NaiveDateTime,
    pub status: bool,
    pub message: String,
}

/// `Value` of a `rate_limit` job.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RateLimitValue {
    pub threshold: f64,
    pub upload_rate: i64,
    pub download_rate: i64,
}

/// `D:HH:MM-HH:MM`, `D` is 0 for Monday. An end before the start runs
/// into the next day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklyWindow {
    pub day: u32,
    pub start: u32,
    pub end: u32,
}

fn parse_clock(s: &str) -> Option<u32> {
    let (h, m) = s.trim().split_once(':')?;
    let (h, m): (u32, u32) = (h.parse().ok()?, m.parse().ok()?);
    if h < 24 && m < 60 {
        Some(h * 60 + m)
    } else if h == 24 && m == 0 {
        Some(24 * 60)
    } else {
        None
    }
}

impl WeeklyWindow {
    fn parse(s: &str) -> Option<WeeklyWindow> {
        let (day, span) = s.trim().split_once(':')?;
        let day: u32 = day.parse().ok()?;
        let (start, end) = span.split_once('-')?;
        let w = WeeklyWindow {
            day,
            start: parse_clock(start)?,
            end: parse_clock(end)?,
        };
        if day > 6 || w.start == w.end {
            return None;
        }
        Some(w)
    }

    pub fn contains(&self, t: NaiveDateTime) -> bool {
        let today = t.weekday().num_days_from_monday();
        let minute = t.hour() * 60 + t.minute();
        if self.start < self.end {
            today == self.day && (self.start..self.end).contains(&minute)
        } else {
            (today == self.day && minute >= self.start)
                || (today == (self.day + 1) % 7 && minute < self.end)
        }
    }
}

pub fn parse_weekly(value: &str) -> Result<Vec<WeeklyWindow>> {
    let windows = crate::utils::split_list(value)
        .map(|w| {
            WeeklyWindow::parse(w)
                .ok_or_else(|| Error::validation(format!("invalid weekly window {:?}", w)))
        })
        .collect::<Result<Vec<_>>>()?;
    if windows.is_empty() {
        return Err(Error::validation("weekly value must not be empty"));
    }
    Ok(windows)
}

pub fn parse_date(value: &str) -> Result<NaiveDateTime> {
    DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(value.trim(), f).ok())
        .ok_or_else(|| Error::validation(format!("invalid date {:?}", value)))
}

/// Whether the weekly condition holds at `now`. `lgt`/`lst` compare
/// weekdays modulo 7.
fn weekly_holds(op: Operator, windows: &[WeeklyWindow], now: NaiveDateTime) -> bool {
    let today = now.weekday().num_days_from_monday();
    let inside = windows.iter().any(|w| w.contains(now));
    match op {
        Operator::Eq => inside,
        Operator::Neq => !inside,
        Operator::Lgt => windows.iter().any(|w| (today + 7 - w.day) % 7 > 0),
        Operator::Lst => windows.iter().any(|w| (w.day + 7 - today) % 7 > 0),
    }
}

fn compare<T: PartialOrd>(op: Operator, x: T, y: T) -> bool {
    match op {
        Operator::Eq => x == y,
        Operator::Neq => x != y,
        Operator::Lgt => x > y,
        Operator::Lst => x < y,
    }
}

fn usage(field: Field, p: &Peer) -> f64 {
    match field {
        Field::TotalReceive => p.total_receive + p.cumu_receive,
        Field::TotalSent => p.total_sent + p.cumu_sent,
        _ => p.total_data + p.cumu_data,
    }
}

/// What a tick decided for one job.
#[derive(Debug, PartialEq)]
enum Outcome {
    Idle,
    /// Action done; the job stays (weekly) or expires.
    Done(String),
    /// The job can never run again.
    Drop(String),
}

fn batch_outcome(action: Action, peer: &str, r: BatchResult) -> Result<Outcome> {
    match r.failed.into_iter().next() {
        None => Ok(Outcome::Done(format!("{} peer {}", action, peer))),
        Some((_, reason)) => Err(Error::validation(reason)),
    }
}

fn random_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

fn check_value(field: Field, action: Action, value: &str) -> Result<()> {
    if action == Action::RateLimit {
        let v: RateLimitValue = serde_json::from_str(value)
            .map_err(|e| Error::validation(format!("invalid rate limit value: {}", e)))?;
        if matches!(field, Field::Date | Field::Weekly) {
            return Err(Error::validation("rate limit jobs need a traffic field"));
        }
        if v.upload_rate < 0 || v.download_rate < 0 || v.threshold < 0. {
            return Err(Error::validation("rate limit values must not be negative"));
        }
        return Ok(());
    }
    match field {
        Field::Weekly => {
            parse_weekly(value)?;
            if action != Action::Restrict {
                return Err(Error::validation("weekly jobs restrict inside their windows"));
            }
        }
        Field::Date => {
            parse_date(value)?;
        }
        _ => {
            let v: f64 = value
                .trim()
                .parse()
                .map_err(|_| Error::validation(format!("invalid threshold {:?}", value)))?;
            if !v.is_finite() || v < 0. {
                return Err(Error::validation("threshold must not be negative"));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct JobScheduler {
    db: Arc<Db>,
}

impl JobScheduler {
    pub fn new(db: Arc<Db>) -> JobScheduler {
        JobScheduler { db }
    }

    /// Jobs that have not expired.
    pub fn jobs(&self) -> Vec<PeerJob> {
        let mut v: Vec<PeerJob> = self
            .db
            .list_as::<PeerJob>(JOBS_TABLE)
            .into_iter()
            .map(|(_, j)| j)
            .filter(|j| j.expire_date.is_none())
            .collect();
        v.sort_by_key(|j| j.creation_date);
        v
    }

    pub fn jobs_of(&self, configuration: &str, peer: &str) -> Vec<PeerJob> {
        self.jobs()
            .into_iter()
            .filter(|j| j.configuration == configuration && j.peer == peer)
            .collect()
    }

    pub fn get(&self, job_id: &str) -> Result<PeerJob> {
        self.db
            .get_as(JOBS_TABLE, job_id)?
            .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))
    }

    pub fn create(&self, core: &Core, new: NewJob, now: NaiveDateTime) -> Result<PeerJob> {
        let c = core.get(&new.configuration)?;
        if c.store().find(&new.peer)?.is_none() {
            return Err(Error::NotFound(format!("peer {}", new.peer)));
        }
        check_value(new.field, new.action, &new.value)?;
        let job = PeerJob {
            job_id: random_id(),
            configuration: new.configuration,
            peer: new.peer,
            field: new.field,
            operator: new.operator,
            value: new.value.trim().into(),
            creation_date: now,
            expire_date: None,
            action: new.action,
        };
        self.db.put(JOBS_TABLE, &job.job_id, &job)?;
        self.log(&job.job_id, true, "job created", now);
        info!(
            "{}: job {} will {} peer {}",
            job.configuration, job.job_id, job.action, job.peer
        );
        Ok(job)
    }

    /// Expire a job.
    pub fn delete(&self, job_id: &str, now: NaiveDateTime) -> Result<()> {
        let mut job = self.get(job_id)?;
        if job.expire_date.is_none() {
            job.expire_date = Some(now);
            self.db.put(JOBS_TABLE, job_id, &job)?;
            self.log(job_id, true, "job deleted", now);
        }
        Ok(())
    }

    /// Log entries, oldest first, of one job or of all jobs.
    pub fn logs(&self, job_id: Option<&str>) -> Vec<JobLog> {
        self.db
            .list_as::<JobLog>(JOB_LOGS_TABLE)
            .into_iter()
            .map(|(_, l)| l)
            .filter(|l| job_id.map_or(true, |id| l.job_id == id))
            .collect()
    }

    fn log(&self, job_id: &str, status: bool, message: &str, now: NaiveDateTime) {
        let entry = JobLog {
            log_id: random_id(),
            job_id: job_id.into(),
            log_date: now,
            status,
            message: message.into(),
        };
        let key = format!("{}#{}", now.format("%Y%m%d%H%M%S%.6f"), entry.log_id);
        if let Err(e) = self.db.put(JOB_LOGS_TABLE, &key, &entry) {
            warn!("failed to log job {}: {}", job_id, e);
        }
    }

    pub fn rename_configuration(&self, old: &str, new: &str) -> Result<usize> {
        self.db.transaction(|tx| {
            let mut n = 0;
            for key in tx.keys(JOBS_TABLE) {
                if let Some(mut job) = tx.get_as::<PeerJob>(JOBS_TABLE, &key)? {
                    if job.configuration == old {
                        job.configuration = new.into();
                        tx.put(JOBS_TABLE, &key, &job)?;
                        n += 1;
                    }
                }
            }
            Ok(n)
        })
    }

    /// Expire every job of a configuration.
    pub fn drop_configuration(&self, name: &str, now: NaiveDateTime) -> Result<()> {
        for job in self.jobs().into_iter().filter(|j| j.configuration == name) {
            self.delete(&job.job_id, now)?;
        }
        Ok(())
    }

    /// Evaluate every job once. Returns how many actions ran.
    pub async fn tick_at(&self, core: &Core, now: NaiveDateTime) -> usize {
        let mut ran = 0;
        for job in self.jobs() {
            match self.run(core, &job, now).await {
                Ok(Outcome::Idle) => (),
                Ok(Outcome::Done(message)) => {
                    info!("{}: job {}: {}", job.configuration, job.job_id, message);
                    ran += 1;
                    self.log(&job.job_id, true, &message, now);
                    if job.field != Field::Weekly {
                        self.expire(&job, now);
                    }
                }
                Ok(Outcome::Drop(message)) => {
                    info!("{}: dropping job {}: {}", job.configuration, job.job_id, message);
                    self.log(&job.job_id, false, &message, now);
                    self.expire(&job, now);
                }
                Err(e) => {
                    warn!("{}: job {} failed: {}", job.configuration, job.job_id, e);
                    self.log(&job.job_id, false, &e.to_string(), now);
                }
            }
        }
        ran
    }

    fn expire(&self, job: &PeerJob, now: NaiveDateTime) {
        let mut job = job.clone();
        job.expire_date = Some(now);
        if let Err(e) = self.db.put(JOBS_TABLE, &job.job_id, &job) {
            warn!("failed to expire job {}: {}", job.job_id, e);
        }
    }

    async fn run(&self, core: &Core, job: &PeerJob, now: NaiveDateTime) -> Result<Outcome> {
        let c = match core.get(&job.configuration) {
            Ok(c) => c,
            Err(_) => {
                return Ok(Outcome::Drop(format!(
                    "configuration {} no longer exists",
                    job.configuration
                )))
            }
        };
        if let Err(e) = check_value(job.field, job.action, &job.value) {
            return Ok(Outcome::Drop(format!("malformed job: {}", e)));
        }
        let (set, peer) = match c.store().find(&job.peer)? {
            Some(found) => found,
            None => return Ok(Outcome::Drop(format!("peer {} no longer exists", job.peer))),
        };
        let restricted = set == PeerSet::Restricted;
        let ids = [job.peer.as_str()];

        if job.field == Field::Weekly {
            let windows = parse_weekly(&job.value)?;
            let holds = weekly_holds(job.operator, &windows, now);
            return match (holds, restricted) {
                (true, false) => batch_outcome(Action::Restrict, &job.peer, c.restrict_peers(&ids).await?),
                (false, true) => batch_outcome(Action::Allow, &job.peer, c.allow_access_peers(&ids).await?),
                _ => Ok(Outcome::Idle),
            };
        }

        let holds = if job.field == Field::Date {
            compare(job.operator, now, parse_date(&job.value)?)
        } else {
            let threshold = match job.action {
                Action::RateLimit => serde_json::from_str::<RateLimitValue>(&job.value)?.threshold,
                _ => job.value.trim().parse().unwrap_or(f64::INFINITY),
            };
            compare(job.operator, usage(job.field, &peer), threshold)
        };
        if !holds {
            return Ok(Outcome::Idle);
        }
        debug!("{}: job {} condition holds", job.configuration, job.job_id);
        match job.action {
            Action::Restrict if restricted => Ok(Outcome::Drop(format!("peer {} is already restricted", job.peer))),
            Action::Allow if !restricted => Ok(Outcome::Drop(format!("peer {} is not restricted", job.peer))),
            Action::Restrict => batch_outcome(job.action, &job.peer, c.restrict_peers(&ids).await?),
            Action::Allow => batch_outcome(job.action, &job.peer, c.allow_access_peers(&ids).await?),
            Action::Delete => batch_outcome(job.action, &job.peer, c.delete_peers(&ids).await?),
            Action::RateLimit => {
                let v: RateLimitValue = serde_json::from_str(&job.value)?;
                let (scheduler, _) = c.interface_scheduler();
                c.set_rate_limit(&job.peer, v.upload_rate, v.download_rate, scheduler)
                    .await?;
                Ok(Outcome::Done(format!(
                    "limited peer {} to {}/{}",
                    job.peer, v.upload_rate, v.download_rate
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::tests::spec;
    use crate::configuration::NewPeer;
    use crate::testing::{TestEnv, KEY_A, KEY_B};
    use chrono::NaiveDate;

    fn at(d: u32, h: u32, m: u32) -> NaiveDateTime {
        // 2024-05-06 is a Monday.
        NaiveDate::from_ymd_opt(2024, 5, d)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn windows() {
        let w = parse_weekly("1:09:00-17:00").unwrap();
        assert!(w[0].contains(at(7, 10, 30)));
        assert!(!w[0].contains(at(7, 18, 0)));
        assert!(!w[0].contains(at(8, 10, 30)));

        let overnight = parse_weekly("6:22:00-02:00").unwrap();
        assert!(overnight[0].contains(at(12, 23, 0)));
        assert!(overnight[0].contains(at(13, 1, 0)));
        assert!(!overnight[0].contains(at(13, 2, 0)));

        assert!(parse_weekly("7:09:00-10:00").is_err());
        assert!(parse_weekly("1:09:00").is_err());
        assert!(parse_weekly("").is_err());
    }

    #[test]
    fn weekday_comparison_is_modular() {
        let w = parse_weekly("1:09:00-17:00").unwrap();
        assert!(!weekly_holds(Operator::Lgt, &w, at(7, 12, 0)));
        assert!(weekly_holds(Operator::Lgt, &w, at(6, 12, 0)));
        assert!(weekly_holds(Operator::Neq, &w, at(7, 18, 0)));
    }

    #[test]
    fn values() {
        assert!(check_value(Field::TotalData, Action::Restrict, "1.5").is_ok());
        assert!(check_value(Field::TotalData, Action::Restrict, "-1").is_err());
        assert!(check_value(Field::Date, Action::Delete, "2024-05-06 10:00:00").is_ok());
        assert!(check_value(Field::Date, Action::Delete, "tomorrow").is_err());
        assert!(check_value(Field::Weekly, Action::Delete, "1:09:00-17:00").is_err());
        assert!(check_value(
            Field::TotalSent,
            Action::RateLimit,
            r#"{"threshold": 2, "upload_rate": 100, "download_rate": 200}"#
        )
        .is_ok());
        assert!(check_value(Field::Date, Action::RateLimit, r#"{"threshold": 2, "upload_rate": 1, "download_rate": 1}"#).is_err());
    }

    async fn setup(env: &TestEnv) -> Arc<Core> {
        let core = env.core().await;
        let c = core
            .create_configuration(spec("wg-a", "10.9.0.1/24", 51820))
            .await
            .unwrap();
        c.toggle().await.unwrap();
        c.add_peers(vec![
            NewPeer::with_key(KEY_A, &["10.9.0.2/32"]),
            NewPeer::with_key(KEY_B, &["10.9.0.3/32"]),
        ])
        .await
        .unwrap();
        core
    }

    fn job(field: Field, operator: Operator, value: &str, action: Action) -> NewJob {
        NewJob {
            configuration: "wg-a".into(),
            peer: KEY_A.into(),
            field,
            operator,
            value: value.into(),
            action,
        }
    }

    #[tokio::test]
    async fn weekly_restrict_and_allow() {
        let env = TestEnv::new();
        let core = setup(&env).await;
        let jobs = core.jobs();
        let j = jobs
            .create(&core, job(Field::Weekly, Operator::Eq, "1:09:00-17:00", Action::Restrict), at(6, 0, 0))
            .unwrap();
        let c = core.get("wg-a").unwrap();

        assert_eq!(jobs.tick_at(&core, at(7, 10, 30)).await, 1);
        assert!(c.store().get(PeerSet::Restricted, KEY_A).unwrap().is_some());
        assert_eq!(jobs.tick_at(&core, at(7, 11, 0)).await, 0);

        assert_eq!(jobs.tick_at(&core, at(7, 18, 0)).await, 1);
        assert!(c.store().get(PeerSet::Active, KEY_A).unwrap().is_some());
        assert_eq!(jobs.jobs(), vec![j.clone()]);
        assert_eq!(jobs.logs(Some(&j.job_id)).len(), 3);
    }

    #[tokio::test]
    async fn usage_threshold_restricts_once() {
        let env = TestEnv::new();
        let core = setup(&env).await;
        let jobs = core.jobs();
        jobs.create(&core, job(Field::TotalData, Operator::Lgt, "1", Action::Restrict), at(6, 0, 0))
            .unwrap();
        let c = core.get("wg-a").unwrap();
        assert_eq!(jobs.tick_at(&core, at(6, 1, 0)).await, 0);
        c.store()
            .update(PeerSet::Active, KEY_A, |p| {
                p.total_data = 0.5;
                p.cumu_data = 0.75;
            })
            .unwrap();
        assert_eq!(jobs.tick_at(&core, at(6, 1, 1)).await, 1);
        assert!(c.store().get(PeerSet::Restricted, KEY_A).unwrap().is_some());
        assert!(jobs.jobs().is_empty());
    }

    #[tokio::test]
    async fn failed_action_keeps_job() {
        let env = TestEnv::new();
        let core = setup(&env).await;
        let jobs = core.jobs();
        jobs.create(&core, job(Field::Date, Operator::Lgt, "2024-05-06 00:00:00", Action::Delete), at(5, 0, 0))
            .unwrap();
        env.fail("set");
        assert_eq!(jobs.tick_at(&core, at(6, 1, 0)).await, 0);
        assert_eq!(jobs.jobs().len(), 1);
        env.unfail("set");
        assert_eq!(jobs.tick_at(&core, at(6, 1, 1)).await, 1);
        let c = core.get("wg-a").unwrap();
        assert!(c.store().find(KEY_A).unwrap().is_none());
        assert!(jobs.jobs().is_empty());
    }

    #[tokio::test]
    async fn orphaned_job_is_dropped() {
        let env = TestEnv::new();
        let core = setup(&env).await;
        let jobs = core.jobs();
        let j = jobs
            .create(&core, job(Field::TotalSent, Operator::Lgt, "100", Action::Restrict), at(5, 0, 0))
            .unwrap();
        core.get("wg-a").unwrap().delete_peers(&[KEY_A]).await.unwrap();
        assert_eq!(jobs.tick_at(&core, at(6, 0, 0)).await, 0);
        assert!(jobs.jobs().is_empty());
        assert_eq!(jobs.get(&j.job_id).unwrap().expire_date, Some(at(6, 0, 0)));
    }

    #[tokio::test]
    async fn rate_limit_job() {
        let env = TestEnv::new();
        let core = setup(&env).await;
        let jobs = core.jobs();
        jobs.create(
            &core,
            job(
                Field::TotalSent,
                Operator::Lst,
                r#"{"threshold": 1, "upload_rate": 100, "download_rate": 200}"#,
                Action::RateLimit,
            ),
            at(5, 0, 0),
        )
        .unwrap();
        assert_eq!(jobs.tick_at(&core, at(6, 0, 0)).await, 1);
        let p = core.get("wg-a").unwrap().store().get(PeerSet::Active, KEY_A).unwrap().unwrap();
        assert_eq!((p.upload_rate_limit, p.download_rate_limit), (100, 200));
    }
}
