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

//! Polling of handshakes, transfer counters and endpoints.
//!
//! Stored totals are the kernel counters of the current interface session.
//! When the kernel counters go down (the interface was restarted) the old
//! totals are absorbed into the cumulative counters, so `total + cumu` never
//! decreases.

use crate::configuration::{now, Configuration};
use crate::error::Result;
use crate::peer_store::{Counters, PeerSet};
use crate::tools::ShowKind;
use crate::types::PeerStatus;
use crate::utils::{bytes_to_gib, human_duration};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A handshake younger than this means the peer is running.
pub const RUNNING_WINDOW: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleOutcome {
    pub counters: Counters,
    /// The stored counters looked swapped and were corrected.
    pub swapped: bool,
    /// The kernel counters went down.
    pub reset: bool,
}

fn looks_swapped(stored: &Counters, cur_sent: f64, cur_recv: f64) -> bool {
    (stored.total_sent - cur_sent).abs() > (stored.total_sent - cur_recv).abs()
        && (stored.total_receive - cur_recv).abs() > (stored.total_receive - cur_sent).abs()
}

/// New counters of a peer given the current kernel counters, in GiB.
pub fn apply_sample(
    stored: &Counters,
    cur_sent: f64,
    cur_recv: f64,
    swap_detection: bool,
) -> SampleOutcome {
    let mut c = *stored;
    let swapped = swap_detection && looks_swapped(stored, cur_sent, cur_recv);
    if swapped {
        std::mem::swap(&mut c.total_sent, &mut c.total_receive);
        std::mem::swap(&mut c.cumu_sent, &mut c.cumu_receive);
    }
    let reset = !(c.total_sent <= cur_sent && c.total_receive <= cur_recv);
    if reset {
        c.cumu_sent += c.total_sent;
        c.cumu_receive += c.total_receive;
    }
    c.total_sent = cur_sent;
    c.total_receive = cur_recv;
    SampleOutcome {
        counters: c,
        swapped,
        reset,
    }
}

fn rows(output: &str) -> impl Iterator<Item = Vec<&str>> {
    output
        .lines()
        .map(|l| l.split('\t').map(str::trim).collect::<Vec<_>>())
        .filter(|cols| !cols.is_empty() && !cols[0].is_empty())
}

/// `(peer, sent_bytes, recv_bytes)` of `show IFACE transfer`.
pub fn parse_transfer(output: &str) -> Vec<(String, u64, u64)> {
    rows(output)
        .filter_map(|cols| match cols[..] {
            [pk, sent, recv] => Some((pk.to_string(), sent.parse().ok()?, recv.parse().ok()?)),
            _ => None,
        })
        .collect()
}

/// `(peer, unix time)` of `show IFACE latest-handshakes`.
pub fn parse_handshakes(output: &str) -> Vec<(String, u64)> {
    rows(output)
        .filter_map(|cols| match cols[..] {
            [pk, t] => Some((pk.to_string(), t.parse().ok()?)),
            _ => None,
        })
        .collect()
}

pub fn parse_endpoints(output: &str) -> Vec<(String, String)> {
    rows(output)
        .filter_map(|cols| match cols[..] {
            [pk, "(none)"] => Some((pk.to_string(), "N/A".to_string())),
            [pk, e] => Some((pk.to_string(), e.to_string())),
            _ => None,
        })
        .collect()
}

/// `(text, status)` of a handshake at unix time `t`.
pub fn handshake_state(t: u64, now: u64) -> (String, PeerStatus) {
    if t == 0 {
        return ("No Handshake".into(), PeerStatus::Stopped);
    }
    let age = now.saturating_sub(t);
    let status = if age < RUNNING_WINDOW.as_secs() {
        PeerStatus::Running
    } else {
        PeerStatus::Stopped
    };
    (human_duration(age), status)
}

/// Last transfer measurement of an interface.
#[derive(Debug, Default)]
pub struct RateState {
    at: Option<Instant>,
    last: HashMap<String, (u64, u64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerRate {
    pub id: String,
    pub sent_bps: f64,
    pub receive_bps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficRates {
    /// Seconds since the previous measurement, zero for the first one.
    pub interval: f64,
    pub sent_bps: f64,
    pub receive_bps: f64,
    pub peers: Vec<PeerRate>,
}

fn delta(cur: u64, prev: u64) -> u64 {
    if cur >= prev {
        cur - prev
    } else {
        cur
    }
}

pub fn compute_rates(state: &mut RateState, sample: &[(String, u64, u64)], at: Instant) -> TrafficRates {
    let interval = state
        .at
        .map(|prev| at.saturating_duration_since(prev).as_secs_f64())
        .unwrap_or(0.);
    let mut peers = Vec::with_capacity(sample.len());
    for (id, sent, recv) in sample {
        let (sent_bps, receive_bps) = match state.last.get(id) {
            Some(&(prev_sent, prev_recv)) if interval > 0. => (
                delta(*sent, prev_sent) as f64 * 8. / interval,
                delta(*recv, prev_recv) as f64 * 8. / interval,
            ),
            _ => (0., 0.),
        };
        peers.push(PeerRate {
            id: id.clone(),
            sent_bps,
            receive_bps,
        });
    }
    state.at = Some(at);
    state.last = sample
        .iter()
        .map(|(id, s, r)| (id.clone(), (*s, *r)))
        .collect();
    TrafficRates {
        interval,
        sent_bps: peers.iter().map(|p| p.sent_bps).sum(),
        receive_bps: peers.iter().map(|p| p.receive_bps).sum(),
        peers,
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Configuration {
    async fn show(&self, kind: ShowKind) -> Result<String> {
        self.ctx.tools.show(self.protocol(), self.name(), kind).await
    }

    /// One poll of handshakes, transfer and endpoints. The peer tables are
    /// written once, and the transfer reading also advances the rate
    /// snapshot.
    pub async fn sample(&self, swap_detection: bool) -> Result<TrafficRates> {
        let handshakes = parse_handshakes(&self.show(ShowKind::LatestHandshakes).await?);
        let transfer = parse_transfer(&self.show(ShowKind::Transfer).await?);
        let endpoints = parse_endpoints(&self.show(ShowKind::Endpoints).await?);
        let unix = unix_now();
        let at = now();

        self.store.batch(|b| {
            for (id, t) in &handshakes {
                let (text, status) = handshake_state(*t, unix);
                b.update_handshake(id, &text, status)?;
            }
            for (id, sent, recv) in &transfer {
                let stored = match b.get(PeerSet::Active, id)? {
                    Some(p) => p,
                    None => continue,
                };
                let outcome = apply_sample(
                    &stored.counters(),
                    bytes_to_gib(*sent),
                    bytes_to_gib(*recv),
                    swap_detection,
                );
                if outcome.swapped {
                    warn!(
                        "{}: stored counters of peer {} look swapped, correcting",
                        self.name(),
                        id
                    );
                }
                if outcome.reset {
                    debug!("{}: counters of peer {} were reset", self.name(), id);
                    b.record_transfer(&stored, at)?;
                }
                b.update_transfer(id, &outcome.counters)?;
            }
            for (id, endpoint) in &endpoints {
                b.update_endpoint(id, endpoint)?;
            }
            Ok(())
        })?;
        Ok(self.advance_rates(&transfer, Instant::now()))
    }

    fn advance_rates(&self, sample: &[(String, u64, u64)], at: Instant) -> TrafficRates {
        compute_rates(&mut self.rates.lock(), sample, at)
    }

    /// Bits per second of the interface and each peer since the previous
    /// reading.
    pub async fn traffic_rates(&self) -> Result<TrafficRates> {
        self.traffic_rates_at(Instant::now()).await
    }

    pub async fn traffic_rates_at(&self, at: Instant) -> Result<TrafficRates> {
        let output = self.show(ShowKind::Transfer).await?;
        Ok(self.advance_rates(&parse_transfer(&output), at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::tests::spec;
    use crate::configuration::NewPeer;
    use crate::testing::{TestEnv, KEY_A, KEY_B};
    use quickcheck_macros::quickcheck;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn counters(total_sent: f64, total_receive: f64, cumu_sent: f64, cumu_receive: f64) -> Counters {
        Counters {
            total_sent,
            total_receive,
            cumu_sent,
            cumu_receive,
        }
    }

    #[test]
    fn counter_reset_is_absorbed() {
        let o = apply_sample(&counters(3.0, 0., 5.0, 0.), 1.0, 0., true);
        assert!(o.reset);
        assert_eq!((o.counters.total_sent, o.counters.cumu_sent), (1.0, 8.0));
    }

    #[test]
    fn swapped_counters_are_corrected() {
        let o = apply_sample(&counters(0.5, 4.2, 10., 90.), 4.4, 0.6, true);
        assert!(o.swapped);
        assert!(!o.reset);
        assert_eq!(o.counters, counters(4.4, 0.6, 90., 10.));

        let o = apply_sample(&counters(0.5, 4.2, 10., 90.), 4.4, 0.6, false);
        assert!(!o.swapped);
        assert!(o.reset);
        assert_eq!((o.counters.total_sent, o.counters.total_receive), (4.4, 0.6));
    }

    #[quickcheck]
    fn sum_never_decreases(samples: Vec<(u16, u16)>) -> bool {
        let mut c = Counters::default();
        let mut prev = (0., 0.);
        for (s, r) in samples {
            c = apply_sample(&c, f64::from(s), f64::from(r), false).counters;
            let now = (c.total_sent + c.cumu_sent, c.total_receive + c.cumu_receive);
            if now.0 < prev.0 || now.1 < prev.1 {
                return false;
            }
            prev = now;
        }
        true
    }

    #[test]
    fn handshake_text() {
        assert_eq!(
            handshake_state(0, 1000),
            ("No Handshake".to_string(), PeerStatus::Stopped)
        );
        assert_eq!(
            handshake_state(1000, 1030),
            ("0:00:30".to_string(), PeerStatus::Running)
        );
        assert_eq!(handshake_state(1000, 1120).1, PeerStatus::Stopped);
    }

    #[test]
    fn parsing() {
        let t = parse_transfer(&format!("{}\t10\t20\nbroken\n{}\tx\t1\n", KEY_A, KEY_B));
        assert_eq!(t, vec![(KEY_A.to_string(), 10, 20)]);
        let e = parse_endpoints(&format!("{}\t(none)\n{}\t1.2.3.4:5\n", KEY_A, KEY_B));
        assert_eq!(e[0].1, "N/A");
        assert_eq!(e[1].1, "1.2.3.4:5");
    }

    #[test]
    fn rates_over_interval() {
        let mut s = RateState::default();
        let t0 = Instant::now();
        let first = compute_rates(&mut s, &[("a".into(), 1000, 2000)], t0);
        assert_eq!(first.interval, 0.);
        assert_eq!(first.sent_bps, 0.);
        let second = compute_rates(&mut s, &[("a".into(), 2000, 500)], t0 + Duration::from_secs(2));
        assert_eq!(second.peers[0].sent_bps, 4000.);
        // The counter went down, the new value is the delta.
        assert_eq!(second.peers[0].receive_bps, 2000.);
        assert_eq!(second.receive_bps, 2000.);
    }

    #[tokio::test]
    async fn sample_updates_rows() {
        let env = TestEnv::new();
        let core = env.core().await;
        let c = core
            .create_configuration(spec("wg-a", "10.9.0.1/24", 51820))
            .await
            .unwrap();
        c.add_peers(vec![NewPeer::with_key(KEY_A, &["10.9.0.2/32"])])
            .await
            .unwrap();
        c.store()
            .update(PeerSet::Active, KEY_A, |p| {
                p.set_counters(&counters(3.0, 0., 5.0, 0.))
            })
            .unwrap();
        let now = unix_now();
        env.set_show("wg-a", "latest-handshakes", &format!("{}\t{}\n{}\t{}\n", KEY_A, now - 5, KEY_B, now));
        env.set_show("wg-a", "transfer", &format!("{}\t{}\t0\n", KEY_A, GIB));
        env.set_show("wg-a", "endpoints", &format!("{}\t203.0.113.7:51820\n", KEY_A));

        c.sample(true).await.unwrap();
        let p = c.store().get(PeerSet::Active, KEY_A).unwrap().unwrap();
        assert_eq!(p.status, PeerStatus::Running);
        assert_eq!(p.endpoint, "203.0.113.7:51820");
        assert_eq!((p.total_sent, p.cumu_sent), (1.0, 8.0));
        assert_eq!(p.total_data, 1.0);
        assert_eq!(c.store().transfer_history(KEY_A).len(), 1);
        // Unknown peers are not adopted by the sampler.
        assert!(c.store().find(KEY_B).unwrap().is_none());
    }

    #[tokio::test]
    async fn traffic_rates_from_show() {
        let env = TestEnv::new();
        let core = env.core().await;
        let c = core
            .create_configuration(spec("wg-a", "10.9.0.1/24", 51820))
            .await
            .unwrap();
        let t0 = Instant::now();
        env.set_show(
            "wg-a",
            "transfer",
            &format!("{}\t1000\t4000\n{}\t0\t0\n", KEY_A, KEY_B),
        );
        let first = c.traffic_rates_at(t0).await.unwrap();
        assert_eq!(first.interval, 0.);
        assert_eq!(first.peers.len(), 2);
        assert_eq!(first.sent_bps, 0.);

        // KEY_A's receive counter went down: the interface was restarted.
        env.set_show(
            "wg-a",
            "transfer",
            &format!("{}\t3000\t1000\n{}\t500\t0\n", KEY_A, KEY_B),
        );
        let second = c
            .traffic_rates_at(t0 + Duration::from_secs(4))
            .await
            .unwrap();
        assert_eq!(second.interval, 4.);
        assert_eq!(second.peers[0].id, KEY_A);
        assert_eq!(second.peers[0].sent_bps, 4000.);
        assert_eq!(second.peers[0].receive_bps, 2000.);
        assert_eq!(second.peers[1].sent_bps, 1000.);
        assert_eq!(second.sent_bps, 5000.);
        assert_eq!(second.receive_bps, 2000.);

        env.fail("show");
        assert!(c.traffic_rates().await.is_err());
    }
}
