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

//! Connection outcome memory of CPS pattern sets, per configuration.

use super::format::normalize;
use super::library::{PatternLibrary, POSITION_PROTOCOLS};
use crate::db::Db;
use crate::error::Result;
use crate::peer_store::CPS_ADAPTATION_SUFFIX;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

const ALPHA: f64 = 0.3;
const MIN_ATTEMPTS: u64 = 5;
const POOR_SCORE: f64 = 0.4;

pub type Patterns = [String; 5];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpsMetric {
    pub pattern_hash: String,
    pub patterns: Patterns,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// `None` until the first positive sample.
    pub avg_latency_ms: Option<f64>,
    pub avg_throughput_mbps: Option<f64>,
    pub performance_score: f64,
    pub last_used: NaiveDateTime,
    /// Library ids the patterns were seeded from, empty when unknown.
    #[serde(default)]
    pub library_ids: Patterns,
}

impl CpsMetric {
    fn rescore(&mut self) {
        let success_rate = if self.attempts > 0 {
            self.successes as f64 / self.attempts as f64
        } else {
            0.
        };
        let latency = self
            .avg_latency_ms
            .map_or(0.5, |l| (1. - l / 2000.).clamp(0., 1.));
        let throughput = self.avg_throughput_mbps.map_or(0., |t| (t / 10.).min(1.));
        self.performance_score = (0.6 * success_rate + 0.2 * latency + 0.2 * throughput).clamp(0., 1.);
    }

    fn is_poor(&self) -> bool {
        self.attempts >= MIN_ATTEMPTS && self.performance_score < POOR_SCORE
    }
}

fn ema(avg: Option<f64>, sample: f64) -> Option<f64> {
    if sample <= 0. || !sample.is_finite() {
        return avg;
    }
    Some(match avg {
        Some(a) => ALPHA * sample + (1. - ALPHA) * a,
        None => sample,
    })
}

pub fn pattern_hash(patterns: &Patterns) -> String {
    let digest = Sha256::digest(patterns.join("|").as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Base patterns proposed for `I1..I5` and the library entries they came
/// from.
#[derive(Debug, Clone, PartialEq)]
pub struct Suggestion {
    pub patterns: Patterns,
    pub library_ids: Patterns,
}

#[derive(Clone)]
pub struct CpsAdaptation {
    db: Arc<Db>,
    table: String,
}

impl CpsAdaptation {
    pub fn new(db: Arc<Db>, configuration: &str) -> CpsAdaptation {
        CpsAdaptation {
            db,
            table: format!("{}{}", configuration, CPS_ADAPTATION_SUFFIX),
        }
    }

    pub fn record(
        &self,
        patterns: &Patterns,
        success: bool,
        latency_ms: f64,
        throughput_mbps: f64,
        library_ids: Option<&Patterns>,
        now: NaiveDateTime,
    ) -> Result<CpsMetric> {
        let hash = pattern_hash(patterns);
        self.db.transaction(|tx| {
            let mut m = match tx.get_as::<CpsMetric>(&self.table, &hash)? {
                Some(m) => m,
                None => CpsMetric {
                    pattern_hash: hash.clone(),
                    patterns: patterns.clone(),
                    attempts: 0,
                    successes: 0,
                    failures: 0,
                    avg_latency_ms: None,
                    avg_throughput_mbps: None,
                    performance_score: 0.,
                    last_used: now,
                    library_ids: Patterns::default(),
                },
            };
            m.attempts += 1;
            if success {
                m.successes += 1;
            } else {
                m.failures += 1;
            }
            m.avg_latency_ms = ema(m.avg_latency_ms, latency_ms);
            m.avg_throughput_mbps = ema(m.avg_throughput_mbps, throughput_mbps);
            m.last_used = now;
            if let Some(ids) = library_ids {
                m.library_ids = ids.clone();
            }
            m.rescore();
            tx.put(&self.table, &hash, &m)?;
            Ok(m)
        })
    }

    pub fn get(&self, patterns: &Patterns) -> Option<CpsMetric> {
        self.db
            .get_as(&self.table, &pattern_hash(patterns))
            .unwrap_or_else(|e| {
                warn!("malformed CPS metric: {}", e);
                None
            })
    }

    pub fn metrics(&self) -> Vec<CpsMetric> {
        self.db
            .list_as(&self.table)
            .into_iter()
            .map(|(_, m)| m)
            .collect()
    }

    pub fn should_adapt(&self, patterns: &Patterns) -> bool {
        self.get(patterns).map_or(false, |m| m.is_poor())
    }

    pub fn poor_patterns(&self) -> Vec<CpsMetric> {
        self.metrics().into_iter().filter(CpsMetric::is_poor).collect()
    }

    /// Library id at `position` of the best scoring pattern set that is not
    /// poor.
    fn best_library_id(&self, position: usize) -> Option<String> {
        let mut candidates: Vec<CpsMetric> = self
            .metrics()
            .into_iter()
            .filter(|m| !m.is_poor() && !m.library_ids[position].is_empty())
            .collect();
        candidates.sort_by(|a, b| {
            b.performance_score
                .partial_cmp(&a.performance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.attempts.cmp(&a.attempts))
        });
        candidates
            .into_iter()
            .next()
            .map(|m| m.library_ids[position].clone())
    }

    pub fn suggest_improved(&self, current: &Patterns, library: &dyn PatternLibrary) -> Suggestion {
        let mut s = Suggestion {
            patterns: current.clone(),
            library_ids: Patterns::default(),
        };
        for (k, protocol) in POSITION_PROTOCOLS.iter().enumerate() {
            let patterns = match library.load_patterns(protocol) {
                Ok(p) => p,
                Err(e) => {
                    debug!("pattern library unavailable for {}: {}", protocol, e);
                    continue;
                }
            };
            let best = self
                .best_library_id(k)
                .and_then(|id| patterns.iter().find(|p| p.id == id).cloned());
            let chosen = match best {
                Some(p) => Some(p),
                None => library.select_random_pattern(protocol).unwrap_or(None),
            };
            if let Some(p) = chosen {
                s.patterns[k] = normalize(&p.cps_pattern);
                s.library_ids[k] = p.id;
            }
        }
        s
    }

    /// Suggest new patterns when any recorded pattern set performs poorly.
    pub fn periodic_check(
        &self,
        current: &Patterns,
        library: &dyn PatternLibrary,
    ) -> Option<Suggestion> {
        let poor = self.poor_patterns();
        if poor.is_empty() {
            return None;
        }
        info!(
            "{}: {} poorly performing CPS pattern sets",
            self.table,
            poor.len()
        );
        Some(self.suggest_improved(current, library))
    }
}

#[cfg(test)]
mod tests {
    use super::super::library::LibraryPattern;
    use super::*;
    use crate::error::Error;
    use quickcheck_macros::quickcheck;

    struct FixedLibrary;

    impl PatternLibrary for FixedLibrary {
        fn load_patterns(&self, protocol: &str) -> Result<Vec<LibraryPattern>> {
            match protocol {
                "quic" => Ok(vec![
                    LibraryPattern {
                        id: "quic-1".into(),
                        cps_pattern: "0xc000000001".into(),
                    },
                    LibraryPattern {
                        id: "quic-2".into(),
                        cps_pattern: "<b 0xc1><r 20>".into(),
                    },
                ]),
                "dns" => Ok(Vec::new()),
                _ => Err(Error::NotFound(protocol.into())),
            }
        }
    }

    fn adaptation() -> (tempfile::TempDir, CpsAdaptation) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Db::open(dir.path()).unwrap());
        (dir, CpsAdaptation::new(db, "awg0"))
    }

    fn now() -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn patterns(s: &str) -> Patterns {
        [s.into(), String::new(), String::new(), String::new(), String::new()]
    }

    #[test]
    fn hash_is_sixteen_hex_chars() {
        let h = pattern_hash(&patterns("<c>"));
        assert_eq!(h.len(), 16);
        assert_ne!(h, pattern_hash(&patterns("<t>")));
    }

    #[test]
    fn scoring() {
        let (_d, a) = adaptation();
        let p = patterns("<c>");
        let m = a.record(&p, true, 0., 0., None, now()).unwrap();
        // success 1.0, unknown latency 0.5, unknown throughput 0.
        assert!((m.performance_score - 0.7).abs() < 1e-9);
        let m = a.record(&p, true, 1000., 20., None, now()).unwrap();
        assert_eq!(m.avg_latency_ms, Some(1000.));
        assert!((m.performance_score - (0.6 + 0.1 + 0.2)).abs() < 1e-9);
        let m = a.record(&p, false, 0., 0., None, now()).unwrap();
        assert_eq!((m.attempts, m.successes, m.failures), (3, 2, 1));
        assert_eq!(m.avg_latency_ms, Some(1000.));
    }

    #[test]
    fn adapts_after_repeated_failures() {
        let (_d, a) = adaptation();
        let p = patterns("<c>");
        for _ in 0..4 {
            a.record(&p, false, 0., 0., None, now()).unwrap();
        }
        assert!(!a.should_adapt(&p));
        a.record(&p, false, 0., 0., None, now()).unwrap();
        assert!(a.should_adapt(&p));
        assert!(!a.should_adapt(&patterns("<t>")));
        assert_eq!(a.poor_patterns().len(), 1);
    }

    #[test]
    fn suggestions_prefer_best_library_pattern() {
        let (_d, a) = adaptation();
        let current = patterns("<c>");

        let mut good = patterns("<b 0xc1><r 20>");
        good[1] = "<t>".into();
        let mut ids = Patterns::default();
        ids[0] = "quic-2".into();
        a.record(&good, true, 100., 50., Some(&ids), now()).unwrap();

        let s = a.suggest_improved(&current, &FixedLibrary);
        assert_eq!(s.patterns[0], "<b 0xc1><r 20>");
        assert_eq!(s.library_ids[0], "quic-2");
        // Library unavailable keeps the current value, an empty protocol
        // falls back to it too.
        assert_eq!(s.patterns[1], "");
        assert_eq!(s.patterns[2], "");
        assert_eq!(s.library_ids[2], "");
    }

    #[test]
    fn random_fallback_is_normalized() {
        let (_d, a) = adaptation();
        let s = a.suggest_improved(&patterns(""), &FixedLibrary);
        assert!(s.patterns[0] == "<b 0xc000000001>" || s.patterns[0] == "<b 0xc1><r 20>");
        assert!(a.periodic_check(&patterns(""), &FixedLibrary).is_none());
    }

    #[quickcheck]
    fn ema_stays_within_samples(samples: Vec<(u16, u16)>) -> bool {
        let samples: Vec<(f64, f64)> = samples
            .into_iter()
            .map(|(l, t)| (f64::from(l) + 1., f64::from(t) + 1.))
            .collect();
        if samples.is_empty() {
            return true;
        }
        let (_d, a) = adaptation();
        let p = patterns("<c>");
        let mut m = None;
        for (l, t) in &samples {
            m = Some(a.record(&p, true, *l, *t, None, now()).unwrap());
        }
        let m = m.unwrap();
        let within = |v: f64, xs: Vec<f64>| {
            let lo = xs.iter().cloned().fold(f64::INFINITY, f64::min);
            let hi = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            v >= lo - 1e-9 && v <= hi + 1e-9
        };
        within(
            m.avg_latency_ms.unwrap(),
            samples.iter().map(|s| s.0).collect(),
        ) && within(
            m.avg_throughput_mbps.unwrap(),
            samples.iter().map(|s| s.1).collect(),
        ) && (0. ..=1.).contains(&m.performance_score)
    }
}
