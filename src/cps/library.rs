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

use super::format::{normalize, validate};
use crate::error::{Error, Result};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Library protocol each of `I1..I5` draws its base pattern from.
pub const POSITION_PROTOCOLS: [&str; 5] = ["quic", "http_get", "dns", "json", "http_response"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryPattern {
    pub id: String,
    pub cps_pattern: String,
}

/// Source of base CPS patterns, keyed by protocol.
pub trait PatternLibrary: Send + Sync {
    fn load_patterns(&self, protocol: &str) -> Result<Vec<LibraryPattern>>;

    fn select_random_pattern(&self, protocol: &str) -> Result<Option<LibraryPattern>> {
        let patterns = self.load_patterns(protocol)?;
        Ok(patterns.choose(&mut rand::thread_rng()).cloned())
    }
}

/// Patterns of a protocol in `DIR/PROTOCOL.json`, a JSON array of
/// `{"id": …, "cps_pattern": …}`.
#[derive(Debug, Clone)]
pub struct JsonPatternLibrary {
    dir: PathBuf,
}

impl JsonPatternLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> JsonPatternLibrary {
        JsonPatternLibrary { dir: dir.into() }
    }
}

impl PatternLibrary for JsonPatternLibrary {
    fn load_patterns(&self, protocol: &str) -> Result<Vec<LibraryPattern>> {
        let path = self.dir.join(format!("{}.json", protocol));
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("pattern library {}", path.display())))
            }
            Err(e) => return Err(e.into()),
        };
        let patterns: Vec<LibraryPattern> = serde_json::from_slice(&bytes)?;
        Ok(patterns
            .into_iter()
            .filter_map(|mut p| {
                p.cps_pattern = normalize(&p.cps_pattern);
                match validate(&p.cps_pattern) {
                    Ok(()) if !p.cps_pattern.is_empty() => Some(p),
                    Ok(()) => None,
                    Err(e) => {
                        debug!("{}: skipping library pattern {}: {}", protocol, p.id, e);
                        None
                    }
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_valid_patterns_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("dns.json"),
            r#"[{"id": "dns-1", "cps_pattern": "<b 0x1234><r 8>"},
                {"id": "bad", "cps_pattern": "<zz>"}]"#,
        )
        .unwrap();
        let lib = JsonPatternLibrary::new(dir.path());
        let p = lib.load_patterns("dns").unwrap();
        assert_eq!(p.len(), 1);
        assert_eq!(p[0].id, "dns-1");
        assert_eq!(lib.select_random_pattern("dns").unwrap().unwrap().id, "dns-1");
        assert!(matches!(lib.load_patterns("quic"), Err(Error::NotFound(_))));
    }

    #[test]
    fn raw_hex_patterns_are_normalized() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("dns.json"),
            r#"[{"id": "hex", "cps_pattern": "0xc000000001"},
                {"id": "empty", "cps_pattern": "  "}]"#,
        )
        .unwrap();
        let p = JsonPatternLibrary::new(dir.path()).load_patterns("dns").unwrap();
        assert_eq!(
            p,
            vec![LibraryPattern {
                id: "hex".into(),
                cps_pattern: "<b 0xc000000001>".into(),
            }]
        );
    }
}
