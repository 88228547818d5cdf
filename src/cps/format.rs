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

//! CPS pattern grammar: `<b 0xHEX>`, `<c>`, `<t>`, `<r N>`, `<rc N>`,
//! `<rd N>`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::OnceLock;

const MIN_LEN: u32 = 1;
const MAX_LEN: u32 = 1000;

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<(b\s+0x[0-9a-fA-F]+|c|t|r\s+\d+|rc\s+\d+|rd\s+\d+)>").unwrap()
    })
}

fn any_tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<([^<>]*)>").unwrap())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tag {
    Bytes(Vec<u8>),
    Counter,
    Timestamp,
    Random(u32),
    RandomChars(u32),
    RandomDigits(u32),
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Bytes(b) => write!(f, "<b 0x{}>", hex::encode(b)),
            Tag::Counter => f.write_str("<c>"),
            Tag::Timestamp => f.write_str("<t>"),
            Tag::Random(n) => write!(f, "<r {}>", n),
            Tag::RandomChars(n) => write!(f, "<rc {}>", n),
            Tag::RandomDigits(n) => write!(f, "<rd {}>", n),
        }
    }
}

impl Tag {
    fn from_inner(inner: &str) -> Option<Tag> {
        let mut words = inner.split_whitespace();
        let head = words.next()?;
        let arg = words.next();
        if words.next().is_some() {
            return None;
        }
        match (head, arg) {
            ("c", None) => Some(Tag::Counter),
            ("t", None) => Some(Tag::Timestamp),
            ("b", Some(h)) => {
                let h = h.strip_prefix("0x").or_else(|| h.strip_prefix("0X"))?;
                decode_hex(h).map(Tag::Bytes)
            }
            ("r", Some(n)) => n.parse().ok().map(Tag::Random),
            ("rc", Some(n)) => n.parse().ok().map(Tag::RandomChars),
            ("rd", Some(n)) => n.parse().ok().map(Tag::RandomDigits),
            _ => None,
        }
    }
}

/// Odd length hex gets a leading zero.
fn decode_hex(h: &str) -> Option<Vec<u8>> {
    if h.is_empty() {
        return None;
    }
    if h.len() % 2 == 1 {
        hex::decode(format!("0{}", h)).ok()
    } else {
        hex::decode(h).ok()
    }
}

/// Ordered tags of a pattern. Text outside tags is dropped.
pub fn parse_tags(value: &str) -> Vec<Tag> {
    tag_regex()
        .captures_iter(value)
        .filter_map(|c| Tag::from_inner(&c[1]))
        .collect()
}

/// Raw `0x…` hex becomes a single `<b 0x…>` tag; anything else is kept as
/// is.
pub fn normalize(value: &str) -> String {
    let v = value.trim();
    let is_raw_hex = (v.starts_with("0x") || v.starts_with("0X"))
        && v.len() > 2
        && v[2..].chars().all(|c| c.is_ascii_hexdigit());
    if is_raw_hex {
        format!("<b {}>", v)
    } else {
        v.into()
    }
}

/// Check that `value` is made only of known tags with arguments in range.
/// An empty value is valid.
pub fn validate(value: &str) -> Result<(), String> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(());
    }
    let mut last_end = 0;
    for m in any_tag_regex().captures_iter(value) {
        let Some(whole) = m.get(0) else { continue };
        let between = &value[last_end..whole.start()];
        if !between.trim().is_empty() {
            return Err(format!("unexpected text outside of tags: {:?}", between.trim()));
        }
        last_end = whole.end();

        let inner = m[1].trim();
        let tag = Tag::from_inner(inner).ok_or_else(|| format!("invalid tag <{}>", inner))?;
        match tag {
            Tag::Random(n) | Tag::RandomChars(n) | Tag::RandomDigits(n) => {
                if !(MIN_LEN..=MAX_LEN).contains(&n) {
                    return Err(format!(
                        "length in <{}> must be within {}..={}",
                        inner, MIN_LEN, MAX_LEN
                    ));
                }
            }
            Tag::Bytes(ref b) if b.is_empty() => {
                return Err(format!("empty byte string in <{}>", inner));
            }
            _ => (),
        }
    }
    let rest = &value[last_end..];
    if !rest.trim().is_empty() {
        return Err(format!("unexpected text outside of tags: {:?}", rest.trim()));
    }
    if last_end == 0 {
        return Err("pattern contains no tags".into());
    }
    Ok(())
}

/// First 8 bytes of `sha256(seed)`, big endian.
pub fn seed_from(seed: &str) -> u64 {
    let digest = Sha256::digest(seed.as_bytes());
    let mut b = [0u8; 8];
    b.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(b)
}

/// Deterministic randomized mutation of a pattern.
///
/// Lengths move by up to a quarter of their value, a few bytes of every byte
/// string are replaced, and sometimes an extra random tag is appended. The
/// same `(value, seed)` always gives the same result.
pub fn scramble(value: &str, seed: &str) -> String {
    let tags = parse_tags(value);
    if tags.is_empty() {
        return value.into();
    }
    let mut rng = StdRng::seed_from_u64(seed_from(seed));
    let mut out = String::new();
    for tag in tags {
        let t = match tag {
            Tag::Counter | Tag::Timestamp => tag,
            Tag::Random(n) => Tag::Random(jitter(&mut rng, n)),
            Tag::RandomChars(n) => Tag::RandomChars(jitter(&mut rng, n)),
            Tag::RandomDigits(n) => Tag::RandomDigits(jitter(&mut rng, n)),
            Tag::Bytes(mut b) => {
                let count = (b.len() / 10).clamp(1, 10).min(b.len());
                for i in rand::seq::index::sample(&mut rng, b.len(), count).iter() {
                    b[i] = rng.gen();
                }
                Tag::Bytes(b)
            }
        };
        out.push_str(&t.to_string());
    }
    if rng.gen_bool(0.3) {
        let n = rng.gen_range(8..=32);
        let extra = match rng.gen_range(0..3) {
            0 => Tag::Random(n),
            1 => Tag::RandomChars(n),
            _ => Tag::RandomDigits(n),
        };
        out.push_str(&extra.to_string());
    }
    out
}

fn jitter(rng: &mut StdRng, n: u32) -> u32 {
    let d = i64::from(n / 4);
    let delta = if d > 0 { rng.gen_range(-d..=d) } else { 0 };
    (i64::from(n) + delta).clamp(i64::from(MIN_LEN), i64::from(MAX_LEN)) as u32
}

/// Seed string of the scrambled variant for the interface line (`role` is
/// `"interface"`) or for one peer (`role` is the peer id). `index` is 1..=5.
pub fn scramble_seed(configuration: &str, role: &str, index: usize) -> String {
    format!("{}|{}|I{}", configuration, role, index)
}
