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

//! Round-tripping reader/writer of `wg-quick` style config files.
//!
//! The file is kept as lines. Edits touch only the lines they are about, so
//! comments, blank lines and key spelling survive a rewrite.

use crate::types::Protocol;
use std::collections::HashMap;
use std::fmt::Write;

pub const OBFUSCATION_KEYS: [&str; 9] = ["Jc", "Jmin", "Jmax", "S1", "S2", "H1", "H2", "H3", "H4"];

pub const CPS_KEYS: [&str; 5] = ["I1", "I2", "I3", "I4", "I5"];

const INTERFACE_KEYS: [&str; 11] = [
    "PrivateKey",
    "Address",
    "ListenPort",
    "DNS",
    "Table",
    "MTU",
    "PreUp",
    "PostUp",
    "PreDown",
    "PostDown",
    "SaveConfig",
];

const PEER_KEYS: [&str; 5] = [
    "PublicKey",
    "PresharedKey",
    "AllowedIPs",
    "Endpoint",
    "PersistentKeepalive",
];

const NAME_MARKER: &str = "#Name#";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionKind {
    Interface,
    Peer,
}

#[derive(Debug, Clone, PartialEq)]
enum LineKind {
    Section(SectionKind),
    Entry { key: &'static str, value: String },
    Name(String),
    Other,
}

#[derive(Debug, Clone, PartialEq)]
struct Line {
    text: String,
    kind: LineKind,
}

impl Line {
    fn entry(key: &'static str, value: &str) -> Line {
        Line {
            text: format!("{} = {}", key, value),
            kind: LineKind::Entry {
                key,
                value: value.into(),
            },
        }
    }

    fn section(kind: SectionKind) -> Line {
        Line {
            text: match kind {
                SectionKind::Interface => "[Interface]".into(),
                SectionKind::Peer => "[Peer]".into(),
            },
            kind: LineKind::Section(kind),
        }
    }

    fn name(name: &str) -> Line {
        Line {
            text: format!("{} = {}", NAME_MARKER, name),
            kind: LineKind::Name(name.into()),
        }
    }

    fn blank() -> Line {
        Line {
            text: String::new(),
            kind: LineKind::Other,
        }
    }

    fn key(&self) -> Option<&'static str> {
        match self.kind {
            LineKind::Entry { key, .. } => Some(key),
            _ => None,
        }
    }

    fn is_blank_or_name(&self) -> bool {
        matches!(self.kind, LineKind::Name(_)) || self.text.trim().is_empty()
    }
}

/// Canonical spelling of `key` if it is allowed in `section`.
fn canonical_key(section: SectionKind, key: &str) -> Option<&'static str> {
    let allowed: &[&[&'static str]] = match section {
        SectionKind::Interface => &[&INTERFACE_KEYS, &OBFUSCATION_KEYS, &CPS_KEYS],
        SectionKind::Peer => &[&PEER_KEYS],
    };
    allowed
        .iter()
        .flat_map(|keys| keys.iter())
        .find(|k| k.eq_ignore_ascii_case(key))
        .copied()
}

fn parse_name(line: &str) -> Option<String> {
    let rest = line.trim().strip_prefix(NAME_MARKER)?;
    let rest = rest.trim_start().strip_prefix('=')?;
    Some(rest.trim().to_string())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerSection {
    pub public_key: String,
    pub preshared_key: String,
    pub allowed_ips: String,
    pub endpoint: String,
    pub persistent_keepalive: String,
    /// From the `#Name#` comment before the section.
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfFile {
    lines: Vec<Line>,
}

impl ConfFile {
    pub fn parse(text: &str) -> Result<ConfFile, String> {
        let mut lines = Vec::new();
        let mut section = None;
        let mut seen_interface = false;
        for (n, raw) in text.lines().enumerate() {
            let n = n + 1;
            let t = raw.trim();
            let kind = if let Some(name) = parse_name(t) {
                LineKind::Name(name)
            } else if t.is_empty() || t.starts_with('#') || t.starts_with(';') {
                LineKind::Other
            } else if t.starts_with('[') {
                let kind = match t.to_ascii_lowercase().as_str() {
                    "[interface]" => {
                        if seen_interface {
                            return Err(format!("line {}: duplicate [Interface] section", n));
                        }
                        seen_interface = true;
                        SectionKind::Interface
                    }
                    "[peer]" => SectionKind::Peer,
                    _ => return Err(format!("line {}: unknown section {}", n, t)),
                };
                section = Some(kind);
                LineKind::Section(kind)
            } else {
                let (k, v) = t
                    .split_once('=')
                    .ok_or_else(|| format!("line {}: expected KEY = VALUE", n))?;
                let s = section.ok_or_else(|| format!("line {}: entry outside of a section", n))?;
                let key = canonical_key(s, k.trim())
                    .ok_or_else(|| format!("line {}: unknown key {}", n, k.trim()))?;
                LineKind::Entry {
                    key,
                    value: v.trim().to_string(),
                }
            };
            lines.push(Line {
                text: raw.trim_end().to_string(),
                kind,
            });
        }
        if !seen_interface {
            return Err("missing [Interface] section".into());
        }
        Ok(ConfFile { lines })
    }

    /// A file with only an `[Interface]` section holding the nonempty values
    /// of `entries`.
    pub fn with_interface(entries: &[(&str, &str)]) -> ConfFile {
        let mut lines = vec![Line::section(SectionKind::Interface)];
        for (k, v) in entries {
            if v.trim().is_empty() {
                continue;
            }
            if let Some(key) = canonical_key(SectionKind::Interface, k) {
                lines.push(Line::entry(key, v.trim()));
            }
        }
        ConfFile { lines }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for l in &self.lines {
            let _ = writeln!(out, "{}", l.text);
        }
        out
    }

    /// `(kind, header index, end index)` of every section.
    fn sections(&self) -> Vec<(SectionKind, usize, usize)> {
        let mut v: Vec<(SectionKind, usize, usize)> = Vec::new();
        for (i, l) in self.lines.iter().enumerate() {
            if let LineKind::Section(kind) = l.kind {
                if let Some(last) = v.last_mut() {
                    last.2 = i;
                }
                v.push((kind, i, self.lines.len()));
            }
        }
        v
    }

    fn interface_span(&self) -> Option<(usize, usize)> {
        self.sections()
            .into_iter()
            .find(|s| s.0 == SectionKind::Interface)
            .map(|s| (s.1, s.2))
    }

    fn peer_span(&self, public_key: &str) -> Option<(usize, usize)> {
        self.sections()
            .into_iter()
            .filter(|s| s.0 == SectionKind::Peer)
            .find(|s| {
                self.lines[s.1..s.2].iter().any(|l| match &l.kind {
                    LineKind::Entry { key, value } => *key == "PublicKey" && value == public_key,
                    _ => false,
                })
            })
            .map(|s| (s.1, s.2))
    }

    fn find_in(&self, span: (usize, usize), key: &str) -> Option<usize> {
        (span.0..span.1).find(|&i| self.lines[i].key() == Some(key))
    }

    /// Index after the last entry of a section, before trailing blank lines
    /// and the next section's name comment.
    fn end_of_entries(&self, span: (usize, usize)) -> usize {
        let mut end = span.1;
        while end > span.0 + 1 && self.lines[end - 1].is_blank_or_name() {
            end -= 1;
        }
        end
    }

    pub fn interface_value(&self, key: &str) -> Option<&str> {
        let span = self.interface_span()?;
        let i = self.find_in(span, canonical_key(SectionKind::Interface, key)?)?;
        match &self.lines[i].kind {
            LineKind::Entry { value, .. } => Some(value),
            _ => None,
        }
    }

    /// `(key, value)` of every `[Interface]` entry in file order.
    pub fn interface_entries(&self) -> Vec<(&'static str, String)> {
        let span = match self.interface_span() {
            Some(s) => s,
            None => return Vec::new(),
        };
        self.lines[span.0..span.1]
            .iter()
            .filter_map(|l| match &l.kind {
                LineKind::Entry { key, value } => Some((*key, value.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn protocol(&self) -> Protocol {
        if OBFUSCATION_KEYS
            .iter()
            .any(|k| self.interface_value(k).is_some())
        {
            Protocol::Obfuscated
        } else {
            Protocol::Plain
        }
    }

    /// Set an `[Interface]` value in place. New CPS and obfuscation keys go
    /// right after the last obfuscation line (or the preceding `I` line);
    /// anything else new goes at the end of the section. An empty value
    /// removes the key.
    pub fn set_interface(&mut self, key: &str, value: &str) {
        let key = match canonical_key(SectionKind::Interface, key) {
            Some(k) => k,
            None => return,
        };
        if value.trim().is_empty() {
            self.remove_interface(key);
            return;
        }
        let span = match self.interface_span() {
            Some(s) => s,
            None => {
                self.lines.insert(0, Line::section(SectionKind::Interface));
                (0, 1)
            }
        };
        if let Some(i) = self.find_in(span, key) {
            self.lines[i] = Line::entry(key, value.trim());
            return;
        }
        let anchors: Vec<&str> = match CPS_KEYS.iter().position(|k| *k == key) {
            Some(p) => OBFUSCATION_KEYS.iter().chain(&CPS_KEYS[..p]).copied().collect(),
            None if OBFUSCATION_KEYS.contains(&key) => OBFUSCATION_KEYS.to_vec(),
            None => Vec::new(),
        };
        let after_anchor = (span.0..span.1)
            .rev()
            .find(|&i| self.lines[i].key().map_or(false, |k| anchors.contains(&k)));
        let at = match after_anchor {
            Some(i) => i + 1,
            None => self.end_of_entries(span),
        };
        self.lines.insert(at, Line::entry(key, value.trim()));
    }

    pub fn remove_interface(&mut self, key: &str) {
        if let (Some(span), Some(key)) = (
            self.interface_span(),
            canonical_key(SectionKind::Interface, key),
        ) {
            if let Some(i) = self.find_in(span, key) {
                self.lines.remove(i);
            }
        }
    }

    pub fn peers(&self) -> Vec<PeerSection> {
        let mut peers = Vec::new();
        let mut pending_name = None;
        let mut current: Option<PeerSection> = None;
        for l in &self.lines {
            match &l.kind {
                LineKind::Name(n) => pending_name = Some(n.clone()),
                LineKind::Section(kind) => {
                    peers.extend(current.take());
                    if *kind == SectionKind::Peer {
                        current = Some(PeerSection {
                            name: pending_name.take().unwrap_or_default(),
                            ..PeerSection::default()
                        });
                    }
                }
                LineKind::Entry { key, value } => {
                    if let Some(ref mut p) = current {
                        let field = match *key {
                            "PublicKey" => &mut p.public_key,
                            "PresharedKey" => &mut p.preshared_key,
                            "AllowedIPs" => &mut p.allowed_ips,
                            "Endpoint" => &mut p.endpoint,
                            _ => &mut p.persistent_keepalive,
                        };
                        *field = value.clone();
                    }
                }
                LineKind::Other => (),
            }
        }
        peers.extend(current);
        peers.retain(|p| !p.public_key.is_empty());
        peers
    }

    pub fn append_peer(&mut self, peer: &PeerSection) {
        if self.lines.last().map_or(false, |l| !l.text.trim().is_empty()) {
            self.lines.push(Line::blank());
        }
        if !peer.name.is_empty() {
            self.lines.push(Line::name(&peer.name));
        }
        self.lines.push(Line::section(SectionKind::Peer));
        self.lines.push(Line::entry("PublicKey", &peer.public_key));
        let optional = [
            ("PresharedKey", &peer.preshared_key),
            ("AllowedIPs", &peer.allowed_ips),
            ("Endpoint", &peer.endpoint),
            ("PersistentKeepalive", &peer.persistent_keepalive),
        ];
        for (k, v) in optional {
            if !v.trim().is_empty() && !(k == "PersistentKeepalive" && v.trim() == "0") {
                self.lines.push(Line::entry(k, v.trim()));
            }
        }
    }

    /// Remove a `[Peer]` section with its name comment. Returns whether the
    /// peer was present.
    pub fn remove_peer(&mut self, public_key: &str) -> bool {
        let (header, end) = match self.peer_span(public_key) {
            Some(s) => s,
            None => return false,
        };
        let mut start = header;
        while start > 0 && self.lines[start - 1].is_blank_or_name() {
            start -= 1;
        }
        // Keep the name comment of the section that follows.
        let mut stop = end;
        if end < self.lines.len() {
            if let Some(i) = (header..end).find(|&i| {
                matches!(self.lines[i].kind, LineKind::Name(_))
                    && self.lines[i..end].iter().all(Line::is_blank_or_name)
            }) {
                stop = i;
            }
        }
        self.lines.drain(start..stop);
        if start > 0 && start < self.lines.len() {
            self.lines.insert(start, Line::blank());
        }
        true
    }

    /// Set a value of a `[Peer]` section in place, or add it at the end of
    /// the section. An empty value removes the key.
    pub fn set_peer_value(&mut self, public_key: &str, key: &str, value: &str) -> bool {
        let key = match canonical_key(SectionKind::Peer, key) {
            Some(k) => k,
            None => return false,
        };
        let span = match self.peer_span(public_key) {
            Some(s) => s,
            None => return false,
        };
        match (self.find_in(span, key), value.trim().is_empty()) {
            (Some(i), true) => {
                self.lines.remove(i);
            }
            (Some(i), false) => self.lines[i] = Line::entry(key, value.trim()),
            (None, true) => (),
            (None, false) => {
                let at = self.end_of_entries(span);
                self.lines.insert(at, Line::entry(key, value.trim()));
            }
        }
        true
    }

    /// Replace every `#Name#` comment with the names in `names`, each placed
    /// right before its peer's section.
    pub fn set_peer_names(&mut self, names: &HashMap<String, String>) {
        let old = std::mem::take(&mut self.lines);
        let mut lines: Vec<Line> = Vec::with_capacity(old.len());
        let mut headers = Vec::new();
        for l in old {
            if matches!(l.kind, LineKind::Name(_)) {
                continue;
            }
            if l.kind == LineKind::Section(SectionKind::Peer) {
                headers.push(lines.len());
            }
            lines.push(l);
        }
        self.lines = lines;
        for &h in headers.iter().rev() {
            let span = self
                .sections()
                .into_iter()
                .find(|s| s.1 == h)
                .map(|s| (s.1, s.2));
            let pk = span.and_then(|span| {
                self.find_in(span, "PublicKey").and_then(|i| match &self.lines[i].kind {
                    LineKind::Entry { value, .. } => Some(value.clone()),
                    _ => None,
                })
            });
            if let Some(name) = pk.and_then(|pk| names.get(&pk)) {
                if !name.is_empty() {
                    self.lines.insert(h, Line::name(name));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OBF: &str = "\
[Interface]
PrivateKey = 2BJtcgPUjHfKKN3yMvTiVQbJ/UgHj2tcZE6xU/4BdGM=
Address = 10.9.0.1/24
ListenPort = 51820
Jc = 4
Jmin = 40
Jmax = 70
H4 = 4
PostUp = iptables -A FORWARD -i %i -j ACCEPT

#Name# = alice
[Peer]
PublicKey = Ck8P+fUguLIf17zmb3eWxxS7PqgN3+ciMFBlSwqRaw4=
AllowedIPs = 10.9.0.2/32

; a comment
#Name# = bob
[Peer]
PublicKey = NGnPOc0pxlnOjQz5DDSBJsSM6rf2T1MjBduxmvKBLiU=
AllowedIPs = 10.9.0.3/32
PersistentKeepalive = 21
";

    #[test]
    fn parse_and_render_round_trip() {
        let f = ConfFile::parse(OBF).unwrap();
        assert_eq!(f.render(), OBF);
        assert_eq!(f.protocol(), Protocol::Obfuscated);
        assert_eq!(f.interface_value("listenport"), Some("51820"));
        let peers = f.peers();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].name, "alice");
        assert_eq!(peers[1].name, "bob");
        assert_eq!(peers[1].persistent_keepalive, "21");
    }

    #[test]
    fn rejects_broken_files() {
        assert!(ConfFile::parse("[Interface]\n[Interface]\n").is_err());
        assert!(ConfFile::parse("[Interface]\nFoo = 1\n").is_err());
        assert!(ConfFile::parse("Address = 1\n[Interface]\n").is_err());
        assert!(ConfFile::parse("[Peer]\nPublicKey = x\n").is_err());
        assert!(ConfFile::parse("[Interface]\nAddress\n").is_err());
        assert!(ConfFile::parse("[Wat]\n").is_err());
    }

    #[test]
    fn plain_protocol() {
        let f = ConfFile::parse("[Interface]\nAddress = 10.0.0.1/24\n").unwrap();
        assert_eq!(f.protocol(), Protocol::Plain);
    }

    #[test]
    fn cps_keys_go_after_obfuscation_block_in_order() {
        let mut f = ConfFile::parse(OBF).unwrap();
        f.set_interface("I2", "<c>");
        f.set_interface("I1", "<t>");
        f.set_interface("MTU", "1380");
        let entries: Vec<_> = f.interface_entries().into_iter().map(|e| e.0).collect();
        assert_eq!(
            entries,
            [
                "PrivateKey",
                "Address",
                "ListenPort",
                "Jc",
                "Jmin",
                "Jmax",
                "H4",
                "I1",
                "I2",
                "PostUp",
                "MTU"
            ]
        );
        f.set_interface("I1", "<r 4>");
        assert_eq!(f.interface_value("I1"), Some("<r 4>"));
        f.set_interface("I1", "");
        assert_eq!(f.interface_value("I1"), None);
        // The name comment of the first peer stays attached.
        assert_eq!(f.peers()[0].name, "alice");
    }

    #[test]
    fn remove_peer_keeps_neighbour_names() {
        let mut f = ConfFile::parse(OBF).unwrap();
        assert!(f.remove_peer("Ck8P+fUguLIf17zmb3eWxxS7PqgN3+ciMFBlSwqRaw4="));
        let peers = f.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "bob");
        assert!(!f.render().contains("alice"));
        assert!(!f.remove_peer("Ck8P+fUguLIf17zmb3eWxxS7PqgN3+ciMFBlSwqRaw4="));

        let mut f = ConfFile::parse(OBF).unwrap();
        f.remove_peer("NGnPOc0pxlnOjQz5DDSBJsSM6rf2T1MjBduxmvKBLiU=");
        assert_eq!(f.peers().len(), 1);
        assert_eq!(f.peers()[0].name, "alice");
        assert!(!f.render().contains("bob"));
    }

    #[test]
    fn append_and_rename() {
        let mut f = ConfFile::with_interface(&[
            ("PrivateKey", "2BJtcgPUjHfKKN3yMvTiVQbJ/UgHj2tcZE6xU/4BdGM="),
            ("Address", "10.9.0.1/24"),
            ("DNS", ""),
        ]);
        f.append_peer(&PeerSection {
            public_key: "Ck8P+fUguLIf17zmb3eWxxS7PqgN3+ciMFBlSwqRaw4=".into(),
            allowed_ips: "10.9.0.2/32".into(),
            persistent_keepalive: "0".into(),
            name: "carol".into(),
            ..PeerSection::default()
        });
        assert_eq!(
            f.render(),
            "[Interface]\nPrivateKey = 2BJtcgPUjHfKKN3yMvTiVQbJ/UgHj2tcZE6xU/4BdGM=\nAddress = 10.9.0.1/24\n\n#Name# = carol\n[Peer]\nPublicKey = Ck8P+fUguLIf17zmb3eWxxS7PqgN3+ciMFBlSwqRaw4=\nAllowedIPs = 10.9.0.2/32\n"
        );

        let mut names = HashMap::new();
        names.insert(
            "Ck8P+fUguLIf17zmb3eWxxS7PqgN3+ciMFBlSwqRaw4=".to_string(),
            "dave".to_string(),
        );
        f.set_peer_names(&names);
        assert_eq!(f.peers()[0].name, "dave");
        assert!(!f.render().contains("carol"));

        assert!(f.set_peer_value(
            "Ck8P+fUguLIf17zmb3eWxxS7PqgN3+ciMFBlSwqRaw4=",
            "Endpoint",
            "1.2.3.4:51820"
        ));
        assert_eq!(f.peers()[0].endpoint, "1.2.3.4:51820");
        assert_eq!(ConfFile::parse(&f.render()).unwrap(), f);
    }
}
