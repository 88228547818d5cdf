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

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Plain WireGuard, driven by `wg`, or AmneziaWG, driven by `awg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Plain,
    Obfuscated,
}

impl Protocol {
    /// Value of the `-protocol` flag of the traffic shaping helper.
    pub fn tc_flag(self) -> &'static str {
        match self {
            Protocol::Plain => "plain",
            Protocol::Obfuscated => "obf",
        }
    }

    pub fn is_obfuscated(self) -> bool {
        self == Protocol::Obfuscated
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Plain => "wg",
            Protocol::Obfuscated => "awg",
        })
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Protocol, String> {
        match s {
            "wg" | "plain" => Ok(Protocol::Plain),
            "awg" | "obf" | "obfuscated" => Ok(Protocol::Obfuscated),
            _ => Err(format!("unknown protocol: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Running,
    Stopped,
}

impl Default for PeerStatus {
    fn default() -> PeerStatus {
        PeerStatus::Stopped
    }
}

/// Queueing discipline used by the traffic shaping helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    Htb,
    Hfsc,
    Cake,
}

impl Default for SchedulerKind {
    fn default() -> SchedulerKind {
        SchedulerKind::Htb
    }
}

impl SchedulerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SchedulerKind::Htb => "htb",
            SchedulerKind::Hfsc => "hfsc",
            SchedulerKind::Cake => "cake",
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchedulerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<SchedulerKind, String> {
        match s {
            "htb" => Ok(SchedulerKind::Htb),
            "hfsc" => Ok(SchedulerKind::Hfsc),
            "cake" => Ok(SchedulerKind::Cake),
            _ => Err(format!("scheduler must be one of htb, hfsc, cake, got {}", s)),
        }
    }
}

/// Which counters `reset_peer_data` clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterKind {
    Total,
    Receive,
    Sent,
}

/// Outcome of a batch peer operation. Batches never stop at the first
/// failing peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchResult {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl BatchResult {
    pub fn ok(&mut self, id: impl Into<String>) {
        self.succeeded.push(id.into());
    }

    pub fn fail(&mut self, id: impl Into<String>, reason: impl fmt::Display) {
        self.failed.push((id.into(), reason.to_string()));
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for BatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed",
            self.succeeded.len(),
            self.failed.len()
        )
    }
}
