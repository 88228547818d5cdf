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

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Read and parse the daemon configuration from the file at the specified
/// path.
///
/// `print_warnings`: Print warnings to stderr directly instead of go through
/// the logger.
pub fn load_config_from_path(p: &Path, print_warnings: bool) -> anyhow::Result<Config> {
    let mut file = OpenOptions::new()
        .read(true)
        .open(p)
        .context("failed to open config file")?;
    {
        use std::os::unix::fs::MetadataExt;
        if let Ok(m) = file.metadata() {
            if m.mode() & 0o004 != 0 {
                if print_warnings {
                    eprintln!("[WARN  wgdash::cli::config] configuration file is world readable");
                } else {
                    warn!("configuration file is world readable");
                }
            }
        }
    }
    let mut content = String::new();
    file.read_to_string(&mut content)
        .context("failed to read config file")?;
    let mut config: Config = toml::from_str(&content).context("failed to parse config file")?;
    config.general.config_file_path = Some(p.into());
    config.validate()?;
    Ok(config)
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub peers: PeerDefaults,

    #[serde(default)]
    pub sampler: SamplerConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct GeneralConfig {
    pub log: Option<String>,

    pub threads: Option<usize>,

    /// Configurations brought up when the daemon starts.
    #[serde(default)]
    pub autostart: Vec<String>,

    #[serde(skip)]
    pub config_file_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    pub wg_conf_path: PathBuf,
    pub awg_conf_path: PathBuf,
    pub iptables_path: PathBuf,
    pub db_path: PathBuf,
    /// Where interface presence is observed.
    pub interfaces_path: PathBuf,
    pub cps_library_path: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> PathsConfig {
        PathsConfig {
            wg_conf_path: "/etc/wireguard".into(),
            awg_conf_path: "/etc/amnezia/amneziawg".into(),
            iptables_path: "/etc/wgdash/iptable-rules".into(),
            db_path: "/var/lib/wgdash/db".into(),
            interfaces_path: "/sys/class/net".into(),
            cps_library_path: "/etc/wgdash/cps-patterns".into(),
        }
    }
}

/// Command lines of the external tools. Leading words are kept, so
/// `sudo traffic-weir` works.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub wg: String,
    pub wg_quick: String,
    pub awg: String,
    pub awg_quick: String,
    pub tc_helper: String,
    pub ip: String,
}

impl Default for ToolsConfig {
    fn default() -> ToolsConfig {
        ToolsConfig {
            wg: "wg".into(),
            wg_quick: "wg-quick".into(),
            awg: "awg".into(),
            awg_quick: "awg-quick".into(),
            tc_helper: "/usr/local/bin/traffic-weir".into(),
            ip: "ip".into(),
        }
    }
}

/// Defaults for new and adopted peers.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PeerDefaults {
    pub dns: String,
    pub endpoint_allowed_ip: String,
    pub mtu: u32,
    pub keepalive: u32,
    pub remote_endpoint: String,
}

impl Default for PeerDefaults {
    fn default() -> PeerDefaults {
        PeerDefaults {
            dns: "1.1.1.1".into(),
            endpoint_allowed_ip: "0.0.0.0/0".into(),
            mtu: 1420,
            keepalive: 21,
            remote_endpoint: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Seconds between transfer/handshake/endpoint polls.
    pub transfer_interval: u64,
    /// Seconds between job scheduler ticks.
    pub jobs_interval: u64,
    pub cps_check_interval: u64,
    /// Correct stored totals that look like they were recorded with sent and
    /// received swapped.
    pub swap_detection: bool,
}

impl Default for SamplerConfig {
    fn default() -> SamplerConfig {
        SamplerConfig {
            transfer_interval: 10,
            jobs_interval: 15,
            cps_check_interval: 86400,
            swap_detection: true,
        }
    }
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        for name in &self.general.autostart {
            if !crate::utils::is_valid_name(name) {
                bail!("invalid autostart configuration name: {}", name);
            }
        }
        if self.sampler.transfer_interval == 0 || self.sampler.jobs_interval == 0 {
            bail!("sampler intervals must be positive");
        }
        if self.peers.mtu > 1460 {
            bail!("default peer MTU must be in 0..=1460");
        }
        Ok(())
    }

    /// Directory holding the config file of a configuration.
    pub fn conf_dir(&self, protocol: crate::types::Protocol) -> &Path {
        match protocol {
            crate::types::Protocol::Plain => &self.paths.wg_conf_path,
            crate::types::Protocol::Obfuscated => &self.paths.awg_conf_path,
        }
    }

    pub fn backup_root(&self) -> PathBuf {
        self.paths.wg_conf_path.join("WGDashboard_Backup")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE_CONFIG: &str = r##"[General]
log = "info"
autostart = ["wg0"]

[Paths]
wg_conf_path = "/tmp/wireguard"

[Tools]
tc_helper = "sudo /opt/traffic-weir"

[Peers]
dns = "9.9.9.9"
keepalive = 0

[Sampler]
swap_detection = false
"##;

    #[test]
    fn deserialization() {
        let config: Config = toml::from_str(EXAMPLE_CONFIG).unwrap();
        config.validate().unwrap();
        assert_eq!(config.general.log.as_deref(), Some("info"));
        assert_eq!(config.general.autostart, vec!["wg0".to_string()]);
        assert_eq!(config.paths.wg_conf_path, PathBuf::from("/tmp/wireguard"));
        assert_eq!(
            config.paths.awg_conf_path,
            PathBuf::from("/etc/amnezia/amneziawg")
        );
        assert_eq!(config.tools.tc_helper, "sudo /opt/traffic-weir");
        assert_eq!(config.tools.wg, "wg");
        assert_eq!(config.peers.dns, "9.9.9.9");
        assert_eq!(config.peers.keepalive, 0);
        assert_eq!(config.peers.mtu, 1420);
        assert!(!config.sampler.swap_detection);
        assert_eq!(config.sampler.transfer_interval, 10);
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn bad_autostart_name() {
        let config: Config = toml::from_str("[General]\nautostart = [\"../x\"]\n").unwrap();
        assert!(config.validate().is_err());
    }
}
