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

//! Invocations of `wg`/`awg`, their `-quick` wrappers, the traffic shaping
//! helper and `ip`.

use crate::cli::ToolsConfig;
use crate::error::{Result, ToolFailure};
use crate::types::Protocol;
use std::io::Write;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const TOOL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
struct CommandLine {
    program: String,
    prefix: Vec<String>,
}

impl CommandLine {
    fn parse(s: &str) -> CommandLine {
        let mut words = s.split_whitespace().map(String::from);
        CommandLine {
            program: words.next().unwrap_or_default(),
            prefix: words.collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowKind {
    Transfer,
    LatestHandshakes,
    Endpoints,
}

impl ShowKind {
    fn as_str(self) -> &'static str {
        match self {
            ShowKind::Transfer => "transfer",
            ShowKind::LatestHandshakes => "latest-handshakes",
            ShowKind::Endpoints => "endpoints",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuickAction {
    Up,
    Down,
    Save,
}

impl QuickAction {
    fn as_str(self) -> &'static str {
        match self {
            QuickAction::Up => "up",
            QuickAction::Down => "down",
            QuickAction::Save => "save",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tools {
    wg: CommandLine,
    wg_quick: CommandLine,
    awg: CommandLine,
    awg_quick: CommandLine,
    tc_helper: CommandLine,
    ip: CommandLine,
}

impl Tools {
    pub fn new(c: &ToolsConfig) -> Tools {
        Tools {
            wg: CommandLine::parse(&c.wg),
            wg_quick: CommandLine::parse(&c.wg_quick),
            awg: CommandLine::parse(&c.awg),
            awg_quick: CommandLine::parse(&c.awg_quick),
            tc_helper: CommandLine::parse(&c.tc_helper),
            ip: CommandLine::parse(&c.ip),
        }
    }

    fn ctl(&self, protocol: Protocol) -> &CommandLine {
        match protocol {
            Protocol::Plain => &self.wg,
            Protocol::Obfuscated => &self.awg,
        }
    }

    fn quick_ctl(&self, protocol: Protocol) -> &CommandLine {
        match protocol {
            Protocol::Plain => &self.wg_quick,
            Protocol::Obfuscated => &self.awg_quick,
        }
    }

    async fn run(&self, cmd: &CommandLine, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let mut argv = cmd.prefix.clone();
        argv.extend(args.iter().map(|a| a.to_string()));
        let full_argv = || {
            std::iter::once(cmd.program.clone())
                .chain(argv.iter().cloned())
                .collect::<Vec<_>>()
        };
        debug!("running {}", full_argv().join(" "));

        let mut child = Command::new(&cmd.program)
            .args(&argv)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolFailure {
                argv: full_argv(),
                code: None,
                stdout: String::new(),
                stderr: format!("failed to spawn: {}", e),
            })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            pipe.write_all(b"\n").await?;
        }

        let output = match tokio::time::timeout(TOOL_TIMEOUT, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(ToolFailure {
                    argv: full_argv(),
                    code: None,
                    stdout: String::new(),
                    stderr: format!("timed out after {:?}", TOOL_TIMEOUT),
                }
                .into())
            }
        };
        if !output.status.success() {
            return Err(ToolFailure {
                argv: full_argv(),
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub async fn genkey(&self) -> Result<String> {
        Ok(self.run(&self.wg, &["genkey"], None).await?.trim().into())
    }

    pub async fn genpsk(&self) -> Result<String> {
        Ok(self.run(&self.wg, &["genpsk"], None).await?.trim().into())
    }

    /// The private key goes through stdin, never the argument vector.
    pub async fn pubkey(&self, private_key: &str) -> Result<String> {
        Ok(self
            .run(&self.wg, &["pubkey"], Some(private_key.trim()))
            .await?
            .trim()
            .into())
    }

    pub async fn show(&self, protocol: Protocol, iface: &str, kind: ShowKind) -> Result<String> {
        self.run(self.ctl(protocol), &["show", iface, kind.as_str()], None)
            .await
    }

    /// `set IFACE peer PK allowed-ips IPS [preshared-key FILE]`.
    ///
    /// The preshared key is written to a fresh 0600 temporary file which is
    /// unlinked when this function returns, however it returns.
    pub async fn set_peer(
        &self,
        protocol: Protocol,
        iface: &str,
        public_key: &str,
        allowed_ips: &str,
        preshared_key: Option<&str>,
    ) -> Result<()> {
        let psk_file = match preshared_key {
            Some(k) if !k.trim().is_empty() => Some(write_secret(k.trim())?),
            _ => None,
        };
        let psk_path = psk_file
            .as_ref()
            .map(|f| f.path().to_string_lossy().into_owned());
        let allowed_ips = allowed_ips.replace(' ', "");
        let mut args = vec!["set", iface, "peer", public_key, "allowed-ips", &allowed_ips];
        if let Some(ref p) = psk_path {
            args.push("preshared-key");
            args.push(p);
        }
        self.run(self.ctl(protocol), &args, None).await?;
        Ok(())
    }

    pub async fn remove_peer(&self, protocol: Protocol, iface: &str, public_key: &str) -> Result<()> {
        self.run(
            self.ctl(protocol),
            &["set", iface, "peer", public_key, "remove"],
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn quick(&self, protocol: Protocol, action: QuickAction, iface: &str) -> Result<()> {
        self.run(self.quick_ctl(protocol), &[action.as_str(), iface], None)
            .await?;
        Ok(())
    }

    pub async fn flush_ipv6(&self, iface: &str) -> Result<()> {
        self.run(&self.ip, &["-6", "addr", "flush", "dev", iface], None)
            .await?;
        Ok(())
    }

    pub async fn add_address(&self, iface: &str, address: &str) -> Result<()> {
        let family = if address.contains(':') { "-6" } else { "-4" };
        self.run(&self.ip, &[family, "addr", "add", address, "dev", iface], None)
            .await?;
        Ok(())
    }

    pub async fn tc_helper(&self, args: &[&str]) -> Result<String> {
        self.run(&self.tc_helper, args, None).await
    }
}

fn write_secret(secret: &str) -> std::io::Result<tempfile::NamedTempFile> {
    // tempfile creates files with mode 0600 and a random name.
    let mut f = tempfile::Builder::new().prefix("wgdash-psk-").tempfile()?;
    writeln!(f, "{}", secret)?;
    f.flush()?;
    Ok(f)
}
