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

use crate::backup::{verify_archive, BackupEngine};
use crate::cli;
use crate::conf_file::ConfFile;
use crate::configuration::{now, InterfaceSettings};
use crate::core::Core;
use crate::keys::{derive_public_key, generate_preshared_key, generate_private_key, is_valid_key};
use crate::tools::Tools;
use anyhow::Context;
use clap::{crate_version, CommandFactory, FromArgMatches, Parser, Subcommand};
use std::io::{stdin, Read};
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "/etc/wgdash/wgdash.toml";

/// WireGuard and AmneziaWG configuration manager.
#[derive(Parser)]
#[clap(name = "wgdash")]
struct Options {
    #[clap(
        short,
        long,
        global = true,
        help = "Load daemon configuration from TOML file [default: /etc/wgdash/wgdash.toml if present]"
    )]
    config_file: Option<PathBuf>,

    #[clap(long, global = true, help = "Set logging (env_logger)", env = "RUST_LOG")]
    log: Option<String>,

    #[clap(long, help = "Number of worker threads", env = "WGDASH_THREADS")]
    threads: Option<usize>,

    #[clap(subcommand)]
    cmd: Option<Cmd>,
}

fn load_config(p: Option<&Path>) -> anyhow::Result<cli::Config> {
    match p {
        Some(p) => cli::load_config_from_path(p, true),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            cli::load_config_from_path(Path::new(DEFAULT_CONFIG_FILE), true)
        }
        None => Ok(cli::Config::default()),
    }
}

fn init_logger(log: Option<&str>, config: &cli::Config) {
    let log = log.or(config.general.log.as_deref()).unwrap_or("warn");
    std::env::set_var("RUST_LOG", log);
    let mut builder = env_logger::Builder::from_default_env();
    if std::env::var_os("NOTIFY_SOCKET").is_some() {
        // Disable log timestamp when running in systemd.
        builder.format_timestamp(None);
    } else {
        builder.format_timestamp_millis();
    }
    builder.init();
}

impl Options {
    fn run(self, version: &str, config: cli::Config) -> anyhow::Result<()> {
        let threads = self
            .threads
            .or(config.general.threads)
            .unwrap_or_else(|| std::cmp::min(2, num_cpus::get()));

        info!("wgdash {}", version);
        info!("Will spawn {} worker threads", threads);
        if threads > 1 {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .worker_threads(threads)
                .build()?;
            rt.block_on(cli::run(config))
        } else {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            rt.block_on(cli::run(config))
        }
    }
}

#[derive(Subcommand)]
enum Cmd {
    #[clap(about = "Show configurations and their peers")]
    Show {
        #[clap(short, long, help = "One line per configuration, without peers")]
        brief: bool,
        #[clap(help = "Configurations to show. Omit to show all")]
        names: Vec<String>,
    },
    #[clap(about = "Check a tunnel config file")]
    Check { file: PathBuf },
    #[clap(about = "Generate private key")]
    Genkey,
    #[clap(about = "Calculate public key from the private key read from stdin")]
    Pubkey,
    #[clap(about = "Generate preshared key")]
    Genpsk,
    #[clap(about = "Back up a configuration")]
    Backup { name: String },
    #[clap(about = "List backups of a configuration")]
    Backups { name: String },
    #[clap(about = "Restore a configuration from a backup (stop the daemon first)")]
    Restore { name: String, id: String },
    #[clap(about = "Delete a backup")]
    DeleteBackup { name: String, id: String },
    #[clap(about = "Export a backup as a checksummed 7z archive")]
    Export {
        name: String,
        id: String,
        output: PathBuf,
    },
    #[clap(about = "Verify the checksums of a backup archive")]
    Verify { archive: PathBuf },
    #[clap(about = "Import a backup archive as a new backup")]
    Import { archive: PathBuf },
}

impl Cmd {
    async fn run(self, config: cli::Config) -> anyhow::Result<()> {
        let tools = Tools::new(&config.tools);
        let backups = BackupEngine::new(config.backup_root());
        match self {
            Cmd::Show { brief, names } => {
                let core = Core::open(config)
                    .await
                    .context("failed to load configurations")?;
                if brief {
                    cli::show_brief(&core, &names)?;
                } else {
                    cli::show(&core, &names)?;
                }
            }
            Cmd::Check { file } => {
                let text = std::fs::read_to_string(&file)
                    .with_context(|| format!("failed to read {}", file.display()))?;
                let conf = match ConfFile::parse(&text) {
                    Ok(conf) => conf,
                    Err(e) => bail!("{}: {}", file.display(), e),
                };
                InterfaceSettings::from_conf(&conf)
                    .validate()
                    .with_context(|| format!("invalid [Interface] in {}", file.display()))?;
                let peers = conf.peers();
                println!(
                    "{}: {} configuration, {} peers",
                    file.display(),
                    conf.protocol(),
                    peers.len()
                );
                for p in peers {
                    if p.name.is_empty() {
                        println!("  {}", p.public_key);
                    } else {
                        println!("  {} ({})", p.public_key, p.name);
                    }
                }
            }
            Cmd::Genkey => match generate_private_key(&tools).await {
                Some(k) => println!("{}", k),
                None => bail!("failed to generate private key"),
            },
            Cmd::Genpsk => match generate_preshared_key(&tools).await {
                Some(k) => println!("{}", k),
                None => bail!("failed to generate preshared key"),
            },
            Cmd::Pubkey => {
                let mut buffer = String::new();
                stdin().read_to_string(&mut buffer)?;
                let sk = buffer.trim();
                if !is_valid_key(sk) {
                    bail!("Expect base64 encoded X25519 secret key (32-byte long)");
                }
                match derive_public_key(&tools, sk).await {
                    Some(k) => println!("{}", k),
                    None => bail!("failed to derive public key"),
                }
            }
            Cmd::Backup { name } => {
                let core = Core::open(config)
                    .await
                    .context("failed to load configurations")?;
                let info = core.get(&name)?.backup().await?;
                println!("{}", info.id);
            }
            Cmd::Backups { name } => {
                for b in backups.list(&name)? {
                    println!(
                        "{}  {}{}{}",
                        b.id,
                        b.created.format("%Y-%m-%d %H:%M:%S"),
                        if b.has_redis { "  peers" } else { "" },
                        if b.has_iptables { "  scripts" } else { "" },
                    );
                }
            }
            Cmd::Restore { name, id } => {
                let core = Core::open(config)
                    .await
                    .context("failed to load configurations")?;
                core.get(&name)?.restore(&id).await?;
                println!("restored {} from {}", name, id);
            }
            Cmd::DeleteBackup { name, id } => backups.delete(&name, &id)?,
            Cmd::Export { name, id, output } => {
                for f in backups.export_archive(&name, &id, &output)? {
                    println!("{}", f);
                }
            }
            Cmd::Verify { archive } => {
                let verified = verify_archive(&archive)?;
                println!(
                    "{}: backup {} of {}, all checksums match",
                    archive.display(),
                    verified.backup_id,
                    verified.configuration
                );
                for f in &verified.files {
                    println!("  {}", f);
                }
            }
            Cmd::Import { archive } => {
                let info = backups.import_archive(&archive, now())?;
                println!("{} {}", info.configuration, info.id);
            }
        }
        Ok(())
    }
}

pub fn real_main() -> anyhow::Result<()> {
    let default_panic_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_panic_hook(panic_info);
        std::process::exit(2);
    }));

    let version = if !env!("GIT_HASH").is_empty() {
        concat!(crate_version!(), "-", env!("GIT_HASH"))
    } else {
        crate_version!()
    };

    let matches = Options::command().version(version).get_matches();
    let mut options = Options::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());
    let config = load_config(options.config_file.as_deref())?;
    init_logger(options.log.as_deref(), &config);

    match options.cmd.take() {
        None => options.run(version, config)?,
        Some(cmd) => {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            rt.block_on(cmd.run(config))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        Options::command().debug_assert();
    }

    #[test]
    fn parses_subcommands() {
        let o = Options::try_parse_from(["wgdash", "-c", "/tmp/x.toml", "restore", "wg0", "20240501120000"])
            .unwrap();
        assert_eq!(o.config_file, Some(PathBuf::from("/tmp/x.toml")));
        match o.cmd {
            Some(Cmd::Restore { name, id }) => {
                assert_eq!(name, "wg0");
                assert_eq!(id, "20240501120000");
            }
            _ => panic!("expected restore"),
        }
        let o = Options::try_parse_from(["wgdash", "show", "--log", "debug"]).unwrap();
        assert_eq!(o.log.as_deref(), Some("debug"));
        assert!(matches!(o.cmd, Some(Cmd::Show { brief: false, names }) if names.is_empty()));
        let o = Options::try_parse_from(["wgdash", "show", "-b", "wg0"]).unwrap();
        assert!(matches!(o.cmd, Some(Cmd::Show { brief: true, names }) if names == ["wg0"]));
        assert!(Options::try_parse_from(["wgdash", "--threads", "4"]).unwrap().cmd.is_none());
    }

    #[test]
    fn missing_default_config_is_default() {
        if !Path::new(DEFAULT_CONFIG_FILE).exists() {
            assert_eq!(load_config(None).unwrap(), cli::Config::default());
        }
    }
}
