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

use crate::async_utils::AsyncScope;
use crate::cli::systemd;
use crate::cli::Config;
use crate::core::Core;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn schedule_force_shutdown() {
    std::thread::spawn(|| {
        std::thread::sleep(SHUTDOWN_GRACE);
        warn!("Clean shutdown seem to have failed. Force shutting down.");
        std::process::exit(0);
    });
}

async fn rescan_on_sighup(core: Arc<Core>) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    while hangup.recv().await.is_some() {
        info!("rescanning configuration directories");
        match core.rescan().await {
            Ok(names) if !names.is_empty() => info!("loaded {}", names.join(", ")),
            Ok(_) => (),
            Err(e) => warn!("error in rescanning: {}", e),
        }
    }
    Ok(())
}

/// Run the daemon: the transfer sampler, the job scheduler and the CPS
/// check, until SIGINT or SIGTERM.
pub async fn run(c: Config) -> anyhow::Result<()> {
    let scope0 = AsyncScope::new();

    scope0.spawn_canceller(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for SIGINT: {}", e);
            return futures::future::pending().await;
        }
        info!("Received SIGINT or Ctrl-C, shutting down.");
    });
    scope0.spawn_canceller(async move {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
                info!("Received SIGTERM, shutting down.");
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                futures::future::pending::<()>().await;
            }
        }
    });

    // Config files, backups and the peer store hold keys.
    nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(0o077));
    if !nix::unistd::geteuid().is_root() {
        warn!("not running as root, the tunnel tools will likely fail");
    }

    let sampler = c.sampler.clone();
    let core = Core::open(c).await.context("failed to load configurations")?;
    info!("loaded {} configurations", core.list().len());
    core.autostart().await;

    let mut loops = Vec::new();
    {
        let core = core.clone();
        loops.push(scope0.spawn_periodic(
            Duration::from_secs(sampler.transfer_interval),
            move || {
                let core = core.clone();
                async move { core.sample_all().await }
            },
        ));
    }
    {
        let core = core.clone();
        loops.push(scope0.spawn_periodic(
            Duration::from_secs(sampler.jobs_interval),
            move || {
                let core = core.clone();
                async move {
                    let ran = core.tick_jobs().await;
                    if ran > 0 {
                        debug!("job scheduler ran {} actions", ran);
                    }
                }
            },
        ));
    }
    if sampler.cps_check_interval > 0 {
        let core = core.clone();
        loops.push(scope0.spawn_periodic(
            Duration::from_secs(sampler.cps_check_interval),
            move || {
                let core = core.clone();
                async move {
                    core.cps_check();
                }
            },
        ));
    }
    {
        let core = core.clone();
        scope0.spawn_async(async move {
            rescan_on_sighup(core)
                .await
                .unwrap_or_else(|e| warn!("error in rescan_on_sighup: {}", e))
        });
    }

    systemd::notify_ready().unwrap_or_else(|e| warn!("failed to notify systemd: {}", e));

    scope0.cancelled().await;
    systemd::notify_stopping().unwrap_or_else(|e| warn!("failed to notify systemd: {}", e));
    schedule_force_shutdown();
    futures::future::join_all(loops).await;
    Ok(())
}
