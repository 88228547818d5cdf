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

use crate::configuration::{Configuration, ConfigurationSummary};
use crate::core::Core;
use crate::jobs::PeerJob;
use crate::peer_store::{Peer, PeerSet};
use crate::types::PeerStatus;
use ansi_term::{Color, Style};
use itertools::Itertools;
use std::sync::Arc;

/// Print configurations and their peers. Empty `names` shows all.
pub fn show(core: &Core, names: &[String]) -> anyhow::Result<()> {
    let configurations: Vec<Arc<Configuration>> = if names.is_empty() {
        core.list()
    } else {
        names
            .iter()
            .map(|n| core.get(n))
            .collect::<Result<_, _>>()?
    };
    let styles = Styles::new(atty::is(atty::Stream::Stdout));
    for (i, c) in configurations.iter().enumerate() {
        if i > 0 {
            println!();
        }
        print_configuration(core, c, &styles);
    }
    Ok(())
}

/// One line per configuration.
pub fn show_brief(core: &Core, names: &[String]) -> anyhow::Result<()> {
    for n in names {
        core.get(n)?;
    }
    let styles = Styles::new(atty::is(atty::Stream::Stdout));
    for summary in core
        .summaries()
        .iter()
        .filter(|s| names.is_empty() || names.contains(&s.name))
    {
        print_summary_line(summary, &styles);
    }
    Ok(())
}

fn print_summary_line(summary: &ConfigurationSummary, s: &Styles) {
    print!(
        "{} {} {}",
        s.green.paint(&summary.name),
        summary.protocol,
        if summary.status {
            s.green.paint("up")
        } else {
            s.red.paint("down")
        }
    );
    print!(
        " {}/{}/{} peers",
        summary.running_peers, summary.active_peers, summary.restricted_peers
    );
    if summary.autostart {
        print!(" autostart");
    }
    print!(" ");
    print_human_size(summary.total_data, s.cyan);
    println!();
}

struct Styles {
    green_bold: Style,
    green: Style,
    bold: Style,
    yellow_bold: Style,
    yellow: Style,
    red: Style,
    cyan: Style,
}

impl Styles {
    fn new(is_tty: bool) -> Styles {
        macro_rules! if_tty {
            ($s:expr) => {
                if is_tty {
                    $s
                } else {
                    Style::new()
                }
            };
        }

        Styles {
            green_bold: if_tty!(Color::Green.bold()),
            green: if_tty!(Color::Green.normal()),
            bold: if_tty!(Style::new().bold()),
            yellow_bold: if_tty!(Color::Yellow.bold()),
            yellow: if_tty!(Color::Yellow.normal()),
            red: if_tty!(Color::Red.normal()),
            cyan: if_tty!(Color::Cyan.normal()),
        }
    }
}

fn print_configuration(core: &Core, c: &Configuration, s: &Styles) {
    let summary = c.summary();
    print!("{}", s.green_bold.paint("configuration"));
    println!(": {}", s.green.paint(&summary.name));
    println!("  {}: {}", s.bold.paint("protocol"), summary.protocol);
    println!(
        "  {}: {}",
        s.bold.paint("status"),
        if summary.status {
            s.green.paint("up")
        } else {
            s.red.paint("down")
        }
    );
    println!("  {}: {}", s.bold.paint("public key"), summary.public_key);
    println!("  {}: {}", s.bold.paint("address"), summary.address);
    if let Some(port) = summary.listen_port {
        println!("  {}: {}", s.bold.paint("listening port"), port);
    }
    println!(
        "  {}: {} active, {} restricted, {} running",
        s.bold.paint("peers"),
        summary.active_peers,
        summary.restricted_peers,
        summary.running_peers
    );
    if summary.total_data > 0. {
        print!("  {}: ", s.bold.paint("transfer"));
        print_human_size(summary.total_receive, s.cyan);
        print!(" received, ");
        print_human_size(summary.total_sent, s.cyan);
        println!(" sent");
    }

    for (set, peers) in [
        (PeerSet::Active, c.store().list(PeerSet::Active)),
        (PeerSet::Restricted, c.store().list(PeerSet::Restricted)),
    ] {
        for p in &peers {
            println!();
            print_peer(p, set == PeerSet::Restricted, s);
            print_jobs(&core.jobs().jobs_of(c.name(), &p.id), s);
        }
    }
}

fn print_peer(p: &Peer, restricted: bool, s: &Styles) {
    print!("{}: {}", s.yellow_bold.paint("peer"), s.yellow.paint(&p.id));
    if restricted {
        print!(" {}", s.red.paint("(restricted)"));
    }
    println!();
    if !p.name.is_empty() {
        println!("  {}: {}", s.bold.paint("name"), p.name);
    }
    if !p.preshared_key.is_empty() {
        println!("  {}: (hidden)", s.bold.paint("preshared key"));
    }
    if p.endpoint != "N/A" && !p.endpoint.is_empty() {
        println!("  {}: {}", s.bold.paint("endpoint"), p.endpoint);
    }
    if !p.allowed_ip.is_empty() {
        println!(
            "  {}: {}",
            s.bold.paint("allowed ips"),
            crate::utils::split_list(&p.allowed_ip)
                .map(|ip| match ip.split_once('/') {
                    Some((addr, plen)) => format!("{}{}{}", addr, s.cyan.paint("/"), plen),
                    None => ip.to_string(),
                })
                .join(", ")
        );
    }
    if p.status == PeerStatus::Running {
        println!("  {}: {}", s.bold.paint("latest handshake"), p.latest_handshake);
    }
    let received = p.total_receive + p.cumu_receive;
    let sent = p.total_sent + p.cumu_sent;
    if received > 0. || sent > 0. {
        print!("  {}: ", s.bold.paint("transfer"));
        print_human_size(received, s.cyan);
        print!(" received, ");
        print_human_size(sent, s.cyan);
        println!(" sent");
    }
    if p.has_rate_limit() {
        println!(
            "  {}: {} up, {} down ({})",
            s.bold.paint("rate limit"),
            p.upload_rate_limit,
            p.download_rate_limit,
            p.scheduler_type.unwrap_or_default()
        );
    }
    if p.keepalive > 0 {
        print!("  {}: every ", s.bold.paint("persistent keepalive"));
        print_human_time(p.keepalive as u64, s.cyan);
        println!();
    }
}

fn print_jobs(jobs: &[PeerJob], s: &Styles) {
    for j in jobs {
        println!(
            "  {}: {} if {} {} {}",
            s.bold.paint("job"),
            j.action,
            j.field,
            j.operator,
            j.value
        );
    }
}

fn plural(n: u64, one: &'static str, many: &'static str) -> &'static str {
    if n > 1 {
        many
    } else {
        one
    }
}

fn print_human_time(secs: u64, unit_style: Style) {
    let parts = [
        (secs / 3600, "hour", "hours"),
        (secs % 3600 / 60, "minute", "minutes"),
        (secs % 60, "second", "seconds"),
    ];
    let mut is_first = true;
    for (n, one, many) in parts {
        if n == 0 {
            continue;
        }
        if !is_first {
            print!(", ");
        }
        print!("{} {}", n, unit_style.paint(plural(n, one, many)));
        is_first = false;
    }
}

/// Counters are stored in GiB.
fn print_human_size(gib: f64, unit_style: Style) {
    let bytes = gib * 1024. * 1024. * 1024.;
    if bytes < 1024. {
        print!("{:.0} {}", bytes, unit_style.paint("B"));
    } else if bytes < 1024. * 1024. {
        print!("{:.2} {}", bytes / 1024., unit_style.paint("KiB"));
    } else if gib < 1. {
        print!("{:.2} {}", bytes / (1024. * 1024.), unit_style.paint("MiB"));
    } else {
        print!("{:.2} {}", gib, unit_style.paint("GiB"));
    }
}
