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

use std::io::Write;
use std::path::Path;

const BYTES_PER_GIB: f64 = 1024. * 1024. * 1024.;

pub fn bytes_to_gib(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GIB
}

/// Write a file by writing a temporary file in the same directory and
/// renaming it over the destination.
pub fn atomic_write(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::Builder::new()
        .prefix(".wgdash-")
        .tempfile_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(mode))?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Configuration names become interface names and file names, so they are
/// limited to what the kernel accepts for an interface.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 15
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_=+.-".contains(c))
}

/// `1:02:03` or `2 days, 1:02:03`.
pub fn human_duration(secs: u64) -> String {
    let days = secs / 86400;
    let rest = secs % 86400;
    let clock = format!("{}:{:02}:{:02}", rest / 3600, rest % 3600 / 60, rest % 60);
    match days {
        0 => clock,
        1 => format!("1 day, {}", clock),
        d => format!("{} days, {}", d, clock),
    }
}

pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || "_-.".contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "UntitledPeer".into()
    } else {
        trimmed.chars().take(64).collect()
    }
}

/// Split a comma separated list, dropping empty items.
pub fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').map(str::trim).filter(|x| !x.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(human_duration(0), "0:00:00");
        assert_eq!(human_duration(83), "0:01:23");
        assert_eq!(human_duration(86400 + 3723), "1 day, 1:02:03");
        assert_eq!(human_duration(3 * 86400), "3 days, 0:00:00");
    }

    #[test]
    fn names() {
        assert!(is_valid_name("wg0"));
        assert!(is_valid_name("awg-home.1"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("with space"));
        assert!(!is_valid_name("../etc"));
        assert!(!is_valid_name(".."));
        assert!(!is_valid_name("sixteen-chars-xx"));
    }

    #[test]
    fn filenames() {
        assert_eq!(sanitize_filename("Alice's phone"), "Alice_s_phone");
        assert_eq!(sanitize_filename("..."), "UntitledPeer");
        assert_eq!(sanitize_filename(""), "UntitledPeer");
    }

    #[test]
    fn atomic_write_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("x.conf");
        atomic_write(&p, b"one", 0o600).unwrap();
        atomic_write(&p, b"two", 0o600).unwrap();
        assert_eq!(std::fs::read_to_string(&p).unwrap(), "two");
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn lists() {
        let v: Vec<_> = split_list(" 10.0.0.2/32, ,fd00::2/128 ").collect();
        assert_eq!(v, ["10.0.0.2/32", "fd00::2/128"]);
    }
}
