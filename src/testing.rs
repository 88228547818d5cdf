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

//! Stub tool environment for tests.
//!
//! Every tool is `sh STUB TOOL STATE_DIR ...`, so nothing is ever exec'ed
//! directly from a freshly written file.

use crate::cli::Config;
use crate::core::Core;
use crate::tools::Tools;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub const KEY_A: &str = "Ck8P+fUguLIf17zmb3eWxxS7PqgN3+ciMFBlSwqRaw4=";
pub const KEY_B: &str = "NGnPOc0pxlnOjQz5DDSBJsSM6rf2T1MjBduxmvKBLiU=";
pub const KEY_C: &str = "INZz5evbJBekyvtjRLHdnigrKeJ7HxOXR7lLm6yqMW4=";
pub const PRIVATE_KEY: &str = "2BJtcgPUjHfKKN3yMvTiVQbJ/UgHj2tcZE6xU/4BdGM=";
pub const PSK: &str = "w64eiHxoUHU8DcFexHWzqILOvbWx9U+dxxh8iQqJr+k=";

const STUB: &str = r##"tool="$1"; state="$2"; shift 2
echo "$tool $*" >> "$state/calls.log"
if [ -f "$state/fail_$1" ]; then
    echo "stub failure: $1" >&2
    exit 1
fi
case "$tool" in
wg|awg)
    case "$1" in
    genkey|genpsk) head -c 32 /dev/urandom | base64 ;;
    pubkey)
        read -r k
        h=$(printf '%s' "$k" | sha256sum | cut -c1-42)
        echo "${h}A="
        ;;
    show)
        f="$state/show_$2_$3"
        if [ -f "$f" ]; then cat "$f"; fi
        ;;
    esac
    ;;
wg-quick|awg-quick)
    case "$1" in
    up) touch "$state/net/$2" ;;
    down) rm -f "$state/net/$2" ;;
    esac
    ;;
esac
exit 0
"##;

pub struct TestEnv {
    pub dir: TempDir,
    pub config: Config,
}

impl TestEnv {
    pub fn new() -> TestEnv {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for sub in ["wg", "awg", "db", "net", "iptables", "cps", "state"] {
            std::fs::create_dir_all(root.join(sub)).unwrap();
        }
        std::fs::write(root.join("stub.sh"), STUB).unwrap();

        let stub = root.join("stub.sh");
        let state = root.join("state");
        let tool = |name: &str| format!("sh {} {} {}", stub.display(), name, state.display());

        let mut config = Config::default();
        config.paths.wg_conf_path = root.join("wg");
        config.paths.awg_conf_path = root.join("awg");
        config.paths.db_path = root.join("db");
        config.paths.interfaces_path = root.join("state").join("net");
        config.paths.iptables_path = root.join("iptables");
        config.paths.cps_library_path = root.join("cps");
        config.tools.wg = tool("wg");
        config.tools.wg_quick = tool("wg-quick");
        config.tools.awg = tool("awg");
        config.tools.awg_quick = tool("awg-quick");
        config.tools.tc_helper = tool("tc-helper");
        config.tools.ip = tool("ip");
        std::fs::create_dir_all(&config.paths.interfaces_path).unwrap();
        TestEnv { dir, config }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn tools(&self) -> Tools {
        Tools::new(&self.config.tools)
    }

    pub async fn core(&self) -> Arc<Core> {
        Core::open(self.config.clone()).await.unwrap()
    }

    fn state(&self) -> PathBuf {
        self.root().join("state")
    }

    /// Make the next invocations of subcommand `sub` exit with 1.
    pub fn fail(&self, sub: &str) {
        std::fs::write(self.state().join(format!("fail_{}", sub)), "").unwrap();
    }

    pub fn unfail(&self, sub: &str) {
        let _ = std::fs::remove_file(self.state().join(format!("fail_{}", sub)));
    }

    /// Output of `show IFACE KIND`.
    pub fn set_show(&self, iface: &str, kind: &str, content: &str) {
        std::fs::write(self.state().join(format!("show_{}_{}", iface, kind)), content).unwrap();
    }

    pub fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.state().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    pub fn clear_calls(&self) {
        let _ = std::fs::remove_file(self.state().join("calls.log"));
    }

    pub fn conf_path(&self, name: &str) -> PathBuf {
        self.config.paths.wg_conf_path.join(format!("{}.conf", name))
    }

    pub fn read_conf(&self, name: &str) -> String {
        std::fs::read_to_string(self.conf_path(name)).unwrap()
    }
}
