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

//! Control plane for WireGuard and AmneziaWG tunnels: config files, the peer
//! store and the live interfaces kept in sync, plus peer jobs, rate limits,
//! traffic sampling, CPS pattern adaptation and backups.

#[macro_use]
extern crate log;
#[macro_use]
extern crate anyhow;

mod async_utils;
pub mod backup;
pub mod cli;
pub mod conf_file;
pub mod configuration;
pub mod core;
pub mod cps;
pub mod db;
pub mod error;
pub mod jobs;
pub mod keys;
pub mod peer_store;
mod rate_limit;
pub mod sampler;
pub mod share;
pub mod tools;
pub mod types;
pub mod utils;

#[cfg(test)]
mod testing;

pub use crate::error::{Error, ErrorKind, Result};
