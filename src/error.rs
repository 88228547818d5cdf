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

use std::fmt;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the core to its callers.
#[derive(Debug, Error)]
pub enum Error {
    /// Unparsable tunnel config file.
    #[error("invalid configuration {name}: {reason}")]
    InvalidConfiguration { name: String, reason: String },

    /// Input failed a pre-condition. Safe to retry with corrected input.
    #[error("{0}")]
    ValidationFailed(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0}")]
    ExternalToolFailed(Box<ToolFailure>),

    #[error("backup failed: {0}")]
    BackupFailed(String),

    /// Peer store write failed.
    #[error("peer store: {0}")]
    Transient(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidConfiguration,
    ValidationFailed,
    NotFound,
    AlreadyExists,
    ExternalToolFailed,
    BackupFailed,
    Transient,
}

/// A nonzero exit (or spawn failure) of an external tool.
#[derive(Debug, Clone)]
pub struct ToolFailure {
    pub argv: Vec<String>,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` ", self.argv.join(" "))?;
        match self.code {
            Some(code) => write!(f, "exited with code {}", code)?,
            None => write!(f, "was terminated")?,
        }
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        if !stdout.is_empty() {
            write!(f, ", stdout: {}", stdout)?;
        }
        if !stderr.is_empty() {
            write!(f, ", stderr: {}", stderr)?;
        }
        Ok(())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidConfiguration { .. } => ErrorKind::InvalidConfiguration,
            Error::ValidationFailed(_) => ErrorKind::ValidationFailed,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::ExternalToolFailed(_) => ErrorKind::ExternalToolFailed,
            Error::BackupFailed(_) => ErrorKind::BackupFailed,
            Error::Transient(_) | Error::Io(_) => ErrorKind::Transient,
        }
    }

    pub(crate) fn invalid_config(name: &str, reason: impl fmt::Display) -> Error {
        Error::InvalidConfiguration {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn validation(message: impl fmt::Display) -> Error {
        Error::ValidationFailed(message.to_string())
    }

    pub(crate) fn backup(message: impl fmt::Display) -> Error {
        Error::BackupFailed(message.to_string())
    }

    pub(crate) fn transient(message: impl fmt::Display) -> Error {
        Error::Transient(message.to_string())
    }
}

impl From<ToolFailure> for Error {
    fn from(f: ToolFailure) -> Error {
        Error::ExternalToolFailed(Box::new(f))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::Transient(format!("malformed record: {}", e))
    }
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidConfiguration => "InvalidConfiguration",
            ErrorKind::ValidationFailed => "ValidationFailed",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::ExternalToolFailed => "ExternalToolFailed",
            ErrorKind::BackupFailed => "BackupFailed",
            ErrorKind::Transient => "Transient",
        }
    }

    /// Status code the HTTP edge answers with.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::ValidationFailed => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::AlreadyExists => 409,
            ErrorKind::InvalidConfiguration => 422,
            ErrorKind::ExternalToolFailed | ErrorKind::BackupFailed => 500,
            ErrorKind::Transient => 503,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
