use serde::{Deserialize, Serialize};

/// Classification of device-channel failures.
///
/// The executor maps every channel error to one of these kinds and reports
/// the step as failed; it never propagates a channel error out of the
/// kernel loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelErrorKind {
    /// The tunnel port did not accept a connection.
    Unreachable,
    /// The device is known but its channel reports it gone.
    Offline,
    /// The command reached the device but failed there.
    CommandFailed,
    /// The command did not complete within its deadline.
    Timeout,
}

impl std::fmt::Display for ChannelErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unreachable => "unreachable",
            Self::Offline => "offline",
            Self::CommandFailed => "command_failed",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Shared error type used across all fleetgate crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("channel ({kind}): {message}")]
    Channel {
        kind: ChannelErrorKind,
        message: String,
    },

    #[error("device: {0}")]
    Device(String),

    #[error("task: {0}")]
    Task(String),

    #[error("parse: {0}")]
    Parse(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a channel error with the given kind.
    pub fn channel(kind: ChannelErrorKind, message: impl Into<String>) -> Self {
        Self::Channel {
            kind,
            message: message.into(),
        }
    }

    /// The channel error kind, if this is a channel error.
    pub fn channel_kind(&self) -> Option<ChannelErrorKind> {
        match self {
            Self::Channel { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
