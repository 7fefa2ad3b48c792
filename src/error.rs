use std::path::PathBuf;
use thiserror::Error;

pub type AppResult<T> = Result<T, GateError>;

#[derive(Debug, Error)]
pub enum GateError {
    /// No backend tunnel is connected.
    #[error("tunnel is down")]
    TunnelDown,

    /// The backend violated the handoff protocol.
    #[error("tunnel protocol: {0}")]
    TunnelProtocol(&'static str),

    #[error("password store: {0}")]
    Store(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sys(#[from] nix::errno::Errno),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed directive: {0}")]
    Malformed(String),
}
