use crate::session::SessionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Session(#[from] SessionError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("lost connection to {addr}")]
    Disconnected { addr: String },
}
