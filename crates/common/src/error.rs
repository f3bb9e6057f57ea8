//! Common error types

use protocol::{HidError, HidErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Hid(#[from] HidError),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Transport error kind, if this error came from the engine
    pub fn hid_kind(&self) -> Option<HidErrorKind> {
        match self {
            Error::Hid(e) => Some(e.kind()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
