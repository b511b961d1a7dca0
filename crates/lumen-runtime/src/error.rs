use std::fmt;

use lumen_core::ProtocolError;

#[derive(Debug)]
pub enum RuntimeError {
    Io(std::io::Error),
    Toml(toml::de::Error),
    Config(String),
    Protocol(ProtocolError),
    Recording(String),
    InvalidState(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Io(e) => write!(f, "I/O error: {e}"),
            RuntimeError::Toml(e) => write!(f, "config parse error: {e}"),
            RuntimeError::Config(msg) => write!(f, "invalid config: {msg}"),
            RuntimeError::Protocol(e) => write!(f, "protocol error: {e}"),
            RuntimeError::Recording(msg) => write!(f, "bad recording: {msg}"),
            RuntimeError::InvalidState(msg) => write!(f, "invalid daemon state: {msg}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<std::io::Error> for RuntimeError {
    fn from(e: std::io::Error) -> Self {
        RuntimeError::Io(e)
    }
}

impl From<toml::de::Error> for RuntimeError {
    fn from(e: toml::de::Error) -> Self {
        RuntimeError::Toml(e)
    }
}

impl From<ProtocolError> for RuntimeError {
    fn from(e: ProtocolError) -> Self {
        RuntimeError::Protocol(e)
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
