//! Configuration error types shared by the gateway crates

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    /// A required secret is absent in an environment that forbids generated
    /// stand-ins. The payload names the variable, never the value.
    #[error("Missing secret: {0} must be set outside development")]
    MissingSecret(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
