use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Relay(#[from] portmapper_core::error::Error),
    #[error("io")]
    Io(#[from] io::Error),
    #[error("invalid config file: {0}")]
    Config(#[from] serde_json::Error),
    #[error("invalid argument:{0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, Error>;
