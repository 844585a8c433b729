use std::io;

/// Rejections from the fixed-capacity tables.
///
/// A rejected operation always leaves the table unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("table is full")]
    Full,

    #[error("entry already exists")]
    Duplicate,

    #[error("entry clashes with an existing entry")]
    Clash,

    #[error("invalid route")]
    InvalidRoute,

    #[error("invalid id")]
    InvalidId,

    #[error("invalid ARP entry")]
    InvalidArp,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("interface {name} not found")]
    InterfaceNotFound { name: String },

    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error(transparent)]
    Table(#[from] TableError),
}

pub type Result<T> = std::result::Result<T, Error>;
