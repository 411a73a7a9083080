use thiserror::Error;

use crate::session::SessionId;

#[derive(Error, Debug)]
pub enum TftpError {
    #[error("cannot bind portal socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("cannot open transfer socket: {0}")]
    Connect(#[source] std::io::Error),

    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),

    #[error("receive failed: {0}")]
    Receive(#[source] std::io::Error),

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("session table full ({capacity} sessions)")]
    TableFull { capacity: usize },

    #[error("{size} byte packet exceeds retransmit buffer of {capacity} bytes")]
    RetransmitOverflow { size: usize, capacity: usize },

    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error("no sessions left")]
    NoSessions,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TftpError>;
