//! Minimal RFC 1350 TFTP server
//!
//! Read requests only, octet mode only. Every transfer runs as a session on
//! its own UDP socket; a single [`Scheduler`] multiplexes all of them on one
//! thread and drives retransmission with exponential backoff.

pub mod audit;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod fs;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod stats;
pub mod timer;
pub mod transport;

pub use config::{LogFormat, LoggingConfig, ProcessConfig, SessionConfig, TftpConfig};
pub use error::{Result, TftpError};
pub use scheduler::Scheduler;
