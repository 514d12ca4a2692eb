//! Custom error types for the calibrator.
//!
//! This module defines the primary error type, `ZptessError`, shared by every
//! component of the calibration engine. Using the `thiserror` crate, it gives a
//! single place where the failure modes of photometer I/O, configuration and
//! numeric reduction are named.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: figment extraction failures and semantic
//!   validation failures of the loaded configuration.
//! - **`Transport`**: the device is unreachable (connection refused, lost,
//!   serial port cannot be opened). TCP links retry these with backoff.
//! - **`Timeout`**: the device is reachable but did not answer an info or
//!   zero-point request before its deadline. Never retried.
//! - **`Parse`**: a line or HTML page did not carry what we expected. Line-level
//!   parse failures are logged and dropped where they happen; this variant only
//!   escapes for whole-request failures such as a status page without a MAC.
//! - **`StatisticsDegenerate`**: a reduction over a window that cannot produce a
//!   meaningful estimate. Suppressed by the statistics engine.
//! - **`BusClosed`**: the event bus has no sender left; fatal for a session.
//!
//! `is_timeout()` and `is_transport()` let callers distinguish "device present
//! but unresponsive" from "device unreachable".

use crate::core::Role;
use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, ZptessError>;

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum ZptessError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid endpoint '{0}'. Expected serial:<device>:<baud>, tcp:<host>:<port> or udp:<host>:<port>")]
    InvalidEndpoint(String),

    #[error("Serial support not enabled. Rebuild with --features tokio_serial")]
    SerialFeatureDisabled,

    #[error("Degenerate statistics: {0}")]
    StatisticsDegenerate(String),

    #[error("Event bus closed")]
    BusClosed,

    #[error("No photometer info available for {0}")]
    NoDeviceInfo(Role),

    #[error("Photometer link not started")]
    LinkNotStarted,
}

impl ZptessError {
    /// True when the device answered nothing before a request deadline.
    pub fn is_timeout(&self) -> bool {
        match self {
            ZptessError::Timeout(_) => true,
            ZptessError::Http(err) => err.is_timeout(),
            _ => false,
        }
    }

    /// True when the device could not be reached at all.
    pub fn is_transport(&self) -> bool {
        match self {
            ZptessError::Transport(_) | ZptessError::Io(_) => true,
            ZptessError::Http(err) => err.is_connect(),
            _ => false,
        }
    }
}

impl From<figment::Error> for ZptessError {
    fn from(value: figment::Error) -> Self {
        ZptessError::Config(Box::new(value))
    }
}
