//! # zptess Core Library
//!
//! Zero point calibration of TESS light-pollution photometers. A photometer
//! under test is compared against a certified reference over several rounds
//! and a corrected zero point is derived from the ratio of their measured
//! frequencies.
//!
//! ## Crate Structure
//!
//! - **`error`**: the `ZptessError` enum and the `AppResult` alias.
//! - **`config`**: layered configuration (defaults, TOML file, environment).
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`core`**: the data model shared by every component.
//! - **`bus`**: the typed in-process event bus connecting the components.
//! - **`protocol`**: decoders for the device wire formats and the TESS-W web page.
//! - **`transport`**: serial, TCP and UDP line transports and the reconnection policy.
//! - **`photometer`**: the photometer link, one per role.
//! - **`stats`**: sliding window statistics, one service per role.
//! - **`calibration`**: round pairing and the final summary.
//! - **`session`**: assembles the above for one run.
//!
//! ## Data flow
//!
//! ```text
//! device ─▶ transport ─▶ protocol ─▶ photometer ─phot_sample─▶ stats
//!   stats ─stats_info─▶ calibration ─calib_round_info/calib_summary_info/calib_end─▶ …
//! ```

pub mod bus;
pub mod calibration;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod photometer;
pub mod protocol;
pub mod session;
pub mod stats;
pub mod transport;

pub use error::{AppResult, ZptessError};
