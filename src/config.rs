//! Configuration System using Figment
//!
//! Strongly-typed configuration for a calibration run. Configuration is
//! layered, later layers overriding earlier ones:
//! 1. Built-in defaults (`ZptessConfig::default()`)
//! 2. `config/zptess.toml` (or any file given to [`ZptessConfig::load_from`])
//! 3. Environment variables prefixed with `ZPTESS_`, `__` separating levels
//!
//! Because defaults are merged as a provider, a partial `[reference]` table
//! only overrides the keys it names and the rest keep their per-role defaults.
//!
//! # Example
//! ```no_run
//! use zptess::config::ZptessConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // ZPTESS_CALIBRATION__ROUNDS=3 overrides [calibration] rounds
//! let config = ZptessConfig::load()?;
//! config.validate()?;
//! println!("Rounds: {}", config.calibration.rounds);
//! # Ok(())
//! # }
//! ```

use crate::core::{CentralMethod, Model, Role};
use crate::error::{AppResult, ZptessError};
use crate::transport::Endpoint;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/zptess.toml";

/// Absolute zero point of the `stars3` reference, as measured by LICA.
pub const REF_ZP_ABS: f64 = 20.44;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZptessConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Reference photometer
    pub reference: PhotometerConfig,
    /// Photometer under calibration
    pub test: PhotometerConfig,
    /// Statistics engine settings, shared by both roles
    pub stats: StatsConfig,
    /// Calibration session settings
    pub calibration: CalibrationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

/// One photometer link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotometerConfig {
    /// Hardware model
    pub model: Model,
    /// `serial:<device>:<baud>`, `tcp:<host>:<port>` or `udp:<host>:<port>`
    pub endpoint: String,
    /// Speak the legacy fixed-field protocol instead of JSON
    pub old_protocol: bool,
    /// Dark frequency offset in Hz
    pub frequency_offset: f64,
    /// Deadline for a device info request
    #[serde(with = "humantime_serde")]
    pub info_timeout: Duration,
    /// Deadline for a zero point write or its read-back
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Reconnection policy, applied to TCP endpoints only
    pub retry: RetryConfig,
    /// Fallback device record when a serial TESS-W gives no info
    pub defaults: Option<DeviceDefaults>,
}

/// Reconnection backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// First delay after a failed attempt
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Multiplier applied after each failure
    pub factor: f64,
    /// Upper bound for a single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Give up after this many attempts; unbounded when absent
    pub max_attempts: Option<u32>,
}

/// Known identity of the reference photometer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDefaults {
    /// Device name
    pub name: String,
    /// MAC address
    pub mac: String,
    /// Firmware string
    pub firmware: String,
    /// Stored zero point
    pub zero_point: f64,
}

/// Statistics engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Sliding window capacity
    pub samples: usize,
    /// Central tendency estimator
    pub central: CentralMethod,
    /// Reduction period
    #[serde(with = "humantime_serde")]
    pub period: Duration,
    /// Window fill progress period
    #[serde(with = "humantime_serde")]
    pub progress_period: Duration,
}

/// Calibration session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Number of valid rounds
    pub rounds: u32,
    /// Absolute zero point of the reference photometer
    pub absolute_zero_point: f64,
    /// User offset added to the best zero point
    pub offset: f64,
    /// Person running the calibration
    pub author: String,
    /// Write the final zero point back to the test photometer
    pub update: bool,
    /// Largest window end skew tolerated when pairing; `2 × stats.period` when absent
    #[serde(default, with = "humantime_serde")]
    pub max_skew: Option<Duration>,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            factor: 3.0,
            max_delay: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl Default for DeviceDefaults {
    fn default() -> Self {
        Self {
            name: "stars3".to_string(),
            mac: "18:FE:34:CF:E9:A3".to_string(),
            firmware: String::new(),
            zero_point: REF_ZP_ABS,
        }
    }
}

impl PhotometerConfig {
    /// Reference photometer on the first USB-serial adapter.
    pub fn reference_default() -> Self {
        Self {
            model: Model::TessW,
            endpoint: "serial:/dev/ttyUSB0:9600".to_string(),
            old_protocol: false,
            frequency_offset: 0.0,
            info_timeout: Duration::from_secs(4),
            write_timeout: Duration::from_secs(4),
            retry: RetryConfig::default(),
            defaults: Some(DeviceDefaults::default()),
        }
    }

    /// TESS-W in access point mode, telnet port.
    pub fn test_default() -> Self {
        Self {
            endpoint: "tcp:192.168.4.1:23".to_string(),
            defaults: None,
            ..Self::reference_default()
        }
    }

    /// Parsed endpoint.
    pub fn endpoint(&self) -> AppResult<Endpoint> {
        self.endpoint.parse()
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            samples: 125,
            central: CentralMethod::Median,
            period: Duration::from_secs(5),
            progress_period: Duration::from_millis(1500),
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            rounds: 5,
            absolute_zero_point: REF_ZP_ABS,
            offset: 0.0,
            author: String::new(),
            update: false,
            max_skew: None,
        }
    }
}

impl Default for ZptessConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            reference: PhotometerConfig::reference_default(),
            test: PhotometerConfig::test_default(),
            stats: StatsConfig::default(),
            calibration: CalibrationConfig::default(),
        }
    }
}

impl ZptessConfig {
    /// Load configuration from `config/zptess.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `ZPTESS_`.
    /// Example: `ZPTESS_TEST__ENDPOINT=udp:192.168.4.1:2255`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path. A missing file is not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// The layered provider chain, exposed so callers can merge extra layers.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(ZptessConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ZPTESS_").split("__"))
    }

    /// Photometer settings for a role.
    pub fn photometer(&self, role: Role) -> &PhotometerConfig {
        match role {
            Role::Reference => &self.reference,
            Role::Test => &self.test,
        }
    }

    /// Mutable photometer settings for a role.
    pub fn photometer_mut(&mut self, role: Role) -> &mut PhotometerConfig {
        match role {
            Role::Reference => &mut self.reference,
            Role::Test => &mut self.test,
        }
    }

    /// Effective pairing skew tolerance.
    pub fn max_skew(&self) -> Duration {
        self.calibration.max_skew.unwrap_or(self.stats.period * 2)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ZptessError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(ZptessError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        for role in [Role::Reference, Role::Test] {
            let phot = self.photometer(role);
            phot.endpoint()?;
            if !phot.frequency_offset.is_finite() || phot.frequency_offset < 0.0 {
                return Err(ZptessError::Configuration(format!(
                    "Invalid {} frequency_offset {}. Must be a finite value >= 0",
                    role, phot.frequency_offset
                )));
            }
            if phot.retry.factor < 1.0 {
                return Err(ZptessError::Configuration(format!(
                    "Invalid {} retry factor {}. Must be >= 1.0",
                    role, phot.retry.factor
                )));
            }
        }

        if self.stats.samples < 2 {
            return Err(ZptessError::Configuration(format!(
                "Invalid samples {}. A window needs at least 2 samples",
                self.stats.samples
            )));
        }

        if self.stats.period.is_zero() || self.stats.progress_period.is_zero() {
            return Err(ZptessError::Configuration(
                "Statistics periods must be greater than zero".to_string(),
            ));
        }

        if self.calibration.rounds == 0 {
            return Err(ZptessError::Configuration(
                "Invalid rounds 0. At least one round is required".to_string(),
            ));
        }

        let numbers = [
            ("offset", self.calibration.offset),
            ("absolute_zero_point", self.calibration.absolute_zero_point),
        ];
        for (name, value) in numbers {
            if !value.is_finite() {
                return Err(ZptessError::Configuration(format!(
                    "Invalid {} {}. Must be finite",
                    name, value
                )));
            }
        }

        Ok(())
    }
}
