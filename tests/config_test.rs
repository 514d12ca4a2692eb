//! Layered configuration loading.

use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;
use zptess::config::ZptessConfig;
use zptess::core::{CentralMethod, Model};
use zptess::ZptessError;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn missing_file_gives_defaults() {
    let config = ZptessConfig::load_from("/nonexistent/zptess.toml").unwrap();
    assert_eq!(config.reference.endpoint, "serial:/dev/ttyUSB0:9600");
    assert_eq!(config.stats.period, Duration::from_secs(5));
    assert!(config.validate().is_ok());
}

#[test]
fn partial_file_overrides_only_named_keys() {
    let file = write_config(
        r#"
[test]
model = "TAS"
endpoint = "udp:192.168.4.1:2255"
info_timeout = "2s"

[stats]
samples = 25
central = "mode"
"#,
    );
    let config = ZptessConfig::load_from(file.path()).unwrap();

    assert_eq!(config.test.model, Model::Tas);
    assert_eq!(config.test.endpoint, "udp:192.168.4.1:2255");
    assert_eq!(config.test.info_timeout, Duration::from_secs(2));
    assert_eq!(config.test.write_timeout, Duration::from_secs(4));
    assert!(config.test.defaults.is_none());

    assert_eq!(config.reference.endpoint, "serial:/dev/ttyUSB0:9600");
    assert_eq!(
        config.reference.defaults.as_ref().map(|d| d.name.as_str()),
        Some("stars3")
    );

    assert_eq!(config.stats.samples, 25);
    assert_eq!(config.stats.central, CentralMethod::Mode);
    assert_eq!(config.stats.progress_period, Duration::from_millis(1500));
    assert!(config.validate().is_ok());
}

#[test]
fn explicit_max_skew_is_used() {
    let file = write_config("[calibration]\nmax_skew = \"3s\"\n");
    let config = ZptessConfig::load_from(file.path()).unwrap();
    assert_eq!(config.max_skew(), Duration::from_secs(3));
}

#[test]
fn environment_overrides_file() {
    let file = write_config("[calibration]\nauthor = \"from file\"\nrounds = 7\n");
    std::env::set_var("ZPTESS_CALIBRATION__AUTHOR", "from env");
    let config = ZptessConfig::load_from(file.path());
    std::env::remove_var("ZPTESS_CALIBRATION__AUTHOR");

    let config = config.unwrap();
    assert_eq!(config.calibration.author, "from env");
    assert_eq!(config.calibration.rounds, 7);
}

#[test]
fn malformed_values_are_rejected() {
    let file = write_config("[stats]\nsamples = \"many\"\n");
    assert!(matches!(
        ZptessConfig::load_from(file.path()),
        Err(ZptessError::Config(_))
    ));

    let file = write_config("[reference]\nendpoint = \"ftp://nowhere\"\n");
    let config = ZptessConfig::load_from(file.path()).unwrap();
    assert!(config.validate().is_err());

    let file = write_config("[stats]\nsamples = 1\n");
    let config = ZptessConfig::load_from(file.path()).unwrap();
    assert!(matches!(
        config.validate(),
        Err(ZptessError::Configuration(_))
    ));
}
