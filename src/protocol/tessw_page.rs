//! TESS-W embedded web pages.
//!
//! Info is scraped from `http://<host>/config`; a zero point is stored with
//! `http://<host>/setconst?cons=<zp>` whose answer echoes
//! `New Zero Point <zp>`.

use super::RawInfo;
use crate::error::{AppResult, ZptessError};
use once_cell::sync::Lazy;
use regex::Regex;

static NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(stars\d+)").expect("Invalid name regex"));

static MAC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"MAC: ([0-9A-Fa-f]{1,2}:[0-9A-Fa-f]{1,2}:[0-9A-Fa-f]{1,2}:[0-9A-Fa-f]{1,2}:[0-9A-Fa-f]{1,2}:[0-9A-Fa-f]{1,2})",
    )
    .expect("Invalid MAC regex")
});

// Older firmware labels the zero point "CI".
static ZP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(ZP|CI): (\d{1,2}\.\d{1,2})").expect("Invalid ZP regex"));

static FIRMWARE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Compiled: (.+?)<br>").expect("Invalid firmware regex"));

static FLASH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"New Zero Point (\d{1,2}\.\d{1,2})").expect("Invalid flash regex")
});

/// Firmware builds that send JSON records without a line terminator.
pub const CONFLICTING_FIRMWARE: &[&str] = &["Nov 25 2021 v 3.2"];

/// Status page URL.
pub fn info_url(host: &str) -> String {
    format!("http://{}/config", host)
}

/// Zero point write URL.
pub fn write_url(host: &str, zero_point: f64) -> String {
    format!("http://{}/setconst?cons={:.2}", host, zero_point)
}

/// True for firmware that needs `}` framing.
pub fn is_conflicting_firmware(firmware: &str) -> bool {
    CONFLICTING_FIRMWARE.contains(&firmware.trim())
}

fn capture(regex: &Regex, text: &str, group: usize, field: &str) -> AppResult<String> {
    regex
        .captures(text)
        .and_then(|caps| caps.get(group))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| ZptessError::Parse(format!("TESS-W {} not found in status page", field)))
}

/// Extracts device fields from the status page.
pub fn parse_info(html: &str) -> AppResult<RawInfo> {
    let name = capture(&NAME, html, 1, "name")?;
    let mac = capture(&MAC, html, 1, "MAC")?;
    let zero_point = capture(&ZP, html, 2, "ZP")?
        .parse::<f64>()
        .map_err(|e| ZptessError::Parse(format!("TESS-W ZP: {}", e)))?;
    let firmware = capture(&FIRMWARE, html, 1, "firmware")?;
    Ok(RawInfo {
        name,
        mac,
        firmware,
        zero_point,
    })
}

/// Extracts the confirmed zero point from the write page answer.
pub fn parse_flash(html: &str) -> AppResult<f64> {
    capture(&FLASH, html, 1, "zero point confirmation")?
        .parse::<f64>()
        .map_err(|e| ZptessError::Parse(format!("TESS-W zero point confirmation: {}", e)))
}
