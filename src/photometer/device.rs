//! How a photometer model is asked for its info and told a new zero point.
//!
//! The strategy is picked once, when the link is built: TESS-W answers over
//! its embedded web server, TESS-P and TAS answer solicited requests on the
//! record stream itself.

use crate::core::Model;
use crate::error::{AppResult, ZptessError};
use crate::logging::PROTOCOL_TARGET;
use crate::protocol::{tessw_page, RawInfo};
use std::time::Duration;
use tracing::debug;

/// HTTP client for the TESS-W status and set-constant pages.
#[derive(Debug, Clone)]
pub struct TesswHttp {
    client: reqwest::Client,
    host: String,
}

impl TesswHttp {
    /// Client for the device at `host` (`address` or `address:port`).
    pub fn new(host: impl Into<String>) -> AppResult<Self> {
        let host = host.into();
        reqwest::Url::parse(&tessw_page::info_url(&host)).map_err(|e| {
            ZptessError::Configuration(format!("Invalid TESS-W host '{}': {}", host, e))
        })?;
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client, host })
    }

    async fn get(&self, url: &str, timeout: Duration) -> AppResult<String> {
        debug!(target: PROTOCOL_TARGET, "==> TESS-W [HTTP GET] {}", url);
        let text = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        debug!(target: PROTOCOL_TARGET, "<== TESS-W [HTTP GET] {} ({} bytes)", url, text.len());
        Ok(text)
    }

    /// Scrapes the status page.
    pub async fn read_info(&self, timeout: Duration) -> AppResult<RawInfo> {
        let page = self.get(&tessw_page::info_url(&self.host), timeout).await?;
        tessw_page::parse_info(&page)
    }

    /// Stores a zero point and returns the value the device confirms.
    pub async fn write_zero_point(&self, zero_point: f64, timeout: Duration) -> AppResult<f64> {
        let page = self
            .get(&tessw_page::write_url(&self.host, zero_point), timeout)
            .await?;
        tessw_page::parse_flash(&page)
    }
}

/// Info and zero point strategy of a link.
#[derive(Debug, Clone)]
pub enum InfoSource {
    /// TESS-W web pages.
    Http(TesswHttp),
    /// Solicited requests on the record stream.
    Solicited,
    /// No way to reach the device's info (TESS-W on a serial line).
    Unavailable(String),
}

impl InfoSource {
    /// Strategy for `model`, reaching the device at `host` when networked.
    pub fn for_model(model: Model, host: Option<&str>) -> AppResult<Self> {
        match (model, host) {
            (Model::TessW, Some(host)) => Ok(InfoSource::Http(TesswHttp::new(host)?)),
            (Model::TessW, None) => Ok(InfoSource::Unavailable(
                "TESS-W info needs a network endpoint".to_string(),
            )),
            (Model::TessP | Model::Tas, _) => Ok(InfoSource::Solicited),
        }
    }

    /// Error to report when the source is unavailable.
    pub(crate) fn unavailable_error(reason: &str) -> ZptessError {
        ZptessError::Transport(reason.to_string())
    }
}
