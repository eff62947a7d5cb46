//! Weather providers.
//!
//! Every provider returns one [`WeatherFrame`] per requested site id. Network
//! providers use a blocking `reqwest` client with a short retry loop; nothing is
//! cached in memory between calls.

pub mod cloud_scaled;
pub mod composite;
pub mod open_meteo;
pub mod pvgis;

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use chrono::NaiveDate;
use chrono_tz::Tz;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use thiserror::Error;

use crate::debug::{DebugCollector, DebugEvent};
use crate::engine::time::TimeLabel;
use crate::models::{Site, WeatherFrame, WeatherVar};

pub use cloud_scaled::CloudScaledProvider;
pub use composite::CompositeProvider;
pub use open_meteo::OpenMeteoProvider;
pub use pvgis::PvgisTmyProvider;

const MAX_ATTEMPTS: u32 = 3;
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum WeatherError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{provider} response malformed: {detail}")]
    Format {
        provider: &'static str,
        detail: String,
    },

    #[error("{provider} does not support timestep '{timestep}'")]
    UnsupportedTimestep {
        provider: &'static str,
        timestep: String,
    },

    #[error("{provider} returned unexpected coordinate ({lat}, {lon}); no requested location within tolerance")]
    UnexpectedCoordinate {
        provider: &'static str,
        lat: f64,
        lon: f64,
    },

    #[error("{provider} response missing requested locations: {ids:?}")]
    MissingLocations {
        provider: &'static str,
        ids: Vec<String>,
    },

    #[error("{provider} returned no data for site {site}")]
    MissingSite { provider: &'static str, site: String },

    #[error("Weather data for site {site} missing column {column}")]
    MissingColumn { site: String, column: &'static str },

    #[error("Secondary data missing for {column} at {count} timestamps for site {site}; examples: {examples:?}")]
    Unfilled {
        site: String,
        column: &'static str,
        count: usize,
        examples: Vec<String>,
    },

    #[error("Column {column} has {got} values for {expected} timestamps")]
    LengthMismatch {
        column: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Unknown timezone '{0}'")]
    UnknownTimezone(String),
}

/// The part of a site a provider needs to look up weather.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteLocation {
    pub id: String,
    pub lat: f64,
    pub lon: f64,
    pub elevation_m: Option<f64>,
    pub tz: Option<Tz>,
}

impl From<&Site> for SiteLocation {
    fn from(site: &Site) -> Self {
        let loc = site.location();
        Self {
            id: site.id().to_string(),
            lat: loc.lat(),
            lon: loc.lon(),
            elevation_m: loc.elevation_m(),
            tz: loc.tz(),
        }
    }
}

pub trait WeatherProvider {
    fn name(&self) -> &'static str;

    /// Label convention of the provider's timestamps, when it has a fixed one.
    fn default_label(&self) -> Option<TimeLabel> {
        None
    }

    fn get_forecast(
        &self,
        locations: &[SiteLocation],
        start: NaiveDate,
        end: NaiveDate,
        timestep: &str,
        debug: &dyn DebugCollector,
    ) -> Result<HashMap<String, WeatherFrame>, WeatherError>;
}

impl<T: WeatherProvider + ?Sized> WeatherProvider for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn default_label(&self) -> Option<TimeLabel> {
        (**self).default_label()
    }

    fn get_forecast(
        &self,
        locations: &[SiteLocation],
        start: NaiveDate,
        end: NaiveDate,
        timestep: &str,
        debug: &dyn DebugCollector,
    ) -> Result<HashMap<String, WeatherFrame>, WeatherError> {
        (**self).get_forecast(locations, start, end, timestep, debug)
    }
}

pub(crate) fn http_client() -> Result<Client, WeatherError> {
    Ok(Client::builder().timeout(HTTP_TIMEOUT).build()?)
}

/// GET a JSON document, retrying transport and HTTP-status failures with a
/// linear backoff.
pub(crate) fn get_json_with_retry(
    client: &Client,
    url: &str,
    query: &[(&str, String)],
    site: Option<&str>,
    debug: &dyn DebugCollector,
) -> Result<Value, WeatherError> {
    let mut attempt = 1;
    loop {
        let outcome = client
            .get(url)
            .query(query)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json::<Value>());
        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= MAX_ATTEMPTS => return Err(e.into()),
            Err(e) => {
                tracing::warn!(url, attempt, error = %e, "weather request failed, retrying");
                let mut event = DebugEvent::new(
                    "weather.retry",
                    json!({ "attempt": attempt, "error": e.to_string() }),
                );
                if let Some(site) = site {
                    event = event.site(site);
                }
                debug.emit(event);
                thread::sleep(Duration::from_millis(500 * u64::from(attempt)));
                attempt += 1;
            }
        }
    }
}

/// Min/max of GHI and air temperature, reported once per site.
pub(crate) fn emit_summary(site: &str, frame: &WeatherFrame, debug: &dyn DebugCollector) {
    let range = |var: WeatherVar| {
        let values: Vec<f64> = frame
            .column(var)
            .map(|c| c.iter().flatten().copied().collect())
            .unwrap_or_default();
        if values.is_empty() {
            (None, None)
        } else {
            (
                Some(values.iter().copied().fold(f64::INFINITY, f64::min)),
                Some(values.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
            )
        }
    };
    let (ghi_min, ghi_max) = range(WeatherVar::Ghi);
    let (temp_min, temp_max) = range(WeatherVar::TempAir);
    debug.emit(
        DebugEvent::new(
            "weather.summary",
            json!({
                "rows": frame.len(),
                "ghi_min": ghi_min,
                "ghi_max": ghi_max,
                "temp_min": temp_min,
                "temp_max": temp_max,
            }),
        )
        .at(frame.index().first())
        .site(site),
    );
}
