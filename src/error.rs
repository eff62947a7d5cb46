//! Error types for the simulation engine.

use thiserror::Error;

use crate::weather::WeatherError;

pub type EngineResult<T> = Result<T, EngineError>;

/// Fatal conditions raised by the day simulation and its post-processing.
///
/// Advisory outcomes (skipped adjustments, clamped rows) are values, not errors.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Unsupported time label: {label} (expected start, end or center)")]
    UnsupportedLabel { label: String },

    #[error(
        "Unable to infer interval hours for {samples} sample(s) with declared step {step_seconds}s{}; provide a valid timestep",
        site_suffix(.site)
    )]
    IntervalUndetermined {
        site: Option<String>,
        samples: usize,
        step_seconds: f64,
    },

    #[error("Arrays in inverter group '{group}' of site {site} specify conflicting inverter_pdc0_w values: {ratings:?}")]
    ConflictingInverterRating {
        site: String,
        group: String,
        ratings: Vec<f64>,
    },

    #[error("Weather data for site {site} missing required columns: {missing:?}")]
    MissingWeatherColumns { site: String, missing: Vec<String> },

    #[error("Weather provider returned no data for site {site}")]
    MissingSiteWeather { site: String },

    #[error("Weather data for site {site} has no samples inside {date}")]
    EmptyWeatherWindow { site: String, date: String },

    #[error("Weather data for site {site} has {count} missing value(s) in column {column}")]
    WeatherGap {
        site: String,
        column: String,
        count: usize,
    },

    #[error("actual_kwh_today must be a non-negative number, got {value}")]
    InvalidActual { value: f64 },

    #[error("Invalid parameter {what}: {value}")]
    InvalidParameter { what: &'static str, value: f64 },

    #[error(transparent)]
    Weather(#[from] WeatherError),
}

impl EngineError {
    /// Attach a site id to errors raised by site-agnostic helpers.
    pub fn at_site(self, site_id: &str) -> Self {
        match self {
            EngineError::IntervalUndetermined {
                site: None,
                samples,
                step_seconds,
            } => EngineError::IntervalUndetermined {
                site: Some(site_id.to_string()),
                samples,
                step_seconds,
            },
            other => other,
        }
    }
}

fn site_suffix(site: &Option<String>) -> String {
    site.as_deref()
        .map(|s| format!(" (site {s})"))
        .unwrap_or_default()
}
