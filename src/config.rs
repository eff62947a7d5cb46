use std::fs;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{ArraySpec, Location, LocationSpec, PVArray, Scenario, Site, ValidationError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid scenario: {0}")]
    Invalid(#[from] ValidationError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub sites: Vec<SiteConfig>,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SiteConfig {
    pub id: String,
    pub location: LocationSpec,
    pub arrays: Vec<ArraySpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum WeatherSource {
    #[default]
    OpenMeteo,
    PvgisTmy,
    /// Open-Meteo with gaps filled from PVGIS
    Composite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum WeatherMode {
    #[default]
    Standard,
    /// Clear-sky irradiance scaled by cloud cover
    CloudScaled,
}

/// Defaults for `run`; command-line flags take precedence.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RunConfig {
    pub timestep: Option<String>,
    /// `start`, `end` or `center`; parsed by the caller
    pub weather_label: Option<String>,
    pub weather_source: Option<WeatherSource>,
    pub weather_mode: Option<WeatherMode>,
    pub base_load_w: Option<f64>,
    pub min_duration_min: Option<f64>,
    pub required_wh: Option<f64>,
    pub actual_kwh_today: Option<f64>,
    pub actual_as_of: Option<String>,
    pub actual_limit_suppress: Option<bool>,
    #[serde(alias = "qc_pvgis")]
    pub qc_climatology: Option<bool>,
    pub pvgis_cache_dir: Option<PathBuf>,
}

fn default_host() -> String { "localhost".to_string() }
fn default_port() -> u16 { 1883 }
fn default_base_topic() -> String { "solar_forecast".to_string() }
fn default_discovery_prefix() -> String { "homeassistant".to_string() }
fn default_keepalive() -> u64 { 30 }
fn default_connect_retries() -> u32 { 3 }
fn default_retry_delay() -> f64 { 1.0 }
fn default_true() -> bool { true }

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Empty means a random `solar-forecast-<uuid>` id
    #[serde(default)]
    pub client_id: String,
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    #[serde(default = "default_keepalive")]
    pub keepalive_s: u64,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default = "default_retry_delay", alias = "retry_delay")]
    pub retry_delay_s: f64,
    #[serde(default = "default_true")]
    pub publish_state: bool,
    #[serde(default)]
    pub publish_topics: bool,
    #[serde(default = "default_true")]
    pub discovery: bool,
    /// Results file to publish when `--input` is not given
    #[serde(default)]
    pub input: Option<PathBuf>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: None,
            password: None,
            client_id: String::new(),
            base_topic: default_base_topic(),
            discovery_prefix: default_discovery_prefix(),
            keepalive_s: default_keepalive(),
            connect_retries: default_connect_retries(),
            retry_delay_s: default_retry_delay(),
            publish_state: true,
            publish_topics: false,
            discovery: true,
            input: None,
        }
    }
}

impl MqttConfig {
    pub fn state_topic(&self) -> String {
        format!("{}/forecast", self.base_topic)
    }

    pub fn availability_topic(&self) -> String {
        format!("{}/availability", self.base_topic)
    }

    pub fn discovery_topic(&self) -> String {
        format!(
            "{}/sensor/{}_forecast/config",
            self.discovery_prefix, self.base_topic
        )
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Validate the `sites` section into an immutable scenario.
    pub fn scenario(&self) -> Result<Scenario, ConfigError> {
        let sites = self
            .sites
            .iter()
            .map(|site| {
                let location = Location::new(site.location.clone()).map_err(|e| {
                    ValidationError::InSite {
                        site: site.id.clone(),
                        source: Box::new(e),
                    }
                })?;
                let arrays = site
                    .arrays
                    .iter()
                    .cloned()
                    .map(PVArray::new)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| ValidationError::InSite {
                        site: site.id.clone(),
                        source: Box::new(e),
                    })?;
                Site::new(site.id.clone(), location, arrays)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Scenario::new(sites)?)
    }

    pub fn mqtt_or_default(&self) -> MqttConfig {
        self.mqtt.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::time::TimeLabel;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "sites": [{
            "id": "home",
            "location": { "id": "home", "lat": 50.08, "lon": 14.42, "tz": "Europe/Prague" },
            "arrays": [{
                "id": "roof", "tilt_deg": 35, "azimuth_deg": 190, "pdc0_w": 5200,
                "gamma_pdc": -0.0037, "dc_ac_ratio": 1.2, "eta_inv_nom": 0.97,
                "losses_percent": 10, "temp_model": "close_mount_glass_glass",
                "horizon_deg": "0,5,10,5"
            }]
        }],
        "run": { "timestep": "15m", "weather_label": "center", "weather_source": "composite", "qc_pvgis": true },
        "mqtt": { "host": "broker.local", "publish_topics": true }
    }"#;

    #[test]
    fn loads_and_validates_sample() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let cfg = Config::load(file.path()).unwrap();

        assert_eq!(cfg.run.timestep.as_deref(), Some("15m"));
        assert_eq!(cfg.run.weather_label.as_deref().map(str::parse::<TimeLabel>).transpose().unwrap(), Some(TimeLabel::Center));
        assert_eq!(cfg.run.weather_source, Some(WeatherSource::Composite));
        assert_eq!(cfg.run.qc_climatology, Some(true));

        let mqtt = cfg.mqtt_or_default();
        assert_eq!(mqtt.host, "broker.local");
        assert_eq!(mqtt.port, 1883);
        assert!(mqtt.publish_state && mqtt.publish_topics);
        assert_eq!(mqtt.discovery_topic(), "homeassistant/sensor/solar_forecast_forecast/config");

        let scenario = cfg.scenario().unwrap();
        let array = &scenario.sites()[0].arrays()[0];
        assert_eq!(array.azimuth_deg(), -170.0);
        assert_eq!(array.horizon_deg(), Some(&[0.0, 5.0, 10.0, 5.0][..]));
    }

    #[test]
    fn invalid_array_names_site_and_array() {
        let bad = SAMPLE.replace("\"tilt_deg\": 35", "\"tilt_deg\": 95");
        let cfg = Config::from_json(&bad).unwrap();
        let msg = cfg.scenario().unwrap_err().to_string();
        assert!(msg.contains("site home"), "{msg}");
        assert!(msg.contains("array roof"), "{msg}");
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Config::load(Path::new("/nonexistent/config.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn missing_sites_is_parse_error() {
        assert!(Config::from_json(r#"{ "run": {} }"#).is_err());
    }
}
