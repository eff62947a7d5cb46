//! PVGIS typical-meteorological-year provider.
//!
//! PVGIS returns one synthetic year of hourly UTC data; timestamps are
//! re-stamped onto the requested year so the engine's day window applies.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use chrono::{Datelike, NaiveDate, NaiveDateTime, TimeZone};
use reqwest::blocking::Client;
use serde_json::{Value, json};

use crate::debug::{DebugCollector, DebugEvent};
use crate::models::{Timestamp, WeatherFrame, WeatherVar};
use crate::weather::{
    SiteLocation, WeatherError, WeatherProvider, emit_summary, get_json_with_retry, http_client,
};

pub const DEFAULT_URL: &str = "https://re.jrc.ec.europa.eu/api/v5_3/tmy";
const PROVIDER: &str = "pvgis-tmy";

const FIELDS: [(&str, WeatherVar); 5] = [
    ("T2m", WeatherVar::TempAir),
    ("WS10m", WeatherVar::Wind),
    ("G(h)", WeatherVar::Ghi),
    ("Gb(n)", WeatherVar::Dni),
    ("Gd(h)", WeatherVar::Dhi),
];

pub struct PvgisTmyProvider {
    base_url: String,
    cache_dir: Option<PathBuf>,
    client: Client,
}

impl PvgisTmyProvider {
    pub fn new(cache_dir: Option<PathBuf>) -> Result<Self, WeatherError> {
        Ok(Self {
            base_url: DEFAULT_URL.to_string(),
            cache_dir,
            client: http_client()?,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn cache_path(&self, loc: &SiteLocation) -> Option<PathBuf> {
        self.cache_dir
            .as_ref()
            .map(|dir| dir.join(format!("pvgis_tmy_{}_{}.json", loc.lat, loc.lon)))
    }

    fn fetch(&self, loc: &SiteLocation, start: NaiveDate, debug: &dyn DebugCollector) -> Result<(Value, bool), WeatherError> {
        let cache_path = self.cache_path(loc);
        if let Some(path) = cache_path.as_ref().filter(|p| p.exists()) {
            tracing::debug!(path = %path.display(), site = %loc.id, "PVGIS cache hit");
            let text = fs::read_to_string(path)?;
            return Ok((serde_json::from_str(&text)?, true));
        }

        let query = vec![
            ("lat", loc.lat.to_string()),
            ("lon", loc.lon.to_string()),
            ("outputformat", "json".to_string()),
            ("browser", "0".to_string()),
        ];
        debug.emit(
            DebugEvent::new(
                "weather.request",
                json!({ "url": self.base_url, "params": { "lat": loc.lat, "lon": loc.lon } }),
            )
            .on_date(start)
            .site(loc.id.clone()),
        );
        let data = get_json_with_retry(&self.client, &self.base_url, &query, Some(&loc.id), debug)?;
        if let Some(path) = cache_path {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::write(&path, serde_json::to_string(&data)?)?;
        }
        Ok((data, false))
    }
}

fn malformed(detail: impl Into<String>) -> WeatherError {
    WeatherError::Format {
        provider: PROVIDER,
        detail: detail.into(),
    }
}

/// `YYYYMMDD:HHMM` in UTC, moved onto `target_year`. Feb 29 has no
/// counterpart in a common year and yields `None`.
fn restamp(text: &str, target_year: i32) -> Result<Option<Timestamp>, WeatherError> {
    let naive = NaiveDateTime::parse_from_str(text, "%Y%m%d:%H%M")
        .map_err(|_| malformed(format!("unparseable time '{text}'")))?;
    Ok(naive
        .with_year(target_year)
        .map(|n| chrono_tz::UTC.from_utc_datetime(&n)))
}

pub fn parse_tmy(payload: &Value, target_year: i32) -> Result<WeatherFrame, WeatherError> {
    let rows = payload
        .pointer("/outputs/tmy_hourly")
        .and_then(Value::as_array)
        .filter(|rows| !rows.is_empty())
        .ok_or_else(|| malformed("response missing tmy_hourly block"))?;
    let time_key = if rows[0].get("time").is_some() { "time" } else { "time(UTC)" };

    let mut stamped: Vec<(Timestamp, &Value)> = Vec::with_capacity(rows.len());
    for row in rows {
        let text = row
            .get(time_key)
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("row missing time"))?;
        if let Some(ts) = restamp(text, target_year)? {
            stamped.push((ts, row));
        }
    }
    stamped.sort_by_key(|(ts, _)| *ts);

    let mut frame = WeatherFrame::new(chrono_tz::UTC, stamped.iter().map(|(ts, _)| *ts).collect());
    for (field, var) in FIELDS {
        let column = stamped
            .iter()
            .map(|(_, row)| row.get(field).and_then(Value::as_f64))
            .collect();
        frame.set_column(var, column)?;
    }
    Ok(frame)
}

impl WeatherProvider for PvgisTmyProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn get_forecast(
        &self,
        locations: &[SiteLocation],
        start: NaiveDate,
        _end: NaiveDate,
        timestep: &str,
        debug: &dyn DebugCollector,
    ) -> Result<HashMap<String, WeatherFrame>, WeatherError> {
        if timestep != "1h" {
            return Err(WeatherError::UnsupportedTimestep {
                provider: PROVIDER,
                timestep: timestep.to_string(),
            });
        }
        let mut results = HashMap::new();
        for loc in locations {
            let (data, cache_hit) = self.fetch(loc, start, debug)?;
            let frame = parse_tmy(&data, start.year())?;
            debug.emit(
                DebugEvent::new(
                    "weather.response_meta",
                    json!({
                        "timezone": "UTC",
                        "source": data.pointer("/inputs/meteo_data/radiation_db"),
                        "cache": cache_hit,
                    }),
                )
                .at(frame.index().first())
                .site(loc.id.clone()),
            );
            emit_summary(&loc.id, &frame, debug);
            results.insert(loc.id.clone(), frame);
        }
        Ok(results)
    }
}
