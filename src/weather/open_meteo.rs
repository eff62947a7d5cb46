use std::collections::HashMap;

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use reqwest::blocking::Client;
use serde_json::{Value, json};

use crate::debug::{DebugCollector, DebugEvent};
use crate::engine::time::TimeLabel;
use crate::models::{Timestamp, WeatherFrame, WeatherVar};
use crate::weather::{
    SiteLocation, WeatherError, WeatherProvider, emit_summary, get_json_with_retry, http_client,
};

pub const DEFAULT_URL: &str = "https://api.open-meteo.com/v1/forecast";
const PROVIDER: &str = "open-meteo";
/// ~1.1 km; absorbs the API's grid rounding without swapping nearby sites.
const COORD_TOLERANCE_DEG: f64 = 0.01;

const VARIABLES: [(&str, WeatherVar); 6] = [
    ("temperature_2m", WeatherVar::TempAir),
    ("wind_speed_10m", WeatherVar::Wind),
    ("shortwave_radiation", WeatherVar::Ghi),
    ("diffuse_radiation", WeatherVar::Dhi),
    ("direct_normal_irradiance", WeatherVar::Dni),
    ("cloudcover", WeatherVar::CloudCover),
];

pub struct OpenMeteoProvider {
    base_url: String,
    client: Client,
}

impl OpenMeteoProvider {
    pub fn new() -> Result<Self, WeatherError> {
        Self::with_base_url(DEFAULT_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, WeatherError> {
        Ok(Self {
            base_url: base_url.into(),
            client: http_client()?,
        })
    }

    fn query(
        locations: &[SiteLocation],
        start: NaiveDate,
        end: NaiveDate,
        timestep: &str,
    ) -> Vec<(&'static str, String)> {
        let join = |f: fn(&SiteLocation) -> String| {
            locations.iter().map(f).collect::<Vec<_>>().join(",")
        };
        let vars = VARIABLES
            .iter()
            .map(|(k, _)| *k)
            .collect::<Vec<_>>()
            .join(",");
        let block = if timestep == "15m" { "minutely_15" } else { "hourly" };
        vec![
            ("latitude", join(|l| l.lat.to_string())),
            ("longitude", join(|l| l.lon.to_string())),
            ("timezone", "auto".to_string()),
            ("start_date", start.to_string()),
            ("end_date", end.to_string()),
            (block, vars),
            ("wind_speed_unit", "ms".to_string()),
        ]
    }
}

fn malformed(detail: impl Into<String>) -> WeatherError {
    WeatherError::Format {
        provider: PROVIDER,
        detail: detail.into(),
    }
}

/// Localise a naive wall-clock time. A repeated DST label maps to the later
/// instant when the earlier one has already been used.
fn localize(tz: Tz, naive: &NaiveDateTime, previous: Option<&Timestamp>) -> Option<Timestamp> {
    match tz.from_local_datetime(naive) {
        LocalResult::Single(t) => Some(t),
        LocalResult::Ambiguous(early, late) => {
            if previous.is_some_and(|p| *p >= early) {
                Some(late)
            } else {
                Some(early)
            }
        }
        // Skipped by a spring-forward jump: take the first valid instant after it.
        LocalResult::None => tz.from_local_datetime(&(*naive + Duration::hours(1))).earliest(),
    }
}

fn parse_time(text: &str, tz: Tz, previous: Option<&Timestamp>) -> Result<Timestamp, WeatherError> {
    if let Ok(aware) = DateTime::parse_from_rfc3339(text) {
        return Ok(aware.with_timezone(&tz));
    }
    let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S"))
        .map_err(|_| malformed(format!("unparseable time '{text}'")))?;
    localize(tz, &naive, previous).ok_or_else(|| malformed(format!("time '{text}' does not exist in {tz}")))
}

/// Convert one location entry of an Open-Meteo response into a frame in the
/// reported timezone.
pub fn parse_location(payload: &Value) -> Result<WeatherFrame, WeatherError> {
    let (block_key, block) = ["hourly", "minutely_15"]
        .iter()
        .find_map(|k| payload.get(*k).map(|b| (*k, b)))
        .ok_or_else(|| malformed("response missing time series block"))?;

    let tz: Tz = match payload.get("timezone").and_then(Value::as_str) {
        Some(name) => name
            .parse()
            .map_err(|_| WeatherError::UnknownTimezone(name.to_string()))?,
        None => chrono_tz::UTC,
    };

    let raw_times = block
        .get("time")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("time series block missing 'time'"))?;
    let mut index: Vec<Timestamp> = Vec::with_capacity(raw_times.len());
    for value in raw_times {
        let text = value
            .as_str()
            .ok_or_else(|| malformed("time values must be strings"))?;
        let ts = parse_time(text, tz, index.last())?;
        index.push(ts);
    }

    let units_key = format!("{block_key}_units");
    let wind_in_kmh = payload
        .get(&units_key)
        .and_then(|u| u.get("wind_speed_10m"))
        .and_then(Value::as_str)
        == Some("km/h");

    let mut frame = WeatherFrame::new(tz, index);
    for (api_key, var) in VARIABLES {
        let Some(values) = block.get(api_key).and_then(Value::as_array) else {
            continue;
        };
        let mut column: Vec<Option<f64>> = values.iter().map(Value::as_f64).collect();
        if var == WeatherVar::Wind && wind_in_kmh {
            column.iter_mut().flatten().for_each(|v| *v /= 3.6);
        }
        frame.set_column(var, column)?;
    }
    Ok(frame)
}

impl WeatherProvider for OpenMeteoProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn default_label(&self) -> Option<TimeLabel> {
        // Values are averages over the preceding period.
        Some(TimeLabel::End)
    }

    fn get_forecast(
        &self,
        locations: &[SiteLocation],
        start: NaiveDate,
        end: NaiveDate,
        timestep: &str,
        debug: &dyn DebugCollector,
    ) -> Result<HashMap<String, WeatherFrame>, WeatherError> {
        if timestep != "1h" && timestep != "15m" {
            return Err(WeatherError::UnsupportedTimestep {
                provider: PROVIDER,
                timestep: timestep.to_string(),
            });
        }
        let query = Self::query(locations, start, end, timestep);
        let params: serde_json::Map<String, Value> = query
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.clone())))
            .collect();
        debug.emit(
            DebugEvent::new("weather.request", json!({ "url": self.base_url, "params": params }))
                .on_date(start),
        );

        let data = get_json_with_retry(&self.client, &self.base_url, &query, None, debug)?;
        let entries = match data {
            Value::Array(items) => items,
            single => vec![single],
        };

        let mut unmatched: Vec<&SiteLocation> = locations.iter().collect();
        let mut results = HashMap::new();
        for entry in &entries {
            let (Some(lat), Some(lon)) = (
                entry.get("latitude").and_then(Value::as_f64),
                entry.get("longitude").and_then(Value::as_f64),
            ) else {
                return Err(malformed("location entry missing latitude/longitude"));
            };
            let pos = unmatched
                .iter()
                .position(|l| {
                    (l.lat - lat).abs() <= COORD_TOLERANCE_DEG
                        && (l.lon - lon).abs() <= COORD_TOLERANCE_DEG
                })
                .ok_or(WeatherError::UnexpectedCoordinate {
                    provider: PROVIDER,
                    lat,
                    lon,
                })?;
            let site = unmatched.remove(pos);
            let frame = parse_location(entry)?;

            debug.emit(
                DebugEvent::new(
                    "weather.response_meta",
                    json!({
                        "model": entry.get("model"),
                        "timezone": frame.tz().name(),
                        "time_key": if entry.get("minutely_15").is_some() { "minutely_15" } else { "hourly" },
                        "lat": lat,
                        "lon": lon,
                        "matched_id": site.id,
                    }),
                )
                .at(frame.index().first())
                .site(site.id.clone()),
            );
            emit_summary(&site.id, &frame, debug);
            results.insert(site.id.clone(), frame);
        }

        if !unmatched.is_empty() {
            return Err(WeatherError::MissingLocations {
                provider: PROVIDER,
                ids: unmatched.iter().map(|l| l.id.clone()).collect(),
            });
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn localises_naive_times_in_reported_zone() {
        let payload = json!({
            "latitude": 50.08,
            "longitude": 14.42,
            "timezone": "Europe/Prague",
            "hourly_units": { "wind_speed_10m": "km/h" },
            "hourly": {
                "time": ["2025-06-01T00:00", "2025-06-01T01:00"],
                "temperature_2m": [14.0, 13.5],
                "wind_speed_10m": [36.0, null],
                "shortwave_radiation": [0.0, 0.0],
                "diffuse_radiation": [0.0, 0.0],
                "direct_normal_irradiance": [0.0, 0.0]
            }
        });
        let frame = parse_location(&payload).unwrap();
        assert_eq!(frame.tz().name(), "Europe/Prague");
        // Local midnight in CEST is 22:00 UTC the day before.
        let first = frame.index()[0].with_timezone(&Utc);
        assert_eq!(first.to_rfc3339(), "2025-05-31T22:00:00+00:00");
        assert_eq!(frame.column(WeatherVar::Wind).unwrap(), &[Some(10.0), None]);
        assert!(!frame.has(WeatherVar::CloudCover));
    }

    #[test]
    fn repeated_fall_back_label_takes_later_instant() {
        let payload = json!({
            "timezone": "Europe/Prague",
            "hourly": { "time": ["2025-10-26T02:00", "2025-10-26T02:00", "2025-10-26T03:00"] }
        });
        let frame = parse_location(&payload).unwrap();
        let idx = frame.index();
        assert_eq!((idx[1] - idx[0]).num_minutes(), 60);
        assert_eq!((idx[2] - idx[1]).num_minutes(), 60);
    }

    #[test]
    fn missing_time_block_is_an_error() {
        let err = parse_location(&json!({ "timezone": "UTC" })).unwrap_err();
        assert!(matches!(err, WeatherError::Format { .. }));
    }

    #[test]
    fn query_uses_minutely_block_for_15m() {
        let loc = SiteLocation {
            id: "a".into(),
            lat: 50.0,
            lon: 14.0,
            elevation_m: None,
            tz: None,
        };
        let d = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let q = OpenMeteoProvider::query(&[loc.clone(), loc], d, d, "15m");
        assert!(q.iter().any(|(k, _)| *k == "minutely_15"));
        assert!(q.iter().any(|(k, v)| *k == "latitude" && v == "50,50"));
    }
}
