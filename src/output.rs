//! Result files written by the `run` command.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::engine::load_window::WindowSummary;
use crate::models::{ArrayKey, ArraySeries, DailyRow, SimulationResult};

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Unsupported output extension '{0}' (expected .json or .csv)")]
    UnsupportedExtension(String),
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

// ─── Hierarchical forecast payload ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastMeta {
    pub generated_at: String,
    pub date: NaiveDate,
    pub timestep: String,
    pub provider: String,
    pub total_energy_kwh: f64,
    pub site_count: usize,
    pub array_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayForecast {
    pub id: String,
    pub energy_kwh: f64,
    pub peak_kw: f64,
    pub poa_kwh_m2: f64,
    pub temp_cell_max: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub baseline_poa_kwh_m2: Option<f64>,
    pub qc_clipped: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub qc_ratio: Option<f64>,
}

impl From<&DailyRow> for ArrayForecast {
    fn from(row: &DailyRow) -> Self {
        Self {
            id: row.array.clone(),
            energy_kwh: row.energy_kwh,
            peak_kw: row.peak_kw,
            poa_kwh_m2: row.poa_kwh_m2,
            temp_cell_max: row.temp_cell_max,
            baseline_poa_kwh_m2: row.baseline_poa_kwh_m2,
            qc_clipped: row.qc_clipped,
            qc_ratio: row.qc_ratio,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteForecast {
    pub id: String,
    pub total_energy_kwh: f64,
    pub arrays: Vec<ArrayForecast>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForecastPayload {
    pub meta: ForecastMeta,
    pub sites: Vec<SiteForecast>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_windows: Option<BTreeMap<String, Option<WindowSummary>>>,
}

impl ForecastPayload {
    /// Group daily rows by site, sites and arrays sorted by id.
    pub fn build(
        result: &SimulationResult,
        date: NaiveDate,
        timestep: &str,
        provider: &str,
        generated_at: DateTime<Utc>,
        load_windows: Option<BTreeMap<String, Option<WindowSummary>>>,
    ) -> Self {
        let mut by_site: BTreeMap<&str, Vec<ArrayForecast>> = BTreeMap::new();
        for row in &result.daily {
            by_site.entry(row.site.as_str()).or_default().push(row.into());
        }
        let sites: Vec<SiteForecast> = by_site
            .into_iter()
            .map(|(id, mut arrays)| {
                arrays.sort_by(|a, b| a.id.cmp(&b.id));
                SiteForecast {
                    id: id.to_string(),
                    total_energy_kwh: round3(arrays.iter().map(|a| a.energy_kwh).sum()),
                    arrays,
                }
            })
            .collect();

        ForecastPayload {
            meta: ForecastMeta {
                generated_at: generated_at.to_rfc3339(),
                date,
                timestep: timestep.to_string(),
                provider: provider.to_string(),
                total_energy_kwh: round3(result.total_energy_kwh()),
                site_count: sites.len(),
                array_count: result.daily.len(),
            },
            sites,
            load_windows,
        }
    }

    pub fn write_json(&self, path: &Path) -> Result<(), OutputError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

pub fn write_daily_csv(path: &Path, daily: &[DailyRow]) -> Result<(), OutputError> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in daily {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

// ─── Per-interval export ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntervalRecord {
    pub site: String,
    pub array: String,
    pub ts: String,
    pub pac_net_w: f64,
    pub poa_global: f64,
    pub interval_h: f64,
    pub wh_period: f64,
    /// Running total within the array
    pub wh_cum: f64,
}

pub fn interval_records(timeseries: &BTreeMap<ArrayKey, ArraySeries>) -> Vec<IntervalRecord> {
    let mut records = Vec::new();
    for ((site, array), series) in timeseries {
        let mut rows: Vec<_> = series.rows.iter().collect();
        rows.sort_by_key(|r| r.ts);
        let mut wh_cum = 0.0;
        for row in rows {
            let wh_period = row.energy_wh();
            wh_cum += wh_period;
            records.push(IntervalRecord {
                site: site.clone(),
                array: array.clone(),
                ts: row.ts.to_rfc3339(),
                pac_net_w: row.pac_net_w,
                poa_global: row.poa_global,
                interval_h: row.interval_h,
                wh_period,
                wh_cum,
            });
        }
    }
    records
}

/// Write interval records as JSON or CSV depending on the file extension.
pub fn write_intervals(path: &Path, records: &[IntervalRecord]) -> Result<(), OutputError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "json" => fs::write(path, serde_json::to_string_pretty(records)?)?,
        "csv" => {
            let mut writer = csv::Writer::from_path(path)?;
            for record in records {
                writer.serialize(record)?;
            }
            writer.flush()?;
        }
        _ => return Err(OutputError::UnsupportedExtension(ext)),
    }
    Ok(())
}

// ─── Freshness guard ─────────────────────────────────────────────────────────

/// `generated_at` of an existing results file when it covers `date`.
///
/// Reads both the hierarchical layout (`meta.date`) and the flat one
/// (top-level `date`). Unreadable files yield `None`.
pub fn existing_generated_at(path: &Path, date: NaiveDate) -> Option<DateTime<Utc>> {
    let text = fs::read_to_string(path).ok()?;
    let value: Value = serde_json::from_str(&text).ok()?;
    let holder = value.get("meta").unwrap_or(&value);
    let payload_date = holder
        .get("date")
        .or_else(|| value.get("date"))
        .and_then(Value::as_str)?;
    if payload_date != date.to_string() {
        return None;
    }
    let generated = holder.get("generated_at").and_then(Value::as_str)?;
    DateTime::parse_from_rfc3339(generated)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// True when `path` already holds results for `date` generated on `today`.
pub fn already_generated_today(path: &Path, date: NaiveDate, today: NaiveDate) -> bool {
    existing_generated_at(path, date).is_some_and(|t| t.date_naive() == today)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IntervalRow;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    fn daily(site: &str, array: &str, energy: f64) -> DailyRow {
        DailyRow {
            site: site.into(),
            array: array.into(),
            date: date(),
            energy_kwh: energy,
            peak_kw: 1.0,
            poa_kwh_m2: 5.0,
            temp_cell_max: 40.0,
            baseline_poa_kwh_m2: None,
            qc_clipped: false,
            qc_ratio: None,
        }
    }

    fn series(pac: &[f64]) -> ArraySeries {
        let t0 = chrono_tz::UTC.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        ArraySeries::new(
            pac.iter()
                .enumerate()
                .map(|(i, p)| IntervalRow {
                    ts: t0 + Duration::hours(i as i64),
                    poa_global: 500.0,
                    poa_direct: 0.0,
                    poa_diffuse: 0.0,
                    poa_ground_diffuse: 0.0,
                    temp_cell_c: 30.0,
                    damping: 1.0,
                    pdc_w: *p,
                    dc_share: 1.0,
                    pac_w: *p,
                    pac_net_w: *p,
                    interval_h: 1.0,
                })
                .collect(),
        )
    }

    #[test]
    fn payload_groups_and_sorts() {
        let result = SimulationResult {
            daily: vec![daily("b", "x", 1.0), daily("a", "z", 2.0), daily("a", "y", 3.0004)],
            timeseries: BTreeMap::new(),
        };
        let generated = Utc.with_ymd_and_hms(2025, 6, 1, 5, 0, 0).unwrap();
        let payload = ForecastPayload::build(&result, date(), "1h", "open-meteo", generated, None);
        assert_eq!(payload.meta.site_count, 2);
        assert_eq!(payload.meta.array_count, 3);
        assert_relative_eq!(payload.meta.total_energy_kwh, 6.0);
        assert_eq!(payload.sites[0].id, "a");
        assert_eq!(payload.sites[0].arrays[0].id, "y");
        assert_relative_eq!(payload.sites[0].total_energy_kwh, 5.0);

        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("load_windows").is_none());
        assert!(json["sites"][0]["arrays"][0].get("qc_ratio").is_none());
    }

    #[test]
    fn intervals_accumulate_per_array() {
        let mut ts = BTreeMap::new();
        ts.insert(("s".to_string(), "a".to_string()), series(&[100.0, 200.0, 50.0]));
        let records = interval_records(&ts);
        assert_eq!(records.len(), 3);
        assert_relative_eq!(records[2].wh_cum, 350.0);
        assert_relative_eq!(records[1].wh_period, 200.0);
    }

    #[test]
    fn interval_export_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let mut ts = BTreeMap::new();
        ts.insert(("s".to_string(), "a".to_string()), series(&[100.0]));
        let records = interval_records(&ts);

        let csv_path = dir.path().join("iv.csv");
        write_intervals(&csv_path, &records).unwrap();
        let text = fs::read_to_string(&csv_path).unwrap();
        assert!(text.starts_with("site,array,ts,pac_net_w,poa_global,interval_h,wh_period,wh_cum"));

        let err = write_intervals(&dir.path().join("iv.txt"), &records).unwrap_err();
        assert!(matches!(err, OutputError::UnsupportedExtension(_)));
    }

    #[test]
    fn freshness_guard_reads_meta() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        let result = SimulationResult {
            daily: vec![daily("s", "a", 1.0)],
            timeseries: BTreeMap::new(),
        };
        let generated = Utc.with_ymd_and_hms(2025, 6, 1, 5, 0, 0).unwrap();
        ForecastPayload::build(&result, date(), "1h", "open-meteo", generated, None)
            .write_json(&path)
            .unwrap();

        assert!(already_generated_today(&path, date(), date()));
        assert!(!already_generated_today(&path, date(), date() + Duration::days(1)));
        let other = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        assert!(!already_generated_today(&path, other, date()));
        assert!(!already_generated_today(&dir.path().join("missing.json"), date(), date()));
    }

    #[test]
    fn daily_csv_has_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daily.csv");
        write_daily_csv(&path, &[daily("s", "a", 1.5)]).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("site,array,date,energy_kwh"));
        assert!(text.contains("s,a,2025-06-01,1.5"));
    }
}
