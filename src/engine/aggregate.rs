//! Daily energy summaries and the climatology ratio clamp.

use chrono::NaiveDate;
use serde_json::json;

use crate::debug::{DebugCollector, DebugEvent};
use crate::models::{DailyRow, IntervalRow, SimulationResult};

/// Accepted POA / climatology ratio.
pub const CLIMATOLOGY_BAND: (f64, f64) = (0.6, 1.6);
/// Advisory band on cloudy days (POA below [`CLOUDY_POA_KWH_M2`]).
pub const CLOUDY_BAND: (f64, f64) = (0.3, 2.0);
pub const CLOUDY_POA_KWH_M2: f64 = 0.6;

pub fn summarize_array(site: &str, array: &str, date: NaiveDate, rows: &[IntervalRow]) -> DailyRow {
    let energy_wh: f64 = rows.iter().map(IntervalRow::energy_wh).sum();
    let peak_w = rows.iter().map(|r| r.pac_net_w).fold(0.0, f64::max);
    let poa_wh_m2: f64 = rows.iter().map(|r| r.poa_global * r.interval_h).sum();
    let temp_cell_max = rows
        .iter()
        .map(|r| r.temp_cell_c)
        .fold(f64::NEG_INFINITY, f64::max);
    DailyRow {
        site: site.to_string(),
        array: array.to_string(),
        date,
        energy_kwh: energy_wh / 1000.0,
        peak_kw: peak_w / 1000.0,
        poa_kwh_m2: poa_wh_m2 / 1000.0,
        temp_cell_max: if rows.is_empty() { f64::NAN } else { temp_cell_max },
        baseline_poa_kwh_m2: None,
        qc_clipped: false,
        qc_ratio: None,
    }
}

/// Pull POA, energy and peak back into the band when a baseline is attached.
pub fn apply_climatology_clamp(mut row: DailyRow) -> DailyRow {
    let Some(baseline) = row.baseline_poa_kwh_m2.filter(|b| *b > 0.0) else {
        return row;
    };
    let ratio = row.poa_kwh_m2 / baseline;
    if !ratio.is_finite() {
        return row;
    }
    let (lo, hi) = CLIMATOLOGY_BAND;
    let bound = if ratio < lo {
        lo
    } else if ratio > hi {
        hi
    } else {
        return row;
    };
    // A zero ratio has nothing to scale.
    if ratio > 0.0 {
        let scale = bound / ratio;
        row.poa_kwh_m2 = baseline * bound;
        row.energy_kwh *= scale;
        row.peak_kw *= scale;
    }
    row.qc_clipped = true;
    row.qc_ratio = Some(ratio);
    row
}

pub fn clamp_daily(rows: Vec<DailyRow>) -> Vec<DailyRow> {
    rows.into_iter().map(apply_climatology_clamp).collect()
}

#[derive(Debug, Clone)]
pub struct ClimatologyReport {
    pub result: SimulationResult,
    pub warnings: Vec<String>,
}

/// Join a baseline run's POA energy onto each daily row and clamp outliers.
pub fn attach_climatology(
    result: &SimulationResult,
    baseline: &SimulationResult,
    debug: &dyn DebugCollector,
) -> ClimatologyReport {
    let mut warnings = Vec::new();
    let daily = result
        .daily
        .iter()
        .map(|row| {
            let mut row = row.clone();
            row.baseline_poa_kwh_m2 = baseline
                .daily
                .iter()
                .find(|b| b.site == row.site && b.array == row.array)
                .map(|b| b.poa_kwh_m2);

            let ratio = row
                .baseline_poa_kwh_m2
                .filter(|b| *b > 0.0)
                .map(|b| row.poa_kwh_m2 / b);
            let (lo, hi) = if row.poa_kwh_m2 < CLOUDY_POA_KWH_M2 {
                CLOUDY_BAND
            } else {
                CLIMATOLOGY_BAND
            };
            let out_of_band = ratio.is_some_and(|r| r < lo || r > hi);
            if out_of_band {
                warnings.push(format!(
                    "{}/{}: POA {:.2} kWh/m² vs climatology {:.2} kWh/m² (ratio {:.2})",
                    row.site,
                    row.array,
                    row.poa_kwh_m2,
                    row.baseline_poa_kwh_m2.unwrap_or(0.0),
                    ratio.unwrap_or(0.0),
                ));
            }
            debug.emit(
                DebugEvent::new(
                    "qc.climatology_compare",
                    json!({
                        "poa_kwh_m2": row.poa_kwh_m2,
                        "baseline_poa_kwh_m2": row.baseline_poa_kwh_m2,
                        "ratio": ratio,
                        "band": [lo, hi],
                        "out_of_band": out_of_band,
                    }),
                )
                .on_date(row.date)
                .site(row.site.clone())
                .array(row.array.clone()),
            );
            apply_climatology_clamp(row)
        })
        .collect();

    ClimatologyReport {
        result: SimulationResult {
            daily,
            timeseries: result.timeseries.clone(),
        },
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn row(poa: f64, baseline: Option<f64>) -> DailyRow {
        DailyRow {
            site: "s".into(),
            array: "a".into(),
            date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            energy_kwh: 20.0,
            peak_kw: 4.0,
            poa_kwh_m2: poa,
            temp_cell_max: 40.0,
            baseline_poa_kwh_m2: baseline,
            qc_clipped: false,
            qc_ratio: None,
        }
    }

    #[test]
    fn high_ratio_is_scaled_to_upper_bound() {
        let r = apply_climatology_clamp(row(10.0, Some(5.0)));
        assert!(r.qc_clipped);
        assert_relative_eq!(r.qc_ratio.unwrap(), 2.0);
        assert_relative_eq!(r.poa_kwh_m2 / 5.0, 1.6, max_relative = 1e-12);
        assert_relative_eq!(r.energy_kwh, 16.0, max_relative = 1e-12);
        assert_relative_eq!(r.peak_kw, 3.2, max_relative = 1e-12);
    }

    #[test]
    fn in_band_and_unbaselined_rows_pass_through() {
        let inside = row(5.0, Some(5.0));
        assert_eq!(apply_climatology_clamp(inside.clone()), inside);
        let bare = row(5.0, None);
        assert_eq!(apply_climatology_clamp(bare.clone()), bare);
        let zero = row(5.0, Some(0.0));
        assert_eq!(apply_climatology_clamp(zero.clone()), zero);
    }

    #[test]
    fn low_ratio_is_raised() {
        let r = apply_climatology_clamp(row(1.0, Some(5.0)));
        assert!(r.qc_clipped);
        assert_relative_eq!(r.energy_kwh, 20.0 * 3.0, max_relative = 1e-12);
    }
}
