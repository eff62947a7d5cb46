//! Contiguous periods where forecast PV output covers a controllable load.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::json;

use crate::debug::{DebugCollector, DebugEvent};
use crate::error::{EngineError, EngineResult};
use crate::models::power::serialize_ts;
use crate::models::{ArrayKey, ArraySeries, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadWindowParams {
    base_load_w: f64,
    min_duration_min: f64,
    required_wh: Option<f64>,
}

impl LoadWindowParams {
    pub fn new(
        base_load_w: f64,
        min_duration_min: f64,
        required_wh: Option<f64>,
    ) -> EngineResult<Self> {
        if !(base_load_w > 0.0 && base_load_w.is_finite()) {
            return Err(EngineError::InvalidParameter {
                what: "base_load_w",
                value: base_load_w,
            });
        }
        if !(min_duration_min > 0.0 && min_duration_min.is_finite()) {
            return Err(EngineError::InvalidParameter {
                what: "min_duration_min",
                value: min_duration_min,
            });
        }
        if let Some(wh) = required_wh {
            if !(wh > 0.0 && wh.is_finite()) {
                return Err(EngineError::InvalidParameter {
                    what: "required_wh",
                    value: wh,
                });
            }
        }
        Ok(Self {
            base_load_w,
            min_duration_min,
            required_wh,
        })
    }

    pub fn base_load_w(&self) -> f64 {
        self.base_load_w
    }
    pub fn min_duration_min(&self) -> f64 {
        self.min_duration_min
    }
    pub fn required_wh(&self) -> Option<f64> {
        self.required_wh
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadWindow {
    #[serde(serialize_with = "serialize_ts")]
    pub start: Timestamp,
    #[serde(serialize_with = "serialize_ts")]
    pub end: Timestamp,
    pub duration_min: f64,
    pub energy_wh: f64,
    pub avg_w: f64,
    pub max_w: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowSummary {
    pub earliest: LoadWindow,
    pub latest: LoadWindow,
    pub best: LoadWindow,
    pub windows: Vec<LoadWindow>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerSample {
    pub ts: Timestamp,
    pub power_w: f64,
    pub interval_h: f64,
}

/// Windows of one chronologically ordered power series.
pub fn find_windows_for_site(samples: &[PowerSample], params: &LoadWindowParams) -> Vec<LoadWindow> {
    let mut windows = Vec::new();
    let mut i = 0;
    while i < samples.len() {
        if samples[i].power_w < params.base_load_w {
            i += 1;
            continue;
        }
        let start = i;
        while i < samples.len() && samples[i].power_w >= params.base_load_w {
            i += 1;
        }
        let run = &samples[start..i];
        let last = &run[run.len() - 1];
        let end = last.ts + chrono::Duration::milliseconds((last.interval_h * 3_600_000.0).round() as i64);
        // Covered interval widths, which energy is integrated over.
        let duration_h: f64 = run.iter().map(|s| s.interval_h).sum();
        let duration_min = duration_h * 60.0;
        if duration_min < params.min_duration_min {
            continue;
        }
        let energy_wh: f64 = run.iter().map(|s| s.power_w * s.interval_h).sum();
        if params.required_wh.is_some_and(|req| energy_wh < req) {
            continue;
        }
        windows.push(LoadWindow {
            start: run[0].ts,
            end,
            duration_min,
            energy_wh,
            avg_w: if duration_h > 0.0 {
                energy_wh / duration_h
            } else {
                0.0
            },
            max_w: run.iter().map(|s| s.power_w).fold(f64::NEG_INFINITY, f64::max),
        });
    }
    windows
}

fn rank(a: &LoadWindow, b: &LoadWindow) -> Ordering {
    a.energy_wh
        .total_cmp(&b.energy_wh)
        .then(a.duration_min.total_cmp(&b.duration_min))
        .then(a.avg_w.total_cmp(&b.avg_w))
        .then(b.start.cmp(&a.start))
}

pub fn summarize_windows(windows: Vec<LoadWindow>) -> Option<WindowSummary> {
    let earliest = windows.iter().min_by_key(|w| w.start)?.clone();
    let latest = windows.iter().max_by_key(|w| w.start)?.clone();
    let best = windows.iter().max_by(|a, b| rank(a, b))?.clone();
    Some(WindowSummary {
        earliest,
        latest,
        best,
        windows,
    })
}

/// Net AC of all arrays of a site summed on the union of their timestamps.
pub fn site_power_series(
    timeseries: &BTreeMap<ArrayKey, ArraySeries>,
    site: &str,
) -> Vec<PowerSample> {
    let mut merged: BTreeMap<Timestamp, (f64, Option<f64>)> = BTreeMap::new();
    for ((s, _), series) in timeseries {
        if s != site {
            continue;
        }
        for row in &series.rows {
            let entry = merged.entry(row.ts).or_insert((0.0, None));
            entry.0 += row.pac_net_w;
            if entry.1.is_none() && row.interval_h.is_finite() {
                entry.1 = Some(row.interval_h);
            }
        }
    }

    let mut widths: Vec<Option<f64>> = merged.values().map(|(_, h)| *h).collect();
    let mut carry = None;
    for w in widths.iter_mut() {
        match w {
            Some(v) => carry = Some(*v),
            None => *w = carry,
        }
    }
    carry = None;
    for w in widths.iter_mut().rev() {
        match w {
            Some(v) => carry = Some(*v),
            None => *w = carry,
        }
    }

    merged
        .into_iter()
        .zip(widths)
        .map(|((ts, (power_w, _)), h)| PowerSample {
            ts,
            power_w,
            interval_h: h.unwrap_or(0.0),
        })
        .collect()
}

pub fn compute_load_windows(
    timeseries: &BTreeMap<ArrayKey, ArraySeries>,
    params: &LoadWindowParams,
    debug: &dyn DebugCollector,
) -> BTreeMap<String, Option<WindowSummary>> {
    let mut sites: Vec<&str> = timeseries.keys().map(|(s, _)| s.as_str()).collect();
    sites.dedup();

    sites
        .into_iter()
        .map(|site| {
            let samples = site_power_series(timeseries, site);
            let windows = find_windows_for_site(&samples, params);
            let summary = summarize_windows(windows);
            debug.emit(
                DebugEvent::new(
                    "load_window.summary",
                    json!({
                        "base_load_w": params.base_load_w,
                        "min_duration_min": params.min_duration_min,
                        "required_wh": params.required_wh,
                        "samples": samples.len(),
                        "windows": summary.as_ref().map_or(0, |s| s.windows.len()),
                        "best_start": summary.as_ref().map(|s| s.best.start.to_rfc3339()),
                        "best_energy_wh": summary.as_ref().map(|s| s.best.energy_wh),
                    }),
                )
                .site(site),
            );
            (site.to_string(), summary)
        })
        .collect()
}
