//! Rescale the rest of the day against energy already measured today.

use std::fmt;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::debug::{DebugCollector, DebugEvent};
use crate::engine::aggregate::{apply_climatology_clamp, summarize_array};
use crate::error::{EngineError, EngineResult};
use crate::models::{ArraySeries, SimulationResult, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Actual of zero: the caller is resetting, nothing to scale against.
    Reset,
    EmptyTimeseries,
    ZeroPredicted,
    NoFutureSamples,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::Reset => "reset",
            SkipReason::EmptyTimeseries => "empty_timeseries",
            SkipReason::ZeroPredicted => "zero_predicted",
            SkipReason::NoFutureSamples => "no_future_samples",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdjustOutcome {
    Applied {
        scale: f64,
        actual_kwh: f64,
        predicted_to_now_kwh: f64,
        future_energy_kwh: f64,
        future_samples: usize,
        now: Timestamp,
    },
    Skipped(SkipReason),
}

#[derive(Debug, Clone)]
pub struct Adjusted {
    pub result: SimulationResult,
    pub outcome: AdjustOutcome,
}

fn skip(
    result: &SimulationResult,
    reason: SkipReason,
    actual_kwh: f64,
    now: Option<&Timestamp>,
    debug: &dyn DebugCollector,
) -> Adjusted {
    debug.emit(
        DebugEvent::new(
            "actual.adjust.skip",
            json!({ "reason": reason.as_str(), "actual_kwh": actual_kwh }),
        )
        .at(now),
    );
    Adjusted {
        result: result.clone(),
        outcome: AdjustOutcome::Skipped(reason),
    }
}

fn series_energy_kwh(series: &ArraySeries, keep: impl Fn(&Timestamp) -> bool) -> f64 {
    series
        .rows
        .iter()
        .filter(|r| keep(&r.ts))
        .map(|r| r.energy_wh())
        .sum::<f64>()
        / 1000.0
}

/// Scale every sample after `now` by `actual / predicted_to_now`.
///
/// `now` defaults to the wall clock and is clamped into the simulated span.
/// Samples at or before `now` are left untouched.
pub fn apply_actual_adjustment(
    result: &SimulationResult,
    actual_kwh: f64,
    now: Option<Timestamp>,
    debug: &dyn DebugCollector,
) -> EngineResult<Adjusted> {
    if !actual_kwh.is_finite() || actual_kwh < 0.0 {
        return Err(EngineError::InvalidActual { value: actual_kwh });
    }
    if actual_kwh == 0.0 {
        return Ok(skip(result, SkipReason::Reset, actual_kwh, now.as_ref(), debug));
    }

    let first = result.timeseries.values().filter_map(ArraySeries::first_ts).min();
    let last = result.timeseries.values().filter_map(ArraySeries::last_ts).max();
    let (Some(first), Some(last)) = (first.copied(), last.copied()) else {
        return Ok(skip(result, SkipReason::EmptyTimeseries, actual_kwh, now.as_ref(), debug));
    };

    let now = now
        .unwrap_or_else(|| Utc::now().with_timezone(&first.timezone()))
        .clamp(first, last);

    let predicted_to_now_kwh: f64 = result
        .timeseries
        .values()
        .map(|s| series_energy_kwh(s, |ts| *ts <= now))
        .sum();
    if predicted_to_now_kwh <= 0.0 {
        return Ok(skip(result, SkipReason::ZeroPredicted, actual_kwh, Some(&now), debug));
    }

    let future_samples: usize = result
        .timeseries
        .values()
        .map(|s| s.rows.iter().filter(|r| r.ts > now).count())
        .sum();
    if future_samples == 0 {
        return Ok(skip(result, SkipReason::NoFutureSamples, actual_kwh, Some(&now), debug));
    }

    let scale = (actual_kwh / predicted_to_now_kwh).max(0.0);

    let timeseries = result
        .timeseries
        .iter()
        .map(|(key, series)| {
            let rows = series
                .rows
                .iter()
                .map(|row| {
                    let mut row = row.clone();
                    if row.ts > now {
                        row.pdc_w *= scale;
                        row.pac_w *= scale;
                        row.pac_net_w *= scale;
                    }
                    row
                })
                .collect();
            (key.clone(), ArraySeries::new(rows))
        })
        .collect::<std::collections::BTreeMap<_, _>>();

    let future_energy_kwh: f64 = timeseries
        .values()
        .map(|s| series_energy_kwh(s, |ts| *ts > now))
        .sum();

    let daily = result
        .daily
        .iter()
        .map(|old| match timeseries.get(&old.key()) {
            Some(series) => {
                let mut row = summarize_array(&old.site, &old.array, old.date, &series.rows);
                row.baseline_poa_kwh_m2 = old.baseline_poa_kwh_m2;
                apply_climatology_clamp(row)
            }
            None => old.clone(),
        })
        .collect();

    debug.emit(
        DebugEvent::new(
            "actual.adjust.applied",
            json!({
                "actual_kwh": actual_kwh,
                "predicted_to_now_kwh": predicted_to_now_kwh,
                "scale": scale,
                "future_samples": future_samples,
                "future_energy_kwh": future_energy_kwh,
            }),
        )
        .at(Some(&now)),
    );

    Ok(Adjusted {
        result: SimulationResult { daily, timeseries },
        outcome: AdjustOutcome::Applied {
            scale,
            actual_kwh,
            predicted_to_now_kwh,
            future_energy_kwh,
            future_samples,
            now,
        },
    })
}
