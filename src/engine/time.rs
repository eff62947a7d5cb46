//! Timestamp labelling and interval-width helpers.
//!
//! Weather samples are labelled at the start, end or centre of the period they
//! describe. Geometry must be evaluated at the centre of that period and energy
//! integrated over its width, which need not be uniform (DST days, gaps).

use std::fmt;
use std::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::models::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeLabel {
    Start,
    #[default]
    End,
    Center,
}

impl TimeLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeLabel::Start => "start",
            TimeLabel::End => "end",
            TimeLabel::Center => "center",
        }
    }
}

impl fmt::Display for TimeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeLabel {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(TimeLabel::Start),
            "end" => Ok(TimeLabel::End),
            "center" => Ok(TimeLabel::Center),
            _ => Err(EngineError::UnsupportedLabel {
                label: s.to_string(),
            }),
        }
    }
}

/// Parse a timestep like `"1h"`, `"15m"`, `"30min"`, `"900s"` or `"1d"` into seconds.
pub fn parse_timestep(timestep: &str) -> Option<f64> {
    let text = timestep.trim().to_ascii_lowercase();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value = if number.is_empty() {
        1.0
    } else {
        number.parse::<f64>().ok()?
    };
    let scale = match unit.trim() {
        "s" | "sec" | "secs" => 1.0,
        "m" | "min" | "mins" | "t" => 60.0,
        "h" | "hr" | "hour" | "hours" => 3600.0,
        "d" | "day" | "days" => 86400.0,
        _ => return None,
    };
    let seconds = value * scale;
    (seconds.is_finite() && seconds > 0.0).then_some(seconds)
}

fn gap_seconds(a: &Timestamp, b: &Timestamp) -> f64 {
    (*b - *a).num_milliseconds() as f64 / 1000.0
}

fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

/// Typical sample spacing in seconds: median observed gap, else the declared
/// timestep, else 0.
pub fn infer_step_seconds(timestamps: &[Timestamp], declared_timestep: Option<&str>) -> f64 {
    let gaps: Vec<f64> = timestamps
        .windows(2)
        .map(|w| gap_seconds(&w[0], &w[1]))
        .collect();
    if let Some(m) = median(gaps) {
        if m > 0.0 {
            return m;
        }
    }
    declared_timestep.and_then(parse_timestep).unwrap_or(0.0)
}

/// Instants at which solar geometry should be evaluated for each sample.
pub fn apply_time_label(
    timestamps: &[Timestamp],
    step_seconds: f64,
    label: TimeLabel,
) -> Vec<Timestamp> {
    if !(step_seconds > 0.0) || label == TimeLabel::Center {
        return timestamps.to_vec();
    }
    let half = Duration::milliseconds((step_seconds * 500.0).round() as i64);
    timestamps
        .iter()
        .map(|t| match label {
            TimeLabel::End => *t - half,
            TimeLabel::Start => *t + half,
            TimeLabel::Center => *t,
        })
        .collect()
}

/// Width in hours of the period each sample stands for.
pub fn interval_hours(
    timestamps: &[Timestamp],
    step_seconds: f64,
    label: TimeLabel,
) -> EngineResult<Vec<f64>> {
    let n = timestamps.len();
    let undetermined = || EngineError::IntervalUndetermined {
        site: None,
        samples: n,
        step_seconds,
    };
    if n == 0 {
        return Ok(Vec::new());
    }
    let declared = (step_seconds > 0.0).then_some(step_seconds / 3600.0);
    if n == 1 {
        return declared.map(|h| vec![h]).ok_or_else(undetermined);
    }

    let gaps: Vec<f64> = timestamps
        .windows(2)
        .map(|w| gap_seconds(&w[0], &w[1]) / 3600.0)
        .collect();

    let hours: Vec<f64> = match label {
        TimeLabel::Start | TimeLabel::Center => {
            let last = declared.unwrap_or(gaps[gaps.len() - 1]);
            gaps.iter().copied().chain(std::iter::once(last)).collect()
        }
        TimeLabel::End => {
            let first = declared.unwrap_or(gaps[0]);
            std::iter::once(first).chain(gaps.iter().copied()).collect()
        }
    };

    if hours.iter().any(|h| !h.is_finite()) {
        return Err(undetermined());
    }
    Ok(hours)
}
