//! Primary forecast with gaps filled from a secondary (climatology) provider.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use serde_json::json;

use crate::debug::{DebugCollector, DebugEvent};
use crate::engine::time::TimeLabel;
use crate::models::{Timestamp, WeatherFrame, WeatherVar};
use crate::weather::{SiteLocation, WeatherError, WeatherProvider};

pub struct CompositeProvider {
    primary: Box<dyn WeatherProvider>,
    secondary: Box<dyn WeatherProvider>,
}

impl CompositeProvider {
    pub fn new(primary: Box<dyn WeatherProvider>, secondary: Box<dyn WeatherProvider>) -> Self {
        Self { primary, secondary }
    }
}

/// Secondary column aligned to `target`: exact timestamp matches first, then
/// forward/back fill restricted to the secondary's time span. Targets outside
/// that span stay empty.
pub fn align_secondary(secondary: &WeatherFrame, var: WeatherVar, target: &[Timestamp]) -> Vec<Option<f64>> {
    let (Some(column), Some(first), Some(last)) = (
        secondary.column(var),
        secondary.index().iter().min(),
        secondary.index().iter().max(),
    ) else {
        return vec![None; target.len()];
    };
    let lookup: BTreeMap<Timestamp, Option<f64>> = secondary
        .index()
        .iter()
        .copied()
        .zip(column.iter().copied())
        .collect();

    let in_overlap: Vec<bool> = target.iter().map(|t| t >= first && t <= last).collect();
    let mut aligned: Vec<Option<f64>> = target
        .iter()
        .zip(&in_overlap)
        .map(|(t, inside)| if *inside { lookup.get(t).copied().flatten() } else { None })
        .collect();

    let mut carry = None;
    for (value, inside) in aligned.iter_mut().zip(&in_overlap) {
        if !inside {
            continue;
        }
        match value {
            Some(v) => carry = Some(*v),
            None => *value = carry,
        }
    }
    carry = None;
    for (value, inside) in aligned.iter_mut().zip(&in_overlap).rev() {
        if !inside {
            continue;
        }
        match value {
            Some(v) => carry = Some(*v),
            None => *value = carry,
        }
    }
    aligned
}

fn is_irradiance(var: WeatherVar) -> bool {
    matches!(var, WeatherVar::Ghi | WeatherVar::Dni | WeatherVar::Dhi)
}

fn merge_site(
    site: &str,
    primary: &WeatherFrame,
    secondary: &WeatherFrame,
    debug: &dyn DebugCollector,
) -> Result<WeatherFrame, WeatherError> {
    let mut merged = primary.clone();
    let mut filled_missing = serde_json::Map::new();
    let mut filled_negative = serde_json::Map::new();

    for var in WeatherVar::REQUIRED {
        let (Some(values), true) = (primary.column(var), secondary.has(var)) else {
            continue;
        };
        let fallback = align_secondary(secondary, var, primary.index());
        let mut missing = 0usize;
        let mut negative = 0usize;
        let mut unfilled = Vec::new();
        let column: Vec<Option<f64>> = values
            .iter()
            .zip(&fallback)
            .zip(primary.index())
            .map(|((value, backup), ts)| {
                let needs_fill = match value {
                    None => {
                        missing += 1;
                        true
                    }
                    Some(v) if *v < 0.0 => {
                        negative += 1;
                        true
                    }
                    Some(_) => false,
                };
                let out = if needs_fill { *backup } else { *value };
                if out.is_none() {
                    unfilled.push(ts.to_rfc3339());
                }
                out.map(|v| if is_irradiance(var) { v.max(0.0) } else { v })
            })
            .collect();

        if !unfilled.is_empty() {
            return Err(WeatherError::Unfilled {
                site: site.to_string(),
                column: var.column(),
                count: unfilled.len(),
                examples: unfilled.into_iter().take(3).collect(),
            });
        }
        filled_missing.insert(var.column().to_string(), json!(missing + negative));
        filled_negative.insert(var.column().to_string(), json!(negative));
        merged.set_column(var, column)?;
    }

    debug.emit(
        DebugEvent::new(
            "weather.merge_detail",
            json!({ "filled_negative": filled_negative, "filled_missing": filled_missing }),
        )
        .at(merged.index().first())
        .site(site),
    );
    debug.emit(
        DebugEvent::new("weather.merge", json!({ "filled_points": filled_missing }))
            .at(merged.index().first())
            .site(site),
    );
    Ok(merged)
}

impl WeatherProvider for CompositeProvider {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn default_label(&self) -> Option<TimeLabel> {
        self.primary.default_label()
    }

    fn get_forecast(
        &self,
        locations: &[SiteLocation],
        start: NaiveDate,
        end: NaiveDate,
        timestep: &str,
        debug: &dyn DebugCollector,
    ) -> Result<HashMap<String, WeatherFrame>, WeatherError> {
        let primary = self.primary.get_forecast(locations, start, end, timestep, debug)?;
        let secondary = self.secondary.get_forecast(locations, start, end, "1h", debug)?;

        let mut merged = HashMap::new();
        for loc in locations {
            let missing = |provider: &dyn WeatherProvider| WeatherError::MissingSite {
                provider: provider.name(),
                site: loc.id.clone(),
            };
            let prim = primary.get(&loc.id).ok_or_else(|| missing(self.primary.as_ref()))?;
            let sec = secondary.get(&loc.id).ok_or_else(|| missing(self.secondary.as_ref()))?;
            merged.insert(loc.id.clone(), merge_site(&loc.id, prim, sec, debug)?);
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::ListCollector;
    use chrono::{Duration, TimeZone};

    fn t(h: i64, m: i64) -> Timestamp {
        chrono_tz::UTC.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap() + Duration::hours(h) + Duration::minutes(m)
    }

    fn frame(index: Vec<Timestamp>, ghi: Vec<Option<f64>>) -> WeatherFrame {
        let n = index.len();
        WeatherFrame::from_columns(
            chrono_tz::UTC,
            index,
            vec![
                (WeatherVar::Ghi, ghi),
                (WeatherVar::Dni, vec![Some(0.0); n]),
                (WeatherVar::Dhi, vec![Some(0.0); n]),
                (WeatherVar::TempAir, vec![Some(15.0); n]),
                (WeatherVar::Wind, vec![Some(1.0); n]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn alignment_fills_only_inside_overlap() {
        let secondary = frame(vec![t(10, 0), t(11, 0)], vec![Some(100.0), Some(200.0)]);
        let target = vec![t(9, 45), t(10, 0), t(10, 15), t(11, 0), t(11, 15)];
        let aligned = align_secondary(&secondary, WeatherVar::Ghi, &target);
        assert_eq!(aligned, vec![None, Some(100.0), Some(100.0), Some(200.0), None]);
    }

    #[test]
    fn merge_fills_missing_and_negative_values() {
        let primary = frame(vec![t(10, 0), t(11, 0), t(12, 0)], vec![Some(50.0), None, Some(-5.0)]);
        let secondary = frame(vec![t(10, 0), t(11, 0), t(12, 0)], vec![Some(1.0), Some(2.0), Some(3.0)]);
        let list = ListCollector::new();
        let merged = merge_site("s", &primary, &secondary, &list).unwrap();
        assert_eq!(merged.column(WeatherVar::Ghi).unwrap(), &[Some(50.0), Some(2.0), Some(3.0)]);
        let merge = list.find("weather.merge");
        assert_eq!(merge[0].payload["filled_points"]["ghi_wm2"], 2);
    }

    #[test]
    fn gap_outside_secondary_span_is_an_error() {
        let primary = frame(vec![t(10, 0), t(13, 0)], vec![Some(50.0), None]);
        let secondary = frame(vec![t(10, 0), t(11, 0)], vec![Some(1.0), Some(2.0)]);
        let err = merge_site("s", &primary, &secondary, &ListCollector::new()).unwrap_err();
        match err {
            WeatherError::Unfilled { column, count, .. } => {
                assert_eq!(column, "ghi_wm2");
                assert_eq!(count, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
