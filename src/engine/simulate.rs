//! Full-day simulation of every site and array in a scenario.
//!
//! Per site the weather is cut to the local calendar day, solar geometry is
//! evaluated at label-corrected instants, and each array runs through
//! transposition, cell temperature, damping and DC conversion. Arrays sharing
//! an inverter are then combined, clipped and split back before losses and
//! daily aggregation.

use chrono::{Duration, NaiveDate, TimeZone};
use chrono_tz::Tz;
use serde_json::json;

use crate::debug::{DebugCollector, DebugEvent, ScopedCollector};
use crate::engine::aggregate::{clamp_daily, summarize_array};
use crate::engine::damping::damping_factor;
use crate::engine::inverter::{allocate_group_ac, group_arrays, group_rating};
use crate::engine::time::{TimeLabel, apply_time_label, infer_step_seconds, interval_hours};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    ArraySeries, DailyRow, IntervalRow, PVArray, Scenario, SimulationResult, Site, Timestamp,
    WeatherFrame, WeatherVar,
};
use crate::services::irradiance::{Irradiance, PoaComponents, PoaInputs, SkyModel, poa_irradiance};
use crate::services::power_service::{apply_losses, cell_temperature, pvwatts_dc};
use crate::services::solar_algorithm::{SolarPosition, solar_position};
use crate::weather::{SiteLocation, WeatherProvider};

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationOptions {
    /// Requested provider resolution, e.g. `"1h"` or `"15m"`
    pub timestep: String,
    /// Which end of its period a weather timestamp denotes
    pub label: TimeLabel,
    pub sky_model: SkyModel,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            timestep: "1h".to_string(),
            label: TimeLabel::End,
            sky_model: SkyModel::default(),
        }
    }
}

/// Intermediate per-array series for one site.
struct ArrayWork<'a> {
    array: &'a PVArray,
    poa: Vec<PoaComponents>,
    temp_cell_c: Vec<f64>,
    damping: Vec<f64>,
    pdc_w: Vec<f64>,
    dc_share: Vec<f64>,
    pac_w: Vec<f64>,
}

/// Weather columns of the day window with every value present.
struct DayWeather {
    times: Vec<Timestamp>,
    temp_air_c: Vec<f64>,
    wind_ms: Vec<f64>,
    irradiance: Vec<Irradiance>,
}

pub fn simulate_day(
    scenario: &Scenario,
    date: NaiveDate,
    options: &SimulationOptions,
    weather: &dyn WeatherProvider,
    debug: &dyn DebugCollector,
) -> EngineResult<SimulationResult> {
    let locations: Vec<SiteLocation> = scenario.sites().iter().map(SiteLocation::from).collect();
    debug.emit(
        DebugEvent::new(
            "weather.request",
            json!({
                "provider": weather.name(),
                "timestep": options.timestep,
                "label": options.label.as_str(),
                "locations": locations.iter().map(|l| l.id.as_str()).collect::<Vec<_>>(),
            }),
        )
        .on_date(date),
    );
    let end = date.succ_opt().unwrap_or(date);
    let frames = weather.get_forecast(&locations, date, end, &options.timestep, debug)?;

    // Schema problems abort before any site is simulated.
    let mut site_frames = Vec::with_capacity(scenario.sites().len());
    for site in scenario.sites() {
        let frame = frames
            .get(site.id())
            .ok_or_else(|| EngineError::MissingSiteWeather {
                site: site.id().to_string(),
            })?;
        let missing = frame.missing(&WeatherVar::REQUIRED);
        if !missing.is_empty() {
            let mut missing: Vec<String> = missing.iter().map(|v| v.column().to_string()).collect();
            missing.sort();
            let mut available: Vec<&str> = frame.vars().map(WeatherVar::column).collect();
            available.sort();
            debug.emit(
                DebugEvent::new(
                    "weather.schema_error",
                    json!({ "missing_columns": missing, "available": available }),
                )
                .at(frame.index().first())
                .site(site.id()),
            );
            return Err(EngineError::MissingWeatherColumns {
                site: site.id().to_string(),
                missing,
            });
        }
        site_frames.push((site, frame));
    }

    if let Some(expected) = weather.default_label().filter(|l| *l != options.label) {
        debug.emit(
            DebugEvent::new(
                "weather.label_warning",
                json!({
                    "provider": weather.name(),
                    "expected": expected.as_str(),
                    "received": options.label.as_str(),
                }),
            )
            .on_date(date),
        );
    }

    let mut daily = Vec::new();
    let mut result = SimulationResult::default();
    for (site, frame) in site_frames {
        for (row, series) in simulate_site(site, frame, date, options, debug)? {
            result.timeseries.insert(row.key(), series);
            daily.push(row);
        }
    }
    result.daily = clamp_daily(daily);
    Ok(result)
}

/// First instant of `date` in `tz`. A midnight skipped by DST falls back to
/// the next existing hour.
fn local_midnight(tz: Tz, date: NaiveDate) -> Timestamp {
    let naive = date.and_time(chrono::NaiveTime::MIN);
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .unwrap_or_else(|| tz.from_utc_datetime(&naive))
}

fn day_weather(site: &Site, frame: &WeatherFrame, date: NaiveDate) -> EngineResult<DayWeather> {
    let tz = frame.tz();
    let start = local_midnight(tz, date);
    let end = local_midnight(tz, date.succ_opt().unwrap_or(date));
    let wx = frame.window(&start, &end);
    if wx.is_empty() {
        return Err(EngineError::EmptyWeatherWindow {
            site: site.id().to_string(),
            date: date.to_string(),
        });
    }

    let column = |var: WeatherVar| -> EngineResult<Vec<f64>> {
        let values = wx.column(var).ok_or_else(|| EngineError::MissingWeatherColumns {
            site: site.id().to_string(),
            missing: vec![var.column().to_string()],
        })?;
        let gaps = values.iter().filter(|v| v.is_none()).count();
        if gaps > 0 {
            return Err(EngineError::WeatherGap {
                site: site.id().to_string(),
                column: var.column().to_string(),
                count: gaps,
            });
        }
        Ok(values.iter().flatten().copied().collect())
    };

    let temp_air_c = column(WeatherVar::TempAir)?;
    let wind_ms = column(WeatherVar::Wind)?;
    let ghi = column(WeatherVar::Ghi)?;
    let dni = column(WeatherVar::Dni)?;
    let dhi = column(WeatherVar::Dhi)?;
    let irradiance = ghi
        .iter()
        .zip(&dni)
        .zip(&dhi)
        .map(|((&ghi, &dni), &dhi)| Irradiance { ghi, dni, dhi })
        .collect();

    Ok(DayWeather {
        times: wx.index().to_vec(),
        temp_air_c,
        wind_ms,
        irradiance,
    })
}

fn max_of(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    values.into_iter().reduce(f64::max)
}

/// Per-sample dump of a series, only with the `verbose_log` feature.
fn emit_detail(debug: &dyn DebugCollector, stage: &str, times: &[Timestamp], values: &[f64]) {
    if !cfg!(feature = "verbose_log") {
        return;
    }
    let rows: Vec<_> = times
        .iter()
        .zip(values)
        .map(|(ts, v)| json!({ "ts": ts.to_rfc3339(), "value": v }))
        .collect();
    debug.emit(DebugEvent::new(stage, json!({ "rows": rows })).at(times.first()));
}

fn simulate_array<'a>(
    array: &'a PVArray,
    wx: &DayWeather,
    sun: &[SolarPosition],
    solar_times: &[Timestamp],
    options: &SimulationOptions,
    debug: &dyn DebugCollector,
) -> ArrayWork<'a> {
    let first = wx.times.first();
    let poa = poa_irradiance(&PoaInputs {
        tilt_deg: array.tilt_deg(),
        azimuth_deg: array.azimuth_deg(),
        albedo: array.albedo(),
        horizon_deg: array.horizon_deg(),
        iam_b0: array.iam_b0(),
        sky_model: options.sky_model,
        times: solar_times,
        sun,
        irradiance: &wx.irradiance,
    });
    let poa_global: Vec<f64> = poa.iter().map(|p| p.poa_global).collect();
    debug.emit(
        DebugEvent::new(
            "stage.poa",
            json!({ "rows": poa.len(), "poa_global_max": max_of(poa_global.iter().copied()) }),
        )
        .at(first),
    );
    emit_detail(debug, "poa.detail", &wx.times, &poa_global);

    // Thermal model sees the undamped irradiance.
    let temp_cell_c = cell_temperature(&poa_global, &wx.temp_air_c, &wx.wind_ms, array.mounting());
    debug.emit(
        DebugEvent::new(
            "stage.temp",
            json!({ "rows": temp_cell_c.len(), "temp_cell_max": max_of(temp_cell_c.iter().copied()) }),
        )
        .at(first),
    );
    emit_detail(debug, "temp.detail", &wx.times, &temp_cell_c);

    let elevation: Vec<f64> = sun.iter().map(|s| s.elevation).collect();
    let damping = damping_factor(
        &wx.times,
        &elevation,
        array.damping_morning(),
        array.damping_evening(),
    );
    debug.emit(
        DebugEvent::new(
            "damping.summary",
            json!({
                "morning": array.damping_morning(),
                "evening": array.damping_evening(),
                "min_factor": damping.iter().copied().reduce(f64::min),
                "max_factor": max_of(damping.iter().copied()),
            }),
        )
        .at(first),
    );

    let effective: Vec<f64> = poa_global.iter().zip(&damping).map(|(p, d)| p * d).collect();
    let pdc_w = pvwatts_dc(&effective, &temp_cell_c, array.pdc0_w(), array.gamma_pdc());
    debug.emit(
        DebugEvent::new(
            "stage.dc",
            json!({ "rows": pdc_w.len(), "pdc_max_w": max_of(pdc_w.iter().copied()) }),
        )
        .at(first),
    );
    emit_detail(debug, "dc.detail", &wx.times, &pdc_w);

    ArrayWork {
        array,
        poa,
        temp_cell_c,
        damping,
        pdc_w,
        dc_share: Vec::new(),
        pac_w: Vec::new(),
    }
}

fn simulate_site(
    site: &Site,
    frame: &WeatherFrame,
    date: NaiveDate,
    options: &SimulationOptions,
    debug: &dyn DebugCollector,
) -> EngineResult<Vec<(DailyRow, ArraySeries)>> {
    let site_debug = ScopedCollector::site(debug, site.id());
    let wx = day_weather(site, frame, date)?;
    let times = &wx.times;
    let first = times.first();

    let step_seconds = infer_step_seconds(times, Some(&options.timestep));
    let interval_h =
        interval_hours(times, step_seconds, options.label).map_err(|e| e.at_site(site.id()))?;
    site_debug.emit(
        DebugEvent::new(
            "weather.window",
            json!({
                "rows": times.len(),
                "timezone": frame.tz().name(),
                "timestep_seconds": step_seconds,
            }),
        )
        .at(first),
    );

    // Geometry at the period midpoint, re-attached to the original stamps by position.
    let solar_times = apply_time_label(times, step_seconds, options.label);
    let sun = solar_position(site.location(), &solar_times);
    site_debug.emit(
        DebugEvent::new(
            "stage.solarpos",
            json!({
                "rows": sun.len(),
                "elevation_max": max_of(sun.iter().map(|s| s.elevation)),
            }),
        )
        .at(first),
    );

    let mut work: Vec<ArrayWork<'_>> = site
        .arrays()
        .iter()
        .map(|array| {
            let arr_debug = site_debug.array(array.id());
            simulate_array(array, &wx, &sun, &solar_times, options, &arr_debug)
        })
        .collect();

    for group in group_arrays(site.arrays()) {
        let rating = group_rating(site.id(), &group)?;
        let members: Vec<usize> = group
            .members
            .iter()
            .filter_map(|m| work.iter().position(|w| w.array.id() == m.id()))
            .collect();
        let member_pdc: Vec<&[f64]> = members.iter().map(|&i| work[i].pdc_w.as_slice()).collect();
        site_debug.emit(
            DebugEvent::new(
                "ac.group",
                json!({
                    "group": group.id,
                    "members": group.members.iter().map(|m| m.id()).collect::<Vec<_>>(),
                }),
            )
            .at(first),
        );
        let allocation = allocate_group_ac(&member_pdc, &rating, &site_debug);
        for ((idx, pac), share) in members
            .into_iter()
            .zip(allocation.member_pac_w)
            .zip(allocation.member_share)
        {
            work[idx].pac_w = pac;
            work[idx].dc_share = share;
        }
    }

    let mut out = Vec::with_capacity(work.len());
    for w in work {
        let arr_debug = site_debug.array(w.array.id());
        let pac_net_w = apply_losses(&w.pac_w, w.array.losses_percent());
        arr_debug.emit(
            DebugEvent::new(
                "stage.ac",
                json!({
                    "rows": w.pac_w.len(),
                    "pac_max_w": max_of(w.pac_w.iter().copied()),
                    "pac_net_max_w": max_of(pac_net_w.iter().copied()),
                    "losses_percent": w.array.losses_percent(),
                }),
            )
            .at(first),
        );
        emit_detail(&arr_debug, "ac.net", times, &pac_net_w);

        let rows: Vec<IntervalRow> = (0..times.len())
            .map(|i| IntervalRow {
                ts: times[i],
                poa_global: w.poa[i].poa_global,
                poa_direct: w.poa[i].poa_direct,
                poa_diffuse: w.poa[i].poa_diffuse,
                poa_ground_diffuse: w.poa[i].poa_ground_diffuse,
                temp_cell_c: w.temp_cell_c[i],
                damping: w.damping[i],
                pdc_w: w.pdc_w[i],
                dc_share: w.dc_share.get(i).copied().unwrap_or(0.0),
                pac_w: w.pac_w.get(i).copied().unwrap_or(0.0),
                pac_net_w: pac_net_w.get(i).copied().unwrap_or(0.0),
                interval_h: interval_h[i],
            })
            .collect();

        let row = summarize_array(site.id(), w.array.id(), date, &rows);
        arr_debug.emit(
            DebugEvent::new(
                "stage.aggregate",
                json!({
                    "rows": rows.len(),
                    "interval_h_mean": interval_h.iter().sum::<f64>() / interval_h.len() as f64,
                    "energy_kwh": row.energy_kwh,
                    "peak_kw": row.peak_kw,
                    "poa_kwh_m2": row.poa_kwh_m2,
                }),
            )
            .at(first),
        );
        out.push((row, ArraySeries::new(rows)));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::ListCollector;
    use crate::models::{ArraySpec, Location, LocationSpec};
    use crate::weather::WeatherError;
    use std::collections::HashMap;

    /// Returns a fixed frame for every requested site.
    struct Canned(WeatherFrame);

    impl WeatherProvider for Canned {
        fn name(&self) -> &'static str {
            "canned"
        }

        fn default_label(&self) -> Option<TimeLabel> {
            Some(TimeLabel::End)
        }

        fn get_forecast(
            &self,
            locations: &[SiteLocation],
            _start: NaiveDate,
            _end: NaiveDate,
            _timestep: &str,
            _debug: &dyn DebugCollector,
        ) -> Result<HashMap<String, WeatherFrame>, WeatherError> {
            Ok(locations
                .iter()
                .map(|l| (l.id.clone(), self.0.clone()))
                .collect())
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 21).unwrap()
    }

    fn scenario() -> Scenario {
        let location = Location::new(LocationSpec::new("home", 45.07, 7.69)).unwrap();
        let array = PVArray::new(ArraySpec::new("south", 30.0, 180.0, 4000.0)).unwrap();
        Scenario::new(vec![Site::new("home", location, vec![array]).unwrap()]).unwrap()
    }

    fn frame(drop: &[WeatherVar], gap_at: Option<usize>) -> WeatherFrame {
        let tz = chrono_tz::Europe::Rome;
        let start = local_midnight(tz, date());
        let index: Vec<Timestamp> = (0..24).map(|h| start + Duration::hours(h)).collect();
        let sky = crate::services::solar_algorithm::clear_sky_series(45.07, 7.69, None, &index);
        let col = |f: fn(&crate::services::solar_algorithm::ClearSky) -> f64| {
            sky.iter()
                .enumerate()
                .map(|(i, cs)| if Some(i) == gap_at { None } else { Some(f(cs)) })
                .collect::<Vec<_>>()
        };
        let n = index.len();
        let columns = vec![
            (WeatherVar::Ghi, col(|c| c.ghi)),
            (WeatherVar::Dni, col(|c| c.dni)),
            (WeatherVar::Dhi, col(|c| c.dhi)),
            (WeatherVar::TempAir, vec![Some(25.0); n]),
            (WeatherVar::Wind, vec![Some(2.0); n]),
        ]
        .into_iter()
        .filter(|(v, _)| !drop.contains(v))
        .collect();
        WeatherFrame::from_columns(tz, index, columns).unwrap()
    }

    #[test]
    fn clear_day_produces_energy() {
        let list = ListCollector::new();
        let result = simulate_day(
            &scenario(),
            date(),
            &SimulationOptions::default(),
            &Canned(frame(&[], None)),
            &list,
        )
        .unwrap();
        assert_eq!(result.daily.len(), 1);
        let row = &result.daily[0];
        assert!(row.energy_kwh > 15.0 && row.energy_kwh < 40.0, "{}", row.energy_kwh);
        assert!(row.peak_kw <= 4.0);
        let series = result.series("home", "south").unwrap();
        assert_eq!(series.len(), 24);
        assert!(list.find("weather.label_warning").is_empty());
        assert_eq!(list.find("stage.dc")[0].array.as_deref(), Some("south"));
    }

    #[test]
    fn missing_column_fails_before_power_stages() {
        let list = ListCollector::new();
        let err = simulate_day(
            &scenario(),
            date(),
            &SimulationOptions::default(),
            &Canned(frame(&[WeatherVar::Dhi], None)),
            &list,
        )
        .unwrap_err();
        match err {
            EngineError::MissingWeatherColumns { site, missing } => {
                assert_eq!(site, "home");
                assert_eq!(missing, vec!["dhi_wm2".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(list.find("weather.schema_error").len(), 1);
        assert!(list.find("stage.poa").is_empty());
    }

    #[test]
    fn gap_inside_day_is_fatal() {
        let err = simulate_day(
            &scenario(),
            date(),
            &SimulationOptions::default(),
            &Canned(frame(&[], Some(12))),
            &ListCollector::new(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::WeatherGap { count: 1, .. }));
    }

    #[test]
    fn other_day_is_an_empty_window() {
        let err = simulate_day(
            &scenario(),
            NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
            &SimulationOptions::default(),
            &Canned(frame(&[], None)),
            &ListCollector::new(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::EmptyWeatherWindow { .. }));
    }

    #[test]
    fn label_mismatch_is_reported() {
        let list = ListCollector::new();
        let options = SimulationOptions {
            label: TimeLabel::Start,
            ..SimulationOptions::default()
        };
        simulate_day(&scenario(), date(), &options, &Canned(frame(&[], None)), &list).unwrap();
        let warning = list.find("weather.label_warning");
        assert_eq!(warning.len(), 1);
        assert_eq!(warning[0].payload["expected"], "end");
    }

    #[test]
    fn local_midnight_in_zone() {
        let t = local_midnight(chrono_tz::Europe::Rome, date());
        assert_eq!(t.to_rfc3339(), "2025-06-21T00:00:00+02:00");
    }
}
