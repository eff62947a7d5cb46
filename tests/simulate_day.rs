use std::collections::HashMap;

use approx::assert_relative_eq;
use chrono::{Duration, NaiveDate, TimeZone};

use solar_day_forecast::debug::{DebugCollector, ListCollector, NullCollector};
use solar_day_forecast::engine::{
    AdjustOutcome, LoadWindowParams, SimulationOptions, TimeLabel, apply_actual_adjustment,
    compute_load_windows, simulate_day,
};
use solar_day_forecast::models::{
    ArraySpec, Location, LocationSpec, PVArray, Scenario, SimulationResult, Site, Timestamp, WeatherFrame,
    WeatherVar,
};
use solar_day_forecast::services::solar_algorithm::clear_sky_series;
use solar_day_forecast::weather::{SiteLocation, WeatherError, WeatherProvider};

const LAT: f64 = 45.07;
const LON: f64 = 7.69;

/// Clear-sky weather at a quarter-hour step for every requested site.
struct ClearSkyProvider;

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 21).unwrap()
}

fn clear_frame() -> WeatherFrame {
    let tz = chrono_tz::Europe::Rome;
    let start = tz.with_ymd_and_hms(2025, 6, 21, 0, 0, 0).unwrap();
    let index: Vec<Timestamp> = (0..96).map(|i| start + Duration::minutes(15 * i)).collect();
    let sky = clear_sky_series(LAT, LON, None, &index);
    let n = index.len();
    WeatherFrame::from_columns(
        tz,
        index,
        vec![
            (WeatherVar::Ghi, sky.iter().map(|c| Some(c.ghi)).collect()),
            (WeatherVar::Dni, sky.iter().map(|c| Some(c.dni)).collect()),
            (WeatherVar::Dhi, sky.iter().map(|c| Some(c.dhi)).collect()),
            (WeatherVar::TempAir, vec![Some(22.0); n]),
            (WeatherVar::Wind, vec![Some(1.5); n]),
        ],
    )
    .unwrap()
}

impl WeatherProvider for ClearSkyProvider {
    fn name(&self) -> &'static str {
        "clear-sky"
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
        let frame = clear_frame();
        Ok(locations.iter().map(|l| (l.id.clone(), frame.clone())).collect())
    }
}

fn options() -> SimulationOptions {
    SimulationOptions {
        timestep: "15m".to_string(),
        label: TimeLabel::End,
        ..SimulationOptions::default()
    }
}

fn site(id: &str, arrays: Vec<ArraySpec>) -> Site {
    let location = Location::new(LocationSpec::new(id, LAT, LON)).unwrap();
    let arrays = arrays.into_iter().map(|a| PVArray::new(a).unwrap()).collect();
    Site::new(id, location, arrays).unwrap()
}

fn run(sites: Vec<Site>) -> SimulationResult {
    let scenario = Scenario::new(sites).unwrap();
    simulate_day(&scenario, date(), &options(), &ClearSkyProvider, &NullCollector).unwrap()
}

fn south(id: &str) -> ArraySpec {
    ArraySpec::new(id, 30.0, 180.0, 4000.0)
}

#[test]
fn two_sites_each_get_daily_rows_and_series() {
    let result = run(vec![
        site("home", vec![south("south"), ArraySpec::new("west", 20.0, 270.0, 2000.0)]),
        site("barn", vec![south("roof")]),
    ]);

    assert_eq!(result.daily.len(), 3);
    assert_eq!(result.timeseries.len(), 3);
    for row in &result.daily {
        assert_eq!(row.date, date());
        assert!(row.energy_kwh > 0.0, "{row:?}");
        assert_eq!(result.series(&row.site, &row.array).unwrap().len(), 96);
    }
    let home_south = result.series("home", "south").unwrap();
    let barn_roof = result.series("barn", "roof").unwrap();
    assert_relative_eq!(
        home_south.rows.iter().map(|r| r.pac_net_w).sum::<f64>(),
        barn_roof.rows.iter().map(|r| r.pac_net_w).sum::<f64>(),
        max_relative = 1e-9
    );
}

#[test]
fn interval_energy_matches_daily_total() {
    let result = run(vec![site("home", vec![south("south")])]);
    let series = result.series("home", "south").unwrap();
    let from_rows: f64 = series.rows.iter().map(|r| r.energy_wh()).sum::<f64>() / 1000.0;
    assert_relative_eq!(from_rows, result.daily[0].energy_kwh, max_relative = 1e-9);
    assert_relative_eq!(result.total_energy_kwh(), result.daily[0].energy_kwh);
}

#[test]
fn shared_inverter_clips_group_output() {
    let mut east = ArraySpec::new("east", 30.0, 150.0, 4000.0);
    let mut west = ArraySpec::new("west", 30.0, 210.0, 4000.0);
    for spec in [&mut east, &mut west] {
        spec.inverter_group_id = Some("inv1".to_string());
        spec.inverter_pdc0_w = Some(3000.0);
    }
    let result = run(vec![site("home", vec![east, west])]);
    let east = result.series("home", "east").unwrap();
    let west = result.series("home", "west").unwrap();

    let pac0 = 0.96 * 3000.0;
    let group: Vec<f64> = east.rows.iter().zip(&west.rows).map(|(e, w)| e.pac_w + w.pac_w).collect();
    assert!(group.iter().all(|p| *p <= pac0 + 1e-6));
    assert_relative_eq!(group.iter().copied().fold(0.0, f64::max), pac0, epsilon = 1e-6);

    for (e, w) in east.rows.iter().zip(&west.rows) {
        if e.pdc_w + w.pdc_w > 0.0 {
            assert_relative_eq!(e.dc_share + w.dc_share, 1.0, epsilon = 1e-9);
        }
    }
}

#[test]
fn grouping_never_adds_energy() {
    let pair = |group: Option<&str>| {
        let mut big = ArraySpec::new("big", 30.0, 180.0, 4000.0);
        let mut small = ArraySpec::new("small", 30.0, 180.0, 2000.0);
        big.inverter_group_id = group.map(str::to_string);
        small.inverter_group_id = group.map(str::to_string);
        run(vec![site("home", vec![big, small])]).total_energy_kwh()
    };
    let ungrouped = pair(None);
    let grouped = pair(Some("inv"));
    assert!(ungrouped > 0.0);
    assert!(grouped <= ungrouped * (1.0 + 1e-9), "grouped {grouped} > ungrouped {ungrouped}");

    // Same total inverter capacity, undersized so both setups clip.
    let clipped = |group: Option<&str>, ratings: [f64; 2]| {
        let mut big = ArraySpec::new("big", 30.0, 180.0, 4000.0);
        let mut small = ArraySpec::new("small", 30.0, 180.0, 2000.0);
        for (spec, rating) in [(&mut big, ratings[0]), (&mut small, ratings[1])] {
            spec.inverter_group_id = group.map(str::to_string);
            spec.inverter_pdc0_w = Some(rating);
        }
        run(vec![site("home", vec![big, small])]).total_energy_kwh()
    };
    let separate = clipped(None, [2000.0, 1000.0]);
    let shared = clipped(Some("inv"), [3000.0, 3000.0]);
    assert!(shared <= separate * (1.0 + 1e-9), "shared {shared} > separate {separate}");
    assert!(shared < pair(Some("inv")));
}

#[test]
fn conflicting_group_ratings_fail() {
    let mut a = south("a");
    let mut b = south("b");
    a.inverter_group_id = Some("inv".to_string());
    b.inverter_group_id = Some("inv".to_string());
    a.inverter_pdc0_w = Some(3000.0);
    b.inverter_pdc0_w = Some(3500.0);
    let scenario = Scenario::new(vec![site("home", vec![a, b])]).unwrap();
    let err = simulate_day(&scenario, date(), &options(), &ClearSkyProvider, &NullCollector).unwrap_err();
    assert!(err.to_string().contains("inv"), "{err}");
}

#[test]
fn damping_lowers_energy_but_not_midday() {
    let mut damped = south("damped");
    damped.damping_morning = Some(0.5);
    damped.damping_evening = Some(0.5);
    let result = run(vec![site("home", vec![south("plain"), damped])]);

    let plain = result.series("home", "plain").unwrap();
    let damped = result.series("home", "damped").unwrap();
    let energy = |name: &str| result.daily.iter().find(|r| r.array == name).unwrap().energy_kwh;
    assert!(energy("damped") < energy("plain"));

    let noon = (0..plain.rows.len())
        .max_by(|a, b| plain.rows[*a].pac_net_w.total_cmp(&plain.rows[*b].pac_net_w))
        .unwrap();
    assert_relative_eq!(damped.rows[noon].damping, 1.0);
    assert_relative_eq!(damped.rows[noon].pac_net_w, plain.rows[noon].pac_net_w, max_relative = 1e-9);
}

#[test]
fn horizon_profile_lowers_energy_but_not_to_zero() {
    let mut shaded = south("shaded");
    shaded.horizon_deg = Some(serde_json::from_str("[20, 20, 20, 20, 20, 20, 20, 20]").unwrap());
    let result = run(vec![site("home", vec![south("open"), shaded])]);
    let energy = |name: &str| result.daily.iter().find(|r| r.array == name).unwrap().energy_kwh;
    assert!(energy("shaded") < energy("open"));
    assert!(energy("shaded") > 0.0);
}

#[test]
fn adjustment_and_load_windows_on_a_result() {
    let result = run(vec![site("home", vec![south("south")])]);
    let list = ListCollector::new();

    let now = chrono_tz::Europe::Rome.with_ymd_and_hms(2025, 6, 21, 12, 0, 0).unwrap();
    let series = result.series("home", "south").unwrap();
    let predicted: f64 = series
        .rows
        .iter()
        .filter(|r| r.ts <= now)
        .map(|r| r.energy_wh())
        .sum::<f64>()
        / 1000.0;

    let adjusted = apply_actual_adjustment(&result, predicted * 0.5, Some(now), &list).unwrap();
    match adjusted.outcome {
        AdjustOutcome::Applied { scale, .. } => assert_relative_eq!(scale, 0.5, max_relative = 1e-9),
        other => panic!("unexpected {other:?}"),
    }
    assert!(adjusted.result.total_energy_kwh() < result.total_energy_kwh());
    assert_eq!(list.find("actual.adjust.applied").len(), 1);

    let params = LoadWindowParams::new(1000.0, 60.0, None).unwrap();
    let windows = compute_load_windows(&result.timeseries, &params, &list);
    let summary = windows["home"].as_ref().unwrap();
    assert!(summary.best.duration_min >= 60.0);
    assert!(summary.best.energy_wh > 0.0);
}
