//! Clear-sky irradiance scaled by forecast cloud cover.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde_json::json;

use crate::debug::{DebugCollector, DebugEvent};
use crate::engine::time::TimeLabel;
use crate::models::{WeatherFrame, WeatherVar};
use crate::services::solar_algorithm::{ClearSky, clear_sky_series};
use crate::weather::{SiteLocation, WeatherError, WeatherProvider};

/// Empirical clearness index for a cloud fraction in [0, 1]: `1 − 0.75·C^3.4`.
pub fn default_cloud_to_clearness(cloud_fraction: f64) -> f64 {
    let c = cloud_fraction.clamp(0.0, 1.0);
    (1.0 - 0.75 * c.powf(3.4)).clamp(0.0, 1.0)
}

pub struct CloudScaledProvider {
    base: Box<dyn WeatherProvider>,
    cloud_to_clearness: fn(f64) -> f64,
}

impl CloudScaledProvider {
    pub fn new(base: Box<dyn WeatherProvider>) -> Self {
        Self {
            base,
            cloud_to_clearness: default_cloud_to_clearness,
        }
    }

    pub fn with_mapping(mut self, cloud_to_clearness: fn(f64) -> f64) -> Self {
        self.cloud_to_clearness = cloud_to_clearness;
        self
    }

    fn scale(&self, loc: &SiteLocation, frame: &WeatherFrame) -> Result<(WeatherFrame, Vec<f64>), WeatherError> {
        let cloud = frame
            .column(WeatherVar::CloudCover)
            .ok_or_else(|| WeatherError::MissingColumn {
                site: loc.id.clone(),
                column: WeatherVar::CloudCover.column(),
            })?;
        let clearness: Vec<Option<f64>> = cloud
            .iter()
            .map(|c| c.map(|pct| (self.cloud_to_clearness)(pct / 100.0)))
            .collect();
        let clear_sky = clear_sky_series(loc.lat, loc.lon, loc.elevation_m, frame.index());

        let scaled = |pick: fn(&ClearSky) -> f64| -> Vec<Option<f64>> {
            clear_sky
                .iter()
                .zip(&clearness)
                .map(|(cs, k)| k.map(|k| (pick(cs) * k).max(0.0)))
                .collect()
        };

        let mut out = frame.project(&[WeatherVar::TempAir, WeatherVar::Wind, WeatherVar::CloudCover]);
        out.set_column(WeatherVar::Ghi, scaled(|cs| cs.ghi))?;
        out.set_column(WeatherVar::Dni, scaled(|cs| cs.dni))?;
        out.set_column(WeatherVar::Dhi, scaled(|cs| cs.dhi))?;
        Ok((out, clearness.into_iter().flatten().collect()))
    }
}

impl WeatherProvider for CloudScaledProvider {
    fn name(&self) -> &'static str {
        "cloud-scaled"
    }

    fn default_label(&self) -> Option<TimeLabel> {
        self.base.default_label()
    }

    fn get_forecast(
        &self,
        locations: &[SiteLocation],
        start: NaiveDate,
        end: NaiveDate,
        timestep: &str,
        debug: &dyn DebugCollector,
    ) -> Result<HashMap<String, WeatherFrame>, WeatherError> {
        let base = self.base.get_forecast(locations, start, end, timestep, debug)?;
        let mut results = HashMap::new();
        for loc in locations {
            let frame = base.get(&loc.id).ok_or_else(|| WeatherError::MissingSite {
                provider: self.base.name(),
                site: loc.id.clone(),
            })?;
            let (scaled, clearness) = self.scale(loc, frame)?;

            let ghi_max = scaled
                .column(WeatherVar::Ghi)
                .and_then(|c| c.iter().flatten().copied().reduce(f64::max));
            let mean = (!clearness.is_empty())
                .then(|| clearness.iter().sum::<f64>() / clearness.len() as f64);
            debug.emit(
                DebugEvent::new(
                    "cloudscaled.summary",
                    json!({
                        "clearness_mean": mean,
                        "clearness_min": clearness.iter().copied().reduce(f64::min),
                        "clearness_max": clearness.iter().copied().reduce(f64::max),
                        "ghi_max": ghi_max,
                    }),
                )
                .at(scaled.index().first())
                .site(loc.id.clone()),
            );
            results.insert(loc.id.clone(), scaled);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::ListCollector;
    use crate::models::Timestamp;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    struct Fixed(HashMap<String, WeatherFrame>);

    impl WeatherProvider for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn get_forecast(
            &self,
            _locations: &[SiteLocation],
            _start: NaiveDate,
            _end: NaiveDate,
            _timestep: &str,
            _debug: &dyn DebugCollector,
        ) -> Result<HashMap<String, WeatherFrame>, WeatherError> {
            Ok(self.0.clone())
        }
    }

    fn loc() -> SiteLocation {
        SiteLocation {
            id: "s".into(),
            lat: 45.0,
            lon: 7.5,
            elevation_m: None,
            tz: None,
        }
    }

    fn frame(cloud: Option<Vec<Option<f64>>>) -> WeatherFrame {
        let index: Vec<Timestamp> = [11, 12]
            .iter()
            .map(|h| chrono_tz::UTC.with_ymd_and_hms(2025, 6, 21, *h, 0, 0).unwrap())
            .collect();
        let mut cols = vec![
            (WeatherVar::TempAir, vec![Some(20.0), Some(21.0)]),
            (WeatherVar::Wind, vec![Some(2.0), Some(2.0)]),
        ];
        if let Some(c) = cloud {
            cols.push((WeatherVar::CloudCover, c));
        }
        WeatherFrame::from_columns(chrono_tz::UTC, index, cols).unwrap()
    }

    #[test]
    fn clearness_mapping() {
        assert_relative_eq!(default_cloud_to_clearness(0.0), 1.0);
        assert_relative_eq!(default_cloud_to_clearness(1.0), 0.25);
        assert_relative_eq!(default_cloud_to_clearness(0.5), 1.0 - 0.75 * 0.5_f64.powf(3.4));
        assert_relative_eq!(default_cloud_to_clearness(1.7), 0.25);
    }

    #[test]
    fn overcast_scales_irradiance_down() {
        let base = Fixed(HashMap::from([("s".to_string(), frame(Some(vec![Some(0.0), Some(100.0)])))]));
        let provider = CloudScaledProvider::new(Box::new(base));
        let d = NaiveDate::from_ymd_opt(2025, 6, 21).unwrap();
        let list = ListCollector::new();
        let out = provider.get_forecast(&[loc()], d, d, "1h", &list).unwrap();
        let ghi = out["s"].column(WeatherVar::Ghi).unwrap();
        let clear = ghi[0].unwrap();
        let overcast = ghi[1].unwrap();
        assert!(clear > 500.0);
        assert!(overcast < clear * 0.3);
        assert_eq!(out["s"].column(WeatherVar::TempAir).unwrap(), &[Some(20.0), Some(21.0)]);
        assert_eq!(list.find("cloudscaled.summary").len(), 1);
    }

    #[test]
    fn missing_cloudcover_is_an_error() {
        let base = Fixed(HashMap::from([("s".to_string(), frame(None))]));
        let provider = CloudScaledProvider::new(Box::new(base));
        let d = NaiveDate::from_ymd_opt(2025, 6, 21).unwrap();
        let err = provider.get_forecast(&[loc()], d, d, "1h", &ListCollector::new()).unwrap_err();
        assert!(matches!(err, WeatherError::MissingColumn { column: "cloudcover", .. }));
    }
}
