//! Plane-of-array transposition with horizon shading and incidence losses.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::models::Timestamp;
use crate::services::solar_algorithm::{SolarPosition, extraterrestrial_irradiance};

const DEG: f64 = std::f64::consts::PI / 180.0;

/// Sky diffuse transposition model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkyModel {
    Isotropic,
    #[default]
    HayDavies,
}

/// Horizontal irradiance of one sample (W/m²).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Irradiance {
    pub ghi: f64,
    pub dni: f64,
    pub dhi: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PoaComponents {
    pub poa_global: f64,
    pub poa_direct: f64,
    pub poa_diffuse: f64,
    pub poa_ground_diffuse: f64,
}

pub struct PoaInputs<'a> {
    pub tilt_deg: f64,
    /// Surface azimuth, compass degrees (any range)
    pub azimuth_deg: f64,
    pub albedo: f64,
    pub horizon_deg: Option<&'a [f64]>,
    pub iam_b0: Option<f64>,
    pub sky_model: SkyModel,
    pub times: &'a [Timestamp],
    pub sun: &'a [SolarPosition],
    pub irradiance: &'a [Irradiance],
}

/// Horizon elevation at `azimuth_deg`, linearly interpolated between evenly
/// spaced bins that start at North and wrap around at 360°.
pub fn horizon_elevation_at(profile: &[f64], azimuth_deg: f64) -> f64 {
    match profile.len() {
        0 => 0.0,
        1 => profile[0],
        n => {
            let step = 360.0 / n as f64;
            let pos = azimuth_deg.rem_euclid(360.0) / step;
            let lo = (pos.floor() as usize) % n;
            let hi = (lo + 1) % n;
            let frac = pos - pos.floor();
            profile[lo] + (profile[hi] - profile[lo]) * frac
        }
    }
}

/// ASHRAE incidence-angle modifier, 0 beyond 90° incidence.
pub fn iam_ashrae(cos_aoi: f64, b0: f64) -> f64 {
    if cos_aoi <= 0.0 {
        return 0.0;
    }
    (1.0 - b0 * (1.0 / cos_aoi - 1.0)).clamp(0.0, 1.0)
}

pub fn poa_irradiance(inputs: &PoaInputs<'_>) -> Vec<PoaComponents> {
    let tilt = inputs.tilt_deg * DEG;
    let surf_az = inputs.azimuth_deg.rem_euclid(360.0);
    let sky_view = (1.0 + tilt.cos()) / 2.0;
    let ground_view = (1.0 - tilt.cos()) / 2.0;

    inputs
        .sun
        .iter()
        .zip(inputs.irradiance)
        .zip(inputs.times)
        .map(|((sun, irr), ts)| {
            let zen = sun.zenith * DEG;
            let cos_zen = zen.cos();
            let cos_aoi = (cos_zen * tilt.cos()
                + zen.sin() * tilt.sin() * ((sun.azimuth - surf_az) * DEG).cos())
            .clamp(-1.0, 1.0);

            let dni = irr.dni.max(0.0);
            let dhi = irr.dhi.max(0.0);
            let ghi = irr.ghi.max(0.0);

            let shaded = inputs
                .horizon_deg
                .is_some_and(|h| sun.elevation <= horizon_elevation_at(h, sun.azimuth));
            let mut direct = if sun.zenith >= 90.0 || shaded {
                0.0
            } else {
                dni * cos_aoi.max(0.0)
            };
            if let Some(b0) = inputs.iam_b0 {
                direct *= iam_ashrae(cos_aoi, b0);
            }

            let diffuse = match inputs.sky_model {
                SkyModel::Isotropic => dhi * sky_view,
                SkyModel::HayDavies => {
                    let dni_extra = extraterrestrial_irradiance(&ts.with_timezone(&Utc));
                    let ai = if sun.zenith < 90.0 {
                        (dni / dni_extra).clamp(0.0, 1.0)
                    } else {
                        0.0
                    };
                    let rb = cos_aoi.max(0.0) / cos_zen.max(0.01745);
                    dhi * (ai * rb + (1.0 - ai) * sky_view)
                }
            }
            .max(0.0);

            let ground = (ghi * inputs.albedo * ground_view).max(0.0);

            PoaComponents {
                poa_global: direct + diffuse + ground,
                poa_direct: direct,
                poa_diffuse: diffuse,
                poa_ground_diffuse: ground,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn noon() -> Timestamp {
        chrono_tz::UTC.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn inputs<'a>(
        times: &'a [Timestamp],
        sun: &'a [SolarPosition],
        irr: &'a [Irradiance],
    ) -> PoaInputs<'a> {
        PoaInputs {
            tilt_deg: 30.0,
            azimuth_deg: 180.0,
            albedo: 0.2,
            horizon_deg: None,
            iam_b0: None,
            sky_model: SkyModel::Isotropic,
            times,
            sun,
            irradiance: irr,
        }
    }

    #[test]
    fn horizon_interpolation_wraps() {
        let profile = [0.0, 10.0, 20.0, 30.0];
        assert_relative_eq!(horizon_elevation_at(&profile, 45.0), 5.0);
        assert_relative_eq!(horizon_elevation_at(&profile, 315.0), 15.0);
        assert_relative_eq!(horizon_elevation_at(&profile, -45.0), 15.0);
        let twelve: Vec<f64> = (0..12).map(|i| if i == 11 { 30.0 } else { 0.0 }).collect();
        assert_relative_eq!(horizon_elevation_at(&twelve, 345.0), 15.0);
    }

    #[test]
    fn horizon_blocks_direct_beam_only() {
        let times = [noon()];
        let sun = [SolarPosition { zenith: 80.0, elevation: 10.0, azimuth: 180.0 }];
        let irr = [Irradiance { ghi: 300.0, dni: 500.0, dhi: 100.0 }];
        let open = poa_irradiance(&inputs(&times, &sun, &irr))[0];
        let horizon = [15.0; 4];
        let mut blocked_in = inputs(&times, &sun, &irr);
        blocked_in.horizon_deg = Some(&horizon);
        let blocked = poa_irradiance(&blocked_in)[0];

        assert!(open.poa_direct > 0.0);
        assert_eq!(blocked.poa_direct, 0.0);
        assert_relative_eq!(blocked.poa_diffuse, open.poa_diffuse);
        assert!(blocked.poa_global > 0.0);
    }

    #[test]
    fn sun_below_horizon_gives_no_beam() {
        let times = [noon()];
        let sun = [SolarPosition { zenith: 100.0, elevation: -10.0, azimuth: 180.0 }];
        let irr = [Irradiance { ghi: 0.0, dni: 500.0, dhi: 0.0 }];
        let poa = poa_irradiance(&inputs(&times, &sun, &irr))[0];
        assert_eq!(poa.poa_direct, 0.0);
        assert!(poa.poa_global >= 0.0);
    }

    #[test]
    fn flat_plate_recovers_ghi() {
        let times = [noon()];
        let sun = [SolarPosition { zenith: 30.0, elevation: 60.0, azimuth: 170.0 }];
        let dni = 800.0;
        let dhi = 120.0;
        let ghi = dni * (30.0 * DEG).cos() + dhi;
        let irr = [Irradiance { ghi, dni, dhi }];
        for model in [SkyModel::Isotropic, SkyModel::HayDavies] {
            let mut flat = inputs(&times, &sun, &irr);
            flat.tilt_deg = 0.0;
            flat.sky_model = model;
            let poa = poa_irradiance(&flat)[0];
            assert_relative_eq!(poa.poa_global, ghi, max_relative = 1e-9);
            assert_eq!(poa.poa_ground_diffuse, 0.0);
        }
    }

    #[test]
    fn iam_reduces_oblique_beam() {
        assert_relative_eq!(iam_ashrae(1.0, 0.05), 1.0);
        assert!(iam_ashrae((70.0 * DEG).cos(), 0.05) < 1.0);
        assert_eq!(iam_ashrae(-0.2, 0.05), 0.0);
    }
}
