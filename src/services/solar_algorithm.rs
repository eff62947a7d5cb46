/// ============================================================
///  Solar geometry & clear-sky irradiance
///
///  Algorithm pipeline:
///   1. Solar geometry  – declination, equation of time, hour angle,
///                        elevation / zenith / azimuth angles
///   2. Extraterrestrial irradiance – eccentricity-corrected solar constant
///   3. Clear-sky model  – Bird & Hulstrom simplified:
///                         DNI, DHI, GHI on the horizontal plane
///
///  All instants are converted to UTC before evaluation, so DST and
///  local-time labels have no influence on the geometry.
/// ============================================================

use chrono::{DateTime, Datelike, Timelike, Utc};
use std::f64::consts::PI;

use crate::models::{Location, Timestamp};

// ─── Physical constants ──────────────────────────────────────
const SC: f64 = 1361.0; // Solar constant W/m²
const DEG: f64 = PI / 180.0;
const GROUND_ALBEDO: f64 = 0.2;

// ─── Public output ───────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolarPosition {
    /// Zenith angle (deg)
    pub zenith: f64,
    /// Elevation above the horizon (deg), 90 − zenith
    pub elevation: f64,
    /// Azimuth (deg from North, clockwise)
    pub azimuth: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClearSky {
    pub ghi: f64,
    pub dni: f64,
    pub dhi: f64,
}

/// Fractional year angle (rad) used by the Spencer series.
fn day_angle(instant: &DateTime<Utc>) -> f64 {
    2.0 * PI * (instant.ordinal() as f64 - 1.0) / 365.0
}

/// Eccentricity-corrected extraterrestrial normal irradiance (W/m²).
pub fn extraterrestrial_irradiance(instant: &DateTime<Utc>) -> f64 {
    let b = day_angle(instant);
    SC * (1.00011
        + 0.034221 * b.cos()
        + 0.00128 * b.sin()
        + 0.000719 * (2.0 * b).cos()
        + 0.000077 * (2.0 * b).sin())
}

pub fn solar_position_at(lat_deg: f64, lon_deg: f64, instant: &DateTime<Utc>) -> SolarPosition {
    // ── 1. Time decomposition ──────────────────────────────────
    let b = day_angle(instant);
    let ut_min = instant.hour() as f64 * 60.0
        + instant.minute() as f64
        + instant.second() as f64 / 60.0;

    // ── 2. Solar geometry ──────────────────────────────────────
    // a) Declination (Spencer 1971)
    let decl = 0.006918 - 0.399912 * b.cos() + 0.070257 * b.sin()
        - 0.006758 * (2.0 * b).cos()
        + 0.000907 * (2.0 * b).sin()
        - 0.002697 * (3.0 * b).cos()
        + 0.00148 * (3.0 * b).sin();

    // b) Equation of Time (minutes, Spencer 1971)
    let eot_min = 229.18
        * (0.000075 + 0.001868 * b.cos()
            - 0.032077 * b.sin()
            - 0.014615 * (2.0 * b).cos()
            - 0.04089 * (2.0 * b).sin());

    // c) True solar time (minutes) and hour angle (negative in the morning)
    let tst_min = ut_min + eot_min + 4.0 * lon_deg;
    let omega = (tst_min / 4.0 - 180.0) * DEG;

    // d) Elevation / zenith
    let lat = lat_deg * DEG;
    let cos_zen = (lat.sin() * decl.sin() + lat.cos() * decl.cos() * omega.cos()).clamp(-1.0, 1.0);
    let zenith = cos_zen.acos() / DEG;

    // e) Azimuth, measured clockwise from North
    let azimuth = (omega.sin().atan2(omega.cos() * lat.sin() - decl.tan() * lat.cos()) / DEG
        + 180.0)
        .rem_euclid(360.0);

    SolarPosition {
        zenith,
        elevation: 90.0 - zenith,
        azimuth,
    }
}

/// Solar position for each timestamp, positionally aligned with the input.
pub fn solar_position(location: &Location, times: &[Timestamp]) -> Vec<SolarPosition> {
    times
        .iter()
        .map(|t| solar_position_at(location.lat(), location.lon(), &t.with_timezone(&Utc)))
        .collect()
}

/// Bird & Hulstrom clear-sky irradiance for a known sun position.
pub fn clear_sky_at(
    position: &SolarPosition,
    instant: &DateTime<Utc>,
    elevation_m: Option<f64>,
) -> ClearSky {
    let alpha_deg = position.elevation;
    if alpha_deg <= 0.1 {
        return ClearSky::default();
    }
    let sin_alpha = (alpha_deg * DEG).sin();
    let e0 = extraterrestrial_irradiance(instant);

    // Air mass – Kasten & Young (1989), pressure-corrected for site altitude
    let am_rel = (1.0 / (sin_alpha + 0.50572 * (alpha_deg + 6.07995_f64).powf(-1.6364))).max(1.0);
    let am = am_rel * (-elevation_m.unwrap_or(0.0).max(0.0) / 8434.5).exp();

    // Transmittance components
    // Rayleigh
    let tr = (-0.0903 * am.powf(0.84) * (1.0 + am - am.powf(1.01))).exp();
    // Ozone (standard column 0.3 atm-cm)
    let to = 1.0 - 0.0013 * am_rel;
    // Uniformly mixed gases
    let tum = (-0.0127 * am.powf(0.26)).exp();
    // Aerosol (Linke turbidity 3.0 – typical continental)
    let tk = 3.0_f64;
    let ta = (-0.09 * tk.powf(0.978) * am_rel.powf(0.9455)).exp();
    // Water vapour (moderate precipitable water 1.5 cm)
    let tw = 1.0 - 0.0075 * am_rel.powf(0.65);

    let dni = 0.9662 * e0 * tr * to * tum * ta * tw;

    // Diffuse: Rayleigh + aerosol forward scatter (Ba = 0.84)
    let ba = 0.84;
    let taa = 1.0 - 0.1 * (1.0 - am + am.powf(1.06)) * (1.0 - ta);
    let tas = ta / taa;
    let dhi_scatter = 0.79 * e0 * sin_alpha * to * tum * tw * taa
        * (0.5 * (1.0 - tr) + ba * (1.0 - tas))
        / (1.0 - am + am.powf(1.02));

    // Multiple ground/sky reflections
    let rs = 0.0685 + (1.0 - ba) * (1.0 - tas);
    let ghi = ((dni * sin_alpha + dhi_scatter) / (1.0 - GROUND_ALBEDO * rs)).max(0.0);
    let dhi = (ghi - dni * sin_alpha).max(0.0);

    ClearSky { ghi, dni, dhi }
}

/// Clear-sky irradiance series for a point, one entry per timestamp.
pub fn clear_sky_series(
    lat_deg: f64,
    lon_deg: f64,
    elevation_m: Option<f64>,
    times: &[Timestamp],
) -> Vec<ClearSky> {
    times
        .iter()
        .map(|t| {
            let utc = t.with_timezone(&Utc);
            let pos = solar_position_at(lat_deg, lon_deg, &utc);
            clear_sky_at(&pos, &utc, elevation_m)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn turin(y: i32, m: u32, d: u32, h: u32, min: u32) -> SolarPosition {
        let t = Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap();
        solar_position_at(45.07, 7.33, &t)
    }

    #[test]
    fn test_summer_noon_italy() {
        // Solar noon in Turin is ~11:32 UTC
        let p = turin(2025, 6, 21, 11, 30);
        assert!(p.elevation > 60.0, "Elevation should be >60° at summer noon, got {:.1}", p.elevation);
        assert!((p.azimuth - 180.0).abs() < 5.0, "Sun should be due south, got {:.1}", p.azimuth);
    }

    #[test]
    fn test_midnight_below_horizon() {
        let p = turin(2025, 6, 21, 23, 30);
        assert!(p.elevation < 0.0);
        let t = Utc.with_ymd_and_hms(2025, 6, 21, 23, 30, 0).unwrap();
        assert_eq!(clear_sky_at(&p, &t, None), ClearSky::default());
    }

    #[test]
    fn test_winter_solstice() {
        let p = turin(2025, 12, 21, 11, 30);
        assert!(p.elevation > 15.0 && p.elevation < 35.0,
            "Winter elevation should be 15-35°, got {:.1}", p.elevation);
    }

    #[test]
    fn test_morning_sun_in_the_east() {
        let p = turin(2025, 6, 21, 6, 0);
        assert!(p.azimuth > 45.0 && p.azimuth < 110.0, "got {:.1}", p.azimuth);
    }

    #[test]
    fn test_clear_sky_noon_magnitudes() {
        let t = Utc.with_ymd_and_hms(2025, 6, 21, 11, 30, 0).unwrap();
        let p = solar_position_at(45.07, 7.33, &t);
        let cs = clear_sky_at(&p, &t, Some(240.0));
        assert!(cs.ghi > 800.0 && cs.ghi < 1150.0, "GHI {:.0}", cs.ghi);
        assert!(cs.dni > 700.0 && cs.dni < 1050.0, "DNI {:.0}", cs.dni);
        assert!(cs.dhi > 40.0 && cs.dhi < 300.0, "DHI {:.0}", cs.dhi);
    }
}
