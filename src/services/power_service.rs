//! Cell temperature and PVWatts DC/AC conversion.

use crate::error::{EngineError, EngineResult};
use crate::models::Mounting;

/// SAPM thermal coefficients: `T_mod = E·exp(a + b·ws) + T_air`,
/// `T_cell = T_mod + E/1000·ΔT`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SapmParams {
    pub a: f64,
    pub b: f64,
    pub delta_t: f64,
}

pub fn sapm_params(mounting: Mounting) -> SapmParams {
    let (a, b, delta_t) = match mounting {
        Mounting::OpenRackGlassGlass => (-3.47, -0.0594, 3.0),
        Mounting::CloseMountGlassGlass => (-2.98, -0.0471, 1.0),
        Mounting::OpenRackGlassPolymer => (-3.56, -0.0750, 3.0),
        Mounting::InsulatedBackGlassPolymer => (-2.81, -0.0455, 0.0),
    };
    SapmParams { a, b, delta_t }
}

pub fn cell_temperature(
    poa_global: &[f64],
    temp_air_c: &[f64],
    wind_ms: &[f64],
    mounting: Mounting,
) -> Vec<f64> {
    let p = sapm_params(mounting);
    poa_global
        .iter()
        .zip(temp_air_c)
        .zip(wind_ms)
        .map(|((&e, &t_air), &ws)| {
            let e = e.max(0.0);
            let t_module = e * (p.a + p.b * ws.max(0.0)).exp() + t_air;
            t_module + e / 1000.0 * p.delta_t
        })
        .collect()
}

/// P = P_nom · (G / 1000) · [1 + γ · (T_cell − 25)]
pub fn pvwatts_dc(
    effective_irradiance: &[f64],
    temp_cell_c: &[f64],
    pdc0_w: f64,
    gamma_pdc: f64,
) -> Vec<f64> {
    effective_irradiance
        .iter()
        .zip(temp_cell_c)
        .map(|(&g, &tc)| (pdc0_w * (g / 1000.0) * (1.0 + gamma_pdc * (tc - 25.0))).max(0.0))
        .collect()
}

const ETA_REF: f64 = 0.9637;

/// PVWatts inverter model with clipping at `eta_inv_nom · pdc0_inv_w`.
pub fn pvwatts_ac(pdc_w: &[f64], pdc0_inv_w: f64, eta_inv_nom: f64) -> Vec<f64> {
    let pac0 = eta_inv_nom * pdc0_inv_w;
    pdc_w
        .iter()
        .map(|&pdc| {
            if pdc <= 0.0 || pdc0_inv_w <= 0.0 {
                return 0.0;
            }
            let zeta = pdc / pdc0_inv_w;
            let eta = eta_inv_nom / ETA_REF * (-0.0162 * zeta - 0.0059 / zeta + 0.9858);
            (eta * pdc).clamp(0.0, pac0)
        })
        .collect()
}

pub fn losses_factor(losses_percent: f64) -> f64 {
    (1.0 - losses_percent / 100.0).max(0.0)
}

pub fn apply_losses(pac_w: &[f64], losses_percent: f64) -> Vec<f64> {
    let factor = losses_factor(losses_percent);
    pac_w.iter().map(|p| p * factor).collect()
}

/// DC input rating of the inverter implied by a DC/AC ratio.
pub fn inverter_pdc0_from_dc_ac_ratio(
    pdc0_w: f64,
    dc_ac_ratio: f64,
    eta_inv_nom: f64,
) -> EngineResult<f64> {
    if !(dc_ac_ratio > 0.0) {
        return Err(EngineError::InvalidParameter {
            what: "dc_ac_ratio",
            value: dc_ac_ratio,
        });
    }
    if !(eta_inv_nom > 0.0 && eta_inv_nom <= 1.0) {
        return Err(EngineError::InvalidParameter {
            what: "eta_inv_nom",
            value: eta_inv_nom,
        });
    }
    Ok(pdc0_w / dc_ac_ratio / eta_inv_nom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn dc_scales_with_irradiance_and_temperature() {
        let dc = pvwatts_dc(&[1000.0, 500.0, 1000.0], &[25.0, 25.0, 50.0], 4000.0, -0.004);
        assert_relative_eq!(dc[0], 4000.0);
        assert_relative_eq!(dc[1], 2000.0);
        assert_relative_eq!(dc[2], 3600.0);
    }

    #[test]
    fn ac_clips_at_rated_output() {
        let ac = pvwatts_ac(&[0.0, 1000.0, 10_000.0], 4000.0, 0.96);
        assert_eq!(ac[0], 0.0);
        assert!(ac[1] > 900.0 && ac[1] < 1000.0);
        assert_relative_eq!(ac[2], 0.96 * 4000.0);
    }

    #[test]
    fn ac_is_never_negative_at_tiny_input() {
        let ac = pvwatts_ac(&[0.01], 4000.0, 0.96);
        assert!(ac[0] >= 0.0);
    }

    #[test]
    fn losses_are_floored_at_zero() {
        assert_relative_eq!(apply_losses(&[1000.0], 14.0)[0], 860.0, max_relative = 1e-12);
        assert_eq!(losses_factor(120.0), 0.0);
    }

    #[test]
    fn inverter_rating_from_ratio() {
        assert_relative_eq!(inverter_pdc0_from_dc_ac_ratio(4800.0, 1.2, 1.0).unwrap(), 4000.0);
        assert!(inverter_pdc0_from_dc_ac_ratio(4800.0, 0.0, 0.96).is_err());
        assert!(inverter_pdc0_from_dc_ac_ratio(4800.0, 1.2, 1.5).is_err());
    }

    #[test]
    fn sapm_open_rack_runs_hotter_than_air_in_sun() {
        let t = cell_temperature(&[800.0, 0.0], &[20.0, 20.0], &[1.0, 1.0], Mounting::OpenRackGlassGlass);
        // 800·exp(-3.47 - 0.0594) + 20 + 0.8·3 ≈ 45.7
        assert_relative_eq!(t[0], 800.0 * (-3.5294_f64).exp() + 22.4, max_relative = 1e-9);
        assert_relative_eq!(t[1], 20.0);
        let insulated = cell_temperature(&[800.0], &[20.0], &[1.0], Mounting::InsulatedBackGlassPolymer);
        assert!(insulated[0] > t[0]);
    }
}
