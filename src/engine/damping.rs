//! Low-sun attenuation around sunrise and sunset.

use std::f64::consts::PI;

use crate::models::Timestamp;

/// Taper length after sunrise / before sunset (hours).
pub const DAMPING_WINDOW_H: f64 = 1.5;

/// Per-sample damping factor in `[min(morning, evening), 1]`.
///
/// Sunrise and sunset are the first and last samples with positive solar
/// elevation. Within the window the factor rises from the configured value to 1
/// along a half-cosine; later assignments (evening) win where windows overlap.
pub fn damping_factor(
    times: &[Timestamp],
    elevation_deg: &[f64],
    morning: f64,
    evening: f64,
) -> Vec<f64> {
    let mut factor = vec![1.0; times.len()];
    if morning >= 1.0 && evening >= 1.0 {
        return factor;
    }
    let lit: Vec<usize> = elevation_deg
        .iter()
        .enumerate()
        .filter(|(_, e)| **e > 0.0)
        .map(|(i, _)| i)
        .collect();
    let (Some(&first), Some(&last)) = (lit.first(), lit.last()) else {
        return factor;
    };
    let sunrise = times[first];
    let sunset = times[last];
    let window_s = DAMPING_WINDOW_H * 3600.0;

    let blend = |frac: f64| 0.5 - 0.5 * (PI * frac.clamp(0.0, 1.0)).cos();

    for (i, t) in times.iter().enumerate() {
        let since_sunrise = (*t - sunrise).num_milliseconds() as f64 / 1000.0;
        if (0.0..=window_s).contains(&since_sunrise) {
            factor[i] = morning + (1.0 - morning) * blend(since_sunrise / window_s);
        }
        let until_sunset = (sunset - *t).num_milliseconds() as f64 / 1000.0;
        if (0.0..=window_s).contains(&until_sunset) {
            factor[i] = evening + (1.0 - evening) * blend(until_sunset / window_s);
        }
    }

    let floor = morning.min(evening);
    factor.iter().map(|f| f.clamp(floor, 1.0)).collect()
}
