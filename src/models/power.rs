use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Serialize, Serializer};

use crate::models::Timestamp;

pub(crate) fn serialize_ts<S: Serializer>(ts: &Timestamp, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&ts.to_rfc3339())
}

// ─── Per-interval series ─────────────────────────────────────────────────────

/// One simulated sample of a single array.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntervalRow {
    #[serde(serialize_with = "serialize_ts")]
    pub ts: Timestamp,
    /// Plane-of-array irradiance components (W/m²)
    pub poa_global: f64,
    pub poa_direct: f64,
    pub poa_diffuse: f64,
    pub poa_ground_diffuse: f64,
    /// Cell temperature (°C), computed from undamped POA
    pub temp_cell_c: f64,
    /// Sunrise/sunset attenuation factor [0..1]
    pub damping: f64,
    /// DC power (W)
    pub pdc_w: f64,
    /// Fraction of the inverter group's DC contributed by this array
    pub dc_share: f64,
    /// AC allocated to this array before losses (W)
    pub pac_w: f64,
    /// AC after system losses (W)
    pub pac_net_w: f64,
    /// Width of the interval this sample represents (h)
    pub interval_h: f64,
}

impl IntervalRow {
    pub fn energy_wh(&self) -> f64 {
        self.pac_net_w * self.interval_h
    }
}

/// Chronologically ordered samples of one array.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct ArraySeries {
    pub rows: Vec<IntervalRow>,
}

impl ArraySeries {
    pub fn new(rows: Vec<IntervalRow>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first_ts(&self) -> Option<&Timestamp> {
        self.rows.first().map(|r| &r.ts)
    }

    pub fn last_ts(&self) -> Option<&Timestamp> {
        self.rows.last().map(|r| &r.ts)
    }
}

/// (site id, array id)
pub type ArrayKey = (String, String);

// ─── Daily summary ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyRow {
    pub site: String,
    pub array: String,
    pub date: NaiveDate,
    pub energy_kwh: f64,
    pub peak_kw: f64,
    pub poa_kwh_m2: f64,
    pub temp_cell_max: f64,
    pub baseline_poa_kwh_m2: Option<f64>,
    pub qc_clipped: bool,
    pub qc_ratio: Option<f64>,
}

impl DailyRow {
    pub fn key(&self) -> ArrayKey {
        (self.site.clone(), self.array.clone())
    }
}

/// Outcome of one day simulation. Post-processing returns new values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SimulationResult {
    pub daily: Vec<DailyRow>,
    pub timeseries: BTreeMap<ArrayKey, ArraySeries>,
}

impl SimulationResult {
    pub fn total_energy_kwh(&self) -> f64 {
        self.daily.iter().map(|r| r.energy_kwh).sum()
    }

    pub fn series(&self, site: &str, array: &str) -> Option<&ArraySeries> {
        self.timeseries.get(&(site.to_string(), array.to_string()))
    }
}
