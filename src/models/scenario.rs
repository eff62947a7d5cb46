use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{what} is required")]
    Missing { what: &'static str },

    #[error("{what} must be {expected}, got {value}")]
    OutOfRange {
        what: &'static str,
        value: f64,
        expected: &'static str,
    },

    #[error("duplicate {what} id '{id}'")]
    Duplicate { what: &'static str, id: String },

    #[error(
        "unsupported temp_model '{0}' (expected open_rack_glass_glass, close_mount_glass_glass, open_rack_glass_polymer or insulated_back_glass_polymer)"
    )]
    UnknownMounting(String),

    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),

    #[error("invalid horizon profile: {0}")]
    Horizon(String),

    #[error("array {array}: {source}")]
    InArray {
        array: String,
        #[source]
        source: Box<ValidationError>,
    },

    #[error("site {site}: {source}")]
    InSite {
        site: String,
        #[source]
        source: Box<ValidationError>,
    },
}

fn check_range(
    what: &'static str,
    value: f64,
    lo: f64,
    hi: f64,
    expected: &'static str,
) -> Result<(), ValidationError> {
    if (lo..=hi).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            what,
            value,
            expected,
        })
    }
}

fn check_id(what: &'static str, id: &str) -> Result<(), ValidationError> {
    if id.trim().is_empty() {
        Err(ValidationError::Missing { what })
    } else {
        Ok(())
    }
}

/// Wrap a compass bearing into (-180, 180]; 180 and -180 both map to -180.
pub fn normalize_azimuth(azimuth_deg: f64) -> f64 {
    (azimuth_deg + 180.0).rem_euclid(360.0) - 180.0
}

// ─── Mounting / temperature model ────────────────────────────────────────────

/// SAPM cell-temperature mounting configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mounting {
    OpenRackGlassGlass,
    CloseMountGlassGlass,
    OpenRackGlassPolymer,
    InsulatedBackGlassPolymer,
}

impl Mounting {
    pub fn as_str(self) -> &'static str {
        match self {
            Mounting::OpenRackGlassGlass => "open_rack_glass_glass",
            Mounting::CloseMountGlassGlass => "close_mount_glass_glass",
            Mounting::OpenRackGlassPolymer => "open_rack_glass_polymer",
            Mounting::InsulatedBackGlassPolymer => "insulated_back_glass_polymer",
        }
    }
}

impl fmt::Display for Mounting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mounting {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open_rack_glass_glass" => Ok(Mounting::OpenRackGlassGlass),
            "close_mount_glass_glass" => Ok(Mounting::CloseMountGlassGlass),
            "open_rack_glass_polymer" => Ok(Mounting::OpenRackGlassPolymer),
            "insulated_back_glass_polymer" => Ok(Mounting::InsulatedBackGlassPolymer),
            _ => Err(ValidationError::UnknownMounting(s.to_string())),
        }
    }
}

// ─── Location ────────────────────────────────────────────────────────────────

fn default_tz() -> String {
    "auto".to_string()
}

/// Unvalidated location description as it appears in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSpec {
    pub id: String,
    pub lat: f64,
    pub lon: f64,
    #[serde(default = "default_tz")]
    pub tz: String,
    #[serde(default)]
    pub elevation_m: Option<f64>,
}

impl LocationSpec {
    pub fn new(id: impl Into<String>, lat: f64, lon: f64) -> Self {
        Self {
            id: id.into(),
            lat,
            lon,
            tz: default_tz(),
            elevation_m: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    id: String,
    lat: f64,
    lon: f64,
    tz: Option<Tz>,
    elevation_m: Option<f64>,
}

impl Location {
    pub fn new(spec: LocationSpec) -> Result<Self, ValidationError> {
        check_id("location id", &spec.id)?;
        check_range("latitude", spec.lat, -90.0, 90.0, "between -90 and 90 degrees")?;
        check_range("longitude", spec.lon, -180.0, 180.0, "between -180 and 180 degrees")?;
        if let Some(elev) = spec.elevation_m {
            check_range("elevation_m", elev, -430.0, f64::INFINITY, "at least -430 m")?;
        }
        let tz = match spec.tz.trim() {
            "" | "auto" => None,
            name => Some(
                name.parse::<Tz>()
                    .map_err(|_| ValidationError::UnknownTimezone(name.to_string()))?,
            ),
        };
        Ok(Self {
            id: spec.id,
            lat: spec.lat,
            lon: spec.lon,
            tz,
            elevation_m: spec.elevation_m,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn lon(&self) -> f64 {
        self.lon
    }

    /// Explicit timezone, `None` when the provider decides ("auto").
    pub fn tz(&self) -> Option<Tz> {
        self.tz
    }

    pub fn tz_name(&self) -> String {
        self.tz.map_or_else(default_tz, |tz| tz.name().to_string())
    }

    pub fn elevation_m(&self) -> Option<f64> {
        self.elevation_m
    }
}

// ─── PV array ────────────────────────────────────────────────────────────────

/// Horizon profile as written in config: a list or a comma-separated string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HorizonSpec {
    Values(Vec<f64>),
    Csv(String),
}

impl HorizonSpec {
    fn into_values(self) -> Result<Vec<f64>, ValidationError> {
        match self {
            HorizonSpec::Values(values) => Ok(values),
            HorizonSpec::Csv(text) => text
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<f64>()
                        .map_err(|_| ValidationError::Horizon(format!("'{s}' is not a number")))
                })
                .collect(),
        }
    }
}

/// Unvalidated array description as it appears in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArraySpec {
    pub id: String,
    pub tilt_deg: f64,
    pub azimuth_deg: f64,
    pub pdc0_w: f64,
    pub gamma_pdc: f64,
    pub dc_ac_ratio: f64,
    pub eta_inv_nom: f64,
    pub losses_percent: f64,
    #[serde(alias = "mounting")]
    pub temp_model: String,
    #[serde(default)]
    pub inverter_group_id: Option<String>,
    #[serde(default)]
    pub inverter_pdc0_w: Option<f64>,
    #[serde(default)]
    pub horizon_deg: Option<HorizonSpec>,
    #[serde(default)]
    pub damping_morning: Option<f64>,
    #[serde(default)]
    pub damping_evening: Option<f64>,
    #[serde(default)]
    pub iam_b0: Option<f64>,
    #[serde(default)]
    pub albedo: Option<f64>,
}

impl ArraySpec {
    /// Typical residential defaults around the given geometry and nameplate.
    pub fn new(id: impl Into<String>, tilt_deg: f64, azimuth_deg: f64, pdc0_w: f64) -> Self {
        Self {
            id: id.into(),
            tilt_deg,
            azimuth_deg,
            pdc0_w,
            gamma_pdc: -0.004,
            dc_ac_ratio: 1.1,
            eta_inv_nom: 0.96,
            losses_percent: 14.0,
            temp_model: Mounting::OpenRackGlassGlass.as_str().to_string(),
            inverter_group_id: None,
            inverter_pdc0_w: None,
            horizon_deg: None,
            damping_morning: None,
            damping_evening: None,
            iam_b0: None,
            albedo: None,
        }
    }
}

pub const DEFAULT_ALBEDO: f64 = 0.2;

/// Validated, immutable PV array.
#[derive(Debug, Clone, PartialEq)]
pub struct PVArray {
    id: String,
    tilt_deg: f64,
    azimuth_deg: f64,
    pdc0_w: f64,
    gamma_pdc: f64,
    dc_ac_ratio: f64,
    eta_inv_nom: f64,
    losses_percent: f64,
    mounting: Mounting,
    inverter_group_id: Option<String>,
    inverter_pdc0_w: Option<f64>,
    horizon_deg: Option<Vec<f64>>,
    damping_morning: f64,
    damping_evening: f64,
    iam_b0: Option<f64>,
    albedo: f64,
}

impl PVArray {
    pub fn new(spec: ArraySpec) -> Result<Self, ValidationError> {
        let id = spec.id.clone();
        Self::validate(spec).map_err(|e| ValidationError::InArray {
            array: id,
            source: Box::new(e),
        })
    }

    fn validate(spec: ArraySpec) -> Result<Self, ValidationError> {
        check_id("array id", &spec.id)?;
        check_range("tilt_deg", spec.tilt_deg, 0.0, 90.0, "between 0 and 90 degrees")?;
        if !spec.azimuth_deg.is_finite() {
            return Err(ValidationError::OutOfRange {
                what: "azimuth_deg",
                value: spec.azimuth_deg,
                expected: "a finite bearing",
            });
        }
        check_range("pdc0_w", spec.pdc0_w, 0.0, f64::INFINITY, "non-negative")?;
        check_range("gamma_pdc", spec.gamma_pdc, f64::NEG_INFINITY, 0.0, "zero or negative")?;
        if !(spec.dc_ac_ratio > 0.0 && spec.dc_ac_ratio.is_finite()) {
            return Err(ValidationError::OutOfRange {
                what: "dc_ac_ratio",
                value: spec.dc_ac_ratio,
                expected: "positive",
            });
        }
        if !(spec.eta_inv_nom > 0.0 && spec.eta_inv_nom <= 1.0) {
            return Err(ValidationError::OutOfRange {
                what: "eta_inv_nom",
                value: spec.eta_inv_nom,
                expected: "in (0, 1]",
            });
        }
        check_range("losses_percent", spec.losses_percent, 0.0, 100.0, "between 0 and 100")?;
        if spec.temp_model.trim().is_empty() {
            return Err(ValidationError::Missing { what: "temp_model" });
        }
        let mounting = spec.temp_model.parse::<Mounting>()?;

        if let Some(rating) = spec.inverter_pdc0_w {
            if !(rating > 0.0 && rating.is_finite()) {
                return Err(ValidationError::OutOfRange {
                    what: "inverter_pdc0_w",
                    value: rating,
                    expected: "positive",
                });
            }
        }
        let inverter_group_id = spec
            .inverter_group_id
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty());

        let horizon_deg = match spec.horizon_deg {
            Some(h) => {
                let values = h.into_values()?;
                if values.is_empty() {
                    return Err(ValidationError::Horizon(
                        "at least one elevation bin is required".into(),
                    ));
                }
                for v in &values {
                    check_range("horizon_deg", *v, 0.0, 90.0, "between 0 and 90 degrees")?;
                }
                Some(values)
            }
            None => None,
        };

        let damping_morning = spec.damping_morning.unwrap_or(1.0);
        let damping_evening = spec.damping_evening.unwrap_or(1.0);
        check_range("damping_morning", damping_morning, 0.0, 1.0, "between 0 and 1")?;
        check_range("damping_evening", damping_evening, 0.0, 1.0, "between 0 and 1")?;

        if let Some(b0) = spec.iam_b0 {
            check_range("iam_b0", b0, 0.0, 1.0, "between 0 and 1")?;
        }
        let albedo = spec.albedo.unwrap_or(DEFAULT_ALBEDO);
        check_range("albedo", albedo, 0.0, 1.0, "between 0 and 1")?;

        Ok(Self {
            id: spec.id,
            tilt_deg: spec.tilt_deg,
            azimuth_deg: normalize_azimuth(spec.azimuth_deg),
            pdc0_w: spec.pdc0_w,
            gamma_pdc: spec.gamma_pdc,
            dc_ac_ratio: spec.dc_ac_ratio,
            eta_inv_nom: spec.eta_inv_nom,
            losses_percent: spec.losses_percent,
            mounting,
            inverter_group_id,
            inverter_pdc0_w: spec.inverter_pdc0_w,
            horizon_deg,
            damping_morning,
            damping_evening,
            iam_b0: spec.iam_b0,
            albedo,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn tilt_deg(&self) -> f64 {
        self.tilt_deg
    }
    /// Compass bearing normalised into [-180, 180).
    pub fn azimuth_deg(&self) -> f64 {
        self.azimuth_deg
    }
    pub fn pdc0_w(&self) -> f64 {
        self.pdc0_w
    }
    pub fn gamma_pdc(&self) -> f64 {
        self.gamma_pdc
    }
    pub fn dc_ac_ratio(&self) -> f64 {
        self.dc_ac_ratio
    }
    pub fn eta_inv_nom(&self) -> f64 {
        self.eta_inv_nom
    }
    pub fn losses_percent(&self) -> f64 {
        self.losses_percent
    }
    pub fn mounting(&self) -> Mounting {
        self.mounting
    }
    pub fn inverter_group_id(&self) -> Option<&str> {
        self.inverter_group_id.as_deref()
    }
    pub fn inverter_pdc0_w(&self) -> Option<f64> {
        self.inverter_pdc0_w
    }
    pub fn horizon_deg(&self) -> Option<&[f64]> {
        self.horizon_deg.as_deref()
    }
    pub fn damping_morning(&self) -> f64 {
        self.damping_morning
    }
    pub fn damping_evening(&self) -> f64 {
        self.damping_evening
    }
    pub fn iam_b0(&self) -> Option<f64> {
        self.iam_b0
    }
    pub fn albedo(&self) -> f64 {
        self.albedo
    }

    /// Group key: explicit inverter group or the array's own id.
    pub fn group_key(&self) -> &str {
        self.inverter_group_id().unwrap_or(&self.id)
    }
}

// ─── Site / Scenario ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Site {
    id: String,
    location: Location,
    arrays: Vec<PVArray>,
}

impl Site {
    pub fn new(
        id: impl Into<String>,
        location: Location,
        arrays: Vec<PVArray>,
    ) -> Result<Self, ValidationError> {
        let id = id.into();
        let wrap = |e| ValidationError::InSite {
            site: id.clone(),
            source: Box::new(e),
        };
        check_id("site id", &id).map_err(wrap)?;
        if arrays.is_empty() {
            return Err(wrap(ValidationError::Missing {
                what: "at least one PV array",
            }));
        }
        let mut seen = HashSet::new();
        for array in &arrays {
            if !seen.insert(array.id()) {
                return Err(wrap(ValidationError::Duplicate {
                    what: "array",
                    id: array.id().to_string(),
                }));
            }
        }
        Ok(Self {
            id,
            location,
            arrays,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn location(&self) -> &Location {
        &self.location
    }
    pub fn arrays(&self) -> &[PVArray] {
        &self.arrays
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    sites: Vec<Site>,
}

impl Scenario {
    pub fn new(sites: Vec<Site>) -> Result<Self, ValidationError> {
        if sites.is_empty() {
            return Err(ValidationError::Missing {
                what: "at least one site",
            });
        }
        let mut seen = HashSet::new();
        for site in &sites {
            if !seen.insert(site.id()) {
                return Err(ValidationError::Duplicate {
                    what: "site",
                    id: site.id().to_string(),
                });
            }
        }
        Ok(Self { sites })
    }

    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    pub fn array_count(&self) -> usize {
        self.sites.iter().map(|s| s.arrays().len()).sum()
    }
}
