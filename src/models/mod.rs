pub mod power;
pub mod scenario;
pub mod weather;

/// Timezone-aware instant used for every series index.
pub type Timestamp = chrono::DateTime<chrono_tz::Tz>;

pub use power::{ArrayKey, ArraySeries, DailyRow, IntervalRow, SimulationResult};
pub use scenario::{
    ArraySpec, Location, LocationSpec, Mounting, PVArray, Scenario, Site, ValidationError,
};
pub use weather::{WeatherFrame, WeatherVar};
