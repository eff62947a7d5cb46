//! Day simulation core and its post-processing steps.

pub mod adjust;
pub mod aggregate;
pub mod damping;
pub mod inverter;
pub mod load_window;
pub mod simulate;
pub mod time;

pub use adjust::{AdjustOutcome, Adjusted, SkipReason, apply_actual_adjustment};
pub use aggregate::{ClimatologyReport, attach_climatology};
pub use load_window::{LoadWindow, LoadWindowParams, WindowSummary, compute_load_windows};
pub use simulate::{SimulationOptions, simulate_day};
pub use time::TimeLabel;
