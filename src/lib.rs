//! Single-day PV AC energy forecast.
//!
//! [`engine::simulate_day`] turns a validated [`models::Scenario`] and the
//! frames of a [`weather::WeatherProvider`] into per-array interval series and
//! daily summaries. Every stage reports to an injected
//! [`debug::DebugCollector`].

pub mod config;
pub mod debug;
pub mod engine;
pub mod error;
pub mod models;
pub mod output;
pub mod services;
pub mod weather;

pub use error::{EngineError, EngineResult};
