pub mod irradiance;
pub mod mqtt_service;
pub mod power_service;
pub mod solar_algorithm;
