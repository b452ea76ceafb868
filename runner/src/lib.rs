pub mod command;
pub mod config;
pub mod executors;
pub mod metrics;
pub mod objective;
pub mod params;
pub mod sync;
pub mod tuner;
