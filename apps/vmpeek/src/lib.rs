pub mod config;
pub mod memory;
pub mod session;
pub mod telemetry;
pub mod terminal;
