pub mod capacity;
pub mod command;
pub mod config;
pub mod constants;
pub mod poll;
pub mod result;
pub mod state;
pub mod telemetry;
