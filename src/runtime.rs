//! Runtime glue that wires configs, the response handler seam, fatal error
//! capture, telemetry, and runner orchestration.

pub mod config;
pub mod fatal;
pub mod handler;
pub mod runner;
pub mod telemetry;
