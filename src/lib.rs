//! Per-sensor temperature forecasting over recorded history and a live event stream.

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod feed;
pub mod forecast;
pub mod pipeline;
pub mod registry;
pub mod sink;
pub mod source;
pub mod telemetry;

#[cfg(test)]
mod test_support;
