//! Infrastructure layer: job storage backends, job services, configuration.

pub mod config;
pub mod jobs;
