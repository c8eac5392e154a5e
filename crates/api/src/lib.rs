//! HTTP API: job creation, status polling, worker transitions, lock query.

pub mod app;
