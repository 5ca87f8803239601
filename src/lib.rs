//! Traffic flood and anomaly detection controller.
//!
//! The [`core::Controller`] ingests traffic from a live feed or a replayed
//! access log, classifies sources every tick and keeps the blocklist and
//! incident history. [`api`] exposes it over HTTP.

pub mod api;
pub mod config;
pub mod core;
pub mod models;
pub mod utils;
