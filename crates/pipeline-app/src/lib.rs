//! # Portfolio Data Pipeline
//!
//! A long-running service built on `pipeline-core`. It keeps market data up to
//! date, searches for better models between updates and suggests portfolio
//! trades.
//!
//! - [`data`] - entities and the daily update DAG
//! - [`portfolio`] - portfolio entity, value request and history
//! - [`evolution`] - model search and optimization tasks
//! - [`states`] - the top-level state machine
//! - [`lifecycle`] - wiring and graceful shutdown

pub mod config;
pub mod data;
pub mod evolution;
pub mod lifecycle;
pub mod market;
pub mod model;
pub mod portfolio;
pub mod states;
pub mod uptime;
