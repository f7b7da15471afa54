//! Pull-based monitoring hub for a fleet of database agents
//!
//! The hub periodically pulls the metric history of every agent, stores it,
//! evaluates alerting checks on every stored row and notifies subscribers
//! about state transitions. Everything runs on a process-local scheduler with
//! one bounded pool per worker.

pub mod agent;
pub mod alerting;
pub mod collector;
pub mod config;
pub mod maintenance;
pub mod notifications;
pub mod scheduler;
pub mod storage;
pub mod util;
pub mod workers;
