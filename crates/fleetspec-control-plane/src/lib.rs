//! fleetspec Control Plane Library
//!
//! This crate provides the scheduler service for fleetspec: record and
//! queue store boundaries, the scheduler state machines, duration
//! estimates, worker liveness, push fan-out, the JSON-lines RPC service and
//! the HTTP admin surface.

pub mod bus;
pub mod config;
pub mod estimator;
pub mod http;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod store;

pub use config::Config;
pub use scheduler::{Scheduler, SchedulerError};
pub use state::AppState;
