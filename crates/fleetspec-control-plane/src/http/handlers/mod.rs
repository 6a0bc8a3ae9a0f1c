//! HTTP request handlers.

mod health;
mod tasksets;
mod workers;

pub use health::{health_check, metrics_handler};
pub use tasksets::list_active_tasksets;
pub use workers::list_workers;
