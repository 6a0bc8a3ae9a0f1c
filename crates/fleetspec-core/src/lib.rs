//! fleetspec Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/RPC
//! - Storage
//! - Runtime specifics
//!
//! All types here represent the scheduling domain: tasksets split into
//! tasks, tasks attempted as trials on slaves, and the push events that
//! describe every state transition.

pub mod error;
pub mod event;
pub mod ids;
pub mod reference;
pub mod status;
pub mod task;
pub mod taskset;
pub mod timeout;
pub mod worker;

// Re-export commonly used types
pub use error::CoreError;
pub use event::{PushEvent, SlaveChanges, TaskChanges, TasksetChanges, WorkerLogChanges};
pub use ids::{SlaveId, TaskId, TasksetId, TrialId, WorkerLogId};
pub use reference::{EntityKind, Referable, Reference};
pub use status::{SlaveStatus, TaskStatus, TasksetStatus, TrialStatus, WorkerLogStage};
pub use task::{evaluate_trials, NewTask, Task, TaskVerdict, Trial, TrialReport};
pub use taskset::{NewTaskset, Taskset};
pub use timeout::{TaskTimeouts, TimeoutPolicy};
pub use worker::{Slave, WorkerInfo, WorkerLog};
