//! Wire protocol and client transport for fleetspec.
//!
//! This crate contains:
//! - The JSON-lines frame format shared by scheduler and peers
//! - The `Command` sum type for synchronous calls and their reply payloads
//! - A client `Transport` with call correlation, bounded round trips,
//!   automatic reconnection and resubscription
//! - The wait-for-completion observer used by waiting clients

pub mod client;
pub mod error;
pub mod frame;
pub mod message;
pub mod observer;

// Re-export commonly used types
pub use client::{Transport, TransportConfig, TransportEvent};
pub use error::TransportError;
pub use frame::{CallFrame, Frame, MalformedFrame, Outcome, ReplyFrame};
pub use message::{
    Command, ErrorCode, RpcError, TaskAssignment, TaskSummary, TasksetSummary,
};
pub use observer::{wait_for, WaitObserver, WaitState};
