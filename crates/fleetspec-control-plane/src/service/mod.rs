//! JSON-lines RPC service.

pub mod connection;
pub mod dispatch;

pub use connection::{handle_connection, serve};
pub use dispatch::handle_call;
