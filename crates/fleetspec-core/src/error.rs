//! Core domain errors.

use thiserror::Error;

use crate::reference::EntityKind;

/// Core domain errors for fleetspec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A reference named a different kind of entity than the use site expects.
    #[error("Invalid reference: expected {expected}, found {found}")]
    InvalidReference {
        expected: EntityKind,
        found: EntityKind,
    },

    /// A reference carried a kind tag no entity uses.
    #[error("Unknown reference kind: {0}")]
    UnknownKind(String),

    /// Invalid status string.
    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
