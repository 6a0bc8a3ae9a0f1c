//! Newtype wrappers for identifiers to ensure type safety.
//!
//! Every durable record is keyed by a store-assigned integer. The newtypes
//! keep a `TaskId` from being handed where a `TrialId` is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Create an id from its raw value.
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            /// Get the raw value.
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }
    };
}

define_id!(
    /// Unique identifier for a Taskset.
    TasksetId
);
define_id!(
    /// Unique identifier for a Task.
    TaskId
);
define_id!(
    /// Unique identifier for a Trial.
    TrialId
);
define_id!(
    /// Unique identifier for a Slave record.
    SlaveId
);
define_id!(
    /// Unique identifier for a WorkerLog record.
    WorkerLogId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        let id = TaskId::new(42);
        assert_eq!(format!("{}", id), "42");
    }

    #[test]
    fn test_id_serializes_as_bare_integer() {
        let json = serde_json::to_string(&TasksetId::new(7)).unwrap();
        assert_eq!(json, "7");
    }
}
