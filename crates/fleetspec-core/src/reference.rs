//! Polymorphic `(kind, id)` references.
//!
//! A [`Reference`] names any entity across the wire. It never carries
//! ownership, only identity. Use sites decode it into the id type they
//! expect with [`Referable::from_ref`], which rejects a mismatched kind.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::{SlaveId, TaskId, TasksetId, TrialId, WorkerLogId};

/// The kind of entity a reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Taskset,
    Task,
    Trial,
    Slave,
    WorkerLog,
}

impl EntityKind {
    /// Wire tag for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Taskset => "taskset",
            Self::Task => "task",
            Self::Trial => "trial",
            Self::Slave => "slave",
            Self::WorkerLog => "worker_log",
        }
    }

    /// Parse a wire tag.
    pub fn parse(tag: &str) -> Result<Self, CoreError> {
        match tag {
            "taskset" => Ok(Self::Taskset),
            "task" => Ok(Self::Task),
            "trial" => Ok(Self::Trial),
            "slave" => Ok(Self::Slave),
            "worker_log" => Ok(Self::WorkerLog),
            other => Err(CoreError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tagged `(kind, id)` pair naming one entity.
///
/// Serializes as a two-element array, e.g. `["taskset", 12]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "(String, u64)", into = "(String, u64)")]
pub enum Reference {
    Taskset(TasksetId),
    Task(TaskId),
    Trial(TrialId),
    Slave(SlaveId),
    WorkerLog(WorkerLogId),
}

impl Reference {
    /// Build a reference from a kind and raw id.
    pub fn new(kind: EntityKind, id: u64) -> Self {
        match kind {
            EntityKind::Taskset => Self::Taskset(TasksetId::new(id)),
            EntityKind::Task => Self::Task(TaskId::new(id)),
            EntityKind::Trial => Self::Trial(TrialId::new(id)),
            EntityKind::Slave => Self::Slave(SlaveId::new(id)),
            EntityKind::WorkerLog => Self::WorkerLog(WorkerLogId::new(id)),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Taskset(_) => EntityKind::Taskset,
            Self::Task(_) => EntityKind::Task,
            Self::Trial(_) => EntityKind::Trial,
            Self::Slave(_) => EntityKind::Slave,
            Self::WorkerLog(_) => EntityKind::WorkerLog,
        }
    }

    /// Raw id, without the kind tag.
    pub fn id(&self) -> u64 {
        match self {
            Self::Taskset(id) => id.get(),
            Self::Task(id) => id.get(),
            Self::Trial(id) => id.get(),
            Self::Slave(id) => id.get(),
            Self::WorkerLog(id) => id.get(),
        }
    }

    /// Decode into the id type expected at the call site.
    pub fn decode<T: Referable>(self) -> Result<T, CoreError> {
        T::from_ref(self)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

impl TryFrom<(String, u64)> for Reference {
    type Error = CoreError;

    fn try_from((kind, id): (String, u64)) -> Result<Self, Self::Error> {
        Ok(Self::new(EntityKind::parse(&kind)?, id))
    }
}

impl From<Reference> for (String, u64) {
    fn from(reference: Reference) -> Self {
        (reference.kind().as_str().to_string(), reference.id())
    }
}

/// Id types that can be carried in a [`Reference`].
pub trait Referable: Sized + Copy {
    /// The kind tag this id decodes from.
    const KIND: EntityKind;

    fn to_ref(self) -> Reference;

    /// Decode, failing with `InvalidReference` on a kind mismatch.
    fn from_ref(reference: Reference) -> Result<Self, CoreError>;
}

macro_rules! impl_referable {
    ($id:ident, $variant:ident) => {
        impl Referable for $id {
            const KIND: EntityKind = EntityKind::$variant;

            fn to_ref(self) -> Reference {
                Reference::$variant(self)
            }

            fn from_ref(reference: Reference) -> Result<Self, CoreError> {
                match reference {
                    Reference::$variant(id) => Ok(id),
                    other => Err(CoreError::InvalidReference {
                        expected: Self::KIND,
                        found: other.kind(),
                    }),
                }
            }
        }
    };
}

impl_referable!(TasksetId, Taskset);
impl_referable!(TaskId, Task);
impl_referable!(TrialId, Trial);
impl_referable!(SlaveId, Slave);
impl_referable!(WorkerLogId, WorkerLog);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_wire_format() {
        let reference = TasksetId::new(12).to_ref();
        let json = serde_json::to_string(&reference).unwrap();
        assert_eq!(json, r#"["taskset",12]"#);

        let parsed: Reference = serde_json::from_str(r#"["worker_log",3]"#).unwrap();
        assert_eq!(parsed, Reference::WorkerLog(WorkerLogId::new(3)));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let result: Result<Reference, _> = serde_json::from_str(r#"["runner",1]"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_checks_kind() {
        let reference = Reference::Task(TaskId::new(5));
        assert_eq!(reference.decode::<TaskId>(), Ok(TaskId::new(5)));

        let err = reference.decode::<TasksetId>().unwrap_err();
        assert_eq!(
            err,
            CoreError::InvalidReference {
                expected: EntityKind::Taskset,
                found: EntityKind::Task,
            }
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Reference::Slave(SlaveId::new(9)).to_string(), "slave:9");
    }
}
