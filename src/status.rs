//! Execution state and the lock-free status surface.
//!
//! The UI polls while a job runs, so the snapshot is built whole and
//! published by swapping an `Arc` — a reader either sees the previous
//! consistent snapshot or the next one, never a torn update.

use crate::position::{AxisPositions, ZState};
use crate::well::WellId;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::{Arc, RwLock};

/// What the machine is doing right now.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionState {
    Idle,
    Homing,
    Moving,
    Aspirating,
    Dispensing,
    Rinsing,
    Waiting,
    Stopping,
    Error(String),
}

impl ExecutionState {
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionState::Idle => "idle",
            ExecutionState::Homing => "homing",
            ExecutionState::Moving => "moving",
            ExecutionState::Aspirating => "aspirating",
            ExecutionState::Dispensing => "dispensing",
            ExecutionState::Rinsing => "rinsing",
            ExecutionState::Waiting => "waiting",
            ExecutionState::Stopping => "stopping",
            ExecutionState::Error(_) => "error",
        }
    }

    /// Whether a job (or single primitive) currently owns the machine.
    pub fn is_executing(&self) -> bool {
        !matches!(self, ExecutionState::Idle | ExecutionState::Error(_))
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionState::Error(reason) => write!(f, "error: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

impl Serialize for ExecutionState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

/// One consistent view of the machine, as the UI reads it.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub initialized: bool,
    pub current_well: Option<WellId>,
    pub z_state: ZState,
    pub pipette_count: u8,
    pub current_operation: ExecutionState,
    pub operation_well: Option<WellId>,
    pub is_executing: bool,
    pub positions: AxisPositions,
    pub message: String,
}

impl StatusSnapshot {
    /// The snapshot published before anything has happened.
    pub fn startup() -> Self {
        Self {
            initialized: false,
            current_well: None,
            z_state: ZState::Up,
            pipette_count: 1,
            current_operation: ExecutionState::Idle,
            operation_well: None,
            is_executing: false,
            positions: AxisPositions {
                x: 0,
                y: 0,
                z: 0,
                pipette: 0,
            },
            message: "not homed".to_string(),
        }
    }
}

impl Serialize for StatusSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("StatusSnapshot", 9)?;
        s.serialize_field("initialized", &self.initialized)?;
        s.serialize_field("current_well", &self.current_well)?;
        s.serialize_field("z_state", &self.z_state)?;
        s.serialize_field("pipette_count", &self.pipette_count)?;
        s.serialize_field("current_operation", &self.current_operation)?;
        s.serialize_field("operation_well", &self.operation_well)?;
        s.serialize_field("is_executing", &self.is_executing)?;
        s.serialize_field("positions", &self.positions)?;
        s.serialize_field("message", &self.message)?;
        s.end()
    }
}

/// Publish/read point for status snapshots.
///
/// Writers replace the inner `Arc` whole; readers clone it and are then
/// independent of any further writes.
#[derive(Clone)]
pub struct StatusBoard {
    current: Arc<RwLock<Arc<StatusSnapshot>>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(StatusSnapshot::startup()))),
        }
    }

    pub fn publish(&self, snapshot: StatusSnapshot) {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(snapshot);
    }

    pub fn read(&self) -> Arc<StatusSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
