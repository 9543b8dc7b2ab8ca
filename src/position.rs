//! Axis vocabulary and the authoritative position record.
//!
//! The tracker is an owned value living inside the execution controller and
//! is only ever mutated by the task holding the motion lock. Everything the
//! UI sees is a copy taken after a confirmed MCU reply, so polls never catch
//! a half-applied move.

use crate::well::WellId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Rotation direction as the firmware encodes it (0 = CCW, 1 = CW).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Direction {
    Ccw,
    Cw,
}

impl Direction {
    pub fn reversed(self) -> Self {
        match self {
            Direction::Ccw => Direction::Cw,
            Direction::Cw => Direction::Ccw,
        }
    }
}

impl From<Direction> for u8 {
    fn from(d: Direction) -> u8 {
        match d {
            Direction::Ccw => 0,
            Direction::Cw => 1,
        }
    }
}

impl TryFrom<u8> for Direction {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Direction::Ccw),
            1 => Ok(Direction::Cw),
            other => Err(format!("invalid direction encoding {other} (expected 0 or 1)")),
        }
    }
}

/// The four stepper axes and their firmware wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
    Pipette,
}

pub const ALL_AXES: [Axis; 4] = [Axis::X, Axis::Y, Axis::Z, Axis::Pipette];

impl Axis {
    /// Motor index on the MCU (1-based).
    pub fn motor_id(self) -> u8 {
        match self {
            Axis::X => 1,
            Axis::Y => 2,
            Axis::Z => 3,
            Axis::Pipette => 4,
        }
    }

    pub fn from_motor_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Axis::X),
            2 => Some(Axis::Y),
            3 => Some(Axis::Z),
            4 => Some(Axis::Pipette),
            _ => None,
        }
    }

    /// (pulse, dir, limit) pins on the controller board.
    pub fn pins(self) -> (u8, u8, u8) {
        match self {
            Axis::X => (2, 3, 10),
            Axis::Y => (4, 5, 11),
            Axis::Z => (6, 7, 12),
            Axis::Pipette => (8, 9, 13),
        }
    }

    /// Direction that increases this axis's position count.
    ///
    /// X/Y/Z grow clockwise, away from their home switches. The pipette
    /// plunger grows counter-clockwise: aspirating loads volume.
    pub fn positive_direction(self) -> Direction {
        match self {
            Axis::X | Axis::Y | Axis::Z => Direction::Cw,
            Axis::Pipette => Direction::Ccw,
        }
    }

    /// Direction toward the home/limit switch.
    pub fn home_direction(self) -> Direction {
        self.positive_direction().reversed()
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Z => "Z",
            Axis::Pipette => "pipette",
        };
        f.write_str(name)
    }
}

/// Whether the Z axis is at the safe travel height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ZState {
    Up,
    Down,
}

/// Per-axis step counts as published to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisPositions {
    pub x: i64,
    pub y: i64,
    pub z: i64,
    pub pipette: i64,
}

/// Authoritative record of where the machine is.
///
/// `initialized` starts false and only becomes true after a successful
/// `home_all`; a motion fault reverts it and forces a re-home before any
/// further well-addressed motion.
#[derive(Debug, Clone)]
pub struct PositionTracker {
    steps: [i64; 4],
    current_well: Option<WellId>,
    z_state: ZState,
    pipette_count: u8,
    initialized: bool,
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionTracker {
    pub fn new() -> Self {
        Self {
            steps: [0; 4],
            current_well: None,
            z_state: ZState::Up,
            pipette_count: 1,
            initialized: false,
        }
    }

    fn index(axis: Axis) -> usize {
        match axis {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
            Axis::Pipette => 3,
        }
    }

    pub fn position(&self, axis: Axis) -> i64 {
        self.steps[Self::index(axis)]
    }

    pub fn positions(&self) -> AxisPositions {
        AxisPositions {
            x: self.position(Axis::X),
            y: self.position(Axis::Y),
            z: self.position(Axis::Z),
            pipette: self.position(Axis::Pipette),
        }
    }

    /// Record a confirmed move reported by the MCU.
    pub fn apply_step(&mut self, axis: Axis, executed: u32, direction: Direction) {
        let sign = if direction == axis.positive_direction() {
            1
        } else {
            -1
        };
        self.steps[Self::index(axis)] += sign * executed as i64;
    }

    /// Called after a successful home of one axis.
    pub fn zero(&mut self, axis: Axis) {
        self.steps[Self::index(axis)] = 0;
    }

    /// Called after a successful `home_all`: all axes at their switches.
    pub fn zero_all(&mut self) {
        self.steps = [0; 4];
        self.z_state = ZState::Up;
        self.current_well = None;
        self.initialized = true;
    }

    pub fn set_well(&mut self, well: WellId) {
        self.current_well = Some(well);
    }

    pub fn current_well(&self) -> Option<WellId> {
        self.current_well
    }

    pub fn set_z(&mut self, state: ZState) {
        self.z_state = state;
    }

    pub fn z_state(&self) -> ZState {
        self.z_state
    }

    pub fn set_pipette_count(&mut self, count: u8) {
        self.pipette_count = count;
    }

    pub fn pipette_count(&self) -> u8 {
        self.pipette_count
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// A motion fault happened: the record can no longer be trusted.
    pub fn invalidate(&mut self) {
        self.initialized = false;
        self.current_well = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_encoding_matches_the_wire() {
        assert_eq!(u8::from(Direction::Ccw), 0);
        assert_eq!(u8::from(Direction::Cw), 1);
        assert_eq!(Direction::try_from(1).unwrap(), Direction::Cw);
        assert!(Direction::try_from(2).is_err());
    }

    #[test]
    fn pipette_polarity_is_inverted() {
        // X grows clockwise, the plunger grows counter-clockwise (aspirate).
        assert_eq!(Axis::X.positive_direction(), Direction::Cw);
        assert_eq!(Axis::Pipette.positive_direction(), Direction::Ccw);
        assert_eq!(Axis::Pipette.home_direction(), Direction::Cw);
    }

    #[test]
    fn apply_step_respects_axis_polarity() {
        let mut tracker = PositionTracker::new();
        tracker.apply_step(Axis::X, 400, Direction::Cw);
        assert_eq!(tracker.position(Axis::X), 400);
        tracker.apply_step(Axis::X, 150, Direction::Ccw);
        assert_eq!(tracker.position(Axis::X), 250);

        tracker.apply_step(Axis::Pipette, 500, Direction::Ccw);
        assert_eq!(tracker.position(Axis::Pipette), 500);
        tracker.apply_step(Axis::Pipette, 500, Direction::Cw);
        assert_eq!(tracker.position(Axis::Pipette), 0);
    }

    #[test]
    fn homing_initializes_and_faults_invalidate() {
        let mut tracker = PositionTracker::new();
        assert!(!tracker.is_initialized());

        tracker.apply_step(Axis::Y, 123, Direction::Cw);
        tracker.zero_all();
        assert!(tracker.is_initialized());
        assert_eq!(tracker.position(Axis::Y), 0);
        assert_eq!(tracker.z_state(), ZState::Up);

        tracker.set_well("A1".parse().unwrap());
        tracker.invalidate();
        assert!(!tracker.is_initialized());
        assert_eq!(tracker.current_well(), None);
    }
}
