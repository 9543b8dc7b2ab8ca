//! Error taxonomy for the sampler control surface.
//!
//! Errors are grouped the way the embedding web layer needs to report them:
//! validation problems are rejected at the boundary with no state change,
//! `Busy` means another job holds the motion lock, transport and motion
//! faults are fatal for the current job, and logic faults (volume accounting,
//! pipette geometry) abort the job without invalidating the homed position.

use crate::position::Axis;
use thiserror::Error;

/// Failures at the framed-channel level.
///
/// `Timeout` may be retried once by the executor; everything else is fatal
/// for the job that observes it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("link to the MCU is down")]
    LinkLost,

    #[error("malformed frame: {0}")]
    BadFrame(String),
}

/// Faults raised by the physical machine or its protocol client.
///
/// Any of these clears the `initialized` flag: the position record can no
/// longer be trusted and a re-home is required.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MotionFault {
    #[error("limit switch on {axis} triggered during a non-homing move")]
    UnexpectedLimit { axis: Axis },

    #[error("target {axis}={steps} steps is outside the travel envelope (max {max})")]
    OutOfEnvelope { axis: Axis, steps: i64, max: i64 },

    #[error("homing {axis} gave up after {max_steps} steps without reaching the switch")]
    HomingFailed { axis: Axis, max_steps: u32 },

    #[error("MCU fault: {0}")]
    Mcu(String),
}

/// Faults in the pipetting bookkeeping itself.
///
/// Fatal for the current job, but the axes are where the tracker says they
/// are, so `initialized` survives.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LogicFault {
    #[error("aspirating {requested_ml} mL would exceed capacity ({loaded_ml} mL already loaded, capacity {capacity_ml} mL)")]
    Overflow {
        requested_ml: f64,
        loaded_ml: f64,
        capacity_ml: f64,
    },

    #[error("cannot dispense {requested_ml} mL with only {loaded_ml} mL loaded")]
    Underflow { requested_ml: f64, loaded_ml: f64 },

    #[error("invalid pipette geometry: {0}")]
    InvalidGeometry(String),
}

/// Every way a control-surface call can fail.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControlError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("another job holds the motion lock")]
    Busy,

    #[error("machine is not homed; run home_all first")]
    NotInitialized,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    MotionFault(#[from] MotionFault),

    #[error(transparent)]
    LogicFault(#[from] LogicFault),

    #[error("stopped by user")]
    Stopped,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// HTTP status the web collaborator should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ControlError::Validation(_) => 400,
            ControlError::Busy | ControlError::NotInitialized => 409,
            ControlError::Transport(TransportError::LinkLost) => 503,
            ControlError::Transport(_) => 500,
            ControlError::MotionFault(_) | ControlError::LogicFault(_) => 500,
            ControlError::Stopped => 200,
            ControlError::Internal(_) => 500,
        }
    }

    /// Whether this failure invalidates the homed position record.
    pub fn clears_initialized(&self) -> bool {
        matches!(self, ControlError::MotionFault(_))
    }
}

pub type ControlResult<T> = Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_the_api_contract() {
        assert_eq!(ControlError::Validation("x".into()).status_code(), 400);
        assert_eq!(ControlError::Busy.status_code(), 409);
        assert_eq!(ControlError::NotInitialized.status_code(), 409);
        assert_eq!(
            ControlError::Transport(TransportError::LinkLost).status_code(),
            503
        );
        assert_eq!(
            ControlError::Transport(TransportError::Timeout).status_code(),
            500
        );
    }

    #[test]
    fn only_motion_faults_force_a_rehome() {
        assert!(ControlError::MotionFault(MotionFault::Mcu("boom".into())).clears_initialized());
        assert!(!ControlError::LogicFault(LogicFault::Underflow {
            requested_ml: 1.0,
            loaded_ml: 0.0,
        })
        .clears_initialized());
        assert!(!ControlError::Stopped.clears_initialized());
    }
}
