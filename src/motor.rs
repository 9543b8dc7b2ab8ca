//! Typed motor operations over the MCU channel.
//!
//! Thin and deliberately dumb: every call is one request/reply exchange,
//! results are checked for shape and sanity, and nothing is ever retried
//! here — retry policy belongs to the executor, which knows whether a move
//! is safe to repeat.

use crate::error::TransportError;
use crate::position::{Axis, Direction, ALL_AXES};
use crate::protocol::{
    BatchMovement, BatchResult, LimitState, McuRequest, McuResponse, OkPayload,
};
use crate::transport::{Transport, DEFAULT_REPLY_TIMEOUT};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Upper bound on a single commanded move; anything larger is a programming
/// error upstream (full plate travel is under 5k steps).
pub const MAX_MOVE_STEPS: u32 = 20_000;
/// Fastest pulse rate the drivers tolerate.
pub const MIN_STEP_DELAY_US: u32 = 100;
/// Homing gives up after this many steps without a switch.
pub const HOME_MAX_STEPS: u32 = 10_000;
/// Step period while homing.
pub const HOME_DELAY_US: u32 = 2_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MotorError {
    #[error("invalid motor id {0}")]
    InvalidMotor(u8),

    #[error("motor {0} used before init")]
    NotInitialized(Axis),

    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("MCU rejected {command}: {message}")]
    Mcu { command: &'static str, message: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<MotorError> for crate::error::ControlError {
    fn from(e: MotorError) -> Self {
        use crate::error::{ControlError, MotionFault};
        match e {
            MotorError::Transport(t) => ControlError::Transport(t),
            MotorError::Mcu { command, message } => {
                ControlError::MotionFault(MotionFault::Mcu(format!("{command}: {message}")))
            }
            // the executor only reaches the driver with vetted parameters;
            // these indicate a bug, not an operator mistake
            other => ControlError::Internal(other.to_string()),
        }
    }
}

/// Result of a `step` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    pub steps_executed: u32,
    pub limit_triggered: bool,
}

/// Result of a `home_motor` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HomeOutcome {
    pub steps_to_home: u32,
    pub homed: bool,
}

/// Client for the four steppers behind one transport.
pub struct MotorDriver {
    transport: Arc<dyn Transport>,
    initialized: [AtomicBool; 4],
}

impl MotorDriver {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            initialized: Default::default(),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Reply deadline scaled to the expected move duration (pulse high + low
    /// per step) plus headroom.
    fn motion_timeout(steps: u32, delay_us: u32) -> Duration {
        let move_time = Duration::from_micros(steps as u64 * delay_us as u64 * 2);
        DEFAULT_REPLY_TIMEOUT.max(move_time + Duration::from_secs(5))
    }

    fn check_motion_params(steps: u32, delay_us: u32) -> Result<(), MotorError> {
        if steps > MAX_MOVE_STEPS {
            return Err(MotorError::BadParameter(format!(
                "{steps} steps exceeds the {MAX_MOVE_STEPS}-step safety bound"
            )));
        }
        if delay_us < MIN_STEP_DELAY_US {
            return Err(MotorError::BadParameter(format!(
                "step delay {delay_us} us is below the {MIN_STEP_DELAY_US} us minimum"
            )));
        }
        Ok(())
    }

    fn require_init(&self, axis: Axis) -> Result<(), MotorError> {
        if self.initialized[axis.motor_id() as usize - 1].load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MotorError::NotInitialized(axis))
        }
    }

    async fn exchange(
        &self,
        request: McuRequest,
        timeout: Duration,
    ) -> Result<OkPayload, MotorError> {
        let command = request.name();
        match self.transport.send_request(&request, timeout).await? {
            McuResponse::Ok(payload) => Ok(payload),
            McuResponse::Error { message } => Err(MotorError::Mcu { command, message }),
            other => Err(MotorError::Mcu {
                command,
                message: format!("unexpected reply {other:?}"),
            }),
        }
    }

    /// Configure one motor's pins. Idempotent; run for all axes at startup.
    pub async fn init(&self, axis: Axis) -> Result<(), MotorError> {
        let (pulse_pin, dir_pin, limit_pin) = axis.pins();
        let payload = self
            .exchange(
                McuRequest::InitMotor {
                    motor_id: axis.motor_id(),
                    pulse_pin,
                    dir_pin,
                    limit_pin,
                },
                DEFAULT_REPLY_TIMEOUT,
            )
            .await?;
        match payload {
            OkPayload::Empty {} => {
                self.initialized[axis.motor_id() as usize - 1].store(true, Ordering::SeqCst);
                debug!("motor {axis} initialized");
                Ok(())
            }
            other => Err(MotorError::Mcu {
                command: "init_motor",
                message: format!("unexpected payload {other:?}"),
            }),
        }
    }

    pub async fn init_all(&self) -> Result<(), MotorError> {
        for axis in ALL_AXES {
            self.init(axis).await?;
        }
        Ok(())
    }

    /// Step one motor. `steps_executed` can fall short of the request only
    /// when a limit switch cut the move; any other shortfall is an MCU fault.
    pub async fn step(
        &self,
        axis: Axis,
        steps: u32,
        direction: Direction,
        delay_us: u32,
        respect_limit: bool,
    ) -> Result<StepOutcome, MotorError> {
        self.require_init(axis)?;
        Self::check_motion_params(steps, delay_us)?;
        let payload = self
            .exchange(
                McuRequest::Step {
                    motor_id: axis.motor_id(),
                    direction,
                    steps,
                    delay_us,
                    respect_limit,
                },
                Self::motion_timeout(steps, delay_us),
            )
            .await?;
        match payload {
            OkPayload::Step {
                steps_executed,
                limit_triggered,
            } => {
                if steps_executed > steps || (steps_executed < steps && !limit_triggered) {
                    return Err(MotorError::Mcu {
                        command: "step",
                        message: format!(
                            "executed {steps_executed} of {steps} steps without a limit"
                        ),
                    });
                }
                Ok(StepOutcome {
                    steps_executed,
                    limit_triggered,
                })
            }
            other => Err(MotorError::Mcu {
                command: "step",
                message: format!("unexpected payload {other:?}"),
            }),
        }
    }

    /// Drive one motor toward its switch; `homed=false` means the switch was
    /// never reached within `max_steps`.
    pub async fn home(
        &self,
        axis: Axis,
        direction: Direction,
        delay_us: u32,
        max_steps: u32,
    ) -> Result<HomeOutcome, MotorError> {
        self.require_init(axis)?;
        let payload = self
            .exchange(
                McuRequest::HomeMotor {
                    motor_id: axis.motor_id(),
                    direction,
                    delay_us,
                    max_steps,
                },
                Self::motion_timeout(max_steps, delay_us),
            )
            .await?;
        match payload {
            OkPayload::Home {
                steps_to_home,
                homed,
            } => Ok(HomeOutcome {
                steps_to_home,
                homed,
            }),
            other => Err(MotorError::Mcu {
                command: "home_motor",
                message: format!("unexpected payload {other:?}"),
            }),
        }
    }

    /// Step several motors in lockstep (the firmware paces the batch at the
    /// minimum requested delay).
    pub async fn move_batch(
        &self,
        movements: Vec<BatchMovement>,
        respect_limits: bool,
    ) -> Result<Vec<BatchResult>, MotorError> {
        let mut worst = Duration::ZERO;
        for m in &movements {
            let axis = Axis::from_motor_id(m.motor_id)
                .ok_or(MotorError::InvalidMotor(m.motor_id))?;
            self.require_init(axis)?;
            Self::check_motion_params(m.steps, m.delay_us)?;
            worst = worst.max(Self::motion_timeout(m.steps, m.delay_us));
        }
        let payload = self
            .exchange(
                McuRequest::MoveBatch {
                    respect_limits,
                    movements: movements.clone(),
                },
                worst.max(DEFAULT_REPLY_TIMEOUT),
            )
            .await?;
        let results = match payload {
            OkPayload::Batch { results } => results,
            other => {
                return Err(MotorError::Mcu {
                    command: "move_batch",
                    message: format!("unexpected payload {other:?}"),
                })
            }
        };
        for m in &movements {
            let result = results
                .iter()
                .find(|r| r.motor_id == m.motor_id)
                .ok_or_else(|| MotorError::Mcu {
                    command: "move_batch",
                    message: format!("no result for motor {}", m.motor_id),
                })?;
            if result.steps_executed > m.steps
                || (result.steps_executed < m.steps && !result.limit_hit)
            {
                return Err(MotorError::Mcu {
                    command: "move_batch",
                    message: format!(
                        "motor {} executed {} of {} steps without a limit",
                        m.motor_id, result.steps_executed, m.steps
                    ),
                });
            }
        }
        Ok(results)
    }

    pub async fn get_limits(&self) -> Result<Vec<LimitState>, MotorError> {
        match self
            .exchange(McuRequest::GetLimits, DEFAULT_REPLY_TIMEOUT)
            .await?
        {
            OkPayload::Limits { limits } => Ok(limits),
            other => Err(MotorError::Mcu {
                command: "get_limits",
                message: format!("unexpected payload {other:?}"),
            }),
        }
    }

    /// Best-effort de-energize of one motor.
    pub async fn stop(&self, axis: Axis) -> Result<(), MotorError> {
        self.exchange(
            McuRequest::Stop {
                motor_id: axis.motor_id(),
            },
            DEFAULT_REPLY_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    /// Best-effort de-energize of everything.
    pub async fn stop_all(&self) -> Result<(), MotorError> {
        self.exchange(McuRequest::StopAll, DEFAULT_REPLY_TIMEOUT)
            .await
            .map(|_| ())
    }

    pub async fn ping(&self) -> Result<(), MotorError> {
        match self
            .transport
            .send_request(&McuRequest::Ping, Duration::from_secs(2))
            .await?
        {
            McuResponse::Pong => Ok(()),
            other => Err(MotorError::Mcu {
                command: "ping",
                message: format!("unexpected reply {other:?}"),
            }),
        }
    }
}
