//! The pipetting executor: program steps broken down into primitives.
//!
//! A step runs as a fixed traversal — raise Z, travel to the pickup well,
//! descend, aspirate, raise, optionally travel/descend/dispense, optionally
//! rinse, then wait — and every transition happens only after the previous
//! primitive's MCU reply has been seen. The hard invariants live here:
//! X/Y never move unless Z is up, the loaded-volume counter never leaves
//! `0..=capacity`, and the cancellation flag is observed before every
//! primitive, at every reply, and at least every 100 ms during waits.

use crate::config::SamplerConfig;
use crate::error::{ControlError, ControlResult, LogicFault, MotionFault, TransportError};
use crate::kinematics::Kinematics;
use crate::motor::{MotorDriver, MotorError, StepOutcome, HOME_DELAY_US, HOME_MAX_STEPS};
use crate::position::{Axis, Direction, PositionTracker, ZState, ALL_AXES};
use crate::program::{Program, ProgramStep, Repetition};
use crate::protocol::BatchMovement;
use crate::status::{ExecutionState, StatusBoard, StatusSnapshot};
use crate::well::WellId;
use crate::logring::LogRing;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Cancellation poll period during cooperative waits.
pub const CANCEL_POLL: Duration = Duration::from_millis(100);

/// A time-mode firing still counts as on-schedule within this much of its
/// alignment; anything later is skipped, never bunched.
const FIRING_GRACE: Duration = Duration::from_millis(50);

/// The driver plus the position record it is authoritative for. Lives behind
/// the motion lock; whoever holds the lock is the single writer.
pub struct Machine {
    pub driver: MotorDriver,
    pub tracker: PositionTracker,
}

impl Machine {
    pub fn new(driver: MotorDriver) -> Self {
        Self {
            driver,
            tracker: PositionTracker::new(),
        }
    }

    /// Loaded liquid, in plunger steps (the pipette axis position *is* the
    /// loaded volume).
    pub fn loaded_steps(&self) -> i64 {
        self.tracker.position(Axis::Pipette)
    }
}

/// Build the UI snapshot for the machine's current position record.
pub fn build_snapshot(
    machine: &Machine,
    state: ExecutionState,
    operation_well: Option<WellId>,
    message: impl Into<String>,
) -> StatusSnapshot {
    StatusSnapshot {
        initialized: machine.tracker.is_initialized(),
        current_well: machine.tracker.current_well(),
        z_state: machine.tracker.z_state(),
        pipette_count: machine.tracker.pipette_count(),
        is_executing: state.is_executing(),
        current_operation: state,
        operation_well,
        positions: machine.tracker.positions(),
        message: message.into(),
    }
}

/// Retry a driver call exactly once if the first attempt times out. Any
/// other failure, or a second timeout, is returned as-is.
async fn retry_timeout<T, Fut>(make: impl Fn() -> Fut) -> Result<T, MotorError>
where
    Fut: Future<Output = Result<T, MotorError>>,
{
    match make().await {
        Err(MotorError::Transport(TransportError::Timeout)) => {
            warn!("MCU reply timed out, retrying once");
            make().await
        }
        other => other,
    }
}

/// Executes primitives and program steps against one machine, under one
/// config snapshot, for as long as the caller holds the motion lock.
pub struct Executor<'a> {
    machine: &'a mut Machine,
    kin: Kinematics,
    cancel: &'a AtomicBool,
    status: &'a StatusBoard,
    logs: &'a LogRing,
    state: ExecutionState,
    operation_well: Option<WellId>,
}

impl<'a> Executor<'a> {
    pub fn new(
        machine: &'a mut Machine,
        config: SamplerConfig,
        cancel: &'a AtomicBool,
        status: &'a StatusBoard,
        logs: &'a LogRing,
    ) -> Self {
        Self {
            machine,
            kin: Kinematics::new(config),
            cancel,
            status,
            logs,
            state: ExecutionState::Idle,
            operation_well: None,
        }
    }

    fn config(&self) -> &SamplerConfig {
        self.kin.config()
    }

    fn log(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{message}");
        self.logs.push(message);
    }

    fn set_state(
        &mut self,
        state: ExecutionState,
        operation_well: Option<WellId>,
        message: impl Into<String>,
    ) {
        self.state = state;
        self.operation_well = operation_well;
        self.refresh(message);
    }

    /// Republish the snapshot after a tracker change, keeping the state.
    fn refresh(&self, message: impl Into<String>) {
        self.status.publish(build_snapshot(
            self.machine,
            self.state.clone(),
            self.operation_well,
            message,
        ));
    }

    fn check_cancel(&self) -> ControlResult<()> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(ControlError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Sleep until `deadline`, observing the cancel flag every poll period.
    async fn sleep_until_cancellable(&self, deadline: Instant) -> ControlResult<()> {
        loop {
            self.check_cancel()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let slice = CANCEL_POLL.min(deadline - now);
            tokio::time::sleep(slice).await;
        }
    }

    // --- primitives ------------------------------------------------------

    /// Move a single axis to an absolute step target.
    async fn axis_to(&mut self, axis: Axis, target: i64, delay_us: u32) -> ControlResult<()> {
        self.check_cancel()?;
        let target = self.kin.clamp_to_envelope(axis, target)?;
        let delta = target - self.machine.tracker.position(axis);
        if delta == 0 {
            return Ok(());
        }
        let direction = if delta > 0 {
            axis.positive_direction()
        } else {
            axis.home_direction()
        };
        let steps = delta.unsigned_abs() as u32;
        let driver = &self.machine.driver;
        let outcome = retry_timeout(|| driver.step(axis, steps, direction, delay_us, true))
            .await
            .map_err(ControlError::from)?;
        self.machine
            .tracker
            .apply_step(axis, outcome.steps_executed, direction);
        self.check_cancel()?;
        if outcome.limit_triggered {
            // the switch is the physical zero: a limit hit while moving
            // toward home pins the count there regardless of what the step
            // arithmetic says. Only homing moves may touch a switch; any
            // other trip, the pipette's empty stop included, is fatal.
            if direction == axis.home_direction() {
                self.machine.tracker.zero(axis);
            }
            return Err(MotionFault::UnexpectedLimit { axis }.into());
        }
        Ok(())
    }

    /// Raise Z to the safe travel plane if it is not already there.
    async fn ensure_z_up(&mut self) -> ControlResult<()> {
        if self.machine.tracker.z_state() == ZState::Up
            && self.machine.tracker.position(Axis::Z) == 0
        {
            return Ok(());
        }
        let delay = self.config().travel_delay_us();
        self.axis_to(Axis::Z, 0, delay).await?;
        self.machine.tracker.set_z(ZState::Up);
        self.refresh("Z raised to safe height");
        Ok(())
    }

    /// Lower the tip `depth_mm` below the well rim. Z must already be up;
    /// if it is not, it is raised first.
    async fn z_down(&mut self, depth_mm: f64) -> ControlResult<()> {
        if self.machine.tracker.z_state() == ZState::Down {
            self.ensure_z_up().await?;
        }
        let target = self.kin.z_for(depth_mm);
        let delay = self.config().travel_delay_us();
        self.axis_to(Axis::Z, target, delay).await?;
        self.machine.tracker.set_z(ZState::Down);
        self.refresh(format!("tip lowered {depth_mm} mm into the well"));
        Ok(())
    }

    /// X/Y relocation to a well center. Refuses to move while Z is down.
    async fn travel_to(&mut self, well: WellId) -> ControlResult<()> {
        self.check_cancel()?;
        if self.machine.tracker.z_state() != ZState::Up {
            return Err(ControlError::Internal(
                "X/Y travel attempted while Z is down".into(),
            ));
        }
        self.set_state(
            ExecutionState::Moving,
            Some(well),
            format!("moving to well {well}"),
        );

        let (target_x, target_y) = self.kin.well_to_xy(well);
        self.kin.clamp_to_envelope(Axis::X, target_x)?;
        self.kin.clamp_to_envelope(Axis::Y, target_y)?;

        let delay_us = self.config().travel_delay_us();
        let mut movements = Vec::new();
        for (axis, target) in [(Axis::X, target_x), (Axis::Y, target_y)] {
            let delta = target - self.machine.tracker.position(axis);
            if delta == 0 {
                continue;
            }
            let direction = if delta > 0 {
                axis.positive_direction()
            } else {
                axis.home_direction()
            };
            movements.push(BatchMovement {
                motor_id: axis.motor_id(),
                steps: delta.unsigned_abs() as u32,
                direction,
                delay_us,
            });
        }

        if !movements.is_empty() {
            let driver = &self.machine.driver;
            let batch = movements.clone();
            let results = retry_timeout(|| driver.move_batch(batch.clone(), true))
                .await
                .map_err(ControlError::from)?;

            // record what actually happened before judging it
            let mut tripped = None;
            for result in &results {
                if let Some(axis) = Axis::from_motor_id(result.motor_id) {
                    let direction = movements
                        .iter()
                        .find(|m| m.motor_id == result.motor_id)
                        .map(|m| m.direction)
                        .unwrap_or(Direction::Cw);
                    self.machine
                        .tracker
                        .apply_step(axis, result.steps_executed, direction);
                    if result.limit_hit {
                        if direction == axis.home_direction() {
                            self.machine.tracker.zero(axis);
                        }
                        tripped = Some(axis);
                    }
                }
            }
            self.check_cancel()?;
            if let Some(axis) = tripped {
                return Err(MotionFault::UnexpectedLimit { axis }.into());
            }
        }

        self.machine.tracker.set_well(well);
        self.refresh(format!("at well {well}"));
        Ok(())
    }

    fn capacity_steps(&self) -> i64 {
        self.kin
            .volume_to_pipette_steps(self.config().pipette_capacity_ml)
    }

    /// Raw plunger move with volume accounting; used by aspirate, dispense
    /// and the rinse cycles.
    async fn plunger_move(&mut self, volume_ml: f64, direction: Direction) -> ControlResult<()> {
        self.check_cancel()?;
        let steps = self.kin.volume_to_pipette_steps(volume_ml);
        let loaded = self.machine.loaded_steps();
        match direction {
            // aspirate: loading
            Direction::Ccw => {
                if loaded + steps > self.capacity_steps() {
                    return Err(LogicFault::Overflow {
                        requested_ml: volume_ml,
                        loaded_ml: self.kin.pipette_steps_to_volume(loaded),
                        capacity_ml: self.config().pipette_capacity_ml,
                    }
                    .into());
                }
            }
            // dispense: unloading
            Direction::Cw => {
                if steps > loaded {
                    return Err(LogicFault::Underflow {
                        requested_ml: volume_ml,
                        loaded_ml: self.kin.pipette_steps_to_volume(loaded),
                    }
                    .into());
                }
            }
        }
        if steps == 0 {
            return Ok(());
        }
        let target = if direction == Direction::Ccw {
            loaded + steps
        } else {
            loaded - steps
        };
        let delay = self.config().pipette_delay_us();
        self.axis_to(Axis::Pipette, target, delay).await
    }

    async fn aspirate(&mut self, volume_ml: f64, well: Option<WellId>) -> ControlResult<()> {
        self.set_state(
            ExecutionState::Aspirating,
            well,
            format!("aspirating {volume_ml} mL"),
        );
        self.plunger_move(volume_ml, Direction::Ccw).await?;
        self.refresh(format!(
            "loaded {} mL",
            self.kin.pipette_steps_to_volume(self.machine.loaded_steps())
        ));
        Ok(())
    }

    async fn dispense(&mut self, volume_ml: f64, well: Option<WellId>) -> ControlResult<()> {
        self.set_state(
            ExecutionState::Dispensing,
            well,
            format!("dispensing {volume_ml} mL"),
        );
        self.plunger_move(volume_ml, Direction::Cw).await?;
        self.refresh(format!(
            "loaded {} mL",
            self.kin.pipette_steps_to_volume(self.machine.loaded_steps())
        ));
        Ok(())
    }

    /// Rinse cycles in the given well; the head must already be over it.
    ///
    /// Each cycle dispenses whatever is loaded and draws the same amount
    /// back; a final dispense empties any remainder so the tip always leaves
    /// the rinse well clean.
    async fn rinse(&mut self, well: WellId) -> ControlResult<()> {
        let cycles = self.config().rinse_cycles;
        let depth = self.config().dropoff_depth;
        self.set_state(
            ExecutionState::Rinsing,
            Some(well),
            format!("rinsing in well {well} ({cycles} cycles)"),
        );
        for cycle in 1..=cycles {
            self.check_cancel()?;
            debug!("rinse cycle {cycle}/{cycles} in {well}");
            let volume = self
                .kin
                .pipette_steps_to_volume(self.machine.loaded_steps());
            self.z_down(depth).await?;
            if volume > 0.0 {
                self.plunger_move(volume, Direction::Cw).await?;
                self.plunger_move(volume, Direction::Ccw).await?;
            }
            self.ensure_z_up().await?;
        }
        // leave nothing behind in the tip
        let remainder = self
            .kin
            .pipette_steps_to_volume(self.machine.loaded_steps());
        if remainder > 0.0 {
            self.z_down(depth).await?;
            self.plunger_move(remainder, Direction::Cw).await?;
            self.ensure_z_up().await?;
        }
        self.refresh(format!("rinse in {well} done"));
        Ok(())
    }

    /// Cooperative wait between firings.
    async fn wait(&mut self, seconds: u64) -> ControlResult<()> {
        if seconds == 0 {
            return Ok(());
        }
        self.set_state(
            ExecutionState::Waiting,
            self.machine.tracker.current_well(),
            format!("waiting {seconds} s"),
        );
        self.sleep_until_cancellable(Instant::now() + Duration::from_secs(seconds))
            .await
    }

    // --- step state machine ----------------------------------------------

    /// One pickup → dropoff → rinse traversal.
    async fn run_traversal(&mut self, step: &ProgramStep) -> ControlResult<()> {
        self.ensure_z_up().await?;
        self.travel_to(step.pickup_well).await?;
        self.z_down(self.config().pickup_depth).await?;
        self.aspirate(step.sample_volume_ml, Some(step.pickup_well))
            .await?;
        self.ensure_z_up().await?;

        if let Some(dropoff) = step.dropoff_well {
            self.travel_to(dropoff).await?;
            self.z_down(self.config().dropoff_depth).await?;
            self.dispense(step.sample_volume_ml, Some(dropoff)).await?;
            self.ensure_z_up().await?;
        }

        if let Some(rinse_well) = step.rinse_well {
            self.travel_to(rinse_well).await?;
            self.rinse(rinse_well).await?;
            self.ensure_z_up().await?;
        }
        Ok(())
    }

    /// The step's `cycles` traversals back-to-back, then its wait.
    async fn run_transfer_block(&mut self, step: &ProgramStep) -> ControlResult<()> {
        for cycle in 1..=step.cycles {
            self.check_cancel()?;
            if step.cycles > 1 {
                self.log(format!("cycle {cycle}/{}", step.cycles));
            }
            self.run_traversal(step).await?;
        }
        self.wait(step.wait_seconds).await
    }

    async fn run_step(&mut self, step: &ProgramStep) -> ControlResult<()> {
        for well in step.wells() {
            self.kin.check_head_geometry(well, step.pipette_count)?;
        }
        self.machine.tracker.set_pipette_count(step.pipette_count);

        match step.repetition {
            Repetition::Quantity { count } => {
                if count > 1 {
                    self.log(format!("repetition: {count} times"));
                }
                for rep in 1..=count {
                    self.check_cancel()?;
                    if count > 1 {
                        self.log(format!("repetition {rep}/{count}"));
                    }
                    self.run_transfer_block(step).await?;
                }
            }
            Repetition::Time {
                interval_s,
                duration_s,
            } => {
                let interval = Duration::from_secs(interval_s);
                let duration = Duration::from_secs(duration_s);
                self.log(format!(
                    "repetition: every {interval_s} s for {duration_s} s"
                ));
                let start = Instant::now();
                let mut k: u32 = 0;
                loop {
                    let target = interval * k;
                    if target >= duration {
                        break;
                    }
                    let elapsed = start.elapsed();
                    if elapsed > target + FIRING_GRACE {
                        // this alignment already passed while the previous
                        // block ran; skip it rather than firing back-to-back
                        self.log(format!("repetition at +{}s skipped (running late)", k as u64 * interval_s));
                        k += 1;
                        continue;
                    }
                    if elapsed < target {
                        self.sleep_until_cancellable(start + target).await?;
                    }
                    self.log(format!("repetition at +{}s", k as u64 * interval_s));
                    self.run_transfer_block(step).await?;
                    k += 1;
                }
            }
        }
        Ok(())
    }

    /// Run a whole program. The caller owns terminal state publishing.
    pub async fn run_program(&mut self, program: &Program) -> ControlResult<()> {
        let total = program.steps.len();
        self.log(format!("executing pipetting sequence ({total} steps)"));
        for (index, step) in program.steps.iter().enumerate() {
            self.check_cancel()?;
            self.log(format!(
                "step {}/{total}: {} -> {} ({} mL, {} pipette(s))",
                index + 1,
                step.pickup_well,
                step.dropoff_well
                    .map(|w| w.to_string())
                    .unwrap_or_else(|| "-".into()),
                step.sample_volume_ml,
                step.pipette_count,
            ));
            self.run_step(step).await?;
        }
        self.log("sequence complete");
        Ok(())
    }

    // --- entry-point primitives (single operations) ----------------------

    /// Home every axis in X, Y, Z, pipette order and zero the record.
    pub async fn home_all(&mut self) -> ControlResult<()> {
        self.set_state(ExecutionState::Homing, None, "homing all axes");
        for axis in ALL_AXES {
            self.check_cancel()?;
            let driver = &self.machine.driver;
            let outcome = retry_timeout(|| {
                driver.home(axis, axis.home_direction(), HOME_DELAY_US, HOME_MAX_STEPS)
            })
            .await
            .map_err(ControlError::from)?;
            if !outcome.homed {
                return Err(MotionFault::HomingFailed {
                    axis,
                    max_steps: HOME_MAX_STEPS,
                }
                .into());
            }
            self.machine.tracker.zero(axis);
            self.log(format!(
                "{axis} homed ({} steps to switch)",
                outcome.steps_to_home
            ));
            self.refresh(format!("{axis} homed"));
        }
        self.machine.tracker.zero_all();
        self.machine.tracker.set_well(WellId::A1);
        self.log("all axes homed, position zeroed at A1");
        Ok(())
    }

    /// Relocate to a well with Z up (entry point `move_to_well`).
    pub async fn move_to_well(&mut self, well: WellId) -> ControlResult<()> {
        self.kin
            .check_head_geometry(well, self.machine.tracker.pipette_count())?;
        self.ensure_z_up().await?;
        self.travel_to(well).await
    }

    /// Aspirate at the current position (entry point `aspirate`).
    pub async fn aspirate_here(&mut self, volume_ml: f64) -> ControlResult<()> {
        let well = self.machine.tracker.current_well();
        self.aspirate(volume_ml, well).await
    }

    /// Dispense at the current position (entry point `dispense`).
    pub async fn dispense_here(&mut self, volume_ml: f64) -> ControlResult<()> {
        let well = self.machine.tracker.current_well();
        self.dispense(volume_ml, well).await
    }

    /// Raise to the safe plane or lower to pickup depth.
    pub async fn toggle_z(&mut self, target: ZState) -> ControlResult<()> {
        let well = self.machine.tracker.current_well();
        self.set_state(ExecutionState::Moving, well, "toggling Z");
        match target {
            ZState::Up => self.ensure_z_up().await,
            ZState::Down => self.z_down(self.config().pickup_depth).await,
        }
    }

    /// Raw single-axis jog for calibration. Allowed before homing.
    ///
    /// A jog that runs into its own home switch zeroes that axis (that is
    /// how an axis is found by hand); a limit hit in any other direction
    /// means the position record can no longer be trusted.
    pub async fn jog(
        &mut self,
        axis: Axis,
        steps: u32,
        direction: Direction,
    ) -> ControlResult<StepOutcome> {
        self.check_cancel()?;
        let delay = match axis {
            Axis::Pipette => self.config().pipette_delay_us(),
            _ => self.config().travel_delay_us(),
        };
        let driver = &self.machine.driver;
        let outcome = retry_timeout(|| driver.step(axis, steps, direction, delay, true))
            .await
            .map_err(ControlError::from)?;
        self.machine
            .tracker
            .apply_step(axis, outcome.steps_executed, direction);
        if outcome.limit_triggered {
            if direction == axis.home_direction() {
                self.machine.tracker.zero(axis);
                self.log(format!("{axis} jogged onto its home switch, zeroed"));
            } else {
                self.machine.tracker.invalidate();
                self.log(format!("{axis} hit a limit mid-jog; re-home required"));
            }
        }
        self.refresh(format!("jogged {axis}"));
        Ok(outcome)
    }
}
