//! The execution controller: one motion lock, one job at a time.
//!
//! `Sampler` is the owned value everything flows through — no free functions
//! touch the hardware. Short UI entry points (status, logs, stop, config)
//! never block on the lock; motion entry points take it with `try_lock` and
//! answer `Busy` instead of queueing. A program runs on its own task holding
//! the lock guard for the whole job, so the machine is released exactly when
//! the job reaches a terminal state.

use crate::config::{ConfigStore, SamplerConfig};
use crate::error::{ControlError, ControlResult};
use crate::executor::{build_snapshot, Executor, Machine};
use crate::logring::LogRing;
use crate::motor::{MotorDriver, MAX_MOVE_STEPS};
use crate::position::{Axis, AxisPositions, Direction, ZState};
use crate::program::Program;
use crate::protocol::LimitState;
use crate::status::{ExecutionState, StatusBoard, StatusSnapshot};
use crate::transport::{ReconnectPolicy, Transport};
use crate::well::WellId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

struct SamplerInner {
    machine: Arc<Mutex<Machine>>,
    transport: Arc<dyn Transport>,
    cancel: AtomicBool,
    status: StatusBoard,
    logs: LogRing,
    config: ConfigStore,
}

/// Drive an operation's result to its terminal state: publish the final
/// snapshot, run `stop_all` where the contract demands it, and clear the
/// cancel flag so it cannot leak into the next job.
async fn conclude(
    inner: &SamplerInner,
    machine: &mut Machine,
    result: ControlResult<()>,
    success_message: &str,
) -> ControlResult<()> {
    match result {
        Ok(()) => {
            inner.status.publish(build_snapshot(
                machine,
                ExecutionState::Idle,
                None,
                success_message,
            ));
            Ok(())
        }
        Err(ControlError::Stopped) => {
            inner.status.publish(build_snapshot(
                machine,
                ExecutionState::Stopping,
                None,
                "stopping",
            ));
            if let Err(e) = machine.driver.stop_all().await {
                debug!("stop_all after cancel failed: {e}");
            }
            inner.cancel.store(false, Ordering::SeqCst);
            inner.logs.push("stopped by user");
            inner.status.publish(build_snapshot(
                machine,
                ExecutionState::Idle,
                None,
                "stopped by user",
            ));
            Err(ControlError::Stopped)
        }
        Err(e) => {
            if let Err(stop_err) = machine.driver.stop_all().await {
                debug!("stop_all after error failed: {stop_err}");
            }
            if e.clears_initialized() {
                machine.tracker.invalidate();
            }
            inner.cancel.store(false, Ordering::SeqCst);
            inner.logs.push(format!("error: {e}"));
            warn!("operation failed: {e}");
            inner.status.publish(build_snapshot(
                machine,
                ExecutionState::Error(e.to_string()),
                None,
                e.to_string(),
            ));
            Err(e)
        }
    }
}

/// The pipetting sampler's control surface.
///
/// Clone-cheap handle; the web collaborator keeps one and maps its methods
/// onto the REST routes 1:1.
#[derive(Clone)]
pub struct Sampler {
    inner: Arc<SamplerInner>,
}

impl Sampler {
    pub fn new(transport: Arc<dyn Transport>, config: SamplerConfig) -> Self {
        let driver = MotorDriver::new(transport.clone());
        Self {
            inner: Arc::new(SamplerInner {
                machine: Arc::new(Mutex::new(Machine::new(driver))),
                transport,
                cancel: AtomicBool::new(false),
                status: StatusBoard::new(),
                logs: LogRing::new(),
                config: ConfigStore::new(config),
            }),
        }
    }

    fn try_lock(&self) -> ControlResult<OwnedMutexGuard<Machine>> {
        self.inner
            .machine
            .clone()
            .try_lock_owned()
            .map_err(|_| ControlError::Busy)
    }

    fn executor<'a>(
        &'a self,
        machine: &'a mut Machine,
        config: SamplerConfig,
    ) -> Executor<'a> {
        Executor::new(
            machine,
            config,
            &self.inner.cancel,
            &self.inner.status,
            &self.inner.logs,
        )
    }

    /// Ping the MCU and configure all four motors. Run once at startup.
    pub async fn initialize_motors(&self) -> ControlResult<()> {
        let guard = self.try_lock()?;
        guard.driver.ping().await.map_err(ControlError::from)?;
        guard.driver.init_all().await.map_err(ControlError::from)?;
        self.inner.logs.push("motors initialized");
        Ok(())
    }

    // --- job surface ------------------------------------------------------

    /// Accept a program and start it on the job task.
    ///
    /// Returns the accepted/rejected verdict, not the job's result — poll
    /// `status()` for progress and the terminal state.
    pub fn start_program(&self, program: Program) -> ControlResult<()> {
        let config = self.inner.config.snapshot();
        program.validate(&config)?;

        let mut guard = self.try_lock()?;
        if !guard.tracker.is_initialized() {
            return Err(ControlError::NotInitialized);
        }
        self.inner.cancel.store(false, Ordering::SeqCst);
        // publish the accepted state before the job task first runs, so a
        // stop() issued right after acceptance is not mistaken for idle
        self.inner.status.publish(build_snapshot(
            &guard,
            ExecutionState::Moving,
            None,
            "program accepted",
        ));

        let inner = self.inner.clone();
        let sampler = self.clone();
        tokio::spawn(async move {
            let result = {
                let mut executor = sampler.executor(&mut guard, (*config).clone());
                executor.run_program(&program).await
            };
            let _ = conclude(&inner, &mut guard, result, "sequence complete").await;
            // guard drops here: the machine is free again
        });
        Ok(())
    }

    /// Request cancellation of the running job. Idempotent; no-op when idle.
    ///
    /// The job observes the flag at its next checkpoint, transitions to
    /// `Stopping`, issues `stop_all`, and releases the lock. An MCU request
    /// already in flight is never aborted.
    pub fn stop(&self) {
        if !self.inner.status.read().is_executing {
            debug!("stop requested while idle, nothing to do");
            return;
        }
        if !self.inner.cancel.swap(true, Ordering::SeqCst) {
            self.inner.logs.push("stop requested");
            info!("stop requested");
        }
    }

    /// Home X, Y, Z, then the pipette; zero the record and clear any error.
    pub async fn home_all(&self) -> ControlResult<()> {
        let mut guard = self.try_lock()?;
        self.inner.cancel.store(false, Ordering::SeqCst);
        let config = self.inner.config.snapshot();
        let result = {
            let mut executor = self.executor(&mut guard, (*config).clone());
            executor.home_all().await
        };
        conclude(&self.inner, &mut guard, result, "homed at A1").await
    }

    // --- single-primitive surface ----------------------------------------

    pub async fn move_to_well(&self, well: WellId) -> ControlResult<()> {
        let mut guard = self.try_lock()?;
        if !guard.tracker.is_initialized() {
            return Err(ControlError::NotInitialized);
        }
        self.inner.cancel.store(false, Ordering::SeqCst);
        let config = self.inner.config.snapshot();
        let result = {
            let mut executor = self.executor(&mut guard, (*config).clone());
            executor.move_to_well(well).await
        };
        conclude(&self.inner, &mut guard, result, &format!("at well {well}")).await
    }

    pub async fn aspirate(&self, volume_ml: f64) -> ControlResult<()> {
        self.check_volume(volume_ml)?;
        let mut guard = self.try_lock()?;
        if !guard.tracker.is_initialized() {
            return Err(ControlError::NotInitialized);
        }
        self.inner.cancel.store(false, Ordering::SeqCst);
        let config = self.inner.config.snapshot();
        let result = {
            let mut executor = self.executor(&mut guard, (*config).clone());
            executor.aspirate_here(volume_ml).await
        };
        conclude(
            &self.inner,
            &mut guard,
            result,
            &format!("aspirated {volume_ml} mL"),
        )
        .await
    }

    pub async fn dispense(&self, volume_ml: f64) -> ControlResult<()> {
        self.check_volume(volume_ml)?;
        let mut guard = self.try_lock()?;
        if !guard.tracker.is_initialized() {
            return Err(ControlError::NotInitialized);
        }
        self.inner.cancel.store(false, Ordering::SeqCst);
        let config = self.inner.config.snapshot();
        let result = {
            let mut executor = self.executor(&mut guard, (*config).clone());
            executor.dispense_here(volume_ml).await
        };
        conclude(
            &self.inner,
            &mut guard,
            result,
            &format!("dispensed {volume_ml} mL"),
        )
        .await
    }

    pub async fn toggle_z(&self, target: ZState) -> ControlResult<()> {
        let mut guard = self.try_lock()?;
        if !guard.tracker.is_initialized() {
            return Err(ControlError::NotInitialized);
        }
        self.inner.cancel.store(false, Ordering::SeqCst);
        let config = self.inner.config.snapshot();
        let result = {
            let mut executor = self.executor(&mut guard, (*config).clone());
            executor.toggle_z(target).await
        };
        let message = match target {
            ZState::Up => "Z up",
            ZState::Down => "Z down",
        };
        conclude(&self.inner, &mut guard, result, message).await
    }

    /// Raw axis jog for calibration. Works before homing.
    pub async fn axis_jog(
        &self,
        axis: Axis,
        steps: u32,
        direction: Direction,
    ) -> ControlResult<AxisPositions> {
        if steps == 0 || steps > MAX_MOVE_STEPS {
            return Err(ControlError::Validation(format!(
                "jog steps must be 1..={MAX_MOVE_STEPS}, got {steps}"
            )));
        }
        let mut guard = self.try_lock()?;
        self.inner.cancel.store(false, Ordering::SeqCst);
        let config = self.inner.config.snapshot();
        let result = {
            let mut executor = self.executor(&mut guard, (*config).clone());
            executor.jog(axis, steps, direction).await.map(|_| ())
        };
        conclude(&self.inner, &mut guard, result, &format!("jogged {axis}")).await?;
        Ok(guard.tracker.positions())
    }

    fn check_volume(&self, volume_ml: f64) -> ControlResult<()> {
        let capacity = self.inner.config.snapshot().pipette_capacity_ml;
        if !volume_ml.is_finite() || volume_ml <= 0.0 || volume_ml > capacity {
            return Err(ControlError::Validation(format!(
                "volume must be in (0, {capacity}] mL, got {volume_ml}"
            )));
        }
        Ok(())
    }

    // --- observation surface ---------------------------------------------

    /// Non-blocking status read; always a consistent snapshot.
    pub fn status(&self) -> Arc<StatusSnapshot> {
        self.inner.status.read()
    }

    /// The last `n` operator-facing log lines.
    pub fn logs(&self, last_n: usize) -> Vec<String> {
        self.inner.logs.last(last_n)
    }

    /// Axis positions as of the last published snapshot.
    pub fn positions(&self) -> AxisPositions {
        self.inner.status.read().positions
    }

    pub async fn limit_states(&self) -> ControlResult<Vec<LimitState>> {
        let guard = self.try_lock()?;
        guard.driver.get_limits().await.map_err(ControlError::from)
    }

    // --- configuration surface -------------------------------------------

    pub fn config(&self) -> Arc<SamplerConfig> {
        self.inner.config.snapshot()
    }

    /// Swap in a new validated config. A running job keeps the snapshot it
    /// started with; the next job sees the new values.
    pub fn update_config(&self, config: SamplerConfig) -> ControlResult<()> {
        self.inner.config.replace(config)?;
        self.inner.logs.push("configuration updated");
        Ok(())
    }

    /// Select the 1- or 3-pipette head. Refused while a job is running.
    pub fn set_pipette_count(&self, count: u8) -> ControlResult<()> {
        if count != 1 && count != 3 {
            return Err(ControlError::Validation(format!(
                "pipette count must be 1 or 3, got {count}"
            )));
        }
        let mut guard = self.try_lock()?;
        guard.tracker.set_pipette_count(count);
        let snapshot = build_snapshot(
            &guard,
            ExecutionState::Idle,
            None,
            format!("pipette count set to {count}"),
        );
        self.inner.status.publish(snapshot);
        self.inner
            .logs
            .push(format!("pipette count set to {count}"));
        Ok(())
    }

    // --- link supervision -------------------------------------------------

    /// Keep the MCU link alive while the machine is idle.
    ///
    /// Reconnects with exponential backoff (capped at 2 s, unlimited
    /// attempts). A job that loses the link mid-run fails on its own with
    /// `LinkLost` and releases the lock; this loop then brings the channel
    /// back for the next job and re-inits the motors.
    pub async fn supervise_link(&self) {
        let policy = ReconnectPolicy::default();
        let mut attempt: u32 = 0;
        loop {
            if self.inner.transport.is_broken() {
                match self.inner.transport.reconnect().await {
                    Ok(()) => {
                        attempt = 0;
                        self.inner.logs.push("MCU link restored");
                        info!("MCU link restored");
                        if let Ok(guard) = self.try_lock() {
                            if let Err(e) = guard.driver.init_all().await {
                                warn!("motor re-init after reconnect failed: {e}");
                            }
                        }
                    }
                    Err(e) => {
                        let delay = policy.delay_for(attempt);
                        debug!("reconnect attempt {attempt} failed ({e}), retrying in {delay:?}");
                        attempt = attempt.saturating_add(1);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                }
            } else {
                attempt = 0;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}
