//! Shared harness for the integration suite: a sampler wired to the mock
//! MCU, plus helpers for reading the request trace the way the invariants
//! are phrased.
#![allow(dead_code)] // each test binary uses its own subset of the helpers

use plate_sampler::config::SamplerConfig;
use plate_sampler::program::{ProgramStep, Repetition};
use plate_sampler::protocol::McuRequest;
use plate_sampler::transport::MockTransport;
use plate_sampler::Sampler;
use std::sync::Arc;
use std::time::Duration;

pub fn sampler_with_mock(config: SamplerConfig) -> (Sampler, Arc<MockTransport>) {
    let mock = Arc::new(MockTransport::new());
    let sampler = Sampler::new(mock.clone(), config);
    (sampler, mock)
}

/// A sampler that has been pinged, initialized, and homed, with the trace
/// cleared so tests see only their own traffic.
pub async fn ready_sampler() -> (Sampler, Arc<MockTransport>) {
    let (sampler, mock) = sampler_with_mock(SamplerConfig::default());
    sampler.initialize_motors().await.unwrap();
    sampler.home_all().await.unwrap();
    mock.clear_trace();
    (sampler, mock)
}

/// Poll until `done` returns true, advancing (possibly paused) time.
pub async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

pub fn transfer_step(pickup: &str, dropoff: Option<&str>, rinse: Option<&str>) -> ProgramStep {
    ProgramStep {
        pickup_well: pickup.parse().unwrap(),
        dropoff_well: dropoff.map(|w| w.parse().unwrap()),
        rinse_well: rinse.map(|w| w.parse().unwrap()),
        sample_volume_ml: 0.5,
        wait_seconds: 0,
        cycles: 1,
        pipette_count: 1,
        repetition: Repetition::Quantity { count: 1 },
    }
}

/// X-axis movements (steps, direction as wire u8) from every `move_batch`.
pub fn x_movements(trace: &[McuRequest]) -> Vec<(u32, u8)> {
    trace
        .iter()
        .filter_map(|req| match req {
            McuRequest::MoveBatch { movements, .. } => Some(movements),
            _ => None,
        })
        .flatten()
        .filter(|m| m.motor_id == 1)
        .map(|m| (m.steps, u8::from(m.direction)))
        .collect()
}

/// Plunger movements (steps, direction as wire u8), aspirate = 0 (CCW).
pub fn plunger_movements(trace: &[McuRequest]) -> Vec<(u32, u8)> {
    trace
        .iter()
        .filter_map(|req| match req {
            McuRequest::Step {
                motor_id: 4,
                steps,
                direction,
                ..
            } => Some((*steps, u8::from(*direction))),
            _ => None,
        })
        .collect()
}

/// Check the Z-safe travel invariant over a trace: every `move_batch` that
/// touches X or Y must be issued with the Z axis at step 0 (fully up).
pub fn assert_z_safe(trace: &[McuRequest]) {
    let mut z: i64 = 0;
    for req in trace {
        match req {
            McuRequest::Step {
                motor_id: 3,
                steps,
                direction,
                ..
            } => {
                // Z grows clockwise (downward)
                let sign = if u8::from(*direction) == 1 { 1 } else { -1 };
                z += sign * *steps as i64;
            }
            McuRequest::HomeMotor { motor_id: 3, .. } => z = 0,
            McuRequest::MoveBatch { movements, .. } => {
                if movements.iter().any(|m| m.motor_id == 1 || m.motor_id == 2) {
                    assert_eq!(z, 0, "X/Y motion issued while Z was {z} steps down");
                }
            }
            _ => {}
        }
    }
}
