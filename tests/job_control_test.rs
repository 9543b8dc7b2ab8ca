//! Job lifecycle scenarios: cancellation, time-mode repetition, fault
//! handling, config-swap isolation, and the motion-lock mutual exclusion
//! that the UI-facing entry points rely on.

mod common;

use common::*;
use plate_sampler::error::{ControlError, MotionFault, TransportError};
use plate_sampler::program::{Program, Repetition};
use plate_sampler::protocol::{BatchResult, McuRequest, McuResponse, OkPayload};
use plate_sampler::transport::Transport;
use plate_sampler::well::WellId;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn stop_during_wait_lands_idle_quickly() {
    let (sampler, _mock) = ready_sampler().await;

    let mut step = transfer_step("A1", Some("A2"), None);
    step.wait_seconds = 10;
    sampler
        .start_program(Program { steps: vec![step] })
        .unwrap();

    // the transfer itself is instant against the mock; the job parks in the
    // wait, checking for cancellation every 100 ms
    wait_until(|| sampler.status().current_operation.label() == "waiting").await;
    // sample was already dispensed before the wait began
    assert_eq!(sampler.status().positions.pipette, 0);

    let stop_issued = Instant::now();
    sampler.stop();
    wait_until(|| !sampler.status().is_executing).await;

    assert!(
        stop_issued.elapsed() <= Duration::from_millis(250),
        "stop took {:?}",
        stop_issued.elapsed()
    );
    let status = sampler.status();
    assert_eq!(status.message, "stopped by user");
    assert!(sampler
        .logs(50)
        .iter()
        .any(|line| line.contains("stopped by user")));

    // stop again while idle: idempotent no-op
    sampler.stop();
    assert!(!sampler.status().is_executing);
}

#[tokio::test(start_paused = true)]
async fn time_mode_fires_on_each_alignment() {
    let (sampler, mock) = ready_sampler().await;

    // S5: every 2 s for 7 s -> firings at 0, 2, 4, 6 s
    let mut step = transfer_step("A1", Some("A2"), None);
    step.repetition = Repetition::Time {
        interval_s: 2,
        duration_s: 7,
    };
    let started = Instant::now();
    sampler
        .start_program(Program { steps: vec![step] })
        .unwrap();
    wait_until(|| sampler.status().message == "sequence complete").await;

    let aspirates = plunger_movements(&mock.requests())
        .iter()
        .filter(|(_, direction)| *direction == 0)
        .count();
    assert_eq!(aspirates, 4, "one firing per alignment inside the window");

    // the last firing sits at the 6 s alignment
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(6) && elapsed < Duration::from_secs(7),
        "finished at {elapsed:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn limit_during_travel_forces_a_rehome() {
    let (sampler, mock) = ready_sampler().await;

    // S4: the X travel comes back short with the switch tripped
    mock.enqueue_reply(McuResponse::Ok(OkPayload::Batch {
        results: vec![BatchResult {
            motor_id: 1,
            steps_executed: 120,
            limit_hit: true,
        }],
    }));
    let err = sampler
        .move_to_well("A2".parse().unwrap())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ControlError::MotionFault(MotionFault::UnexpectedLimit { axis: plate_sampler::position::Axis::X })
    );

    let status = sampler.status();
    assert!(!status.initialized);
    assert_eq!(status.current_operation.label(), "error");

    // anything well-addressed is now refused until a successful home
    let err = sampler
        .move_to_well("A3".parse().unwrap())
        .await
        .unwrap_err();
    assert_eq!(err, ControlError::NotInitialized);

    sampler.home_all().await.unwrap();
    assert!(sampler.status().initialized);
    sampler.move_to_well("A2".parse().unwrap()).await.unwrap();
    assert_eq!(sampler.status().current_well, Some("A2".parse().unwrap()));
}

#[tokio::test(start_paused = true)]
async fn pipette_limit_trip_during_dispense_is_fatal() {
    let (sampler, mock) = ready_sampler().await;
    sampler.aspirate(0.5).await.unwrap();

    // the dispense completes its full step count but reports the empty-stop
    // switch tripped; only homing moves may touch a switch, so this is a
    // fault like any other unexpected limit
    mock.enqueue_reply(McuResponse::Ok(OkPayload::Step {
        steps_executed: 500,
        limit_triggered: true,
    }));
    let err = sampler.dispense(0.5).await.unwrap_err();
    assert_eq!(
        err,
        ControlError::MotionFault(MotionFault::UnexpectedLimit {
            axis: plate_sampler::position::Axis::Pipette
        })
    );

    let status = sampler.status();
    assert_eq!(status.current_operation.label(), "error");
    assert!(!status.initialized, "motion faults force a re-home");
    // the trip was toward the plunger's home switch, so the record is
    // pinned at the physical zero
    assert_eq!(status.positions.pipette, 0);
}

#[tokio::test(start_paused = true)]
async fn config_swap_does_not_reach_the_running_job() {
    let (sampler, mock) = ready_sampler().await;

    // S6: step 1 travels then waits; the swap lands during the wait, and
    // step 2 must still run at the old travel speed
    let mut first = transfer_step("A1", Some("A2"), None);
    first.wait_seconds = 3;
    let second = transfer_step("A3", Some("A4"), None);
    sampler
        .start_program(Program {
            steps: vec![first, second],
        })
        .unwrap();

    wait_until(|| sampler.status().current_operation.label() == "waiting").await;
    let mut new_config = (*sampler.config()).clone();
    new_config.travel_speed = 0.005;
    sampler.update_config(new_config).unwrap();

    wait_until(|| sampler.status().message == "sequence complete").await;
    for req in mock.requests() {
        if let McuRequest::MoveBatch { movements, .. } = req {
            for movement in movements {
                assert_eq!(movement.delay_us, 1000, "job must keep its snapshot");
            }
        }
    }

    // the next job sees the new value
    mock.clear_trace();
    sampler
        .start_program(Program {
            steps: vec![transfer_step("A1", Some("A2"), None)],
        })
        .unwrap();
    wait_until(|| sampler.status().message == "sequence complete").await;
    let batches: Vec<u32> = mock
        .requests()
        .iter()
        .filter_map(|r| match r {
            McuRequest::MoveBatch { movements, .. } => {
                Some(movements.iter().map(|m| m.delay_us).collect::<Vec<_>>())
            }
            _ => None,
        })
        .flatten()
        .collect();
    assert!(!batches.is_empty());
    assert!(batches.iter().all(|&d| d == 5000));
}

#[tokio::test(start_paused = true)]
async fn motion_lock_rejects_concurrent_work() {
    let (sampler, _mock) = ready_sampler().await;

    let mut step = transfer_step("A1", Some("A2"), None);
    step.wait_seconds = 5;
    sampler
        .start_program(Program {
            steps: vec![step.clone()],
        })
        .unwrap();
    wait_until(|| sampler.status().is_executing).await;

    assert_eq!(
        sampler.start_program(Program { steps: vec![step] }),
        Err(ControlError::Busy)
    );
    assert_eq!(
        sampler.move_to_well("A5".parse().unwrap()).await,
        Err(ControlError::Busy)
    );
    assert_eq!(sampler.home_all().await, Err(ControlError::Busy));
    assert_eq!(sampler.set_pipette_count(3), Err(ControlError::Busy));
    assert_eq!(
        sampler.limit_states().await.unwrap_err(),
        ControlError::Busy
    );

    // observation stays available while the job runs
    assert!(sampler.status().is_executing);
    assert!(!sampler.logs(5).is_empty());

    sampler.stop();
    wait_until(|| !sampler.status().is_executing).await;
    sampler.set_pipette_count(3).unwrap();
}

#[tokio::test(start_paused = true)]
async fn single_timeout_is_retried_then_fatal() {
    let (sampler, mock) = ready_sampler().await;

    // one timeout: the travel is retried and succeeds
    mock.enqueue_fault(TransportError::Timeout);
    sampler.move_to_well("A2".parse().unwrap()).await.unwrap();
    let batches = mock
        .requests()
        .iter()
        .filter(|r| matches!(r, McuRequest::MoveBatch { .. }))
        .count();
    assert_eq!(batches, 2, "the timed-out request is sent exactly twice");

    // two in a row: fatal, and tagged as a timeout rather than a user stop
    mock.clear_trace();
    mock.enqueue_fault(TransportError::Timeout);
    mock.enqueue_fault(TransportError::Timeout);
    let err = sampler
        .move_to_well("A3".parse().unwrap())
        .await
        .unwrap_err();
    assert_eq!(err, ControlError::Transport(TransportError::Timeout));
    assert_eq!(sampler.status().current_operation.label(), "error");
}

#[tokio::test(start_paused = true)]
async fn link_loss_fails_the_job_and_releases_the_lock() {
    let (sampler, mock) = ready_sampler().await;

    let mut step = transfer_step("A1", Some("A2"), None);
    step.wait_seconds = 1;
    mock.enqueue_fault(TransportError::Io("usb unplugged".into()));
    sampler
        .start_program(Program { steps: vec![step] })
        .unwrap();
    wait_until(|| !sampler.status().is_executing).await;

    let status = sampler.status();
    assert_eq!(status.current_operation.label(), "error");
    assert!(mock.is_broken());

    // the lock was released with the failure; after a reconnect the next
    // home goes straight through
    mock.reconnect().await.unwrap();
    sampler.home_all().await.unwrap();
    assert!(sampler.status().initialized);
}

#[tokio::test(start_paused = true)]
async fn homing_failure_reports_the_axis() {
    let (sampler, mock) = sampler_with_mock(plate_sampler::config::SamplerConfig::default());
    sampler.initialize_motors().await.unwrap();

    // Y never reaches its switch
    mock.enqueue_reply(McuResponse::Ok(OkPayload::Home {
        steps_to_home: 500,
        homed: true,
    }));
    mock.enqueue_reply(McuResponse::Ok(OkPayload::Home {
        steps_to_home: 10_000,
        homed: false,
    }));
    let err = sampler.home_all().await.unwrap_err();
    assert!(matches!(
        err,
        ControlError::MotionFault(MotionFault::HomingFailed {
            axis: plate_sampler::position::Axis::Y,
            ..
        })
    ));
    assert!(!sampler.status().initialized);
}

#[tokio::test(start_paused = true)]
async fn jog_works_before_homing() {
    let (sampler, mock) = sampler_with_mock(plate_sampler::config::SamplerConfig::default());
    sampler.initialize_motors().await.unwrap();
    mock.clear_trace();

    let positions = sampler
        .axis_jog(
            plate_sampler::position::Axis::X,
            150,
            plate_sampler::position::Direction::Cw,
        )
        .await
        .unwrap();
    assert_eq!(positions.x, 150);
    assert!(!sampler.status().initialized, "jogging does not home");

    // but a well-addressed move still demands homing first
    assert_eq!(
        sampler.move_to_well(WellId::A1).await,
        Err(ControlError::NotInitialized)
    );
}
