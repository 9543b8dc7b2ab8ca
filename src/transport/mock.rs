//! In-memory MCU stand-in.
//!
//! Used two ways: as the `--mock` simulation backend when no hardware is
//! attached, and as the test double for the integration suite. Every request
//! is recorded; replies come from a scripted queue when one is loaded,
//! otherwise a plausible success is synthesized from the request itself.

use super::Transport;
use crate::error::TransportError;
use crate::protocol::{BatchResult, LimitState, McuRequest, McuResponse, OkPayload};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// What the mock should do with one upcoming request.
#[derive(Debug, Clone)]
pub enum MockAction {
    /// Answer with this reply.
    Reply(McuResponse),
    /// Fail with this transport error.
    Fault(TransportError),
}

#[derive(Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<MockAction>>,
    trace: Mutex<Vec<McuRequest>>,
    broken: AtomicBool,
    refuse_reconnect: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a scripted action for the next unanswered request.
    pub fn enqueue(&self, action: MockAction) {
        self.script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(action);
    }

    pub fn enqueue_reply(&self, reply: McuResponse) {
        self.enqueue(MockAction::Reply(reply));
    }

    pub fn enqueue_fault(&self, fault: TransportError) {
        self.enqueue(MockAction::Fault(fault));
    }

    /// Everything sent so far, in order.
    pub fn requests(&self) -> Vec<McuRequest> {
        self.trace
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn clear_trace(&self) {
        self.trace
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    /// Simulate a dead link; calls fail with `LinkLost` until reconnected.
    pub fn break_link(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    /// Make `reconnect` fail too, pinning the link down.
    pub fn refuse_reconnect(&self, refuse: bool) {
        self.refuse_reconnect.store(refuse, Ordering::SeqCst);
    }

    /// The success reply a healthy firmware would give.
    fn synthesize(request: &McuRequest) -> McuResponse {
        match request {
            McuRequest::Step { steps, .. } => McuResponse::Ok(OkPayload::Step {
                steps_executed: *steps,
                limit_triggered: false,
            }),
            McuRequest::HomeMotor { .. } => McuResponse::Ok(OkPayload::Home {
                steps_to_home: 500,
                homed: true,
            }),
            McuRequest::HomeAll { .. } => McuResponse::Ok(OkPayload::HomeAll {
                steps_to_home: vec![500; 4],
                homed: vec![true; 4],
            }),
            McuRequest::MoveBatch { movements, .. } => McuResponse::Ok(OkPayload::Batch {
                results: movements
                    .iter()
                    .map(|m| BatchResult {
                        motor_id: m.motor_id,
                        steps_executed: m.steps,
                        limit_hit: false,
                    })
                    .collect(),
            }),
            McuRequest::GetLimits => McuResponse::Ok(OkPayload::Limits {
                limits: (1..=4)
                    .map(|id| LimitState {
                        motor_id: id,
                        triggered: false,
                        pin: 9 + id,
                    })
                    .collect(),
            }),
            McuRequest::InitMotor { .. }
            | McuRequest::Stop { .. }
            | McuRequest::StopAll => McuResponse::Ok(OkPayload::Empty {}),
            McuRequest::Ping => McuResponse::Pong,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_request(
        &self,
        request: &McuRequest,
        _timeout: Duration,
    ) -> Result<McuResponse, TransportError> {
        if self.is_broken() {
            return Err(TransportError::LinkLost);
        }
        self.trace
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.clone());

        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        match scripted {
            Some(MockAction::Reply(reply)) => Ok(reply),
            Some(MockAction::Fault(fault)) => {
                if matches!(fault, TransportError::Io(_) | TransportError::LinkLost) {
                    self.broken.store(true, Ordering::SeqCst);
                }
                Err(fault)
            }
            None => Ok(Self::synthesize(request)),
        }
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        if self.refuse_reconnect.load(Ordering::SeqCst) {
            return Err(TransportError::Io("mock link held down".into()));
        }
        self.broken.store(false, Ordering::SeqCst);
        Ok(())
    }
}
