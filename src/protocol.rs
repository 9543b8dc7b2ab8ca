//! MCU wire protocol: newline-delimited JSON frames.
//!
//! Requests carry a `cmd` tag, replies a `status` tag. The firmware speaks
//! exactly this vocabulary at 115200 8N1; unknown tags on either side are
//! hard errors, never warnings. Direction is encoded as the firmware expects
//! it: 1 = clockwise, 0 = counter-clockwise.

use crate::error::TransportError;
use crate::position::Direction;
use serde::{Deserialize, Serialize};

/// One motor's share of a `move_batch` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMovement {
    pub motor_id: u8,
    pub steps: u32,
    pub direction: Direction,
    pub delay_us: u32,
}

/// One motor's result from a `move_batch` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub motor_id: u8,
    pub steps_executed: u32,
    pub limit_hit: bool,
}

/// One limit switch state from `get_limits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitState {
    pub motor_id: u8,
    pub triggered: bool,
    pub pin: u8,
}

/// Everything the host can ask of the firmware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum McuRequest {
    InitMotor {
        motor_id: u8,
        pulse_pin: u8,
        dir_pin: u8,
        limit_pin: u8,
    },
    Step {
        motor_id: u8,
        direction: Direction,
        steps: u32,
        delay_us: u32,
        respect_limit: bool,
    },
    HomeMotor {
        motor_id: u8,
        direction: Direction,
        delay_us: u32,
        max_steps: u32,
    },
    HomeAll {
        direction: Direction,
        delay_us: u32,
        max_steps: u32,
    },
    MoveBatch {
        respect_limits: bool,
        movements: Vec<BatchMovement>,
    },
    GetLimits,
    Stop {
        motor_id: u8,
    },
    StopAll,
    Ping,
}

impl McuRequest {
    /// The command tag, for logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            McuRequest::InitMotor { .. } => "init_motor",
            McuRequest::Step { .. } => "step",
            McuRequest::HomeMotor { .. } => "home_motor",
            McuRequest::HomeAll { .. } => "home_all",
            McuRequest::MoveBatch { .. } => "move_batch",
            McuRequest::GetLimits => "get_limits",
            McuRequest::Stop { .. } => "stop",
            McuRequest::StopAll => "stop_all",
            McuRequest::Ping => "ping",
        }
    }
}

/// Payload of a `status: "ok"` reply; shape depends on the command answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OkPayload {
    Step {
        steps_executed: u32,
        limit_triggered: bool,
    },
    Home {
        steps_to_home: u32,
        homed: bool,
    },
    HomeAll {
        steps_to_home: Vec<u32>,
        homed: Vec<bool>,
    },
    Batch {
        results: Vec<BatchResult>,
    },
    Limits {
        limits: Vec<LimitState>,
    },
    Empty {},
}

/// Everything the firmware can answer with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum McuResponse {
    Ok(OkPayload),
    Error { message: String },
    Ready,
    Pong,
}

/// Serialize a request as one wire frame (JSON + newline).
pub fn encode_frame(request: &McuRequest) -> Result<String, TransportError> {
    let mut frame = serde_json::to_string(request)
        .map_err(|e| TransportError::BadFrame(format!("encoding {}: {e}", request.name())))?;
    frame.push('\n');
    Ok(frame)
}

/// Parse one reply line. Unknown status tags and malformed JSON are hard
/// errors.
pub fn decode_reply(line: &str) -> Result<McuResponse, TransportError> {
    serde_json::from_str(line.trim())
        .map_err(|e| TransportError::BadFrame(format!("{e}: {:?}", line.trim())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_request_matches_the_wire_format() {
        let req = McuRequest::Step {
            motor_id: 1,
            direction: Direction::Cw,
            steps: 400,
            delay_us: 1000,
            respect_limit: true,
        };
        let value: serde_json::Value = serde_json::from_str(encode_frame(&req).unwrap().trim()).unwrap();
        assert_eq!(
            value,
            json!({
                "cmd": "step",
                "motor_id": 1,
                "direction": 1,
                "steps": 400,
                "delay_us": 1000,
                "respect_limit": true,
            })
        );
    }

    #[test]
    fn init_motor_carries_the_pin_assignment() {
        let req = McuRequest::InitMotor {
            motor_id: 3,
            pulse_pin: 6,
            dir_pin: 7,
            limit_pin: 12,
        };
        let value: serde_json::Value = serde_json::from_str(encode_frame(&req).unwrap().trim()).unwrap();
        assert_eq!(value["cmd"], "init_motor");
        assert_eq!(value["limit_pin"], 12);
    }

    #[test]
    fn replies_decode_by_payload_shape() {
        let step = decode_reply(r#"{"status":"ok","steps_executed":400,"limit_triggered":false}"#)
            .unwrap();
        assert_eq!(
            step,
            McuResponse::Ok(OkPayload::Step {
                steps_executed: 400,
                limit_triggered: false
            })
        );

        let home = decode_reply(r#"{"status":"ok","steps_to_home":812,"homed":true}"#).unwrap();
        assert_eq!(
            home,
            McuResponse::Ok(OkPayload::Home {
                steps_to_home: 812,
                homed: true
            })
        );

        let batch = decode_reply(
            r#"{"status":"ok","results":[{"motor_id":1,"steps_executed":10,"limit_hit":false}]}"#,
        )
        .unwrap();
        assert!(matches!(batch, McuResponse::Ok(OkPayload::Batch { .. })));

        let pong = decode_reply(r#"{"status":"pong"}"#).unwrap();
        assert_eq!(pong, McuResponse::Pong);

        let err = decode_reply(r#"{"status":"error","message":"bad motor"}"#).unwrap();
        assert_eq!(
            err,
            McuResponse::Error {
                message: "bad motor".into()
            }
        );
    }

    #[test]
    fn unknown_tags_are_hard_errors() {
        assert!(decode_reply(r#"{"status":"wat"}"#).is_err());
        assert!(decode_reply("not json at all").is_err());
        assert!(serde_json::from_str::<McuRequest>(r#"{"cmd":"led_test"}"#).is_err());
    }

    #[test]
    fn requests_round_trip() {
        let reqs = vec![
            McuRequest::Ping,
            McuRequest::StopAll,
            McuRequest::GetLimits,
            McuRequest::HomeAll {
                direction: Direction::Ccw,
                delay_us: 2000,
                max_steps: 10_000,
            },
            McuRequest::MoveBatch {
                respect_limits: true,
                movements: vec![BatchMovement {
                    motor_id: 2,
                    steps: 33,
                    direction: Direction::Ccw,
                    delay_us: 1500,
                }],
            },
        ];
        for req in reqs {
            let back: McuRequest = serde_json::from_str(encode_frame(&req).unwrap().trim()).unwrap();
            assert_eq!(back, req);
        }
    }
}
