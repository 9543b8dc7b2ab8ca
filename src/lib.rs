//! # Plate Sampler Core Library
//!
//! Motion-control core for a 96-well-plate laboratory pipetting sampler. The
//! crate turns declarative pipetting programs — ordered steps of pickup,
//! dispense and rinse operations over the well grid — into timed stepper
//! commands for the real-time MCU, while exposing the status and log surface
//! an external web UI polls. The web/REST layer itself lives outside this
//! crate and embeds [`controller::Sampler`].
//!
//! ## Crate Structure
//!
//! - **`config`**: the recognized hardware parameters, their `KEY=value`
//!   file format, and the snapshot-swap store.
//! - **`controller`**: the `Sampler` control surface — motion lock, job
//!   lifecycle, cancellation, and every UI entry point.
//! - **`error`**: the `ControlError` taxonomy and its HTTP mapping.
//! - **`executor`**: the pipetting step state machine and its primitives.
//! - **`kinematics`**: pure conversions between wells/mm/mL and axis steps.
//! - **`logring`**: the bounded operator log the UI polls.
//! - **`motor`**: the typed motor client over the MCU channel.
//! - **`position`**: axis vocabulary and the authoritative position record.
//! - **`program`**: pipetting program types and boundary validation.
//! - **`protocol`**: the newline-JSON wire types spoken to the firmware.
//! - **`status`**: execution states and the lock-free status board.
//! - **`transport`**: framed channel implementations (serial and mock) plus
//!   the reconnect policy.
//! - **`well`**: plate well identifiers.

pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod kinematics;
pub mod logring;
pub mod motor;
pub mod position;
pub mod program;
pub mod protocol;
pub mod status;
pub mod transport;
pub mod well;

pub use config::SamplerConfig;
pub use controller::Sampler;
pub use error::{ControlError, ControlResult};
pub use program::{Program, ProgramStep, Repetition};
pub use well::WellId;
