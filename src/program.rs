//! Declarative pipetting programs.
//!
//! A program is an ordered list of steps; each step names its wells, the
//! sample volume, and how the transfer block repeats. Everything is checked
//! here, at the boundary, so the executor never sees an impossible step.

use crate::config::SamplerConfig;
use crate::error::{ControlError, ControlResult, LogicFault};
use crate::well::WellId;
use serde::{Deserialize, Serialize};

/// Largest volume a single step may move, regardless of syringe capacity.
pub const MAX_SAMPLE_VOLUME_ML: f64 = 10.0;

/// How a step's transfer block repeats.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode")]
pub enum Repetition {
    /// Run the block `count` times back-to-back.
    #[serde(rename = "quantity")]
    Quantity { count: u32 },
    /// Fire the block at each multiple of `interval_s` until `duration_s`
    /// has elapsed. Late firings are skipped, never bunched.
    #[serde(rename = "timeFrequency")]
    Time { interval_s: u64, duration_s: u64 },
}

impl Default for Repetition {
    fn default() -> Self {
        Repetition::Quantity { count: 1 }
    }
}

fn default_cycles() -> u32 {
    1
}

fn default_pipette_count() -> u8 {
    1
}

/// One step of a pipetting program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramStep {
    pub pickup_well: WellId,
    #[serde(default)]
    pub dropoff_well: Option<WellId>,
    #[serde(default)]
    pub rinse_well: Option<WellId>,
    pub sample_volume_ml: f64,
    #[serde(default)]
    pub wait_seconds: u64,
    #[serde(default = "default_cycles")]
    pub cycles: u32,
    #[serde(default = "default_pipette_count")]
    pub pipette_count: u8,
    #[serde(default)]
    pub repetition: Repetition,
}

impl ProgramStep {
    /// The wells this step touches, in visiting order.
    pub fn wells(&self) -> impl Iterator<Item = WellId> + '_ {
        std::iter::once(self.pickup_well)
            .chain(self.dropoff_well)
            .chain(self.rinse_well)
    }

    pub fn validate(&self, config: &SamplerConfig) -> ControlResult<()> {
        if !self.sample_volume_ml.is_finite() || self.sample_volume_ml <= 0.0 {
            return Err(ControlError::Validation(format!(
                "sample volume must be positive, got {}",
                self.sample_volume_ml
            )));
        }
        if self.sample_volume_ml > MAX_SAMPLE_VOLUME_ML {
            return Err(ControlError::Validation(format!(
                "sample volume {} mL exceeds the {MAX_SAMPLE_VOLUME_ML} mL maximum",
                self.sample_volume_ml
            )));
        }
        if self.sample_volume_ml > config.pipette_capacity_ml {
            return Err(ControlError::Validation(format!(
                "sample volume {} mL exceeds the syringe capacity of {} mL",
                self.sample_volume_ml, config.pipette_capacity_ml
            )));
        }
        if self.cycles == 0 {
            return Err(ControlError::Validation("cycles must be at least 1".into()));
        }
        match self.pipette_count {
            1 => {}
            3 => {
                // the 3-pipette head must fit at every well this step visits
                for well in self.wells() {
                    well.triple_columns().map_err(|e| match e {
                        ControlError::Validation(msg) => {
                            ControlError::LogicFault(LogicFault::InvalidGeometry(msg))
                        }
                        other => other,
                    })?;
                }
            }
            other => {
                return Err(ControlError::Validation(format!(
                    "pipette count must be 1 or 3, got {other}"
                )))
            }
        }
        match self.repetition {
            Repetition::Quantity { count } => {
                if count == 0 {
                    return Err(ControlError::Validation(
                        "repetition count must be at least 1".into(),
                    ));
                }
            }
            Repetition::Time {
                interval_s,
                duration_s,
            } => {
                if interval_s == 0 {
                    return Err(ControlError::Validation(
                        "repetition interval must be positive".into(),
                    ));
                }
                if duration_s < interval_s {
                    return Err(ControlError::Validation(format!(
                        "repetition duration {duration_s}s is shorter than the interval {interval_s}s"
                    )));
                }
            }
        }
        // a step that only picks up would end the job with liquid still
        // loaded; somewhere to put it down is required
        if self.dropoff_well.is_none() && self.rinse_well.is_none() {
            return Err(ControlError::Validation(
                "step needs a dropoff well or a rinse well".into(),
            ));
        }
        Ok(())
    }
}

/// An ordered pipetting program, as posted by the web layer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Program {
    pub steps: Vec<ProgramStep>,
}

impl Program {
    pub fn validate(&self, config: &SamplerConfig) -> ControlResult<()> {
        for (i, step) in self.steps.iter().enumerate() {
            step.validate(config)
                .map_err(|e| match e {
                    ControlError::Validation(msg) => {
                        ControlError::Validation(format!("step {}: {msg}", i + 1))
                    }
                    other => other,
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_step() -> ProgramStep {
        ProgramStep {
            pickup_well: "A1".parse().unwrap(),
            dropoff_well: Some("A2".parse().unwrap()),
            rinse_well: Some("A3".parse().unwrap()),
            sample_volume_ml: 0.5,
            wait_seconds: 0,
            cycles: 1,
            pipette_count: 1,
            repetition: Repetition::Quantity { count: 1 },
        }
    }

    #[test]
    fn valid_step_passes() {
        base_step().validate(&SamplerConfig::default()).unwrap();
    }

    #[test]
    fn volume_bounds_are_enforced() {
        let config = SamplerConfig::default();
        let mut step = base_step();
        step.sample_volume_ml = 0.0;
        assert!(step.validate(&config).is_err());
        step.sample_volume_ml = 10.5;
        assert!(step.validate(&config).is_err());

        let mut small_syringe = config.clone();
        small_syringe.pipette_capacity_ml = 1.0;
        step.sample_volume_ml = 2.0;
        assert!(step.validate(&small_syringe).is_err());
    }

    #[test]
    fn three_pipette_head_rejects_edge_columns() {
        let config = SamplerConfig::default();
        let mut step = base_step();
        step.pipette_count = 3;
        step.pickup_well = "A1".parse().unwrap();
        let err = step.validate(&config).unwrap_err();
        assert!(matches!(
            err,
            ControlError::LogicFault(LogicFault::InvalidGeometry(_))
        ));

        step.pickup_well = "A2".parse().unwrap();
        step.dropoff_well = Some("B6".parse().unwrap());
        step.rinse_well = Some("C11".parse().unwrap());
        step.validate(&config).unwrap();
    }

    #[test]
    fn time_mode_needs_a_sane_window() {
        let config = SamplerConfig::default();
        let mut step = base_step();
        step.repetition = Repetition::Time {
            interval_s: 0,
            duration_s: 10,
        };
        assert!(step.validate(&config).is_err());
        step.repetition = Repetition::Time {
            interval_s: 5,
            duration_s: 4,
        };
        assert!(step.validate(&config).is_err());
        step.repetition = Repetition::Time {
            interval_s: 2,
            duration_s: 7,
        };
        step.validate(&config).unwrap();
    }

    #[test]
    fn somewhere_to_put_the_sample_is_required() {
        let config = SamplerConfig::default();
        let mut step = base_step();
        step.dropoff_well = None;
        step.rinse_well = None;
        assert!(step.validate(&config).is_err());

        step.rinse_well = Some("H12".parse().unwrap());
        step.validate(&config).unwrap();
    }

    #[test]
    fn program_errors_name_the_offending_step() {
        let config = SamplerConfig::default();
        let mut bad = base_step();
        bad.cycles = 0;
        let program = Program {
            steps: vec![base_step(), bad],
        };
        match program.validate(&config).unwrap_err() {
            ControlError::Validation(msg) => assert!(msg.starts_with("step 2:")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn repetition_deserializes_from_the_ui_tags() {
        let q: Repetition = serde_json::from_str(r#"{"mode":"quantity","count":3}"#).unwrap();
        assert_eq!(q, Repetition::Quantity { count: 3 });
        let t: Repetition =
            serde_json::from_str(r#"{"mode":"timeFrequency","interval_s":2,"duration_s":7}"#)
                .unwrap();
        assert_eq!(
            t,
            Repetition::Time {
                interval_s: 2,
                duration_s: 7
            }
        );
        assert!(serde_json::from_str::<Repetition>(r#"{"mode":"forever"}"#).is_err());
    }
}
