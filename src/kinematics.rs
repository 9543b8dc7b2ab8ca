//! Pure unit conversions between the well grid and axis step counts.
//!
//! Every mm/mL number in the system crosses into steps here and nowhere
//! else, so the rounding policy lives in one place: conversions floor at the
//! boundary, never per step. Well A1 sits at the X/Y origin; Z counts grow
//! downward from the safe travel plane; plunger counts grow with loaded
//! volume.

use crate::config::SamplerConfig;
use crate::error::{ControlError, ControlResult, LogicFault, MotionFault};
use crate::position::Axis;
use crate::well::{WellId, COLUMN_COUNT, ROW_COUNT};

/// Conversion functions bound to one config snapshot.
///
/// Deterministic and side-effect free; a job builds one of these from its
/// config snapshot at start and keeps it for the whole run.
#[derive(Debug, Clone)]
pub struct Kinematics {
    config: SamplerConfig,
}

impl Kinematics {
    pub fn new(config: SamplerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Absolute X/Y step target for a well center.
    pub fn well_to_xy(&self, well: WellId) -> (i64, i64) {
        let x_mm = well.column_index() as f64 * self.config.well_spacing;
        let y_mm = well.row_index() as f64 * self.config.well_spacing;
        (
            (x_mm * self.config.steps_per_mm_x).floor() as i64,
            (y_mm * self.config.steps_per_mm_y).floor() as i64,
        )
    }

    /// Inverse of `well_to_xy`: which well sits at these step counts.
    ///
    /// Returns `None` when the position is not on a well center (or off the
    /// plate entirely).
    pub fn xy_to_well(&self, x_steps: i64, y_steps: i64) -> Option<WellId> {
        let pitch_x = self.config.well_spacing * self.config.steps_per_mm_x;
        let pitch_y = self.config.well_spacing * self.config.steps_per_mm_y;
        let col_index = (x_steps as f64 / pitch_x).round() as i64;
        let row_index = (y_steps as f64 / pitch_y).round() as i64;
        if !(0..ROW_COUNT as i64).contains(&row_index)
            || !(0..COLUMN_COUNT as i64).contains(&col_index)
        {
            return None;
        }
        let well = WellId::new(row_index as u8, col_index as u8 + 1).ok()?;
        // only report a well when we are actually on its center
        if self.well_to_xy(well) == (x_steps, y_steps) {
            Some(well)
        } else {
            None
        }
    }

    /// Z step target for a tip depth below the well rim.
    ///
    /// The Z count is the distance below the safe plane, so the safe height
    /// itself is step 0 and a depth of `d` mm lands at
    /// `(safe_height + d) * steps_per_mm_z`.
    pub fn z_for(&self, depth_mm: f64) -> i64 {
        ((self.config.safe_height + depth_mm) * self.config.steps_per_mm_z).floor() as i64
    }

    /// Plunger steps for a liquid volume.
    pub fn volume_to_pipette_steps(&self, volume_ml: f64) -> i64 {
        (volume_ml * self.config.pipette_steps_per_ml).floor() as i64
    }

    /// Inverse of `volume_to_pipette_steps`, for reporting loaded volume.
    pub fn pipette_steps_to_volume(&self, steps: i64) -> f64 {
        steps as f64 / self.config.pipette_steps_per_ml
    }

    /// Largest legal step count per axis.
    pub fn envelope_max(&self, axis: Axis) -> i64 {
        match axis {
            Axis::X => {
                ((COLUMN_COUNT - 1) as f64 * self.config.well_spacing * self.config.steps_per_mm_x)
                    .floor() as i64
            }
            Axis::Y => {
                ((ROW_COUNT - 1) as f64 * self.config.well_spacing * self.config.steps_per_mm_y)
                    .floor() as i64
            }
            Axis::Z => {
                ((self.config.safe_height + self.config.well_height)
                    * self.config.steps_per_mm_z)
                    .floor() as i64
            }
            Axis::Pipette => {
                (self.config.pipette_capacity_ml * self.config.pipette_steps_per_ml).floor()
                    as i64
            }
        }
    }

    /// Reject targets outside the configured travel.
    pub fn clamp_to_envelope(&self, axis: Axis, target_steps: i64) -> ControlResult<i64> {
        let max = self.envelope_max(axis);
        if target_steps < 0 || target_steps > max {
            return Err(ControlError::MotionFault(MotionFault::OutOfEnvelope {
                axis,
                steps: target_steps,
                max,
            }));
        }
        Ok(target_steps)
    }

    /// Validate the head geometry for a commanded well.
    ///
    /// With one pipette any well is fine. With three, the commanded well is
    /// the center of a column triple and both neighbours must exist; the
    /// head is then positioned at the center well, so the X/Y target is
    /// unchanged.
    pub fn check_head_geometry(&self, well: WellId, pipette_count: u8) -> ControlResult<()> {
        match pipette_count {
            1 => Ok(()),
            3 => well
                .triple_columns()
                .map(|_| ())
                .map_err(|e| match e {
                    ControlError::Validation(msg) => {
                        ControlError::LogicFault(LogicFault::InvalidGeometry(msg))
                    }
                    other => other,
                }),
            other => Err(ControlError::Validation(format!(
                "pipette count must be 1 or 3, got {other}"
            ))),
        }
    }
}
