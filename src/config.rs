//! Hardware configuration registry.
//!
//! The external web collaborator owns a flat `KEY=value` file with the
//! recognized keys below; this module parses, validates, and persists it,
//! and hands out immutable snapshots. A replacement snapshot is swapped in
//! atomically — a job that started under the old values keeps them until it
//! finishes.
//!
//! Defaults mirror the shipped machine: 4 mm well pitch, 100 steps/mm on all
//! linear axes, 1000 steps/mL syringe.

use crate::error::{ControlError, ControlResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};

/// The recognized configuration keys, in canonical file order.
pub const RECOGNIZED_KEYS: [&str; 14] = [
    "WELL_SPACING",
    "WELL_DIAMETER",
    "WELL_HEIGHT",
    "STEPS_PER_MM_X",
    "STEPS_PER_MM_Y",
    "STEPS_PER_MM_Z",
    "PIPETTE_STEPS_PER_ML",
    "PICKUP_DEPTH",
    "DROPOFF_DEPTH",
    "SAFE_HEIGHT",
    "RINSE_CYCLES",
    "TRAVEL_SPEED",
    "PIPETTE_SPEED",
    "PIPETTE_CAPACITY_ML",
];

/// One immutable set of hardware parameters.
///
/// Serialized with the canonical key names so the web layer's
/// `GET /config` body matches the file the operator edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct SamplerConfig {
    /// Center-to-center well pitch (mm).
    pub well_spacing: f64,
    /// Well bore diameter (mm).
    pub well_diameter: f64,
    /// Well depth from rim to bottom (mm).
    pub well_height: f64,
    pub steps_per_mm_x: f64,
    pub steps_per_mm_y: f64,
    pub steps_per_mm_z: f64,
    /// Plunger steps to move one milliliter.
    pub pipette_steps_per_ml: f64,
    /// How far below the rim the tip descends to aspirate (mm).
    pub pickup_depth: f64,
    /// How far below the rim the tip descends to dispense (mm).
    pub dropoff_depth: f64,
    /// Clearance above the rims at which X/Y travel is collision-free (mm).
    pub safe_height: f64,
    pub rinse_cycles: u32,
    /// Seconds per step during X/Y/Z travel.
    pub travel_speed: f64,
    /// Seconds per step while the plunger moves.
    pub pipette_speed: f64,
    /// Syringe capacity used by the overflow check (mL).
    pub pipette_capacity_ml: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            well_spacing: 4.0,
            well_diameter: 8.0,
            well_height: 14.0,
            steps_per_mm_x: 100.0,
            steps_per_mm_y: 100.0,
            steps_per_mm_z: 100.0,
            pipette_steps_per_ml: 1000.0,
            pickup_depth: 10.0,
            dropoff_depth: 5.0,
            safe_height: 20.0,
            rinse_cycles: 3,
            travel_speed: 0.001,
            pipette_speed: 0.002,
            pipette_capacity_ml: 10.0,
        }
    }
}

impl SamplerConfig {
    /// Check every value is usable. All keys must be strictly positive
    /// except `RINSE_CYCLES`, which may be zero.
    pub fn validate(&self) -> ControlResult<()> {
        let positives = [
            ("WELL_SPACING", self.well_spacing),
            ("WELL_DIAMETER", self.well_diameter),
            ("WELL_HEIGHT", self.well_height),
            ("STEPS_PER_MM_X", self.steps_per_mm_x),
            ("STEPS_PER_MM_Y", self.steps_per_mm_y),
            ("STEPS_PER_MM_Z", self.steps_per_mm_z),
            ("PIPETTE_STEPS_PER_ML", self.pipette_steps_per_ml),
            ("PICKUP_DEPTH", self.pickup_depth),
            ("DROPOFF_DEPTH", self.dropoff_depth),
            ("SAFE_HEIGHT", self.safe_height),
            ("TRAVEL_SPEED", self.travel_speed),
            ("PIPETTE_SPEED", self.pipette_speed),
            ("PIPETTE_CAPACITY_ML", self.pipette_capacity_ml),
        ];
        for (key, value) in positives {
            if !value.is_finite() || value <= 0.0 {
                return Err(ControlError::Validation(format!(
                    "{key} must be strictly positive, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Assign one key from its textual value.
    pub fn set_key(&mut self, key: &str, value: &str) -> ControlResult<()> {
        let parse_f64 = |v: &str| -> ControlResult<f64> {
            v.trim().parse().map_err(|_| {
                ControlError::Validation(format!("{key}: '{v}' is not a number"))
            })
        };
        match key {
            "WELL_SPACING" => self.well_spacing = parse_f64(value)?,
            "WELL_DIAMETER" => self.well_diameter = parse_f64(value)?,
            "WELL_HEIGHT" => self.well_height = parse_f64(value)?,
            "STEPS_PER_MM_X" => self.steps_per_mm_x = parse_f64(value)?,
            "STEPS_PER_MM_Y" => self.steps_per_mm_y = parse_f64(value)?,
            "STEPS_PER_MM_Z" => self.steps_per_mm_z = parse_f64(value)?,
            "PIPETTE_STEPS_PER_ML" => self.pipette_steps_per_ml = parse_f64(value)?,
            "PICKUP_DEPTH" => self.pickup_depth = parse_f64(value)?,
            "DROPOFF_DEPTH" => self.dropoff_depth = parse_f64(value)?,
            "SAFE_HEIGHT" => self.safe_height = parse_f64(value)?,
            "RINSE_CYCLES" => {
                self.rinse_cycles = value.trim().parse().map_err(|_| {
                    ControlError::Validation(format!(
                        "RINSE_CYCLES: '{value}' is not a non-negative integer"
                    ))
                })?
            }
            "TRAVEL_SPEED" => self.travel_speed = parse_f64(value)?,
            "PIPETTE_SPEED" => self.pipette_speed = parse_f64(value)?,
            "PIPETTE_CAPACITY_ML" => self.pipette_capacity_ml = parse_f64(value)?,
            other => {
                return Err(ControlError::Validation(format!(
                    "unrecognized configuration key '{other}'"
                )))
            }
        }
        Ok(())
    }

    fn key_value(&self, key: &str) -> String {
        match key {
            "WELL_SPACING" => self.well_spacing.to_string(),
            "WELL_DIAMETER" => self.well_diameter.to_string(),
            "WELL_HEIGHT" => self.well_height.to_string(),
            "STEPS_PER_MM_X" => self.steps_per_mm_x.to_string(),
            "STEPS_PER_MM_Y" => self.steps_per_mm_y.to_string(),
            "STEPS_PER_MM_Z" => self.steps_per_mm_z.to_string(),
            "PIPETTE_STEPS_PER_ML" => self.pipette_steps_per_ml.to_string(),
            "PICKUP_DEPTH" => self.pickup_depth.to_string(),
            "DROPOFF_DEPTH" => self.dropoff_depth.to_string(),
            "SAFE_HEIGHT" => self.safe_height.to_string(),
            "RINSE_CYCLES" => self.rinse_cycles.to_string(),
            "TRAVEL_SPEED" => self.travel_speed.to_string(),
            "PIPETTE_SPEED" => self.pipette_speed.to_string(),
            "PIPETTE_CAPACITY_ML" => self.pipette_capacity_ml.to_string(),
            _ => unreachable!("key_value called with unrecognized key"),
        }
    }

    /// Parse the collaborator's `KEY=value` format. Unknown keys are hard
    /// errors, not warnings.
    pub fn from_key_values(text: &str) -> ControlResult<Self> {
        let mut config = SamplerConfig::default();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                ControlError::Validation(format!(
                    "config line {}: expected KEY=value, got '{line}'",
                    lineno + 1
                ))
            })?;
            config.set_key(key.trim(), value)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Render the canonical `KEY=value` file body.
    pub fn to_key_values(&self) -> String {
        let mut out = String::new();
        for key in RECOGNIZED_KEYS {
            out.push_str(key);
            out.push('=');
            out.push_str(&self.key_value(key));
            out.push('\n');
        }
        out
    }

    pub fn load(path: &Path) -> ControlResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ControlError::Validation(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_key_values(&text)
    }

    pub fn save(&self, path: &Path) -> ControlResult<()> {
        std::fs::write(path, self.to_key_values()).map_err(|e| {
            ControlError::Validation(format!("cannot write config {}: {e}", path.display()))
        })
    }

    /// Apply environment-variable overrides for any recognized key that is
    /// set, then re-validate. The original deployment configured the machine
    /// entirely through the environment; this keeps that working.
    pub fn apply_env_overrides(&mut self) -> ControlResult<()> {
        for key in RECOGNIZED_KEYS {
            if let Ok(value) = std::env::var(key) {
                self.set_key(key, &value)?;
            }
        }
        self.validate()
    }

    /// Microseconds between travel step pulses.
    pub fn travel_delay_us(&self) -> u32 {
        (self.travel_speed * 1_000_000.0) as u32
    }

    /// Microseconds between plunger step pulses.
    pub fn pipette_delay_us(&self) -> u32 {
        (self.pipette_speed * 1_000_000.0) as u32
    }
}

/// Shared handle publishing config snapshots.
///
/// Writers build a full replacement and swap the `Arc`; readers clone the
/// `Arc` once and keep it for as long as their job runs.
#[derive(Clone)]
pub struct ConfigStore {
    current: Arc<RwLock<Arc<SamplerConfig>>>,
}

impl ConfigStore {
    pub fn new(config: SamplerConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// The current snapshot. Cheap; safe to call from any context.
    pub fn snapshot(&self) -> Arc<SamplerConfig> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Validate and atomically publish a replacement snapshot.
    pub fn replace(&self, config: SamplerConfig) -> ControlResult<()> {
        config.validate()?;
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(config);
        Ok(())
    }
}
