//! Well identifiers on the 96-position plate.
//!
//! A well is addressed by row `A..H` and column `1..12`; the canonical text
//! form is the concatenation (`A1`, `H12`). Parsing is strict — anything
//! outside the plate is rejected before it can reach the motion layer.

use crate::error::ControlError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const ROW_COUNT: u8 = 8;
pub const COLUMN_COUNT: u8 = 12;

/// One reservoir on the plate.
///
/// Stored as a zero-based row index and a one-based column number, matching
/// the printed plate labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WellId {
    row: u8,
    col: u8,
}

impl WellId {
    /// The origin well: X/Y home lands the head here.
    pub const A1: WellId = WellId { row: 0, col: 1 };

    /// Build from a zero-based row index and one-based column number.
    pub fn new(row_index: u8, column: u8) -> Result<Self, ControlError> {
        if row_index >= ROW_COUNT {
            return Err(ControlError::Validation(format!(
                "row index {row_index} out of range (plate has {ROW_COUNT} rows A-H)"
            )));
        }
        if column == 0 || column > COLUMN_COUNT {
            return Err(ControlError::Validation(format!(
                "column {column} out of range (plate has columns 1-{COLUMN_COUNT})"
            )));
        }
        Ok(Self {
            row: row_index,
            col: column,
        })
    }

    /// Zero-based row index (A = 0 .. H = 7).
    pub fn row_index(&self) -> u8 {
        self.row
    }

    /// Row letter as printed on the plate.
    pub fn row_char(&self) -> char {
        (b'A' + self.row) as char
    }

    /// One-based column number (1..=12).
    pub fn column(&self) -> u8 {
        self.col
    }

    /// Zero-based column index (column 1 = 0).
    pub fn column_index(&self) -> u8 {
        self.col - 1
    }

    /// The flanking columns a 3-pipette head covers when centered here.
    ///
    /// Fails when the triple would hang off either plate edge.
    pub fn triple_columns(&self) -> Result<[u8; 3], ControlError> {
        if self.col == 1 || self.col == COLUMN_COUNT {
            return Err(ControlError::Validation(format!(
                "well {self} cannot center a 3-pipette head (needs columns {}..{} on the plate)",
                self.col as i8 - 1,
                self.col + 1
            )));
        }
        Ok([self.col - 1, self.col, self.col + 1])
    }
}

impl fmt::Display for WellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.row_char(), self.col)
    }
}

impl FromStr for WellId {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut chars = s.chars();
        let row_char = chars
            .next()
            .ok_or_else(|| ControlError::Validation("empty well id".into()))?;
        let row_char = row_char.to_ascii_uppercase();
        if !('A'..='H').contains(&row_char) {
            return Err(ControlError::Validation(format!(
                "invalid row '{row_char}' in well id '{s}' (must be A-H)"
            )));
        }
        let col: u8 = chars.as_str().parse().map_err(|_| {
            ControlError::Validation(format!("invalid column in well id '{s}'"))
        })?;
        WellId::new(row_char as u8 - b'A', col)
    }
}

impl TryFrom<String> for WellId {
    type Error = ControlError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WellId> for String {
    fn from(well: WellId) -> Self {
        well.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_ids() {
        let a1: WellId = "A1".parse().unwrap();
        assert_eq!(a1.row_index(), 0);
        assert_eq!(a1.column(), 1);

        let h12: WellId = "H12".parse().unwrap();
        assert_eq!(h12.row_index(), 7);
        assert_eq!(h12.column(), 12);
        assert_eq!(h12.to_string(), "H12");

        // lower case is tolerated at the boundary
        assert_eq!("b3".parse::<WellId>().unwrap().to_string(), "B3");
    }

    #[test]
    fn rejects_off_plate_ids() {
        assert!("I1".parse::<WellId>().is_err());
        assert!("A0".parse::<WellId>().is_err());
        assert!("A13".parse::<WellId>().is_err());
        assert!("".parse::<WellId>().is_err());
        assert!("A".parse::<WellId>().is_err());
        assert!("1A".parse::<WellId>().is_err());
    }

    #[test]
    fn triple_needs_both_neighbours() {
        let b6: WellId = "B6".parse().unwrap();
        assert_eq!(b6.triple_columns().unwrap(), [5, 6, 7]);

        assert!("A1".parse::<WellId>().unwrap().triple_columns().is_err());
        assert!("A12".parse::<WellId>().unwrap().triple_columns().is_err());
    }

    #[test]
    fn serde_round_trips_as_text() {
        let well: WellId = "C7".parse().unwrap();
        let json = serde_json::to_string(&well).unwrap();
        assert_eq!(json, "\"C7\"");
        let back: WellId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, well);
    }
}
