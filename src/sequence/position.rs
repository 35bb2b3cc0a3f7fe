//! Table positions.

use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// A 3D table position. Any NaN component marks the position as unset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// X coordinate
    pub x: f64,
    /// Y coordinate
    pub y: f64,
    /// Z coordinate
    pub z: f64,
}

impl Position {
    /// Create a position.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// A position with every component unset.
    pub const fn unset() -> Self {
        Self::new(f64::NAN, f64::NAN, f64::NAN)
    }

    /// True if no component is NaN.
    pub fn is_valid(&self) -> bool {
        !(self.x.is_nan() || self.y.is_nan() || self.z.is_nan())
    }

    /// The same position raised by `offset` along z.
    pub fn with_z_offset(self, offset: f64) -> Self {
        Self::new(self.x, self.y, self.z + offset)
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::unset()
    }
}

impl From<(f64, f64, f64)> for Position {
    fn from((x, y, z): (f64, f64, f64)) -> Self {
        Self::new(x, y, z)
    }
}

impl Add for Position {
    type Output = Position;

    fn add(self, rhs: Position) -> Position {
        Position::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Position {
    type Output = Position;

    fn sub(self, rhs: Position) -> Position {
        Position::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
    }
}
