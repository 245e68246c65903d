//! Quadtree tile codes.
//!
//! A code packs a path of 2-bit quadrant choices and its depth into one
//! `i64`. The depth lives in the low 5 bits; the quadrant chosen at level `i`
//! lives in bits `61 - 2i` and `62 - 2i`, so the first choice is the most
//! significant. With this layout integer ordering of codes is exactly the
//! preorder of the tiles they name: a parent sorts before its children and
//! quadrant 0 sorts before quadrant 3.
//!
//! ```rust
//! use qtsort::Quadtree;
//!
//! let qt: Quadtree = "ABD".parse()?;
//! assert_eq!(qt.depth(), 3);
//! assert_eq!(qt.parent().to_string(), "AB");
//! assert!(Quadtree::ROOT.is_ancestor_of(qt));
//! # Ok::<(), qtsort::QtSortError>(())
//! ```

use crate::error::{QtSortError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Deepest level a code can address before its path bits would run into the
/// depth field.
pub const MAX_DEPTH: u32 = 29;

const DEPTH_MASK: i64 = 31;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quadtree(i64);

impl Quadtree {
    /// The whole world: depth 0, empty path.
    pub const ROOT: Quadtree = Quadtree(0);

    /// Marker for "no location".
    pub const NULL: Quadtree = Quadtree(-1);

    pub const fn new(value: i64) -> Self {
        Quadtree(value)
    }

    pub const fn as_int(self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn depth(self) -> u32 {
        (self.0 & DEPTH_MASK) as u32
    }

    /// Non-negative, not deeper than [`MAX_DEPTH`], and no stray bits below
    /// the path.
    pub fn is_valid(self) -> bool {
        self.0 >= 0 && self.depth() <= MAX_DEPTH && self.round(self.depth()) == self
    }

    /// Quadrant (0-3) chosen at `level`. Only meaningful for
    /// `level < self.depth()`.
    #[inline]
    pub const fn quadrant(self, level: u32) -> usize {
        ((self.0 >> (61 - 2 * level)) & 3) as usize
    }

    /// Truncate the path to at most `level` choices.
    pub const fn round(self, level: u32) -> Self {
        if self.depth() < level {
            return self;
        }
        if level == 0 {
            return Quadtree::ROOT;
        }
        let shift = 63 - 2 * level;
        Quadtree(((self.0 >> shift) << shift) + level as i64)
    }

    /// The enclosing tile one level up. The root is its own parent.
    pub const fn parent(self) -> Self {
        let depth = self.depth();
        if depth == 0 {
            return self;
        }
        self.round(depth - 1)
    }

    /// The tile one level down in quadrant `q`.
    pub fn child(self, q: usize) -> Result<Self> {
        let depth = self.depth();
        if q > 3 {
            return Err(QtSortError::InvalidInput(format!("quadrant {} out of range", q)));
        }
        if depth >= MAX_DEPTH {
            return Err(QtSortError::Structural(format!(
                "{} is already at the maximum depth",
                self
            )));
        }
        let path = self.0 & !DEPTH_MASK;
        Ok(Quadtree(
            path + ((q as i64) << (61 - 2 * depth)) + depth as i64 + 1,
        ))
    }

    /// True if `self`'s path is a prefix of `other`'s (a tile is its own
    /// ancestor).
    pub fn is_ancestor_of(self, other: Quadtree) -> bool {
        self.depth() <= other.depth() && other.round(self.depth()) == self
    }

    /// Deepest tile containing both codes. `NULL` acts as the identity.
    pub fn common(self, other: Quadtree) -> Self {
        if self == Quadtree::NULL {
            return other;
        }
        if other == Quadtree::NULL || self == other {
            return self;
        }
        let depth = self.depth().min(other.depth());
        let mut result = Quadtree::ROOT;
        for level in 1..=depth {
            let q = self.round(level);
            if q != other.round(level) {
                break;
            }
            result = q;
        }
        result
    }

    /// Build a code from tile column `x`, row `y` and zoom `z`.
    pub fn from_tuple(x: i64, y: i64, z: u32) -> Result<Self> {
        if z > MAX_DEPTH {
            return Err(QtSortError::InvalidInput(format!("zoom {} too deep", z)));
        }
        if x < 0 || y < 0 || x >= (1 << z) || y >= (1 << z) {
            return Err(QtSortError::InvalidInput(format!(
                "tile {}/{}/{} out of range",
                x, y, z
            )));
        }
        let mut value = 0i64;
        for i in 0..z {
            let shift = z - 1 - i;
            let q = ((x >> shift) & 1) | (((y >> shift) & 1) << 1);
            value |= q << (61 - 2 * i);
        }
        Ok(Quadtree(value + z as i64))
    }

    /// Inverse of [`Quadtree::from_tuple`]: `(x, y, z)`.
    pub fn as_tuple(self) -> (i64, i64, u32) {
        let z = self.depth();
        let (mut x, mut y) = (0i64, 0i64);
        for i in 0..z {
            let q = self.quadrant(i) as i64;
            x = (x << 1) | (q & 1);
            y = (y << 1) | ((q >> 1) & 1);
        }
        (x, y, z)
    }
}

impl fmt::Display for Quadtree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 0 {
            return f.write_str("NULL");
        }
        for level in 0..self.depth().min(MAX_DEPTH) {
            let c = (b'A' + self.quadrant(level) as u8) as char;
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Quadtree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Quadtree({} \"{}\")", self.0, self)
    }
}

impl FromStr for Quadtree {
    type Err = QtSortError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "NULL" {
            return Ok(Quadtree::NULL);
        }
        let mut qt = Quadtree::ROOT;
        for c in s.chars() {
            let q = match c {
                'A'..='D' => c as usize - 'A' as usize,
                _ => {
                    return Err(QtSortError::InvalidInput(format!(
                        "invalid quadtree string {:?}",
                        s
                    )));
                }
            };
            qt = qt.child(q)?;
        }
        Ok(qt)
    }
}

impl From<Quadtree> for i64 {
    fn from(qt: Quadtree) -> Self {
        qt.0
    }
}
