use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Three-dimensional launch extent (grid or block shape).
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dim {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse dimension {value:?}")]
    Parse {
        value: String,
        source: Option<std::num::ParseIntError>,
    },
}

static DIM_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\(?\s*(\d+)\s*(?:,\s*(\d+)\s*)?(?:,\s*(\d+)\s*)?\)?\s*$")
        .expect("valid dimension regex")
});

impl std::str::FromStr for Dim {
    type Err = Error;

    /// Parses `x`, `(x,y)` or `(x,y,z)`; omitted components default to one.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parse_error = |source| Error::Parse {
            value: value.to_string(),
            source,
        };
        let captures = DIM_REGEX.captures(value).ok_or_else(|| parse_error(None))?;
        let component = |i: usize| -> Result<u32, Error> {
            match captures.get(i) {
                Some(m) => m.as_str().parse().map_err(|err| parse_error(Some(err))),
                None => Ok(1),
            }
        };
        Ok(Self {
            x: component(1)?,
            y: component(2)?,
            z: component(3)?,
        })
    }
}

impl Default for Dim {
    fn default() -> Self {
        Self::ONE
    }
}

impl Dim {
    pub const ONE: Self = Self { x: 1, y: 1, z: 1 };
    pub const ZERO: Self = Self { x: 0, y: 0, z: 0 };

    #[must_use]
    #[inline]
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Total number of points covered by this extent.
    #[must_use]
    #[inline]
    pub fn size(&self) -> u64 {
        u64::from(self.x) * u64::from(self.y) * u64::from(self.z)
    }

    #[must_use]
    #[inline]
    pub fn into_tuple(self) -> (u32, u32, u32) {
        (self.x, self.y, self.z)
    }

    /// Iterate over all points in x-major order (x varies fastest).
    #[must_use]
    pub fn points(&self) -> Iter {
        Iter {
            bounds: *self,
            current: 0,
        }
    }
}

impl std::fmt::Display for Dim {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

impl From<u32> for Dim {
    fn from(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }
}

impl From<(u32, u32)> for Dim {
    fn from((x, y): (u32, u32)) -> Self {
        Self { x, y, z: 1 }
    }
}

impl From<(u32, u32, u32)> for Dim {
    fn from((x, y, z): (u32, u32, u32)) -> Self {
        Self { x, y, z }
    }
}

/// A coordinate inside a [`Dim`].
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Point {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub bounds: Dim,
}

impl Point {
    #[must_use]
    pub fn new(point: Dim, bounds: Dim) -> Self {
        Self {
            x: point.x,
            y: point.y,
            z: point.z,
            bounds,
        }
    }

    /// Linear index with x varying fastest.
    #[must_use]
    pub fn id(&self) -> u64 {
        let bx = u64::from(self.bounds.x);
        let by = u64::from(self.bounds.y);
        u64::from(self.x) + bx * u64::from(self.y) + bx * by * u64::from(self.z)
    }

    #[must_use]
    pub fn to_dim(&self) -> Dim {
        Dim::new(self.x, self.y, self.z)
    }
}

impl std::fmt::Display for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

/// Iterates over the points of a [`Dim`].
#[derive(Debug, Clone)]
pub struct Iter {
    bounds: Dim,
    current: u64,
}

impl Iterator for Iter {
    type Item = Point;

    #[allow(clippy::cast_possible_truncation)]
    fn next(&mut self) -> Option<Self::Item> {
        let Self { bounds, current } = self;
        if *current >= bounds.size() {
            return None;
        }
        let bx = u64::from(bounds.x);
        let by = u64::from(bounds.y);
        let x = *current % bx;
        let y = (*current / bx) % by;
        let z = *current / (bx * by);
        self.current += 1;
        Some(Point {
            x: x as u32,
            y: y as u32,
            z: z as u32,
            bounds: *bounds,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining =
            usize::try_from(self.bounds.size().saturating_sub(self.current)).unwrap_or(usize::MAX);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Iter {}

impl IntoIterator for Dim {
    type Item = Point;
    type IntoIter = Iter;

    fn into_iter(self) -> Self::IntoIter {
        self.points()
    }
}
