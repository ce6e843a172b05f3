//! Parameter space primitives: sweep axes, mixed-radix grid enumeration and
//! the Sobol low-discrepancy sequence.
//!
//! Nothing in this module performs I/O; the strategy layer turns the indices
//! and sample points produced here into task configurations.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigurationError;

/// A named configuration entry with an explicit list of values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    /// Dotted path of the configuration entry
    pub key: String,
    /// Values in declaration order
    pub values: Vec<Value>,
}

impl Axis {
    pub fn new(key: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            key: key.into(),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A continuous interval sampled by the Sobol strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub key: String,
    pub low: f64,
    pub high: f64,
}

impl Range {
    pub fn new(key: impl Into<String>, low: f64, high: f64) -> Self {
        Self {
            key: key.into(),
            low,
            high,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !self.low.is_finite() || !self.high.is_finite() || self.low >= self.high {
            return Err(ConfigurationError::InvalidBounds {
                key: self.key.clone(),
                low: self.low,
                high: self.high,
            });
        }
        Ok(())
    }

    /// Map a unit-interval coordinate onto this range
    pub fn scale(&self, unit: f64) -> f64 {
        self.low + (self.high - self.low) * unit
    }
}

// ============================================================================
// Mixed-radix grid
// ============================================================================

/// Mixed-radix index space of a matrix sweep.
///
/// A position holds one value index per axis; the first axis varies slowest,
/// so the ordinal of a position is its rank in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    shape: Vec<usize>,
    /// Ordinal step of each axis
    steps: Vec<usize>,
}

impl Grid {
    pub fn new(shape: &[usize]) -> Self {
        let mut steps = vec![0; shape.len()];
        let mut step = 1;
        for (slot, &len) in steps.iter_mut().zip(shape).rev() {
            *slot = step;
            step *= len;
        }
        Self {
            shape: shape.to_vec(),
            steps,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of positions; an axis-less grid has exactly one
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Axis indices of the position ranked `ordinal`
    pub fn position(&self, ordinal: usize) -> Option<Vec<usize>> {
        (ordinal < self.len()).then(|| {
            self.shape
                .iter()
                .zip(&self.steps)
                .map(|(&len, &step)| ordinal / step % len)
                .collect()
        })
    }

    /// Rank of a position, `None` when it lies outside the grid
    pub fn ordinal(&self, position: &[usize]) -> Option<usize> {
        if position.len() != self.shape.len()
            || position.iter().zip(&self.shape).any(|(idx, len)| idx >= len)
        {
            return None;
        }
        Some(position.iter().zip(&self.steps).map(|(idx, step)| idx * step).sum())
    }

    /// All positions in ordinal order
    pub fn positions(&self) -> impl Iterator<Item = Vec<usize>> + '_ {
        (0..self.len()).filter_map(|ordinal| self.position(ordinal))
    }
}

// ============================================================================
// Sobol sequence
// ============================================================================

const SOBOL_BITS: usize = 32;

/// Joe-Kuo direction numbers for dimensions 2..=10: (degree s, coefficients a, initial m)
const DIRECTION_NUMBERS: [(u32, u32, &[u32]); 9] = [
    (1, 0, &[1]),
    (2, 1, &[1, 3]),
    (3, 1, &[1, 3, 1]),
    (3, 2, &[1, 1, 1]),
    (4, 1, &[1, 1, 3, 3]),
    (4, 4, &[1, 3, 5, 13]),
    (5, 2, &[1, 1, 5, 5, 17]),
    (5, 4, &[1, 1, 5, 5, 5]),
    (5, 7, &[1, 1, 7, 11, 19]),
];

/// Highest dimension count supported by [`SobolSequence`]
pub const MAX_SOBOL_DIMENSIONS: usize = DIRECTION_NUMBERS.len() + 1;

/// Deterministic Sobol low-discrepancy sequence on the unit hypercube.
///
/// Points are generated with the Gray-code update of Antonov and Saleev.
/// [`SobolSequence::new`] starts at the all-zero point of index 0;
/// [`SobolSequence::with_skip`] starts past it and drops `skip` further
/// points, so different seeds give different but reproducible samples.
#[derive(Debug, Clone)]
pub struct SobolSequence {
    directions: Vec<[u32; SOBOL_BITS]>,
    state: Vec<u32>,
    index: u64,
}

impl SobolSequence {
    pub fn new(dimensions: usize) -> Result<Self, ConfigurationError> {
        if dimensions == 0 || dimensions > MAX_SOBOL_DIMENSIONS {
            return Err(ConfigurationError::TooManyDimensions {
                max: MAX_SOBOL_DIMENSIONS,
                got: dimensions,
            });
        }

        let mut directions = Vec::with_capacity(dimensions);
        directions.push(van_der_corput_directions());
        for &(degree, coefficients, initial) in DIRECTION_NUMBERS.iter().take(dimensions - 1) {
            directions.push(direction_vector(degree, coefficients, initial));
        }

        Ok(Self {
            state: vec![0; dimensions],
            directions,
            index: 0,
        })
    }

    /// Sequence positioned after the zero point and `skip` further points.
    ///
    /// The state is computed directly from the Gray code of the start index,
    /// so any skip costs the same.
    pub fn with_skip(dimensions: usize, skip: u64) -> Result<Self, ConfigurationError> {
        let mut sequence = Self::new(dimensions)?;
        let start = skip.checked_add(1).ok_or_else(|| {
            ConfigurationError::invalid("seed", format!("seed {skip} is out of range"))
        })?;
        sequence.state = sequence.raw_point(start);
        sequence.index = start;
        Ok(sequence)
    }

    pub fn dimensions(&self) -> usize {
        self.directions.len()
    }

    /// Ordinal of the point returned by the next call to `next`
    pub fn position(&self) -> u64 {
        self.index
    }

    /// Point at `index` of the unskipped sequence, computed directly.
    ///
    /// Index 0 is the all-zero point, so `point(1)` is the first point the
    /// iterator of `new` emits after skipping.
    pub fn point(&self, index: u64) -> Vec<f64> {
        self.raw_point(index).into_iter().map(to_unit).collect()
    }

    /// Integer state at `index`: the XOR of the direction numbers selected
    /// by the set bits of its Gray code
    fn raw_point(&self, index: u64) -> Vec<u32> {
        let gray = index ^ (index >> 1);
        self.directions
            .iter()
            .map(|directions| {
                (0..SOBOL_BITS)
                    .filter(|&bit| (gray >> bit) & 1 == 1)
                    .fold(0u32, |acc, bit| acc ^ directions[bit])
            })
            .collect()
    }

    fn advance(&mut self) {
        // Rightmost zero bit of the current index selects the direction number;
        // bits past the table width contribute nothing
        let bit = (!self.index).trailing_zeros() as usize;
        if bit < SOBOL_BITS {
            for (value, directions) in self.state.iter_mut().zip(&self.directions) {
                *value ^= directions[bit];
            }
        }
        self.index = self.index.wrapping_add(1);
    }
}

fn to_unit(value: u32) -> f64 {
    f64::from(value) / (1u64 << SOBOL_BITS) as f64
}

impl Iterator for SobolSequence {
    type Item = Vec<f64>;

    fn next(&mut self) -> Option<Self::Item> {
        let point = self.state.iter().copied().map(to_unit).collect();
        self.advance();
        Some(point)
    }
}

fn van_der_corput_directions() -> [u32; SOBOL_BITS] {
    let mut v = [0u32; SOBOL_BITS];
    for (i, slot) in v.iter_mut().enumerate() {
        *slot = 1 << (SOBOL_BITS - 1 - i);
    }
    v
}

fn direction_vector(degree: u32, coefficients: u32, initial: &[u32]) -> [u32; SOBOL_BITS] {
    let s = degree as usize;
    let mut v = [0u32; SOBOL_BITS];
    for i in 0..s.min(SOBOL_BITS) {
        v[i] = initial[i] << (SOBOL_BITS - 1 - i);
    }
    for i in s..SOBOL_BITS {
        let mut value = v[i - s] ^ (v[i - s] >> s);
        for k in 1..s {
            if (coefficients >> (s - 1 - k)) & 1 == 1 {
                value ^= v[i - k];
            }
        }
        v[i] = value;
    }
    v
}
