//! Seedable bounded random values for test-case generation.
//!
//! All randomness flows through an explicit [`RandomGenerator`], so that re-running a test case with the same seed
//! reproduces the same rank, extents, tensor values, and fill value. Every range is half-open: `[low, high)`.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::{Distribution, Normal, Uniform};
use serde::Serialize;

use sbpcheck_core::{DataType, Tensor};

use crate::errors::RandomError;

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct RandomGenerator {
    seed: u64,
    rng: StdRng,
}

impl RandomGenerator {
    pub fn new(seed: u64) -> Self {
        Self { seed, rng: StdRng::seed_from_u64(seed) }
    }

    /// Creates a generator with a seed drawn from the operating system.
    pub fn from_entropy() -> Self {
        Self::new(rand::random::<u64>())
    }

    /// Seed this generator was created with.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Derives an independent generator for `stream`. The result only depends on the seed of `self` and on `stream`,
    /// not on how many values have been drawn from `self`.
    pub fn fork(&self, stream: u64) -> Self {
        Self::new(mix(self.seed, stream))
    }

    /// Same as [`RandomGenerator::fork`], keyed by a name instead of a number.
    pub fn fork_named(&self, name: &str) -> Self {
        self.fork(fnv1a(name.as_bytes()))
    }

    /// Draws a fresh seed.
    pub fn next_seed(&mut self) -> u64 {
        self.rng.next_u64()
    }

    pub(crate) fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

fn mix(seed: u64, stream: u64) -> u64 {
    let mut value = seed ^ stream.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    value = (value ^ (value >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    value = (value ^ (value >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    value ^ (value >> 31)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(0xCBF2_9CE4_8422_2325, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(0x0000_0100_0000_01B3))
}

// ---------------------------------------------------------------------------
// Scalars
// ---------------------------------------------------------------------------

/// Uniform integer in `[low, high)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub struct RandomInt {
    low: i64,
    high: i64,
}

impl RandomInt {
    pub fn new(low: i64, high: i64) -> Result<Self, RandomError> {
        if low >= high {
            return Err(RandomError::EmptyIntRange { low, high });
        }
        Ok(Self { low, high })
    }

    pub fn low(&self) -> i64 {
        self.low
    }

    pub fn high(&self) -> i64 {
        self.high
    }

    pub fn sample(&self, generator: &mut RandomGenerator) -> i64 {
        generator.rng_mut().gen_range(self.low..self.high)
    }
}

/// Uniform float in `[low, high)`. Defaults to `[1, 6)`.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct RandomFloat {
    low: f64,
    high: f64,
}

impl RandomFloat {
    pub fn new(low: f64, high: f64) -> Result<Self, RandomError> {
        if !low.is_finite() || !high.is_finite() || low >= high {
            return Err(RandomError::InvalidFloatRange { low, high });
        }
        Ok(Self { low, high })
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn high(&self) -> f64 {
        self.high
    }

    pub fn sample(&self, generator: &mut RandomGenerator) -> f64 {
        generator.rng_mut().gen_range(self.low..self.high)
    }
}

impl Default for RandomFloat {
    fn default() -> Self {
        Self { low: 1.0, high: 6.0 }
    }
}

// ---------------------------------------------------------------------------
// Extents
// ---------------------------------------------------------------------------

/// Tensor extents of the form `k * multiple`, with `k` drawn from `factor` independently for every dimension.
///
/// Split dimensions must be divisible by the number of ranks splitting them, so extents used with sharded
/// placements are drawn as multiples of the world size. The default draws `k` from `[1, 4)` with multiple `4`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ExtentSpec {
    factor: RandomInt,
    multiple: usize,
}

impl ExtentSpec {
    pub fn new(factor: RandomInt, multiple: usize) -> Result<Self, RandomError> {
        if factor.low() < 0 {
            return Err(RandomError::NegativeExtentFactor { low: factor.low() });
        }
        Ok(Self { factor, multiple })
    }

    /// Default factor range with a multiple that every partition count of a `world_size` placement divides.
    pub fn for_world_size(world_size: usize) -> Self {
        Self { multiple: lcm(4, world_size.max(1)), ..Self::default() }
    }

    pub fn factor(&self) -> RandomInt {
        self.factor
    }

    pub fn multiple(&self) -> usize {
        self.multiple
    }

    pub fn sample(&self, generator: &mut RandomGenerator, ndim: usize) -> Vec<usize> {
        (0..ndim).map(|_| self.factor.sample(generator).unsigned_abs() as usize * self.multiple).collect()
    }
}

impl Default for ExtentSpec {
    fn default() -> Self {
        Self { factor: RandomInt { low: 1, high: 4 }, multiple: 4 }
    }
}

fn lcm(lhs: usize, rhs: usize) -> usize {
    let (mut a, mut b) = (lhs, rhs);
    while b != 0 {
        (a, b) = (b, a % b);
    }
    lhs / a * rhs
}

// ---------------------------------------------------------------------------
// Tensors
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub enum ValueDistribution {
    /// Uniform in `[low, high)`.
    Uniform { low: f64, high: f64 },
    Normal { mean: f64, std_dev: f64 },
}

impl Default for ValueDistribution {
    fn default() -> Self {
        Self::Uniform { low: 0.0, high: 1.0 }
    }
}

/// Distribution and data type of the values of a random tensor. Defaults to uniform `[0, 1)` values of type `F32`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
pub struct TensorSpec {
    pub distribution: ValueDistribution,
    pub data_type: DataType,
}

impl TensorSpec {
    pub fn sample(&self, generator: &mut RandomGenerator, shape: Vec<usize>) -> Result<Tensor, RandomError> {
        let count = shape.iter().product::<usize>();
        let rng = generator.rng_mut();
        let values = match self.distribution {
            ValueDistribution::Uniform { low, high } => {
                RandomFloat::new(low, high)?;
                let distribution = Uniform::new(low, high);
                (0..count).map(|_| distribution.sample(&mut *rng)).collect()
            }
            ValueDistribution::Normal { mean, std_dev } => {
                let distribution = Normal::new(mean, std_dev).map_err(|error| RandomError::InvalidDistribution {
                    distribution: "normal",
                    message: error.to_string(),
                })?;
                (0..count).map(|_| distribution.sample(&mut *rng)).collect()
            }
        };
        Ok(Tensor::from_vec(shape, values, self.data_type)?)
    }
}
