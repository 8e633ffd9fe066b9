use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Element-wise closeness criterion: `|actual - expected| <= atol + rtol * |expected|`, with `NaN` equal to `NaN`.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub rtol: f64,
    pub atol: f64,
}

impl Tolerance {
    pub fn new(rtol: f64, atol: f64) -> Self {
        Self { rtol, atol }
    }

    /// Tolerance that only accepts identical values.
    pub fn exact() -> Self {
        Self { rtol: 0.0, atol: 0.0 }
    }

    pub fn is_close(&self, actual: f64, expected: f64) -> bool {
        if actual.is_nan() || expected.is_nan() {
            return actual.is_nan() && expected.is_nan();
        }
        actual == expected || (actual - expected).abs() <= self.atol + self.rtol * expected.abs()
    }
}

impl Default for Tolerance {
    fn default() -> Self {
        Self { rtol: 1e-4, atol: 1e-5 }
    }
}

/// Summary of the elements that failed a comparison, pointing at the element with the largest deviation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Mismatch {
    pub index: usize,
    pub expected: f64,
    pub actual: f64,
    pub max_deviation: f64,
    pub mismatch_count: usize,
    pub element_count: usize,
}

impl Display for Mismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} element(s) differ; max deviation {} at element #{} (expected {}, got {})",
            self.mismatch_count, self.element_count, self.max_deviation, self.index, self.expected, self.actual,
        )
    }
}

fn deviation(actual: f64, expected: f64) -> f64 {
    match (actual.is_nan(), expected.is_nan()) {
        (true, true) => 0.0,
        (false, false) if actual == expected => 0.0,
        (false, false) => (actual - expected).abs(),
        _ => f64::INFINITY,
    }
}

/// Compares `actual` against `expected` element-wise and returns the maximum deviation when every element is
/// within `tolerance`.
///
/// Slices of different lengths never match: the mismatch points at the first element that only one of them holds
/// (the missing side reads as `NaN`) and counts every unpaired element as differing.
pub fn compare_values(actual: &[f64], expected: &[f64], tolerance: Tolerance) -> Result<f64, Mismatch> {
    if actual.len() != expected.len() {
        let index = actual.len().min(expected.len());
        return Err(Mismatch {
            index,
            expected: expected.get(index).copied().unwrap_or(f64::NAN),
            actual: actual.get(index).copied().unwrap_or(f64::NAN),
            max_deviation: f64::INFINITY,
            mismatch_count: actual.len().abs_diff(expected.len()),
            element_count: expected.len(),
        });
    }
    let mut max_deviation = 0.0f64;
    let mut worst_failure: Option<(usize, f64)> = None;
    let mut mismatch_count = 0;
    for (index, (actual, expected)) in actual.iter().zip(expected.iter()).enumerate() {
        let element_deviation = deviation(*actual, *expected);
        max_deviation = max_deviation.max(element_deviation);
        if !tolerance.is_close(*actual, *expected) {
            mismatch_count += 1;
            if worst_failure.is_none_or(|(_, worst)| element_deviation > worst) {
                worst_failure = Some((index, element_deviation));
            }
        }
    }
    match worst_failure {
        None => Ok(max_deviation),
        Some((index, _)) => Err(Mismatch {
            index,
            expected: expected[index],
            actual: actual[index],
            max_deviation,
            mismatch_count,
            element_count: expected.len(),
        }),
    }
}
