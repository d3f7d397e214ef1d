//! Statistics functions

use ndarray::prelude::*;
use ndarray::DataMut;
use ndarray_stats::errors::QuantileError;
use num_traits::FromPrimitive;
use std::ops::{Add, Div, Mul, Rem, Sub};

/// Return the median. Sorts its argument in place.
pub fn median_mut<S, T>(xs: &mut ArrayBase<S, Ix1>) -> Result<T, QuantileError>
where
    S: DataMut<Elem = T>,
    T: Clone + Copy + Ord + FromPrimitive,
    T: Add<Output = T> + Sub<Output = T> + Mul<Output = T> + Div<Output = T> + Rem<Output = T>,
{
    // ndarray_stats' quantile_mut can overflow the stack on large inputs
    // (https://github.com/rust-ndarray/ndarray-stats/issues/86), so sort instead.
    if xs.is_empty() {
        return Err(QuantileError::EmptyInput);
    }
    match xs.as_slice_mut() {
        Some(vector) => vector.sort_unstable(),
        None => {
            let mut v = xs.to_vec();
            v.sort_unstable();
            xs.assign(&Array1::from(v));
        }
    }
    let two = T::from_u64(2).ok_or(QuantileError::EmptyInput)?;
    Ok(if xs.len() % 2 == 0 {
        (xs[xs.len() / 2] + xs[xs.len() / 2 - 1]) / two
    } else {
        xs[xs.len() / 2]
    })
}

/// Mean and population standard deviation (divide by `n`). `None` for empty input.
pub fn mean_std(xs: &[f64]) -> Option<(f64, f64)> {
    if xs.is_empty() {
        return None;
    }
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    Some((mean, var.sqrt()))
}

/// `100 * part / total`, or 0 if `total` is 0
#[inline]
pub fn percent_of(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * part as f64 / total as f64
    }
}
