//! Robust location and covariance by minimum covariance determinant (FastMCD,
//! Rousseeuw & Van Driessen 1999; https://doi.org/10.1080/00401706.1999.10485670).

use crate::stats::median_mut;
use anyhow::{ensure, format_err, Error};
use log::{debug, warn};
use nalgebra::{linalg, DMatrix, DVector};
use ndarray::prelude::*;
use noisy_float::types::n64;
use rand::seq::index::sample;
use rand::SeedableRng;
use rand_pcg::Pcg64;

/// Largest number of dimensions `MinCovDet` accepts
pub const MAX_DIM: usize = 5;

// chi2(p).ppf(0.5) for p = 1..=5
const CHI2_MEDIAN: [f64; MAX_DIM] = [
    0.454936423119572,
    1.386294361119891,
    2.365973884375338,
    3.356694058052521,
    4.351460191095526,
];

// chi2(p).ppf(0.975) for p = 1..=5
const CHI2_975: [f64; MAX_DIM] = [
    5.023886187314888,
    7.377758908227871,
    9.348403604496148,
    11.143286781877796,
    12.832501994030027,
];

const N_TRIALS: usize = 30;
const N_BEST: usize = 10;
const INITIAL_STEPS: usize = 2;
const MAX_STEPS: usize = 30;

/// Copy a dense ndarray matrix into nalgebra storage
pub(crate) fn to_dmatrix(a: ArrayView2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

/// Lower Cholesky factor `L` of a symmetric positive definite matrix `A = L L^T`
#[derive(Clone, Debug)]
struct Cholesky {
    l: DMatrix<f64>,
}

impl Cholesky {
    /// Returns `None` if `a` is not positive definite, or so close to singular that a pivot
    /// falls below `1e-10` of the largest variance
    fn new(a: &Array2<f64>) -> Option<Cholesky> {
        let tol = 1e-10 * a.diag().fold(0.0_f64, |m, &x| m.max(x.abs()));
        let l = linalg::Cholesky::new(to_dmatrix(a.view()))?.unpack();
        if l.diagonal().iter().any(|&d| d.is_nan() || d * d <= tol) {
            return None;
        }
        Some(Cholesky { l })
    }

    fn log_det(&self) -> f64 {
        2.0 * self.l.diagonal().iter().map(|x| x.ln()).sum::<f64>()
    }

    /// `x^T A^-1 x`, from the forward solve `L z = x`
    fn sq_norm(&self, x: ArrayView1<f64>) -> f64 {
        let b = DVector::from_iterator(x.len(), x.iter().copied());
        self.l
            .solve_lower_triangular(&b)
            .map_or(f64::INFINITY, |z| z.norm_squared())
    }
}

/// Mean and maximum-likelihood covariance of the rows `idx` of `x`
fn mean_cov(x: &ArrayView2<f64>, idx: &[usize]) -> (Array1<f64>, Array2<f64>) {
    let sub = x.select(Axis(0), idx);
    let n = idx.len() as f64;
    let mean = sub.sum_axis(Axis(0)) / n;
    let centered = &sub - &mean;
    let cov = centered.t().dot(&centered) / n;
    (mean, cov)
}

/// Number of occurrences of the most frequent row of `x`
fn largest_tie(x: &ArrayView2<f64>) -> usize {
    let mut rows = x.outer_iter().collect::<Vec<_>>();
    rows.sort_by(|a, b| {
        a.iter()
            .zip(b.iter())
            .map(|(u, v)| u.total_cmp(v))
            .find(|o| o.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    rows.chunk_by(|a, b| a == b).map(|run| run.len()).max().unwrap_or(0)
}

fn sq_distances(x: &ArrayView2<f64>, location: &Array1<f64>, chol: &Cholesky) -> Array1<f64> {
    x.outer_iter().map(|row| chol.sq_norm((&row - location).view())).collect()
}

#[derive(Clone, Debug)]
struct Fit {
    location: Array1<f64>,
    covariance: Array2<f64>,
    chol: Cholesky,
    log_det: f64,
}

impl Fit {
    fn on_subset(x: &ArrayView2<f64>, idx: &[usize]) -> Option<Fit> {
        let (location, covariance) = mean_cov(x, idx);
        let chol = Cholesky::new(&covariance)?;
        let log_det = chol.log_det();
        Some(Fit {
            location,
            covariance,
            chol,
            log_det,
        })
    }

    /// Concentration step: refit on the `h` observations closest to the current fit
    fn c_step(&self, x: &ArrayView2<f64>, h: usize) -> Option<Fit> {
        let d = sq_distances(x, &self.location, &self.chol);
        let mut order = (0..d.len()).collect::<Vec<_>>();
        order.sort_by(|&a, &b| d[a].total_cmp(&d[b]));
        order.truncate(h);
        order.sort_unstable();
        Fit::on_subset(x, &order)
    }

    /// Iterate concentration steps until the determinant stops decreasing
    fn concentrate(mut self, x: &ArrayView2<f64>, h: usize, max_steps: usize) -> Fit {
        for _ in 0..max_steps {
            match self.c_step(x, h) {
                Some(next) if next.log_det < self.log_det - 1e-12 => self = next,
                _ => break,
            }
        }
        self
    }
}

/// Minimum covariance determinant estimate of location and scatter
#[derive(Clone, Debug)]
pub struct MinCovDet {
    /// Re-weighted robust location
    pub location: Array1<f64>,
    /// Re-weighted robust covariance
    pub covariance: Array2<f64>,
    /// Location of the best `h`-subset
    pub raw_location: Array1<f64>,
    /// Consistency-corrected covariance of the best `h`-subset
    pub raw_covariance: Array2<f64>,
    /// Observations used for the re-weighted estimate
    pub support: Vec<bool>,
    chol: Cholesky,
}

impl MinCovDet {
    /// Fit to the rows of `x` (observations x variables). `seed` makes the random initial
    /// subsets reproducible.
    pub fn fit(x: ArrayView2<f64>, seed: u64) -> Result<MinCovDet, Error> {
        let (n, p) = x.dim();
        ensure!(
            (1..=MAX_DIM).contains(&p),
            "robust covariance supports 1 to {} variables, got {}",
            MAX_DIM,
            p
        );
        ensure!(
            n >= p + 2,
            "need at least {} observations for {} variables, got {}",
            p + 2,
            p,
            n
        );
        ensure!(x.iter().all(|v| v.is_finite()), "observations must be finite");
        ensure!(
            2 * largest_tie(&x) <= n,
            "more than half of the observations are identical"
        );

        let h = (n + p + 2) / 2;
        let mut rng = Pcg64::seed_from_u64(seed);

        let mut candidates = Vec::with_capacity(N_TRIALS);
        for _ in 0..N_TRIALS {
            let mut idx = sample(&mut rng, n, h).into_vec();
            idx.sort_unstable();
            if let Some(fit) = Fit::on_subset(&x, &idx) {
                candidates.push(fit.concentrate(&x, h, INITIAL_STEPS));
            }
        }
        ensure!(
            !candidates.is_empty(),
            "every candidate subset has a singular covariance; the variables are collinear"
        );
        candidates.sort_by(|a, b| a.log_det.total_cmp(&b.log_det));
        candidates.truncate(N_BEST);

        let best = candidates
            .into_iter()
            .map(|fit| fit.concentrate(&x, h, MAX_STEPS))
            .min_by(|a, b| a.log_det.total_cmp(&b.log_det))
            .ok_or_else(|| format_err!("no candidate fit"))?;
        debug!("MCD: n = {}, p = {}, h = {}, log det = {}", n, p, h, best.log_det);

        // consistency correction, so the raw covariance estimates the covariance under normality
        let mut raw_dist = sq_distances(&x, &best.location, &best.chol);
        let mut sorted = raw_dist.mapv(n64);
        let median = median_mut(&mut sorted).map_err(|e| format_err!("{:?}", e))?;
        let correction = median.raw() / CHI2_MEDIAN[p - 1];
        ensure!(correction > 0.0, "more than half of the observations are identical");
        let raw_covariance = &best.covariance * correction;
        raw_dist /= correction;

        // re-weighting step
        let support = raw_dist.iter().map(|&d| d < CHI2_975[p - 1]).collect::<Vec<_>>();
        let idx = support
            .iter()
            .enumerate()
            .filter(|&(_, &s)| s)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        let reweighted = if idx.len() > p {
            let (location, covariance) = mean_cov(&x, &idx);
            Cholesky::new(&covariance).map(|chol| (location, covariance, chol))
        } else {
            None
        };

        let (location, covariance, chol) = match reweighted {
            Some(r) => r,
            None => {
                warn!("re-weighted covariance is singular, using the raw MCD estimate");
                let chol = Cholesky::new(&raw_covariance)
                    .ok_or_else(|| format_err!("corrected MCD covariance is singular"))?;
                (best.location.clone(), raw_covariance.clone(), chol)
            }
        };

        Ok(MinCovDet {
            location,
            covariance,
            raw_location: best.location,
            raw_covariance,
            support,
            chol,
        })
    }

    /// Squared Mahalanobis distances of the rows of `x` under the robust estimate
    pub fn mahalanobis(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, Error> {
        ensure!(
            x.ncols() == self.location.len(),
            "expected {} variables, got {}",
            self.location.len(),
            x.ncols()
        );
        Ok(sq_distances(&x, &self.location, &self.chol))
    }
}
