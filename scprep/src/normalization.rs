use crate::stats::median_mut;
use anyhow::{bail, ensure, Error};
use log::info;
use ndarray::prelude::*;
use scprep_types::{CountMatrix, NormalizedMatrix};
use std::fmt;
use std::str::FromStr;

/// Normalization scheme for a gene x cell count matrix
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Normalization {
    /// Cell Ranger style log normalization. Cell read totals are scaled to the median
    /// and the transformation `x -> log2(1 + x)` is applied
    CellRanger,
    /// Cell Ranger style log normalization, like above, just minus the variance standardization
    CellRanger8,
    /// Seurat style log normalization (pre SCTransform). Cell read totals are scaled
    /// to 10,000 and the transformation `x -> ln(1 + x)` is applied
    SeuratLog,
    /// binomial deviance residuals
    BinomialDeviance,
    /// binomial Pearson residuals
    BinomialPearson,
    /// size factors specified explicity
    WithSizeFactors,
    /// vanilla log 2
    LogTransform,
}

impl FromStr for Normalization {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cellranger" => Ok(Normalization::CellRanger),
            "cellranger8" => Ok(Normalization::CellRanger8),
            "seuratlog" => Ok(Normalization::SeuratLog),
            "binomialdeviance" => Ok(Normalization::BinomialDeviance),
            "binomialpearson" => Ok(Normalization::BinomialPearson),
            "sizefactors" => Ok(Normalization::WithSizeFactors),
            "logtransform" => Ok(Normalization::LogTransform),
            _ => bail!("Normalization not recognized: {}", s),
        }
    }
}

impl fmt::Display for Normalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Normalization::CellRanger => "cellranger",
            Normalization::CellRanger8 => "cellranger8",
            Normalization::SeuratLog => "seuratlog",
            Normalization::BinomialDeviance => "binomialdeviance",
            Normalization::BinomialPearson => "binomialpearson",
            Normalization::WithSizeFactors => "sizefactors",
            Normalization::LogTransform => "logtransform",
        };
        f.write_str(name)
    }
}

/// Normalize a count matrix
pub fn normalize(mat: &CountMatrix, norm: Normalization) -> Result<NormalizedMatrix, Error> {
    normalize_with_size_factor(mat, norm, None)
}

/// Normalize a count matrix, scaling cells by `size_factors` when `norm` is
/// [`Normalization::WithSizeFactors`]. Without size factors the cell read totals are used.
pub fn normalize_with_size_factor(
    mat: &CountMatrix,
    norm: Normalization,
    size_factors: Option<Array1<u32>>,
) -> Result<NormalizedMatrix, Error> {
    use Normalization::{
        BinomialDeviance, BinomialPearson, CellRanger, CellRanger8, LogTransform, SeuratLog, WithSizeFactors,
    };
    info!(
        "normalizing {} genes x {} cells ({})",
        mat.n_genes(),
        mat.n_cells(),
        norm
    );
    let values = match norm {
        CellRanger => scale_and_center(log_values(mat, None, LogBase::Two, None)?, None),
        CellRanger8 => {
            let scale = Array1::<f64>::ones(mat.n_genes());
            scale_and_center(log_values(mat, None, LogBase::Two, None)?, Some(scale))
        }
        SeuratLog => scale_and_center(log_values(mat, Some(10_000_f64), LogBase::E, None)?, None),
        WithSizeFactors => scale_and_center(log_values(mat, None, LogBase::Two, size_factors)?, None),
        LogTransform => {
            // Size factor of all ones and target count of one implies that there is no scaling before taking the log
            let all_ones = Array1::<u32>::ones(mat.n_cells());
            scale_and_center(log_values(mat, Some(1.0), LogBase::Two, Some(all_ones))?, None)
        }
        BinomialDeviance => binom_deviance_values(mat),
        BinomialPearson => binom_pearson_values(mat),
    };
    NormalizedMatrix::new(mat.genes.clone(), mat.cells.clone(), values)
}

/// Base of logarithm used by log_normalize
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogBase {
    /// ln
    E,
    /// log2
    Two,
    /// log10
    Ten,
}

/// Log-normalize a count matrix:
/// 1. Scale each column (cell) to have the same total count given by
///    `count_sum`. If `count_sum` is `None`, use the median total count
/// 2. Apply a transform `x -> log_b(1 + x)`, with `b` specified by `log_base`
///
/// Rows are not centered or scaled.
pub fn log_normalize(mat: &CountMatrix, count_sum: Option<f64>, log_base: LogBase) -> Result<NormalizedMatrix, Error> {
    log_normalize_with_size_factor(mat, count_sum, log_base, None)
}

/// Log-normalize a count matrix:
/// 1. Scale each column (cell) to have the same total count given by
///    `count_sum` / `size_factors[i]` for the i-th column.
///     If `count_sum` is `None`, use the median total count
///     If `size_factors` is `None`, use the total counts in each column
/// 2. Apply a transform `x -> log_b(1 + x)`, with `b` specified by `log_base`
pub fn log_normalize_with_size_factor(
    mat: &CountMatrix,
    count_sum: Option<f64>,
    log_base: LogBase,
    size_factors: Option<Array1<u32>>,
) -> Result<NormalizedMatrix, Error> {
    let values = log_values(mat, count_sum, log_base, size_factors)?;
    NormalizedMatrix::new(mat.genes.clone(), mat.cells.clone(), values)
}

fn log_values(
    mat: &CountMatrix,
    count_sum: Option<f64>,
    log_base: LogBase,
    size_factors: Option<Array1<u32>>,
) -> Result<Array2<f64>, Error> {
    let totals = mat.cell_totals();
    let normalization_counts = match size_factors {
        Some(x) => {
            ensure!(
                x.len() == mat.n_cells(),
                "Size of the size factor and matrix columns dont match. Size factor length {}; Matrix dimensions: {:?}",
                x.len(),
                (mat.n_genes(), mat.n_cells())
            );
            x.mapv(f64::from)
        }
        None => totals.mapv(|c| c as f64),
    };
    let target_count: f64 = match count_sum {
        Some(x) => x,
        None => {
            // Scale to the median count. Clone because median_mut will reorder its argument.
            let mut counts = totals.clone();
            median_mut(&mut counts).map_or(1.0, |median: u64| (median as f64).max(1.0))
        }
    };
    // empty cells stay at zero instead of becoming 0 * inf
    let col_scales = normalization_counts.mapv(|c| if c > 0.0 { target_count / c } else { 0.0 });

    let log1p_fn = match log_base {
        LogBase::E => |x: f64| (x + 1.0).ln(),
        LogBase::Two => |x: f64| (x + 1.0).log2(),
        LogBase::Ten => |x: f64| (x + 1.0).log10(),
    };

    let mut out = Array2::<f64>::zeros((mat.n_genes(), mat.n_cells()));
    for (col, vec) in mat.matrix.outer_iterator().enumerate() {
        let scale = col_scales[col];
        for (row, &v) in vec.iter() {
            out[[row, col]] = log1p_fn(f64::from(v) * scale);
        }
    }
    Ok(out)
}

/// Scale and center each row to have variance 1 and mean 0. If `scaling_factors` is given,
/// rows are divided by those instead of their standard deviations. Rows with zero variance
/// are only centered.
pub(crate) fn scale_and_center(mut x: Array2<f64>, scaling_factors: Option<Array1<f64>>) -> Array2<f64> {
    let n = x.ncols() as f64;
    for (i, mut row) in x.axis_iter_mut(Axis(0)).enumerate() {
        let mean = row.sum() / n;
        let scale = match &scaling_factors {
            Some(s) => s[i],
            None => {
                let sd = (row.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
                // constant rows, up to rounding in the mean
                if sd <= 1e-12 * mean.abs().max(1.0) {
                    1.0
                } else {
                    sd
                }
            }
        };
        row.mapv_inplace(|v| (v - mean) / scale);
    }
    x
}

/// Fit the null multinomial model for normalization based on deviance/Pearson residuals.
/// Returns a tuple `(n, p)` where `n` is an array of total cell counts and `p` is an
/// array of gene abundances.
fn fit_multinomial_model(mat: &CountMatrix) -> (Array1<f64>, Array1<f64>) {
    let n = mat.cell_totals().mapv(|x| x as f64);
    let total_count = n.sum();
    let pi = mat.gene_totals().mapv(|x| {
        if total_count > 0.0 {
            x as f64 / total_count
        } else {
            0.0
        }
    });
    (n, pi)
}

/// 0 log(0) = 0
#[inline]
fn a_ln_a_over_b(a: f64, b: f64) -> f64 {
    if a == 0.0 {
        return 0.0;
    }
    a * (a / b).ln()
}

#[inline]
fn binom_deviance(y: f64, n: f64, pi: f64) -> f64 {
    let mu = n * pi;
    if mu == 0.0 {
        return 0.0;
    }
    let sign = (y - mu).signum();
    // NOTE: x.max(0) needed before sqrt due to floating point errors
    sign * (2.0 * (a_ln_a_over_b(y, mu) + a_ln_a_over_b(n - y, n - mu)))
        .max(0.0)
        .sqrt()
}

#[inline]
fn binom_pearson(y: f64, n: f64, pi: f64) -> f64 {
    let mu = n * pi;
    let denom = (mu * (1.0 - pi)).sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    (y - mu) / denom
}

/// Fill a dense matrix with `f(y, n_c, pi_g)`. Zero counts share one value per cell and gene,
/// so the matrix is filled with those first and the stored counts overwrite them.
fn residuals(mat: &CountMatrix, f: impl Fn(f64, f64, f64) -> f64) -> Array2<f64> {
    let (n, pi) = fit_multinomial_model(mat);
    let mut out = Array2::from_shape_fn((mat.n_genes(), mat.n_cells()), |(g, c)| f(0.0, n[c], pi[g]));
    for (col, vec) in mat.matrix.outer_iterator().enumerate() {
        for (row, &v) in vec.iter() {
            out[[row, col]] = f(f64::from(v), n[col], pi[row]);
        }
    }
    out
}

fn binom_deviance_values(mat: &CountMatrix) -> Array2<f64> {
    // y_gc = count for cell c, gene g
    // n_c = sum_g y_gc = total counts from cell c
    // pi_g = (sum_c y_gc) / (sum_gc y_gc) = fraction of total counts from gene g
    // mu_gc = n_c pi_g = expectation of y_gc under null model
    //
    // Deviance residual:
    //   r_gc = sign(y_gc - mu_gc) sqrt(2 y_gc log(y_gc/mu_gc) + 2 (n_c - y_gc) log((n_c - y_gc) / (n_c - mu_gc) )
    // Pearson residual:
    //   r_gc = (y_gc - mu_gc) / sqrt( mu_gc - mu_gc^2 / n_c )
    residuals(mat, binom_deviance)
}

fn binom_pearson_values(mat: &CountMatrix) -> Array2<f64> {
    residuals(mat, binom_pearson)
}

/// Normalize a count matrix according to the binomial deviance approximation to
/// multinomial GLM-PCA (Townes, et al. 2019; https://doi.org/10.1186/s13059-019-1861-6).
pub fn binom_deviance_resid(mat: &CountMatrix) -> Result<NormalizedMatrix, Error> {
    NormalizedMatrix::new(mat.genes.clone(), mat.cells.clone(), binom_deviance_values(mat))
}

/// Normalize a count matrix according to the binomial Pearson residual approximation to
/// multinomial GLM-PCA (Townes, et al. 2019; https://doi.org/10.1186/s13059-019-1861-6).
pub fn binom_pearson_resid(mat: &CountMatrix) -> Result<NormalizedMatrix, Error> {
    NormalizedMatrix::new(mat.genes.clone(), mat.cells.clone(), binom_pearson_values(mat))
}

#[cfg(test)]
mod test_normalization {
    use super::*;
    use ndarray::Array1;

    fn count_matrix(dense: Array2<u32>) -> CountMatrix {
        let genes = (0..dense.nrows()).map(|i| format!("g{i}")).collect();
        let cells = (0..dense.ncols()).map(|i| format!("c{i}")).collect();
        CountMatrix::from_dense(genes, cells, dense.view()).unwrap()
    }

    fn example() -> CountMatrix {
        count_matrix(array![
            [136, 936, 0, 0, 264],
            [134, 682, 417, 8, 391],
            [0, 133, 780, 0, 0],
            [396, 76, 96, 198, 0],
        ])
    }

    #[test]
    fn test_fit_multinomial_model() {
        let mat = count_matrix(array![[1, 0, 2], [0, 0, 0], [3, 0, 6]]);

        // column sums
        let expected_n = array![4.0, 0.0, 8.0];
        let expected_pi = array![0.25, 0.0, 0.75];

        let (n, pi) = fit_multinomial_model(&mat);

        assert_close(n.view(), expected_n.view());
        assert_close(pi.view(), expected_pi.view());
    }

    #[test]
    fn test_empty_rows_and_cols_are_finite() {
        let mat = count_matrix(array![[1, 0, 2], [0, 0, 0], [3, 0, 6]]);
        for norm in [
            Normalization::CellRanger,
            Normalization::SeuratLog,
            Normalization::BinomialDeviance,
            Normalization::BinomialPearson,
        ] {
            let out = normalize(&mat, norm).unwrap();
            assert!(out.matrix.iter().all(|x| x.is_finite()), "{norm} produced non-finite values");
        }
    }

    #[test]
    fn test_one_dim() {
        let mat: Array2<u32> = Array2::from_shape_vec(
            (1, 40),
            vec![
                225, 44, 63, 17, 59, 565, 77, 169, 108, 46, 17, 46, 67, 626, 35, 51, 96, 355, 5, 675, 48, 17, 267, 40,
                51, 74, 17, 67, 23, 126, 59, 110, 137, 71, 191, 42, 59, 54, 81, 201,
            ],
        )
        .unwrap();
        let norm_mat = normalize(&count_matrix(mat), Normalization::CellRanger).unwrap();
        assert!(!norm_mat.matrix.fold(false, |acc, x| x.is_nan() || acc));
    }

    // stolen from ndarray - not currently exported.
    fn assert_close<D>(a: ArrayView<f64, D>, b: ArrayView<f64, D>)
    where
        D: Dimension,
    {
        let diff = (&a - &b).mapv_into(f64::abs);

        let rtol = 1e-7;
        let atol = 1e-12;
        let crtol = b.mapv(|x| x.abs() * rtol);
        let tol = crtol + atol;
        let tol_m_diff = &diff - &tol;
        let maxdiff = tol_m_diff.fold(f64::NAN, |x, y| f64::max(x, *y));
        println!("diff offset from tolerance level= {maxdiff:.2e}");
        if maxdiff > 0. || maxdiff.is_nan() {
            println!("{a:.4?}");
            println!("{b:.4?}");
            panic!("results differ");
        }
    }

    #[test]
    fn test_cellranger_normalisation() {
        // # Python code to reconstruct this test
        // mat = np.array([[136, 936, 0, 0, 264],
        //     [134, 682, 417, 8, 391],
        //     [0, 133, 780, 0, 0],
        //     [396, 76, 96, 198, 0],
        //         ])
        // scale_factor = mat.sum(axis=0)
        // target_umi_count = np.median(mat.sum(axis=0))
        // half_processed_mat = mat.dot(np.diag(target_umi_count/scale_factor))
        // almost_processed_mat = np.log2(1 + half_processed_mat)
        // centering_factor = almost_processed_mat.mean(axis = 1).reshape((4,1))
        // scaling_factor = 1/np.std(almost_processed_mat, axis=1)
        // norm_mat = np.diag(scaling_factor).dot(almost_processed_mat - centering_factor)
        let expected_out_dense = array![
            [0.61392149, 0.95459951, -1.21707302, -1.21707302, 0.86562504],
            [-0.11878431, 0.54279925, 0.38607315, -1.85660965, 1.04652156],
            [-0.78758751, 0.76437149, 1.59839105, -0.78758751, -0.78758751],
            [0.88718256, -0.25584717, -0.01048423, 1.09574143, -1.71659259]
        ];
        let norm_mat = normalize_with_size_factor(&example(), Normalization::CellRanger, None).unwrap();

        assert!(expected_out_dense.abs_diff_eq(&norm_mat.matrix, 1e-6));
        assert_eq!(norm_mat.genes, example().genes);

        // without explicit size factors the read totals are used
        let sf = normalize(&example(), Normalization::WithSizeFactors).unwrap();
        assert!(expected_out_dense.abs_diff_eq(&sf.matrix, 1e-6));
    }

    #[test]
    fn test_cellranger8_normalisation() {
        // # Python code to reconstruct this test
        // (as above, without the scaling step)
        // norm_mat = almost_processed_mat - centering_factor
        let expected_out_dense = array![
            [2.37992764, 3.70059981, -4.71810445, -4.71810445, 3.35568145],
            [-0.15920674, 0.72751443, 0.51745426, -2.48841594, 1.40265399],
            [-2.85652852, 2.77232551, 5.79726005, -2.85652852, -2.85652852],
            [2.94151467, -0.84827885, -0.0347612, 3.63300591, -5.69148053]
        ];
        let norm_mat = normalize_with_size_factor(&example(), Normalization::CellRanger8, None).unwrap();

        assert!(expected_out_dense.abs_diff_eq(&norm_mat.matrix, 1e-6));
    }

    #[test]
    fn test_log_normalize_with_size_factor() {
        // # Python code to reconstruct this test
        // features_picked = [0, 2]
        // scale_factor = 1 + mat[features_picked,:].sum(axis=0)
        // target_umi_count = np.median(mat.sum(axis=0))
        // half_processed_mat = mat.dot(np.diag(target_umi_count/scale_factor))
        // processed_mat = np.log2(1 + half_processed_mat)
        let expected_out_dense = array![
            [9.37098961, 9.18882221, 0., 0., 9.37609671],
            [9.34964848, 8.73300582, 8.4781546, 12.37964912, 9.94202202],
            [0., 6.3885887, 9.3796973, 0., 0.],
            [10.91145213, 5.59409085, 6.37267837, 17.00874593, 0.]
        ];
        let mtx = example();
        let size_factors = mtx
            .select_genes_by_name(&["g0", "g2"])
            .cell_totals()
            .mapv(|x| x as u32 + 1);
        let processed = log_normalize_with_size_factor(&mtx, None, LogBase::Two, Some(size_factors)).unwrap();

        assert!(expected_out_dense.abs_diff_eq(&processed.matrix, 1e-6));

        let wrong_len = Array1::<u32>::ones(3);
        assert!(normalize_with_size_factor(&mtx, Normalization::WithSizeFactors, Some(wrong_len)).is_err());
    }

    #[test]
    fn test_vanilla_log_norm() {
        // # Python code to reconstruct this test
        // almost_processed_mat = np.log2(1 + mat)
        // centering_factor = almost_processed_mat.mean(axis = 1).reshape((4,1))
        // scaling_factor = 1/np.std(almost_processed_mat, axis=1)
        // norm_mat = np.diag(scaling_factor).dot(almost_processed_mat - centering_factor)
        let expected_out_dense = array![
            [0.50075509, 1.16407001, -1.1965938, -1.1965938, 0.72836249],
            [-0.14245194, 0.89844192, 0.58318993, -1.88113806, 0.54195815],
            [-0.80111703, 0.89623633, 1.50711477, -0.80111703, -0.80111703],
            [0.92609909, 0.14507504, 0.25503138, 0.59722303, -1.92342854]
        ];
        let norm_mat = normalize(&example(), Normalization::LogTransform).unwrap();

        assert!(expected_out_dense.abs_diff_eq(&norm_mat.matrix, 1e-6));
    }

    #[test]
    fn test_binom_deviance() {
        // n = mat.sum(axis=0); pi = mat.sum(axis=1) / mat.sum(); mu = np.outer(pi, n)
        // sign(y - mu) * sqrt(2 y log(y / mu) + 2 (n - y) log((n - y) / (n - mu)))
        let expected = array![
            [-4.91356943, 20.14751269, -29.60710279, -11.81762648, 6.32519735],
            [-8.48534656, 1.96944234, -2.17549643, -10.97272968, 12.78591805],
            [-17.06939027, -14.86363427, 32.03092368, -9.49324095, -16.92783993],
            [25.01586174, -16.51450412, -9.66461883, 25.47800414, -15.36128208],
        ];
        let resid = binom_deviance_resid(&example()).unwrap();
        assert!(expected.abs_diff_eq(&resid.matrix, 1e-6));
    }

    #[test]
    fn test_binom_pearson() {
        // (y - mu) / sqrt(mu (1 - pi))
        let expected = array![
            [-4.74937021, 21.23196214, -22.84140957, -9.11711114, 6.53436625],
            [-8.10918828, 1.97850282, -2.16110725, -9.39197833, 13.17610608],
            [-12.76101874, -13.30446697, 36.81342504, -7.09711499, -12.65519618],
            [29.89142407, -14.19727178, -8.77957737, 30.80433236, -11.37007196],
        ];
        let resid = normalize(&example(), Normalization::BinomialPearson).unwrap();
        assert!(expected.abs_diff_eq(&resid.matrix, 1e-6));
    }

    #[test]
    fn test_normalization_names() {
        for norm in [
            Normalization::CellRanger,
            Normalization::CellRanger8,
            Normalization::SeuratLog,
            Normalization::BinomialDeviance,
            Normalization::BinomialPearson,
            Normalization::WithSizeFactors,
            Normalization::LogTransform,
        ] {
            assert_eq!(norm.to_string().parse::<Normalization>().unwrap(), norm);
        }
        assert!("tpm".parse::<Normalization>().is_err());
    }
}
