//! Automatic detection of low-quality cells from robust distances in QC-metric space

use crate::dataset::Dataset;
use crate::qc::cell_qc;
use crate::robust::MinCovDet;
use crate::stats::mean_std;
use anyhow::{ensure, format_err, Error};
use log::{info, warn};
use ndarray::prelude::*;
use scprep_types::CellQc;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Parameters of [`auto_clean`]
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AutoClean {
    /// cells further than this many standard deviations from the mean robust distance are
    /// low quality
    pub sd_thres: f64,
    /// seed for the random subsets of the robust covariance fit
    pub seed: u64,
}

impl Default for AutoClean {
    fn default() -> Self {
        AutoClean {
            sd_thres: 3.0,
            seed: 42,
        }
    }
}

/// Outcome of [`auto_clean`]
#[derive(Clone, Debug)]
pub struct AutoCleanReport {
    /// QC metrics of every cell in the working matrix
    pub metrics: Vec<CellQc>,
    /// Metrics that entered the robust fit, in column order
    pub metric_names: Vec<&'static str>,
    /// Squared robust Mahalanobis distance of every cell
    pub distances: Array1<f64>,
    /// Cells identified as low quality, in matrix order
    pub low_quality_cells: Vec<String>,
}

fn metric_table(metrics: &[CellQc], with_ercc: bool) -> (Vec<&'static str>, Array2<f64>) {
    let mut columns: Vec<(&'static str, Vec<f64>)> = vec![
        ("log_reads", metrics.iter().map(|c| (c.total_reads as f64).ln()).collect()),
        ("genes_detected", metrics.iter().map(|c| c.genes_detected as f64).collect()),
        ("perc_rrna", metrics.iter().map(|c| c.perc_rrna).collect()),
        ("perc_mito", metrics.iter().map(|c| c.perc_mito).collect()),
    ];
    if with_ercc {
        columns.push(("perc_ercc", metrics.iter().map(|c| c.perc_ercc).collect()));
    }

    columns.retain(|(name, values)| {
        let constant = values.windows(2).all(|w| w[0] == w[1]);
        if constant {
            warn!("QC metric {} is constant across cells and is ignored", name);
        }
        !constant
    });

    let names = columns.iter().map(|(name, _)| *name).collect::<Vec<_>>();
    let table = Array2::from_shape_fn((metrics.len(), columns.len()), |(i, j)| columns[j].1[i]);
    (names, table)
}

/// Identify low-quality cells of `ds.exp`. Mitochondrial genes must have been detected first;
/// ERCC percentages are used when ERCC spike-ins were detected. `rrna_genes` names the rRNA
/// genes of the working matrix.
pub fn auto_clean<S: AsRef<str>>(ds: &Dataset, rrna_genes: &[S], params: &AutoClean) -> Result<AutoCleanReport, Error> {
    ensure!(params.sd_thres >= 0.0, "sd_thres must be non-negative");
    let mito = ds
        .mito
        .as_ref()
        .ok_or_else(|| format_err!("no mitochondrial genes detected; run detect_mito first"))?;
    let metrics = cell_qc(&ds.exp, Some(mito), ds.ercc.as_ref(), rrna_genes)?;
    if let Some(empty) = metrics.iter().find(|c| c.total_reads == 0) {
        return Err(format_err!("cell {} has no reads; run remove_empty first", empty.cell));
    }

    let (metric_names, table) = metric_table(&metrics, ds.ercc.is_some());
    let distances = if metric_names.is_empty() {
        warn!("every QC metric is constant, no cell can be flagged");
        Array1::zeros(metrics.len())
    } else {
        let mcd = MinCovDet::fit(table.view(), params.seed)?;
        mcd.mahalanobis(table.view())?
    };

    let (mean, sd) = mean_std(&distances.to_vec()).ok_or_else(|| format_err!("no cells to clean"))?;
    let lower = mean - params.sd_thres * sd;
    let upper = mean + params.sd_thres * sd;

    let low_quality_cells = metrics
        .iter()
        .zip(&distances)
        .filter(|&(_, &d)| d < lower || d > upper)
        .map(|(c, _)| c.cell.clone())
        .collect::<Vec<_>>();
    info!("{} low quality cell(s) identified", low_quality_cells.len());

    Ok(AutoCleanReport {
        metrics,
        metric_names,
        distances,
        low_quality_cells,
    })
}

#[cfg(test)]
mod test_auto_clean {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;
    use scprep_types::CountMatrix;

    const N_CELLS: usize = 60;

    /// 20 endogenous genes, one rRNA gene, two mitochondrial genes and two ERCC spikes. The last
    /// cell is dominated by mitochondrial reads.
    fn dataset(with_outlier: bool) -> Dataset {
        let mut rng = Pcg64::seed_from_u64(3);
        let mut genes = (0..20).map(|i| format!("Gene{i}")).collect::<Vec<_>>();
        genes.extend(["Rn45s", "mt-Co1", "mt-Nd1", "ERCC-00002", "ERCC-00004"].map(String::from));
        let cells = (0..N_CELLS + 1).map(|i| format!("cell{i}")).collect::<Vec<_>>();

        let mut triplets = Vec::new();
        for cell in 0..=N_CELLS {
            for gene in 0..20 {
                let count = if rng.gen_bool(0.3) { 0 } else { rng.gen_range(1..50) };
                triplets.push((gene, cell, count));
            }
            triplets.push((20, cell, rng.gen_range(5..15)));
            let mito = if with_outlier && cell == N_CELLS { 5000..5100 } else { 10..30 };
            triplets.push((21, cell, rng.gen_range(mito.clone())));
            triplets.push((22, cell, rng.gen_range(mito)));
            triplets.push((23, cell, rng.gen_range(1..10)));
            triplets.push((24, cell, rng.gen_range(1..10)));
        }
        let mut ds = Dataset::new(CountMatrix::from_triplets(genes, cells, triplets).unwrap());
        ds.remove_empty().unwrap();
        ds
    }

    #[test]
    fn test_flags_mito_outlier() {
        let mut ds = dataset(true);
        ds.detect_mito(crate::detect::DEFAULT_MITO_PATTERN).unwrap();
        ds.detect_ercc(crate::detect::DEFAULT_ERCC_PATTERN).unwrap();

        let report = auto_clean(&ds, &["Rn45s"], &AutoClean::default()).unwrap();
        assert_eq!(
            report.metric_names,
            vec!["log_reads", "genes_detected", "perc_rrna", "perc_mito", "perc_ercc"]
        );
        assert_eq!(report.metrics.len(), N_CELLS + 1);
        assert_eq!(report.distances.len(), N_CELLS + 1);
        assert_eq!(report.low_quality_cells, vec![format!("cell{N_CELLS}")]);
    }

    #[test]
    fn test_without_ercc() {
        let mut ds = dataset(true);
        ds.detect_mito(crate::detect::DEFAULT_MITO_PATTERN).unwrap();
        let report = auto_clean(&ds, &["Rn45s"], &AutoClean::default()).unwrap();
        assert_eq!(report.metric_names.len(), 4);
        assert!(report.low_quality_cells.contains(&format!("cell{N_CELLS}")));
    }

    #[test]
    fn test_constant_metric_is_dropped() {
        let mut ds = dataset(false);
        ds.detect_mito(crate::detect::DEFAULT_MITO_PATTERN).unwrap();
        // no rRNA genes: perc_rrna is zero everywhere
        let report = auto_clean::<&str>(&ds, &[], &AutoClean::default()).unwrap();
        assert_eq!(report.metric_names, vec!["log_reads", "genes_detected", "perc_mito"]);
    }

    fn small(cells: usize, counts: impl Fn(usize) -> [u32; 3]) -> Dataset {
        let genes = ["Gene0", "Gene1", "mt-Co1"].map(String::from).to_vec();
        let names = (0..cells).map(|i| format!("cell{i}")).collect();
        let triplets = (0..cells)
            .flat_map(|c| counts(c).into_iter().enumerate().map(move |(g, n)| (g, c, n)))
            .collect::<Vec<_>>();
        let mut ds = Dataset::new(CountMatrix::from_triplets(genes, names, triplets).unwrap());
        ds.detect_mito(crate::detect::DEFAULT_MITO_PATTERN).unwrap();
        ds
    }

    #[test]
    fn test_cell_without_reads() {
        // the last cell only has mitochondrial reads
        let ds = small(10, |c| if c == 9 { [0, 0, 7] } else { [5 + c as u32, 3, 2] });
        let err = auto_clean::<&str>(&ds, &[], &AutoClean::default()).unwrap_err();
        assert!(err.to_string().contains("cell9 has no reads"), "{err}");
    }

    #[test]
    fn test_all_metrics_constant() {
        let ds = small(10, |_| [5, 3, 2]);
        let report = auto_clean::<&str>(&ds, &[], &AutoClean::default()).unwrap();
        assert!(report.metric_names.is_empty());
        assert_eq!(report.distances, Array1::<f64>::zeros(10));
        assert!(report.low_quality_cells.is_empty());
    }

    #[test]
    fn test_requires_mito() {
        let ds = dataset(true);
        let err = auto_clean(&ds, &["Rn45s"], &AutoClean::default()).unwrap_err();
        assert!(err.to_string().contains("detect_mito"));
    }
}
