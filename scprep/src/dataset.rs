//! The `Dataset` carried through the preprocessing pipeline

use crate::auto_clean::{auto_clean, AutoClean, AutoCleanReport};
use crate::detect::{detect_ercc, detect_mito, Detected};
use crate::dim_red::{Pca, PrincipalComponents};
use crate::filter::{exclude_cells, remove_empty, simple_filter, Removed, SimpleFilter};
use crate::load::{load_delimited, load_mtx};
use crate::normalization::{normalize, Normalization};
use crate::qc;
use anyhow::{format_err, Error};
use log::info;
use scprep_types::{CellQc, CountMatrix, GeneAnnotation, NormalizedMatrix};
use std::collections::HashSet;
use std::path::Path;

/// A count matrix and everything derived from it. Every stage mutates the dataset in place.
///
/// `exp`, `mito` and `ercc` always share the same cells: cell filters applied to the working
/// matrix are applied to the others too.
#[derive(Clone, Debug)]
pub struct Dataset {
    /// Counts as loaded
    pub raw: CountMatrix,
    /// Working matrix of endogenous genes
    pub exp: CountMatrix,
    /// Mitochondrial genes, once detected
    pub mito: Option<CountMatrix>,
    /// ERCC spike-ins, once detected
    pub ercc: Option<CountMatrix>,
    /// Cells flagged by the last [`Dataset::auto_clean`]
    pub low_quality_cells: Vec<String>,
    /// The last normalization of `exp`. Cleared whenever `exp` changes.
    pub normalized: Option<(Normalization, NormalizedMatrix)>,
}

fn restrict_cells(mat: &CountMatrix, cells: &[String]) -> CountMatrix {
    let keep = cells.iter().map(String::as_str).collect::<HashSet<_>>();
    let mask = mat.cells.iter().map(|c| keep.contains(c.as_str())).collect::<Vec<_>>();
    mat.retain_cells(&mask)
}

impl Dataset {
    /// Start a pipeline from loaded counts
    pub fn new(counts: CountMatrix) -> Dataset {
        Dataset {
            exp: counts.clone(),
            raw: counts,
            mito: None,
            ercc: None,
            low_quality_cells: Vec::new(),
            normalized: None,
        }
    }

    /// Load a delimited text matrix, see [`load_delimited`]
    pub fn from_delimited(path: impl AsRef<Path>, delimiter: u8) -> Result<Dataset, Error> {
        Ok(Dataset::new(load_delimited(path, delimiter)?))
    }

    /// Load a Matrix Market matrix with its label files, see [`load_mtx`]
    pub fn from_mtx(
        mtx: impl AsRef<Path>,
        genes: impl AsRef<Path>,
        gene_column: usize,
        cells: impl AsRef<Path>,
    ) -> Result<Dataset, Error> {
        Ok(Dataset::new(load_mtx(mtx, genes, gene_column, cells)?))
    }

    fn set_exp(&mut self, exp: CountMatrix) {
        if exp.cells != self.exp.cells {
            self.mito = self.mito.take().map(|m| restrict_cells(&m, &exp.cells));
            self.ercc = self.ercc.take().map(|m| restrict_cells(&m, &exp.cells));
        }
        self.exp = exp;
        self.normalized = None;
    }

    /// Remove cells and genes without reads from the working matrix
    pub fn remove_empty(&mut self) -> Result<Removed, Error> {
        let (exp, removed) = remove_empty(&self.exp)?;
        self.set_exp(exp);
        Ok(removed)
    }

    /// Remove cells with few reads and genes expressed in few cells
    pub fn simple_filter(&mut self, params: &SimpleFilter) -> Result<Removed, Error> {
        let (exp, removed) = simple_filter(&self.exp, params)?;
        self.set_exp(exp);
        Ok(removed)
    }

    /// Move mitochondrial genes out of the working matrix. Returns the number of genes moved;
    /// an earlier detection is kept if nothing matches.
    pub fn detect_mito(&mut self, pattern: &str) -> Result<usize, Error> {
        let Detected { remaining, detected } = detect_mito(&self.exp, pattern)?;
        Ok(self.take_detected(remaining, detected, |ds, m| ds.mito = Some(m)))
    }

    /// Move ERCC spike-ins out of the working matrix. Returns the number of genes moved.
    pub fn detect_ercc(&mut self, pattern: &str) -> Result<usize, Error> {
        let Detected { remaining, detected } = detect_ercc(&self.exp, pattern)?;
        Ok(self.take_detected(remaining, detected, |ds, m| ds.ercc = Some(m)))
    }

    fn take_detected(
        &mut self,
        remaining: CountMatrix,
        detected: Option<CountMatrix>,
        store: impl FnOnce(&mut Dataset, CountMatrix),
    ) -> usize {
        match detected {
            Some(m) => {
                let n = m.n_genes();
                self.set_exp(remaining);
                store(self, m);
                n
            }
            None => 0,
        }
    }

    /// Flag low-quality cells, see [`auto_clean`]. The flagged cells are stored in
    /// `low_quality_cells`; call [`Dataset::exclude_low_quality`] to remove them.
    pub fn auto_clean<S: AsRef<str>>(
        &mut self,
        rrna_genes: &[S],
        params: &AutoClean,
    ) -> Result<AutoCleanReport, Error> {
        let report = auto_clean(self, rrna_genes, params)?;
        self.low_quality_cells = report.low_quality_cells.clone();
        Ok(report)
    }

    /// Remove the cells flagged by the last [`Dataset::auto_clean`]
    pub fn exclude_low_quality(&mut self) -> Result<Removed, Error> {
        if self.low_quality_cells.is_empty() {
            info!("no low quality cells to exclude");
            return Ok(Removed::default());
        }
        let (exp, removed) = exclude_cells(&self.exp, &self.low_quality_cells)?;
        self.set_exp(exp);
        self.low_quality_cells.clear();
        Ok(removed)
    }

    /// Normalize the working matrix and keep the result
    pub fn normalize(&mut self, norm: Normalization) -> Result<&NormalizedMatrix, Error> {
        let normalized = normalize(&self.exp, norm)?;
        let entry = self.normalized.insert((norm, normalized));
        Ok(&entry.1)
    }

    /// Principal components of the last normalization, see [`Pca::run_pca`]
    pub fn pca(&self, params: &Pca) -> Result<PrincipalComponents, Error> {
        let (_, normalized) = self
            .normalized
            .as_ref()
            .ok_or_else(|| format_err!("no normalized matrix; run normalize first"))?;
        params.run_pca(normalized)
    }

    /// QC metrics of every cell of the working matrix
    pub fn cell_qc<S: AsRef<str>>(&self, rrna_genes: &[S]) -> Result<Vec<CellQc>, Error> {
        qc::cell_qc(&self.exp, self.mito.as_ref(), self.ercc.as_ref(), rrna_genes)
    }

    /// Totals and classes of every gene: working matrix, mitochondrial and ERCC
    pub fn gene_annotations(&self) -> Vec<GeneAnnotation> {
        qc::gene_annotations(&self.exp, self.mito.as_ref(), self.ercc.as_ref())
    }
}
