//! Removal of empty and low-quality cells and genes

use anyhow::{bail, ensure, format_err, Error};
use log::info;
use scprep_types::CountMatrix;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;

/// How many cells and genes a filter removed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Removed {
    /// Cells removed
    pub cells: usize,
    /// Genes removed
    pub genes: usize,
}

fn count_false(mask: &[bool]) -> usize {
    mask.iter().filter(|&&k| !k).count()
}

fn ensure_not_empty(mat: &CountMatrix, filter: &str) -> Result<(), Error> {
    if mat.n_cells() == 0 {
        bail!("{} removed every cell", filter);
    }
    if mat.n_genes() == 0 {
        bail!("{} removed every gene", filter);
    }
    Ok(())
}

/// Remove cells and genes without a single read. Both are decided on `mat`.
pub fn remove_empty(mat: &CountMatrix) -> Result<(CountMatrix, Removed), Error> {
    let keep_cells = mat.genes_detected().iter().map(|&n| n > 0).collect::<Vec<_>>();
    let keep_genes = mat.cells_expressing().iter().map(|&n| n > 0).collect::<Vec<_>>();
    let removed = Removed {
        cells: count_false(&keep_cells),
        genes: count_false(&keep_genes),
    };
    info!("{} empty cells will be removed", removed.cells);
    info!("{} empty genes will be removed", removed.genes);

    let out = mat.retain_cells(&keep_cells).retain_genes(&keep_genes);
    ensure_not_empty(&out, "remove_empty")?;
    Ok((out, removed))
}

/// Minimum number of expressing cells for a gene to survive [`simple_filter`]
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MinExpressed {
    /// more than this many cells
    Cells(usize),
    /// more than this fraction of cells
    Fraction(f64),
}

impl MinExpressed {
    fn is_active(&self) -> bool {
        match *self {
            MinExpressed::Cells(n) => n > 0,
            MinExpressed::Fraction(f) => f > 0.0,
        }
    }

    fn passes(&self, expressing: usize, n_cells: usize) -> bool {
        match *self {
            MinExpressed::Cells(n) => expressing > n,
            MinExpressed::Fraction(f) => expressing as f64 / n_cells as f64 > f,
        }
    }
}

impl FromStr for MinExpressed {
    type Err = Error;

    /// Integers are cell counts, anything with a decimal point or exponent is a fraction
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(n) = s.parse::<usize>() {
            return Ok(MinExpressed::Cells(n));
        }
        let f = s
            .parse::<f64>()
            .map_err(|_| format_err!("minimum expression not recognized: {}", s))?;
        ensure!((0.0..=1.0).contains(&f), "fraction of cells must be in [0, 1]: {}", s);
        Ok(MinExpressed::Fraction(f))
    }
}

/// Parameters of [`simple_filter`]
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SimpleFilter {
    /// cells need more than this many reads
    pub min_reads: u64,
    /// genes need to be expressed in more than this many cells
    pub min_expressed: MinExpressed,
}

impl Default for SimpleFilter {
    fn default() -> Self {
        SimpleFilter {
            min_reads: 1000,
            min_expressed: MinExpressed::Fraction(0.001),
        }
    }
}

/// Remove cells with too few reads, then genes expressed in too few of the remaining cells
pub fn simple_filter(mat: &CountMatrix, params: &SimpleFilter) -> Result<(CountMatrix, Removed), Error> {
    let keep_cells = mat
        .cell_totals()
        .iter()
        .map(|&t| t > params.min_reads)
        .collect::<Vec<_>>();
    let mut removed = Removed {
        cells: count_false(&keep_cells),
        genes: 0,
    };
    info!("{} cells removed", removed.cells);
    let mut out = mat.retain_cells(&keep_cells);
    if out.n_cells() == 0 {
        bail!("no cell has more than {} reads", params.min_reads);
    }

    if params.min_expressed.is_active() {
        let n_cells = out.n_cells();
        let keep_genes = out
            .cells_expressing()
            .iter()
            .map(|&c| params.min_expressed.passes(c, n_cells))
            .collect::<Vec<_>>();
        removed.genes = count_false(&keep_genes);
        info!("Removed {} genes.", removed.genes);
        out = out.retain_genes(&keep_genes);
    }

    ensure_not_empty(&out, "simple_filter")?;
    Ok((out, removed))
}

/// Remove the named cells. Names not in the matrix are ignored.
pub fn exclude_cells<S: AsRef<str>>(mat: &CountMatrix, cells: &[S]) -> Result<(CountMatrix, Removed), Error> {
    let drop = cells.iter().map(AsRef::as_ref).collect::<HashSet<&str>>();
    let keep = mat.cells.iter().map(|c| !drop.contains(c.as_str())).collect::<Vec<_>>();
    let removed = Removed {
        cells: count_false(&keep),
        genes: 0,
    };
    info!("{} cells excluded", removed.cells);
    let out = mat.retain_cells(&keep);
    ensure_not_empty(&out, "exclude_cells")?;
    Ok((out, removed))
}
