//! Per-cell and per-gene quality control summaries

use crate::stats::percent_of;
use anyhow::{ensure, Error};
use itertools::Itertools;
use log::warn;
use scprep_types::{CellQc, CountMatrix, GeneAnnotation, GeneClass};

/// Reads per cell, sorted in decreasing order (the data behind a knee plot)
pub fn reads_per_cell(mat: &CountMatrix) -> Vec<u64> {
    mat.cell_totals().iter().copied().sorted_by(|a, b| b.cmp(a)).collect()
}

/// Genes detected per cell, sorted in decreasing order
pub fn genes_per_cell(mat: &CountMatrix) -> Vec<usize> {
    mat.genes_detected().iter().copied().sorted_by(|a, b| b.cmp(a)).collect()
}

fn same_cells(mat: &CountMatrix, other: Option<&CountMatrix>, what: &str) -> Result<(), Error> {
    if let Some(other) = other {
        ensure!(
            other.cells == mat.cells,
            "{} matrix has different cells than the expression matrix",
            what
        );
    }
    Ok(())
}

fn totals_or_zero(mat: Option<&CountMatrix>, n_cells: usize) -> Vec<u64> {
    match mat {
        Some(m) => m.cell_totals().to_vec(),
        None => vec![0; n_cells],
    }
}

/// Quality metrics for every cell of `exp`. Percentages are relative to the reads in `exp`,
/// so mitochondrial and ERCC percentages can exceed 100 when those genes dominate a cell.
pub fn cell_qc<S: AsRef<str>>(
    exp: &CountMatrix,
    mito: Option<&CountMatrix>,
    ercc: Option<&CountMatrix>,
    rrna_genes: &[S],
) -> Result<Vec<CellQc>, Error> {
    same_cells(exp, mito, "mitochondrial")?;
    same_cells(exp, ercc, "ERCC")?;

    let n = exp.n_cells();
    let reads = exp.cell_totals();
    let detected = exp.genes_detected();
    let rrna = exp.select_genes_by_name(rrna_genes);
    if !rrna_genes.is_empty() && rrna.n_genes() == 0 {
        warn!("none of the {} rRNA genes were found in the matrix", rrna_genes.len());
    }
    let rrna = rrna.cell_totals();
    let mito = totals_or_zero(mito, n);
    let ercc = totals_or_zero(ercc, n);

    Ok((0..n)
        .map(|i| CellQc {
            cell: exp.cells[i].clone(),
            total_reads: reads[i],
            genes_detected: detected[i],
            perc_mito: percent_of(mito[i], reads[i]),
            perc_ercc: percent_of(ercc[i], reads[i]),
            perc_rrna: percent_of(rrna[i], reads[i]),
        })
        .collect())
}

fn annotate(mat: &CountMatrix, class: GeneClass) -> impl Iterator<Item = GeneAnnotation> + '_ {
    let totals = mat.gene_totals();
    let expressing = mat.cells_expressing();
    mat.genes
        .iter()
        .enumerate()
        .map(move |(i, gene)| GeneAnnotation {
            gene: gene.clone(),
            total_reads: totals[i],
            cells_expressing: expressing[i],
            class,
        })
}

/// One annotation per gene: endogenous genes first, then mitochondrial, then ERCC
pub fn gene_annotations(
    exp: &CountMatrix,
    mito: Option<&CountMatrix>,
    ercc: Option<&CountMatrix>,
) -> Vec<GeneAnnotation> {
    let mut out = annotate(exp, GeneClass::Endogenous).collect::<Vec<_>>();
    if let Some(m) = mito {
        out.extend(annotate(m, GeneClass::Mitochondrial));
    }
    if let Some(m) = ercc {
        out.extend(annotate(m, GeneClass::Ercc));
    }
    out
}
