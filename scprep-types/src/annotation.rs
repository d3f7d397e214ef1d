use serde::{Deserialize, Serialize};

/// Quality-control metrics for one cell
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellQc {
    /// Cell label
    pub cell: String,
    /// Reads in the working (endogenous) matrix
    pub total_reads: u64,
    /// Genes with at least one read
    pub genes_detected: usize,
    /// Mitochondrial reads as a percentage of `total_reads`
    pub perc_mito: f64,
    /// ERCC spike-in reads as a percentage of `total_reads`
    pub perc_ercc: f64,
    /// Ribosomal RNA reads as a percentage of `total_reads`
    pub perc_rrna: f64,
}

/// Which container a gene ended up in after detection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneClass {
    /// Regular gene in the working matrix
    Endogenous,
    /// Mitochondrially encoded gene
    Mitochondrial,
    /// ERCC spike-in control
    Ercc,
}

/// Per-gene summary
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneAnnotation {
    /// Gene label
    pub gene: String,
    /// Reads summed over all cells
    pub total_reads: u64,
    /// Cells with at least one read
    pub cells_expressing: usize,
    /// Container the gene belongs to
    pub class: GeneClass,
}

impl GeneAnnotation {
    /// True if at least one cell expresses the gene
    pub fn is_expressed(&self) -> bool {
        self.cells_expressing > 0
    }
}
