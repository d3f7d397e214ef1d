//! Detection of mitochondrial and ERCC spike-in genes by name

use anyhow::{Context, Error};
use log::info;
use regex::{Regex, RegexBuilder};
use scprep_types::CountMatrix;

/// Mitochondrial gene symbols, matched case-insensitively (`mt-`, `MT-`)
pub const DEFAULT_MITO_PATTERN: &str = "^mt-";

/// ERCC spike-in names such as `ERCC-00002` or `ERCC_00002`
pub const DEFAULT_ERCC_PATTERN: &str = r"^ERCC[_-]\S+$";

/// Result of moving the matching genes out of a matrix
#[derive(Clone, Debug, PartialEq)]
pub struct Detected {
    /// The matrix without the matching genes
    pub remaining: CountMatrix,
    /// The matching genes, or `None` if nothing matched
    pub detected: Option<CountMatrix>,
}

impl Detected {
    /// Number of genes that matched
    pub fn n_detected(&self) -> usize {
        self.detected.as_ref().map_or(0, |m| m.n_genes())
    }
}

/// Move every gene whose label matches `re` into a separate matrix
pub fn split_by_pattern(mat: &CountMatrix, re: &Regex) -> Detected {
    let moved = mat.genes.iter().map(|g| re.is_match(g)).collect::<Vec<_>>();
    if !moved.contains(&true) {
        return Detected {
            remaining: mat.clone(),
            detected: None,
        };
    }
    let (remaining, detected) = mat.split_genes(&moved);
    Detected {
        remaining,
        detected: Some(detected),
    }
}

fn build_regex(pattern: &str, case_insensitive: bool) -> Result<Regex, Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .with_context(|| format!("invalid gene pattern: {pattern}"))
}

/// Detect mitochondrial genes, matching `pattern` case-insensitively against gene labels
pub fn detect_mito(mat: &CountMatrix, pattern: &str) -> Result<Detected, Error> {
    let re = build_regex(pattern, true)?;
    let res = split_by_pattern(mat, &re);
    info!("{} mitochondrial genes detected and removed", res.n_detected());
    Ok(res)
}

/// Detect ERCC spike-ins, matching `pattern` case-sensitively against gene labels
pub fn detect_ercc(mat: &CountMatrix, pattern: &str) -> Result<Detected, Error> {
    let re = build_regex(pattern, false)?;
    let res = split_by_pattern(mat, &re);
    info!("{} ERCC spikes detected", res.n_detected());
    Ok(res)
}
