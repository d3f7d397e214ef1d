//! # scprep: single-cell RNA-seq preprocessing in Rust

#![deny(missing_docs)]

/// Automatic exclusion of low-quality cells
pub mod auto_clean;

/// The dataset mutated by each pipeline stage
pub mod dataset;

/// Principal component analysis
pub mod dim_red;

/// Mitochondrial and ERCC gene detection
pub mod detect;

/// Cell and gene filters
pub mod filter;

/// Delimited text and MTX loading routines
pub mod load;

/// Count matrix normalization methods
pub mod normalization;

/// Quality-control summaries per cell and per gene
pub mod qc;

/// Robust covariance estimation
pub mod robust;

pub mod stats;

pub use auto_clean::{AutoClean, AutoCleanReport};
pub use dataset::Dataset;
pub use dim_red::{Pca, PrincipalComponents};
pub use filter::{MinExpressed, Removed, SimpleFilter};
pub use normalization::Normalization;
pub use scprep_types::{CellQc, CountMatrix, GeneAnnotation, GeneClass, NormalizedMatrix};
