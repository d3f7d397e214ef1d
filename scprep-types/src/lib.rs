//! # scprep-types: data types shared by the scprep preprocessing stages

#![deny(missing_docs)]

/// Per-cell and per-gene quality annotations
pub mod annotation;

/// Labelled count and expression matrices
pub mod matrix;

pub use annotation::{CellQc, GeneAnnotation, GeneClass};
pub use matrix::{CountMatrix, GenericExprMatrix, NormalizedMatrix};
