//! Principal component analysis of a normalized expression matrix by dense SVD

use crate::normalization::scale_and_center;
use crate::robust::to_dmatrix;
use anyhow::{ensure, format_err, Error};
use log::{info, warn};
use ndarray::prelude::*;
use scprep_types::NormalizedMatrix;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Settings for [`Pca::run_pca`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Pca {
    /// number of components to keep
    pub n_comp: usize,
    /// center and scale every gene to unit variance before the decomposition. Without it the
    /// matrix is decomposed as given.
    pub scale: bool,
}

impl Default for Pca {
    fn default() -> Self {
        Pca {
            n_comp: 75,
            scale: true,
        }
    }
}

/// Components and gene loadings from [`Pca::run_pca`]
#[derive(Clone, Debug, PartialEq)]
pub struct PrincipalComponents {
    /// Row labels of `contributions`
    pub genes: Vec<String>,
    /// Row labels of `components`
    pub cells: Vec<String>,
    /// Cell coordinates, cells x components
    pub components: Array2<f64>,
    /// Absolute gene loadings, genes x components
    pub contributions: Array2<f64>,
    /// Singular values, in decreasing order
    pub singular_values: Array1<f64>,
    /// Standard deviation of each component, `d / sqrt(cells - 1)`
    pub sdev: Array1<f64>,
}

impl PrincipalComponents {
    /// Number of components
    pub fn n_comp(&self) -> usize {
        self.singular_values.len()
    }

    /// The `top` genes contributing most to `component` (0-based), strongest first
    pub fn top_contributors(&self, component: usize, top: usize) -> Result<Vec<(&str, f64)>, Error> {
        ensure!(
            component < self.n_comp(),
            "component {} requested, only {} computed",
            component,
            self.n_comp()
        );
        let col = self.contributions.column(component);
        let mut order = (0..col.len()).collect::<Vec<_>>();
        order.sort_by(|&a, &b| col[b].total_cmp(&col[a]));
        Ok(order
            .into_iter()
            .take(top)
            .map(|g| (self.genes[g].as_str(), col[g]))
            .collect())
    }
}

impl Pca {
    /// Settings with `n_comp` components and per-gene scaling
    pub fn new(n_comp: usize) -> Pca {
        Pca {
            n_comp,
            ..Pca::default()
        }
    }

    /// Decompose `mat` (genes x cells). Asking for more components than the rank bound
    /// `min(genes, cells)` returns that many instead.
    pub fn run_pca(&self, mat: &NormalizedMatrix) -> Result<PrincipalComponents, Error> {
        ensure!(self.n_comp > 0, "n_comp must be positive");
        let (n_genes, n_cells) = mat.matrix.dim();
        ensure!(n_genes > 0 && n_cells > 1, "PCA needs at least one gene and two cells");
        ensure!(mat.matrix.iter().all(|v| v.is_finite()), "normalized values must be finite");

        let rank = n_genes.min(n_cells);
        let k = if self.n_comp > rank {
            warn!("{} components requested, the matrix supports {}", self.n_comp, rank);
            rank
        } else {
            self.n_comp
        };

        let x = if self.scale {
            scale_and_center(mat.matrix.clone(), None)
        } else {
            mat.matrix.clone()
        };
        // observations are rows
        let svd = to_dmatrix(x.t()).svd(true, true);
        let u = svd.u.ok_or_else(|| format_err!("SVD did not return U"))?;
        let v_t = svd.v_t.ok_or_else(|| format_err!("SVD did not return V"))?;
        let d = svd.singular_values;

        let mut order = (0..d.len()).collect::<Vec<_>>();
        order.sort_by(|&a, &b| d[b].total_cmp(&d[a]));
        order.truncate(k);

        let singular_values = order.iter().map(|&j| d[j]).collect::<Array1<f64>>();
        let components = Array2::from_shape_fn((n_cells, k), |(i, c)| u[(i, order[c])] * d[order[c]]);
        let contributions = Array2::from_shape_fn((n_genes, k), |(g, c)| v_t[(order[c], g)].abs());
        let sdev = singular_values.mapv(|s| s / ((n_cells - 1) as f64).sqrt());
        info!("PCA: {} genes, {} cells, {} components", n_genes, n_cells, k);

        Ok(PrincipalComponents {
            genes: mat.genes.clone(),
            cells: mat.cells.clone(),
            components,
            contributions,
            singular_values,
            sdev,
        })
    }
}
