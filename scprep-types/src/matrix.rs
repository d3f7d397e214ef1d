use anyhow::{bail, ensure, format_err, Error};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use sprs::CsMatI;
use std::collections::HashSet;

/// A genes x cells matrix carrying its row (gene) and column (cell) labels.
#[derive(Clone, Debug, PartialEq)]
pub struct GenericExprMatrix<M> {
    /// Row labels, one per gene
    pub genes: Vec<String>,
    /// Column labels, one per cell
    pub cells: Vec<String>,
    /// The values
    pub matrix: M,
}

/// Sparse count storage: compressed sparse column, one outer vector per cell.
pub type CountMat = CsMatI<u32, usize>;

/// Raw read counts
pub type CountMatrix = GenericExprMatrix<CountMat>;

/// Normalized expression values, dense
pub type NormalizedMatrix = GenericExprMatrix<Array2<f64>>;

fn check_unique(labels: &[String], axis: &str) -> Result<(), Error> {
    let mut seen = HashSet::with_capacity(labels.len());
    for l in labels {
        if !seen.insert(l.as_str()) {
            bail!("duplicate {} label: {}", axis, l);
        }
    }
    Ok(())
}

fn check_labels(genes: &[String], cells: &[String], shape: (usize, usize)) -> Result<(), Error> {
    ensure!(
        shape.0 == genes.len(),
        "matrix has {} rows but {} gene labels were given",
        shape.0,
        genes.len()
    );
    ensure!(
        shape.1 == cells.len(),
        "matrix has {} columns but {} cell labels were given",
        shape.1,
        cells.len()
    );
    check_unique(genes, "gene")?;
    check_unique(cells, "cell")
}

/// Accumulates a CSC matrix one column at a time. Rows must be pushed in increasing order
/// within a column; zero values are skipped.
struct CscBuilder {
    rows: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    data: Vec<u32>,
}

impl CscBuilder {
    fn new(rows: usize) -> CscBuilder {
        CscBuilder {
            rows,
            indptr: vec![0],
            indices: Vec::new(),
            data: Vec::new(),
        }
    }

    #[inline]
    fn push(&mut self, row: usize, value: u32) {
        if value > 0 {
            self.indices.push(row);
            self.data.push(value);
        }
    }

    fn finish_col(&mut self) {
        self.indptr.push(self.indices.len());
    }

    fn build(self) -> CountMat {
        let cols = self.indptr.len() - 1;
        CsMatI::new_csc((self.rows, cols), self.indptr, self.indices, self.data)
    }
}

impl<M> GenericExprMatrix<M> {
    /// Number of genes (rows)
    pub fn n_genes(&self) -> usize {
        self.genes.len()
    }

    /// Number of cells (columns)
    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }

    /// True if the matrix has no genes or no cells
    pub fn is_empty(&self) -> bool {
        self.genes.is_empty() || self.cells.is_empty()
    }

    /// Row index of a gene label
    pub fn gene_index(&self, gene: &str) -> Option<usize> {
        self.genes.iter().position(|g| g == gene)
    }

    /// Column index of a cell label
    pub fn cell_index(&self, cell: &str) -> Option<usize> {
        self.cells.iter().position(|c| c == cell)
    }
}

impl NormalizedMatrix {
    /// Wrap a dense genes x cells array, validating the labels
    pub fn new(genes: Vec<String>, cells: Vec<String>, matrix: Array2<f64>) -> Result<NormalizedMatrix, Error> {
        check_labels(&genes, &cells, matrix.dim())?;
        Ok(NormalizedMatrix { genes, cells, matrix })
    }
}

impl CountMatrix {
    /// Wrap a sparse genes x cells matrix, validating the labels. The matrix is converted to
    /// CSC storage if needed and explicit zeros are dropped.
    pub fn new(genes: Vec<String>, cells: Vec<String>, matrix: CountMat) -> Result<CountMatrix, Error> {
        check_labels(&genes, &cells, matrix.shape())?;
        let matrix = if matrix.is_csc() { matrix } else { matrix.to_csc() };

        let mut builder = CscBuilder::new(matrix.rows());
        for col in matrix.outer_iterator() {
            for (row, &v) in col.iter() {
                builder.push(row, v);
            }
            builder.finish_col();
        }
        Ok(CountMatrix {
            genes,
            cells,
            matrix: builder.build(),
        })
    }

    /// Build from `(gene, cell, count)` triplets. Repeated coordinates are summed; a sum that
    /// does not fit in a `u32` is an error.
    pub fn from_triplets(
        genes: Vec<String>,
        cells: Vec<String>,
        triplets: impl IntoIterator<Item = (usize, usize, u32)>,
    ) -> Result<CountMatrix, Error> {
        let shape = (genes.len(), cells.len());
        check_labels(&genes, &cells, shape)?;

        // (cell, gene, count), so sorting yields CSC order
        let mut entries = Vec::new();
        for (row, col, val) in triplets {
            ensure!(
                row < shape.0 && col < shape.1,
                "entry ({}, {}) is outside a {} x {} matrix",
                row,
                col,
                shape.0,
                shape.1
            );
            if val > 0 {
                entries.push((col, row, val));
            }
        }
        entries.sort_unstable_by_key(|&(col, row, _)| (col, row));

        let mut merged: Vec<(usize, usize, u32)> = Vec::with_capacity(entries.len());
        for (col, row, val) in entries {
            match merged.last_mut() {
                Some(last) if last.0 == col && last.1 == row => {
                    last.2 = last.2.checked_add(val).ok_or_else(|| {
                        format_err!("count for gene {} in cell {} overflows", genes[row], cells[col])
                    })?;
                }
                _ => merged.push((col, row, val)),
            }
        }

        let mut builder = CscBuilder::new(shape.0);
        let mut entries = merged.into_iter().peekable();
        for col in 0..shape.1 {
            while let Some((_, row, val)) = entries.next_if(|&(c, _, _)| c == col) {
                builder.push(row, val);
            }
            builder.finish_col();
        }
        Ok(CountMatrix {
            genes,
            cells,
            matrix: builder.build(),
        })
    }

    /// Build from a dense genes x cells array
    pub fn from_dense(genes: Vec<String>, cells: Vec<String>, dense: ArrayView2<u32>) -> Result<CountMatrix, Error> {
        check_labels(&genes, &cells, dense.dim())?;
        let mut builder = CscBuilder::new(dense.nrows());
        for col in dense.axis_iter(Axis(1)) {
            for (row, &v) in col.iter().enumerate() {
                builder.push(row, v);
            }
            builder.finish_col();
        }
        Ok(CountMatrix {
            genes,
            cells,
            matrix: builder.build(),
        })
    }

    /// Number of stored non-zero counts
    pub fn nnz(&self) -> usize {
        self.matrix.nnz()
    }

    /// Count for one gene in one cell
    pub fn get(&self, gene: usize, cell: usize) -> u32 {
        self.matrix.get(gene, cell).copied().unwrap_or(0)
    }

    /// Dense copy of the counts
    pub fn to_dense(&self) -> Array2<u32> {
        self.matrix.to_dense()
    }

    /// Total reads per cell
    pub fn cell_totals(&self) -> Array1<u64> {
        self.matrix
            .outer_iterator()
            .map(|col| col.iter().map(|(_, &v)| u64::from(v)).sum::<u64>())
            .collect()
    }

    /// Total reads per gene
    pub fn gene_totals(&self) -> Array1<u64> {
        let mut totals = Array1::<u64>::zeros(self.n_genes());
        for col in self.matrix.outer_iterator() {
            for (row, &v) in col.iter() {
                totals[row] += u64::from(v);
            }
        }
        totals
    }

    /// Number of genes with a non-zero count in each cell
    pub fn genes_detected(&self) -> Array1<usize> {
        self.matrix.outer_iterator().map(|col| col.nnz()).collect()
    }

    /// Number of cells with a non-zero count for each gene
    pub fn cells_expressing(&self) -> Array1<usize> {
        let mut counts = Array1::<usize>::zeros(self.n_genes());
        for col in self.matrix.outer_iterator() {
            for (row, _) in col.iter() {
                counts[row] += 1;
            }
        }
        counts
    }

    /// Keep the cells for which `keep` is true, preserving order
    ///
    /// # Panics
    ///
    /// If `keep` does not have one entry per cell.
    pub fn retain_cells(&self, keep: &[bool]) -> CountMatrix {
        assert_eq!(keep.len(), self.n_cells(), "cell mask length does not match matrix");
        let mut builder = CscBuilder::new(self.n_genes());
        let mut cells = Vec::new();
        for ((col, cell), _) in self
            .matrix
            .outer_iterator()
            .zip(self.cells.iter())
            .zip(keep)
            .filter(|&(_, &k)| k)
        {
            for (row, &v) in col.iter() {
                builder.push(row, v);
            }
            builder.finish_col();
            cells.push(cell.clone());
        }
        CountMatrix {
            genes: self.genes.clone(),
            cells,
            matrix: builder.build(),
        }
    }

    /// Keep the genes for which `keep` is true, preserving order
    ///
    /// # Panics
    ///
    /// If `keep` does not have one entry per gene.
    pub fn retain_genes(&self, keep: &[bool]) -> CountMatrix {
        assert_eq!(keep.len(), self.n_genes(), "gene mask length does not match matrix");
        let mut row_map = vec![None; keep.len()];
        let mut genes = Vec::new();
        for (row, (gene, _)) in self.genes.iter().zip(keep).enumerate().filter(|&(_, (_, &k))| k) {
            row_map[row] = Some(genes.len());
            genes.push(gene.clone());
        }

        let mut builder = CscBuilder::new(genes.len());
        for col in self.matrix.outer_iterator() {
            for (row, &v) in col.iter() {
                if let Some(new_row) = row_map[row] {
                    builder.push(new_row, v);
                }
            }
            builder.finish_col();
        }
        CountMatrix {
            genes,
            cells: self.cells.clone(),
            matrix: builder.build(),
        }
    }

    /// Split the rows in two: genes where `moved` is false stay in the first matrix, the others
    /// go to the second. Both share this matrix's cells.
    ///
    /// # Panics
    ///
    /// If `moved` does not have one entry per gene.
    pub fn split_genes(&self, moved: &[bool]) -> (CountMatrix, CountMatrix) {
        let keep = moved.iter().map(|&m| !m).collect::<Vec<_>>();
        (self.retain_genes(&keep), self.retain_genes(moved))
    }

    /// The rows whose labels appear in `names`, in matrix order. Unknown names are ignored.
    pub fn select_genes_by_name<S: AsRef<str>>(&self, names: &[S]) -> CountMatrix {
        let wanted = names.iter().map(AsRef::as_ref).collect::<HashSet<&str>>();
        let keep = self.genes.iter().map(|g| wanted.contains(g.as_str())).collect::<Vec<_>>();
        self.retain_genes(&keep)
    }
}
