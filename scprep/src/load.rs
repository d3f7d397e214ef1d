use anyhow::{bail, ensure, format_err, Context, Error};
use flate2::bufread::MultiGzDecoder;
use log::info;
use scprep_types::CountMatrix;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// Open a file for buffered reading, decompressing it if the name ends in `.gz`
fn open_maybe_gz(path: &Path) -> Result<Box<dyn BufRead>, Error> {
    let file = BufReader::new(File::open(path).with_context(|| path.display().to_string())?);
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(file))
    }
}

/// Parse a read count. Integral floats such as `3.0` are accepted.
fn parse_count(field: &str) -> Result<u32, Error> {
    if let Ok(v) = field.parse::<u32>() {
        return Ok(v);
    }
    let v: f64 = field.parse().map_err(|_| format_err!("invalid count '{}'", field))?;
    ensure!(
        v >= 0.0 && v.fract() == 0.0 && v <= f64::from(u32::MAX),
        "invalid count '{}': counts must be non-negative integers",
        field
    );
    Ok(v as u32)
}

/// Load a delimited text count matrix (genes as rows, cells as columns) from `path`.
/// Files ending in `.gz` are decompressed.
///
/// The first line holds the cell labels, optionally preceded by a corner field. Every other
/// line is a gene label followed by one count per cell.
pub fn load_delimited(path: impl AsRef<Path>, delimiter: u8) -> Result<CountMatrix, Error> {
    let path = path.as_ref();
    let reader = open_maybe_gz(path)?;
    let matrix = read_delimited(reader, delimiter).with_context(|| format!("failed to load {}", path.display()))?;
    info!(
        "loaded {} genes x {} cells from {}",
        matrix.n_genes(),
        matrix.n_cells(),
        path.display()
    );
    Ok(matrix)
}

/// Read a delimited text count matrix from any reader. See [`load_delimited`].
pub fn read_delimited<R: Read>(reader: R, delimiter: u8) -> Result<CountMatrix, Error> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut records = rdr.records();

    let header: Vec<String> = match records.next() {
        Some(record) => record.context("line 1")?.iter().map(str::to_string).collect(),
        None => bail!("empty input: no header line"),
    };

    let mut cells: Option<Vec<String>> = None;
    let mut genes = Vec::new();
    let mut triplets = Vec::new();

    for (i, record) in records.enumerate() {
        let line = i + 2;
        let record = record.with_context(|| format!("line {line}"))?;
        let mut fields = record.iter();
        let gene = fields.next().unwrap_or_default();
        ensure!(!gene.is_empty(), "line {}: missing gene label", line);

        // The header either has a corner field above the gene labels or it does not.
        let n_cells = cells
            .get_or_insert_with(|| {
                if header.len() + 1 == record.len() {
                    header.clone()
                } else {
                    header.iter().skip(1).cloned().collect()
                }
            })
            .len();
        ensure!(
            record.len() == n_cells + 1,
            "line {}: expected {} counts but found {}",
            line,
            n_cells,
            record.len() - 1
        );

        let row = genes.len();
        for (col, field) in fields.enumerate() {
            let count = parse_count(field).with_context(|| format!("line {}, column {}", line, col + 2))?;
            if count > 0 {
                triplets.push((row, col, count));
            }
        }
        genes.push(gene.to_string());
    }

    let Some(cells) = cells else { bail!("no gene rows found") };
    ensure!(!cells.is_empty(), "no cells found in header");
    CountMatrix::from_triplets(genes, cells, triplets)
}

/// Read one label per line, taking the tab-separated field at `column`
fn read_labels(path: &Path, column: usize) -> Result<Vec<String>, Error> {
    let reader = open_maybe_gz(path)?;
    let mut labels = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line.with_context(|| path.display().to_string())?;
        if line.trim().is_empty() {
            continue;
        }
        let label = line
            .split('\t')
            .nth(column)
            .ok_or_else(|| format_err!("{}: line {} has no column {}", path.display(), i + 1, column + 1))?;
        labels.push(label.trim().to_string());
    }
    Ok(labels)
}

/// Load a `CountMatrix` from Matrix Market coordinate format (plain or gzipped), with gene
/// labels taken from column `gene_column` (0-based) of the tab-separated `genes` file and cell
/// labels from the first column of `cells`.
pub fn load_mtx(
    mtx: impl AsRef<Path>,
    genes: impl AsRef<Path>,
    gene_column: usize,
    cells: impl AsRef<Path>,
) -> Result<CountMatrix, Error> {
    let path = mtx.as_ref();
    let mut gz = open_maybe_gz(path)?;
    let mut line = String::new();
    let mut shape: Option<(usize, usize, usize)> = None;
    let mut triplets = Vec::new();
    let mut lineno = 0;

    loop {
        line.clear();
        let sz = gz.read_line(&mut line).with_context(|| path.display().to_string())?;
        if sz == 0 {
            break;
        }
        lineno += 1;
        if line.starts_with('%') || line.trim().is_empty() {
            continue;
        }
        let mut data = line.split_whitespace();
        let mut next_index = |what: &str| -> Result<usize, Error> {
            data.next()
                .ok_or_else(|| format_err!("{}:{}: missing {}", path.display(), lineno, what))?
                .parse::<usize>()
                .with_context(|| format!("{}:{}: invalid {}", path.display(), lineno, what))
        };
        match shape {
            None => {
                let nrow = next_index("NROW")?;
                let ncol = next_index("NCOL")?;
                let nnz = next_index("NNZ")?;
                shape = Some((nrow, ncol, nnz));
            }
            Some((nrow, ncol, _)) => {
                let row = next_index("ROW")?;
                let col = next_index("COL")?;
                ensure!(
                    (1..=nrow).contains(&row) && (1..=ncol).contains(&col),
                    "{}:{}: entry ({}, {}) outside a {} x {} matrix",
                    path.display(),
                    lineno,
                    row,
                    col,
                    nrow,
                    ncol
                );
                let val = data
                    .next()
                    .ok_or_else(|| format_err!("{}:{}: missing VAL", path.display(), lineno))
                    .and_then(parse_count)
                    .with_context(|| format!("{}:{}", path.display(), lineno))?;
                triplets.push((row - 1, col - 1, val));
            }
        }
    }

    let Some((nrow, ncol, nnz)) = shape else { bail!("{}: no matrix found", path.display()) };
    ensure!(
        triplets.len() == nnz,
        "{}: header declares {} entries but {} were found",
        path.display(),
        nnz,
        triplets.len()
    );

    let genes = read_labels(genes.as_ref(), gene_column)?;
    let cells = read_labels(cells.as_ref(), 0)?;
    ensure!(
        genes.len() == nrow,
        "matrix has {} rows but the gene file has {} labels",
        nrow,
        genes.len()
    );
    ensure!(
        cells.len() == ncol,
        "matrix has {} columns but the cell file has {} labels",
        ncol,
        cells.len()
    );

    let matrix = CountMatrix::from_triplets(genes, cells, triplets)?;
    info!(
        "loaded {} genes x {} cells ({} non-zero) from {}",
        matrix.n_genes(),
        matrix.n_cells(),
        matrix.nnz(),
        path.display()
    );
    Ok(matrix)
}

#[cfg(test)]
mod test_load {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_read_delimited_with_corner() {
        let text = "gene\tA\tB\tC\nmt-Co1\t1\t0\t4\nActb\t0\t0\t2.0\n";
        let m = read_delimited(text.as_bytes(), b'\t').unwrap();
        assert_eq!(m.genes, vec!["mt-Co1", "Actb"]);
        assert_eq!(m.cells, vec!["A", "B", "C"]);
        assert_eq!(m.to_dense(), array![[1, 0, 4], [0, 0, 2]]);
    }

    #[test]
    fn test_read_delimited_without_corner() {
        let text = "\"A\",\"B\"\n\"g1\",3,0\n\"g2\",0,5\n";
        let m = read_delimited(text.as_bytes(), b',').unwrap();
        assert_eq!(m.cells, vec!["A", "B"]);
        assert_eq!(m.to_dense(), array![[3, 0], [0, 5]]);
    }

    #[test]
    fn test_read_delimited_errors() {
        assert!(read_delimited("".as_bytes(), b'\t').is_err());
        assert!(read_delimited("x\tA\tB\n".as_bytes(), b'\t').is_err());
        // ragged row
        assert!(read_delimited("x\tA\tB\ng1\t1\t2\ng2\t1\n".as_bytes(), b'\t').is_err());
        // negative, fractional and non-numeric counts
        assert!(read_delimited("x\tA\ng1\t-1\n".as_bytes(), b'\t').is_err());
        assert!(read_delimited("x\tA\ng1\t1.5\n".as_bytes(), b'\t').is_err());
        assert!(read_delimited("x\tA\ng1\tfoo\n".as_bytes(), b'\t').is_err());
        // duplicate labels
        assert!(read_delimited("x\tA\ng1\t1\ng1\t2\n".as_bytes(), b'\t').is_err());
        assert!(read_delimited("x\tA\tA\ng1\t1\t2\n".as_bytes(), b'\t').is_err());
    }

    #[test]
    fn test_load_delimited_files() -> Result<(), Error> {
        let plain = load_delimited("test/counts.tsv", b'\t')?;
        let gz = load_delimited("test/counts.tsv.gz", b'\t')?;
        assert_eq!(plain, gz);
        // header and gene rows compressed as separate gzip members
        let multi = load_delimited("test/counts_multi.tsv.gz", b'\t')?;
        assert_eq!(plain, multi);
        assert_eq!(plain.n_genes(), 10);
        assert_eq!(plain.n_cells(), 8);

        let err = load_delimited("test/does_not_exist.tsv", b'\t').unwrap_err();
        assert!(format!("{err:#}").contains("does_not_exist"));
        Ok(())
    }

    #[test]
    fn test_load_mtx() -> Result<(), Error> {
        let m = load_mtx("test/tiny.mtx.gz", "test/tiny_features.tsv", 1, "test/tiny_barcodes.tsv")?;
        assert_eq!(m.genes, vec!["Actb", "mt-Nd1", "ERCC-00002"]);
        assert_eq!(m.cells, vec!["AAAC-1", "AAAG-1"]);
        assert_eq!(m.to_dense(), array![[5, 0], [0, 2], [1, 3]]);

        let plain = load_mtx("test/tiny.mtx", "test/tiny_features.tsv", 1, "test/tiny_barcodes.tsv")?;
        assert_eq!(m, plain);

        // first column holds the ids
        let ids = load_mtx("test/tiny.mtx", "test/tiny_features.tsv", 0, "test/tiny_barcodes.tsv")?;
        assert_eq!(ids.genes[0], "ENSMUSG00000029580");
        Ok(())
    }

    #[test]
    fn test_load_mtx_errors() {
        assert!(load_mtx("test/bad_nnz.mtx", "test/tiny_features.tsv", 1, "test/tiny_barcodes.tsv").is_err());
        assert!(load_mtx("test/out_of_bounds.mtx", "test/tiny_features.tsv", 1, "test/tiny_barcodes.tsv").is_err());
        // header claims far more entries than the file holds
        let err = load_mtx("test/huge_nnz.mtx", "test/tiny_features.tsv", 1, "test/tiny_barcodes.tsv").unwrap_err();
        assert!(format!("{err:#}").contains("entries"));
        // repeated entries summing past u32::MAX
        let err = load_mtx("test/overflow.mtx", "test/tiny_features.tsv", 1, "test/tiny_barcodes.tsv").unwrap_err();
        assert!(format!("{err:#}").contains("overflows"));
        // gene file has three labels, barcodes file two
        assert!(load_mtx("test/tiny.mtx", "test/tiny_barcodes.tsv", 0, "test/tiny_barcodes.tsv").is_err());
    }
}
