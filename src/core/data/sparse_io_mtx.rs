use flate2::read::GzDecoder;
use log::{debug, info};
use rustc_hash::FxHashSet;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::core::data::sparse_structures::CompressedSparseData;
use crate::error::{Result, ScError};
use crate::utils::general::make_unique;

/////////////
// Helpers //
/////////////

const MATRIX_FILES: [&str; 1] = ["matrix.mtx"];
const GENE_FILES: [&str; 2] = ["genes.tsv", "features.tsv"];
const BARCODE_FILES: [&str; 1] = ["barcodes.tsv"];

fn load_err<T>(msg: impl Into<String>) -> Result<T> {
    Err(ScError::Load(msg.into()))
}

/// Read or decode failures of an input file are load errors
fn read_err(path: &Path, err: std::io::Error) -> ScError {
    ScError::Load(format!("{}: {}", path.display(), err))
}

/// Find the first existing file of the candidates (plain or gzipped)
///
/// ### Params
///
/// * `dir` - The directory to search in
/// * `candidates` - File names to test in order of preference
///
/// ### Returns
///
/// The path of the found file or a `ScError::Load`.
fn find_file(dir: &Path, candidates: &[&str]) -> Result<PathBuf> {
    for name in candidates {
        for suffix in ["", ".gz"] {
            let path = dir.join(format!("{}{}", name, suffix));
            if path.is_file() {
                return Ok(path);
            }
        }
    }
    load_err(format!(
        "none of {:?} (optionally gzipped) found in {}",
        candidates,
        dir.display()
    ))
}

/// Open a file, transparently decompressing `.gz` files
fn open_maybe_gz(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).map_err(|e| read_err(path, e))?;
    let is_gz = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("gz"))
        .unwrap_or(false);
    if is_gz {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Read one tab separated column of a text file
///
/// ### Params
///
/// * `path` - Path to the (gzipped) tsv file
/// * `column` - 1-based column to read; falls back to the first column if a
///   line has fewer columns.
fn read_tsv_column(path: &Path, column: usize) -> Result<Vec<String>> {
    let reader = open_maybe_gz(path)?;
    let mut res = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| read_err(path, e))?;
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        let value = fields
            .get(column.saturating_sub(1))
            .copied()
            .unwrap_or(fields[0]);
        res.push(value.to_string());
    }
    Ok(res)
}

/////////
// MTX //
/////////

/// Value field of a MatrixMarket coordinate file
#[derive(Debug, Clone, Copy, PartialEq)]
enum MtxField {
    Integer,
    Real,
    Pattern,
}

/// MTX file metadata
///
/// ### Fields
///
/// * `total_genes` - Number of rows (genes) in the .mtx header.
/// * `total_cells` - Number of columns (cells) in the .mtx header.
/// * `total_entries` - Number of entries identified in the .mtx header.
/// * `field` - The value type of the entries.
#[derive(Debug, Clone)]
struct MtxHeader {
    total_genes: usize,
    total_cells: usize,
    total_entries: usize,
    field: MtxField,
}

/// Parse the banner and size line of the mtx file
fn parse_header(reader: &mut dyn BufRead, path: &Path) -> Result<MtxHeader> {
    let mut line = String::new();
    reader.read_line(&mut line).map_err(|e| read_err(path, e))?;

    let banner: Vec<String> = line
        .split_whitespace()
        .map(|s| s.to_lowercase())
        .collect();
    if banner.len() < 5 || banner[0] != "%%matrixmarket" || banner[1] != "matrix" {
        return load_err(format!("invalid MatrixMarket banner: '{}'", line.trim()));
    }
    if banner[2] != "coordinate" {
        return load_err("only coordinate MatrixMarket files are supported");
    }
    let field = match banner[3].as_str() {
        "integer" => MtxField::Integer,
        "real" | "double" => MtxField::Real,
        "pattern" => MtxField::Pattern,
        other => return load_err(format!("unsupported MatrixMarket field '{}'", other)),
    };
    if banner[4] != "general" {
        return load_err(format!(
            "unsupported MatrixMarket symmetry '{}'",
            banner[4]
        ));
    }

    loop {
        line.clear();
        if reader.read_line(&mut line).map_err(|e| read_err(path, e))? == 0 {
            return load_err("MatrixMarket file ends before the size line");
        }
        if !line.starts_with('%') && !line.trim().is_empty() {
            break;
        }
    }

    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 3 {
        return load_err(format!("invalid MTX size line: '{}'", line.trim()));
    }
    let parse = |s: &str, what: &str| -> Result<usize> {
        s.parse::<usize>()
            .map_err(|_| ScError::Load(format!("invalid {} in MTX size line: '{}'", what, s)))
    };

    Ok(MtxHeader {
        total_genes: parse(parts[0], "row count")?,
        total_cells: parse(parts[1], "column count")?,
        total_entries: parse(parts[2], "entry count")?,
        field,
    })
}

/// Parse an mtx entry line
///
/// ### Params
///
/// * `line` - The file line
/// * `field` - The value field declared in the banner
///
/// ### Return
///
/// Returns an Option of a tuple representing `<row, col, count>` (1-based
/// indices). `None` if the line is malformed or the value is not a
/// non-negative integer.
fn parse_mtx_line(line: &str, field: MtxField) -> Option<(usize, usize, u32)> {
    let mut parts = line.split_ascii_whitespace();
    let row = parts.next()?.parse::<usize>().ok()?;
    let col = parts.next()?.parse::<usize>().ok()?;
    let value = match field {
        MtxField::Pattern => 1,
        MtxField::Integer => parts.next()?.parse::<u32>().ok()?,
        MtxField::Real => {
            let v = parts.next()?.parse::<f64>().ok()?;
            if v < 0.0 || v.fract() != 0.0 || v > u32::MAX as f64 {
                return None;
            }
            v as u32
        }
    };
    Some((row, col, value))
}

/// Read a MatrixMarket file with genes as rows and cells as columns
///
/// Duplicated coordinates are summed, explicit zeroes dropped.
///
/// ### Params
///
/// * `path` - Path to the `matrix.mtx(.gz)` file
/// * `expected_shape` - Optional `(n_genes, n_cells)` the header has to
///   declare. Checked before any storage is allocated.
///
/// ### Returns
///
/// The counts as genes x cells CSC matrix
pub fn read_mtx(
    path: &Path,
    expected_shape: Option<(usize, usize)>,
) -> Result<CompressedSparseData<u32>> {
    let mut reader = open_maybe_gz(path)?;
    let header = parse_header(reader.as_mut(), path)?;

    if let Some((n_genes, n_cells)) = expected_shape {
        if header.total_genes != n_genes || header.total_cells != n_cells {
            return load_err(format!(
                "{} declares a {} x {} matrix, expected {} genes x {} cells",
                path.display(),
                header.total_genes,
                header.total_cells,
                n_genes,
                n_cells
            ));
        }
    }

    let mut cell_data: Vec<Vec<(usize, u32)>> = vec![Vec::new(); header.total_cells];
    let mut n_entries = 0_usize;
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).map_err(|e| read_err(path, e))? == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('%') {
            continue;
        }
        let (row, col, value) = match parse_mtx_line(trimmed, header.field) {
            Some(parsed) => parsed,
            None => return load_err(format!("malformed MTX entry: '{}'", trimmed)),
        };
        if row == 0 || col == 0 || row > header.total_genes || col > header.total_cells {
            return load_err(format!(
                "MTX entry ({}, {}) outside of the declared {} x {} matrix",
                row, col, header.total_genes, header.total_cells
            ));
        }
        n_entries += 1;
        if value > 0 {
            cell_data[col - 1].push((row - 1, value));
        }
    }

    if n_entries != header.total_entries {
        return load_err(format!(
            "MTX header declares {} entries, found {}",
            header.total_entries, n_entries
        ));
    }

    let mut data: Vec<u32> = Vec::with_capacity(n_entries);
    let mut indices = Vec::with_capacity(n_entries);
    let mut indptr = Vec::with_capacity(header.total_cells + 1);
    indptr.push(0_usize);

    for (cell_idx, cell) in cell_data.iter_mut().enumerate() {
        cell.sort_unstable_by_key(|(gene, _)| *gene);
        for &(gene, value) in cell.iter() {
            if indices.len() > *indptr.last().unwrap_or(&0) && indices.last() == Some(&gene) {
                if let Some(last) = data.last_mut() {
                    *last = last.checked_add(value).ok_or_else(|| {
                        ScError::Load(format!(
                            "summed count of entry ({}, {}) overflows u32",
                            gene + 1,
                            cell_idx + 1
                        ))
                    })?;
                }
            } else {
                indices.push(gene);
                data.push(value);
            }
        }
        indptr.push(data.len());
    }

    Ok(CompressedSparseData::new_csc(
        data,
        indices,
        indptr,
        (header.total_genes, header.total_cells),
    ))
}

////////////////
// 10x reader //
////////////////

/// Parameters for reading a 10x style directory
///
/// ### Fields
///
/// * `gene_column` - 1-based column of the gene file used as identifier.
///   Defaults to `2` (gene symbols); files with a single column fall back to
///   the first one.
/// * `make_unique` - Disambiguate duplicated gene identifiers with `.1`,
///   `.2`, ... suffixes.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoadParams {
    pub gene_column: usize,
    pub make_unique: bool,
}

impl Default for LoadParams {
    fn default() -> Self {
        Self {
            gene_column: 2,
            make_unique: true,
        }
    }
}

/// Raw content of a 10x directory
///
/// ### Fields
///
/// * `counts` - Genes x cells counts (CSC).
/// * `gene_ids` - Gene identifiers, one per row.
/// * `cell_ids` - Cell barcodes, one per column.
#[derive(Clone, Debug)]
pub struct TenxData {
    pub counts: CompressedSparseData<u32>,
    pub gene_ids: Vec<String>,
    pub cell_ids: Vec<String>,
}

/// Read a 10x style directory
///
/// Expects `matrix.mtx`, `genes.tsv` (or `features.tsv`) and `barcodes.tsv`,
/// each optionally gzipped.
///
/// ### Params
///
/// * `dir` - The directory
/// * `params` - The `LoadParams`
///
/// ### Returns
///
/// The `TenxData` or a `ScError::Load` if files are missing, unreadable or
/// their dimensions disagree.
pub fn read_10x_dir<P: AsRef<Path>>(dir: P, params: &LoadParams) -> Result<TenxData> {
    let dir = dir.as_ref();
    let start = Instant::now();

    if !dir.is_dir() {
        return load_err(format!("{} is not a directory", dir.display()));
    }
    if params.gene_column == 0 {
        return Err(ScError::Configuration(
            "gene_column is 1-based and must be >= 1".into(),
        ));
    }

    let mtx_path = find_file(dir, &MATRIX_FILES)?;
    let gene_path = find_file(dir, &GENE_FILES)?;
    let barcode_path = find_file(dir, &BARCODE_FILES)?;

    let mut gene_ids = read_tsv_column(&gene_path, params.gene_column)?;
    let cell_ids = read_tsv_column(&barcode_path, 1)?;

    let counts = read_mtx(&mtx_path, Some((gene_ids.len(), cell_ids.len())))?;
    let (n_genes, n_cells) = counts.shape();

    let mut seen = FxHashSet::default();
    if let Some(dup) = cell_ids.iter().find(|id| !seen.insert(id.as_str())) {
        return load_err(format!("duplicated barcode '{}'", dup));
    }

    if params.make_unique {
        gene_ids = make_unique(&gene_ids);
    }

    debug!("Read {} non-zero entries from {}", counts.get_nnz(), mtx_path.display());
    info!(
        "Loaded {} genes x {} cells from {}: {:.2?}",
        n_genes,
        n_cells,
        dir.display(),
        start.elapsed()
    );

    Ok(TenxData {
        counts,
        gene_ids,
        cell_ids,
    })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    const MTX: &str = "%%MatrixMarket matrix coordinate integer general\n\
                       % generated for tests\n\
                       3 2 4\n\
                       1 1 5\n\
                       3 1 2\n\
                       2 2 7\n\
                       3 1 1\n";

    fn write_dir(mtx: &str, genes: &str, barcodes: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("matrix.mtx"), mtx).unwrap();
        std::fs::write(dir.path().join("genes.tsv"), genes).unwrap();
        std::fs::write(dir.path().join("barcodes.tsv"), barcodes).unwrap();
        dir
    }

    #[test]
    fn test_read_10x_dir() {
        let dir = write_dir(
            MTX,
            "ENSG1\tCD3E\nENSG2\tMT-CO1\nENSG3\tCD3E\n",
            "AAAC-1\nAAAG-1\n",
        );
        let res = read_10x_dir(dir.path(), &LoadParams::default()).unwrap();
        assert_eq!(res.counts.shape(), (3, 2));
        assert_eq!(res.gene_ids, vec!["CD3E", "MT-CO1", "CD3E.1"]);
        assert_eq!(res.cell_ids, vec!["AAAC-1", "AAAG-1"]);
        // duplicated coordinate (3, 1) is summed
        assert_eq!(res.counts.outer(0), (&[0_usize, 2][..], &[5_u32, 3][..]));
        assert_eq!(res.counts.outer(1), (&[1_usize][..], &[7_u32][..]));
    }

    #[test]
    fn test_read_gzipped_features() {
        let dir = TempDir::new().unwrap();
        let gz = |name: &str, content: &str| {
            let file = File::create(dir.path().join(name)).unwrap();
            let mut enc = GzEncoder::new(file, Compression::default());
            enc.write_all(content.as_bytes()).unwrap();
            enc.finish().unwrap();
        };
        gz("matrix.mtx.gz", MTX);
        gz("features.tsv.gz", "ENSG1\tA\tGene Expression\nENSG2\tB\tGene Expression\nENSG3\tC\tGene Expression\n");
        gz("barcodes.tsv.gz", "c1\nc2\n");

        let params = LoadParams {
            gene_column: 1,
            make_unique: true,
        };
        let res = read_10x_dir(dir.path(), &params).unwrap();
        assert_eq!(res.gene_ids, vec!["ENSG1", "ENSG2", "ENSG3"]);
        assert_eq!(res.counts.get_nnz(), 3);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("matrix.mtx"), MTX).unwrap();
        std::fs::write(dir.path().join("genes.tsv"), "a\nb\nc\n").unwrap();
        let res = read_10x_dir(dir.path(), &LoadParams::default());
        assert!(matches!(res, Err(ScError::Load(_))));
    }

    #[test]
    fn test_dimension_mismatch() {
        let dir = write_dir(MTX, "a\nb\n", "c1\nc2\n");
        let res = read_10x_dir(dir.path(), &LoadParams::default());
        assert!(matches!(res, Err(ScError::Load(_))));

        let dir = write_dir(MTX, "a\nb\nc\n", "c1\nc2\nc3\n");
        let res = read_10x_dir(dir.path(), &LoadParams::default());
        assert!(matches!(res, Err(ScError::Load(_))));
    }

    #[test]
    fn test_malformed_entries() {
        let bad_count = "%%MatrixMarket matrix coordinate integer general\n2 2 2\n1 1 3\n2 2 4\n";
        let dir = write_dir(bad_count.replace("2 2 2", "2 2 3").as_str(), "a\nb\n", "c1\nc2\n");
        assert!(matches!(
            read_10x_dir(dir.path(), &LoadParams::default()),
            Err(ScError::Load(_))
        ));

        let out_of_range = "%%MatrixMarket matrix coordinate integer general\n2 2 1\n3 1 3\n";
        let dir = write_dir(out_of_range, "a\nb\n", "c1\nc2\n");
        assert!(matches!(
            read_10x_dir(dir.path(), &LoadParams::default()),
            Err(ScError::Load(_))
        ));

        let negative = "%%MatrixMarket matrix coordinate real general\n2 2 1\n1 1 -3\n";
        let dir = write_dir(negative, "a\nb\n", "c1\nc2\n");
        assert!(matches!(
            read_10x_dir(dir.path(), &LoadParams::default()),
            Err(ScError::Load(_))
        ));
    }

    #[test]
    fn test_unreadable_files() {
        let dir = write_dir(MTX, "a\nb\nc\n", "c1\nc2\n");
        std::fs::write(dir.path().join("barcodes.tsv"), b"\xff\xfe\n\xfa\n").unwrap();
        assert!(matches!(
            read_10x_dir(dir.path(), &LoadParams::default()),
            Err(ScError::Load(_))
        ));

        let dir = write_dir(MTX, "a\nb\nc\n", "c1\nc2\n");
        std::fs::remove_file(dir.path().join("matrix.mtx")).unwrap();
        std::fs::write(dir.path().join("matrix.mtx.gz"), b"not a gzip stream").unwrap();
        assert!(matches!(
            read_10x_dir(dir.path(), &LoadParams::default()),
            Err(ScError::Load(_))
        ));
    }

    #[test]
    fn test_summed_count_overflow() {
        let mtx = format!(
            "%%MatrixMarket matrix coordinate integer general\n1 1 2\n1 1 {}\n1 1 1\n",
            u32::MAX
        );
        let dir = write_dir(&mtx, "a\n", "c1\n");
        assert!(matches!(
            read_10x_dir(dir.path(), &LoadParams::default()),
            Err(ScError::Load(_))
        ));
    }

    #[test]
    fn test_header_checked_against_barcodes() {
        let forged = "%%MatrixMarket matrix coordinate integer general\n3 1000000000000 0\n";
        let dir = write_dir(forged, "a\nb\nc\n", "c1\nc2\n");
        assert!(matches!(
            read_10x_dir(dir.path(), &LoadParams::default()),
            Err(ScError::Load(_))
        ));

        let dir = write_dir(MTX, "a\nb\nc\n", "c1\nc2\n");
        assert!(matches!(
            read_mtx(&dir.path().join("matrix.mtx"), Some((3, 5))),
            Err(ScError::Load(_))
        ));
        assert_eq!(
            read_mtx(&dir.path().join("matrix.mtx"), None).unwrap().shape(),
            (3, 2)
        );
    }

    #[test]
    fn test_duplicated_barcodes() {
        let dir = write_dir(MTX, "a\nb\nc\n", "c1\nc1\n");
        assert!(matches!(
            read_10x_dir(dir.path(), &LoadParams::default()),
            Err(ScError::Load(_))
        ));
    }
}
