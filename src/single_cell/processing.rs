use log::{info, warn};
use rayon::prelude::*;
use regex::Regex;
use serde::Deserialize;
use std::time::Instant;

use crate::core::data::sparse_structures::CompressedSparseData;
use crate::ensure_config;
use crate::error::{Result, ScError};
use crate::single_cell::dataset::{CellQc, ScDataset, Stage};

////////////////
// Parameters //
////////////////

const DEFAULT_MT_PATTERN: &str = "^MT-";

fn compile_mt_pattern(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| {
        ScError::Configuration(format!("invalid mitochondrial pattern '{}': {}", pattern, e))
    })
}

/// Parameters for the QC annotation
///
/// ### Fields
///
/// * `mt_pattern` - Regular expression identifying mitochondrial genes.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct QcParams {
    pub mt_pattern: String,
}

impl Default for QcParams {
    fn default() -> Self {
        Self {
            mt_pattern: DEFAULT_MT_PATTERN.to_string(),
        }
    }
}

impl QcParams {
    /// Validate the parameters and compile the pattern
    pub fn validate(&self) -> Result<Regex> {
        compile_mt_pattern(&self.mt_pattern)
    }
}

/// Parameters for the cell and gene filter
///
/// ### Fields
///
/// * `min_cells` - Genes need to be detected in at least this many cells.
/// * `min_features` - Cells need at least this many detected genes.
/// * `max_features` - Cells need strictly fewer detected genes (optional).
/// * `max_percent_mt` - Cells need a strictly lower mitochondrial percentage
///   (optional).
/// * `mt_pattern` - Regular expression identifying mitochondrial genes.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FilterParams {
    pub min_cells: usize,
    pub min_features: usize,
    pub max_features: Option<usize>,
    pub max_percent_mt: Option<f64>,
    pub mt_pattern: String,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            min_cells: 3,
            min_features: 200,
            max_features: None,
            max_percent_mt: None,
            mt_pattern: DEFAULT_MT_PATTERN.to_string(),
        }
    }
}

impl FilterParams {
    /// Validate the parameters and compile the pattern
    pub fn validate(&self) -> Result<Regex> {
        if let Some(max_mt) = self.max_percent_mt {
            ensure_config!(
                (0.0..=100.0).contains(&max_mt),
                "max_percent_mt must be within [0, 100], got {}",
                max_mt
            );
        }
        if let Some(max_features) = self.max_features {
            ensure_config!(
                max_features > self.min_features,
                "max_features ({}) must exceed min_features ({})",
                max_features,
                self.min_features
            );
        }
        compile_mt_pattern(&self.mt_pattern)
    }
}

/// Parameters for the log normalisation
///
/// ### Fields
///
/// * `scale_factor` - Target library size before the log transform.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NormalisationParams {
    pub scale_factor: f64,
}

impl Default for NormalisationParams {
    fn default() -> Self {
        Self {
            scale_factor: 10_000.0,
        }
    }
}

impl NormalisationParams {
    pub fn validate(&self) -> Result<()> {
        ensure_config!(
            self.scale_factor > 0.0 && self.scale_factor.is_finite(),
            "scale_factor must be positive, got {}",
            self.scale_factor
        );
        Ok(())
    }
}

/////////////
// Helpers //
/////////////

/// Calculate the QC metrics of every cell
///
/// ### Params
///
/// * `counts` - Genes x cells counts (CSC)
/// * `gene_ids` - Gene names, used to match the mitochondrial pattern
/// * `mt_regex` - The compiled mitochondrial pattern
///
/// ### Returns
///
/// The `CellQc`
fn compute_cell_qc(
    counts: &CompressedSparseData<u32>,
    gene_ids: &[String],
    mt_regex: &Regex,
) -> CellQc {
    let is_mt: Vec<bool> = gene_ids.iter().map(|g| mt_regex.is_match(g)).collect();

    let per_cell: Vec<(u64, usize, f64)> = (0..counts.outer_dim())
        .into_par_iter()
        .map(|cell| {
            let (genes, values) = counts.outer(cell);
            let mut total = 0_u64;
            let mut detected = 0_usize;
            let mut mt = 0_u64;
            for (&g, &v) in genes.iter().zip(values.iter()) {
                if v > 0 {
                    total += v as u64;
                    detected += 1;
                    if is_mt[g] {
                        mt += v as u64;
                    }
                }
            }
            let percent_mt = if total > 0 {
                100.0 * mt as f64 / total as f64
            } else {
                0.0
            };
            (total, detected, percent_mt)
        })
        .collect();

    CellQc {
        n_count: per_cell.iter().map(|x| x.0).collect(),
        n_feature: per_cell.iter().map(|x| x.1).collect(),
        percent_mt: per_cell.iter().map(|x| x.2).collect(),
    }
}

/// Number of cells with a non-zero count per gene
fn cells_per_gene(counts: &CompressedSparseData<u32>) -> Vec<usize> {
    let mut res = vec![0_usize; counts.inner_dim()];
    for (&g, &v) in counts.indices.iter().zip(counts.data.iter()) {
        if v > 0 {
            res[g] += 1;
        }
    }
    res
}

fn select<T: Clone>(values: &[T], indices: &[usize]) -> Vec<T> {
    indices.iter().map(|&i| values[i].clone()).collect()
}

////////////
// Stages //
////////////

impl ScDataset {
    /// Annotate the QC metrics of every cell
    ///
    /// Writes `n_count`, `n_feature` and `percent_mt`; nothing else changes.
    ///
    /// ### Params
    ///
    /// * `params` - The `QcParams`
    pub fn annotate_qc(&self, params: &QcParams) -> Result<ScDataset> {
        let mt_regex = params.validate()?;
        let qc = compute_cell_qc(&self.counts, &self.gene_ids, &mt_regex);

        let n_mt = self.gene_ids.iter().filter(|g| mt_regex.is_match(g)).count();
        if n_mt == 0 {
            warn!("No genes match the mitochondrial pattern '{}'", params.mt_pattern);
        }

        let mut res = self.clone();
        res.qc = Some(qc);
        Ok(res)
    }

    /// Remove lowly detected genes and low quality cells
    ///
    /// Genes detected in fewer than `min_cells` cells are removed first, then
    /// the QC metrics are recomputed and cells failing the thresholds are
    /// removed. The two passes repeat until nothing changes, so the result
    /// passes the same filter unchanged.
    ///
    /// ### Params
    ///
    /// * `params` - The `FilterParams`
    ///
    /// ### Returns
    ///
    /// The filtered dataset with QC metrics of the filtered matrix and all
    /// downstream products dropped.
    pub fn filter_cells_genes(&self, params: &FilterParams) -> Result<ScDataset> {
        let mt_regex = params.validate()?;
        let start = Instant::now();

        let mut counts = self.counts.clone();
        let mut gene_idx: Vec<usize> = (0..self.n_genes()).collect();
        let mut cell_idx: Vec<usize> = (0..self.n_cells()).collect();
        let mut n_pass = 0_usize;

        loop {
            n_pass += 1;
            let (n_genes, n_cells) = counts.shape();
            let all_cells: Vec<usize> = (0..n_cells).collect();

            let keep_genes: Vec<usize> = cells_per_gene(&counts)
                .iter()
                .enumerate()
                .filter(|(_, &n)| n >= params.min_cells)
                .map(|(i, _)| i)
                .collect();
            if keep_genes.is_empty() {
                return Err(ScError::InsufficientData(format!(
                    "no gene is detected in at least {} cells",
                    params.min_cells
                )));
            }
            let gene_pruned = counts.subset(&keep_genes, &all_cells);
            let gene_names = select(&select(&self.gene_ids, &gene_idx), &keep_genes);
            let qc = compute_cell_qc(&gene_pruned, &gene_names, &mt_regex);

            let keep_cells: Vec<usize> = (0..n_cells)
                .filter(|&c| {
                    let n_feature = qc.n_feature[c];
                    n_feature >= params.min_features
                        && params.max_features.map_or(true, |m| n_feature < m)
                        && params.max_percent_mt.map_or(true, |m| qc.percent_mt[c] < m)
                })
                .collect();
            if keep_cells.is_empty() {
                return Err(ScError::InsufficientData(
                    "no cell passes the QC thresholds".into(),
                ));
            }

            let all_genes: Vec<usize> = (0..keep_genes.len()).collect();
            counts = gene_pruned.subset(&all_genes, &keep_cells);
            gene_idx = select(&gene_idx, &keep_genes);
            cell_idx = select(&cell_idx, &keep_cells);

            if keep_genes.len() == n_genes && keep_cells.len() == n_cells {
                break;
            }
        }

        let gene_ids = select(&self.gene_ids, &gene_idx);
        let cell_ids = select(&self.cell_ids, &cell_idx);
        let qc = compute_cell_qc(&counts, &gene_ids, &mt_regex);

        let mut res = self.clone();
        res.invalidate_downstream(Stage::Filter);
        res.counts = counts;
        res.gene_ids = gene_ids;
        res.cell_ids = cell_ids;
        res.qc = Some(qc);

        info!(
            "Filtered to {} genes x {} cells ({} removed genes, {} removed cells, {} passes): {:.2?}",
            res.n_genes(),
            res.n_cells(),
            self.n_genes() - res.n_genes(),
            self.n_cells() - res.n_cells(),
            n_pass,
            start.elapsed()
        );

        Ok(res)
    }

    /// Log normalise the counts
    ///
    /// Each value becomes `ln(1 + count / n_count * scale_factor)`; the raw
    /// counts are kept.
    ///
    /// ### Params
    ///
    /// * `params` - The `NormalisationParams`
    ///
    /// ### Returns
    ///
    /// The dataset with normalised values, or a `ScError::DegenerateCell` for
    /// the first cell without any counts.
    pub fn log_normalise(&self, params: &NormalisationParams) -> Result<ScDataset> {
        params.validate()?;
        if self.n_cells() == 0 || self.n_genes() == 0 {
            return Err(ScError::InsufficientData("empty count matrix".into()));
        }
        let start = Instant::now();

        let lib_sizes = self.counts.outer_sums();
        if let Some(cell) = lib_sizes.iter().position(|&s| s <= 0.0) {
            return Err(ScError::DegenerateCell {
                cell: self.cell_ids[cell].clone(),
            });
        }

        let scale_factor = params.scale_factor;
        let normalised = self
            .counts
            .map_values(|cell, v| (v as f64 / lib_sizes[cell] * scale_factor).ln_1p());

        let mut res = self.clone();
        res.invalidate_downstream(Stage::Normalise);
        res.normalised = Some(normalised);

        info!(
            "Log-normalised {} cells with scale factor {}: {:.2?}",
            res.n_cells(),
            scale_factor,
            start.elapsed()
        );

        Ok(res)
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::{generate_block_counts, BlockDesign};
    use approx::assert_relative_eq;

    /// 3 genes x 4 cells
    ///
    /// ```text
    /// MT-A  1 0 0 2
    /// B     0 3 0 0
    /// C     4 0 5 6
    /// ```
    fn small_dataset() -> ScDataset {
        let counts = CompressedSparseData::new_csc(
            vec![1, 4, 3, 5, 2, 6],
            vec![0, 2, 1, 2, 0, 2],
            vec![0, 2, 3, 4, 6],
            (3, 4),
        );
        ScDataset::from_counts(
            counts,
            vec!["MT-A".into(), "B".into(), "C".into()],
            (0..4).map(|i| format!("c{}", i)).collect(),
        )
        .unwrap()
    }

    fn synthetic_dataset() -> ScDataset {
        let data = generate_block_counts(&BlockDesign::default()).unwrap();
        ScDataset::from_counts(data.counts, data.gene_ids, data.cell_ids).unwrap()
    }

    #[test]
    fn test_annotate_qc() {
        let ds = small_dataset().annotate_qc(&QcParams::default()).unwrap();
        let qc = ds.qc().unwrap();
        assert_eq!(qc.n_count, vec![5, 3, 5, 8]);
        assert_eq!(qc.n_feature, vec![2, 1, 1, 2]);
        assert_relative_eq!(qc.percent_mt[0], 20.0);
        assert_relative_eq!(qc.percent_mt[1], 0.0);
        assert_relative_eq!(qc.percent_mt[3], 25.0);
        // counts untouched
        assert_eq!(ds.counts(), small_dataset().counts());
    }

    #[test]
    fn test_invalid_pattern() {
        let params = QcParams {
            mt_pattern: "(".into(),
        };
        assert!(matches!(
            small_dataset().annotate_qc(&params),
            Err(ScError::Configuration(_))
        ));
    }

    #[test]
    fn test_filter_zero_thresholds_is_noop() {
        let ds = small_dataset();
        let params = FilterParams {
            min_cells: 0,
            min_features: 0,
            ..Default::default()
        };
        let res = ds.filter_cells_genes(&params).unwrap();
        assert_eq!(res.counts(), ds.counts());
        assert_eq!(res.gene_ids(), ds.gene_ids());
        assert_eq!(res.cell_ids(), ds.cell_ids());
        assert!(res.qc().is_some());
    }

    #[test]
    fn test_filter_genes_then_cells() {
        let params = FilterParams {
            min_cells: 2,
            min_features: 2,
            ..Default::default()
        };
        let res = small_dataset().filter_cells_genes(&params).unwrap();
        assert_eq!(res.gene_ids(), &["MT-A".to_string(), "C".to_string()]);
        assert_eq!(res.cell_ids(), &["c0".to_string(), "c3".to_string()]);
        assert_eq!(res.qc().unwrap().n_count, vec![5, 8]);
    }

    #[test]
    fn test_filter_idempotent() {
        let params = FilterParams {
            min_cells: 2,
            min_features: 2,
            max_percent_mt: Some(30.0),
            ..Default::default()
        };
        let once = small_dataset().filter_cells_genes(&params).unwrap();
        let twice = once.filter_cells_genes(&params).unwrap();
        assert_eq!(once.counts(), twice.counts());
        assert_eq!(once.gene_ids(), twice.gene_ids());
        assert_eq!(once.cell_ids(), twice.cell_ids());

        let params = FilterParams {
            min_cells: 20,
            min_features: 80,
            ..Default::default()
        };
        let once = synthetic_dataset().filter_cells_genes(&params).unwrap();
        let twice = once.filter_cells_genes(&params).unwrap();
        assert_eq!(once.counts(), twice.counts());
        assert_eq!(once.cell_ids(), twice.cell_ids());
    }

    #[test]
    fn test_filter_errors() {
        let params = FilterParams {
            min_features: 1_000,
            ..Default::default()
        };
        assert!(matches!(
            small_dataset().filter_cells_genes(&params),
            Err(ScError::InsufficientData(_))
        ));

        let params = FilterParams {
            max_percent_mt: Some(150.0),
            ..Default::default()
        };
        assert!(matches!(
            small_dataset().filter_cells_genes(&params),
            Err(ScError::Configuration(_))
        ));
    }

    #[test]
    fn test_log_normalise_sums_to_scale_factor() {
        let ds = synthetic_dataset()
            .log_normalise(&NormalisationParams::default())
            .unwrap();
        let norm = ds.normalised().unwrap();
        assert_eq!(norm.indices, ds.counts().indices);
        for cell in 0..ds.n_cells() {
            let total: f64 = norm.outer(cell).1.iter().map(|v| v.exp_m1()).sum();
            assert_relative_eq!(total, 10_000.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_log_normalise_degenerate_cell() {
        let counts = CompressedSparseData::new_csc(vec![3, 1], vec![0, 1], vec![0, 2, 2], (2, 2));
        let ds = ScDataset::from_counts(
            counts,
            vec!["g1".into(), "g2".into()],
            vec!["full".into(), "empty".into()],
        )
        .unwrap();
        match ds.log_normalise(&NormalisationParams::default()) {
            Err(ScError::DegenerateCell { cell }) => assert_eq!(cell, "empty"),
            other => panic!("unexpected result: {:?}", other.map(|d| d.n_cells())),
        }

        let params = NormalisationParams { scale_factor: 0.0 };
        assert!(matches!(
            small_dataset().log_normalise(&params),
            Err(ScError::Configuration(_))
        ));
    }
}
