use log::info;
use rayon::prelude::*;
use serde::Deserialize;
use std::time::Instant;

use crate::core::base::loess::LoessRegression;
use crate::core::data::sparse_structures::CompressedSparseData;
use crate::ensure_config;
use crate::error::{Result, ScError};
use crate::single_cell::dataset::{HvgStats, ScDataset, Stage};
use crate::utils::general::order_desc_stable;

////////////////
// Parameters //
////////////////

/// Parameters for the variance stabilising feature selection
///
/// ### Fields
///
/// * `n_features` - Number of variable features to select.
/// * `loess_span` - Span of the loess fit of log10(variance) on log10(mean).
/// * `clip_max` - Upper clip of the standardised values. Defaults to
///   `sqrt(n_cells)` if not specified.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HvgParams {
    pub n_features: usize,
    pub loess_span: f64,
    pub clip_max: Option<f64>,
}

impl Default for HvgParams {
    fn default() -> Self {
        Self {
            n_features: 2000,
            loess_span: 0.3,
            clip_max: None,
        }
    }
}

impl HvgParams {
    pub fn validate(&self) -> Result<()> {
        ensure_config!(self.n_features > 0, "n_features must be at least 1");
        ensure_config!(
            self.loess_span > 0.0 && self.loess_span <= 1.0,
            "loess_span must be within (0, 1], got {}",
            self.loess_span
        );
        if let Some(clip) = self.clip_max {
            ensure_config!(clip > 0.0, "clip_max must be positive, got {}", clip);
        }
        Ok(())
    }
}

/////////////
// Helpers //
/////////////

/// Per gene mean and variance of the counts
///
/// ### Params
///
/// * `csr` - Genes x cells counts in CSR layout (one row per gene)
/// * `n_cells` - Number of cells
///
/// ### Returns
///
/// Tuple of `(means, variances)` with the variances using `n - 1`
fn gene_mean_var(csr: &CompressedSparseData<u32>, n_cells: usize) -> (Vec<f64>, Vec<f64>) {
    let n = n_cells as f64;
    (0..csr.outer_dim())
        .into_par_iter()
        .map(|gene| {
            let (_, values) = csr.outer(gene);
            let sum: f64 = values.iter().map(|&v| v as f64).sum();
            let mean = sum / n;
            let nnz_ss: f64 = values
                .iter()
                .map(|&v| (v as f64 - mean) * (v as f64 - mean))
                .sum();
            let zero_ss = (n_cells - values.len()) as f64 * mean * mean;
            (mean, (nnz_ss + zero_ss) / (n - 1.0))
        })
        .unzip()
}

////////////
// Stages //
////////////

impl ScDataset {
    /// Select the most variable genes (variance stabilising transformation)
    ///
    /// 1. Per gene mean and variance of the raw counts.
    /// 2. Loess fit (degree 2) of log10(variance) on log10(mean) over genes
    ///    with non-zero variance.
    /// 3. Counts are standardised with the expected standard deviation,
    ///    clipped at `clip_max`, and the variance of the standardised values
    ///    ranks the genes.
    ///
    /// ### Params
    ///
    /// * `params` - The `HvgParams`
    ///
    /// ### Returns
    ///
    /// The dataset with per gene `HvgStats` and `min(n_features, n_genes)`
    /// variable features, most variable first (ties by gene order).
    pub fn find_variable_features(&self, params: &HvgParams) -> Result<ScDataset> {
        params.validate()?;
        let n_cells = self.n_cells();
        if n_cells < 2 {
            return Err(ScError::InsufficientData(
                "variable feature selection needs at least two cells".into(),
            ));
        }
        let start = Instant::now();

        let csr = self.counts.to_other_format();
        let (mean, variance) = gene_mean_var(&csr, n_cells);

        let valid: Vec<usize> = (0..mean.len()).filter(|&i| variance[i] > 0.0).collect();
        let x: Vec<f64> = valid.iter().map(|&i| mean[i].log10()).collect();
        let y: Vec<f64> = valid.iter().map(|&i| variance[i].log10()).collect();
        let fit = LoessRegression::new(params.loess_span, 2)?.fit(&x, &y);

        let mut variance_expected = vec![0.0; mean.len()];
        for (pos, &gene) in valid.iter().enumerate() {
            let fitted = fit.fitted_vals[pos];
            if fitted.is_finite() {
                variance_expected[gene] = 10_f64.powf(fitted);
            }
        }

        let clip_max = params.clip_max.unwrap_or((n_cells as f64).sqrt());
        let variance_standardised: Vec<f64> = (0..mean.len())
            .into_par_iter()
            .map(|gene| {
                if variance[gene] <= 0.0 || variance_expected[gene] <= 0.0 {
                    return 0.0;
                }
                let sd = variance_expected[gene].sqrt();
                let mu = mean[gene];
                let (_, values) = csr.outer(gene);
                let nnz_ss: f64 = values
                    .iter()
                    .map(|&v| ((v as f64 - mu) / sd).min(clip_max).powi(2))
                    .sum();
                let zero_z = (-mu / sd).min(clip_max);
                let zero_ss = (n_cells - values.len()) as f64 * zero_z * zero_z;
                (nnz_ss + zero_ss) / (n_cells as f64 - 1.0)
            })
            .collect();

        let n_select = params.n_features.min(self.n_genes());
        let variable_features: Vec<usize> = order_desc_stable(&variance_standardised)
            .into_iter()
            .take(n_select)
            .collect();

        let mut res = self.clone();
        res.invalidate_downstream(Stage::VariableFeatures);
        res.hvg = Some(HvgStats {
            mean,
            variance,
            variance_expected,
            variance_standardised,
        });
        res.variable_features = variable_features;

        info!(
            "Selected {} variable features out of {} genes: {:.2?}",
            n_select,
            self.n_genes(),
            start.elapsed()
        );

        Ok(res)
    }
}

///////////
// Tests //
///////////
