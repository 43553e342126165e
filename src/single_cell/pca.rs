use faer::Mat;
use log::{info, warn};
use rand::prelude::*;
use rayon::prelude::*;
use serde::Deserialize;
use std::time::Instant;

use crate::assert_nrows;
use crate::core::base::pca_svd::{randomised_svd, truncated_svd};
use crate::core::base::stats::prop_test_two_sample;
use crate::ensure_config;
use crate::error::{Result, ScError};
use crate::single_cell::dataset::{DimReduction, JackStrawRes, ScDataset, Stage};

////////////////
// Parameters //
////////////////

/// Parameters for the PCA
///
/// ### Fields
///
/// * `n_pcs` - Number of principal components.
/// * `approx` - Use the randomised SVD instead of the exact thin SVD.
/// * `seed` - Seed for the randomised SVD.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PcaParams {
    pub n_pcs: usize,
    pub approx: bool,
    pub seed: u64,
}

impl Default for PcaParams {
    fn default() -> Self {
        Self {
            n_pcs: 50,
            approx: false,
            seed: 42,
        }
    }
}

impl PcaParams {
    pub fn validate(&self) -> Result<()> {
        ensure_config!(self.n_pcs > 0, "n_pcs must be at least 1");
        Ok(())
    }
}

/// Parameters for the JackStraw procedure
///
/// ### Fields
///
/// * `num_replicate` - Number of permutation replicates.
/// * `prop_freq` - Proportion of genes permuted per replicate (at least 3).
/// * `dims` - Number of components to test.
/// * `score_threshold` - p-value cut-off used when scoring the components.
/// * `seed` - Seed for reproducibility purposes.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct JackStrawParams {
    pub num_replicate: usize,
    pub prop_freq: f64,
    pub dims: usize,
    pub score_threshold: f64,
    pub seed: u64,
}

impl Default for JackStrawParams {
    fn default() -> Self {
        Self {
            num_replicate: 100,
            prop_freq: 0.01,
            dims: 20,
            score_threshold: 1e-5,
            seed: 42,
        }
    }
}

impl JackStrawParams {
    pub fn validate(&self) -> Result<()> {
        ensure_config!(self.num_replicate > 0, "num_replicate must be at least 1");
        ensure_config!(
            self.prop_freq > 0.0 && self.prop_freq <= 1.0,
            "prop_freq must be within (0, 1], got {}",
            self.prop_freq
        );
        ensure_config!(self.dims > 0, "dims must be at least 1");
        ensure_config!(
            self.score_threshold > 0.0 && self.score_threshold < 1.0,
            "score_threshold must be within (0, 1), got {}",
            self.score_threshold
        );
        Ok(())
    }
}

/////////////
// Helpers //
/////////////

/// Cells x features matrix of the scaled data for the given columns
fn scaled_columns(ds: &ScDataset, positions: &[usize]) -> Result<Mat<f64>> {
    let scaled = ds
        .scaled
        .as_ref()
        .ok_or_else(|| ScError::MissingStage("PCA requires scaled data".into()))?;
    Ok(Mat::from_fn(scaled.data.nrows(), positions.len(), |i, j| {
        scaled.data[(i, positions[j])]
    }))
}

/// Fraction of the (sorted) null values strictly above `x`
fn empirical_pval(sorted_null: &[f64], x: f64) -> f64 {
    if sorted_null.is_empty() {
        return 1.0;
    }
    let n_above = sorted_null.len() - sorted_null.partition_point(|&v| v <= x);
    n_above as f64 / sorted_null.len() as f64
}

////////////
// Stages //
////////////

impl ScDataset {
    /// Principal component analysis of the scaled variable features
    ///
    /// ### Params
    ///
    /// * `params` - The `PcaParams`
    ///
    /// ### Returns
    ///
    /// The dataset with the `"pca"` reduction. Embeddings are `X·V`, loadings
    /// `V` and the standard deviations `s / sqrt(n_cells - 1)`. Each
    /// component is flipped so that its largest absolute loading is
    /// positive.
    pub fn run_pca(&self, params: &PcaParams) -> Result<ScDataset> {
        params.validate()?;
        let scaled = self
            .scaled
            .as_ref()
            .ok_or_else(|| ScError::MissingStage("PCA requires scaled data".into()))?;
        let start = Instant::now();

        // variable features present in the scaled set, in their ranked order
        let positions: Vec<usize> = if self.variable_features.is_empty() {
            (0..scaled.gene_indices.len()).collect()
        } else {
            self.variable_features
                .iter()
                .filter_map(|g| scaled.gene_indices.iter().position(|s| s == g))
                .collect()
        };
        if positions.is_empty() {
            return Err(ScError::InsufficientData(
                "none of the variable features are in the scaled data".into(),
            ));
        }
        let n_cells = self.n_cells();
        if n_cells < 2 {
            return Err(ScError::InsufficientData("PCA needs at least two cells".into()));
        }

        let max_pcs = n_cells.min(positions.len());
        let n_pcs = if params.n_pcs > max_pcs {
            warn!(
                "Requested {} PCs but only {} are available. Using {}.",
                params.n_pcs, max_pcs, max_pcs
            );
            max_pcs
        } else {
            params.n_pcs
        };

        let x = scaled_columns(self, &positions)?;
        let svd = if params.approx {
            randomised_svd(x.as_ref(), n_pcs, params.seed, None, None)?
        } else {
            truncated_svd(x.as_ref(), n_pcs)?
        };

        let embeddings = &x * &svd.v;
        assert_nrows!(embeddings, x);
        let denom = (n_cells as f64 - 1.0).sqrt();
        let stdev: Vec<f64> = svd.s.iter().map(|s| s / denom).collect();
        let feature_indices: Vec<usize> = positions.iter().map(|&p| scaled.gene_indices[p]).collect();

        let mut res = self.clone();
        res.invalidate_downstream(Stage::Pca);
        res.reductions.insert(
            "pca".to_string(),
            DimReduction {
                embeddings,
                loadings: Some(svd.v),
                feature_indices,
                stdev,
                jackstraw: None,
            },
        );

        info!(
            "Computed {} principal components over {} features: {:.2?}",
            n_pcs,
            positions.len(),
            start.elapsed()
        );

        Ok(res)
    }

    /// JackStraw significance of the principal components
    ///
    /// Each replicate permutes a random subset of the features across cells,
    /// recomputes the PCA and keeps the loadings of the permuted features as
    /// null values. The empirical p-value of a feature on a component is the
    /// fraction of null absolute loadings above its observed absolute
    /// loading. The component score compares the number of features with
    /// `p <= score_threshold` against `floor(n_features * score_threshold)`
    /// with a two sample proportion test.
    ///
    /// ### Params
    ///
    /// * `params` - The `JackStrawParams`
    ///
    /// ### Returns
    ///
    /// The dataset with `JackStrawRes` stored on the `"pca"` reduction
    pub fn jackstraw(&self, params: &JackStrawParams) -> Result<ScDataset> {
        params.validate()?;
        let pca = self
            .reductions
            .get("pca")
            .ok_or_else(|| ScError::MissingStage("JackStraw requires a PCA".into()))?;
        let loadings = pca
            .loadings
            .as_ref()
            .ok_or_else(|| ScError::MissingStage("PCA has no loadings".into()))?;
        let scaled = self
            .scaled
            .as_ref()
            .ok_or_else(|| ScError::MissingStage("JackStraw requires scaled data".into()))?;
        let start = Instant::now();

        let positions: Vec<usize> = pca
            .feature_indices
            .iter()
            .map(|g| {
                scaled
                    .gene_indices
                    .iter()
                    .position(|s| s == g)
                    .ok_or_else(|| {
                        ScError::MissingStage("scaled data no longer matches the PCA".into())
                    })
            })
            .collect::<Result<_>>()?;
        let n_features = positions.len();
        if n_features < 3 {
            return Err(ScError::InsufficientData(
                "JackStraw needs at least three features".into(),
            ));
        }

        let dims = if params.dims > pca.n_components() {
            warn!(
                "Requested {} JackStraw dims but the PCA has {}. Using {}.",
                params.dims,
                pca.n_components(),
                pca.n_components()
            );
            pca.n_components()
        } else {
            params.dims
        };
        let n_rand = ((params.prop_freq * n_features as f64).round() as usize)
            .max(3)
            .min(n_features);

        let x = scaled_columns(self, &positions)?;

        let replicates: Vec<Vec<Vec<f64>>> = (0..params.num_replicate)
            .into_par_iter()
            .map(|rep| -> Result<Vec<Vec<f64>>> {
                let mut rng = StdRng::seed_from_u64(params.seed + rep as u64);
                let mut genes: Vec<usize> = (0..n_features).collect();
                genes.shuffle(&mut rng);
                genes.truncate(n_rand);

                let mut permuted = x.clone();
                for &g in &genes {
                    let mut col: Vec<f64> = (0..permuted.nrows()).map(|i| permuted[(i, g)]).collect();
                    col.shuffle(&mut rng);
                    for (i, v) in col.into_iter().enumerate() {
                        permuted[(i, g)] = v;
                    }
                }

                let svd = truncated_svd(permuted.as_ref(), dims)?;
                Ok((0..svd.rank())
                    .map(|pc| genes.iter().map(|&g| svd.v[(g, pc)].abs()).collect())
                    .collect())
            })
            .collect::<Result<_>>()?;

        let null_dist: Vec<Vec<f64>> = (0..dims)
            .map(|pc| {
                let mut null: Vec<f64> = replicates
                    .iter()
                    .filter_map(|rep| rep.get(pc))
                    .flatten()
                    .copied()
                    .collect();
                null.sort_by(|a, b| a.total_cmp(b));
                null
            })
            .collect();

        let empirical_pvals = Mat::from_fn(n_features, dims, |g, pc| {
            empirical_pval(&null_dist[pc], loadings[(g, pc)].abs())
        });

        let expected = (n_features as f64 * params.score_threshold).floor() as usize;
        let pc_scores: Vec<f64> = (0..dims)
            .map(|pc| {
                let n_sig = (0..n_features)
                    .filter(|&g| empirical_pvals[(g, pc)] <= params.score_threshold)
                    .count();
                prop_test_two_sample(n_sig, n_features, expected, n_features)
            })
            .collect();

        info!(
            "JackStraw over {} replicates and {} components: {:.2?}",
            params.num_replicate,
            dims,
            start.elapsed()
        );

        let mut res = self.clone();
        if let Some(pca) = res.reductions.get_mut("pca") {
            pca.jackstraw = Some(JackStrawRes {
                empirical_pvals,
                pc_scores,
            });
        }

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
    use crate::single_cell::hvg::HvgParams;
    use crate::single_cell::processing::NormalisationParams;
    use crate::single_cell::scaling::ScaleParams;
    use crate::utils::general::mean_var;
    use approx::assert_relative_eq;

    fn scaled_dataset(n_features: usize) -> ScDataset {
        let data = generate_block_counts(&BlockDesign::default()).unwrap();
        ScDataset::from_counts(data.counts, data.gene_ids, data.cell_ids)
            .unwrap()
            .log_normalise(&NormalisationParams::default())
            .unwrap()
            .find_variable_features(&HvgParams {
                n_features,
                ..Default::default()
            })
            .unwrap()
            .scale_data(&ScaleParams::default())
            .unwrap()
    }

    #[test]
    fn test_pca_shapes_and_stdev() {
        let ds = scaled_dataset(50)
            .run_pca(&PcaParams {
                n_pcs: 5,
                ..Default::default()
            })
            .unwrap();
        let pca = ds.reduction("pca").unwrap();
        assert_eq!(pca.embeddings.nrows(), 50);
        assert_eq!(pca.n_components(), 5);
        assert_eq!(pca.loadings.as_ref().unwrap().nrows(), 50);
        assert_eq!(pca.feature_indices, ds.variable_features());

        for w in pca.stdev.windows(2) {
            assert!(w[0] >= w[1]);
        }
        // embeddings are centred, their sd equals the component sd
        for k in 0..5 {
            let col: Vec<f64> = (0..50).map(|i| pca.embeddings[(i, k)]).collect();
            let (mean, var) = mean_var(&col);
            assert_relative_eq!(mean, 0.0, epsilon = 1e-8);
            assert_relative_eq!(var.sqrt(), pca.stdev[k], epsilon = 1e-8);
        }
    }

    #[test]
    fn test_sign_convention_and_top_features() {
        let ds = scaled_dataset(50)
            .run_pca(&PcaParams {
                n_pcs: 3,
                ..Default::default()
            })
            .unwrap();
        let pca = ds.reduction("pca").unwrap();
        let loadings = pca.loadings.as_ref().unwrap();
        for k in 0..3 {
            let mut best = 0.0_f64;
            for g in 0..loadings.nrows() {
                if loadings[(g, k)].abs() > best.abs() {
                    best = loadings[(g, k)];
                }
            }
            assert!(best > 0.0);
        }

        let top = pca.top_features(0, 5).unwrap();
        assert_eq!(top.positive.len(), 5);
        assert_eq!(top.negative.len(), 5);
        for w in top.positive.windows(2) {
            assert!(w[0].1 >= w[1].1);
        }
        for w in top.negative.windows(2) {
            assert!(w[0].1 <= w[1].1);
        }
        assert!(pca.top_features(7, 5).is_err());
    }

    #[test]
    fn test_n_pcs_clamped() {
        let ds = scaled_dataset(20).run_pca(&PcaParams::default()).unwrap();
        assert_eq!(ds.reduction("pca").unwrap().n_components(), 20);
    }

    #[test]
    fn test_approx_matches_exact() {
        let ds = scaled_dataset(50);
        let exact = ds
            .run_pca(&PcaParams {
                n_pcs: 3,
                ..Default::default()
            })
            .unwrap();
        let approx = ds
            .run_pca(&PcaParams {
                n_pcs: 3,
                approx: true,
                ..Default::default()
            })
            .unwrap();
        assert_relative_eq!(
            exact.reduction("pca").unwrap().stdev[0],
            approx.reduction("pca").unwrap().stdev[0],
            max_relative = 1e-3
        );
    }

    #[test]
    fn test_pca_errors() {
        let ds = scaled_dataset(20);
        assert!(matches!(
            ds.run_pca(&PcaParams {
                n_pcs: 0,
                ..Default::default()
            }),
            Err(ScError::Configuration(_))
        ));

        let data = generate_block_counts(&BlockDesign::default()).unwrap();
        let raw = ScDataset::from_counts(data.counts, data.gene_ids, data.cell_ids).unwrap();
        assert!(matches!(
            raw.run_pca(&PcaParams::default()),
            Err(ScError::MissingStage(_))
        ));
        assert!(matches!(
            raw.jackstraw(&JackStrawParams::default()),
            Err(ScError::MissingStage(_))
        ));
    }

    #[test]
    fn test_jackstraw() {
        let ds = scaled_dataset(50)
            .run_pca(&PcaParams {
                n_pcs: 5,
                ..Default::default()
            })
            .unwrap();
        let params = JackStrawParams {
            num_replicate: 10,
            dims: 3,
            ..Default::default()
        };
        let res = ds.jackstraw(&params).unwrap();
        let js = res
            .reduction("pca")
            .unwrap()
            .jackstraw
            .as_ref()
            .unwrap();
        assert_eq!(js.empirical_pvals.nrows(), 50);
        assert_eq!(js.empirical_pvals.ncols(), 3);
        assert_eq!(js.pc_scores.len(), 3);
        for g in 0..50 {
            for pc in 0..3 {
                let p = js.empirical_pvals[(g, pc)];
                assert!((0.0..=1.0).contains(&p));
            }
        }
        // the block structure lives on the first component
        assert!(js.pc_scores[0] < 0.05);

        let again = ds.jackstraw(&params).unwrap();
        assert_eq!(
            again.reduction("pca").unwrap().jackstraw.as_ref().unwrap().pc_scores,
            js.pc_scores
        );
    }

    #[test]
    fn test_empirical_pval() {
        let null = vec![0.1, 0.2, 0.3, 0.4];
        assert_relative_eq!(empirical_pval(&null, 0.25), 0.5);
        assert_relative_eq!(empirical_pval(&null, 0.4), 0.0);
        assert_relative_eq!(empirical_pval(&null, 0.0), 1.0);
    }
}
