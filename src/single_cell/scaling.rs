use faer::Mat;
use log::info;
use rayon::prelude::*;
use serde::Deserialize;
use std::time::Instant;

use crate::ensure_config;
use crate::error::{Result, ScError};
use crate::single_cell::dataset::{ScDataset, ScaledData, Stage};
use crate::utils::general::mean_var;

///////////
// Enums //
///////////

/// Which genes to scale
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureSelection {
    /// The variable features
    Variable,
    /// All genes
    All,
    /// Explicit gene names
    Genes(Vec<String>),
}

////////////////
// Parameters //
////////////////

/// Parameters for the scaling
///
/// ### Fields
///
/// * `features` - Which genes to scale.
/// * `center` - Subtract the per gene mean.
/// * `scale` - Divide by the per gene standard deviation.
/// * `clip_max` - Clip the scaled values to `[-clip_max, clip_max]`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ScaleParams {
    pub features: FeatureSelection,
    pub center: bool,
    pub scale: bool,
    pub clip_max: Option<f64>,
}

impl Default for ScaleParams {
    fn default() -> Self {
        Self {
            features: FeatureSelection::Variable,
            center: true,
            scale: true,
            clip_max: Some(10.0),
        }
    }
}

impl ScaleParams {
    pub fn validate(&self) -> Result<()> {
        if let Some(clip) = self.clip_max {
            ensure_config!(clip > 0.0, "clip_max must be positive, got {}", clip);
        }
        if let FeatureSelection::Genes(genes) = &self.features {
            ensure_config!(!genes.is_empty(), "the gene list to scale is empty");
        }
        Ok(())
    }
}

////////////
// Stages //
////////////

impl ScDataset {
    /// Scale the normalised expression of a gene subset
    ///
    /// Per gene over all cells: subtract the mean, divide by the standard
    /// deviation and clip. Genes without variance give an all-zero row.
    ///
    /// ### Params
    ///
    /// * `params` - The `ScaleParams`
    ///
    /// ### Returns
    ///
    /// The dataset with `ScaledData` (cells x genes) and the reductions and
    /// clusters dropped.
    pub fn scale_data(&self, params: &ScaleParams) -> Result<ScDataset> {
        params.validate()?;
        let normalised = self
            .normalised
            .as_ref()
            .ok_or_else(|| ScError::MissingStage("scaling requires normalised data".into()))?;
        let n_cells = self.n_cells();
        if n_cells < 2 {
            return Err(ScError::InsufficientData(
                "scaling needs at least two cells".into(),
            ));
        }
        let start = Instant::now();

        let gene_indices: Vec<usize> = match &params.features {
            FeatureSelection::Variable => {
                if self.variable_features.is_empty() {
                    return Err(ScError::MissingStage(
                        "scaling the variable features requires variable feature selection".into(),
                    ));
                }
                self.variable_features.clone()
            }
            FeatureSelection::All => (0..self.n_genes()).collect(),
            FeatureSelection::Genes(genes) => self.gene_indices(genes)?,
        };

        let csr = normalised.to_other_format();
        let columns: Vec<(Vec<f64>, f64, f64)> = gene_indices
            .par_iter()
            .map(|&gene| {
                let dense = csr.outer_dense(gene);
                let (mean, var) = mean_var(&dense);
                let sd = var.sqrt();
                let scaled: Vec<f64> = if params.scale && sd == 0.0 {
                    vec![0.0; dense.len()]
                } else {
                    dense
                        .iter()
                        .map(|&x| {
                            let mut v = if params.center { x - mean } else { x };
                            if params.scale {
                                v /= sd;
                            }
                            match params.clip_max {
                                Some(clip) => v.clamp(-clip, clip),
                                None => v,
                            }
                        })
                        .collect()
                };
                (scaled, mean, sd)
            })
            .collect();

        let data = Mat::from_fn(n_cells, gene_indices.len(), |cell, j| columns[j].0[cell]);
        let means = columns.iter().map(|c| c.1).collect();
        let sds = columns.iter().map(|c| c.2).collect();

        let mut res = self.clone();
        res.invalidate_downstream(Stage::Scale);
        res.scaled = Some(ScaledData {
            gene_indices,
            data,
            means,
            sds,
        });

        info!(
            "Scaled {} genes across {} cells: {:.2?}",
            res.scaled.as_ref().map_or(0, |s| s.gene_indices.len()),
            n_cells,
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
    use crate::single_cell::hvg::HvgParams;
    use crate::single_cell::processing::NormalisationParams;
    use approx::assert_relative_eq;

    fn normalised_dataset() -> ScDataset {
        let data = generate_block_counts(&BlockDesign::default()).unwrap();
        ScDataset::from_counts(data.counts, data.gene_ids, data.cell_ids)
            .unwrap()
            .log_normalise(&NormalisationParams::default())
            .unwrap()
    }

    #[test]
    fn test_scaled_mean_and_sd() {
        let params = ScaleParams {
            features: FeatureSelection::All,
            clip_max: None,
            ..Default::default()
        };
        let ds = normalised_dataset().scale_data(&params).unwrap();
        let scaled = ds.scaled().unwrap();
        assert_eq!(scaled.data.nrows(), 50);
        assert_eq!(scaled.data.ncols(), 100);
        for j in 0..scaled.data.ncols() {
            if scaled.sds[j] == 0.0 {
                continue;
            }
            let col: Vec<f64> = (0..scaled.data.nrows()).map(|i| scaled.data[(i, j)]).collect();
            let (mean, var) = mean_var(&col);
            assert_relative_eq!(mean, 0.0, epsilon = 1e-10);
            assert_relative_eq!(var.sqrt(), 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_clipping_and_gene_list() {
        let params = ScaleParams {
            features: FeatureSelection::Genes(vec!["GENE3".into(), "GENE70".into()]),
            clip_max: Some(0.5),
            ..Default::default()
        };
        let ds = normalised_dataset().scale_data(&params).unwrap();
        let scaled = ds.scaled().unwrap();
        assert_eq!(scaled.gene_indices, vec![2, 69]);
        for i in 0..scaled.data.nrows() {
            for j in 0..2 {
                assert!(scaled.data[(i, j)].abs() <= 0.5);
            }
        }
    }

    #[test]
    fn test_variable_features_default() {
        let ds = normalised_dataset()
            .find_variable_features(&HvgParams {
                n_features: 20,
                ..Default::default()
            })
            .unwrap()
            .scale_data(&ScaleParams::default())
            .unwrap();
        assert_eq!(ds.scaled().unwrap().gene_indices, ds.variable_features());
    }

    #[test]
    fn test_scaling_errors() {
        let data = generate_block_counts(&BlockDesign::default()).unwrap();
        let raw = ScDataset::from_counts(data.counts, data.gene_ids, data.cell_ids).unwrap();
        assert!(matches!(
            raw.scale_data(&ScaleParams::default()),
            Err(ScError::MissingStage(_))
        ));

        let params = ScaleParams {
            features: FeatureSelection::Genes(vec!["NOT_A_GENE".into()]),
            ..Default::default()
        };
        assert!(matches!(
            normalised_dataset().scale_data(&params),
            Err(ScError::Configuration(_))
        ));
    }
}
