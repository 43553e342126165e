//! Runs the full exploratory workflow from one set of parameters: QC,
//! filtering, normalisation, variable features, scaling, PCA (optionally
//! JackStraw), sNN graph, Louvain clustering, UMAP, cluster labels and
//! markers of every cluster.

use log::info;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Instant;

use crate::core::data::sparse_io_mtx::LoadParams;
use crate::error::Result;
use crate::single_cell::clustering::ClusterParams;
use crate::single_cell::dataset::ScDataset;
use crate::single_cell::dge::{ClusterMarkers, MarkerParams};
use crate::single_cell::hvg::HvgParams;
use crate::single_cell::methods::umap::UmapParams;
use crate::single_cell::pca::{JackStrawParams, PcaParams};
use crate::single_cell::processing::{FilterParams, NormalisationParams, QcParams};
use crate::single_cell::sc_knn_snn::NeighbourParams;
use crate::single_cell::scaling::ScaleParams;

////////////////
// Parameters //
////////////////

/// Parameters of every stage
///
/// All fields fall back to their defaults when missing from a JSON file.
/// `jackstraw` is only run when set; `labels` is applied when non-empty and
/// must then cover every cluster.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PipelineParams {
    pub load: LoadParams,
    pub qc: QcParams,
    pub filter: FilterParams,
    pub normalisation: NormalisationParams,
    pub hvg: HvgParams,
    pub scale: ScaleParams,
    pub pca: PcaParams,
    pub jackstraw: Option<JackStrawParams>,
    pub neighbours: NeighbourParams,
    pub clusters: ClusterParams,
    pub run_umap: bool,
    pub umap: UmapParams,
    pub markers: MarkerParams,
    pub labels: BTreeMap<usize, String>,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            load: LoadParams::default(),
            qc: QcParams::default(),
            filter: FilterParams::default(),
            normalisation: NormalisationParams::default(),
            hvg: HvgParams::default(),
            scale: ScaleParams::default(),
            pca: PcaParams::default(),
            jackstraw: None,
            neighbours: NeighbourParams::default(),
            clusters: ClusterParams::default(),
            run_umap: true,
            umap: UmapParams::default(),
            markers: MarkerParams::default(),
            labels: BTreeMap::new(),
        }
    }
}

impl PipelineParams {
    /// Load the parameters from a JSON file
    ///
    /// ### Params
    ///
    /// * `path` - Path to the JSON file
    ///
    /// ### Returns
    ///
    /// The validated parameters
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let params: Self = serde_json::from_str(&content)?;
        params.validate()?;
        Ok(params)
    }

    /// Validate the parameters of every stage
    pub fn validate(&self) -> Result<()> {
        self.qc.validate()?;
        self.filter.validate()?;
        self.normalisation.validate()?;
        self.hvg.validate()?;
        self.scale.validate()?;
        self.pca.validate()?;
        if let Some(jackstraw) = &self.jackstraw {
            jackstraw.validate()?;
        }
        self.neighbours.validate()?;
        self.clusters.validate()?;
        if self.run_umap {
            self.umap.validate()?;
        }
        self.markers.validate()
    }
}

/// Output of the pipeline
///
/// ### Fields
///
/// * `dataset` - The final snapshot.
/// * `markers` - Markers of every cluster against the remaining cells.
#[derive(Clone, Debug)]
pub struct PipelineResult {
    pub dataset: ScDataset,
    pub markers: Vec<ClusterMarkers>,
}

//////////
// Main //
//////////

/// Run every stage on an in-memory dataset
///
/// ### Params
///
/// * `dataset` - The raw dataset
/// * `params` - The `PipelineParams`
///
/// ### Returns
///
/// The `PipelineResult`; the first failing stage aborts the run.
pub fn run_pipeline(dataset: &ScDataset, params: &PipelineParams) -> Result<PipelineResult> {
    params.validate()?;
    let start = Instant::now();

    let ds = dataset
        .annotate_qc(&params.qc)?
        .filter_cells_genes(&params.filter)?
        .log_normalise(&params.normalisation)?
        .find_variable_features(&params.hvg)?
        .scale_data(&params.scale)?
        .run_pca(&params.pca)?;

    let ds = match &params.jackstraw {
        Some(jackstraw) => ds.jackstraw(jackstraw)?,
        None => ds,
    };

    let snn = ds.find_neighbours(&params.neighbours)?;
    let mut ds = ds.find_clusters(&snn, &params.clusters)?;

    if params.run_umap {
        ds = ds.run_umap(&params.umap)?;
    }
    if !params.labels.is_empty() {
        let mapping: HashMap<usize, String> = params
            .labels
            .iter()
            .map(|(&cluster, label)| (cluster, label.clone()))
            .collect();
        ds = ds.rename_clusters(&mapping)?;
    }

    let markers = ds.find_all_markers(&params.markers)?;

    info!(
        "Pipeline finished: {} genes, {} cells, {} clusters: {:.2?}",
        ds.n_genes(),
        ds.n_cells(),
        ds.clusters().map_or(0, |c| c.n_clusters()),
        start.elapsed()
    );

    Ok(PipelineResult {
        dataset: ds,
        markers,
    })
}

/// Load a 10x directory and run every stage
///
/// ### Params
///
/// * `dir` - Directory with `matrix.mtx`, `genes.tsv`/`features.tsv` and
///   `barcodes.tsv`
/// * `params` - The `PipelineParams`
pub fn run_pipeline_from_dir<P: AsRef<Path>>(
    dir: P,
    params: &PipelineParams,
) -> Result<PipelineResult> {
    let dataset = ScDataset::read_10x_dir(dir, &params.load)?;
    run_pipeline(&dataset, params)
}

///////////
// Tests //
///////////
