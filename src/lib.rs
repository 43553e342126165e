//! `scpipe` implements the exploratory single cell RNA-seq workflow:
//!
//! QC annotation → filtering → log normalisation → variable features →
//! scaling → PCA → kNN/sNN graph → Louvain clustering → UMAP → marker genes
//! → cluster labels.
//!
//! Every stage is a method on [`ScDataset`] that leaves its input untouched
//! and returns a new snapshot. [`run_pipeline`] chains all of them from a
//! single [`PipelineParams`].

pub mod core;
pub mod error;
pub mod single_cell;
pub mod utils;

pub use crate::core::data::sparse_io_mtx::LoadParams;
pub use crate::core::data::sparse_structures::{CompressedSparseData, CompressedSparseFormat};
pub use crate::error::{Result, ScError};
pub use crate::single_cell::clustering::{modularity, ClusterParams};
pub use crate::single_cell::dataset::{
    CellQc, CellRecord, ClusterAssignment, DimReduction, HvgStats, JackStrawRes, ScDataset,
    ScaledData, TopFeatures,
};
pub use crate::single_cell::dge::{
    CellGroup, ClusterMarkers, MarkerParams, MarkerRecord, MarkerTable, MarkerTest, Significance,
};
pub use crate::single_cell::hvg::HvgParams;
pub use crate::single_cell::methods::umap::UmapParams;
pub use crate::single_cell::pca::{JackStrawParams, PcaParams};
pub use crate::single_cell::pipeline::{
    run_pipeline, run_pipeline_from_dir, PipelineParams, PipelineResult,
};
pub use crate::single_cell::processing::{FilterParams, NormalisationParams, QcParams};
pub use crate::single_cell::sc_knn_snn::{NeighbourParams, SnnGraph, SnnSimilarity};
pub use crate::single_cell::scaling::{FeatureSelection, ScaleParams};
