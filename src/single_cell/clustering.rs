use log::info;
use serde::Deserialize;
use std::time::Instant;

use crate::core::graph::community_detection::louvain_best_of;
pub use crate::core::graph::community_detection::modularity;
use crate::ensure_config;
use crate::error::Result;
use crate::single_cell::dataset::{ClusterAssignment, ScDataset};
use crate::single_cell::sc_knn_snn::SnnGraph;

////////////////
// Parameters //
////////////////

/// Parameters for the Louvain clustering
///
/// ### Fields
///
/// * `resolution` - Resolution of the modularity; higher values give more
///   clusters.
/// * `n_starts` - Number of random starts; the best modularity wins.
/// * `max_iter` - Maximum local moving sweeps per level.
/// * `seed` - Base seed; start `s` uses `seed + s`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClusterParams {
    pub resolution: f64,
    pub n_starts: usize,
    pub max_iter: usize,
    pub seed: u64,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            resolution: 0.5,
            n_starts: 10,
            max_iter: 10,
            seed: 0,
        }
    }
}

impl ClusterParams {
    pub fn validate(&self) -> Result<()> {
        ensure_config!(
            self.resolution > 0.0,
            "resolution must be positive, got {}",
            self.resolution
        );
        ensure_config!(self.n_starts > 0, "n_starts must be at least 1");
        ensure_config!(self.max_iter > 0, "max_iter must be at least 1");
        Ok(())
    }
}

/////////////
// Helpers //
/////////////

/// Renumber clusters by size
///
/// The largest cluster becomes 0; equally sized clusters are ordered by
/// their lowest member index.
fn order_by_size(membership: &[usize]) -> Vec<usize> {
    let n_comm = membership.iter().copied().max().map_or(0, |m| m + 1);
    let mut sizes = vec![0_usize; n_comm];
    let mut first = vec![usize::MAX; n_comm];
    for (cell, &c) in membership.iter().enumerate() {
        sizes[c] += 1;
        first[c] = first[c].min(cell);
    }

    let mut order: Vec<usize> = (0..n_comm).filter(|&c| sizes[c] > 0).collect();
    order.sort_by(|&a, &b| sizes[b].cmp(&sizes[a]).then(first[a].cmp(&first[b])));

    let mut new_id = vec![0_usize; n_comm];
    for (id, &c) in order.iter().enumerate() {
        new_id[c] = id;
    }
    membership.iter().map(|&c| new_id[c]).collect()
}

////////////
// Stages //
////////////

impl ScDataset {
    /// Louvain clustering on the sNN graph
    ///
    /// ### Params
    ///
    /// * `snn` - The `SnnGraph` of the current cells
    /// * `params` - The `ClusterParams`
    ///
    /// ### Returns
    ///
    /// The dataset with a fresh `ClusterAssignment`; labels are reset to the
    /// cluster ids.
    pub fn find_clusters(&self, snn: &SnnGraph, params: &ClusterParams) -> Result<ScDataset> {
        params.validate()?;
        ensure_config!(
            snn.graph.get_node_number() == self.n_cells(),
            "graph has {} nodes but the dataset {} cells",
            snn.graph.get_node_number(),
            self.n_cells()
        );
        let start = Instant::now();

        let (membership, q) = louvain_best_of(
            &snn.graph,
            params.resolution,
            params.n_starts,
            params.max_iter,
            params.seed,
        );
        let assignment = ClusterAssignment::from_clusters(order_by_size(&membership));

        info!(
            "Louvain found {} clusters (modularity {:.4}): {:.2?}",
            assignment.n_clusters(),
            q,
            start.elapsed()
        );

        let mut res = self.clone();
        res.clusters = Some(assignment);
        Ok(res)
    }
}

///////////
// Tests //
///////////
