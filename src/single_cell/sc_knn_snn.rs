use log::{info, warn};
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use serde::Deserialize;
use std::time::Instant;

use crate::core::graph::graph_structures::SparseGraph;
use crate::core::graph::knn::{find_knn, KnnMethod, KnnRes};
use crate::ensure_config;
use crate::error::{Result, ScError};
use crate::single_cell::dataset::ScDataset;

///////////
// Enums //
///////////

/// SNN similarity method
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnnSimilarity {
    /// This will calculate the Jaccard similarity as weight
    Jaccard,
    /// This will calculate the Rank version as a weight
    Rank,
}

////////////////
// Parameters //
////////////////

/// Parameters for the neighbour graph
///
/// ### Fields
///
/// * `reduction` - Name of the reduction to search in.
/// * `dims` - Number of leading components to use.
/// * `k` - Number of nearest neighbours (self excluded).
/// * `prune_snn` - SNN weights below this value are dropped, unless the two
///   cells are direct neighbours.
/// * `similarity` - The `SnnSimilarity` used as edge weight.
/// * `method` - The `KnnMethod`.
/// * `seed` - Seed for the approximate search.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NeighbourParams {
    pub reduction: String,
    pub dims: usize,
    pub k: usize,
    pub prune_snn: f64,
    pub similarity: SnnSimilarity,
    pub method: KnnMethod,
    pub seed: u64,
}

impl Default for NeighbourParams {
    fn default() -> Self {
        Self {
            reduction: "pca".to_string(),
            dims: 10,
            k: 20,
            prune_snn: 1.0 / 15.0,
            similarity: SnnSimilarity::Jaccard,
            method: KnnMethod::Exact,
            seed: 42,
        }
    }
}

impl NeighbourParams {
    pub fn validate(&self) -> Result<()> {
        ensure_config!(self.k > 0, "k must be at least 1");
        ensure_config!(self.dims > 0, "dims must be at least 1");
        ensure_config!(
            (0.0..=1.0).contains(&self.prune_snn),
            "prune_snn must be within [0, 1], got {}",
            self.prune_snn
        );
        Ok(())
    }
}

////////////////
// Structures //
////////////////

/// Shared nearest neighbour graph over the cells
///
/// ### Fields
///
/// * `graph` - Symmetric weighted graph, one node per cell.
/// * `knn` - The kNN lists the graph was derived from.
#[derive(Clone, Debug)]
pub struct SnnGraph {
    pub graph: SparseGraph,
    pub knn: KnnRes,
}

////////////////////
// Main functions //
////////////////////

/// Generate the sNN edges from the kNN lists
///
/// Every pair of samples that shares at least one neighbour (the sample
/// itself counts as its own neighbour at rank 0) is compared. Edges below
/// `pruning` are dropped unless one of the two lists the other as a direct
/// neighbour.
///
/// ### Params
///
/// * `knn` - Neighbour indices per sample, closest first, self excluded.
/// * `k` - Number of neighbours in the kNN graph
/// * `pruning` - Below which similarity to prune the edge.
/// * `method` - Which similarity method to use
///
/// ### Returns
///
/// Edges as `(i, j, weight)` with `j < i`, each pair once.
pub fn generate_snn_edges(
    knn: &[Vec<usize>],
    k: usize,
    pruning: f64,
    method: SnnSimilarity,
) -> Vec<(usize, usize, f64)> {
    let n_samples = knn.len();
    let mut reverse_mappings: Vec<Vec<(usize, usize)>> = vec![Vec::new(); n_samples];

    for (i, neighbours) in knn.iter().enumerate() {
        reverse_mappings[i].push((i, 0));
        for (rank, &neighbour) in neighbours.iter().enumerate() {
            reverse_mappings[neighbour].push((i, rank + 1));
        }
    }

    let direct: Vec<FxHashSet<usize>> = knn
        .iter()
        .map(|neighbours| neighbours.iter().copied().collect())
        .collect();

    (0..n_samples)
        .into_par_iter()
        .flat_map(|j| {
            let mut scores = vec![0.0_f64; n_samples];
            let mut seen = vec![false; n_samples];
            let mut added = Vec::new();

            let own = std::iter::once(j).chain(knn[j].iter().copied());
            for (i, cur_neighbour) in own.enumerate() {
                for &(othernode, other_rank) in &reverse_mappings[cur_neighbour] {
                    if othernode >= j {
                        continue;
                    }
                    match method {
                        SnnSimilarity::Rank => {
                            let combined_rank = (i + other_rank) as f64;
                            if !seen[othernode] || combined_rank < scores[othernode] {
                                scores[othernode] = combined_rank;
                            }
                        }
                        SnnSimilarity::Jaccard => {
                            scores[othernode] += 1.0;
                        }
                    }
                    if !seen[othernode] {
                        seen[othernode] = true;
                        added.push(othernode);
                    }
                }
            }

            added
                .into_iter()
                .filter_map(|othernode| {
                    let weight = match method {
                        SnnSimilarity::Rank => {
                            let preliminary = k as f64 - scores[othernode] / 2.0;
                            preliminary.max(1e-6) / k as f64
                        }
                        SnnSimilarity::Jaccard => {
                            scores[othernode] / (2.0 * (k as f64 + 1.0) - scores[othernode])
                        }
                    };
                    let is_direct =
                        direct[j].contains(&othernode) || direct[othernode].contains(&j);

                    if weight >= pruning || is_direct {
                        Some((j, othernode, weight))
                    } else {
                        None
                    }
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

////////////
// Stages //
////////////

impl ScDataset {
    /// Build the kNN and shared nearest neighbour graph
    ///
    /// ### Params
    ///
    /// * `params` - The `NeighbourParams`
    ///
    /// ### Returns
    ///
    /// The `SnnGraph` over the current cells
    pub fn find_neighbours(&self, params: &NeighbourParams) -> Result<SnnGraph> {
        params.validate()?;
        let reduction = self.reductions.get(&params.reduction).ok_or_else(|| {
            ScError::MissingStage(format!(
                "neighbour search requires the '{}' reduction",
                params.reduction
            ))
        })?;
        let n_cells = self.n_cells();
        ensure_config!(
            params.k < n_cells,
            "k must be smaller than the number of cells ({}), got {}",
            n_cells,
            params.k
        );

        let available = reduction.n_components();
        let dims = if params.dims > available {
            warn!(
                "Requested {} dims but '{}' has {} components. Using {}.",
                params.dims, params.reduction, available, available
            );
            available
        } else {
            params.dims
        };
        let start = Instant::now();

        let embd = reduction.embeddings.as_ref().submatrix(0, 0, n_cells, dims);
        let knn = find_knn(embd, params.k, params.method, params.seed);

        let end_knn = start.elapsed();

        let edges = generate_snn_edges(&knn.indices, params.k, params.prune_snn, params.similarity);
        let graph = SparseGraph::from_edges(n_cells, &edges);

        info!(
            "kNN search (k = {}) on {} dims: {:.2?}; sNN graph with {} edges: {:.2?}",
            params.k,
            dims,
            end_knn,
            graph.num_edges(),
            start.elapsed() - end_knn
        );

        Ok(SnnGraph { graph, knn })
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::single_cell::dataset::DimReduction;
    use approx::assert_relative_eq;
    use faer::Mat;

    fn two_group_dataset() -> ScDataset {
        use crate::core::data::synthetic_data::{generate_block_counts, BlockDesign};
        let data = generate_block_counts(&BlockDesign {
            n_cells: 40,
            ..Default::default()
        })
        .unwrap();
        let mut ds = ScDataset::from_counts(data.counts, data.gene_ids, data.cell_ids).unwrap();
        let embeddings = Mat::from_fn(40, 3, |i, j| {
            let offset = if i < 20 { 0.0 } else { 50.0 };
            offset + ((i * 7 + j * 3) % 11) as f64 * 0.1
        });
        ds.reductions.insert(
            "pca".to_string(),
            DimReduction {
                embeddings,
                loadings: None,
                feature_indices: Vec::new(),
                stdev: vec![1.0; 3],
                jackstraw: None,
            },
        );
        ds
    }

    #[test]
    fn test_snn_edges_hand_computed() {
        // sets incl. self: 0 -> {0, 1}, 1 -> {1, 0}, 2 -> {2, 1}
        let knn = vec![vec![1], vec![0], vec![1]];
        let edges = generate_snn_edges(&knn, 1, 0.5, SnnSimilarity::Jaccard);
        let graph = SparseGraph::from_edges(3, &edges);

        assert_relative_eq!(graph.edge_weight(0, 1), 1.0);
        // below the cut-off but 2 lists 1 as neighbour
        assert_relative_eq!(graph.edge_weight(1, 2), 1.0 / 3.0);
        assert_relative_eq!(graph.edge_weight(0, 2), 0.0);

        let all = generate_snn_edges(&knn, 1, 0.0, SnnSimilarity::Jaccard);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_snn_rank_weights() {
        let knn = vec![vec![1], vec![0], vec![1]];
        let edges = generate_snn_edges(&knn, 1, 0.0, SnnSimilarity::Rank);
        for (_, _, w) in edges {
            assert!(w > 0.0 && w <= 1.0);
        }
    }

    #[test]
    fn test_find_neighbours() {
        let ds = two_group_dataset();
        let snn = ds
            .find_neighbours(&NeighbourParams {
                k: 5,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(snn.graph.get_node_number(), 40);
        assert_eq!(snn.knn.len(), 40);

        for i in 0..40 {
            assert_eq!(snn.knn.indices[i].len(), 5);
            assert!(!snn.knn.indices[i].contains(&i));
            // direct neighbours always survive the pruning
            for &j in &snn.knn.indices[i] {
                assert!(snn.graph.edge_weight(i, j) > 0.0);
                assert_relative_eq!(snn.graph.edge_weight(i, j), snn.graph.edge_weight(j, i));
            }
            // no edges across the two groups
            let (neighbours, _) = snn.graph.get_neighbours(i);
            assert!(neighbours.iter().all(|&j| (j < 20) == (i < 20)));
        }
    }

    #[test]
    fn test_find_neighbours_errors() {
        let ds = two_group_dataset();
        for k in [0, 40] {
            let params = NeighbourParams {
                k,
                ..Default::default()
            };
            assert!(matches!(
                ds.find_neighbours(&params),
                Err(ScError::Configuration(_))
            ));
        }
        let params = NeighbourParams {
            reduction: "umap".into(),
            ..Default::default()
        };
        assert!(matches!(
            ds.find_neighbours(&params),
            Err(ScError::MissingStage(_))
        ));
        let params = NeighbourParams {
            prune_snn: 1.5,
            ..Default::default()
        };
        assert!(ds.find_neighbours(&params).is_err());
    }
}
