use rand::prelude::*;
use rayon::prelude::*;

use crate::core::graph::graph_structures::*;

/////////////
// Helpers //
/////////////

/// Relabel communities to contiguous indices in order of first appearance
///
/// ### Returns
///
/// Tuple of the relabelled membership and the number of communities
fn relabel_contiguous(communities: &[usize]) -> (Vec<usize>, usize) {
    let mut comm_map = vec![usize::MAX; communities.len().max(1)];
    let mut label = 0_usize;
    let res = communities
        .iter()
        .map(|&c| {
            if comm_map[c] == usize::MAX {
                comm_map[c] = label;
                label += 1;
            }
            comm_map[c]
        })
        .collect();
    (res, label)
}

/// Modularity of a partition
///
/// `Q = sum_c [ in_c / 2m - resolution * (tot_c / 2m)^2 ]`
///
/// ### Params
///
/// * `graph` - The undirected graph
/// * `membership` - Community per node
/// * `resolution` - Resolution parameter
///
/// ### Returns
///
/// The modularity; `0.0` for graphs without edges
pub fn modularity(graph: &SparseGraph, membership: &[usize], resolution: f64) -> f64 {
    let m2 = graph.total_weight();
    if m2 <= 0.0 || membership.is_empty() {
        return 0.0;
    }
    let n_comm = membership.iter().copied().max().unwrap_or(0) + 1;
    let mut internal = vec![0.0; n_comm];
    let mut total = vec![0.0; n_comm];

    for (i, &ci) in membership.iter().enumerate() {
        let (neighbours, weights) = graph.get_neighbours(i);
        for (&j, &w) in neighbours.iter().zip(weights.iter()) {
            total[ci] += w;
            if membership[j] == ci {
                internal[ci] += w;
            }
        }
    }

    internal
        .iter()
        .zip(total.iter())
        .map(|(&inn, &tot)| inn / m2 - resolution * (tot / m2) * (tot / m2))
        .sum()
}

/// One level of Louvain local moving
///
/// ### Params
///
/// * `graph` - The (possibly aggregated) graph
/// * `resolution` - Resolution parameter
/// * `max_iter` - Maximum sweeps over all nodes
/// * `rng` - Random number generator for the node order
///
/// ### Returns
///
/// Tuple of the contiguous community per node and whether any node moved
fn local_moving(
    graph: &SparseGraph,
    resolution: f64,
    max_iter: usize,
    rng: &mut StdRng,
) -> (Vec<usize>, bool) {
    let n = graph.get_node_number();
    let m2 = graph.total_weight();
    if m2 <= 0.0 {
        return ((0..n).collect(), false);
    }

    let strengths: Vec<f64> = (0..n).map(|i| graph.get_node_strength(i)).collect();

    let mut communities: Vec<usize> = (0..n).collect();
    let mut comm_degree_sums = strengths.clone();
    let mut neighbour_weights = vec![0.0_f64; n];
    let mut comm_active = vec![false; n];
    let mut active_comms = Vec::with_capacity(256);
    let mut node_order: Vec<usize> = (0..n).collect();
    let mut any_move = false;

    for _ in 0..max_iter {
        let mut move_count = 0;
        node_order.shuffle(rng);

        for &node in &node_order {
            let current_comm = communities[node];
            let k_i = strengths[node];
            let k_i_scaled = resolution * k_i / m2;

            let (neighbours, weights) = graph.get_neighbours(node);
            for (&neighbour, &weight) in neighbours.iter().zip(weights.iter()) {
                if neighbour == node {
                    continue;
                }
                let comm = communities[neighbour];
                if !comm_active[comm] {
                    comm_active[comm] = true;
                    active_comms.push(comm);
                }
                neighbour_weights[comm] += weight;
            }

            // take the node out of its community before scoring
            comm_degree_sums[current_comm] -= k_i;

            let mut best_comm = current_comm;
            let mut best_gain =
                neighbour_weights[current_comm] - k_i_scaled * comm_degree_sums[current_comm];

            for &comm in &active_comms {
                if comm != current_comm {
                    let gain = neighbour_weights[comm] - k_i_scaled * comm_degree_sums[comm];
                    if gain > best_gain + 1e-12 {
                        best_gain = gain;
                        best_comm = comm;
                    }
                }
            }

            comm_degree_sums[best_comm] += k_i;

            for &comm in &active_comms {
                neighbour_weights[comm] = 0.0;
                comm_active[comm] = false;
            }
            active_comms.clear();

            if best_comm != current_comm {
                communities[node] = best_comm;
                move_count += 1;
            }
        }

        if move_count == 0 {
            break;
        }
        any_move = true;
    }

    let (communities, _) = relabel_contiguous(&communities);
    (communities, any_move)
}

/////////////
// Louvain //
/////////////

/// Multilevel Louvain community detection
///
/// Alternates local moving and aggregation of the communities into a
/// coarser graph until the local moving stops improving the modularity.
///
/// ### Params
///
/// * `graph` - Undirected weighted graph
/// * `resolution` - Resolution parameter for the modularity
/// * `max_iter` - Maximum local moving sweeps per level
/// * `seed` - Seed for reproducibility purposes
///
/// ### Returns
///
/// Vector of contiguous community indices per node
pub fn louvain_multilevel(
    graph: &SparseGraph,
    resolution: f64,
    max_iter: usize,
    seed: u64,
) -> Vec<usize> {
    let n = graph.get_node_number();
    if n == 0 {
        return Vec::new();
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut membership: Vec<usize> = (0..n).collect();
    let mut current = graph.clone();

    loop {
        let (communities, moved) = local_moving(&current, resolution, max_iter, &mut rng);
        if !moved {
            break;
        }
        let n_comm = communities.iter().copied().max().map_or(0, |m| m + 1);
        for c in membership.iter_mut() {
            *c = communities[*c];
        }
        if n_comm == current.get_node_number() {
            break;
        }
        current = current.aggregate(&communities, n_comm);
    }

    relabel_contiguous(&membership).0
}

/// Louvain with several random starts
///
/// Start `s` uses the seed `seed + s`; the partition with the highest
/// modularity wins, ties go to the earlier start.
///
/// ### Params
///
/// * `graph` - Undirected weighted graph
/// * `resolution` - Resolution parameter
/// * `n_starts` - Number of random starts
/// * `max_iter` - Maximum local moving sweeps per level
/// * `seed` - Base seed
///
/// ### Returns
///
/// Tuple of the best membership and its modularity
pub fn louvain_best_of(
    graph: &SparseGraph,
    resolution: f64,
    n_starts: usize,
    max_iter: usize,
    seed: u64,
) -> (Vec<usize>, f64) {
    let runs: Vec<(Vec<usize>, f64)> = (0..n_starts.max(1))
        .into_par_iter()
        .map(|start| {
            let membership = louvain_multilevel(graph, resolution, max_iter, seed + start as u64);
            let q = modularity(graph, &membership, resolution);
            (membership, q)
        })
        .collect();

    let mut best: Option<(Vec<usize>, f64)> = None;
    for (membership, q) in runs {
        match &best {
            Some((_, best_q)) if q <= *best_q => {}
            _ => best = Some((membership, q)),
        }
    }

    best.unwrap_or_else(|| ((0..graph.get_node_number()).collect(), 0.0))
}

///////////
// Tests //
///////////
