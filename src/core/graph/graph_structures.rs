use crate::core::data::sparse_structures::*;

/////////////
// Helpers //
/////////////

/// Transform COO triplets into a CSR matrix
///
/// Duplicated coordinates are summed.
///
/// ### Params
///
/// * `edges` - Triplets of `(row, col, value)`
/// * `shape` - `(nrow, ncol)`
///
/// ### Returns
///
/// The CSR matrix with sorted column indices
pub fn coo_to_csr(edges: &[(usize, usize, f64)], shape: (usize, usize)) -> CompressedSparseData<f64> {
    let mut sorted = edges.to_vec();
    sorted.sort_unstable_by_key(|(r, c, _)| (*r, *c));

    let mut data: Vec<f64> = Vec::with_capacity(sorted.len());
    let mut indices: Vec<usize> = Vec::with_capacity(sorted.len());
    let mut indptr = vec![0_usize; shape.0 + 1];
    let mut last: Option<(usize, usize)> = None;

    for (r, c, v) in sorted {
        if last == Some((r, c)) {
            if let Some(prev) = data.last_mut() {
                *prev += v;
            }
        } else {
            data.push(v);
            indices.push(c);
            indptr[r + 1] += 1;
            last = Some((r, c));
        }
    }
    for i in 0..shape.0 {
        indptr[i + 1] += indptr[i];
    }

    CompressedSparseData {
        data,
        indices,
        indptr,
        cs_type: CompressedSparseFormat::Csr,
        shape,
    }
}

/////////////////////////////
// Sparse graph structures //
/////////////////////////////

/// Structure representation of a weighted undirected graph
///
/// ### Fields
///
/// * `adjacency` - Symmetric sparse CSR adjacency. Self loops sit on the
///   diagonal and are stored once.
/// * `num_nodes` - Number of nodes represented in the graph.
#[derive(Clone, Debug)]
pub struct SparseGraph {
    adjacency: CompressedSparseData<f64>,
    num_nodes: usize,
}

impl SparseGraph {
    /// Build an undirected graph from an edge list
    ///
    /// Each edge `(i, j, w)` with `i != j` is inserted in both directions,
    /// duplicated edges are summed.
    ///
    /// ### Params
    ///
    /// * `num_nodes` - Number of nodes
    /// * `edges` - Edges as `(from, to, weight)`
    pub fn from_edges(num_nodes: usize, edges: &[(usize, usize, f64)]) -> Self {
        let mut both = Vec::with_capacity(edges.len() * 2);
        for &(i, j, w) in edges {
            both.push((i, j, w));
            if i != j {
                both.push((j, i, w));
            }
        }
        Self {
            adjacency: coo_to_csr(&both, (num_nodes, num_nodes)),
            num_nodes,
        }
    }

    /// Helper function to get the neighbours and weights
    ///
    /// ### Params
    ///
    /// * `node` - Index of the node for which to get the neighbours
    ///
    /// ### Return
    ///
    /// Tuple of `(neighbour_indices, edge_weights)`
    #[inline]
    pub fn get_neighbours(&self, node: usize) -> (&[usize], &[f64]) {
        self.adjacency.outer(node)
    }

    /// Weighted degree (strength) of a node
    ///
    /// Self loops count once, which for aggregated graphs equals the sum of
    /// the member strengths.
    #[inline]
    pub fn get_node_strength(&self, node: usize) -> f64 {
        self.get_neighbours(node).1.iter().sum()
    }

    /// Sum over all adjacency entries, i.e. `2m` for a graph without self
    /// loops
    pub fn total_weight(&self) -> f64 {
        self.adjacency.data.iter().sum()
    }

    /// Weight of the edge between two nodes (`0.0` if absent)
    pub fn edge_weight(&self, from: usize, to: usize) -> f64 {
        let (neighbours, weights) = self.get_neighbours(from);
        match neighbours.binary_search(&to) {
            Ok(pos) => weights[pos],
            Err(_) => 0.0,
        }
    }

    /// Number of undirected edges (self loops count once)
    pub fn num_edges(&self) -> usize {
        let mut diag = 0;
        for i in 0..self.num_nodes {
            if self.get_neighbours(i).0.binary_search(&i).is_ok() {
                diag += 1;
            }
        }
        (self.adjacency.get_nnz() - diag) / 2 + diag
    }

    /// Expose the number of nodes
    pub fn get_node_number(&self) -> usize {
        self.num_nodes
    }

    /// Collapse the nodes into communities
    ///
    /// The weight between two communities is the sum of the member weights;
    /// internal weights end up on the diagonal (counted in both directions).
    ///
    /// ### Params
    ///
    /// * `membership` - Community index per node, contiguous from 0
    /// * `num_communities` - Number of communities
    ///
    /// ### Returns
    ///
    /// The aggregated graph with one node per community
    pub fn aggregate(&self, membership: &[usize], num_communities: usize) -> Self {
        let mut edges = Vec::with_capacity(self.adjacency.get_nnz());
        for i in 0..self.num_nodes {
            let ci = membership[i];
            let (neighbours, weights) = self.get_neighbours(i);
            for (&j, &w) in neighbours.iter().zip(weights.iter()) {
                edges.push((ci, membership[j], w));
            }
        }
        Self {
            adjacency: coo_to_csr(&edges, (num_communities, num_communities)),
            num_nodes: num_communities,
        }
    }
}

///////////
// Tests //
///////////
