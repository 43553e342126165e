use faer::MatRef;
use instant_distance::{Builder, Point as DistancePoint, Search};
use rayon::prelude::*;
use serde::Deserialize;

///////////
// Enums //
///////////

/// Nearest neighbour search strategy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnnMethod {
    /// Brute force search; ties are broken by the lower index
    Exact,
    /// Hierarchical Navigable Small World (approximate)
    Hnsw,
}

////////////////
// Structures //
////////////////

/// k-nearest neighbours of every sample
///
/// ### Fields
///
/// * `indices` - Per sample the neighbour indices, closest first, self
///   excluded.
/// * `distances` - The matching Euclidean distances.
#[derive(Clone, Debug)]
pub struct KnnRes {
    pub indices: Vec<Vec<usize>>,
    pub distances: Vec<Vec<f64>>,
}

impl KnnRes {
    /// Number of samples
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// No samples at all
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

#[derive(Clone, Debug)]
struct Point(Vec<f32>);

impl DistancePoint for Point {
    /// Distance function. This is Euclidean distance without squaring for
    /// speed gains. Does not change the rank order in KNN generation.
    fn distance(&self, other: &Self) -> f32 {
        let mut sum = 0.0f32;

        for i in 0..self.0.len() {
            let diff = self.0[i] - other.0[i];
            sum += diff * diff;
        }
        sum
    }
}

/////////////
// Helpers //
/////////////

#[inline]
fn euclidean_row_dist(mat: MatRef<f64>, i: usize, j: usize) -> f64 {
    let mut sum = 0.0;
    for c in 0..mat.ncols() {
        let diff = mat[(i, c)] - mat[(j, c)];
        sum += diff * diff;
    }
    sum.sqrt()
}

////////////////////
// Main functions //
////////////////////

/// Exact kNN search
///
/// ### Params
///
/// * `mat` - Matrix in which rows represent the samples and columns the
///   respective embeddings for that sample
/// * `k` - Number of neighbours (must be smaller than the number of samples)
///
/// ### Returns
///
/// The `KnnRes`
pub fn knn_exact(mat: MatRef<f64>, k: usize) -> KnnRes {
    let n = mat.nrows();

    let res: Vec<(Vec<usize>, Vec<f64>)> = (0..n)
        .into_par_iter()
        .map(|i| {
            let mut candidates: Vec<(f64, usize)> = (0..n)
                .filter(|&j| j != i)
                .map(|j| (euclidean_row_dist(mat, i, j), j))
                .collect();
            candidates.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            candidates.truncate(k);
            candidates.into_iter().map(|(d, j)| (j, d)).unzip()
        })
        .collect();

    let (indices, distances) = res.into_iter().unzip();
    KnnRes { indices, distances }
}

/// Get the kNN graph based on HNSW
///
/// This function generates the kNN graph via an approximate nearest neighbour
/// search based on the HNSW algorithm (hierarchical navigable small world).
///
/// ### Params
///
/// * `mat` - Matrix in which rows represent the samples and columns the
///   respective embeddings for that sample
/// * `k` - Number of neighbours for the KNN graph
/// * `seed` - Seed for the HNSW algorithm
///
/// ### Returns
///
/// The `KnnRes` with exact distances for the found neighbours
pub fn knn_hnsw(mat: MatRef<f64>, k: usize, seed: u64) -> KnnRes {
    let n_samples = mat.nrows();
    let points: Vec<Point> = (0..n_samples)
        .into_par_iter()
        .map(|i| Point(mat.row(i).iter().map(|&v| v as f32).collect()))
        .collect();

    let map = Builder::default()
        .seed(seed)
        .build(points.clone(), (0..n_samples).collect::<Vec<_>>());

    let res: Vec<(Vec<usize>, Vec<f64>)> = points
        .par_iter()
        .enumerate()
        .map(|(i, point)| {
            let mut search = Search::default();
            let mut neighbours: Vec<usize> = map
                .search(point, &mut search)
                .take(k + 1)
                .map(|item| *item.value)
                .filter(|&j| j != i)
                .collect();
            neighbours.truncate(k);

            let mut scored: Vec<(f64, usize)> = neighbours
                .into_iter()
                .map(|j| (euclidean_row_dist(mat, i, j), j))
                .collect();
            scored.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            scored.into_iter().map(|(d, j)| (j, d)).unzip()
        })
        .collect();

    let (indices, distances) = res.into_iter().unzip();
    KnnRes { indices, distances }
}

/// Run the kNN search with the chosen method
///
/// ### Params
///
/// * `mat` - Samples x features
/// * `k` - Number of neighbours
/// * `method` - The `KnnMethod`
/// * `seed` - Seed (only used by HNSW)
pub fn find_knn(mat: MatRef<f64>, k: usize, method: KnnMethod, seed: u64) -> KnnRes {
    match method {
        KnnMethod::Exact => knn_exact(mat, k),
        KnnMethod::Hnsw => knn_hnsw(mat, k, seed),
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use faer::Mat;

    fn create_clustered_data() -> Mat<f64> {
        let mut data = Vec::new();

        for i in 0..30 {
            data.push(vec![(i as f64 * 0.1) % 2.0 - 1.0, (i as f64 * 0.15) % 2.0 - 1.0]);
        }
        for i in 0..30 {
            data.push(vec![
                10.0 + (i as f64 * 0.1) % 2.0 - 1.0,
                10.0 + (i as f64 * 0.15) % 2.0 - 1.0,
            ]);
        }

        Mat::from_fn(60, 2, |i, j| data[i][j])
    }

    #[test]
    fn test_exact_knn() {
        let data = create_clustered_data();
        let res = knn_exact(data.as_ref(), 5);
        assert_eq!(res.len(), 60);
        for (i, (neighbours, dists)) in res.indices.iter().zip(res.distances.iter()).enumerate() {
            assert_eq!(neighbours.len(), 5);
            assert!(!neighbours.contains(&i));
            assert!(dists.windows(2).all(|w| w[0] <= w[1]));
            let same_block = neighbours.iter().all(|&j| (j < 30) == (i < 30));
            assert!(same_block, "node {} has neighbours across blocks", i);
        }
    }

    #[test]
    fn test_exact_ties_by_index() {
        let data = Mat::from_fn(4, 1, |i, _| if i == 0 { 0.0 } else { 1.0 });
        let res = knn_exact(data.as_ref(), 2);
        assert_eq!(res.indices[0], vec![1, 2]);
    }

    #[test]
    fn test_hnsw_knn() {
        let data = create_clustered_data();
        let res = knn_hnsw(data.as_ref(), 5, 42);
        for (i, neighbours) in res.indices.iter().enumerate() {
            assert_eq!(neighbours.len(), 5);
            assert!(!neighbours.contains(&i));
        }
        let again = knn_hnsw(data.as_ref(), 5, 42);
        assert_eq!(res.indices, again.indices);
    }
}
