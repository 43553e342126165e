use faer::{Mat, MatRef};
use log::{info, warn};
use rand::prelude::*;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::time::Instant;

use crate::core::graph::knn::{knn_exact, KnnRes};
use crate::ensure_config;
use crate::error::{Result, ScError};
use crate::single_cell::dataset::{DimReduction, ScDataset};
use crate::utils::general::array_max_abs;

////////////////
// Parameters //
////////////////

/// Parameters for UMAP
///
/// ### Fields
///
/// * `reduction` - Name of the input reduction.
/// * `dims` - Number of leading input components.
/// * `n_neighbours` - Size of the local neighbourhood.
/// * `n_components` - Output dimensions.
/// * `min_dist` - Minimum distance between points in the embedding.
/// * `spread` - Effective scale of the embedded points.
/// * `n_epochs` - Optimisation epochs. Defaults to 500 below 10,000 cells and
///   200 otherwise.
/// * `learning_rate` - Initial learning rate of the SGD.
/// * `negative_sample_rate` - Negative samples per positive edge.
/// * `seed` - Seed for reproducibility purposes.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct UmapParams {
    pub reduction: String,
    pub dims: usize,
    pub n_neighbours: usize,
    pub n_components: usize,
    pub min_dist: f64,
    pub spread: f64,
    pub n_epochs: Option<usize>,
    pub learning_rate: f64,
    pub negative_sample_rate: usize,
    pub seed: u64,
}

impl Default for UmapParams {
    fn default() -> Self {
        Self {
            reduction: "pca".to_string(),
            dims: 10,
            n_neighbours: 30,
            n_components: 2,
            min_dist: 0.3,
            spread: 1.0,
            n_epochs: None,
            learning_rate: 1.0,
            negative_sample_rate: 5,
            seed: 42,
        }
    }
}

impl UmapParams {
    pub fn validate(&self) -> Result<()> {
        ensure_config!(self.dims > 0, "dims must be at least 1");
        ensure_config!(self.n_neighbours > 0, "n_neighbours must be at least 1");
        ensure_config!(self.n_components > 0, "n_components must be at least 1");
        ensure_config!(self.spread > 0.0, "spread must be positive, got {}", self.spread);
        ensure_config!(
            self.min_dist >= 0.0 && self.min_dist <= self.spread,
            "min_dist must be within [0, spread], got {}",
            self.min_dist
        );
        ensure_config!(
            self.learning_rate > 0.0,
            "learning_rate must be positive, got {}",
            self.learning_rate
        );
        Ok(())
    }
}

////////////////
// Structures //
////////////////

/// Edge of the fuzzy union graph
#[derive(Clone, Debug)]
struct FuzzyEdge {
    i: usize,
    j: usize,
    weight: f64,
}

/////////////
// Helpers //
/////////////

/// Per sample `(rho, sigma)` of the smooth kNN distances
///
/// `rho` is the distance to the closest neighbour and `sigma` is found by
/// binary search so that `sum_j exp(-(d_j - rho) / sigma) = log2(k)`.
fn smooth_knn_dist(knn: &KnnRes, k: usize) -> Vec<(f64, f64)> {
    let target = (k as f64).log2();
    let mean_dist = {
        let all: Vec<f64> = knn.distances.iter().flatten().copied().collect();
        if all.is_empty() {
            0.0
        } else {
            all.iter().sum::<f64>() / all.len() as f64
        }
    };

    knn.distances
        .par_iter()
        .map(|dists| {
            let rho = dists.iter().copied().find(|&d| d > 0.0).unwrap_or(0.0);

            let mut lo = 0.0_f64;
            let mut hi = f64::INFINITY;
            let mut mid = 1.0_f64;
            for _ in 0..64 {
                let psum: f64 = dists
                    .iter()
                    .map(|&d| (-(d - rho).max(0.0) / mid).exp())
                    .sum();
                if (psum - target).abs() < 1e-5 {
                    break;
                }
                if psum > target {
                    hi = mid;
                    mid = (lo + hi) / 2.0;
                } else {
                    lo = mid;
                    mid = if hi.is_infinite() { mid * 2.0 } else { (lo + hi) / 2.0 };
                }
            }

            let local_mean = if dists.is_empty() {
                0.0
            } else {
                dists.iter().sum::<f64>() / dists.len() as f64
            };
            let floor = if rho > 0.0 { local_mean } else { mean_dist } * 1e-3;
            (rho, mid.max(floor))
        })
        .collect()
}

/// Fuzzy union of the directed membership strengths
///
/// `w_sym = w_ij + w_ji - w_ij * w_ji`
fn fuzzy_union(knn: &KnnRes, smooth: &[(f64, f64)]) -> Vec<FuzzyEdge> {
    let mut pair_weights: FxHashMap<(usize, usize), (f64, f64)> = FxHashMap::default();

    for (i, (neighbours, dists)) in knn.indices.iter().zip(&knn.distances).enumerate() {
        let (rho, sigma) = smooth[i];
        for (&j, &d) in neighbours.iter().zip(dists) {
            let w = if sigma > 0.0 {
                (-(d - rho).max(0.0) / sigma).exp()
            } else {
                1.0
            };
            let entry = pair_weights.entry((i.min(j), i.max(j))).or_insert((0.0, 0.0));
            if i < j {
                entry.0 = w;
            } else {
                entry.1 = w;
            }
        }
    }

    let mut edges: Vec<FuzzyEdge> = pair_weights
        .into_iter()
        .map(|((i, j), (w_ij, w_ji))| FuzzyEdge {
            i,
            j,
            weight: w_ij + w_ji - w_ij * w_ji,
        })
        .filter(|e| e.weight > 0.0)
        .collect();
    edges.sort_unstable_by_key(|e| (e.i, e.j));
    edges
}

/// Fit `a` and `b` of the curve `1 / (1 + a * d^(2b))`
///
/// Levenberg-Marquardt least squares against the target `1` for
/// `d <= min_dist` and `exp(-(d - min_dist) / spread)` beyond, on 300 points
/// in `(0, 3 * spread]`.
fn fit_ab(min_dist: f64, spread: f64) -> (f64, f64) {
    let n_points = 300;
    let xs: Vec<f64> = (1..=n_points)
        .map(|i| i as f64 * 3.0 * spread / n_points as f64)
        .collect();
    let ys: Vec<f64> = xs
        .iter()
        .map(|&d| {
            if d <= min_dist {
                1.0
            } else {
                (-(d - min_dist) / spread).exp()
            }
        })
        .collect();

    let sse = |a: f64, b: f64| -> f64 {
        xs.iter()
            .zip(&ys)
            .map(|(&d, &y)| {
                let r = 1.0 / (1.0 + a * d.powf(2.0 * b)) - y;
                r * r
            })
            .sum()
    };

    let (mut a, mut b) = (1.0_f64, 1.0_f64);
    let mut lambda = 1e-3;
    let mut current = sse(a, b);

    for _ in 0..200 {
        let (mut j00, mut j01, mut j11, mut g0, mut g1) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for (&d, &y) in xs.iter().zip(&ys) {
            let d2b = d.powf(2.0 * b);
            let denom = 1.0 + a * d2b;
            let f = 1.0 / denom;
            let r = f - y;
            let df_da = -d2b / (denom * denom);
            let df_db = -2.0 * a * d2b * d.ln() / (denom * denom);
            j00 += df_da * df_da;
            j01 += df_da * df_db;
            j11 += df_db * df_db;
            g0 += df_da * r;
            g1 += df_db * r;
        }

        let mut improved = false;
        while lambda < 1e10 {
            let m00 = j00 * (1.0 + lambda);
            let m11 = j11 * (1.0 + lambda);
            let det = m00 * m11 - j01 * j01;
            if det.abs() < 1e-300 {
                lambda *= 10.0;
                continue;
            }
            let da = -(m11 * g0 - j01 * g1) / det;
            let db = -(m00 * g1 - j01 * g0) / det;
            let (new_a, new_b) = ((a + da).max(1e-3), (b + db).max(1e-3));
            let new_sse = sse(new_a, new_b);
            if new_sse < current {
                let converged = (current - new_sse) < 1e-14;
                a = new_a;
                b = new_b;
                current = new_sse;
                lambda = (lambda / 10.0).max(1e-12);
                improved = !converged;
                break;
            }
            lambda *= 10.0;
        }
        if !improved {
            break;
        }
    }

    (a, b)
}

/// Initial layout from the leading input components scaled to +/- 10
fn initialise_embedding(input: MatRef<f64>, n_components: usize, rng: &mut StdRng) -> Mat<f64> {
    let n = input.nrows();
    let mut embd = Mat::from_fn(n, n_components, |i, j| {
        if j < input.ncols() {
            input[(i, j)]
        } else {
            0.0
        }
    });

    let values: Vec<f64> = (0..n)
        .flat_map(|i| (0..input.ncols().min(n_components)).map(move |j| (i, j)))
        .map(|(i, j)| embd[(i, j)])
        .collect();
    let max_abs = array_max_abs(&values);
    let scale = if max_abs > 0.0 { 10.0 / max_abs } else { 1.0 };

    for j in 0..n_components {
        for i in 0..n {
            embd[(i, j)] = if j < input.ncols() && max_abs > 0.0 {
                embd[(i, j)] * scale
            } else {
                rng.random_range(-10.0..10.0)
            };
        }
    }
    embd
}

#[inline]
fn sq_dist(embd: &Mat<f64>, i: usize, j: usize) -> f64 {
    let mut sum = 0.0;
    for d in 0..embd.ncols() {
        let diff = embd[(i, d)] - embd[(j, d)];
        sum += diff * diff;
    }
    sum
}

/// SGD with negative sampling
///
/// Edges are sampled proportionally to their weight; each positive sample
/// pulls both ends together, each negative sample pushes the head away from
/// a random point. The learning rate decays linearly.
#[allow(clippy::too_many_arguments)]
fn optimise_layout(
    embd: &mut Mat<f64>,
    edges: &[FuzzyEdge],
    a: f64,
    b: f64,
    learning_rate: f64,
    n_epochs: usize,
    negative_sample_rate: usize,
    rng: &mut StdRng,
) {
    let n = embd.nrows();
    let n_dim = embd.ncols();
    let max_weight = edges.iter().map(|e| e.weight).fold(0.0_f64, f64::max);
    if edges.is_empty() || n_epochs == 0 || max_weight <= 0.0 {
        return;
    }

    let epochs_per_sample: Vec<f64> = edges.iter().map(|e| max_weight / e.weight).collect();
    let mut next_sample = epochs_per_sample.clone();
    let clip = 4.0;

    for epoch in 0..n_epochs {
        let lr = learning_rate * (1.0 - epoch as f64 / n_epochs as f64);

        for (idx, edge) in edges.iter().enumerate() {
            if next_sample[idx] > (epoch + 1) as f64 {
                continue;
            }
            let (i, j) = (edge.i, edge.j);

            let dist_sq = sq_dist(embd, i, j);
            if dist_sq > 0.0 {
                let coeff = -2.0 * a * b * dist_sq.powf(b - 1.0) / (1.0 + a * dist_sq.powf(b));
                for d in 0..n_dim {
                    let grad = (coeff * (embd[(i, d)] - embd[(j, d)])).clamp(-clip, clip);
                    embd[(i, d)] += lr * grad;
                    embd[(j, d)] -= lr * grad;
                }
            }

            for _ in 0..negative_sample_rate {
                let neg = rng.random_range(0..n);
                if neg == i {
                    continue;
                }
                let dist_sq = sq_dist(embd, i, neg);
                let coeff = 2.0 * b / ((0.001 + dist_sq) * (1.0 + a * dist_sq.powf(b)));
                for d in 0..n_dim {
                    let grad = if dist_sq > 0.0 {
                        (coeff * (embd[(i, d)] - embd[(neg, d)])).clamp(-clip, clip)
                    } else {
                        clip
                    };
                    embd[(i, d)] += lr * grad;
                }
            }

            next_sample[idx] += epochs_per_sample[idx];
        }
    }
}

////////////
// Stages //
////////////

impl ScDataset {
    /// UMAP embedding of a reduction
    ///
    /// Exact kNN, smooth kNN distances, fuzzy union graph, a/b curve fit,
    /// initialisation from the input components and seeded SGD. The result
    /// is stored as `"umap"`; nothing downstream depends on it.
    ///
    /// ### Params
    ///
    /// * `params` - The `UmapParams`
    ///
    /// ### Returns
    ///
    /// The dataset with the `"umap"` reduction (cells x `n_components`)
    pub fn run_umap(&self, params: &UmapParams) -> Result<ScDataset> {
        params.validate()?;
        let reduction = self.reductions.get(&params.reduction).ok_or_else(|| {
            ScError::MissingStage(format!("UMAP requires the '{}' reduction", params.reduction))
        })?;
        let n_cells = self.n_cells();
        if n_cells < 3 {
            return Err(ScError::InsufficientData("UMAP needs at least three cells".into()));
        }
        let start = Instant::now();

        let dims = params.dims.min(reduction.n_components());
        if dims < params.dims {
            warn!(
                "Requested {} dims but '{}' has {} components. Using {}.",
                params.dims, params.reduction, dims, dims
            );
        }
        let k = if params.n_neighbours >= n_cells {
            warn!(
                "n_neighbours ({}) is not smaller than the number of cells. Using {}.",
                params.n_neighbours,
                n_cells - 1
            );
            n_cells - 1
        } else {
            params.n_neighbours
        };
        let n_epochs = params
            .n_epochs
            .unwrap_or(if n_cells <= 10_000 { 500 } else { 200 });

        let input = reduction.embeddings.as_ref().submatrix(0, 0, n_cells, dims);
        let knn = knn_exact(input, k);
        let smooth = smooth_knn_dist(&knn, k);
        let edges = fuzzy_union(&knn, &smooth);
        let (a, b) = fit_ab(params.min_dist, params.spread);

        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut embd = initialise_embedding(input, params.n_components, &mut rng);
        optimise_layout(
            &mut embd,
            &edges,
            a,
            b,
            params.learning_rate,
            n_epochs,
            params.negative_sample_rate,
            &mut rng,
        );

        info!(
            "UMAP of {} cells (k = {}, {} epochs, a = {:.3}, b = {:.3}): {:.2?}",
            n_cells,
            k,
            n_epochs,
            a,
            b,
            start.elapsed()
        );

        let mut res = self.clone();
        res.reductions.insert(
            "umap".to_string(),
            DimReduction {
                embeddings: embd,
                loadings: None,
                feature_indices: Vec::new(),
                stdev: Vec::new(),
                jackstraw: None,
            },
        );
        Ok(res)
    }
}

///////////
// Tests //
///////////
