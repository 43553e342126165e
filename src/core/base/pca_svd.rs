use faer::{Mat, MatRef};
use rand::prelude::*;
use rand_distr::Normal;

use crate::error::{Result, ScError};

////////////////
// Structures //
////////////////

/// Structure for (truncated) SVD results
///
/// ### Fields
///
/// * `u` - Left singular vectors (nrow x rank)
/// * `v` - Right singular vectors (ncol x rank)
/// * `s` - Singular values in decreasing order
#[derive(Clone, Debug)]
pub struct SvdResults {
    pub u: Mat<f64>,
    pub v: Mat<f64>,
    pub s: Vec<f64>,
}

impl SvdResults {
    /// Number of retained components
    pub fn rank(&self) -> usize {
        self.s.len()
    }

    /// Keep only the first `rank` components
    fn truncate(self, rank: usize) -> Self {
        let rank = rank.min(self.s.len());
        Self {
            u: self.u.submatrix(0, 0, self.u.nrows(), rank).to_owned(),
            v: self.v.submatrix(0, 0, self.v.nrows(), rank).to_owned(),
            s: self.s[..rank].to_vec(),
        }
    }

    /// Deterministic sign convention
    ///
    /// Each component is flipped (in `u` and `v` together) so that the
    /// entry of `v` with the largest magnitude is positive.
    pub fn fix_signs(&mut self) {
        for j in 0..self.rank() {
            let mut best = 0.0_f64;
            for i in 0..self.v.nrows() {
                if self.v[(i, j)].abs() > best.abs() {
                    best = self.v[(i, j)];
                }
            }
            if best < 0.0 {
                for i in 0..self.v.nrows() {
                    self.v[(i, j)] = -self.v[(i, j)];
                }
                for i in 0..self.u.nrows() {
                    self.u[(i, j)] = -self.u[(i, j)];
                }
            }
        }
    }
}

///////////////
// Functions //
///////////////

fn svd_err(e: impl std::fmt::Debug) -> ScError {
    ScError::Numerical(format!("SVD did not converge: {:?}", e))
}

/// Thin SVD truncated to the leading components
///
/// ### Params
///
/// * `x` - The matrix to decompose
/// * `rank` - Number of components to keep
///
/// ### Returns
///
/// The `SvdResults` with signs fixed
pub fn truncated_svd(x: MatRef<f64>, rank: usize) -> Result<SvdResults> {
    let svd = x.thin_svd().map_err(svd_err)?;

    let mut res = SvdResults {
        u: svd.U().to_owned(),
        v: svd.V().to_owned(),
        s: svd.S().column_vector().iter().copied().collect(),
    }
    .truncate(rank);
    res.fix_signs();

    Ok(res)
}

/// Randomised SVD
///
/// ### Params
///
/// * `x` - The matrix on which to apply the randomised SVD.
/// * `rank` - The target rank of the approximation (number of singular values,
///   vectors to compute).
/// * `seed` - Random seed for reproducible results.
/// * `oversampling` - Additional samples beyond the target rank to improve
///   accuracy. Defaults to 10 if not specified.
/// * `n_power_iter` - Number of power iterations to perform for better
///   approximation quality. Defaults to 2 if not specified.
///
/// ### Returns
///
/// The randomised SVD results in form of `SvdResults` with signs fixed.
///
/// ### Algorithm Details
///
/// 1. Generate a random Gaussian matrix Ω of size n × (rank + oversampling)
/// 2. Compute Y = X * Ω to capture the range of X
/// 3. Orthogonalize Y using QR decomposition to get Q
/// 4. Apply power iterations: for each iteration, compute Z = X^T * Q, then Q = QR(X * Z)
/// 5. Form B = Q^T * X and compute its SVD
/// 6. Reconstruct the final SVD: U = Q * U_B, V = V_B, S = S_B
pub fn randomised_svd(
    x: MatRef<f64>,
    rank: usize,
    seed: u64,
    oversampling: Option<usize>,
    n_power_iter: Option<usize>,
) -> Result<SvdResults> {
    let ncol = x.ncols();
    let nrow = x.nrows();

    let os = oversampling.unwrap_or(10);
    let sample_size = (rank + os).min(ncol.min(nrow));
    let n_iter = n_power_iter.unwrap_or(2);

    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).map_err(|e| ScError::Numerical(e.to_string()))?;
    let omega = Mat::from_fn(ncol, sample_size, |_, _| normal.sample(&mut rng));

    let y = x * &omega;

    let mut q = y.qr().compute_thin_Q();
    for _ in 0..n_iter {
        let z = x.transpose() * &q;
        q = (x * &z).qr().compute_thin_Q();
    }

    let b = q.transpose() * x;
    let svd = b.thin_svd().map_err(svd_err)?;

    let mut res = SvdResults {
        u: &q * svd.U(),
        v: svd.V().to_owned(),
        s: svd.S().column_vector().iter().copied().collect(),
    }
    .truncate(rank);
    res.fix_signs();

    Ok(res)
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn low_rank_matrix() -> Mat<f64> {
        // rank two: outer products of two independent patterns plus a tiny tail
        Mat::from_fn(30, 12, |i, j| {
            let a = (i as f64 * 0.3).sin() * (j as f64 + 1.0);
            let b = (i as f64 * 0.7).cos() * ((j % 3) as f64 - 1.0);
            3.0 * a + b
        })
    }

    #[test]
    fn test_truncated_svd_reconstruction() {
        let x = low_rank_matrix();
        let res = truncated_svd(x.as_ref(), 2).unwrap();
        assert_eq!(res.rank(), 2);
        assert!(res.s[0] >= res.s[1]);
        for i in 0..x.nrows() {
            for j in 0..x.ncols() {
                let rec: f64 = (0..2).map(|k| res.u[(i, k)] * res.s[k] * res.v[(j, k)]).sum();
                assert_relative_eq!(rec, x[(i, j)], epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn test_sign_convention() {
        let x = low_rank_matrix();
        let res = truncated_svd(x.as_ref(), 2).unwrap();
        for k in 0..2 {
            let mut best = 0.0_f64;
            for j in 0..res.v.nrows() {
                if res.v[(j, k)].abs() > best.abs() {
                    best = res.v[(j, k)];
                }
            }
            assert!(best > 0.0);
        }
    }

    #[test]
    fn test_randomised_matches_exact() {
        let x = low_rank_matrix();
        let exact = truncated_svd(x.as_ref(), 2).unwrap();
        let approx = randomised_svd(x.as_ref(), 2, 42, None, None).unwrap();
        for k in 0..2 {
            assert_relative_eq!(exact.s[k], approx.s[k], epsilon = 1e-6);
            for j in 0..x.ncols() {
                assert_relative_eq!(exact.v[(j, k)], approx.v[(j, k)], epsilon = 1e-6);
            }
        }
    }
}
