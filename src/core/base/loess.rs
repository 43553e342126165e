use rayon::prelude::*;

use crate::assert_same_len;
use crate::error::{config_err, Result};

/// Structure to store the Loess results
///
/// ### Params
///
/// * `fitted_vals` - The values fitted by the function (`NaN` for invalid
///   input positions).
/// * `residuals` - The residuals (`NaN` for invalid input positions).
/// * `valid_indices` - Which index positions were valid, sorted by x.
#[derive(Debug, Clone)]
pub struct LoessRes {
    pub fitted_vals: Vec<f64>,
    pub residuals: Vec<f64>,
    pub valid_indices: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoessFunc {
    /// Linear version of the Loess function
    Linear,
    /// Quadratic version of the Loess function
    Quadratic,
}

/// Parse the type of Loess function
///
/// ### Params
///
/// * `option` - Usize defining the degrees of freedom
///
/// ### Return
///
/// The option of the `LoessFunc`
pub fn parse_loess_fun(option: usize) -> Option<LoessFunc> {
    match option {
        1 => Some(LoessFunc::Linear),
        2 => Some(LoessFunc::Quadratic),
        _ => None,
    }
}

/////////////
// Helpers //
/////////////

fn solve_3x3_system(a: &[[f64; 3]; 3], b: &[f64; 3]) -> Option<[f64; 3]> {
    let mut matrix = *a;
    let mut rhs = *b;

    for i in 0..3 {
        // pivot
        let mut pivot_row = i;
        for j in (i + 1)..3 {
            if matrix[j][i].abs() > matrix[pivot_row][i].abs() {
                pivot_row = j;
            }
        }

        if pivot_row != i {
            matrix.swap(i, pivot_row);
            rhs.swap(i, pivot_row);
        }

        if matrix[i][i].abs() < 1e-12 {
            return None;
        }

        for j in (i + 1)..3 {
            let factor = matrix[j][i] / matrix[i][i];
            for k in i..3 {
                matrix[j][k] -= factor * matrix[i][k];
            }
            rhs[j] -= factor * rhs[i];
        }
    }

    let mut solution = [0.0; 3];
    for i in (0..3).rev() {
        solution[i] = rhs[i];
        for j in (i + 1)..3 {
            solution[i] -= matrix[i][j] * solution[j];
        }
        solution[i] /= matrix[i][i];
    }

    Some(solution)
}

/// Tricube weight function: (1 - |u|³)³ for |u| < 1, 0 otherwise
#[inline]
fn tricube_weight(u: f64) -> f64 {
    if u >= 1.0 {
        0.0
    } else {
        let temp = 1.0 - u * u * u;
        temp * temp * temp
    }
}

///////////
// Loess //
///////////

/// Local polynomial regression of one response on one predictor
#[derive(Debug, Clone)]
pub struct LoessRegression {
    span: f64,
    loess_type: LoessFunc,
}

impl LoessRegression {
    /// Generate a new instance of the Loess regression
    ///
    /// ### Params
    ///
    /// * `span` - Fraction of points used in each local fit, in `(0, 1]`.
    /// * `degree` - Degree of the local polynomial (1 or 2).
    ///
    /// ### Return
    ///
    /// Initialised class or a configuration error
    pub fn new(span: f64, degree: usize) -> Result<Self> {
        if !(span > 0.0 && span <= 1.0) {
            return config_err(format!("loess span must be in (0, 1], got {}", span));
        }
        let loess_type = match parse_loess_fun(degree) {
            Some(t) => t,
            None => {
                return config_err(format!(
                    "only linear (1) and quadratic (2) loess are supported, got {}",
                    degree
                ))
            }
        };

        Ok(Self { span, loess_type })
    }

    /// Fit the loess function (for a two variable system)
    ///
    /// Non-finite pairs are skipped and receive `NaN` as fitted value.
    ///
    /// ### Params
    ///
    /// * `x` - The predictor variable
    /// * `y` - The response variable
    ///
    /// ### Returns
    ///
    /// The fit results in form of a `LoessRes`
    pub fn fit(&self, x: &[f64], y: &[f64]) -> LoessRes {
        assert_same_len!(x, y);

        let n = x.len();
        let mut sorted_points: Vec<(usize, f64, f64)> = x
            .iter()
            .zip(y.iter())
            .enumerate()
            .filter(|(_, (x, y))| x.is_finite() && y.is_finite())
            .map(|(i, (&x, &y))| (i, x, y))
            .collect();

        let mut fitted_values = vec![f64::NAN; n];
        let mut residuals = vec![f64::NAN; n];

        if sorted_points.is_empty() {
            return LoessRes {
                fitted_vals: fitted_values,
                residuals,
                valid_indices: Vec::new(),
            };
        }

        sorted_points.sort_by(|a, b| a.1.total_cmp(&b.1));

        let n_valid = sorted_points.len();
        let no_neighbours = ((n_valid as f64 * self.span).floor() as usize).clamp(1, n_valid);

        let results: Vec<(usize, f64, f64)> = sorted_points
            .par_iter()
            .map(|&(orig_idx, x_val, y_val)| {
                let fitted_val = self.fit_point(&sorted_points, x_val, no_neighbours);
                (orig_idx, fitted_val, y_val - fitted_val)
            })
            .collect();

        for (orig_idx, fitted_val, residual) in results {
            fitted_values[orig_idx] = fitted_val;
            residuals[orig_idx] = residual;
        }

        LoessRes {
            fitted_vals: fitted_values,
            residuals,
            valid_indices: sorted_points.iter().map(|(idx, _, _)| *idx).collect(),
        }
    }

    /// Fits a given point
    ///
    /// ### Params
    ///
    /// * `sorted_points` - A slice of tuples of the position, x and y value
    /// * `target_x` - The target value
    /// * `k` - Number of neighbours
    ///
    /// ### Returns
    ///
    /// The fitted value
    fn fit_point(&self, sorted_points: &[(usize, f64, f64)], target_x: f64, k: usize) -> f64 {
        let neighbours = find_neighbours_binary(sorted_points, target_x, k);

        let max_dist = neighbours
            .iter()
            .map(|&i| (sorted_points[i].1 - target_x).abs())
            .fold(0.0, f64::max);

        if max_dist == 0.0 {
            return neighbours.iter().map(|&i| sorted_points[i].2).sum::<f64>()
                / neighbours.len() as f64;
        }

        // slightly widened window so the farthest neighbour keeps a small weight
        let inv_max_dist = 1.0 / (max_dist * 1.001);
        let mut dx = Vec::with_capacity(neighbours.len());
        let mut ys = Vec::with_capacity(neighbours.len());
        let mut ws = Vec::with_capacity(neighbours.len());

        for &idx in &neighbours {
            let (_, nx, ny) = sorted_points[idx];
            dx.push(nx - target_x);
            ys.push(ny);
            ws.push(tricube_weight((nx - target_x).abs() * inv_max_dist));
        }

        match self.loess_type {
            LoessFunc::Linear => weighted_linear_fit(&dx, &ys, &ws),
            LoessFunc::Quadratic => weighted_quadratic_fit(&dx, &ys, &ws),
        }
    }
}

/// Find the k nearest neighbours in x via binary search
///
/// ### Params
///
/// * `sorted_points` - A slice of tuples of the position, x and y value
/// * `target_x` - The target value
/// * `k` - Number of neighbours
fn find_neighbours_binary(sorted_points: &[(usize, f64, f64)], target_x: f64, k: usize) -> Vec<usize> {
    let n = sorted_points.len();
    if k >= n {
        return (0..n).collect();
    }

    let insert_pos = sorted_points.partition_point(|point| point.1 < target_x);

    let mut l = insert_pos;
    let mut r = insert_pos;
    let mut neighbours = Vec::with_capacity(k);

    for _ in 0..k {
        let left_dist = if l > 0 {
            (sorted_points[l - 1].1 - target_x).abs()
        } else {
            f64::INFINITY
        };
        let right_dist = if r < n {
            (sorted_points[r].1 - target_x).abs()
        } else {
            f64::INFINITY
        };

        if left_dist <= right_dist && l > 0 {
            l -= 1;
            neighbours.push(l);
        } else if r < n {
            neighbours.push(r);
            r += 1;
        } else {
            break;
        }
    }

    neighbours
}

/// Weighted linear fit evaluated at `dx == 0`
///
/// ### Params
///
/// * `dx` - Predictor values centred on the target
/// * `y` - Response values
/// * `w` - Weights
fn weighted_linear_fit(dx: &[f64], y: &[f64], w: &[f64]) -> f64 {
    let mut w_sum = 0.0;
    let mut wx_sum = 0.0;
    let mut wy_sum = 0.0;
    let mut wxx_sum = 0.0;
    let mut wxy_sum = 0.0;

    for i in 0..dx.len() {
        w_sum += w[i];
        wx_sum += w[i] * dx[i];
        wy_sum += w[i] * y[i];
        wxx_sum += w[i] * dx[i] * dx[i];
        wxy_sum += w[i] * dx[i] * y[i];
    }

    if w_sum == 0.0 {
        return y.iter().sum::<f64>() / y.len() as f64;
    }

    let x_mean = wx_sum / w_sum;
    let y_mean = wy_sum / w_sum;

    let numerator = wxy_sum - w_sum * x_mean * y_mean;
    let denominator = wxx_sum - w_sum * x_mean * x_mean;

    if denominator.abs() < 1e-12 {
        return y_mean;
    }

    let slope = numerator / denominator;
    y_mean - slope * x_mean
}

/// Weighted quadratic fit evaluated at `dx == 0`
///
/// Falls back to the linear fit for fewer than three points or a singular
/// normal matrix.
fn weighted_quadratic_fit(dx: &[f64], y: &[f64], w: &[f64]) -> f64 {
    if dx.len() < 3 {
        return weighted_linear_fit(dx, y, w);
    }

    let mut a = [[0.0; 3]; 3];
    let mut b = [0.0; 3];

    for i in 0..dx.len() {
        let xi = dx[i];
        let xi2 = xi * xi;
        let wi = w[i];

        a[0][0] += wi;
        a[0][1] += wi * xi;
        a[0][2] += wi * xi2;
        a[1][2] += wi * xi * xi2;
        a[2][2] += wi * xi2 * xi2;

        b[0] += wi * y[i];
        b[1] += wi * xi * y[i];
        b[2] += wi * xi2 * y[i];
    }

    a[1][1] = a[0][2];
    a[1][0] = a[0][1];
    a[2][0] = a[0][2];
    a[2][1] = a[1][2];

    match solve_3x3_system(&a, &b) {
        Some(coeffs) => coeffs[0],
        None => weighted_linear_fit(dx, y, w),
    }
}

///////////
// Tests //
///////////
