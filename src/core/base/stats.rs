use statrs::distribution::{ChiSquared, Continuous, ContinuousCDF, Normal, StudentsT};
use std::cmp::Ordering;

/////////////
// Helpers //
/////////////

/// Upper tail of the standard normal with an asymptotic expansion for
/// large z where `1 - cdf` loses precision.
fn normal_upper_tail(normal: &Normal, z: f64) -> f64 {
    if z > 6.0 {
        normal.pdf(z) / z * (1.0 - 1.0 / (z * z))
    } else {
        1.0 - normal.cdf(z)
    }
}

///////////////
// Functions //
///////////////

/// Transform a Z-score into a two sided p-value (assuming normality).
///
/// ### Params
///
/// * `z` - The Z score
///
/// ### Returns
///
/// The p-value
pub fn z_score_to_pval(z: f64) -> f64 {
    let normal = Normal::standard();
    (2.0 * normal_upper_tail(&normal, z.abs())).clamp(0.0, 1.0)
}

/// Bonferroni adjustment
///
/// ### Params
///
/// * `pval` - The raw p-value
/// * `n_tests` - Number of tests to correct for
///
/// ### Returns
///
/// `min(1, pval * n_tests)`
#[inline]
pub fn bonferroni(pval: f64, n_tests: usize) -> f64 {
    (pval * n_tests as f64).min(1.0)
}

/// Average ranks with ties
///
/// ### Params
///
/// * `x` - The values to rank
///
/// ### Returns
///
/// Tuple of the 1-based ranks (ties receive their average rank) and the tie
/// term `sum(t^3 - t)` over all tie groups.
pub fn rank_with_ties(x: &[f64]) -> (Vec<f64>, f64) {
    let n = x.len();
    let mut indexed: Vec<(usize, f64)> = x.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

    let mut ranks = vec![0.0; n];
    let mut tie_term = 0.0;
    let mut i = 0;
    while i < n {
        let mut j = i + 1;
        while j < n && indexed[j].1 == indexed[i].1 {
            j += 1;
        }
        let avg_rank = (i + j + 1) as f64 / 2.0;
        for item in &indexed[i..j] {
            ranks[item.0] = avg_rank;
        }
        let t = (j - i) as f64;
        tie_term += t * t * t - t;
        i = j;
    }

    (ranks, tie_term)
}

/// Result of a two-group rank comparison
///
/// ### Fields
///
/// * `auc` - Probability that a random value of group 1 exceeds one of
///   group 2 (ties count half).
/// * `p_val` - Two sided p-value of the Wilcoxon rank-sum test.
#[derive(Clone, Copy, Debug)]
pub struct RankSumRes {
    pub auc: f64,
    pub p_val: f64,
}

/// Wilcoxon rank-sum (Mann-Whitney) test
///
/// Normal approximation with tie correction of the variance and continuity
/// correction, two sided.
///
/// ### Params
///
/// * `x1` - Values of group 1
/// * `x2` - Values of group 2
///
/// ### Returns
///
/// The `RankSumRes`; degenerate inputs (an empty group or all values tied)
/// give a p-value of 1.
pub fn wilcoxon_rank_sum(x1: &[f64], x2: &[f64]) -> RankSumRes {
    let n1 = x1.len() as f64;
    let n2 = x2.len() as f64;

    if x1.is_empty() || x2.is_empty() {
        return RankSumRes {
            auc: 0.5,
            p_val: 1.0,
        };
    }

    let combined: Vec<f64> = x1.iter().chain(x2.iter()).copied().collect();
    let (ranks, tie_term) = rank_with_ties(&combined);

    let r1: f64 = ranks[..x1.len()].iter().sum();
    let w = r1 - n1 * (n1 + 1.0) / 2.0;
    let auc = w / (n1 * n2);

    let n = n1 + n2;
    let mean = n1 * n2 / 2.0;
    let variance = n1 * n2 / 12.0 * ((n + 1.0) - tie_term / (n * (n - 1.0)));

    if variance <= 0.0 {
        return RankSumRes { auc, p_val: 1.0 };
    }

    // no continuity correction when W sits at its mean
    let diff = w - mean;
    let correction = if diff > 0.0 {
        0.5
    } else if diff < 0.0 {
        -0.5
    } else {
        0.0
    };
    let z = (diff - correction) / variance.sqrt();

    RankSumRes {
        auc,
        p_val: z_score_to_pval(z),
    }
}

/// Welch two sample t-test (two sided)
///
/// ### Params
///
/// * `x1` - Values of group 1
/// * `x2` - Values of group 2
///
/// ### Returns
///
/// The p-value. Groups with fewer than two values give 1. Without any
/// variance the p-value is 1 for equal means and 0 otherwise.
pub fn welch_t_test(x1: &[f64], x2: &[f64]) -> f64 {
    if x1.len() < 2 || x2.len() < 2 {
        return 1.0;
    }
    let (m1, v1) = crate::utils::general::mean_var(x1);
    let (m2, v2) = crate::utils::general::mean_var(x2);
    let n1 = x1.len() as f64;
    let n2 = x2.len() as f64;

    let se1 = v1 / n1;
    let se2 = v2 / n2;
    let se = (se1 + se2).sqrt();

    if se == 0.0 {
        return if m1 == m2 { 1.0 } else { 0.0 };
    }

    let t = (m1 - m2) / se;
    let df = (se1 + se2).powi(2) / (se1 * se1 / (n1 - 1.0) + se2 * se2 / (n2 - 1.0));

    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => (2.0 * dist.sf(t.abs())).clamp(0.0, 1.0),
        Err(_) => 1.0,
    }
}

/// Two sample test for equality of proportions
///
/// Pearson chi-square test on the 2x2 table with Yates' continuity
/// correction.
///
/// ### Params
///
/// * `x1` - Successes in sample 1
/// * `n1` - Trials in sample 1
/// * `x2` - Successes in sample 2
/// * `n2` - Trials in sample 2
///
/// ### Returns
///
/// The p-value. Tables with an empty expected cell give 1.
pub fn prop_test_two_sample(x1: usize, n1: usize, x2: usize, n2: usize) -> f64 {
    if n1 == 0 || n2 == 0 {
        return 1.0;
    }
    let (x1, n1, x2, n2) = (x1 as f64, n1 as f64, x2 as f64, n2 as f64);
    let pooled = (x1 + x2) / (n1 + n2);

    let observed = [x1, n1 - x1, x2, n2 - x2];
    let expected = [
        n1 * pooled,
        n1 * (1.0 - pooled),
        n2 * pooled,
        n2 * (1.0 - pooled),
    ];
    if expected.iter().any(|&e| e <= 0.0) {
        return 1.0;
    }

    let delta = x1 / n1 - x2 / n2;
    let yates = (0.5_f64).min(delta.abs() / (1.0 / n1 + 1.0 / n2));

    let statistic: f64 = observed
        .iter()
        .zip(expected.iter())
        .map(|(o, e)| {
            let d = (o - e).abs() - yates;
            d * d / e
        })
        .sum();

    match ChiSquared::new(1.0) {
        Ok(dist) => dist.sf(statistic).clamp(0.0, 1.0),
        Err(_) => 1.0,
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rank_with_ties() {
        let (ranks, ties) = rank_with_ties(&[3.0, 1.0, 3.0, 2.0, 3.0]);
        assert_eq!(ranks, vec![4.0, 1.0, 4.0, 2.0, 4.0]);
        assert_relative_eq!(ties, 24.0);
    }

    #[test]
    fn test_wilcoxon_separated_groups() {
        let x1 = [1.0, 2.0, 3.0, 4.0, 5.0];
        let x2 = [6.0, 7.0, 8.0, 9.0, 10.0];
        let res = wilcoxon_rank_sum(&x1, &x2);
        assert_relative_eq!(res.auc, 0.0);
        assert_relative_eq!(res.p_val, 0.012185780355344818, epsilon = 1e-9);

        let flipped = wilcoxon_rank_sum(&x2, &x1);
        assert_relative_eq!(flipped.auc, 1.0);
        assert_relative_eq!(flipped.p_val, res.p_val, epsilon = 1e-12);
    }

    #[test]
    fn test_wilcoxon_no_difference() {
        let res = wilcoxon_rank_sum(&[1.0, 2.0], &[1.0, 2.0]);
        assert_relative_eq!(res.auc, 0.5);
        assert_relative_eq!(res.p_val, 1.0);

        // W equals its mean without shared values
        let res = wilcoxon_rank_sum(&[1.0, 4.0, 5.0, 8.0], &[2.0, 3.0, 6.0, 7.0]);
        assert_relative_eq!(res.auc, 0.5);
        assert_relative_eq!(res.p_val, 1.0);
    }

    #[test]
    fn test_wilcoxon_all_tied() {
        let res = wilcoxon_rank_sum(&[0.0, 0.0], &[0.0, 0.0, 0.0]);
        assert_relative_eq!(res.auc, 0.5);
        assert_relative_eq!(res.p_val, 1.0);
    }

    #[test]
    fn test_welch() {
        let x1 = [1.0, 2.0, 3.0, 4.0, 5.0];
        let x2 = [2.0, 4.0, 6.0, 8.0, 10.0];
        let p = welch_t_test(&x1, &x2);
        assert!(p > 0.09 && p < 0.12, "p = {}", p);
        assert_relative_eq!(welch_t_test(&x1, &x1), 1.0, epsilon = 1e-12);
        assert_relative_eq!(welch_t_test(&[1.0, 1.0], &[2.0, 2.0]), 0.0);
    }

    #[test]
    fn test_prop_test() {
        let p = prop_test_two_sample(15, 50, 25, 50);
        assert_relative_eq!(p, 0.06619257972219343, epsilon = 1e-8);
        assert_relative_eq!(prop_test_two_sample(0, 50, 0, 50), 1.0);
    }

    #[test]
    fn test_z_to_pval() {
        assert_relative_eq!(z_score_to_pval(0.0), 1.0);
        assert_relative_eq!(z_score_to_pval(1.96), z_score_to_pval(-1.96), epsilon = 1e-12);
        assert_relative_eq!(z_score_to_pval(1.959963984540054), 0.05, epsilon = 1e-9);
        assert!(z_score_to_pval(10.0) > 0.0);
    }

    #[test]
    fn test_bonferroni() {
        assert_relative_eq!(bonferroni(0.01, 10), 0.1);
        assert_relative_eq!(bonferroni(0.5, 10), 1.0);
    }
}
