use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Ordering;

//////////////////
// VECTOR STUFF //
//////////////////

/// Get the maximum absolute value of an array
///
/// ### Params
///
/// * `arr` - The array of values
///
/// ### Returns
///
/// The maximum absolute value (`0.0` for empty arrays)
pub fn array_max_abs(arr: &[f64]) -> f64 {
    arr.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()))
}

/// Mean and sample variance of a slice
///
/// ### Params
///
/// * `x` - Slice of `f64`
///
/// ### Returns
///
/// Tuple of `(mean, variance)` with the variance using `n - 1` in the
/// denominator. Slices with fewer than two values have a variance of `0.0`.
pub fn mean_var(x: &[f64]) -> (f64, f64) {
    let n = x.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = x.iter().sum::<f64>() / n as f64;
    if n < 2 {
        return (mean, 0.0);
    }
    let ss: f64 = x.iter().map(|&v| (v - mean) * (v - mean)).sum();
    (mean, ss / (n - 1) as f64)
}

/// Stable descending order of the values
///
/// Ties keep their original order, i.e., the lower index comes first. NaNs
/// are sorted to the end.
///
/// ### Params
///
/// * `values` - The values to order
///
/// ### Returns
///
/// Index positions sorted from largest to smallest value
pub fn order_desc_stable(values: &[f64]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    idx.sort_by(|&a, &b| match (values[a].is_nan(), values[b].is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        _ => values[b].total_cmp(&values[a]),
    });
    idx
}

//////////////////
// STRING STUFF //
//////////////////

/// Make names unique
///
/// Duplicated names receive a `.1`, `.2`, ... suffix in order of occurrence,
/// skipping suffixes that would collide with an existing name.
///
/// ### Params
///
/// * `names` - The names to disambiguate
///
/// ### Returns
///
/// Vector of unique names with the same length as the input
pub fn make_unique(names: &[String]) -> Vec<String> {
    let mut seen: FxHashSet<String> = names.iter().cloned().collect();
    let mut first: FxHashSet<&str> = FxHashSet::default();
    let mut counters: FxHashMap<&str, usize> = FxHashMap::default();
    let mut res = Vec::with_capacity(names.len());

    for name in names {
        if first.insert(name.as_str()) {
            res.push(name.clone());
            continue;
        }
        let counter = counters.entry(name.as_str()).or_insert(0);
        let candidate = loop {
            *counter += 1;
            let candidate = format!("{}.{}", name, counter);
            if !seen.contains(&candidate) {
                break candidate;
            }
        };
        seen.insert(candidate.clone());
        res.push(candidate);
    }

    res
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_unique() {
        let names: Vec<String> = ["A", "B", "A", "A", "A.1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let res = make_unique(&names);
        assert_eq!(res, vec!["A", "B", "A.2", "A.3", "A.1"]);
    }

    #[test]
    fn test_order_desc_stable() {
        let res = order_desc_stable(&[1.0, 3.0, f64::NAN, 3.0, 2.0]);
        assert_eq!(res, vec![1, 3, 4, 0, 2]);
    }

    #[test]
    fn test_mean_var() {
        let (m, v) = mean_var(&[1.0, 2.0, 3.0, 4.0]);
        assert!((m - 2.5).abs() < 1e-12);
        assert!((v - 5.0 / 3.0).abs() < 1e-12);
    }
}
