use log::{info, warn};
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use serde::Deserialize;
use std::time::Instant;

use crate::core::base::stats::{bonferroni, welch_t_test, wilcoxon_rank_sum};
use crate::ensure_config;
use crate::error::{Result, ScError};
use crate::single_cell::dataset::ScDataset;

///////////
// Enums //
///////////

/// A group of cells for the marker comparison
#[derive(Clone, Debug, PartialEq)]
pub enum CellGroup {
    /// All cells of one cluster
    Cluster(usize),
    /// All cells of several clusters
    Clusters(Vec<usize>),
    /// Explicit cell identifiers
    Cells(Vec<String>),
}

/// Test used to rank the marker genes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerTest {
    /// Wilcoxon rank-sum test
    Wilcox,
    /// Welch two sample t-test
    TTest,
    /// Classifier power based on the AUC
    Roc,
}

/// Significance of one marker gene
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Significance {
    /// `Wilcox` and `TTest`; `p_val_adj` is Bonferroni over all genes
    PValue { p_val: f64, p_val_adj: f64 },
    /// `Roc`; `power = 2 * |auc - 0.5|`
    Roc { auc: f64, power: f64 },
}

////////////////
// Parameters //
////////////////

/// Parameters for the marker detection
///
/// ### Fields
///
/// * `test` - The `MarkerTest`.
/// * `min_pct` - Genes need to be detected in at least this fraction of
///   cells of one of the groups.
/// * `logfc_threshold` - Minimum absolute average log2 fold change.
/// * `only_pos` - Only report genes higher in the first group.
/// * `pseudocount` - Added to the group means before the log2.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MarkerParams {
    pub test: MarkerTest,
    pub min_pct: f64,
    pub logfc_threshold: f64,
    pub only_pos: bool,
    pub pseudocount: f64,
}

impl Default for MarkerParams {
    fn default() -> Self {
        Self {
            test: MarkerTest::Wilcox,
            min_pct: 0.1,
            logfc_threshold: 0.25,
            only_pos: false,
            pseudocount: 1.0,
        }
    }
}

impl MarkerParams {
    pub fn validate(&self) -> Result<()> {
        ensure_config!(
            (0.0..=1.0).contains(&self.min_pct),
            "min_pct must be within [0, 1], got {}",
            self.min_pct
        );
        ensure_config!(
            self.logfc_threshold >= 0.0,
            "logfc_threshold must be non-negative, got {}",
            self.logfc_threshold
        );
        ensure_config!(
            self.pseudocount > 0.0,
            "pseudocount must be positive, got {}",
            self.pseudocount
        );
        Ok(())
    }
}

////////////////
// Structures //
////////////////

/// One marker gene
///
/// ### Fields
///
/// * `gene` - Gene identifier.
/// * `gene_index` - Index of the gene in the dataset.
/// * `avg_log2fc` - Average log2 fold change of group 1 over group 2.
/// * `pct_1` - Fraction of group 1 cells expressing the gene.
/// * `pct_2` - Fraction of group 2 cells expressing the gene.
/// * `significance` - The `Significance`.
#[derive(Clone, Debug, PartialEq)]
pub struct MarkerRecord {
    pub gene: String,
    pub gene_index: usize,
    pub avg_log2fc: f64,
    pub pct_1: f64,
    pub pct_2: f64,
    pub significance: Significance,
}

/// Ordered marker genes of one comparison
#[derive(Clone, Debug)]
pub struct MarkerTable {
    pub test: MarkerTest,
    pub records: Vec<MarkerRecord>,
}

/// Markers of one cluster against all other cells
#[derive(Clone, Debug)]
pub struct ClusterMarkers {
    pub cluster: usize,
    pub label: String,
    pub table: MarkerTable,
}

impl ClusterMarkers {
    /// The best `n` records
    pub fn top(&self, n: usize) -> &[MarkerRecord] {
        &self.table.records[..n.min(self.table.records.len())]
    }
}

/////////////
// Helpers //
/////////////

/// Statistic used for the ordering; smaller is better
fn sort_key(record: &MarkerRecord) -> f64 {
    match record.significance {
        Significance::PValue { p_val, .. } => p_val,
        Significance::Roc { power, .. } => -power,
    }
}

/// Order the records: statistic, then fold change (descending), then gene
fn order_records(records: &mut [MarkerRecord]) {
    records.sort_by(|a, b| {
        sort_key(a)
            .total_cmp(&sort_key(b))
            .then(b.avg_log2fc.total_cmp(&a.avg_log2fc))
            .then(a.gene_index.cmp(&b.gene_index))
    });
}

impl ScDataset {
    /// Resolve a `CellGroup` into sorted, unique cell indices
    fn resolve_group(&self, group: &CellGroup) -> Result<Vec<usize>> {
        let mut cells = match group {
            CellGroup::Cells(ids) => self.cell_indices(ids)?,
            CellGroup::Cluster(c) => self.cluster_cells(std::slice::from_ref(c))?,
            CellGroup::Clusters(cs) => self.cluster_cells(cs)?,
        };
        cells.sort_unstable();
        cells.dedup();
        Ok(cells)
    }

    fn cluster_cells(&self, clusters: &[usize]) -> Result<Vec<usize>> {
        let assignment = self.clusters.as_ref().ok_or_else(|| {
            ScError::MissingStage("cluster groups require a clustering".into())
        })?;
        let n_clusters = assignment.n_clusters();
        let unknown: Vec<usize> = clusters.iter().copied().filter(|&c| c >= n_clusters).collect();
        ensure_config!(unknown.is_empty(), "unknown clusters: {:?}", unknown);

        let wanted: FxHashSet<usize> = clusters.iter().copied().collect();
        Ok(assignment
            .clusters
            .iter()
            .enumerate()
            .filter(|(_, &c)| wanted.contains(&c))
            .map(|(i, _)| i)
            .collect())
    }
}

////////////
// Stages //
////////////

impl ScDataset {
    /// Marker genes of one group of cells against another
    ///
    /// ### Params
    ///
    /// * `group_1` - The group of interest
    /// * `group_2` - The comparison group; `None` uses all remaining cells
    /// * `params` - The `MarkerParams`
    ///
    /// ### Returns
    ///
    /// The `MarkerTable`, ordered by p-value (or power for `Roc`), then by
    /// fold change
    pub fn find_markers(
        &self,
        group_1: &CellGroup,
        group_2: Option<&CellGroup>,
        params: &MarkerParams,
    ) -> Result<MarkerTable> {
        params.validate()?;
        let normalised = self
            .normalised
            .as_ref()
            .ok_or_else(|| ScError::MissingStage("markers require normalised data".into()))?;

        let cells_1 = self.resolve_group(group_1)?;
        let cells_2 = match group_2 {
            Some(group) => {
                let cells = self.resolve_group(group)?;
                let in_1: FxHashSet<usize> = cells_1.iter().copied().collect();
                ensure_config!(
                    cells.iter().all(|c| !in_1.contains(c)),
                    "the two groups share cells"
                );
                cells
            }
            None => {
                let in_1: FxHashSet<usize> = cells_1.iter().copied().collect();
                (0..self.n_cells()).filter(|c| !in_1.contains(c)).collect()
            }
        };
        if cells_1.is_empty() || cells_2.is_empty() {
            return Err(ScError::InsufficientData(format!(
                "marker groups need cells, got {} and {}",
                cells_1.len(),
                cells_2.len()
            )));
        }
        let start = Instant::now();

        let n_genes = self.n_genes();
        let csr = normalised.to_other_format();
        let (n1, n2) = (cells_1.len() as f64, cells_2.len() as f64);

        let mut records: Vec<MarkerRecord> = (0..n_genes)
            .into_par_iter()
            .filter_map(|gene| {
                let dense = csr.outer_dense(gene);
                let x1: Vec<f64> = cells_1.iter().map(|&c| dense[c]).collect();
                let x2: Vec<f64> = cells_2.iter().map(|&c| dense[c]).collect();

                let pct_1 = x1.iter().filter(|&&v| v > 0.0).count() as f64 / n1;
                let pct_2 = x2.iter().filter(|&&v| v > 0.0).count() as f64 / n2;
                if pct_1.max(pct_2) < params.min_pct {
                    return None;
                }

                let mean_1 = x1.iter().map(|v| v.exp_m1()).sum::<f64>() / n1;
                let mean_2 = x2.iter().map(|v| v.exp_m1()).sum::<f64>() / n2;
                let avg_log2fc =
                    (mean_1 + params.pseudocount).log2() - (mean_2 + params.pseudocount).log2();
                let passes = if params.only_pos {
                    avg_log2fc >= params.logfc_threshold
                } else {
                    avg_log2fc.abs() >= params.logfc_threshold
                };
                if !passes {
                    return None;
                }

                let significance = match params.test {
                    MarkerTest::Wilcox => {
                        let p_val = wilcoxon_rank_sum(&x1, &x2).p_val;
                        Significance::PValue {
                            p_val,
                            p_val_adj: bonferroni(p_val, n_genes),
                        }
                    }
                    MarkerTest::TTest => {
                        let p_val = welch_t_test(&x1, &x2);
                        Significance::PValue {
                            p_val,
                            p_val_adj: bonferroni(p_val, n_genes),
                        }
                    }
                    MarkerTest::Roc => {
                        let auc = wilcoxon_rank_sum(&x1, &x2).auc;
                        Significance::Roc {
                            auc,
                            power: 2.0 * (auc - 0.5).abs(),
                        }
                    }
                };

                Some(MarkerRecord {
                    gene: self.gene_ids[gene].clone(),
                    gene_index: gene,
                    avg_log2fc,
                    pct_1,
                    pct_2,
                    significance,
                })
            })
            .collect();

        order_records(&mut records);

        info!(
            "Marker test ({:?}) of {} vs {} cells: {} genes passed: {:.2?}",
            params.test,
            cells_1.len(),
            cells_2.len(),
            records.len(),
            start.elapsed()
        );

        Ok(MarkerTable {
            test: params.test,
            records,
        })
    }

    /// Markers of every cluster against all other cells
    ///
    /// ### Params
    ///
    /// * `params` - The `MarkerParams`
    ///
    /// ### Returns
    ///
    /// One `ClusterMarkers` per cluster, in cluster order. With fewer than two
    /// clusters there is nothing to compare and the result is empty.
    pub fn find_all_markers(&self, params: &MarkerParams) -> Result<Vec<ClusterMarkers>> {
        let assignment = self.clusters.as_ref().ok_or_else(|| {
            ScError::MissingStage("find_all_markers requires a clustering".into())
        })?;
        let n_clusters = assignment.n_clusters();
        if n_clusters < 2 {
            warn!("Only {} cluster(s) present, no markers to compute.", n_clusters);
            return Ok(Vec::new());
        }

        (0..n_clusters)
            .map(|cluster| -> Result<ClusterMarkers> {
                let label = assignment
                    .clusters
                    .iter()
                    .position(|&c| c == cluster)
                    .map(|i| assignment.labels[i].clone())
                    .unwrap_or_else(|| cluster.to_string());
                let table = self.find_markers(&CellGroup::Cluster(cluster), None, params)?;
                Ok(ClusterMarkers {
                    cluster,
                    label,
                    table,
                })
            })
            .collect()
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::{generate_block_counts, BlockDesign};
    use crate::single_cell::dataset::ClusterAssignment;
    use crate::single_cell::processing::NormalisationParams;
    use approx::assert_relative_eq;

    fn clustered_dataset() -> ScDataset {
        let data = generate_block_counts(&BlockDesign::default()).unwrap();
        let mut ds = ScDataset::from_counts(data.counts, data.gene_ids, data.cell_ids)
            .unwrap()
            .log_normalise(&NormalisationParams::default())
            .unwrap();
        ds.clusters = Some(ClusterAssignment::from_clusters(data.cell_blocks));
        ds
    }

    #[test]
    fn test_block_markers() {
        let ds = clustered_dataset();
        let params = MarkerParams {
            only_pos: true,
            ..Default::default()
        };
        let table = ds
            .find_markers(&CellGroup::Cluster(0), Some(&CellGroup::Cluster(1)), &params)
            .unwrap();
        assert_eq!(table.test, MarkerTest::Wilcox);
        assert_eq!(table.records.len(), 50);
        for record in &table.records {
            assert!(record.gene_index < 50);
            // 4-fold injected change
            assert!((record.avg_log2fc - 2.0).abs() < 0.5);
            match record.significance {
                Significance::PValue { p_val, p_val_adj } => {
                    assert!(p_val < 1e-3);
                    assert_relative_eq!(p_val_adj, (p_val * 100.0).min(1.0));
                }
                _ => panic!("expected p-values"),
            }
        }
        for w in table.records.windows(2) {
            assert!(sort_key(&w[0]) <= sort_key(&w[1]));
        }

        let reverse = ds
            .find_markers(&CellGroup::Cluster(1), None, &params)
            .unwrap();
        assert!(reverse.records.iter().all(|r| r.gene_index >= 50));
    }

    #[test]
    fn test_two_sided_keeps_down_genes() {
        let ds = clustered_dataset();
        let table = ds
            .find_markers(&CellGroup::Cluster(0), None, &MarkerParams::default())
            .unwrap();
        assert_eq!(table.records.len(), 100);
        assert!(table.records.iter().any(|r| r.avg_log2fc < 0.0));
    }

    #[test]
    fn test_roc_and_ttest() {
        let ds = clustered_dataset();
        let roc = ds
            .find_markers(
                &CellGroup::Cluster(0),
                None,
                &MarkerParams {
                    test: MarkerTest::Roc,
                    ..Default::default()
                },
            )
            .unwrap();
        for w in roc.records.windows(2) {
            assert!(sort_key(&w[0]) <= sort_key(&w[1]));
        }
        for record in &roc.records {
            match record.significance {
                Significance::Roc { auc, power } => {
                    assert!((0.0..=1.0).contains(&auc));
                    assert_relative_eq!(power, 2.0 * (auc - 0.5).abs());
                }
                _ => panic!("expected ROC"),
            }
        }

        let ttest = ds
            .find_markers(
                &CellGroup::Cluster(0),
                None,
                &MarkerParams {
                    test: MarkerTest::TTest,
                    only_pos: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(ttest.test, MarkerTest::TTest);
        assert!(ttest.records.iter().all(|r| r.gene_index < 50));
    }

    #[test]
    fn test_cell_groups() {
        let ds = clustered_dataset();
        let cells: Vec<String> = (1..=25).map(|i| format!("CELL{}", i)).collect();
        let by_cells = ds
            .find_markers(&CellGroup::Cells(cells), None, &MarkerParams::default())
            .unwrap();
        let by_cluster = ds
            .find_markers(&CellGroup::Clusters(vec![0]), None, &MarkerParams::default())
            .unwrap();
        assert_eq!(by_cells.records, by_cluster.records);
    }

    #[test]
    fn test_find_all_markers() {
        let ds = clustered_dataset();
        let all = ds
            .find_all_markers(&MarkerParams {
                only_pos: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].cluster, 1);
        assert_eq!(all[1].label, "1");
        assert_eq!(all[0].top(5).len(), 5);
        assert!(all[0].top(5).iter().all(|r| r.gene_index < 50));
        assert_eq!(all[0].top(1000).len(), all[0].table.records.len());
    }

    #[test]
    fn test_marker_errors() {
        let ds = clustered_dataset();
        let params = MarkerParams::default();
        assert!(matches!(
            ds.find_markers(&CellGroup::Cells(Vec::new()), None, &params),
            Err(ScError::InsufficientData(_))
        ));
        assert!(matches!(
            ds.find_markers(&CellGroup::Cells(vec!["NOPE".into()]), None, &params),
            Err(ScError::Configuration(_))
        ));
        assert!(matches!(
            ds.find_markers(&CellGroup::Cluster(5), None, &params),
            Err(ScError::Configuration(_))
        ));
        assert!(matches!(
            ds.find_markers(&CellGroup::Clusters(vec![0, 1]), None, &params),
            Err(ScError::InsufficientData(_))
        ));

        let mut unclustered = ds.clone();
        unclustered.clusters = None;
        assert!(matches!(
            unclustered.find_markers(&CellGroup::Cluster(0), None, &params),
            Err(ScError::MissingStage(_))
        ));
    }
}
