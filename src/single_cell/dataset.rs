use faer::Mat;
use log::info;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::path::Path;

use crate::core::data::sparse_io_mtx::{read_10x_dir, LoadParams};
use crate::core::data::sparse_structures::{CompressedSparseData, CompressedSparseFormat};
use crate::error::{Result, ScError};

////////////////
// Structures //
////////////////

/// Per cell QC metrics
///
/// ### Fields
///
/// * `n_count` - Total UMI count per cell.
/// * `n_feature` - Number of detected genes per cell.
/// * `percent_mt` - Percentage of counts in mitochondrial genes.
#[derive(Clone, Debug, PartialEq)]
pub struct CellQc {
    pub n_count: Vec<u64>,
    pub n_feature: Vec<usize>,
    pub percent_mt: Vec<f64>,
}

/// Per gene statistics of the variance stabilising selection
///
/// ### Fields
///
/// * `mean` - Mean of the raw counts.
/// * `variance` - Variance of the raw counts.
/// * `variance_expected` - Variance predicted by the loess trend.
/// * `variance_standardised` - Variance of the standardised, clipped counts.
#[derive(Clone, Debug)]
pub struct HvgStats {
    pub mean: Vec<f64>,
    pub variance: Vec<f64>,
    pub variance_expected: Vec<f64>,
    pub variance_standardised: Vec<f64>,
}

/// Scaled expression of a gene subset
///
/// ### Fields
///
/// * `gene_indices` - Indices of the scaled genes in the dataset.
/// * `data` - Dense cells x genes matrix.
/// * `means` - Per gene mean before centring.
/// * `sds` - Per gene standard deviation before scaling.
#[derive(Clone, Debug)]
pub struct ScaledData {
    pub gene_indices: Vec<usize>,
    pub data: Mat<f64>,
    pub means: Vec<f64>,
    pub sds: Vec<f64>,
}

/// JackStraw significance of the principal components
///
/// ### Fields
///
/// * `empirical_pvals` - Genes (of the reduction) x dims empirical p-values.
/// * `pc_scores` - Overall p-value per tested component.
#[derive(Clone, Debug)]
pub struct JackStrawRes {
    pub empirical_pvals: Mat<f64>,
    pub pc_scores: Vec<f64>,
}

/// A reduced representation of the cells
///
/// ### Fields
///
/// * `embeddings` - Cells x components.
/// * `loadings` - Genes x components (only for linear reductions).
/// * `feature_indices` - Dataset gene index of each loading row.
/// * `stdev` - Standard deviation per component.
/// * `jackstraw` - Optional JackStraw results.
#[derive(Clone, Debug)]
pub struct DimReduction {
    pub embeddings: Mat<f64>,
    pub loadings: Option<Mat<f64>>,
    pub feature_indices: Vec<usize>,
    pub stdev: Vec<f64>,
    pub jackstraw: Option<JackStrawRes>,
}

/// Genes with the most extreme loadings of a component
///
/// ### Fields
///
/// * `positive` - `(gene_index, loading)` sorted by descending loading.
/// * `negative` - `(gene_index, loading)` sorted by ascending loading.
#[derive(Clone, Debug)]
pub struct TopFeatures {
    pub positive: Vec<(usize, f64)>,
    pub negative: Vec<(usize, f64)>,
}

impl DimReduction {
    /// Number of components
    pub fn n_components(&self) -> usize {
        self.embeddings.ncols()
    }

    /// Genes with the highest and lowest loadings on a component
    ///
    /// ### Params
    ///
    /// * `component` - 0-based component index
    /// * `n` - Number of genes per direction
    ///
    /// ### Returns
    ///
    /// The `TopFeatures` with dataset gene indices
    pub fn top_features(&self, component: usize, n: usize) -> Result<TopFeatures> {
        let loadings = self.loadings.as_ref().ok_or_else(|| {
            ScError::MissingStage("reduction has no feature loadings".into())
        })?;
        if component >= loadings.ncols() {
            return Err(ScError::Configuration(format!(
                "component {} out of range ({} available)",
                component,
                loadings.ncols()
            )));
        }

        let mut values: Vec<(usize, f64)> = (0..loadings.nrows())
            .map(|i| (self.feature_indices[i], loadings[(i, component)]))
            .collect();
        values.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let n = n.min(values.len());
        let positive = values[..n].to_vec();
        let negative = values.iter().rev().take(n).copied().collect();

        Ok(TopFeatures { positive, negative })
    }
}

/// Cluster membership and display labels
///
/// ### Fields
///
/// * `clusters` - Cluster id per cell; ids are contiguous from 0 and ordered
///   by cluster size.
/// * `labels` - Display label per cell.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterAssignment {
    pub clusters: Vec<usize>,
    pub labels: Vec<String>,
}

impl ClusterAssignment {
    /// Assignment with the labels set to the cluster ids
    pub fn from_clusters(clusters: Vec<usize>) -> Self {
        let labels = clusters.iter().map(|c| c.to_string()).collect();
        Self { clusters, labels }
    }

    /// Number of distinct clusters
    pub fn n_clusters(&self) -> usize {
        self.clusters.iter().copied().max().map_or(0, |m| m + 1)
    }

    /// Cell indices belonging to a cluster
    pub fn cells_in(&self, cluster: usize) -> Vec<usize> {
        self.clusters
            .iter()
            .enumerate()
            .filter(|(_, &c)| c == cluster)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Flat view of one cell's metadata
#[derive(Clone, Debug, PartialEq)]
pub struct CellRecord {
    pub cell_id: String,
    pub n_count: Option<u64>,
    pub n_feature: Option<usize>,
    pub percent_mt: Option<f64>,
    pub cluster: Option<usize>,
    pub label: Option<String>,
}

/// Stage after which downstream products are dropped
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Stage {
    Filter,
    Normalise,
    VariableFeatures,
    Scale,
    Pca,
}

///////////////
// ScDataset //
///////////////

/// Snapshot of a single cell experiment
///
/// Every stage takes `&ScDataset` and returns a new snapshot; the input is
/// never modified. Counts are genes x cells (CSC), one column per cell.
#[derive(Clone, Debug)]
pub struct ScDataset {
    pub(crate) counts: CompressedSparseData<u32>,
    pub(crate) normalised: Option<CompressedSparseData<f64>>,
    pub(crate) gene_ids: Vec<String>,
    pub(crate) cell_ids: Vec<String>,
    pub(crate) qc: Option<CellQc>,
    pub(crate) hvg: Option<HvgStats>,
    pub(crate) variable_features: Vec<usize>,
    pub(crate) scaled: Option<ScaledData>,
    pub(crate) reductions: BTreeMap<String, DimReduction>,
    pub(crate) clusters: Option<ClusterAssignment>,
}

impl ScDataset {
    /// Build a dataset from in-memory counts
    ///
    /// ### Params
    ///
    /// * `counts` - Genes x cells counts in CSC layout
    /// * `gene_ids` - One unique identifier per gene
    /// * `cell_ids` - One unique identifier per cell
    ///
    /// ### Returns
    ///
    /// The dataset or a `ScError::Load` if dimensions or identifiers are
    /// inconsistent.
    pub fn from_counts(
        counts: CompressedSparseData<u32>,
        gene_ids: Vec<String>,
        cell_ids: Vec<String>,
    ) -> Result<Self> {
        let counts = match counts.cs_type {
            CompressedSparseFormat::Csc => counts,
            CompressedSparseFormat::Csr => counts.to_other_format(),
        };
        let (n_genes, n_cells) = counts.shape();

        if counts.indptr.len() != n_cells + 1 || counts.indices.len() != counts.data.len() {
            return Err(ScError::Load("malformed compressed sparse counts".into()));
        }
        if counts.indices.iter().any(|&g| g >= n_genes) {
            return Err(ScError::Load("gene index outside of the count matrix".into()));
        }
        if gene_ids.len() != n_genes {
            return Err(ScError::Load(format!(
                "{} gene identifiers for {} rows",
                gene_ids.len(),
                n_genes
            )));
        }
        if cell_ids.len() != n_cells {
            return Err(ScError::Load(format!(
                "{} cell identifiers for {} columns",
                cell_ids.len(),
                n_cells
            )));
        }
        for (what, ids) in [("gene", &gene_ids), ("cell", &cell_ids)] {
            let mut seen = FxHashSet::default();
            if let Some(dup) = ids.iter().find(|id| !seen.insert(id.as_str())) {
                return Err(ScError::Load(format!("duplicated {} identifier '{}'", what, dup)));
            }
        }

        Ok(Self {
            counts,
            normalised: None,
            gene_ids,
            cell_ids,
            qc: None,
            hvg: None,
            variable_features: Vec::new(),
            scaled: None,
            reductions: BTreeMap::new(),
            clusters: None,
        })
    }

    /// Read a 10x style directory
    ///
    /// ### Params
    ///
    /// * `dir` - Directory with `matrix.mtx`, `genes.tsv`/`features.tsv` and
    ///   `barcodes.tsv` (each optionally gzipped)
    /// * `params` - The `LoadParams`
    pub fn read_10x_dir<P: AsRef<Path>>(dir: P, params: &LoadParams) -> Result<Self> {
        let raw = read_10x_dir(dir, params)?;
        let dataset = Self::from_counts(raw.counts, raw.gene_ids, raw.cell_ids)?;
        info!(
            "Created dataset with {} genes and {} cells",
            dataset.n_genes(),
            dataset.n_cells()
        );
        Ok(dataset)
    }

    /// Drop every product downstream of `stage`
    pub(crate) fn invalidate_downstream(&mut self, stage: Stage) {
        if stage <= Stage::Filter {
            self.normalised = None;
        }
        if stage <= Stage::Normalise {
            self.hvg = None;
            self.variable_features.clear();
        }
        if stage <= Stage::VariableFeatures {
            self.scaled = None;
        }
        if stage <= Stage::Scale {
            self.reductions.clear();
        }
        if stage <= Stage::Pca {
            self.reductions.retain(|name, _| name == "pca");
            self.clusters = None;
        }
    }

    /////////////
    // Getters //
    /////////////

    /// Number of genes
    pub fn n_genes(&self) -> usize {
        self.counts.shape().0
    }

    /// Number of cells
    pub fn n_cells(&self) -> usize {
        self.counts.shape().1
    }

    /// Raw counts (genes x cells, CSC)
    pub fn counts(&self) -> &CompressedSparseData<u32> {
        &self.counts
    }

    /// Log-normalised values, if computed
    pub fn normalised(&self) -> Option<&CompressedSparseData<f64>> {
        self.normalised.as_ref()
    }

    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    pub fn qc(&self) -> Option<&CellQc> {
        self.qc.as_ref()
    }

    pub fn hvg_stats(&self) -> Option<&HvgStats> {
        self.hvg.as_ref()
    }

    /// Indices of the variable features, most variable first
    pub fn variable_features(&self) -> &[usize] {
        &self.variable_features
    }

    /// Names of the variable features, most variable first
    pub fn variable_feature_names(&self) -> Vec<&str> {
        self.variable_features
            .iter()
            .map(|&i| self.gene_ids[i].as_str())
            .collect()
    }

    pub fn scaled(&self) -> Option<&ScaledData> {
        self.scaled.as_ref()
    }

    /// A named reduction (`"pca"`, `"umap"`)
    pub fn reduction(&self, name: &str) -> Option<&DimReduction> {
        self.reductions.get(name)
    }

    pub fn reductions(&self) -> &BTreeMap<String, DimReduction> {
        &self.reductions
    }

    pub fn clusters(&self) -> Option<&ClusterAssignment> {
        self.clusters.as_ref()
    }

    /// Map gene names to indices
    ///
    /// ### Returns
    ///
    /// The indices or a `ScError::Configuration` listing unknown genes
    pub fn gene_indices(&self, names: &[String]) -> Result<Vec<usize>> {
        let lookup: FxHashMap<&str, usize> = self
            .gene_ids
            .iter()
            .enumerate()
            .map(|(i, g)| (g.as_str(), i))
            .collect();
        let mut missing = Vec::new();
        let mut res = Vec::with_capacity(names.len());
        for name in names {
            match lookup.get(name.as_str()) {
                Some(&i) => res.push(i),
                None => missing.push(name.as_str()),
            }
        }
        if !missing.is_empty() {
            return Err(ScError::Configuration(format!("unknown genes: {:?}", missing)));
        }
        Ok(res)
    }

    /// Map cell identifiers to indices
    ///
    /// ### Returns
    ///
    /// The indices or a `ScError::Configuration` listing unknown cells
    pub fn cell_indices(&self, names: &[String]) -> Result<Vec<usize>> {
        let lookup: FxHashMap<&str, usize> = self
            .cell_ids
            .iter()
            .enumerate()
            .map(|(i, c)| (c.as_str(), i))
            .collect();
        let mut missing = Vec::new();
        let mut res = Vec::with_capacity(names.len());
        for name in names {
            match lookup.get(name.as_str()) {
                Some(&i) => res.push(i),
                None => missing.push(name.as_str()),
            }
        }
        if !missing.is_empty() {
            return Err(ScError::Configuration(format!("unknown cells: {:?}", missing)));
        }
        Ok(res)
    }

    /// Per cell metadata as records
    pub fn cell_records(&self) -> Vec<CellRecord> {
        (0..self.n_cells())
            .map(|i| CellRecord {
                cell_id: self.cell_ids[i].clone(),
                n_count: self.qc.as_ref().map(|q| q.n_count[i]),
                n_feature: self.qc.as_ref().map(|q| q.n_feature[i]),
                percent_mt: self.qc.as_ref().map(|q| q.percent_mt[i]),
                cluster: self.clusters.as_ref().map(|c| c.clusters[i]),
                label: self.clusters.as_ref().map(|c| c.labels[i].clone()),
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

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    fn small_counts() -> CompressedSparseData<u32> {
        CompressedSparseData::new_csc(
            vec![1, 4, 3, 5, 2, 6],
            vec![0, 2, 1, 2, 0, 2],
            vec![0, 2, 3, 4, 6],
            (3, 4),
        )
    }

    #[test]
    fn test_from_counts() {
        let ds = ScDataset::from_counts(small_counts(), ids("g", 3), ids("c", 4)).unwrap();
        assert_eq!(ds.n_genes(), 3);
        assert_eq!(ds.n_cells(), 4);
        let records = ds.cell_records();
        assert_eq!(records.len(), 4);
        assert_eq!(records[2].cell_id, "c2");
        assert!(records[2].cluster.is_none());
    }

    #[test]
    fn test_from_counts_validation() {
        assert!(matches!(
            ScDataset::from_counts(small_counts(), ids("g", 2), ids("c", 4)),
            Err(ScError::Load(_))
        ));
        let dup = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        assert!(matches!(
            ScDataset::from_counts(small_counts(), dup, ids("c", 4)),
            Err(ScError::Load(_))
        ));
    }

    #[test]
    fn test_lookups() {
        let ds = ScDataset::from_counts(small_counts(), ids("g", 3), ids("c", 4)).unwrap();
        assert_eq!(ds.gene_indices(&["g2".into(), "g0".into()]).unwrap(), vec![2, 0]);
        assert!(matches!(
            ds.cell_indices(&["c9".into()]),
            Err(ScError::Configuration(_))
        ));
    }

    #[test]
    fn test_cluster_assignment() {
        let assignment = ClusterAssignment::from_clusters(vec![1, 0, 0, 1, 0]);
        assert_eq!(assignment.n_clusters(), 2);
        assert_eq!(assignment.cells_in(1), vec![0, 3]);
        assert_eq!(assignment.labels[0], "1");
    }
}
