use log::info;
use std::collections::HashMap;

use crate::error::{Result, ScError};
use crate::single_cell::dataset::ScDataset;

impl ScDataset {
    /// Replace the display labels of all cells
    ///
    /// The partition is unchanged; every cell of cluster `c` gets
    /// `mapping[c]`.
    ///
    /// ### Params
    ///
    /// * `mapping` - Label per cluster id; must cover every present cluster
    ///
    /// ### Returns
    ///
    /// The relabelled dataset, or `ScError::UnmappedCluster` listing the
    /// clusters without a label
    pub fn rename_clusters(&self, mapping: &HashMap<usize, String>) -> Result<ScDataset> {
        let assignment = self.clusters.as_ref().ok_or_else(|| {
            ScError::MissingStage("renaming clusters requires a clustering".into())
        })?;

        let mut missing: Vec<usize> = assignment
            .clusters
            .iter()
            .copied()
            .filter(|c| !mapping.contains_key(c))
            .collect();
        if !missing.is_empty() {
            missing.sort_unstable();
            missing.dedup();
            return Err(ScError::UnmappedCluster { clusters: missing });
        }

        let mut res = self.clone();
        if let Some(assignment) = res.clusters.as_mut() {
            assignment.labels = assignment
                .clusters
                .iter()
                .map(|c| mapping[c].clone())
                .collect();
        }

        info!("Renamed {} clusters", mapping.len());

        Ok(res)
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

    fn clustered() -> ScDataset {
        let data = generate_block_counts(&BlockDesign {
            n_cells: 6,
            ..Default::default()
        })
        .unwrap();
        let mut ds = ScDataset::from_counts(data.counts, data.gene_ids, data.cell_ids).unwrap();
        ds.clusters = Some(ClusterAssignment::from_clusters(vec![0, 1, 0, 2, 1, 0]));
        ds
    }

    #[test]
    fn test_rename_clusters() {
        let ds = clustered();
        let mapping: HashMap<usize, String> = [(0, "T cell"), (1, "B cell"), (2, "NK")]
            .into_iter()
            .map(|(c, l)| (c, l.to_string()))
            .collect();
        let res = ds.rename_clusters(&mapping).unwrap();
        let assignment = res.clusters().unwrap();
        assert_eq!(assignment.clusters, ds.clusters().unwrap().clusters);
        assert_eq!(
            assignment.labels,
            vec!["T cell", "B cell", "T cell", "NK", "B cell", "T cell"]
        );
        // input snapshot untouched
        assert_eq!(ds.clusters().unwrap().labels[0], "0");
    }

    #[test]
    fn test_rename_clusters_unmapped() {
        let ds = clustered();
        let mapping: HashMap<usize, String> = [(1, "B cell".to_string())].into_iter().collect();
        match ds.rename_clusters(&mapping) {
            Err(ScError::UnmappedCluster { clusters }) => assert_eq!(clusters, vec![0, 2]),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }

        let mut unclustered = ds.clone();
        unclustered.clusters = None;
        assert!(matches!(
            unclustered.rename_clusters(&mapping),
            Err(ScError::MissingStage(_))
        ));
    }
}
