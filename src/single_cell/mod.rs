//! Contains the single cell stages. Every stage takes an `ScDataset`
//! snapshot and returns a new one (or a result table); there are
//! dependencies on other parts of the crate, specifically around the
//! generation of kNN graphs, sparse matrix methods, etc.

pub mod clustering;
pub mod dataset;
pub mod dge;
pub mod hvg;
pub mod labels;
pub mod methods;
pub mod pca;
pub mod pipeline;
pub mod processing;
pub mod sc_knn_snn;
pub mod scaling;
