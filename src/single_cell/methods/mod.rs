//! Specific named methods in the single cell space are implemented here

pub mod umap;
