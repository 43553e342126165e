//! Generic building blocks the single cell stages are assembled from:
//! statistics and linear algebra, sparse data structures and I/O, and graph
//! methods.

pub mod base;
pub mod data;
pub mod graph;
