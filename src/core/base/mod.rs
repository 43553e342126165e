//! Module containing key statistic functions that include the loess fit,
//! (randomised) SVD and the two group tests.

pub mod loess;
pub mod pca_svd;
pub mod stats;
