//! # single-merging
//!
//! Iterative merging of over-split single-cell clusterings, part of the single-rust ecosystem.
//!
//! Starting from an initial partition of cells into clusters, the merge process first absorbs
//! clusters that are too small into their most similar neighbor and then merges neighboring
//! clusters that a differential-expression (DE) test cannot tell apart. Per-cluster means,
//! variances and expressing fractions are kept up to date analytically on every merge, so the
//! expression matrix is scanned only once.
//!
//! ## Quick Start
//!
//! Compute a [`StatisticsTable`](merging::StatisticsTable) with
//! [`cluster_statistics_csr`](aggregate::cluster_statistics_csr), hand it together with the
//! [`Partition`](merging::Partition) to a [`MergeScheduler`](merging::MergeScheduler), and run
//! it with a [`DeMethod`](testing::DeMethod) or any other [`DeScorer`](testing::DeScorer).
//!
//! ## Module Organization
//!
//! - **[`merging`]**: Partition, cluster statistics, similarity, neighbor selection and the merge scheduler
//! - **[`testing`]**: DE scoring contract and the built-in chi-square and t-test scorers
//! - **[`aggregate`]**: In-memory computation of the initial cluster statistics

pub mod aggregate;
pub mod merging;
pub mod testing;
