//! Iterative reduction of an over-split clustering.
//!
//! The merge process runs in two phases over a [`Partition`] and its [`StatisticsTable`]:
//!
//! 1. **Size-based absorption**: clusters smaller than [`MergeConfig::min_cluster_size`] are
//!    absorbed, one at a time, into their most similar neighbor.
//! 2. **DE-driven merging**: candidate pairs are proposed from the k nearest neighbors of each
//!    cluster, scored by a [`DeScorer`](crate::testing::DeScorer), and every pair scoring below
//!    [`MergeConfig::score_thresh`] is merged (each cluster at most once per round).
//!
//! Cluster statistics are updated analytically on every merge, so the raw expression matrix is
//! never revisited once the initial aggregates have been computed.

use crate::testing::DeThresholds;
use std::fmt::Debug;
use std::hash::Hash;

pub mod neighbors;
pub mod partition;
pub mod scheduler;
pub mod similarity;
pub mod statistics;

pub use neighbors::{find_most_similar, get_k_nearest_clusters, nearest_neighbor_pairs, order_pairs};
pub use partition::Partition;
pub use scheduler::{MergeOutcome, MergeScheduler};
pub use similarity::{calculate_similarity, distance_similarity, pdist_normalized, SimilarityTable};
pub use statistics::{ClusterStatistics, StatisticsTable};

/// Identifier of a cluster.
///
/// Labels are assigned upstream and stay stable until the cluster is absorbed. The ordering is
/// used for canonical pair order (smaller label first) and for every deterministic tie-break.
pub trait ClusterLabel: Clone + Ord + Hash + Debug + Send + Sync {}

impl<L> ClusterLabel for L where L: Clone + Ord + Hash + Debug + Send + Sync {}

/// Parameters of a merge run.
///
/// A fresh value is passed to every [`MergeScheduler`]; [`MergeConfig::default`] is the single
/// documented default instance.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Clusters with fewer members than this are absorbed in the first phase
    pub min_cluster_size: usize,
    /// Number of nearest neighbors proposed per cluster in the second phase
    pub k: usize,
    /// Pairs scoring at or above this value are considered distinguishable
    pub score_thresh: f64,
    /// Cutoffs handed unchanged to the DE scorer
    pub de: DeThresholds,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            min_cluster_size: 15,
            k: 2,
            score_thresh: 150.0,
            de: DeThresholds::default(),
        }
    }
}

impl MergeConfig {
    pub fn with_min_cluster_size(mut self, min_cluster_size: usize) -> Self {
        self.min_cluster_size = min_cluster_size;
        self
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_score_thresh(mut self, score_thresh: f64) -> Self {
        self.score_thresh = score_thresh;
        self
    }

    pub fn with_de_thresholds(mut self, de: DeThresholds) -> Self {
        self.de = de;
        self
    }
}

/// Which phase of the merge process executed a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePhase {
    SmallCluster,
    DifferentialExpression,
}

/// A single executed merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeRecord<L> {
    /// The absorbed cluster, no longer present after the merge
    pub source: L,
    /// The surviving cluster
    pub dest: L,
    pub phase: MergePhase,
    /// Similarity for size-based merges, DE score for DE-driven merges
    pub value: f64,
    /// Size of the destination after the merge
    pub dest_size: usize,
}
