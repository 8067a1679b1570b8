//! Differential-expression scoring of candidate cluster pairs.
//!
//! The merge scheduler only depends on the [`DeScorer`] contract: one call per round with the
//! whole candidate batch, one [`PairScore`] per pair, lower scores meaning "more mergeable".
//! [`DeMethod`] provides the built-in scorers, which test every feature from the cluster
//! aggregates alone and sum the evidence of the features passing [`DeThresholds`].

use crate::merging::{ClusterLabel, StatisticsTable};
use rayon::prelude::*;
use single_utilities::traits::FloatOpsTS;
use std::collections::HashMap;

pub mod correction;
pub mod inference;
pub mod scoring;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TTestType {
    Student, // Equal variance
    Welch,   // Unequal variance
}

/// Built-in per-feature test used to score a pair of clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeMethod {
    /// Chi-square test on the fraction of expressing members; needs presence means
    ChiSquare,
    /// t-test on means and variances; needs presence means and variances
    TTest(TTestType),
}

#[derive(Debug, Clone)]
pub struct TestResult {
    /// The test statistic value (e.g. chi-square, t-statistic)
    pub statistic: f64,
    /// The p-value of the test
    pub p_value: f64,
}

impl TestResult {
    pub fn new(statistic: f64, p_value: f64) -> Self {
        TestResult { statistic, p_value }
    }
}

/// Cutoffs deciding which features count as differentially expressed.
#[derive(Debug, Clone, PartialEq)]
pub struct DeThresholds {
    /// Minimum expressing fraction in the higher-expressing cluster
    pub q1_thresh: f64,
    /// Maximum expressing fraction in the lower-expressing cluster, if set
    pub q2_thresh: Option<f64>,
    /// Minimum number of expressing members in the higher-expressing cluster
    pub min_cell_thresh: f64,
    /// Minimum relative difference of expressing fractions
    pub qdiff_thresh: f64,
    /// Maximum adjusted p-value
    pub padj_thresh: f64,
    /// Minimum absolute log fold change
    pub lfc_thresh: f64,
}

impl Default for DeThresholds {
    fn default() -> Self {
        DeThresholds {
            q1_thresh: 0.5,
            q2_thresh: None,
            min_cell_thresh: 4.0,
            qdiff_thresh: 0.7,
            padj_thresh: 0.05,
            lfc_thresh: 1.0,
        }
    }
}

impl DeThresholds {
    pub fn with_q1_thresh(mut self, q1_thresh: f64) -> Self {
        self.q1_thresh = q1_thresh;
        self
    }

    pub fn with_q2_thresh(mut self, q2_thresh: Option<f64>) -> Self {
        self.q2_thresh = q2_thresh;
        self
    }

    pub fn with_min_cell_thresh(mut self, min_cell_thresh: f64) -> Self {
        self.min_cell_thresh = min_cell_thresh;
        self
    }

    pub fn with_qdiff_thresh(mut self, qdiff_thresh: f64) -> Self {
        self.qdiff_thresh = qdiff_thresh;
        self
    }

    pub fn with_padj_thresh(mut self, padj_thresh: f64) -> Self {
        self.padj_thresh = padj_thresh;
        self
    }

    pub fn with_lfc_thresh(mut self, lfc_thresh: f64) -> Self {
        self.lfc_thresh = lfc_thresh;
        self
    }
}

/// Score of one candidate pair.
#[derive(Debug, Clone)]
pub struct PairScore<L> {
    pub pair: (L, L),
    /// Lower means less distinguishable, i.e. more mergeable
    pub score: f64,
    /// Scorer-specific diagnostics
    pub metadata: HashMap<String, f64>,
}

impl<L> PairScore<L> {
    pub fn new(pair: (L, L), score: f64) -> Self {
        PairScore {
            pair,
            score,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: f64) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Scoring contract used by the second merge phase.
///
/// Implementations must be deterministic for identical inputs and return exactly one score per
/// input pair, in input order.
pub trait DeScorer<L, T> {
    fn score_pairs(
        &self,
        pairs: &[(L, L)],
        statistics: &StatisticsTable<L, T>,
        thresholds: &DeThresholds,
    ) -> anyhow::Result<Vec<PairScore<L>>>;
}

impl<L, T> DeScorer<L, T> for DeMethod
where
    L: ClusterLabel,
    T: FloatOpsTS,
{
    fn score_pairs(
        &self,
        pairs: &[(L, L)],
        statistics: &StatisticsTable<L, T>,
        thresholds: &DeThresholds,
    ) -> anyhow::Result<Vec<PairScore<L>>> {
        if !statistics.has_present_mean() {
            return Err(anyhow::anyhow!(
                "DE scoring requires presence means in the statistics table"
            ));
        }
        if matches!(self, DeMethod::TTest(_)) && !statistics.has_variance() {
            return Err(anyhow::anyhow!(
                "t-test scoring requires variances in the statistics table"
            ));
        }

        pairs
            .par_iter()
            .map(|(a, b)| scoring::score_pair(*self, a, b, statistics, thresholds))
            .collect()
    }
}
