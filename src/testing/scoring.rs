//! Turning per-feature test results into a pair score.

use crate::merging::{ClusterLabel, ClusterStatistics, StatisticsTable};
use crate::testing::inference::{feature_tests, to_f64};
use crate::testing::{correction, DeMethod, DeThresholds, PairScore};
use anyhow::anyhow;
use single_utilities::traits::FloatOps;

/// Summary of the features found differentially expressed between two clusters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeSummary {
    /// Evidence from features higher in the first cluster
    pub up_score: f64,
    /// Evidence from features higher in the second cluster
    pub down_score: f64,
    pub up_num: usize,
    pub down_num: usize,
}

impl DeSummary {
    pub fn score(&self) -> f64 {
        self.up_score + self.down_score
    }

    pub fn num_de(&self) -> usize {
        self.up_num + self.down_num
    }
}

/// Per-feature inputs of the DE filter for one cluster pair.
#[derive(Debug, Clone, Copy)]
pub struct FeatureStats {
    pub padj: f64,
    /// Mean of the first cluster minus mean of the second (log scale)
    pub lfc: f64,
    /// Expressing fraction in the first cluster
    pub q1: f64,
    /// Expressing fraction in the second cluster
    pub q2: f64,
}

fn relative_difference(high: f64, low: f64) -> f64 {
    let max = high.max(low);
    if max > 0.0 { (high - low) / max } else { 0.0 }
}

/// Whether a feature higher in the cluster with fraction `q_high` and size `n_high` passes.
fn passes(
    padj: f64,
    lfc: f64,
    q_high: f64,
    q_low: f64,
    n_high: f64,
    thresholds: &DeThresholds,
) -> bool {
    padj < thresholds.padj_thresh
        && lfc > thresholds.lfc_thresh
        && q_high > thresholds.q1_thresh
        && thresholds.q2_thresh.is_none_or(|t| q_low < t)
        && relative_difference(q_high, q_low) > thresholds.qdiff_thresh
        && q_high * n_high >= thresholds.min_cell_thresh
}

/// Sum `-log10(padj)` over the features passing the thresholds in either direction.
pub fn summarize_features(
    features: &[FeatureStats],
    n1: f64,
    n2: f64,
    thresholds: &DeThresholds,
) -> DeSummary {
    let mut summary = DeSummary::default();
    for f in features {
        // p-values of exactly zero would give an infinite score
        let evidence = -f.padj.max(f64::MIN_POSITIVE).log10();
        if passes(f.padj, f.lfc, f.q1, f.q2, n1, thresholds) {
            summary.up_score += evidence;
            summary.up_num += 1;
        } else if passes(f.padj, -f.lfc, f.q2, f.q1, n2, thresholds) {
            summary.down_score += evidence;
            summary.down_num += 1;
        }
    }
    summary
}

/// Score one pair of clusters with the test selected by `method`.
pub fn score_pair<L, T>(
    method: DeMethod,
    first: &L,
    second: &L,
    statistics: &StatisticsTable<L, T>,
    thresholds: &DeThresholds,
) -> anyhow::Result<PairScore<L>>
where
    L: ClusterLabel,
    T: FloatOps,
{
    let a = statistics
        .get(first)
        .ok_or_else(|| anyhow!("cluster {:?} is not in the statistics table", first))?;
    let b = statistics
        .get(second)
        .ok_or_else(|| anyhow!("cluster {:?} is not in the statistics table", second))?;

    let summary = summarize_pair(method, a, b, thresholds)?;

    Ok(PairScore::new((first.clone(), second.clone()), summary.score())
        .with_metadata("up_score", summary.up_score)
        .with_metadata("down_score", summary.down_score)
        .with_metadata("up_num", summary.up_num as f64)
        .with_metadata("down_num", summary.down_num as f64)
        .with_metadata("num_de", summary.num_de() as f64))
}

fn summarize_pair<T: FloatOps>(
    method: DeMethod,
    a: &ClusterStatistics<T>,
    b: &ClusterStatistics<T>,
    thresholds: &DeThresholds,
) -> anyhow::Result<DeSummary> {
    if a.mean.is_empty() {
        return Ok(DeSummary::default());
    }

    let q1 = a
        .present_mean
        .as_ref()
        .ok_or_else(|| anyhow!("presence means are required for DE scoring"))?;
    let q2 = b
        .present_mean
        .as_ref()
        .ok_or_else(|| anyhow!("presence means are required for DE scoring"))?;

    let results = feature_tests(method, a, b)?;
    let p_values: Vec<f64> = results.iter().map(|r| r.p_value).collect();
    let padj = correction::benjamini_hochberg_correction(&p_values)?;

    let features = (0..a.mean.len())
        .map(|g| {
            Ok(FeatureStats {
                padj: padj[g],
                lfc: to_f64(a.mean[g])? - to_f64(b.mean[g])?,
                q1: to_f64(q1[g])?,
                q2: to_f64(q2[g])?,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(summarize_features(
        &features,
        a.size as f64,
        b.size as f64,
        thresholds,
    ))
}
