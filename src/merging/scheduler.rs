//! Two-phase merge loop over a partition and its statistics.

use crate::merging::{
    calculate_similarity, distance_similarity, find_most_similar, nearest_neighbor_pairs,
    order_pairs, ClusterLabel, MergeConfig, MergePhase, MergeRecord, Partition, StatisticsTable,
};
use crate::testing::{DeScorer, PairScore};
use anyhow::{anyhow, bail, ensure};
use single_utilities::traits::FloatOps;
use std::collections::HashSet;

/// Result of a complete merge run.
#[derive(Debug, Clone)]
pub struct MergeOutcome<L, T> {
    pub partition: Partition<L>,
    pub statistics: StatisticsTable<L, T>,
    /// Reduced-space means, if the run was given any
    pub reduced: Option<StatisticsTable<L, T>>,
    /// Every executed merge, in execution order
    pub merges: Vec<MergeRecord<L>>,
}

/// Owner of the partition and its statistics for the duration of a merge run.
///
/// The scheduler is the only writer: every merge updates the partition, the full-feature
/// statistics and the reduced-space means together, or none of them.
#[derive(Debug, Clone)]
pub struct MergeScheduler<L, T> {
    partition: Partition<L>,
    statistics: StatisticsTable<L, T>,
    reduced: Option<StatisticsTable<L, T>>,
    config: MergeConfig,
}

impl<L, T> MergeScheduler<L, T>
where
    L: ClusterLabel,
    T: FloatOps,
{
    /// Take ownership of a partition and its full-feature statistics.
    ///
    /// Fails before anything is merged if the statistics do not describe exactly the clusters of
    /// the partition.
    pub fn new(
        partition: Partition<L>,
        statistics: StatisticsTable<L, T>,
        config: MergeConfig,
    ) -> anyhow::Result<Self> {
        ensure!(!partition.is_empty(), "cannot merge an empty partition");
        statistics.validate_against(&partition)?;
        Ok(MergeScheduler {
            partition,
            statistics,
            reduced: None,
            config,
        })
    }

    /// Use reduced-space means (e.g. principal components) for all similarity and neighbor
    /// computations. They are merged alongside the full statistics.
    pub fn with_reduced(mut self, reduced: StatisticsTable<L, T>) -> anyhow::Result<Self> {
        reduced.validate_against(&self.partition)?;
        self.reduced = Some(reduced);
        Ok(self)
    }

    pub fn partition(&self) -> &Partition<L> {
        &self.partition
    }

    pub fn statistics(&self) -> &StatisticsTable<L, T> {
        &self.statistics
    }

    pub fn reduced(&self) -> Option<&StatisticsTable<L, T>> {
        self.reduced.as_ref()
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Table driving similarity: reduced-space means when present, full means otherwise.
    fn topology(&self) -> &StatisticsTable<L, T> {
        self.reduced.as_ref().unwrap_or(&self.statistics)
    }

    /// Merge `source` into `dest` across every owned table.
    ///
    /// All preconditions are checked up front so that a failure leaves every table untouched.
    fn absorb(&mut self, source: &L, dest: &L) -> anyhow::Result<usize> {
        ensure!(source != dest, "cannot merge cluster {:?} into itself", source);
        for label in [source, dest] {
            ensure!(
                self.partition.contains(label) && self.statistics.contains(label),
                "cluster {:?} is not available for merging",
                label
            );
            if let Some(reduced) = &self.reduced {
                ensure!(
                    reduced.contains(label),
                    "cluster {:?} has no reduced-space mean",
                    label
                );
            }
        }

        self.statistics.merge(source, dest)?;
        if let Some(reduced) = self.reduced.as_mut() {
            reduced.merge(source, dest)?;
        }
        self.partition.merge(source, dest)?;

        self.partition
            .size(dest)
            .ok_or_else(|| anyhow!("cluster {:?} vanished during merge", dest))
    }

    /// Absorb undersized clusters into their most similar neighbor, one at a time.
    ///
    /// Each iteration compares every cluster below the minimum size with all clusters and merges
    /// the single most similar pair. Constant centroids have no correlation with anything; when no
    /// undersized cluster has a defined correlation, centroid distance is used instead. The phase
    /// ends when no cluster is undersized or only one cluster is left.
    pub fn merge_small_clusters(&mut self) -> anyhow::Result<Vec<MergeRecord<L>>> {
        let mut records = Vec::new();

        loop {
            let small = self.partition.small_clusters(self.config.min_cluster_size);
            if small.is_empty() || self.partition.len() < 2 {
                break;
            }
            let all = self.partition.labels();

            let similarity = calculate_similarity(self.topology(), &small, &all)?;
            let best = match find_most_similar(&similarity) {
                Some(best) => Some(best),
                None => {
                    log::warn!(
                        "No defined correlation for undersized clusters {:?}, falling back to centroid distance",
                        small
                    );
                    find_most_similar(&distance_similarity(self.topology(), &small, &all)?)
                }
            };
            let Some((source, dest, value)) = best else {
                bail!(
                    "no defined similarity between undersized clusters {:?} and the remaining clusters",
                    small
                );
            };
            let value = value.to_f64().unwrap_or(f64::NAN);

            let dest_size = self.absorb(&source, &dest)?;
            log::info!(
                "Merging small cluster {:?} into {:?} -- similarity: {}",
                source,
                dest,
                value
            );
            records.push(MergeRecord {
                source,
                dest,
                phase: MergePhase::SmallCluster,
                value,
                dest_size,
            });
        }

        Ok(records)
    }

    /// Merge clusters that the DE scorer cannot tell apart.
    ///
    /// Every round proposes the k nearest neighbors of each cluster, scores all proposals in one
    /// call, and merges the pairs scoring below the threshold, lowest score first. A cluster takes
    /// part in at most one merge per round. For a pair `(a, b)` with `a < b`, `b` is absorbed
    /// into `a`. NaN scores never merge. The loop stops when a round has no candidates, when the
    /// lowest defined score reaches the threshold, or when a single cluster is left.
    pub fn merge_clusters_by_de<S>(&mut self, scorer: &S) -> anyhow::Result<Vec<MergeRecord<L>>>
    where
        S: DeScorer<L, T> + ?Sized,
    {
        let mut records = Vec::new();
        let mut round = 0usize;

        while self.partition.len() > 1 {
            round += 1;

            let mut pairs = order_pairs(&nearest_neighbor_pairs(self.topology(), self.config.k)?);
            pairs.sort();
            pairs.dedup();
            if pairs.is_empty() {
                log::debug!("Round {}: no candidate pairs left", round);
                break;
            }

            let mut scores = scorer.score_pairs(&pairs, &self.statistics, &self.config.de)?;
            check_scores(&pairs, &scores)?;
            // undefined scores go last whatever their sign bit
            scores.sort_by(|a, b| {
                a.score
                    .is_nan()
                    .cmp(&b.score.is_nan())
                    .then_with(|| a.score.total_cmp(&b.score))
                    .then_with(|| a.pair.cmp(&b.pair))
            });

            let threshold = self.config.score_thresh;
            let best = scores[0].score;
            if best.is_nan() || best >= threshold {
                log::debug!(
                    "Round {}: lowest score {} of {} candidates reaches threshold {}",
                    round,
                    best,
                    scores.len(),
                    threshold
                );
                break;
            }

            let mut merged: HashSet<L> = HashSet::new();
            for scored in scores.iter().take_while(|s| s.score < threshold) {
                let (dest, source) = &scored.pair;
                if merged.contains(dest) || merged.contains(source) {
                    continue;
                }

                let dest_size = self.absorb(source, dest)?;
                log::info!(
                    "Merging cluster {:?} into {:?} -- score: {}",
                    source,
                    dest,
                    scored.score
                );
                merged.insert(dest.clone());
                merged.insert(source.clone());
                records.push(MergeRecord {
                    source: source.clone(),
                    dest: dest.clone(),
                    phase: MergePhase::DifferentialExpression,
                    value: scored.score,
                    dest_size,
                });
            }
            log::debug!(
                "Round {}: {} merges, {} clusters left",
                round,
                merged.len() / 2,
                self.partition.len()
            );
        }

        Ok(records)
    }

    /// Run both phases and hand back the final partition and statistics.
    pub fn run<S>(mut self, scorer: &S) -> anyhow::Result<MergeOutcome<L, T>>
    where
        S: DeScorer<L, T> + ?Sized,
    {
        let mut merges = self.merge_small_clusters()?;
        merges.extend(self.merge_clusters_by_de(scorer)?);
        log::info!(
            "Merging finished with {} clusters after {} merges",
            self.partition.len(),
            merges.len()
        );
        Ok(MergeOutcome {
            partition: self.partition,
            statistics: self.statistics,
            reduced: self.reduced,
            merges,
        })
    }

    pub fn into_parts(self) -> (Partition<L>, StatisticsTable<L, T>) {
        (self.partition, self.statistics)
    }
}

/// Scores must line up one to one with the submitted pairs.
fn check_scores<L: ClusterLabel>(pairs: &[(L, L)], scores: &[PairScore<L>]) -> anyhow::Result<()> {
    ensure!(
        scores.len() == pairs.len(),
        "scorer returned {} scores for {} pairs",
        scores.len(),
        pairs.len()
    );
    for (pair, scored) in pairs.iter().zip(scores.iter()) {
        ensure!(
            *pair == scored.pair,
            "scorer returned a score for {:?} where {:?} was expected",
            scored.pair,
            pair
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merging::ClusterStatistics;
    use crate::testing::DeThresholds;
    use approx::assert_relative_eq;
    use ndarray::{array, Array1};
    use std::cell::{Cell, RefCell};
    use std::collections::{BTreeMap, HashMap};

    /// Scores every pair from a fixed lookup, recording the pairs proposed in each call.
    struct LookupScorer {
        scores: HashMap<(&'static str, &'static str), f64>,
        default: f64,
        calls: Cell<usize>,
        proposals: RefCell<Vec<Vec<(&'static str, &'static str)>>>,
    }

    impl LookupScorer {
        fn new(scores: &[((&'static str, &'static str), f64)], default: f64) -> Self {
            LookupScorer {
                scores: scores.iter().cloned().collect(),
                default,
                calls: Cell::new(0),
                proposals: RefCell::new(Vec::new()),
            }
        }
    }

    impl DeScorer<&'static str, f64> for LookupScorer {
        fn score_pairs(
            &self,
            pairs: &[(&'static str, &'static str)],
            _statistics: &StatisticsTable<&'static str, f64>,
            _thresholds: &DeThresholds,
        ) -> anyhow::Result<Vec<PairScore<&'static str>>> {
            self.calls.set(self.calls.get() + 1);
            self.proposals.borrow_mut().push(pairs.to_vec());
            Ok(pairs
                .iter()
                .map(|p| PairScore::new(*p, *self.scores.get(p).unwrap_or(&self.default)))
                .collect())
        }
    }

    fn setup(
        clusters: &[(&'static str, Vec<usize>, Array1<f64>)],
    ) -> (Partition<&'static str>, StatisticsTable<&'static str, f64>) {
        let mut assignments = BTreeMap::new();
        let mut table = StatisticsTable::new(clusters[0].2.len(), false, false);
        for (label, members, mean) in clusters {
            assignments.insert(*label, members.clone());
            table
                .insert(*label, ClusterStatistics::new(mean.clone(), members.len()))
                .unwrap();
        }
        (Partition::new(assignments), table)
    }

    fn example() -> (Partition<&'static str>, StatisticsTable<&'static str, f64>) {
        setup(&[
            ("11", vec![0, 3, 5, 9], array![3.0, 1.5, 4.0]),
            ("2", vec![1, 2, 6], array![3.0, 4.0, 2.0]),
            ("32", vec![4, 7], array![3.0, 0.5, 3.0]),
            ("4", vec![8], array![0.0, 0.0, 7.0]),
        ])
    }

    #[test]
    fn test_merge_small_clusters() {
        let (partition, statistics) = example();
        let config = MergeConfig::default().with_min_cluster_size(3);
        let mut scheduler = MergeScheduler::new(partition, statistics, config).unwrap();

        let records = scheduler.merge_small_clusters().unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!((records[0].source, records[0].dest), ("32", "11"));
        assert_eq!((records[1].source, records[1].dest), ("4", "11"));
        assert_eq!(records[1].dest_size, 7);

        let partition = scheduler.partition();
        assert_eq!(partition.labels(), vec!["11", "2"]);
        assert_eq!(partition.members(&"11"), Some(&[0, 3, 5, 9, 4, 7, 8][..]));
        assert_eq!(partition.members(&"2"), Some(&[1, 2, 6][..]));
        assert!(partition.validate(10).is_ok());

        let mean = scheduler.statistics().mean(&"11").unwrap();
        let expected = [18.0 / 7.0, 7.0 / 7.0, 29.0 / 7.0];
        for (got, want) in mean.iter().zip(expected.iter()) {
            assert_relative_eq!(*got, *want, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_single_small_cluster_left_alone() {
        let (partition, statistics) = setup(&[("a", vec![0], array![1.0, 2.0, 3.0])]);
        let config = MergeConfig::default().with_min_cluster_size(5);
        let mut scheduler = MergeScheduler::new(partition, statistics, config).unwrap();

        assert!(scheduler.merge_small_clusters().unwrap().is_empty());
        assert_eq!(scheduler.partition().len(), 1);
    }

    #[test]
    fn test_mismatched_statistics_fail_before_merging() {
        let (partition, _) = example();
        let (_, other) = setup(&[
            ("11", vec![0, 3, 5, 9], array![3.0, 1.5, 4.0]),
            ("2", vec![1, 2, 6], array![3.0, 4.0, 2.0]),
        ]);
        assert!(MergeScheduler::new(partition, other, MergeConfig::default()).is_err());
    }

    #[test]
    fn test_merge_by_de_absorbs_larger_label_into_smaller() {
        let (partition, statistics) = setup(&[
            ("11", vec![0, 3, 5, 9, 4], array![3.8, 1.5, 4.0]),
            ("4", vec![1, 2, 8], array![3.0, 2.0, 3.0]),
        ]);
        let config = MergeConfig::default().with_k(1).with_score_thresh(40.0);
        let mut scheduler = MergeScheduler::new(partition, statistics, config).unwrap();
        let scorer = LookupScorer::new(&[(("11", "4"), 12.0)], 100.0);

        let records = scheduler.merge_clusters_by_de(&scorer).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!((records[0].source, records[0].dest), ("4", "11"));
        assert_eq!(scheduler.partition().labels(), vec!["11"]);
        assert_eq!(scheduler.partition().size(&"11"), Some(8));
        assert_eq!(scorer.calls.get(), 1);
    }

    #[test]
    fn test_merge_by_de_stops_when_best_score_reaches_threshold() {
        let (partition, statistics) = example();
        let config = MergeConfig::default().with_score_thresh(40.0);
        let mut scheduler = MergeScheduler::new(partition.clone(), statistics, config).unwrap();
        let scorer = LookupScorer::new(&[], 40.0);

        assert!(scheduler.merge_clusters_by_de(&scorer).unwrap().is_empty());
        assert_eq!(scheduler.partition(), &partition);
        assert_eq!(scorer.calls.get(), 1);
    }

    #[test]
    fn test_each_cluster_merges_once_per_round() {
        let (partition, statistics) = example();
        let config = MergeConfig::default().with_k(2).with_score_thresh(40.0);
        let mut scheduler = MergeScheduler::new(partition, statistics, config).unwrap();
        // first round candidates: (11,32) (11,4) (2,32) (2,4) (32,4)
        let scorer = LookupScorer::new(
            &[
                (("11", "32"), 1.0),
                (("32", "4"), 2.0),
                (("2", "4"), 3.0),
                (("11", "4"), 4.0),
            ],
            100.0,
        );

        let records = scheduler.merge_clusters_by_de(&scorer).unwrap();

        // round 1 merges 32 into 11 and 4 into 2; (32,4) and (11,4) are skipped
        assert_eq!((records[0].source, records[0].dest), ("32", "11"));
        assert_eq!((records[1].source, records[1].dest), ("4", "2"));
        // round 2 proposes only (11,2), scored at the default and left alone
        assert_eq!(records.len(), 2);
        assert_eq!(scorer.calls.get(), 2);
        assert_eq!(scheduler.partition().labels(), vec!["11", "2"]);
        assert_eq!(scheduler.partition().n_obs(), 10);
    }

    #[test]
    fn test_reduced_means_are_merged_alongside() {
        let (partition, statistics) = example();
        let mut reduced_means = BTreeMap::new();
        reduced_means.insert("11", array![1.0, 0.0]);
        reduced_means.insert("2", array![-1.0, 0.0]);
        reduced_means.insert("32", array![0.9, 0.1]);
        reduced_means.insert("4", array![-0.8, 0.0]);
        let reduced = StatisticsTable::from_means(reduced_means, &partition.sizes()).unwrap();

        let config = MergeConfig::default().with_min_cluster_size(3);
        let mut scheduler = MergeScheduler::new(partition, statistics, config)
            .unwrap()
            .with_reduced(reduced)
            .unwrap();
        let records = scheduler.merge_small_clusters().unwrap();

        // neighbor topology follows the reduced space: 4 lands next to 2
        assert!(records.iter().any(|r| r.source == "4" && r.dest == "2"));
        let reduced = scheduler.reduced().unwrap();
        assert_eq!(reduced.labels(), scheduler.statistics().labels());
        assert_eq!(reduced.size(&"2"), Some(4));
    }

    #[test]
    fn test_constant_centroid_falls_back_to_distance() {
        let (partition, statistics) = setup(&[
            ("a", (0..5).collect(), array![1.0, 2.0, 4.0]),
            ("b", (5..10).collect(), array![3.0, 2.0, 1.0]),
            ("c", vec![10], array![1.0, 1.0, 1.0]),
        ]);
        let config = MergeConfig::default().with_min_cluster_size(3);
        let mut scheduler = MergeScheduler::new(partition, statistics, config).unwrap();

        let records = scheduler.merge_small_clusters().unwrap();

        // c has no correlation with anything; b is the nearer centroid
        assert_eq!(records.len(), 1);
        assert_eq!((records[0].source, records[0].dest), ("c", "b"));
        assert_relative_eq!(
            records[0].value,
            1.0 - 5.0_f64.sqrt() / 13.0_f64.sqrt(),
            epsilon = 1e-12
        );
        assert_eq!(scheduler.partition().labels(), vec!["a", "b"]);
        assert_eq!(scheduler.partition().size(&"b"), Some(6));
    }

    #[test]
    fn test_nan_scores_never_block_other_merges() {
        for nan in [f64::NAN, -f64::NAN] {
            let (partition, statistics) = setup(&[
                ("1", vec![0, 1], array![0.0]),
                ("2", vec![2, 3], array![0.1]),
                ("3", vec![4, 5], array![5.0]),
                ("4", vec![6, 7], array![5.1]),
            ]);
            let config = MergeConfig::default().with_k(1).with_score_thresh(10.0);
            let mut scheduler = MergeScheduler::new(partition, statistics, config).unwrap();
            let scorer = LookupScorer::new(&[(("1", "2"), nan), (("3", "4"), 1.0)], 100.0);

            let records = scheduler.merge_clusters_by_de(&scorer).unwrap();

            assert_eq!(records.len(), 1, "sign negative: {}", nan.is_sign_negative());
            assert_eq!((records[0].source, records[0].dest), ("4", "3"));
            assert_eq!(scheduler.partition().labels(), vec!["1", "2", "3"]);
            // second round proposes (1,2) and (2,3); only the NaN pair scores below the threshold
            assert_eq!(scorer.calls.get(), 2);
        }
    }

    #[test]
    fn test_all_nan_scores_stop_the_phase() {
        let (partition, statistics) = example();
        let config = MergeConfig::default().with_score_thresh(40.0);
        let mut scheduler = MergeScheduler::new(partition.clone(), statistics, config).unwrap();
        let scorer = LookupScorer::new(&[], -f64::NAN);

        assert!(scheduler.merge_clusters_by_de(&scorer).unwrap().is_empty());
        assert_eq!(scheduler.partition(), &partition);
    }

    #[test]
    fn test_de_merging_follows_reduced_space() {
        let (partition, statistics) = example();
        let mut reduced_means = BTreeMap::new();
        reduced_means.insert("11", array![0.0, 0.0]);
        reduced_means.insert("4", array![0.1, 0.0]);
        reduced_means.insert("2", array![10.0, 0.0]);
        reduced_means.insert("32", array![10.1, 0.0]);
        let reduced = StatisticsTable::from_means(reduced_means, &partition.sizes()).unwrap();

        let config = MergeConfig::default().with_k(1).with_score_thresh(10.0);
        let mut scheduler = MergeScheduler::new(partition, statistics, config)
            .unwrap()
            .with_reduced(reduced)
            .unwrap();
        let scorer = LookupScorer::new(&[(("11", "4"), 1.0), (("2", "32"), 2.0)], 100.0);

        let records = scheduler.merge_clusters_by_de(&scorer).unwrap();

        // full-space correlation would have proposed (11,32), (11,4) and (2,4)
        let proposals = scorer.proposals.borrow();
        assert_eq!(proposals[0], vec![("11", "4"), ("2", "32")]);
        assert_eq!(proposals[1], vec![("11", "2")]);
        assert_eq!(records.len(), 2);
        assert_eq!((records[0].source, records[0].dest), ("4", "11"));
        assert_eq!((records[1].source, records[1].dest), ("32", "2"));

        let reduced = scheduler.reduced().unwrap();
        assert_eq!(reduced.labels(), scheduler.partition().labels());
        for label in scheduler.partition().labels() {
            assert_eq!(reduced.size(&label), scheduler.partition().size(&label));
        }
        assert_relative_eq!(reduced.mean(&"11").unwrap()[0], 0.02, epsilon = 1e-12);
        assert_relative_eq!(reduced.mean(&"2").unwrap()[0], 10.04, epsilon = 1e-12);

        let scorer = LookupScorer::new(&[(("11", "2"), 1.0)], 100.0);
        let records = scheduler.merge_clusters_by_de(&scorer).unwrap();

        assert_eq!((records[0].source, records[0].dest), ("2", "11"));
        let reduced = scheduler.reduced().unwrap();
        assert_eq!(reduced.labels(), vec!["11"]);
        assert_eq!(reduced.size(&"11"), Some(10));
        assert_relative_eq!(reduced.mean(&"11").unwrap()[0], 5.03, epsilon = 1e-12);
    }

    #[test]
    fn test_misbehaving_scorer_is_rejected() {
        struct Truncating;
        impl DeScorer<&'static str, f64> for Truncating {
            fn score_pairs(
                &self,
                _pairs: &[(&'static str, &'static str)],
                _statistics: &StatisticsTable<&'static str, f64>,
                _thresholds: &DeThresholds,
            ) -> anyhow::Result<Vec<PairScore<&'static str>>> {
                Ok(Vec::new())
            }
        }

        let (partition, statistics) = example();
        let mut scheduler =
            MergeScheduler::new(partition.clone(), statistics, MergeConfig::default()).unwrap();
        assert!(scheduler.merge_clusters_by_de(&Truncating).is_err());
        assert_eq!(scheduler.partition(), &partition);
    }
}
