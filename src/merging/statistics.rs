//! Per-cluster aggregate statistics with analytic merge updates.

use crate::merging::{ClusterLabel, Partition};
use anyhow::{anyhow, bail, ensure};
use ndarray::{Array1, Zip};
use single_utilities::traits::FloatOps;
use std::collections::BTreeMap;

/// Aggregates of one cluster over its current members.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterStatistics<T> {
    /// Per-feature mean
    pub mean: Array1<T>,
    /// Per-feature sample variance (n - 1 denominator), if tracked
    pub variance: Option<Array1<T>>,
    /// Per-feature fraction of members expressing above the low-expression threshold, if tracked
    pub present_mean: Option<Array1<T>>,
    /// Number of members
    pub size: usize,
}

impl<T> ClusterStatistics<T>
where
    T: FloatOps,
{
    pub fn new(mean: Array1<T>, size: usize) -> Self {
        ClusterStatistics {
            mean,
            variance: None,
            present_mean: None,
            size,
        }
    }

    pub fn with_variance(mut self, variance: Array1<T>) -> Self {
        self.variance = Some(variance);
        self
    }

    pub fn with_present_mean(mut self, present_mean: Array1<T>) -> Self {
        self.present_mean = Some(present_mean);
        self
    }

    /// Aggregate of the union of `source` and `dest` members.
    ///
    /// Means and presence fractions combine as size-weighted averages. Variances combine with the
    /// pooled formula including a mean-shift term for each side:
    ///
    /// `var' = [(n_s-1)·var_s + n_s·(m_s-m')² + (n_d-1)·var_d + n_d·(m_d-m')²] / (n_s+n_d-1)`
    pub fn combine(source: &Self, dest: &Self) -> anyhow::Result<Self> {
        ensure!(
            source.mean.len() == dest.mean.len(),
            "feature count mismatch: {} vs {}",
            source.mean.len(),
            dest.mean.len()
        );
        let n_s: T = count_as(source.size)?;
        let n_d: T = count_as(dest.size)?;
        let total = n_s + n_d;

        let mean = weighted_average(&source.mean, n_s, &dest.mean, n_d, total);

        let present_mean = match (&source.present_mean, &dest.present_mean) {
            (Some(ps), Some(pd)) => Some(weighted_average(ps, n_s, pd, n_d, total)),
            (None, None) => None,
            _ => bail!("presence means are tracked for only one of the merged clusters"),
        };

        let variance = match (&source.variance, &dest.variance) {
            (Some(vs), Some(vd)) => {
                let one = T::one();
                let mut merged = Array1::from_elem(mean.len(), T::zero());
                Zip::from(&mut merged)
                    .and(&mean)
                    .and(&source.mean)
                    .and(vs)
                    .and(&dest.mean)
                    .and(vd)
                    .for_each(|out, &m, &ms, &var_s, &md, &var_d| {
                        let shift_s = ms - m;
                        let shift_d = md - m;
                        *out = ((n_s - one) * var_s
                            + n_s * shift_s * shift_s
                            + (n_d - one) * var_d
                            + n_d * shift_d * shift_d)
                            / (total - one);
                    });
                Some(merged)
            }
            (None, None) => None,
            _ => bail!("variances are tracked for only one of the merged clusters"),
        };

        Ok(ClusterStatistics {
            mean,
            variance,
            present_mean,
            size: source.size + dest.size,
        })
    }
}

fn weighted_average<T: FloatOps>(
    a: &Array1<T>,
    n_a: T,
    b: &Array1<T>,
    n_b: T,
    total: T,
) -> Array1<T> {
    let mut out = Array1::from_elem(a.len(), T::zero());
    Zip::from(&mut out)
        .and(a)
        .and(b)
        .for_each(|o, &x, &y| *o = (x * n_a + y * n_b) / total);
    out
}

/// Convert a count into the aggregate value type.
pub(crate) fn count_as<T: FloatOps>(n: usize) -> anyhow::Result<T> {
    T::from(n).ok_or_else(|| anyhow!("cannot represent count {} as a float", n))
}

/// Aggregate statistics of every surviving cluster.
///
/// All entries share one feature space, and either all or none of them track variances and
/// presence fractions. The table is only ever changed through [`StatisticsTable::merge`], which
/// keeps every entry an exact aggregate of its cluster's members without revisiting raw data.
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticsTable<L, T> {
    clusters: BTreeMap<L, ClusterStatistics<T>>,
    n_features: usize,
    has_variance: bool,
    has_present_mean: bool,
}

impl<L, T> StatisticsTable<L, T>
where
    L: ClusterLabel,
    T: FloatOps,
{
    /// Empty table for `n_features` features with the given optional aggregates.
    pub fn new(n_features: usize, has_variance: bool, has_present_mean: bool) -> Self {
        StatisticsTable {
            clusters: BTreeMap::new(),
            n_features,
            has_variance,
            has_present_mean,
        }
    }

    /// Table of means only, with sizes taken from `sizes`.
    pub fn from_means(
        means: BTreeMap<L, Array1<T>>,
        sizes: &BTreeMap<L, usize>,
    ) -> anyhow::Result<Self> {
        let n_features = means
            .values()
            .next()
            .map(|m| m.len())
            .ok_or_else(|| anyhow!("cannot build a statistics table without clusters"))?;
        let mut table = Self::new(n_features, false, false);
        for (label, mean) in means {
            let size = *sizes
                .get(&label)
                .ok_or_else(|| anyhow!("no size given for cluster {:?}", label))?;
            table.insert(label, ClusterStatistics::new(mean, size))?;
        }
        Ok(table)
    }

    /// Attach presence fractions to every cluster of a table built without them.
    pub fn with_present_means(mut self, present: BTreeMap<L, Array1<T>>) -> anyhow::Result<Self> {
        self.attach(present, |stats, values| stats.present_mean = Some(values))?;
        self.has_present_mean = true;
        Ok(self)
    }

    /// Attach variances to every cluster of a table built without them.
    pub fn with_variances(mut self, variances: BTreeMap<L, Array1<T>>) -> anyhow::Result<Self> {
        self.attach(variances, |stats, values| stats.variance = Some(values))?;
        self.has_variance = true;
        Ok(self)
    }

    fn attach<F>(&mut self, values: BTreeMap<L, Array1<T>>, mut set: F) -> anyhow::Result<()>
    where
        F: FnMut(&mut ClusterStatistics<T>, Array1<T>),
    {
        ensure!(
            values.len() == self.clusters.len() && values.keys().all(|l| self.clusters.contains_key(l)),
            "attached values cover different clusters than the table"
        );
        for v in values.values() {
            ensure!(
                v.len() == self.n_features,
                "expected {} features, got {}",
                self.n_features,
                v.len()
            );
        }
        for (label, v) in values {
            if let Some(stats) = self.clusters.get_mut(&label) {
                set(stats, v);
            }
        }
        Ok(())
    }

    /// Add a cluster; rejects entries that do not match the table's shape.
    pub fn insert(&mut self, label: L, stats: ClusterStatistics<T>) -> anyhow::Result<()> {
        ensure!(
            !self.clusters.contains_key(&label),
            "cluster {:?} is already in the table",
            label
        );
        ensure!(stats.size > 0, "cluster {:?} has no members", label);
        ensure!(
            stats.mean.len() == self.n_features,
            "cluster {:?}: expected {} features, got {}",
            label,
            self.n_features,
            stats.mean.len()
        );
        match (&stats.variance, self.has_variance) {
            (Some(v), true) => ensure!(
                v.len() == self.n_features,
                "cluster {:?}: variance has {} features, expected {}",
                label,
                v.len(),
                self.n_features
            ),
            (None, false) => {}
            _ => bail!("cluster {:?}: variance tracking does not match the table", label),
        }
        match (&stats.present_mean, self.has_present_mean) {
            (Some(p), true) => ensure!(
                p.len() == self.n_features,
                "cluster {:?}: presence means have {} features, expected {}",
                label,
                p.len(),
                self.n_features
            ),
            (None, false) => {}
            _ => bail!("cluster {:?}: presence tracking does not match the table", label),
        }
        self.clusters.insert(label, stats);
        Ok(())
    }

    /// Merge `source` into `dest` in one step: `dest` receives the combined aggregates and
    /// `source` is removed. On error the table is left untouched.
    pub fn merge(&mut self, source: &L, dest: &L) -> anyhow::Result<()> {
        ensure!(source != dest, "cannot merge cluster {:?} into itself", source);
        let src = self
            .clusters
            .get(source)
            .ok_or_else(|| anyhow!("source cluster {:?} is not in the statistics table", source))?;
        let dst = self
            .clusters
            .get(dest)
            .ok_or_else(|| anyhow!("destination cluster {:?} is not in the statistics table", dest))?;

        let merged = ClusterStatistics::combine(src, dst)?;
        self.clusters.insert(dest.clone(), merged);
        self.clusters.remove(source);
        Ok(())
    }

    /// Fail unless the table describes exactly the clusters of `partition`, with equal sizes.
    pub fn validate_against(&self, partition: &Partition<L>) -> anyhow::Result<()> {
        ensure!(
            self.clusters.len() == partition.len(),
            "statistics cover {} clusters but the partition has {}",
            self.clusters.len(),
            partition.len()
        );
        for (label, members) in partition.iter() {
            let stats = self
                .clusters
                .get(label)
                .ok_or_else(|| anyhow!("cluster {:?} has no statistics", label))?;
            ensure!(
                stats.size == members.len(),
                "cluster {:?}: statistics size {} does not match {} members",
                label,
                stats.size,
                members.len()
            );
        }
        Ok(())
    }

    pub fn get(&self, label: &L) -> Option<&ClusterStatistics<T>> {
        self.clusters.get(label)
    }

    pub fn mean(&self, label: &L) -> Option<&Array1<T>> {
        self.clusters.get(label).map(|s| &s.mean)
    }

    pub fn size(&self, label: &L) -> Option<usize> {
        self.clusters.get(label).map(|s| s.size)
    }

    pub fn contains(&self, label: &L) -> bool {
        self.clusters.contains_key(label)
    }

    /// Labels in ascending order.
    pub fn labels(&self) -> Vec<L> {
        self.clusters.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn has_variance(&self) -> bool {
        self.has_variance
    }

    pub fn has_present_mean(&self) -> bool {
        self.has_present_mean
    }

    pub fn iter(&self) -> impl Iterator<Item = (&L, &ClusterStatistics<T>)> {
        self.clusters.iter()
    }
}
