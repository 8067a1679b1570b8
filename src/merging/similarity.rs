//! Similarity between cluster centroids.

use crate::merging::{ClusterLabel, StatisticsTable};
use anyhow::anyhow;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use single_utilities::traits::FloatOps;
use std::collections::HashMap;

/// Similarity of every row cluster to every column cluster.
///
/// Entries pairing a cluster with itself are NaN, so a cluster is never proposed as its own
/// neighbor.
#[derive(Debug, Clone)]
pub struct SimilarityTable<L, T> {
    rows: Vec<L>,
    cols: Vec<L>,
    values: Array2<T>,
}

impl<L, T> SimilarityTable<L, T>
where
    L: ClusterLabel,
    T: FloatOps,
{
    pub fn new(rows: Vec<L>, cols: Vec<L>, values: Array2<T>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            values.dim() == (rows.len(), cols.len()),
            "similarity values have shape {:?}, expected ({}, {})",
            values.dim(),
            rows.len(),
            cols.len()
        );
        Ok(SimilarityTable { rows, cols, values })
    }

    pub fn rows(&self) -> &[L] {
        &self.rows
    }

    pub fn cols(&self) -> &[L] {
        &self.cols
    }

    pub fn values(&self) -> &Array2<T> {
        &self.values
    }

    /// Similarity between `row` and `col`, `None` if either label is not part of the table.
    pub fn get(&self, row: &L, col: &L) -> Option<T> {
        let i = self.rows.iter().position(|r| r == row)?;
        let j = self.cols.iter().position(|c| c == col)?;
        Some(self.values[[i, j]])
    }

    /// Defined entries as `(row, col, value)`, row-major.
    pub fn entries(&self) -> impl Iterator<Item = (&L, &L, T)> + '_ {
        self.values
            .indexed_iter()
            .filter(|(_, v)| !num_traits::Float::is_nan(**v))
            .map(move |((i, j), v)| (&self.rows[i], &self.cols[j], *v))
    }
}

/// Compute the similarity of `rows` clusters to `cols` clusters from their mean vectors.
///
/// With more than two features the similarity is the Pearson correlation between centroids.
/// With one or two features it falls back to `1 - distance / max_distance`, where the maximum
/// is taken over all pairs of clusters involved in either group.
pub fn calculate_similarity<L, T>(
    statistics: &StatisticsTable<L, T>,
    rows: &[L],
    cols: &[L],
) -> anyhow::Result<SimilarityTable<L, T>>
where
    L: ClusterLabel,
    T: FloatOps,
{
    let measure = if statistics.n_features() > 2 {
        Measure::Correlation
    } else {
        Measure::Distance
    };
    centroid_similarity(statistics, rows, cols, measure)
}

/// Distance-based similarity `1 - distance / max_distance` whatever the number of features.
///
/// Defined for constant centroids, where the correlation is not.
pub fn distance_similarity<L, T>(
    statistics: &StatisticsTable<L, T>,
    rows: &[L],
    cols: &[L],
) -> anyhow::Result<SimilarityTable<L, T>>
where
    L: ClusterLabel,
    T: FloatOps,
{
    centroid_similarity(statistics, rows, cols, Measure::Distance)
}

#[derive(Debug, Clone, Copy)]
enum Measure {
    Correlation,
    Distance,
}

fn centroid_similarity<L, T>(
    statistics: &StatisticsTable<L, T>,
    rows: &[L],
    cols: &[L],
    measure: Measure,
) -> anyhow::Result<SimilarityTable<L, T>>
where
    L: ClusterLabel,
    T: FloatOps,
{
    let mut involved: Vec<L> = rows.iter().chain(cols.iter()).cloned().collect();
    involved.sort();
    involved.dedup();

    let mut points = Array2::from_elem((involved.len(), statistics.n_features()), T::zero());
    for (i, label) in involved.iter().enumerate() {
        let mean = statistics
            .mean(label)
            .ok_or_else(|| anyhow!("cluster {:?} is not in the statistics table", label))?;
        points.row_mut(i).assign(mean);
    }
    let position: HashMap<&L, usize> = involved.iter().enumerate().map(|(i, l)| (l, i)).collect();

    let full = match measure {
        Measure::Correlation => pearson_correlation(points.view()),
        Measure::Distance => pdist_normalized(points.view()),
    };

    let mut values = Array2::from_elem((rows.len(), cols.len()), <T as num_traits::Float>::nan());
    for (i, row) in rows.iter().enumerate() {
        for (j, col) in cols.iter().enumerate() {
            if row != col {
                values[[i, j]] = full[[position[row], position[col]]];
            }
        }
    }

    SimilarityTable::new(rows.to_vec(), cols.to_vec(), values)
}

/// Pairwise similarity `1 - d(i, j) / max d` for the row vectors of `points`.
///
/// If all points coincide every similarity is 1.
pub fn pdist_normalized<T>(points: ArrayView2<T>) -> Array2<T>
where
    T: FloatOps,
{
    let n = points.nrows();
    let mut dist = Array2::from_elem((n, n), T::zero());
    let mut max_dist = T::zero();
    for i in 0..n {
        for j in (i + 1)..n {
            let d = points
                .row(i)
                .iter()
                .zip(points.row(j).iter())
                .fold(T::zero(), |acc, (&a, &b)| acc + (a - b) * (a - b));
            let d = num_traits::Float::sqrt(d);
            dist[[i, j]] = d;
            dist[[j, i]] = d;
            if d > max_dist {
                max_dist = d;
            }
        }
    }

    if max_dist <= T::zero() {
        return Array2::from_elem((n, n), T::one());
    }
    dist.mapv(|d| T::one() - d / max_dist)
}

/// Pearson correlation between the row vectors of `points`; NaN where a row is constant.
fn pearson_correlation<T>(points: ArrayView2<T>) -> Array2<T>
where
    T: FloatOps,
{
    let n = points.nrows();
    let n_features = points.ncols();
    let width = T::from(n_features).unwrap_or_else(T::one);

    let mut centered = points.to_owned();
    let mut norms = Array1::from_elem(n, T::zero());
    for (i, mut row) in centered.axis_iter_mut(Axis(0)).enumerate() {
        let mean = row.iter().fold(T::zero(), |acc, &v| acc + v) / width;
        row.mapv_inplace(|v| v - mean);
        let ss = row.iter().fold(T::zero(), |acc, &v| acc + v * v);
        norms[i] = num_traits::Float::sqrt(ss);
    }

    let mut corr = Array2::from_elem((n, n), <T as num_traits::Float>::nan());
    for i in 0..n {
        for j in i..n {
            let denom = norms[i] * norms[j];
            let value = if denom > T::zero() {
                let cov = centered
                    .row(i)
                    .iter()
                    .zip(centered.row(j).iter())
                    .fold(T::zero(), |acc, (&a, &b)| acc + a * b);
                clamp_unit(cov / denom)
            } else {
                <T as num_traits::Float>::nan()
            };
            corr[[i, j]] = value;
            corr[[j, i]] = value;
        }
    }
    corr
}

fn clamp_unit<T: FloatOps>(value: T) -> T {
    let one = T::one();
    if value > one {
        one
    } else if value < -one {
        -one
    } else {
        value
    }
}
