//! Candidate selection from similarity tables.

use crate::merging::{calculate_similarity, ClusterLabel, SimilarityTable, StatisticsTable};
use single_utilities::traits::FloatOps;
use std::cmp::Ordering;
use std::collections::HashSet;

/// The single most similar `(row, col, similarity)` entry, ignoring undefined entries.
///
/// Ties on the similarity value go to the smallest `(row, col)` label pair. Returns `None` when
/// the table has no defined entry.
pub fn find_most_similar<L, T>(table: &SimilarityTable<L, T>) -> Option<(L, L, T)>
where
    L: ClusterLabel,
    T: FloatOps,
{
    let mut best: Option<(&L, &L, T)> = None;
    for (row, col, value) in table.entries() {
        let replace = match &best {
            None => true,
            Some((best_row, best_col, best_value)) => match value.partial_cmp(best_value) {
                Some(Ordering::Greater) => true,
                Some(Ordering::Equal) => (row, col) < (*best_row, *best_col),
                _ => false,
            },
        };
        if replace {
            best = Some((row, col, value));
        }
    }
    best.map(|(row, col, value)| (row.clone(), col.clone(), value))
}

/// Up to `k` most similar neighbors of every row cluster, as `(cluster, neighbor)` pairs.
///
/// Neighbors are ranked by descending similarity, ties by label. A relationship found from both
/// ends is emitted once, in the orientation in which it was first found. A `k` that is not
/// smaller than the number of clusters is replaced by 2 with a warning.
pub fn get_k_nearest_clusters<L, T>(table: &SimilarityTable<L, T>, k: usize) -> Vec<(L, L)>
where
    L: ClusterLabel,
    T: FloatOps,
{
    let n_clusters = table.rows().len();
    let k = if k >= n_clusters {
        log::warn!(
            "k ({}) cannot be greater than or the same as the number of clusters ({}), defaulting to 2",
            k,
            n_clusters
        );
        2
    } else {
        k
    };

    let values = table.values();
    let mut seen: HashSet<(&L, &L)> = HashSet::new();
    let mut pairs = Vec::new();

    for (i, cluster) in table.rows().iter().enumerate() {
        let mut ranked: Vec<(&L, T)> = table
            .cols()
            .iter()
            .enumerate()
            .map(|(j, col)| (col, values[[i, j]]))
            .filter(|(_, v)| !num_traits::Float::is_nan(*v))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });

        for (neighbor, _) in ranked.into_iter().take(k) {
            if seen.contains(&(neighbor, cluster)) || seen.contains(&(cluster, neighbor)) {
                continue;
            }
            seen.insert((cluster, neighbor));
            pairs.push((cluster.clone(), neighbor.clone()));
        }
    }

    pairs
}

/// Nearest-neighbor pairs among all clusters of `statistics`.
pub fn nearest_neighbor_pairs<L, T>(
    statistics: &StatisticsTable<L, T>,
    k: usize,
) -> anyhow::Result<Vec<(L, L)>>
where
    L: ClusterLabel,
    T: FloatOps,
{
    let labels = statistics.labels();
    let similarity = calculate_similarity(statistics, &labels, &labels)?;
    Ok(get_k_nearest_clusters(&similarity, k))
}

/// Put the smaller label first in every pair.
pub fn order_pairs<L>(pairs: &[(L, L)]) -> Vec<(L, L)>
where
    L: ClusterLabel,
{
    pairs
        .iter()
        .map(|(a, b)| {
            if b < a {
                (b.clone(), a.clone())
            } else {
                (a.clone(), b.clone())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merging::ClusterStatistics;
    use ndarray::{array, Array2};

    fn example_statistics() -> StatisticsTable<&'static str, f64> {
        let mut table = StatisticsTable::new(3, false, false);
        for (label, mean, size) in [
            ("11", array![3.0, 1.5, 4.0], 4),
            ("2", array![3.0, 4.0, 2.0], 3),
            ("32", array![3.0, 0.5, 3.0], 2),
            ("4", array![0.0, 0.0, 7.0], 1),
        ] {
            table.insert(label, ClusterStatistics::new(mean, size)).unwrap();
        }
        table
    }

    #[test]
    fn test_find_most_similar_small_to_all() {
        let stats = example_statistics();
        let sim = calculate_similarity(&stats, &["32", "4"], &["11", "2", "32", "4"]).unwrap();

        let (source, dest, value) = find_most_similar(&sim).unwrap();
        assert_eq!((source, dest), ("32", "11"));
        assert_eq!(value, sim.get(&"32", &"11").unwrap());
    }

    #[test]
    fn test_find_most_similar_breaks_ties_by_label() {
        let nan = f64::NAN;
        let values = array![[nan, 0.9, 0.2], [0.9, nan, 0.9], [0.2, 0.9, nan]];
        let sim = SimilarityTable::new(vec![3, 1, 2], vec![3, 1, 2], values).unwrap();

        assert_eq!(find_most_similar(&sim), Some((1, 2, 0.9)));
    }

    #[test]
    fn test_find_most_similar_on_undefined_table() {
        let sim: SimilarityTable<u8, f64> =
            SimilarityTable::new(vec![1], vec![1], Array2::from_elem((1, 1), f64::NAN)).unwrap();
        assert_eq!(find_most_similar(&sim), None);
    }

    #[test]
    fn test_k_nearest_clusters_emits_each_relationship_once() {
        let stats = example_statistics();
        let pairs = nearest_neighbor_pairs(&stats, 2).unwrap();

        let expected = [("11", "4"), ("11", "32"), ("2", "32"), ("2", "4"), ("32", "4")];
        assert_eq!(pairs.len(), expected.len());
        for pair in expected {
            let reversed = (pair.1, pair.0);
            assert!(pairs.contains(&pair) || pairs.contains(&reversed), "missing {:?}", pair);
        }
    }

    #[test]
    fn test_k_is_clamped_when_too_large() {
        let stats = example_statistics();
        let clamped = nearest_neighbor_pairs(&stats, 10).unwrap();
        let two = nearest_neighbor_pairs(&stats, 2).unwrap();
        assert_eq!(clamped, two);
    }

    #[test]
    fn test_order_pairs() {
        assert_eq!(order_pairs(&[(2, 3), (5, 4)]), vec![(2, 3), (4, 5)]);
        let once = order_pairs(&[(5, 4)]);
        assert_eq!(once, vec![(4, 5)]);
        assert_eq!(order_pairs(&once), once);
    }
}
