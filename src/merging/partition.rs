use crate::merging::ClusterLabel;
use anyhow::{anyhow, bail, ensure};
use std::collections::{BTreeMap, HashMap};

/// Assignment of observations (cells) to clusters.
///
/// Each label maps to the ordered indices of its members. At rest the member sets are pairwise
/// disjoint and together cover the full observation index space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition<L> {
    assignments: BTreeMap<L, Vec<usize>>,
}

impl<L> Partition<L>
where
    L: ClusterLabel,
{
    /// Wrap an existing label → members mapping.
    pub fn new(assignments: BTreeMap<L, Vec<usize>>) -> Self {
        Partition { assignments }
    }

    /// Group observations by their label; member indices keep observation order.
    pub fn from_labels(labels: &[L]) -> Self {
        let mut assignments: BTreeMap<L, Vec<usize>> = BTreeMap::new();
        for (i, label) in labels.iter().enumerate() {
            assignments.entry(label.clone()).or_default().push(i);
        }
        Partition { assignments }
    }

    /// Build the partition from one column of an observation annotation table.
    ///
    /// Fails if `column` does not exist, so that no merge is ever attempted without a grouping.
    pub fn from_annotations(
        annotations: &HashMap<String, Vec<L>>,
        column: &str,
    ) -> anyhow::Result<Self> {
        let labels = annotations
            .get(column)
            .ok_or_else(|| anyhow!("column {} is missing from observation annotations", column))?;
        Ok(Self::from_labels(labels))
    }

    /// Check that member sets are disjoint and cover `0..n_obs` exactly.
    pub fn validate(&self, n_obs: usize) -> anyhow::Result<()> {
        let mut seen = vec![false; n_obs];
        for (label, members) in &self.assignments {
            ensure!(!members.is_empty(), "cluster {:?} has no members", label);
            for &idx in members {
                if idx >= n_obs {
                    bail!(
                        "cluster {:?} references observation {} outside 0..{}",
                        label,
                        idx,
                        n_obs
                    );
                }
                if seen[idx] {
                    bail!("observation {} is assigned to more than one cluster", idx);
                }
                seen[idx] = true;
            }
        }
        if let Some(missing) = seen.iter().position(|&s| !s) {
            bail!("observation {} is not assigned to any cluster", missing);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn contains(&self, label: &L) -> bool {
        self.assignments.contains_key(label)
    }

    pub fn members(&self, label: &L) -> Option<&[usize]> {
        self.assignments.get(label).map(|m| m.as_slice())
    }

    pub fn size(&self, label: &L) -> Option<usize> {
        self.assignments.get(label).map(|m| m.len())
    }

    /// Labels in ascending order.
    pub fn labels(&self) -> Vec<L> {
        self.assignments.keys().cloned().collect()
    }

    pub fn sizes(&self) -> BTreeMap<L, usize> {
        self.assignments
            .iter()
            .map(|(label, members)| (label.clone(), members.len()))
            .collect()
    }

    /// Total number of assigned observations.
    pub fn n_obs(&self) -> usize {
        self.assignments.values().map(|m| m.len()).sum()
    }

    /// Labels whose cluster holds fewer than `min_size` members.
    pub fn small_clusters(&self, min_size: usize) -> Vec<L> {
        self.assignments
            .iter()
            .filter(|(_, members)| members.len() < min_size)
            .map(|(label, _)| label.clone())
            .collect()
    }

    /// Append the members of `source` to `dest` and drop `source`.
    pub fn merge(&mut self, source: &L, dest: &L) -> anyhow::Result<()> {
        ensure!(source != dest, "cannot merge cluster {:?} into itself", source);
        ensure!(
            self.assignments.contains_key(dest),
            "destination cluster {:?} is not in the partition",
            dest
        );
        let moved = self
            .assignments
            .remove(source)
            .ok_or_else(|| anyhow!("source cluster {:?} is not in the partition", source))?;
        if let Some(members) = self.assignments.get_mut(dest) {
            members.extend(moved);
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&L, &Vec<usize>)> {
        self.assignments.iter()
    }

    /// Label of every observation, `None` where an index is unassigned.
    pub fn to_labels(&self, n_obs: usize) -> Vec<Option<L>> {
        let mut labels = vec![None; n_obs];
        for (label, members) in &self.assignments {
            for &idx in members {
                if idx < n_obs {
                    labels[idx] = Some(label.clone());
                }
            }
        }
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example() -> Partition<&'static str> {
        Partition::from_labels(&["11", "2", "2", "11", "32", "11", "2", "32", "4", "11"])
    }

    #[test]
    fn test_from_labels_groups_in_observation_order() {
        let partition = example();
        assert_eq!(partition.len(), 4);
        assert_eq!(partition.members(&"11"), Some(&[0, 3, 5, 9][..]));
        assert_eq!(partition.members(&"2"), Some(&[1, 2, 6][..]));
        assert_eq!(partition.members(&"32"), Some(&[4, 7][..]));
        assert_eq!(partition.members(&"4"), Some(&[8][..]));
        assert!(partition.validate(10).is_ok());
    }

    #[test]
    fn test_missing_annotation_column_is_rejected() {
        let mut annotations = HashMap::new();
        annotations.insert("louvain".to_string(), vec![1u32, 1, 2]);

        assert!(Partition::from_annotations(&annotations, "leiden").is_err());
        let partition = Partition::from_annotations(&annotations, "louvain").unwrap();
        assert_eq!(partition.sizes().get(&1), Some(&2));
    }

    #[test]
    fn test_merge_appends_members() {
        let mut partition = example();
        partition.merge(&"4", &"2").unwrap();

        assert!(!partition.contains(&"4"));
        assert_eq!(partition.members(&"2"), Some(&[1, 2, 6, 8][..]));
        assert_eq!(partition.n_obs(), 10);
        assert!(partition.validate(10).is_ok());
    }

    #[test]
    fn test_merge_rejects_unknown_or_identical_labels() {
        let mut partition = example();
        assert!(partition.merge(&"4", &"4").is_err());
        assert!(partition.merge(&"99", &"2").is_err());
        assert!(partition.merge(&"4", &"99").is_err());
        // nothing was touched
        assert_eq!(partition, example());
    }

    #[test]
    fn test_validate_detects_overlap_and_gaps() {
        let mut overlapping = BTreeMap::new();
        overlapping.insert(1, vec![0, 1]);
        overlapping.insert(2, vec![1, 2]);
        assert!(Partition::new(overlapping).validate(3).is_err());

        let mut gapped = BTreeMap::new();
        gapped.insert(1, vec![0]);
        gapped.insert(2, vec![2]);
        assert!(Partition::new(gapped).validate(3).is_err());
    }

    #[test]
    fn test_to_labels_reflects_merges() {
        let mut partition = example();
        partition.merge(&"32", &"11").unwrap();

        let labels = partition.to_labels(11);
        assert_eq!(labels.len(), 11);
        assert_eq!(labels[4], Some("11"));
        assert_eq!(labels[7], Some("11"));
        assert_eq!(labels[8], Some("4"));
        assert_eq!(labels[10], None);
        // out-of-range members are dropped rather than panicking
        assert_eq!(partition.to_labels(3), vec![Some("11"), Some("2"), Some("2")]);
    }

    #[test]
    fn test_small_clusters() {
        let partition = example();
        assert_eq!(partition.small_clusters(3), vec!["32", "4"]);
        assert!(partition.small_clusters(1).is_empty());
    }
}
