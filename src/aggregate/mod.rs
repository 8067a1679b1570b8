//! In-memory computation of per-cluster statistics.
//!
//! These functions build the [`StatisticsTable`] the merge process starts from. They scan the
//! expression matrix once; all later updates happen analytically during merges.
//!
//! ## Available Aggregations
//!
//! - **`cluster_statistics_csr`**: means, optional sample variances and expressing fractions from
//!   a sparse cells × genes matrix
//! - **`cluster_means_dense`**: means only, e.g. of a principal-component projection used for
//!   neighbor topology

use crate::merging::statistics::count_as;
use crate::merging::{ClusterLabel, ClusterStatistics, Partition, StatisticsTable};
use nalgebra_sparse::CsrMatrix;
use ndarray::{Array1, ArrayView2};
use rayon::prelude::*;
use single_utilities::traits::{FloatOps, FloatOpsTS};

/// Per-cluster statistics of a sparse cells × genes matrix.
///
/// A member expresses a gene when its value is strictly greater than `low_threshold`; implicit
/// zeros count as expressing only if zero itself exceeds the threshold.
pub fn cluster_statistics_csr<L, T>(
    matrix: &CsrMatrix<T>,
    partition: &Partition<L>,
    low_threshold: T,
    with_variance: bool,
) -> anyhow::Result<StatisticsTable<L, T>>
where
    L: ClusterLabel,
    T: FloatOpsTS,
{
    partition.validate(matrix.nrows())?;
    let n_genes = matrix.ncols();
    let zero_expresses = T::zero() > low_threshold;

    let clusters: Vec<(&L, &Vec<usize>)> = partition.iter().collect();
    let computed = clusters
        .par_iter()
        .map(|(label, members)| {
            let n = members.len();
            let mut sums = vec![T::zero(); n_genes];
            let mut sum_squares = vec![T::zero(); n_genes];
            let mut present = vec![if zero_expresses { n } else { 0 }; n_genes];

            for &cell in members.iter() {
                let row = matrix.row(cell);
                for (&gene, &value) in row.col_indices().iter().zip(row.values().iter()) {
                    sums[gene] += value;
                    sum_squares[gene] += value * value;
                    if zero_expresses {
                        present[gene] -= 1;
                    }
                    if value > low_threshold {
                        present[gene] += 1;
                    }
                }
            }

            let size: T = count_as(n)?;
            let mean: Array1<T> = sums.iter().map(|&s| s / size).collect();
            let present_mean = present
                .iter()
                .map(|&c| Ok(count_as::<T>(c)? / size))
                .collect::<anyhow::Result<Array1<T>>>()?;

            let mut stats = ClusterStatistics::new(mean, n).with_present_mean(present_mean);
            if with_variance {
                stats = stats.with_variance(sample_variance(&sums, &sum_squares, n)?);
            }
            Ok(((*label).clone(), stats))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut table = StatisticsTable::new(n_genes, with_variance, true);
    for (label, stats) in computed {
        table.insert(label, stats)?;
    }
    Ok(table)
}

fn sample_variance<T: FloatOps>(sums: &[T], sum_squares: &[T], n: usize) -> anyhow::Result<Array1<T>> {
    if n < 2 {
        return Ok(Array1::from_elem(sums.len(), T::zero()));
    }
    let size: T = count_as(n)?;
    let dof: T = count_as(n - 1)?;
    Ok(sums
        .iter()
        .zip(sum_squares.iter())
        .map(|(&s, &ss)| {
            let var = (ss - s * s / size) / dof;
            if var > T::zero() { var } else { T::zero() }
        })
        .collect())
}

/// Per-cluster means of the rows of a dense observations × dimensions matrix.
pub fn cluster_means_dense<L, T>(
    data: ArrayView2<T>,
    partition: &Partition<L>,
) -> anyhow::Result<StatisticsTable<L, T>>
where
    L: ClusterLabel,
    T: FloatOps,
{
    partition.validate(data.nrows())?;
    let mut table = StatisticsTable::new(data.ncols(), false, false);
    for (label, members) in partition.iter() {
        let mut mean = Array1::from_elem(data.ncols(), T::zero());
        for &obs in members {
            mean.zip_mut_with(&data.row(obs), |m, &v| *m += v);
        }
        let size: T = count_as(members.len())?;
        mean.mapv_inplace(|m| m / size);
        table.insert(label.clone(), ClusterStatistics::new(mean, members.len()))?;
    }
    Ok(table)
}
