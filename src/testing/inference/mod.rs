use crate::merging::ClusterStatistics;
use crate::testing::{DeMethod, TestResult};
use anyhow::{anyhow, ensure};
use single_utilities::traits::FloatOps;

pub mod discrete;

pub mod parametric;

/// Run the per-feature test of `method` between two clusters, one result per feature.
pub fn feature_tests<T>(
    method: DeMethod,
    first: &ClusterStatistics<T>,
    second: &ClusterStatistics<T>,
) -> anyhow::Result<Vec<TestResult>>
where
    T: FloatOps,
{
    ensure!(
        first.mean.len() == second.mean.len(),
        "feature count mismatch: {} vs {}",
        first.mean.len(),
        second.mean.len()
    );
    let n1 = first.size as f64;
    let n2 = second.size as f64;

    match method {
        DeMethod::ChiSquare => {
            let q1 = first
                .present_mean
                .as_ref()
                .ok_or_else(|| anyhow!("presence means are required for the chi-square test"))?;
            let q2 = second
                .present_mean
                .as_ref()
                .ok_or_else(|| anyhow!("presence means are required for the chi-square test"))?;

            q1.iter()
                .zip(q2.iter())
                .map(|(&a, &b)| {
                    Ok(discrete::presence_chi_square(
                        to_f64(a)?,
                        n1,
                        to_f64(b)?,
                        n2,
                    ))
                })
                .collect()
        }
        DeMethod::TTest(test_type) => {
            let var1 = first
                .variance
                .as_ref()
                .ok_or_else(|| anyhow!("variances are required for the t-test"))?;
            let var2 = second
                .variance
                .as_ref()
                .ok_or_else(|| anyhow!("variances are required for the t-test"))?;

            (0..first.mean.len())
                .map(|g| {
                    Ok(parametric::t_test_from_moments(
                        to_f64(first.mean[g])?,
                        to_f64(var1[g])?,
                        n1,
                        to_f64(second.mean[g])?,
                        to_f64(var2[g])?,
                        n2,
                        test_type,
                    ))
                })
                .collect()
        }
    }
}

pub(crate) fn to_f64<T: FloatOps>(value: T) -> anyhow::Result<f64> {
    value
        .to_f64()
        .ok_or_else(|| anyhow!("value cannot be represented as f64"))
}
