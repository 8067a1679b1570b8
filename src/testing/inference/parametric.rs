//! Parametric tests computed from cluster summary statistics.
//!
//! The merge process never revisits individual observations, so these tests work from the
//! per-cluster mean, variance and size only.

use crate::testing::{TTestType, TestResult};
use statrs::distribution::{ContinuousCDF, StudentsT};

/// Perform a t-test from per-group mean, sample variance and size.
pub fn t_test_from_moments(
    mean1: f64,
    var1: f64,
    n1: f64,
    mean2: f64,
    var2: f64,
    n2: f64,
    test_type: TTestType,
) -> TestResult {
    let sum1 = mean1 * n1;
    let sum2 = mean2 * n2;
    let sum_sq1 = var1 * (n1 - 1.0) + n1 * mean1 * mean1;
    let sum_sq2 = var2 * (n2 - 1.0) + n2 * mean2 * mean2;
    fast_t_test_from_sums(sum1, sum_sq1, n1, sum2, sum_sq2, n2, test_type)
}

/// Perform a t-test using precomputed summary statistics.
///
/// # Arguments
///
/// * `sum1`, `sum_sq1`, `n1` - Sum, sum of squares, and count for group 1
/// * `sum2`, `sum_sq2`, `n2` - Sum, sum of squares, and count for group 2
/// * `test_type` - Type of t-test to perform (Student's or Welch's)
///
/// # Returns
///
/// `TestResult` containing the t-statistic and two-sided p-value.
pub fn fast_t_test_from_sums(
    sum1: f64,
    sum_sq1: f64,
    n1: f64,
    sum2: f64,
    sum_sq2: f64,
    n2: f64,
    test_type: TTestType,
) -> TestResult {
    if n1 < 2.0 || n2 < 2.0 {
        return TestResult::new(0.0, 1.0);
    }

    let mean1 = sum1 / n1;
    let mean2 = sum2 / n2;

    // Rounding can push a zero variance slightly negative
    let var1 = ((sum_sq1 - sum1 * sum1 / n1) / (n1 - 1.0)).max(0.0);
    let var2 = ((sum_sq2 - sum2 * sum2 / n2) / (n2 - 1.0)).max(0.0);

    let mean_diff = mean1 - mean2;

    let (std_err, df) = match test_type {
        TTestType::Student => {
            let pooled_var = ((n1 - 1.0) * var1 + (n2 - 1.0) * var2) / (n1 + n2 - 2.0);
            ((pooled_var * (1.0 / n1 + 1.0 / n2)).sqrt(), n1 + n2 - 2.0)
        }
        TTestType::Welch => {
            let term1 = var1 / n1;
            let term2 = var2 / n2;
            let combined_var = term1 + term2;
            // Welch-Satterthwaite equation for degrees of freedom
            let df = combined_var * combined_var
                / (term1 * term1 / (n1 - 1.0) + term2 * term2 / (n2 - 1.0));
            (combined_var.sqrt(), df)
        }
    };

    if std_err <= 0.0 {
        return if mean_diff == 0.0 {
            TestResult::new(0.0, 1.0)
        } else {
            TestResult::new(mean_diff.signum() * f64::INFINITY, 0.0)
        };
    }

    let t_stat = mean_diff / std_err;
    TestResult::new(t_stat, t_test_p_value(t_stat, df))
}

fn t_test_p_value(t_stat: f64, df: f64) -> f64 {
    if !t_stat.is_finite() {
        return if t_stat.is_infinite() { 0.0 } else { 1.0 };
    }

    if df <= 0.0 || !df.is_finite() {
        return 1.0;
    }

    match StudentsT::new(0.0, 1.0, df) {
        Ok(t_dist) => (2.0 * t_dist.sf(t_stat.abs())).clamp(0.0, 1.0),
        Err(_) => 1.0,
    }
}
