use crate::testing::TestResult;
use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Performs a Yates-corrected chi-square test for independence on a 2x2 contingency table
///
/// The table is `[[a, b], [c, d]]`. Tables with an empty row or column carry no evidence and
/// yield a statistic of 0 with p-value 1.
pub fn chi_square_test(a: f64, b: f64, c: f64, d: f64) -> TestResult {
    let total = a + b + c + d;
    if total <= 0.0 {
        return TestResult::new(0.0, 1.0);
    }

    let row1 = a + b;
    let row2 = c + d;
    let col1 = a + c;
    let col2 = b + d;

    let expected = [
        (a, row1 * col1 / total),
        (b, row1 * col2 / total),
        (c, row2 * col1 / total),
        (d, row2 * col2 / total),
    ];
    if expected.iter().any(|&(_, e)| e <= 0.0) {
        return TestResult::new(0.0, 1.0);
    }

    let chi_square = expected.iter().fold(0.0, |acc, &(observed, e)| {
        let deviation = ((observed - e).abs() - 0.5).max(0.0);
        acc + deviation * deviation / e
    });

    TestResult::new(chi_square, chi_square_p_value(chi_square))
}

/// Chi-square test on the expressing / non-expressing split of two clusters.
///
/// `q1` and `q2` are the expressing fractions, `n1` and `n2` the cluster sizes.
pub fn presence_chi_square(q1: f64, n1: f64, q2: f64, n2: f64) -> TestResult {
    let x = q1 * n1;
    let y = q2 * n2;
    chi_square_test(x, n1 - x, y, n2 - y)
}

fn chi_square_p_value(chi_square: f64) -> f64 {
    if !chi_square.is_finite() {
        return if chi_square.is_infinite() { 0.0 } else { 1.0 };
    }
    match ChiSquared::new(1.0) {
        Ok(chi_dist) => chi_dist.sf(chi_square).clamp(0.0, 1.0),
        Err(_) => 1.0,
    }
}
