//! Distance kernels for the coarse, fine, and re-ranking stages.
//!
//! The engine ranks by distance where smaller means closer, for both
//! supported metrics. Inner product is folded into that convention by
//! negating the dot product, so every stage can sort ascending without
//! branching on the metric.

use serde::{Deserialize, Serialize};

/// Distance metric used for partition assignment, approximate scoring,
/// and exact re-ranking. One metric per artifact; recorded in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Squared Euclidean (L2) distance. Squared form preserves ordering
    /// and skips the square root in the hot path.
    #[default]
    Euclidean,
    /// Negated inner product, so lower is still closer.
    InnerProduct,
}

impl Metric {
    /// Distance between two vectors of equal dimension; smaller is closer.
    #[inline]
    #[must_use]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Euclidean => l2_squared(a, b),
            Metric::InnerProduct => -dot(a, b),
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Metric::Euclidean => write!(f, "euclidean"),
            Metric::InnerProduct => write!(f, "inner_product"),
        }
    }
}

/// Squared L2 distance between two vectors.
#[inline]
#[must_use]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Dot product of two vectors.
#[inline]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_squared() {
        let a = [1.0, 2.0, 3.0];
        let b = [1.0, 2.0, 3.0];
        assert_eq!(l2_squared(&a, &b), 0.0);

        let c = [4.0, 6.0, 3.0];
        // (3)^2 + (4)^2 = 25
        assert!((l2_squared(&a, &c) - 25.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_dot() {
        let a = [1.0, 0.0, 2.0];
        let b = [3.0, 5.0, 4.0];
        assert!((dot(&a, &b) - 11.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_metric_ordering_convention() {
        // Under both metrics, the nearer vector must get the smaller distance.
        let query = [1.0, 0.0];
        let near = [0.9, 0.1];
        let far = [-1.0, 0.0];

        for metric in [Metric::Euclidean, Metric::InnerProduct] {
            assert!(
                metric.distance(&query, &near) < metric.distance(&query, &far),
                "{metric} should rank the near vector closer"
            );
        }
    }
}
