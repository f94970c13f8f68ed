//! Similarity functions and score conventions.
//!
//! All scores are "higher is better" and fall in `[0, 1]` for reasonable input:
//!
//! | function | score |
//! |---|---|
//! | Euclidean | `1 / (1 + d²)` |
//! | dot product | `(1 + a·b) / 2` (inputs expected unit length) |
//! | cosine | `(1 + cos(a, b)) / 2` |
//!
//! The diversity pruner works on distances instead; [`Similarity::distance_from_score`]
//! maps a score back to a distance that is monotone in the score.

use crate::error::{IndexError, Result};
use crate::simd;
use serde::{Deserialize, Serialize};

/// Similarity function of a vector field.
///
/// The discriminants are the persisted ordinals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Similarity {
    Euclidean = 0,
    DotProduct = 1,
    Cosine = 2,
}

impl Similarity {
    /// Score between two vectors of equal length.
    #[inline]
    #[must_use]
    pub fn score(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Similarity::Euclidean => score_from_squared_l2(simd::l2_distance_squared(a, b)),
            Similarity::DotProduct => score_from_dot(simd::dot(a, b)),
            Similarity::Cosine => score_from_dot(simd::cosine(a, b).clamp(-1.0, 1.0)),
        }
    }

    /// Distance used by the diversity pruner.
    ///
    /// Euclidean scores map back to the true L2 distance; dot/cosine map to `1 - score`.
    #[inline]
    #[must_use]
    pub fn distance_from_score(self, score: f32) -> f32 {
        match self {
            Similarity::Euclidean => {
                if score <= 0.0 {
                    f32::INFINITY
                } else {
                    (1.0 / score - 1.0).max(0.0).sqrt()
                }
            }
            Similarity::DotProduct | Similarity::Cosine => (1.0 - score).max(0.0),
        }
    }

    /// Whether PQ training should subtract the dataset mean.
    ///
    /// Only magnitude-sensitive functions are centered; centering would bias
    /// inner-product scores.
    #[inline]
    #[must_use]
    pub fn centers_for_quantization(self) -> bool {
        matches!(self, Similarity::Euclidean)
    }

    /// Persisted ordinal.
    #[inline]
    #[must_use]
    pub fn ordinal(self) -> i32 {
        self as i32
    }

    /// Inverse of [`Similarity::ordinal`].
    pub fn from_ordinal(ord: i32) -> Result<Self> {
        match ord {
            0 => Ok(Similarity::Euclidean),
            1 => Ok(Similarity::DotProduct),
            2 => Ok(Similarity::Cosine),
            other => Err(IndexError::Unsupported(format!(
                "unknown similarity function ordinal {other}"
            ))),
        }
    }
}

#[inline]
pub(crate) fn score_from_squared_l2(d2: f32) -> f32 {
    1.0 / (1.0 + d2)
}

#[inline]
pub(crate) fn score_from_dot(dot: f32) -> f32 {
    (1.0 + dot) / 2.0
}

/// Normalize a vector to unit L2 norm (zero vectors stay zero).
#[must_use]
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let n = simd::norm(v);
    if n < 1e-10 {
        return vec![0.0; v.len()];
    }
    v.iter().map(|x| x / n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn euclidean_score_matches_convention() {
        let s = Similarity::Euclidean.score(&[0.0, 0.0], &[0.0, 0.5]);
        assert!((s - 1.0 / 1.25).abs() < 1e-6);
        let d = Similarity::Euclidean.distance_from_score(s);
        assert!((d - 0.5).abs() < 1e-5);
    }

    #[test]
    fn cosine_is_scale_invariant() {
        let a = [3.0f32, 4.0];
        let b = [6.0f32, 8.0];
        assert!((Similarity::Cosine.score(&a, &b) - 1.0).abs() < 1e-6);
        let na = normalize(&a);
        let nb = normalize(&[-3.0, -4.0]);
        assert!(Similarity::DotProduct.score(&na, &nb).abs() < 1e-6);
    }

    #[test]
    fn ordinals_round_trip() {
        for sim in [
            Similarity::Euclidean,
            Similarity::DotProduct,
            Similarity::Cosine,
        ] {
            assert_eq!(Similarity::from_ordinal(sim.ordinal()).unwrap(), sim);
        }
        assert!(Similarity::from_ordinal(7).unwrap_err().is_configuration());
    }

    #[test]
    fn only_euclidean_is_centered() {
        assert!(Similarity::Euclidean.centers_for_quantization());
        assert!(!Similarity::DotProduct.centers_for_quantization());
        assert!(!Similarity::Cosine.centers_for_quantization());
    }
}
