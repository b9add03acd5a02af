//! Vector similarity utilities shared by entity disambiguation and its loss.

/// Cosine similarity between two vectors.
///
/// Returns 0.0 when either vector has zero norm or the lengths differ, so
/// degenerate embeddings never poison a candidate score.
///
/// Note that cosine similarity ranges over [-1, 1]; the disambiguator's
/// probabilistic-OR combination assumes [0, 1] and is preserved as observed
/// in training rather than clamped.
#[must_use]
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Cosine distance `1 - cosine(a, b)`.
#[must_use]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine(a, b)
}

/// Gradient of the cosine distance with respect to the prediction.
///
/// For `f(p) = 1 - p·g / (|p||g|)`:
/// `df/dp = p · (p·g) / (|p|³|g|) − g / (|p||g|)`.
///
/// Returns the zero vector when either norm vanishes (no direction to move).
#[must_use]
pub fn cosine_distance_gradient(pred: &[f32], gold: &[f32]) -> Vec<f32> {
    let mut grad = vec![0.0f32; pred.len()];
    if pred.len() != gold.len() || pred.is_empty() {
        return grad;
    }
    let dot: f32 = pred.iter().zip(gold).map(|(p, g)| p * g).sum();
    let norm_p: f32 = pred.iter().map(|p| p * p).sum::<f32>().sqrt();
    let norm_g: f32 = gold.iter().map(|g| g * g).sum::<f32>().sqrt();
    if norm_p == 0.0 || norm_g == 0.0 {
        return grad;
    }
    let p_scale = dot / (norm_p.powi(3) * norm_g);
    let g_scale = 1.0 / (norm_p * norm_g);
    for ((out, &p), &g) in grad.iter_mut().zip(pred).zip(gold) {
        *out = p * p_scale - g * g_scale;
    }
    grad
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        assert!((cosine(&[1.0, 2.0], &[1.0, 2.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite_is_negative() {
        assert!((cosine(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_norm() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine(&[], &[]), 0.0);
    }

    #[test]
    fn test_cosine_length_mismatch() {
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_gradient_zero_at_alignment() {
        // When pred is a positive scaling of gold the distance is minimal,
        // so the gradient should be (numerically) zero.
        let grad = cosine_distance_gradient(&[2.0, 4.0], &[1.0, 2.0]);
        for g in grad {
            assert!(g.abs() < 1e-6);
        }
    }

    #[test]
    fn test_gradient_descends() {
        let pred = [1.0f32, 0.0];
        let gold = [0.0f32, 1.0];
        let grad = cosine_distance_gradient(&pred, &gold);
        let stepped: Vec<f32> = pred.iter().zip(&grad).map(|(p, g)| p - 0.1 * g).collect();
        assert!(cosine_distance(&stepped, &gold) < cosine_distance(&pred, &gold));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn cosine_bounded(
            a in proptest::collection::vec(-10.0f32..10.0, 1..8),
            b in proptest::collection::vec(-10.0f32..10.0, 1..8),
        ) {
            let sim = cosine(&a, &b);
            prop_assert!(sim >= -1.0001 && sim <= 1.0001);
        }

        #[test]
        fn gradient_same_length(
            a in proptest::collection::vec(-1.0f32..1.0, 1..8),
            b in proptest::collection::vec(-1.0f32..1.0, 1..8),
        ) {
            let grad = cosine_distance_gradient(&a, &b);
            prop_assert_eq!(grad.len(), a.len());
        }
    }
}
