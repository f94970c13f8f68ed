//! Dense vector kernels.
//!
//! Portable implementations written so the compiler can auto-vectorize them:
//! the inner loops work on fixed 8-lane chunks with independent accumulators
//! and fold the remainder separately.
//!
//! ```rust
//! use segann::simd::{dot, l2_distance_squared, norm};
//!
//! let a = [1.0_f32, 0.0, 0.0];
//! let b = [0.0_f32, 1.0, 0.0];
//!
//! assert_eq!(dot(&a, &b), 0.0);
//! assert_eq!(l2_distance_squared(&a, &b), 2.0);
//! assert_eq!(norm(&a), 1.0);
//! ```

const LANES: usize = 8;
const NORM_EPSILON: f32 = 1e-9;

/// Dot product of two vectors.
#[inline]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let (a, b) = (&a[..n], &b[..n]);

    let mut acc = [0.0f32; LANES];
    let chunks = n / LANES;
    for c in 0..chunks {
        let base = c * LANES;
        for lane in 0..LANES {
            acc[lane] += a[base + lane] * b[base + lane];
        }
    }

    let mut sum: f32 = acc.iter().sum();
    for i in chunks * LANES..n {
        sum += a[i] * b[i];
    }
    sum
}

/// L2 norm of a vector.
#[inline]
#[must_use]
pub fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Cosine similarity; zero if either vector has (near) zero norm.
#[inline]
#[must_use]
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let d = dot(a, b);
    let na = norm(a);
    let nb = norm(b);
    if na > NORM_EPSILON && nb > NORM_EPSILON {
        d / (na * nb)
    } else {
        0.0
    }
}

/// Squared L2 distance.
#[inline]
#[must_use]
pub fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let (a, b) = (&a[..n], &b[..n]);

    let mut acc = [0.0f32; LANES];
    let chunks = n / LANES;
    for c in 0..chunks {
        let base = c * LANES;
        for lane in 0..LANES {
            let d = a[base + lane] - b[base + lane];
            acc[lane] += d * d;
        }
    }

    let mut sum: f32 = acc.iter().sum();
    for i in chunks * LANES..n {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

/// `dst += src`, element-wise.
#[inline]
pub fn add_assign(dst: &mut [f32], src: &[f32]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += s;
    }
}

/// `dst -= src`, element-wise.
#[inline]
pub fn sub_assign(dst: &mut [f32], src: &[f32]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d -= s;
    }
}

/// `dst *= factor`, element-wise.
#[inline]
pub fn scale(dst: &mut [f32], factor: f32) {
    for d in dst.iter_mut() {
        *d *= factor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_with_remainder() {
        // 11 elements: one full chunk plus a 3-element tail
        let a: Vec<f32> = (1..=11).map(|x| x as f32).collect();
        let b = vec![1.0f32; 11];
        assert!((dot(&a, &b) - 66.0).abs() < 1e-5);
    }

    #[test]
    fn test_norm() {
        let v = [3.0_f32, 4.0];
        assert!((norm(&v) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_and_zero() {
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine(&[0.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn test_l2_distance_squared() {
        let a = [0.0_f32; 9];
        let mut b = [0.0_f32; 9];
        b[0] = 3.0;
        b[8] = 4.0;
        assert!((l2_distance_squared(&a, &b) - 25.0).abs() < 1e-6);
    }

    #[test]
    fn test_in_place_ops() {
        let mut v = vec![1.0f32, 2.0, 3.0];
        add_assign(&mut v, &[1.0, 1.0, 1.0]);
        sub_assign(&mut v, &[0.5, 0.5, 0.5]);
        scale(&mut v, 2.0);
        assert_eq!(v, vec![3.0, 5.0, 7.0]);
    }
}
