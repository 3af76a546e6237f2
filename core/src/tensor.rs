//! Minimal tensor utilities.
//!
//! All operations are free functions on flat f32 slices with explicit dimensions.
//! Sequences are channel-major: a `[C, T]` slab stores channel `c` at time `t`
//! as `x[c * t_len + t]`, so each channel row is contiguous in time. Batched
//! tensors stack `B` such slabs back to back.

use rand::Rng;

/// Flat f32 tensor with shape metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl Tensor {
    pub fn zeros(shape: &[usize]) -> Self {
        let n: usize = shape.iter().product();
        Tensor {
            data: vec![0.0; n],
            shape: shape.to_vec(),
        }
    }

    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Self {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        Tensor { data, shape: shape.to_vec() }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

// ── Channel-axis reductions on [C, T] slabs ──────────────────────────

/// Softmax over the channel axis, independently for every time step.
pub fn softmax_channels(x: &[f32], out: &mut [f32], c: usize, t_len: usize) {
    debug_assert_eq!(x.len(), c * t_len);
    debug_assert_eq!(out.len(), c * t_len);

    for t in 0..t_len {
        let max_val = (0..c).map(|k| x[k * t_len + t]).fold(f32::NEG_INFINITY, f32::max);
        let mut sum_exp = 0.0f32;
        for k in 0..c {
            let e = (x[k * t_len + t] - max_val).exp();
            out[k * t_len + t] = e;
            sum_exp += e;
        }
        for k in 0..c {
            out[k * t_len + t] /= sum_exp;
        }
    }
}

/// Log-softmax over the channel axis, independently for every time step.
pub fn log_softmax_channels(x: &[f32], out: &mut [f32], c: usize, t_len: usize) {
    debug_assert_eq!(x.len(), c * t_len);
    debug_assert_eq!(out.len(), c * t_len);

    for t in 0..t_len {
        let max_val = (0..c).map(|k| x[k * t_len + t]).fold(f32::NEG_INFINITY, f32::max);
        let sum_exp: f32 = (0..c).map(|k| (x[k * t_len + t] - max_val).exp()).sum();
        let log_z = max_val + sum_exp.ln();
        for k in 0..c {
            out[k * t_len + t] = x[k * t_len + t] - log_z;
        }
    }
}

/// Backward of `softmax_channels`: given the softmax output `s` and the
/// upstream gradient `d_s`, accumulates dL/dx into `d_x`.
///
/// dL/dx_k = s_k * (d_s_k - Σ_j s_j d_s_j)
pub fn softmax_channels_backward(s: &[f32], d_s: &[f32], d_x: &mut [f32], c: usize, t_len: usize) {
    debug_assert_eq!(s.len(), c * t_len);
    debug_assert_eq!(d_s.len(), c * t_len);
    debug_assert_eq!(d_x.len(), c * t_len);

    for t in 0..t_len {
        let dot: f32 = (0..c).map(|k| s[k * t_len + t] * d_s[k * t_len + t]).sum();
        for k in 0..c {
            let i = k * t_len + t;
            d_x[i] += s[i] * (d_s[i] - dot);
        }
    }
}

/// Backward of `log_softmax_channels`: given the softmax probabilities `s`
/// (exp of the forward output) and upstream `g`, accumulates dL/dx into `d_x`.
///
/// dL/dx_k = g_k - s_k * Σ_j g_j
pub fn log_softmax_channels_backward(s: &[f32], g: &[f32], d_x: &mut [f32], c: usize, t_len: usize) {
    debug_assert_eq!(s.len(), c * t_len);
    debug_assert_eq!(g.len(), c * t_len);
    debug_assert_eq!(d_x.len(), c * t_len);

    for t in 0..t_len {
        let sum_g: f32 = (0..c).map(|k| g[k * t_len + t]).sum();
        for k in 0..c {
            let i = k * t_len + t;
            d_x[i] += g[i] - s[i] * sum_g;
        }
    }
}

/// Index of the largest channel at every time step. Ties resolve to the
/// lowest index.
pub fn argmax_channels(x: &[f32], c: usize, t_len: usize) -> Vec<usize> {
    debug_assert_eq!(x.len(), c * t_len);
    (0..t_len)
        .map(|t| {
            let mut best = 0;
            let mut best_val = x[t];
            for k in 1..c {
                let v = x[k * t_len + t];
                if v > best_val {
                    best = k;
                    best_val = v;
                }
            }
            best
        })
        .collect()
}

/// Multiply every channel row by the per-time `mask` (broadcast over channels).
pub fn mask_channels(x: &mut [f32], mask: &[f32], c: usize, t_len: usize) {
    debug_assert_eq!(x.len(), c * t_len);
    debug_assert_eq!(mask.len(), t_len);
    for row in x.chunks_exact_mut(t_len).take(c) {
        for (v, &m) in row.iter_mut().zip(mask) {
            *v *= m;
        }
    }
}

/// Element-wise add-assign: a[i] += b[i].
pub fn add_assign_f32(a: &mut [f32], b: &[f32]) {
    debug_assert_eq!(a.len(), b.len());
    for (x, &y) in a.iter_mut().zip(b) {
        *x += y;
    }
}

/// Fill slice with uniform random values in [-scale, scale].
pub fn fill_uniform<R: Rng + ?Sized>(rng: &mut R, buf: &mut [f32], scale: f32) {
    for v in buf.iter_mut() {
        *v = (2.0 * rng.gen::<f32>() - 1.0) * scale;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_softmax_columns_sum_to_one() {
        // [C=3, T=2]; column 0 = (1, 2, 3), column 1 = (5, 5, 5)
        let x = [1.0, 5.0, 2.0, 5.0, 3.0, 5.0f32];
        let mut out = [0.0f32; 6];
        softmax_channels(&x, &mut out, 3, 2);
        for t in 0..2 {
            let sum: f32 = (0..3).map(|k| out[k * 2 + t]).sum();
            assert!((sum - 1.0).abs() < 1e-6, "column {t} sums to {sum}");
        }
        assert!(out[0] < out[2] && out[2] < out[4]);
        for k in 0..3 {
            assert!((out[k * 2 + 1] - 1.0 / 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_log_softmax_matches_ln_softmax() {
        let x = [0.3, -1.2, 2.0, 0.0, -0.5, 4.0, 1.1, 1.1f32];
        let (c, t) = (4, 2);
        let mut sm = [0.0f32; 8];
        let mut ls = [0.0f32; 8];
        softmax_channels(&x, &mut sm, c, t);
        log_softmax_channels(&x, &mut ls, c, t);
        for i in 0..8 {
            assert!((ls[i] - sm[i].ln()).abs() < 1e-5, "i={i}: {} vs {}", ls[i], sm[i].ln());
        }
    }

    #[test]
    fn test_log_softmax_large_logits_finite() {
        let x = [1000.0, -1000.0, 0.0f32];
        let mut ls = [0.0f32; 3];
        log_softmax_channels(&x, &mut ls, 3, 1);
        assert!(ls.iter().all(|v| v.is_finite()));
        assert!(ls[0].abs() < 1e-6);
    }

    #[test]
    fn test_softmax_backward_fd() {
        let (c, t) = (3, 2);
        let x = [0.2, -0.4, 1.0, 0.3, -0.7, 0.9f32];
        let w = [0.5, -1.0, 2.0, 0.1, -0.3, 0.7f32];
        let loss = |x: &[f32]| {
            let mut s = vec![0.0f32; c * t];
            softmax_channels(x, &mut s, c, t);
            s.iter().zip(&w).map(|(a, b)| a * b).sum::<f32>()
        };
        let mut s = vec![0.0f32; c * t];
        softmax_channels(&x, &mut s, c, t);
        let mut d_x = vec![0.0f32; c * t];
        softmax_channels_backward(&s, &w, &mut d_x, c, t);

        let eps = 1e-3;
        for i in 0..x.len() {
            let mut xp = x;
            xp[i] += eps;
            let mut xm = x;
            xm[i] -= eps;
            let fd = (loss(&xp) - loss(&xm)) / (2.0 * eps);
            assert!((fd - d_x[i]).abs() < 1e-3, "d_x[{i}]: ana={}, fd={fd}", d_x[i]);
        }
    }

    #[test]
    fn test_log_softmax_backward_fd() {
        let (c, t) = (3, 2);
        let x = [0.2, -0.4, 1.0, 0.3, -0.7, 0.9f32];
        let w = [0.5, -1.0, 2.0, 0.1, -0.3, 0.7f32];
        let loss = |x: &[f32]| {
            let mut ls = vec![0.0f32; c * t];
            log_softmax_channels(x, &mut ls, c, t);
            ls.iter().zip(&w).map(|(a, b)| a * b).sum::<f32>()
        };
        let mut s = vec![0.0f32; c * t];
        softmax_channels(&x, &mut s, c, t);
        let mut d_x = vec![0.0f32; c * t];
        log_softmax_channels_backward(&s, &w, &mut d_x, c, t);

        let eps = 1e-3;
        for i in 0..x.len() {
            let mut xp = x;
            xp[i] += eps;
            let mut xm = x;
            xm[i] -= eps;
            let fd = (loss(&xp) - loss(&xm)) / (2.0 * eps);
            assert!((fd - d_x[i]).abs() < 2e-3, "d_x[{i}]: ana={}, fd={fd}", d_x[i]);
        }
    }

    #[test]
    fn test_argmax_channels() {
        // [C=3, T=4]
        let x = [
            0.1, 5.0, 0.0, 1.0,
            0.9, 1.0, 0.0, 3.0,
            0.5, 2.0, 0.0, 3.0f32,
        ];
        // Ties (t=2 all zero, t=3 channels 1 and 2) go to the lowest index.
        assert_eq!(argmax_channels(&x, 3, 4), vec![1, 0, 0, 1]);
    }

    #[test]
    fn test_mask_channels_broadcasts() {
        let mut x = vec![1.0f32; 6];
        mask_channels(&mut x, &[1.0, 1.0, 0.0], 2, 3);
        assert_eq!(x, vec![1.0, 1.0, 0.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_fill_uniform_range_and_determinism() {
        let mut a = vec![0.0f32; 500];
        let mut b = vec![0.0f32; 500];
        fill_uniform(&mut ChaCha8Rng::seed_from_u64(42), &mut a, 0.1);
        fill_uniform(&mut ChaCha8Rng::seed_from_u64(42), &mut b, 0.1);
        assert_eq!(a, b);
        assert!(a.iter().all(|&v| (-0.1..=0.1).contains(&v)));
    }
}
