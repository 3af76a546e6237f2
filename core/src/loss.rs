//! Composite segmentation objective and frame accuracy.
//!
//! Per stage output `p` ([B, C, T] logits):
//!   - cross-entropy against the target, averaged over non-sentinel frames
//!   - 0.15 × mean over valid (t+1) elements of
//!     clamp((log_softmax(p)[t+1] - sg(log_softmax(p)[t]))², 0, 16)
//!     where `sg` stops the gradient, so only frame t+1 is pulled toward t
//! Total = Σ over stages of both terms.

use crate::batch::IGNORE_INDEX;
use crate::tensor::{argmax_channels, log_softmax_channels, log_softmax_channels_backward, Tensor};

/// Weight of the temporal smoothing term.
pub const SMOOTHING_WEIGHT: f32 = 0.15;
/// Upper clamp on each squared log-probability difference.
pub const SMOOTHING_CLAMP: f32 = 16.0;

/// Loss terms of one stage.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StageLoss {
    pub classification: f32,
    /// Already multiplied by [`SMOOTHING_WEIGHT`].
    pub smoothing: f32,
}

/// Result of [`segmentation_loss`].
#[derive(Clone, Debug)]
pub struct LossOutput {
    pub total: f32,
    pub per_stage: Vec<StageLoss>,
    /// dL/d(stage logits), one [B, C, T] buffer per stage. Empty when
    /// gradients were not requested.
    pub d_outputs: Vec<Vec<f32>>,
}

/// Cross-entropy over every frame whose target is not the sentinel.
///
/// Returns the mean loss over those frames (0 when there are none). When
/// `d_logits` is given, accumulates the gradient of that mean into it.
pub fn cross_entropy(
    logits: &[f32],
    target: &[i64],
    b: usize,
    c: usize,
    t_len: usize,
    mut d_logits: Option<&mut [f32]>,
) -> f32 {
    debug_assert_eq!(logits.len(), b * c * t_len);
    debug_assert_eq!(target.len(), b * t_len);

    let count = target.iter().filter(|&&y| y != IGNORE_INDEX).count();
    if count == 0 {
        return 0.0;
    }
    let inv = 1.0 / count as f32;

    let mut total = 0.0f32;
    let mut ls = vec![0.0f32; c * t_len];
    for i in 0..b {
        let slab = &logits[i * c * t_len..(i + 1) * c * t_len];
        log_softmax_channels(slab, &mut ls, c, t_len);
        for t in 0..t_len {
            let y = target[i * t_len + t];
            if y == IGNORE_INDEX {
                continue;
            }
            let y = y as usize;
            debug_assert!(y < c, "target class {y} out of range");
            total -= ls[y * t_len + t];

            if let Some(d) = d_logits.as_deref_mut() {
                for k in 0..c {
                    let p = ls[k * t_len + t].exp();
                    let onehot = if k == y { 1.0 } else { 0.0 };
                    d[(i * c + k) * t_len + t] += (p - onehot) * inv;
                }
            }
        }
    }
    total * inv
}

/// Weighted temporal smoothing term (see module docs).
///
/// `mask`: [B, T]. The mean runs over every class channel at every valid
/// t+1 position. When `d_logits` is given, accumulates its gradient; frame t
/// is treated as a constant, so it only receives gradient as a t+1 frame.
pub fn smoothing(
    logits: &[f32],
    mask: &[f32],
    b: usize,
    c: usize,
    t_len: usize,
    mut d_logits: Option<&mut [f32]>,
) -> f32 {
    debug_assert_eq!(logits.len(), b * c * t_len);
    debug_assert_eq!(mask.len(), b * t_len);
    if t_len < 2 {
        return 0.0;
    }

    let valid_next: f32 = (0..b).map(|i| mask[i * t_len + 1..(i + 1) * t_len].iter().sum::<f32>()).sum();
    let denom = valid_next * c as f32;
    if denom <= 0.0 {
        return 0.0;
    }
    let scale = SMOOTHING_WEIGHT / denom;

    let mut sum = 0.0f32;
    let mut ls = vec![0.0f32; c * t_len];
    let mut g = vec![0.0f32; c * t_len];
    for i in 0..b {
        let slab = &logits[i * c * t_len..(i + 1) * c * t_len];
        let m = &mask[i * t_len..(i + 1) * t_len];
        log_softmax_channels(slab, &mut ls, c, t_len);
        g.fill(0.0);

        for t in 0..t_len - 1 {
            let w = m[t + 1];
            if w == 0.0 {
                continue;
            }
            for k in 0..c {
                let diff = ls[k * t_len + t + 1] - ls[k * t_len + t];
                let sq = diff * diff;
                sum += sq.min(SMOOTHING_CLAMP) * w;
                if sq < SMOOTHING_CLAMP {
                    g[k * t_len + t + 1] = 2.0 * diff * w * scale;
                }
            }
        }

        if let Some(d) = d_logits.as_deref_mut() {
            let probs: Vec<f32> = ls.iter().map(|v| v.exp()).collect();
            log_softmax_channels_backward(&probs, &g, &mut d[i * c * t_len..(i + 1) * c * t_len], c, t_len);
        }
    }
    sum * scale
}

/// Sum of classification + smoothing over all stage outputs.
///
/// `outputs`: one [B, C, T] tensor per stage, `target`: [B, T] with
/// [`IGNORE_INDEX`] on padding, `mask`: [B, T].
pub fn segmentation_loss(outputs: &[Tensor], target: &[i64], mask: &[f32], with_grad: bool) -> LossOutput {
    let mut per_stage = Vec::with_capacity(outputs.len());
    let mut d_outputs = Vec::with_capacity(if with_grad { outputs.len() } else { 0 });
    let mut total = 0.0f32;

    for out in outputs {
        let (b, c, t_len) = (out.shape[0], out.shape[1], out.shape[2]);
        let mut d = if with_grad { vec![0.0f32; out.numel()] } else { Vec::new() };

        let classification = cross_entropy(&out.data, target, b, c, t_len, with_grad.then_some(d.as_mut_slice()));
        let smooth = smoothing(&out.data, mask, b, c, t_len, with_grad.then_some(d.as_mut_slice()));
        total += classification + smooth;
        per_stage.push(StageLoss { classification, smoothing: smooth });
        if with_grad {
            d_outputs.push(d);
        }
    }

    LossOutput { total, per_stage, d_outputs }
}

/// Frames where the argmax of `logits` ([B, C, T]) equals the target,
/// counted over valid frames only. Returns (correct, valid).
pub fn frame_accuracy_counts(logits: &Tensor, target: &[i64], mask: &[f32]) -> (usize, usize) {
    let (b, c, t_len) = (logits.shape[0], logits.shape[1], logits.shape[2]);
    let mut correct = 0;
    let mut valid = 0;
    for i in 0..b {
        let pred = argmax_channels(&logits.data[i * c * t_len..(i + 1) * c * t_len], c, t_len);
        for (t, &p) in pred.iter().enumerate() {
            if mask[i * t_len + t] == 0.0 {
                continue;
            }
            valid += 1;
            if target[i * t_len + t] == p as i64 {
                correct += 1;
            }
        }
    }
    (correct, valid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logits(b: usize, c: usize, t_len: usize, seed: f32) -> Vec<f32> {
        (0..b * c * t_len).map(|i| ((i as f32) * seed).sin() * 2.0).collect()
    }

    #[test]
    fn test_cross_entropy_perfect_prediction() {
        // [B=1, C=2, T=2]: frame 0 → class 0, frame 1 → class 1
        let x = [10.0, -10.0, -10.0, 10.0f32];
        let loss = cross_entropy(&x, &[0, 1], 1, 2, 2, None);
        assert!(loss < 1e-3, "perfect prediction should have near-zero loss, got {loss}");
    }

    #[test]
    fn test_cross_entropy_uniform() {
        let x = vec![0.0f32; 4 * 3];
        let loss = cross_entropy(&x, &[0, 3, 2], 1, 4, 3, None);
        assert!((loss - 4.0f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_sentinel_excluded_from_cross_entropy() {
        let (b, c, t_len) = (2, 3, 5);
        let x = logits(b, c, t_len, 0.7);
        // Second example only has 3 real frames.
        let target = vec![0, 1, 2, 1, 0, 2, 2, 1, IGNORE_INDEX, IGNORE_INDEX];
        let mut d = vec![0.0f32; x.len()];
        let base = cross_entropy(&x, &target, b, c, t_len, Some(&mut d));

        let mut perturbed = x.clone();
        for k in 0..c {
            for t in 3..5 {
                perturbed[(c + k) * t_len + t] += 50.0 * (k as f32 + 1.0);
                assert_eq!(d[(c + k) * t_len + t], 0.0);
            }
        }
        let after = cross_entropy(&perturbed, &target, b, c, t_len, None);
        assert_eq!(base, after);
    }

    #[test]
    fn test_cross_entropy_all_sentinel_is_zero() {
        let x = logits(1, 3, 2, 0.3);
        let mut d = vec![0.0f32; x.len()];
        assert_eq!(cross_entropy(&x, &[IGNORE_INDEX, IGNORE_INDEX], 1, 3, 2, Some(&mut d)), 0.0);
        assert!(d.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_cross_entropy_grad_fd() {
        let (b, c, t_len) = (2, 3, 4);
        let x = logits(b, c, t_len, 0.41);
        let target = vec![0, 2, 1, 1, 2, 0, IGNORE_INDEX, IGNORE_INDEX];
        let mut d = vec![0.0f32; x.len()];
        cross_entropy(&x, &target, b, c, t_len, Some(&mut d));
        let eps = 1e-3;
        for i in 0..x.len() {
            let mut p = x.clone();
            p[i] += eps;
            let mut m = x.clone();
            m[i] -= eps;
            let fd = (cross_entropy(&p, &target, b, c, t_len, None) - cross_entropy(&m, &target, b, c, t_len, None)) / (2.0 * eps);
            assert!((fd - d[i]).abs() < 2e-3, "d[{i}]: ana={}, fd={fd}", d[i]);
        }
    }

    #[test]
    fn test_smoothing_zero_for_constant_sequence() {
        // Same logits at every frame → identical log-probs → no penalty.
        let (c, t_len) = (3, 4);
        let mut x = vec![0.0f32; c * t_len];
        for k in 0..c {
            for t in 0..t_len {
                x[k * t_len + t] = k as f32 * 0.8;
            }
        }
        assert_eq!(smoothing(&x, &[1.0; 4], 1, c, t_len, None), 0.0);
    }

    #[test]
    fn test_smoothing_clamps_at_sixteen() {
        // Two classes, huge switch between frames → each squared diff > 16.
        let x = [100.0, -100.0, -100.0, 100.0f32];
        let loss = smoothing(&x, &[1.0, 1.0], 1, 2, 2, None);
        assert!((loss - SMOOTHING_WEIGHT * SMOOTHING_CLAMP).abs() < 1e-4, "loss={loss}");
        let mut d = vec![0.0f32; 4];
        smoothing(&x, &[1.0, 1.0], 1, 2, 2, Some(&mut d));
        assert!(d.iter().all(|&v| v == 0.0), "clamped region must not pass gradient");
    }

    #[test]
    fn test_smoothing_ignores_padded_transitions() {
        let (c, t_len) = (2, 4);
        let x = logits(1, c, t_len, 0.9);
        let full = smoothing(&x, &[1.0, 1.0, 1.0, 1.0], 1, c, t_len, None);
        let mut changed = x.clone();
        changed[3] += 3.0;
        changed[t_len + 3] -= 3.0;
        let a = smoothing(&x, &[1.0, 1.0, 1.0, 0.0], 1, c, t_len, None);
        let b = smoothing(&changed, &[1.0, 1.0, 1.0, 0.0], 1, c, t_len, None);
        assert_eq!(a, b, "a masked frame must not influence the term");
        assert_ne!(full, a);
    }

    /// FD against a reference where frame t's log-probs are frozen at the
    /// unperturbed values, which is exactly what the stop-gradient means.
    #[test]
    fn test_smoothing_grad_matches_detached_reference() {
        let (b, c, t_len) = (2, 3, 5);
        // Small logits keep every squared difference well below the clamp.
        let x: Vec<f32> = logits(b, c, t_len, 0.37).iter().map(|v| v * 0.5).collect();
        let mask = vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0];

        let frozen: Vec<f32> = (0..b)
            .flat_map(|i| {
                let mut ls = vec![0.0f32; c * t_len];
                log_softmax_channels(&x[i * c * t_len..(i + 1) * c * t_len], &mut ls, c, t_len);
                ls
            })
            .collect();
        let reference = |y: &[f32]| -> f32 {
            let denom: f32 = (0..b).map(|i| mask[i * t_len + 1..(i + 1) * t_len].iter().sum::<f32>()).sum::<f32>() * c as f32;
            let mut s = 0.0f32;
            for i in 0..b {
                let mut ls = vec![0.0f32; c * t_len];
                log_softmax_channels(&y[i * c * t_len..(i + 1) * c * t_len], &mut ls, c, t_len);
                for t in 0..t_len - 1 {
                    for k in 0..c {
                        let diff = ls[k * t_len + t + 1] - frozen[(i * c + k) * t_len + t];
                        s += (diff * diff).min(SMOOTHING_CLAMP) * mask[i * t_len + t + 1];
                    }
                }
            }
            SMOOTHING_WEIGHT * s / denom
        };

        let mut d = vec![0.0f32; x.len()];
        let value = smoothing(&x, &mask, b, c, t_len, Some(&mut d));
        assert!((value - reference(&x)).abs() < 1e-6);

        let eps = 1e-3;
        for i in 0..x.len() {
            let mut p = x.clone();
            p[i] += eps;
            let mut m = x.clone();
            m[i] -= eps;
            let fd = (reference(&p) - reference(&m)) / (2.0 * eps);
            assert!((fd - d[i]).abs() < 1e-3, "d[{i}]: ana={}, fd={fd}", d[i]);
        }
    }

    #[test]
    fn test_segmentation_loss_sums_stages() {
        let (b, c, t_len) = (1, 3, 4);
        let outs = vec![
            Tensor::from_vec(logits(b, c, t_len, 0.2), &[b, c, t_len]),
            Tensor::from_vec(logits(b, c, t_len, 0.5), &[b, c, t_len]),
        ];
        let target = vec![0, 1, 1, 2];
        let mask = vec![1.0; 4];
        let out = segmentation_loss(&outs, &target, &mask, true);
        assert_eq!(out.per_stage.len(), 2);
        assert_eq!(out.d_outputs.len(), 2);
        let summed: f32 = out.per_stage.iter().map(|s| s.classification + s.smoothing).sum();
        assert!((out.total - summed).abs() < 1e-6);
        assert!(out.total.is_finite() && out.total >= 0.0);

        let no_grad = segmentation_loss(&outs, &target, &mask, false);
        assert!(no_grad.d_outputs.is_empty());
        assert_eq!(no_grad.total, out.total);
    }

    #[test]
    fn test_frame_accuracy_counts_only_valid_frames() {
        // [B=1, C=2, T=4] argmax = [0, 1, 1, 0]
        let x = Tensor::from_vec(vec![5.0, 0.0, 0.0, 5.0, 0.0, 5.0, 5.0, 0.0], &[1, 2, 4]);
        let target = vec![0, 1, 0, IGNORE_INDEX];
        let (correct, valid) = frame_accuracy_counts(&x, &target, &[1.0, 1.0, 1.0, 0.0]);
        assert_eq!((correct, valid), (2, 3));
    }
}
