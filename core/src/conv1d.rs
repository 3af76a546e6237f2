//! Non-causal 1-D convolutions over channel-major `[C, T]` slabs.
//!
//! Two shapes are needed by a stage:
//!   - pointwise (kernel 1): a per-time-step linear map between channel spaces
//!   - dilated (kernel 3, padding = dilation): length-preserving, taps at
//!     t - dilation, t, t + dilation; out-of-range taps read zero
//!
//! Weights are stored as `[c_out, c_in, kernel]` contiguous (kernel 1 collapses
//! to `[c_out, c_in]`). Every forward has a matching backward that returns the
//! input gradient and accumulates into caller-owned weight/bias gradients.

/// Kernel width of the dilated convolution in every residual layer.
pub const DILATED_KERNEL: usize = 3;

/// Pointwise convolution: out[o, t] = b[o] + Σ_i w[o, i] · x[i, t].
pub fn pointwise_conv_forward(
    x: &[f32],
    w: &[f32],
    b: &[f32],
    c_in: usize,
    c_out: usize,
    t_len: usize,
) -> Vec<f32> {
    debug_assert_eq!(x.len(), c_in * t_len);
    debug_assert_eq!(w.len(), c_out * c_in);
    debug_assert_eq!(b.len(), c_out);

    let mut out = vec![0.0f32; c_out * t_len];
    for o in 0..c_out {
        let out_row = &mut out[o * t_len..(o + 1) * t_len];
        out_row.fill(b[o]);
        for i in 0..c_in {
            let wi = w[o * c_in + i];
            if wi == 0.0 {
                continue;
            }
            let in_row = &x[i * t_len..(i + 1) * t_len];
            for (y, &xv) in out_row.iter_mut().zip(in_row) {
                *y += wi * xv;
            }
        }
    }
    out
}

/// Backward of `pointwise_conv_forward`.
///
/// Returns d_x [c_in, T]; accumulates into d_w [c_out, c_in] and d_b [c_out].
#[allow(clippy::too_many_arguments)]
pub fn pointwise_conv_backward(
    d_out: &[f32],
    x: &[f32],
    w: &[f32],
    d_w: &mut [f32],
    d_b: &mut [f32],
    c_in: usize,
    c_out: usize,
    t_len: usize,
) -> Vec<f32> {
    debug_assert_eq!(d_out.len(), c_out * t_len);
    debug_assert_eq!(x.len(), c_in * t_len);
    debug_assert_eq!(d_w.len(), c_out * c_in);
    debug_assert_eq!(d_b.len(), c_out);

    let mut d_x = vec![0.0f32; c_in * t_len];
    for o in 0..c_out {
        let g_row = &d_out[o * t_len..(o + 1) * t_len];
        d_b[o] += g_row.iter().sum::<f32>();
        for i in 0..c_in {
            let in_row = &x[i * t_len..(i + 1) * t_len];
            d_w[o * c_in + i] += g_row.iter().zip(in_row).map(|(g, v)| g * v).sum::<f32>();
            let wi = w[o * c_in + i];
            let dx_row = &mut d_x[i * t_len..(i + 1) * t_len];
            for (dx, &g) in dx_row.iter_mut().zip(g_row) {
                *dx += wi * g;
            }
        }
    }
    d_x
}

/// Offset of tap `k` relative to the output position, in time steps.
#[inline]
fn tap_offset(k: usize, dilation: usize) -> isize {
    (k as isize - (DILATED_KERNEL as isize - 1) / 2) * dilation as isize
}

/// Dilated kernel-3 convolution with zero padding = dilation (length preserving).
///
/// out[o, t] = b[o] + Σ_i Σ_k w[o, i, k] · x[i, t + (k - 1) · dilation]
#[allow(clippy::too_many_arguments)]
pub fn dilated_conv_forward(
    x: &[f32],
    w: &[f32],
    b: &[f32],
    c_in: usize,
    c_out: usize,
    t_len: usize,
    dilation: usize,
) -> Vec<f32> {
    debug_assert_eq!(x.len(), c_in * t_len);
    debug_assert_eq!(w.len(), c_out * c_in * DILATED_KERNEL);
    debug_assert_eq!(b.len(), c_out);

    let mut out = vec![0.0f32; c_out * t_len];
    for o in 0..c_out {
        let out_row = &mut out[o * t_len..(o + 1) * t_len];
        out_row.fill(b[o]);
        for i in 0..c_in {
            let in_row = &x[i * t_len..(i + 1) * t_len];
            let w_base = (o * c_in + i) * DILATED_KERNEL;
            for k in 0..DILATED_KERNEL {
                let wk = w[w_base + k];
                let off = tap_offset(k, dilation);
                // Valid output range where t + off stays inside [0, t_len).
                let lo = (-off).max(0) as usize;
                let hi = (t_len as isize - off.max(0)).max(0) as usize;
                for t in lo..hi.max(lo) {
                    out_row[t] += wk * in_row[(t as isize + off) as usize];
                }
            }
        }
    }
    out
}

/// Backward of `dilated_conv_forward`.
///
/// Returns d_x [c_in, T]; accumulates into d_w [c_out, c_in, 3] and d_b [c_out].
#[allow(clippy::too_many_arguments)]
pub fn dilated_conv_backward(
    d_out: &[f32],
    x: &[f32],
    w: &[f32],
    d_w: &mut [f32],
    d_b: &mut [f32],
    c_in: usize,
    c_out: usize,
    t_len: usize,
    dilation: usize,
) -> Vec<f32> {
    debug_assert_eq!(d_out.len(), c_out * t_len);
    debug_assert_eq!(x.len(), c_in * t_len);
    debug_assert_eq!(d_w.len(), c_out * c_in * DILATED_KERNEL);
    debug_assert_eq!(d_b.len(), c_out);

    let mut d_x = vec![0.0f32; c_in * t_len];
    for o in 0..c_out {
        let g_row = &d_out[o * t_len..(o + 1) * t_len];
        d_b[o] += g_row.iter().sum::<f32>();
        for i in 0..c_in {
            let in_row = &x[i * t_len..(i + 1) * t_len];
            let w_base = (o * c_in + i) * DILATED_KERNEL;
            for k in 0..DILATED_KERNEL {
                let off = tap_offset(k, dilation);
                let lo = (-off).max(0) as usize;
                let hi = (t_len as isize - off.max(0)).max(0) as usize;
                let wk = w[w_base + k];
                let mut acc = 0.0f32;
                for t in lo..hi.max(lo) {
                    let src = (t as isize + off) as usize;
                    acc += g_row[t] * in_row[src];
                    d_x[i * t_len + src] += wk * g_row[t];
                }
                d_w[w_base + k] += acc;
            }
        }
    }
    d_x
}
