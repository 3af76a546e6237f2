//! One refinement stage: 1×1 projection → dilated residual layers → 1×1 to logits.
//!
//! A stage works on a single `[C, T]` slab with its `[T]` validity mask; the
//! network loops over batch elements. Padded positions are zeroed after every
//! residual layer and on the output so they never leak into a later receptive
//! field. The input projection is left unmasked; its input is already zero on
//! padding, so padded columns carry only the projection bias until the first
//! residual layer masks them.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::conv1d::{
    dilated_conv_backward, dilated_conv_forward, pointwise_conv_backward, pointwise_conv_forward,
    DILATED_KERNEL,
};
use crate::tensor::{add_assign_f32, fill_uniform, mask_channels};

/// Probability of zeroing a unit in the residual branch during training.
pub const DROPOUT_P: f32 = 0.5;

/// Forward-pass mode. Dropout is active only in `Train`, which carries the
/// generator used to draw the keep masks.
pub enum Mode<'a> {
    Train(&'a mut ChaCha8Rng),
    Eval,
}

/// One dilated residual layer.
///
/// Layout (row-major):
///   w_dilated: [f, f, 3]
///   w_1x1:     [f, f]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DilatedResidualLayer {
    pub dilation: usize,
    pub w_dilated: Vec<f32>,
    pub b_dilated: Vec<f32>,
    pub w_1x1: Vec<f32>,
    pub b_1x1: Vec<f32>,
}

impl DilatedResidualLayer {
    fn init<R: Rng + ?Sized>(f: usize, dilation: usize, rng: &mut R) -> Self {
        let dil_bound = 1.0 / ((f * DILATED_KERNEL) as f32).sqrt();
        let pw_bound = 1.0 / (f as f32).sqrt();
        let mut layer = Self::zeros(f, dilation);
        fill_uniform(rng, &mut layer.w_dilated, dil_bound);
        fill_uniform(rng, &mut layer.b_dilated, dil_bound);
        fill_uniform(rng, &mut layer.w_1x1, pw_bound);
        fill_uniform(rng, &mut layer.b_1x1, pw_bound);
        layer
    }

    fn zeros(f: usize, dilation: usize) -> Self {
        DilatedResidualLayer {
            dilation,
            w_dilated: vec![0.0; f * f * DILATED_KERNEL],
            b_dilated: vec![0.0; f],
            w_1x1: vec![0.0; f * f],
            b_1x1: vec![0.0; f],
        }
    }
}

/// All learnable parameters of one stage.
///
/// Layout (row-major):
///   w_in:  [f, dim]
///   w_out: [num_classes, f]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub dim: usize,
    pub num_f_maps: usize,
    pub num_classes: usize,
    pub w_in: Vec<f32>,
    pub b_in: Vec<f32>,
    pub layers: Vec<DilatedResidualLayer>,
    pub w_out: Vec<f32>,
    pub b_out: Vec<f32>,
}

/// Intermediates of one residual layer needed by the backward pass.
#[derive(Debug)]
pub struct LayerCache {
    /// Layer input (residual branch source): [f, T]
    input: Vec<f32>,
    /// Dilated conv output before ReLU: [f, T]
    pre_relu: Vec<f32>,
    /// ReLU output fed to the 1×1 conv: [f, T]
    relu: Vec<f32>,
    /// Scaled keep mask (0 or 1/(1-p)); `None` in eval mode.
    keep: Option<Vec<f32>>,
}

/// Intermediates of a full stage forward.
#[derive(Debug)]
pub struct StageCache {
    input: Vec<f32>,
    layers: Vec<LayerCache>,
    last_hidden: Vec<f32>,
}

impl Stage {
    /// Initialise with the default `Conv1d` scheme: weights and biases uniform
    /// in ±1/sqrt(fan_in), fan_in = in_channels × kernel width.
    pub fn init<R: Rng + ?Sized>(
        num_layers: usize,
        num_f_maps: usize,
        dim: usize,
        num_classes: usize,
        rng: &mut R,
    ) -> Self {
        let f = num_f_maps;
        let in_bound = 1.0 / (dim as f32).sqrt();
        let out_bound = 1.0 / (f as f32).sqrt();

        let mut w_in = vec![0.0f32; f * dim];
        let mut b_in = vec![0.0f32; f];
        fill_uniform(rng, &mut w_in, in_bound);
        fill_uniform(rng, &mut b_in, in_bound);

        let layers = (0..num_layers)
            .map(|i| DilatedResidualLayer::init(f, 1usize << i, &mut *rng))
            .collect();

        let mut w_out = vec![0.0f32; num_classes * f];
        let mut b_out = vec![0.0f32; num_classes];
        fill_uniform(rng, &mut w_out, out_bound);
        fill_uniform(rng, &mut b_out, out_bound);

        Stage { dim, num_f_maps, num_classes, w_in, b_in, layers, w_out, b_out }
    }

    /// Create a zero-initialized shadow for gradient accumulation.
    pub fn zeros_like(&self) -> Self {
        let f = self.num_f_maps;
        Stage {
            dim: self.dim,
            num_f_maps: f,
            num_classes: self.num_classes,
            w_in: vec![0.0; self.w_in.len()],
            b_in: vec![0.0; self.b_in.len()],
            layers: self.layers.iter().map(|l| DilatedResidualLayer::zeros(f, l.dilation)).collect(),
            w_out: vec![0.0; self.w_out.len()],
            b_out: vec![0.0; self.b_out.len()],
        }
    }

    /// Parameter buffers in a fixed order: w_in, b_in, then per layer
    /// (w_dilated, b_dilated, w_1x1, b_1x1), then w_out, b_out.
    pub fn buffers(&self) -> Vec<&[f32]> {
        let mut out: Vec<&[f32]> = vec![&self.w_in[..], &self.b_in[..]];
        for l in &self.layers {
            out.extend([&l.w_dilated[..], &l.b_dilated[..], &l.w_1x1[..], &l.b_1x1[..]]);
        }
        out.extend([&self.w_out[..], &self.b_out[..]]);
        out
    }

    /// Mutable view of the buffers, same order as [`Stage::buffers`].
    pub fn buffers_mut(&mut self) -> Vec<&mut [f32]> {
        let mut out: Vec<&mut [f32]> = vec![&mut self.w_in[..], &mut self.b_in[..]];
        for l in &mut self.layers {
            out.push(&mut l.w_dilated[..]);
            out.push(&mut l.b_dilated[..]);
            out.push(&mut l.w_1x1[..]);
            out.push(&mut l.b_1x1[..]);
        }
        out.push(&mut self.w_out[..]);
        out.push(&mut self.b_out[..]);
        out
    }

    pub fn num_params(&self) -> usize {
        self.buffers().iter().map(|b| b.len()).sum()
    }

    /// Forward one sequence. `x`: [dim, T], `mask`: [T]. Returns logits
    /// [num_classes, T] (zero on padding) and the cache for `backward`.
    pub fn forward(&self, x: &[f32], mask: &[f32], t_len: usize, mode: &mut Mode<'_>) -> (Vec<f32>, StageCache) {
        let f = self.num_f_maps;
        debug_assert_eq!(x.len(), self.dim * t_len);
        debug_assert_eq!(mask.len(), t_len);

        let mut h = pointwise_conv_forward(x, &self.w_in, &self.b_in, self.dim, f, t_len);
        let mut layer_caches = Vec::with_capacity(self.layers.len());

        for layer in &self.layers {
            let pre_relu = dilated_conv_forward(&h, &layer.w_dilated, &layer.b_dilated, f, f, t_len, layer.dilation);
            let relu: Vec<f32> = pre_relu.iter().map(|&v| v.max(0.0)).collect();
            let mut z = pointwise_conv_forward(&relu, &layer.w_1x1, &layer.b_1x1, f, f, t_len);

            let keep = match mode {
                Mode::Train(rng) => {
                    let scale = 1.0 / (1.0 - DROPOUT_P);
                    let keep: Vec<f32> = (0..z.len())
                        .map(|_| if rng.gen::<f32>() < DROPOUT_P { 0.0 } else { scale })
                        .collect();
                    for (v, &k) in z.iter_mut().zip(&keep) {
                        *v *= k;
                    }
                    Some(keep)
                }
                Mode::Eval => None,
            };

            add_assign_f32(&mut z, &h);
            mask_channels(&mut z, mask, f, t_len);
            layer_caches.push(LayerCache { input: h, pre_relu, relu, keep });
            h = z;
        }

        let mut out = pointwise_conv_forward(&h, &self.w_out, &self.b_out, f, self.num_classes, t_len);
        mask_channels(&mut out, mask, self.num_classes, t_len);

        let cache = StageCache { input: x.to_vec(), layers: layer_caches, last_hidden: h };
        (out, cache)
    }

    /// Backward through the whole stage. Accumulates parameter gradients into
    /// `grads` (a `zeros_like` shadow) and returns dL/dx [dim, T].
    pub fn backward(&self, cache: &StageCache, d_out: &[f32], mask: &[f32], t_len: usize, grads: &mut Stage) -> Vec<f32> {
        let f = self.num_f_maps;
        let c = self.num_classes;
        debug_assert_eq!(d_out.len(), c * t_len);

        let mut g = d_out.to_vec();
        mask_channels(&mut g, mask, c, t_len);
        let mut d_h = pointwise_conv_backward(
            &g, &cache.last_hidden, &self.w_out, &mut grads.w_out, &mut grads.b_out, f, c, t_len,
        );

        for (idx, (layer, lc)) in self.layers.iter().zip(&cache.layers).enumerate().rev() {
            let lg = &mut grads.layers[idx];

            // out = (h + drop(conv1x1(relu(dilated(h))))) * mask
            mask_channels(&mut d_h, mask, f, t_len);
            let mut d_z = d_h.clone();
            if let Some(keep) = &lc.keep {
                for (g, &k) in d_z.iter_mut().zip(keep) {
                    *g *= k;
                }
            }
            let mut d_relu = pointwise_conv_backward(
                &d_z, &lc.relu, &layer.w_1x1, &mut lg.w_1x1, &mut lg.b_1x1, f, f, t_len,
            );
            for (g, &pre) in d_relu.iter_mut().zip(&lc.pre_relu) {
                if pre <= 0.0 {
                    *g = 0.0;
                }
            }
            let d_branch = dilated_conv_backward(
                &d_relu, &lc.input, &layer.w_dilated, &mut lg.w_dilated, &mut lg.b_dilated,
                f, f, t_len, layer.dilation,
            );
            add_assign_f32(&mut d_h, &d_branch);
        }

        pointwise_conv_backward(&d_h, &cache.input, &self.w_in, &mut grads.w_in, &mut grads.b_in, self.dim, f, t_len)
    }
}
