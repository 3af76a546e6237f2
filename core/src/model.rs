//! Multi-stage model: a cascade of [`Stage`]s over a padded batch.
//!
//! Stage 1 reads raw features. Every later stage reads the channel softmax of
//! the previous stage's logits, masked to the valid frames. All stage outputs
//! are returned so each can be supervised on its own.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::error::{Result, SegError};
use crate::stage::{Mode, Stage, StageCache};
use crate::tensor::{mask_channels, softmax_channels, softmax_channels_backward, Tensor};

/// All learnable parameters plus the shape they were built from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MultiStageModel {
    pub config: ModelConfig,
    pub stages: Vec<Stage>,
}

/// Per-example intermediates of a forward pass.
#[derive(Debug)]
struct ExampleCache {
    stages: Vec<StageCache>,
    /// Softmax of stage k-1's logits, for k = 1..num_stages (unmasked).
    softmax: Vec<Vec<f32>>,
}

/// Intermediates needed by [`MultiStageModel::backward`].
#[derive(Debug)]
pub struct ForwardCache {
    examples: Vec<ExampleCache>,
    t_len: usize,
}

impl MultiStageModel {
    /// Build every stage from the declared counts with a seeded generator.
    pub fn init(cfg: &ModelConfig, seed: u64) -> Result<Self> {
        cfg.validate()?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut stages = Vec::with_capacity(cfg.num_stages);
        stages.push(Stage::init(cfg.num_layers, cfg.num_f_maps, cfg.features_dim, cfg.num_classes, &mut rng));
        for _ in 1..cfg.num_stages {
            stages.push(Stage::init(cfg.num_layers, cfg.num_f_maps, cfg.num_classes, cfg.num_classes, &mut rng));
        }
        Ok(MultiStageModel { config: cfg.clone(), stages })
    }

    /// Create a zero-initialized shadow for gradient accumulation.
    pub fn zeros_like(&self) -> Self {
        MultiStageModel {
            config: self.config.clone(),
            stages: self.stages.iter().map(Stage::zeros_like).collect(),
        }
    }

    /// Every parameter buffer, stage by stage.
    pub fn buffers(&self) -> Vec<&[f32]> {
        self.stages.iter().flat_map(Stage::buffers).collect()
    }

    pub fn buffers_mut(&mut self) -> Vec<&mut [f32]> {
        self.stages.iter_mut().flat_map(Stage::buffers_mut).collect()
    }

    /// Total number of parameters.
    pub fn num_params(&self) -> usize {
        self.stages.iter().map(Stage::num_params).sum()
    }

    /// Check that `other` has exactly this model's shape (used when loading).
    pub fn check_compatible(&self, other: &MultiStageModel) -> std::result::Result<(), String> {
        if self.config != other.config {
            return Err(format!("config mismatch: expected {:?}, found {:?}", self.config, other.config));
        }
        let a = self.buffers();
        let b = other.buffers();
        if a.len() != b.len() || a.iter().zip(&b).any(|(x, y)| x.len() != y.len()) {
            return Err("parameter buffer shapes do not match the config".into());
        }
        Ok(())
    }

    /// Run every stage over a batch.
    ///
    /// `input`: [B, features_dim, T], `mask`: [B, T] (1 = real frame, 0 = padding).
    /// Returns one [B, num_classes, T] logit tensor per stage.
    pub fn forward(&self, input: &Tensor, mask: &[f32], mode: &mut Mode<'_>) -> Result<(Vec<Tensor>, ForwardCache)> {
        let cfg = &self.config;
        let [b, dim, t_len] = input.shape[..] else {
            return Err(SegError::Config(format!("expected a [B, D, T] input, got shape {:?}", input.shape)));
        };
        if dim != cfg.features_dim {
            return Err(SegError::Config(format!(
                "input has {dim} feature channels, model expects {}", cfg.features_dim
            )));
        }
        if mask.len() != b * t_len {
            return Err(SegError::Config(format!("mask has {} entries, expected {}", mask.len(), b * t_len)));
        }

        let c = cfg.num_classes;
        let mut outputs: Vec<Tensor> = (0..self.stages.len()).map(|_| Tensor::zeros(&[b, c, t_len])).collect();
        let mut examples = Vec::with_capacity(b);

        for i in 0..b {
            let x = &input.data[i * dim * t_len..(i + 1) * dim * t_len];
            let m = &mask[i * t_len..(i + 1) * t_len];

            let (mut out, cache) = self.stages[0].forward(x, m, t_len, mode);
            outputs[0].data[i * c * t_len..(i + 1) * c * t_len].copy_from_slice(&out);
            let mut stage_caches = vec![cache];
            let mut softmax = Vec::with_capacity(self.stages.len().saturating_sub(1));

            for (k, stage) in self.stages.iter().enumerate().skip(1) {
                let mut probs = vec![0.0f32; c * t_len];
                softmax_channels(&out, &mut probs, c, t_len);
                let mut stage_in = probs.clone();
                mask_channels(&mut stage_in, m, c, t_len);

                let (next, cache) = stage.forward(&stage_in, m, t_len, mode);
                outputs[k].data[i * c * t_len..(i + 1) * c * t_len].copy_from_slice(&next);
                stage_caches.push(cache);
                softmax.push(probs);
                out = next;
            }
            examples.push(ExampleCache { stages: stage_caches, softmax });
        }

        Ok((outputs, ForwardCache { examples, t_len }))
    }

    /// Backward through all stages.
    ///
    /// `d_outputs[k]` is dL/d(stage k logits), [B, num_classes, T]. Gradient
    /// reaching a later stage's input flows back through the inter-stage
    /// softmax into the earlier stage. Returns parameter gradients.
    pub fn backward(&self, cache: &ForwardCache, d_outputs: &[Vec<f32>], mask: &[f32]) -> MultiStageModel {
        let c = self.config.num_classes;
        let t_len = cache.t_len;
        debug_assert_eq!(d_outputs.len(), self.stages.len());
        let mut grads = self.zeros_like();

        for (i, ex) in cache.examples.iter().enumerate() {
            let m = &mask[i * t_len..(i + 1) * t_len];
            let mut d_from_next: Option<Vec<f32>> = None;

            for k in (0..self.stages.len()).rev() {
                let mut d_out = d_outputs[k][i * c * t_len..(i + 1) * c * t_len].to_vec();
                if let Some(extra) = d_from_next.take() {
                    for (g, e) in d_out.iter_mut().zip(extra) {
                        *g += e;
                    }
                }
                let mut d_in = self.stages[k].backward(&ex.stages[k], &d_out, m, t_len, &mut grads.stages[k]);

                if k > 0 {
                    // stage_in = softmax(prev) * mask
                    mask_channels(&mut d_in, m, c, t_len);
                    let mut d_prev = vec![0.0f32; c * t_len];
                    softmax_channels_backward(&ex.softmax[k - 1], &d_in, &mut d_prev, c, t_len);
                    d_from_next = Some(d_prev);
                }
            }
        }
        grads
    }
}
