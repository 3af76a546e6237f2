//! Adam optimizer over every parameter buffer of a [`MultiStageModel`].
//!
//! One moment pair per buffer, in `MultiStageModel::buffers` order, and a
//! single step counter for bias correction. Weight decay, when non-zero, is
//! decoupled (AdamW); the default of 0 gives plain Adam.
//!
//! The whole state is serde-serializable so training can resume from a
//! checkpoint with its moments intact.

use serde::{Deserialize, Serialize};

use crate::model::MultiStageModel;

/// Adam hyperparameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        AdamConfig {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// Moment buffers for a single parameter buffer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct MomentBuf {
    m: Vec<f32>,
    v: Vec<f32>,
}

impl MomentBuf {
    fn zeros(n: usize) -> Self {
        MomentBuf { m: vec![0.0; n], v: vec![0.0; n] }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Adam {
    pub config: AdamConfig,
    bufs: Vec<MomentBuf>,
    step: u32,
}

/// Core Adam step on a single (params, grads, m, v) group.
///
/// Modifies params, m, v in place. Uses pre-computed bias correction inverses.
#[inline]
#[allow(clippy::too_many_arguments)]
fn adam_step_buf(
    params: &mut [f32],
    grads: &[f32],
    m: &mut [f32],
    v: &mut [f32],
    lr: f32,
    cfg: &AdamConfig,
    bc1_inv: f32,
    bc2_inv: f32,
) {
    debug_assert_eq!(params.len(), grads.len());
    debug_assert_eq!(params.len(), m.len());
    for i in 0..params.len() {
        let g = grads[i];
        m[i] = cfg.beta1 * m[i] + (1.0 - cfg.beta1) * g;
        v[i] = cfg.beta2 * v[i] + (1.0 - cfg.beta2) * g * g;
        let m_hat = m[i] * bc1_inv;
        let v_hat = v[i] * bc2_inv;
        params[i] -= lr * (m_hat / (v_hat.sqrt() + cfg.eps) + cfg.weight_decay * params[i]);
    }
}

impl Adam {
    /// Zeroed state shaped like `model`.
    pub fn new(model: &MultiStageModel, config: AdamConfig) -> Self {
        let bufs = model.buffers().iter().map(|b| MomentBuf::zeros(b.len())).collect();
        Adam { config, bufs, step: 0 }
    }

    /// Number of updates applied so far.
    pub fn step_count(&self) -> u32 {
        self.step
    }

    /// Check that the moment buffers line up with `model`'s parameters.
    pub fn check_compatible(&self, model: &MultiStageModel) -> Result<(), String> {
        let params = model.buffers();
        if params.len() != self.bufs.len() {
            return Err(format!("optimizer has {} moment buffers, model has {}", self.bufs.len(), params.len()));
        }
        for (i, (p, mb)) in params.iter().zip(&self.bufs).enumerate() {
            if p.len() != mb.m.len() || p.len() != mb.v.len() {
                return Err(format!("moment buffer {i} has {} entries, parameter has {}", mb.m.len(), p.len()));
            }
        }
        Ok(())
    }

    /// One update of every parameter from `grads` (same shape as `params`).
    pub fn step(&mut self, params: &mut MultiStageModel, grads: &MultiStageModel, lr: f32) {
        self.step += 1;
        let t = self.step as i32;
        let bc1_inv = 1.0 / (1.0 - self.config.beta1.powi(t));
        let bc2_inv = 1.0 / (1.0 - self.config.beta2.powi(t));

        let grad_bufs = grads.buffers();
        let param_bufs = params.buffers_mut();
        debug_assert_eq!(param_bufs.len(), self.bufs.len());
        for ((p, g), mb) in param_bufs.into_iter().zip(grad_bufs).zip(self.bufs.iter_mut()) {
            adam_step_buf(p, g, &mut mb.m, &mut mb.v, lr, &self.config, bc1_inv, bc2_inv);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    fn model() -> MultiStageModel {
        MultiStageModel::init(&ModelConfig::test_config(), 42).unwrap()
    }

    fn constant_grads(m: &MultiStageModel, value: f32) -> MultiStageModel {
        let mut g = m.zeros_like();
        for buf in g.buffers_mut() {
            buf.fill(value);
        }
        g
    }

    #[test]
    fn test_step_moves_against_gradient() {
        let mut params = model();
        let before = params.clone();
        let grads = constant_grads(&params, 0.3);
        let mut opt = Adam::new(&params, AdamConfig::default());
        opt.step(&mut params, &grads, 1e-2);

        for (p, q) in params.buffers().iter().zip(before.buffers()) {
            for (a, b) in p.iter().zip(q.iter()) {
                // first bias-corrected step has magnitude ~lr
                assert!((b - a - 1e-2).abs() < 1e-5, "before={b} after={a}");
            }
        }
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn test_zero_gradient_leaves_params() {
        let mut params = model();
        let before = params.clone();
        let grads = params.zeros_like();
        let mut opt = Adam::new(&params, AdamConfig::default());
        for _ in 0..3 {
            opt.step(&mut params, &grads, 5e-4);
        }
        assert_eq!(params, before);
        assert_eq!(opt.step_count(), 3);
    }

    #[test]
    fn test_minimizes_quadratic() {
        // loss = 0.5 * sum(p^2), grad = p
        let mut params = model();
        let start: f32 = params.buffers().iter().flat_map(|b| b.iter()).map(|x| x * x).sum();
        let mut opt = Adam::new(&params, AdamConfig::default());
        for _ in 0..200 {
            let grads = params.clone();
            opt.step(&mut params, &grads, 1e-2);
        }
        let end: f32 = params.buffers().iter().flat_map(|b| b.iter()).map(|x| x * x).sum();
        assert!(end < 0.1 * start, "start={start}, end={end}");
    }

    #[test]
    fn test_check_compatible() {
        let params = model();
        let opt = Adam::new(&params, AdamConfig::default());
        assert!(opt.check_compatible(&params).is_ok());
        let other = MultiStageModel::init(&ModelConfig { num_f_maps: 4, ..ModelConfig::test_config() }, 1).unwrap();
        assert!(opt.check_compatible(&other).is_err());
    }
}
