//! Epoch loop: forward, composite loss, backward, Adam step.
//!
//! After every training epoch both cursors are reset, parameters and
//! optimizer state are checkpointed under the epoch number, and the held-out
//! split is evaluated without gradients.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::adam::{Adam, AdamConfig};
use crate::batch::{Batch, BatchAssembler};
use crate::checkpoint::CheckpointStore;
use crate::config::{ModelConfig, TrainConfig};
use crate::dataset::ExampleSource;
use crate::error::{Result, SegError};
use crate::loss::{frame_accuracy_counts, segmentation_loss};
use crate::model::MultiStageModel;
use crate::stage::Mode;

/// Dropout draws from its own ChaCha stream so it never aliases the
/// parameter-init sequence of the same seed.
const DROPOUT_STREAM: u64 = 1;

/// Loss and frame accuracy over one pass of a split.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplitStats {
    /// Summed batch loss divided by the number of examples.
    pub loss: f32,
    /// Correct final-stage frames over valid frames.
    pub accuracy: f32,
    pub valid_frames: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub train: SplitStats,
    pub test: SplitStats,
}

pub struct Trainer {
    pub model: MultiStageModel,
    pub optimizer: Adam,
    rng: ChaCha8Rng,
    /// Completed epochs; the next checkpoint is `epoch + 1`.
    epoch: usize,
}

/// Running sums for one split.
#[derive(Default)]
struct Accum {
    loss: f64,
    correct: usize,
    valid: usize,
}

impl Accum {
    fn add(&mut self, batch_loss: f32, (correct, valid): (usize, usize)) {
        self.loss += batch_loss as f64;
        self.correct += correct;
        self.valid += valid;
    }

    fn finish(self, examples: usize, split: &'static str) -> Result<SplitStats> {
        if self.valid == 0 {
            return Err(SegError::EmptySplit { split });
        }
        Ok(SplitStats {
            loss: (self.loss / examples as f64) as f32,
            accuracy: self.correct as f32 / self.valid as f32,
            valid_frames: self.valid,
        })
    }
}

impl Trainer {
    /// Fresh model and optimizer. `seed` drives parameter init and dropout.
    pub fn new(model_cfg: &ModelConfig, seed: u64) -> Result<Self> {
        let model = MultiStageModel::init(model_cfg, seed)?;
        let optimizer = Adam::new(&model, AdamConfig::default());
        Ok(Trainer { model, optimizer, rng: dropout_rng(seed, 0), epoch: 0 })
    }

    /// Continue from the checkpoint written after `epoch`.
    pub fn resume(store: &CheckpointStore, epoch: usize, seed: u64) -> Result<Self> {
        let model = store.load_model(epoch)?;
        let optimizer = store.load_optimizer(epoch, &model)?;
        info!(epoch, dir = %store.dir().display(), "resumed from checkpoint");
        Ok(Trainer { model, optimizer, rng: dropout_rng(seed, epoch), epoch })
    }

    /// Number of completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    fn check_batch(&self, batch: &Batch) -> Result<()> {
        let dim = batch.input.shape[1];
        let expected = self.model.config.features_dim;
        if dim != expected {
            let id = batch.ids.first().cloned().unwrap_or_default();
            return Err(SegError::FeatureDim { id, dim, expected });
        }
        Ok(())
    }

    /// One optimisation pass over every remaining example of `data`. Does not
    /// reset the assembler.
    pub fn train_epoch<S: ExampleSource>(
        &mut self,
        data: &mut BatchAssembler<S>,
        batch_size: usize,
        lr: f32,
    ) -> Result<SplitStats> {
        let mut acc = Accum::default();
        while data.has_next() {
            let batch = data.next_batch(batch_size)?;
            self.check_batch(&batch)?;

            let (outputs, cache) = self.model.forward(&batch.input, &batch.mask, &mut Mode::Train(&mut self.rng))?;
            let loss = segmentation_loss(&outputs, &batch.target, &batch.mask, true);
            let grads = self.model.backward(&cache, &loss.d_outputs, &batch.mask);
            self.optimizer.step(&mut self.model, &grads, lr);

            let counts = match outputs.last() {
                Some(last) => frame_accuracy_counts(last, &batch.target, &batch.mask),
                None => (0, 0),
            };
            debug!(size = batch.size(), loss = loss.total, correct = counts.0, valid = counts.1, "train batch");
            acc.add(loss.total, counts);
        }
        acc.finish(data.len(), "train")
    }

    /// Loss and accuracy in eval mode, no parameter updates. Does not reset
    /// the assembler.
    pub fn evaluate<S: ExampleSource>(&self, data: &mut BatchAssembler<S>, batch_size: usize) -> Result<SplitStats> {
        let mut acc = Accum::default();
        while data.has_next() {
            let batch = data.next_batch(batch_size)?;
            self.check_batch(&batch)?;

            let (outputs, _) = self.model.forward(&batch.input, &batch.mask, &mut Mode::Eval)?;
            let loss = segmentation_loss(&outputs, &batch.target, &batch.mask, false);
            let counts = match outputs.last() {
                Some(last) => frame_accuracy_counts(last, &batch.target, &batch.mask),
                None => (0, 0),
            };
            debug!(size = batch.size(), loss = loss.total, "eval batch");
            acc.add(loss.total, counts);
        }
        acc.finish(data.len(), "test")
    }

    /// Run `cfg.num_epochs` epochs, checkpointing each into `store`.
    pub fn train<S: ExampleSource, T: ExampleSource>(
        &mut self,
        train: &mut BatchAssembler<S>,
        test: &mut BatchAssembler<T>,
        store: &CheckpointStore,
        cfg: &TrainConfig,
    ) -> Result<Vec<EpochReport>> {
        cfg.validate()?;
        info!(
            params = self.model.num_params(),
            train_examples = train.len(),
            test_examples = test.len(),
            start_epoch = self.epoch + 1,
            "training"
        );

        let mut reports = Vec::with_capacity(cfg.num_epochs);
        for _ in 0..cfg.num_epochs {
            let train_stats = self.train_epoch(train, cfg.batch_size, cfg.learning_rate)?;
            train.reset();
            self.epoch += 1;
            store.save(self.epoch, &self.model, &self.optimizer)?;

            let test_stats = self.evaluate(test, cfg.batch_size)?;
            test.reset();

            let report = EpochReport { epoch: self.epoch, train: train_stats, test: test_stats };
            info!(
                epoch = report.epoch,
                train_loss = report.train.loss,
                train_acc = report.train.accuracy,
                test_loss = report.test.loss,
                test_acc = report.test.accuracy,
                "epoch complete"
            );
            reports.push(report);
        }
        Ok(reports)
    }
}

fn dropout_rng(seed: u64, epoch: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(DROPOUT_STREAM + epoch as u64);
    rng
}
