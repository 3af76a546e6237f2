//! Batch assembly: shuffled identifiers → zero-padded [B, D, T] batches.
//!
//! Each example is cut to the common length of its features and labels,
//! subsampled by the stride, then padded to the longest example in the batch.
//! Padding carries `IGNORE_INDEX` in the target and 0 in the mask.

use std::path::Path;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, warn};

use crate::dataset::{read_list, ClassMap, ExampleSource};
use crate::error::{Result, SegError};
use crate::tensor::Tensor;

/// Target value for frames that carry no label.
pub const IGNORE_INDEX: i64 = -100;

/// One example at model resolution.
#[derive(Clone, Debug, PartialEq)]
pub struct Example {
    pub id: String,
    /// [feature_dim, frames]
    pub features: Tensor,
    /// One class index per frame.
    pub labels: Vec<usize>,
}

impl Example {
    pub fn frames(&self) -> usize {
        self.labels.len()
    }

    pub fn feature_dim(&self) -> usize {
        self.features.shape[0]
    }
}

/// A padded batch ready for the network.
#[derive(Clone, Debug)]
pub struct Batch {
    pub ids: Vec<String>,
    /// [B, feature_dim, T]
    pub input: Tensor,
    /// [B * T], `IGNORE_INDEX` past each example's length.
    pub target: Vec<i64>,
    /// [B * T], 1.0 on real frames.
    pub mask: Vec<f32>,
    /// Subsampled length of each example.
    pub lengths: Vec<usize>,
}

impl Batch {
    pub fn size(&self) -> usize {
        self.ids.len()
    }

    pub fn t_len(&self) -> usize {
        self.input.shape[2]
    }

    pub fn valid_frames(&self) -> usize {
        self.lengths.iter().sum()
    }
}

/// Keep columns 0, stride, 2·stride, … of the first `frames` columns of a
/// [D, T] matrix.
pub fn subsample_frames(features: &Tensor, frames: usize, stride: usize) -> Tensor {
    let (dim, t_len) = (features.shape[0], features.shape[1]);
    debug_assert!(frames <= t_len && stride > 0);
    let kept: Vec<usize> = (0..frames).step_by(stride).collect();
    let mut out = Vec::with_capacity(dim * kept.len());
    for c in 0..dim {
        let row = &features.data[c * t_len..(c + 1) * t_len];
        out.extend(kept.iter().map(|&t| row[t]));
    }
    Tensor::from_vec(out, &[dim, kept.len()])
}

/// Turn raw source data into an [`Example`]: map names to indices, truncate
/// to the shorter of features and labels, subsample by `stride`.
pub fn prepare_example(
    id: &str,
    features: Tensor,
    names: &[String],
    classes: &ClassMap,
    stride: usize,
) -> Result<Example> {
    let [_, feature_frames] = features.shape[..] else {
        return Err(SegError::Config(format!(
            "example `{id}`: expected a 2-D feature matrix, got shape {:?}", features.shape
        )));
    };
    let labels = names
        .iter()
        .map(|name| {
            classes
                .index_of(name)
                .ok_or_else(|| SegError::UnknownClass { id: id.to_string(), name: name.clone() })
        })
        .collect::<Result<Vec<_>>>()?;

    let frames = feature_frames.min(labels.len());
    if frames == 0 {
        return Err(SegError::EmptyExample { id: id.to_string(), feature_frames, label_frames: labels.len() });
    }
    if feature_frames != labels.len() {
        warn!(id, feature_frames, label_frames = labels.len(), "length mismatch, truncating to {frames}");
    }

    Ok(Example {
        id: id.to_string(),
        features: subsample_frames(&features, frames, stride),
        labels: labels[..frames].iter().step_by(stride).copied().collect(),
    })
}

/// Pad examples into one batch of the longest length.
pub fn pad_batch(examples: &[Example]) -> Result<Batch> {
    let first = examples.first().ok_or(SegError::EmptyBatch)?;
    let dim = first.feature_dim();
    let b = examples.len();
    let t_max = examples.iter().map(Example::frames).max().unwrap_or(0);

    let mut input = Tensor::zeros(&[b, dim, t_max]);
    let mut target = vec![IGNORE_INDEX; b * t_max];
    let mut mask = vec![0.0f32; b * t_max];
    let mut lengths = Vec::with_capacity(b);

    for (i, ex) in examples.iter().enumerate() {
        if ex.feature_dim() != dim {
            return Err(SegError::FeatureDim { id: ex.id.clone(), dim: ex.feature_dim(), expected: dim });
        }
        let t = ex.frames();
        if t == 0 {
            return Err(SegError::EmptyExample { id: ex.id.clone(), feature_frames: 0, label_frames: 0 });
        }
        for c in 0..dim {
            let dst = (i * dim + c) * t_max;
            input.data[dst..dst + t].copy_from_slice(&ex.features.data[c * t..(c + 1) * t]);
        }
        for (j, &label) in ex.labels.iter().enumerate() {
            target[i * t_max + j] = label as i64;
            mask[i * t_max + j] = 1.0;
        }
        lengths.push(t);
    }

    Ok(Batch { ids: examples.iter().map(|e| e.id.clone()).collect(), input, target, mask, lengths })
}

/// Walks a shuffled identifier list and hands out padded batches.
pub struct BatchAssembler<S> {
    source: S,
    classes: ClassMap,
    sample_rate: usize,
    ids: Vec<String>,
    cursor: usize,
    rng: ChaCha8Rng,
}

impl<S: ExampleSource> BatchAssembler<S> {
    /// New assembler with an entropy-seeded shuffle. Use [`Self::with_seed`]
    /// for a reproducible order.
    pub fn new(source: S, classes: ClassMap, sample_rate: usize) -> Result<Self> {
        if sample_rate == 0 {
            return Err(SegError::Config("sample_rate must be >= 1".into()));
        }
        Ok(BatchAssembler {
            source,
            classes,
            sample_rate,
            ids: Vec::new(),
            cursor: 0,
            rng: ChaCha8Rng::from_entropy(),
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    /// Replace the working set and shuffle it.
    pub fn load(&mut self, ids: Vec<String>) {
        self.ids = ids;
        self.cursor = 0;
        self.ids.shuffle(&mut self.rng);
    }

    /// Load the working set from a list file.
    pub fn read_list(&mut self, path: &Path) -> Result<()> {
        let ids = read_list(path)?;
        self.load(ids);
        Ok(())
    }

    /// Rewind and reshuffle; call once per completed epoch.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.ids.shuffle(&mut self.rng);
    }

    pub fn has_next(&self) -> bool {
        self.cursor < self.ids.len()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Consume up to `batch_size` unread examples. Fewer are returned only
    /// when fewer remain; nothing wraps around.
    pub fn next_batch(&mut self, batch_size: usize) -> Result<Batch> {
        if batch_size == 0 || !self.has_next() {
            return Err(SegError::EmptyBatch);
        }
        let end = (self.cursor + batch_size).min(self.ids.len());
        let examples = self.ids[self.cursor..end]
            .iter()
            .map(|id| {
                let features = self.source.features(id)?;
                let names = self.source.labels(id)?;
                prepare_example(id, features, &names, &self.classes, self.sample_rate)
            })
            .collect::<Result<Vec<_>>>()?;
        self.cursor = end;

        let batch = pad_batch(&examples)?;
        debug!(size = batch.size(), t_len = batch.t_len(), remaining = self.ids.len() - end, "batch");
        Ok(batch)
    }
}
