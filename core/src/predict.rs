//! Inference: one class name per original frame, one output file per example.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::batch::subsample_frames;
use crate::checkpoint::CheckpointStore;
use crate::dataset::{ClassMap, ExampleSource};
use crate::error::{Result, SegError};
use crate::model::MultiStageModel;
use crate::stage::Mode;
use crate::tensor::{argmax_channels, Tensor};

pub struct Predictor {
    model: MultiStageModel,
    classes: ClassMap,
    sample_rate: usize,
}

impl Predictor {
    pub fn new(model: MultiStageModel, classes: ClassMap, sample_rate: usize) -> Result<Self> {
        if sample_rate == 0 {
            return Err(SegError::Config("sample_rate must be >= 1".into()));
        }
        if classes.len() != model.config.num_classes {
            return Err(SegError::Config(format!(
                "class dictionary has {} names, model predicts {} classes",
                classes.len(),
                model.config.num_classes
            )));
        }
        Ok(Predictor { model, classes, sample_rate })
    }

    /// Predictor over the parameters saved after `epoch`.
    pub fn load(store: &CheckpointStore, epoch: usize, classes: ClassMap, sample_rate: usize) -> Result<Self> {
        Self::new(store.load_model(epoch)?, classes, sample_rate)
    }

    pub fn model(&self) -> &MultiStageModel {
        &self.model
    }

    /// Label every frame of a [feature_dim, frames] matrix.
    ///
    /// The network sees every `sample_rate`-th frame; each decoded label is
    /// repeated `sample_rate` times and the result cut to `frames`.
    pub fn decode(&self, features: &Tensor) -> Result<Vec<String>> {
        self.decode_example("<input>", features)
    }

    fn decode_example(&self, id: &str, features: &Tensor) -> Result<Vec<String>> {
        let [dim, frames] = features.shape[..] else {
            return Err(SegError::Config(format!(
                "example `{id}`: expected a 2-D feature matrix, got shape {:?}", features.shape
            )));
        };
        let expected = self.model.config.features_dim;
        if dim != expected {
            return Err(SegError::FeatureDim { id: id.to_string(), dim, expected });
        }
        if frames == 0 {
            return Ok(Vec::new());
        }

        let sub = subsample_frames(features, frames, self.sample_rate);
        let t_len = sub.shape[1];
        let input = Tensor::from_vec(sub.data, &[1, dim, t_len]);
        let (outputs, _) = self.model.forward(&input, &vec![1.0; t_len], &mut Mode::Eval)?;
        let Some(last) = outputs.last() else {
            return Ok(Vec::new());
        };

        let c = self.model.config.num_classes;
        let mut labels = Vec::with_capacity(frames);
        for class in argmax_channels(&last.data, c, t_len) {
            let name = self.classes.name_of(class).ok_or(SegError::UnknownIndex(class))?;
            labels.extend(std::iter::repeat(name.to_string()).take(self.sample_rate));
        }
        labels.truncate(frames);
        Ok(labels)
    }

    /// Decode every identifier in `ids` and write `<results_dir>/<name>.txt`
    /// for each, `name` being the identifier minus its last extension. Returns the written paths in input order.
    pub fn predict<S: ExampleSource>(&self, ids: &[String], source: &S, results_dir: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(results_dir).map_err(|e| SegError::io(results_dir, e))?;
        let mut written = Vec::with_capacity(ids.len());
        for id in ids {
            let features = source.features(id)?;
            let labels = self.decode_example(id, &features)?;

            let mut text = labels.join("\n");
            if !text.is_empty() {
                text.push('\n');
            }
            let path = results_dir.join(output_name(id));
            fs::write(&path, text).map_err(|e| SegError::io(&path, e))?;
            info!(id = %id, frames = labels.len(), path = %path.display(), "predicted");
            written.push(path);
        }
        Ok(written)
    }
}

/// `<id without its last extension>.txt`.
fn output_name(id: &str) -> String {
    let stem = Path::new(id).file_stem().and_then(|s| s.to_str()).unwrap_or(id);
    format!("{stem}.txt")
}
