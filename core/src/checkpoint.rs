//! Per-epoch checkpoints.
//!
//! Epoch `N` is stored as two JSON files in one directory:
//!   `epoch-N.model`: model config + parameters
//!   `epoch-N.opt`: optimizer config + moments + step
//! Writes go to a `<name>.tmp` sibling first and are renamed into place, so a
//! crash mid-write never leaves a truncated checkpoint under the real name.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::adam::Adam;
use crate::error::{Result, SegError};
use crate::model::MultiStageModel;

#[derive(Clone, Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CheckpointStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn model_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("epoch-{epoch}.model"))
    }

    pub fn optimizer_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("epoch-{epoch}.opt"))
    }

    /// Persist model and optimizer state for `epoch`.
    pub fn save(&self, epoch: usize, model: &MultiStageModel, optimizer: &Adam) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| SegError::io(&self.dir, e))?;
        write_json(&self.model_path(epoch), model)?;
        write_json(&self.optimizer_path(epoch), optimizer)
    }

    pub fn load_model(&self, epoch: usize) -> Result<MultiStageModel> {
        let path = self.model_path(epoch);
        let model: MultiStageModel = read_json(&path)?;
        // Buffers must match what the stored config declares.
        let reference = MultiStageModel::init(&model.config, 0)
            .map_err(|e| SegError::Checkpoint { path: path.clone(), reason: e.to_string() })?;
        reference
            .check_compatible(&model)
            .map_err(|reason| SegError::Checkpoint { path, reason })?;
        Ok(model)
    }

    /// Load the optimizer state for `epoch`, checked against `model`.
    pub fn load_optimizer(&self, epoch: usize, model: &MultiStageModel) -> Result<Adam> {
        let path = self.optimizer_path(epoch);
        let opt: Adam = read_json(&path)?;
        opt.check_compatible(model).map_err(|reason| SegError::Checkpoint { path, reason })?;
        Ok(opt)
    }

    /// Highest epoch with a model file in the directory, if any.
    pub fn latest_epoch(&self) -> Result<Option<usize>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SegError::io(&self.dir, e)),
        };
        let mut latest = None;
        for entry in entries {
            let entry = entry.map_err(|e| SegError::io(&self.dir, e))?;
            let name = entry.file_name();
            let epoch = name
                .to_str()
                .and_then(|n| n.strip_prefix("epoch-"))
                .and_then(|n| n.strip_suffix(".model"))
                .and_then(|n| n.parse::<usize>().ok());
            latest = latest.max(epoch);
        }
        Ok(latest)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string(value)
        .map_err(|e| SegError::Checkpoint { path: path.to_path_buf(), reason: e.to_string() })?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, json).map_err(|e| SegError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| SegError::io(path, e))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let json = fs::read_to_string(path).map_err(|e| SegError::io(path, e))?;
    serde_json::from_str(&json).map_err(|e| SegError::Checkpoint { path: path.to_path_buf(), reason: e.to_string() })
}
