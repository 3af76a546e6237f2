//! Data sources: class dictionary, list files, and per-example feature/label
//! loading.
//!
//! The [`ExampleSource`] trait is the seam between the training core and
//! storage. [`DiskSource`] reads the on-disk layout
//!   `<features_dir>/<stem>.npy`  : [feature_dim, frames], f32 or f64
//!   `<gt_dir>/<id>`              : one class name per frame
//! where `stem` is the identifier up to its first `.`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::Array2;
use ndarray_npy::{read_npy, ReadNpyError};

use crate::error::{Result, SegError};
use crate::tensor::Tensor;

/// Contiguous class-name ↔ index dictionary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassMap {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl ClassMap {
    /// Build from names in index order.
    pub fn from_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let mut index = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            if index.insert(name.clone(), i).is_some() {
                return Err(SegError::Config(format!("duplicate class name `{name}`")));
            }
        }
        if names.is_empty() {
            return Err(SegError::Config("class dictionary is empty".into()));
        }
        Ok(ClassMap { names, index })
    }

    /// Parse a mapping file with one `<index> <name>` pair per line. Indices
    /// must cover `0..n` exactly once.
    pub fn from_mapping_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| SegError::io(path, e))?;
        let bad = |reason: String| SegError::Mapping { path: path.to_path_buf(), reason };

        let mut pairs = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(idx), Some(name), None) = (parts.next(), parts.next(), parts.next()) else {
                return Err(bad(format!("line {}: expected `<index> <name>`", lineno + 1)));
            };
            let idx: usize = idx
                .parse()
                .map_err(|_| bad(format!("line {}: `{idx}` is not an index", lineno + 1)))?;
            pairs.push((idx, name.to_string()));
        }

        pairs.sort_by_key(|(i, _)| *i);
        for (expected, (idx, _)) in pairs.iter().enumerate() {
            if *idx != expected {
                return Err(bad(format!("indices are not contiguous from 0 (missing or repeated {expected})")));
            }
        }
        Self::from_names(pairs.into_iter().map(|(_, n)| n)).map_err(|e| bad(e.to_string()))
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn name_of(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Read a list file: one identifier per line, blank lines skipped.
pub fn read_list(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path).map_err(|e| SegError::io(path, e))?;
    Ok(text.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect())
}

/// Identifier up to its first `.`; names the feature file.
pub fn id_stem(id: &str) -> &str {
    id.split('.').next().unwrap_or(id)
}

/// Supplies raw per-example data at original temporal resolution.
pub trait ExampleSource {
    /// Feature matrix, shape [feature_dim, frames].
    fn features(&self, id: &str) -> Result<Tensor>;
    /// Ground-truth class names, one per frame.
    fn labels(&self, id: &str) -> Result<Vec<String>>;
}

impl<S: ExampleSource + ?Sized> ExampleSource for &S {
    fn features(&self, id: &str) -> Result<Tensor> {
        (**self).features(id)
    }

    fn labels(&self, id: &str) -> Result<Vec<String>> {
        (**self).labels(id)
    }
}

/// Filesystem-backed source (see module docs for the layout).
#[derive(Clone, Debug)]
pub struct DiskSource {
    pub features_dir: PathBuf,
    pub gt_dir: PathBuf,
}

impl DiskSource {
    pub fn new(features_dir: impl Into<PathBuf>, gt_dir: impl Into<PathBuf>) -> Self {
        DiskSource { features_dir: features_dir.into(), gt_dir: gt_dir.into() }
    }

    pub fn feature_path(&self, id: &str) -> PathBuf {
        self.features_dir.join(format!("{}.npy", id_stem(id)))
    }

    pub fn label_path(&self, id: &str) -> PathBuf {
        self.gt_dir.join(id)
    }
}

impl ExampleSource for DiskSource {
    fn features(&self, id: &str) -> Result<Tensor> {
        read_feature_matrix(&self.feature_path(id))
    }

    fn labels(&self, id: &str) -> Result<Vec<String>> {
        let path = self.label_path(id);
        let text = fs::read_to_string(&path).map_err(|e| SegError::io(&path, e))?;
        // One line per frame; a blank line is a frame with an empty name.
        Ok(text.lines().map(|l| l.trim().to_string()).collect())
    }
}

/// Load a 2-D `.npy` matrix as a [rows, cols] f32 tensor. `float64` files
/// are narrowed to f32.
pub fn read_feature_matrix(path: &Path) -> Result<Tensor> {
    let npy_err = |source: ReadNpyError| match source {
        ReadNpyError::Io(e) => SegError::io(path, e),
        other => SegError::Npy { path: path.to_path_buf(), source: other },
    };
    let arr: Array2<f32> = match read_npy::<_, Array2<f32>>(path) {
        Ok(a) => a,
        Err(ReadNpyError::WrongDescriptor(_)) => {
            let wide: Array2<f64> = read_npy(path).map_err(npy_err)?;
            wide.mapv(|v| v as f32)
        }
        Err(e) => return Err(npy_err(e)),
    };
    let (rows, cols) = arr.dim();
    // Logical (row-major) iteration order, whatever the file's memory order.
    let data: Vec<f32> = arr.iter().copied().collect();
    Ok(Tensor::from_vec(data, &[rows, cols]))
}

/// In-memory source, keyed by identifier.
#[derive(Clone, Debug, Default)]
pub struct MemorySource {
    entries: HashMap<String, (Tensor, Vec<String>)>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an example. `features` must be [feature_dim, frames].
    pub fn insert(&mut self, id: impl Into<String>, features: Tensor, labels: Vec<String>) {
        self.entries.insert(id.into(), (features, labels));
    }

    fn get(&self, id: &str) -> Result<&(Tensor, Vec<String>)> {
        self.entries.get(id).ok_or_else(|| SegError::Io {
            path: PathBuf::from(id),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "example not registered"),
        })
    }
}

impl ExampleSource for MemorySource {
    fn features(&self, id: &str) -> Result<Tensor> {
        Ok(self.get(id)?.0.clone())
    }

    fn labels(&self, id: &str) -> Result<Vec<String>> {
        Ok(self.get(id)?.1.clone())
    }
}
