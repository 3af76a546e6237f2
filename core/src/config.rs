//! Model and training configuration. Immutable after construction.
//!
//! Both structs round-trip through JSON so a run can be described by a file and
//! the model half is embedded in every checkpoint.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SegError};

/// Compute device. Only the host CPU path exists; the enum keeps the
/// configuration surface stable for callers that pass a device string.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
}

impl FromStr for Device {
    type Err = SegError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            other => Err(SegError::UnsupportedDevice(other.to_string())),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
        }
    }
}

/// Network shape.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Total number of stages, including the first one that consumes raw features.
    pub num_stages: usize,
    /// Dilated residual layers per stage; layer `i` uses dilation `2^i`.
    pub num_layers: usize,
    /// Hidden channel width inside every stage.
    pub num_f_maps: usize,
    /// Input feature dimensionality.
    pub features_dim: usize,
    pub num_classes: usize,
}

impl ModelConfig {
    /// The published MS-TCN shape: 4 stages × 10 layers × 64 maps.
    pub fn mstcn(features_dim: usize, num_classes: usize) -> Self {
        ModelConfig {
            num_stages: 4,
            num_layers: 10,
            num_f_maps: 64,
            features_dim,
            num_classes,
        }
    }

    /// Test configuration: tiny model for fast iteration.
    pub fn test_config() -> Self {
        ModelConfig {
            num_stages: 2,
            num_layers: 2,
            num_f_maps: 8,
            features_dim: 4,
            num_classes: 3,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_stages == 0 {
            return Err(SegError::Config("num_stages must be at least 1".into()));
        }
        if self.num_f_maps == 0 || self.features_dim == 0 {
            return Err(SegError::Config("num_f_maps and features_dim must be positive".into()));
        }
        if self.num_classes == 0 {
            return Err(SegError::Config("num_classes must be positive".into()));
        }
        // 2^(num_layers-1) must fit comfortably in usize arithmetic on padding.
        if self.num_layers > 30 {
            return Err(SegError::Config(format!(
                "num_layers={} gives an unreasonable dilation", self.num_layers
            )));
        }
        Ok(())
    }
}

/// Optimisation and data-pipeline settings.
/// Missing fields take their [`Default`] values when deserializing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Temporal subsampling stride applied to features and labels.
    pub sample_rate: usize,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub learning_rate: f32,
    /// Seeds example shuffling, dropout and parameter init.
    pub seed: u64,
    pub device: Device,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            sample_rate: 1,
            batch_size: 1,
            num_epochs: 50,
            learning_rate: 5e-4,
            seed: 1_538_574_472,
            device: Device::Cpu,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(SegError::Config("sample_rate must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(SegError::Config("batch_size must be at least 1".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(SegError::Config(format!(
                "learning_rate must be positive, got {}", self.learning_rate
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_parse() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!(" CPU ".parse::<Device>().unwrap(), Device::Cpu);
        let err = "cuda:0".parse::<Device>().unwrap_err();
        assert!(matches!(err, SegError::UnsupportedDevice(ref d) if d == "cuda:0"));
    }

    #[test]
    fn test_config_validation() {
        assert!(ModelConfig::test_config().validate().is_ok());
        assert!(ModelConfig::mstcn(2048, 19).validate().is_ok());
        let bad = ModelConfig { num_stages: 0, ..ModelConfig::test_config() };
        assert!(bad.validate().is_err());

        assert!(TrainConfig::default().validate().is_ok());
        let bad = TrainConfig { sample_rate: 0, ..TrainConfig::default() };
        assert!(bad.validate().is_err());
        let bad = TrainConfig { learning_rate: f32::NAN, ..TrainConfig::default() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_train_config_device_defaults_when_missing() {
        let json = r#"{"sample_rate":2,"batch_size":4,"num_epochs":3,"learning_rate":0.001,"seed":7}"#;
        let cfg: TrainConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.device, Device::Cpu);
        assert_eq!(cfg.sample_rate, 2);
    }
}
