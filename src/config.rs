//! Pipeline configuration loaded from TOML.
//!
//! Every field has a default matching the reference deployment, so an empty file (or
//! no file) yields a runnable dual-foot pipeline.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::classifier::{ClassifierError, ClassifierStage, LabelMap, ModelFormat};
use crate::feature_extractor::FeatureExtractor;
use crate::frame_decoder::FrameDecoder;
use crate::fusion::ClassifierFusion;
use crate::schema::{
    default_fog_features, default_pre_fog_features, ChannelLayout, FeatureSchema, FeatureSpec,
    SchemaError,
};
use crate::spectral::BandLimits;
use crate::types::{MSG_LEN, SAMPLE_RATE, TEST_RATE, WIN_SIZE};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid feature schema for {stage}: {source}")]
    Schema {
        stage: &'static str,
        source: SchemaError,
    },

    #[error("Failed to load {stage} classifier: {source}")]
    Stage {
        stage: &'static str,
        source: ClassifierError,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub window: WindowConfig,
    pub bands: BandConfig,
    pub layout: ChannelLayout,
    pub frame: FrameConfig,
    pub transport: TransportConfig,
    pub pre_fog: StageConfig,
    pub fog: StageConfig,

    /// Directory relative artifact paths are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Samples per window
    pub size: usize,
    pub sample_rate_hz: f64,
    /// Decisions per second
    pub test_rate_hz: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandConfig {
    pub locomotion: BandLimits,
    pub freeze: BandLimits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    pub msg_len: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Sensor stream endpoint (text lines or raw frames)
    pub data_addr: String,
    pub imu_topic: String,
    /// Where decisions are published
    pub predict_addr: String,
    pub predict_topic: String,
    pub poll_interval_ms: u64,
    /// BlueZ device and GATT characteristic for the `ble` source
    pub ble_device: Option<String>,
    pub ble_characteristic: Option<String>,
}

/// One classifier stage. A stage table that is present must name its model; features
/// and labels fall back to the stage defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub model: Option<PathBuf>,
    /// Standard scaler JSON; without one features reach the model unscaled
    pub scaler: Option<PathBuf>,
    #[serde(default)]
    pub format: ModelFormat,
    pub no_event: Option<i64>,
    pub event: Option<i64>,
    /// Class id of each score output, for ONNX models without a label output
    pub classes: Option<Vec<i64>>,
    pub features: Option<Vec<FeatureSpec>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    PreFog,
    Fog,
}

impl StageKind {
    pub fn name(self) -> &'static str {
        match self {
            StageKind::PreFog => "pre_fog",
            StageKind::Fog => "fog",
        }
    }

    fn default_labels(self) -> LabelMap {
        match self {
            StageKind::PreFog => LabelMap::PRE_FOG,
            StageKind::Fog => LabelMap::FOG,
        }
    }

    fn default_features(self) -> Vec<FeatureSpec> {
        match self {
            StageKind::PreFog => default_pre_fog_features(),
            StageKind::Fog => default_fog_features(),
        }
    }
}

fn default_true() -> bool {
    true
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size: WIN_SIZE,
            sample_rate_hz: SAMPLE_RATE,
            test_rate_hz: TEST_RATE,
        }
    }
}

impl Default for BandConfig {
    fn default() -> Self {
        Self {
            locomotion: BandLimits::LOCOMOTION,
            freeze: BandLimits::FREEZE,
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self { msg_len: MSG_LEN }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            data_addr: "127.0.0.1:5556".to_string(),
            imu_topic: "imu".to_string(),
            predict_addr: "127.0.0.1:5557".to_string(),
            predict_topic: "ps".to_string(),
            poll_interval_ms: 100,
            ble_device: None,
            ble_characteristic: None,
        }
    }
}

impl StageConfig {
    fn with_default_artifacts(kind: StageKind) -> Self {
        Self {
            enabled: true,
            model: Some(PathBuf::from(format!("models/{}_model.json", kind.name()))),
            scaler: Some(PathBuf::from(format!("models/{}_scaler.json", kind.name()))),
            format: ModelFormat::Json,
            no_event: None,
            event: None,
            classes: None,
            features: None,
        }
    }

    pub fn labels(&self, kind: StageKind) -> LabelMap {
        let defaults = kind.default_labels();
        LabelMap {
            no_event: self.no_event.unwrap_or(defaults.no_event),
            event: self.event.unwrap_or(defaults.event),
        }
    }

    pub fn feature_specs(&self, kind: StageKind) -> Vec<FeatureSpec> {
        self.features
            .clone()
            .unwrap_or_else(|| kind.default_features())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            bands: BandConfig::default(),
            layout: ChannelLayout::default(),
            frame: FrameConfig::default(),
            transport: TransportConfig::default(),
            pre_fog: StageConfig::with_default_artifacts(StageKind::PreFog),
            fog: StageConfig::with_default_artifacts(StageKind::Fog),
            base_dir: PathBuf::from("."),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from file; artifact paths become relative to its directory
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: PipelineConfig = toml::from_str(&content)?;
        config.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(config)
    }

    /// Loads `path` if given, otherwise the defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let window = &self.window;
        if window.size < 2 {
            return Err(invalid(format!("window.size must be at least 2, got {}", window.size)));
        }
        for (name, rate) in [
            ("window.sample_rate_hz", window.sample_rate_hz),
            ("window.test_rate_hz", window.test_rate_hz),
        ] {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(invalid(format!("{name} must be positive, got {rate}")));
            }
        }
        let step = self.step_size();
        if step == 0 || step > window.size {
            return Err(invalid(format!(
                "step size {step} (sample rate / test rate) must be between 1 and the window size {}",
                window.size
            )));
        }

        for (name, band) in [
            ("bands.locomotion", self.bands.locomotion),
            ("bands.freeze", self.bands.freeze),
        ] {
            if !(band.low_hz >= 0.0 && band.low_hz < band.high_hz) {
                return Err(invalid(format!(
                    "{name} needs 0 <= low_hz < high_hz, got {}..{}",
                    band.low_hz, band.high_hz
                )));
            }
        }

        FrameDecoder::with_msg_len(self.frame.msg_len).map_err(|e| invalid(e.to_string()))?;

        if self.layout.is_empty() {
            return Err(invalid("layout.channels is empty".to_string()));
        }
        self.layout.validate().map_err(|source| ConfigError::Schema {
            stage: "layout",
            source,
        })?;

        if self.transport.poll_interval_ms == 0 {
            return Err(invalid("transport.poll_interval_ms must be positive".to_string()));
        }

        if !self.fog.enabled {
            return Err(invalid("the fog stage cannot be disabled".to_string()));
        }
        for kind in [StageKind::PreFog, StageKind::Fog] {
            let stage = self.stage(kind);
            if !stage.enabled {
                continue;
            }
            if stage.model.is_none() {
                return Err(invalid(format!("{}.model is required", kind.name())));
            }
            self.schema(kind)?;
        }
        Ok(())
    }

    /// Samples consumed per decision, `trunc(sample_rate / test_rate)`
    pub fn step_size(&self) -> usize {
        (self.window.sample_rate_hz / self.window.test_rate_hz) as usize
    }

    /// Time between decisions
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.window.test_rate_hz)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.transport.poll_interval_ms)
    }

    pub fn stage(&self, kind: StageKind) -> &StageConfig {
        match kind {
            StageKind::PreFog => &self.pre_fog,
            StageKind::Fog => &self.fog,
        }
    }

    pub fn schema(&self, kind: StageKind) -> Result<FeatureSchema, ConfigError> {
        let specs = self.stage(kind).feature_specs(kind);
        FeatureSchema::compile(&specs, &self.layout).map_err(|source| ConfigError::Schema {
            stage: kind.name(),
            source,
        })
    }

    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn feature_extractor(&self) -> FeatureExtractor {
        FeatureExtractor::new(
            self.window.sample_rate_hz,
            self.bands.locomotion,
            self.bands.freeze,
        )
    }

    pub fn frame_decoder(&self) -> Result<FrameDecoder, ConfigError> {
        FrameDecoder::with_msg_len(self.frame.msg_len).map_err(|e| invalid(e.to_string()))
    }

    /// Loads one classifier stage; `None` when the stage is disabled
    pub fn load_stage(&self, kind: StageKind) -> Result<Option<ClassifierStage>, ConfigError> {
        let stage = self.stage(kind);
        if !stage.enabled {
            return Ok(None);
        }
        let model = stage
            .model
            .as_deref()
            .ok_or_else(|| invalid(format!("{}.model is required", kind.name())))?;
        let scaler = stage.scaler.as_deref().map(|p| self.resolve_path(p));

        ClassifierStage::load(
            kind.name(),
            self.schema(kind)?,
            &self.resolve_path(model),
            scaler.as_deref(),
            stage.format,
            stage.classes.as_deref(),
            stage.labels(kind),
        )
        .map(Some)
        .map_err(|source| ConfigError::Stage {
            stage: kind.name(),
            source,
        })
    }

    /// Loads every enabled stage; any artifact failure is an error
    pub fn load_fusion(&self) -> Result<ClassifierFusion, ConfigError> {
        let pre_fog = self.load_stage(StageKind::PreFog)?;
        let fog = self
            .load_stage(StageKind::Fog)?
            .ok_or_else(|| invalid("the fog stage cannot be disabled".to_string()))?;
        Ok(ClassifierFusion::new(pre_fog, fog))
    }
}

fn invalid(message: String) -> ConfigError {
    ConfigError::Invalid(message)
}
