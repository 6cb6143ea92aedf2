use std::fs;
use std::path::Path;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::schema::FeatureSchema;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[cfg(feature = "onnx")]
    #[error("ONNX Runtime error: {0}")]
    OnnxError(#[from] ort::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid feature size: expected {expected}, got {actual}")]
    InvalidFeatureSize { expected: usize, actual: usize },

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error("No output tensor found")]
    NoOutputTensor,

    #[error("Missing ONNX {kind}")]
    MissingIo { kind: &'static str },

    #[error("Model format '{0}' not compiled in (enable the `{0}` feature)")]
    Unsupported(&'static str),
}

/// Per-feature normalisation applied before prediction
pub trait Scaler: Send {
    fn transform(&self, features: &[f64]) -> Result<Vec<f64>, ClassifierError>;
}

/// Pre-trained model mapping a scaled feature vector to a class id
pub trait Classifier: Send {
    fn predict(&mut self, features: &[f64]) -> Result<i64, ClassifierError>;

    /// Input width if the model declares one
    fn input_len(&self) -> Option<usize> {
        None
    }
}

/// Passes features through untouched (stages configured without a scaler)
pub struct IdentityScaler;

impl Scaler for IdentityScaler {
    fn transform(&self, features: &[f64]) -> Result<Vec<f64>, ClassifierError> {
        Ok(features.to_vec())
    }
}

/// `(x - mean) / scale`, as exported from a fitted standard scaler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: Vec<f64>,
    scale: Vec<f64>,
}

impl StandardScaler {
    pub fn new(mean: Vec<f64>, scale: Vec<f64>) -> Result<Self, ClassifierError> {
        if mean.len() != scale.len() {
            return Err(ClassifierError::InvalidModel(format!(
                "scaler has {} means but {} scales",
                mean.len(),
                scale.len()
            )));
        }
        Ok(Self { mean, scale })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ClassifierError> {
        let content = fs::read_to_string(path)?;
        let raw: StandardScaler = serde_json::from_str(&content)?;
        Self::new(raw.mean, raw.scale)
    }

    pub fn len(&self) -> usize {
        self.mean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }
}

impl Scaler for StandardScaler {
    fn transform(&self, features: &[f64]) -> Result<Vec<f64>, ClassifierError> {
        if features.len() != self.mean.len() {
            return Err(ClassifierError::InvalidFeatureSize {
                expected: self.mean.len(),
                actual: features.len(),
            });
        }
        Ok(features
            .iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(x, (mu, s))| {
                // A constant training feature has scale 0.
                let s = if *s == 0.0 { 1.0 } else { *s };
                (x - mu) / s
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Identity,
    Logistic,
    Tanh,
    Relu,
}

impl Activation {
    fn apply(self, x: f64) -> f64 {
        match self {
            Activation::Identity => x,
            Activation::Logistic => logistic(x),
            Activation::Tanh => x.tanh(),
            Activation::Relu => x.max(0.0),
        }
    }
}

fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[derive(Debug, Deserialize)]
struct MlpJson {
    coefs: Vec<Vec<Vec<f64>>>,
    intercepts: Vec<Vec<f64>>,
    activation: Activation,
    classes: Vec<i64>,
}

/// Dense feed-forward network exported as JSON.
///
/// `coefs[l]` is the `inputs x outputs` weight matrix of layer `l`. Hidden layers use
/// `activation`; a single output unit is read as a logistic binary decision between
/// `classes[0]` and `classes[1]`, otherwise the class of the largest output wins.
#[derive(Debug, Clone)]
pub struct MlpClassifier {
    weights: Vec<Array2<f64>>,
    biases: Vec<Array1<f64>>,
    activation: Activation,
    classes: Vec<i64>,
}

impl MlpClassifier {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ClassifierError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, ClassifierError> {
        let raw: MlpJson = serde_json::from_str(json)?;
        if raw.coefs.is_empty() || raw.coefs.len() != raw.intercepts.len() {
            return Err(ClassifierError::InvalidModel(format!(
                "{} weight layers but {} bias layers",
                raw.coefs.len(),
                raw.intercepts.len()
            )));
        }

        let mut weights = Vec::with_capacity(raw.coefs.len());
        let mut biases = Vec::with_capacity(raw.intercepts.len());
        let mut width: Option<usize> = None;

        for (layer, (coef, intercept)) in raw.coefs.into_iter().zip(raw.intercepts).enumerate() {
            let rows = coef.len();
            let cols = coef.first().map_or(0, Vec::len);
            if rows == 0 || cols == 0 || coef.iter().any(|r| r.len() != cols) {
                return Err(ClassifierError::InvalidModel(format!(
                    "layer {layer} weights are not a rectangular matrix"
                )));
            }
            if width.is_some_and(|w| w != rows) || intercept.len() != cols {
                return Err(ClassifierError::InvalidModel(format!(
                    "layer {layer} shape {rows}x{cols} does not chain"
                )));
            }
            width = Some(cols);

            let flat: Vec<f64> = coef.into_iter().flatten().collect();
            let matrix = Array2::from_shape_vec((rows, cols), flat)
                .map_err(|e| ClassifierError::InvalidModel(e.to_string()))?;
            weights.push(matrix);
            biases.push(Array1::from(intercept));
        }

        let outputs = width.unwrap_or(0);
        let expected_classes = if outputs == 1 { 2 } else { outputs };
        if raw.classes.len() != expected_classes {
            return Err(ClassifierError::InvalidModel(format!(
                "{} output units need {} classes, got {}",
                outputs,
                expected_classes,
                raw.classes.len()
            )));
        }

        Ok(Self {
            weights,
            biases,
            activation: raw.activation,
            classes: raw.classes,
        })
    }

    pub fn classes(&self) -> &[i64] {
        &self.classes
    }

    fn forward(&self, features: &[f64]) -> Array1<f64> {
        let last = self.weights.len() - 1;
        let mut h = Array1::from(features.to_vec());
        for (layer, (w, b)) in self.weights.iter().zip(&self.biases).enumerate() {
            h = h.dot(w) + b;
            if layer < last {
                h.mapv_inplace(|x| self.activation.apply(x));
            }
        }
        h
    }
}

/// Class of the highest score, where `scores[i]` belongs to `classes[i]`
fn argmax_class(
    scores: impl IntoIterator<Item = f64>,
    classes: &[i64],
) -> Result<i64, ClassifierError> {
    let (idx, _) = scores
        .into_iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .ok_or(ClassifierError::NoOutputTensor)?;
    classes.get(idx).copied().ok_or_else(|| {
        ClassifierError::InvalidModel(format!(
            "score {idx} has no class ({} classes listed)",
            classes.len()
        ))
    })
}

impl Classifier for MlpClassifier {
    fn predict(&mut self, features: &[f64]) -> Result<i64, ClassifierError> {
        let expected = self.weights[0].nrows();
        if features.len() != expected {
            return Err(ClassifierError::InvalidFeatureSize {
                expected,
                actual: features.len(),
            });
        }

        let out = self.forward(features);
        if out.len() == 1 {
            return Ok(self.classes[usize::from(logistic(out[0]) > 0.5)]);
        }
        argmax_class(out.iter().copied(), &self.classes)
    }

    fn input_len(&self) -> Option<usize> {
        self.weights.first().map(|w| w.nrows())
    }
}

#[cfg(feature = "onnx")]
pub use onnx::OnnxClassifier;

#[cfg(feature = "onnx")]
mod onnx {
    use super::{argmax_class, Classifier, ClassifierError};
    use ort::session::Session;
    use ort::tensor::TensorElementType;
    use ort::value::ValueType;
    use std::path::Path;
    use tracing::info;

    /// ONNX model taking a `[1, n]` float tensor. The first int64 output is read as the
    /// predicted label. Without one, the first output holds class scores and the model
    /// is only accepted together with the class id of every score.
    pub struct OnnxClassifier {
        session: Session,
        input_name: String,
        input_len: Option<usize>,
        output_name: String,
        /// `None` when the model emits labels itself
        score_classes: Option<Vec<i64>>,
    }

    impl OnnxClassifier {
        pub fn new(
            model_path: impl AsRef<Path>,
            classes: Option<&[i64]>,
        ) -> Result<Self, ClassifierError> {
            let model_path = model_path.as_ref();
            let session = Session::builder()?.commit_from_file(model_path)?;

            let input = session
                .inputs
                .first()
                .ok_or(ClassifierError::MissingIo { kind: "input" })?;
            let input_name = input.name.clone();
            let input_len = match &input.input_type {
                ValueType::Tensor { shape, .. } => shape
                    .last()
                    .copied()
                    .filter(|&n| n > 0)
                    .map(|n| n as usize),
                _ => None,
            };

            let label = session.outputs.iter().find(|output| {
                matches!(
                    output.output_type,
                    ValueType::Tensor {
                        ty: TensorElementType::Int64,
                        ..
                    }
                )
            });
            let score_classes = match (label, classes) {
                (Some(_), _) => None,
                (None, Some(classes)) => Some(classes.to_vec()),
                (None, None) => {
                    return Err(ClassifierError::InvalidModel(format!(
                        "{} has no int64 label output; list the class of each score in `classes`",
                        model_path.display()
                    )))
                }
            };
            let output_name = label
                .or_else(|| session.outputs.first())
                .map(|output| output.name.clone())
                .ok_or(ClassifierError::MissingIo { kind: "output" })?;

            info!(
                model = %model_path.display(),
                input = %input_name,
                output = %output_name,
                ?input_len,
                "loaded ONNX model"
            );

            Ok(Self {
                session,
                input_name,
                input_len,
                output_name,
                score_classes,
            })
        }
    }

    impl Classifier for OnnxClassifier {
        fn predict(&mut self, features: &[f64]) -> Result<i64, ClassifierError> {
            let data: Vec<f32> = features.iter().map(|&x| x as f32).collect();
            let input_value = ort::value::Value::from_array((vec![1_usize, data.len()], data))?;

            let outputs = self.session.run(ort::inputs![
                self.input_name.as_str() => &input_value,
            ])?;
            let output = &outputs[self.output_name.as_str()];

            match &self.score_classes {
                None => {
                    let (_, labels) = output.try_extract_tensor::<i64>()?;
                    labels.first().copied().ok_or(ClassifierError::NoOutputTensor)
                }
                Some(classes) => {
                    let (_, scores) = output.try_extract_tensor::<f32>()?;
                    argmax_class(scores.iter().map(|&s| f64::from(s)), classes)
                }
            }
        }

        fn input_len(&self) -> Option<usize> {
            self.input_len
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    /// Dense network JSON, see [`MlpClassifier`]
    #[default]
    Json,
    Onnx,
}

/// Loads a model. `classes` gives the class id behind each score output; JSON models
/// carry their own list, which must then agree.
pub fn load_classifier(
    path: &Path,
    format: ModelFormat,
    classes: Option<&[i64]>,
) -> Result<Box<dyn Classifier>, ClassifierError> {
    match format {
        ModelFormat::Json => {
            let mlp = MlpClassifier::from_file(path)?;
            if let Some(classes) = classes {
                if classes != mlp.classes() {
                    return Err(ClassifierError::InvalidModel(format!(
                        "configured classes {:?} differ from the model's {:?}",
                        classes,
                        mlp.classes()
                    )));
                }
            }
            Ok(Box::new(mlp))
        }
        #[cfg(feature = "onnx")]
        ModelFormat::Onnx => Ok(Box::new(OnnxClassifier::new(path, classes)?)),
        #[cfg(not(feature = "onnx"))]
        ModelFormat::Onnx => {
            let _ = classes;
            Err(ClassifierError::Unsupported("onnx"))
        }
    }
}

/// Which class ids a stage reports for "nothing happening" and for its event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelMap {
    pub no_event: i64,
    pub event: i64,
}

impl LabelMap {
    pub const PRE_FOG: LabelMap = LabelMap {
        no_event: 0,
        event: 2,
    };
    pub const FOG: LabelMap = LabelMap {
        no_event: 0,
        event: 1,
    };
}

/// Scaler, model, input schema and label meaning of one classifier
pub struct ClassifierStage {
    name: String,
    schema: FeatureSchema,
    scaler: Box<dyn Scaler>,
    classifier: Box<dyn Classifier>,
    labels: LabelMap,
}

impl ClassifierStage {
    /// Binds the parts, rejecting a scaler or model whose width disagrees with the schema
    pub fn new(
        name: impl Into<String>,
        schema: FeatureSchema,
        scaler: Box<dyn Scaler>,
        classifier: Box<dyn Classifier>,
        labels: LabelMap,
    ) -> Result<Self, ClassifierError> {
        if let Some(expected) = classifier.input_len() {
            if expected != schema.len() {
                return Err(ClassifierError::InvalidFeatureSize {
                    expected,
                    actual: schema.len(),
                });
            }
        }
        Ok(Self {
            name: name.into(),
            schema,
            scaler,
            classifier,
            labels,
        })
    }

    /// Loads the model and optional scaler artifacts from disk
    pub fn load(
        name: impl Into<String>,
        schema: FeatureSchema,
        model: &Path,
        scaler: Option<&Path>,
        format: ModelFormat,
        classes: Option<&[i64]>,
        labels: LabelMap,
    ) -> Result<Self, ClassifierError> {
        let name = name.into();
        let scaler: Box<dyn Scaler> = match scaler {
            Some(path) => {
                let scaler = StandardScaler::from_file(path)?;
                if scaler.len() != schema.len() {
                    return Err(ClassifierError::InvalidFeatureSize {
                        expected: scaler.len(),
                        actual: schema.len(),
                    });
                }
                Box::new(scaler)
            }
            None => Box::new(IdentityScaler),
        };
        let classifier = load_classifier(model, format, classes)?;
        info!(stage = %name, model = %model.display(), features = schema.len(), "classifier stage loaded");
        Self::new(name, schema, scaler, classifier, labels)
    }

    /// Scales then predicts; returns the raw class id
    pub fn predict(&mut self, features: &[f64]) -> Result<i64, ClassifierError> {
        if features.len() != self.schema.len() {
            return Err(ClassifierError::InvalidFeatureSize {
                expected: self.schema.len(),
                actual: features.len(),
            });
        }
        let scaled = self.scaler.transform(features)?;
        self.classifier.predict(&scaled)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn labels(&self) -> LabelMap {
        self.labels
    }
}
