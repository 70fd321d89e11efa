//! The classifier: a swappable convolutional backbone, the capture point on
//! its last stage, and the 4-way linear head.

pub mod capture;
pub mod head;
pub mod native;
pub mod onnx;
pub mod weights;

use std::fmt;
use std::path::Path;

use ndarray::Array3;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::ModelConfig;
use crate::error::{ChdError, Result};
use crate::labels::{ChdClass, NUM_CLASSES};
use crate::preprocess::InputTensor;

pub use capture::{CaptureHook, CapturePoint, FeatureRecorder, HookGuard};
pub use head::LinearHead;
pub use native::NativeBackbone;
pub use onnx::OnnxBackbone;
pub use weights::ParameterSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackboneKind {
    Native,
    Onnx,
}

impl BackboneKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "native" | "resnet" => Ok(Self::Native),
            "onnx" => Ok(Self::Onnx),
            other => Err(ChdError::Config(format!(
                "unknown backbone '{other}' (expected native or onnx)"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Onnx => "onnx",
        }
    }
}

impl fmt::Display for BackboneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Execution device. Fixed at construction time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Device {
    #[default]
    Cpu,
}

impl Device {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            other => Err(ChdError::Config(format!(
                "unsupported device '{other}' (only cpu is available)"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
        }
    }
}

/// Feature extractor up to and including the last convolutional stage.
pub trait Backbone: Send + Sync {
    fn kind(&self) -> BackboneKind;

    /// Name of the layer whose output is the capture point.
    fn capture_layer(&self) -> String;

    /// Channel count of the feature map, when known before the first run.
    fn feature_channels(&self) -> Option<usize>;

    /// `[C, h, w]` feature map for one input.
    fn features(&self, input: &InputTensor) -> Result<Array3<f32>>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Logits(pub [f32; NUM_CLASSES]);

impl Logits {
    /// Numerically stable softmax.
    pub fn softmax(&self) -> Probabilities {
        let max = self.0.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut probs = [0.0f32; NUM_CLASSES];
        let mut sum = 0.0f32;
        for (p, logit) in probs.iter_mut().zip(self.0.iter()) {
            *p = (logit - max).exp();
            sum += *p;
        }
        for p in &mut probs {
            *p /= sum;
        }
        Probabilities(probs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Probabilities(pub [f32; NUM_CLASSES]);

impl Probabilities {
    /// Index of the largest probability; the lowest index wins ties.
    pub fn argmax(&self) -> usize {
        let mut best = 0;
        for (i, p) in self.0.iter().enumerate().skip(1) {
            if *p > self.0[best] {
                best = i;
            }
        }
        best
    }

    pub fn predicted(&self) -> ChdClass {
        // argmax is always < NUM_CLASSES.
        ChdClass::from_index(self.argmax()).unwrap_or(ChdClass::Asd)
    }

    /// Largest probability as a percentage, rounded to 2 decimals.
    pub fn confidence(&self) -> f64 {
        let p = f64::from(self.0[self.argmax()]);
        ((p * 100.0 * 100.0).round() / 100.0).clamp(0.0, 100.0)
    }

    pub fn get(&self, class: ChdClass) -> f32 {
        self.0[class.index()]
    }

    pub fn sum(&self) -> f32 {
        self.0.iter().sum()
    }
}

pub struct Classifier {
    backbone: Box<dyn Backbone>,
    head: LinearHead,
    capture: CapturePoint,
}

impl fmt::Debug for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier")
            .field("backbone", &self.backbone.kind())
            .field("capture", &self.capture)
            .field("in_features", &self.head.in_features())
            .finish()
    }
}

impl Classifier {
    pub fn new(backbone: Box<dyn Backbone>, head: LinearHead) -> Result<Self> {
        if let Some(channels) = backbone.feature_channels() {
            head.check_channels(channels)?;
        }
        let capture = CapturePoint::new(backbone.capture_layer());
        Ok(Self {
            backbone,
            head,
            capture,
        })
    }

    /// Construct the configured variant from a weights artifact.
    pub fn load(config: &ModelConfig, weights_path: &Path) -> Result<Self> {
        config.validate()?;
        let device = config.device()?;
        let kind = config.backbone_kind()?;

        if !weights_path.is_file() {
            return Err(ChdError::ModelLoad(format!(
                "weights artifact not found: {}",
                weights_path.display()
            )));
        }

        let params = ParameterSet::from_path(weights_path)?;
        debug!(
            tensors = params.len(),
            params = params.param_count(),
            "Decoded weights artifact"
        );
        let head =
            LinearHead::from_parameters(&params, &config.head_weight, &config.head_bias, None)?;

        let backbone: Box<dyn Backbone> = match kind {
            BackboneKind::Native => Box::new(NativeBackbone::from_parameters(
                &params,
                &config.stage_channels,
            )?),
            BackboneKind::Onnx => Box::new(OnnxBackbone::load(
                weights_path,
                &config.feature_output,
                device,
            )?),
        };

        let classifier = Self::new(backbone, head)?;
        info!(
            backbone = %kind,
            device = device.name(),
            capture_layer = classifier.capture.layer(),
            in_features = classifier.head.in_features(),
            "Classifier loaded"
        );
        Ok(classifier)
    }

    pub fn backbone_kind(&self) -> BackboneKind {
        self.backbone.kind()
    }

    pub fn capture_point(&self) -> &CapturePoint {
        &self.capture
    }

    pub fn feature_channels(&self) -> usize {
        self.head.in_features()
    }

    /// Inference-only pass. No hooks fire and nothing is retained.
    pub fn forward(&self, input: &InputTensor) -> Result<Logits> {
        let features = self.backbone.features(input)?;
        Ok(Logits(self.head.forward(&features)?))
    }

    /// Forward pass that reports the capture-point activation to registered
    /// hooks and keeps the features for [`ForwardGraph::backward`].
    pub fn forward_graph(&self, input: &InputTensor) -> Result<ForwardGraph<'_>> {
        let features = self.backbone.features(input)?;
        self.capture.emit_forward(&features);
        let logits = Logits(self.head.forward(&features)?);
        Ok(ForwardGraph {
            classifier: self,
            features,
            logits,
        })
    }
}

/// Retained state of one [`Classifier::forward_graph`] call.
pub struct ForwardGraph<'a> {
    classifier: &'a Classifier,
    features: Array3<f32>,
    logits: Logits,
}

impl ForwardGraph<'_> {
    pub fn logits(&self) -> Logits {
        self.logits
    }

    pub fn features(&self) -> &Array3<f32> {
        &self.features
    }

    /// Propagate `seed` (∂loss/∂logits) back to the capture point.
    ///
    /// Returns `false` when the capture point is detached and no gradient
    /// was delivered.
    pub fn backward(&self, seed: &[f32; NUM_CLASSES]) -> bool {
        let (_, height, width) = self.features.dim();
        let gradient = self.classifier.head.backward(seed, height, width);
        let delivered = self.classifier.capture.emit_backward(&gradient);
        if !delivered {
            debug!(
                layer = self.classifier.capture.layer(),
                "Backward pass did not reach the capture point"
            );
        }
        delivered
    }
}
