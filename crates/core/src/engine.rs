//! Inference facade: preprocess → classify → localize → composite.

use std::path::Path;
use std::time::Instant;

use image::DynamicImage;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::composite::{self, Overlay};
use crate::config::AppConfig;
use crate::error::{ChdError, Result};
use crate::labels::ChdClass;
use crate::localize::GradCam;
use crate::model::weights::sha256_hex;
use crate::model::{BackboneKind, Classifier, Probabilities};
use crate::preprocess::{decode_image, InputTensor, Preprocessor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredictOptions {
    pub explain: bool,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self { explain: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionRecord {
    pub label: ChdClass,
    /// Percentage in `[0, 100]`, rounded to 2 decimals.
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay: Option<Overlay>,
    #[serde(skip)]
    pub probabilities: Probabilities,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub backbone: BackboneKind,
    pub capture_layer: String,
    pub feature_channels: usize,
    pub classes: Vec<ChdClass>,
    pub preprocessing: &'static str,
    pub explain_enabled: bool,
    pub weights_sha256: String,
}

/// A loaded, ready-to-serve model. Construction failure is terminal.
#[derive(Debug)]
pub struct InferenceEngine {
    preprocessor: Preprocessor,
    classifier: Classifier,
    localizer: GradCam,
    explain_enabled: bool,
    summary: ModelSummary,
}

impl InferenceEngine {
    /// Load the configured model. Relative weights paths resolve against
    /// `data_dir`.
    pub fn load(config: &AppConfig, data_dir: &Path) -> Result<Self> {
        let strategy = config.preprocess.strategy()?;
        config.model.validate()?;

        let weights_path = config.model_path(data_dir);
        info!(path = %weights_path.display(), "Loading weights artifact");
        let started = Instant::now();

        let classifier = Classifier::load(&config.model, &weights_path)?;
        let digest = std::fs::read(&weights_path)
            .map(|bytes| sha256_hex(&bytes))
            .map_err(|e| ChdError::ModelLoad(format!("failed to hash weights artifact: {e}")))?;

        let engine = Self::from_parts(
            Preprocessor::new(strategy),
            classifier,
            config.explain.enabled,
            digest,
        );
        info!(
            backbone = %engine.summary.backbone,
            preprocessing = engine.summary.preprocessing,
            explain = engine.explain_enabled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Inference engine ready"
        );
        Ok(engine)
    }

    pub fn from_parts(
        preprocessor: Preprocessor,
        classifier: Classifier,
        explain_enabled: bool,
        weights_sha256: String,
    ) -> Self {
        let summary = ModelSummary {
            backbone: classifier.backbone_kind(),
            capture_layer: classifier.capture_point().layer().to_string(),
            feature_channels: classifier.feature_channels(),
            classes: ChdClass::ALL.to_vec(),
            preprocessing: preprocessor.strategy().name(),
            explain_enabled,
            weights_sha256,
        };
        Self {
            preprocessor,
            classifier,
            localizer: GradCam::new(),
            explain_enabled,
            summary,
        }
    }

    pub fn summary(&self) -> &ModelSummary {
        &self.summary
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn default_options(&self) -> PredictOptions {
        PredictOptions {
            explain: self.explain_enabled,
        }
    }

    pub fn predict(&self, image: &DynamicImage) -> Result<PredictionRecord> {
        self.predict_with(image, self.default_options())
    }

    /// Decode then predict. Undecodable bytes fail with `InvalidImage`.
    pub fn predict_bytes(
        &self,
        bytes: &[u8],
        options: PredictOptions,
    ) -> Result<PredictionRecord> {
        let image = decode_image(bytes)?;
        self.predict_with(&image, options)
    }

    pub fn predict_with(
        &self,
        image: &DynamicImage,
        options: PredictOptions,
    ) -> Result<PredictionRecord> {
        let started = Instant::now();
        let input = self.preprocessor.transform(image)?;

        let probabilities = self.classifier.forward(&input)?.softmax();
        let label = probabilities.predicted();
        let confidence = probabilities.confidence();

        let overlay = if options.explain {
            self.explain(&input, image, label)
        } else {
            None
        };

        debug!(
            label = %label,
            confidence,
            overlay = overlay.is_some(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Prediction complete"
        );

        Ok(PredictionRecord {
            label,
            confidence,
            overlay,
            probabilities,
        })
    }

    // Localization and rendering failures drop the overlay only.
    fn explain(
        &self,
        input: &InputTensor,
        image: &DynamicImage,
        label: ChdClass,
    ) -> Option<Overlay> {
        let rendered = self
            .localizer
            .compute(&self.classifier, input, label)
            .and_then(|map| composite::render(&map, image));
        match rendered {
            Ok(overlay) => Some(overlay),
            Err(err) => {
                warn!(
                    error = %err,
                    code = err.code(),
                    "Explanation unavailable; returning prediction without overlay"
                );
                None
            }
        }
    }
}
