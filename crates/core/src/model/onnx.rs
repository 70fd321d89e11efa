//! Pretrained backbone executed by ONNX Runtime on the CPU execution provider.
//!
//! The exported graph must expose the last convolutional stage as a named
//! output (`[1, C, h, w]`); the classification head stays in-process so that
//! gradients at that output are available without a training runtime.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result as AnyResult};
use ndarray::{Array3, Axis, Ix4};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use tracing::{debug, info};

use crate::error::{ChdError, Result};
use crate::model::weights;
use crate::model::{Backbone, BackboneKind, Device};
use crate::preprocess::InputTensor;

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub device: Device,
}

/// Build an `ort::Session` for the requested device.
pub fn build_session(config: &SessionConfig<'_>) -> AnyResult<Session> {
    debug!(
        device = config.device.name(),
        model = %config.model_path.display(),
        "Building ONNX Runtime session"
    );

    let session = match config.device {
        Device::Cpu => Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(config.model_path)
            .with_context(|| {
                format!("Failed to load ONNX model: {}", config.model_path.display())
            })?,
    };

    Ok(session)
}

pub struct OnnxBackbone {
    session: Mutex<Session>,
    input_name: String,
    feature_output: String,
    channels: Option<usize>,
}

impl std::fmt::Debug for OnnxBackbone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxBackbone")
            .field("input_name", &self.input_name)
            .field("feature_output", &self.feature_output)
            .field("channels", &self.channels)
            .finish()
    }
}

impl OnnxBackbone {
    pub fn load(model_path: &Path, feature_output: &str, device: Device) -> Result<Self> {
        // The graph declaration is checked before a runtime is involved.
        let inspection = weights::inspect(model_path)
            .map_err(|e| ChdError::ModelLoad(format!("{e:#}")))?;
        let declared = inspection.output(feature_output).ok_or_else(|| {
            ChdError::ModelLoad(format!(
                "graph does not declare the feature output '{feature_output}'"
            ))
        })?;
        if declared.shape.len() != 4 {
            return Err(ChdError::ModelLoad(format!(
                "feature output '{feature_output}' must be rank 4, declared {:?}",
                declared.shape
            )));
        }
        let channels = usize::try_from(declared.shape[1]).ok().filter(|c| *c > 0);

        let session = build_session(&SessionConfig { model_path, device })
            .map_err(|e| ChdError::ModelLoad(format!("{e:#}")))?;

        let input_name = session
            .inputs()
            .first()
            .map(|input| input.name().to_string())
            .ok_or_else(|| ChdError::ModelLoad("ONNX graph has no inputs".to_string()))?;

        info!(
            %input_name,
            feature_output,
            channels = channels.unwrap_or_default(),
            "ONNX backbone ready"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            feature_output: feature_output.to_string(),
            channels,
        })
    }
}

impl Backbone for OnnxBackbone {
    fn kind(&self) -> BackboneKind {
        BackboneKind::Onnx
    }

    fn capture_layer(&self) -> String {
        self.feature_output.clone()
    }

    fn feature_channels(&self) -> Option<usize> {
        self.channels
    }

    fn features(&self, input: &InputTensor) -> Result<Array3<f32>> {
        let tensor = Tensor::from_array(input.view().to_owned())?;

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session.run(ort::inputs![self.input_name.as_str() => &tensor])?;
        let view = outputs[self.feature_output.as_str()].try_extract_array::<f32>()?;

        let batch = view
            .to_owned()
            .into_dimensionality::<Ix4>()
            .map_err(|e| {
                ChdError::Inference(format!(
                    "feature output '{}' is not rank 4: {e}",
                    self.feature_output
                ))
            })?;
        if batch.shape()[0] != 1 {
            return Err(ChdError::Inference(format!(
                "feature output '{}' has batch size {}",
                self.feature_output,
                batch.shape()[0]
            )));
        }
        Ok(batch.index_axis_move(Axis(0), 0))
    }
}
