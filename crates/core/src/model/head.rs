use ndarray::{Array1, Array2, Array3, Axis, Ix1, Ix2};

use crate::error::{ChdError, Result};
use crate::labels::NUM_CLASSES;
use crate::model::weights::ParameterSet;

/// Classification head: global average pooling followed by a linear layer.
///
/// The dropout that precedes the linear layer at training time is the
/// identity here, so it has no parameters and no code.
#[derive(Debug, Clone)]
pub struct LinearHead {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl LinearHead {
    pub fn new(weight: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        if weight.nrows() != NUM_CLASSES || bias.len() != NUM_CLASSES {
            return Err(ChdError::ModelLoad(format!(
                "classification head must produce {NUM_CLASSES} outputs, got weight {:?} and bias {:?}",
                weight.shape(),
                bias.shape()
            )));
        }
        Ok(Self { weight, bias })
    }

    /// Read `[4, C]` weight and `[4]` bias. `channels` is the backbone's
    /// feature width when known up front.
    pub fn from_parameters(
        params: &ParameterSet,
        weight_name: &str,
        bias_name: &str,
        channels: Option<usize>,
    ) -> Result<Self> {
        let weight = params
            .get(weight_name)
            .ok_or_else(|| ChdError::ModelLoad(format!("missing parameter '{weight_name}'")))?
            .clone()
            .into_dimensionality::<Ix2>()
            .map_err(|_| {
                ChdError::ModelLoad(format!("parameter '{weight_name}' must be two-dimensional"))
            })?;
        let bias = params
            .get(bias_name)
            .ok_or_else(|| ChdError::ModelLoad(format!("missing parameter '{bias_name}'")))?
            .clone()
            .into_dimensionality::<Ix1>()
            .map_err(|_| {
                ChdError::ModelLoad(format!("parameter '{bias_name}' must be one-dimensional"))
            })?;

        let head = Self::new(weight, bias)?;
        if let Some(expected) = channels {
            head.check_channels(expected)?;
        }
        Ok(head)
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn check_channels(&self, channels: usize) -> Result<()> {
        if self.in_features() != channels {
            return Err(ChdError::ModelLoad(format!(
                "classification head expects {} feature channels, backbone produces {channels}",
                self.in_features()
            )));
        }
        Ok(())
    }

    pub fn forward(&self, features: &Array3<f32>) -> Result<[f32; NUM_CLASSES]> {
        self.check_features(features)?;
        let pooled = features
            .mean_axis(Axis(2))
            .and_then(|m| m.mean_axis(Axis(1)))
            .ok_or_else(|| ChdError::Inference("feature map has no spatial extent".to_string()))?;

        let out = self.weight.dot(&pooled) + &self.bias;
        let mut logits = [0.0f32; NUM_CLASSES];
        for (slot, value) in logits.iter_mut().zip(out.iter()) {
            *slot = *value;
        }
        Ok(logits)
    }

    /// Gradient of `seed · logits` with respect to a `[C, h, w]` feature map.
    ///
    /// Through GAP and the linear layer every spatial position of channel
    /// `k` receives `Σ_c seed[c] · W[c, k] / (h · w)`.
    pub fn backward(&self, seed: &[f32; NUM_CLASSES], height: usize, width: usize) -> Array3<f32> {
        let area = (height * width).max(1) as f32;
        let seed = Array1::from(seed.to_vec());
        let per_channel = seed.dot(&self.weight) / area;

        let mut grad = Array3::<f32>::zeros((self.in_features(), height, width));
        for (mut plane, value) in grad.outer_iter_mut().zip(per_channel.iter()) {
            plane.fill(*value);
        }
        grad
    }

    fn check_features(&self, features: &Array3<f32>) -> Result<()> {
        let channels = features.shape()[0];
        if channels != self.in_features() {
            return Err(ChdError::Inference(format!(
                "feature map has {channels} channels, head expects {}",
                self.in_features()
            )));
        }
        Ok(())
    }
}
