//! Residual convolutional backbone executed in-process with `ndarray`.
//!
//! Topology: a stride-2 3×3 stem, then one residual stage per configured
//! width. Every stage halves the spatial size:
//!
//! ```text
//! x ─ conv1 (3×3, s2) ─ bn1 ─ relu ─ conv2 (3×3) ─ bn2 ─┐
//! └──────────── downsample.conv (1×1, s2) ─ downsample.bn ─ add ─ relu
//! ```
//!
//! Batch-norm parameters are folded into per-channel scale/shift when the
//! weights are loaded, so only running statistics are ever used.

use ndarray::{s, Array1, Array2, Array3, ArrayView3, Ix4};
use tracing::debug;

use crate::error::{ChdError, Result};
use crate::model::weights::ParameterSet;
use crate::model::{Backbone, BackboneKind};
use crate::preprocess::{InputTensor, INPUT_CHANNELS};

const BN_EPSILON: f32 = 1e-5;

#[derive(Debug, Clone)]
struct ConvBn {
    /// `[out, in · k · k]`, rows in (channel, ky, kx) order.
    kernel: Array2<f32>,
    scale: Array1<f32>,
    shift: Array1<f32>,
    size: usize,
    stride: usize,
    padding: usize,
}

impl ConvBn {
    fn load(
        params: &ParameterSet,
        conv: &str,
        bn: &str,
        in_channels: usize,
        out_channels: usize,
        size: usize,
        stride: usize,
    ) -> Result<Self> {
        let weight_name = format!("{conv}.weight");
        let weight = params.require(&weight_name, &[out_channels, in_channels, size, size])?;
        let kernel = weight
            .to_owned()
            .into_dimensionality::<Ix4>()
            .map_err(|e| ChdError::ModelLoad(format!("parameter '{weight_name}': {e}")))?
            .into_shape_with_order((out_channels, in_channels * size * size))
            .map_err(|e| ChdError::ModelLoad(format!("parameter '{weight_name}': {e}")))?;

        let vector = |field: &str| -> Result<Array1<f32>> {
            let name = format!("{bn}.{field}");
            Ok(params
                .require(&name, &[out_channels])?
                .iter()
                .copied()
                .collect())
        };
        let gamma = vector("weight")?;
        let beta = vector("bias")?;
        let mean = vector("running_mean")?;
        let var = vector("running_var")?;

        if var.iter().any(|v| *v < 0.0) {
            return Err(ChdError::ModelLoad(format!(
                "'{bn}.running_var' contains negative variance"
            )));
        }

        let scale = &gamma / &var.mapv(|v| (v + BN_EPSILON).sqrt());
        let shift = &beta - &(&mean * &scale);

        Ok(Self {
            kernel,
            scale,
            shift,
            size,
            stride,
            padding: size / 2,
        })
    }

    fn out_channels(&self) -> usize {
        self.kernel.nrows()
    }

    fn forward(&self, input: ArrayView3<'_, f32>) -> Array3<f32> {
        let (columns, out_h, out_w) = im2col(input, self.size, self.stride, self.padding);
        let mut out = self.kernel.dot(&columns);
        for (mut row, (scale, shift)) in out
            .outer_iter_mut()
            .zip(self.scale.iter().zip(self.shift.iter()))
        {
            row.mapv_inplace(|v| v * scale + shift);
        }
        let channels = self.out_channels();
        // `dot` yields a standard-layout array, so the reshape cannot fail.
        out.into_shape_with_order((channels, out_h, out_w))
            .unwrap_or_else(|_| Array3::zeros((channels, out_h, out_w)))
    }
}

/// Unfold `[C, H, W]` into `[C · k · k, out_h · out_w]` patch columns.
fn im2col(
    input: ArrayView3<'_, f32>,
    size: usize,
    stride: usize,
    padding: usize,
) -> (Array2<f32>, usize, usize) {
    let (channels, height, width) = input.dim();
    let out_h = (height + 2 * padding - size) / stride + 1;
    let out_w = (width + 2 * padding - size) / stride + 1;
    let mut columns = Array2::<f32>::zeros((channels * size * size, out_h * out_w));

    for c in 0..channels {
        let plane = input.slice(s![c, .., ..]);
        for ky in 0..size {
            for kx in 0..size {
                let row = (c * size + ky) * size + kx;
                let mut target = columns.row_mut(row);
                for oy in 0..out_h {
                    let iy = (oy * stride + ky) as isize - padding as isize;
                    if iy < 0 || iy >= height as isize {
                        continue;
                    }
                    for ox in 0..out_w {
                        let ix = (ox * stride + kx) as isize - padding as isize;
                        if ix < 0 || ix >= width as isize {
                            continue;
                        }
                        target[oy * out_w + ox] = plane[[iy as usize, ix as usize]];
                    }
                }
            }
        }
    }

    (columns, out_h, out_w)
}

fn relu_inplace(x: &mut Array3<f32>) {
    x.mapv_inplace(|v| v.max(0.0));
}

#[derive(Debug, Clone)]
struct ResidualStage {
    conv1: ConvBn,
    conv2: ConvBn,
    downsample: ConvBn,
}

impl ResidualStage {
    fn load(params: &ParameterSet, index: usize, in_ch: usize, out_ch: usize) -> Result<Self> {
        let prefix = format!("layer{index}");
        Ok(Self {
            conv1: ConvBn::load(
                params,
                &format!("{prefix}.conv1"),
                &format!("{prefix}.bn1"),
                in_ch,
                out_ch,
                3,
                2,
            )?,
            conv2: ConvBn::load(
                params,
                &format!("{prefix}.conv2"),
                &format!("{prefix}.bn2"),
                out_ch,
                out_ch,
                3,
                1,
            )?,
            downsample: ConvBn::load(
                params,
                &format!("{prefix}.downsample.conv"),
                &format!("{prefix}.downsample.bn"),
                in_ch,
                out_ch,
                1,
                2,
            )?,
        })
    }

    fn forward(&self, input: &Array3<f32>) -> Array3<f32> {
        let mut main = self.conv1.forward(input.view());
        relu_inplace(&mut main);
        let mut out = self.conv2.forward(main.view());
        out += &self.downsample.forward(input.view());
        relu_inplace(&mut out);
        out
    }
}

#[derive(Debug, Clone)]
pub struct NativeBackbone {
    stem: ConvBn,
    stages: Vec<ResidualStage>,
}

impl NativeBackbone {
    /// Build from a parameter set. Stages are named `layer1..=layerN`.
    pub fn from_parameters(params: &ParameterSet, stage_channels: &[usize]) -> Result<Self> {
        let (&stem_channels, _) = stage_channels.split_first().ok_or_else(|| {
            ChdError::Config("native backbone needs at least one stage".to_string())
        })?;

        let stem = ConvBn::load(
            params,
            "stem.conv",
            "stem.bn",
            INPUT_CHANNELS,
            stem_channels,
            3,
            2,
        )?;

        let mut stages = Vec::with_capacity(stage_channels.len());
        let mut in_ch = stem_channels;
        for (i, &out_ch) in stage_channels.iter().enumerate() {
            stages.push(ResidualStage::load(params, i + 1, in_ch, out_ch)?);
            in_ch = out_ch;
        }

        debug!(
            stages = stages.len(),
            channels = in_ch,
            "Native backbone assembled"
        );
        Ok(Self { stem, stages })
    }
}

impl Backbone for NativeBackbone {
    fn kind(&self) -> BackboneKind {
        BackboneKind::Native
    }

    fn capture_layer(&self) -> String {
        format!("layer{}", self.stages.len())
    }

    fn feature_channels(&self) -> Option<usize> {
        Some(
            self.stages
                .last()
                .map_or(self.stem.out_channels(), |stage| stage.conv2.out_channels()),
        )
    }

    fn features(&self, input: &InputTensor) -> Result<Array3<f32>> {
        let mut x = self.stem.forward(input.chw());
        relu_inplace(&mut x);
        for stage in &self.stages {
            x = stage.forward(&x);
        }
        Ok(x)
    }
}

/// Parameter names a native backbone with `stage_channels` reads.
pub fn parameter_shapes(stage_channels: &[usize]) -> Vec<(String, Vec<usize>)> {
    fn conv_bn(
        out: &mut Vec<(String, Vec<usize>)>,
        conv: &str,
        bn: &str,
        shape: [usize; 4],
    ) {
        out.push((format!("{conv}.weight"), shape.to_vec()));
        for field in ["weight", "bias", "running_mean", "running_var"] {
            out.push((format!("{bn}.{field}"), vec![shape[0]]));
        }
    }

    let mut shapes = Vec::new();
    let Some(&stem_channels) = stage_channels.first() else {
        return shapes;
    };
    conv_bn(
        &mut shapes,
        "stem.conv",
        "stem.bn",
        [stem_channels, INPUT_CHANNELS, 3, 3],
    );

    let mut in_ch = stem_channels;
    for (i, &out_ch) in stage_channels.iter().enumerate() {
        let p = format!("layer{}", i + 1);
        conv_bn(
            &mut shapes,
            &format!("{p}.conv1"),
            &format!("{p}.bn1"),
            [out_ch, in_ch, 3, 3],
        );
        conv_bn(
            &mut shapes,
            &format!("{p}.conv2"),
            &format!("{p}.bn2"),
            [out_ch, out_ch, 3, 3],
        );
        conv_bn(
            &mut shapes,
            &format!("{p}.downsample.conv"),
            &format!("{p}.downsample.bn"),
            [out_ch, in_ch, 1, 1],
        );
        in_ch = out_ch;
    }
    shapes
}
