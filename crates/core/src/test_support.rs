//! Deterministic fixtures shared by unit tests and, through the
//! `test-support` feature, by the integration tests under `tests/`.

use std::path::Path;

use image::{DynamicImage, ImageFormat, RgbImage};
use ndarray::{arr1, Array2, ArrayD, IxDyn};

use crate::labels::NUM_CLASSES;
use crate::model::native::{self, NativeBackbone};
use crate::model::{Classifier, LinearHead, ParameterSet};

pub const TEST_STAGES: [usize; 2] = [4, 8];
pub const TEST_HEAD_BIAS: [f32; NUM_CLASSES] = [0.1, -0.05, 0.0, 0.02];

/// Smooth pseudo-random weights for a native backbone plus the `fc.1` head.
pub fn synthetic_parameters(stage_channels: &[usize]) -> ParameterSet {
    synthetic_parameters_with_bias(stage_channels, TEST_HEAD_BIAS)
}

pub fn synthetic_parameters_with_bias(
    stage_channels: &[usize],
    head_bias: [f32; NUM_CLASSES],
) -> ParameterSet {
    let mut params = ParameterSet::new();
    for (index, (name, shape)) in native::parameter_shapes(stage_channels)
        .into_iter()
        .enumerate()
    {
        let phase = index as f32 * 0.37;
        let len: usize = shape.iter().product();
        let fan_in: usize = shape.iter().skip(1).product();
        let values: Vec<f32> = (0..len)
            .map(|i| {
                let wave = (i as f32 * 0.91 + phase).sin();
                if shape.len() == 4 {
                    wave / (fan_in as f32).sqrt()
                } else if name.ends_with("running_var") {
                    1.0 + 0.2 * wave.abs()
                } else if name.ends_with("running_mean") {
                    0.05 * wave
                } else if name.ends_with(".weight") {
                    1.0 + 0.1 * wave
                } else {
                    0.1 * wave
                }
            })
            .collect();
        let tensor = ArrayD::from_shape_vec(IxDyn(&shape), values).expect("synthetic shape");
        params.insert(name, tensor);
    }

    let channels = *stage_channels.last().expect("at least one stage");
    let weight = Array2::from_shape_fn((NUM_CLASSES, channels), |(c, k)| {
        ((c * channels + k) as f32 * 1.3 + 0.5).sin()
    });
    params.insert("fc.1.weight", weight.into_dyn());
    params.insert("fc.1.bias", arr1(&head_bias).into_dyn());
    params
}

pub fn write_synthetic_weights(path: &Path, stage_channels: &[usize]) {
    synthetic_parameters(stage_channels)
        .save(path)
        .expect("write synthetic weights");
}

pub fn synthetic_classifier() -> Classifier {
    let params = synthetic_parameters(&TEST_STAGES);
    let backbone = NativeBackbone::from_parameters(&params, &TEST_STAGES).expect("backbone");
    let head = LinearHead::from_parameters(&params, "fc.1.weight", "fc.1.bias", None).expect("head");
    Classifier::new(Box::new(backbone), head).expect("classifier")
}

/// A 300×200 RGB image with a bright disc on a darker gradient.
pub fn sample_image() -> DynamicImage {
    let mut img = RgbImage::new(300, 200);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let dx = x as f32 - 180.0;
        let dy = y as f32 - 90.0;
        let base = (x / 3) as u8;
        let value = if dx * dx + dy * dy < 40.0 * 40.0 { 230 } else { base };
        *pixel = image::Rgb([value, value, value]);
    }
    DynamicImage::ImageRgb8(img)
}

pub fn png_bytes(image: &DynamicImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("encode png");
    bytes
}
