#![allow(dead_code)]

use std::path::{Path, PathBuf};

use cardiocam_core::config::AppConfig;
use cardiocam_core::labels::NUM_CLASSES;
pub use cardiocam_core::test_support::{synthetic_parameters_with_bias, TEST_STAGES as STAGES};
use image::{DynamicImage, ImageFormat, Luma, RgbImage};

pub const WEIGHTS_FILE: &str = "models/synthetic.onnx";

/// Write the artifact under `data_dir` and return a config pointing at it.
pub fn prepare_data_dir(data_dir: &Path, head_bias: [f32; NUM_CLASSES]) -> AppConfig {
    let weights_path = data_dir.join(WEIGHTS_FILE);
    std::fs::create_dir_all(weights_path.parent().expect("weights parent")).expect("models dir");
    synthetic_parameters_with_bias(&STAGES, head_bias)
        .save(&weights_path)
        .expect("write synthetic weights");
    native_config(PathBuf::from(WEIGHTS_FILE))
}

pub fn native_config(weights: PathBuf) -> AppConfig {
    let mut config = AppConfig::default();
    config.model.path = weights;
    config.model.backbone = "native".to_string();
    config.model.stage_channels = STAGES.to_vec();
    config
}

pub fn uniform_gray(size: u32) -> DynamicImage {
    DynamicImage::ImageLuma8(image::ImageBuffer::from_pixel(size, size, Luma([128u8])))
}

/// Left-to-right gradient with a bright patch in the lower right quadrant.
pub fn patterned_image() -> DynamicImage {
    let mut img = RgbImage::new(256, 256);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let base = (x / 2) as u8;
        let value = if x > 150 && y > 150 { 250 } else { base };
        *pixel = image::Rgb([value, value, value]);
    }
    DynamicImage::ImageRgb8(img)
}

pub fn encode(image: &DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut bytes), format)
        .expect("encode image");
    bytes
}
