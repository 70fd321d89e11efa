//! Image → classifier input tensor.
//!
//! Two strategies share one pipeline (resize, channel layout, normalization)
//! and are fixed when the engine is built:
//!
//! - [`PreprocessStrategy::Grayscale`]: luma replicated to 3 channels,
//!   symmetric normalization (mean 0.5, std 0.5).
//! - [`PreprocessStrategy::ImageNet`]: RGB with optional CLAHE applied at
//!   source resolution, ImageNet mean/std normalization.

pub mod clahe;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, GrayImage, Luma, RgbImage};
use ndarray::{Array4, ArrayView3, ArrayView4, Axis};
use tracing::debug;

use crate::error::{ChdError, Result};

/// Spatial size of the classifier input (square).
pub const INPUT_SIZE: usize = 224;
pub const INPUT_CHANNELS: usize = 3;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
const SYMMETRIC_MEAN: f32 = 0.5;
const SYMMETRIC_STD: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClaheParams {
    pub clip_limit: f32,
    pub tile_grid: usize,
}

impl Default for ClaheParams {
    fn default() -> Self {
        Self {
            clip_limit: 2.0,
            tile_grid: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PreprocessStrategy {
    Grayscale,
    ImageNet { clahe: Option<ClaheParams> },
}

impl PreprocessStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Grayscale => "grayscale",
            Self::ImageNet { clahe: None } => "imagenet",
            Self::ImageNet { clahe: Some(_) } => "imagenet+clahe",
        }
    }
}

/// Normalized `[1, 3, 224, 224]` tensor owned by a single prediction call.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor(Array4<f32>);

impl InputTensor {
    pub fn from_array(array: Array4<f32>) -> Result<Self> {
        let expected = [1, INPUT_CHANNELS, INPUT_SIZE, INPUT_SIZE];
        if array.shape() != expected {
            return Err(ChdError::Inference(format!(
                "input tensor shape {:?} does not match {:?}",
                array.shape(),
                expected
            )));
        }
        Ok(Self(array))
    }

    pub fn zeros() -> Self {
        Self(Array4::zeros((1, INPUT_CHANNELS, INPUT_SIZE, INPUT_SIZE)))
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.0.view()
    }

    /// The single image as `[C, H, W]`.
    pub fn chw(&self) -> ArrayView3<'_, f32> {
        self.0.index_axis(Axis(0), 0)
    }

    pub fn into_array(self) -> Array4<f32> {
        self.0
    }
}

/// Decode an encoded raster (PNG, JPEG, BMP, TIFF, WebP).
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    if bytes.is_empty() {
        return Err(ChdError::InvalidImage("empty image payload".to_string()));
    }
    let image = image::load_from_memory(bytes)
        .map_err(|e| ChdError::InvalidImage(format!("failed to decode image: {e}")))?;
    ensure_extent(&image)?;
    Ok(image)
}

pub fn ensure_extent(image: &DynamicImage) -> Result<()> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(ChdError::InvalidImage(format!(
            "image has zero spatial extent ({width}x{height})"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    strategy: PreprocessStrategy,
}

impl Preprocessor {
    pub fn new(strategy: PreprocessStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> PreprocessStrategy {
        self.strategy
    }

    /// Produce the classifier input. The source image is never modified.
    pub fn transform(&self, image: &DynamicImage) -> Result<InputTensor> {
        ensure_extent(image)?;
        let (width, height) = image.dimensions();
        debug!(
            width,
            height,
            strategy = self.strategy.name(),
            "Preprocessing image"
        );

        let tensor = match self.strategy {
            PreprocessStrategy::Grayscale => {
                let luma = resize_gray(&luma_itu601(image));
                grayscale_tensor(&luma)
            }
            PreprocessStrategy::ImageNet { clahe } => {
                let rgb = image.to_rgb8();
                let rgb = match clahe {
                    Some(params) => clahe::equalize_rgb(&rgb, params),
                    None => rgb,
                };
                imagenet_tensor(&resize_rgb(&rgb))
            }
        };

        InputTensor::from_array(tensor)
    }
}

/// Gray conversion with ITU-R 601-2 weights (299/587/114) in 16-bit fixed
/// point, rounding to nearest. The `image` crate's own conversion uses
/// Rec. 709 weights, which the classifier was not trained on.
pub fn luma_itu601(image: &DynamicImage) -> GrayImage {
    if let DynamicImage::ImageLuma8(gray) = image {
        return gray.clone();
    }
    let rgb = image.to_rgb8();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let weighted = u32::from(r) * 19595 + u32::from(g) * 38470 + u32::from(b) * 7471;
        Luma([((weighted + 0x8000) >> 16) as u8])
    })
}

fn resize_gray(image: &GrayImage) -> GrayImage {
    let size = INPUT_SIZE as u32;
    if image.dimensions() == (size, size) {
        return image.clone();
    }
    imageops::resize(image, size, size, FilterType::Triangle)
}

/// Bilinear resize of an RGB raster to the classifier's input size.
pub fn resize_rgb(image: &RgbImage) -> RgbImage {
    let size = INPUT_SIZE as u32;
    if image.dimensions() == (size, size) {
        return image.clone();
    }
    imageops::resize(image, size, size, FilterType::Triangle)
}

fn grayscale_tensor(luma: &GrayImage) -> Array4<f32> {
    let mut tensor = Array4::<f32>::zeros((1, INPUT_CHANNELS, INPUT_SIZE, INPUT_SIZE));
    for (x, y, pixel) in luma.enumerate_pixels() {
        let value = (pixel.0[0] as f32 / 255.0 - SYMMETRIC_MEAN) / SYMMETRIC_STD;
        for c in 0..INPUT_CHANNELS {
            tensor[[0, c, y as usize, x as usize]] = value;
        }
    }
    tensor
}

fn imagenet_tensor(rgb: &RgbImage) -> Array4<f32> {
    let mut tensor = Array4::<f32>::zeros((1, INPUT_CHANNELS, INPUT_SIZE, INPUT_SIZE));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..INPUT_CHANNELS {
            tensor[[0, c, y as usize, x as usize]] =
                (pixel.0[c] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma, Rgb};

    fn gray_image(w: u32, h: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageLuma8(ImageBuffer::from_pixel(w, h, Luma([value])))
    }

    #[test]
    fn grayscale_output_has_fixed_shape() {
        let pre = Preprocessor::new(PreprocessStrategy::Grayscale);
        let tensor = pre.transform(&gray_image(640, 480, 128)).unwrap();
        assert_eq!(tensor.view().shape(), &[1, 3, 224, 224]);
    }

    #[test]
    fn grayscale_uses_symmetric_normalization() {
        let pre = Preprocessor::new(PreprocessStrategy::Grayscale);

        let black = pre.transform(&gray_image(50, 50, 0)).unwrap();
        assert!(black.view().iter().all(|v| (*v + 1.0).abs() < 1e-6));

        let white = pre.transform(&gray_image(50, 50, 255)).unwrap();
        assert!(white.view().iter().all(|v| (*v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn grayscale_replicates_channels_for_color_input() {
        let mut rgb = RgbImage::new(224, 224);
        for (x, _, pixel) in rgb.enumerate_pixels_mut() {
            *pixel = Rgb([(x % 256) as u8, 10, 200]);
        }
        let pre = Preprocessor::new(PreprocessStrategy::Grayscale);
        let tensor = pre.transform(&DynamicImage::ImageRgb8(rgb)).unwrap();
        let chw = tensor.chw();
        for y in [0usize, 100, 223] {
            for x in [0usize, 57, 223] {
                assert_eq!(chw[[0, y, x]], chw[[1, y, x]]);
                assert_eq!(chw[[1, y, x]], chw[[2, y, x]]);
            }
        }
    }

    #[test]
    fn grayscale_uses_itu601_luma_weights() {
        let red = RgbImage::from_pixel(224, 224, Rgb([255, 0, 0]));
        let pre = Preprocessor::new(PreprocessStrategy::Grayscale);
        let tensor = pre.transform(&DynamicImage::ImageRgb8(red)).unwrap();
        // 0.299 * 255 rounds to 76.
        let expected = (76.0 / 255.0 - 0.5) / 0.5;
        assert!((expected - -0.40392154_f32).abs() < 1e-6);
        assert!(tensor.view().iter().all(|v| (*v - expected).abs() < 1e-6));
    }

    #[test]
    fn itu601_luma_keeps_gray_levels() {
        let gray = gray_image(3, 3, 97);
        assert!(luma_itu601(&gray).pixels().all(|p| p.0[0] == 97));

        let rgb = DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 3, Rgb([97, 97, 97])));
        assert!(luma_itu601(&rgb).pixels().all(|p| p.0[0] == 97));

        let mixed = DynamicImage::ImageRgb8(RgbImage::from_pixel(1, 1, Rgb([10, 200, 30])));
        // (10*19595 + 200*38470 + 30*7471 + 32768) >> 16
        assert_eq!(luma_itu601(&mixed).get_pixel(0, 0).0[0], 124);
    }

    #[test]
    fn imagenet_uses_per_channel_statistics() {
        let rgb = RgbImage::from_pixel(224, 224, Rgb([255, 0, 128]));
        let pre = Preprocessor::new(PreprocessStrategy::ImageNet { clahe: None });
        let tensor = pre.transform(&DynamicImage::ImageRgb8(rgb)).unwrap();
        let chw = tensor.chw();

        let expect_r = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        let expect_g = (0.0 - IMAGENET_MEAN[1]) / IMAGENET_STD[1];
        let expect_b = (128.0 / 255.0 - IMAGENET_MEAN[2]) / IMAGENET_STD[2];
        assert!((chw[[0, 10, 10]] - expect_r).abs() < 1e-5);
        assert!((chw[[1, 10, 10]] - expect_g).abs() < 1e-5);
        assert!((chw[[2, 10, 10]] - expect_b).abs() < 1e-5);
    }

    #[test]
    fn clahe_variant_produces_valid_tensor() {
        let mut luma = GrayImage::new(300, 200);
        for (x, y, pixel) in luma.enumerate_pixels_mut() {
            *pixel = Luma([(100 + (x + y) % 40) as u8]);
        }
        let pre = Preprocessor::new(PreprocessStrategy::ImageNet {
            clahe: Some(ClaheParams::default()),
        });
        let tensor = pre.transform(&DynamicImage::ImageLuma8(luma)).unwrap();
        assert_eq!(tensor.view().shape(), &[1, 3, 224, 224]);
        assert!(tensor.view().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn transform_does_not_mutate_source() {
        let source = gray_image(32, 32, 77);
        let before = source.clone();
        let pre = Preprocessor::new(PreprocessStrategy::ImageNet {
            clahe: Some(ClaheParams::default()),
        });
        pre.transform(&source).unwrap();
        assert_eq!(source, before);
    }

    #[test]
    fn zero_extent_image_is_rejected() {
        let pre = Preprocessor::new(PreprocessStrategy::Grayscale);
        let empty = DynamicImage::ImageLuma8(GrayImage::new(0, 10));
        let err = pre.transform(&empty).expect_err("zero width must fail");
        assert!(matches!(err, ChdError::InvalidImage(_)));
    }

    #[test]
    fn decode_rejects_garbage_bytes() {
        let err = decode_image(b"definitely not an image").expect_err("garbage must fail");
        assert!(matches!(err, ChdError::InvalidImage(_)));

        let err = decode_image(&[]).expect_err("empty payload must fail");
        assert!(matches!(err, ChdError::InvalidImage(_)));
    }

    #[test]
    fn decode_accepts_png() {
        let mut bytes = Vec::new();
        gray_image(8, 6, 200)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        let decoded = decode_image(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (8, 6));
    }

    #[test]
    fn input_tensor_rejects_wrong_shape() {
        let err = InputTensor::from_array(Array4::zeros((1, 3, 10, 10)))
            .expect_err("wrong shape must fail");
        assert!(err.to_string().contains("does not match"));
    }
}
