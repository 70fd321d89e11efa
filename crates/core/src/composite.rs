//! Heatmap overlay rendering.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, RgbImage};
use ndarray::Array3;
use serde::{Serialize, Serializer};

use crate::error::{ChdError, Result};
use crate::localize::ImportanceMap;
use crate::preprocess::ensure_extent;

const HEATMAP_WEIGHT: f32 = 0.5;
const IMAGE_WEIGHT: f32 = 0.5;

/// Encoded overlay (PNG). Serializes as a standard base64 string.
#[derive(Clone, PartialEq, Eq)]
pub struct Overlay {
    png: Vec<u8>,
}

impl Overlay {
    pub fn png(&self) -> &[u8] {
        &self.png
    }

    pub fn into_png(self) -> Vec<u8> {
        self.png
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.png)
    }
}

impl std::fmt::Debug for Overlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overlay")
            .field("png_bytes", &self.png.len())
            .finish()
    }
}

impl Serialize for Overlay {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

/// Jet colour scale: 0 → dark blue, 0.5 → green, 1 → dark red.
pub fn jet(value: f32) -> [f32; 3] {
    let v = value.clamp(0.0, 1.0);
    let channel = |offset: f32| (1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0);
    [channel(3.0), channel(2.0), channel(1.0)]
}

/// Blend the colour-mapped importance map with the original image resized to
/// the map's size. Returns `[H, W, 3]` in `[0, 1]`.
pub fn blend(map: &ImportanceMap, original: &DynamicImage) -> Result<Array3<f32>> {
    ensure_extent(original).map_err(|e| ChdError::Encode(e.to_string()))?;
    let (height, width) = map.dim();
    let base = resize_to(&original.to_rgb8(), width as u32, height as u32);

    let values = map.view();
    let mut out = Array3::<f32>::zeros((height, width, 3));
    for (x, y, pixel) in base.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        let heat = jet(values[[y, x]]);
        for c in 0..3 {
            let image = pixel.0[c] as f32 / 255.0;
            out[[y, x, c]] = (HEATMAP_WEIGHT * heat[c] + IMAGE_WEIGHT * image).clamp(0.0, 1.0);
        }
    }
    Ok(out)
}

pub fn encode_png(blended: &Array3<f32>) -> Result<Vec<u8>> {
    let (height, width, channels) = blended.dim();
    if channels != 3 {
        return Err(ChdError::Encode(format!(
            "expected 3 colour channels, got {channels}"
        )));
    }
    let raw: Vec<u8> = blended
        .iter()
        .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
        .collect();
    let rgb = RgbImage::from_raw(width as u32, height as u32, raw)
        .ok_or_else(|| ChdError::Encode("overlay buffer size mismatch".to_string()))?;

    let mut png = Vec::new();
    DynamicImage::ImageRgb8(rgb)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| ChdError::Encode(format!("failed to encode PNG: {e}")))?;
    Ok(png)
}

/// Importance map + original image → encoded overlay.
pub fn render(map: &ImportanceMap, original: &DynamicImage) -> Result<Overlay> {
    let blended = blend(map, original)?;
    Ok(Overlay {
        png: encode_png(&blended)?,
    })
}

fn resize_to(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    imageops::resize(image, width, height, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::localize::normalize_min_max;
    use crate::preprocess::INPUT_SIZE;
    use image::{GenericImageView, Luma};
    use ndarray::Array2;

    fn ramp_map() -> ImportanceMap {
        let raw = Array2::from_shape_fn((INPUT_SIZE, INPUT_SIZE), |(_, x)| x as f32);
        ImportanceMap::from_array(normalize_min_max(raw))
    }

    #[test]
    fn jet_endpoints_and_midpoint() {
        assert_eq!(jet(0.0), [0.0, 0.0, 0.5]);
        assert_eq!(jet(0.5), [0.5, 1.0, 0.5]);
        assert_eq!(jet(1.0), [0.5, 0.0, 0.0]);
    }

    #[test]
    fn jet_clamps_out_of_range_input() {
        assert_eq!(jet(-3.0), jet(0.0));
        assert_eq!(jet(7.0), jet(1.0));
    }

    #[test]
    fn blend_stays_in_unit_range() {
        let original = DynamicImage::ImageLuma8(image::ImageBuffer::from_pixel(
            640,
            480,
            Luma([255u8]),
        ));
        let blended = blend(&ramp_map(), &original).unwrap();
        assert_eq!(blended.dim(), (INPUT_SIZE, INPUT_SIZE, 3));
        assert!(blended.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn blend_weights_are_equal() {
        let original = DynamicImage::ImageRgb8(RgbImage::from_pixel(
            INPUT_SIZE as u32,
            INPUT_SIZE as u32,
            image::Rgb([0, 0, 0]),
        ));
        let map = ImportanceMap::from_array(Array2::zeros((INPUT_SIZE, INPUT_SIZE)));
        let blended = blend(&map, &original).unwrap();
        assert_eq!(blended[[10, 10, 0]], 0.0);
        assert_eq!(blended[[10, 10, 2]], 0.25);
    }

    #[test]
    fn render_produces_png_of_input_size() {
        let original = crate::test_support::sample_image();
        let overlay = render(&ramp_map(), &original).unwrap();

        let decoded = image::load_from_memory(overlay.png()).unwrap();
        assert_eq!(decoded.dimensions(), (INPUT_SIZE as u32, INPUT_SIZE as u32));
    }

    #[test]
    fn overlay_serializes_as_base64() {
        let overlay = Overlay {
            png: vec![0x89, b'P', b'N', b'G'],
        };
        let json = serde_json::to_string(&overlay).unwrap();
        assert_eq!(json, "\"iVBORw==\"");
    }
}
