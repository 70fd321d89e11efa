//! Contrast-limited adaptive histogram equalization.
//!
//! The plane is split into a `tile_grid × tile_grid` grid. Each tile gets a
//! clipped-histogram equalization lookup table and every pixel blends the
//! tables of its four nearest tile centers bilinearly.

use image::RgbImage;

use super::ClaheParams;

const BINS: usize = 256;

/// Equalize each RGB channel independently. Dimensions are preserved.
pub fn equalize_rgb(image: &RgbImage, params: ClaheParams) -> RgbImage {
    let (width, height) = image.dimensions();
    let (w, h) = (width as usize, height as usize);
    if w == 0 || h == 0 {
        return image.clone();
    }

    let raw = image.as_raw();
    let mut out = vec![0u8; raw.len()];
    let mut plane = vec![0u8; w * h];

    for c in 0..3 {
        for (i, value) in plane.iter_mut().enumerate() {
            *value = raw[i * 3 + c];
        }
        let equalized = equalize_plane(&plane, w, h, params);
        for (i, value) in equalized.iter().enumerate() {
            out[i * 3 + c] = *value;
        }
    }

    RgbImage::from_raw(width, height, out).unwrap_or_else(|| image.clone())
}

/// Equalize a single 8-bit plane stored row-major.
pub fn equalize_plane(src: &[u8], width: usize, height: usize, params: ClaheParams) -> Vec<u8> {
    if width == 0 || height == 0 || src.len() != width * height {
        return src.to_vec();
    }

    let grid_x = params.tile_grid.clamp(1, width);
    let grid_y = params.tile_grid.clamp(1, height);
    let tile_w = width as f32 / grid_x as f32;
    let tile_h = height as f32 / grid_y as f32;

    let mut luts = Vec::with_capacity(grid_x * grid_y);
    for ty in 0..grid_y {
        let y0 = (ty as f32 * tile_h).floor() as usize;
        let y1 = (((ty + 1) as f32 * tile_h).floor() as usize).min(height);
        for tx in 0..grid_x {
            let x0 = (tx as f32 * tile_w).floor() as usize;
            let x1 = (((tx + 1) as f32 * tile_w).floor() as usize).min(width);
            luts.push(tile_lut(src, width, x0..x1, y0..y1, params.clip_limit));
        }
    }

    let mut dst = vec![0u8; src.len()];
    for y in 0..height {
        let (ty0, ty1, wy) = neighbours(y, tile_h, grid_y);
        for x in 0..width {
            let (tx0, tx1, wx) = neighbours(x, tile_w, grid_x);
            let v = src[y * width + x] as usize;

            let top = luts[ty0 * grid_x + tx0][v] as f32 * (1.0 - wx)
                + luts[ty0 * grid_x + tx1][v] as f32 * wx;
            let bottom = luts[ty1 * grid_x + tx0][v] as f32 * (1.0 - wx)
                + luts[ty1 * grid_x + tx1][v] as f32 * wx;
            let value = top * (1.0 - wy) + bottom * wy;

            dst[y * width + x] = value.round().clamp(0.0, 255.0) as u8;
        }
    }
    dst
}

/// Tile indices bracketing pixel `p` and the blend weight of the second one.
fn neighbours(p: usize, tile: f32, grid: usize) -> (usize, usize, f32) {
    let pos = (p as f32 + 0.5) / tile - 0.5;
    let base = pos.floor();
    let weight = (pos - base).clamp(0.0, 1.0);
    let last = grid as isize - 1;
    let i0 = (base as isize).clamp(0, last) as usize;
    let i1 = (base as isize + 1).clamp(0, last) as usize;
    (i0, i1, weight)
}

fn tile_lut(
    src: &[u8],
    width: usize,
    xs: std::ops::Range<usize>,
    ys: std::ops::Range<usize>,
    clip_limit: f32,
) -> [u8; BINS] {
    let mut hist = [0usize; BINS];
    let mut area = 0usize;
    for y in ys {
        for x in xs.clone() {
            hist[src[y * width + x] as usize] += 1;
            area += 1;
        }
    }

    let mut lut = [0u8; BINS];
    if area == 0 {
        for (i, entry) in lut.iter_mut().enumerate() {
            *entry = i as u8;
        }
        return lut;
    }

    let limit = ((clip_limit * area as f32 / BINS as f32) as usize).max(1);
    let mut excess = 0usize;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }

    let batch = excess / BINS;
    let residual = excess % BINS;
    for bin in hist.iter_mut() {
        *bin += batch;
    }
    if residual > 0 {
        let step = (BINS / residual).max(1);
        for i in (0..BINS).step_by(step).take(residual) {
            hist[i] += 1;
        }
    }

    let scale = 255.0 / area as f32;
    let mut cdf = 0usize;
    for (bin, entry) in hist.iter().zip(lut.iter_mut()) {
        cdf += bin;
        *entry = (cdf as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }
    lut
}
