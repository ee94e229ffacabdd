//! Image preparation before OCR.
//!
//! [`apply`] runs a fixed sequence of deterministic transforms, each of which
//! can be switched off. The order never changes:
//!
//! 1. grayscale
//! 2. denoise (3×3 median)
//! 3. threshold (global Otsu)
//! 4. scale up (1.5×, cubic)
//! 5. deskew
//! 6. background removal
//!
//! The output is always 8-bit RGB, whatever the input was.

use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage, imageops::FilterType};
use imageproc::{contrast::otsu_level, filter::median_filter, point::Point};
use schemars::JsonSchema;

use crate::prelude::*;

/// Which preprocessing steps to run.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreprocessOptions {
    /// Convert to luminance.
    pub grayscale: bool,
    /// Remove salt-and-pepper noise with a 3×3 median filter.
    pub denoise: bool,
    /// Binarize using Otsu's global threshold.
    pub threshold: bool,
    /// Correct small rotations of the text.
    pub deskew: bool,
    /// Enlarge the image by 1.5×.
    pub scale_up: bool,
    /// Flatten uneven backgrounds (shadows, stains).
    pub remove_background: bool,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            grayscale: true,
            denoise: true,
            threshold: true,
            deskew: true,
            scale_up: true,
            remove_background: false,
        }
    }
}

#[cfg(test)]
impl PreprocessOptions {
    /// Options with every step disabled.
    pub fn none() -> Self {
        Self {
            grayscale: false,
            denoise: false,
            threshold: false,
            deskew: false,
            scale_up: false,
            remove_background: false,
        }
    }
}

/// Run the preprocessing pipeline on an image.
#[instrument(level = "trace", skip_all, fields(width = image.width(), height = image.height()))]
pub fn apply(image: &DynamicImage, options: &PreprocessOptions) -> DynamicImage {
    let mut img = image.to_rgb8();

    if options.grayscale {
        img = gray_to_rgb(&luma(&img));
    }
    if options.denoise {
        img = median_filter(&img, 1, 1);
    }
    if options.threshold {
        img = gray_to_rgb(&otsu_binarize(&luma(&img)));
    }
    if options.scale_up {
        let width = (f64::from(img.width()) * 1.5) as u32;
        let height = (f64::from(img.height()) * 1.5) as u32;
        img = image::imageops::resize(&img, width, height, FilterType::CatmullRom);
    }
    if options.deskew {
        match deskew(&img) {
            Ok(Some(rotated)) => img = rotated,
            Ok(None) => {}
            Err(err) => debug!("skipping deskew: {err:#}"),
        }
    }
    if options.remove_background {
        img = gray_to_rgb(&remove_background(&luma(&img)));
    }

    DynamicImage::ImageRgb8(img)
}

/// Luminance of an RGB image.
fn luma(img: &RgbImage) -> GrayImage {
    image::imageops::grayscale(img)
}

/// Expand a single channel back to three equal channels.
fn gray_to_rgb(gray: &GrayImage) -> RgbImage {
    RgbImage::from_fn(gray.width(), gray.height(), |x, y| {
        let Luma([v]) = *gray.get_pixel(x, y);
        Rgb([v, v, v])
    })
}

/// Binarize with Otsu's level: values strictly above it become white.
pub(crate) fn otsu_binarize(gray: &GrayImage) -> GrayImage {
    let level = otsu_level(gray);
    trace!(level, "Otsu threshold");
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        if gray.get_pixel(x, y)[0] > level {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Flatten the background: `255 - |gray - median21(gray)|`, min-max stretched.
fn remove_background(gray: &GrayImage) -> GrayImage {
    let background = median_filter(gray, 10, 10);
    let diff: Vec<u8> = gray
        .pixels()
        .zip(background.pixels())
        .map(|(g, b)| 255 - g[0].abs_diff(b[0]))
        .collect();
    let min = diff.iter().copied().min().unwrap_or(0);
    let max = diff.iter().copied().max().unwrap_or(0);
    // A flat image has no range to stretch and maps to 0.
    let scale = if max > min {
        255.0 / f64::from(max - min)
    } else {
        0.0
    };
    let stretched = diff
        .into_iter()
        .map(|v| (f64::from(v - min) * scale).round() as u8)
        .collect();
    GrayImage::from_raw(gray.width(), gray.height(), stretched)
        .unwrap_or_else(|| GrayImage::new(gray.width(), gray.height()))
}

/// Straighten text that was scanned at a slight angle.
///
/// Returns `Ok(None)` when there is nothing to do: no foreground, or the
/// estimated angle is zero.
fn deskew(img: &RgbImage) -> Result<Option<RgbImage>> {
    let gray = luma(img);
    let points = foreground_outline(&gray);
    if points.is_empty() {
        return Ok(None);
    }
    let angle = skew_angle(&points)
        .ok_or_else(|| anyhow!("foreground is too small to estimate a skew angle"))?;
    trace!(angle_degrees = angle.to_degrees(), "estimated skew");
    if angle == 0.0 {
        return Ok(None);
    }
    Ok(Some(rotate_about_center(img, angle)))
}

/// Leftmost and rightmost foreground pixel in every row.
///
/// The convex hull of these is the hull of the whole foreground, which keeps
/// the point count proportional to the image height.
fn foreground_outline(gray: &GrayImage) -> Vec<Point<i64>> {
    let mut points = vec![];
    for y in 0..gray.height() {
        let mut row = (0..gray.width()).filter(|&x| gray.get_pixel(x, y)[0] < 255);
        if let Some(first) = row.next() {
            let last = row.last().unwrap_or(first);
            points.push(Point::new(i64::from(first), i64::from(y)));
            if last != first {
                points.push(Point::new(i64::from(last), i64::from(y)));
            }
        }
    }
    points
}

/// Estimate the skew of a point set, in radians within `(-π/4, π/4]`.
///
/// Uses the minimum-area bounding rectangle (rotating calipers over the convex
/// hull). Returns `None` when the hull is degenerate.
fn skew_angle(points: &[Point<i64>]) -> Option<f64> {
    let hull = imageproc::geometry::convex_hull(&points[..]);
    if hull.len() < 3 {
        return None;
    }

    let mut best: Option<(f64, f64)> = None;
    for i in 0..hull.len() {
        let p = hull[i];
        let q = hull[(i + 1) % hull.len()];
        let (dx, dy) = ((q.x - p.x) as f64, (q.y - p.y) as f64);
        let len = dx.hypot(dy);
        if len == 0.0 {
            continue;
        }
        let (ux, uy) = (dx / len, dy / len);
        let (mut min_u, mut max_u, mut min_v, mut max_v) =
            (f64::MAX, f64::MIN, f64::MAX, f64::MIN);
        for h in &hull {
            let (hx, hy) = (h.x as f64, h.y as f64);
            let u = hx * ux + hy * uy;
            let v = -hx * uy + hy * ux;
            min_u = min_u.min(u);
            max_u = max_u.max(u);
            min_v = min_v.min(v);
            max_v = max_v.max(v);
        }
        let area = (max_u - min_u) * (max_v - min_v);
        if best.is_none_or(|(best_area, _)| area < best_area) {
            best = Some((area, dy.atan2(dx)));
        }
    }
    best.map(|(_, angle)| normalize_quarter_turn(angle))
}

/// Fold an edge angle into `(-π/4, π/4]`.
///
/// A rectangle looks the same after a quarter turn, so only this range is
/// meaningful.
fn normalize_quarter_turn(mut angle: f64) -> f64 {
    use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};
    while angle > FRAC_PI_4 {
        angle -= FRAC_PI_2;
    }
    while angle <= -FRAC_PI_4 {
        angle += FRAC_PI_2;
    }
    // Snap rounding noise so axis-aligned content stays untouched.
    if angle.abs() < 1e-9 { 0.0 } else { angle }
}

/// Rotate an image about its center with bicubic sampling.
///
/// Output pixel `p` is sampled from `R(angle) * (p - c) + c`, so text whose
/// baseline runs at `angle` comes out horizontal. Pixels outside the source
/// replicate the nearest edge.
fn rotate_about_center(img: &RgbImage, angle: f64) -> RgbImage {
    let (w, h) = img.dimensions();
    let (cx, cy) = (f64::from(w / 2), f64::from(h / 2));
    let (sin, cos) = angle.sin_cos();
    RgbImage::from_fn(w, h, |x, y| {
        let (px, py) = (f64::from(x) - cx, f64::from(y) - cy);
        let sx = cos * px - sin * py + cx;
        let sy = sin * px + cos * py + cy;
        sample_bicubic(img, sx, sy)
    })
}

/// Cubic convolution weight, with the `a = -0.75` kernel used by most
/// imaging libraries for "cubic" interpolation.
fn cubic_weight(t: f64) -> f64 {
    const A: f64 = -0.75;
    let t = t.abs();
    if t <= 1.0 {
        ((A + 2.0) * t - (A + 3.0)) * t * t + 1.0
    } else if t < 2.0 {
        ((A * t - 5.0 * A) * t + 8.0 * A) * t - 4.0 * A
    } else {
        0.0
    }
}

/// Sample an image at a fractional position, clamping to the edges.
fn sample_bicubic(img: &RgbImage, x: f64, y: f64) -> Rgb<u8> {
    let (w, h) = (i64::from(img.width()), i64::from(img.height()));
    let (x0, y0) = (x.floor(), y.floor());
    let (fx, fy) = (x - x0, y - y0);
    let (x0, y0) = (x0 as i64, y0 as i64);

    let mut acc = [0.0f64; 3];
    for j in -1..=2 {
        let wy = cubic_weight(fy - j as f64);
        let sy = (y0 + j).clamp(0, h - 1) as u32;
        for i in -1..=2 {
            let wx = cubic_weight(fx - i as f64);
            let sx = (x0 + i).clamp(0, w - 1) as u32;
            let px = img.get_pixel(sx, sy);
            for c in 0..3 {
                acc[c] += wx * wy * f64::from(px[c]);
            }
        }
    }
    Rgb(acc.map(|v| v.round().clamp(0.0, 255.0) as u8))
}
