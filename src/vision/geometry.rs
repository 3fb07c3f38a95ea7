//! Ratio <-> pixel coordinate mapping for regions of interest
//!
//! Profiles store every region as fractions of the reference image, so a single
//! profile applies to scans of any resolution. This module turns those fractions
//! into pixel rectangles for a concrete image and back.

use serde::{Deserialize, Serialize};

/// Pixel rectangle guaranteed to lie inside the image it was mapped onto
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }
}

/// Region bounds expressed as fractions of a reference image size
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatioRect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

/// A region as authored, tagged with the coordinate space it is expressed in.
///
/// The space is never guessed from magnitude: a 0.5px box at the origin and a
/// ratio box are indistinguishable by value alone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RoiInput {
    /// Already fractions of the reference size; passed through unchanged
    Ratio(RatioRect),
    /// Pixel coordinates in the reference image
    Pixels { x: f64, y: f64, w: f64, h: f64 },
}

impl RoiInput {
    /// Resolve into ratio space against the reference dimensions
    pub fn into_ratio(self, ref_w: u32, ref_h: u32) -> RatioRect {
        match self {
            RoiInput::Ratio(r) => r,
            RoiInput::Pixels { x, y, w, h } => pixel_to_ratio(x, y, w, h, ref_w, ref_h),
        }
    }
}

/// Clamp a rectangle into `[0, image_w) x [0, image_h)` with a minimum size of 1x1.
///
/// Accepts signed input so callers handing in raw offsets (negative or past the
/// edge) still get a valid crop. Requires non-zero image dimensions.
pub fn clamp_rect(x: i64, y: i64, w: i64, h: i64, image_w: u32, image_h: u32) -> PixelRect {
    let iw = i64::from(image_w.max(1));
    let ih = i64::from(image_h.max(1));

    let x = x.clamp(0, iw - 1);
    let y = y.clamp(0, ih - 1);
    let w = w.min(iw - x).max(1);
    let h = h.min(ih - y).max(1);

    PixelRect::new(x as u32, y as u32, w as u32, h as u32)
}

/// Map a ratio region onto an image of the given size.
///
/// Malformed ratios (negative, > 1, NaN) are clamped rather than rejected.
pub fn ratio_to_pixel(roi: &RatioRect, image_w: u32, image_h: u32) -> PixelRect {
    let iw = f64::from(image_w);
    let ih = f64::from(image_h);

    // `as i64` saturates and maps NaN to 0
    clamp_rect(
        (roi.x * iw).floor() as i64,
        (roi.y * ih).floor() as i64,
        (roi.w * iw).floor() as i64,
        (roi.h * ih).floor() as i64,
        image_w,
        image_h,
    )
}

/// Convert a pixel rectangle authored on a `ref_w x ref_h` image into ratios
/// rounded to 6 decimal digits.
pub fn pixel_to_ratio(x: f64, y: f64, w: f64, h: f64, ref_w: u32, ref_h: u32) -> RatioRect {
    let rw = f64::from(ref_w.max(1));
    let rh = f64::from(ref_h.max(1));

    RatioRect {
        x: round6(x / rw),
        y: round6(y / rh),
        w: round6(w / rw),
        h: round6(h / rh),
    }
}

fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}
