//! Crop preprocessing for OCR
//!
//! Scanned forms arrive at modest resolution with uneven lighting and speckle.
//! Each crop is upscaled, binarized against its local neighbourhood and
//! cleaned with a small opening/closing before it reaches the backend.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma};
use imageproc::filter::gaussian_blur_f32;
use tracing::debug;

use crate::config::OcrPreprocessing;

/// Run the full preprocessing chain on a cropped region
pub fn preprocess(roi: &DynamicImage, settings: &OcrPreprocessing) -> GrayImage {
    let gray = to_grayscale(roi);
    let scaled = apply_upscale(&gray, settings.scale);
    let binary = adaptive_threshold_gaussian(&scaled, settings.block_size, settings.threshold_bias);
    let opened = open(&binary, settings.kernel_size);
    let cleaned = close(&opened, settings.kernel_size);

    debug!(
        "Preprocessed {}x{} crop to {}x{}",
        roi.width(),
        roi.height(),
        cleaned.width(),
        cleaned.height()
    );
    cleaned
}

/// Single-channel intensity; already-gray input is copied as is
pub fn to_grayscale(image: &DynamicImage) -> GrayImage {
    match image {
        DynamicImage::ImageLuma8(gray) => gray.clone(),
        other => other.to_luma8(),
    }
}

/// Upscale with cubic (Catmull-Rom) interpolation
/// Scale factor should be >= 1 (1 = no change)
fn apply_upscale(image: &GrayImage, scale: u32) -> GrayImage {
    if scale <= 1 {
        return image.clone();
    }
    imageops::resize(
        image,
        image.width() * scale,
        image.height() * scale,
        FilterType::CatmullRom,
    )
}

/// Binarize against a Gaussian-weighted local mean.
///
/// A pixel becomes white when it is brighter than `mean - bias`, so flat
/// regions of any brightness turn white and only local dark detail survives.
/// `block_size` is the window side; sigma follows the usual
/// `0.3 * ((block_size - 1) / 2 - 1) + 0.8` rule.
pub fn adaptive_threshold_gaussian(image: &GrayImage, block_size: u32, bias: f32) -> GrayImage {
    let block_size = block_size.max(3) | 1;
    let sigma = 0.3 * ((block_size - 1) as f32 * 0.5 - 1.0) + 0.8;
    let local_mean = gaussian_blur_f32(image, sigma);

    let mut out = GrayImage::new(image.width(), image.height());
    for (x, y, pixel) in image.enumerate_pixels() {
        let mean = f32::from(local_mean.get_pixel(x, y)[0]);
        let value = if f32::from(pixel[0]) > mean - bias { 255 } else { 0 };
        out.put_pixel(x, y, Luma([value]));
    }
    out
}

/// Morphological opening (erode then dilate) with a square kernel.
/// Removes white specks smaller than the kernel.
pub fn open(image: &GrayImage, kernel: u32) -> GrayImage {
    dilate_rect(&erode_rect(image, kernel), kernel)
}

/// Morphological closing (dilate then erode) with a square kernel.
/// Fills black specks smaller than the kernel.
pub fn close(image: &GrayImage, kernel: u32) -> GrayImage {
    erode_rect(&dilate_rect(image, kernel), kernel)
}

fn erode_rect(image: &GrayImage, kernel: u32) -> GrayImage {
    let anchor = kernel / 2;
    rect_filter(image, kernel, anchor, u8::MAX, u8::min)
}

/// Dilation uses the reflected window so open/close do not shift edges
fn dilate_rect(image: &GrayImage, kernel: u32) -> GrayImage {
    let anchor = kernel.saturating_sub(1) - kernel / 2;
    rect_filter(image, kernel, anchor, u8::MIN, u8::max)
}

/// Fold `combine` over a `kernel x kernel` window whose top-left corner sits
/// `anchor` pixels up and left of the output pixel. Pixels outside the image
/// do not contribute.
fn rect_filter(
    image: &GrayImage,
    kernel: u32,
    anchor: u32,
    identity: u8,
    combine: fn(u8, u8) -> u8,
) -> GrayImage {
    if kernel <= 1 {
        return image.clone();
    }

    let (w, h) = image.dimensions();
    let anchor = i64::from(anchor);
    let k = i64::from(kernel);
    let mut out = GrayImage::new(w, h);

    for y in 0..h {
        for x in 0..w {
            let mut acc = identity;
            for ky in 0..k {
                let sy = i64::from(y) + ky - anchor;
                if sy < 0 || sy >= i64::from(h) {
                    continue;
                }
                for kx in 0..k {
                    let sx = i64::from(x) + kx - anchor;
                    if sx < 0 || sx >= i64::from(w) {
                        continue;
                    }
                    acc = combine(acc, image.get_pixel(sx as u32, sy as u32)[0]);
                }
            }
            out.put_pixel(x, y, Luma([acc]));
        }
    }

    out
}
