//! Feature-based template registration
//!
//! Aligns a scan to its profile's template image so that ratio regions land on
//! the same content even when the page was shifted, rotated or photographed at
//! an angle. The pipeline is ORB-style: oriented FAST corners over a small
//! pyramid, steered BRIEF descriptors, cross-checked Hamming matching and a
//! RANSAC homography. Every failure degrades to the unmodified scan.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use imageproc::corners::{corners_fast9, Corner};
use imageproc::filter::gaussian_blur_f32;
use nalgebra::{DMatrix, Matrix3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::config::RegistrationSettings;

const PYRAMID_LEVELS: usize = 4;
const SCALE_FACTOR: f32 = 1.2;
const FAST_THRESHOLD: u8 = 20;
/// Keypoints closer than this to the edge cannot hold a rotated patch
const EDGE_BORDER: u32 = 19;
const HALF_PATCH: i32 = 15;
const PATTERN_RADIUS: i32 = 13;
const DESCRIPTOR_BITS: usize = 256;
const BLUR_SIGMA: f32 = 2.0;
const PATTERN_SEED: u64 = 0x5eed_0b1e;
const RANSAC_SEED: u64 = 0x7a11_ab1e;
const RANSAC_CONFIDENCE: f64 = 0.995;
const MIN_CORRESPONDENCES: usize = 4;

type Descriptor = [u64; DESCRIPTOR_BITS / 64];
type Point = (f64, f64);

/// Tunables for a registration run
#[derive(Debug, Clone)]
pub struct RegistrationParams {
    pub max_features: usize,
    pub good_match_percent: f32,
    pub ransac_threshold: f64,
    pub ransac_iterations: usize,
}

impl Default for RegistrationParams {
    fn default() -> Self {
        Self::from(&RegistrationSettings::default())
    }
}

impl From<&RegistrationSettings> for RegistrationParams {
    fn from(settings: &RegistrationSettings) -> Self {
        Self {
            max_features: settings.max_features,
            good_match_percent: settings.good_match_percent,
            ransac_threshold: settings.ransac_threshold,
            ransac_iterations: settings.ransac_iterations,
        }
    }
}

/// Projective transform from scan coordinates to template coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography(Matrix3<f64>);

impl Homography {
    /// Map a point; `None` when it projects to infinity
    pub fn apply(&self, x: f64, y: f64) -> Option<Point> {
        let p = self.0 * Vector3::new(x, y, 1.0);
        if p.z.abs() < f64::EPSILON {
            return None;
        }
        Some((p.x / p.z, p.y / p.z))
    }

    pub fn inverse(&self) -> Option<Homography> {
        self.0.try_inverse().map(Homography)
    }
}

/// Result of aligning a scan to a template
#[derive(Debug, Clone)]
pub enum AlignmentOutcome {
    /// Scan warped into the template's pixel frame
    Registered {
        image: DynamicImage,
        homography: Homography,
    },
    /// Alignment failed; the original scan, untouched
    Unaligned { image: DynamicImage },
}

impl AlignmentOutcome {
    pub fn image(&self) -> &DynamicImage {
        match self {
            AlignmentOutcome::Registered { image, .. } | AlignmentOutcome::Unaligned { image } => {
                image
            }
        }
    }

    pub fn into_image(self) -> DynamicImage {
        match self {
            AlignmentOutcome::Registered { image, .. } | AlignmentOutcome::Unaligned { image } => {
                image
            }
        }
    }

    pub fn homography(&self) -> Option<&Homography> {
        match self {
            AlignmentOutcome::Registered { homography, .. } => Some(homography),
            AlignmentOutcome::Unaligned { .. } => None,
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(self, AlignmentOutcome::Registered { .. })
    }
}

#[derive(Debug, Clone)]
struct Feature {
    x: f32,
    y: f32,
    descriptor: Descriptor,
}

#[derive(Debug, Clone, Copy)]
struct Match {
    query: usize,
    train: usize,
    distance: u32,
}

/// Stateless scan-to-template aligner
#[derive(Debug, Clone, Default)]
pub struct ImageRegistrar {
    params: RegistrationParams,
}

impl ImageRegistrar {
    pub fn new(params: RegistrationParams) -> Self {
        Self { params }
    }

    /// Align `target` onto `template`. Never fails: any problem yields
    /// [`AlignmentOutcome::Unaligned`] carrying `target` unchanged.
    pub fn align(&self, target: DynamicImage, template: &DynamicImage) -> AlignmentOutcome {
        let (out_w, out_h) = (template.width(), template.height());
        match self.estimate(&target.to_luma8(), &template.to_luma8()) {
            Ok(homography) => match warp_perspective(&target, &homography, out_w, out_h) {
                Some(image) => AlignmentOutcome::Registered { image, homography },
                None => {
                    warn!("Registration failed: homography is not invertible");
                    AlignmentOutcome::Unaligned { image: target }
                }
            },
            Err(reason) => {
                warn!("Registration failed: {reason}; using unaligned image");
                AlignmentOutcome::Unaligned { image: target }
            }
        }
    }

    /// Estimate the target -> template homography
    fn estimate(&self, target: &GrayImage, template: &GrayImage) -> Result<Homography, String> {
        let pattern = sampling_pattern();
        let target_features = self.extract_features(target, &pattern);
        let template_features = self.extract_features(template, &pattern);

        let mut matches = cross_check_matches(&target_features, &template_features);
        matches.sort_by_key(|m| m.distance);
        let keep = (matches.len() as f32 * self.params.good_match_percent) as usize;
        matches.truncate(keep);

        debug!(
            "Registration: {} / {} features, {} good matches",
            target_features.len(),
            template_features.len(),
            matches.len()
        );

        if matches.len() < MIN_CORRESPONDENCES {
            return Err(format!("only {} good matches", matches.len()));
        }

        let src: Vec<Point> = matches
            .iter()
            .map(|m| {
                let f = &target_features[m.query];
                (f64::from(f.x), f64::from(f.y))
            })
            .collect();
        let dst: Vec<Point> = matches
            .iter()
            .map(|m| {
                let f = &template_features[m.train];
                (f64::from(f.x), f64::from(f.y))
            })
            .collect();

        find_homography(&src, &dst, &self.params)
            .ok_or_else(|| "no consistent homography".to_string())
    }

    fn extract_features(&self, gray: &GrayImage, pattern: &[[(i32, i32); 2]]) -> Vec<Feature> {
        let levels = build_pyramid(gray);
        let budgets = level_budgets(self.params.max_features, levels.len());
        let mut features = Vec::new();

        for (index, level) in levels.iter().enumerate() {
            let corners = detect_level(level, budgets[index]);
            if corners.is_empty() {
                continue;
            }

            let scale = SCALE_FACTOR.powi(index as i32);
            let blurred = gaussian_blur_f32(level, BLUR_SIGMA);
            for corner in corners {
                let angle = intensity_centroid_angle(level, corner.x, corner.y);
                features.push(Feature {
                    x: corner.x as f32 * scale,
                    y: corner.y as f32 * scale,
                    descriptor: steered_brief(&blurred, corner.x, corner.y, angle, pattern),
                });
            }
        }

        features
    }
}

fn build_pyramid(gray: &GrayImage) -> Vec<GrayImage> {
    let min_side = 2 * EDGE_BORDER + 1;
    let mut levels = vec![gray.clone()];

    for index in 1..PYRAMID_LEVELS {
        let scale = SCALE_FACTOR.powi(index as i32);
        let w = (gray.width() as f32 / scale).round() as u32;
        let h = (gray.height() as f32 / scale).round() as u32;
        if w < min_side || h < min_side {
            break;
        }
        levels.push(imageops::resize(gray, w, h, FilterType::Triangle));
    }

    levels
}

/// Split the feature cap across levels, geometrically decreasing with scale
fn level_budgets(max_features: usize, levels: usize) -> Vec<usize> {
    let factor = 1.0 / f64::from(SCALE_FACTOR);
    let first = max_features as f64 * (1.0 - factor) / (1.0 - factor.powi(levels as i32));

    let mut budgets = Vec::with_capacity(levels);
    let mut assigned = 0;
    for index in 0..levels {
        let n = if index + 1 == levels {
            max_features.saturating_sub(assigned)
        } else {
            (first * factor.powi(index as i32)).round() as usize
        };
        assigned += n;
        budgets.push(n);
    }
    budgets
}

/// FAST corners away from the border, non-max suppressed, strongest first
fn detect_level(level: &GrayImage, budget: usize) -> Vec<Corner> {
    let (w, h) = level.dimensions();
    if budget == 0 || w <= 2 * EDGE_BORDER || h <= 2 * EDGE_BORDER {
        return Vec::new();
    }

    let corners = corners_fast9(level, FAST_THRESHOLD);
    let mut scores = vec![0f32; (w * h) as usize];
    for c in &corners {
        scores[(c.y * w + c.x) as usize] = c.score;
    }

    let mut kept: Vec<Corner> = corners
        .into_iter()
        .filter(|c| {
            c.x >= EDGE_BORDER
                && c.y >= EDGE_BORDER
                && c.x < w - EDGE_BORDER
                && c.y < h - EDGE_BORDER
        })
        .filter(|c| is_local_max(&scores, w, c))
        .collect();

    kept.sort_by(|a, b| b.score.total_cmp(&a.score));
    kept.truncate(budget);
    kept
}

fn is_local_max(scores: &[f32], width: u32, corner: &Corner) -> bool {
    for dy in -1i64..=1 {
        for dx in -1i64..=1 {
            if dx == 0 && dy == 0 {
                continue;
            }
            let nx = i64::from(corner.x) + dx;
            let ny = i64::from(corner.y) + dy;
            let neighbour = scores[(ny * i64::from(width) + nx) as usize];
            // Ties go to the first pixel in scan order
            let earlier = dy < 0 || (dy == 0 && dx < 0);
            if neighbour > corner.score || (earlier && neighbour == corner.score) {
                return false;
            }
        }
    }
    true
}

/// Orientation from the intensity centroid of a circular patch
fn intensity_centroid_angle(image: &GrayImage, cx: u32, cy: u32) -> f32 {
    let (cx, cy) = (cx as i32, cy as i32);
    let (mut m01, mut m10) = (0f64, 0f64);

    for v in -HALF_PATCH..=HALF_PATCH {
        let span = f64::from(HALF_PATCH * HALF_PATCH - v * v).sqrt() as i32;
        for u in -span..=span {
            let value = f64::from(image.get_pixel((cx + u) as u32, (cy + v) as u32)[0]);
            m10 += f64::from(u) * value;
            m01 += f64::from(v) * value;
        }
    }

    m01.atan2(m10) as f32
}

/// Fixed random point-pair pattern shared by both images
fn sampling_pattern() -> Vec<[(i32, i32); 2]> {
    let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
    let mut point = || {
        (
            rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS),
            rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS),
        )
    };
    (0..DESCRIPTOR_BITS).map(|_| [point(), point()]).collect()
}

fn steered_brief(
    blurred: &GrayImage,
    cx: u32,
    cy: u32,
    angle: f32,
    pattern: &[[(i32, i32); 2]],
) -> Descriptor {
    let (sin, cos) = angle.sin_cos();
    let sample = |(px, py): (i32, i32)| {
        let rx = (px as f32 * cos - py as f32 * sin).round() as i32;
        let ry = (px as f32 * sin + py as f32 * cos).round() as i32;
        blurred.get_pixel((cx as i32 + rx) as u32, (cy as i32 + ry) as u32)[0]
    };

    let mut descriptor = [0u64; DESCRIPTOR_BITS / 64];
    for (bit, [a, b]) in pattern.iter().enumerate() {
        if sample(*a) < sample(*b) {
            descriptor[bit / 64] |= 1 << (bit % 64);
        }
    }
    descriptor
}

fn hamming(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

fn nearest(descriptor: &Descriptor, pool: &[Feature]) -> Option<(usize, u32)> {
    pool.iter()
        .enumerate()
        .map(|(i, f)| (i, hamming(descriptor, &f.descriptor)))
        .min_by_key(|&(_, d)| d)
}

/// Brute-force matches kept only when each side is the other's nearest neighbour
fn cross_check_matches(query: &[Feature], train: &[Feature]) -> Vec<Match> {
    let backward: Vec<Option<usize>> = train
        .iter()
        .map(|f| nearest(&f.descriptor, query).map(|(i, _)| i))
        .collect();

    query
        .iter()
        .enumerate()
        .filter_map(|(qi, f)| {
            let (ti, distance) = nearest(&f.descriptor, train)?;
            (backward[ti] == Some(qi)).then_some(Match {
                query: qi,
                train: ti,
                distance,
            })
        })
        .collect()
}

/// RANSAC over 4-point samples, then a least-squares refit on the inliers
fn find_homography(
    src: &[Point],
    dst: &[Point],
    params: &RegistrationParams,
) -> Option<Homography> {
    let n = src.len();
    if n < MIN_CORRESPONDENCES || n != dst.len() {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(RANSAC_SEED);
    let mut best_mask: Vec<bool> = Vec::new();
    let mut best_count = 0;
    let mut max_iterations = params.ransac_iterations.max(1);
    let mut iteration = 0;

    while iteration < max_iterations {
        iteration += 1;

        let picked = rand::seq::index::sample(&mut rng, n, MIN_CORRESPONDENCES).into_vec();
        let s: Vec<Point> = picked.iter().map(|&i| src[i]).collect();
        let d: Vec<Point> = picked.iter().map(|&i| dst[i]).collect();
        if has_collinear_triple(&s) || has_collinear_triple(&d) {
            continue;
        }
        let Some(candidate) = solve_dlt(&s, &d) else {
            continue;
        };

        let mask = inlier_mask(&candidate, src, dst, params.ransac_threshold);
        let count = mask.iter().filter(|&&inlier| inlier).count();
        if count > best_count {
            best_count = count;
            best_mask = mask;
            max_iterations = max_iterations.min(required_iterations(count, n).max(iteration));
        }
    }

    if best_count < MIN_CORRESPONDENCES {
        return None;
    }

    let (inlier_src, inlier_dst): (Vec<Point>, Vec<Point>) = src
        .iter()
        .zip(dst)
        .zip(&best_mask)
        .filter(|(_, inlier)| **inlier)
        .map(|((s, d), _)| (*s, *d))
        .unzip();

    debug!("RANSAC: {best_count}/{n} inliers after {iteration} iterations");
    solve_dlt(&inlier_src, &inlier_dst)
}

/// Iterations needed to draw one all-inlier sample with the target confidence
fn required_iterations(inliers: usize, total: usize) -> usize {
    let ratio = inliers as f64 / total as f64;
    let p_fail = 1.0 - ratio.powi(MIN_CORRESPONDENCES as i32);
    if p_fail <= f64::EPSILON {
        return 1;
    }
    if p_fail >= 1.0 {
        return usize::MAX;
    }
    ((1.0 - RANSAC_CONFIDENCE).ln() / p_fail.ln()).ceil() as usize
}

fn inlier_mask(h: &Homography, src: &[Point], dst: &[Point], threshold: f64) -> Vec<bool> {
    let limit = threshold * threshold;
    src.iter()
        .zip(dst)
        .map(|(&(x, y), &(u, v))| match h.apply(x, y) {
            Some((px, py)) => (px - u).powi(2) + (py - v).powi(2) <= limit,
            None => false,
        })
        .collect()
}

fn has_collinear_triple(points: &[Point]) -> bool {
    for i in 0..points.len() {
        for j in (i + 1)..points.len() {
            for k in (j + 1)..points.len() {
                let (a, b, c) = (points[i], points[j], points[k]);
                let area = (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0);
                if area.abs() < 1e-3 {
                    return true;
                }
            }
        }
    }
    false
}

/// Similarity moving the centroid to the origin with mean distance sqrt(2)
fn normalizing_transform(points: &[Point]) -> Option<Matrix3<f64>> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.0).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.1).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| (p.0 - cx).hypot(p.1 - cy))
        .sum::<f64>()
        / n;
    if !mean_dist.is_finite() || mean_dist < f64::EPSILON {
        return None;
    }

    let s = std::f64::consts::SQRT_2 / mean_dist;
    Some(Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0))
}

/// Normalized direct linear transform over two or more correspondences
fn solve_dlt(src: &[Point], dst: &[Point]) -> Option<Homography> {
    let ts = normalizing_transform(src)?;
    let td = normalizing_transform(dst)?;

    let mut ata = DMatrix::<f64>::zeros(9, 9);
    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
        let s = ts * Vector3::new(sx, sy, 1.0);
        let d = td * Vector3::new(dx, dy, 1.0);
        let (x, y, u, v) = (s.x, s.y, d.x, d.y);

        let rows = [
            [-x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u],
            [0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v],
        ];
        for row in &rows {
            for i in 0..9 {
                for j in 0..9 {
                    ata[(i, j)] += row[i] * row[j];
                }
            }
        }
    }

    let eigen = ata.symmetric_eigen();
    let (smallest, _) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let h = eigen.eigenvectors.column(smallest);
    let normalized = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let mut m = td.try_inverse()? * normalized * ts;
    let scale = m[(2, 2)];
    if scale.abs() < 1e-12 {
        return None;
    }
    m /= scale;

    if m.iter().any(|v| !v.is_finite()) || m.determinant().abs() < 1e-9 {
        return None;
    }
    Some(Homography(m))
}

/// Inverse-map every template pixel into the scan with bilinear sampling.
/// Pixels that fall outside the scan are black.
fn warp_perspective(
    target: &DynamicImage,
    homography: &Homography,
    out_w: u32,
    out_h: u32,
) -> Option<DynamicImage> {
    let inverse = homography.inverse()?;
    let src = target.to_rgb8();
    let (src_w, src_h) = src.dimensions();
    let mut out = RgbImage::new(out_w, out_h);
    let (max_x, max_y) = (f64::from(src_w) - 1.0, f64::from(src_h) - 1.0);

    for (x, y, pixel) in out.enumerate_pixels_mut() {
        if let Some((sx, sy)) = inverse.apply(f64::from(x), f64::from(y)) {
            // The last row and column are valid samples; bilinear clamps its neighbours
            if sx >= 0.0 && sy >= 0.0 && sx <= max_x && sy <= max_y {
                *pixel = bilinear(&src, sx as f32, sy as f32);
            }
        }
    }

    Some(DynamicImage::ImageRgb8(out))
}

fn bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let x1 = x.floor() as u32;
    let y1 = y.floor() as u32;
    let x2 = (x1 + 1).min(image.width() - 1);
    let y2 = (y1 + 1).min(image.height() - 1);
    let dx = x - x1 as f32;
    let dy = y - y1 as f32;

    let p11 = image.get_pixel(x1, y1);
    let p12 = image.get_pixel(x1, y2);
    let p21 = image.get_pixel(x2, y1);
    let p22 = image.get_pixel(x2, y2);

    let mut result = [0u8; 3];
    for (i, channel) in result.iter_mut().enumerate() {
        let value = (1.0 - dx) * (1.0 - dy) * f32::from(p11[i])
            + dx * (1.0 - dy) * f32::from(p21[i])
            + (1.0 - dx) * dy * f32::from(p12[i])
            + dx * dy * f32::from(p22[i]);
        *channel = value.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(result)
}
