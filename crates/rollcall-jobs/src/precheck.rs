//! Image quality pre-check.
//!
//! Rejects photos that OCR cannot be expected to read before any external
//! service is called. Checks run in order: decode, resolution, sharpness,
//! skew. The first failure decides the reason.
//!
//! Sharpness is the variance of a 3x3 Laplacian over a grayscale copy.
//! Skew is estimated with a projection profile: for each candidate angle the
//! dark pixels are binned along that direction and the angle whose profile
//! has the sharpest row-to-row transitions wins.

use image::{DynamicImage, GrayImage};
use tracing::debug;

use rollcall_core::{defaults, Error, Result};

/// Luma below which a pixel counts as ink.
const INK_THRESHOLD: u8 = 128;

/// Below this share of ink pixels there is not enough content to estimate skew.
const MIN_INK_FRACTION: f64 = 0.02;

/// Skew search range and step, in degrees.
const SKEW_SEARCH_DEGREES: f32 = 20.0;
const SKEW_STEP_DEGREES: f32 = 0.5;

/// Only every Nth column is sampled for the projection profile.
const SKEW_SAMPLE_STRIDE: usize = 4;

pub const REASON_UNREADABLE: &str = "unreadable image";
pub const REASON_LOW_RESOLUTION: &str = "low resolution";
pub const REASON_BLURRY: &str = "image too blurry";
pub const REASON_SKEWED: &str = "image skewed beyond tolerance";

/// Pre-check thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct PrecheckConfig {
    pub min_width: u32,
    pub min_height: u32,
    pub min_sharpness: f32,
    pub max_skew_degrees: f32,
    /// Longest edge of the copy analysed for sharpness and skew.
    pub analysis_edge: u32,
}

impl Default for PrecheckConfig {
    fn default() -> Self {
        Self {
            min_width: defaults::PRECHECK_MIN_WIDTH,
            min_height: defaults::PRECHECK_MIN_HEIGHT,
            min_sharpness: defaults::PRECHECK_MIN_SHARPNESS,
            max_skew_degrees: defaults::PRECHECK_MAX_SKEW_DEGREES,
            analysis_edge: defaults::PRECHECK_ANALYSIS_EDGE,
        }
    }
}

impl PrecheckConfig {
    /// Load thresholds from `PRECHECK_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            min_width: env_or("PRECHECK_MIN_WIDTH", d.min_width),
            min_height: env_or("PRECHECK_MIN_HEIGHT", d.min_height),
            min_sharpness: env_or("PRECHECK_MIN_SHARPNESS", d.min_sharpness),
            max_skew_degrees: env_or("PRECHECK_MAX_SKEW_DEGREES", d.max_skew_degrees),
            analysis_edge: env_or("PRECHECK_ANALYSIS_EDGE", d.analysis_edge),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Measurements taken during the check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageMetrics {
    pub width: u32,
    pub height: u32,
    pub sharpness: Option<f32>,
    /// `None` when the image had too little ink to estimate.
    pub skew_degrees: Option<f32>,
}

/// Outcome of a pre-check.
#[derive(Debug, Clone, PartialEq)]
pub struct PrecheckOutcome {
    pub ok: bool,
    pub reason: Option<String>,
    pub metrics: ImageMetrics,
}

impl PrecheckOutcome {
    fn pass(metrics: ImageMetrics) -> Self {
        Self {
            ok: true,
            reason: None,
            metrics,
        }
    }

    fn reject(reason: &str, metrics: ImageMetrics) -> Self {
        Self {
            ok: false,
            reason: Some(reason.to_string()),
            metrics,
        }
    }

    /// Convert a rejection into `Error::InputDefect`.
    pub fn into_result(self) -> Result<ImageMetrics> {
        match self.reason {
            Some(reason) if !self.ok => Err(Error::InputDefect(reason)),
            _ => Ok(self.metrics),
        }
    }
}

/// Stateless image pre-check.
#[derive(Debug, Clone, Default)]
pub struct ImagePrecheck {
    config: PrecheckConfig,
}

impl ImagePrecheck {
    pub fn new(config: PrecheckConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PrecheckConfig {
        &self.config
    }

    /// Run every check against encoded image bytes. CPU-bound; call from
    /// `spawn_blocking` in async contexts.
    pub fn check(&self, bytes: &[u8]) -> PrecheckOutcome {
        let img = match image::load_from_memory(bytes) {
            Ok(img) => img,
            Err(e) => {
                debug!(error = %e, "precheck: decode failed");
                return PrecheckOutcome::reject(REASON_UNREADABLE, ImageMetrics::default());
            }
        };

        let mut metrics = ImageMetrics {
            width: img.width(),
            height: img.height(),
            ..Default::default()
        };

        if metrics.width < self.config.min_width || metrics.height < self.config.min_height {
            return PrecheckOutcome::reject(REASON_LOW_RESOLUTION, metrics);
        }

        let gray = analysis_copy(&img, self.config.analysis_edge);

        let sharpness = laplacian_variance(&gray);
        metrics.sharpness = Some(sharpness);
        if sharpness < self.config.min_sharpness {
            return PrecheckOutcome::reject(REASON_BLURRY, metrics);
        }

        metrics.skew_degrees = estimate_skew(&gray);
        if let Some(angle) = metrics.skew_degrees {
            if angle.abs() > self.config.max_skew_degrees {
                return PrecheckOutcome::reject(REASON_SKEWED, metrics);
            }
        }

        debug!(
            width = metrics.width,
            height = metrics.height,
            sharpness,
            skew = ?metrics.skew_degrees,
            "precheck: passed"
        );
        PrecheckOutcome::pass(metrics)
    }
}

fn analysis_copy(img: &DynamicImage, edge: u32) -> GrayImage {
    if img.width().max(img.height()) > edge {
        img.thumbnail(edge, edge).to_luma8()
    } else {
        img.to_luma8()
    }
}

/// Variance of the 3x3 Laplacian response. Low values mean few edges.
pub fn laplacian_variance(img: &GrayImage) -> f32 {
    let (w, h) = img.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0u64;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let center = img.get_pixel(x, y)[0] as f64;
            let top = img.get_pixel(x, y - 1)[0] as f64;
            let bottom = img.get_pixel(x, y + 1)[0] as f64;
            let left = img.get_pixel(x - 1, y)[0] as f64;
            let right = img.get_pixel(x + 1, y)[0] as f64;

            let lap = top + bottom + left + right - 4.0 * center;
            sum += lap;
            sum_sq += lap * lap;
            count += 1;
        }
    }

    let mean = sum / count as f64;
    (sum_sq / count as f64 - mean * mean) as f32
}

/// Dominant text-line angle in degrees, or `None` with too little ink.
pub fn estimate_skew(img: &GrayImage) -> Option<f32> {
    let (w, h) = img.dimensions();
    let ink: Vec<(f32, f32)> = (0..h)
        .flat_map(|y| (0..w).step_by(SKEW_SAMPLE_STRIDE).map(move |x| (x, y)))
        .filter(|&(x, y)| img.get_pixel(x, y)[0] < INK_THRESHOLD)
        .map(|(x, y)| (x as f32, y as f32))
        .collect();

    let sampled = (w as usize).div_ceil(SKEW_SAMPLE_STRIDE) * h as usize;
    if sampled == 0 || (ink.len() as f64) < MIN_INK_FRACTION * sampled as f64 {
        return None;
    }

    let steps = (SKEW_SEARCH_DEGREES / SKEW_STEP_DEGREES).round() as i32;
    let mut best_angle = 0.0f32;
    let mut best_score = f64::MIN;

    // Zero first so flat profiles keep the unskewed reading.
    let mut candidates: Vec<i32> = vec![0];
    candidates.extend((1..=steps).flat_map(|i| [i, -i]));

    for step in candidates {
        let angle = step as f32 * SKEW_STEP_DEGREES;
        let score = profile_sharpness(&ink, w as f32, h as usize, angle);
        if score > best_score {
            best_score = score;
            best_angle = angle;
        }
    }

    Some(best_angle)
}

/// Sum of squared differences between adjacent bins when ink is projected
/// along lines of the given angle.
fn profile_sharpness(ink: &[(f32, f32)], width: f32, height: usize, angle_deg: f32) -> f64 {
    let slope = angle_deg.to_radians().tan();
    // Bins may shift up by at most width * |slope|.
    let offset = (width * slope.abs()).ceil() as usize;
    let mut bins = vec![0u32; height + 2 * offset + 1];

    for &(x, y) in ink {
        let projected = y - x * slope + offset as f32;
        if projected >= 0.0 {
            if let Some(bin) = bins.get_mut(projected.round() as usize) {
                *bin += 1;
            }
        }
    }

    bins.windows(2)
        .map(|pair| {
            let d = pair[1] as f64 - pair[0] as f64;
            d * d
        })
        .sum()
}
