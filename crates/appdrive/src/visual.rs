//! Screenshot comparison.
//!
//! Identical encodings short-circuit on their SHA-256. Otherwise both images
//! are decoded and compared pixel by pixel: a pixel differs when any RGBA
//! channel differs by more than the per-channel tolerance, and the images
//! match when the share of differing pixels is at most the threshold.
//! Images of different sizes never match.

use crate::error::Result;
use image::{ImageFormat, Pixel, Rgba, RgbaImage};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::io::Cursor;

/// How much two screenshots may differ and still match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageTolerance {
    /// Maximum percentage (0-100) of differing pixels.
    pub threshold_percent: f64,
    /// Largest per-channel difference that still counts as equal.
    pub pixel_tolerance: u8,
}

impl Default for ImageTolerance {
    fn default() -> Self {
        Self {
            threshold_percent: 0.1,
            pixel_tolerance: 5,
        }
    }
}

/// Result of comparing a candidate screenshot against its baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageComparison {
    /// Whether the images match within tolerance
    pub matches: bool,
    /// Percentage of pixels that differ
    pub diff_percent: f64,
    /// Number of differing pixels
    pub diff_pixels: u64,
    /// Pixels compared (the larger image's area on a size mismatch)
    pub total_pixels: u64,
    /// Baseline and candidate sizes, when they differ
    pub size_mismatch: Option<((u32, u32), (u32, u32))>,
    /// Threshold the comparison was judged against
    pub threshold_percent: f64,
    /// PNG highlighting differing pixels in red, if any differ
    pub diff_image: Option<Vec<u8>>,
    /// SHA-256 of the baseline encoding
    pub baseline_hash: String,
    /// SHA-256 of the candidate encoding
    pub candidate_hash: String,
}

impl ImageComparison {
    /// One-line summary for diff listings.
    #[must_use]
    pub fn summary(&self) -> String {
        match self.size_mismatch {
            Some((baseline, candidate)) => format!(
                "size changed from {}x{} to {}x{}",
                baseline.0, baseline.1, candidate.0, candidate.1
            ),
            None => format!(
                "{:.2}% of pixels differ (threshold {:.2}%)",
                self.diff_percent, self.threshold_percent
            ),
        }
    }
}

/// Hex-encoded SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn pixels_differ(a: &Rgba<u8>, b: &Rgba<u8>, tolerance: u8) -> bool {
    a.channels()
        .iter()
        .zip(b.channels())
        .any(|(x, y)| x.abs_diff(*y) > tolerance)
}

/// Compares two PNG encodings.
///
/// # Errors
///
/// `Image` if either buffer is not a decodable image.
pub fn compare_png(
    baseline: &[u8],
    candidate: &[u8],
    tolerance: &ImageTolerance,
) -> Result<ImageComparison> {
    let baseline_hash = sha256_hex(baseline);
    let candidate_hash = sha256_hex(candidate);

    let baseline_img = image::load_from_memory(baseline)?.to_rgba8();
    let candidate_img = image::load_from_memory(candidate)?.to_rgba8();
    let baseline_dims = baseline_img.dimensions();
    let candidate_dims = candidate_img.dimensions();
    let (width, height) = (
        baseline_dims.0.max(candidate_dims.0),
        baseline_dims.1.max(candidate_dims.1),
    );
    let total_pixels = u64::from(width) * u64::from(height);

    if baseline_hash == candidate_hash {
        tracing::trace!("screenshots are byte-identical");
        return Ok(ImageComparison {
            matches: true,
            diff_percent: 0.0,
            diff_pixels: 0,
            total_pixels,
            size_mismatch: None,
            threshold_percent: tolerance.threshold_percent,
            diff_image: None,
            baseline_hash,
            candidate_hash,
        });
    }

    let mut diff_img = RgbaImage::new(width, height);
    let mut diff_pixels = 0u64;
    let red = Rgba([255, 0, 0, 255]);

    for y in 0..height {
        for x in 0..width {
            let pair = (
                baseline_img.get_pixel_checked(x, y),
                candidate_img.get_pixel_checked(x, y),
            );
            match pair {
                (Some(b), Some(c)) if !pixels_differ(b, c, tolerance.pixel_tolerance) => {
                    let [r, g, bl, _] = c.0;
                    diff_img.put_pixel(x, y, Rgba([r / 2, g / 2, bl / 2, 128]));
                }
                _ => {
                    diff_pixels += 1;
                    diff_img.put_pixel(x, y, red);
                }
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    let diff_percent = if total_pixels == 0 {
        0.0
    } else {
        diff_pixels as f64 / total_pixels as f64 * 100.0
    };
    let size_mismatch =
        (baseline_dims != candidate_dims).then_some((baseline_dims, candidate_dims));
    let matches = size_mismatch.is_none() && diff_percent <= tolerance.threshold_percent;

    let diff_image = if diff_pixels > 0 {
        let mut bytes = Vec::new();
        diff_img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Some(bytes)
    } else {
        None
    };

    if !matches {
        tracing::debug!(diff_percent, ?size_mismatch, "screenshot differs from baseline");
    }

    Ok(ImageComparison {
        matches,
        diff_percent,
        diff_pixels,
        total_pixels,
        size_mismatch,
        threshold_percent: tolerance.threshold_percent,
        diff_image,
        baseline_hash,
        candidate_hash,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Encodes a solid image with optional overrides as PNG.
    pub(crate) fn png(
        width: u32,
        height: u32,
        fill: [u8; 4],
        overrides: &[(u32, u32, [u8; 4])],
    ) -> Vec<u8> {
        let mut img = RgbaImage::from_pixel(width, height, Rgba(fill));
        for &(x, y, px) in overrides {
            img.put_pixel(x, y, Rgba(px));
        }
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    const WHITE: [u8; 4] = [255, 255, 255, 255];

    #[test]
    fn identical_images_match_by_hash() {
        let a = png(10, 10, WHITE, &[]);
        let result = compare_png(&a, &a, &ImageTolerance::default()).unwrap();
        assert!(result.matches);
        assert_eq!(result.baseline_hash, result.candidate_hash);
        assert!(result.diff_image.is_none());
    }

    #[test]
    fn small_channel_noise_is_tolerated() {
        let a = png(10, 10, WHITE, &[]);
        let b = png(10, 10, WHITE, &[(3, 3, [252, 253, 255, 255])]);
        let result = compare_png(&a, &b, &ImageTolerance::default()).unwrap();
        assert!(result.matches);
        assert_eq!(result.diff_pixels, 0);
    }

    #[test]
    fn changed_pixels_exceeding_threshold_mismatch() {
        let a = png(10, 10, WHITE, &[]);
        let b = png(10, 10, WHITE, &[(0, 0, [0, 0, 0, 255])]);

        let strict = compare_png(&a, &b, &ImageTolerance::default()).unwrap();
        assert!(!strict.matches);
        assert_eq!(strict.diff_pixels, 1);
        assert!((strict.diff_percent - 1.0).abs() < f64::EPSILON);
        assert!(strict.diff_image.is_some());

        let lenient = ImageTolerance {
            threshold_percent: 5.0,
            ..ImageTolerance::default()
        };
        assert!(compare_png(&a, &b, &lenient).unwrap().matches);
    }

    #[test]
    fn size_change_never_matches() {
        let a = png(10, 10, WHITE, &[]);
        let b = png(10, 12, WHITE, &[]);
        let lenient = ImageTolerance {
            threshold_percent: 100.0,
            pixel_tolerance: 255,
        };
        let result = compare_png(&a, &b, &lenient).unwrap();
        assert!(!result.matches);
        assert_eq!(result.size_mismatch, Some(((10, 10), (10, 12))));
        assert_eq!(result.summary(), "size changed from 10x10 to 10x12");
    }

    #[test]
    fn undecodable_input_is_an_error() {
        let a = png(2, 2, WHITE, &[]);
        assert!(compare_png(&a, b"not a png", &ImageTolerance::default()).is_err());
    }

    #[test]
    fn hash_is_lowercase_hex() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
