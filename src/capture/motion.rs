// motion.rs: Scores camera stability from two consecutive low-res samples.

use image::{imageops, DynamicImage};

/// Rec. 601 luma weights.
const LUMA_R: f64 = 0.299;
const LUMA_G: f64 = 0.587;
const LUMA_B: f64 = 0.114;

/// Score returned when there is nothing to compare against.
pub const UNSETTLED_SCORE: f64 = 0.0;

/// A `size x size` grid of RGB cells downsampled from one video frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSample {
    size: u32,
    cells: Vec<[u8; 3]>,
}

impl FrameSample {
    /// Downsample `frame` to a `grid_size x grid_size` grid.
    pub fn from_frame(frame: &DynamicImage, grid_size: u32) -> Self {
        let small = imageops::resize(
            &frame.to_rgb8(),
            grid_size,
            grid_size,
            imageops::FilterType::Triangle,
        );
        Self {
            size: grid_size,
            cells: small.pixels().map(|p| p.0).collect(),
        }
    }

    /// Build a sample from raw cells (row-major). Returns `None` when the
    /// cell count does not match `size * size`.
    pub fn from_cells(size: u32, cells: Vec<[u8; 3]>) -> Option<Self> {
        if cells.len() != (size as usize) * (size as usize) {
            return None;
        }
        Some(Self { size, cells })
    }

    /// A grid where every cell has the same colour.
    pub fn uniform(size: u32, rgb: [u8; 3]) -> Self {
        Self {
            size,
            cells: vec![rgb; (size as usize) * (size as usize)],
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn cells(&self) -> &[[u8; 3]] {
        &self.cells
    }
}

/// Perceptual luminance of one RGB cell, 0.0–255.0.
pub fn luminance(rgb: [u8; 3]) -> f64 {
    LUMA_R * rgb[0] as f64 + LUMA_G * rgb[1] as f64 + LUMA_B * rgb[2] as f64
}

/// Converts the mean per-cell luminance change into a 0–100 stability score.
///
/// `score = clamp(100 - mean_abs_diff * sensitivity, 0, 100)`. With the
/// default sensitivity of 4, a mean shift of 25 luminance levels already
/// reads as "moving".
#[derive(Debug, Clone, Copy)]
pub struct MotionScorer {
    sensitivity: f64,
}

impl MotionScorer {
    pub fn new(sensitivity: f64) -> Self {
        Self { sensitivity }
    }

    pub fn score(&self, current: &FrameSample, previous: Option<&FrameSample>) -> f64 {
        let previous = match previous {
            Some(p) => p,
            None => return UNSETTLED_SCORE,
        };

        if previous.size != current.size || current.cells.is_empty() {
            log::warn!(
                "Sample grids differ ({} vs {}), treating as unstable",
                previous.size,
                current.size
            );
            return UNSETTLED_SCORE;
        }

        let total: f64 = current
            .cells
            .iter()
            .zip(previous.cells.iter())
            .map(|(&a, &b)| (luminance(a) - luminance(b)).abs())
            .sum();
        let mean_diff = total / current.cells.len() as f64;

        (100.0 - mean_diff * self.sensitivity).clamp(0.0, 100.0)
    }
}
