// sampler.rs: Throttled pull of low-resolution samples from a live source.

use std::time::{Duration, Instant};

use image::DynamicImage;

use super::motion::FrameSample;

/// A live video source the scheduler can read from.
///
/// The scheduler never mutates the stream; `&mut self` only lets
/// implementations advance internal decode state.
pub trait VideoSource: Send {
    /// `false` until the source can hand out readable frames.
    fn is_ready(&self) -> bool;

    /// Native frame size, once known.
    fn dimensions(&self) -> Option<(u32, u32)>;

    /// The frame currently being shown, at full resolution.
    fn current_frame(&mut self) -> Option<DynamicImage>;
}

/// Pulls at most one `FrameSample` per `min_interval`, however often it is
/// asked.
#[derive(Debug)]
pub struct FrameSampler {
    min_interval: Duration,
    grid_size: u32,
    last_sampled_at: Option<Instant>,
}

impl FrameSampler {
    pub fn new(min_interval: Duration, grid_size: u32) -> Self {
        Self {
            min_interval,
            grid_size,
            last_sampled_at: None,
        }
    }

    /// Returns a fresh sample, or `None` when throttled or when the source has
    /// nothing readable yet. An unready source still consumes the slot, so a
    /// dead source is polled at the sampling rate rather than every tick.
    pub fn sample(&mut self, source: &mut dyn VideoSource, now: Instant) -> Option<FrameSample> {
        if let Some(last) = self.last_sampled_at {
            if now.saturating_duration_since(last) < self.min_interval {
                return None;
            }
        }
        self.last_sampled_at = Some(now);

        if !source.is_ready() {
            log::trace!("Video source not ready, holding score");
            return None;
        }

        let frame = source.current_frame()?;
        Some(FrameSample::from_frame(&frame, self.grid_size))
    }

    pub fn last_sampled_at(&self) -> Option<Instant> {
        self.last_sampled_at
    }
}
