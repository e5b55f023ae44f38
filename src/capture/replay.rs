// replay.rs: Plays a directory of still images back as a live video source.
//
// Frames are chosen by wall-clock time since the first read, so a slow
// consumer skips frames instead of slowing the "camera" down.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use image::DynamicImage;

use super::sampler::VideoSource;

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("failed to read frame directory {0}: {1}")]
    ReadDir(String, std::io::Error),
    #[error("no .jpg/.jpeg/.png frames in {0}")]
    Empty(String),
    #[error("fps must be a positive frame rate with a representable interval, got {0}")]
    InvalidFps(f64),
}

pub struct ImageSequenceSource {
    frames: Vec<PathBuf>,
    frame_interval: Duration,
    looped: bool,
    started_at: Option<Instant>,
    /// Decoded frame cache: (index, image)
    current: Option<(usize, DynamicImage)>,
    dimensions: Option<(u32, u32)>,
}

impl ImageSequenceSource {
    /// Collect every image file in `dir`, sorted by file name.
    pub fn open(dir: &Path, fps: f64, looped: bool) -> Result<Self, ReplayError> {
        let frame_interval = frame_interval_for(fps)?;

        let mut frames: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| ReplayError::ReadDir(dir.display().to_string(), e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| is_frame_file(p))
            .collect();
        frames.sort();

        if frames.is_empty() {
            return Err(ReplayError::Empty(dir.display().to_string()));
        }

        log::info!(
            "Replay source: {} frames from {} at {:.1} fps",
            frames.len(),
            dir.display(),
            fps
        );

        Ok(Self {
            frames,
            frame_interval,
            looped,
            started_at: None,
            current: None,
            dimensions: None,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Time to play every frame once.
    pub fn playback_length(&self) -> Duration {
        u32::try_from(self.frames.len())
            .ok()
            .and_then(|n| self.frame_interval.checked_mul(n))
            .unwrap_or(Duration::MAX)
    }

    /// Which frame should be showing `elapsed` after playback started.
    /// `None` once a non-looping sequence has run out.
    fn index_at(&self, elapsed: Duration) -> Option<usize> {
        let step = (elapsed.as_secs_f64() / self.frame_interval.as_secs_f64()) as usize;
        if self.looped {
            Some(step % self.frames.len())
        } else if step < self.frames.len() {
            Some(step)
        } else {
            None
        }
    }

    fn load(&mut self, index: usize) -> Option<DynamicImage> {
        if let Some((cached, img)) = &self.current {
            if *cached == index {
                return Some(img.clone());
            }
        }
        let path = &self.frames[index];
        match image::open(path) {
            Ok(img) => {
                self.dimensions = Some((img.width(), img.height()));
                self.current = Some((index, img.clone()));
                Some(img)
            }
            Err(e) => {
                log::warn!("Skipping unreadable frame {}: {}", path.display(), e);
                None
            }
        }
    }
}

/// One frame's display time at `fps`. Rejects rates that are not finite and
/// positive, or whose interval does not fit a non-zero `Duration`.
pub fn frame_interval_for(fps: f64) -> Result<Duration, ReplayError> {
    if !fps.is_finite() || fps <= 0.0 {
        return Err(ReplayError::InvalidFps(fps));
    }
    match Duration::try_from_secs_f64(1.0 / fps) {
        Ok(interval) if !interval.is_zero() => Ok(interval),
        _ => Err(ReplayError::InvalidFps(fps)),
    }
}

fn is_frame_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
        .unwrap_or(false)
}

impl VideoSource for ImageSequenceSource {
    fn is_ready(&self) -> bool {
        match self.started_at {
            None => true,
            Some(start) => self.index_at(start.elapsed()).is_some(),
        }
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions
    }

    fn current_frame(&mut self) -> Option<DynamicImage> {
        let start = *self.started_at.get_or_insert_with(Instant::now);
        let index = self.index_at(start.elapsed())?;
        self.load(index)
    }
}
