// encode.rs: Turns a full-resolution frame into a transmittable payload.
// Frames are downscaled to the analysis width and JPEG-encoded under a byte
// budget before base64.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, DynamicImage, GenericImageView};

/// Lowest JPEG quality tried when squeezing a frame under the byte budget.
const MIN_JPEG_QUALITY: u8 = 30;
const QUALITY_STEP: u8 = 10;

/// An encoded frame ready to hand to an `AiProvider`.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFrame {
    /// Base64-encoded JPEG image data
    pub data: String,
    /// Width of the (possibly downscaled) image
    pub width: u32,
    /// Height of the (possibly downscaled) image
    pub height: u32,
    /// Size of the JPEG before base64
    pub byte_len: usize,
}

impl EncodedFrame {
    pub fn data_url(&self) -> String {
        format!("data:image/jpeg;base64,{}", self.data)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("frame has no pixels")]
    EmptyFrame,
    #[error("jpeg encode: {0}")]
    Jpeg(#[from] image::ImageError),
    #[error("encoder produced an empty payload")]
    EmptyPayload,
    #[error("encode task failed: {0}")]
    Join(String),
}

/// Converts captured frames into payloads. May fail; never blocks the caller.
#[async_trait]
pub trait FrameEncoder: Send + Sync {
    async fn encode(
        &self,
        frame: &DynamicImage,
        target_width: u32,
    ) -> Result<EncodedFrame, EncodeError>;
}

/// JPEG encoder with a payload size bound.
///
/// Starts at `quality` and steps down by 10 (never below 30) until the JPEG
/// fits in `max_bytes`. If even the floor quality is too large the floor
/// result is returned anyway; the backend decides whether to reject it.
#[derive(Debug, Clone)]
pub struct JpegFrameEncoder {
    quality: u8,
    max_bytes: usize,
}

impl JpegFrameEncoder {
    pub fn new(quality: u8, max_bytes: usize) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            max_bytes,
        }
    }
}

#[async_trait]
impl FrameEncoder for JpegFrameEncoder {
    async fn encode(
        &self,
        frame: &DynamicImage,
        target_width: u32,
    ) -> Result<EncodedFrame, EncodeError> {
        // Tens of milliseconds per full frame.
        let frame = frame.clone();
        let encoder = self.clone();
        tokio::task::spawn_blocking(move || encoder.encode_blocking(&frame, target_width))
            .await
            .map_err(|e| EncodeError::Join(e.to_string()))?
    }
}

impl JpegFrameEncoder {
    pub fn encode_blocking(
        &self,
        frame: &DynamicImage,
        target_width: u32,
    ) -> Result<EncodedFrame, EncodeError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(EncodeError::EmptyFrame);
        }

        let img = downscale_to_width(frame, target_width);
        let (w, h) = img.dimensions();
        let rgb = img.to_rgb8();

        let mut quality = self.quality;
        let jpeg_buf = loop {
            let mut buf: Vec<u8> = Vec::new();
            JpegEncoder::new_with_quality(&mut buf, quality).encode(
                rgb.as_raw(),
                w,
                h,
                image::ExtendedColorType::Rgb8,
            )?;

            if buf.len() <= self.max_bytes || quality <= MIN_JPEG_QUALITY {
                if buf.len() > self.max_bytes {
                    log::warn!(
                        "Frame still {} bytes at quality {} (budget {})",
                        buf.len(),
                        quality,
                        self.max_bytes
                    );
                }
                break buf;
            }
            quality = quality.saturating_sub(QUALITY_STEP).max(MIN_JPEG_QUALITY);
        };

        if jpeg_buf.is_empty() {
            return Err(EncodeError::EmptyPayload);
        }

        log::debug!(
            "Encoded frame {}x{} at quality {} ({} bytes)",
            w,
            h,
            quality,
            jpeg_buf.len()
        );

        Ok(EncodedFrame {
            data: BASE64.encode(&jpeg_buf),
            width: w,
            height: h,
            byte_len: jpeg_buf.len(),
        })
    }
}

/// Downscale to `max_width`, preserving aspect ratio. Narrower frames are
/// returned as-is.
pub fn downscale_to_width(img: &DynamicImage, max_width: u32) -> DynamicImage {
    if max_width == 0 || img.width() <= max_width {
        return img.clone();
    }
    let ratio = max_width as f64 / img.width() as f64;
    let new_h = ((img.height() as f64 * ratio).round() as u32).max(1);
    img.resize_exact(max_width, new_h, imageops::FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;

    /// Helper: a noisy image so JPEG can't compress it to nothing.
    fn noisy_image(w: u32, h: u32) -> DynamicImage {
        let mut img = RgbaImage::new(w, h);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            let v = ((x * 31 + y * 17) ^ (x * y)) as u8;
            *pixel = image::Rgba([v, v.wrapping_mul(3), v.wrapping_add(91), 255]);
        }
        DynamicImage::ImageRgba8(img)
    }

    #[test]
    fn downscale_preserves_aspect_ratio() {
        let img = noisy_image(2000, 1000);
        let small = downscale_to_width(&img, 1024);
        assert_eq!(small.dimensions(), (1024, 512));
    }

    #[test]
    fn narrow_frames_are_not_upscaled() {
        let img = noisy_image(640, 480);
        assert_eq!(downscale_to_width(&img, 1024).dimensions(), (640, 480));
    }

    #[test]
    fn encodes_to_base64_jpeg() {
        let encoder = JpegFrameEncoder::new(75, 1024 * 1024);
        let out = encoder.encode_blocking(&noisy_image(320, 240), 160).unwrap();
        assert_eq!((out.width, out.height), (160, 120));
        assert!(out.byte_len > 0);
        let jpeg = BASE64.decode(&out.data).unwrap();
        assert_eq!(jpeg.len(), out.byte_len);
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8], "payload must start with a JPEG SOI marker");
    }

    #[test]
    fn quality_steps_down_to_fit_budget() {
        let img = noisy_image(400, 300);
        let generous = JpegFrameEncoder::new(95, usize::MAX)
            .encode_blocking(&img, 400)
            .unwrap();
        let tight = JpegFrameEncoder::new(95, generous.byte_len / 2)
            .encode_blocking(&img, 400)
            .unwrap();
        assert!(tight.byte_len < generous.byte_len);
    }

    #[test]
    fn empty_frame_is_rejected() {
        let encoder = JpegFrameEncoder::new(75, 1024);
        let empty = DynamicImage::ImageRgba8(RgbaImage::new(0, 0));
        assert!(matches!(
            encoder.encode_blocking(&empty, 100),
            Err(EncodeError::EmptyFrame)
        ));
    }

    #[tokio::test]
    async fn async_encode_runs_off_thread() {
        let encoder = JpegFrameEncoder::new(75, 1024 * 1024);
        let out = encoder.encode(&noisy_image(64, 64), 32).await.unwrap();
        assert_eq!(out.width, 32);
        assert!(out.data_url().starts_with("data:image/jpeg;base64,"));
    }
}
