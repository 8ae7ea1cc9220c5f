//! Video decode/encode built on ffmpeg.
//!
//! Everything in this module is blocking and must run on the blocking pool
//! (`tokio::task::spawn_blocking`) or a dedicated thread, never on the event
//! loop. The session layer owns that delegation.

mod decode;
mod encode;

pub use decode::{decode_frames, probe};
pub use encode::VideoEncoder;

use std::sync::Once;

use ffmpeg_the_third as ffmpeg;
use serde::Serialize;

static FFMPEG_INIT: Once = Once::new();

/// Initializes libav once per process. Safe to call repeatedly.
pub fn init() {
    FFMPEG_INIT.call_once(|| {
        if let Err(e) = ffmpeg::init() {
            log::error!("[Media] ffmpeg init failed: {}", e);
        }
    });
}

/// One decoded frame: tightly packed RGB24 pixels.
#[derive(Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// `width * height * 3` bytes, row-major, no stride padding.
    pub data: Vec<u8>,
}

impl Frame {
    /// An all-black frame of the given dimensions, used to fill gaps when a
    /// session finalizes with missing indices.
    pub fn zero(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0u8; width as usize * height as usize * 3],
        }
    }

    pub fn is_zero(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }

    /// Encodes the frame as PNG (the interchange format on the work queue
    /// and in the artifact directory). Blocking.
    pub fn to_png(&self) -> crate::error::FramecastResult<Vec<u8>> {
        use image::ImageEncoder;

        let mut out = Vec::new();
        let encoder = image::codecs::png::PngEncoder::new(&mut out);
        encoder
            .write_image(
                &self.data,
                self.width,
                self.height,
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|e| crate::error::FramecastError::MediaEncode(format!("png encode: {}", e)))?;
        Ok(out)
    }

    /// Decodes a PNG (or any format `image` recognizes) into RGB24. Blocking.
    pub fn from_png(bytes: &[u8]) -> crate::error::FramecastResult<Self> {
        let img = image::load_from_memory(bytes)
            .map_err(|e| crate::error::FramecastError::MediaDecode(format!("png decode: {}", e)))?
            .into_rgb8();
        Ok(Self {
            width: img.width(),
            height: img.height(),
            data: img.into_raw(),
        })
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Properties derived from the source video during decode.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct VideoProperties {
    pub fps: f64,
    pub total_frames: u64,
    pub width: u32,
    pub height: u32,
}

impl VideoProperties {
    /// `"{width}x{height}"`, the form published to the state store.
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_frame_has_expected_size() {
        let frame = Frame::zero(640, 480);
        assert_eq!(frame.data.len(), 640 * 480 * 3);
        assert!(frame.is_zero());
    }

    #[test]
    fn png_round_trip_preserves_pixels() {
        let mut frame = Frame::zero(3, 2);
        frame.data[0] = 200;
        frame.data[4] = 100;
        let png = frame.to_png().unwrap();
        let decoded = Frame::from_png(&png).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn resolution_formats_as_wxh() {
        let props = VideoProperties {
            fps: 30.0,
            total_frames: 150,
            width: 640,
            height: 480,
        };
        assert_eq!(props.resolution(), "640x480");
    }
}
