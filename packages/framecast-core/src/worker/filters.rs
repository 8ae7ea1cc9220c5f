//! Frame filters applied by workers.
//!
//! Leaf pure functions over an RGB24 frame, plus the two stateful helpers
//! the worker caches: a face detector (one per worker process) and a motion
//! detector (one per session, because motion needs the previous frame).

use image::{imageops, RgbImage};

use crate::error::{FramecastError, FramecastResult};
use crate::media::Frame;

fn to_image(frame: &Frame) -> FramecastResult<RgbImage> {
    RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
        .ok_or_else(|| FramecastError::Internal("frame buffer size mismatch".into()))
}

fn from_image(img: RgbImage) -> Frame {
    Frame {
        width: img.width(),
        height: img.height(),
        data: img.into_raw(),
    }
}

fn grayscale(frame: &Frame) -> Vec<u8> {
    frame
        .data
        .chunks_exact(3)
        .map(|px| ((px[0] as u32 * 299 + px[1] as u32 * 587 + px[2] as u32 * 114) / 1000) as u8)
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Blur
// ─────────────────────────────────────────────────────────────────────────────

/// Gaussian or box blur. `kernel` is the aperture in pixels (odd, >= 3).
pub fn apply_blur(frame: &Frame, blur_type: &str, kernel: u32) -> FramecastResult<Frame> {
    let kernel = kernel.clamp(3, 255) | 1;
    match blur_type {
        "box" => Ok(box_blur(frame, kernel)),
        // Sigma ≈ kernel/6 keeps the gaussian support inside the aperture.
        _ => {
            let img = to_image(frame)?;
            let sigma = (kernel as f32 / 6.0).max(0.8);
            Ok(from_image(imageops::blur(&img, sigma)))
        }
    }
}

/// Separable mean blur, one horizontal and one vertical pass.
fn box_blur(frame: &Frame, kernel: u32) -> Frame {
    let w = frame.width as usize;
    let h = frame.height as usize;
    let r = (kernel / 2) as isize;

    let pass = |src: &[u8], horizontal: bool| -> Vec<u8> {
        let mut out = vec![0u8; src.len()];
        for y in 0..h {
            for x in 0..w {
                for c in 0..3 {
                    let mut sum = 0u32;
                    let mut count = 0u32;
                    for d in -r..=r {
                        let (sx, sy) = if horizontal {
                            (x as isize + d, y as isize)
                        } else {
                            (x as isize, y as isize + d)
                        };
                        if sx < 0 || sy < 0 || sx >= w as isize || sy >= h as isize {
                            continue;
                        }
                        sum += src[(sy as usize * w + sx as usize) * 3 + c] as u32;
                        count += 1;
                    }
                    out[(y * w + x) * 3 + c] = (sum / count.max(1)) as u8;
                }
            }
        }
        out
    };

    let horizontal = pass(&frame.data, true);
    Frame {
        width: frame.width,
        height: frame.height,
        data: pass(&horizontal, false),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Edges
// ─────────────────────────────────────────────────────────────────────────────

/// Sobel gradient magnitude, rendered as a grayscale RGB frame.
pub fn apply_edges(frame: &Frame, _edge_type: &str) -> FramecastResult<Frame> {
    let w = frame.width as usize;
    let h = frame.height as usize;
    let gray = grayscale(frame);

    let mut out = vec![0u8; w * h * 3];
    for y in 1..h.saturating_sub(1) {
        for x in 1..w.saturating_sub(1) {
            let px = |dx: isize, dy: isize| -> i32 {
                gray[(y as isize + dy) as usize * w + (x as isize + dx) as usize] as i32
            };
            let gx = -px(-1, -1) - 2 * px(-1, 0) - px(-1, 1)
                + px(1, -1)
                + 2 * px(1, 0)
                + px(1, 1);
            let gy = -px(-1, -1) - 2 * px(0, -1) - px(1, -1)
                + px(-1, 1)
                + 2 * px(0, 1)
                + px(1, 1);
            let mag = (((gx * gx + gy * gy) as f64).sqrt() as u32).min(255) as u8;
            let base = (y * w + x) * 3;
            out[base] = mag;
            out[base + 1] = mag;
            out[base + 2] = mag;
        }
    }

    Ok(Frame {
        width: frame.width,
        height: frame.height,
        data: out,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Faces
// ─────────────────────────────────────────────────────────────────────────────

/// Cell granularity of the skin-region grid.
const FACE_CELL: usize = 16;

/// Lightweight face detector cached once per worker process.
///
/// Scores 16x16 cells by skin-tone pixel density and merges adjacent hot
/// cells into boxes. Coarse, but cheap enough for per-frame use and entirely
/// self-contained.
#[derive(Default)]
pub struct FaceDetector;

impl FaceDetector {
    pub fn new() -> Self {
        Self
    }

    fn is_skin(px: &[u8]) -> bool {
        let (r, g, b) = (px[0] as i32, px[1] as i32, px[2] as i32);
        r > 95 && g > 40 && b > 20 && r > g && r > b && (r - g).abs() > 15
    }

    /// Returns detected regions as `(x, y, w, h)` boxes.
    pub fn detect(&self, frame: &Frame) -> Vec<(u32, u32, u32, u32)> {
        let w = frame.width as usize;
        let h = frame.height as usize;
        let cells_x = w.div_ceil(FACE_CELL);
        let cells_y = h.div_ceil(FACE_CELL);

        let mut hot = vec![false; cells_x * cells_y];
        for cy in 0..cells_y {
            for cx in 0..cells_x {
                let mut skin = 0usize;
                let mut total = 0usize;
                for y in (cy * FACE_CELL)..((cy + 1) * FACE_CELL).min(h) {
                    for x in (cx * FACE_CELL)..((cx + 1) * FACE_CELL).min(w) {
                        let base = (y * w + x) * 3;
                        if Self::is_skin(&frame.data[base..base + 3]) {
                            skin += 1;
                        }
                        total += 1;
                    }
                }
                hot[cy * cells_x + cx] = total > 0 && skin * 2 > total;
            }
        }

        // Greedy flood merge of adjacent hot cells into bounding boxes.
        let mut visited = vec![false; hot.len()];
        let mut boxes = Vec::new();
        for start in 0..hot.len() {
            if !hot[start] || visited[start] {
                continue;
            }
            let mut stack = vec![start];
            let (mut min_x, mut min_y) = (usize::MAX, usize::MAX);
            let (mut max_x, mut max_y) = (0usize, 0usize);
            let mut cells = 0usize;
            while let Some(cell) = stack.pop() {
                if visited[cell] || !hot[cell] {
                    continue;
                }
                visited[cell] = true;
                cells += 1;
                let (cx, cy) = (cell % cells_x, cell / cells_x);
                min_x = min_x.min(cx);
                min_y = min_y.min(cy);
                max_x = max_x.max(cx);
                max_y = max_y.max(cy);
                if cx > 0 {
                    stack.push(cell - 1);
                }
                if cx + 1 < cells_x {
                    stack.push(cell + 1);
                }
                if cy > 0 {
                    stack.push(cell - cells_x);
                }
                if cy + 1 < cells_y {
                    stack.push(cell + cells_x);
                }
            }
            // Single-cell blobs are noise, not faces.
            if cells >= 2 {
                boxes.push((
                    (min_x * FACE_CELL) as u32,
                    (min_y * FACE_CELL) as u32,
                    ((max_x - min_x + 1) * FACE_CELL) as u32,
                    ((max_y - min_y + 1) * FACE_CELL) as u32,
                ));
            }
        }
        boxes
    }
}

/// Draws detection boxes onto a copy of the frame.
pub fn detect_and_draw_faces(frame: &Frame, detector: &FaceDetector) -> FramecastResult<Frame> {
    let mut out = frame.clone();
    for (x, y, w, h) in detector.detect(frame) {
        draw_rect(&mut out, x, y, w, h, [0, 255, 0]);
    }
    Ok(out)
}

fn draw_rect(frame: &mut Frame, x: u32, y: u32, w: u32, h: u32, color: [u8; 3]) {
    let fw = frame.width;
    let fh = frame.height;
    let mut set = |px: u32, py: u32| {
        if px < fw && py < fh {
            let base = (py as usize * fw as usize + px as usize) * 3;
            frame.data[base..base + 3].copy_from_slice(&color);
        }
    };
    for dx in 0..w {
        set(x + dx, y);
        set(x + dx, y + h.saturating_sub(1));
    }
    for dy in 0..h {
        set(x, y + dy);
        set(x + w.saturating_sub(1), y + dy);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Motion
// ─────────────────────────────────────────────────────────────────────────────

/// Pixel difference that counts as motion.
const MOTION_THRESHOLD: u8 = 30;

/// Per-session motion detector.
///
/// Motion is the difference against the previous frame, so the first frame a
/// detector sees becomes its baseline and reports no motion. When a
/// session's frames spread across workers each builds its own baseline;
/// that is tolerated as best-effort.
#[derive(Default)]
pub struct MotionDetector {
    baseline: Option<Vec<u8>>,
}

impl MotionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highlights moved pixels in red and advances the baseline.
    pub fn detect(&mut self, frame: &Frame) -> FramecastResult<Frame> {
        let gray = grayscale(frame);
        let mut out = frame.clone();

        if let Some(baseline) = &self.baseline {
            if baseline.len() == gray.len() {
                for (i, (&now, &before)) in gray.iter().zip(baseline.iter()).enumerate() {
                    if now.abs_diff(before) > MOTION_THRESHOLD {
                        let base = i * 3;
                        out.data[base] = 255;
                        out.data[base + 1] = out.data[base + 1] / 2;
                        out.data[base + 2] = out.data[base + 2] / 2;
                    }
                }
            }
        }

        self.baseline = Some(gray);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_frame(w: u32, h: u32) -> Frame {
        let mut frame = Frame::zero(w, h);
        for y in 0..h {
            for x in 0..w {
                let base = ((y * w + x) * 3) as usize;
                frame.data[base] = (x * 255 / w.max(1)) as u8;
                frame.data[base + 1] = (y * 255 / h.max(1)) as u8;
                frame.data[base + 2] = 128;
            }
        }
        frame
    }

    #[test]
    fn blur_preserves_dimensions() {
        let frame = gradient_frame(32, 24);
        let blurred = apply_blur(&frame, "gaussian", 31).unwrap();
        assert_eq!(blurred.width, 32);
        assert_eq!(blurred.height, 24);
        assert_ne!(blurred.data, frame.data);

        let boxed = apply_blur(&frame, "box", 5).unwrap();
        assert_eq!(boxed.data.len(), frame.data.len());
    }

    #[test]
    fn edges_flat_frame_is_black() {
        let flat = Frame {
            width: 16,
            height: 16,
            data: vec![100u8; 16 * 16 * 3],
        };
        let edges = apply_edges(&flat, "sobel").unwrap();
        assert!(edges.is_zero());
    }

    #[test]
    fn edges_detect_a_vertical_boundary() {
        let mut frame = Frame::zero(16, 16);
        for y in 0..16u32 {
            for x in 8..16u32 {
                let base = ((y * 16 + x) * 3) as usize;
                frame.data[base] = 255;
                frame.data[base + 1] = 255;
                frame.data[base + 2] = 255;
            }
        }
        let edges = apply_edges(&frame, "sobel").unwrap();
        // The boundary column lights up; far-away columns stay dark.
        let at = |x: u32, y: u32| edges.data[((y * 16 + x) * 3) as usize];
        assert!(at(8, 8) > 128);
        assert_eq!(at(3, 8), 0);
    }

    #[test]
    fn motion_first_frame_is_baseline() {
        let mut detector = MotionDetector::new();
        let frame = gradient_frame(8, 8);
        let out = detector.detect(&frame).unwrap();
        assert_eq!(out.data, frame.data);
    }

    #[test]
    fn motion_highlights_changes() {
        let mut detector = MotionDetector::new();
        let first = Frame::zero(8, 8);
        detector.detect(&first).unwrap();

        let mut second = Frame::zero(8, 8);
        // One bright pixel appears.
        second.data[0] = 255;
        second.data[1] = 255;
        second.data[2] = 255;
        let out = detector.detect(&second).unwrap();
        assert_eq!(out.data[0], 255);
        // Unchanged pixels pass through.
        assert_eq!(out.data[30], 0);
    }

    #[test]
    fn face_detector_finds_skin_blob() {
        let detector = FaceDetector::new();
        let mut frame = Frame::zero(64, 64);
        // A 32x32 skin-toned patch.
        for y in 16..48u32 {
            for x in 16..48u32 {
                let base = ((y * 64 + x) * 3) as usize;
                frame.data[base] = 220;
                frame.data[base + 1] = 160;
                frame.data[base + 2] = 120;
            }
        }
        let boxes = detector.detect(&frame);
        assert_eq!(boxes.len(), 1);
        let (x, y, w, h) = boxes[0];
        assert!(x <= 16 && y <= 16);
        assert!(w >= 32 && h >= 32);
    }

    #[test]
    fn face_detector_ignores_black_frame() {
        let detector = FaceDetector::new();
        let frame = Frame::zero(64, 64);
        assert!(detector.detect(&frame).is_empty());
    }
}
