//! Preview GIF construction from a session's artifact directory.

use std::path::Path;

use image::codecs::gif::{GifEncoder, Repeat};
use image::{imageops, Delay, Frame as GifFrame};

use crate::constants::{PREVIEW_GIF_MAX_FRAMES, PREVIEW_GIF_MAX_WIDTH};
use crate::error::{FramecastError, FramecastResult};

/// Picks at most `max` indices spread evenly across `0..count`.
///
/// The first frame is always included; with `count <= max` every index is.
pub fn evenly_spaced_indices(count: usize, max: usize) -> Vec<usize> {
    if count == 0 || max == 0 {
        return Vec::new();
    }
    if count <= max {
        return (0..count).collect();
    }
    let step = count as f64 / max as f64;
    let mut indices: Vec<usize> = (0..max)
        .map(|i| ((i as f64 * step) as usize).min(count - 1))
        .collect();
    indices.dedup();
    indices
}

/// Builds a looping animated preview from the session's processed frames.
///
/// Samples at most [`PREVIEW_GIF_MAX_FRAMES`] frames evenly, downscales to
/// at most [`PREVIEW_GIF_MAX_WIDTH`] pixels wide, and writes the result to
/// `out`. Blocking: run on the blocking pool.
pub fn build_preview_gif(session_dir: &Path, out: &Path) -> FramecastResult<()> {
    let mut pngs: Vec<_> = std::fs::read_dir(session_dir)
        .map_err(|e| {
            FramecastError::SessionNotFound(format!(
                "{}: {}",
                session_dir.display(),
                e
            ))
        })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().is_some_and(|ext| ext == "png")
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("frame_"))
        })
        .collect();
    pngs.sort();

    if pngs.is_empty() {
        return Err(FramecastError::SessionNotFound(format!(
            "no frames in {}",
            session_dir.display()
        )));
    }

    let selected = evenly_spaced_indices(pngs.len(), PREVIEW_GIF_MAX_FRAMES);

    let file = std::fs::File::create(out)
        .map_err(|e| FramecastError::Internal(format!("create gif: {}", e)))?;
    let mut encoder = GifEncoder::new(file);
    encoder
        .set_repeat(Repeat::Infinite)
        .map_err(|e| FramecastError::Internal(format!("gif repeat: {}", e)))?;

    let mut encoded = 0usize;
    for &i in &selected {
        // A frame mid-write by a worker just gets skipped this pass.
        let Ok(img) = image::open(&pngs[i]) else {
            continue;
        };
        let img = if img.width() > PREVIEW_GIF_MAX_WIDTH {
            let scale = PREVIEW_GIF_MAX_WIDTH as f64 / img.width() as f64;
            let height = (img.height() as f64 * scale).round().max(1.0) as u32;
            img.resize(PREVIEW_GIF_MAX_WIDTH, height, imageops::FilterType::Triangle)
        } else {
            img
        };
        let frame = GifFrame::from_parts(
            img.into_rgba8(),
            0,
            0,
            Delay::from_numer_denom_ms(100, 1),
        );
        encoder
            .encode_frame(frame)
            .map_err(|e| FramecastError::Internal(format!("gif frame: {}", e)))?;
        encoded += 1;
    }

    if encoded == 0 {
        let _ = std::fs::remove_file(out);
        return Err(FramecastError::SessionNotFound(format!(
            "no decodable frames in {}",
            session_dir.display()
        )));
    }

    log::info!(
        "[Preview] Cached {} ({} of {} frames)",
        out.display(),
        encoded,
        pngs.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use tempfile::TempDir;

    #[test]
    fn sampling_handles_degenerate_counts() {
        assert!(evenly_spaced_indices(0, 30).is_empty());
        assert!(evenly_spaced_indices(10, 0).is_empty());
        assert_eq!(evenly_spaced_indices(5, 30), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn sampling_is_bounded_and_spread() {
        let indices = evenly_spaced_indices(150, 30);
        assert_eq!(indices.len(), 30);
        assert_eq!(indices[0], 0);
        assert!(*indices.last().unwrap() < 150);
        assert!(indices.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn gif_builds_from_artifact_frames() {
        let dir = TempDir::new().unwrap();
        for i in 0..4u64 {
            let img = RgbImage::from_pixel(8, 8, image::Rgb([i as u8 * 40, 0, 0]));
            img.save(dir.path().join(format!("frame_{:06}.png", i)))
                .unwrap();
        }
        // Sidecar JSON files must not confuse frame discovery.
        std::fs::write(dir.path().join("frame_000000.json"), b"{}").unwrap();

        let out = dir.path().join("preview.gif");
        build_preview_gif(dir.path(), &out).unwrap();
        let bytes = std::fs::read(&out).unwrap();
        assert_eq!(&bytes[..3], b"GIF");
    }

    #[test]
    fn empty_directory_is_not_found() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("preview.gif");
        let err = build_preview_gif(dir.path(), &out).unwrap_err();
        assert!(matches!(err, FramecastError::SessionNotFound(_)));
    }
}
