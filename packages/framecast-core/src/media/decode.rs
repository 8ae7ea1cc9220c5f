//! Input video probing and full-sequence frame decode.

use std::path::Path;

use ffmpeg_the_third as ffmpeg;

use ffmpeg::format::{input, Pixel};
use ffmpeg::media::Type;
use ffmpeg::software::scaling::{context::Context as SwsContext, flag::Flags};

use crate::error::{FramecastError, FramecastResult};
use crate::media::{Frame, VideoProperties};

/// Reads fps, frame count, and dimensions without decoding pixel data.
///
/// `total_frames` comes from the container when declared and is 0 otherwise;
/// [`decode_frames`] returns the authoritative count.
pub fn probe(path: &Path) -> FramecastResult<VideoProperties> {
    super::init();

    let ictx = input(path).map_err(|e| open_error(path, e))?;
    let stream = ictx
        .streams()
        .best(Type::Video)
        .ok_or_else(|| FramecastError::MediaDecode(format!("{}: no video stream", path.display())))?;

    let rate = stream.avg_frame_rate();
    let fps = if rate.denominator() != 0 {
        rate.numerator() as f64 / rate.denominator() as f64
    } else {
        0.0
    };

    let params = stream.parameters();
    let dec_ctx = ffmpeg::codec::context::Context::from_parameters(params)
        .map_err(|e| FramecastError::MediaDecode(e.to_string()))?;
    let decoder = dec_ctx
        .decoder()
        .video()
        .map_err(|e| FramecastError::MediaDecode(e.to_string()))?;

    Ok(VideoProperties {
        fps,
        total_frames: stream.frames().max(0) as u64,
        width: decoder.width(),
        height: decoder.height(),
    })
}

/// Decodes every frame of the video into RGB24, in presentation order.
///
/// Blocking: runs the full decode loop before returning. Returns the decoded
/// frames plus properties whose `total_frames` reflects what was actually
/// decoded, which overrides any container-declared count.
pub fn decode_frames(path: &Path) -> FramecastResult<(Vec<Frame>, VideoProperties)> {
    super::init();

    let mut props = probe(path)?;

    let mut ictx = input(path).map_err(|e| open_error(path, e))?;
    let video_idx = ictx
        .streams()
        .best(Type::Video)
        .ok_or_else(|| FramecastError::MediaDecode(format!("{}: no video stream", path.display())))?
        .index();

    // Second context for decoder construction (Parameters borrows from the
    // stream, which borrows from ictx).
    let ictx2 = input(path).map_err(|e| open_error(path, e))?;
    let stream2 = ictx2
        .stream(video_idx)
        .ok_or_else(|| FramecastError::MediaDecode("video stream vanished".into()))?;
    let dec_ctx = ffmpeg::codec::context::Context::from_parameters(stream2.parameters())
        .map_err(|e| FramecastError::MediaDecode(e.to_string()))?;
    let mut decoder = dec_ctx
        .decoder()
        .video()
        .map_err(|e| FramecastError::MediaDecode(e.to_string()))?;

    let mut scaler = SwsContext::get(
        decoder.format(),
        decoder.width(),
        decoder.height(),
        Pixel::RGB24,
        decoder.width(),
        decoder.height(),
        Flags::BILINEAR,
    )
    .map_err(|e| FramecastError::MediaDecode(format!("scaler init: {}", e)))?;

    let mut frames = Vec::new();

    for (stream, packet) in ictx.packets().flatten() {
        if stream.index() != video_idx {
            continue;
        }
        if decoder.send_packet(&packet).is_err() {
            continue;
        }
        receive_frames(&mut decoder, &mut scaler, &mut frames)?;
    }

    // Drain the decoder's internal delay queue.
    let _ = decoder.send_eof();
    receive_frames(&mut decoder, &mut scaler, &mut frames)?;

    if frames.is_empty() {
        return Err(FramecastError::MediaDecode(format!(
            "{}: decoded zero frames",
            path.display()
        )));
    }

    props.total_frames = frames.len() as u64;
    log::info!(
        "[Media] Decoded {} frames at {:.2} fps ({})",
        props.total_frames,
        props.fps,
        props.resolution()
    );

    Ok((frames, props))
}

fn receive_frames(
    decoder: &mut ffmpeg::decoder::video::Video,
    scaler: &mut SwsContext,
    frames: &mut Vec<Frame>,
) -> FramecastResult<()> {
    let mut decoded = ffmpeg::util::frame::video::Video::empty();
    while decoder.receive_frame(&mut decoded).is_ok() {
        let mut rgb = ffmpeg::util::frame::video::Video::empty();
        scaler
            .run(&decoded, &mut rgb)
            .map_err(|e| FramecastError::MediaDecode(format!("scale: {}", e)))?;

        let width = rgb.width();
        let height = rgb.height();
        let stride = rgb.stride(0);
        let raw = rgb.data(0);
        let row_bytes = width as usize * 3;

        // Strip the stride padding so downstream consumers see packed rows.
        let mut data = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            data.extend_from_slice(&raw[start..start + row_bytes]);
        }

        frames.push(Frame {
            width,
            height,
            data,
        });
    }
    Ok(())
}

fn open_error(path: &Path, e: ffmpeg::Error) -> FramecastError {
    FramecastError::MediaDecode(format!("could not open '{}': {}", path.display(), e))
}
