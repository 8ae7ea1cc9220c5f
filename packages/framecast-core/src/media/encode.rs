//! Video-only MP4 encode pipeline.
//!
//! PTS strategy: a monotonically increasing frame counter in 1/fps, reset to
//! zero at the start of the encode. Input frames are packed RGB24 and are
//! converted to YUV420P before hitting the encoder.
//!
//! Encoder ownership: the `encoder::Video` is created once in `open` and
//! never retrieved from the output stream, since `Stream` does not expose the
//! codec context in this version of ffmpeg-the-third.

use std::path::{Path, PathBuf};

use ffmpeg_the_third as ffmpeg;

use ffmpeg::codec::{self, Id as CodecId};
use ffmpeg::encoder;
use ffmpeg::format::{output as open_output, Pixel};
use ffmpeg::software::scaling::{context::Context as SwsContext, flag::Flags};
use ffmpeg::util::rational::Rational;
use ffmpeg::Packet;

use crate::error::{FramecastError, FramecastResult};
use crate::media::Frame;

/// Maps the client-facing codec name to an ffmpeg codec id.
///
/// `mp4v` (the default) and `xvid` select MPEG-4 Part 2; `h264`/`avc1`
/// select H.264 when libx264 is available.
fn codec_id(name: &str) -> FramecastResult<CodecId> {
    match name.to_ascii_lowercase().as_str() {
        "mp4v" | "mpeg4" | "xvid" => Ok(CodecId::MPEG4),
        "h264" | "avc1" | "x264" => Ok(CodecId::H264),
        other => Err(FramecastError::MediaEncode(format!(
            "unsupported codec '{}'",
            other
        ))),
    }
}

/// Blocking MP4 writer fed one RGB24 frame at a time, in order.
pub struct VideoEncoder {
    octx: ffmpeg::format::context::Output,
    encoder: encoder::Video,
    scaler: SwsContext,
    width: u32,
    height: u32,
    /// Output timebase 1/fps; each written frame advances the counter by 1.
    frame_tb: Rational,
    ost_tb: Rational,
    next_pts: i64,
    frames_written: u64,
    output_path: PathBuf,
    finished: bool,
}

impl VideoEncoder {
    /// Opens the output container and codec.
    ///
    /// `fps` is rounded to an integer timebase; fractional rates are not a
    /// concern for re-encoded uploads.
    pub fn open(
        output_path: &Path,
        codec_name: &str,
        fps: f64,
        width: u32,
        height: u32,
    ) -> FramecastResult<Self> {
        super::init();

        if let Some(parent) = output_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| FramecastError::MediaEncode(e.to_string()))?;
            }
        }

        let fps_int = fps.round().max(1.0) as i32;
        let frame_tb = Rational::new(1, fps_int);

        let id = codec_id(codec_name)?;
        let codec = encoder::find(id).ok_or_else(|| {
            FramecastError::MediaEncode(format!("encoder for '{}' not found", codec_name))
        })?;

        let mut octx = open_output(output_path).map_err(|e| {
            FramecastError::MediaEncode(format!(
                "could not open output '{}': {}",
                output_path.display(),
                e
            ))
        })?;

        let mut ost = octx
            .add_stream(codec)
            .map_err(|e| FramecastError::MediaEncode(format!("add video stream: {}", e)))?;
        ost.set_time_base(frame_tb);

        let enc_ctx = codec::context::Context::new_with_codec(codec);
        let mut video_enc = enc_ctx
            .encoder()
            .video()
            .map_err(|e| FramecastError::MediaEncode(format!("create encoder context: {}", e)))?;

        video_enc.set_width(width);
        video_enc.set_height(height);
        video_enc.set_format(Pixel::YUV420P);
        video_enc.set_time_base(frame_tb);
        video_enc.set_frame_rate(Some(Rational::new(fps_int, 1)));

        let encoder = video_enc
            .open_as_with(codec, ffmpeg::Dictionary::new())
            .map_err(|e| FramecastError::MediaEncode(format!("open encoder: {}", e)))?;

        // Copy encoder params into the stream's codecpar so the muxer knows
        // resolution, format, and codec-private data. set_parameters()
        // requires AsPtr<AVCodecParameters>, which encoder::Video does not
        // implement, so this goes through FFI.
        unsafe {
            let ret = ffmpeg::ffi::avcodec_parameters_from_context(
                (**(*octx.as_mut_ptr()).streams.add(0)).codecpar,
                encoder.as_ptr() as *mut ffmpeg::ffi::AVCodecContext,
            );
            if ret < 0 {
                return Err(FramecastError::MediaEncode(format!(
                    "avcodec_parameters_from_context failed: {}",
                    ret
                )));
            }
        }

        octx.write_header()
            .map_err(|e| FramecastError::MediaEncode(format!("write header: {}", e)))?;

        let ost_tb = octx
            .stream(0)
            .map(|s| s.time_base())
            .unwrap_or(frame_tb);

        let scaler = SwsContext::get(
            Pixel::RGB24,
            width,
            height,
            Pixel::YUV420P,
            width,
            height,
            Flags::BILINEAR,
        )
        .map_err(|e| FramecastError::MediaEncode(format!("scaler init: {}", e)))?;

        Ok(Self {
            octx,
            encoder,
            scaler,
            width,
            height,
            frame_tb,
            ost_tb,
            next_pts: 0,
            frames_written: 0,
            output_path: output_path.to_path_buf(),
            finished: false,
        })
    }

    /// Encodes one frame. Frames must arrive in presentation order;
    /// mismatched dimensions are an error rather than a silent resize.
    pub fn write_frame(&mut self, frame: &Frame) -> FramecastResult<()> {
        if frame.width != self.width || frame.height != self.height {
            return Err(FramecastError::MediaEncode(format!(
                "frame is {}x{}, encoder expects {}x{}",
                frame.width, frame.height, self.width, self.height
            )));
        }

        let mut rgb =
            ffmpeg::util::frame::video::Video::new(Pixel::RGB24, self.width, self.height);
        // libav rows carry stride padding; copy row by row.
        let stride = rgb.stride(0);
        let row_bytes = self.width as usize * 3;
        {
            let data = rgb.data_mut(0);
            for row in 0..self.height as usize {
                data[row * stride..row * stride + row_bytes]
                    .copy_from_slice(&frame.data[row * row_bytes..(row + 1) * row_bytes]);
            }
        }

        let mut yuv = ffmpeg::util::frame::video::Video::empty();
        self.scaler
            .run(&rgb, &mut yuv)
            .map_err(|e| FramecastError::MediaEncode(format!("rgb→yuv: {}", e)))?;
        yuv.set_pts(Some(self.next_pts));
        self.next_pts += 1;

        self.encoder
            .send_frame(&yuv)
            .map_err(|e| FramecastError::MediaEncode(format!("send frame: {}", e)))?;
        self.drain_packets()?;
        self.frames_written += 1;
        Ok(())
    }

    /// Flushes the encoder and writes the container trailer.
    pub fn finish(&mut self) -> FramecastResult<u64> {
        if self.finished {
            return Ok(self.frames_written);
        }
        self.finished = true;

        self.encoder
            .send_eof()
            .map_err(|e| FramecastError::MediaEncode(format!("send EOF: {}", e)))?;
        self.drain_packets()?;
        self.octx
            .write_trailer()
            .map_err(|e| FramecastError::MediaEncode(format!("write trailer: {}", e)))?;

        log::info!(
            "[Media] Encoded {} frames to {}",
            self.frames_written,
            self.output_path.display()
        );
        Ok(self.frames_written)
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    fn drain_packets(&mut self) -> FramecastResult<()> {
        let mut pkt = Packet::empty();
        while self.encoder.receive_packet(&mut pkt).is_ok() {
            pkt.set_stream(0);
            pkt.rescale_ts(self.frame_tb, self.ost_tb);
            pkt.write_interleaved(&mut self.octx)
                .map_err(|e| FramecastError::MediaEncode(format!("write packet: {}", e)))?;
        }
        Ok(())
    }
}
