//! Temporal frame sampling for video analysis
//!
//! Decodes a video at a fixed cadence of roughly two samples per second
//! (stride = ceil(fps / 2)) and hands each sampled frame to a caller
//! callback as an RGB image. The callback controls iteration, so a caller
//! can abort long videos between frames; decode errors mid-stream end
//! iteration without failing the analysis (probabilities already collected
//! stand).

use deepfake_common::AnalysisError;
use ffmpeg_next as ffmpeg;
use image::RgbImage;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// Fallback frame rate when the stream reports none
pub const FALLBACK_FPS: f64 = 25.0;

/// Errors that can occur during video sampling
#[derive(Debug, Error)]
pub enum TemporalError {
    #[error("FFmpeg error: {0}")]
    FFmpeg(String),

    #[error("No video stream found")]
    NoVideoStream,

    #[error("Frame callback failed: {0}")]
    Callback(#[from] AnalysisError),
}

/// Control value returned by the frame callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameControl {
    /// Keep sampling
    Continue,
    /// Stop at this frame boundary
    Stop,
}

/// Statistics for one sampling pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleStats {
    /// Frames decoded (sampled or not)
    pub frames_seen: u64,
    /// Frames handed to the callback
    pub frames_sampled: u64,
    /// Stride actually used
    pub stride: u32,
}

/// Frame stride for ~2 samples per second
///
/// Unreadable, zero or negative fps falls back to 25 (stride 13).
#[must_use]
pub fn frame_stride(fps: f64) -> u32 {
    let fps = if fps.is_finite() && fps > 0.0 {
        fps
    } else {
        FALLBACK_FPS
    };
    ((fps / 2.0).ceil() as u32).max(1)
}

/// Initialize FFmpeg once per process
fn init_ffmpeg() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        ffmpeg::init().expect("Failed to initialize FFmpeg");
    });
}

/// Iterate a video, invoking `on_frame` for every stride-th decoded frame
///
/// Frames arrive in decode order as RGB images with their global frame
/// index. Mid-stream decode errors end the iteration with a warning rather
/// than an error. The callback's `AnalysisError` aborts the whole pass.
///
/// # Errors
/// Returns `TemporalError` if the file cannot be opened, has no video
/// stream, or the callback fails.
pub fn sample_frames<F>(input_path: &Path, mut on_frame: F) -> Result<SampleStats, TemporalError>
where
    F: FnMut(RgbImage, u64) -> Result<FrameControl, AnalysisError>,
{
    init_ffmpeg();

    let mut ictx = ffmpeg::format::input(&input_path)
        .map_err(|e| TemporalError::FFmpeg(format!("Failed to open input file: {e}")))?;

    let video_stream = ictx
        .streams()
        .best(ffmpeg::media::Type::Video)
        .ok_or(TemporalError::NoVideoStream)?;

    let stream_index = video_stream.index();

    let rate = video_stream.avg_frame_rate();
    let fps = if rate.denominator() != 0 {
        f64::from(rate.numerator()) / f64::from(rate.denominator())
    } else {
        0.0
    };
    let stride = frame_stride(fps);
    debug!("Sampling video at stride {} (fps {:.2})", stride, fps);

    let codec_params = video_stream.parameters();
    let mut decoder = ffmpeg::codec::context::Context::from_parameters(codec_params)
        .map_err(|e| TemporalError::FFmpeg(format!("Failed to create context: {e}")))?
        .decoder()
        .video()
        .map_err(|e| TemporalError::FFmpeg(format!("Failed to create decoder: {e}")))?;

    let width = decoder.width();
    let height = decoder.height();

    let mut scaler = ffmpeg::software::scaling::Context::get(
        decoder.format(),
        width,
        height,
        ffmpeg::format::Pixel::RGB24,
        width,
        height,
        ffmpeg::software::scaling::Flags::BILINEAR,
    )
    .map_err(|e| TemporalError::FFmpeg(format!("Failed to create scaler: {e}")))?;

    let mut stats = SampleStats {
        frames_seen: 0,
        frames_sampled: 0,
        stride,
    };
    let mut decoded_frame = ffmpeg::util::frame::video::Video::empty();
    let mut converted_frame = ffmpeg::util::frame::video::Video::empty();
    let mut stopped = false;

    'packets: for (stream, packet) in ictx.packets() {
        if stream.index() != stream_index {
            continue;
        }

        if let Err(e) = decoder.send_packet(&packet) {
            // Corrupt packet mid-stream: stop sampling, keep what we have
            warn!("Decode error at frame {}, ending sampling: {e}", stats.frames_seen);
            break;
        }

        while decoder.receive_frame(&mut decoded_frame).is_ok() {
            if stats.frames_seen % u64::from(stride) == 0 {
                scaler
                    .run(&decoded_frame, &mut converted_frame)
                    .map_err(|e| TemporalError::FFmpeg(format!("Failed to convert frame: {e}")))?;

                let rgb = frame_to_rgb(&converted_frame, width, height);
                stats.frames_sampled += 1;

                if on_frame(rgb, stats.frames_seen)? == FrameControl::Stop {
                    stopped = true;
                    stats.frames_seen += 1;
                    break 'packets;
                }
            }
            stats.frames_seen += 1;
        }
    }

    if !stopped {
        decoder.send_eof().ok();
        while decoder.receive_frame(&mut decoded_frame).is_ok() {
            if stats.frames_seen % u64::from(stride) == 0 {
                scaler
                    .run(&decoded_frame, &mut converted_frame)
                    .map_err(|e| TemporalError::FFmpeg(format!("Failed to convert frame: {e}")))?;

                let rgb = frame_to_rgb(&converted_frame, width, height);
                stats.frames_sampled += 1;

                if on_frame(rgb, stats.frames_seen)? == FrameControl::Stop {
                    stats.frames_seen += 1;
                    break;
                }
            }
            stats.frames_seen += 1;
        }
    }

    debug!(
        "Sampling complete: {} frames seen, {} sampled",
        stats.frames_seen, stats.frames_sampled
    );

    Ok(stats)
}

/// Copy an RGB24 FFmpeg frame into an owned image, honoring the row stride
fn frame_to_rgb(frame: &ffmpeg::util::frame::video::Video, width: u32, height: u32) -> RgbImage {
    let stride = frame.stride(0);
    let plane = frame.data(0);
    let row_bytes = width as usize * 3;

    let mut data = Vec::with_capacity(row_bytes * height as usize);
    for y in 0..height as usize {
        let row_start = y * stride;
        data.extend_from_slice(&plane[row_start..row_start + row_bytes]);
    }

    RgbImage::from_raw(width, height, data).unwrap_or_else(|| RgbImage::new(width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stride_two_samples_per_second() {
        assert_eq!(frame_stride(30.0), 15);
        assert_eq!(frame_stride(24.0), 12);
        assert_eq!(frame_stride(29.97), 15);
        assert_eq!(frame_stride(60.0), 30);
    }

    #[test]
    fn test_stride_fallback_fps() {
        // fps 25 -> ceil(12.5) = 13, and unreadable rates use the same path
        assert_eq!(frame_stride(25.0), 13);
        assert_eq!(frame_stride(0.0), 13);
        assert_eq!(frame_stride(-5.0), 13);
        assert_eq!(frame_stride(f64::NAN), 13);
        assert_eq!(frame_stride(f64::INFINITY), 13);
    }

    #[test]
    fn test_stride_never_zero() {
        assert_eq!(frame_stride(0.5), 1);
        assert_eq!(frame_stride(1.0), 1);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = sample_frames(Path::new("/nonexistent/video.mp4"), |_, _| {
            Ok(FrameControl::Continue)
        });
        assert!(matches!(result, Err(TemporalError::FFmpeg(_))));
    }
}
