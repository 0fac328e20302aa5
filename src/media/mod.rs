//! Media pipelines: screen capture → H.264 → RTP on the controlled side,
//! RTP → H.264 → RGB on the controller side, plus system-audio capture and
//! playback.

pub mod audio;
pub mod capture;
pub mod decoder;
pub mod encoder;
pub mod hw;
pub mod playback;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("no H.264 encoder could be opened (hardware or software)")]
    EncoderUnavailable,
    #[error("no H.264 decoder could be opened (hardware or software)")]
    DecoderUnavailable,
    #[error("no capturable display")]
    NoDisplay,
    #[error("no usable audio device: {0}")]
    AudioDevice(String),
    #[error("codec error: {0}")]
    Codec(String),
}

impl From<ffmpeg_next::Error> for MediaError {
    fn from(err: ffmpeg_next::Error) -> Self {
        MediaError::Codec(err.to_string())
    }
}

/// A decoded (or captured) image: tightly packed RGB24.
#[derive(Debug, Clone)]
pub struct RgbFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// One encoded H.264 access unit, Annex-B, ready for the video track.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub keyframe: bool,
}

/// Encoded Opus frame for the audio track.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub data: Vec<u8>,
}

fn round_down_16(value: u32) -> u32 {
    (value / 16) * 16
}

/// Picks the encode resolution from the local screen and the controller's
/// maximum viewable area.
///
/// Absent hints (or a screen that already fits) keep the native size; an
/// oversized screen is scaled to fit while preserving the local aspect
/// ratio. The result is rounded down to multiples of 16.
pub fn compute_encode_size(
    screen_w: u32,
    screen_h: u32,
    control_max_w: Option<i32>,
    control_max_h: Option<i32>,
) -> (u32, u32) {
    let (raw_w, raw_h) = match (control_max_w, control_max_h) {
        (Some(max_w), Some(max_h)) if max_w > 0 && max_h > 0 => {
            let (max_w, max_h) = (max_w as u32, max_h as u32);
            if screen_w <= max_w && screen_h <= max_h {
                (screen_w, screen_h)
            } else {
                let local_aspect = screen_w as f64 / screen_h as f64;
                let control_aspect = max_w as f64 / max_h as f64;
                if local_aspect > control_aspect {
                    (max_w, (max_w as f64 / local_aspect) as u32)
                } else {
                    ((max_h as f64 * local_aspect) as u32, max_h)
                }
            }
        }
        _ => (screen_w, screen_h),
    };
    (round_down_16(raw_w).max(16), round_down_16(raw_h).max(16))
}

/// CBR bit rate for the given geometry, clamped to the sane band
/// `[w·h·fps·0.05, w·h·fps·0.5]`. A zero request picks `w·h·fps·0.1`.
pub fn clamp_bitrate(width: u32, height: u32, fps: u32, requested: u64) -> u64 {
    let pixels_per_sec = width as u64 * height as u64 * fps as u64;
    let floor = pixels_per_sec / 20;
    let ceil = pixels_per_sec / 2;
    let wanted = if requested == 0 {
        pixels_per_sec / 10
    } else {
        requested
    };
    wanted.clamp(floor.max(1), ceil.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_size_when_no_hint() {
        assert_eq!(compute_encode_size(2560, 1440, None, None), (2560, 1440));
        assert_eq!(compute_encode_size(2560, 1440, Some(-1), Some(-1)), (2560, 1440));
    }

    #[test]
    fn native_size_when_screen_fits() {
        assert_eq!(
            compute_encode_size(1280, 720, Some(1920), Some(1080)),
            (1280, 720)
        );
    }

    #[test]
    fn scales_preserving_local_aspect() {
        // 2560×1440 screen against a 1920×1040 viewing area: height-bound,
        // width = 1040·(2560/1440) = 1848 → 1840 after the multiple-of-16
        // round-down.
        assert_eq!(
            compute_encode_size(2560, 1440, Some(1920), Some(1040)),
            (1840, 1040)
        );
    }

    #[test]
    fn wide_screen_is_width_bound() {
        // 3440×1440 (ultrawide) against 1920×1080: width-bound.
        let (w, h) = compute_encode_size(3440, 1440, Some(1920), Some(1080));
        assert_eq!(w, 1920);
        assert_eq!(h, round_down_16((1920.0 / (3440.0 / 1440.0)) as u32));
    }

    #[test]
    fn bitrate_clamps_to_band() {
        let px = 1920u64 * 1080 * 30;
        assert_eq!(clamp_bitrate(1920, 1080, 30, 0), px / 10);
        assert_eq!(clamp_bitrate(1920, 1080, 30, 1), px / 20);
        assert_eq!(clamp_bitrate(1920, 1080, 30, u64::MAX), px / 2);
    }
}
