//! H.264 decoding: hardware probing with graceful software fallback, staged
//! pixel-format conversion to RGB, and the error bookkeeping that drives
//! keyframe recovery.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use log::{debug, info, warn};

use crate::wire::annexb;

use super::hw::HwContextRegistry;
use super::{MediaError, RgbFrame};

/// Decoder accelerator device types in probe order for this platform.
pub fn decoder_candidates() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = Vec::new();
    #[cfg(target_os = "windows")]
    names.extend(["cuda", "d3d11va", "dxva2", "qsv"]);
    #[cfg(target_os = "macos")]
    names.push("videotoolbox");
    #[cfg(target_os = "linux")]
    names.extend(["cuda", "qsv", "drm"]);
    names
}

fn hw_pixel_format(accel: &str) -> ffi::AVPixelFormat {
    match accel {
        "cuda" => ffi::AVPixelFormat::AV_PIX_FMT_CUDA,
        "d3d11va" => ffi::AVPixelFormat::AV_PIX_FMT_D3D11,
        "dxva2" => ffi::AVPixelFormat::AV_PIX_FMT_DXVA2_VLD,
        "qsv" => ffi::AVPixelFormat::AV_PIX_FMT_QSV,
        "videotoolbox" => ffi::AVPixelFormat::AV_PIX_FMT_VIDEOTOOLBOX,
        "drm" => ffi::AVPixelFormat::AV_PIX_FMT_DRM_PRIME,
        _ => ffi::AVPixelFormat::AV_PIX_FMT_NONE,
    }
}

/// The hardware format the in-flight open expects; consulted by the
/// `get_format` callback. Decoder accelerator choice is uniform per process,
/// so a single slot suffices.
static EXPECTED_HW_FORMAT: AtomicI32 = AtomicI32::new(ffi::AVPixelFormat::AV_PIX_FMT_NONE as i32);

/// Platform fallback order when the expected format is not offered.
const FALLBACK_HW_FORMATS: [ffi::AVPixelFormat; 4] = [
    ffi::AVPixelFormat::AV_PIX_FMT_D3D11,
    ffi::AVPixelFormat::AV_PIX_FMT_DXVA2_VLD,
    ffi::AVPixelFormat::AV_PIX_FMT_CUDA,
    ffi::AVPixelFormat::AV_PIX_FMT_DRM_PRIME,
];

unsafe extern "C" fn select_pixel_format(
    _ctx: *mut ffi::AVCodecContext,
    offered: *const ffi::AVPixelFormat,
) -> ffi::AVPixelFormat {
    let expected = EXPECTED_HW_FORMAT.load(Ordering::SeqCst);
    let mut cursor = offered;
    let mut first_software = ffi::AVPixelFormat::AV_PIX_FMT_NONE;
    let mut fallback = ffi::AVPixelFormat::AV_PIX_FMT_NONE;
    while *cursor != ffi::AVPixelFormat::AV_PIX_FMT_NONE {
        let format = *cursor;
        if format as i32 == expected {
            return format;
        }
        if fallback == ffi::AVPixelFormat::AV_PIX_FMT_NONE
            && FALLBACK_HW_FORMATS.contains(&format)
        {
            fallback = format;
        }
        if first_software == ffi::AVPixelFormat::AV_PIX_FMT_NONE
            && matches!(
                format,
                ffi::AVPixelFormat::AV_PIX_FMT_YUV420P | ffi::AVPixelFormat::AV_PIX_FMT_NV12
            )
        {
            first_software = format;
        }
        cursor = cursor.add(1);
    }
    if fallback != ffi::AVPixelFormat::AV_PIX_FMT_NONE {
        return fallback;
    }
    // Only software formats offered; decoding continues without the GPU.
    first_software
}

/// Error bookkeeping shared between decode calls: consecutive empty packets,
/// consecutive failures, and time since the last good frame. Crossing a
/// threshold means the session should send `request_keyframe`.
#[derive(Debug)]
pub struct RecoveryTracker {
    consecutive_empty: u32,
    consecutive_failures: u32,
    last_good_frame: Instant,
}

impl RecoveryTracker {
    pub const EMPTY_THRESHOLD: u32 = 5;
    pub const FAILURE_THRESHOLD: u32 = 5;

    pub fn new() -> Self {
        Self {
            consecutive_empty: 0,
            consecutive_failures: 0,
            last_good_frame: Instant::now(),
        }
    }

    /// Records an empty packet; true exactly when the threshold is reached.
    pub fn record_empty(&mut self) -> bool {
        self.consecutive_empty += 1;
        if self.consecutive_empty >= Self::EMPTY_THRESHOLD {
            self.consecutive_empty = 0;
            return true;
        }
        false
    }

    /// Records a decode failure; true exactly when the threshold is reached.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        self.consecutive_failures == Self::FAILURE_THRESHOLD
    }

    pub fn record_success(&mut self) {
        self.consecutive_empty = 0;
        self.consecutive_failures = 0;
        self.last_good_frame = Instant::now();
    }

    pub fn since_last_frame(&self) -> Duration {
        self.last_good_frame.elapsed()
    }

    /// Minimum spacing between decodes. Elevated failure counts slow the
    /// cadence from 30 fps down to 25/20 fps to shed pressure.
    pub fn min_decode_interval(&self) -> Duration {
        if self.consecutive_failures > 10 {
            Duration::from_millis(50)
        } else if self.consecutive_failures > 5 {
            Duration::from_millis(40)
        } else {
            Duration::from_millis(33)
        }
    }
}

impl Default for RecoveryTracker {
    fn default() -> Self {
        Self::new()
    }
}

pub struct VideoDecoder {
    decoder: ffmpeg::decoder::Video,
    accel: Option<&'static str>,
    to_yuv: Option<ffmpeg::software::scaling::Context>,
    to_rgb: Option<ffmpeg::software::scaling::Context>,
    staged_dims: (u32, u32),
    waiting_for_keyframe: bool,
    first_packet_at: Option<Instant>,
}

impl VideoDecoder {
    /// Probes hardware accelerators through the shared registry; any open
    /// failure frees the hardware context and retries, ending at software.
    pub fn new(hw: &HwContextRegistry) -> Result<Self, MediaError> {
        ffmpeg::init().map_err(MediaError::from)?;

        for accel in decoder_candidates() {
            let Some(device) = hw.device(accel) else {
                continue;
            };
            match open_decoder(Some((accel, device.new_ref()))) {
                Ok(decoder) => {
                    info!("H264 decoder opened with {accel} acceleration");
                    return Ok(Self::wrap(decoder, Some(accel)));
                }
                Err(err) => {
                    warn!("decoder open with {accel} failed, trying next: {err}");
                }
            }
        }

        let decoder = open_decoder(None)?;
        info!("H264 decoder opened in software mode");
        Ok(Self::wrap(decoder, None))
    }

    fn wrap(decoder: ffmpeg::decoder::Video, accel: Option<&'static str>) -> Self {
        Self {
            decoder,
            accel,
            to_yuv: None,
            to_rgb: None,
            staged_dims: (0, 0),
            waiting_for_keyframe: true,
            first_packet_at: None,
        }
    }

    pub fn accelerator(&self) -> Option<&'static str> {
        self.accel
    }

    pub fn waiting_for_keyframe(&self) -> bool {
        self.waiting_for_keyframe
    }

    /// Re-arms the keyframe gate, e.g. after a `request_keyframe` was sent.
    pub fn await_keyframe(&mut self) {
        self.waiting_for_keyframe = true;
    }

    /// Decodes one Annex-B access unit into an RGB image.
    ///
    /// Slice data is skipped while the decoder has not yet seen a
    /// SPS/PPS/IDR, except after a 5 s grace period, when decoding is forced
    /// to start on whatever arrives.
    pub fn decode(&mut self, access_unit: &[u8]) -> Result<Option<RgbFrame>, MediaError> {
        if access_unit.is_empty() {
            return Ok(None);
        }
        let now = Instant::now();
        let first_seen = *self.first_packet_at.get_or_insert(now);

        if self.waiting_for_keyframe {
            let nal = annexb::first_nal_type(access_unit);
            let opens_stream = annexb::is_parameter_set(nal)
                || nal == annexb::NAL_TYPE_IDR
                || annexb::contains_idr(access_unit);
            if opens_stream {
                self.waiting_for_keyframe = false;
            } else if now.duration_since(first_seen) > Duration::from_secs(5) {
                warn!("no keyframe after 5s, forcing decode start on NAL type {nal}");
                self.waiting_for_keyframe = false;
            } else {
                debug!("skipping NAL type {nal} while waiting for keyframe");
                return Ok(None);
            }
        }

        let packet = ffmpeg::Packet::copy(access_unit);
        self.decoder.send_packet(&packet).map_err(MediaError::from)?;

        let mut latest: Option<ffmpeg::frame::Video> = None;
        let mut frame = ffmpeg::frame::Video::empty();
        while self.decoder.receive_frame(&mut frame).is_ok() {
            latest = Some(std::mem::replace(&mut frame, ffmpeg::frame::Video::empty()));
        }
        let Some(decoded) = latest else {
            return Ok(None);
        };

        let software = self.transfer_if_hardware(decoded)?;
        let rgb = self.convert_to_rgb(&software)?;
        Ok(Some(rgb))
    }

    /// Flushes codec state, e.g. on resolution change mid-stream.
    pub fn reset(&mut self) {
        self.decoder.flush();
        self.waiting_for_keyframe = true;
        self.first_packet_at = None;
    }

    /// Moves a hardware surface into system memory. NV12 in general;
    /// DRM-backed frames transfer as YUV420P.
    fn transfer_if_hardware(
        &self,
        frame: ffmpeg::frame::Video,
    ) -> Result<ffmpeg::frame::Video, MediaError> {
        use ffmpeg::format::Pixel;

        let is_software = matches!(
            frame.format(),
            Pixel::YUV420P | Pixel::YUV422P | Pixel::YUV444P | Pixel::NV12 | Pixel::NV21
        );
        if self.accel.is_none() || is_software {
            return Ok(frame);
        }

        let target = if self.accel == Some("drm") {
            Pixel::YUV420P
        } else {
            Pixel::NV12
        };
        let mut software = ffmpeg::frame::Video::new(target, frame.width(), frame.height());
        let ret = unsafe {
            ffi::av_hwframe_transfer_data(software.as_mut_ptr(), frame.as_ptr(), 0)
        };
        if ret < 0 {
            return Err(MediaError::Codec(format!(
                "hardware frame transfer failed: error {ret}"
            )));
        }
        Ok(software)
    }

    /// NV12 goes through YUV420P before RGB24; direct NV12→RGB conversion is
    /// unreliable on some swscale builds.
    fn convert_to_rgb(&mut self, frame: &ffmpeg::frame::Video) -> Result<RgbFrame, MediaError> {
        use ffmpeg::format::Pixel;

        let (width, height) = (frame.width(), frame.height());
        if self.staged_dims != (width, height) {
            self.to_yuv = None;
            self.to_rgb = None;
            self.staged_dims = (width, height);
        }

        let yuv_holder;
        let yuv: &ffmpeg::frame::Video = if frame.format() == Pixel::NV12 {
            if self.to_yuv.is_none() {
                self.to_yuv = Some(
                    ffmpeg::software::scaling::Context::get(
                        Pixel::NV12,
                        width,
                        height,
                        Pixel::YUV420P,
                        width,
                        height,
                        ffmpeg::software::scaling::Flags::BILINEAR,
                    )
                    .map_err(MediaError::from)?,
                );
            }
            let mut staged = ffmpeg::frame::Video::new(Pixel::YUV420P, width, height);
            self.to_yuv
                .as_mut()
                .expect("scaler initialised above")
                .run(frame, &mut staged)
                .map_err(MediaError::from)?;
            yuv_holder = staged;
            &yuv_holder
        } else {
            frame
        };

        if self.to_rgb.is_none() {
            self.to_rgb = Some(
                ffmpeg::software::scaling::Context::get(
                    yuv.format(),
                    width,
                    height,
                    Pixel::RGB24,
                    width,
                    height,
                    ffmpeg::software::scaling::Flags::BILINEAR,
                )
                .map_err(MediaError::from)?,
            );
        }
        let mut rgb = ffmpeg::frame::Video::new(Pixel::RGB24, width, height);
        self.to_rgb
            .as_mut()
            .expect("scaler initialised above")
            .run(yuv, &mut rgb)
            .map_err(MediaError::from)?;

        let stride = rgb.stride(0);
        let row_len = width as usize * 3;
        let mut data = vec![0u8; row_len * height as usize];
        let plane = rgb.data(0);
        for y in 0..height as usize {
            data[y * row_len..(y + 1) * row_len]
                .copy_from_slice(&plane[y * stride..y * stride + row_len]);
        }
        Ok(RgbFrame {
            width,
            height,
            data,
        })
    }
}

fn open_decoder(
    hardware: Option<(&'static str, *mut ffi::AVBufferRef)>,
) -> Result<ffmpeg::decoder::Video, MediaError> {
    let codec = ffmpeg::decoder::find_by_name("h264")
        .or_else(|| ffmpeg::decoder::find(ffmpeg::codec::Id::H264))
        .ok_or_else(|| MediaError::Codec("h264 decoder not present".into()))?;
    let mut context = ffmpeg::codec::context::Context::new_with_codec(codec);

    if let Some((accel, device)) = hardware {
        EXPECTED_HW_FORMAT.store(hw_pixel_format(accel) as i32, Ordering::SeqCst);
        unsafe {
            let raw = context.as_mut_ptr();
            (*raw).hw_device_ctx = device;
            (*raw).get_format = Some(select_pixel_format);
        }
    } else {
        EXPECTED_HW_FORMAT.store(ffi::AVPixelFormat::AV_PIX_FMT_NONE as i32, Ordering::SeqCst);
    }

    context.decoder().video().map_err(MediaError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_triggers_on_fifth_empty_packet() {
        let mut tracker = RecoveryTracker::new();
        for _ in 0..4 {
            assert!(!tracker.record_empty());
        }
        assert!(tracker.record_empty());
        // Counter reset: another run of five is needed for the next trigger.
        for _ in 0..4 {
            assert!(!tracker.record_empty());
        }
        assert!(tracker.record_empty());
    }

    #[test]
    fn recovery_triggers_once_per_failure_run() {
        let mut tracker = RecoveryTracker::new();
        for _ in 0..4 {
            assert!(!tracker.record_failure());
        }
        assert!(tracker.record_failure());
        // Further failures in the same run do not re-trigger.
        assert!(!tracker.record_failure());
        tracker.record_success();
        for _ in 0..4 {
            assert!(!tracker.record_failure());
        }
        assert!(tracker.record_failure());
    }

    #[test]
    fn throttle_widens_under_sustained_failures() {
        let mut tracker = RecoveryTracker::new();
        assert_eq!(tracker.min_decode_interval(), Duration::from_millis(33));
        for _ in 0..7 {
            tracker.record_failure();
        }
        assert_eq!(tracker.min_decode_interval(), Duration::from_millis(40));
        for _ in 0..5 {
            tracker.record_failure();
        }
        assert_eq!(tracker.min_decode_interval(), Duration::from_millis(50));
        tracker.record_success();
        assert_eq!(tracker.min_decode_interval(), Duration::from_millis(33));
    }

    #[test]
    fn candidate_list_is_platform_shaped() {
        let names = decoder_candidates();
        #[cfg(target_os = "linux")]
        assert!(names.contains(&"cuda"));
        let _ = names;
    }
}
