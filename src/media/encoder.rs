//! H.264 encoding with hardware-acceleration probing and Annex-B discipline.

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use log::{debug, info, warn};

use crate::wire::annexb;

use super::hw::HwContextRegistry;
use super::{EncodedFrame, MediaError, RgbFrame};

/// Trial geometry used while probing accelerators.
const PROBE_WIDTH: u32 = 640;
const PROBE_HEIGHT: u32 = 480;
const PROBE_FPS: u32 = 30;

const SOFTWARE_ENCODER: &str = "libx264";

/// Candidate encoder names in probe order for this platform, hardware first.
pub fn encoder_candidates() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = Vec::new();
    #[cfg(target_os = "windows")]
    names.extend(["h264_qsv", "h264_nvenc", "h264_amf"]);
    #[cfg(target_os = "macos")]
    names.push("h264_videotoolbox");
    #[cfg(target_os = "linux")]
    names.extend([
        "h264_qsv",
        "h264_nvenc",
        "h264_v4l2m2m",
        "h264_rkmpp",
    ]);
    names.push(SOFTWARE_ENCODER);
    names
}

/// Accelerator device name the encoder needs attached, when any.
fn device_for(encoder_name: &str) -> Option<&'static str> {
    match encoder_name {
        "h264_qsv" => Some("qsv"),
        "h264_videotoolbox" => Some("videotoolbox"),
        "h264_rkmpp" => Some("drm"),
        _ => None,
    }
}

fn is_hardware(encoder_name: &str) -> bool {
    encoder_name != SOFTWARE_ENCODER
}

fn align_dim(value: u32, hardware: bool) -> u32 {
    if hardware {
        // QSV requires 16-alignment; the other accelerators get it
        // conservatively.
        (value / 16).max(1) * 16
    } else {
        (value / 2).max(1) * 2
    }
}

pub struct VideoEncoder {
    encoder: ffmpeg::encoder::Video,
    scaler: Option<ffmpeg::software::scaling::Context>,
    scaler_src: (u32, u32),
    encoder_name: &'static str,
    width: u32,
    height: u32,
    fps: u32,
    frame_index: i64,
    force_keyframe: bool,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    aggressive_repeat_headers: bool,
}

impl VideoEncoder {
    /// Opens the first accelerator that survives a trial open, falling back
    /// to software. `bitrate == 0` derives one from the geometry.
    pub fn new(
        hw: &HwContextRegistry,
        width: u32,
        height: u32,
        fps: u32,
        bitrate: u64,
        aggressive_repeat_headers: bool,
    ) -> Result<Self, MediaError> {
        ffmpeg::init().map_err(MediaError::from)?;
        let fps = fps.clamp(1, 60);
        let bitrate = super::clamp_bitrate(width, height, fps, bitrate);

        for name in encoder_candidates() {
            // A candidate must actually open, not merely exist.
            match open_encoder(hw, name, PROBE_WIDTH, PROBE_HEIGHT, PROBE_FPS, 1_000_000) {
                Ok(trial) => drop(trial),
                Err(err) => {
                    debug!("encoder probe {name} failed: {err}");
                    continue;
                }
            }
            let aligned_w = align_dim(width, is_hardware(name));
            let aligned_h = align_dim(height, is_hardware(name));
            match open_encoder(hw, name, aligned_w, aligned_h, fps, bitrate) {
                Ok(encoder) => {
                    info!(
                        "H264 encoder {name} opened at {aligned_w}x{aligned_h}@{fps} ({bitrate} bps)"
                    );
                    return Ok(Self {
                        encoder,
                        scaler: None,
                        scaler_src: (0, 0),
                        encoder_name: name,
                        width: aligned_w,
                        height: aligned_h,
                        fps,
                        frame_index: 0,
                        force_keyframe: false,
                        sps: None,
                        pps: None,
                        aggressive_repeat_headers,
                    });
                }
                Err(err) => warn!("encoder {name} failed at target geometry: {err}"),
            }
        }
        Err(MediaError::EncoderUnavailable)
    }

    pub fn name(&self) -> &str {
        self.encoder_name
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Marks the next submitted picture as IDR. Requests are edge-triggered:
    /// one arriving while a keyframe is already in flight forces the next
    /// frame as well.
    pub fn force_keyframe(&mut self) {
        self.force_keyframe = true;
    }

    /// Scales + converts one captured RGB image to NV12, encodes it, drains
    /// the emitted packets, and returns them as a single Annex-B access
    /// unit. `None` while the codec is still buffering.
    pub fn encode(&mut self, image: &RgbFrame) -> Result<Option<EncodedFrame>, MediaError> {
        let mut input = self.convert_to_nv12(image)?;
        input.set_pts(Some(self.frame_index));

        let periodic_key = self.frame_index % (2 * self.fps as i64) == 0;
        let forced = std::mem::take(&mut self.force_keyframe);
        if self.frame_index == 0 || periodic_key || forced {
            input.set_kind(ffmpeg::util::picture::Type::I);
        }
        self.frame_index += 1;

        self.encoder.send_frame(&input).map_err(MediaError::from)?;

        let mut access_unit: Vec<u8> = Vec::new();
        let mut keyframe = false;
        let mut packet = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            let Some(data) = packet.data() else { continue };
            if data.is_empty() {
                continue;
            }
            let normalized = annexb::to_annex_b(data);
            self.remember_parameter_sets(&normalized);
            keyframe |= packet.is_key();
            access_unit.extend_from_slice(&normalized);
        }

        if access_unit.is_empty() {
            return Ok(None);
        }
        if keyframe {
            access_unit = self.ensure_parameter_sets(access_unit);
        }
        Ok(Some(EncodedFrame {
            data: access_unit,
            keyframe,
        }))
    }

    fn convert_to_nv12(&mut self, image: &RgbFrame) -> Result<ffmpeg::frame::Video, MediaError> {
        use ffmpeg::format::Pixel;

        if self.scaler.is_none() || self.scaler_src != (image.width, image.height) {
            self.scaler = Some(
                ffmpeg::software::scaling::Context::get(
                    Pixel::RGB24,
                    image.width,
                    image.height,
                    Pixel::NV12,
                    self.width,
                    self.height,
                    ffmpeg::software::scaling::Flags::BILINEAR,
                )
                .map_err(MediaError::from)?,
            );
            self.scaler_src = (image.width, image.height);
        }

        let mut rgb = ffmpeg::frame::Video::new(Pixel::RGB24, image.width, image.height);
        let stride = rgb.stride(0);
        let row_len = image.width as usize * 3;
        {
            let plane = rgb.data_mut(0);
            for y in 0..image.height as usize {
                let src = &image.data[y * row_len..y * row_len + row_len];
                plane[y * stride..y * stride + row_len].copy_from_slice(src);
            }
        }

        let mut nv12 = ffmpeg::frame::Video::new(Pixel::NV12, self.width, self.height);
        self.scaler
            .as_mut()
            .expect("scaler initialised above")
            .run(&rgb, &mut nv12)
            .map_err(MediaError::from)?;
        Ok(nv12)
    }

    fn remember_parameter_sets(&mut self, access_unit: &[u8]) {
        for unit in annexb::nal_units(access_unit) {
            match unit.first().map(|byte| byte & 0x1F) {
                Some(annexb::NAL_TYPE_SPS) => self.sps = Some(unit.to_vec()),
                Some(annexb::NAL_TYPE_PPS) => self.pps = Some(unit.to_vec()),
                _ => {}
            }
        }
    }

    /// Keyframes must carry SPS and PPS ahead of the IDR slice. When the
    /// codec omitted them (and always under aggressive repetition), the
    /// cached sets are prepended.
    fn ensure_parameter_sets(&self, access_unit: Vec<u8>) -> Vec<u8> {
        let (has_sps, has_pps) = annexb::has_parameter_sets(&access_unit);
        let missing = !has_sps || !has_pps;
        let stripped_ok = has_sps && has_pps && !self.aggressive_repeat_headers;
        if stripped_ok {
            return access_unit;
        }
        match (&self.sps, &self.pps) {
            (Some(sps), Some(pps)) if missing || self.aggressive_repeat_headers => {
                annexb::prepend_parameter_sets(sps, pps, &access_unit)
            }
            _ => {
                if missing {
                    warn!("keyframe without parameter sets and none cached yet");
                }
                access_unit
            }
        }
    }
}

fn open_encoder(
    hw: &HwContextRegistry,
    name: &str,
    width: u32,
    height: u32,
    fps: u32,
    bitrate: u64,
) -> Result<ffmpeg::encoder::Video, MediaError> {
    use ffmpeg::format::Pixel;

    let codec = ffmpeg::encoder::find_by_name(name)
        .ok_or_else(|| MediaError::Codec(format!("encoder {name} not present")))?;
    let mut context = ffmpeg::codec::context::Context::new_with_codec(codec)
        .encoder()
        .video()
        .map_err(MediaError::from)?;

    context.set_width(width);
    context.set_height(height);
    context.set_format(Pixel::NV12);
    context.set_bit_rate(bitrate as usize);
    context.set_max_bit_rate(bitrate as usize);
    context.set_time_base((1, fps as i32));
    context.set_frame_rate(Some((fps as i32, 1)));
    // One keyframe per second, recoverable half-way through.
    context.set_gop(fps);
    context.set_max_b_frames(0);
    context.set_flags(ffmpeg::codec::Flags::LOW_DELAY);

    unsafe {
        (*context.as_mut_ptr()).keyint_min = (fps / 2).max(1) as i32;
        if let Some(accel) = device_for(name) {
            let device = hw
                .device(accel)
                .ok_or_else(|| MediaError::Codec(format!("device context {accel} unavailable")))?;
            (*context.as_mut_ptr()).hw_device_ctx = device.new_ref();
        }
    }

    let mut opts = ffmpeg::Dictionary::new();
    opts.set("profile", "baseline");
    if name == SOFTWARE_ENCODER {
        opts.set("preset", "fast");
        opts.set("tune", "zerolatency");
        // Every IDR self-describes even if a downstream filter strips the
        // stream headers.
        opts.set("x264-params", "repeat-headers=1");
    } else {
        opts.set("rc", "cbr");
    }

    context.open_with(opts).map_err(MediaError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_list_ends_with_software() {
        let names = encoder_candidates();
        assert_eq!(*names.last().unwrap(), SOFTWARE_ENCODER);
    }

    #[test]
    fn alignment_rules() {
        assert_eq!(align_dim(1848, true), 1840);
        assert_eq!(align_dim(1081, false), 1080);
        assert_eq!(align_dim(15, true), 16);
    }

    #[test]
    fn device_mapping_covers_direct_attach_encoders() {
        assert_eq!(device_for("h264_qsv"), Some("qsv"));
        assert_eq!(device_for("h264_nvenc"), None);
        assert_eq!(device_for(SOFTWARE_ENCODER), None);
    }
}
