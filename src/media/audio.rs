//! System-audio capture: loopback device discovery, silence gating, Opus
//! encoding.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};

use audiopus::coder::Encoder as OpusEncoder;
use audiopus::{Application, Channels, SampleRate as OpusSampleRate};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{info, warn};
use tokio::sync::mpsc;

use super::{AudioFrame, MediaError};

/// Capture format requested from the device.
pub const CAPTURE_SAMPLE_RATE: u32 = 44_100;
pub const CAPTURE_CHANNELS: u16 = 2;
/// Opus frame geometry: 20 ms at 48 kHz stereo.
const OPUS_SAMPLE_RATE: u32 = 48_000;
const OPUS_FRAME_SAMPLES: usize = 960;
/// Buffers quieter than this normalised amplitude are suppressed.
pub const SILENCE_THRESHOLD: f32 = 0.01;

/// Name fragments that identify a system-audio (loopback) capture device,
/// most specific first.
const LOOPBACK_NAMES: [&str; 8] = [
    "stereo mix",
    "stereo mixer",
    "what u hear",
    "wave out mix",
    "loopback",
    "monitor",
    "mix",
    "output",
];

fn find_capture_device(host: &cpal::Host) -> Result<cpal::Device, MediaError> {
    if let Ok(devices) = host.input_devices() {
        let named: Vec<(String, cpal::Device)> = devices
            .filter_map(|device| device.name().ok().map(|name| (name, device)))
            .collect();
        for wanted in LOOPBACK_NAMES {
            for (name, device) in &named {
                if name.to_lowercase().contains(wanted) {
                    info!("using system-audio capture device: {name}");
                    return Ok(device.clone());
                }
            }
        }
    }
    warn!("no loopback capture device found, falling back to default input");
    host.default_input_device()
        .ok_or_else(|| MediaError::AudioDevice("no audio input device".into()))
}

pub struct AudioCapture {
    running: Arc<AtomicBool>,
}

impl AudioCapture {
    /// Opens the capture device on a dedicated thread and emits Opus frames
    /// on `frames`. Quiet buffers never leave the host.
    pub fn start(frames: mpsc::Sender<AudioFrame>) -> Result<Self, MediaError> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), MediaError>>();

        std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || capture_thread(frames, flag, ready_tx))
            .map_err(|err| MediaError::AudioDevice(format!("thread spawn failed: {err}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { running }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(MediaError::AudioDevice("capture thread died".into())),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_thread(
    frames: mpsc::Sender<AudioFrame>,
    running: Arc<AtomicBool>,
    ready: std_mpsc::Sender<Result<(), MediaError>>,
) {
    let host = cpal::default_host();
    let device = match find_capture_device(&host) {
        Ok(device) => device,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    // Ask for 44.1 kHz 16-bit stereo; when the device's native format
    // differs, take the native one and convert downstream.
    let (config, sample_format) = match device.default_input_config() {
        Ok(default) => {
            let format = default.sample_format();
            let mut config: cpal::StreamConfig = default.into();
            if format == cpal::SampleFormat::I16 {
                config.channels = CAPTURE_CHANNELS;
                config.sample_rate = cpal::SampleRate(CAPTURE_SAMPLE_RATE);
            }
            (config, format)
        }
        Err(err) => {
            let _ = ready.send(Err(MediaError::AudioDevice(format!(
                "no default input config: {err}"
            ))));
            return;
        }
    };

    let (pcm_tx, pcm_rx) = std_mpsc::channel::<Vec<f32>>();
    let stream = match sample_format {
        cpal::SampleFormat::I16 => {
            let tx = pcm_tx.clone();
            device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let floats: Vec<f32> =
                        data.iter().map(|s| *s as f32 / i16::MAX as f32).collect();
                    let _ = tx.send(floats);
                },
                |err| warn!("audio input stream error: {err}"),
                None,
            )
        }
        _ => {
            let tx = pcm_tx.clone();
            device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let _ = tx.send(data.to_vec());
                },
                |err| warn!("audio input stream error: {err}"),
                None,
            )
        }
    };
    let stream = match stream {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready.send(Err(MediaError::AudioDevice(format!(
                "failed to open input stream: {err}"
            ))));
            return;
        }
    };
    if let Err(err) = stream.play() {
        let _ = ready.send(Err(MediaError::AudioDevice(format!(
            "failed to start input stream: {err}"
        ))));
        return;
    }

    let mut encoder =
        match OpusEncoder::new(OpusSampleRate::Hz48000, Channels::Stereo, Application::Audio) {
            Ok(encoder) => encoder,
            Err(err) => {
                let _ = ready.send(Err(MediaError::AudioDevice(format!(
                    "opus encoder: {err}"
                ))));
                return;
            }
        };
    let _ = ready.send(Ok(()));
    info!(
        "audio capture running: {} ch @ {} Hz",
        config.channels, config.sample_rate.0
    );

    let channels = config.channels as usize;
    let rate = config.sample_rate.0;
    let mut pending: Vec<f32> = Vec::new(); // interleaved stereo at 48 kHz
    let mut opus_buf = vec![0u8; 4000];

    while running.load(Ordering::Relaxed) {
        let chunk = match pcm_rx.recv_timeout(std::time::Duration::from_millis(200)) {
            Ok(chunk) => chunk,
            Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        };

        let stereo = to_stereo(&chunk, channels);
        let resampled = if rate == OPUS_SAMPLE_RATE {
            stereo
        } else {
            resample_stereo(&stereo, rate, OPUS_SAMPLE_RATE)
        };
        pending.extend_from_slice(&resampled);

        while pending.len() >= OPUS_FRAME_SAMPLES * 2 {
            let frame: Vec<f32> = pending.drain(..OPUS_FRAME_SAMPLES * 2).collect();
            if buffer_level(&frame) <= SILENCE_THRESHOLD {
                continue;
            }
            let pcm: Vec<i16> = frame
                .iter()
                .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                .collect();
            match encoder.encode(&pcm, &mut opus_buf) {
                Ok(len) => {
                    let _ = frames.try_send(AudioFrame {
                        data: opus_buf[..len].to_vec(),
                    });
                }
                Err(err) => warn!("opus encode failed: {err}"),
            }
        }
    }
    drop(stream);
}

/// Mean absolute amplitude of a normalised buffer.
pub fn buffer_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len() as f32
}

/// Downmixes (or duplicates) an interleaved buffer to stereo.
fn to_stereo(samples: &[f32], channels: usize) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.iter().flat_map(|s| [*s, *s]).collect(),
        2 => samples.to_vec(),
        n => samples
            .chunks_exact(n)
            .flat_map(|frame| [frame[0], frame[1]])
            .collect(),
    }
}

/// Linear-interpolation resampler over interleaved stereo.
fn resample_stereo(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    let in_frames = input.len() / 2;
    let out_frames = (in_frames as u64 * to_rate as u64 / from_rate as u64) as usize;
    let ratio = from_rate as f64 / to_rate as f64;
    let mut out = Vec::with_capacity(out_frames * 2);
    for i in 0..out_frames {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;
        for ch in 0..2 {
            let a = input.get(idx * 2 + ch).copied().unwrap_or(0.0);
            let b = input.get((idx + 1) * 2 + ch).copied().unwrap_or(a);
            out.push(a + (b - a) * frac);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_stays_below_threshold() {
        let quiet = vec![0.001f32; 1920];
        assert!(buffer_level(&quiet) <= SILENCE_THRESHOLD);
        let speech: Vec<f32> = (0..1920).map(|i| ((i % 7) as f32 - 3.0) / 10.0).collect();
        assert!(buffer_level(&speech) > SILENCE_THRESHOLD);
    }

    #[test]
    fn mono_duplicates_into_stereo() {
        assert_eq!(to_stereo(&[0.5, -0.5], 1), vec![0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn surround_takes_front_pair() {
        let frame = [0.1f32, 0.2, 0.9, 0.9, 0.9, 0.9];
        assert_eq!(to_stereo(&frame, 6), vec![0.1, 0.2]);
    }

    #[test]
    fn resampler_scales_frame_count() {
        let input = vec![0.0f32; 441 * 2]; // 10 ms at 44.1 kHz stereo
        let output = resample_stereo(&input, 44_100, 48_000);
        assert_eq!(output.len() / 2, 480);
    }
}
