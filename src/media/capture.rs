//! Screen grabbing on a dedicated thread feeding the H.264 encoder.
//!
//! The scrap capturer is not `Send` on X11, so the display, the capturer,
//! and the encoder all live inside the capture thread; control messages and
//! encoded frames cross thread boundaries over channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use scrap::{Capturer, Display};
use tokio::sync::mpsc;

use super::encoder::VideoEncoder;
use super::hw::HwContextRegistry;
use super::{EncodedFrame, MediaError, RgbFrame};

/// Outbound queue depth. When the sender stalls, older frames are dropped
/// rather than queued.
const FRAME_QUEUE: usize = 4;

#[derive(Debug)]
enum CaptureControl {
    ForceKeyframe,
    SetFps(u32),
    Stop,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate: u64,
    pub aggressive_repeat_headers: bool,
}

/// Native geometry of the primary display.
pub fn primary_screen_size() -> Result<(u32, u32), MediaError> {
    let display = Display::primary().map_err(|_| MediaError::NoDisplay)?;
    Ok((display.width() as u32, display.height() as u32))
}

/// Handle to a running capture worker.
pub struct ScreenCapture {
    control: std_mpsc::Sender<CaptureControl>,
    running: Arc<AtomicBool>,
}

impl ScreenCapture {
    /// Starts grabbing the primary display at the requested geometry and
    /// cadence, emitting encoded access units on `frames`.
    pub fn start(
        hw: Arc<HwContextRegistry>,
        settings: CaptureSettings,
        frames: mpsc::Sender<EncodedFrame>,
    ) -> Result<Self, MediaError> {
        // Fail fast when there is no display before spawning the worker.
        let display = Display::primary().map_err(|_| MediaError::NoDisplay)?;
        drop(display);

        let (control_tx, control_rx) = std_mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        let running_flag = running.clone();

        std::thread::Builder::new()
            .name("screen-capture".into())
            .spawn(move || capture_loop(hw, settings, frames, control_rx, running_flag))
            .map_err(|err| MediaError::Codec(format!("capture thread spawn failed: {err}")))?;

        Ok(Self {
            control: control_tx,
            running,
        })
    }

    /// Marks the next encoded frame as IDR.
    pub fn force_keyframe(&self) {
        let _ = self.control.send(CaptureControl::ForceKeyframe);
    }

    /// Reprograms the capture cadence without touching the encoder.
    pub fn set_fps(&self, fps: u32) {
        let _ = self.control.send(CaptureControl::SetFps(fps.clamp(1, 60)));
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        let _ = self.control.send(CaptureControl::Stop);
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for ScreenCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    hw: Arc<HwContextRegistry>,
    settings: CaptureSettings,
    frames: mpsc::Sender<EncodedFrame>,
    control: std_mpsc::Receiver<CaptureControl>,
    running: Arc<AtomicBool>,
) {
    let display = match Display::primary() {
        Ok(display) => display,
        Err(err) => {
            error!("screen capture: no display: {err}");
            running.store(false, Ordering::Relaxed);
            return;
        }
    };
    let src_w = display.width();
    let src_h = display.height();
    let mut capturer = match Capturer::new(display) {
        Ok(capturer) => capturer,
        Err(err) => {
            error!("screen capture: failed to start: {err}");
            running.store(false, Ordering::Relaxed);
            return;
        }
    };

    let mut encoder = match VideoEncoder::new(
        &hw,
        settings.width,
        settings.height,
        settings.fps,
        settings.bitrate,
        settings.aggressive_repeat_headers,
    ) {
        Ok(encoder) => encoder,
        Err(err) => {
            error!("screen capture: encoder unavailable: {err}");
            running.store(false, Ordering::Relaxed);
            return;
        }
    };
    info!(
        "capture started: screen {src_w}x{src_h} -> {:?} @ {} fps via {}",
        encoder.dimensions(),
        settings.fps,
        encoder.name()
    );

    let mut interval = Duration::from_millis(1000 / settings.fps.max(1) as u64);
    let mut dropped: u64 = 0;

    while running.load(Ordering::Relaxed) {
        let tick_start = Instant::now();

        // Apply pending control messages before grabbing.
        loop {
            match control.try_recv() {
                Ok(CaptureControl::ForceKeyframe) => encoder.force_keyframe(),
                Ok(CaptureControl::SetFps(fps)) => {
                    interval = Duration::from_millis(1000 / fps.max(1) as u64);
                    info!("capture cadence changed to {fps} fps");
                }
                Ok(CaptureControl::Stop) | Err(std_mpsc::TryRecvError::Disconnected) => {
                    running.store(false, Ordering::Relaxed);
                    return;
                }
                Err(std_mpsc::TryRecvError::Empty) => break,
            }
        }

        match capturer.frame() {
            Ok(frame) => {
                let stride = frame.len() / src_h;
                let rgb = bgra_to_rgb(&frame, src_w, src_h, stride);
                match encoder.encode(&rgb) {
                    Ok(Some(encoded)) => match frames.try_send(encoded) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            dropped += 1;
                            if dropped % 100 == 0 {
                                debug!("capture backpressure: {dropped} frames dropped");
                            }
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            running.store(false, Ordering::Relaxed);
                            return;
                        }
                    },
                    Ok(None) => {}
                    Err(err) => warn!("encode failed, dropping frame: {err}"),
                }
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(5));
                continue;
            }
            Err(err) => {
                warn!("capture error, retrying: {err}");
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
        }

        let elapsed = tick_start.elapsed();
        if elapsed < interval {
            std::thread::sleep(interval - elapsed);
        }
    }
}

/// scrap hands out BGRA rows with stride padding; the encoder wants tightly
/// packed RGB.
fn bgra_to_rgb(bgra: &[u8], width: usize, height: usize, stride: usize) -> RgbFrame {
    let mut data = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        let row = &bgra[y * stride..];
        for x in 0..width {
            let offset = x * 4;
            if offset + 2 < row.len() {
                data.push(row[offset + 2]);
                data.push(row[offset + 1]);
                data.push(row[offset]);
            } else {
                data.extend_from_slice(&[0, 0, 0]);
            }
        }
    }
    RgbFrame {
        width: width as u32,
        height: height as u32,
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgra_conversion_swaps_channels_and_drops_padding() {
        // 2x1 image with 12-byte stride (4 bytes padding).
        let bgra = [
            10u8, 20, 30, 255, // pixel 0: B=10 G=20 R=30
            40, 50, 60, 255, // pixel 1
            0, 0, 0, 0, // stride padding
        ];
        let rgb = bgra_to_rgb(&bgra, 2, 1, 12);
        assert_eq!(rgb.data, vec![30, 20, 10, 60, 50, 40]);
        assert_eq!((rgb.width, rgb.height), (2, 1));
    }
}
