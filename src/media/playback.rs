//! Audio playback on the controller: a small bounded queue of Opus frames
//! feeding the default output device. Overflow drops the oldest buffer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use audiopus::coder::Decoder as OpusDecoder;
use audiopus::{Channels, SampleRate as OpusSampleRate};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{debug, info, warn};

use super::MediaError;

/// Queue depth before the oldest pending buffer is discarded.
pub const MAX_QUEUED_BUFFERS: usize = 5;
const OUTPUT_SAMPLE_RATE: u32 = 48_000;
const OUTPUT_CHANNELS: u16 = 2;
/// 20 ms stereo frame.
const FRAME_SAMPLES: usize = 960;

/// Bounded Opus-frame queue shared between the session worker and the
/// playback thread.
#[derive(Debug, Clone, Default)]
pub struct PlaybackQueue {
    inner: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl PlaybackQueue {
    pub fn push(&self, opus: Vec<u8>) {
        if let Ok(mut queue) = self.inner.lock() {
            if queue.len() >= MAX_QUEUED_BUFFERS {
                queue.pop_front();
                debug!("audio queue overflow, replaced oldest frame");
            }
            queue.push_back(opus);
        }
    }

    fn pop(&self) -> Option<Vec<u8>> {
        self.inner.lock().ok().and_then(|mut queue| queue.pop_front())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct AudioPlayback {
    queue: PlaybackQueue,
    running: Arc<AtomicBool>,
}

impl AudioPlayback {
    /// Opens the default output device on a dedicated thread.
    pub fn start() -> Result<Self, MediaError> {
        let queue = PlaybackQueue::default();
        let running = Arc::new(AtomicBool::new(true));
        let thread_queue = queue.clone();
        let flag = running.clone();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), MediaError>>();

        std::thread::Builder::new()
            .name("audio-playback".into())
            .spawn(move || playback_thread(thread_queue, flag, ready_tx))
            .map_err(|err| MediaError::AudioDevice(format!("thread spawn failed: {err}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { queue, running }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(MediaError::AudioDevice("playback thread died".into())),
        }
    }

    /// Queues one received Opus frame for playout.
    pub fn play(&self, opus: Vec<u8>) {
        self.queue.push(opus);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

fn playback_thread(
    queue: PlaybackQueue,
    running: Arc<AtomicBool>,
    ready: std_mpsc::Sender<Result<(), MediaError>>,
) {
    let host = cpal::default_host();
    let Some(device) = host.default_output_device() else {
        let _ = ready.send(Err(MediaError::AudioDevice(
            "no default audio output device".into(),
        )));
        return;
    };
    if let Ok(name) = device.name() {
        info!("audio output device: {name}");
    }

    let config = cpal::StreamConfig {
        channels: OUTPUT_CHANNELS,
        sample_rate: cpal::SampleRate(OUTPUT_SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    // Decoded PCM waiting for the device callback.
    let ring: Arc<Mutex<VecDeque<f32>>> = Arc::new(Mutex::new(VecDeque::new()));
    let callback_ring = ring.clone();
    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let mut ring = match callback_ring.lock() {
                Ok(ring) => ring,
                Err(_) => {
                    data.fill(0.0);
                    return;
                }
            };
            for slot in data.iter_mut() {
                *slot = ring.pop_front().unwrap_or(0.0);
            }
        },
        |err| warn!("audio output stream error: {err}"),
        None,
    );
    let stream = match stream {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready.send(Err(MediaError::AudioDevice(format!(
                "failed to open output stream: {err}"
            ))));
            return;
        }
    };
    if let Err(err) = stream.play() {
        let _ = ready.send(Err(MediaError::AudioDevice(format!(
            "failed to start output stream: {err}"
        ))));
        return;
    }

    let mut decoder = match OpusDecoder::new(OpusSampleRate::Hz48000, Channels::Stereo) {
        Ok(decoder) => decoder,
        Err(err) => {
            let _ = ready.send(Err(MediaError::AudioDevice(format!(
                "opus decoder: {err}"
            ))));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let mut pcm = vec![0i16; FRAME_SAMPLES * OUTPUT_CHANNELS as usize];
    while running.load(Ordering::Relaxed) {
        let Some(frame) = queue.pop() else {
            std::thread::sleep(Duration::from_millis(10));
            continue;
        };
        match decoder.decode(Some(frame.as_slice()), &mut pcm[..], false) {
            Ok(samples_per_channel) => {
                let total = samples_per_channel * OUTPUT_CHANNELS as usize;
                if let Ok(mut ring) = ring.lock() {
                    // Bound the ring to ~200 ms so latency cannot build up.
                    let cap = (OUTPUT_SAMPLE_RATE as usize / 5) * OUTPUT_CHANNELS as usize;
                    while ring.len() + total > cap {
                        ring.pop_front();
                    }
                    ring.extend(pcm[..total].iter().map(|s| *s as f32 / i16::MAX as f32));
                }
            }
            Err(err) => warn!("opus decode failed: {err}"),
        }
    }
    drop(stream);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_drops_oldest_on_overflow() {
        let queue = PlaybackQueue::default();
        for i in 0..MAX_QUEUED_BUFFERS + 2 {
            queue.push(vec![i as u8]);
        }
        assert_eq!(queue.len(), MAX_QUEUED_BUFFERS);
        // Frames 0 and 1 were discarded; the head is frame 2.
        assert_eq!(queue.pop().unwrap(), vec![2u8]);
    }
}
