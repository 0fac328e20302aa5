//! Controlled-side session: exposes screen, audio, filesystem, and input to
//! one remote controller.
//!
//! The callee creates the PeerConnection, adds send-only tracks and the three
//! data channels, generates the offer, and starts the capture pipelines once
//! the connection is up. Library callbacks are re-marshalled onto the session
//! worker through a command channel; the worker owns every mutable piece.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::media::Sample;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::IceSettings;
use crate::events::{EventBus, UiEvent};
use crate::files::{
    build_listing, upload_ack, DatagramSink, FileProtocol, FragmentReassembler, IngestOutcome,
};
use crate::input::{parse_event, InputEvent, InputGate, InputInjector};
use crate::media::capture::{primary_screen_size, CaptureSettings, ScreenCapture};
use crate::media::audio::AudioCapture;
use crate::media::hw::HwContextRegistry;
use crate::media::{compute_encode_size, AudioFrame, EncodedFrame};
use crate::signal::{SignalClient, SignalEvent};
use crate::wire::{
    ChannelMessage, Envelope, CHANNEL_FILE, CHANNEL_FILE_TEXT, CHANNEL_INPUT, FOLDER_HOME,
    MSG_FILE_DOWNLOAD, MSG_FILE_LIST, MSG_FILE_UPLOAD, MSG_KEYFRAME_RESPONSE,
    MSG_REQUEST_KEYFRAME, ROLE_CLI, ROLE_CTL, STREAM_VIDEO_MSID, TRACK_AUDIO, TRACK_VIDEO,
    TYPE_ANSWER, TYPE_CANDIDATE, TYPE_OFFER,
};

use super::{
    build_peer_connection, candidate_envelope, candidate_init, description_envelope,
    envelope_is_for, CandidateGate, DataChannelSink, SessionError, SessionIdentity, SessionMode,
    SessionState,
};

const VIDEO_FRAME_QUEUE: usize = 4;
const AUDIO_FRAME_QUEUE: usize = 16;
/// 20 ms Opus cadence.
const AUDIO_FRAME_DURATION: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct CalleeConfig {
    pub remote_id: String,
    pub fps: u32,
    pub mode: SessionMode,
    pub only_relay: bool,
    pub control_max_width: Option<i32>,
    pub control_max_height: Option<i32>,
    pub aggressive_repeat_headers: bool,
}

enum Cmd {
    Signal(Envelope),
    PeerState(RTCPeerConnectionState),
    LocalCandidate { candidate: String, mid: String },
    FileBinary(Vec<u8>),
    FileText(String),
    FileTextOpen,
    InputText(String),
    Close,
}

/// Handle held by the registry. Dropping it does not stop the session; the
/// registry closes explicitly so teardown stays ordered.
pub struct CalleeHandle {
    pub remote_id: String,
    cmd: mpsc::UnboundedSender<Cmd>,
    state: watch::Receiver<SessionState>,
}

impl CalleeHandle {
    pub fn close(&self) {
        let _ = self.cmd.send(Cmd::Close);
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }
}

pub struct CalleeSession;

impl CalleeSession {
    /// Creates the PeerConnection, tracks, and channels, ships the offer,
    /// and spawns the session worker.
    pub async fn spawn(
        cfg: CalleeConfig,
        ice: IceSettings,
        identity: SessionIdentity,
        signal: SignalClient,
        hw: Arc<HwContextRegistry>,
        events: EventBus,
        injector: Arc<dyn InputInjector>,
    ) -> Result<CalleeHandle, SessionError> {
        let pc = build_peer_connection(&ice, cfg.only_relay).await?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::New);

        wire_connection_state(&pc, &cmd_tx);
        wire_local_candidates(&pc, &cmd_tx);

        let mut video_track = None;
        let mut audio_track = None;
        let mut input_channel = None;
        if !cfg.mode.is_only_file() {
            let video = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: webrtc::api::media_engine::MIME_TYPE_H264.to_owned(),
                    ..Default::default()
                },
                TRACK_VIDEO.to_owned(),
                STREAM_VIDEO_MSID.to_owned(),
            ));
            pc.add_track(Arc::clone(&video) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            video_track = Some(video);

            let audio = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: webrtc::api::media_engine::MIME_TYPE_OPUS.to_owned(),
                    ..Default::default()
                },
                TRACK_AUDIO.to_owned(),
                STREAM_VIDEO_MSID.to_owned(),
            ));
            pc.add_track(Arc::clone(&audio) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            audio_track = Some(audio);

            let input = pc.create_data_channel(CHANNEL_INPUT, None).await?;
            wire_text_channel(&input, &cmd_tx, |text| Cmd::InputText(text));
            input_channel = Some(input);
        }

        let file_channel = pc.create_data_channel(CHANNEL_FILE, None).await?;
        wire_file_channel(&file_channel, &cmd_tx, cfg.mode);
        let file_text_channel = pc.create_data_channel(CHANNEL_FILE_TEXT, None).await?;
        wire_file_text_channel(&file_text_channel, &cmd_tx);

        // The offer goes out immediately after tracks and channels exist;
        // candidates trickle behind it through the worker.
        let offer = pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        pc.set_local_description(offer).await?;
        let envelope =
            description_envelope(ROLE_CLI, TYPE_OFFER, &identity.local_id, &cfg.remote_id, &sdp);
        signal.send_text(envelope.encode().unwrap_or_default());
        info!("callee offer sent to {}", cfg.remote_id);
        let _ = state_tx.send(SessionState::Negotiating);
        events.publish(UiEvent::SessionState {
            peer_id: cfg.remote_id.clone(),
            state: SessionState::Negotiating.label().to_string(),
        });

        spawn_signal_forwarder(&signal, &identity, &cfg.remote_id, cmd_tx.clone());

        let worker = Worker {
            cfg: cfg.clone(),
            identity,
            pc,
            video_track,
            audio_track,
            file_channel,
            file_text_channel,
            input_channel,
            reassembler: FragmentReassembler::new("file"),
            gate: CandidateGate::default(),
            capture: None,
            audio_capture: None,
            signal,
            events,
            hw,
            injector,
            state_tx,
            closed: false,
        };
        let remote_id = cfg.remote_id.clone();
        tokio::spawn(worker.run(cmd_rx));

        Ok(CalleeHandle {
            remote_id,
            cmd: cmd_tx,
            state: state_rx,
        })
    }
}

fn wire_connection_state(pc: &Arc<RTCPeerConnection>, cmd: &mpsc::UnboundedSender<Cmd>) {
    let tx = cmd.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let _ = tx.send(Cmd::PeerState(state));
        Box::pin(async {})
    }));
}

fn wire_local_candidates(pc: &Arc<RTCPeerConnection>, cmd: &mpsc::UnboundedSender<Cmd>) {
    let tx = cmd.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let tx = tx.clone();
        Box::pin(async move {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(Cmd::LocalCandidate {
                            candidate: init.candidate,
                            mid: init.sdp_mid.unwrap_or_default(),
                        });
                    }
                    Err(err) => warn!("candidate to_json failed: {err}"),
                }
            }
        })
    }));
}

fn wire_file_channel(
    dc: &Arc<RTCDataChannel>,
    cmd: &mpsc::UnboundedSender<Cmd>,
    mode: SessionMode,
) {
    let tx = cmd.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        if msg.is_string {
            warn!("file channel received text, expected fragments on file_text");
        } else {
            let _ = tx.send(Cmd::FileBinary(msg.data.to_vec()));
        }
        Box::pin(async {})
    }));
    let tx = cmd.clone();
    dc.on_close(Box::new(move || {
        info!("file channel closed");
        if mode.is_only_file() {
            let _ = tx.send(Cmd::Close);
        }
        Box::pin(async {})
    }));
}

fn wire_file_text_channel(dc: &Arc<RTCDataChannel>, cmd: &mpsc::UnboundedSender<Cmd>) {
    let open_tx = cmd.clone();
    dc.on_open(Box::new(move || {
        let _ = open_tx.send(Cmd::FileTextOpen);
        Box::pin(async {})
    }));
    let tx = cmd.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        if msg.is_string {
            if let Ok(text) = String::from_utf8(msg.data.to_vec()) {
                let _ = tx.send(Cmd::FileText(text));
            }
        } else {
            warn!("file_text channel received binary data, ignoring");
        }
        Box::pin(async {})
    }));
}

fn wire_text_channel(
    dc: &Arc<RTCDataChannel>,
    cmd: &mpsc::UnboundedSender<Cmd>,
    make: fn(String) -> Cmd,
) {
    let tx = cmd.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        if msg.is_string {
            if let Ok(text) = String::from_utf8(msg.data.to_vec()) {
                let _ = tx.send(make(text));
            }
        }
        Box::pin(async {})
    }));
}

fn spawn_signal_forwarder(
    signal: &SignalClient,
    identity: &SessionIdentity,
    remote_id: &str,
    cmd: mpsc::UnboundedSender<Cmd>,
) {
    let mut rx = signal.subscribe();
    let local_id = identity.local_id.clone();
    let remote_id = remote_id.to_string();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("signal subscriber lagged, skipped {skipped} events");
                    continue;
                }
                Err(_) => return,
            };
            let raw = match &event {
                SignalEvent::Text(text) => text.as_bytes(),
                SignalEvent::Binary(bytes) => bytes.as_slice(),
                _ => continue,
            };
            let Ok(envelope) = Envelope::decode(raw) else {
                continue;
            };
            if !envelope_is_for(&envelope, ROLE_CTL, &local_id, &remote_id) {
                continue;
            }
            if cmd.send(Cmd::Signal(envelope)).is_err() {
                return;
            }
        }
    });
}

struct Worker {
    cfg: CalleeConfig,
    identity: SessionIdentity,
    pc: Arc<RTCPeerConnection>,
    video_track: Option<Arc<TrackLocalStaticSample>>,
    audio_track: Option<Arc<TrackLocalStaticSample>>,
    file_channel: Arc<RTCDataChannel>,
    file_text_channel: Arc<RTCDataChannel>,
    input_channel: Option<Arc<RTCDataChannel>>,
    reassembler: FragmentReassembler,
    gate: CandidateGate,
    capture: Option<ScreenCapture>,
    audio_capture: Option<AudioCapture>,
    signal: SignalClient,
    events: EventBus,
    hw: Arc<HwContextRegistry>,
    injector: Arc<dyn InputInjector>,
    state_tx: watch::Sender<SessionState>,
    closed: bool,
}

impl Worker {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Cmd>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Cmd::Signal(envelope) => self.on_signal(envelope).await,
                Cmd::PeerState(state) => {
                    if self.on_peer_state(state).await {
                        break;
                    }
                }
                Cmd::LocalCandidate { candidate, mid } => {
                    let envelope = candidate_envelope(
                        ROLE_CLI,
                        &self.identity.local_id,
                        &self.cfg.remote_id,
                        &candidate,
                        &mid,
                    );
                    self.signal.send_text(envelope.encode().unwrap_or_default());
                }
                Cmd::FileBinary(bytes) => self.on_file_fragment(&bytes).await,
                Cmd::FileText(text) => self.on_file_text(&text).await,
                Cmd::FileTextOpen => self.push_home_listing().await,
                Cmd::InputText(text) => self.on_input(&text).await,
                Cmd::Close => break,
            }
        }
        self.shutdown().await;
    }

    async fn on_signal(&mut self, envelope: Envelope) {
        match envelope.kind.as_str() {
            TYPE_ANSWER => {
                let Some(sdp) = envelope.data_str() else {
                    error!("answer without sdp payload");
                    return;
                };
                let description = match RTCSessionDescription::answer(sdp.to_string()) {
                    Ok(description) => description,
                    Err(err) => {
                        error!("invalid answer sdp: {err}");
                        return;
                    }
                };
                if let Err(err) = self.pc.set_remote_description(description).await {
                    error!("set remote answer failed, aborting session: {err}");
                    let _ = self.state_tx.send(SessionState::Draining);
                    return;
                }
                for pending in self.gate.open() {
                    if let Err(err) = self.pc.add_ice_candidate(pending).await {
                        warn!("queued candidate rejected: {err}");
                    }
                }
                debug!("remote answer applied for {}", self.cfg.remote_id);
            }
            TYPE_CANDIDATE => {
                let data = envelope.data_str().unwrap_or_default();
                let mid = envelope.mid.as_deref().unwrap_or_default();
                if data.is_empty() || mid.is_empty() {
                    return;
                }
                if let Some(ready) = self.gate.admit(candidate_init(data, mid)) {
                    if let Err(err) = self.pc.add_ice_candidate(ready).await {
                        warn!("remote candidate rejected: {err}");
                    }
                }
            }
            other => debug!("callee ignoring envelope type '{other}'"),
        }
    }

    /// Returns true when the worker should stop.
    async fn on_peer_state(&mut self, state: RTCPeerConnectionState) -> bool {
        info!("callee connection state: {state}");
        match state {
            RTCPeerConnectionState::Connected => {
                let _ = self.state_tx.send(SessionState::Connected);
                self.log_selected_pair().await;
                self.events.publish(UiEvent::SessionState {
                    peer_id: self.cfg.remote_id.clone(),
                    state: SessionState::Connected.label().to_string(),
                });
                if !self.cfg.mode.is_only_file() {
                    self.start_media();
                }
                false
            }
            RTCPeerConnectionState::Failed
            | RTCPeerConnectionState::Closed
            | RTCPeerConnectionState::Disconnected => true,
            _ => false,
        }
    }

    async fn log_selected_pair(&self) {
        let ice = self.pc.sctp().transport().ice_transport();
        if let Some(pair) = ice.get_selected_candidate_pair().await {
            info!("selected candidate pair: {pair}");
        }
    }

    fn start_media(&mut self) {
        if self.capture.is_some() {
            return;
        }
        let (screen_w, screen_h) = match primary_screen_size() {
            Ok(size) => size,
            Err(err) => {
                error!("cannot start capture: {err}");
                return;
            }
        };
        let (width, height) = compute_encode_size(
            screen_w,
            screen_h,
            self.cfg.control_max_width,
            self.cfg.control_max_height,
        );
        info!(
            "encode size {width}x{height} (screen {screen_w}x{screen_h}, control max {:?}x{:?})",
            self.cfg.control_max_width, self.cfg.control_max_height
        );

        let (frames_tx, frames_rx) = mpsc::channel::<EncodedFrame>(VIDEO_FRAME_QUEUE);
        match ScreenCapture::start(
            self.hw.clone(),
            CaptureSettings {
                width,
                height,
                fps: self.cfg.fps,
                bitrate: 0,
                aggressive_repeat_headers: self.cfg.aggressive_repeat_headers,
            },
            frames_tx,
        ) {
            Ok(capture) => {
                self.capture = Some(capture);
                if let Some(track) = self.video_track.clone() {
                    spawn_video_pump(track, frames_rx, self.cfg.fps);
                }
            }
            // Capture loss is fatal to media only; file transfer continues.
            Err(err) => error!("screen capture failed: {err}"),
        }

        let (audio_tx, audio_rx) = mpsc::channel::<AudioFrame>(AUDIO_FRAME_QUEUE);
        match AudioCapture::start(audio_tx) {
            Ok(audio) => {
                self.audio_capture = Some(audio);
                if let Some(track) = self.audio_track.clone() {
                    spawn_audio_pump(track, audio_rx);
                }
            }
            Err(err) => warn!("audio capture unavailable: {err}"),
        }
    }

    async fn on_file_fragment(&mut self, bytes: &[u8]) {
        match self.reassembler.ingest(bytes) {
            IngestOutcome::Complete {
                scratch_path, ok, ..
            } if ok => {
                let done = FileProtocol::handle_completed_message(&scratch_path).await;
                if done.msg_type == MSG_FILE_UPLOAD {
                    let message = if done.ok {
                        "upload successful"
                    } else {
                        "upload failed"
                    };
                    let ack = upload_ack(&done.dest, done.ok, message);
                    self.send_file_text(&ack).await;
                }
            }
            IngestOutcome::Complete { .. } => {
                warn!("fragment reassembly failed, message discarded");
            }
            IngestOutcome::Incomplete | IngestOutcome::Dropped(_) => {}
        }
    }

    async fn on_file_text(&mut self, text: &str) {
        let Ok(msg) = ChannelMessage::decode(text.as_bytes()) else {
            error!("file_text parse error, dropping message");
            return;
        };
        match msg.msg_type.as_str() {
            MSG_FILE_LIST => {
                let requested = msg.path.as_deref().unwrap_or(FOLDER_HOME);
                let reply = build_listing(&requested_or_home(requested), &home_dir());
                self.send_file_text(&reply).await;
            }
            MSG_FILE_DOWNLOAD => {
                let (Some(src), Some(dest)) = (msg.path_cli.clone(), msg.path_ctl.clone())
                else {
                    error!("download request missing paths");
                    return;
                };
                let file_sink = DataChannelSink(self.file_channel.clone());
                let text_sink = DataChannelSink(self.file_text_channel.clone());
                tokio::spawn(async move {
                    let result = FileProtocol::send_tree(
                        &PathBuf::from(&src),
                        &PathBuf::from(&dest),
                        MSG_FILE_DOWNLOAD,
                        &file_sink,
                        &text_sink,
                    )
                    .await;
                    if let Err(err) = result {
                        error!("download send failed for {src}: {err}");
                        let mut response = ChannelMessage::new(MSG_FILE_DOWNLOAD);
                        response.path = Some(src);
                        response.error = Some(err.to_string());
                        if let Ok(json) = response.encode() {
                            let _ = text_sink.send_text(json).await;
                        }
                    }
                });
            }
            MSG_FILE_UPLOAD => {
                debug!("upload announced, waiting for fragments on file channel");
            }
            other => warn!("unknown file_text message type '{other}'"),
        }
    }

    async fn push_home_listing(&mut self) {
        let reply = build_listing(FOLDER_HOME, &home_dir());
        self.send_file_text(&reply).await;
    }

    async fn on_input(&mut self, text: &str) {
        let Ok(msg) = ChannelMessage::decode(text.as_bytes()) else {
            error!("input channel parse error");
            return;
        };
        let gate = InputGate::new(
            &self.identity.local_id,
            &self.identity.local_pwd_md5,
            &self.cfg.remote_id,
        );
        if let Err(err) = gate.validate(&msg) {
            warn!("rejecting input message: {err}");
            return;
        }

        if msg.msg_type == MSG_REQUEST_KEYFRAME {
            info!("keyframe requested by controller");
            if let Some(capture) = &self.capture {
                capture.force_keyframe();
            }
            let mut response = ChannelMessage::new(MSG_KEYFRAME_RESPONSE);
            response.sender = Some(self.identity.local_id.clone());
            response.receiver = Some(self.cfg.remote_id.clone());
            response.timestamp = Some(Utc::now().timestamp_millis());
            response.message = Some("requested".to_string());
            if let (Some(dc), Ok(json)) = (&self.input_channel, response.encode()) {
                if let Err(err) = dc.send_text(json).await {
                    warn!("keyframe response send failed: {err}");
                }
            }
            return;
        }

        match parse_event(&msg) {
            Some(InputEvent::Mouse(mouse)) => self.injector.mouse(&mouse),
            Some(InputEvent::Keyboard(key)) => self.injector.keyboard(&key),
            None => warn!("unknown input message type '{}'", msg.msg_type),
        }
    }

    async fn send_file_text(&self, msg: &ChannelMessage) {
        match msg.encode() {
            Ok(json) => {
                if let Err(err) = self.file_text_channel.send_text(json).await {
                    error!("file_text send failed: {err}");
                }
            }
            Err(err) => error!("file_text encode failed: {err}"),
        }
    }

    /// Ordered, idempotent teardown: stop capture, close channels and
    /// tracks, release the PeerConnection.
    async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.state_tx.send(SessionState::Draining);

        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(audio) = self.audio_capture.take() {
            audio.stop();
        }
        if let Some(input) = &self.input_channel {
            let _ = input.close().await;
        }
        let _ = self.file_channel.close().await;
        let _ = self.file_text_channel.close().await;
        if let Err(err) = self.pc.close().await {
            warn!("peer connection close failed: {err}");
        }
        let _ = self.state_tx.send(SessionState::Closed);
        self.events.publish(UiEvent::SessionState {
            peer_id: self.cfg.remote_id.clone(),
            state: SessionState::Closed.label().to_string(),
        });
        info!("callee session for {} closed", self.cfg.remote_id);
    }
}

fn spawn_video_pump(
    track: Arc<TrackLocalStaticSample>,
    mut frames: mpsc::Receiver<EncodedFrame>,
    fps: u32,
) {
    let frame_duration = Duration::from_millis(1000 / fps.max(1) as u64);
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let sample = Sample {
                data: Bytes::from(frame.data),
                duration: frame_duration,
                ..Default::default()
            };
            if let Err(err) = track.write_sample(&sample).await {
                debug!("video write_sample failed: {err}");
            }
        }
    });
}

fn spawn_audio_pump(track: Arc<TrackLocalStaticSample>, mut frames: mpsc::Receiver<AudioFrame>) {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let sample = Sample {
                data: Bytes::from(frame.data),
                duration: AUDIO_FRAME_DURATION,
                ..Default::default()
            };
            if let Err(err) = track.write_sample(&sample).await {
                debug!("audio write_sample failed: {err}");
            }
        }
    });
}

fn home_dir() -> PathBuf {
    #[cfg(windows)]
    let var = "USERPROFILE";
    #[cfg(not(windows))]
    let var = "HOME";
    std::env::var_os(var)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

fn requested_or_home(requested: &str) -> String {
    if requested.is_empty() {
        FOLDER_HOME.to_string()
    } else {
        requested.to_string()
    }
}
