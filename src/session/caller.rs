//! Controller-side session: renders remote frames, forwards input, and
//! drives file browsing/transfer.
//!
//! The caller answers the callee's offer, receives the three data channels
//! through `on_data_channel` keyed by label, and binds the received tracks
//! to the decode worker. H.264 decoding runs on a dedicated thread; the
//! session worker keeps the recovery bookkeeping and the keyframe retry
//! timer.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::codecs::opus::OpusPacket;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

use crate::config::IceSettings;
use crate::events::{EventBus, UiEvent};
use crate::files::{
    download_request, listing_request, FileProtocol, FragmentReassembler, IngestOutcome,
};
use crate::input::{encode_event, InputEvent};
use crate::media::decoder::{RecoveryTracker, VideoDecoder};
use crate::media::hw::HwContextRegistry;
use crate::media::playback::AudioPlayback;
use crate::media::RgbFrame;
use crate::signal::{SignalClient, SignalEvent};
use crate::wire::{
    ChannelMessage, Envelope, CHANNEL_FILE, CHANNEL_FILE_TEXT, CHANNEL_INPUT, MSG_FILE_DOWNLOAD,
    MSG_FILE_LIST, MSG_FILE_UPLOAD, MSG_KEYFRAME_RESPONSE, MSG_REQUEST_KEYFRAME,
    MSG_UPLOAD_FILE_RES, ROLE_CLI, ROLE_CTL, TYPE_ANSWER, TYPE_CANDIDATE, TYPE_CONNECT,
    TYPE_OFFER,
};

use super::{
    build_peer_connection, candidate_envelope, candidate_init, description_envelope,
    envelope_is_for, CandidateGate, DataChannelSink, SessionError, SessionIdentity, SessionMode,
    SessionState,
};

const KEYFRAME_RETRY: Duration = Duration::from_secs(2);
/// Late-packet window for the RTP sample builders.
const SAMPLE_BUILDER_DEPTH: u16 = 512;

#[derive(Debug, Clone)]
pub struct CallerConfig {
    pub remote_id: String,
    pub remote_pwd_md5: String,
    pub mode: SessionMode,
    pub adaptive_resolution: bool,
    pub only_relay: bool,
    pub fps: u32,
    /// Maximum viewable area, sent with `connect` when adaptive resolution
    /// is on.
    pub control_max: Option<(i32, i32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelKind {
    File,
    FileText,
    Input,
}

enum Cmd {
    Signal(Envelope),
    PeerState(RTCPeerConnectionState),
    LocalCandidate { candidate: String, mid: String },
    ChannelOpened(ChannelKind, Arc<RTCDataChannel>),
    FileBinary(Vec<u8>),
    FileText(String),
    InputText(String),
    VideoSample(Vec<u8>),
    AudioSample(Vec<u8>),
    Decoded(DecodeEvent),
    ListRemote(String),
    Download { remote: String, local: String },
    Upload { local: String, remote: String },
    SendInput(InputEvent),
    Close,
}

enum DecodeEvent {
    Frame(RgbFrame),
    Failed,
}

enum DecodeJob {
    Decode(Vec<u8>),
    AwaitKeyframe,
    Stop,
}

/// Handle exposed to the UI layer.
#[derive(Clone)]
pub struct CallerHandle {
    pub remote_id: String,
    cmd: mpsc::UnboundedSender<Cmd>,
    state: watch::Receiver<SessionState>,
}

impl CallerHandle {
    pub fn list_remote(&self, path: &str) {
        let _ = self.cmd.send(Cmd::ListRemote(path.to_string()));
    }

    pub fn download(&self, remote_path: &str, local_path: &str) {
        let _ = self.cmd.send(Cmd::Download {
            remote: remote_path.to_string(),
            local: local_path.to_string(),
        });
    }

    pub fn upload(&self, local_path: &str, remote_path: &str) {
        let _ = self.cmd.send(Cmd::Upload {
            local: local_path.to_string(),
            remote: remote_path.to_string(),
        });
    }

    pub fn send_input(&self, event: InputEvent) {
        let _ = self.cmd.send(Cmd::SendInput(event));
    }

    pub fn close(&self) {
        let _ = self.cmd.send(Cmd::Close);
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }
}

pub struct CallerSession;

impl CallerSession {
    /// Builds the PeerConnection, announces itself with a `connect`
    /// envelope, and waits for the callee's offer.
    pub async fn spawn(
        cfg: CallerConfig,
        ice: IceSettings,
        identity: SessionIdentity,
        signal: SignalClient,
        hw: Arc<HwContextRegistry>,
        events: EventBus,
    ) -> Result<CallerHandle, SessionError> {
        let pc = build_peer_connection(&ice, cfg.only_relay).await?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::New);

        wire_connection_state(&pc, &cmd_tx);
        wire_local_candidates(&pc, &cmd_tx);
        wire_incoming_channels(&pc, &cmd_tx);

        let mut decode_jobs = None;
        let mut playback = None;
        if !cfg.mode.is_only_file() {
            pc.add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
            pc.add_transceiver_from_kind(
                RTPCodecType::Audio,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
            wire_remote_tracks(&pc, &cmd_tx);

            decode_jobs = spawn_decoder_thread(&hw, cmd_tx.clone());
            playback = match AudioPlayback::start() {
                Ok(playback) => Some(playback),
                Err(err) => {
                    warn!("audio playback unavailable: {err}");
                    None
                }
            };
        }

        // Announce intent; the callee replies with its offer.
        let mut connect = Envelope::new(ROLE_CTL, TYPE_CONNECT);
        connect.sender = Some(identity.local_id.clone());
        connect.receiver = Some(cfg.remote_id.clone());
        connect.receiver_pwd = Some(cfg.remote_pwd_md5.clone());
        connect.is_only_file = Some(cfg.mode.is_only_file());
        connect.fps = Some(cfg.fps);
        connect.only_relay = Some(cfg.only_relay);
        if cfg.adaptive_resolution {
            let (max_w, max_h) = cfg.control_max.unwrap_or_else(default_viewable_area);
            connect.control_max_width = Some(max_w);
            connect.control_max_height = Some(max_h);
        }
        signal.send_text(connect.encode().unwrap_or_default());
        info!("connect sent to {}", cfg.remote_id);
        let _ = state_tx.send(SessionState::Negotiating);

        spawn_signal_forwarder(&signal, &identity, &cfg.remote_id, cmd_tx.clone());

        let worker = Worker {
            cfg: cfg.clone(),
            identity,
            pc,
            file_channel: None,
            file_text_channel: None,
            input_channel: None,
            reassembler: FragmentReassembler::new("file"),
            gate: CandidateGate::default(),
            tracker: RecoveryTracker::new(),
            decode_jobs,
            playback,
            last_decode_at: Instant::now() - Duration::from_secs(1),
            keyframe_retry_at: None,
            signal,
            events,
            state_tx,
            closed: false,
        };
        let remote_id = cfg.remote_id.clone();
        tokio::spawn(worker.run(cmd_rx));

        Ok(CallerHandle {
            remote_id,
            cmd: cmd_tx,
            state: state_rx,
        })
    }
}

/// Largest content area this host can display: the primary screen minus
/// window chrome. Used when the UI did not report its own geometry.
fn default_viewable_area() -> (i32, i32) {
    match crate::media::capture::primary_screen_size() {
        Ok((width, height)) => (width as i32 - 20, height as i32 - 30),
        Err(_) => (1900, 1050),
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

/// The callee creates the channels; they arrive here keyed by label.
fn wire_incoming_channels(pc: &Arc<RTCPeerConnection>, cmd: &mpsc::UnboundedSender<Cmd>) {
    let tx = cmd.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let label = dc.label().to_string();
        info!("data channel arrived: {label}");
        let kind = match label.as_str() {
            CHANNEL_FILE => Some(ChannelKind::File),
            CHANNEL_FILE_TEXT => Some(ChannelKind::FileText),
            CHANNEL_INPUT => Some(ChannelKind::Input),
            _ => None,
        };
        let Some(kind) = kind else {
            warn!("unknown data channel label '{label}', ignoring");
            return Box::pin(async {});
        };

        let msg_tx = tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let forwarded = if msg.is_string {
                String::from_utf8(msg.data.to_vec()).ok().map(|text| match kind {
                    ChannelKind::Input => Cmd::InputText(text),
                    _ => Cmd::FileText(text),
                })
            } else if kind == ChannelKind::File {
                Some(Cmd::FileBinary(msg.data.to_vec()))
            } else {
                None
            };
            if let Some(cmd) = forwarded {
                let _ = msg_tx.send(cmd);
            }
            Box::pin(async {})
        }));

        let _ = tx.send(Cmd::ChannelOpened(kind, dc));
        Box::pin(async {})
    }));
}

fn wire_remote_tracks(pc: &Arc<RTCPeerConnection>, cmd: &mpsc::UnboundedSender<Cmd>) {
    let tx = cmd.clone();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let tx = tx.clone();
        Box::pin(async move {
            match track.kind() {
                RTPCodecType::Video => {
                    info!("video track bound");
                    tokio::spawn(read_video_track(track, tx));
                }
                RTPCodecType::Audio => {
                    info!("audio track bound");
                    tokio::spawn(read_audio_track(track, tx));
                }
                _ => {}
            }
        })
    }));
}

/// Depacketizes the video track into Annex-B access units, RTP-timestamp
/// ordered by the sample builder.
async fn read_video_track(track: Arc<TrackRemote>, cmd: mpsc::UnboundedSender<Cmd>) {
    let mut builder = SampleBuilder::new(
        SAMPLE_BUILDER_DEPTH,
        H264Packet::default(),
        crate::wire::VIDEO_CLOCK_RATE,
    );
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                builder.push(packet);
                while let Some(sample) = builder.pop() {
                    if cmd.send(Cmd::VideoSample(sample.data.to_vec())).is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                debug!("video track ended: {err}");
                return;
            }
        }
    }
}

async fn read_audio_track(track: Arc<TrackRemote>, cmd: mpsc::UnboundedSender<Cmd>) {
    let mut builder = SampleBuilder::new(SAMPLE_BUILDER_DEPTH, OpusPacket::default(), 48_000);
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                builder.push(packet);
                while let Some(sample) = builder.pop() {
                    if cmd.send(Cmd::AudioSample(sample.data.to_vec())).is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                debug!("audio track ended: {err}");
                return;
            }
        }
    }
}

/// The decoder owns FFmpeg state on its own thread; outcomes come back as
/// commands. Returns the job sender, or None when no decoder could open -
/// the session continues without media.
fn spawn_decoder_thread(
    hw: &Arc<HwContextRegistry>,
    cmd: mpsc::UnboundedSender<Cmd>,
) -> Option<std_mpsc::Sender<DecodeJob>> {
    let decoder = match VideoDecoder::new(hw) {
        Ok(decoder) => decoder,
        Err(err) => {
            error!("decoder unavailable, video disabled for this session: {err}");
            return None;
        }
    };
    let (job_tx, job_rx) = std_mpsc::channel::<DecodeJob>();
    std::thread::Builder::new()
        .name("h264-decode".into())
        .spawn(move || decode_loop(decoder, job_rx, cmd))
        .ok()?;
    Some(job_tx)
}

fn decode_loop(
    mut decoder: VideoDecoder,
    jobs: std_mpsc::Receiver<DecodeJob>,
    cmd: mpsc::UnboundedSender<Cmd>,
) {
    while let Ok(job) = jobs.recv() {
        match job {
            DecodeJob::Decode(data) => match decoder.decode(&data) {
                Ok(Some(frame)) => {
                    if cmd.send(Cmd::Decoded(DecodeEvent::Frame(frame))).is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    debug!("decode failed: {err}");
                    if cmd.send(Cmd::Decoded(DecodeEvent::Failed)).is_err() {
                        return;
                    }
                }
            },
            DecodeJob::AwaitKeyframe => decoder.await_keyframe(),
            DecodeJob::Stop => return,
        }
    }
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
            if !envelope_is_for(&envelope, ROLE_CLI, &local_id, &remote_id) {
                continue;
            }
            if cmd.send(Cmd::Signal(envelope)).is_err() {
                return;
            }
        }
    });
}

struct Worker {
    cfg: CallerConfig,
    identity: SessionIdentity,
    pc: Arc<RTCPeerConnection>,
    file_channel: Option<Arc<RTCDataChannel>>,
    file_text_channel: Option<Arc<RTCDataChannel>>,
    input_channel: Option<Arc<RTCDataChannel>>,
    reassembler: FragmentReassembler,
    gate: CandidateGate,
    tracker: RecoveryTracker,
    decode_jobs: Option<std_mpsc::Sender<DecodeJob>>,
    playback: Option<AudioPlayback>,
    last_decode_at: Instant,
    keyframe_retry_at: Option<Instant>,
    signal: SignalClient,
    events: EventBus,
    state_tx: watch::Sender<SessionState>,
    closed: bool,
}

impl Worker {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Cmd>) {
        loop {
            // The retry branch is disabled while no request is outstanding;
            // the placeholder deadline is never polled.
            let retry_deadline = self
                .keyframe_retry_at
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                maybe_cmd = cmd_rx.recv() => {
                    let Some(cmd) = maybe_cmd else { break };
                    if self.handle(cmd).await {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(retry_deadline),
                    if self.keyframe_retry_at.is_some() =>
                {
                    // Retry until a frame decodes or the session ends.
                    self.request_keyframe().await;
                }
            }
        }
        self.shutdown().await;
    }

    /// Returns true when the worker should stop.
    async fn handle(&mut self, cmd: Cmd) -> bool {
        match cmd {
            Cmd::Signal(envelope) => self.on_signal(envelope).await,
            Cmd::PeerState(state) => return self.on_peer_state(state).await,
            Cmd::LocalCandidate { candidate, mid } => {
                let envelope = candidate_envelope(
                    ROLE_CTL,
                    &self.identity.local_id,
                    &self.cfg.remote_id,
                    &candidate,
                    &mid,
                );
                self.signal.send_text(envelope.encode().unwrap_or_default());
            }
            Cmd::ChannelOpened(kind, dc) => match kind {
                ChannelKind::File => self.file_channel = Some(dc),
                ChannelKind::FileText => self.file_text_channel = Some(dc),
                ChannelKind::Input => self.input_channel = Some(dc),
            },
            Cmd::FileBinary(bytes) => self.on_file_fragment(&bytes).await,
            Cmd::FileText(text) => self.on_file_text(&text),
            Cmd::InputText(text) => self.on_input_text(&text),
            Cmd::VideoSample(data) => self.on_video_sample(data).await,
            Cmd::AudioSample(data) => {
                if let Some(playback) = &self.playback {
                    playback.play(data);
                }
            }
            Cmd::Decoded(DecodeEvent::Frame(frame)) => {
                self.tracker.record_success();
                self.keyframe_retry_at = None;
                self.events.publish(UiEvent::VideoFrame {
                    peer_id: self.cfg.remote_id.clone(),
                    width: frame.width,
                    height: frame.height,
                    rgb: frame.data,
                });
            }
            Cmd::Decoded(DecodeEvent::Failed) => {
                if self.tracker.record_failure() {
                    warn!("decode failure threshold crossed, requesting keyframe");
                    if let Some(jobs) = &self.decode_jobs {
                        let _ = jobs.send(DecodeJob::AwaitKeyframe);
                    }
                    self.request_keyframe().await;
                }
            }
            Cmd::ListRemote(path) => {
                self.send_file_text_msg(&listing_request(&path)).await;
            }
            Cmd::Download { remote, local } => {
                self.send_file_text_msg(&download_request(&remote, &local)).await;
            }
            Cmd::Upload { local, remote } => self.start_upload(local, remote),
            Cmd::SendInput(event) => {
                let msg = encode_event(
                    &event,
                    &self.identity.local_id,
                    &self.cfg.remote_id,
                    &self.cfg.remote_pwd_md5,
                );
                if let (Some(dc), Ok(json)) = (&self.input_channel, msg.encode()) {
                    if let Err(err) = dc.send_text(json).await {
                        warn!("input send failed: {err}");
                    }
                }
            }
            Cmd::Close => return true,
        }
        false
    }

    async fn on_signal(&mut self, envelope: Envelope) {
        match envelope.kind.as_str() {
            TYPE_OFFER => {
                let Some(sdp) = envelope.data_str() else {
                    error!("offer without sdp payload");
                    return;
                };
                let offer = match RTCSessionDescription::offer(sdp.to_string()) {
                    Ok(offer) => offer,
                    Err(err) => {
                        error!("invalid offer sdp: {err}");
                        return;
                    }
                };
                if let Err(err) = self.pc.set_remote_description(offer).await {
                    error!("set remote offer failed, aborting session: {err}");
                    let _ = self.state_tx.send(SessionState::Draining);
                    return;
                }
                for pending in self.gate.open() {
                    if let Err(err) = self.pc.add_ice_candidate(pending).await {
                        warn!("queued candidate rejected: {err}");
                    }
                }
                let answer = match self.pc.create_answer(None).await {
                    Ok(answer) => answer,
                    Err(err) => {
                        error!("create answer failed: {err}");
                        return;
                    }
                };
                let sdp = answer.sdp.clone();
                if let Err(err) = self.pc.set_local_description(answer).await {
                    error!("set local answer failed: {err}");
                    return;
                }
                let envelope = description_envelope(
                    ROLE_CTL,
                    TYPE_ANSWER,
                    &self.identity.local_id,
                    &self.cfg.remote_id,
                    &sdp,
                );
                self.signal.send_text(envelope.encode().unwrap_or_default());
                info!("answer sent to {}", self.cfg.remote_id);
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
            other => debug!("caller ignoring envelope type '{other}'"),
        }
    }

    async fn on_peer_state(&mut self, state: RTCPeerConnectionState) -> bool {
        info!("caller connection state: {state}");
        match state {
            RTCPeerConnectionState::Connected => {
                let _ = self.state_tx.send(SessionState::Connected);
                let ice = self.pc.sctp().transport().ice_transport();
                if let Some(pair) = ice.get_selected_candidate_pair().await {
                    info!("selected candidate pair: {pair}");
                }
                self.events.publish(UiEvent::SessionState {
                    peer_id: self.cfg.remote_id.clone(),
                    state: SessionState::Connected.label().to_string(),
                });
                false
            }
            RTCPeerConnectionState::Failed
            | RTCPeerConnectionState::Closed
            | RTCPeerConnectionState::Disconnected => true,
            _ => false,
        }
    }

    async fn on_video_sample(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            if self.tracker.record_empty() {
                warn!("empty-frame threshold crossed, requesting keyframe");
                self.request_keyframe().await;
            }
            return;
        }

        // Throttle decode pressure; the interval widens while the error
        // rate is elevated.
        if self.last_decode_at.elapsed() < self.tracker.min_decode_interval() {
            return;
        }
        self.last_decode_at = Instant::now();
        if let Some(jobs) = &self.decode_jobs {
            let _ = jobs.send(DecodeJob::Decode(data));
        }
    }

    async fn request_keyframe(&mut self) {
        let mut msg = ChannelMessage::new(MSG_REQUEST_KEYFRAME);
        msg.sender = Some(self.identity.local_id.clone());
        msg.receiver = Some(self.cfg.remote_id.clone());
        msg.receiver_pwd = Some(self.cfg.remote_pwd_md5.clone());
        msg.timestamp = Some(Utc::now().timestamp_millis());
        msg.message = Some("network_error_recovery".to_string());

        match (&self.input_channel, msg.encode()) {
            (Some(dc), Ok(json)) => {
                if let Err(err) = dc.send_text(json).await {
                    warn!("keyframe request send failed: {err}");
                } else {
                    info!("keyframe requested for error recovery");
                }
            }
            _ => warn!("input channel not available for keyframe request"),
        }
        self.keyframe_retry_at = Some(Instant::now() + KEYFRAME_RETRY);
    }

    async fn on_file_fragment(&mut self, bytes: &[u8]) {
        match self.reassembler.ingest(bytes) {
            IngestOutcome::Complete {
                scratch_path, ok, ..
            } if ok => {
                let done = FileProtocol::handle_completed_message(&scratch_path).await;
                if done.msg_type == MSG_FILE_DOWNLOAD {
                    self.events.publish(UiEvent::DownloadResult {
                        peer_id: self.cfg.remote_id.clone(),
                        path: done.dest.to_string_lossy().into_owned(),
                        ok: done.ok,
                    });
                }
            }
            IngestOutcome::Complete { .. } => {
                warn!("fragment reassembly failed, message discarded");
            }
            IngestOutcome::Incomplete | IngestOutcome::Dropped(_) => {}
        }
    }

    fn on_file_text(&mut self, text: &str) {
        let Ok(msg) = ChannelMessage::decode(text.as_bytes()) else {
            error!("file_text parse error, dropping message");
            return;
        };
        match msg.msg_type.as_str() {
            MSG_FILE_LIST => {
                self.events.publish(UiEvent::FileList {
                    peer_id: self.cfg.remote_id.clone(),
                    path: msg.path.unwrap_or_default(),
                    entries: msg.folder_files.unwrap_or_default(),
                    mounted: msg.mounted.unwrap_or_default(),
                });
            }
            MSG_UPLOAD_FILE_RES => {
                self.events.publish(UiEvent::UploadResult {
                    peer_id: self.cfg.remote_id.clone(),
                    path: msg.path_cli.unwrap_or_default(),
                    ok: msg.status.unwrap_or(false),
                    message: msg.message.unwrap_or_default(),
                });
            }
            MSG_FILE_DOWNLOAD => {
                if msg.directory_end == Some(true) {
                    self.events.publish(UiEvent::DownloadResult {
                        peer_id: self.cfg.remote_id.clone(),
                        path: msg.path_ctl.unwrap_or_default(),
                        ok: true,
                    });
                } else if let Some(error) = msg.error {
                    self.events.publish(UiEvent::DownloadResult {
                        peer_id: self.cfg.remote_id.clone(),
                        path: msg.path.unwrap_or_default(),
                        ok: false,
                    });
                    warn!("remote download error: {error}");
                }
            }
            other => warn!("unknown file_text message type '{other}'"),
        }
    }

    fn on_input_text(&mut self, text: &str) {
        let Ok(msg) = ChannelMessage::decode(text.as_bytes()) else {
            return;
        };
        if msg.msg_type == MSG_KEYFRAME_RESPONSE {
            debug!("keyframe response received, disarming retry");
            self.keyframe_retry_at = None;
        }
    }

    fn start_upload(&self, local: String, remote: String) {
        let (Some(file_dc), Some(text_dc)) =
            (self.file_channel.clone(), self.file_text_channel.clone())
        else {
            warn!("upload requested before channels arrived");
            self.events.publish(UiEvent::UploadResult {
                peer_id: self.cfg.remote_id.clone(),
                path: local,
                ok: false,
                message: "file channel not available".into(),
            });
            return;
        };
        let events = self.events.clone();
        let peer_id = self.cfg.remote_id.clone();
        tokio::spawn(async move {
            let file_sink = DataChannelSink(file_dc);
            let text_sink = DataChannelSink(text_dc);
            let result = FileProtocol::send_tree(
                &PathBuf::from(&local),
                &PathBuf::from(&remote),
                MSG_FILE_UPLOAD,
                &file_sink,
                &text_sink,
            )
            .await;
            if let Err(err) = result {
                error!("upload failed for {local}: {err}");
                events.publish(UiEvent::UploadResult {
                    peer_id,
                    path: local,
                    ok: false,
                    message: err.to_string(),
                });
            }
        });
    }

    async fn send_file_text_msg(&self, msg: &ChannelMessage) {
        match (&self.file_text_channel, msg.encode()) {
            (Some(dc), Ok(json)) => {
                if let Err(err) = dc.send_text(json).await {
                    error!("file_text send failed: {err}");
                }
            }
            (None, _) => warn!("file_text channel not available yet"),
            (_, Err(err)) => error!("file_text encode failed: {err}"),
        }
    }

    /// Ordered, idempotent teardown mirroring the callee side.
    async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.state_tx.send(SessionState::Draining);
        self.keyframe_retry_at = None;

        if let Some(jobs) = self.decode_jobs.take() {
            let _ = jobs.send(DecodeJob::Stop);
        }
        if let Some(playback) = self.playback.take() {
            playback.stop();
        }
        for dc in [
            self.input_channel.take(),
            self.file_channel.take(),
            self.file_text_channel.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = dc.close().await;
        }
        if let Err(err) = self.pc.close().await {
            warn!("peer connection close failed: {err}");
        }
        let _ = self.state_tx.send(SessionState::Closed);
        self.events.publish(UiEvent::SessionState {
            peer_id: self.cfg.remote_id.clone(),
            state: SessionState::Closed.label().to_string(),
        });
        info!("caller session for {} closed", self.cfg.remote_id);
    }
}
