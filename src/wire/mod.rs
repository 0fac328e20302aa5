//! Wire formats shared by the signaling channel and the data channels.

pub mod annexb;
pub mod fragment;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ROLE_CLI: &str = "cli";
pub const ROLE_CTL: &str = "ctl";
pub const ROLE_SERVER: &str = "server";

pub const TYPE_OFFER: &str = "offer";
pub const TYPE_ANSWER: &str = "answer";
pub const TYPE_CANDIDATE: &str = "candidate";
pub const TYPE_CONNECT: &str = "connect";
pub const TYPE_ONLINE_ONE: &str = "onlineOne";
pub const TYPE_ONLINE_LIST: &str = "onlineList";
pub const TYPE_OFFLINE_ONE: &str = "offlineOne";
pub const TYPE_ERROR: &str = "error";

pub const MSG_FILE_LIST: &str = "file_list";
pub const MSG_FILE_DOWNLOAD: &str = "file_download";
pub const MSG_FILE_UPLOAD: &str = "file_upload";
pub const MSG_UPLOAD_FILE_RES: &str = "upload_file_res";
pub const MSG_KEYBOARD: &str = "keyboard";
pub const MSG_MOUSE: &str = "mouse";
pub const MSG_REQUEST_KEYFRAME: &str = "request_keyframe";
pub const MSG_KEYFRAME_RESPONSE: &str = "keyframe_response";

/// Data-channel labels, fixed by the protocol so the answering side can bind
/// callbacks by label.
pub const CHANNEL_FILE: &str = "file_airan";
pub const CHANNEL_FILE_TEXT: &str = "file_text_airan";
pub const CHANNEL_INPUT: &str = "input_airan";

/// Media track identifiers. Both peers create tracks with matching ids so the
/// SDP lines pair up.
pub const TRACK_VIDEO: &str = "video_airan";
pub const TRACK_AUDIO: &str = "audio_airan";
pub const STREAM_VIDEO_MSID: &str = "video_stream1_airan";

pub const VIDEO_PAYLOAD_TYPE: u8 = 96;
pub const AUDIO_PAYLOAD_TYPE: u8 = 111;
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// The directory alias a controller sends to request the controlled side's
/// home directory.
pub const FOLDER_HOME: &str = "home";

/// A signaling message. Every exchange on the websocket is one of these,
/// UTF-8 JSON, sent as either a text or a binary frame, receivers accept
/// both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub role: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_pwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_only_file: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only_relay: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_max_width: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_max_height: Option<i32>,
}

impl Envelope {
    pub fn new(role: &str, kind: &str) -> Self {
        Self {
            role: role.to_string(),
            kind: kind.to_string(),
            ..Self::default()
        }
    }

    /// The `data` field as a string, for SDP and candidate payloads.
    pub fn data_str(&self) -> Option<&str> {
        self.data.as_ref().and_then(Value::as_str)
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// One entry in a directory listing reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub is_dir: bool,
    pub file_size: u64,
    pub file_last_mod_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_suffix: Option<String>,
}

/// A datagram control message carried on the `file_text` or `input` channel.
/// Same JSON shape as the envelope but keyed by `msgType`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    #[serde(rename = "msgType")]
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_pwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_cli: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_ctl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(
        rename = "isDirectory",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub is_directory: Option<bool>,
    #[serde(
        rename = "directoryStart",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub directory_start: Option<bool>,
    #[serde(
        rename = "directoryEnd",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub directory_end: Option<bool>,
    #[serde(rename = "fileCount", default, skip_serializing_if = "Option::is_none")]
    pub file_count: Option<u64>,
    #[serde(
        rename = "folderFiles",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub folder_files: Option<Vec<FileEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mounted: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<i32>,
    #[serde(rename = "dwFlags", default, skip_serializing_if = "Option::is_none")]
    pub dw_flags: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(rename = "mouseData", default, skip_serializing_if = "Option::is_none")]
    pub mouse_data: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl ChannelMessage {
    pub fn new(msg_type: &str) -> Self {
        Self {
            msg_type: msg_type.to_string(),
            ..Self::default()
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips() {
        let mut env = Envelope::new(ROLE_CTL, TYPE_CONNECT);
        env.sender = Some("A".into());
        env.receiver = Some("B".into());
        env.receiver_pwd = Some("ABCDEF".into());
        env.fps = Some(15);
        env.is_only_file = Some(false);
        env.control_max_width = Some(1920);
        env.control_max_height = Some(1040);

        let json = env.encode().unwrap();
        let back = Envelope::decode(json.as_bytes()).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn envelope_skips_absent_fields() {
        let env = Envelope::new(ROLE_CLI, TYPE_OFFER);
        let json = env.encode().unwrap();
        assert!(!json.contains("receiver_pwd"));
        assert!(!json.contains("control_max_width"));
    }

    #[test]
    fn envelope_tolerates_unknown_data_shapes() {
        // Server pushes carry an object (onlineOne) or array (onlineList)
        // in `data`; the decoder must accept both.
        let json = r#"{"role":"server","type":"onlineList","data":[{"sn":"X"}]}"#;
        let env = Envelope::decode(json.as_bytes()).unwrap();
        assert_eq!(env.kind, TYPE_ONLINE_LIST);
        assert!(env.data.unwrap().is_array());
    }

    #[test]
    fn channel_message_uses_original_key_names() {
        let mut msg = ChannelMessage::new(MSG_MOUSE);
        msg.dw_flags = Some("down".into());
        msg.mouse_data = Some(120);
        msg.x = Some(0.5);
        let json = msg.encode().unwrap();
        assert!(json.contains("\"msgType\":\"mouse\""));
        assert!(json.contains("\"dwFlags\":\"down\""));
        assert!(json.contains("\"mouseData\":120"));
        let back = ChannelMessage::decode(json.as_bytes()).unwrap();
        assert_eq!(msg, back);
    }
}
