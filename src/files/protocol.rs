//! File-transfer protocol: streamed fragment sends, directory walks, listing
//! replies, and materialisation of completed messages.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{info, warn};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

use crate::wire::fragment::{build_frame, fragment_count, FragmentHeader, PAYLOAD_SIZE};
use crate::wire::{
    ChannelMessage, FileEntry, FOLDER_HOME, MSG_FILE_DOWNLOAD, MSG_FILE_LIST, MSG_FILE_UPLOAD,
    MSG_UPLOAD_FILE_RES,
};

use super::reassembly::read_header;
use super::DatagramSink;

/// Fragments between pacing pauses on the file channel. Keeps the SCTP send
/// buffer from saturating on large files.
const PACE_EVERY: u64 = 10;
const PACE_SLEEP_MS: u64 = 1;
const COPY_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("channel closed")]
    Closed,
    #[error("send failed: {0}")]
    Send(String),
}

#[derive(Debug, Error)]
pub enum FileProtocolError {
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("not a regular file: {0}")]
    NotAFile(PathBuf),
    #[error("not found: {0}")]
    NotFound(PathBuf),
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What a completed logical message materialised into.
#[derive(Debug, Clone)]
pub struct CompletedFile {
    pub msg_type: String,
    pub dest: PathBuf,
    pub ok: bool,
    pub bytes: u64,
}

pub struct FileProtocol;

impl FileProtocol {
    /// Streams one file as fragment frames on the `file` channel.
    ///
    /// The logical payload is `u32_be(header_len) || header_json ||
    /// file_bytes`; the header is drained first, then the file is read in
    /// payload-sized pieces so large files never sit in memory whole.
    pub async fn send_file_stream(
        path: &Path,
        header: &ChannelMessage,
        sink: &dyn DatagramSink,
    ) -> Result<u64, FileProtocolError> {
        let metadata = fs::metadata(path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                FileProtocolError::NotFound(path.to_path_buf())
            } else {
                FileProtocolError::Io(err)
            }
        })?;
        if !metadata.is_file() {
            return Err(FileProtocolError::NotAFile(path.to_path_buf()));
        }

        let header_bytes = serde_json::to_vec(header)?;
        let mut prefix = Vec::with_capacity(4 + header_bytes.len());
        prefix.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
        prefix.extend_from_slice(&header_bytes);

        let logical_len = prefix.len() as u64 + metadata.len();
        let total = fragment_count(logical_len);
        let message_id = Uuid::new_v4();
        info!(
            "streaming {} ({} bytes, {total} fragments, id={message_id})",
            path.display(),
            logical_len
        );

        let mut file = fs::File::open(path).await?;
        let mut prefix_pos = 0usize;

        for index in 0..total {
            let mut payload = Vec::with_capacity(PAYLOAD_SIZE);
            if prefix_pos < prefix.len() {
                let take = (prefix.len() - prefix_pos).min(PAYLOAD_SIZE);
                payload.extend_from_slice(&prefix[prefix_pos..prefix_pos + take]);
                prefix_pos += take;
            }
            while payload.len() < PAYLOAD_SIZE {
                let mut buf = vec![0u8; PAYLOAD_SIZE - payload.len()];
                let read = file.read(&mut buf).await?;
                if read == 0 {
                    break;
                }
                payload.extend_from_slice(&buf[..read]);
            }

            let frame = build_frame(
                &FragmentHeader {
                    message_id,
                    total,
                    index,
                },
                &payload,
            );
            sink.send_binary(frame)
                .await
                .map_err(|err| FileProtocolError::SendFailed(err.to_string()))?;

            if (index + 1) % PACE_EVERY == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(PACE_SLEEP_MS)).await;
            }
        }

        Ok(metadata.len())
    }

    /// Sends a file or a directory tree. Directories are bracketed by
    /// start/end markers on `file_text`; files inside are addressed relative
    /// to the directory root joined onto the peer's destination. Returns the
    /// number of files streamed.
    pub async fn send_tree(
        src: &Path,
        dest: &Path,
        msg_type: &str,
        file_sink: &dyn DatagramSink,
        text_sink: &dyn DatagramSink,
    ) -> Result<u64, FileProtocolError> {
        let metadata = fs::metadata(src).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                FileProtocolError::NotFound(src.to_path_buf())
            } else {
                FileProtocolError::Io(err)
            }
        })?;

        if metadata.is_file() {
            let dest = dest_with_file_name(dest, src);
            let header = transfer_header(msg_type, src, &dest, metadata.len());
            Self::send_file_stream(src, &header, file_sink).await?;
            return Ok(1);
        }

        let mut start = transfer_header(msg_type, src, dest, 0);
        start.file_size = None;
        start.is_directory = Some(true);
        start.directory_start = Some(true);
        text_sink
            .send_text(start.encode()?)
            .await
            .map_err(|err| FileProtocolError::SendFailed(err.to_string()))?;

        let mut file_count = 0u64;
        for relative in walk_files(src).await? {
            let abs = src.join(&relative);
            let size = fs::metadata(&abs).await.map(|m| m.len()).unwrap_or(0);
            let remote = join_clean(dest, &relative);
            let header = transfer_header(msg_type, &abs, &remote, size);
            match Self::send_file_stream(&abs, &header, file_sink).await {
                Ok(_) => file_count += 1,
                Err(FileProtocolError::SendFailed(err)) => {
                    return Err(FileProtocolError::SendFailed(err))
                }
                Err(err) => warn!("skipping {}: {err}", abs.display()),
            }
        }

        let mut end = transfer_header(msg_type, src, dest, 0);
        end.file_size = None;
        end.is_directory = Some(true);
        end.directory_end = Some(true);
        end.file_count = Some(file_count);
        text_sink
            .send_text(end.encode()?)
            .await
            .map_err(|err| FileProtocolError::SendFailed(err.to_string()))?;

        info!(
            "sent directory {} -> {} ({file_count} files)",
            src.display(),
            dest.display()
        );
        Ok(file_count)
    }

    /// Materialises a completed reassembly: parses the header, streams the
    /// body to its destination in 64 KiB pieces, and removes the scratch
    /// file. Write failures delete the partial destination.
    pub async fn handle_completed_message(scratch_path: &Path) -> CompletedFile {
        let outcome = Self::materialise(scratch_path).await;
        let _ = fs::remove_file(scratch_path).await;
        match outcome {
            Ok(done) => done,
            Err(err) => {
                warn!("completed message unusable: {err}");
                CompletedFile {
                    msg_type: String::new(),
                    dest: PathBuf::new(),
                    ok: false,
                    bytes: 0,
                }
            }
        }
    }

    async fn materialise(scratch_path: &Path) -> Result<CompletedFile, FileProtocolError> {
        let (header_bytes, body_offset) = read_header(scratch_path)?;
        let header = ChannelMessage::decode(&header_bytes)?;

        let dest = match header.msg_type.as_str() {
            MSG_FILE_DOWNLOAD => header.path_ctl.clone(),
            MSG_FILE_UPLOAD => header.path_cli.clone(),
            other => {
                warn!("unknown file message type '{other}'");
                return Ok(CompletedFile {
                    msg_type: other.to_string(),
                    dest: PathBuf::new(),
                    ok: false,
                    bytes: 0,
                });
            }
        };
        let Some(dest) = dest else {
            warn!("file message without destination path");
            return Ok(CompletedFile {
                msg_type: header.msg_type,
                dest: PathBuf::new(),
                ok: false,
                bytes: 0,
            });
        };
        let dest = PathBuf::from(dest);

        // The scratch file is padded to a whole number of fragments; the
        // declared size bounds the copy so the destination is bit-exact.
        let scratch_len = fs::metadata(scratch_path).await?.len();
        let available = scratch_len.saturating_sub(body_offset);
        let body_len = header.file_size.map_or(available, |declared| {
            declared.min(available)
        });

        let ok = match copy_body(scratch_path, body_offset, &dest, body_len).await {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to materialise {}: {err}", dest.display());
                let _ = fs::remove_file(&dest).await;
                false
            }
        };
        if ok {
            info!(
                "received {} {} ({} bytes)",
                header.msg_type,
                dest.display(),
                body_len
            );
        }
        Ok(CompletedFile {
            msg_type: header.msg_type,
            dest,
            ok,
            bytes: body_len,
        })
    }
}

async fn copy_body(
    scratch: &Path,
    offset: u64,
    dest: &Path,
    len: u64,
) -> Result<(), std::io::Error> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut source = fs::File::open(scratch).await?;
    source.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut target = fs::File::create(dest).await?;

    let mut remaining = len;
    let mut buf = vec![0u8; COPY_CHUNK];
    while remaining > 0 {
        let want = remaining.min(COPY_CHUNK as u64) as usize;
        let read = source.read(&mut buf[..want]).await?;
        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "scratch file shorter than declared body",
            ));
        }
        target.write_all(&buf[..read]).await?;
        remaining -= read as u64;
    }
    target.flush().await?;
    Ok(())
}

/// Maps (source, destination) onto the direction-specific header fields:
/// downloads travel controlled→controller, uploads the other way.
fn transfer_header(msg_type: &str, src: &Path, dest: &Path, size: u64) -> ChannelMessage {
    let mut header = ChannelMessage::new(msg_type);
    match msg_type {
        MSG_FILE_UPLOAD => {
            header.path_ctl = Some(src.to_string_lossy().into_owned());
            header.path_cli = Some(dest.to_string_lossy().into_owned());
        }
        _ => {
            header.path_cli = Some(src.to_string_lossy().into_owned());
            header.path_ctl = Some(dest.to_string_lossy().into_owned());
        }
    }
    header.file_size = Some(size);
    header.is_directory = Some(false);
    header
}

fn dest_with_file_name(dest: &Path, src: &Path) -> PathBuf {
    match src.file_name() {
        Some(name) if dest.file_name() != Some(name) => dest.join(name),
        _ => dest.to_path_buf(),
    }
}

fn join_clean(root: &Path, relative: &Path) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in relative.components() {
        out.push(part);
    }
    out
}

/// Regular files under `root`, as paths relative to it, directories walked
/// depth-first in name order.
async fn walk_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![PathBuf::new()];
    while let Some(rel) = stack.pop() {
        let dir = root.join(&rel);
        let mut entries = Vec::new();
        let mut reader = fs::read_dir(&dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            entries.push(entry);
        }
        entries.sort_by_key(|entry| entry.file_name());
        for entry in entries {
            let kind = entry.file_type().await?;
            let child = rel.join(entry.file_name());
            if kind.is_dir() {
                stack.push(child);
            } else if kind.is_file() {
                out.push(child);
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Builds the `file_list` reply for a path: entries (directories first, names
/// ascending, hidden included) plus the mounted root paths.
pub fn build_listing(requested: &str, home: &Path) -> ChannelMessage {
    let path = if requested == FOLDER_HOME {
        home.to_path_buf()
    } else {
        PathBuf::from(requested)
    };

    let mut entries: Vec<FileEntry> = Vec::new();
    if let Ok(reader) = std::fs::read_dir(&path) {
        for entry in reader.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let modified = metadata
                .modified()
                .map(|time| DateTime::<Utc>::from(time).to_rfc3339())
                .unwrap_or_default();
            let suffix = (!metadata.is_dir())
                .then(|| {
                    Path::new(&name)
                        .extension()
                        .map(|ext| ext.to_string_lossy().into_owned())
                })
                .flatten();
            entries.push(FileEntry {
                name,
                is_dir: metadata.is_dir(),
                file_size: metadata.len(),
                file_last_mod_time: modified,
                file_suffix: suffix,
            });
        }
    }
    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then(a.name.cmp(&b.name)));

    let mut reply = ChannelMessage::new(MSG_FILE_LIST);
    reply.path = Some(path.to_string_lossy().into_owned());
    reply.folder_files = Some(entries);
    reply.mounted = Some(mounted_roots());
    reply
}

/// Root paths of mounted volumes, for the controller's location picker.
#[cfg(windows)]
pub fn mounted_roots() -> Vec<String> {
    (b'A'..=b'Z')
        .map(|letter| format!("{}:\\", letter as char))
        .filter(|root| Path::new(root).exists())
        .collect()
}

#[cfg(not(windows))]
pub fn mounted_roots() -> Vec<String> {
    vec!["/".to_string()]
}

/// Controller request for a directory listing.
pub fn listing_request(path: &str) -> ChannelMessage {
    let mut msg = ChannelMessage::new(MSG_FILE_LIST);
    msg.path = Some(path.to_string());
    msg
}

/// Controller request asking the controlled side to stream a file down.
pub fn download_request(remote_path: &str, local_path: &str) -> ChannelMessage {
    let mut msg = ChannelMessage::new(MSG_FILE_DOWNLOAD);
    msg.path_cli = Some(remote_path.to_string());
    msg.path_ctl = Some(local_path.to_string());
    msg
}

/// Controlled-side acknowledgement for one completed upload.
pub fn upload_ack(path: &Path, ok: bool, message: &str) -> ChannelMessage {
    let mut msg = ChannelMessage::new(MSG_UPLOAD_FILE_RES);
    msg.path_cli = Some(path.to_string_lossy().into_owned());
    msg.status = Some(ok);
    msg.message = Some(message.to_string());
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::{FragmentReassembler, IngestOutcome};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        binary: Mutex<Vec<Vec<u8>>>,
        text: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DatagramSink for RecordingSink {
        async fn send_binary(&self, payload: Vec<u8>) -> Result<(), SinkError> {
            self.binary.lock().unwrap().push(payload);
            Ok(())
        }
        async fn send_text(&self, payload: String) -> Result<(), SinkError> {
            self.text.lock().unwrap().push(payload);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl DatagramSink for FailingSink {
        async fn send_binary(&self, _: Vec<u8>) -> Result<(), SinkError> {
            Err(SinkError::Closed)
        }
        async fn send_text(&self, _: String) -> Result<(), SinkError> {
            Err(SinkError::Closed)
        }
    }

    #[tokio::test]
    async fn file_round_trips_bit_exact() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("source.bin");
        let body: Vec<u8> = (0..25_000u32).map(|i| (i % 253) as u8).collect();
        std::fs::write(&src, &body).unwrap();

        let dest = dir.path().join("incoming").join("copy.bin");
        let header = transfer_header(
            MSG_FILE_DOWNLOAD,
            &src,
            &dest,
            body.len() as u64,
        );

        let sink = RecordingSink::default();
        FileProtocol::send_file_stream(&src, &header, &sink)
            .await
            .unwrap();

        let frames = sink.binary.lock().unwrap().clone();
        let header_json = serde_json::to_vec(&header).unwrap();
        let expected_total =
            fragment_count(4 + header_json.len() as u64 + body.len() as u64);
        assert_eq!(frames.len() as u64, expected_total);
        for frame in &frames {
            assert_eq!(frame.len(), crate::wire::fragment::FRAGMENT_SIZE);
        }

        let mut reassembler = FragmentReassembler::with_scratch_dir("file", dir.path());
        let mut scratch = None;
        for frame in &frames {
            if let IngestOutcome::Complete {
                scratch_path, ok, ..
            } = reassembler.ingest(frame)
            {
                assert!(ok);
                scratch = Some(scratch_path);
            }
        }
        let done = FileProtocol::handle_completed_message(&scratch.unwrap()).await;
        assert!(done.ok);
        assert_eq!(done.msg_type, MSG_FILE_DOWNLOAD);
        assert_eq!(done.dest, dest);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
    }

    #[tokio::test]
    async fn send_aborts_when_the_channel_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.bin");
        std::fs::write(&src, [0u8; 64]).unwrap();
        let header = transfer_header(MSG_FILE_DOWNLOAD, &src, Path::new("/x/a.bin"), 64);
        let err = FileProtocol::send_file_stream(&src, &header, &FailingSink)
            .await
            .unwrap_err();
        assert!(matches!(err, FileProtocolError::SendFailed(_)));
    }

    #[tokio::test]
    async fn directory_send_brackets_with_markers() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        std::fs::create_dir_all(tree.join("nested")).unwrap();
        std::fs::write(tree.join("a.txt"), b"alpha").unwrap();
        std::fs::write(tree.join("nested/b.txt"), b"beta").unwrap();

        let file_sink = RecordingSink::default();
        let text_sink = RecordingSink::default();
        let sent = FileProtocol::send_tree(
            &tree,
            Path::new("/peer/dest"),
            MSG_FILE_UPLOAD,
            &file_sink,
            &text_sink,
        )
        .await
        .unwrap();
        assert_eq!(sent, 2);

        let texts = text_sink.text.lock().unwrap().clone();
        assert_eq!(texts.len(), 2);
        let start = ChannelMessage::decode(texts[0].as_bytes()).unwrap();
        assert_eq!(start.directory_start, Some(true));
        let end = ChannelMessage::decode(texts[1].as_bytes()).unwrap();
        assert_eq!(end.directory_end, Some(true));
        assert_eq!(end.file_count, Some(2));
    }

    #[tokio::test]
    async fn empty_directory_sends_zero_count_markers() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("empty");
        std::fs::create_dir_all(&tree).unwrap();

        let file_sink = RecordingSink::default();
        let text_sink = RecordingSink::default();
        let sent = FileProtocol::send_tree(
            &tree,
            Path::new("/peer/dest"),
            MSG_FILE_DOWNLOAD,
            &file_sink,
            &text_sink,
        )
        .await
        .unwrap();
        assert_eq!(sent, 0);
        assert!(file_sink.binary.lock().unwrap().is_empty());

        let texts = text_sink.text.lock().unwrap().clone();
        let end = ChannelMessage::decode(texts[1].as_bytes()).unwrap();
        assert_eq!(end.file_count, Some(0));
    }

    #[test]
    fn listing_sorts_directories_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("zz.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("aa")).unwrap();
        std::fs::write(dir.path().join(".hidden"), b"h").unwrap();

        let reply = build_listing(dir.path().to_str().unwrap(), Path::new("/"));
        let entries = reply.folder_files.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].is_dir);
        assert_eq!(entries[0].name, "aa");
        assert!(entries.iter().any(|entry| entry.name == ".hidden"));
        assert!(!reply.mounted.unwrap().is_empty());
    }

    #[test]
    fn home_alias_resolves_to_home() {
        let reply = build_listing(FOLDER_HOME, Path::new("/home/user"));
        assert_eq!(reply.path.as_deref(), Some("/home/user"));
    }
}
