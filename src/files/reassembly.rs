//! Out-of-order reassembly of fragment-framed messages into scratch files.
//!
//! Each logical message gets one scratch file; fragment payloads are written
//! at `index × PAYLOAD_SIZE` so delivery order does not matter. A presence
//! bitmap decides completion. Scratch files belong to the reassembler and are
//! removed on completion, on write failure, and when the reassembler drops.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use uuid::Uuid;

use crate::wire::fragment::{Fragment, FragmentError, PAYLOAD_SIZE};

/// Result of ingesting one wire frame.
#[derive(Debug)]
pub enum IngestOutcome {
    /// Valid fragment stored; the message is not complete yet.
    Incomplete,
    /// All fragments present. The scratch file is closed and, on `ok`,
    /// still on disk, the consumer takes ownership of deleting it.
    Complete {
        message_id: Uuid,
        scratch_path: PathBuf,
        ok: bool,
    },
    /// The frame failed validation and was dropped without state change.
    Dropped(FragmentError),
}

struct Reassembly {
    total: u64,
    received: Vec<bool>,
    received_count: u64,
    file: File,
    path: PathBuf,
}

/// One reassembler per data channel; ingest calls are serialised by the
/// owning channel worker.
pub struct FragmentReassembler {
    channel: String,
    scratch_dir: PathBuf,
    inflight: HashMap<Uuid, Reassembly>,
}

impl FragmentReassembler {
    pub fn new(channel: &str) -> Self {
        Self::with_scratch_dir(channel, std::env::temp_dir())
    }

    pub fn with_scratch_dir(channel: &str, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            channel: channel.to_string(),
            scratch_dir: scratch_dir.into(),
            inflight: HashMap::new(),
        }
    }

    /// Number of in-flight messages; at most one scratch file per live id.
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    pub fn ingest(&mut self, frame: &[u8]) -> IngestOutcome {
        let fragment = match Fragment::parse(frame) {
            Ok(fragment) => fragment,
            Err(err) => {
                warn!("dropping invalid fragment on '{}': {err}", self.channel);
                return IngestOutcome::Dropped(err);
            }
        };
        let id = fragment.header.message_id;
        let total = fragment.header.total;
        let index = fragment.header.index;

        if !self.inflight.contains_key(&id) {
            let path = self.scratch_path(&id);
            let file = match OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
            {
                Ok(file) => file,
                Err(err) => {
                    warn!("failed to create scratch file {}: {err}", path.display());
                    return IngestOutcome::Complete {
                        message_id: id,
                        scratch_path: path,
                        ok: false,
                    };
                }
            };
            debug!(
                "reassembly started on '{}': id={id} total={total} scratch={}",
                self.channel,
                path.display()
            );
            self.inflight.insert(
                id,
                Reassembly {
                    total,
                    received: vec![false; total as usize],
                    received_count: 0,
                    file,
                    path,
                },
            );
        }

        let entry = match self.inflight.get_mut(&id) {
            Some(entry) => entry,
            None => return IngestOutcome::Incomplete,
        };
        if entry.total != total || index >= entry.total {
            warn!(
                "fragment header mismatch on '{}': id={id} total={total} index={index}",
                self.channel
            );
            return IngestOutcome::Dropped(FragmentError::IndexOutOfRange {
                index,
                total: entry.total,
            });
        }

        let offset = index * PAYLOAD_SIZE as u64;
        let write = entry
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| entry.file.write_all(fragment.payload));
        if let Err(err) = write {
            warn!("scratch write failed at offset {offset}: {err}");
            let entry = self.inflight.remove(&id).expect("entry present");
            let _ = fs::remove_file(&entry.path);
            return IngestOutcome::Complete {
                message_id: id,
                scratch_path: entry.path,
                ok: false,
            };
        }

        if !entry.received[index as usize] {
            entry.received[index as usize] = true;
            entry.received_count += 1;
        }

        if entry.received_count == entry.total {
            let entry = self.inflight.remove(&id).expect("entry present");
            drop(entry.file);
            debug!(
                "reassembly complete on '{}': id={id} ({} fragments)",
                self.channel, entry.total
            );
            return IngestOutcome::Complete {
                message_id: id,
                scratch_path: entry.path,
                ok: true,
            };
        }
        IngestOutcome::Incomplete
    }

    fn scratch_path(&self, id: &Uuid) -> PathBuf {
        let name: String = format!("{}_{}", self.channel, id)
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.scratch_dir.join(format!("{name}.tmp"))
    }
}

impl Drop for FragmentReassembler {
    fn drop(&mut self) {
        for (_, entry) in self.inflight.drain() {
            let _ = fs::remove_file(&entry.path);
        }
    }
}

/// Reads the logical payload of a completed scratch file: 4-byte big-endian
/// header length, then the header JSON bytes. Returns (header bytes, offset
/// of the raw file bytes).
pub(crate) fn read_header(scratch_path: &Path) -> std::io::Result<(Vec<u8>, u64)> {
    use std::io::Read;

    let mut file = File::open(scratch_path)?;
    let mut len_bytes = [0u8; 4];
    file.read_exact(&mut len_bytes)?;
    let header_len = u32::from_be_bytes(len_bytes) as u64;
    let total = file.metadata()?.len();
    if header_len > total.saturating_sub(4) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("header length {header_len} exceeds scratch size {total}"),
        ));
    }
    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header)?;
    Ok((header, 4 + header_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::fragment::{build_frame, fragment_count, FragmentHeader, FRAGMENT_SIZE};

    fn frames_for(payload: &[u8]) -> Vec<Vec<u8>> {
        let total = fragment_count(payload.len() as u64);
        let id = Uuid::new_v4();
        (0..total)
            .map(|index| {
                let start = (index as usize) * PAYLOAD_SIZE;
                let end = (start + PAYLOAD_SIZE).min(payload.len());
                build_frame(
                    &FragmentHeader {
                        message_id: id,
                        total,
                        index,
                    },
                    &payload[start..end],
                )
            })
            .collect()
    }

    #[test]
    fn reassembles_out_of_order_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let mut reassembler = FragmentReassembler::with_scratch_dir("file", dir.path());

        let payload: Vec<u8> = (0..PAYLOAD_SIZE * 2 + 700).map(|i| (i % 251) as u8).collect();
        let mut frames = frames_for(&payload);
        frames.reverse();

        let mut done = None;
        for frame in &frames {
            match reassembler.ingest(frame) {
                IngestOutcome::Complete {
                    scratch_path, ok, ..
                } => {
                    assert!(ok);
                    done = Some(scratch_path);
                }
                IngestOutcome::Incomplete => {}
                IngestOutcome::Dropped(err) => panic!("dropped: {err}"),
            }
        }
        let scratch = done.expect("message completed");
        let bytes = fs::read(&scratch).unwrap();
        assert_eq!(&bytes[..payload.len()], payload.as_slice());
        // Zero padding beyond the logical payload.
        assert!(bytes[payload.len()..].iter().all(|byte| *byte == 0));
        fs::remove_file(scratch).unwrap();
        assert_eq!(reassembler.inflight_len(), 0);
    }

    #[test]
    fn duplicate_fragments_do_not_complete_early() {
        let dir = tempfile::tempdir().unwrap();
        let mut reassembler = FragmentReassembler::with_scratch_dir("file", dir.path());
        let payload = vec![7u8; PAYLOAD_SIZE + 1];
        let frames = frames_for(&payload);
        assert_eq!(frames.len(), 2);

        assert!(matches!(
            reassembler.ingest(&frames[0]),
            IngestOutcome::Incomplete
        ));
        assert!(matches!(
            reassembler.ingest(&frames[0]),
            IngestOutcome::Incomplete
        ));
        match reassembler.ingest(&frames[1]) {
            IngestOutcome::Complete { ok, scratch_path, .. } => {
                assert!(ok);
                let _ = fs::remove_file(scratch_path);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn invalid_frames_are_dropped_without_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut reassembler = FragmentReassembler::with_scratch_dir("file", dir.path());
        assert!(matches!(
            reassembler.ingest(&[0u8; 16]),
            IngestOutcome::Dropped(_)
        ));
        assert!(matches!(
            reassembler.ingest(&vec![0u8; FRAGMENT_SIZE]),
            IngestOutcome::Dropped(_)
        ));
        assert_eq!(reassembler.inflight_len(), 0);
    }

    #[test]
    fn drop_clears_inflight_scratch_files() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![1u8; PAYLOAD_SIZE * 3];
        let frames = frames_for(&payload);
        let scratch_dir = dir.path().to_path_buf();
        {
            let mut reassembler = FragmentReassembler::with_scratch_dir("file", &scratch_dir);
            let _ = reassembler.ingest(&frames[0]);
            assert_eq!(reassembler.inflight_len(), 1);
            assert_eq!(fs::read_dir(&scratch_dir).unwrap().count(), 1);
        }
        assert_eq!(fs::read_dir(&scratch_dir).unwrap().count(), 0);
    }

    #[test]
    fn header_reader_rejects_truncated_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.tmp");
        fs::write(&path, 1000u32.to_be_bytes()).unwrap();
        assert!(read_header(&path).is_err());
    }
}
