use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use rand::seq::SliceRandom;

use screenlink::files::{
    DatagramSink, FileProtocol, FragmentReassembler, IngestOutcome, SinkError,
};
use screenlink::wire::fragment::FRAGMENT_SIZE;
use screenlink::wire::{ChannelMessage, MSG_FILE_DOWNLOAD, MSG_FILE_UPLOAD};

/// Collects everything the protocol sends, standing in for the two data
/// channels.
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

async fn deliver_all(
    frames: Vec<Vec<u8>>,
    reassembler: &mut FragmentReassembler,
) -> Vec<PathBuf> {
    let mut completed = Vec::new();
    for frame in frames {
        assert_eq!(frame.len(), FRAGMENT_SIZE, "every wire frame is 8192 bytes");
        if let IngestOutcome::Complete {
            scratch_path, ok, ..
        } = reassembler.ingest(&frame)
        {
            assert!(ok, "reassembly reported failure");
            completed.push(scratch_path);
        }
    }
    completed
}

#[tokio::test]
async fn single_file_survives_shuffled_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("payload.bin");
    let body: Vec<u8> = (0..100_000u32).map(|i| (i * 31 % 251) as u8).collect();
    std::fs::write(&src, &body).unwrap();
    let dest = dir.path().join("out").join("payload.bin");

    let sink = RecordingSink::default();
    let text_sink = RecordingSink::default();
    FileProtocol::send_tree(
        &src,
        &dest,
        MSG_FILE_DOWNLOAD,
        &sink,
        &text_sink,
    )
    .await
    .unwrap();

    // Deliver the fragments in a random permutation; the payload-offset
    // writes make order irrelevant.
    let mut frames = sink.binary.lock().unwrap().clone();
    frames.shuffle(&mut rand::thread_rng());

    let mut reassembler = FragmentReassembler::with_scratch_dir("file", dir.path());
    let completed = deliver_all(frames, &mut reassembler).await;
    assert_eq!(completed.len(), 1);

    let done = FileProtocol::handle_completed_message(&completed[0]).await;
    assert!(done.ok);
    assert_eq!(done.bytes, body.len() as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), body, "bit-exact copy");
}

#[tokio::test]
async fn directory_upload_materialises_relative_tree() {
    let dir = tempfile::tempdir().unwrap();
    let tree = dir.path().join("src-tree");
    std::fs::create_dir_all(tree.join("sub/inner")).unwrap();
    std::fs::write(tree.join("top.txt"), b"top level").unwrap();
    std::fs::write(tree.join("sub/middle.dat"), vec![0xA5; 20_000]).unwrap();
    std::fs::write(tree.join("sub/inner/leaf.bin"), vec![0x5A; 9_000]).unwrap();

    let dest_root = dir.path().join("received");
    let file_sink = RecordingSink::default();
    let text_sink = RecordingSink::default();
    let sent = FileProtocol::send_tree(
        &tree,
        &dest_root,
        MSG_FILE_UPLOAD,
        &file_sink,
        &text_sink,
    )
    .await
    .unwrap();
    assert_eq!(sent, 3);

    // Start/end markers bracket the stream on the text channel.
    let texts = text_sink.text.lock().unwrap().clone();
    let start = ChannelMessage::decode(texts.first().unwrap().as_bytes()).unwrap();
    assert_eq!(start.directory_start, Some(true));
    let end = ChannelMessage::decode(texts.last().unwrap().as_bytes()).unwrap();
    assert_eq!(end.directory_end, Some(true));
    assert_eq!(end.file_count, Some(3));

    let frames = file_sink.binary.lock().unwrap().clone();
    let mut reassembler = FragmentReassembler::with_scratch_dir("file", dir.path());
    let completed = deliver_all(frames, &mut reassembler).await;
    assert_eq!(completed.len(), 3);

    for scratch in &completed {
        let done = FileProtocol::handle_completed_message(scratch).await;
        assert!(done.ok);
        assert_eq!(done.msg_type, MSG_FILE_UPLOAD);
        assert!(done.dest.starts_with(&dest_root));
    }

    assert_eq!(
        std::fs::read(dest_root.join("top.txt")).unwrap(),
        b"top level"
    );
    assert_eq!(
        std::fs::read(dest_root.join("sub/middle.dat")).unwrap(),
        vec![0xA5; 20_000]
    );
    assert_eq!(
        std::fs::read(dest_root.join("sub/inner/leaf.bin")).unwrap(),
        vec![0x5A; 9_000]
    );
}

#[tokio::test]
async fn tiny_and_boundary_sized_payloads_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    // One byte, exactly one payload, one payload plus one byte.
    for (index, size) in [1usize, 8160 - 200, 8160 * 2].iter().enumerate() {
        let src = dir.path().join(format!("case-{index}.bin"));
        let body: Vec<u8> = (0..*size).map(|i| (i % 233) as u8).collect();
        std::fs::write(&src, &body).unwrap();
        let dest = dir.path().join(format!("case-{index}.out"));

        let sink = RecordingSink::default();
        let text_sink = RecordingSink::default();
        FileProtocol::send_tree(&src, &dest, MSG_FILE_DOWNLOAD, &sink, &text_sink)
            .await
            .unwrap();

        let frames = sink.binary.lock().unwrap().clone();
        let mut reassembler =
            FragmentReassembler::with_scratch_dir(&format!("file-{index}"), dir.path());
        let completed = deliver_all(frames, &mut reassembler).await;
        let done = FileProtocol::handle_completed_message(&completed[0]).await;
        assert!(done.ok);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
    }
}

#[tokio::test]
async fn foreign_traffic_does_not_disturb_reassembly() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("wanted.bin");
    std::fs::write(&src, vec![7u8; 30_000]).unwrap();
    let dest = dir.path().join("wanted.out");

    let sink = RecordingSink::default();
    let text_sink = RecordingSink::default();
    FileProtocol::send_tree(&src, &dest, MSG_FILE_DOWNLOAD, &sink, &text_sink)
        .await
        .unwrap();

    let frames = sink.binary.lock().unwrap().clone();
    let mut reassembler = FragmentReassembler::with_scratch_dir("file", dir.path());

    // Interleave garbage: wrong size, zero total, index >= total.
    let mut garbage_short = vec![0u8; 100];
    garbage_short[0] = 1;
    assert!(matches!(
        reassembler.ingest(&garbage_short),
        IngestOutcome::Dropped(_)
    ));
    let mut zero_total = frames[0].clone();
    zero_total[16..24].copy_from_slice(&0u64.to_be_bytes());
    assert!(matches!(
        reassembler.ingest(&zero_total),
        IngestOutcome::Dropped(_)
    ));

    let completed = deliver_all(frames, &mut reassembler).await;
    let done = FileProtocol::handle_completed_message(&completed[0]).await;
    assert!(done.ok);
    assert_eq!(std::fs::read(&dest).unwrap(), vec![7u8; 30_000]);
    assert_eq!(reassembler.inflight_len(), 0);
}

#[test]
fn listing_of_a_populated_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("docs")).unwrap();
    std::fs::write(dir.path().join("report.pdf"), b"pdf").unwrap();

    let reply = screenlink::files::build_listing(dir.path().to_str().unwrap(), Path::new("/"));
    let entries = reply.folder_files.unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries[0].is_dir);
    assert_eq!(entries[1].file_suffix.as_deref(), Some("pdf"));
    assert!(!reply.mounted.unwrap().is_empty());
}
