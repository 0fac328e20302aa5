//! Reliable file transfer over the fragment-framed `file` channel plus the
//! ordered `file_text` control channel.

mod protocol;
mod reassembly;

pub use protocol::{
    build_listing, download_request, listing_request, mounted_roots, upload_ack, CompletedFile,
    FileProtocol, FileProtocolError, SinkError,
};
pub use reassembly::{FragmentReassembler, IngestOutcome};

use async_trait::async_trait;

/// Outbound side of one data channel, as seen by the file protocol. The
/// session layer implements this over the live channels; tests implement it
/// over in-memory queues.
#[async_trait]
pub trait DatagramSink: Send + Sync {
    async fn send_binary(&self, payload: Vec<u8>) -> Result<(), SinkError>;
    async fn send_text(&self, payload: String) -> Result<(), SinkError>;
}
