//! Fixed-size fragment framing for the reliable file channel.
//!
//! Every message on the `file` channel is exactly [`FRAGMENT_SIZE`] bytes:
//! a 32-byte header (128-bit message id, big-endian total count, big-endian
//! index) followed by up to [`PAYLOAD_SIZE`] payload bytes, zero-padded on
//! the last fragment.

use thiserror::Error;
use uuid::Uuid;

pub const FRAGMENT_SIZE: usize = 8 * 1024;
pub const HEADER_SIZE: usize = 32;
pub const PAYLOAD_SIZE: usize = FRAGMENT_SIZE - HEADER_SIZE;

/// Upper bound on the advertised fragment count of one logical message.
pub const MAX_FRAGMENTS: u64 = 1_000_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FragmentError {
    #[error("fragment too small: {0} bytes")]
    TooSmall(usize),
    #[error("fragment size {0} != {FRAGMENT_SIZE}")]
    WrongSize(usize),
    #[error("invalid total fragment count {0}")]
    InvalidTotal(u64),
    #[error("fragment index {index} out of range (total {total})")]
    IndexOutOfRange { index: u64, total: u64 },
    #[error("nil message id")]
    NilMessageId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub message_id: Uuid,
    pub total: u64,
    pub index: u64,
}

impl FragmentHeader {
    pub fn write_to(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[..16].copy_from_slice(self.message_id.as_bytes());
        buf[16..24].copy_from_slice(&self.total.to_be_bytes());
        buf[24..32].copy_from_slice(&self.index.to_be_bytes());
    }

    pub fn parse(buf: &[u8]) -> Result<Self, FragmentError> {
        if buf.len() < HEADER_SIZE {
            return Err(FragmentError::TooSmall(buf.len()));
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&buf[..16]);
        let message_id = Uuid::from_bytes(id);
        if message_id.is_nil() {
            return Err(FragmentError::NilMessageId);
        }
        let total = u64::from_be_bytes(buf[16..24].try_into().unwrap_or_default());
        let index = u64::from_be_bytes(buf[24..32].try_into().unwrap_or_default());
        if total == 0 || total > MAX_FRAGMENTS {
            return Err(FragmentError::InvalidTotal(total));
        }
        if index >= total {
            return Err(FragmentError::IndexOutOfRange { index, total });
        }
        Ok(Self {
            message_id,
            total,
            index,
        })
    }
}

/// A parsed inbound fragment: validated header plus its payload slice.
#[derive(Debug)]
pub struct Fragment<'a> {
    pub header: FragmentHeader,
    pub payload: &'a [u8],
}

impl<'a> Fragment<'a> {
    /// Parses one wire frame. Ingestion rejects anything that is not exactly
    /// [`FRAGMENT_SIZE`] bytes; header validation then bounds total and index.
    pub fn parse(frame: &'a [u8]) -> Result<Self, FragmentError> {
        if frame.len() != FRAGMENT_SIZE {
            return Err(FragmentError::WrongSize(frame.len()));
        }
        let header = FragmentHeader::parse(frame)?;
        Ok(Self {
            header,
            payload: &frame[HEADER_SIZE..],
        })
    }
}

/// Number of fragments needed for a logical payload of `len` bytes.
pub fn fragment_count(len: u64) -> u64 {
    len.div_ceil(PAYLOAD_SIZE as u64).max(1)
}

/// Builds one wire frame: header, payload, zero padding up to the fixed size.
pub fn build_frame(header: &FragmentHeader, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= PAYLOAD_SIZE);
    let mut frame = vec![0u8; FRAGMENT_SIZE];
    header.write_to(&mut frame);
    frame[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(total: u64, index: u64) -> FragmentHeader {
        FragmentHeader {
            message_id: Uuid::new_v4(),
            total,
            index,
        }
    }

    #[test]
    fn header_layout_is_byte_exact() {
        let id = Uuid::new_v4();
        let mut buf = [0u8; HEADER_SIZE];
        FragmentHeader {
            message_id: id,
            total: 0x0102,
            index: 1,
        }
        .write_to(&mut buf);

        assert_eq!(&buf[..16], id.as_bytes());
        // Big-endian u64 totals and indices.
        assert_eq!(&buf[16..24], &[0, 0, 0, 0, 0, 0, 0x01, 0x02]);
        assert_eq!(&buf[24..32], &[0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn round_trips_through_a_frame() {
        let hdr = header(3, 2);
        let payload = vec![0xAB; 100];
        let frame = build_frame(&hdr, &payload);
        assert_eq!(frame.len(), FRAGMENT_SIZE);

        let parsed = Fragment::parse(&frame).unwrap();
        assert_eq!(parsed.header, hdr);
        assert_eq!(&parsed.payload[..100], payload.as_slice());
        // Tail is zero padding.
        assert!(parsed.payload[100..].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn rejects_zero_total_and_out_of_range_index() {
        let mut frame = build_frame(&header(1, 0), &[1, 2, 3]);
        frame[16..24].copy_from_slice(&0u64.to_be_bytes());
        assert_eq!(
            Fragment::parse(&frame).unwrap_err(),
            FragmentError::InvalidTotal(0)
        );

        let mut frame = build_frame(&header(2, 0), &[1]);
        frame[24..32].copy_from_slice(&5u64.to_be_bytes());
        assert_eq!(
            Fragment::parse(&frame).unwrap_err(),
            FragmentError::IndexOutOfRange { index: 5, total: 2 }
        );
    }

    #[test]
    fn rejects_oversized_totals() {
        let mut frame = build_frame(&header(1, 0), &[]);
        frame[16..24].copy_from_slice(&(MAX_FRAGMENTS + 1).to_be_bytes());
        assert!(matches!(
            Fragment::parse(&frame),
            Err(FragmentError::InvalidTotal(_))
        ));
    }

    #[test]
    fn rejects_frames_of_the_wrong_size() {
        assert_eq!(
            Fragment::parse(&[0u8; 31]).unwrap_err(),
            FragmentError::WrongSize(31)
        );
        assert_eq!(
            Fragment::parse(&vec![0u8; FRAGMENT_SIZE + 1]).unwrap_err(),
            FragmentError::WrongSize(FRAGMENT_SIZE + 1)
        );
    }

    #[test]
    fn fragment_count_covers_boundaries() {
        assert_eq!(fragment_count(0), 1);
        assert_eq!(fragment_count(1), 1);
        assert_eq!(fragment_count(PAYLOAD_SIZE as u64), 1);
        assert_eq!(fragment_count(PAYLOAD_SIZE as u64 + 1), 2);
        // The spec's 25 000-byte example: 4-byte length + header JSON + body.
        let header_json = 120u64;
        let total = 4 + header_json + 25_000;
        assert_eq!(fragment_count(total), total.div_ceil(PAYLOAD_SIZE as u64));
    }
}
