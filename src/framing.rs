//! Length-prefixed frame envelope on a byte stream
//!
//! `FrameReceiver` buffers raw bytes from the transport and carves them into
//! frames; `FrameSender` builds one outgoing frame at a time, patching the
//! length field after the payload has been appended.

use crate::error::TransferError;
use crate::protocol::{FRAME_HEADER_SIZE, FRAME_MAGIC, MAX_FRAME_SIZE};

/// Minimum writable region surfaced to the transport per receive call.
const RECEIVE_CHUNK_SIZE: usize = 16 * 1024;

/// Outcome of [`FrameReceiver::advance`]. A malformed header is reported as
/// an error instead, since the stream cannot be resynchronized.
pub enum Advance<'a> {
    /// Not enough buffered bytes for a header or for the pending frame.
    NeedMoreData,
    /// A whole frame is buffered; the slice is its payload (header stripped).
    Frame(&'a [u8]),
}

pub struct FrameReceiver {
    buffer: Vec<u8>,
    used: usize,
    receive_size: usize,
    pending_frame: Option<usize>,
}

impl FrameReceiver {
    pub fn new() -> Self {
        FrameReceiver {
            buffer: Vec::new(),
            used: 0,
            receive_size: RECEIVE_CHUNK_SIZE,
            pending_frame: None,
        }
    }

    /// Surfaces a writable region for the transport to fill. The region is at
    /// least [`RECEIVE_CHUNK_SIZE`] and at least the size of the pending
    /// frame, so a declared frame is received without buffer thrashing.
    pub fn receive_buffer(&mut self) -> &mut [u8] {
        let needed = self.used + self.receive_size;
        if self.buffer.len() < needed {
            self.buffer.resize(needed, 0);
        }
        &mut self.buffer[self.used..self.used + self.receive_size]
    }

    /// Commits `n` bytes written into the region from [`Self::receive_buffer`].
    pub fn commit(&mut self, n: usize) {
        self.used += n;
        debug_assert!(self.used <= self.buffer.len(), "out of bounds receive");
    }

    pub fn advance(&mut self) -> Result<Advance<'_>, TransferError> {
        if self.pending_frame.is_none() && self.used >= FRAME_HEADER_SIZE {
            let magic = u32::from_be_bytes(self.buffer[0..4].try_into().unwrap());
            if magic != FRAME_MAGIC {
                return Err(TransferError::malformed("invalid frame magic"));
            }

            let frame_size = u32::from_be_bytes(self.buffer[4..8].try_into().unwrap()) as usize;
            if frame_size <= FRAME_HEADER_SIZE || frame_size > MAX_FRAME_SIZE {
                return Err(TransferError::Malformed(format!(
                    "frame length {frame_size} out of range"
                )));
            }

            self.pending_frame = Some(frame_size);
            self.receive_size = self.receive_size.max(frame_size);
        }

        match self.pending_frame {
            Some(frame_size) if self.used >= frame_size => {
                Ok(Advance::Frame(&self.buffer[FRAME_HEADER_SIZE..frame_size]))
            }
            _ => Ok(Advance::NeedMoreData),
        }
    }

    /// Removes the pending frame from the buffer, shifting any bytes of the
    /// next frame to the front. No-op unless a whole frame is buffered.
    pub fn discard(&mut self) {
        if let Some(frame_size) = self.pending_frame {
            if self.used >= frame_size {
                self.buffer.copy_within(frame_size..self.used, 0);
                self.used -= frame_size;
                self.pending_frame = None;
            }
        }
    }
}

/// Builds outgoing frames. Stateless across packets: each `encode` call
/// reserves the header, lets the codec append the payload, then patches the
/// length field.
#[derive(Default)]
pub struct FrameSender {
    buffer: Vec<u8>,
}

impl FrameSender {
    pub fn new() -> Self {
        FrameSender { buffer: Vec::new() }
    }

    pub fn encode<F>(&mut self, append_payload: F) -> Result<&[u8], TransferError>
    where
        F: FnOnce(&mut Vec<u8>),
    {
        self.buffer.clear();
        self.buffer.extend_from_slice(&FRAME_MAGIC.to_be_bytes());
        self.buffer.extend_from_slice(&u32::MAX.to_be_bytes());

        append_payload(&mut self.buffer);

        let frame_size = self.buffer.len();
        if frame_size <= FRAME_HEADER_SIZE || frame_size > MAX_FRAME_SIZE {
            return Err(TransferError::Malformed(format!(
                "refusing to send frame of {frame_size} bytes"
            )));
        }

        self.buffer[4..8].copy_from_slice(&(frame_size as u32).to_be_bytes());
        Ok(&self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(rx: &mut FrameReceiver, bytes: &[u8]) {
        let buf = rx.receive_buffer();
        buf[..bytes.len()].copy_from_slice(bytes);
        rx.commit(bytes.len());
    }

    fn frame_bytes(payload: &[u8]) -> Vec<u8> {
        let mut out = FRAME_MAGIC.to_be_bytes().to_vec();
        out.extend_from_slice(&((FRAME_HEADER_SIZE + payload.len()) as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn whole_frame_in_one_receive() {
        let mut rx = FrameReceiver::new();
        feed(&mut rx, &frame_bytes(b"hello"));

        match rx.advance().unwrap() {
            Advance::Frame(payload) => assert_eq!(payload, b"hello"),
            Advance::NeedMoreData => panic!("expected a frame"),
        }
    }

    #[test]
    fn frame_split_across_receives() {
        let bytes = frame_bytes(b"split payload");
        let mut rx = FrameReceiver::new();

        feed(&mut rx, &bytes[..5]);
        assert!(matches!(rx.advance().unwrap(), Advance::NeedMoreData));

        feed(&mut rx, &bytes[5..10]);
        assert!(matches!(rx.advance().unwrap(), Advance::NeedMoreData));

        feed(&mut rx, &bytes[10..]);
        match rx.advance().unwrap() {
            Advance::Frame(payload) => assert_eq!(payload, b"split payload"),
            Advance::NeedMoreData => panic!("expected a frame"),
        }
    }

    #[test]
    fn discard_keeps_following_frame() {
        let mut bytes = frame_bytes(b"first");
        bytes.extend_from_slice(&frame_bytes(b"second"));

        let mut rx = FrameReceiver::new();
        feed(&mut rx, &bytes);

        match rx.advance().unwrap() {
            Advance::Frame(payload) => assert_eq!(payload, b"first"),
            Advance::NeedMoreData => panic!("expected first frame"),
        }
        rx.discard();

        match rx.advance().unwrap() {
            Advance::Frame(payload) => assert_eq!(payload, b"second"),
            Advance::NeedMoreData => panic!("expected second frame"),
        }
        rx.discard();
        assert!(matches!(rx.advance().unwrap(), Advance::NeedMoreData));
    }

    #[test]
    fn bad_magic_is_malformed() {
        let mut rx = FrameReceiver::new();
        feed(&mut rx, &[0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 16]);
        assert!(matches!(rx.advance(), Err(TransferError::Malformed(_))));
    }

    #[test]
    fn length_bounds() {
        // Length 8 (header only) is malformed, 9 is the smallest valid frame.
        let mut rx = FrameReceiver::new();
        let mut hdr = FRAME_MAGIC.to_be_bytes().to_vec();
        hdr.extend_from_slice(&8u32.to_be_bytes());
        feed(&mut rx, &hdr);
        assert!(matches!(rx.advance(), Err(TransferError::Malformed(_))));

        let mut rx = FrameReceiver::new();
        feed(&mut rx, &frame_bytes(&[0x42]));
        assert!(matches!(rx.advance().unwrap(), Advance::Frame(p) if p == [0x42]));

        // 8 MiB total is accepted (header parses, frame becomes pending).
        let mut rx = FrameReceiver::new();
        let mut hdr = FRAME_MAGIC.to_be_bytes().to_vec();
        hdr.extend_from_slice(&(MAX_FRAME_SIZE as u32).to_be_bytes());
        feed(&mut rx, &hdr);
        assert!(matches!(rx.advance().unwrap(), Advance::NeedMoreData));

        // One byte over is malformed.
        let mut rx = FrameReceiver::new();
        let mut hdr = FRAME_MAGIC.to_be_bytes().to_vec();
        hdr.extend_from_slice(&((MAX_FRAME_SIZE + 1) as u32).to_be_bytes());
        feed(&mut rx, &hdr);
        assert!(matches!(rx.advance(), Err(TransferError::Malformed(_))));
    }

    #[test]
    fn sender_rejects_empty_and_oversized_payloads() {
        let mut tx = FrameSender::new();
        assert!(tx.encode(|_| {}).is_err());

        let mut tx = FrameSender::new();
        let frame = tx.encode(|out| out.extend_from_slice(b"ok")).unwrap();
        assert_eq!(&frame[..4], &FRAME_MAGIC.to_be_bytes());
        assert_eq!(frame.len(), FRAME_HEADER_SIZE + 2);
        assert_eq!(&frame[4..8], &10u32.to_be_bytes());

        let mut tx = FrameSender::new();
        assert!(tx
            .encode(|out| out.resize(MAX_FRAME_SIZE + 1, 0))
            .is_err());
    }

    #[test]
    fn sender_output_round_trips_through_receiver() {
        let mut tx = FrameSender::new();
        let frame = tx
            .encode(|out| out.extend_from_slice(b"round trip"))
            .unwrap()
            .to_vec();

        let mut rx = FrameReceiver::new();
        feed(&mut rx, &frame);
        match rx.advance().unwrap() {
            Advance::Frame(payload) => assert_eq!(payload, b"round trip"),
            Advance::NeedMoreData => panic!("expected a frame"),
        }
    }
}
