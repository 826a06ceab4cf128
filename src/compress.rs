//! Streaming zstd sessions
//!
//! Each compressed file is one independent zstd frame: the sender feeds
//! chunks with continue semantics and closes the frame on the final read;
//! the receiver decompresses chunk by chunk. Both contexts are reusable
//! across files on the same connection via `reset`.

use zstd::stream::raw::{Decoder, Encoder, InBuffer, Operation, OutBuffer};

use crate::error::TransferError;

const SCRATCH_SIZE: usize = 64 * 1024;

pub struct Compressor {
    ctx: Encoder<'static>,
    scratch: Box<[u8]>,
}

impl Compressor {
    pub fn new() -> Result<Self, TransferError> {
        let ctx = Encoder::new(zstd::DEFAULT_COMPRESSION_LEVEL)
            .map_err(TransferError::Compression)?;
        Ok(Compressor {
            ctx,
            scratch: vec![0u8; SCRATCH_SIZE].into_boxed_slice(),
        })
    }

    /// Starts a fresh zstd session for the next file.
    pub fn reset(&mut self) -> Result<(), TransferError> {
        self.ctx.reinit().map_err(TransferError::Compression)
    }

    /// Feeds `input` into the session, appending produced bytes to `out`.
    /// `last` closes the frame and drains everything the context holds.
    pub fn compress(
        &mut self,
        input: &[u8],
        out: &mut Vec<u8>,
        last: bool,
    ) -> Result<(), TransferError> {
        let mut in_buf = InBuffer::around(input);

        while in_buf.pos < input.len() {
            let mut out_buf = OutBuffer::around(&mut self.scratch[..]);
            self.ctx
                .run(&mut in_buf, &mut out_buf)
                .map_err(TransferError::Compression)?;
            let pos = out_buf.pos();
            out.extend_from_slice(&self.scratch[..pos]);
        }

        if last {
            loop {
                let mut out_buf = OutBuffer::around(&mut self.scratch[..]);
                let remaining = self
                    .ctx
                    .finish(&mut out_buf, true)
                    .map_err(TransferError::Compression)?;
                let pos = out_buf.pos();
                out.extend_from_slice(&self.scratch[..pos]);
                if remaining == 0 {
                    break;
                }
            }
        }
        Ok(())
    }
}

pub struct Decompressor {
    ctx: Decoder<'static>,
    scratch: Box<[u8]>,
}

impl Decompressor {
    pub fn new() -> Result<Self, TransferError> {
        let ctx = Decoder::new().map_err(TransferError::Compression)?;
        Ok(Decompressor {
            ctx,
            scratch: vec![0u8; SCRATCH_SIZE].into_boxed_slice(),
        })
    }

    pub fn reset(&mut self) -> Result<(), TransferError> {
        self.ctx.reinit().map_err(TransferError::Compression)
    }

    /// Decompresses one wire chunk, handing every decoded burst to `sink`.
    /// The chunk need not align with zstd block boundaries.
    pub fn decompress(
        &mut self,
        input: &[u8],
        mut sink: impl FnMut(&[u8]) -> Result<(), TransferError>,
    ) -> Result<(), TransferError> {
        let mut in_buf = InBuffer::around(input);

        loop {
            let mut out_buf = OutBuffer::around(&mut self.scratch[..]);
            let before = in_buf.pos;
            self.ctx
                .run(&mut in_buf, &mut out_buf)
                .map_err(TransferError::Compression)?;
            let produced = out_buf.pos();

            if produced > 0 {
                sink(&self.scratch[..produced])?;
            }

            let input_done = in_buf.pos >= input.len();
            if input_done && produced < self.scratch.len() {
                return Ok(());
            }
            if in_buf.pos == before && produced == 0 {
                return Err(TransferError::malformed("decompression made no progress"));
            }
        }
    }
}
