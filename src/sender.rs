//! Sender: entry-list driver, acknowledgement-gated upload state machine

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::net::TcpStream;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::{error, info};
use xxhash_rust::xxh3::Xxh3;

use crate::compress::Compressor;
use crate::config;
use crate::connection::{PacketHandler, PacketPump, ProtocolConnection};
use crate::error::TransferError;
use crate::listing::{self, Entry, EntryKind};
use crate::packet::Packet;
use crate::protocol::{file_flags, DEFAULT_PORT};
use crate::tracker::TransferTracker;

/// Bytes read from the local file per iteration of the upload loop.
const CHUNK_SIZE: usize = 128 * 1024;

/// A compressed upload flushes its output buffer as one `FileChunk` once it
/// holds at least this much. Intentionally smaller than [`CHUNK_SIZE`]: one
/// read may produce several flushes or none.
const COMPRESSED_FLUSH_SIZE: usize = 64 * 1024;

/// Files smaller than this are sent raw even when compression is enabled.
const COMPRESSION_MIN_SIZE: u64 = 4096;

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    WaitingForHello,
    Idle,
    WaitingForDirectoryAck,
    WaitingForFileAck,
    WaitingForUploadAck,
    Finished,
}

struct Upload {
    file: File,
    virtual_path: String,
    file_size: u64,
    compressed: bool,
}

pub struct Sender {
    conn: ProtocolConnection,
    entries: Vec<Entry>,
    current_entry: usize,
    state: State,
    upload: Option<Upload>,
    compression_enabled: bool,
    compressor: Compressor,
    compression_buffer: Vec<u8>,
    chunk_buffer: Vec<u8>,
    hasher: Xxh3,
    tracker: TransferTracker,
}

impl Sender {
    pub fn new(
        stream: TcpStream,
        entries: Vec<Entry>,
        compression_enabled: bool,
    ) -> Result<Self, TransferError> {
        Ok(Sender {
            conn: ProtocolConnection::new(stream),
            entries,
            current_entry: 0,
            state: State::WaitingForHello,
            upload: None,
            compression_enabled,
            compressor: Compressor::new()?,
            compression_buffer: Vec::new(),
            chunk_buffer: vec![0u8; CHUNK_SIZE],
            hasher: Xxh3::new(),
            tracker: TransferTracker::new("uploading", Box::new(|msg| info!("{msg}"))),
        })
    }

    pub fn start(&mut self) -> Result<(), TransferError> {
        self.conn.send_packet(&Packet::SenderHello)
    }

    pub fn alive(&self) -> bool {
        self.conn.alive()
    }

    pub fn finished(&self) -> bool {
        self.state == State::Finished
    }

    pub fn fail(&mut self, err: TransferError) {
        self.conn.retire();
        match err {
            TransferError::Disconnected => {
                if self.finished() {
                    info!("disconnected");
                } else {
                    error!("disconnected unexpectedly");
                }
            }
            err => error!("{err}"),
        }
    }

    fn should_compress(&self, file_size: u64) -> bool {
        self.compression_enabled && file_size >= COMPRESSION_MIN_SIZE
    }

    fn process_entry(&mut self) -> Result<(), TransferError> {
        let Some(entry) = self.entries.get(self.current_entry).cloned() else {
            self.state = State::Finished;
            self.conn.retire();
            return Ok(());
        };
        match entry.kind {
            EntryKind::Directory => {
                info!("creating directory `{}`...", entry.relative_path);
                self.conn.send_packet(&Packet::CreateDirectory {
                    path: &entry.relative_path,
                })?;
                self.state = State::WaitingForDirectoryAck;
                Ok(())
            }
            EntryKind::File => self.start_upload(entry),
        }
    }

    fn next_entry(&mut self) -> Result<(), TransferError> {
        self.current_entry += 1;
        self.process_entry()
    }

    fn start_upload(&mut self, entry: Entry) -> Result<(), TransferError> {
        let mut file = File::open(&entry.absolute_path).map_err(|err| {
            TransferError::file(
                format!(
                    "failed to open file `{}` for reading",
                    entry.absolute_path.display()
                ),
                err,
            )
        })?;

        let read_failed = |err| {
            TransferError::file(
                format!("failed to read file `{}`", entry.absolute_path.display()),
                err,
            )
        };
        let file_size = file.seek(SeekFrom::End(0)).map_err(read_failed)?;
        file.seek(SeekFrom::Start(0)).map_err(read_failed)?;

        let compressed = self.should_compress(file_size);
        let mut flags = 0u16;
        if compressed {
            flags |= file_flags::COMPRESSED;
        }

        self.conn.send_packet(&Packet::CreateFile {
            size: file_size,
            flags,
            path: &entry.relative_path,
        })?;

        self.state = State::WaitingForFileAck;
        self.tracker
            .begin(&entry.relative_path, file_size, compressed);
        self.upload = Some(Upload {
            file,
            virtual_path: entry.relative_path,
            file_size,
            compressed,
        });
        Ok(())
    }

    /// Streams the accepted file: raw chunks, or zstd with a buffered flush
    /// threshold. Every uncompressed byte read is hashed, and the final hash
    /// is committed with `VerifyFile`.
    fn upload_accepted_file(&mut self) -> Result<(), TransferError> {
        let mut upload = self
            .upload
            .take()
            .ok_or_else(|| TransferError::protocol("file acknowledged without an active upload"))?;

        self.hasher.reset();
        if upload.compressed {
            self.compressor.reset()?;
            self.compression_buffer.clear();
        }

        let mut pending_uncompressed: u64 = 0;
        let mut total_read: u64 = 0;

        while total_read < upload.file_size {
            let want = (upload.file_size - total_read).min(self.chunk_buffer.len() as u64) as usize;
            // A short read means the file shrank underneath us.
            upload
                .file
                .read_exact(&mut self.chunk_buffer[..want])
                .map_err(|err| {
                    TransferError::file(
                        format!("failed to read file `{}`", upload.virtual_path),
                        err,
                    )
                })?;
            total_read += want as u64;

            if upload.compressed {
                let last_chunk = total_read == upload.file_size;
                self.compressor.compress(
                    &self.chunk_buffer[..want],
                    &mut self.compression_buffer,
                    last_chunk,
                )?;
                pending_uncompressed += want as u64;

                if self.compression_buffer.len() >= COMPRESSED_FLUSH_SIZE {
                    flush_compressed(
                        &mut self.conn,
                        &mut self.tracker,
                        &mut self.compression_buffer,
                        &mut pending_uncompressed,
                    )?;
                }
            } else {
                self.conn.send_packet(&Packet::FileChunk {
                    data: &self.chunk_buffer[..want],
                })?;
                self.tracker.progress(want as u64, want as u64);
            }

            self.hasher.update(&self.chunk_buffer[..want]);
        }

        if upload.compressed {
            flush_compressed(
                &mut self.conn,
                &mut self.tracker,
                &mut self.compression_buffer,
                &mut pending_uncompressed,
            )?;
        }

        let hash = self.hasher.digest();
        self.conn.send_packet(&Packet::VerifyFile { hash })?;

        self.tracker.end();
        self.state = State::WaitingForUploadAck;
        Ok(())
    }

    fn handle_acknowledged(&mut self, accepted: bool) -> Result<(), TransferError> {
        match self.state {
            State::WaitingForDirectoryAck => {
                if !accepted {
                    return Err(TransferError::protocol(
                        "receiver rejected the directory creation request",
                    ));
                }
                self.state = State::Idle;
                self.next_entry()
            }
            State::WaitingForFileAck => {
                if !accepted {
                    return Err(TransferError::protocol(
                        "receiver rejected the file creation request",
                    ));
                }
                self.upload_accepted_file()
            }
            State::WaitingForUploadAck => {
                if !accepted {
                    return Err(TransferError::protocol("receiver rejected the file upload"));
                }
                self.state = State::Idle;
                self.next_entry()
            }
            _ => Err(TransferError::protocol(
                "received unexpected Acknowledged packet",
            )),
        }
    }
}

fn flush_compressed(
    conn: &mut ProtocolConnection,
    tracker: &mut TransferTracker,
    buffer: &mut Vec<u8>,
    pending_uncompressed: &mut u64,
) -> Result<(), TransferError> {
    if buffer.is_empty() {
        return Ok(());
    }
    conn.send_packet(&Packet::FileChunk { data: buffer })?;
    tracker.progress(*pending_uncompressed, buffer.len() as u64);
    buffer.clear();
    *pending_uncompressed = 0;
    Ok(())
}

impl PacketHandler for Sender {
    fn connection(&mut self) -> &mut ProtocolConnection {
        &mut self.conn
    }

    fn handle_packet(&mut self, packet: Packet<'_>) -> Result<(), TransferError> {
        match packet {
            Packet::ReceiverHello if self.state == State::WaitingForHello => {
                self.state = State::Idle;
                self.process_entry()
            }
            Packet::Acknowledged { accepted } => self.handle_acknowledged(accepted),
            other => Err(TransferError::Protocol(format!(
                "received unexpected {} packet",
                other.name()
            ))),
        }
    }
}

/// Drives one connected stream through the whole entry list. Returns whether
/// the transfer ran to completion.
pub fn transfer(stream: TcpStream, entries: Vec<Entry>, compression_enabled: bool) -> bool {
    let mut sender = match Sender::new(stream, entries, compression_enabled) {
        Ok(sender) => sender,
        Err(err) => {
            error!("{err}");
            return false;
        }
    };
    if let Err(err) = sender.start() {
        sender.fail(err);
        return false;
    }

    let mut pump = PacketPump::new();
    while sender.alive() {
        if let Err(err) = pump.update(&mut sender) {
            sender.fail(err);
        }
    }
    sender.finished()
}

/// `sling send`: parse the address, build the entry list, connect and push.
pub fn run(address: &str, paths: &[PathBuf]) -> Result<bool> {
    let (host, port) = parse_address(address)?;

    let entries = listing::build_entry_list(paths)?;
    if entries.is_empty() {
        bail!("no files to send");
    }
    info!("number of entries to send: {}", entries.len());

    let compression_enabled = config::compression_enabled();
    info!(
        "compression is {} (set `{}` to change it)",
        if compression_enabled { "enabled" } else { "disabled" },
        config::DISABLE_COMPRESSION_ENV,
    );

    let stream = TcpStream::connect((host, port))
        .with_context(|| format!("failed to connect to `{address}`"))?;
    info!("connected to the receiver");

    Ok(transfer(stream, entries, compression_enabled))
}

fn parse_address(address: &str) -> Result<(&str, u16)> {
    match address.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid port `{port}`"))?;
            Ok((host, port))
        }
        None => Ok((address, DEFAULT_PORT)),
    }
}
