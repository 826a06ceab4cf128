//! Receiver: accept loop, per-connection thread, and the download state machine

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::Context;
use tracing::{info, warn};
use xxhash_rust::xxh3::Xxh3;

use crate::compress::Decompressor;
use crate::connection::{PacketHandler, PacketPump, ProtocolConnection};
use crate::error::TransferError;
use crate::packet::Packet;
use crate::protocol::file_flags;
use crate::tracker::TransferTracker;

/// Filesystem directory all received paths are materialized under. Created
/// before the listener accepts anything and shared by every connection.
#[derive(Clone)]
pub struct ReceiveRoot(PathBuf);

impl ReceiveRoot {
    pub fn prepare(path: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(path)
            .with_context(|| format!("failed to create directory `{}`", path.display()))?;
        Ok(ReceiveRoot(path.to_path_buf()))
    }

    /// Maps a virtual path onto the filesystem. Any occurrence of the
    /// two-byte sequence `..` is treated as a traversal attempt, including
    /// inside otherwise legitimate names.
    fn resolve(&self, virtual_path: &str) -> Result<PathBuf, TransferError> {
        if virtual_path.contains("..") {
            return Err(TransferError::Protocol(format!(
                "path `{virtual_path}` contains `..`"
            )));
        }
        Ok(PathBuf::from(format!(
            "{}/{}",
            self.0.display(),
            virtual_path
        )))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    WaitingForHello,
    Idle,
    Downloading,
    WaitingForHash,
}

struct Download {
    file: File,
    virtual_path: String,
    fs_path: PathBuf,
    declared_size: u64,
    received_size: u64,
    compressed: bool,
}

impl Download {
    /// Closes the handle and removes the partially written file.
    fn abort(self, peer: &str) {
        let fs_path = self.fs_path;
        drop(self.file);
        if let Err(err) = fs::remove_file(&fs_path) {
            warn!(
                "{peer}: failed to remove partial file `{}`: {err}",
                fs_path.display()
            );
        }
    }
}

pub struct Receiver {
    conn: ProtocolConnection,
    peer: String,
    root: ReceiveRoot,
    state: State,
    download: Option<Download>,
    decompressor: Decompressor,
    hasher: Xxh3,
    tracker: TransferTracker,
}

impl Receiver {
    pub fn new(stream: TcpStream, peer: String, root: ReceiveRoot) -> Result<Self, TransferError> {
        let tracker_peer = peer.clone();
        Ok(Receiver {
            conn: ProtocolConnection::new(stream),
            peer,
            root,
            state: State::WaitingForHello,
            download: None,
            decompressor: Decompressor::new()?,
            hasher: Xxh3::new(),
            tracker: TransferTracker::new(
                "downloading",
                Box::new(move |msg| info!("{tracker_peer}: {msg}")),
            ),
        })
    }

    pub fn alive(&self) -> bool {
        self.conn.alive()
    }

    /// Retires the connection: logs the fault and removes any partial file.
    pub fn fail(&mut self, err: TransferError) {
        self.conn.retire();
        if let Some(download) = self.download.take() {
            download.abort(&self.peer);
        }
        match err {
            TransferError::Disconnected => {
                if self.state == State::Idle {
                    info!("{}: disconnected", self.peer);
                } else {
                    warn!("{}: disconnected unexpectedly", self.peer);
                }
            }
            err => warn!("{}: {err}", self.peer),
        }
    }

    fn unexpected(&self, packet: &Packet<'_>) -> TransferError {
        TransferError::Protocol(format!("received unexpected {} packet", packet.name()))
    }

    fn create_directory(&mut self, virtual_path: &str) -> Result<(), TransferError> {
        let fs_path = self.root.resolve(virtual_path)?;
        if !fs_path.is_dir() {
            fs::create_dir_all(&fs_path).map_err(|err| {
                TransferError::file(
                    format!("failed to create directory `{}`", fs_path.display()),
                    err,
                )
            })?;
            info!("{}: created directory `{virtual_path}`", self.peer);
        }
        Ok(())
    }

    /// Opens the target file and arms the download state. `Ok(false)` is a
    /// non-fatal rejection (path already exists); errors retire the
    /// connection.
    fn start_download(
        &mut self,
        virtual_path: &str,
        declared_size: u64,
        flags: u16,
    ) -> Result<bool, TransferError> {
        let fs_path = self.root.resolve(virtual_path)?;

        let file = match OpenOptions::new().write(true).create_new(true).open(&fs_path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!("{}: path `{}` already exists", self.peer, fs_path.display());
                return Ok(false);
            }
            Err(err) => {
                return Err(TransferError::file(
                    format!("failed to open file `{}` for writing", fs_path.display()),
                    err,
                ));
            }
        };

        let compressed = flags & file_flags::COMPRESSED != 0;
        if compressed {
            self.decompressor.reset()?;
        }
        self.hasher.reset();
        self.tracker.begin(virtual_path, declared_size, compressed);

        self.download = Some(Download {
            file,
            virtual_path: virtual_path.to_string(),
            fs_path,
            declared_size,
            received_size: 0,
            compressed,
        });
        self.state = if declared_size == 0 {
            State::WaitingForHash
        } else {
            State::Downloading
        };
        Ok(true)
    }

    fn process_chunk(&mut self, data: &[u8]) -> Result<(), TransferError> {
        let Receiver {
            download,
            decompressor,
            hasher,
            tracker,
            state,
            ..
        } = self;
        let download = download
            .as_mut()
            .ok_or_else(|| TransferError::protocol("file chunk without an active download"))?;

        let received_before = download.received_size;
        if download.compressed {
            decompressor.decompress(data, |bytes| write_chunk(download, hasher, bytes))?;
            let decoded = download.received_size - received_before;
            tracker.progress(decoded, data.len() as u64);
        } else {
            write_chunk(download, hasher, data)?;
            tracker.progress(data.len() as u64, data.len() as u64);
        }

        if download.received_size == download.declared_size {
            *state = State::WaitingForHash;
        }
        Ok(())
    }

    fn verify_download(&mut self, hash: u64) -> Result<(), TransferError> {
        let computed = self.hasher.digest();
        if hash != computed {
            let virtual_path = self
                .download
                .as_ref()
                .map(|d| d.virtual_path.clone())
                .unwrap_or_default();
            let _ = self
                .conn
                .send_packet(&Packet::Acknowledged { accepted: false });
            return Err(TransferError::Protocol(format!(
                "integrity check failed for `{virtual_path}`"
            )));
        }

        self.tracker.end();
        // Completed: the handle closes and the file stays on disk.
        self.download = None;
        self.conn.send_packet(&Packet::Acknowledged { accepted: true })?;
        self.state = State::Idle;
        Ok(())
    }
}

fn write_chunk(
    download: &mut Download,
    hasher: &mut Xxh3,
    bytes: &[u8],
) -> Result<(), TransferError> {
    // Checked before the write so the file never exceeds its declared size.
    if download.received_size + bytes.len() as u64 > download.declared_size {
        return Err(TransferError::Protocol(format!(
            "got more file data for `{}` than expected",
            download.virtual_path
        )));
    }
    download.file.write_all(bytes).map_err(|err| {
        TransferError::file(
            format!("failed to write to file `{}`", download.fs_path.display()),
            err,
        )
    })?;
    download.received_size += bytes.len() as u64;
    hasher.update(bytes);
    Ok(())
}

impl PacketHandler for Receiver {
    fn connection(&mut self) -> &mut ProtocolConnection {
        &mut self.conn
    }

    fn handle_packet(&mut self, packet: Packet<'_>) -> Result<(), TransferError> {
        match packet {
            Packet::SenderHello if self.state == State::WaitingForHello => {
                self.conn.send_packet(&Packet::ReceiverHello)?;
                self.state = State::Idle;
                Ok(())
            }
            Packet::CreateDirectory { path } if self.state == State::Idle => {
                match self.create_directory(path) {
                    Ok(()) => self
                        .conn
                        .send_packet(&Packet::Acknowledged { accepted: true }),
                    Err(err) => {
                        let _ = self
                            .conn
                            .send_packet(&Packet::Acknowledged { accepted: false });
                        Err(err)
                    }
                }
            }
            Packet::CreateFile { size, flags, path } if self.state == State::Idle => {
                match self.start_download(path, size, flags) {
                    Ok(accepted) => self.conn.send_packet(&Packet::Acknowledged { accepted }),
                    Err(err) => {
                        let _ = self
                            .conn
                            .send_packet(&Packet::Acknowledged { accepted: false });
                        Err(err)
                    }
                }
            }
            Packet::FileChunk { data } if self.state == State::Downloading => {
                self.process_chunk(data)
            }
            Packet::VerifyFile { hash } if self.state == State::WaitingForHash => {
                self.verify_download(hash)
            }
            other => Err(self.unexpected(&other)),
        }
    }
}

/// Runs one connection to completion. Every fault path ends here with the
/// connection retired and any partial download removed.
pub fn handle_connection(stream: TcpStream, peer: String, root: ReceiveRoot) {
    let mut receiver = match Receiver::new(stream, peer.clone(), root) {
        Ok(receiver) => receiver,
        Err(err) => {
            warn!("{peer}: {err}");
            return;
        }
    };

    let mut pump = PacketPump::new();
    while receiver.alive() {
        if let Err(err) = pump.update(&mut receiver) {
            receiver.fail(err);
        }
    }
}

/// Binds the listener and serves connections, one thread each. Connections
/// share nothing but the receive root.
pub fn serve(port: u16, receive_directory: &Path) -> anyhow::Result<()> {
    let root = ReceiveRoot::prepare(receive_directory)?;
    let listener = TcpListener::bind(("0.0.0.0", port))
        .with_context(|| format!("failed to bind receiver to port {port}"))?;
    info!("listening on port {port}...");

    for incoming in listener.incoming() {
        match incoming {
            Ok(stream) => {
                let peer = stream
                    .peer_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                info!("client {peer} connected");
                let root = root.clone();
                thread::spawn(move || handle_connection(stream, peer, root));
            }
            Err(err) => warn!("failed to accept client: {err}"),
        }
    }
    Ok(())
}
