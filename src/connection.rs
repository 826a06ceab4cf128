//! Transport ownership and the receive/dispatch loop
//!
//! A `ProtocolConnection` exclusively owns the TCP stream and the send-side
//! framer; the sender and receiver state machines embed one and react to
//! packets fed to them by a `PacketPump`.

use std::io::{Read, Write};
use std::net::TcpStream;

use crate::error::TransferError;
use crate::framing::{Advance, FrameReceiver, FrameSender};
use crate::packet::{self, Packet};

pub struct ProtocolConnection {
    stream: TcpStream,
    frame_tx: FrameSender,
    alive: bool,
}

impl ProtocolConnection {
    pub fn new(stream: TcpStream) -> Self {
        ProtocolConnection {
            stream,
            frame_tx: FrameSender::new(),
            alive: true,
        }
    }

    pub fn alive(&self) -> bool {
        self.alive
    }

    /// Marks the connection terminal. No packet is processed afterwards; the
    /// owning loop exits once the in-progress operation finishes.
    pub fn retire(&mut self) {
        self.alive = false;
    }

    pub fn send_packet(&mut self, packet: &Packet<'_>) -> Result<(), TransferError> {
        let frame = self.frame_tx.encode(|out| packet::encode(packet, out))?;
        self.stream.write_all(frame).map_err(|err| {
            if is_disconnect(&err) {
                TransferError::Disconnected
            } else {
                TransferError::Transport(err)
            }
        })
    }

    /// Blocking read into `buf`. A zero-length read is a peer disconnect.
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
        loop {
            match self.stream.read(buf) {
                Ok(0) => return Err(TransferError::Disconnected),
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) if is_disconnect(&err) => return Err(TransferError::Disconnected),
                Err(err) => return Err(TransferError::Transport(err)),
            }
        }
    }
}

fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
    )
}

/// One peer state machine. Responses are sent synchronously from within
/// `handle_packet`, before the next inbound packet is dispatched.
pub trait PacketHandler {
    fn connection(&mut self) -> &mut ProtocolConnection;

    fn handle_packet(&mut self, packet: Packet<'_>) -> Result<(), TransferError>;
}

/// Owns the receive framer and drives a handler: one blocking read, then
/// every whole frame already buffered is decoded and dispatched in order.
pub struct PacketPump {
    frames: FrameReceiver,
}

impl PacketPump {
    pub fn new() -> Self {
        PacketPump {
            frames: FrameReceiver::new(),
        }
    }

    pub fn update(&mut self, handler: &mut impl PacketHandler) -> Result<(), TransferError> {
        let buf = self.frames.receive_buffer();
        let received = handler.connection().receive(buf)?;
        self.frames.commit(received);

        while handler.connection().alive() {
            match self.frames.advance()? {
                Advance::NeedMoreData => break,
                Advance::Frame(payload) => {
                    let packet = packet::decode(payload)?;
                    handler.handle_packet(packet)?;
                }
            }
            self.frames.discard();
        }
        Ok(())
    }
}
