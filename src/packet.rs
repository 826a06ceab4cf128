//! Packet codec: the seven typed messages carried inside frames
//!
//! Layout is big-endian throughout. The u16 tag leads the frame payload;
//! paths and chunk data occupy the remainder of the frame and are not
//! length-prefixed.

use crate::error::TransferError;
use crate::protocol::tag;

#[derive(Debug, PartialEq, Eq)]
pub enum Packet<'a> {
    ReceiverHello,
    SenderHello,
    Acknowledged { accepted: bool },
    CreateDirectory { path: &'a str },
    CreateFile { size: u64, flags: u16, path: &'a str },
    FileChunk { data: &'a [u8] },
    VerifyFile { hash: u64 },
}

impl Packet<'_> {
    /// Name used in protocol-violation log messages.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::ReceiverHello => "ReceiverHello",
            Packet::SenderHello => "SenderHello",
            Packet::Acknowledged { .. } => "Acknowledged",
            Packet::CreateDirectory { .. } => "CreateDirectory",
            Packet::CreateFile { .. } => "CreateFile",
            Packet::FileChunk { .. } => "FileChunk",
            Packet::VerifyFile { .. } => "VerifyFile",
        }
    }
}

pub fn encode(packet: &Packet<'_>, out: &mut Vec<u8>) {
    match packet {
        Packet::ReceiverHello => {
            out.extend_from_slice(&tag::RECEIVER_HELLO.to_be_bytes());
        }
        Packet::SenderHello => {
            out.extend_from_slice(&tag::SENDER_HELLO.to_be_bytes());
        }
        Packet::Acknowledged { accepted } => {
            out.extend_from_slice(&tag::ACKNOWLEDGED.to_be_bytes());
            out.push(u8::from(*accepted));
        }
        Packet::CreateDirectory { path } => {
            out.extend_from_slice(&tag::CREATE_DIRECTORY.to_be_bytes());
            out.extend_from_slice(path.as_bytes());
        }
        Packet::CreateFile { size, flags, path } => {
            out.extend_from_slice(&tag::CREATE_FILE.to_be_bytes());
            out.extend_from_slice(&size.to_be_bytes());
            out.extend_from_slice(&flags.to_be_bytes());
            out.extend_from_slice(path.as_bytes());
        }
        Packet::FileChunk { data } => {
            out.extend_from_slice(&tag::FILE_CHUNK.to_be_bytes());
            out.extend_from_slice(data);
        }
        Packet::VerifyFile { hash } => {
            out.extend_from_slice(&tag::VERIFY_FILE.to_be_bytes());
            out.extend_from_slice(&hash.to_be_bytes());
        }
    }
}

pub fn decode(payload: &[u8]) -> Result<Packet<'_>, TransferError> {
    let mut reader = Reader::new(payload);
    let packet_id = reader
        .u16()
        .ok_or_else(|| TransferError::malformed("failed to read packet id"))?;

    let packet = match packet_id {
        tag::RECEIVER_HELLO => Packet::ReceiverHello,
        tag::SENDER_HELLO => Packet::SenderHello,
        tag::ACKNOWLEDGED => {
            let accepted = reader
                .u8()
                .ok_or_else(|| TransferError::malformed("truncated Acknowledged packet"))?;
            Packet::Acknowledged {
                accepted: accepted != 0,
            }
        }
        tag::CREATE_DIRECTORY => Packet::CreateDirectory {
            path: reader.rest_str()?,
        },
        tag::CREATE_FILE => {
            let size = reader
                .u64()
                .ok_or_else(|| TransferError::malformed("truncated CreateFile size"))?;
            let flags = reader
                .u16()
                .ok_or_else(|| TransferError::malformed("truncated CreateFile flags"))?;
            Packet::CreateFile {
                size,
                flags,
                path: reader.rest_str()?,
            }
        }
        tag::FILE_CHUNK => Packet::FileChunk {
            data: reader.rest(),
        },
        tag::VERIFY_FILE => {
            let hash = reader
                .u64()
                .ok_or_else(|| TransferError::malformed("truncated VerifyFile packet"))?;
            Packet::VerifyFile { hash }
        }
        other => {
            return Err(TransferError::Malformed(format!("invalid packet id {other}")));
        }
    };

    if !reader.is_empty() {
        return Err(TransferError::malformed("packet not fully consumed"));
    }
    Ok(packet)
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() < n {
            return None;
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes(b.try_into().unwrap()))
    }

    fn u64(&mut self) -> Option<u64> {
        self.take(8).map(|b| u64::from_be_bytes(b.try_into().unwrap()))
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    fn rest_str(&mut self) -> Result<&'a str, TransferError> {
        std::str::from_utf8(self.rest())
            .map_err(|_| TransferError::malformed("path is not valid UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(packet: Packet<'_>) {
        let mut bytes = Vec::new();
        encode(&packet, &mut bytes);
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn every_packet_kind_round_trips() {
        round_trip(Packet::ReceiverHello);
        round_trip(Packet::SenderHello);
        round_trip(Packet::Acknowledged { accepted: true });
        round_trip(Packet::Acknowledged { accepted: false });
        round_trip(Packet::CreateDirectory { path: "docs/api" });
        round_trip(Packet::CreateFile {
            size: 5,
            flags: 0,
            path: "a.txt",
        });
        round_trip(Packet::CreateFile {
            size: u64::MAX,
            flags: crate::protocol::file_flags::COMPRESSED,
            path: "big.bin",
        });
        round_trip(Packet::FileChunk { data: b"hello" });
        round_trip(Packet::FileChunk { data: &[] });
        round_trip(Packet::VerifyFile {
            hash: 0xdead_beef_cafe_f00d,
        });
    }

    #[test]
    fn create_file_wire_layout() {
        let mut bytes = Vec::new();
        encode(
            &Packet::CreateFile {
                size: 5,
                flags: 0,
                path: "a.txt",
            },
            &mut bytes,
        );
        let mut expected = vec![0x00, 0x05];
        expected.extend_from_slice(&5u64.to_be_bytes());
        expected.extend_from_slice(&0u16.to_be_bytes());
        expected.extend_from_slice(b"a.txt");
        assert_eq!(bytes, expected);
    }

    #[test]
    fn unknown_and_reserved_tags_fail() {
        assert!(matches!(
            decode(&[0x00, 0x00]),
            Err(TransferError::Malformed(_))
        ));
        assert!(matches!(
            decode(&[0x00, 0x08]),
            Err(TransferError::Malformed(_))
        ));
        assert!(matches!(
            decode(&[0xff, 0xff, 0x01]),
            Err(TransferError::Malformed(_))
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        // SenderHello with one extra byte.
        assert!(matches!(
            decode(&[0x00, 0x02, 0x00]),
            Err(TransferError::Malformed(_))
        ));
        // VerifyFile with nine payload bytes.
        let mut bytes = vec![0x00, 0x07];
        bytes.extend_from_slice(&1u64.to_be_bytes());
        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(TransferError::Malformed(_))));
    }

    #[test]
    fn truncated_fields_are_rejected() {
        assert!(decode(&[0x00]).is_err());
        assert!(decode(&[0x00, 0x03]).is_err());
        let mut bytes = vec![0x00, 0x05];
        bytes.extend_from_slice(&[0u8; 4]);
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn invalid_utf8_path_is_rejected() {
        let mut bytes = vec![0x00, 0x04];
        bytes.extend_from_slice(&[0xff, 0xfe]);
        assert!(matches!(decode(&bytes), Err(TransferError::Malformed(_))));
    }

    #[test]
    fn acknowledged_nonzero_means_accepted() {
        assert_eq!(
            decode(&[0x00, 0x03, 0x7f]).unwrap(),
            Packet::Acknowledged { accepted: true }
        );
    }
}
