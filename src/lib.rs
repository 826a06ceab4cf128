//! Sling
//!
//! Point-to-point file transfer over a single TCP connection: the sender
//! pushes files and directories, the receiver materializes them under a
//! receive root, each file integrity-checked end to end and optionally
//! zstd-compressed in transit.

pub mod compress;
pub mod config;
pub mod connection;
pub mod error;
pub mod framing;
pub mod listing;
pub mod packet;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod tracker;
