//! SCTP association layer under M3UA
//!
//! RFC 4960 packets (common header, chunks, CRC32c) carried as
//! length-prefixed frames over TCP; kernel SCTP is not required.

mod association;
mod chunks;
pub mod crc32c;
mod transport;

pub use association::{Action, Association, AssociationConfig, AssociationState, Event};
pub use chunks::{chunk_type, Chunk, DataChunk, InitChunk, Packet, SackChunk, SctpHeader};
pub use transport::{read_frame, spawn_reader, write_packet, MAX_FRAME_LEN};

/// Payload protocol identifier M3UA registers with IANA
pub const PPID_M3UA: u32 = 3;
