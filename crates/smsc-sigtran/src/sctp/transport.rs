//! SCTP-over-TCP framing
//!
//! Each packet is preceded by its length as a big-endian u32.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::chunks::{Packet, SctpHeader};
use crate::errors::SctpError;

/// Largest packet accepted from a peer
pub const MAX_FRAME_LEN: usize = 65_536;

pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), SctpError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = packet.encode();
    let mut frame = BytesMut::with_capacity(4 + encoded.len());
    frame.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
    frame.extend_from_slice(&encoded);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `None` on a clean end of stream
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>, SctpError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if !(SctpHeader::SIZE..=MAX_FRAME_LEN).contains(&len) {
        return Err(SctpError::Malformed(format!("frame length {}", len)));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(Some(Bytes::from(frame)))
}

/// Read packets on a dedicated task so the owner can `select!` on the channel.
///
/// A packet that fails to decode is reported and reading continues; the
/// channel closes on end of stream or on an I/O error.
pub fn spawn_reader<R>(mut reader: R) -> (mpsc::Receiver<Result<Packet, SctpError>>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);
    let handle = tokio::spawn(async move {
        loop {
            let item = match read_frame(&mut reader).await {
                Ok(Some(frame)) => Packet::decode(frame),
                Ok(None) => {
                    debug!("Peer closed the stream");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Frame read failed");
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            };
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });
    (rx, handle)
}
