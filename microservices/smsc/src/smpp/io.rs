//! PDU framing over a byte stream

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::pdu::{sequence_of, DecodeError, Pdu, HEADER_LEN};
use crate::error::SessionError;

/// One unit read off the wire
#[derive(Debug)]
pub enum Frame {
    Pdu(Pdu),
    /// Correctly framed but undecodable; the stream stays in sync
    Malformed {
        sequence_number: u32,
        error: DecodeError,
    },
}

/// Reads length-prefixed PDUs. A `command_length` outside the accepted
/// range loses framing and ends the stream with `SessionError::Decode`.
pub struct PduReader<R> {
    reader: R,
    buffer: BytesMut,
    max_pdu_size: usize,
}

impl<R: AsyncRead + Unpin> PduReader<R> {
    pub fn new(reader: R, max_pdu_size: usize) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(4096),
            max_pdu_size,
        }
    }

    /// Next frame, `None` on a clean EOF. Cancel safe: bytes already read
    /// stay buffered.
    pub async fn next(&mut self) -> Result<Option<Frame>, SessionError> {
        loop {
            if self.buffer.len() >= 4 {
                let declared = (&self.buffer[..4]).get_u32() as usize;
                if !(HEADER_LEN..=self.max_pdu_size).contains(&declared) {
                    return Err(SessionError::Decode(DecodeError::InvalidLength(declared)));
                }
                if self.buffer.len() >= declared {
                    let data = self.buffer.split_to(declared);
                    let frame = match Pdu::decode_with_limit(&data, self.max_pdu_size) {
                        Ok(pdu) => Frame::Pdu(pdu),
                        Err(error) => Frame::Malformed {
                            sequence_number: sequence_of(&data),
                            error,
                        },
                    };
                    return Ok(Some(frame));
                }
            }

            let n = self.reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Ok(None);
            }
        }
    }

    /// Sequence number of the partial PDU in the buffer, if any
    pub fn pending_sequence(&self) -> u32 {
        sequence_of(&self.buffer)
    }
}

pub async fn write_pdu<W: AsyncWrite + Unpin>(writer: &mut W, pdu: &Pdu) -> std::io::Result<()> {
    writer.write_all(&pdu.encode()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smpp::pdu::Body;

    #[tokio::test]
    async fn test_reads_split_and_coalesced_pdus() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut reader = PduReader::new(server, 1024);

        let first = Pdu::new(1, Body::EnquireLink).encode();
        let second = Pdu::new(2, Body::Unbind).encode();
        client.write_all(&first[..5]).await.unwrap();
        client.write_all(&first[5..]).await.unwrap();
        client.write_all(&second).await.unwrap();
        drop(client);

        let Some(Frame::Pdu(pdu)) = reader.next().await.unwrap() else {
            panic!("expected pdu");
        };
        assert_eq!(pdu.body, Body::EnquireLink);
        let Some(Frame::Pdu(pdu)) = reader.next().await.unwrap() else {
            panic!("expected pdu");
        };
        assert_eq!(pdu.sequence_number, 2);
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_keeps_sync() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut reader = PduReader::new(server, 1024);

        let mut bad = Pdu::new(9, Body::EnquireLink).encode().to_vec();
        bad[4..8].copy_from_slice(&0x0000_0777u32.to_be_bytes());
        client.write_all(&bad).await.unwrap();
        client
            .write_all(&Pdu::new(10, Body::EnquireLink).encode())
            .await
            .unwrap();

        match reader.next().await.unwrap() {
            Some(Frame::Malformed {
                sequence_number,
                error,
            }) => {
                assert_eq!(sequence_number, 9);
                assert!(matches!(error, DecodeError::UnknownCommand { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(reader.next().await.unwrap(), Some(Frame::Pdu(_))));
    }

    #[tokio::test]
    async fn test_header_split_across_reads() {
        let pdu = Pdu::new(3, Body::EnquireLinkResp).encode();
        let stream = tokio_test::io::Builder::new()
            .read(&pdu[..2])
            .read(&pdu[2..9])
            .read(&pdu[9..])
            .build();
        let mut reader = PduReader::new(stream, 1024);
        let Some(Frame::Pdu(read)) = reader.next().await.unwrap() else {
            panic!("expected pdu");
        };
        assert_eq!(read.sequence_number, 3);
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_pdu_emits_encoding() {
        let pdu = Pdu::new(4, Body::Unbind);
        let mut stream = tokio_test::io::Builder::new().write(&pdu.encode()).build();
        write_pdu(&mut stream, &pdu).await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_length_is_fatal() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut reader = PduReader::new(server, 64);
        client.write_all(&1000u32.to_be_bytes()).await.unwrap();
        assert!(matches!(
            reader.next().await,
            Err(SessionError::Decode(DecodeError::InvalidLength(1000)))
        ));
    }
}
