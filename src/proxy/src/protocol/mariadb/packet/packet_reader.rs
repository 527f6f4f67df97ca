use crate::protocol::mariadb::constants::MAX_PAYLOAD_LEN;
use crate::protocol::mariadb::packet::{packet, Packet};

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK_SIZE: usize = 4096;
const READ_LARGE_CHUNK_SIZE: usize = 1048576;

#[macro_export]
macro_rules! async_packet_read {
    ($reader: expr) => {{
        use tracing::warn;
        let rs = $reader.next_async().await;
        if rs.is_err() {
            warn!("ProxySrv read pkg err = {:?}", rs);
        }
        rs?.ok_or_else(|| {
            warn!("ProxySrv pkg is none");
            std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "connection disconnect.",
            )
        })?
    }};
}

/// Wire length of the next complete frame chain in `bytes`: one packet plus
/// any 16M-1 continuation frames, ending at the first frame shorter than the
/// maximum. `None` means more bytes are needed — never an error.
fn chain_len(bytes: &[u8]) -> Option<usize> {
    let mut at = 0usize;
    loop {
        let header = bytes.get(at..at + 4)?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        if bytes.len() < at + 4 + len {
            return None;
        }
        at += 4 + len;
        if len < MAX_PAYLOAD_LEN {
            return Some(at);
        }
    }
}

/// [`PacketReader`] turns a byte stream into whole logical [`Packet`]s.
///
/// Wire bytes accumulate in an internal buffer until a complete frame chain
/// has arrived; only then is it reassembled into one logical packet. A short
/// read is never an error: the partial bytes simply wait for the next read.
pub struct PacketReader<R> {
    /// Buffered wire bytes; everything before `pos` has been handed out.
    buf: Vec<u8>,
    pos: usize,
    pub r: R,
}

impl<R> PacketReader<R> {
    pub fn new(r: R) -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            r,
        }
    }

    /// Unparsed bytes currently buffered.
    fn pending(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Cut one reassembled packet out of the buffer, if its whole frame
    /// chain has arrived. `Ok(None)` means "need more bytes".
    fn take_buffered(&mut self) -> io::Result<Option<(u8, Packet)>> {
        let buffered = &self.buf[self.pos..];
        let Some(total) = chain_len(buffered) else {
            return Ok(None);
        };
        match packet(&buffered[..total]) {
            Ok((_, framed)) => {
                self.pos += total;
                Ok(Some(framed))
            }
            Err(e) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed packet frame: {e:?}"),
            )),
        }
    }
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    /// Next logical packet, or `None` on a clean end of stream. A stream
    /// that ends in the middle of a packet is a protocol violation.
    pub async fn next_async(&mut self) -> io::Result<Option<(u8, Packet)>> {
        let mut chunk = READ_CHUNK_SIZE;
        loop {
            if let Some(framed) = self.take_buffered()? {
                return Ok(Some(framed));
            }
            // reclaim the consumed prefix before growing the buffer
            if self.pos > 0 {
                self.buf.drain(..self.pos);
                self.pos = 0;
            }
            self.buf.reserve(chunk);
            // once a packet spans reads, pull larger chunks
            chunk = READ_LARGE_CHUNK_SIZE;
            let read = self.r.read_buf(&mut self.buf).await?;
            if read == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{} unhandled bytes", self.pending()),
                    ))
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn read_two_packets_from_one_buffer() {
        // COM_PING followed by COM_STATISTICS, back to back
        let bytes = &[0x01, 0x00, 0x00, 0x00, 0x0e, 0x01, 0x00, 0x00, 0x00, 0x09];
        let mut reader = PacketReader::new(&bytes[..]);
        let (seq1, p1) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(seq1, 0);
        assert_eq!(&*p1, &[0x0e]);
        let (seq2, p2) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(seq2, 0);
        assert_eq!(&*p2, &[0x09]);
        assert!(reader.next_async().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn short_reads_accumulate() {
        let (mut tx, rx) = tokio::io::duplex(16);
        let mut reader = PacketReader::new(rx);
        let writer = tokio::spawn(async move {
            // header first, payload later: the reader must wait, not fail
            tx.write_all(&[0x05, 0x00, 0x00, 0x00]).await.unwrap();
            tokio::task::yield_now().await;
            tx.write_all(b"hello").await.unwrap();
        });
        let (seq, pkt) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(seq, 0);
        assert_eq!(&*pkt, b"hello");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn continuation_chain_is_one_logical_packet() {
        let mut bytes = vec![0xff, 0xff, 0xff, 0x00];
        bytes.extend(std::iter::repeat(0u8).take(MAX_PAYLOAD_LEN));
        bytes.extend([0x01, 0x00, 0x00, 0x01, 0x2a]);
        let mut reader = PacketReader::new(&bytes[..]);
        let (seq, pkt) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(seq, 1);
        assert_eq!(pkt.len(), MAX_PAYLOAD_LEN + 1);
        assert_eq!(pkt[MAX_PAYLOAD_LEN], 0x2a);
    }

    #[tokio::test]
    async fn max_sized_payload_waits_for_empty_terminator() {
        // exactly 16M-1 bytes: the chain stays open until the empty
        // continuation arrives
        let mut bytes = vec![0xff, 0xff, 0xff, 0x00];
        bytes.extend(std::iter::repeat(0u8).take(MAX_PAYLOAD_LEN));
        assert_eq!(chain_len(&bytes), None);
        bytes.extend([0x00, 0x00, 0x00, 0x01]);
        assert_eq!(chain_len(&bytes), Some(bytes.len()));

        let mut reader = PacketReader::new(&bytes[..]);
        let (seq, pkt) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(seq, 1);
        assert_eq!(pkt.len(), MAX_PAYLOAD_LEN);
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let bytes = &[0x05, 0x00, 0x00, 0x00, 0x03]; // declares 5 bytes, carries 1
        let mut reader = PacketReader::new(&bytes[..]);
        let err = reader.next_async().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
