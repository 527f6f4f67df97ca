use crate::protocol::mariadb::constants;
use byteorder::{ByteOrder, LittleEndian};

use std::io;
use std::io::prelude::*;
use std::io::IoSlice;

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Buffering packet writer. Payload bytes are staged through the
/// `std::io::Write` impl and cut into wire packets by [`end_packet`]:
/// one header per 16M-1 chunk, sequence number incremented per chunk.
#[derive(Clone)]
pub struct PacketWriter<W> {
    buf: Vec<u8>,
    seq: u8,
    pub inner_writer: W,
}

impl<W> PacketWriter<W> {
    pub fn new(write: W) -> Self {
        Self {
            buf: Vec::new(),
            seq: 0,
            inner_writer: write,
        }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn set_seq(&mut self, seq: u8) {
        self.seq = seq;
    }

    fn increase_seq(&mut self) {
        self.seq = self.seq.wrapping_add(1);
    }

    pub fn reset_seq(&mut self) {
        self.seq = 0;
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }

    /// Bytes staged but not yet framed. Drives the outbound high-water
    /// backpressure check.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

impl<W> Write for PacketWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = buf.len();
        self.buf.extend_from_slice(buf);
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub async fn end_packet(&mut self) -> io::Result<()> {
        let mut header = [0; constants::PACKET_HEADER_LEN];
        if !self.is_empty() {
            let raw_packet = self.take_buffer();
            // split the raw buffer at the boundary of size MAX_PAYLOAD_LEN
            let chunks = raw_packet.chunks(constants::MAX_PAYLOAD_LEN);
            for chunk in chunks {
                LittleEndian::write_u24(&mut header, chunk.len() as u32);
                header[3] = self.seq();
                self.increase_seq();
                // write out the header and payload.
                //
                // depends on the AsyncWrite provided, this may trigger
                // real system call or not (for examples, if AsyncWrite is buffered stream)
                let written = self
                    .inner_writer
                    .write_vectored(&[IoSlice::new(&header), IoSlice::new(chunk)])
                    .await?;

                // if write buffer is not drained, fall back to write_all
                if written != constants::PACKET_HEADER_LEN + chunk.len() {
                    let remaining: Vec<u8> = header
                        .iter()
                        .chain(chunk.iter())
                        .skip(written)
                        .cloned()
                        .collect();
                    self.inner_writer.write_all(&remaining).await?
                }
            }
            // a payload that ends exactly on the 16M-1 boundary needs an
            // empty terminator packet so the peer knows the chain is over
            if raw_packet.len() % constants::MAX_PAYLOAD_LEN == 0 {
                LittleEndian::write_u24(&mut header, 0);
                header[3] = self.seq();
                self.increase_seq();
                self.inner_writer.write_all(&header).await?;
            }
            Ok(())
        } else {
            // Packet with empty payload. Usually, the payload is not empty. Currently, only the password is empty.
            LittleEndian::write_u24(&mut header, 0);
            header[3] = self.seq();
            let _size = self
                .inner_writer
                .write_vectored(&[IoSlice::new(&header), IoSlice::new(&[])])
                .await?;
            Ok(())
        }
    }

    pub async fn flush_all(&mut self) -> io::Result<()> {
        self.inner_writer.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner_writer.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mariadb::packet::packet;

    #[tokio::test]
    async fn frame_one_command() {
        let mut writer = PacketWriter::new(Vec::new());
        writer.write_all(&[0x0e]).unwrap();
        writer.end_packet().await.unwrap();
        assert_eq!(writer.inner_writer, vec![0x01, 0x00, 0x00, 0x00, 0x0e]);
        assert_eq!(writer.seq(), 1);
    }

    #[tokio::test]
    async fn seq_wraps_and_resumes() {
        let mut writer = PacketWriter::new(Vec::new());
        writer.set_seq(0xff);
        writer.write_all(b"x").unwrap();
        writer.end_packet().await.unwrap();
        assert_eq!(writer.seq(), 0);
    }

    #[tokio::test]
    async fn chunked_at_max_payload() {
        let mut writer = PacketWriter::new(Vec::new());
        let body = vec![0u8; constants::MAX_PAYLOAD_LEN];
        writer.write_all(&body).unwrap();
        writer.end_packet().await.unwrap();
        // exactly 16M-1 bytes must be followed by an empty continuation
        let (rest, (seq, pkt)) = packet(&writer.inner_writer).unwrap();
        assert!(rest.is_empty());
        assert_eq!(seq, 1);
        assert_eq!(pkt.len(), constants::MAX_PAYLOAD_LEN);
    }
}
