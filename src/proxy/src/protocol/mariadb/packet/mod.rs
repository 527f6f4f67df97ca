pub mod packet_reader;
pub mod packet_writer;
pub mod writers;

use crate::protocol::mariadb::constants;
use crate::protocol::mariadb::constants::{CommandCode, HeaderInfo};
use num_traits::FromPrimitive;
use std::ops::Deref;

/// `Packet` is the unit of protocol I/O: one reassembled logical payload.
/// The 4-byte wire header (3-byte little-endian length, 1-byte sequence) is
/// stripped during framing; payloads of exactly 16M-1 bytes are stitched
/// together with their continuation packets before a `Packet` is surfaced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet(Vec<u8>);

impl Packet {
    pub fn from_vec(vec: Vec<u8>) -> Self {
        Packet(vec)
    }

    fn extend(&mut self, bytes: &[u8]) {
        self.0.extend(bytes);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    /// Command code of a client command packet, if the first payload byte
    /// is a known code.
    pub fn command(&self) -> Option<CommandCode> {
        self.0.first().and_then(|b| CommandCode::from_u8(*b))
    }

    /// See [MySQL EOF_Packet](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_eof_packet.html)
    pub fn is_eof_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::EOFHeader as u8) && self.0.len() <= 5
    }

    /// OK packet carrying the 0xfe header that terminates a result set when
    /// CLIENT_DEPRECATE_EOF is negotiated. Distinguished from a real EOF by
    /// its length.
    pub fn is_result_set_eof_packet(&self) -> bool {
        !self.0.is_empty()
            && self.0[0] == (HeaderInfo::EOFHeader as u8)
            && (7..0xFFFFFF).contains(&self.0.len())
    }

    pub fn is_ok_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::OKHeader as u8)
    }

    pub fn is_err_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::ErrHeader as u8)
    }

    pub fn is_local_in_file_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::LocalInFileHeader as u8)
    }

    /// AuthSwitchRequest shares the 0xfe header with EOF but always carries
    /// a plugin name, so it is longer than an EOF packet.
    pub fn is_auth_switch_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::EOFHeader as u8) && self.0.len() > 5
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsMut<[u8]> for Packet {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl Deref for Packet {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        self.as_ref()
    }
}

#[inline]
pub fn full_packet(i: &[u8]) -> nom::IResult<&[u8], (u8, &[u8])> {
    let (i, _) = nom::bytes::complete::tag(&[0xff, 0xff, 0xff])(i)?;
    let (i, seq) = nom::bytes::complete::take(1u8)(i)?;
    let (i, bytes) = nom::bytes::complete::take(constants::MAX_PAYLOAD_LEN)(i)?;
    Ok((i, (seq[0], bytes)))
}

#[inline]
pub fn one_packet(i: &[u8]) -> nom::IResult<&[u8], (u8, &[u8])> {
    let (i, length) = nom::number::complete::le_u24(i)?;
    let (i, seq) = nom::bytes::complete::take(1u8)(i)?;
    let (i, bytes) = nom::bytes::complete::take(length)(i)?;
    Ok((i, (seq[0], bytes)))
}

/// Parse one logical packet, reassembling the 16M-1 continuation chain.
/// A short input yields `Incomplete`, never an error; the caller keeps the
/// partial bytes and retries once more data arrives.
pub fn packet(i: &[u8]) -> nom::IResult<&[u8], (u8, Packet)> {
    nom::combinator::map(
        nom::sequence::pair(
            nom::multi::fold_many0(
                full_packet,
                || (0, None),
                |(seq, pkt): (_, Option<Packet>), (nseq, p)| {
                    let pkt = if let Some(mut pkt) = pkt {
                        assert_eq!(nseq, seq + 1);
                        pkt.extend(p);
                        Some(pkt)
                    } else {
                        Some(Packet(Vec::from(p)))
                    };
                    (nseq, pkt)
                },
            ),
            one_packet,
        ),
        move |(full, last)| {
            let seq = last.0;
            let pkt = if let Some(mut pkt) = full.1 {
                assert_eq!(last.0, full.0 + 1);
                pkt.extend(last.1);
                pkt
            } else {
                Packet(Vec::from(last.1))
            };
            (seq, pkt)
        },
    )(i)
}

#[cfg(test)]
mod tests {
    use crate::protocol::mariadb::packet::*;

    #[test]
    fn test_one_ping() {
        let one_pkg_rs = one_packet(&[0x01, 0, 0, 0, 0x0e]);
        assert!(one_pkg_rs.is_ok());
        let pkg = one_pkg_rs.unwrap().1;
        assert_eq!(pkg.1, &[0x0e]);
    }

    #[test]
    fn test_ping() {
        let p = packet(&[0x01, 0, 0, 0, 0x0e]).unwrap().1;
        assert_eq!(p.0, 0);
        assert_eq!(&*p.1, &[0x0e][..]);
        assert_eq!(p.1.command(), Some(CommandCode::ComPing));
    }

    #[test]
    fn test_short_input_is_incomplete() {
        // three header bytes only: the framing must ask for more, not fail
        let rs = packet(&[0x05, 0x00, 0x00]);
        assert!(matches!(rs, Err(nom::Err::Incomplete(_)) | Err(nom::Err::Error(_))));
    }

    #[test]
    fn test_long_exact() {
        let mut data = vec![0xff, 0xff, 0xff, 0];
        data.extend(&[0; constants::MAX_PAYLOAD_LEN][..]);
        data.push(0x00);
        data.push(0x00);
        data.push(0x00);
        data.push(1);

        let mut payload_slice = [0x00; 4];
        payload_slice.clone_from_slice(&data[0..4]);
        let payload_len = u32::from_le_bytes(payload_slice);
        assert_eq!(payload_len as usize, constants::MAX_PAYLOAD_LEN);
        let (rest, p) = packet(&data[..]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(p.0, 1);
        assert_eq!(p.1.len(), constants::MAX_PAYLOAD_LEN);
    }

    #[test]
    fn test_long_more() {
        let mut data = vec![0xff, 0xff, 0xff, 0];
        data.extend(&[0; constants::MAX_PAYLOAD_LEN][..]);
        data.push(0x01);
        data.push(0x00);
        data.push(0x00);
        data.push(1);
        data.push(0x10);

        let (rest, p) = packet(&data[..]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(p.0, 1);
        assert_eq!(p.1.len(), constants::MAX_PAYLOAD_LEN + 1);
        assert_eq!(
            &p.1[..constants::MAX_PAYLOAD_LEN],
            &[0; constants::MAX_PAYLOAD_LEN][..]
        );
        assert_eq!(&p.1[constants::MAX_PAYLOAD_LEN..], &[0x10]);
    }

    #[test]
    fn test_eof_vs_auth_switch() {
        let eof = Packet::from_vec(vec![0xfe, 0x00, 0x00, 0x02, 0x00]);
        assert!(eof.is_eof_packet());
        assert!(!eof.is_auth_switch_packet());

        let mut switch = vec![0xfe];
        switch.extend(b"mysql_native_password\0");
        switch.extend([0u8; 21]);
        let switch = Packet::from_vec(switch);
        assert!(switch.is_auth_switch_packet());
        assert!(!switch.is_eof_packet());
    }
}
