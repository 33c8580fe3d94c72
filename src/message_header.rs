use anyhow::bail;
use bytes::{Buf, BufMut};

use crate::message_type::MessageType;
use crate::seq::SeqNr;

/// Size of the fragment header following the message header when the fragmentation
///  indicator is set.
pub const FRAGMENT_HEADER_SIZE: usize = 6;

/// Largest payload length (in bits) the 15-bit length field can express; bounds the
///  configurable MTU.
pub const MAX_PAYLOAD_BITS: u16 = 0x7fff;

const FRAGMENT_FLAG: u16 = 0x8000;

/// Identifies one fragment of a larger message: all fragments of the group share the group
///  id, and the index places this fragment's payload within the reassembled whole.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FragmentHeader {
    pub group: u16,
    pub total: u16,
    pub index: u16,
}

impl FragmentHeader {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.group);
        buf.put_u16_le(self.total);
        buf.put_u16_le(self.index);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<FragmentHeader> {
        if buf.remaining() < FRAGMENT_HEADER_SIZE {
            bail!("truncated fragment header");
        }
        Ok(FragmentHeader {
            group: buf.get_u16_le(),
            total: buf.get_u16_le(),
            index: buf.get_u16_le(),
        })
    }
}

/// The per-message framing inside a datagram: type, sequence number and payload length,
///  optionally followed by a fragment header. The high bit of the length field is the
///  fragmentation indicator; the low 15 bits are the payload length in bits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub msg_type: MessageType,
    pub seq_nr: SeqNr,
    pub payload_bits: u16,
    pub fragment: Option<FragmentHeader>,
}

impl MessageHeader {
    pub const SERIALIZED_LEN: usize = 5;

    pub fn payload_len_bytes(&self) -> usize {
        (self.payload_bits as usize + 7) / 8
    }

    /// total encoded length of a message with this header, payload included
    pub fn encoded_len(&self) -> usize {
        Self::SERIALIZED_LEN
            + if self.fragment.is_some() { FRAGMENT_HEADER_SIZE } else { 0 }
            + self.payload_len_bytes()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        debug_assert!(self.payload_bits <= MAX_PAYLOAD_BITS);

        buf.put_u8(self.msg_type.to_raw());
        buf.put_u16_le(self.seq_nr.to_raw());
        match &self.fragment {
            None => {
                buf.put_u16_le(self.payload_bits);
            }
            Some(fragment) => {
                buf.put_u16_le(self.payload_bits | FRAGMENT_FLAG);
                fragment.ser(buf);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MessageHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("truncated message header");
        }

        let msg_type = MessageType::from_raw(buf.get_u8())?;
        let seq_nr = SeqNr::from_raw(buf.get_u16_le());
        let raw_bits = buf.get_u16_le();

        let fragment = if raw_bits & FRAGMENT_FLAG != 0 {
            Some(FragmentHeader::deser(buf)?)
        }
        else {
            None
        };

        Ok(MessageHeader {
            msg_type,
            seq_nr,
            payload_bits: raw_bits & MAX_PAYLOAD_BITS,
            fragment,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::library(0, 0, 0, vec![0, 0,0, 0,0])]
    #[case::unreliable(1, 5, 24, vec![1, 5,0, 24,0])]
    #[case::reliable_ordered(67, 0x1234, 0x7fff, vec![67, 0x34,0x12, 0xff,0x7f])]
    fn test_ser_unfragmented(
        #[case] raw_type: u8,
        #[case] seq: u16,
        #[case] bits: u16,
        #[case] expected: Vec<u8>,
    ) {
        let header = MessageHeader {
            msg_type: MessageType::from_raw(raw_type).unwrap(),
            seq_nr: SeqNr::from_raw(seq),
            payload_bits: bits,
            fragment: None,
        };

        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let mut b: &[u8] = &buf;
        assert_eq!(MessageHeader::deser(&mut b).unwrap(), header);
        assert!(b.is_empty());
    }

    #[test]
    fn test_ser_fragmented() {
        let header = MessageHeader {
            msg_type: MessageType::from_raw(67).unwrap(),
            seq_nr: SeqNr::from_raw(3),
            payload_bits: 16,
            fragment: Some(FragmentHeader { group: 1, total: 3, index: 2 }),
        };

        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        // high bit of the length field marks the fragment, then group/total/index follow
        assert_eq!(buf.as_ref(), &[67, 3, 0, 16, 0x80, 1, 0, 3, 0, 2, 0]);

        let mut b: &[u8] = &buf;
        let deser = MessageHeader::deser(&mut b).unwrap();
        assert_eq!(deser, header);
        assert_eq!(deser.payload_len_bytes(), 2);
    }

    #[rstest]
    #[case(vec![])]
    #[case(vec![1, 0, 0, 8])]
    #[case(vec![67, 0,0, 8,0x80, 1,0, 3,0])]
    fn test_truncated_rejected(#[case] raw: Vec<u8>) {
        let mut b: &[u8] = &raw;
        assert!(MessageHeader::deser(&mut b).is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut b: &[u8] = &[99, 0, 0, 0, 0];
        assert!(MessageHeader::deser(&mut b).is_err());
    }

    #[rstest]
    #[case(0, 0)]
    #[case(1, 1)]
    #[case(8, 1)]
    #[case(9, 2)]
    #[case(16, 2)]
    fn test_payload_len_bytes(#[case] bits: u16, #[case] expected: usize) {
        let header = MessageHeader {
            msg_type: MessageType::LIBRARY,
            seq_nr: SeqNr::ZERO,
            payload_bits: bits,
            fragment: None,
        };
        assert_eq!(header.payload_len_bytes(), expected);
    }
}
