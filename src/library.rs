use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::message_type::MessageType;
use crate::seq::SeqNr;

/// Subtype of a library message, transmitted as the first payload byte.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LibraryType {
    Connect = 0,
    ConnectResponse = 1,
    ConnectionEstablished = 2,
    Disconnect = 3,
    Ping = 4,
    Pong = 5,
    Acknowledge = 6,
    KeepAlive = 7,
}

impl LibraryType {
    pub fn from_raw(raw: u8) -> anyhow::Result<LibraryType> {
        match raw {
            0 => Ok(LibraryType::Connect),
            1 => Ok(LibraryType::ConnectResponse),
            2 => Ok(LibraryType::ConnectionEstablished),
            3 => Ok(LibraryType::Disconnect),
            4 => Ok(LibraryType::Ping),
            5 => Ok(LibraryType::Pong),
            6 => Ok(LibraryType::Acknowledge),
            7 => Ok(LibraryType::KeepAlive),
            _ => bail!("unknown library message subtype {}", raw),
        }
    }

    pub fn to_raw(&self) -> u8 {
        *self as u8
    }
}

fn ensure_remaining(buf: &impl Buf, n: usize, what: &str) -> anyhow::Result<()> {
    if buf.remaining() < n {
        bail!("truncated {} payload: {} bytes missing", what, n - buf.remaining());
    }
    Ok(())
}

/// `Connect` and `ConnectResponse` both carry the sender's unique id.
#[derive(Debug, PartialEq, Eq)]
pub struct HandshakePayload {
    pub unique_id: u64,
}

impl HandshakePayload {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.unique_id);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<HandshakePayload> {
        ensure_remaining(buf, 8, "handshake")?;
        Ok(HandshakePayload {
            unique_id: buf.get_u64_le(),
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct PingPayload {
    pub ping_id: u8,
}

impl PingPayload {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.ping_id);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PingPayload> {
        ensure_remaining(buf, 1, "ping")?;
        Ok(PingPayload {
            ping_id: buf.get_u8(),
        })
    }
}

/// Echoes a ping's id and adds the responder's local clock so the originator can estimate
///  the clock offset along with the round trip time.
#[derive(Debug, PartialEq)]
pub struct PongPayload {
    pub ping_id: u8,
    pub remote_time_seconds: f64,
}

impl PongPayload {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.ping_id);
        buf.put_f64_le(self.remote_time_seconds);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PongPayload> {
        ensure_remaining(buf, 9, "pong")?;
        Ok(PongPayload {
            ping_id: buf.get_u8(),
            remote_time_seconds: buf.get_f64_le(),
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct DisconnectPayload {
    pub reason: String,
}

impl DisconnectPayload {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_usize_varint(self.reason.len());
        buf.put_slice(self.reason.as_bytes());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<DisconnectPayload> {
        let len = buf
            .try_get_usize_varint()
            .map_err(|_| anyhow!("invalid disconnect reason length prefix"))?;
        ensure_remaining(buf, len, "disconnect")?;
        let mut raw = vec![0u8; len];
        buf.copy_to_slice(&mut raw);
        Ok(DisconnectPayload {
            reason: String::from_utf8(raw).map_err(|_| anyhow!("disconnect reason is not valid UTF-8"))?,
        })
    }
}

/// A batch of acknowledge entries, one per received reliable message. Each entry is three
///  bytes on the wire: the message type byte followed by the sequence number.
#[derive(Debug, PartialEq, Eq)]
pub struct AckPayload {
    pub entries: Vec<(MessageType, SeqNr)>,
}

impl AckPayload {
    pub const ENTRY_LEN: usize = 3;

    pub fn ser(&self, buf: &mut impl BufMut) {
        for (ty, seq) in &self.entries {
            buf.put_u8(ty.to_raw());
            buf.put_u16_le(seq.to_raw());
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AckPayload> {
        if buf.remaining() % Self::ENTRY_LEN != 0 {
            bail!("acknowledge payload length {} is not a multiple of {}", buf.remaining(), Self::ENTRY_LEN);
        }

        let mut entries = Vec::with_capacity(buf.remaining() / Self::ENTRY_LEN);
        while buf.has_remaining() {
            let ty = MessageType::from_raw(buf.get_u8())?;
            let seq = SeqNr::from_raw(buf.get_u16_le());
            entries.push((ty, seq));
        }
        Ok(AckPayload { entries })
    }
}
