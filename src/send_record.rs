use std::cmp::min;
use std::sync::Arc;
use std::time::Duration;

use crate::message::OutgoingMessage;
use crate::message_header::{FragmentHeader, MessageHeader};
use crate::message_type::MessageType;
use crate::seq::SeqNr;

const RESEND_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// One planned or in-flight transmission of an outgoing message.
///
/// Fragmented messages produce one record per fragment; all of them share the underlying
///  message buffer and differ in their fragment index (and sequence number). A fragment
///  group id of 0 means the message is not fragmented.
#[derive(Debug)]
pub struct SendingRecord {
    pub message: Arc<OutgoingMessage>,
    pub msg_type: MessageType,
    pub seq_nr: SeqNr,
    pub fragment_group: u16,
    pub fragment_index: u16,
    pub fragment_total: u16,
    pub fragment_size: u16,
    pub num_sends: u32,
    pub next_resend: Duration,
}

impl SendingRecord {
    pub fn new(message: Arc<OutgoingMessage>, msg_type: MessageType, seq_nr: SeqNr) -> SendingRecord {
        SendingRecord {
            message,
            msg_type,
            seq_nr,
            fragment_group: 0,
            fragment_index: 0,
            fragment_total: 0,
            fragment_size: 0,
            num_sends: 0,
            next_resend: Duration::ZERO,
        }
    }

    pub fn new_fragment(
        message: Arc<OutgoingMessage>,
        msg_type: MessageType,
        seq_nr: SeqNr,
        group: u16,
        index: u16,
        total: u16,
        fragment_size: u16,
    ) -> SendingRecord {
        SendingRecord {
            message,
            msg_type,
            seq_nr,
            fragment_group: group,
            fragment_index: index,
            fragment_total: total,
            fragment_size,
            num_sends: 0,
            next_resend: Duration::ZERO,
        }
    }

    pub fn is_fragment(&self) -> bool {
        self.fragment_group != 0
    }

    /// the slice of the message this record puts on the wire
    pub fn payload(&self) -> &[u8] {
        let data = self.message.data();
        if !self.is_fragment() {
            return data;
        }

        let start = self.fragment_index as usize * self.fragment_size as usize;
        let end = min(data.len(), start + self.fragment_size as usize);
        &data[start..end]
    }

    pub fn header(&self) -> MessageHeader {
        let fragment = if self.is_fragment() {
            Some(FragmentHeader {
                group: self.fragment_group,
                total: self.fragment_total,
                index: self.fragment_index,
            })
        }
        else {
            None
        };

        MessageHeader {
            msg_type: self.msg_type,
            seq_nr: self.seq_nr,
            payload_bits: (self.payload().len() * 8) as u16,
            fragment,
        }
    }

    /// total encoded length on the wire, headers included
    pub fn encoded_len(&self) -> usize {
        self.header().encoded_len()
    }

    /// Schedule the next retransmission: exponential backoff on top of the connection's
    ///  current round trip estimate, capped so a dead link does not push deadlines out
    ///  indefinitely.
    pub fn set_next_resend(&mut self, now: Duration, avg_rtt: Duration) {
        let base = avg_rtt * 2 + Duration::from_millis(25);
        let exponent = min(self.num_sends.saturating_sub(1), 7);
        self.next_resend = now + min(base * (1u32 << exponent), RESEND_BACKOFF_CAP);
    }
}
