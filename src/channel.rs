use crate::message::IncomingMessage;
use crate::message_type::{MessageType, NUM_MESSAGE_TYPES};
use crate::seq::{SeqNr, SEQ_WINDOW};

/// Per-channel outgoing sequence counters, indexed by raw message type.
///
/// Lives under the send queue mutex so that stamping is atomic with enqueueing: a channel's
///  counter advances exactly once per enqueued message, in enqueue order.
pub struct SendChannels {
    next: Vec<SeqNr>,
}

impl SendChannels {
    pub fn new() -> SendChannels {
        SendChannels {
            next: vec![SeqNr::ZERO; NUM_MESSAGE_TYPES],
        }
    }

    /// Allocates the next sequence number for the type's channel. Types outside sequence
    ///  space (library, plain unreliable) are stamped 0.
    pub fn stamp_outgoing(&mut self, ty: MessageType) -> SeqNr {
        if !ty.uses_sequence_space() {
            return SeqNr::ZERO;
        }

        let slot = &mut self.next[ty.to_raw() as usize];
        let stamped = *slot;
        *slot = stamped.next();
        stamped
    }

    #[cfg(test)]
    pub fn set_next(&mut self, ty: MessageType, seq: SeqNr) {
        self.next[ty.to_raw() as usize] = seq;
    }
}

/// One bit per sequence number, indexed by the raw 16-bit value. Bits are set for messages
///  received ahead of the expected sequence number and cleared again as the window advances
///  past them, so stale bits never survive a wrap.
struct ReceivedBits {
    words: Box<[u64]>,
}

impl ReceivedBits {
    fn new() -> ReceivedBits {
        ReceivedBits {
            words: vec![0u64; (1usize << 16) / 64].into_boxed_slice(),
        }
    }

    fn get(&self, seq: SeqNr) -> bool {
        let raw = seq.to_raw() as usize;
        self.words[raw / 64] & (1u64 << (raw % 64)) != 0
    }

    fn set(&mut self, seq: SeqNr) {
        let raw = seq.to_raw() as usize;
        self.words[raw / 64] |= 1u64 << (raw % 64);
    }

    fn clear(&mut self, seq: SeqNr) {
        let raw = seq.to_raw() as usize;
        self.words[raw / 64] &= !(1u64 << (raw % 64));
    }
}

/// Receive-side window state for one reliable channel, allocated lazily on first use.
struct ReliableChannel {
    next_expected: SeqNr,
    received: ReceivedBits,
    /// messages received ahead of the gap on an ordered channel, sorted by distance from
    ///  `next_expected` so draining pops from the front
    withheld: Vec<IncomingMessage>,
}

impl ReliableChannel {
    fn new() -> ReliableChannel {
        ReliableChannel {
            next_expected: SeqNr::ZERO,
            received: ReceivedBits::new(),
            withheld: Vec::new(),
        }
    }
}

/// Outcome of accepting a reliable message into its channel window.
#[derive(Debug)]
pub enum ReliableOutcome {
    /// exactly the expected sequence number: the message is released, followed by any
    ///  previously withheld messages that became consecutive
    InOrder { release: Vec<IncomingMessage> },
    /// ahead of the gap on an unordered channel: released immediately
    EarlyRelease(IncomingMessage),
    /// ahead of the gap on an ordered channel: buffered until the gap fills
    Withheld,
    /// already received, or behind the acceptance window
    Duplicate,
}

/// Receive-side per-channel state across all delivery methods.
pub struct ReceiveChannels {
    last_sequenced: Vec<SeqNr>,
    reliable: Vec<Option<Box<ReliableChannel>>>,
}

impl ReceiveChannels {
    pub fn new() -> ReceiveChannels {
        ReceiveChannels {
            // initialized one behind zero so the first message (sequence number 0) passes
            //  the strictly-ahead check
            last_sequenced: vec![SeqNr::from_raw(u16::MAX); NUM_MESSAGE_TYPES],
            reliable: (0..NUM_MESSAGE_TYPES).map(|_| None).collect(),
        }
    }

    /// Sequenced acceptance: a message is accepted iff it is strictly ahead of the last
    ///  accepted sequence number on its channel; older and duplicate arrivals are dropped.
    pub fn on_receive_sequenced(&mut self, ty: MessageType, seq: SeqNr) -> bool {
        let slot = &mut self.last_sequenced[ty.to_raw() as usize];
        if seq.is_ahead_of(*slot) {
            *slot = seq;
            true
        }
        else {
            false
        }
    }

    /// Reliable window acceptance per the channel's ordering mode; see `ReliableOutcome`.
    pub fn on_receive_reliable(&mut self, msg: IncomingMessage) -> ReliableOutcome {
        let ordered = msg.msg_type.is_ordered();
        let ch = self.reliable_channel(msg.msg_type);

        let distance = msg.seq_nr.relate(ch.next_expected);
        if distance == 0 {
            ch.next_expected = ch.next_expected.next();

            let mut release = vec![msg];
            loop {
                let seq = ch.next_expected;
                if !ch.received.get(seq) {
                    break;
                }
                ch.received.clear(seq);
                if let Some(pos) = ch.withheld.iter().position(|m| m.seq_nr == seq) {
                    release.push(ch.withheld.remove(pos));
                }
                ch.next_expected = seq.next();
            }
            ReliableOutcome::InOrder { release }
        }
        else if distance < SEQ_WINDOW {
            if ch.received.get(msg.seq_nr) {
                return ReliableOutcome::Duplicate;
            }
            ch.received.set(msg.seq_nr);

            if ordered {
                let pos = ch
                    .withheld
                    .partition_point(|m| m.seq_nr.relate(ch.next_expected) < distance);
                ch.withheld.insert(pos, msg);
                ReliableOutcome::Withheld
            }
            else {
                ReliableOutcome::EarlyRelease(msg)
            }
        }
        else {
            ReliableOutcome::Duplicate
        }
    }

    fn reliable_channel(&mut self, ty: MessageType) -> &mut ReliableChannel {
        self.reliable[ty.to_raw() as usize]
            .get_or_insert_with(|| Box::new(ReliableChannel::new()))
    }

    #[cfg(test)]
    pub fn set_reliable_next_expected(&mut self, ty: MessageType, seq: SeqNr) {
        self.reliable_channel(ty).next_expected = seq;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::net::SocketAddr;

    fn msg(raw_type: u8, seq: u16) -> IncomingMessage {
        IncomingMessage::new(
            MessageType::from_raw(raw_type).unwrap(),
            SeqNr::from_raw(seq),
            SocketAddr::from(([127, 0, 0, 1], 9000)),
            vec![seq as u8],
            8,
            None,
        )
    }

    #[test]
    fn test_stamping_advances_per_channel() {
        let mut channels = SendChannels::new();
        let ordered_0 = MessageType::from_method(crate::message_type::DeliveryMethod::ReliableOrdered, 0).unwrap();
        let ordered_1 = MessageType::from_method(crate::message_type::DeliveryMethod::ReliableOrdered, 1).unwrap();

        assert_eq!(channels.stamp_outgoing(ordered_0), SeqNr::from_raw(0));
        assert_eq!(channels.stamp_outgoing(ordered_0), SeqNr::from_raw(1));
        // a different channel has its own sequence space
        assert_eq!(channels.stamp_outgoing(ordered_1), SeqNr::from_raw(0));
    }

    #[test]
    fn test_stamping_outside_sequence_space() {
        let mut channels = SendChannels::new();

        assert_eq!(channels.stamp_outgoing(MessageType::LIBRARY), SeqNr::ZERO);
        assert_eq!(channels.stamp_outgoing(MessageType::LIBRARY), SeqNr::ZERO);
        let unreliable = MessageType::from_raw(1).unwrap();
        assert_eq!(channels.stamp_outgoing(unreliable), SeqNr::ZERO);
        assert_eq!(channels.stamp_outgoing(unreliable), SeqNr::ZERO);
    }

    #[test]
    fn test_stamping_wraps() {
        let mut channels = SendChannels::new();
        let ty = MessageType::from_raw(67).unwrap();
        channels.next[67] = SeqNr::from_raw(0xffff);

        assert_eq!(channels.stamp_outgoing(ty), SeqNr::from_raw(0xffff));
        assert_eq!(channels.stamp_outgoing(ty), SeqNr::ZERO);
    }

    #[rstest]
    #[case::in_order(vec![1, 2, 3, 4, 5], vec![true, true, true, true, true])]
    #[case::reordered(vec![1, 4, 2, 5, 3], vec![true, true, false, true, false])]
    #[case::duplicates(vec![1, 1, 2, 2], vec![true, false, true, false])]
    fn test_sequenced_acceptance(#[case] arrivals: Vec<u16>, #[case] expected: Vec<bool>) {
        let mut channels = ReceiveChannels::new();
        let ty = MessageType::from_raw(2).unwrap();

        let accepted: Vec<bool> = arrivals
            .iter()
            .map(|&seq| channels.on_receive_sequenced(ty, SeqNr::from_raw(seq)))
            .collect();
        assert_eq!(accepted, expected);
    }

    #[test]
    fn test_sequenced_accepts_first_zero() {
        let mut channels = ReceiveChannels::new();
        let ty = MessageType::from_raw(35).unwrap();
        assert!(channels.on_receive_sequenced(ty, SeqNr::ZERO));
        assert!(!channels.on_receive_sequenced(ty, SeqNr::ZERO));
    }

    fn released_bytes(outcome: ReliableOutcome) -> Vec<u8> {
        match outcome {
            ReliableOutcome::InOrder { release } => release.iter().map(|m| m.data[0]).collect(),
            ReliableOutcome::EarlyRelease(m) => vec![m.data[0]],
            _ => vec![],
        }
    }

    #[test]
    fn test_ordered_reverse_arrival_releases_in_order() {
        let mut channels = ReceiveChannels::new();

        for seq in [4u16, 3, 2, 1] {
            assert!(matches!(channels.on_receive_reliable(msg(67, seq)), ReliableOutcome::Withheld));
        }

        let outcome = channels.on_receive_reliable(msg(67, 0));
        assert_eq!(released_bytes(outcome), vec![0, 1, 2, 3, 4]);
        assert_eq!(channels.reliable_channel(MessageType::from_raw(67).unwrap()).next_expected, SeqNr::from_raw(5));
    }

    #[test]
    fn test_ordered_duplicate_of_withheld() {
        let mut channels = ReceiveChannels::new();

        assert!(matches!(channels.on_receive_reliable(msg(67, 3)), ReliableOutcome::Withheld));
        assert!(matches!(channels.on_receive_reliable(msg(67, 3)), ReliableOutcome::Duplicate));
    }

    #[test]
    fn test_reliable_duplicate_behind_window() {
        let mut channels = ReceiveChannels::new();

        assert_eq!(released_bytes(channels.on_receive_reliable(msg(34, 0))), vec![0]);
        assert!(matches!(channels.on_receive_reliable(msg(34, 0)), ReliableOutcome::Duplicate));
    }

    #[test]
    fn test_unordered_early_release_advances_window() {
        let mut channels = ReceiveChannels::new();

        // ahead of the gap: released immediately, bit remembered
        assert!(matches!(channels.on_receive_reliable(msg(34, 1)), ReliableOutcome::EarlyRelease(_)));
        assert!(matches!(channels.on_receive_reliable(msg(34, 2)), ReliableOutcome::EarlyRelease(_)));

        // filling the gap releases only the gap message but advances past the seen bits
        let outcome = channels.on_receive_reliable(msg(34, 0));
        assert_eq!(released_bytes(outcome), vec![0]);
        assert_eq!(channels.reliable_channel(MessageType::from_raw(34).unwrap()).next_expected, SeqNr::from_raw(3));

        // earlier early-released messages are duplicates now
        assert!(matches!(channels.on_receive_reliable(msg(34, 1)), ReliableOutcome::Duplicate));
    }

    #[test]
    fn test_reliable_wraps_across_sequence_space() {
        let mut channels = ReceiveChannels::new();
        channels.reliable_channel(MessageType::from_raw(67).unwrap()).next_expected = SeqNr::from_raw(0xffff);

        let outcome = channels.on_receive_reliable(msg(67, 0xffff));
        assert_eq!(released_bytes(outcome), vec![0xff]);

        let outcome = channels.on_receive_reliable(msg(67, 0));
        assert_eq!(released_bytes(outcome), vec![0]);
        assert_eq!(channels.reliable_channel(MessageType::from_raw(67).unwrap()).next_expected, SeqNr::from_raw(1));
    }

    #[test]
    fn test_reliable_wrap_with_withholding() {
        let mut channels = ReceiveChannels::new();
        channels.reliable_channel(MessageType::from_raw(67).unwrap()).next_expected = SeqNr::from_raw(0xffff);

        // 0 arrives before the wrap point: withheld as 'ahead'
        assert!(matches!(channels.on_receive_reliable(msg(67, 0)), ReliableOutcome::Withheld));

        let outcome = channels.on_receive_reliable(msg(67, 0xffff));
        assert_eq!(released_bytes(outcome), vec![0xff, 0]);
    }
}
