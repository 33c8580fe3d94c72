use anyhow::bail;
use std::fmt::{Display, Formatter};

/// Number of independent sequence channels per sequenced / ordered delivery method. This is
///  a protocol constant rather than configuration: the wire encoding of message types bakes
///  the channel ranges in, so changing it breaks interoperability.
pub const CHANNELS_PER_METHOD: u8 = 32;

/// Total number of distinct message type values on the wire; also the size of the
///  per-channel state arrays (which are indexed by raw message type).
pub const NUM_MESSAGE_TYPES: usize = 99;

/// The delivery guarantee requested for an outgoing message.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DeliveryMethod {
    /// fire and forget
    Unreliable,
    /// fire and forget, late arrivals are dropped
    UnreliableSequenced,
    /// guaranteed delivery, any order
    ReliableUnordered,
    /// guaranteed delivery of the *latest* message, late arrivals are dropped
    ReliableSequenced,
    /// guaranteed delivery in send order
    ReliableOrdered,
}

/// A message's type byte on the wire, encoding delivery method and sequence channel in a
///  single value.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct MessageType(u8);

impl MessageType {
    /// internal protocol traffic (handshake, acks, ping, ...)
    pub const LIBRARY: MessageType = MessageType(0);

    const USER_UNRELIABLE: u8 = 1;
    const USER_SEQUENCED_BASE: u8 = 2;
    const USER_RELIABLE_UNORDERED: u8 = 34;
    const USER_RELIABLE_SEQUENCED_BASE: u8 = 35;
    const USER_RELIABLE_ORDERED_BASE: u8 = 67;

    pub fn from_method(method: DeliveryMethod, channel: u8) -> anyhow::Result<MessageType> {
        match method {
            DeliveryMethod::Unreliable | DeliveryMethod::ReliableUnordered => {
                if channel != 0 {
                    bail!("delivery method {:?} has a single sequence channel, requested channel {}", method, channel);
                }
            }
            _ => {
                if channel >= CHANNELS_PER_METHOD {
                    bail!("sequence channel {} is out of range, must be below {}", channel, CHANNELS_PER_METHOD);
                }
            }
        }

        let raw = match method {
            DeliveryMethod::Unreliable => Self::USER_UNRELIABLE,
            DeliveryMethod::UnreliableSequenced => Self::USER_SEQUENCED_BASE + channel,
            DeliveryMethod::ReliableUnordered => Self::USER_RELIABLE_UNORDERED,
            DeliveryMethod::ReliableSequenced => Self::USER_RELIABLE_SEQUENCED_BASE + channel,
            DeliveryMethod::ReliableOrdered => Self::USER_RELIABLE_ORDERED_BASE + channel,
        };
        Ok(MessageType(raw))
    }

    pub fn from_raw(raw: u8) -> anyhow::Result<MessageType> {
        if raw as usize >= NUM_MESSAGE_TYPES {
            bail!("message type {} is outside the protocol's value range", raw);
        }
        Ok(MessageType(raw))
    }

    pub fn to_raw(&self) -> u8 {
        self.0
    }

    pub fn delivery_method(&self) -> Option<DeliveryMethod> {
        match self.0 {
            0 => None,
            Self::USER_UNRELIABLE => Some(DeliveryMethod::Unreliable),
            Self::USER_SEQUENCED_BASE..=33 => Some(DeliveryMethod::UnreliableSequenced),
            Self::USER_RELIABLE_UNORDERED => Some(DeliveryMethod::ReliableUnordered),
            Self::USER_RELIABLE_SEQUENCED_BASE..=66 => Some(DeliveryMethod::ReliableSequenced),
            _ => Some(DeliveryMethod::ReliableOrdered),
        }
    }

    pub fn channel(&self) -> u8 {
        match self.0 {
            Self::USER_SEQUENCED_BASE..=33 => self.0 - Self::USER_SEQUENCED_BASE,
            Self::USER_RELIABLE_SEQUENCED_BASE..=66 => self.0 - Self::USER_RELIABLE_SEQUENCED_BASE,
            Self::USER_RELIABLE_ORDERED_BASE..=98 => self.0 - Self::USER_RELIABLE_ORDERED_BASE,
            _ => 0,
        }
    }

    pub fn is_library(&self) -> bool {
        self.0 == 0
    }

    /// reliable messages are acknowledged and retransmitted
    pub fn is_reliable(&self) -> bool {
        self.0 >= Self::USER_RELIABLE_UNORDERED
    }

    /// sequenced messages drop late arrivals, keeping only the most advanced sequence number
    pub fn is_sequenced(&self) -> bool {
        matches!(self.0, Self::USER_SEQUENCED_BASE..=33 | Self::USER_RELIABLE_SEQUENCED_BASE..=66)
    }

    pub fn is_ordered(&self) -> bool {
        self.0 >= Self::USER_RELIABLE_ORDERED_BASE
    }

    /// whether stamping a message of this type consumes sequence number space
    pub fn uses_sequence_space(&self) -> bool {
        self.is_sequenced() || self.is_reliable()
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.delivery_method() {
            None => write!(f, "Library"),
            Some(m) => write!(f, "{:?}({})", m, self.channel()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(DeliveryMethod::Unreliable, 0, 1)]
    #[case(DeliveryMethod::UnreliableSequenced, 0, 2)]
    #[case(DeliveryMethod::UnreliableSequenced, 31, 33)]
    #[case(DeliveryMethod::ReliableUnordered, 0, 34)]
    #[case(DeliveryMethod::ReliableSequenced, 0, 35)]
    #[case(DeliveryMethod::ReliableSequenced, 31, 66)]
    #[case(DeliveryMethod::ReliableOrdered, 0, 67)]
    #[case(DeliveryMethod::ReliableOrdered, 5, 72)]
    #[case(DeliveryMethod::ReliableOrdered, 31, 98)]
    fn test_encode(#[case] method: DeliveryMethod, #[case] channel: u8, #[case] expected_raw: u8) {
        let ty = MessageType::from_method(method, channel).unwrap();
        assert_eq!(ty.to_raw(), expected_raw);
        assert_eq!(ty.delivery_method(), Some(method));
        assert_eq!(ty.channel(), channel);
    }

    #[rstest]
    #[case(DeliveryMethod::Unreliable, 1)]
    #[case(DeliveryMethod::ReliableUnordered, 7)]
    #[case(DeliveryMethod::UnreliableSequenced, 32)]
    #[case(DeliveryMethod::ReliableOrdered, 200)]
    fn test_invalid_channel(#[case] method: DeliveryMethod, #[case] channel: u8) {
        assert!(MessageType::from_method(method, channel).is_err());
    }

    #[test]
    fn test_from_raw_range() {
        assert!(MessageType::from_raw(98).is_ok());
        assert!(MessageType::from_raw(99).is_err());
        assert!(MessageType::from_raw(255).is_err());
    }

    #[rstest]
    #[case(0, false, false, false)]
    #[case(1, false, false, false)]
    #[case(2, false, true, false)]
    #[case(33, false, true, false)]
    #[case(34, true, false, false)]
    #[case(35, true, true, false)]
    #[case(66, true, true, false)]
    #[case(67, true, false, true)]
    #[case(98, true, false, true)]
    fn test_classification(
        #[case] raw: u8,
        #[case] reliable: bool,
        #[case] sequenced: bool,
        #[case] ordered: bool,
    ) {
        let ty = MessageType::from_raw(raw).unwrap();
        assert_eq!(ty.is_reliable(), reliable);
        assert_eq!(ty.is_sequenced(), sequenced);
        assert_eq!(ty.is_ordered(), ordered);
    }
}
