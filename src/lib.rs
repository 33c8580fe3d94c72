//! A reliability and ordering layer on top of UDP. It turns best-effort datagrams into a
//!  bidirectional message channel between two endpoints, letting the application pick a
//!  delivery guarantee per message instead of inheriting TCP's one-size-fits-all semantics.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data as
//!   opposed to streams of bytes)
//! * Per-message choice among several delivery semantics:
//!   * `Unreliable` - fire and forget
//!   * `UnreliableSequenced` - fire and forget, but late arrivals are dropped
//!   * `ReliableUnordered` - guaranteed delivery, any order
//!   * `ReliableSequenced` - guaranteed *latest* delivery, late arrivals are dropped
//!   * `ReliableOrdered` - guaranteed delivery in send order
//! * Sequenced and ordered guarantees are scoped to *sequence channels* (32 per delivery
//!   method), so unrelated message flows never block each other - this is the whole point
//!   of not using TCP: no head-of-line blocking across channels
//! * Messages bigger than a single datagram are fragmented and reassembled by the protocol
//! * Small messages are coalesced into a single datagram where possible
//! * Connections are explicit: a handshake establishes them, keepalives and timeouts tear
//!   them down, and an optional approval hook lets the application accept or deny inbound
//!   connection attempts
//! * Outbound bandwidth is bounded by a token-bucket style throttle
//! * The protocol engine itself is synchronous and non-blocking; a single network task owns
//!   all per-connection protocol state and drives it at a fixed heartbeat cadence
//!
//! Explicitly *not* provided: encryption, authentication, NAT traversal, routing, or any
//!  congestion control beyond the send throttle.
//!
//! ## Wire format
//!
//! A UDP datagram contains one or more messages, each starting with a message header.
//!  All fixed-width numbers are little-endian.
//!
//! ```ascii
//! 0:  message type (u8): 0 = library, 1 = user unreliable, 2..=33 = user sequenced
//!      (channel 0..=31), 34 = user reliable unordered, 35..=66 = user reliable sequenced,
//!      67..=98 = user reliable ordered
//! 1:  sequence number (u16)
//! 3:  payload bit length (u16): low 15 bits are the payload length in bits; the high bit
//!      is the fragmentation indicator
//! 5:  fragment header, present only when the fragmentation indicator is set:
//!      group id (u16), total fragment count (u16), fragment index (u16)
//! *:  payload
//! ```
//!
//! Library messages (message type 0) carry the protocol's own traffic. Their payload starts
//!  with a subtype byte:
//!
//! ```ascii
//! 0 Connect:        local unique id (u64)
//! 1 ConnectResponse: local unique id (u64)
//! 2 ConnectionEstablished: [no payload]
//! 3 Disconnect:     reason string (varint length prefix + UTF-8 bytes)
//! 4 Ping:           ping id (u8)
//! 5 Pong:           ping id (u8), local time in seconds (f64)
//! 6 Acknowledge:    repeated 3-byte entries: message type (u8), sequence number (u16)
//! 7 KeepAlive:      [no payload]
//! ```
//!
//! ## Handshake
//!
//! ```ascii
//! initiator                           responder
//!     | ------------ Connect ------------> |      (retried every handshake_attempt_delay)
//!     | <-------- ConnectResponse -------- |      (retried every handshake_attempt_delay)
//!     | ------ ConnectionEstablished ----> |
//! ```
//!
//! Both sides are `Connected` once the `ConnectionEstablished` is on the wire resp.
//!  received. Either side gives up after `handshake_max_attempts` attempts.
//!
//! ## Reliability
//!
//! Reliable messages are retransmitted until a matching acknowledge entry arrives, with
//!  exponential backoff on top of the measured round-trip time. Acknowledges are piggybacked
//!  onto outgoing datagrams when space permits, and flushed on their own after at most
//!  `max_ack_delay_time` so a quiet connection still acknowledges promptly.

pub mod config;
pub mod connection;
pub mod delivery_queue;
pub mod message;
pub mod message_type;
pub mod peer;
pub mod send_pipeline;
pub mod statistics;

mod channel;
mod fragment;
mod library;
mod message_header;
mod send_record;
mod seq;

pub use config::PeerConfig;
pub use connection::{ConnectionHandle, ConnectionStatus};
pub use delivery_queue::DeliveryQueue;
pub use message::{IncomingMessage, OutgoingMessage};
pub use message_type::DeliveryMethod;
pub use peer::Peer;
pub use seq::SeqNr;
