use anyhow::bail;
use std::net::SocketAddr;
use std::time::Duration;

use crate::message_header::MAX_PAYLOAD_BITS;

/// Configuration for a peer and all connections it accepts or initiates.
///
/// `new` fills in defaults that work for typical internet paths; call sites override
///  individual fields before handing the config to `Peer::bind`, which validates it.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// local address to bind the UDP socket to
    pub local_addr: SocketAddr,

    /// Maximum UDP payload size in bytes that a coalesced datagram may reach. The default
    ///  of 1408 leaves headroom below a full Ethernet frame for IP/UDP headers plus a
    ///  margin for surprising network hardware on the path; fragment datagrams exceed this
    ///  by one message header.
    ///
    /// Choosing this too big causes datagrams to be dropped somewhere on the route;
    ///  choosing it too small wastes bandwidth on per-datagram overhead.
    pub maximum_transmission_unit: usize,

    /// outbound bandwidth cap in bytes per second; 0 disables throttling entirely
    pub throttle_bytes_per_second: f32,

    /// accumulated send debt at which a heartbeat stops emitting further datagrams
    pub throttle_peak_bytes: f32,

    /// pack several small messages into one datagram instead of one datagram per message
    pub use_message_coalescing: bool,

    /// delay between handshake (re)attempts
    pub handshake_attempt_delay: Duration,

    /// handshake attempts before the connection attempt is abandoned
    pub handshake_max_attempts: u32,

    /// Upper bound on how long a pending acknowledge may wait for an outgoing datagram to
    ///  piggyback on before it is flushed on its own.
    pub max_ack_delay_time: Duration,

    /// interval between pings; pings double as keepalives
    pub ping_interval: Duration,

    /// a connection that has not been heard from for this long is dropped
    pub connection_timeout: Duration,

    /// cadence at which the network task drives each connection's heartbeat
    pub heartbeat_interval: Duration,

    /// route inbound connection attempts through `approve` / `deny` instead of accepting
    ///  them outright
    pub enable_connection_approval: bool,

    /// number of recycled outgoing-message buffers kept around
    pub message_pool_size: usize,
}

impl PeerConfig {
    pub fn new(local_addr: SocketAddr) -> PeerConfig {
        PeerConfig {
            local_addr,
            maximum_transmission_unit: 1408,
            throttle_bytes_per_second: 0.0,
            throttle_peak_bytes: 8192.0,
            use_message_coalescing: true,
            handshake_attempt_delay: Duration::from_millis(2500),
            handshake_max_attempts: 5,
            max_ack_delay_time: Duration::from_millis(100),
            ping_interval: Duration::from_secs(4),
            connection_timeout: Duration::from_secs(25),
            heartbeat_interval: Duration::from_millis(25),
            enable_connection_approval: false,
            message_pool_size: 512,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.maximum_transmission_unit < 100 {
            bail!("maximum transmission unit {} is too small to be useful", self.maximum_transmission_unit);
        }
        if self.maximum_transmission_unit * 8 > MAX_PAYLOAD_BITS as usize {
            bail!(
                "maximum transmission unit {} exceeds what the wire format's length field can express ({} bytes)",
                self.maximum_transmission_unit,
                MAX_PAYLOAD_BITS as usize / 8
            );
        }
        if self.handshake_max_attempts == 0 {
            bail!("at least one handshake attempt is required");
        }
        if self.connection_timeout <= self.ping_interval {
            bail!("connection timeout must exceed the ping interval, or every connection eventually times out");
        }
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must be non-zero");
        }
        if self.throttle_bytes_per_second > 0.0 && self.throttle_peak_bytes < self.maximum_transmission_unit as f32 {
            bail!("throttle peak below the transmission unit would stall the send pipeline");
        }
        Ok(())
    }
}
