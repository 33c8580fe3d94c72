use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{debug, error, trace};

/// What the socket reported for one datagram send attempt.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SendOutcome {
    Sent,
    /// the OS signalled a connection reset for this destination (e.g. an ICMP port
    ///  unreachable in response to earlier traffic)
    ConnectionReset,
    /// the datagram was dropped locally (full send buffer or a transient error);
    ///  retransmission covers reliable traffic, everything else is best-effort anyway
    Dropped,
}

/// Abstraction for pushing one assembled datagram out, introduced to facilitate mocking
///  the I/O part away for testing. Sends must not block: the heartbeat engine runs on the
///  network task and a slow send would stall every connection.
#[cfg_attr(test, automock)]
pub trait PacketSink: Send + Sync + 'static {
    fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> SendOutcome;

    fn local_addr(&self) -> SocketAddr;
}

impl PacketSink for Arc<UdpSocket> {
    fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> SendOutcome {
        trace!("UDP socket: sending {} byte packet to {:?}", packet_buf.len(), to);

        match self.try_send_to(packet_buf, to) {
            Ok(_) => SendOutcome::Sent,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                debug!("connection reset reported while sending to {:?}", to);
                SendOutcome::ConnectionReset
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("socket send buffer full, dropping packet to {:?}", to);
                SendOutcome::Dropped
            }
            Err(e) => {
                error!("error sending UDP packet to {:?}: {}", to, e);
                SendOutcome::Dropped
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref()
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}
