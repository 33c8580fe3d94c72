use std::net::SocketAddr;

#[cfg(test)] use mockall::automock;

use crate::connection::ConnectionStatus;
use crate::message::IncomingMessage;

/// The application-facing inbound queue: everything the protocol hands up goes through
///  this trait, called from the network task. Implementations are expected to enqueue and
///  return quickly.
#[cfg_attr(test, automock)]
pub trait DeliveryQueue: Send + Sync + 'static {
    /// A fully received (and, where applicable, reassembled) message, released in
    ///  accordance with its delivery method's ordering guarantees.
    fn on_message(&self, message: IncomingMessage);

    /// A connection's visible status changed, with a human-readable reason.
    fn on_status_change(&self, remote: SocketAddr, status: ConnectionStatus, reason: &str);
}
