use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::bail;
use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::time::interval;
use tracing::{debug, error, info, span, trace, Level};
use uuid::Uuid;

use crate::config::PeerConfig;
use crate::connection::{Connection, ConnectionHandle, ConnectionShared, ConnectionStatus};
use crate::delivery_queue::DeliveryQueue;
use crate::library::LibraryType;
use crate::message::{MessagePool, OutgoingMessage};
use crate::message_header::MessageHeader;
use crate::send_pipeline::PacketSink;

/// Peer is the place where all other parts of the protocol come together: it listens on a
///  UdpSocket, dispatches incoming datagrams to their connections, drives every
///  connection's heartbeat at a fixed cadence, and has the API for application code to
///  open connections and create messages.
///
/// The network task (`run`) exclusively owns all protocol state; application threads
///  interact through `ConnectionHandle`s and the thread-safe methods here.
pub struct Peer {
    config: Arc<PeerConfig>,
    socket: Arc<UdpSocket>,
    sink: Arc<dyn PacketSink>,
    pool: Arc<MessagePool>,
    delivery: Arc<dyn DeliveryQueue>,
    unique_id: u64,
    started_at: Instant,
    /// connection attempts initiated by application threads, adopted by the network task
    ///  on its next heartbeat
    pending_connects: Mutex<Vec<Arc<ConnectionShared>>>,
    /// application-visible directory of live connections
    handles: Mutex<FxHashMap<SocketAddr, ConnectionHandle>>,
}

impl Peer {
    pub async fn bind(config: PeerConfig, delivery: Arc<dyn DeliveryQueue>) -> anyhow::Result<Peer> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.local_addr).await?);
        info!("bound UDP socket to {:?}", tokio::net::UdpSocket::local_addr(&socket)?);

        Ok(Peer {
            pool: Arc::new(MessagePool::new(config.message_pool_size)),
            config: Arc::new(config),
            sink: Arc::new(socket.clone()),
            socket,
            delivery,
            unique_id: rand::thread_rng().gen(),
            started_at: Instant::now(),
            pending_connects: Mutex::new(Vec::new()),
            handles: Mutex::new(FxHashMap::default()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        tokio::net::UdpSocket::local_addr(&self.socket)
            .expect("UdpSocket should have an initialized local addr")
    }

    /// this peer's 64-bit unique identifier, sent during handshakes
    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    pub fn create_message(&self, initial_capacity: usize) -> OutgoingMessage {
        self.pool.create_message(initial_capacity)
    }

    pub fn connection(&self, remote: SocketAddr) -> Option<ConnectionHandle> {
        self.handles.lock().unwrap().get(&remote).cloned()
    }

    /// Starts connecting to a remote peer. The handshake happens on the network task;
    ///  the returned handle reports progress through its status (and the delivery queue
    ///  receives status change events). Calling this for an already live connection
    ///  returns the existing handle.
    pub fn connect(&self, remote: SocketAddr) -> anyhow::Result<ConnectionHandle> {
        if remote.port() == 0 {
            bail!("cannot connect to {:?}: port 0 is not a valid destination", remote);
        }

        let mut handles = self.handles.lock().unwrap();
        if let Some(existing) = handles.get(&remote) {
            if existing.status() != ConnectionStatus::Disconnected {
                debug!("connect to {:?}: connection already exists", remote);
                return Ok(existing.clone());
            }
        }

        debug!("initiating connection to {:?}", remote);
        let shared = ConnectionShared::new(remote, self.config.clone(), self.pool.clone());
        let handle = ConnectionHandle::from_shared(shared.clone());
        handles.insert(remote, handle.clone());
        self.pending_connects.lock().unwrap().push(shared);
        Ok(handle)
    }

    /// The network task: receives datagrams and drives heartbeats until the peer is
    ///  dropped. Spawn this exactly once.
    pub async fn run(&self) {
        info!("starting network task");

        let mut connections: FxHashMap<SocketAddr, Connection> = FxHashMap::default();
        let mut heartbeat = interval(self.config.heartbeat_interval);
        let mut recv_buf = vec![0u8; 65536];

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut recv_buf) => {
                    match received {
                        Ok((num_read, from)) => {
                            let correlation_id = Uuid::new_v4();
                            let span = span!(Level::TRACE, "packet_received", ?correlation_id);
                            let _entered = span.enter();

                            self.handle_datagram(&mut connections, from, &recv_buf[..num_read]);
                        }
                        Err(e) => {
                            error!("socket error: {}", e);
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    self.drive_heartbeat(&mut connections);
                }
            }
        }
    }

    fn now(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn handle_datagram(
        &self,
        connections: &mut FxHashMap<SocketAddr, Connection>,
        from: SocketAddr,
        datagram: &[u8],
    ) {
        trace!("received {} bytes from {:?}", datagram.len(), from);
        let now = self.now();

        let handled = match connections.get_mut(&from) {
            Some(conn) if !conn.is_disconnected() => {
                conn.received_datagram(now, datagram);
                true
            }
            _ => false,
        };
        if handled {
            return;
        }

        // unconnected senders only get a foot in the door with a connection attempt
        if !Self::starts_with_connect(datagram) {
            debug!("unconnected datagram from {:?} that is not a connection attempt - ignoring", from);
            return;
        }

        debug!("connection attempt from {:?}", from);
        let shared = ConnectionShared::new(from, self.config.clone(), self.pool.clone());
        self.handles
            .lock()
            .unwrap()
            .insert(from, ConnectionHandle::from_shared(shared.clone()));

        let mut conn = Connection::new(
            shared,
            self.sink.clone(),
            self.delivery.clone(),
            self.unique_id,
            now,
            false,
        );
        conn.received_datagram(now, datagram);
        connections.insert(from, conn);
    }

    fn drive_heartbeat(&self, connections: &mut FxHashMap<SocketAddr, Connection>) {
        let now = self.now();

        // adopt connection attempts initiated by application threads
        let pending: Vec<Arc<ConnectionShared>> =
            std::mem::take(&mut *self.pending_connects.lock().unwrap());
        for shared in pending {
            let remote = shared.remote_addr();
            if let Some(existing) = connections.get(&remote) {
                if !existing.is_disconnected() {
                    debug!("connection to {:?} already exists - dropping duplicate attempt", remote);
                    continue;
                }
            }
            let conn = Connection::new(
                shared,
                self.sink.clone(),
                self.delivery.clone(),
                self.unique_id,
                now,
                true,
            );
            connections.insert(remote, conn);
        }

        for conn in connections.values_mut() {
            conn.heartbeat(now);
        }

        connections.retain(|addr, conn| {
            if conn.is_disconnected() {
                debug!("evicting disconnected connection {:?}", addr);
                self.handles.lock().unwrap().remove(addr);
                false
            }
            else {
                true
            }
        });
    }

    fn starts_with_connect(datagram: &[u8]) -> bool {
        let mut buf = datagram;
        match MessageHeader::deser(&mut buf) {
            Ok(header) => {
                header.msg_type.is_library() && buf.first() == Some(&LibraryType::Connect.to_raw())
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_type::MessageType;
    use crate::seq::SeqNr;
    use bytes::BufMut;

    fn connect_datagram() -> Vec<u8> {
        let mut buf = Vec::new();
        MessageHeader {
            msg_type: MessageType::LIBRARY,
            seq_nr: SeqNr::ZERO,
            payload_bits: 9 * 8,
            fragment: None,
        }
        .ser(&mut buf);
        buf.put_u8(LibraryType::Connect.to_raw());
        buf.put_u64_le(42);
        buf
    }

    #[test]
    fn test_starts_with_connect() {
        assert!(Peer::starts_with_connect(&connect_datagram()));

        // a ping is library traffic but not a connection attempt
        let mut ping = Vec::new();
        MessageHeader {
            msg_type: MessageType::LIBRARY,
            seq_nr: SeqNr::ZERO,
            payload_bits: 2 * 8,
            fragment: None,
        }
        .ser(&mut ping);
        ping.put_u8(LibraryType::Ping.to_raw());
        ping.put_u8(1);
        assert!(!Peer::starts_with_connect(&ping));

        // user data from an unknown sender
        let mut data = Vec::new();
        MessageHeader {
            msg_type: MessageType::from_raw(1).unwrap(),
            seq_nr: SeqNr::ZERO,
            payload_bits: 8,
            fragment: None,
        }
        .ser(&mut data);
        data.put_u8(0xab);
        assert!(!Peer::starts_with_connect(&data));

        assert!(!Peer::starts_with_connect(&[]));
        assert!(!Peer::starts_with_connect(&[0, 0]));
    }
}
