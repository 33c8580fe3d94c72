use std::cmp::min;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use bytes::Buf;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::channel::{ReceiveChannels, ReliableOutcome, SendChannels};
use crate::config::PeerConfig;
use crate::delivery_queue::DeliveryQueue;
use crate::fragment::{fragment_count, FragmentAssembler, FragmentInsert};
use crate::library::{
    AckPayload, DisconnectPayload, HandshakePayload, LibraryType, PingPayload, PongPayload,
};
use crate::message::{IncomingMessage, MessagePool, OutgoingMessage};
use crate::message_header::{MessageHeader, FRAGMENT_HEADER_SIZE};
use crate::message_type::{DeliveryMethod, MessageType};
use crate::send_pipeline::{PacketSink, SendOutcome};
use crate::send_record::SendingRecord;
use crate::seq::SeqNr;
use crate::statistics::ConnectionStatistics;

/// smallest MTU remainder worth appending an acknowledge message into: message header,
///  subtype byte and one entry
const ACK_MIN_SPACE: usize = MessageHeader::SERIALIZED_LEN + 1 + AckPayload::ENTRY_LEN;

/// round trip estimate used until the first pong arrives
const INITIAL_AVG_RTT: Duration = Duration::from_millis(100);

/// A connection's application-visible status.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionStatus {
    None = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
    Disconnected = 4,
}

impl ConnectionStatus {
    fn from_raw(raw: u8) -> ConnectionStatus {
        match raw {
            0 => ConnectionStatus::None,
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Connected,
            3 => ConnectionStatus::Disconnecting,
            _ => ConnectionStatus::Disconnected,
        }
    }
}

/// Internal connection state. The visible status collapses the three handshake states
///  into `Connecting`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum InternalStatus {
    None,
    InitiatedConnect,
    RespondedConnect,
    PendingApproval,
    Connected,
    Disconnecting,
    Disconnected,
}

impl InternalStatus {
    fn visible(&self) -> ConnectionStatus {
        match self {
            InternalStatus::None => ConnectionStatus::None,
            InternalStatus::InitiatedConnect
            | InternalStatus::RespondedConnect
            | InternalStatus::PendingApproval => ConnectionStatus::Connecting,
            InternalStatus::Connected => ConnectionStatus::Connected,
            InternalStatus::Disconnecting => ConnectionStatus::Disconnecting,
            InternalStatus::Disconnected => ConnectionStatus::Disconnected,
        }
    }
}

enum ApprovalIntent {
    Approve,
    Deny(String),
}

/// The send-side concurrent boundary: the unsent queue, the outgoing sequence counters and
///  the fragment group counter live under one mutex so that stamping is atomic with
///  enqueueing. Application threads push to the back; the network task pops from the front
///  and pushes records back to the front for resends.
struct SendQueue {
    records: VecDeque<SendingRecord>,
    channels: SendChannels,
    next_fragment_group: u16,
    queued_bytes: usize,
}

impl SendQueue {
    fn new() -> SendQueue {
        SendQueue {
            records: VecDeque::new(),
            channels: SendChannels::new(),
            next_fragment_group: 1,
            queued_bytes: 0,
        }
    }

    fn push_back(&mut self, record: SendingRecord) {
        self.queued_bytes += record.encoded_len();
        self.records.push_back(record);
    }

    fn push_front(&mut self, record: SendingRecord) {
        self.queued_bytes += record.encoded_len();
        self.records.push_front(record);
    }

    fn pop_front(&mut self) -> Option<SendingRecord> {
        let record = self.records.pop_front();
        if let Some(record) = &record {
            self.queued_bytes -= record.encoded_len();
        }
        record
    }

    fn remove(&mut self, pos: usize) -> SendingRecord {
        let record = self.records.remove(pos).expect("position was just found");
        self.queued_bytes -= record.encoded_len();
        record
    }

    /// group ids are per-connection monotonic; 0 means 'not fragmented' and is skipped
    fn allocate_fragment_group(&mut self) -> u16 {
        let group = self.next_fragment_group;
        self.next_fragment_group = if group == u16::MAX { 1 } else { group + 1 };
        group
    }
}

/// The part of a connection that application threads may touch. Everything else is owned
///  exclusively by the network task.
pub(crate) struct ConnectionShared {
    remote_addr: SocketAddr,
    config: Arc<PeerConfig>,
    pool: Arc<MessagePool>,
    visible_status: AtomicU8,
    remote_unique_id: AtomicU64,
    avg_rtt_micros: AtomicU64,
    remote_time_offset_micros: AtomicI64,
    statistics: ConnectionStatistics,
    send: Mutex<SendQueue>,
    disconnect_requested: Mutex<Option<String>>,
    approval_intent: Mutex<Option<ApprovalIntent>>,
    tag: Mutex<Option<String>>,
}

impl ConnectionShared {
    pub(crate) fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub(crate) fn new(
        remote_addr: SocketAddr,
        config: Arc<PeerConfig>,
        pool: Arc<MessagePool>,
    ) -> Arc<ConnectionShared> {
        Arc::new(ConnectionShared {
            remote_addr,
            config,
            pool,
            visible_status: AtomicU8::new(ConnectionStatus::None as u8),
            remote_unique_id: AtomicU64::new(0),
            avg_rtt_micros: AtomicU64::new(INITIAL_AVG_RTT.as_micros() as u64),
            remote_time_offset_micros: AtomicI64::new(0),
            statistics: ConnectionStatistics::default(),
            send: Mutex::new(SendQueue::new()),
            disconnect_requested: Mutex::new(None),
            approval_intent: Mutex::new(None),
            tag: Mutex::new(None),
        })
    }
}

/// Application-facing handle to a connection. Cheap to clone; all methods are safe to call
///  from any thread.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<ConnectionShared>,
}

impl ConnectionHandle {
    pub(crate) fn from_shared(shared: Arc<ConnectionShared>) -> ConnectionHandle {
        ConnectionHandle { shared }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote_addr
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_raw(self.shared.visible_status.load(Ordering::Acquire))
    }

    /// the remote peer's 64-bit unique identifier, 0 until the handshake provided it
    pub fn remote_unique_id(&self) -> u64 {
        self.shared.remote_unique_id.load(Ordering::Acquire)
    }

    pub fn statistics(&self) -> &ConnectionStatistics {
        &self.shared.statistics
    }

    /// smoothed round trip estimate from the ping/pong exchange
    pub fn average_round_trip_time(&self) -> Duration {
        Duration::from_micros(self.shared.avg_rtt_micros.load(Ordering::Acquire))
    }

    /// estimated difference between the remote peer's clock and ours, in seconds
    pub fn remote_time_offset(&self) -> f64 {
        self.shared.remote_time_offset_micros.load(Ordering::Acquire) as f64 / 1e6
    }

    /// bytes currently waiting in the unsent queue, headers included
    pub fn unsent_bytes(&self) -> usize {
        self.shared.send.lock().unwrap().queued_bytes
    }

    pub fn set_tag(&self, tag: Option<String>) {
        *self.shared.tag.lock().unwrap() = tag;
    }

    pub fn tag(&self) -> Option<String> {
        self.shared.tag.lock().unwrap().clone()
    }

    /// Enqueues a message for sending. The message is stamped with the next sequence
    ///  number of its channel and, if it exceeds the fragmentation threshold, split into
    ///  fragments right here. The actual wire traffic happens on the network task's next
    ///  heartbeat.
    pub fn send_message(
        &self,
        msg: OutgoingMessage,
        method: DeliveryMethod,
        channel: u8,
    ) -> anyhow::Result<()> {
        let ty = MessageType::from_method(method, channel)?;
        if msg.was_sent() {
            bail!("message has already been sent");
        }
        match self.status() {
            ConnectionStatus::Disconnecting | ConnectionStatus::Disconnected => {
                bail!("connection to {:?} is closed", self.shared.remote_addr);
            }
            _ => {}
        }

        enqueue_user_message(&self.shared, msg, ty)
    }

    /// Requests a disconnect: the network task sends a final goodbye with the given reason
    ///  and tears the connection down. Idempotent.
    pub fn disconnect(&self, reason: &str) {
        let mut requested = self.shared.disconnect_requested.lock().unwrap();
        if requested.is_none() {
            *requested = Some(reason.to_string());
        }
    }

    /// accepts a connection attempt that is pending approval
    pub fn approve(&self) {
        *self.shared.approval_intent.lock().unwrap() = Some(ApprovalIntent::Approve);
    }

    /// rejects a connection attempt that is pending approval
    pub fn deny(&self, reason: &str) {
        *self.shared.approval_intent.lock().unwrap() =
            Some(ApprovalIntent::Deny(reason.to_string()));
    }
}

fn enqueue_user_message(
    shared: &ConnectionShared,
    mut msg: OutgoingMessage,
    ty: MessageType,
) -> anyhow::Result<()> {
    let mtu = shared.config.maximum_transmission_unit;
    let chunk = mtu - FRAGMENT_HEADER_SIZE;
    let len = msg.len();

    let mut send = shared.send.lock().unwrap();

    if len > chunk {
        let total = fragment_count(len, chunk);
        if total > u16::MAX as usize {
            bail!("message of {} bytes needs {} fragments, more than the wire format can express", len, total);
        }
        if !ty.is_reliable() {
            debug!("fragmenting an unreliable message of {} bytes: loss of any fragment loses the whole message", len);
        }

        msg.start_sendings(total as u32);
        let message = Arc::new(msg);
        let group = send.allocate_fragment_group();
        for index in 0..total {
            let seq = send.channels.stamp_outgoing(ty);
            send.push_back(SendingRecord::new_fragment(
                message.clone(),
                ty,
                seq,
                group,
                index as u16,
                total as u16,
                chunk as u16,
            ));
        }
        trace!("enqueued {} byte message as {} fragments in group {}", len, total, group);
    }
    else {
        msg.start_sendings(1);
        let seq = send.channels.stamp_outgoing(ty);
        send.push_back(SendingRecord::new(Arc::new(msg), ty, seq));
    }
    Ok(())
}

/// Per-connection protocol engine: the state machine, the receive path and the heartbeat
///  driven send pipeline. Owned exclusively by the network task; application threads reach
///  it only through `ConnectionHandle` and the shared send queue.
pub(crate) struct Connection {
    shared: Arc<ConnectionShared>,
    sink: Arc<dyn PacketSink>,
    delivery: Arc<dyn DeliveryQueue>,
    local_unique_id: u64,

    internal_status: InternalStatus,
    initiated_by_us: bool,

    last_heard_from: Duration,
    connect_initiated_at: Duration,
    handshake_attempts: u32,
    next_handshake_retry: Duration,

    /// reliable records awaiting acknowledgement, keyed by their wire identity. A record
    ///  is either here or in the unsent queue, never both.
    unacked: FxHashMap<(MessageType, SeqNr), SendingRecord>,
    pending_acks: VecDeque<(MessageType, SeqNr)>,
    next_forced_ack: Option<Duration>,

    assembler: FragmentAssembler,
    receive_channels: ReceiveChannels,

    throttle_debt: f32,
    last_heartbeat_at: Duration,
    heartbeat_counter: u32,

    next_ping: Duration,
    ping_id: u8,
    awaiting_pong: bool,
    ping_sent_at: Duration,
    avg_rtt: Duration,

    disconnect_reason: Option<String>,
    send_buffer: Vec<u8>,
}

impl Connection {
    pub(crate) fn new(
        shared: Arc<ConnectionShared>,
        sink: Arc<dyn PacketSink>,
        delivery: Arc<dyn DeliveryQueue>,
        local_unique_id: u64,
        now: Duration,
        initiate: bool,
    ) -> Connection {
        let ping_interval = shared.config.ping_interval;
        let mut conn = Connection {
            shared,
            sink,
            delivery,
            local_unique_id,
            internal_status: InternalStatus::None,
            initiated_by_us: initiate,
            last_heard_from: now,
            connect_initiated_at: now,
            handshake_attempts: 0,
            next_handshake_retry: now,
            unacked: FxHashMap::default(),
            pending_acks: VecDeque::new(),
            next_forced_ack: None,
            assembler: FragmentAssembler::new(),
            receive_channels: ReceiveChannels::new(),
            throttle_debt: 0.0,
            last_heartbeat_at: now,
            heartbeat_counter: 0,
            next_ping: now + ping_interval,
            ping_id: 0,
            awaiting_pong: false,
            ping_sent_at: Duration::ZERO,
            avg_rtt: INITIAL_AVG_RTT,
            disconnect_reason: None,
            send_buffer: Vec::new(),
        };

        if initiate {
            conn.transition(InternalStatus::InitiatedConnect, "Connecting to remote host");
            conn.handshake_attempts = 1;
            conn.enqueue_connect();
            conn.next_handshake_retry = now + conn.shared.config.handshake_attempt_delay;
        }
        conn
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.internal_status == InternalStatus::Disconnected
    }

    fn transition(&mut self, status: InternalStatus, reason: &str) {
        if self.internal_status == status {
            return;
        }
        debug!("connection to {:?}: {:?} -> {:?} ({})", self.shared.remote_addr, self.internal_status, status, reason);
        self.internal_status = status;

        let visible = status.visible();
        let previous = self.shared.visible_status.swap(visible as u8, Ordering::AcqRel);
        if previous != visible as u8 {
            self.delivery.on_status_change(self.shared.remote_addr, visible, reason);
        }
    }

    // ------------------------------- receive path ---------------------------------------

    /// Parses one inbound datagram into messages and runs each through the state machine.
    pub(crate) fn received_datagram(&mut self, now: Duration, datagram: &[u8]) {
        self.shared.statistics.on_packet_received(datagram.len());

        let mut buf = datagram;
        while !buf.is_empty() {
            let header = match MessageHeader::deser(&mut buf) {
                Ok(header) => header,
                Err(e) => {
                    warn!("unparseable message header from {:?}: {} - dropping rest of packet", self.shared.remote_addr, e);
                    self.shared.statistics.on_message_dropped();
                    return;
                }
            };

            let payload_len = header.payload_len_bytes();
            if buf.len() < payload_len {
                warn!("message from {:?} announces {} payload bytes but only {} remain - dropping rest of packet", self.shared.remote_addr, payload_len, buf.len());
                self.shared.statistics.on_message_dropped();
                return;
            }
            let (payload, rest) = buf.split_at(payload_len);
            buf = rest;

            self.received_message(now, header, payload);
        }
    }

    pub(crate) fn received_message(&mut self, now: Duration, header: MessageHeader, payload: &[u8]) {
        if self.internal_status == InternalStatus::Disconnected {
            trace!("message for disconnected connection {:?} - ignoring", self.shared.remote_addr);
            return;
        }
        self.last_heard_from = now;

        if header.msg_type.is_library() {
            if let Err(e) = self.received_library_message(now, payload) {
                // a malformed peer must not kill the connection
                warn!("error handling library message from {:?}: {} - dropping", self.shared.remote_addr, e);
                self.shared.statistics.on_message_dropped();
            }
            return;
        }

        self.shared.statistics.on_message_received();

        // every received reliable message is acknowledged, accepted or not, so the sender
        //  stops retransmitting
        if header.msg_type.is_reliable() {
            self.queue_ack(now, header.msg_type, header.seq_nr);
        }

        let msg = IncomingMessage::new(
            header.msg_type,
            header.seq_nr,
            self.shared.remote_addr,
            payload.to_vec(),
            header.payload_bits as u32,
            header.fragment,
        );

        if header.msg_type.is_sequenced() {
            if self.receive_channels.on_receive_sequenced(header.msg_type, header.seq_nr) {
                self.release(msg);
            }
            else {
                trace!("dropping late sequenced message {} #{}", header.msg_type, header.seq_nr);
                self.shared.statistics.on_message_dropped();
            }
        }
        else if header.msg_type.is_reliable() {
            match self.receive_channels.on_receive_reliable(msg) {
                ReliableOutcome::InOrder { release } => {
                    for m in release {
                        self.release(m);
                    }
                }
                ReliableOutcome::EarlyRelease(m) => self.release(m),
                ReliableOutcome::Withheld => {}
                ReliableOutcome::Duplicate => {
                    trace!("dropping duplicate reliable message {} #{}", header.msg_type, header.seq_nr);
                    self.shared.statistics.on_message_dropped();
                }
            }
        }
        else {
            self.release(msg);
        }
    }

    /// Hands an accepted message up: fragments go to the assembler, everything else (and
    ///  every completed reassembly) to the application's inbound queue.
    fn release(&mut self, msg: IncomingMessage) {
        match msg.fragment {
            Some(fragment) => {
                let (ty, seq, sender) = (msg.msg_type, msg.seq_nr, msg.sender);
                match self.assembler.insert(fragment, &msg.data, || {
                    IncomingMessage::new(ty, seq, sender, Vec::new(), 0, Some(fragment))
                }) {
                    FragmentInsert::Completed(full) => self.delivery.on_message(full),
                    FragmentInsert::Partial => {
                        trace!("stored fragment {} of group {}, {} group(s) pending", fragment.index, fragment.group, self.assembler.num_pending_groups());
                    }
                    FragmentInsert::Duplicate => {
                        trace!("dropping duplicate fragment {} of group {}", fragment.index, fragment.group);
                        self.shared.statistics.on_message_dropped();
                    }
                    FragmentInsert::Invalid => {
                        self.shared.statistics.on_message_dropped();
                    }
                }
            }
            None => self.delivery.on_message(msg),
        }
    }

    fn received_library_message(&mut self, now: Duration, payload: &[u8]) -> anyhow::Result<()> {
        let mut buf = payload;
        if !buf.has_remaining() {
            bail!("empty library message");
        }
        let subtype = LibraryType::from_raw(buf.get_u8())?;
        trace!("library message {:?} from {:?}", subtype, self.shared.remote_addr);

        match subtype {
            LibraryType::Connect => {
                let handshake = HandshakePayload::deser(&mut buf)?;
                self.received_connect(now, handshake);
            }
            LibraryType::ConnectResponse => {
                let handshake = HandshakePayload::deser(&mut buf)?;
                self.received_connect_response(handshake);
            }
            LibraryType::ConnectionEstablished => match self.internal_status {
                InternalStatus::RespondedConnect => {
                    self.transition(InternalStatus::Connected, "Connected to remote host");
                }
                InternalStatus::Connected => {
                    trace!("duplicate connection established - ignoring");
                }
                _ => {
                    debug!("connection established in status {:?} - ignoring", self.internal_status);
                }
            },
            LibraryType::Disconnect => {
                let disconnect = DisconnectPayload::deser(&mut buf)?;
                debug!("remote {:?} disconnected: {}", self.shared.remote_addr, disconnect.reason);
                self.drop_connection(&disconnect.reason);
            }
            LibraryType::Ping => {
                let ping = PingPayload::deser(&mut buf)?;
                let mut msg = self.shared.pool.create_library(LibraryType::Pong);
                PongPayload {
                    ping_id: ping.ping_id,
                    remote_time_seconds: now.as_secs_f64(),
                }
                .ser(msg.buffer_mut());
                self.enqueue_library(msg);
            }
            LibraryType::Pong => {
                let pong = PongPayload::deser(&mut buf)?;
                self.received_pong(now, pong);
            }
            LibraryType::Acknowledge => {
                let acks = AckPayload::deser(&mut buf)?;
                self.received_acks(acks);
            }
            LibraryType::KeepAlive => {
                // refreshing last_heard_from is all it is for
            }
        }
        Ok(())
    }

    fn received_connect(&mut self, now: Duration, handshake: HandshakePayload) {
        match self.internal_status {
            InternalStatus::None => {
                self.shared.remote_unique_id.store(handshake.unique_id, Ordering::Release);

                if self.shared.config.enable_connection_approval {
                    self.transition(InternalStatus::PendingApproval, "Connection attempt awaiting approval");
                }
                else {
                    self.respond_to_connect(now);
                }
            }
            InternalStatus::RespondedConnect => {
                // our response got lost; answer right away instead of waiting for the retry
                debug!("duplicate connect from {:?} - re-sending connect response", self.shared.remote_addr);
                self.enqueue_connect_response();
                self.next_handshake_retry = now + self.shared.config.handshake_attempt_delay;
            }
            _ => {
                debug!("connect from {:?} in status {:?} - ignoring", self.shared.remote_addr, self.internal_status);
            }
        }
    }

    fn received_connect_response(&mut self, handshake: HandshakePayload) {
        match self.internal_status {
            InternalStatus::InitiatedConnect => {
                self.shared.remote_unique_id.store(handshake.unique_id, Ordering::Release);
                self.enqueue_library_plain(LibraryType::ConnectionEstablished);
                self.transition(InternalStatus::Connected, "Connected to remote host");
            }
            InternalStatus::Connected if self.initiated_by_us => {
                // our ConnectionEstablished got lost
                debug!("duplicate connect response - re-sending connection established");
                self.enqueue_library_plain(LibraryType::ConnectionEstablished);
            }
            _ => {
                debug!("connect response in status {:?} - ignoring", self.internal_status);
            }
        }
    }

    fn received_pong(&mut self, now: Duration, pong: PongPayload) {
        if !self.awaiting_pong || pong.ping_id != self.ping_id {
            debug!("unmatched pong id {} from {:?} - ignoring", pong.ping_id, self.shared.remote_addr);
            return;
        }
        self.awaiting_pong = false;

        let rtt = now.saturating_sub(self.ping_sent_at);
        self.avg_rtt = Duration::from_secs_f64(self.avg_rtt.as_secs_f64() * 0.7 + rtt.as_secs_f64() * 0.3);
        self.shared.avg_rtt_micros.store(self.avg_rtt.as_micros() as u64, Ordering::Release);

        let offset = pong.remote_time_seconds + rtt.as_secs_f64() / 2.0 - now.as_secs_f64();
        self.shared.remote_time_offset_micros.store((offset * 1e6) as i64, Ordering::Release);
        trace!("pong from {:?}: rtt sample {:?}, average now {:?}", self.shared.remote_addr, rtt, self.avg_rtt);
    }

    fn received_acks(&mut self, acks: AckPayload) {
        for (ty, seq) in acks.entries {
            if let Some(record) = self.unacked.remove(&(ty, seq)) {
                trace!("ack for {} #{}", ty, seq);
                self.shared.pool.release_sending(record.message);
                continue;
            }

            // the record may sit in the unsent queue waiting for a resend; cancel that copy
            let requeued = {
                let mut send = self.shared.send.lock().unwrap();
                send.records
                    .iter()
                    .position(|r| r.num_sends > 0 && r.msg_type == ty && r.seq_nr == seq)
                    .map(|pos| send.remove(pos))
            };
            match requeued {
                Some(record) => {
                    trace!("ack for {} #{} cancelled a pending resend", ty, seq);
                    self.shared.pool.release_sending(record.message);
                }
                None => {
                    trace!("ack for unknown message {} #{} - already acknowledged", ty, seq);
                }
            }
        }
    }

    fn queue_ack(&mut self, now: Duration, ty: MessageType, seq: SeqNr) {
        if self.pending_acks.is_empty() {
            self.next_forced_ack = Some(now + self.shared.config.max_ack_delay_time);
        }
        self.pending_acks.push_back((ty, seq));
    }

    // ------------------------------- heartbeat engine -----------------------------------

    /// One heartbeat invocation. Every third invocation performs the less frequent timer
    ///  work (timeouts, handshake retries, pings, resend scan); every invocation settles
    ///  the throttle and runs the send pipeline.
    pub(crate) fn heartbeat(&mut self, now: Duration) {
        self.apply_user_intents(now);
        if self.internal_status == InternalStatus::Disconnected {
            return;
        }

        self.heartbeat_counter = self.heartbeat_counter.wrapping_add(1);
        if self.heartbeat_counter % 3 == 0 {
            self.greater_heartbeat(now);
            if self.internal_status == InternalStatus::Disconnected {
                return;
            }
        }

        let elapsed = now.saturating_sub(self.last_heartbeat_at);
        self.last_heartbeat_at = now;

        let rate = self.shared.config.throttle_bytes_per_second;
        if rate <= 0.0 {
            self.throttle_debt = 0.0;
        }
        else {
            self.throttle_debt = (self.throttle_debt - elapsed.as_secs_f32() * rate).max(0.0);
        }

        self.send_unsent(now);
    }

    fn apply_user_intents(&mut self, now: Duration) {
        let requested = self.shared.disconnect_requested.lock().unwrap().take();
        if let Some(reason) = requested {
            self.execute_disconnect(now, &reason);
        }

        let intent = self.shared.approval_intent.lock().unwrap().take();
        match intent {
            Some(ApprovalIntent::Approve) => {
                if self.internal_status == InternalStatus::PendingApproval {
                    self.respond_to_connect(now);
                }
                else {
                    warn!("approve called on {:?} but no connection attempt is pending", self.shared.remote_addr);
                }
            }
            Some(ApprovalIntent::Deny(reason)) => {
                if self.internal_status == InternalStatus::PendingApproval {
                    self.execute_disconnect(now, &reason);
                }
                else {
                    warn!("deny called on {:?} but no connection attempt is pending", self.shared.remote_addr);
                }
            }
            None => {}
        }
    }

    fn greater_heartbeat(&mut self, now: Duration) {
        if now.saturating_sub(self.last_heard_from) > self.shared.config.connection_timeout {
            debug!("nothing heard from {:?} for {:?}", self.shared.remote_addr, now - self.last_heard_from);
            self.drop_connection("Connection timed out");
            return;
        }

        match self.internal_status {
            InternalStatus::InitiatedConnect => self.handshake_retry(now, LibraryType::Connect),
            InternalStatus::RespondedConnect => self.handshake_retry(now, LibraryType::ConnectResponse),
            InternalStatus::Connected => {
                if now >= self.next_ping {
                    self.send_ping(now);
                }
            }
            _ => {}
        }
        if self.internal_status == InternalStatus::Disconnected {
            return;
        }

        // requeue expired reliable sends, front of the queue so they go out first
        let due: Vec<(MessageType, SeqNr)> = self
            .unacked
            .iter()
            .filter(|(_, record)| now > record.next_resend)
            .map(|(key, _)| *key)
            .collect();
        if !due.is_empty() {
            let mut send = self.shared.send.lock().unwrap();
            for key in due {
                let mut record = self.unacked.remove(&key).expect("key was just enumerated");
                debug!("resend deadline passed for {} #{} (sent {} times)", record.msg_type, record.seq_nr, record.num_sends);
                self.shared.statistics.on_message_resent();
                record.set_next_resend(now, self.avg_rtt);
                send.push_front(record);
            }
        }
    }

    fn handshake_retry(&mut self, now: Duration, which: LibraryType) {
        if now < self.next_handshake_retry {
            return;
        }
        if self.handshake_attempts >= self.shared.config.handshake_max_attempts {
            debug!("giving up on handshake with {:?} after {:?}", self.shared.remote_addr, now - self.connect_initiated_at);
            self.drop_connection("Failed to complete handshake");
            return;
        }

        self.handshake_attempts += 1;
        debug!("handshake attempt {} of {} towards {:?}", self.handshake_attempts, self.shared.config.handshake_max_attempts, self.shared.remote_addr);
        match which {
            LibraryType::Connect => self.enqueue_connect(),
            _ => self.enqueue_connect_response(),
        }
        self.next_handshake_retry = now + self.shared.config.handshake_attempt_delay;
    }

    fn send_ping(&mut self, now: Duration) {
        self.ping_id = self.ping_id.wrapping_add(1);
        self.awaiting_pong = true;
        self.ping_sent_at = now;
        self.next_ping = now + self.shared.config.ping_interval;

        let mut msg = self.shared.pool.create_library(LibraryType::Ping);
        PingPayload { ping_id: self.ping_id }.ser(msg.buffer_mut());
        self.enqueue_library(msg);
    }

    /// Drains the unsent queue into at most MTU-sized datagrams, reusing one send buffer.
    ///  Reliable records move to the unacked set after transmission; unreliable ones are
    ///  released. Pending acknowledges are piggybacked wherever they fit.
    fn send_unsent(&mut self, now: Duration) {
        let mtu = self.shared.config.maximum_transmission_unit;
        let throttled = self.shared.config.throttle_bytes_per_second > 0.0;
        let coalescing = self.shared.config.use_message_coalescing;

        let mut buf = std::mem::take(&mut self.send_buffer);
        buf.clear();
        let mut messages_in_packet: u64 = 0;

        loop {
            if self.internal_status == InternalStatus::Disconnected {
                break;
            }
            if throttled && self.throttle_debt >= self.shared.config.throttle_peak_bytes {
                trace!("throttle debt {} at peak - pausing send pipeline", self.throttle_debt);
                break;
            }

            let record = self.shared.send.lock().unwrap().pop_front();
            let Some(mut record) = record else {
                break;
            };

            if !buf.is_empty() && buf.len() + record.encoded_len() > mtu {
                self.flush_packet(&mut buf, &mut messages_in_packet);
                if self.internal_status == InternalStatus::Disconnected {
                    self.shared.pool.release_sending(record.message);
                    break;
                }
            }

            record.header().ser(&mut buf);
            buf.extend_from_slice(record.payload());
            messages_in_packet += 1;
            record.num_sends += 1;

            let is_goodbye = record.message.library_type() == Some(LibraryType::Disconnect);

            if record.msg_type.is_reliable() {
                record.set_next_resend(now, self.avg_rtt);
                let key = (record.msg_type, record.seq_nr);
                if let Some(previous) = self.unacked.insert(key, record) {
                    debug!("replacing unacked record {} #{}", previous.msg_type, previous.seq_nr);
                    self.shared.pool.release_sending(previous.message);
                }
            }
            else {
                self.shared.pool.release_sending(record.message);
            }

            self.append_acks(&mut buf, mtu);

            if is_goodbye {
                self.flush_packet(&mut buf, &mut messages_in_packet);
                self.finish_disconnect();
                break;
            }

            if !coalescing {
                self.flush_packet(&mut buf, &mut messages_in_packet);
            }
        }

        if !buf.is_empty() {
            self.flush_packet(&mut buf, &mut messages_in_packet);
        }

        // a quiet connection still acknowledges within bounded time
        if self.internal_status != InternalStatus::Disconnected && !self.pending_acks.is_empty() {
            if let Some(deadline) = self.next_forced_ack {
                if now >= deadline {
                    trace!("forced acknowledge flush");
                    self.append_acks(&mut buf, mtu);
                    self.flush_packet(&mut buf, &mut messages_in_packet);
                }
            }
        }

        self.send_buffer = buf;
    }

    /// Appends one acknowledge message consuming as much of the datagram's remaining space
    ///  as possible (if at least one entry fits).
    fn append_acks(&mut self, buf: &mut Vec<u8>, mtu: usize) {
        if self.pending_acks.is_empty() {
            return;
        }
        let remaining = mtu.saturating_sub(buf.len());
        if remaining < ACK_MIN_SPACE {
            return;
        }

        let max_entries = (remaining - MessageHeader::SERIALIZED_LEN - 1) / AckPayload::ENTRY_LEN;
        let count = min(max_entries, self.pending_acks.len());
        let entries: Vec<(MessageType, SeqNr)> = self.pending_acks.drain(..count).collect();
        trace!("acknowledging {} messages towards {:?}", count, self.shared.remote_addr);

        let payload = AckPayload { entries };
        MessageHeader {
            msg_type: MessageType::LIBRARY,
            seq_nr: SeqNr::ZERO,
            payload_bits: ((1 + count * AckPayload::ENTRY_LEN) * 8) as u16,
            fragment: None,
        }
        .ser(buf);
        buf.push(LibraryType::Acknowledge.to_raw());
        payload.ser(buf);

        if self.pending_acks.is_empty() {
            self.next_forced_ack = None;
        }
    }

    fn flush_packet(&mut self, buf: &mut Vec<u8>, messages_in_packet: &mut u64) {
        if buf.is_empty() {
            return;
        }

        let outcome = self.sink.send_packet(self.shared.remote_addr, buf);
        self.shared.statistics.on_packet_sent(buf.len(), *messages_in_packet);
        self.throttle_debt += buf.len() as f32;
        buf.clear();
        *messages_in_packet = 0;

        if outcome == SendOutcome::ConnectionReset {
            self.drop_connection("Connection was reset by remote host");
        }
    }

    // ------------------------------- teardown -------------------------------------------

    /// User-requested (or deny-triggered) disconnect: all unacked sends get one final
    ///  flight, then a goodbye with the reason goes out and the connection finalizes once
    ///  that goodbye is on the wire.
    fn execute_disconnect(&mut self, _now: Duration, reason: &str) {
        match self.internal_status {
            InternalStatus::Disconnecting | InternalStatus::Disconnected => return,
            _ => {}
        }

        {
            let mut send = self.shared.send.lock().unwrap();
            for (_, record) in self.unacked.drain() {
                send.push_front(record);
            }
        }
        self.throttle_debt = 0.0;

        let mut msg = self.shared.pool.create_library(LibraryType::Disconnect);
        DisconnectPayload { reason: reason.to_string() }.ser(msg.buffer_mut());
        self.enqueue_library(msg);

        self.disconnect_reason = Some(reason.to_string());
        self.transition(InternalStatus::Disconnecting, reason);
    }

    /// the goodbye went out: finalize
    fn finish_disconnect(&mut self) {
        let reason = self
            .disconnect_reason
            .take()
            .unwrap_or_else(|| "Disconnected".to_string());
        self.cleanup_queues();
        self.transition(InternalStatus::Disconnected, &reason);
    }

    /// Immediate local teardown without a goodbye: remote disconnect, timeout, connection
    ///  reset, handshake failure.
    fn drop_connection(&mut self, reason: &str) {
        if self.internal_status == InternalStatus::Disconnected {
            return;
        }
        self.cleanup_queues();
        self.transition(InternalStatus::Disconnected, reason);
    }

    fn cleanup_queues(&mut self) {
        for (_, record) in self.unacked.drain() {
            self.shared.pool.release_sending(record.message);
        }

        let drained: Vec<SendingRecord> = {
            let mut send = self.shared.send.lock().unwrap();
            let records = std::mem::take(&mut send.records);
            send.queued_bytes = 0;
            records.into_iter().collect()
        };
        for record in drained {
            self.shared.pool.release_sending(record.message);
        }

        self.pending_acks.clear();
        self.next_forced_ack = None;
    }

    // ------------------------------- handshake helpers ----------------------------------

    fn respond_to_connect(&mut self, now: Duration) {
        self.transition(InternalStatus::RespondedConnect, "Responding to connection attempt");
        self.handshake_attempts = 1;
        self.enqueue_connect_response();
        self.next_handshake_retry = now + self.shared.config.handshake_attempt_delay;
    }

    fn enqueue_connect(&mut self) {
        let mut msg = self.shared.pool.create_library(LibraryType::Connect);
        HandshakePayload { unique_id: self.local_unique_id }.ser(msg.buffer_mut());
        self.enqueue_library(msg);
    }

    fn enqueue_connect_response(&mut self) {
        let mut msg = self.shared.pool.create_library(LibraryType::ConnectResponse);
        HandshakePayload { unique_id: self.local_unique_id }.ser(msg.buffer_mut());
        self.enqueue_library(msg);
    }

    fn enqueue_library_plain(&mut self, library_type: LibraryType) {
        let msg = self.shared.pool.create_library(library_type);
        self.enqueue_library(msg);
    }

    fn enqueue_library(&mut self, mut msg: OutgoingMessage) {
        debug_assert!(msg.len() + MessageHeader::SERIALIZED_LEN <= self.shared.config.maximum_transmission_unit);
        msg.start_sendings(1);

        let mut send = self.shared.send.lock().unwrap();
        let seq = send.channels.stamp_outgoing(MessageType::LIBRARY);
        send.push_back(SendingRecord::new(Arc::new(msg), MessageType::LIBRARY, seq));
    }
}
