use std::sync::atomic::{AtomicU64, Ordering};

/// Per-connection traffic counters. Written by the network task, readable from any thread.
#[derive(Default, Debug)]
pub struct ConnectionStatistics {
    sent_packets: AtomicU64,
    sent_messages: AtomicU64,
    sent_bytes: AtomicU64,
    received_packets: AtomicU64,
    received_messages: AtomicU64,
    received_bytes: AtomicU64,
    resent_messages: AtomicU64,
    dropped_messages: AtomicU64,
}

impl ConnectionStatistics {
    pub(crate) fn on_packet_sent(&self, bytes: usize, num_messages: u64) {
        self.sent_packets.fetch_add(1, Ordering::Relaxed);
        self.sent_messages.fetch_add(num_messages, Ordering::Relaxed);
        self.sent_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_packet_received(&self, bytes: usize) {
        self.received_packets.fetch_add(1, Ordering::Relaxed);
        self.received_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_message_received(&self) {
        self.received_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_message_resent(&self) {
        self.resent_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// a received message that was discarded (duplicate, late sequenced arrival, parse error)
    pub(crate) fn on_message_dropped(&self) {
        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent_packets(&self) -> u64 {
        self.sent_packets.load(Ordering::Relaxed)
    }

    pub fn sent_messages(&self) -> u64 {
        self.sent_messages.load(Ordering::Relaxed)
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn received_packets(&self) -> u64 {
        self.received_packets.load(Ordering::Relaxed)
    }

    pub fn received_messages(&self) -> u64 {
        self.received_messages.load(Ordering::Relaxed)
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    pub fn resent_messages(&self) -> u64 {
        self.resent_messages.load(Ordering::Relaxed)
    }

    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }
}
