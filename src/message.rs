use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::library::LibraryType;
use crate::message_header::FragmentHeader;
use crate::message_type::MessageType;
use crate::seq::SeqNr;

/// An outgoing message under construction or queued for sending.
///
/// A message is written once, handed to `send_message` (which consumes it), and recycled
///  into the pool when its last planned transmission is finished. Fragmented messages are
///  referenced by several sending records at once; `unfinished_sendings` counts them down
///  so the buffer is returned exactly once.
#[derive(Debug)]
pub struct OutgoingMessage {
    data: Vec<u8>,
    library_type: Option<LibraryType>,
    was_sent: bool,
    unfinished_sendings: AtomicU32,
}

impl OutgoingMessage {
    fn new(data: Vec<u8>, library_type: Option<LibraryType>) -> OutgoingMessage {
        OutgoingMessage {
            data,
            library_type,
            was_sent: false,
            unfinished_sendings: AtomicU32::new(0),
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// direct access for the protocol's own payload writers
    pub(crate) fn buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    pub fn write_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bit_length(&self) -> u32 {
        self.data.len() as u32 * 8
    }

    pub(crate) fn library_type(&self) -> Option<LibraryType> {
        self.library_type
    }

    pub(crate) fn was_sent(&self) -> bool {
        self.was_sent
    }

    /// marks the message as enqueued with the given number of planned transmissions
    ///  (1, or the fragment count)
    pub(crate) fn start_sendings(&mut self, count: u32) {
        self.was_sent = true;
        self.unfinished_sendings.store(count, Ordering::Release);
    }
}

/// A fully received (and, where applicable, reassembled) inbound message.
#[derive(Debug)]
pub struct IncomingMessage {
    pub msg_type: MessageType,
    pub seq_nr: SeqNr,
    pub sender: SocketAddr,
    pub data: Vec<u8>,
    /// payload length in bits as transmitted; `data` holds the rounded-up byte count
    pub bit_length: u32,
    /// set while this message is a single fragment that still awaits reassembly
    pub(crate) fragment: Option<FragmentHeader>,
}

impl IncomingMessage {
    pub(crate) fn new(
        msg_type: MessageType,
        seq_nr: SeqNr,
        sender: SocketAddr,
        data: Vec<u8>,
        bit_length: u32,
        fragment: Option<FragmentHeader>,
    ) -> IncomingMessage {
        IncomingMessage {
            msg_type,
            seq_nr,
            sender,
            data,
            bit_length,
            fragment,
        }
    }
}

/// Recycles outgoing message buffers so steady-state traffic does not allocate. Buffers in
///  excess of the configured pool size are discarded when they are returned.
pub struct MessagePool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl MessagePool {
    pub fn new(max_pool_size: usize) -> MessagePool {
        MessagePool {
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn create_message(&self, initial_capacity: usize) -> OutgoingMessage {
        let mut data = self.get_buffer();
        data.reserve(initial_capacity);
        OutgoingMessage::new(data, None)
    }

    /// creates a library message with the subtype byte already written
    pub(crate) fn create_library(&self, library_type: LibraryType) -> OutgoingMessage {
        let mut data = self.get_buffer();
        data.push(library_type.to_raw());
        OutgoingMessage::new(data, Some(library_type))
    }

    fn get_buffer(&self) -> Vec<u8> {
        let mut buffers = self.buffers.lock().unwrap();
        if let Some(buffer) = buffers.pop() {
            trace!("reusing message buffer from pool");
            return buffer;
        }
        Vec::new()
    }

    /// Counts down one finished transmission; when the last one finishes, the message's
    ///  buffer goes back into the pool. This is the only place a message is recycled.
    pub(crate) fn release_sending(&self, message: Arc<OutgoingMessage>) {
        if message.unfinished_sendings.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        match Arc::into_inner(message) {
            Some(message) => {
                let mut buffer = message.data;
                buffer.clear();

                let mut buffers = self.buffers.lock().unwrap();
                if buffers.capacity() > buffers.len() {
                    trace!("returning message buffer to pool");
                    buffers.push(buffer);
                }
                else {
                    debug!("message pool is full: discarding returned buffer");
                }
            }
            None => {
                debug!("message still referenced after its last sending finished: skipping recycle");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recycle_returns_buffer_once() {
        let pool = MessagePool::new(4);

        let mut msg = pool.create_message(16);
        msg.write(&[1, 2, 3]);
        msg.start_sendings(2);
        let msg = Arc::new(msg);

        pool.release_sending(msg.clone());
        assert_eq!(pool.buffers.lock().unwrap().len(), 0);

        pool.release_sending(msg);
        assert_eq!(pool.buffers.lock().unwrap().len(), 1);

        // the recycled buffer comes back empty
        let reused = pool.create_message(0);
        assert!(reused.is_empty());
        assert_eq!(pool.buffers.lock().unwrap().len(), 0);
    }

    #[test]
    fn test_pool_discards_beyond_capacity() {
        let pool = MessagePool::new(1);

        for _ in 0..3 {
            let mut msg = pool.create_message(0);
            msg.start_sendings(1);
            pool.release_sending(Arc::new(msg));
        }

        assert_eq!(pool.buffers.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_library_message_carries_subtype_byte() {
        let pool = MessagePool::new(1);

        let msg = pool.create_library(LibraryType::Ping);
        assert_eq!(msg.library_type(), Some(LibraryType::Ping));
        assert_eq!(msg.data(), &[LibraryType::Ping.to_raw()]);
    }
}
