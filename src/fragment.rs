use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::message::IncomingMessage;
use crate::message_header::FragmentHeader;

/// Outcome of storing one inbound fragment.
#[derive(Debug)]
pub enum FragmentInsert {
    /// all fragments of the group have arrived; the reassembled message is returned
    Completed(IncomingMessage),
    Partial,
    Duplicate,
    Invalid,
}

/// Reassembly bookkeeping for one fragment group.
///
/// The fragment stride is not on the wire; it is learned from the first non-terminal
///  fragment (all of which are full-size). A terminal fragment that arrives before the
///  stride is known is held aside - its received bit is set for duplicate suppression -
///  and placed once a non-terminal fragment fixes the stride.
#[derive(Debug)]
struct FragmentationState {
    total: u16,
    fragment_size: usize,
    received_bits: Vec<u64>,
    received_count: u16,
    pending_last: Option<Vec<u8>>,
}

impl FragmentationState {
    fn new(total: u16) -> FragmentationState {
        FragmentationState {
            total,
            fragment_size: 0,
            received_bits: vec![0; (total as usize + 63) / 64],
            received_count: 0,
            pending_last: None,
        }
    }

    fn is_received(&self, index: u16) -> bool {
        self.received_bits[index as usize / 64] & (1u64 << (index % 64)) != 0
    }

    fn mark_received(&mut self, index: u16) {
        self.received_bits[index as usize / 64] |= 1u64 << (index % 64);
        self.received_count += 1;
    }
}

/// Collects inbound fragments per group id until a group is complete.
pub struct FragmentAssembler {
    groups: FxHashMap<u16, (IncomingMessage, FragmentationState)>,
}

impl FragmentAssembler {
    pub fn new() -> FragmentAssembler {
        FragmentAssembler {
            groups: FxHashMap::default(),
        }
    }

    pub fn num_pending_groups(&self) -> usize {
        self.groups.len()
    }

    /// Stores one fragment, creating the group on first contact via `make_message`.
    pub fn insert(
        &mut self,
        header: FragmentHeader,
        payload: &[u8],
        make_message: impl FnOnce() -> IncomingMessage,
    ) -> FragmentInsert {
        if header.total == 0 || header.index >= header.total {
            warn!("fragment index {} out of range for group {} with {} fragments - dropping", header.index, header.group, header.total);
            return FragmentInsert::Invalid;
        }

        let (message, state) = self
            .groups
            .entry(header.group)
            .or_insert_with(|| (make_message(), FragmentationState::new(header.total)));

        if state.total != header.total {
            warn!("fragment group {} announced {} fragments, previously {} - dropping", header.group, header.total, state.total);
            return FragmentInsert::Invalid;
        }
        if state.is_received(header.index) {
            return FragmentInsert::Duplicate;
        }

        let terminal = header.index + 1 == state.total;
        if terminal && state.total > 1 && state.fragment_size == 0 {
            // stride still unknown: hold the bytes, the bit keeps duplicates out
            state.mark_received(header.index);
            state.pending_last = Some(payload.to_vec());
        }
        else {
            if state.fragment_size == 0 {
                state.fragment_size = payload.len();
            }
            else if !terminal && payload.len() != state.fragment_size {
                warn!("group {} fragment {} has length {}, expected stride {} - dropping", header.group, header.index, payload.len(), state.fragment_size);
                return FragmentInsert::Invalid;
            }

            Self::place(message, header.index as usize * state.fragment_size, payload);
            state.mark_received(header.index);

            if let Some(last) = state.pending_last.take() {
                Self::place(message, (state.total as usize - 1) * state.fragment_size, &last);
            }
        }

        if state.received_count == state.total && state.pending_last.is_none() {
            let (mut message, _) = self.groups.remove(&header.group).unwrap();
            message.fragment = None;
            debug!("fragment group {} complete: {} bytes", header.group, message.data.len());
            return FragmentInsert::Completed(message);
        }
        FragmentInsert::Partial
    }

    fn place(message: &mut IncomingMessage, offset: usize, payload: &[u8]) {
        let end = offset + payload.len();
        if message.data.len() < end {
            message.data.resize(end, 0);
        }
        message.data[offset..end].copy_from_slice(payload);

        // the bit length only grows when this fragment extends the highest received position
        let end_bits = (end * 8) as u32;
        if end_bits > message.bit_length {
            message.bit_length = end_bits;
        }
    }
}

/// Number of fragments a payload splits into for the given chunk size; the last fragment
///  may be shorter.
pub fn fragment_count(payload_len: usize, chunk: usize) -> usize {
    (payload_len + chunk - 1) / chunk
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_type::MessageType;
    use crate::seq::SeqNr;
    use rstest::rstest;
    use std::net::SocketAddr;

    fn make_message() -> IncomingMessage {
        IncomingMessage::new(
            MessageType::from_raw(67).unwrap(),
            SeqNr::ZERO,
            SocketAddr::from(([127, 0, 0, 1], 9000)),
            Vec::new(),
            0,
            Some(FragmentHeader { group: 1, total: 3, index: 0 }),
        )
    }

    fn header(group: u16, total: u16, index: u16) -> FragmentHeader {
        FragmentHeader { group, total, index }
    }

    fn chunks(data: &[u8], chunk: usize) -> Vec<&[u8]> {
        data.chunks(chunk).collect()
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2])]
    #[case::reverse(vec![2, 1, 0])]
    #[case::last_first(vec![2, 0, 1])]
    #[case::middle_first(vec![1, 2, 0])]
    fn test_reassembly_orderings(#[case] arrival: Vec<u16>) {
        let original: Vec<u8> = (0..4000).map(|i| (i % 251) as u8).collect();
        let parts = chunks(&original, 1402);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 1402);
        assert_eq!(parts[2].len(), 1196);

        let mut assembler = FragmentAssembler::new();

        let mut completed = None;
        for (n, &index) in arrival.iter().enumerate() {
            match assembler.insert(header(7, 3, index), parts[index as usize], make_message) {
                FragmentInsert::Completed(msg) => {
                    assert_eq!(n, arrival.len() - 1, "completed before all fragments arrived");
                    completed = Some(msg);
                }
                FragmentInsert::Partial => {
                    assert!(n < arrival.len() - 1);
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        let msg = completed.expect("group never completed");
        assert_eq!(msg.data, original);
        assert_eq!(msg.bit_length, 4000 * 8);
        assert!(msg.fragment.is_none());
        assert_eq!(assembler.num_pending_groups(), 0);
    }

    #[test]
    fn test_duplicate_fragment() {
        let mut assembler = FragmentAssembler::new();

        assert!(matches!(assembler.insert(header(1, 3, 0), &[1; 10], make_message), FragmentInsert::Partial));
        assert!(matches!(assembler.insert(header(1, 3, 0), &[1; 10], make_message), FragmentInsert::Duplicate));

        // a held-aside terminal fragment is duplicate-suppressed too
        assert!(matches!(assembler.insert(header(2, 3, 2), &[2; 4], make_message), FragmentInsert::Partial));
        assert!(matches!(assembler.insert(header(2, 3, 2), &[2; 4], make_message), FragmentInsert::Duplicate));
    }

    #[rstest]
    #[case::index_out_of_range(3, 3)]
    #[case::zero_total(0, 0)]
    fn test_invalid_header(#[case] total: u16, #[case] index: u16) {
        let mut assembler = FragmentAssembler::new();
        assert!(matches!(assembler.insert(header(1, total, index), &[0; 4], make_message), FragmentInsert::Invalid));
    }

    #[test]
    fn test_total_mismatch_rejected() {
        let mut assembler = FragmentAssembler::new();
        assert!(matches!(assembler.insert(header(1, 3, 0), &[0; 4], make_message), FragmentInsert::Partial));
        assert!(matches!(assembler.insert(header(1, 4, 1), &[0; 4], make_message), FragmentInsert::Invalid));
    }

    #[test]
    fn test_bit_length_grows_only_at_the_end() {
        let mut assembler = FragmentAssembler::new();

        assert!(matches!(assembler.insert(header(1, 3, 1), &[1; 10], make_message), FragmentInsert::Partial));
        let (msg, _) = assembler.groups.get(&1).unwrap();
        assert_eq!(msg.bit_length, 20 * 8);

        // fragment 0 fills a gap below the highest received position
        assert!(matches!(assembler.insert(header(1, 3, 0), &[2; 10], make_message), FragmentInsert::Partial));
        let (msg, _) = assembler.groups.get(&1).unwrap();
        assert_eq!(msg.bit_length, 20 * 8);
    }

    #[test]
    fn test_single_fragment_group() {
        let mut assembler = FragmentAssembler::new();
        match assembler.insert(header(9, 1, 0), &[5; 8], make_message) {
            FragmentInsert::Completed(msg) => assert_eq!(msg.data, vec![5; 8]),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_interleaved_groups() {
        let mut assembler = FragmentAssembler::new();

        assert!(matches!(assembler.insert(header(1, 2, 0), &[1; 6], make_message), FragmentInsert::Partial));
        assert!(matches!(assembler.insert(header(2, 2, 0), &[2; 6], make_message), FragmentInsert::Partial));
        assert_eq!(assembler.num_pending_groups(), 2);

        assert!(matches!(assembler.insert(header(2, 2, 1), &[3; 2], make_message), FragmentInsert::Completed(_)));
        assert!(matches!(assembler.insert(header(1, 2, 1), &[4; 2], make_message), FragmentInsert::Completed(_)));
        assert_eq!(assembler.num_pending_groups(), 0);
    }

    #[rstest]
    #[case(4000, 1402, 3)]
    #[case(1402, 1402, 1)]
    #[case(1403, 1402, 2)]
    #[case(1, 1402, 1)]
    fn test_fragment_count(#[case] len: usize, #[case] chunk: usize, #[case] expected: usize) {
        assert_eq!(fragment_count(len, chunk), expected);
    }
}
