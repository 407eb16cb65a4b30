//! Bounded queues on the receive side: the byte ring holding validated
//! in-order frames, and the FIFO of sequence numbers awaiting
//! acknowledgment.

use crate::frame::{self, FrameType, Header, HW_MAX_FRAME_BYTES, HW_MAX_FRAME_WORDS, MAX_MSG_SIZE};

/// Receive ring size in words: room for two maximum messages plus headers.
pub(crate) const RECVQ_WORDS: usize = 2 * (MAX_MSG_SIZE + 4) / 4;
/// Ack FIFO capacity.
pub(crate) const ACK_CAPACITY: usize = 256;

/// Word ring of complete validated frames, in arrival order.
///
/// Frames are stored contiguously. To keep a frame from fragmenting across
/// the ring boundary, whenever fewer than [`HW_MAX_FRAME_WORDS`] remain at
/// the end of the buffer the free-running counter is bumped to the boundary.
/// Both sides apply the same rule, so producer and consumer always agree on
/// the layout.
pub(crate) struct RecvQueue {
    data: Vec<u32>,
    head: u32,
    tail: u32,
    fins: usize,
}

impl RecvQueue {
    pub fn new() -> RecvQueue {
        RecvQueue {
            data: vec![0; RECVQ_WORDS],
            head: 0,
            tail: 0,
            fins: 0,
        }
    }

    fn head_index(&self) -> usize {
        self.head as usize % RECVQ_WORDS
    }

    fn tail_index(&self) -> usize {
        self.tail as usize % RECVQ_WORDS
    }

    pub fn bytes_free(&self) -> usize {
        4 * (RECVQ_WORDS - self.head.wrapping_sub(self.tail) as usize)
    }

    /// Conservative: full means "no room for another maximum frame".
    pub fn is_full(&self) -> bool {
        self.bytes_free() < HW_MAX_FRAME_BYTES
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Number of SYN_FIN frames currently queued; nonzero means a complete
    /// message can be reassembled without waiting for the wire.
    pub fn fin_count(&self) -> usize {
        self.fins
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.fins = 0;
    }

    /// Append one validated frame. The caller has already checked
    /// [`RecvQueue::is_full`].
    pub fn put(&mut self, pkt: &[u32]) {
        let idx = self.head_index();
        self.data[idx..idx + pkt.len()].copy_from_slice(pkt);
        if let Some(header) = Header::decode(pkt[0]) {
            if header.kind == FrameType::SynFin {
                self.fins += 1;
            }
        }
        self.head = self.head.wrapping_add(pkt.len() as u32);
        if self.head_index() + HW_MAX_FRAME_WORDS >= RECVQ_WORDS {
            self.head = self.head.wrapping_add((RECVQ_WORDS - self.head_index()) as u32);
        }
    }

    /// Remove and return the oldest frame.
    pub fn get(&mut self) -> Option<Vec<u32>> {
        if self.is_empty() {
            return None;
        }
        let idx = self.tail_index();
        let words = frame::raw_words(self.data[idx]);
        let pkt = self.data[idx..idx + words].to_vec();
        if let Some(header) = Header::decode(pkt[0]) {
            if header.kind == FrameType::SynFin {
                self.fins -= 1;
            }
        }
        self.tail = self.tail.wrapping_add(words as u32);
        if self.tail_index() + HW_MAX_FRAME_WORDS >= RECVQ_WORDS {
            self.tail = self.tail.wrapping_add((RECVQ_WORDS - self.tail_index()) as u32);
        }
        Some(pkt)
    }
}

/// FIFO of sequence numbers to acknowledge.
pub(crate) struct AckQueue {
    data: [u16; ACK_CAPACITY],
    head: u32,
    tail: u32,
}

impl AckQueue {
    pub fn new() -> AckQueue {
        AckQueue {
            data: [0; ACK_CAPACITY],
            head: 0,
            tail: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.head.wrapping_sub(self.tail) as usize
    }

    pub fn is_full(&self) -> bool {
        self.len() == ACK_CAPACITY
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    pub fn push(&mut self, seqn: u16) {
        debug_assert!(!self.is_full());
        self.data[self.head as usize % ACK_CAPACITY] = seqn;
        self.head = self.head.wrapping_add(1);
    }

    pub fn pop(&mut self) -> Option<u16> {
        if self.is_empty() {
            return None;
        }
        let seqn = self.data[self.tail as usize % ACK_CAPACITY];
        self.tail = self.tail.wrapping_add(1);
        Some(seqn)
    }
}
