//! Link statistics, compiled continuously and shipped to the far side on
//! request as a CONTROL frame.

use crate::queues::{ACK_CAPACITY, RECVQ_WORDS};

/// Counters kept by the link core.
///
/// Field order is the wire order of the statistics reply; every field is
/// serialized as a little-endian `u32`.
#[derive(Debug, Clone)]
pub struct LinkStats {
    /// Partial reassemblies discarded for exceeding the message size bound.
    pub n_bad_fins: u32,
    /// Smallest observed receive-queue free size, in bytes.
    pub min_recvq_free: u32,
    /// Largest observed number of retransmit-buffer entries.
    pub max_retx_entries: u32,
    /// Smallest observed number of free ack-queue entries.
    pub min_ackq_free: u32,
    pub n_tx_all: u32,
    pub n_tx_ack: u32,
    pub n_tx_reack: u32,
    pub n_tx_data: u32,
    pub n_tx_resent: u32,
    pub n_tx_control: u32,
    pub n_rx_all: u32,
    pub n_rx_data: u32,
    pub n_rx_good_data: u32,
    pub n_rx_ack: u32,
    pub n_rx_dup_data: u32,
    pub n_rx_dup_ack: u32,
    pub n_rx_good_ack: u32,
    pub n_rx_control: u32,
    pub n_rx_dropped: u32,
    pub n_rx_bad: u32,
    /// Frames that were neither IC nor CI while draining a reconnect.
    pub n_invalid_post_ic: u32,
}

/// Serialized size of the record.
pub const STATS_WIRE_SIZE: usize = 21 * 4;

impl LinkStats {
    pub fn new() -> LinkStats {
        LinkStats {
            n_bad_fins: 0,
            min_recvq_free: (RECVQ_WORDS * 4) as u32,
            max_retx_entries: 0,
            min_ackq_free: ACK_CAPACITY as u32,
            n_tx_all: 0,
            n_tx_ack: 0,
            n_tx_reack: 0,
            n_tx_data: 0,
            n_tx_resent: 0,
            n_tx_control: 0,
            n_rx_all: 0,
            n_rx_data: 0,
            n_rx_good_data: 0,
            n_rx_ack: 0,
            n_rx_dup_data: 0,
            n_rx_dup_ack: 0,
            n_rx_good_ack: 0,
            n_rx_control: 0,
            n_rx_dropped: 0,
            n_rx_bad: 0,
            n_invalid_post_ic: 0,
        }
    }

    pub(crate) fn note_recvq_free(&mut self, free_bytes: usize) {
        if (free_bytes as u32) < self.min_recvq_free {
            self.min_recvq_free = free_bytes as u32;
        }
    }

    pub(crate) fn note_ackq_free(&mut self, free_entries: usize) {
        if (free_entries as u32) < self.min_ackq_free {
            self.min_ackq_free = free_entries as u32;
        }
    }

    pub(crate) fn note_retx_entries(&mut self, entries: usize) {
        if (entries as u32) > self.max_retx_entries {
            self.max_retx_entries = entries as u32;
        }
    }

    /// Serialize in declaration order.
    pub fn encode(&self) -> Vec<u8> {
        let fields = [
            self.n_bad_fins,
            self.min_recvq_free,
            self.max_retx_entries,
            self.min_ackq_free,
            self.n_tx_all,
            self.n_tx_ack,
            self.n_tx_reack,
            self.n_tx_data,
            self.n_tx_resent,
            self.n_tx_control,
            self.n_rx_all,
            self.n_rx_data,
            self.n_rx_good_data,
            self.n_rx_ack,
            self.n_rx_dup_data,
            self.n_rx_dup_ack,
            self.n_rx_good_ack,
            self.n_rx_control,
            self.n_rx_dropped,
            self.n_rx_bad,
            self.n_invalid_post_ic,
        ];
        let mut bytes = Vec::with_capacity(STATS_WIRE_SIZE);
        for field in fields.iter() {
            bytes.extend_from_slice(&field.to_le_bytes());
        }
        bytes
    }
}

impl Default for LinkStats {
    fn default() -> LinkStats {
        LinkStats::new()
    }
}
