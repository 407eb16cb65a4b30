//! The link core: hardware frame I/O over the dual-ported rings, the IC/CI
//! connection handshake, the receive scan loop, message segmentation and
//! reassembly, and the public API.
//!
//! Everything here is single-threaded cooperative. The FPGA is the only
//! concurrent party, and the ring pointers are the only shared state;
//! publishing a pointer is the atomic handoff in each direction.

use std::cmp;

use log::{debug, trace, warn};

use crate::bus::{self, CommBus, Tick};
use crate::frame::{self, FrameType, Header, HW_MAX_PAYLOAD_BYTES, MAX_MSG_SIZE};
use crate::queues::{AckQueue, RecvQueue, ACK_CAPACITY};
use crate::retx::RetxBuf;
use crate::stats::LinkStats;
use crate::Error;

/// Age of the oldest unacknowledged frame that triggers a go-back
/// retransmit of the whole outstanding window.
///
/// Sized to the worst-case round trip at sustained throughput: roughly
/// 32 kB can be outstanding across both stations, and at ~45 kB/s an ack
/// can legitimately take ~700 ms to arrive.
pub const RETRANSMIT_TIMEOUT_MS: u32 = 800;
/// Stale-retransmit age past which a full receive queue is drained
/// aggressively to reach the acks queued behind it.
pub const UNSTICK_THRESHOLD_MS: u32 = 80;
/// Handshake retry interval while unconnected.
pub const IC_RETRY_MS: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unconnected,
    Connected,
}

/// A reassembled application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    /// Type tag of the terminating frame.
    pub kind: u8,
    pub data: Vec<u8>,
}

/// One end of the twisted-pair link.
///
/// All protocol state lives in this value; tests run two of them against an
/// in-memory wire. Blocking calls (`send`, `receive`) spin cooperatively on
/// the bus; `poll` is the non-blocking driver step for callers that bring
/// their own scheduling.
pub struct Link<B: CommBus> {
    name: String,
    bus: B,
    state: State,
    connect_flag: bool,
    ic_sent: bool,
    ic_last: Tick,
    rx_seqn: u16,
    tx_seqn: u16,
    retx: RetxBuf,
    recvq: RecvQueue,
    ackq: AckQueue,
    asm: Vec<u8>,
    asm_len: usize,
    stats: LinkStats,
    last_tick: Tick,
}

impl<B: CommBus> Link<B> {
    pub fn new(name: String, bus: B) -> Link<B> {
        let last_tick = bus.ticks();
        Link {
            name,
            bus,
            state: State::Unconnected,
            connect_flag: false,
            ic_sent: false,
            ic_last: Tick(0),
            rx_seqn: 0,
            tx_seqn: 0,
            retx: RetxBuf::new(),
            recvq: RecvQueue::new(),
            ackq: AckQueue::new(),
            asm: vec![0; MAX_MSG_SIZE],
            asm_len: 0,
            stats: LinkStats::new(),
            last_tick,
        }
    }

    // ---- hardware frame I/O ------------------------------------------------

    fn hw_space_used(&self) -> u16 {
        self.bus.tx_wadr().wrapping_sub(self.bus.tx_radr())
    }

    fn hw_space_remaining(&self) -> u16 {
        bus::DP_WORDS - self.hw_space_used()
    }

    fn has_hw_space(&self, header: u32) -> bool {
        self.hw_space_remaining() as usize >= frame::raw_words(header)
    }

    /// Copy one frame into the TX ring and publish the write pointer.
    /// Blocks until the firmware is up and the ring has room.
    fn hw_send(&self, pkt: &[u32]) {
        while self.bus.status() & bus::STATUS_AVAIL == 0 {}
        while !self.has_hw_space(pkt[0]) {}
        let mut wadr = self.bus.tx_wadr();
        for &word in pkt {
            self.bus.tx_write(wadr % bus::DP_WORDS, word);
            wadr = wadr.wrapping_add(1);
        }
        self.bus.set_tx_wadr(wadr);
    }

    fn hw_frame_ready(&self) -> bool {
        while self.bus.status() & bus::STATUS_AVAIL == 0 {}
        self.bus.status() & bus::STATUS_RX_PKT_RCVD != 0
    }

    /// Pull the next frame out of the RX ring and publish the read pointer.
    /// The header's length field is not validated here; a bad frame still
    /// has to be stepped over to keep the ring in sync.
    fn hw_receive(&mut self) -> Vec<u32> {
        while !self.hw_frame_ready() {}
        let mut radr = self.bus.rx_radr();
        let header = self.bus.rx_read(radr % bus::DP_WORDS);
        radr = radr.wrapping_add(1);
        let words = frame::raw_words(header);
        let mut pkt = Vec::with_capacity(words);
        pkt.push(header);
        for _ in 1..words {
            pkt.push(self.bus.rx_read(radr % bus::DP_WORDS));
            radr = radr.wrapping_add(1);
        }
        self.bus.set_rx_radr(radr);
        self.stats.n_rx_all += 1;
        pkt
    }

    // ---- connection state machine ------------------------------------------

    fn connect_init(&mut self) {
        self.rx_seqn = 0;
        self.tx_seqn = 0;
        self.recvq.clear();
        self.asm_len = 0;
        self.retx.clear();
        self.ackq.clear();
        self.state = State::Connected;
        debug!(target: self.name.as_str(), "connected, sequence numbers reset");
    }

    fn enter_unconnected(&mut self) {
        self.state = State::Unconnected;
        self.rx_seqn = 0;
        self.tx_seqn = 0;
        self.recvq.clear();
        self.asm_len = 0;
        self.retx.clear();
        self.ackq.clear();
        self.ic_sent = false;
    }

    fn send_ic(&mut self) {
        let header = Header::new(FrameType::Ic, 0, 0).encode();
        if self.has_hw_space(header) {
            trace!(target: self.name.as_str(), "snd IC");
            self.hw_send(&[header]);
        }
    }

    fn send_ci(&mut self) {
        let header = Header::new(FrameType::Ci, 0, 0).encode();
        if self.has_hw_space(header) {
            trace!(target: self.name.as_str(), "snd CI");
            self.hw_send(&[header]);
        }
    }

    /// One handshake iteration. Sends (or re-sends) our IC, then reacts to
    /// at most one incoming frame; never waits for the far side.
    fn connect_step(&mut self) {
        let now = self.bus.ticks();
        if !self.ic_sent {
            self.send_ic();
            self.ic_sent = true;
            self.ic_last = now;
        } else if now.age_since(self.ic_last) > Tick::from_millis(IC_RETRY_MS).0 {
            debug!(target: self.name.as_str(), "handshake retry");
            self.send_ic();
            self.ic_last = now;
        }
        if !self.hw_frame_ready() {
            return;
        }
        let pkt = self.hw_receive();
        match Header::decode(pkt[0]).map(|h| h.kind) {
            Some(FrameType::Ci) => {
                debug!(target: self.name.as_str(), "got CI");
                self.connect_init();
                self.send_ci();
            }
            Some(FrameType::Ic) => {
                debug!(target: self.name.as_str(), "got IC");
                // Drain duplicate handshake frames already in flight before
                // our CI can possibly arrive over there.
                while self.hw_frame_ready() {
                    let pkt = self.hw_receive();
                    match Header::decode(pkt[0]).map(|h| h.kind) {
                        Some(FrameType::Ci) => {
                            debug!(target: self.name.as_str(), "got CI behind the IC");
                            self.connect_init();
                            break;
                        }
                        Some(FrameType::Ic) => {
                            trace!(target: self.name.as_str(), "dup IC");
                        }
                        _ => {
                            self.stats.n_invalid_post_ic += 1;
                            break;
                        }
                    }
                    if !self.hw_frame_ready() {
                        // Give a trailing frame time to cross the wire.
                        self.bus.usleep(200);
                    }
                }
                self.send_ci();
                self.ic_last = now;
            }
            _ => {
                // Stale data from the previous session.
                self.stats.n_rx_bad += 1;
            }
        }
    }

    fn wait_connected(&mut self) {
        while self.state != State::Connected {
            self.connect_step();
        }
    }

    // ---- receive scan loop -------------------------------------------------

    fn recvq_full(&mut self) -> bool {
        let free = self.recvq.bytes_free();
        self.stats.note_recvq_free(free);
        self.recvq.is_full()
    }

    fn ack_push(&mut self, seqn: u16) {
        self.ackq.push(seqn);
        self.stats.note_ackq_free(ACK_CAPACITY - self.ackq.len());
    }

    /// Drain the ack queue onto the wire, one `len=0` ACK frame per entry,
    /// stopping as soon as the TX ring has no room. Acks never enter the
    /// retransmit buffer; a lost ack is repaired by the duplicate data frame
    /// it provokes.
    fn flush_acks(&mut self) {
        let probe = Header::ack(0).encode();
        while !self.ackq.is_empty() && self.has_hw_space(probe) {
            if let Some(seqn) = self.ackq.pop() {
                self.hw_send(&[Header::ack(seqn).encode()]);
                self.stats.n_tx_all += 1;
                self.stats.n_tx_ack += 1;
            }
        }
    }

    fn send_stats(&mut self) {
        let payload = self.stats.encode();
        let header = Header::new(FrameType::Control, payload.len() as u16, 0);
        if self.has_hw_space(header.encode()) {
            let pkt = frame::build_frame(header, &payload);
            self.hw_send(&pkt);
            self.stats.n_tx_control += 1;
            self.stats.n_tx_all += 1;
        }
    }

    /// Pull frames out of the hardware while any are pending and, unless
    /// `aggressive`, both the receive queue and the ack queue have room.
    /// Aggressive scans may drop data frames on the floor; they exist to
    /// reach acks wedged behind data we cannot queue. Returns the number of
    /// frames processed.
    fn scan(&mut self, aggressive: bool) -> usize {
        if self.state != State::Connected {
            return 0;
        }
        let mut npackets = 0;
        while self.hw_frame_ready() && (aggressive || (!self.recvq_full() && !self.ackq.is_full())) {
            let pkt = self.hw_receive();
            self.dispatch(&pkt);
            npackets += 1;
            if self.state != State::Connected {
                break;
            }
            self.flush_acks();
        }
        self.flush_acks();
        npackets
    }

    fn dispatch(&mut self, pkt: &[u32]) {
        let header = match Header::decode(pkt[0]) {
            Some(header) => header,
            None => {
                warn!(target: self.name.as_str(), "bad packet: hdr={:#010x}", pkt[0]);
                self.stats.n_rx_bad += 1;
                return;
            }
        };
        let len = header.len as usize;
        match header.kind {
            FrameType::Ack if len == 0 => {
                self.stats.n_rx_ack += 1;
                if self.retx.delete(header.seqn) {
                    trace!(target: self.name.as_str(), "good ack seqn={}", header.seqn);
                    self.stats.n_rx_good_ack += 1;
                } else {
                    trace!(target: self.name.as_str(), "dup ack seqn={}", header.seqn);
                    self.stats.n_rx_dup_ack += 1;
                }
            }
            FrameType::Control if len <= HW_MAX_PAYLOAD_BYTES => {
                self.stats.n_rx_control += 1;
                let payload = frame::payload_bytes(pkt, len);
                if payload.len() == 1 && payload[0] == 0 {
                    debug!(target: self.name.as_str(), "statistics requested");
                    self.send_stats();
                }
            }
            FrameType::Ic if len == 0 => {
                debug!(target: self.name.as_str(), "got IC while connected, resetting");
                self.enter_unconnected();
                self.connect_flag = true;
            }
            FrameType::Ci if len == 0 => {
                // Leftover from the handshake.
            }
            FrameType::Cont | FrameType::SynFin if len <= HW_MAX_PAYLOAD_BYTES => {
                self.stats.n_rx_data += 1;
                // Distance from the next expected sequence number; signed
                // 16-bit so wraparound comes out right.
                let delta = header.seqn.wrapping_sub(self.rx_seqn) as i16;
                if delta < 0 && !self.ackq.is_full() {
                    // Already accepted once; the ack must have been lost.
                    trace!(target: self.name.as_str(), "re-ack seqn={}", header.seqn);
                    self.stats.n_rx_dup_data += 1;
                    self.stats.n_tx_reack += 1;
                    self.ack_push(header.seqn);
                } else if delta == 0 && !self.recvq_full() && !self.ackq.is_full() {
                    self.stats.n_rx_good_data += 1;
                    self.ack_push(header.seqn);
                    self.rx_seqn = header.seqn.wrapping_add(1);
                    self.recvq.put(pkt);
                } else {
                    debug!(
                        target: self.name.as_str(),
                        "dropped: delta={}, recvq_full={}, ackq_full={}",
                        delta,
                        self.recvq.is_full(),
                        self.ackq.is_full()
                    );
                    self.stats.n_rx_dropped += 1;
                }
            }
            _ => {
                warn!(target: self.name.as_str(), "bad packet: hdr={:#010x}", pkt[0]);
                self.stats.n_rx_bad += 1;
            }
        }
    }

    // ---- retransmission ----------------------------------------------------

    /// Put retransmit-buffer contents on the hardware, cursor to head,
    /// stamping each frame's send time. Stops early when the TX ring has no
    /// room; the cursor stays put and the next flush resumes there.
    fn flush_retx(&mut self) {
        loop {
            let (pkt, first) = match self.retx.peek_flush() {
                Some(step) => step,
                None => break,
            };
            if !self.has_hw_space(pkt[0]) {
                break;
            }
            self.hw_send(&pkt);
            self.retx.mark_sent(self.bus.ticks());
            self.stats.n_tx_all += 1;
            if first {
                self.stats.n_tx_data += 1;
            } else {
                self.stats.n_tx_resent += 1;
            }
        }
    }

    /// Once the oldest unacked frame goes stale, stop sending new data and
    /// re-send the whole outstanding window, then drain the receive path
    /// aggressively to get at the acks. Returns whether it acted.
    fn timeout_retransmit(&mut self, now: Tick) -> bool {
        if self
            .retx
            .tail_expired(now, Tick::from_millis(RETRANSMIT_TIMEOUT_MS).0)
        {
            debug!(target: self.name.as_str(), "retransmit timeout, resending window");
            self.retx.rewind();
            self.flush_retx();
            self.scan(true);
            return true;
        }
        false
    }

    /// Deadlock breaker: the receive queue is full, the hardware has more
    /// frames waiting, and an unacked frame of ours has gone stale. The
    /// acks that would free our retransmit buffer are stuck behind data we
    /// cannot queue, so scan aggressively and let data frames drop.
    fn unstick_rx(&mut self, now: Tick) {
        if self.recvq_full()
            && self.hw_frame_ready()
            && self
                .retx
                .any_older_than(now, Tick::from_millis(UNSTICK_THRESHOLD_MS).0)
        {
            debug!(target: self.name.as_str(), "receive queue wedged, scanning aggressively");
            self.scan(true);
            self.flush_acks();
        }
    }

    /// Timer-driven recovery, edge-triggered on the hardware tick.
    fn run_periodic(&mut self) {
        let now = self.bus.ticks();
        if now != self.last_tick {
            self.timeout_retransmit(now);
            self.unstick_rx(now);
            // The timeout and unstick checks only see the transmitted
            // window; frames a flush left behind for lack of TX ring space
            // are retried here as the hardware drains.
            if self.retx.flush_pending() {
                self.flush_retx();
            }
            self.last_tick = now;
        }
    }

    // ---- reassembly --------------------------------------------------------

    /// Assemble queued frames into a message. CONT payloads accumulate;
    /// a SYN_FIN completes the message. A partial message that would exceed
    /// the size bound is discarded and counted.
    fn fill_msg(&mut self) -> Option<Msg> {
        while let Some(pkt) = self.recvq.get() {
            let header = match Header::decode(pkt[0]) {
                Some(header) => header,
                None => continue,
            };
            let len = header.len as usize;
            if self.asm_len + len > MAX_MSG_SIZE {
                warn!(target: self.name.as_str(), "reassembly overflow, dropping partial message");
                self.stats.n_bad_fins += 1;
                self.asm_len = 0;
                return None;
            }
            frame::copy_payload(&pkt, &mut self.asm[self.asm_len..self.asm_len + len]);
            self.asm_len += len;
            if header.kind == FrameType::Cont {
                continue;
            }
            let data = self.asm[..self.asm_len].to_vec();
            self.asm_len = 0;
            trace!(target: self.name.as_str(), "message complete: {} bytes", data.len());
            return Some(Msg {
                kind: header.kind as u8,
                data,
            });
        }
        None
    }

    // ---- public API --------------------------------------------------------

    /// Queue an application message and block until every segment has
    /// entered the retransmit buffer and been flushed to the hardware.
    ///
    /// `kind` is informational only; the wire carries CONT/SYN_FIN framing.
    /// If the connection resets while this call is in progress the message
    /// is stale on arrival, so the call returns `Ok` with no further
    /// transmission.
    pub fn send(&mut self, kind: u8, data: &[u8]) -> Result<(), Error> {
        if data.len() > MAX_MSG_SIZE {
            return Err(Error::Oversize(data.len() - MAX_MSG_SIZE));
        }
        self.wait_connected();
        self.connect_flag = false;
        trace!(target: self.name.as_str(), "send: kind={} len={}", kind, data.len());
        let mut idx = 0;
        loop {
            let nleft = data.len() - idx;
            let take = cmp::min(nleft, HW_MAX_PAYLOAD_BYTES);
            let last = take == nleft;
            let tag = if last {
                FrameType::SynFin
            } else {
                FrameType::Cont
            };
            // Two barriers per segment: a retransmit slot, then (at flush
            // time) hardware ring space.
            loop {
                // Speculatively clear acked frames out of the window.
                self.scan(false);
                if self.connect_flag {
                    return Ok(());
                }
                let now = self.bus.ticks();
                if self.timeout_retransmit(now) {
                    self.run_periodic();
                    continue;
                }
                let header = Header::new(tag, take as u16, self.tx_seqn);
                if self.retx.push(header, &data[idx..idx + take]) {
                    self.tx_seqn = self.tx_seqn.wrapping_add(1);
                    self.stats.note_retx_entries(self.retx.live_entries());
                    idx += take;
                    break;
                }
                debug!(target: self.name.as_str(), "retransmit buffer full, draining");
                if self.scan(false) == 0 {
                    if self.connect_flag {
                        return Ok(());
                    }
                    self.flush_acks();
                    self.run_periodic();
                }
                if self.connect_flag {
                    return Ok(());
                }
            }
            if last {
                break;
            }
        }
        // Every segment is in the retransmit buffer; now wait out hardware
        // backpressure until every one of them is on the wire.
        loop {
            self.flush_retx();
            if !self.retx.flush_pending() {
                break;
            }
            if self.scan(false) == 0 {
                self.flush_acks();
                self.run_periodic();
            }
            if self.connect_flag {
                break;
            }
        }
        Ok(())
    }

    /// Block until a complete message has been reassembled.
    pub fn receive(&mut self) -> Msg {
        loop {
            self.wait_connected();
            if let Some(msg) = self.fill_msg() {
                return msg;
            }
            if self.scan(false) == 0 {
                while self.state == State::Connected
                    && !self.hw_frame_ready()
                    && self.recvq.is_empty()
                {
                    self.run_periodic();
                    self.flush_acks();
                }
            }
        }
    }

    /// Non-blocking receive: drives one scan step, then returns the next
    /// complete message if one is ready.
    pub fn try_receive(&mut self) -> Result<Msg, Error> {
        if self.state != State::Connected {
            self.connect_step();
            return Err(Error::NoMsg);
        }
        self.run_periodic();
        self.scan(false);
        self.flush_acks();
        self.fill_msg().ok_or(Error::NoMsg)
    }

    /// Non-blocking: is a complete message already waiting in the receive
    /// queue?
    pub fn msg_ready(&mut self) -> bool {
        if self.state != State::Connected {
            self.connect_step();
            return false;
        }
        self.run_periodic();
        self.scan(false);
        self.flush_acks();
        self.recvq.fin_count() > 0
    }

    /// One cooperative driver step: a handshake iteration while
    /// unconnected, otherwise a scan pass plus the periodic timers and
    /// another try at any flush that stalled on TX ring space.
    pub fn poll(&mut self) {
        if self.state != State::Connected {
            self.connect_step();
            return;
        }
        self.scan(false);
        self.run_periodic();
        if self.retx.flush_pending() {
            self.flush_retx();
        }
        self.flush_acks();
    }

    pub fn is_connected(&self) -> bool {
        self.state == State::Connected
    }

    /// Live (unacknowledged) entries in the retransmit buffer.
    pub fn unacked_frames(&self) -> usize {
        self.retx.live_entries()
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// Hardware CRC error count, as reported by the FPGA.
    pub fn crc_errors(&self) -> u32 {
        self.bus.crc_errors()
    }

    /// Is the communications firmware present?
    pub fn is_comm_avail(&self) -> bool {
        self.bus.status() & bus::STATUS_AVAIL != 0
    }

    /// Wait for the TX ring to drain, then raise the reboot request bit.
    /// The FPGA answers through [`Link::is_reboot_granted`].
    pub fn request_reboot(&self) {
        while self.hw_space_used() != 0 {}
        let reg = self.bus.ctrl();
        self.bus.set_ctrl(reg | bus::CTRL_REBOOT_REQUEST);
    }

    pub fn is_reboot_granted(&self) -> bool {
        self.bus.status() & bus::STATUS_REBOOT_GRANTED != 0
    }

    /// Program the comm front-end parameters (signal level bounds, receive
    /// threshold and delays). Register plumbing only; no protocol effect.
    pub fn set_comm_params(
        &self,
        thresh: u32,
        dacmax: u32,
        rdelay: u32,
        sdelay: u32,
        minclev: u32,
        maxclev: u32,
    ) {
        self.bus.set_clev((minclev & 0x3ff) | ((maxclev & 0x3ff) << 16));
        self.bus.set_thr_del(
            (thresh & 0xff) | ((dacmax & 0x3) << 8) | ((rdelay & 0xff) << 16) | ((sdelay & 0xff) << 24),
        );
    }
}
