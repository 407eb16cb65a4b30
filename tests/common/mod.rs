//! Test harness: two in-memory FPGA comm endpoints joined by a wire that
//! can drop, duplicate and delay frames, with a manually advanced clock.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use domlink::{
    CommBus, Link, Tick, CTRL_REBOOT_REQUEST, DP_WORDS, STATUS_AVAIL, STATUS_REBOOT_GRANTED,
    STATUS_RX_PKT_RCVD,
};

pub const A: usize = 0;
pub const B: usize = 1;

pub fn frame_type(header: u32) -> u32 {
    (header >> 12) & 0x7
}

pub fn frame_len(header: u32) -> u32 {
    header & 0xfff
}

pub fn frame_seqn(header: u32) -> u16 {
    (header >> 16) as u16
}

struct EndPoint {
    tx_ring: Vec<u32>,
    tx_wadr: u16,
    tx_radr: u16,
    rx_ring: Vec<u32>,
    rx_wadr: u16,
    rx_radr: u16,
    ctrl: u32,
}

impl EndPoint {
    fn new() -> EndPoint {
        EndPoint {
            tx_ring: vec![0; DP_WORDS as usize],
            tx_wadr: 0,
            tx_radr: 0,
            rx_ring: vec![0; DP_WORDS as usize],
            rx_wadr: 0,
            rx_radr: 0,
            ctrl: 0,
        }
    }
}

/// Per-direction fault hooks, called with each frame's header word and the
/// current clock.
#[derive(Default)]
pub struct Faults {
    /// Return true to drop the frame.
    pub drop: Option<Box<dyn FnMut(u32, u32) -> bool>>,
    /// Return true to deliver the frame twice.
    pub dup: Option<Box<dyn FnMut(u32, u32) -> bool>>,
    /// Return Some(ticks) to hold the frame back that long.
    pub delay: Option<Box<dyn FnMut(u32, u32) -> Option<u32>>>,
}

pub struct Net {
    ends: [EndPoint; 2],
    pub clock: u32,
    pub faults: [Faults; 2],
    /// Every frame each side published, pre-fault, full words.
    pub tx_log: [Vec<Vec<u32>>; 2],
    delayed: Vec<(usize, u32, Vec<u32>)>,
}

impl Net {
    pub fn new() -> Rc<RefCell<Net>> {
        Rc::new(RefCell::new(Net {
            ends: [EndPoint::new(), EndPoint::new()],
            clock: 0,
            faults: [Faults::default(), Faults::default()],
            tx_log: [Vec::new(), Vec::new()],
            delayed: Vec::new(),
        }))
    }

    fn deliver(end: &mut EndPoint, frame: &[u32]) {
        let mut wadr = end.rx_wadr;
        for &word in frame {
            end.rx_ring[wadr as usize % DP_WORDS as usize] = word;
            wadr = wadr.wrapping_add(1);
        }
        end.rx_wadr = wadr;
    }

    /// Move every complete published frame across the wire, applying the
    /// fault hooks. Runs on each TX pointer publish.
    fn pump(&mut self) {
        for side in 0..2 {
            loop {
                let frame = {
                    let end = &mut self.ends[side];
                    if end.tx_wadr == end.tx_radr {
                        break;
                    }
                    let mut radr = end.tx_radr;
                    let header = end.tx_ring[radr as usize % DP_WORDS as usize];
                    let words = 1 + ((header & 0xfff) as usize + 3) / 4;
                    let mut frame = Vec::with_capacity(words);
                    for _ in 0..words {
                        frame.push(end.tx_ring[radr as usize % DP_WORDS as usize]);
                        radr = radr.wrapping_add(1);
                    }
                    end.tx_radr = radr;
                    frame
                };
                self.tx_log[side].push(frame.clone());
                let header = frame[0];
                let clock = self.clock;
                let dst = 1 - side;
                if let Some(hook) = self.faults[side].drop.as_mut() {
                    if hook(header, clock) {
                        continue;
                    }
                }
                let mut copies = 1;
                if let Some(hook) = self.faults[side].dup.as_mut() {
                    if hook(header, clock) {
                        copies = 2;
                    }
                }
                let due = match self.faults[side].delay.as_mut() {
                    Some(hook) => hook(header, clock).map(|d| clock + d),
                    None => None,
                };
                for _ in 0..copies {
                    match due {
                        Some(at) => self.delayed.push((dst, at, frame.clone())),
                        None => Self::deliver(&mut self.ends[dst], &frame),
                    }
                }
            }
        }
    }

    /// Advance the shared clock, releasing delayed frames that come due.
    pub fn advance(&mut self, ticks: u32) {
        self.clock += ticks;
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].1 <= self.clock {
                let (dst, _, frame) = self.delayed.remove(i);
                Self::deliver(&mut self.ends[dst], &frame);
            } else {
                i += 1;
            }
        }
    }

    /// Place a crafted frame directly into a side's RX ring.
    pub fn inject(&mut self, dst: usize, frame: &[u32]) {
        Self::deliver(&mut self.ends[dst], frame);
    }

    /// Power-cycle one endpoint's comm hardware.
    pub fn reset_side(&mut self, side: usize) {
        self.ends[side] = EndPoint::new();
    }

    pub fn clear_logs(&mut self) {
        self.tx_log[0].clear();
        self.tx_log[1].clear();
    }

    /// Headers of the given frame type published by `side`.
    pub fn headers_of_type(&self, side: usize, kind: u32) -> Vec<u32> {
        self.tx_log[side]
            .iter()
            .map(|frame| frame[0])
            .filter(|&header| frame_type(header) == kind)
            .collect()
    }

    /// Count of published frames of the given type.
    pub fn count_type(&self, side: usize, kind: u32) -> usize {
        self.headers_of_type(side, kind).len()
    }
}

/// One side's view of the shared net, as the link sees its registers.
pub struct SimBus {
    net: Rc<RefCell<Net>>,
    side: usize,
}

impl SimBus {
    pub fn new(net: &Rc<RefCell<Net>>, side: usize) -> SimBus {
        SimBus {
            net: Rc::clone(net),
            side,
        }
    }
}

impl CommBus for SimBus {
    fn status(&self) -> u32 {
        let net = self.net.borrow();
        let end = &net.ends[self.side];
        let mut status = STATUS_AVAIL;
        if end.rx_wadr != end.rx_radr {
            status |= STATUS_RX_PKT_RCVD;
        }
        if end.ctrl & CTRL_REBOOT_REQUEST != 0 {
            status |= STATUS_REBOOT_GRANTED;
        }
        status
    }

    fn ctrl(&self) -> u32 {
        self.net.borrow().ends[self.side].ctrl
    }

    fn set_ctrl(&self, value: u32) {
        self.net.borrow_mut().ends[self.side].ctrl = value;
    }

    fn tx_wadr(&self) -> u16 {
        self.net.borrow().ends[self.side].tx_wadr
    }

    fn set_tx_wadr(&self, wadr: u16) {
        let mut net = self.net.borrow_mut();
        net.ends[self.side].tx_wadr = wadr;
        net.pump();
    }

    fn tx_radr(&self) -> u16 {
        self.net.borrow().ends[self.side].tx_radr
    }

    fn rx_radr(&self) -> u16 {
        self.net.borrow().ends[self.side].rx_radr
    }

    fn set_rx_radr(&self, radr: u16) {
        self.net.borrow_mut().ends[self.side].rx_radr = radr;
    }

    fn tx_write(&self, index: u16, word: u32) {
        self.net.borrow_mut().ends[self.side].tx_ring[index as usize] = word;
    }

    fn rx_read(&self, index: u16) -> u32 {
        self.net.borrow().ends[self.side].rx_ring[index as usize]
    }

    fn ticks(&self) -> Tick {
        Tick(self.net.borrow().clock)
    }

    fn usleep(&self, _micros: u32) {}
}

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Two fresh links over a fresh net.
pub fn pair() -> (Rc<RefCell<Net>>, Link<SimBus>, Link<SimBus>) {
    let net = Net::new();
    let a = Link::new(String::from("A"), SimBus::new(&net, A));
    let b = Link::new(String::from("B"), SimBus::new(&net, B));
    (net, a, b)
}

/// Drive both endpoints until the handshake completes on both.
pub fn connect(net: &Rc<RefCell<Net>>, a: &mut Link<SimBus>, b: &mut Link<SimBus>) {
    for _ in 0..50 {
        a.poll();
        b.poll();
        net.borrow_mut().advance(1);
        if a.is_connected() && b.is_connected() {
            return;
        }
    }
    panic!("handshake did not complete");
}

/// Poll both endpoints for `iters` rounds, advancing the clock by
/// `step` ticks per round.
pub fn drive(net: &Rc<RefCell<Net>>, a: &mut Link<SimBus>, b: &mut Link<SimBus>, iters: usize, step: u32) {
    for _ in 0..iters {
        a.poll();
        b.poll();
        net.borrow_mut().advance(step);
    }
}
