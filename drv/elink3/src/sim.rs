// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Behavioral model of the card family and its bus neighborhood.
//!
//! `SimBus` stands in for the machine on the far side of the [`ElinkIo`]
//! seam: one or two cards (with the ID-port isolation state machine, the
//! EEPROM, the register windows, the FIFOs, and the bus-master list
//! walker), the configuration-space ports, and the cascaded interrupt
//! controller pair. The test suite drives the real driver against it; fault
//! injection knobs cover the corners the driver has to survive.
//!
//! The model is deliberately literal-minded: it implements exactly the
//! protocol the driver speaks, it does not try to model timing, and every
//! liberty it takes (immediate EEPROM reads, infinite TX FIFO by default)
//! errs toward exposing driver bugs rather than hiding them.
//!
//! This module needs a hosted build; it is compiled only for tests and
//! under the `sim` feature.

extern crate std;

use core::cell::{Cell, RefCell};

use dmapool::DmaMem;
use heapless::{Deque, Vec};

use crate::ring::{LAST_FRAG, RX_DONE, RX_LEN_MASK, TX_DONE};
use crate::{BusKind, Clock, ElinkIo};

type FrameV = Vec<u8, 1600>;

/// Status/cause bits, numerically matched to the driver's view.
pub const ST_ADAPTER_FAILURE: u16 = 1 << 1;
pub const ST_TX_COMPLETE: u16 = 1 << 2;
pub const ST_TX_AVAILABLE: u16 = 1 << 3;
pub const ST_RX_COMPLETE: u16 = 1 << 4;
pub const ST_STATS_FULL: u16 = 1 << 7;
pub const ST_DOWN_COMPLETE: u16 = 1 << 9;
pub const ST_UP_COMPLETE: u16 = 1 << 10;
const ST_INT_LATCH: u16 = 1 << 0;

const RXS_INCOMPLETE: u16 = 1 << 15;
const RXS_ERROR: u16 = 1 << 14;

const TXS_COMPLETE: u8 = 0x80;
const TXS_UNDERRUN: u8 = 0x10;

/// How a simulated card is born.
#[derive(Clone, Debug)]
pub struct SimCardConfig {
    pub bus: BusKind,
    pub product: u16,
    pub mac: [u8; 6],
    pub io_base: u16,
    pub irq: u8,
    /// Corrupt the EEPROM checksum word.
    pub bad_checksum: bool,
    /// EEPROM busy bit never clears.
    pub eeprom_stuck: bool,
}

impl SimCardConfig {
    /// A legacy-bus card of the PIO-only generation, as used across the
    /// test suite.
    pub fn isa_g1() -> Self {
        Self {
            bus: BusKind::Legacy,
            product: 0x9050,
            mac: [0x02, 0x60, 0x8C, 0x11, 0x22, 0x33],
            io_base: 0x300,
            irq: 10,
            bad_checksum: false,
            eeprom_stuck: false,
        }
    }

    /// A legacy-bus bus-master card.
    pub fn isa_g2() -> Self {
        Self {
            product: 0x5051,
            mac: [0x02, 0x60, 0x8C, 0x44, 0x55, 0x66],
            io_base: 0x310,
            irq: 11,
            ..Self::isa_g1()
        }
    }

    /// A structured-bus enhanced-generation card.
    pub fn pci_g3() -> Self {
        Self {
            bus: BusKind::Structured,
            product: 0x9200,
            mac: [0x02, 0x60, 0x8C, 0x77, 0x88, 0x99],
            io_base: 0x1000,
            irq: 11,
            bad_checksum: false,
            eeprom_stuck: false,
        }
    }
}

/// One end-of-interrupt write, for order checking.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Eoi {
    Slave,
    Master,
}

#[derive(Default)]
struct SimPic {
    isr_master: u8,
    isr_slave: u8,
    imr_master: u8,
    imr_slave: u8,
}

/// FIFO traffic counts for frame payload bytes (the 4-byte transmit prefix
/// is not counted).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FifoCounts {
    pub data_word_writes: u32,
    pub data_byte_writes: u32,
    pub data_word_reads: u32,
    pub data_byte_reads: u32,
}

struct SimCard {
    cfg: SimCardConfig,
    eeprom: [u16; 16],
    slot: Option<(u8, u8, u8)>,

    // Bus state.
    active: bool,
    isolated: bool,
    tag: u8,
    id_word: u16,

    // Register file.
    window: u8,
    int_enb: u16,
    latched: u16,
    irq_pending: bool,
    rx_filter: u8,
    station: [u8; 6],
    media: u16,
    rx_enabled: bool,
    tx_enabled: bool,
    eeprom_cmd: u16,
    stats_regs: [u8; 9],

    // PIO receive. Deep enough to absorb an interrupt-storm test without
    // the model itself becoming the bottleneck.
    rx_queue: Deque<FrameV, 48>,
    rx_read_off: usize,
    rx_error_next: Option<u16>,

    // PIO transmit.
    tx_prefix: Vec<u8, 4>,
    tx_accum: FrameV,
    tx_expected: usize,
    tx_status_fifo: Deque<u8, 8>,
    tx_free_override: Option<u16>,
    tx_avail_threshold: Option<u16>,
    underrun_next: bool,

    // Bus-master.
    dn_ptr: u32,
    up_ptr: u32,
    stall_downloads: bool,
    corrupt_loopback_byte: Option<usize>,

    // Observability.
    tx_log: Deque<FrameV, 16>,
    counts: FifoCounts,
    window_selects: u32,
}

impl SimCard {
    fn new(cfg: SimCardConfig, slot: Option<(u8, u8, u8)>) -> Self {
        let mut eeprom = [0u16; 16];
        eeprom[0] = u16::from_be_bytes([cfg.mac[0], cfg.mac[1]]);
        eeprom[1] = u16::from_be_bytes([cfg.mac[2], cfg.mac[3]]);
        eeprom[2] = u16::from_be_bytes([cfg.mac[4], cfg.mac[5]]);
        eeprom[3] = cfg.product;
        eeprom[7] = 0x6D50;
        eeprom[8] = (cfg.io_base - 0x200) / 0x10;
        eeprom[9] = u16::from(cfg.irq) << 12;
        eeprom[15] = eeprom[..15].iter().fold(0, |a, w| a ^ w);
        if cfg.bad_checksum {
            eeprom[15] ^= 0x5A5A;
        }

        let active = cfg.bus == BusKind::Structured;
        let station = cfg.mac;
        Self {
            cfg,
            eeprom,
            slot,
            active,
            isolated: false,
            tag: 0,
            id_word: 0,
            window: 0,
            int_enb: 0,
            latched: 0,
            irq_pending: false,
            rx_filter: 0,
            station,
            media: 0,
            rx_enabled: false,
            tx_enabled: false,
            eeprom_cmd: 0,
            stats_regs: [0; 9],
            rx_queue: Deque::new(),
            rx_read_off: 0,
            rx_error_next: None,
            tx_prefix: Vec::new(),
            tx_accum: Vec::new(),
            tx_expected: 0,
            tx_status_fifo: Deque::new(),
            tx_free_override: None,
            tx_avail_threshold: None,
            underrun_next: false,
            dn_ptr: 0,
            up_ptr: 0,
            stall_downloads: false,
            corrupt_loopback_byte: None,
            tx_log: Deque::new(),
            counts: FifoCounts::default(),
            window_selects: 0,
        }
    }

    fn loopback(&self) -> bool {
        self.media & (1 << 14) != 0
    }

    /// Latches a cause and, if enabled, asserts the line.
    fn raise(&mut self, cause: u16) {
        self.latched |= cause | ST_INT_LATCH;
        if self.int_enb & cause != 0 {
            self.irq_pending = true;
        }
    }

    fn status(&self) -> u16 {
        let mut s = self.latched;
        if !self.rx_queue.is_empty() || self.rx_error_next.is_some() {
            s |= ST_RX_COMPLETE;
        }
        if !self.tx_status_fifo.is_empty() {
            s |= ST_TX_COMPLETE;
        }
        s
    }

    fn tx_free(&self) -> u16 {
        self.tx_free_override.unwrap_or(2048)
    }

    fn rx_status_word(&self) -> u16 {
        if let Some(code) = self.rx_error_next {
            return RXS_ERROR | (code & 0x3800);
        }
        match self.rx_queue.front() {
            None => RXS_INCOMPLETE,
            Some(f) => f.len() as u16 & 0x07FF,
        }
    }
}

struct SimState<'m> {
    cards: Vec<SimCard, 2>,
    mem: Option<DmaMem<'m>>,

    id_port: u16,
    zero_writes: u8,
    isolation_armed: bool,
    lfsr_seen: u16,

    cfg_addr: u32,

    pic: SimPic,
    eoi_log: Vec<Eoi, 64>,
}

/// The machine on the far side of the port-I/O seam.
pub struct SimBus<'m> {
    s: RefCell<SimState<'m>>,
}

impl SimBus<'static> {
    pub fn new() -> Self {
        Self::with_mem_opt(None)
    }
}

impl Default for SimBus<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'m> SimBus<'m> {
    /// A bus whose cards can bus-master into `mem`.
    pub fn with_mem(mem: DmaMem<'m>) -> Self {
        Self::with_mem_opt(Some(mem))
    }

    fn with_mem_opt(mem: Option<DmaMem<'m>>) -> Self {
        Self {
            s: RefCell::new(SimState {
                cards: Vec::new(),
                mem,
                id_port: 0x110,
                zero_writes: 0,
                isolation_armed: false,
                lfsr_seen: 0,
                cfg_addr: 0,
                pic: SimPic::default(),
                eoi_log: Vec::new(),
            }),
        }
    }

    /// Adds a legacy-bus card (starts unconfigured, discoverable through
    /// isolation). Returns its index.
    pub fn add_isa_card(&self, cfg: SimCardConfig) -> usize {
        let mut s = self.s.borrow_mut();
        let idx = s.cards.len();
        assert!(s.cards.push(SimCard::new(cfg, None)).is_ok());
        idx
    }

    /// Adds a structured-bus card at `slot` (answers configuration reads
    /// and its I/O window immediately). Returns its index.
    pub fn add_pci_card(&self, cfg: SimCardConfig, slot: (u8, u8, u8)) -> usize {
        let mut s = self.s.borrow_mut();
        let idx = s.cards.len();
        assert!(s.cards.push(SimCard::new(cfg, Some(slot))).is_ok());
        idx
    }

    /// Moves the ID port to a different candidate address.
    pub fn set_id_port(&self, port: u16) {
        self.s.borrow_mut().id_port = port;
    }

    // -- test knobs ---------------------------------------------------------

    /// Queues a frame for reception, by whichever path the card is using.
    pub fn push_rx(&self, card: usize, frame: &[u8]) {
        let mut s = self.s.borrow_mut();
        if s.cards[card].up_ptr != 0 {
            s.deliver_up(card, frame);
        } else {
            let mut f = FrameV::new();
            f.extend_from_slice(frame).unwrap();
            let c = &mut s.cards[card];
            if c.rx_enabled && c.rx_queue.push_back(f).is_ok() {
                c.raise(ST_RX_COMPLETE);
            } else {
                c.stats_regs[5] = c.stats_regs[5].saturating_add(1);
            }
        }
    }

    /// Takes every frame the card has transmitted so far.
    pub fn take_tx_frames(&self, card: usize) -> std::vec::Vec<std::vec::Vec<u8>> {
        let mut s = self.s.borrow_mut();
        let mut out = std::vec::Vec::new();
        while let Some(f) = s.cards[card].tx_log.pop_front() {
            out.push(f.as_slice().to_vec());
        }
        out
    }

    /// Constrains the advertised TX FIFO free space. Raising the limit
    /// satisfies a previously armed free-space threshold.
    pub fn set_tx_free(&self, card: usize, free: Option<u16>) {
        let mut s = self.s.borrow_mut();
        let c = &mut s.cards[card];
        c.tx_free_override = free;
        if let Some(th) = c.tx_avail_threshold {
            if c.tx_free() >= th {
                c.tx_avail_threshold = None;
                c.raise(ST_TX_AVAILABLE);
            }
        }
    }

    /// The next completed PIO transmission reports an underrun and is
    /// dropped.
    pub fn inject_underrun(&self, card: usize) {
        self.s.borrow_mut().cards[card].underrun_next = true;
    }

    /// The receive FIFO head reports an error with the given reason code
    /// until discarded.
    pub fn inject_rx_error(&self, card: usize, code: u16) {
        let mut s = self.s.borrow_mut();
        s.cards[card].rx_error_next = Some(code);
        s.cards[card].raise(ST_RX_COMPLETE);
    }

    /// Freezes or thaws the download list walker.
    pub fn set_stall_downloads(&self, card: usize, on: bool) {
        let mut s = self.s.borrow_mut();
        s.cards[card].stall_downloads = on;
        if !on {
            s.walk_down(card);
        }
    }

    /// Corrupts one byte of every looped-back frame.
    pub fn corrupt_loopback(&self, card: usize, byte: Option<usize>) {
        self.s.borrow_mut().cards[card].corrupt_loopback_byte = byte;
    }

    /// Forces internal loopback on or off, as if the media register had
    /// been written.
    pub fn set_loopback(&self, card: usize, on: bool) {
        let mut s = self.s.borrow_mut();
        if on {
            s.cards[card].media |= 1 << 14;
        } else {
            s.cards[card].media &= !(1 << 14);
        }
    }

    /// Latches an arbitrary cause, as if the card raised it.
    pub fn raise_cause(&self, card: usize, cause: u16) {
        self.s.borrow_mut().cards[card].raise(cause);
    }

    /// Seeds a window-6 statistics counter.
    pub fn set_stat_reg(&self, card: usize, reg: usize, v: u8) {
        self.s.borrow_mut().cards[card].stats_regs[reg] = v;
    }

    // -- interrupt plumbing -------------------------------------------------

    /// Delivers the next pending interrupt: marks it in-service at the
    /// controller pair and returns the line number for the test to vector.
    pub fn take_irq(&self) -> Option<u8> {
        let mut s = self.s.borrow_mut();
        for i in 0..s.cards.len() {
            if s.cards[i].active && s.cards[i].irq_pending {
                s.cards[i].irq_pending = false;
                let irq = s.cards[i].cfg.irq;
                if irq < 8 {
                    s.pic.isr_master |= 1 << irq;
                } else {
                    s.pic.isr_slave |= 1 << (irq - 8);
                    s.pic.isr_master |= 1 << 2; // cascade line
                }
                return Some(irq);
            }
        }
        None
    }

    /// End-of-interrupt writes observed so far, in order.
    pub fn take_eoi_log(&self) -> std::vec::Vec<Eoi> {
        let mut s = self.s.borrow_mut();
        let out = s.eoi_log.iter().copied().collect();
        s.eoi_log.clear();
        out
    }

    // -- observability ------------------------------------------------------

    pub fn fifo_counts(&self, card: usize) -> FifoCounts {
        self.s.borrow().cards[card].counts
    }

    pub fn reset_fifo_counts(&self, card: usize) {
        self.s.borrow_mut().cards[card].counts = FifoCounts::default();
    }

    pub fn window_selects(&self, card: usize) -> u32 {
        self.s.borrow().cards[card].window_selects
    }

    pub fn card_active(&self, card: usize) -> bool {
        self.s.borrow().cards[card].active
    }

    pub fn card_io_base(&self, card: usize) -> u16 {
        self.s.borrow().cards[card].cfg.io_base
    }

    pub fn card_tag(&self, card: usize) -> u8 {
        self.s.borrow().cards[card].tag
    }

    pub fn station_address(&self, card: usize) -> [u8; 6] {
        self.s.borrow().cards[card].station
    }

    pub fn rx_filter(&self, card: usize) -> u8 {
        self.s.borrow().cards[card].rx_filter
    }

    pub fn rx_queue_len(&self, card: usize) -> usize {
        self.s.borrow().cards[card].rx_queue.len()
    }
}

impl<'m> SimState<'m> {
    fn card_at(&self, port: u16) -> Option<(usize, u16)> {
        for (i, c) in self.cards.iter().enumerate() {
            if c.active && port >= c.cfg.io_base && port < c.cfg.io_base + 16 {
                return Some((i, port - c.cfg.io_base));
            }
        }
        None
    }

    // -- isolation ----------------------------------------------------------

    fn id_port_write(&mut self, v: u8) {
        if v == 0 {
            self.zero_writes += 1;
            if self.zero_writes >= 2 {
                self.isolation_armed = true;
                self.lfsr_seen = 0;
                for c in self.cards.iter_mut() {
                    if c.cfg.bus == BusKind::Legacy && !c.active {
                        c.isolated = false;
                    }
                }
            }
            return;
        }
        self.zero_writes = 0;

        if self.isolation_armed && self.lfsr_seen < 255 {
            self.lfsr_seen += 1;
            if self.lfsr_seen == 255 {
                // Contention resolved: the first unconfigured card wins this
                // round.
                if let Some(c) = self
                    .cards
                    .iter_mut()
                    .find(|c| c.cfg.bus == BusKind::Legacy && !c.active)
                {
                    c.isolated = true;
                }
            }
            return;
        }

        // Control bytes addressed at the isolation winner.
        let Some(c) = self.cards.iter_mut().find(|c| c.isolated) else {
            return;
        };
        match v {
            0x80..=0x8F => {
                c.id_word = c.eeprom[(v & 0x0F) as usize];
            }
            0xD0..=0xD7 => {
                c.tag = v & 7;
            }
            0xE0..=0xFF => {
                c.cfg.io_base = 0x200 + (u16::from(v & 0x1F) << 4);
                c.active = true;
                c.isolated = false;
                self.isolation_armed = false;
                self.zero_writes = 0;
            }
            _ => {}
        }
    }

    fn id_port_read(&mut self) -> u8 {
        let Some(c) = self.cards.iter_mut().find(|c| c.isolated) else {
            return 0;
        };
        let bit = (c.id_word >> 15) & 1;
        c.id_word <<= 1;
        bit as u8
    }

    // -- configuration space ------------------------------------------------

    fn cfg_read(&self) -> u32 {
        let bus = ((self.cfg_addr >> 16) & 0xFF) as u8;
        let dev = ((self.cfg_addr >> 11) & 0x1F) as u8;
        let func = ((self.cfg_addr >> 8) & 0x07) as u8;
        let off = (self.cfg_addr & 0xFC) as u8;
        for c in self.cards.iter() {
            if c.slot != Some((bus, dev, func)) {
                continue;
            }
            return match off {
                0x00 => u32::from(crate::pci::VENDOR_ID) | (u32::from(c.cfg.product) << 16),
                0x10 => u32::from(c.cfg.io_base) | 1,
                0x3C => u32::from(c.cfg.irq),
                _ => 0,
            };
        }
        0xFFFF_FFFF
    }

    // -- card register file -------------------------------------------------

    fn command(&mut self, ci: usize, v: u16) {
        let op = v >> 11;
        let arg = v & 0x07FF;
        match op {
            0 => {
                let cfg = self.cards[ci].cfg.clone();
                let slot = self.cards[ci].slot;
                let mut fresh = SimCard::new(cfg, slot);
                fresh.active = true;
                self.cards[ci] = fresh;
            }
            1 => {
                let c = &mut self.cards[ci];
                c.window = (arg & 7) as u8;
                c.window_selects += 1;
            }
            3 => self.cards[ci].rx_enabled = false,
            4 => self.cards[ci].rx_enabled = true,
            5 => {
                let c = &mut self.cards[ci];
                c.rx_queue.clear();
                c.rx_read_off = 0;
                c.rx_error_next = None;
            }
            6 => match arg {
                1 => { /* upload unstall: uploads run on demand */ }
                3 => self.walk_down(ci),
                _ => {}
            },
            8 => {
                let c = &mut self.cards[ci];
                if c.rx_error_next.take().is_none() {
                    c.rx_queue.pop_front();
                }
                c.rx_read_off = 0;
                if !c.rx_queue.is_empty() {
                    c.raise(ST_RX_COMPLETE);
                }
            }
            9 => self.cards[ci].tx_enabled = true,
            10 => self.cards[ci].tx_enabled = false,
            11 => {
                let c = &mut self.cards[ci];
                c.tx_prefix.clear();
                c.tx_accum.clear();
                c.tx_expected = 0;
                c.tx_status_fifo.clear();
            }
            13 => {
                let c = &mut self.cards[ci];
                c.latched &= !arg;
                if c.int_enb & c.status() & 0x07FF != 0 {
                    // Condition persists; the card re-latches the edge.
                    c.irq_pending = true;
                }
            }
            14 => self.cards[ci].int_enb = arg,
            15 => { /* status enable: all causes always visible here */ }
            16 => self.cards[ci].rx_filter = arg as u8,
            18 => {
                let c = &mut self.cards[ci];
                if c.tx_free() >= arg {
                    c.raise(ST_TX_AVAILABLE);
                } else {
                    c.tx_avail_threshold = Some(arg);
                }
            }
            19 => { /* start threshold: honored implicitly */ }
            21 | 22 => {}
            _ => {}
        }
    }

    fn win_read_w(&mut self, ci: usize, off: u16) -> u16 {
        match (self.cards[ci].window, off) {
            (0, 0x0A) => {
                let c = &self.cards[ci];
                if c.cfg.eeprom_stuck {
                    c.eeprom_cmd | 0x8000
                } else {
                    c.eeprom_cmd
                }
            }
            (0, 0x0C) => {
                let c = &self.cards[ci];
                c.eeprom[(c.eeprom_cmd & 0x0F) as usize]
            }
            (1, 0x00) => {
                let (lo, counted) = self.fifo_pull(ci);
                let (hi, _) = self.fifo_pull(ci);
                if counted {
                    self.cards[ci].counts.data_word_reads += 1;
                }
                u16::from_le_bytes([lo, hi])
            }
            (1, 0x08) => self.cards[ci].rx_status_word(),
            (1, 0x0C) => self.cards[ci].tx_free(),
            (4, 0x0A) => self.cards[ci].media,
            _ => 0,
        }
    }

    fn win_write_w(&mut self, ci: usize, off: u16, v: u16) {
        match (self.cards[ci].window, off) {
            (0, 0x0A) => self.cards[ci].eeprom_cmd = v & 0x7FFF,
            (1, 0x00) => {
                let [lo, hi] = v.to_le_bytes();
                let counted = self.fifo_push(ci, lo);
                self.fifo_push(ci, hi);
                if counted {
                    self.cards[ci].counts.data_word_writes += 1;
                }
            }
            (4, 0x0A) => self.cards[ci].media = v,
            _ => {}
        }
    }

    fn win_read_b(&mut self, ci: usize, off: u16) -> u8 {
        match (self.cards[ci].window, off) {
            (1, 0x00) => {
                let (b, counted) = self.fifo_pull(ci);
                if counted {
                    self.cards[ci].counts.data_byte_reads += 1;
                }
                b
            }
            (1, 0x0B) => self.cards[ci].tx_status_fifo.front().copied().unwrap_or(0),
            (2, 0x00..=0x05) => self.cards[ci].station[off as usize],
            (6, 0x00..=0x08) => {
                let c = &mut self.cards[ci];
                let v = c.stats_regs[off as usize];
                c.stats_regs[off as usize] = 0;
                v
            }
            _ => 0,
        }
    }

    fn win_write_b(&mut self, ci: usize, off: u16, v: u8) {
        match (self.cards[ci].window, off) {
            (1, 0x00) => {
                if self.fifo_push(ci, v) {
                    self.cards[ci].counts.data_byte_writes += 1;
                }
            }
            (1, 0x0B) => {
                self.cards[ci].tx_status_fifo.pop_front();
            }
            (2, 0x00..=0x05) => self.cards[ci].station[off as usize] = v,
            _ => {}
        }
    }

    fn win_read_l(&mut self, ci: usize, off: u16) -> u32 {
        let c = &self.cards[ci];
        match (c.window, off) {
            (7, 0x00) => c.dn_ptr,
            (7, 0x04) => c.up_ptr,
            _ => 0,
        }
    }

    fn win_write_l(&mut self, ci: usize, off: u16, v: u32) {
        match (self.cards[ci].window, off) {
            (7, 0x00) => {
                self.cards[ci].dn_ptr = v;
                self.walk_down(ci);
            }
            (7, 0x04) => self.cards[ci].up_ptr = v,
            _ => {}
        }
    }

    // -- PIO FIFO mechanics -------------------------------------------------

    /// Accepts one byte into the transmit FIFO. Returns true when the byte
    /// was frame payload rather than prefix.
    fn fifo_push(&mut self, ci: usize, b: u8) -> bool {
        let complete = {
            let c = &mut self.cards[ci];
            if c.tx_expected == 0 {
                let _ = c.tx_prefix.push(b);
                if c.tx_prefix.len() == 4 {
                    c.tx_expected =
                        usize::from(u16::from_le_bytes([c.tx_prefix[0], c.tx_prefix[1]]));
                    c.tx_prefix.clear();
                    c.tx_accum.clear();
                }
                return false;
            }
            let _ = c.tx_accum.push(b);
            c.tx_accum.len() >= c.tx_expected
        };
        if complete {
            self.complete_tx(ci);
        }
        true
    }

    fn complete_tx(&mut self, ci: usize) {
        let c = &mut self.cards[ci];
        let frame = core::mem::take(&mut c.tx_accum);
        c.tx_expected = 0;

        if !c.tx_enabled {
            return;
        }
        if c.underrun_next {
            c.underrun_next = false;
            let _ = c.tx_status_fifo.push_back(TXS_COMPLETE | TXS_UNDERRUN);
            c.raise(ST_TX_COMPLETE);
            return;
        }

        let _ = c.tx_status_fifo.push_back(TXS_COMPLETE);
        c.stats_regs[6] = c.stats_regs[6].wrapping_add(1);
        let _ = c.tx_log.push_back(frame.clone());
        c.raise(ST_TX_COMPLETE);

        if c.loopback() && c.rx_enabled {
            let mut f = frame;
            if let Some(i) = c.corrupt_loopback_byte {
                if i < f.len() {
                    f[i] ^= 0xFF;
                }
            }
            if c.rx_queue.push_back(f).is_ok() {
                c.raise(ST_RX_COMPLETE);
            }
        }
    }

    /// Streams one byte of the head receive frame. Returns `(byte,
    /// counted)`; `counted` is false past the end of the frame or with
    /// nothing queued.
    fn fifo_pull(&mut self, ci: usize) -> (u8, bool) {
        let c = &mut self.cards[ci];
        let Some(front) = c.rx_queue.front() else {
            return (0, false);
        };
        match front.get(c.rx_read_off).copied() {
            Some(b) => {
                c.rx_read_off += 1;
                (b, true)
            }
            None => (0, false),
        }
    }

    // -- bus-master walker --------------------------------------------------

    fn walk_down(&mut self, ci: usize) {
        let Some(mem) = self.mem else { return };
        if self.cards[ci].stall_downloads {
            return;
        }
        let mut p = self.cards[ci].dn_ptr;
        let mut hops = 0;
        let mut completed: Vec<FrameV, 16> = Vec::new();
        while p != 0 && hops < 64 {
            hops += 1;
            if !mem.contains(p, 16) {
                break;
            }
            let status = mem.read_u32(p + 4);
            if status & TX_DONE != 0 {
                p = mem.read_u32(p);
                continue;
            }
            let frag = mem.read_u32(p + 8);
            let frag_len = (mem.read_u32(p + 12) & !LAST_FRAG) as usize;
            if !mem.contains(frag, frag_len) {
                break;
            }
            let mut f = FrameV::new();
            let mut buf = [0u8; 1600];
            let n = frag_len.min(1600);
            mem.read(frag, &mut buf[..n]);
            let _ = f.extend_from_slice(&buf[..n]);
            mem.write_u32(p + 4, status | TX_DONE);
            let _ = completed.push(f);
            p = mem.read_u32(p);
        }

        if completed.is_empty() {
            return;
        }
        {
            let c = &mut self.cards[ci];
            c.stats_regs[6] = c.stats_regs[6].wrapping_add(completed.len() as u8);
            c.raise(ST_DOWN_COMPLETE);
        }
        for f in completed {
            let (loopback, corrupt) = {
                let c = &self.cards[ci];
                (c.loopback(), c.corrupt_loopback_byte)
            };
            let _ = self.cards[ci].tx_log.push_back(f.clone());
            if loopback {
                let mut lf = f;
                if let Some(i) = corrupt {
                    if i < lf.len() {
                        lf[i] ^= 0xFF;
                    }
                }
                self.deliver_up(ci, lf.as_slice());
            }
        }
    }

    fn deliver_up(&mut self, ci: usize, frame: &[u8]) {
        let Some(mem) = self.mem else { return };
        let mut p = self.cards[ci].up_ptr;
        let mut hops = 0;
        while p != 0 && hops < 64 {
            hops += 1;
            if !mem.contains(p, 16) {
                return;
            }
            let status = mem.read_u32(p + 4);
            if status & RX_DONE == 0 {
                if !self.cards[ci].rx_enabled {
                    break;
                }
                let frag = mem.read_u32(p + 8);
                let cap = (mem.read_u32(p + 12) & RX_LEN_MASK) as usize;
                if frame.len() > cap || !mem.contains(frag, frame.len()) {
                    return;
                }
                mem.write(frag, frame);
                mem.write_u32(p + 4, frame.len() as u32 | RX_DONE);
                self.cards[ci].up_ptr = mem.read_u32(p);
                self.cards[ci].raise(ST_UP_COMPLETE);
                return;
            }
            p = mem.read_u32(p);
        }
        // No free upload slot: the frame is dropped on the floor, which is
        // what the hardware does too.
        let c = &mut self.cards[ci];
        c.stats_regs[5] = c.stats_regs[5].saturating_add(1);
    }

    // -- PIC ----------------------------------------------------------------

    fn pic_write(&mut self, port: u16, v: u8) {
        match port {
            0x20 => {
                if v == 0x20 {
                    let _ = self.eoi_log.push(Eoi::Master);
                    let isr = self.pic.isr_master;
                    if isr != 0 {
                        self.pic.isr_master = isr & (isr - 1);
                    }
                }
            }
            0xA0 => {
                if v == 0x20 {
                    let _ = self.eoi_log.push(Eoi::Slave);
                    let isr = self.pic.isr_slave;
                    if isr != 0 {
                        self.pic.isr_slave = isr & (isr - 1);
                    }
                }
            }
            0x21 => self.pic.imr_master = v,
            0xA1 => self.pic.imr_slave = v,
            _ => {}
        }
    }

    fn pic_read(&self, port: u16) -> u8 {
        match port {
            0x20 => self.pic.isr_master,
            0xA0 => self.pic.isr_slave,
            0x21 => self.pic.imr_master,
            0xA1 => self.pic.imr_slave,
            _ => 0,
        }
    }
}

impl<'m> ElinkIo for SimBus<'m> {
    fn outb(&self, port: u16, value: u8) {
        let mut s = self.s.borrow_mut();
        if port == s.id_port {
            s.id_port_write(value);
            return;
        }
        match port {
            0x20 | 0x21 | 0xA0 | 0xA1 => s.pic_write(port, value),
            _ => {
                if let Some((ci, off)) = s.card_at(port) {
                    if off != 0x0E {
                        s.win_write_b(ci, off, value);
                    }
                }
            }
        }
    }

    fn outw(&self, port: u16, value: u16) {
        let mut s = self.s.borrow_mut();
        if let Some((ci, off)) = s.card_at(port) {
            if off == 0x0E {
                s.command(ci, value);
            } else {
                s.win_write_w(ci, off, value);
            }
        }
    }

    fn outl(&self, port: u16, value: u32) {
        let mut s = self.s.borrow_mut();
        if port == 0x0CF8 {
            s.cfg_addr = value;
            return;
        }
        if let Some((ci, off)) = s.card_at(port) {
            s.win_write_l(ci, off, value);
        }
    }

    fn inb(&self, port: u16) -> u8 {
        let mut s = self.s.borrow_mut();
        if port == s.id_port {
            return s.id_port_read();
        }
        match port {
            0x20 | 0x21 | 0xA0 | 0xA1 => s.pic_read(port),
            _ => match s.card_at(port) {
                Some((ci, 0x0E)) => s.cards[ci].status() as u8,
                Some((ci, off)) => s.win_read_b(ci, off),
                None => 0xFF,
            },
        }
    }

    fn inw(&self, port: u16) -> u16 {
        let mut s = self.s.borrow_mut();
        match s.card_at(port) {
            Some((ci, 0x0E)) => s.cards[ci].status(),
            Some((ci, off)) => s.win_read_w(ci, off),
            None => 0xFFFF,
        }
    }

    fn inl(&self, port: u16) -> u32 {
        let mut s = self.s.borrow_mut();
        if port == 0x0CFC {
            return s.cfg_read();
        }
        match s.card_at(port) {
            Some((ci, off)) => s.win_read_l(ci, off),
            None => 0xFFFF_FFFF,
        }
    }

    fn delay_us(&self, _us: u32) {}
}

/// A settable clock for the stall watchdog tests.
pub struct TestClock(Cell<u64>);

impl TestClock {
    pub fn new() -> Self {
        Self(Cell::new(0))
    }

    pub fn advance_us(&self, us: u64) {
        self.0.set(self.0.get() + us);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now_us(&self) -> u64 {
        self.0.get()
    }
}
