// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Legacy-bus enumeration: the ID-port isolation protocol.
//!
//! Cards on the legacy bus power up with no I/O assignment and all listen on
//! a shared ID port. Each enumeration round puts every unconfigured card
//! into the isolation state, clocks a fixed pseudorandom byte sequence at
//! them -- the cards compare it against their own identifiers and
//! progressively drop out until exactly one remains -- then reads that
//! card's identification words one bit per port read. The surviving card is
//! tagged, told its I/O base, and leaves the contention pool; the next round
//! finds the next card. A round whose manufacturer word does not verify
//! means the pool is empty.
//!
//! The ID port address itself is not architecturally unique, so a short list
//! of candidate ports is tried until one answers.

use crate::{BusKind, Candidate, ElinkIo};
use ringlog::{ringlog, ringlog_entry};

/// Candidate ID ports, in probe order.
pub const ID_PORTS: [u16; 4] = [0x110, 0x100, 0x120, 0x130];

/// Manufacturer identifier expected in ID word 7.
pub const MFG_ID: u16 = 0x6D50;

/// ID-word indices read during isolation.
const WORD_PRODUCT: u8 = 3;
const WORD_MFG: u8 = 7;
const WORD_ADDR_CFG: u8 = 8;
const WORD_RES_CFG: u8 = 9;

/// Settling delay between selecting an ID word and clocking its bits out.
const ID_SETTLE_US: u32 = 162;
/// Per-bit read cadence.
const ID_BIT_US: u32 = 15;

/// At most seven activation tags exist, bounding a round count per port.
const MAX_TAGS: u8 = 7;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Event {
    None,
    PortAnswered(u16),
    CardFound { io_base: u16, irq: u8 },
    BadMfg(u16),
}

ringlog!(Event, 16, Event::None);

/// The 255-step isolation sequence: a linear-feedback shift register with
/// 9-bit state, taps 0xCF, seeded with 0xFF. Every listening card runs the
/// same generator, which is what lets them self-select.
pub struct LfsrSequence {
    state: u16,
    remaining: u16,
}

impl LfsrSequence {
    pub fn new() -> Self {
        Self {
            state: 0xFF,
            remaining: 255,
        }
    }
}

impl Default for LfsrSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for LfsrSequence {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.state <<= 1;
        if self.state & 0x100 != 0 {
            self.state ^= 0xCF;
        }
        Some(self.state as u8)
    }
}

/// Puts all unconfigured cards into isolation and clocks the selection
/// sequence at them.
fn run_isolation<B: ElinkIo>(io: &B, port: u16) {
    // Two writes of zero reset listeners into the isolation state.
    io.outb(port, 0);
    io.outb(port, 0);
    for b in LfsrSequence::new() {
        io.outb(port, b);
    }
}

/// Reads one 16-bit ID word from the isolated card, most significant bit
/// first, one bit per read.
fn id_read_word<B: ElinkIo>(io: &B, port: u16, index: u8) -> u16 {
    io.outb(port, 0x80 | index);
    io.delay_us(ID_SETTLE_US);
    let mut word = 0u16;
    for _ in 0..16 {
        word = (word << 1) | u16::from(io.inb(port) & 1);
        io.delay_us(ID_BIT_US);
    }
    word
}

/// Runs the isolation protocol on each candidate ID port in turn, appending
/// discovered cards to `out`. The first port that yields a card is assumed
/// to be the ID port and later candidates are not tried; a port that yields
/// nothing on its first round is abandoned.
pub fn enumerate<B: ElinkIo, const N: usize>(io: &B, out: &mut heapless::Vec<Candidate, N>) {
    for port in ID_PORTS {
        let found = enumerate_port(io, port, out);
        if found > 0 {
            ringlog_entry!(Event::PortAnswered(port));
            return;
        }
    }
}

fn enumerate_port<B: ElinkIo, const N: usize>(
    io: &B,
    port: u16,
    out: &mut heapless::Vec<Candidate, N>,
) -> usize {
    let mut found = 0;
    for tag in 1..=MAX_TAGS {
        run_isolation(io, port);

        let mfg = id_read_word(io, port, WORD_MFG);
        if mfg != MFG_ID {
            if mfg != 0 && mfg != 0xFFFF {
                ringlog_entry!(Event::BadMfg(mfg));
            }
            break;
        }

        let product = id_read_word(io, port, WORD_PRODUCT);
        let addr_cfg = id_read_word(io, port, WORD_ADDR_CFG);
        let res_cfg = id_read_word(io, port, WORD_RES_CFG);
        let io_base = 0x200 + (addr_cfg & 0x1F) * 0x10;
        let irq = (res_cfg >> 12) as u8;

        // Tag the winner and activate it at its preferred base (encoded in
        // 16-byte steps above 0x200); it leaves the contention pool and the
        // next round selects the next card.
        io.outb(port, 0xD0 | tag);
        io.outb(port, 0xE0 | ((io_base - 0x200) >> 4) as u8);

        ringlog_entry!(Event::CardFound { io_base, irq });
        found += 1;

        let cand = Candidate {
            bus: BusKind::Legacy,
            io_base,
            irq,
            product,
            slot: None,
            conflict: false,
        };
        if out.push(cand).is_err() {
            break;
        }
    }
    found
}
