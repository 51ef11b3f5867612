// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Programmed-I/O data path.
//!
//! The synchronous engine: frames move through the card's FIFOs one word at
//! a time at a fixed window-1 port, with a single trailing byte transfer
//! when the length is odd. This back-end serves the PIO-only generation and
//! is the mandatory fallback whenever bus-master DMA is ruled out, so it
//! must work everywhere.
//!
//! Transmit frames that do not fit the FIFO right now go into a small
//! software hold queue; a free-space threshold interrupt drains it. The
//! FIFO start threshold self-tunes: it begins conservatively and doubles on
//! every underrun until transmissions stop outrunning memory bandwidth.

use byteq::FrameQ;
use drv_elink3_api::{Stats, MAX_FRAME, MIN_FRAME};
use ringlog::{ringlog, ringlog_entry};

use crate::regs::{w1, Command, IntStatus, WindowedIo};
use crate::{ElinkIo, TxError, TxTicket};

/// Frames below this length are staged through a small buffer on receive;
/// larger ones take a frame-sized buffer. Fixed at bind time.
pub const COPY_BREAK: usize = 200;

/// Initial FIFO fill level at which transmission starts.
pub const TX_START_DEFAULT: u16 = 512;
/// Ceiling for the self-tuned start threshold (store-and-forward).
pub const TX_START_MAX: u16 = 2032;

/// Frames the software hold queue will carry.
pub const TX_HOLD_DEPTH: usize = 8;
/// Backing bytes needed for the hold queue: worst case, full-size frames
/// plus the record framing.
pub const TX_HOLD_BYTES: usize = TX_HOLD_DEPTH * (MAX_FRAME + 2);

/// Bytes of FIFO consumed per frame beyond its payload: length word plus a
/// reserved word.
const PREFIX_BYTES: usize = 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Event {
    None,
    Held(u16),
    Underrun { new_start: u16 },
    RxError(u16),
}

ringlog!(Event, 16, Event::None);

pub struct PioEngine<'m> {
    hold: FrameQ<'m>,
    tx_start: u16,
    ticket: u16,
    small_staged: u32,
    large_staged: u32,
}

impl<'m> PioEngine<'m> {
    /// Builds the engine around caller-provided hold-queue storage
    /// (typically a named static of [`TX_HOLD_BYTES`] bytes).
    pub fn new(hold_backing: &'m mut [u8]) -> Self {
        Self {
            hold: FrameQ::new(hold_backing, TX_HOLD_DEPTH),
            tx_start: TX_START_DEFAULT,
            ticket: 0,
            small_staged: 0,
            large_staged: 0,
        }
    }

    /// Resets the FIFOs and programs the start threshold. Called on the
    /// transition into the configured state.
    pub fn bind<B: ElinkIo>(&mut self, win: &WindowedIo<B>) {
        win.command_wait(Command::TxReset);
        win.command_wait(Command::RxReset);
        win.command(Command::SetTxStart(self.tx_start));
    }

    /// Queues one frame for transmission.
    ///
    /// If the FIFO has room for the frame and its prefix the bytes go out
    /// now; otherwise the frame is held in software and the free-space
    /// threshold interrupt is armed to drain it.
    pub fn transmit<B: ElinkIo>(
        &mut self,
        win: &WindowedIo<B>,
        frame: &[u8],
        stats: &mut Stats,
    ) -> Result<TxTicket, TxError> {
        if frame.len() < MIN_FRAME || frame.len() > MAX_FRAME {
            return Err(TxError::BadLength);
        }
        let ticket = self.next_ticket();

        if usize::from(win.tx_free()) >= frame.len() + PREFIX_BYTES {
            push_frame(win, frame, &[]);
            stats.packets_out += 1;
            stats.bytes_out += frame.len() as u32;
        } else {
            self.hold.push(frame).map_err(|_| TxError::QueueFull)?;
            ringlog_entry!(Event::Held(frame.len() as u16));
            win.command(Command::SetTxAvailable((frame.len() + PREFIX_BYTES) as u16));
        }
        Ok(ticket)
    }

    /// Pulls the next completed frame out of the receive FIFO into `out`,
    /// if one is waiting.
    pub fn receive_poll<B: ElinkIo>(
        &mut self,
        win: &WindowedIo<B>,
        out: &mut [u8],
        stats: &mut Stats,
    ) -> Option<usize> {
        let rs = win.rx_status();
        if rs & w1::RX_INCOMPLETE != 0 {
            return None;
        }
        if rs & w1::RX_ERROR != 0 {
            stats.errors_in += 1;
            if rs & w1::RX_ERR_CODE == w1::RX_ERR_OVERRUN {
                stats.rx_overruns += 1;
            }
            ringlog_entry!(Event::RxError(rs));
            win.command_wait(Command::RxDiscard);
            return None;
        }

        let len = usize::from(rs & w1::RX_LEN_MASK);
        if len == 0 || len > out.len() {
            win.command_wait(Command::RxDiscard);
            stats.errors_in += 1;
            return None;
        }

        // Word reads, then the odd trailing byte if there is one.
        let (words, tail) = out[..len].split_at_mut(len & !1);
        for pair in words.chunks_exact_mut(2) {
            let w = win.fifo_read_word();
            pair.copy_from_slice(&w.to_le_bytes());
        }
        if let [b] = tail {
            *b = win.fifo_read_byte();
        }
        win.command_wait(Command::RxDiscard);

        if len < COPY_BREAK {
            self.small_staged += 1;
        } else {
            self.large_staged += 1;
        }
        stats.packets_in += 1;
        stats.bytes_in += len as u32;
        Some(len)
    }

    /// Advances transmit completions under worker context: decodes the
    /// transmit-status byte stack, applies the underrun rule, and drains the
    /// hold queue into whatever FIFO space has opened up.
    pub fn interrupt_work<B: ElinkIo>(
        &mut self,
        win: &WindowedIo<B>,
        status: IntStatus,
        stats: &mut Stats,
    ) {
        if !status.intersects(IntStatus::TX_COMPLETE | IntStatus::TX_AVAILABLE) {
            return;
        }

        loop {
            let ts = win.tx_status();
            if ts & w1::TXS_COMPLETE == 0 {
                break;
            }
            win.tx_status_ack();
            if ts & w1::TXS_UNDERRUN != 0 {
                stats.fifo_underruns += 1;
                stats.errors_out += 1;
                // The FIFO ran dry: start later next time, up to
                // store-and-forward.
                self.tx_start = (self.tx_start * 2).min(TX_START_MAX);
                ringlog_entry!(Event::Underrun {
                    new_start: self.tx_start
                });
                win.command_wait(Command::TxReset);
                win.command(Command::TxEnable);
                win.command(Command::SetTxStart(self.tx_start));
            } else if ts & (w1::TXS_JABBER | w1::TXS_MAX_COLLISIONS) != 0 {
                stats.errors_out += 1;
                win.command_wait(Command::TxReset);
                win.command(Command::TxEnable);
            }
        }

        self.drain_hold(win, stats);
    }

    fn drain_hold<B: ElinkIo>(&mut self, win: &WindowedIo<B>, stats: &mut Stats) {
        while let Some(len) = self.hold.peek_len() {
            if usize::from(win.tx_free()) < len + PREFIX_BYTES {
                // Still no room; re-arm the threshold for this frame.
                win.command(Command::SetTxAvailable((len + PREFIX_BYTES) as u16));
                break;
            }
            self.hold.pop_with(|a, b| push_frame(win, a, b));
            stats.packets_out += 1;
            stats.bytes_out += len as u32;
        }
    }

    /// Current self-tuned start threshold.
    pub fn tx_start(&self) -> u16 {
        self.tx_start
    }

    /// Frames currently parked in the software hold queue.
    pub fn held(&self) -> usize {
        self.hold.records()
    }

    /// Receive staging decisions taken so far: `(small, large)`.
    pub fn staging_counts(&self) -> (u32, u32) {
        (self.small_staged, self.large_staged)
    }

    fn next_ticket(&mut self) -> TxTicket {
        self.ticket = self.ticket.wrapping_add(1);
        TxTicket(self.ticket)
    }
}

/// Writes the 4-byte prefix and a frame (possibly split across two slices,
/// as the hold queue hands it out) to the transmit FIFO: whole words first,
/// one trailing byte if the total length is odd.
fn push_frame<B: ElinkIo>(win: &WindowedIo<B>, a: &[u8], b: &[u8]) {
    let len = a.len() + b.len();
    win.fifo_write_word(len as u16);
    win.fifo_write_word(0);

    let mut low = None;
    for &byte in a.iter().chain(b) {
        match low.take() {
            None => low = Some(byte),
            Some(lo) => win.fifo_write_word(u16::from_le_bytes([lo, byte])),
        }
    }
    if let Some(lo) = low {
        win.fifo_write_byte(lo);
    }
}
