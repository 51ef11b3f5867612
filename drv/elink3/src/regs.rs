// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register-level model of the EtherLink III I/O window.
//!
//! Every card in the family exposes sixteen bytes of I/O space. Offset 0x0E
//! is the command register (written) and status register (read); the other
//! fourteen bytes are a view into one of eight register windows, chosen by
//! the most recent `SelectWindow` command. [`WindowedIo`] owns that modal
//! state: it tracks the selected window per device and elides redundant
//! selects, and every window-relative register is reachable only through a
//! typed accessor that names its window. Raw `port + offset` arithmetic does
//! not appear outside this module.

use core::cell::Cell;

use crate::ElinkIo;
use drv_elink3_api::MacAddress;

/// Offset of the command/status register within the I/O window.
pub const CMD_STATUS: u16 = 0x0E;

/// Window 0: configuration and EEPROM access.
pub mod w0 {
    pub const EEPROM_CMD: u16 = 0x0A;
    pub const EEPROM_DATA: u16 = 0x0C;
    /// Busy bit in the EEPROM command register.
    pub const EEPROM_BUSY: u16 = 1 << 15;
    /// EEPROM read opcode, or'd with the word index.
    pub const EEPROM_READ: u16 = 0x80;
}

/// Window 1: operating set -- FIFOs and queue status.
pub mod w1 {
    pub const FIFO: u16 = 0x00;
    pub const RX_STATUS: u16 = 0x08;
    pub const TX_STATUS: u16 = 0x0B;
    pub const TX_FREE: u16 = 0x0C;

    /// RxStatus: no complete frame at the head of the FIFO.
    pub const RX_INCOMPLETE: u16 = 1 << 15;
    /// RxStatus: the head frame was received in error.
    pub const RX_ERROR: u16 = 1 << 14;
    /// RxStatus: length of the head frame.
    pub const RX_LEN_MASK: u16 = 0x07FF;
    /// RxStatus: error reason field, valid when RX_ERROR is set.
    pub const RX_ERR_CODE: u16 = 0x3800;
    /// Error reason: receive FIFO overrun.
    pub const RX_ERR_OVERRUN: u16 = 0x0000;

    /// TxStatus: a transmission has completed (more status bits valid).
    pub const TXS_COMPLETE: u8 = 0x80;
    /// TxStatus: the FIFO ran dry mid-frame.
    pub const TXS_UNDERRUN: u8 = 0x10;
    /// TxStatus: jabber timeout.
    pub const TXS_JABBER: u8 = 0x20;
    /// TxStatus: excessive collisions.
    pub const TXS_MAX_COLLISIONS: u8 = 0x08;
}

/// Window 2: station address.
pub mod w2 {
    pub const STATION: u16 = 0x00;
}

/// Window 4: diagnostics and media control.
pub mod w4 {
    pub const MEDIA: u16 = 0x0A;
    /// Internal loopback enable.
    pub const MEDIA_LOOPBACK: u16 = 1 << 14;
}

/// Window 6: statistics counters, one byte each, cleared by reading.
pub mod w6 {
    pub const TX_CARRIER_ERRORS: u16 = 0x00;
    pub const TX_HEARTBEAT_ERRORS: u16 = 0x01;
    pub const TX_MULTIPLE_COLLISIONS: u16 = 0x02;
    pub const TX_SINGLE_COLLISIONS: u16 = 0x03;
    pub const TX_LATE_COLLISIONS: u16 = 0x04;
    pub const RX_OVERRUNS: u16 = 0x05;
    pub const TX_FRAMES: u16 = 0x06;
    pub const RX_FRAMES: u16 = 0x07;
    pub const TX_DEFERRALS: u16 = 0x08;
}

/// Window 7: bus-master list pointers.
pub mod w7 {
    pub const DN_LIST_PTR: u16 = 0x00;
    pub const UP_LIST_PTR: u16 = 0x04;
}

bitflags::bitflags! {
    /// Status-register bits. Bits 0..10 are the acknowledgeable interrupt
    /// causes; bit 12 reports a command still executing.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct IntStatus: u16 {
        const INT_LATCH       = 1 << 0;
        const ADAPTER_FAILURE = 1 << 1;
        const TX_COMPLETE     = 1 << 2;
        const TX_AVAILABLE    = 1 << 3;
        const RX_COMPLETE     = 1 << 4;
        const RX_EARLY        = 1 << 5;
        const INT_REQ         = 1 << 6;
        const STATS_FULL      = 1 << 7;
        const DMA_DONE        = 1 << 8;
        const DOWN_COMPLETE   = 1 << 9;
        const UP_COMPLETE     = 1 << 10;
        const CMD_IN_PROGRESS = 1 << 12;
    }
}

impl IntStatus {
    /// The causes that can be acknowledged with `AckIntr`.
    pub const CAUSES: IntStatus = IntStatus::from_bits_truncate(0x07FF);
}

/// Commands, encoded as `(op << 11) | argument` when written to the command
/// register.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    GlobalReset,
    SelectWindow(u8),
    RxDisable,
    RxEnable,
    RxReset,
    UpStall,
    UpUnstall,
    DownStall,
    DownUnstall,
    RxDiscard,
    TxEnable,
    TxDisable,
    TxReset,
    AckIntr(IntStatus),
    SetIntrEnb(IntStatus),
    SetStatusEnb(IntStatus),
    SetRxFilter(RxFilter),
    SetTxAvailable(u16),
    SetTxStart(u16),
    StatsEnable,
    StatsDisable,
}

impl Command {
    pub fn encode(self) -> u16 {
        let (op, arg) = match self {
            Command::GlobalReset => (0, 0),
            Command::SelectWindow(w) => (1, u16::from(w)),
            Command::RxDisable => (3, 0),
            Command::RxEnable => (4, 0),
            Command::RxReset => (5, 0),
            Command::UpStall => (6, 0),
            Command::UpUnstall => (6, 1),
            Command::DownStall => (6, 2),
            Command::DownUnstall => (6, 3),
            Command::RxDiscard => (8, 0),
            Command::TxEnable => (9, 0),
            Command::TxDisable => (10, 0),
            Command::TxReset => (11, 0),
            Command::AckIntr(causes) => (13, causes.bits()),
            Command::SetIntrEnb(mask) => (14, mask.bits()),
            Command::SetStatusEnb(mask) => (15, mask.bits()),
            Command::SetRxFilter(f) => (16, u16::from(f.bits())),
            Command::SetTxAvailable(th) => (18, th),
            Command::SetTxStart(th) => (19, th),
            Command::StatsEnable => (21, 0),
            Command::StatsDisable => (22, 0),
        };
        (op << 11) | (arg & 0x07FF)
    }
}

bitflags::bitflags! {
    /// Receive filter bits for `SetRxFilter`.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct RxFilter: u8 {
        const STATION     = 1 << 0;
        const MULTICAST   = 1 << 1;
        const BROADCAST   = 1 << 2;
        const PROMISCUOUS = 1 << 3;
    }
}

/// Bounded wait for `CMD_IN_PROGRESS` to clear, in 1 µs polls. Commands that
/// take longer than this have wedged the card.
const CMD_WAIT_POLLS: u32 = 4000;

/// Handle for the windowed register file of one device.
///
/// The handle assumes exclusive ownership of the device's window selection:
/// it caches the last window selected and skips the `SelectWindow` command
/// when the window already matches. On devices with a permanently mapped
/// window 1, every accessor that visits a setup window re-parks the file on
/// window 1 on its way out, so in the steady state no select targeting
/// window 1 is ever issued for them.
pub struct WindowedIo<B> {
    io: B,
    base: u16,
    current: Cell<Option<u8>>,
    permanent_w1: bool,
}

impl<B: ElinkIo> WindowedIo<B> {
    pub fn new(io: B, base: u16) -> Self {
        Self {
            io,
            base,
            current: Cell::new(None),
            permanent_w1: false,
        }
    }

    /// Records that this device keeps window 1 permanently accessible, so
    /// selects targeting it can be skipped.
    pub fn set_permanent_w1(&mut self, on: bool) {
        self.permanent_w1 = on;
    }

    pub fn io(&self) -> &B {
        &self.io
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    /// Last window selected, if known. Diagnostic.
    pub fn current_window(&self) -> Option<u8> {
        self.current.get()
    }

    /// Issues a command. Window selection performed through here keeps the
    /// cache coherent.
    pub fn command(&self, c: Command) {
        if let Command::SelectWindow(w) = c {
            self.current.set(Some(w));
        }
        self.io.outw(self.base + CMD_STATUS, c.encode());
    }

    /// Issues a command and waits for `CMD_IN_PROGRESS` to clear.
    pub fn command_wait(&self, c: Command) {
        self.command(c);
        for _ in 0..CMD_WAIT_POLLS {
            if !self.status().contains(IntStatus::CMD_IN_PROGRESS) {
                return;
            }
            self.io.delay_us(1);
        }
        // Left in progress: the status read in the caller's next step will
        // see CMD_IN_PROGRESS and the error paths take it from there.
    }

    pub fn status(&self) -> IntStatus {
        IntStatus::from_bits_truncate(self.io.inw(self.base + CMD_STATUS))
    }

    fn select(&self, w: u8) {
        if self.current.get() != Some(w) {
            self.command(Command::SelectWindow(w));
        }
    }

    /// Runs `body` with window `w` selected. On permanent-window-1 devices,
    /// leaving a setup window re-parks the file on window 1, which is what
    /// keeps the steady-state data path select-free for them.
    fn with_window<R>(&self, w: u8, body: impl FnOnce(&B, u16) -> R) -> R {
        self.select(w);
        let r = body(&self.io, self.base);
        if self.permanent_w1 && w != 1 {
            self.select(1);
        }
        r
    }

    // -- window 0: EEPROM ---------------------------------------------------

    pub fn eeprom_command(&self, v: u16) {
        self.with_window(0, |io, base| io.outw(base + w0::EEPROM_CMD, v))
    }

    pub fn eeprom_busy(&self) -> bool {
        self.with_window(0, |io, base| {
            io.inw(base + w0::EEPROM_CMD) & w0::EEPROM_BUSY != 0
        })
    }

    pub fn eeprom_data(&self) -> u16 {
        self.with_window(0, |io, base| io.inw(base + w0::EEPROM_DATA))
    }

    // -- window 1: FIFOs ----------------------------------------------------

    pub fn rx_status(&self) -> u16 {
        self.with_window(1, |io, base| io.inw(base + w1::RX_STATUS))
    }

    pub fn tx_status(&self) -> u8 {
        self.with_window(1, |io, base| io.inb(base + w1::TX_STATUS))
    }

    /// Pops the head transmit-status byte so the next completion becomes
    /// visible.
    pub fn tx_status_ack(&self) {
        self.with_window(1, |io, base| io.outb(base + w1::TX_STATUS, 0))
    }

    pub fn tx_free(&self) -> u16 {
        self.with_window(1, |io, base| io.inw(base + w1::TX_FREE))
    }

    pub fn fifo_write_word(&self, v: u16) {
        self.with_window(1, |io, base| io.outw(base + w1::FIFO, v))
    }

    pub fn fifo_write_byte(&self, v: u8) {
        self.with_window(1, |io, base| io.outb(base + w1::FIFO, v))
    }

    pub fn fifo_read_word(&self) -> u16 {
        self.with_window(1, |io, base| io.inw(base + w1::FIFO))
    }

    pub fn fifo_read_byte(&self) -> u8 {
        self.with_window(1, |io, base| io.inb(base + w1::FIFO))
    }

    // -- window 2: station address ------------------------------------------

    pub fn station_address(&self) -> MacAddress {
        self.with_window(2, |io, base| {
            let mut mac = MacAddress::default();
            for (i, b) in mac.0.iter_mut().enumerate() {
                *b = io.inb(base + w2::STATION + i as u16);
            }
            mac
        })
    }

    pub fn set_station_address(&self, mac: MacAddress) {
        self.with_window(2, |io, base| {
            for (i, b) in mac.0.iter().enumerate() {
                io.outb(base + w2::STATION + i as u16, *b);
            }
        })
    }

    // -- window 4: media ----------------------------------------------------

    pub fn media_status(&self) -> u16 {
        self.with_window(4, |io, base| io.inw(base + w4::MEDIA))
    }

    pub fn set_media_status(&self, v: u16) {
        self.with_window(4, |io, base| io.outw(base + w4::MEDIA, v))
    }

    // -- window 6: statistics -----------------------------------------------

    /// Reads (and thereby clears) one statistics counter byte.
    pub fn stats_byte(&self, off: u16) -> u8 {
        self.with_window(6, |io, base| io.inb(base + off))
    }

    // -- window 7: bus-master list pointers ---------------------------------

    pub fn set_dn_list_ptr(&self, p: u32) {
        self.with_window(7, |io, base| io.outl(base + w7::DN_LIST_PTR, p))
    }

    pub fn dn_list_ptr(&self) -> u32 {
        self.with_window(7, |io, base| io.inl(base + w7::DN_LIST_PTR))
    }

    pub fn set_up_list_ptr(&self, p: u32) {
        self.with_window(7, |io, base| io.outl(base + w7::UP_LIST_PTR, p))
    }

    pub fn up_list_ptr(&self) -> u32 {
        self.with_window(7, |io, base| io.inl(base + w7::UP_LIST_PTR))
    }
}
