// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bus-master data path.
//!
//! Two descriptor rings, both served out of the device's buffer pool: a
//! 16-entry download (transmit) ring and a 32-entry upload (receive) ring
//! whose descriptors each carry a pre-attached full-size buffer. The card
//! follows `next` links; the driver follows indices and converts to bus
//! addresses only at the hardware boundary.
//!
//! Publication discipline on transmit: a new descriptor's fields are written
//! first, a fence is emitted, and only then is the previous descriptor's
//! link pointed at it. The card can walk the list concurrently and must
//! never see a half-written record.
//!
//! If the card stops making download progress while work is pending, the
//! ring is reset and restarted; three such stalls inside ten seconds condemn
//! the device.

use dmapool::{DmaBuf, DmaHost, DmaMem, DmaPool, NoDmaMemory, Purpose, Reach};
use drv_elink3_api::{ErrorKind, Stats, MAX_FRAME, MIN_FRAME};
use ringlog::{ringlog, ringlog_entry};
use zerocopy::little_endian::U32;

use crate::pio::COPY_BREAK;
use crate::regs::{Command, IntStatus, WindowedIo};
use crate::ring::{Desc, DescRing, DESC_SIZE, LAST_FRAG, RX_DONE, RX_ERROR, RX_LEN_MASK, TX_DONE};
use crate::{ElinkIo, TxError, TxTicket};

pub const TX_RING_LEN: usize = 16;
pub const RX_RING_LEN: usize = 32;
/// Size of each pre-attached receive buffer.
pub const RX_BUF_LEN: usize = 1536;

/// Bytes of pool storage reserved for the two rings.
pub const RING_BYTES: u32 = ((TX_RING_LEN + RX_RING_LEN) * DESC_SIZE) as u32;

/// Download progress timeout before a ring reset.
pub const STALL_TIMEOUT_US: u64 = 2_000_000;
/// Window over which stalls are counted.
pub const STALL_WINDOW_US: u64 = 10_000_000;
/// Stalls within the window that fail the device.
pub const STALL_LIMIT: usize = 3;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Event {
    None,
    Bound,
    Stall { count: u32 },
    RxReplaceFailed,
}

ringlog!(Event, 16, Event::None);

const NO_BUF: Option<DmaBuf> = None;

pub struct DmaEngine<'m, H> {
    pool: DmaPool<'m, H>,
    tx: DescRing<'m>,
    rx: DescRing<'m>,
    tx_bufs: [Option<DmaBuf>; TX_RING_LEN],
    rx_bufs: [Option<DmaBuf>; RX_RING_LEN],
    /// Next transmit slot to fill.
    tx_next: usize,
    /// Oldest transmit slot awaiting completion.
    tx_dirty: usize,
    /// Filled, un-reclaimed transmit slots.
    tx_pending: usize,
    /// Slot most recently linked into the download list.
    tx_last: Option<usize>,
    /// Next receive slot the card will fill.
    rx_next: usize,
    ticket: u16,
    last_progress_us: u64,
    stall_times: [u64; STALL_LIMIT],
    stalls: usize,
    small_staged: u32,
    large_staged: u32,
}

impl<'m, H: DmaHost> DmaEngine<'m, H> {
    /// Carves the rings and receive buffers out of `pool` and populates the
    /// upload ring. Fails if the pool cannot cover them.
    pub fn new(mut pool: DmaPool<'m, H>, now_us: u64) -> Result<Self, NoDmaMemory> {
        let tx_region = pool.alloc_ring((TX_RING_LEN * DESC_SIZE) as u32)?;
        let rx_region = pool.alloc_ring((RX_RING_LEN * DESC_SIZE) as u32)?;
        let mem = pool.mem();
        let tx = DescRing::new(mem, &tx_region, TX_RING_LEN);
        let rx = DescRing::new(mem, &rx_region, RX_RING_LEN);

        let mut rx_bufs = [NO_BUF; RX_RING_LEN];
        for (i, slot) in rx_bufs.iter_mut().enumerate() {
            let buf = pool.allocate(RX_BUF_LEN, Purpose::Rx)?;
            rx.write(
                i,
                &Desc {
                    next: U32::new(rx.bus_of((i + 1) % RX_RING_LEN)),
                    status: U32::new(0),
                    frag_addr: U32::new(buf.bus_addr()),
                    frag_len: U32::new(RX_BUF_LEN as u32 | LAST_FRAG),
                },
            );
            *slot = Some(buf);
        }

        Ok(Self {
            pool,
            tx,
            rx,
            tx_bufs: [NO_BUF; TX_RING_LEN],
            rx_bufs,
            tx_next: 0,
            tx_dirty: 0,
            tx_pending: 0,
            tx_last: None,
            rx_next: 0,
            ticket: 0,
            last_progress_us: now_us,
            stall_times: [0; STALL_LIMIT],
            stalls: 0,
            small_staged: 0,
            large_staged: 0,
        })
    }

    /// Hands the upload list to the card. Called on the transition into the
    /// configured state.
    pub fn bind<B: ElinkIo>(&mut self, win: &WindowedIo<B>) {
        win.command_wait(Command::UpStall);
        win.set_up_list_ptr(self.rx.bus_of(self.rx_next));
        win.command(Command::UpUnstall);
        win.set_dn_list_ptr(0);
        ringlog_entry!(Event::Bound);
    }

    /// Appends one frame to the download list.
    pub fn transmit<B: ElinkIo>(
        &mut self,
        win: &WindowedIo<B>,
        frame: &[u8],
        stats: &mut Stats,
    ) -> Result<TxTicket, TxError> {
        if frame.len() < MIN_FRAME || frame.len() > MAX_FRAME {
            return Err(TxError::BadLength);
        }
        let slot = self.tx_next;
        if self.tx_bufs[slot].is_some() {
            return Err(TxError::QueueFull);
        }

        let mut buf = self
            .pool
            .allocate(frame.len(), Purpose::Tx)
            .map_err(|NoDmaMemory| TxError::QueueFull)?;
        self.pool.write(&buf, 0, frame);
        if self.pool.before_nic_read(&mut buf).is_err() {
            self.pool.release(buf);
            return Err(TxError::QueueFull);
        }

        // Fill every field of the new record with its link open, fence, and
        // only then link it where the card can find it.
        self.tx.write(
            slot,
            &Desc {
                next: U32::new(0),
                status: U32::new(frame.len() as u32),
                frag_addr: U32::new(buf.bus_addr()),
                frag_len: U32::new(frame.len() as u32 | LAST_FRAG),
            },
        );
        self.publish_fence();
        match self.tx_last {
            Some(prev) if self.tx_pending > 0 => {
                self.tx.write_next(prev, self.tx.bus_of(slot));
            }
            _ => {
                win.command_wait(Command::DownStall);
                win.set_dn_list_ptr(self.tx.bus_of(slot));
            }
        }
        win.command(Command::DownUnstall);

        self.tx_bufs[slot] = Some(buf);
        self.tx_last = Some(slot);
        self.tx_next = (slot + 1) % TX_RING_LEN;
        self.tx_pending += 1;
        stats.bytes_out += frame.len() as u32;

        self.ticket = self.ticket.wrapping_add(1);
        Ok(TxTicket(self.ticket))
    }

    /// Pulls the next uploaded frame into `out`, if the card has finished
    /// one, and re-arms its descriptor.
    pub fn receive_poll<B: ElinkIo>(
        &mut self,
        _win: &WindowedIo<B>,
        out: &mut [u8],
        stats: &mut Stats,
    ) -> Option<usize> {
        let slot = self.rx_next;
        let status = self.rx.read_status(slot);
        if status & RX_DONE == 0 {
            return None;
        }

        if status & RX_ERROR != 0 {
            stats.errors_in += 1;
            self.rearm_rx(slot);
            self.rx_next = (slot + 1) % RX_RING_LEN;
            return None;
        }

        let len = (status & RX_LEN_MASK) as usize;
        if len == 0 || len > out.len() || len > RX_BUF_LEN {
            stats.errors_in += 1;
            self.rearm_rx(slot);
            self.rx_next = (slot + 1) % RX_RING_LEN;
            return None;
        }

        // The card wrote this buffer; complete the ownership transition
        // before the CPU reads a byte of it.
        let mut buf = self.rx_bufs[slot].take()?;
        self.pool.after_nic_write(&mut buf);
        self.pool.read(&buf, 0, &mut out[..len]);

        if len < COPY_BREAK {
            // Small frame: the staging copy above is the whole story; keep
            // the original buffer attached.
            self.small_staged += 1;
            self.pool.settle(&mut buf);
            self.rx_bufs[slot] = Some(buf);
            self.rearm_rx(slot);
        } else {
            // Large frame: recycle this buffer through the pool and attach a
            // fresh one -- unless the pool is dry, in which case the old one
            // goes straight back on the ring.
            self.large_staged += 1;
            match self.pool.allocate(RX_BUF_LEN, Purpose::Rx) {
                Ok(fresh) => {
                    self.rx
                        .write(slot, &self.rx_desc_for(slot, fresh.bus_addr()));
                    self.publish_fence();
                    self.rx_bufs[slot] = Some(fresh);
                    self.pool.release(buf);
                }
                Err(NoDmaMemory) => {
                    ringlog_entry!(Event::RxReplaceFailed);
                    self.pool.settle(&mut buf);
                    self.rx_bufs[slot] = Some(buf);
                    self.rearm_rx(slot);
                }
            }
        }

        self.rx_next = (slot + 1) % RX_RING_LEN;
        stats.packets_in += 1;
        stats.bytes_in += len as u32;
        Some(len)
    }

    /// Advances completions under worker context.
    pub fn interrupt_work<B: ElinkIo>(
        &mut self,
        _win: &WindowedIo<B>,
        status: IntStatus,
        stats: &mut Stats,
        now_us: u64,
    ) {
        if status.intersects(IntStatus::DOWN_COMPLETE | IntStatus::TX_COMPLETE) {
            while self.tx_pending > 0 {
                let slot = self.tx_dirty;
                let st = self.tx.read_status(slot);
                if st & TX_DONE == 0 {
                    break;
                }
                if let Some(buf) = self.tx_bufs[slot].take() {
                    self.pool.release(buf);
                }
                stats.packets_out += 1;
                self.tx_dirty = (slot + 1) % TX_RING_LEN;
                self.tx_pending -= 1;
                self.last_progress_us = now_us;
            }
            if self.tx_pending == 0 {
                self.tx_last = None;
            }
        }
        if status.contains(IntStatus::UP_COMPLETE) {
            self.last_progress_us = now_us;
        }
    }

    /// Stall watchdog; run once per worker pass.
    ///
    /// A download list with pending work and no progress for
    /// [`STALL_TIMEOUT_US`] gets a ring reset. Returns the fatal
    /// [`ErrorKind::RingStall`] once [`STALL_LIMIT`] resets land inside
    /// [`STALL_WINDOW_US`].
    pub fn maintain<B: ElinkIo>(
        &mut self,
        win: &WindowedIo<B>,
        now_us: u64,
        stats: &mut Stats,
    ) -> Result<(), ErrorKind> {
        if self.tx_pending == 0 || now_us.saturating_sub(self.last_progress_us) < STALL_TIMEOUT_US
        {
            return Ok(());
        }

        stats.ring_stalls += 1;
        self.stall_times[self.stalls % STALL_LIMIT] = now_us;
        self.stalls += 1;
        ringlog_entry!(Event::Stall {
            count: self.stalls as u32
        });

        let in_window = self
            .stall_times
            .iter()
            .take(self.stalls.min(STALL_LIMIT))
            .filter(|&&t| now_us.saturating_sub(t) <= STALL_WINDOW_US)
            .count();
        if in_window >= STALL_LIMIT {
            return Err(ErrorKind::RingStall);
        }

        // Ring reset: stall the engine, point it back at the oldest pending
        // record, restart.
        win.command_wait(Command::DownStall);
        win.set_dn_list_ptr(self.tx.bus_of(self.tx_dirty));
        win.command(Command::DownUnstall);
        self.last_progress_us = now_us;
        Ok(())
    }

    /// Receive staging decisions taken so far: `(small, large)`.
    pub fn staging_counts(&self) -> (u32, u32) {
        (self.small_staged, self.large_staged)
    }

    /// Zeroes the staging counters; used once after the bind-time self-test
    /// so its traffic does not muddy the accounting.
    pub(crate) fn reset_staging(&mut self) {
        self.small_staged = 0;
        self.large_staged = 0;
    }

    /// Filled, un-reclaimed download slots.
    pub fn tx_pending(&self) -> usize {
        self.tx_pending
    }

    /// The pool, for diagnostics and for the loopback self-test.
    pub fn pool(&mut self) -> &mut DmaPool<'m, H> {
        &mut self.pool
    }

    /// The shared-memory window the rings live in.
    pub fn mem(&self) -> DmaMem<'m> {
        self.pool.mem()
    }

    /// Checks that every descriptor currently owned by the card points at a
    /// live, boundary-safe buffer. Diagnostic; used by tests and the
    /// self-test.
    pub fn check_descriptors(&self) -> bool {
        (0..RX_RING_LEN).all(|i| match &self.rx_bufs[i] {
            Some(buf) => {
                let d = self.rx.read(i);
                d.frag_addr.get() == buf.bus_addr()
                    && dmapool::crosses_64k(buf.phys(), buf.len() as u32).is_none()
            }
            None => false,
        })
    }

    fn rx_desc_for(&self, slot: usize, frag_addr: u32) -> Desc {
        Desc {
            next: U32::new(self.rx.bus_of((slot + 1) % RX_RING_LEN)),
            status: U32::new(0),
            frag_addr: U32::new(frag_addr),
            frag_len: U32::new(RX_BUF_LEN as u32 | LAST_FRAG),
        }
    }

    /// Returns a consumed upload descriptor to the card with its attached
    /// buffer unchanged.
    fn rearm_rx(&self, slot: usize) {
        self.publish_fence();
        self.rx.write_status(slot, 0);
    }

    /// Orders descriptor-field stores ahead of the store that publishes
    /// them. Required whenever the cache policy is anything but "no cache".
    fn publish_fence(&self) {
        if self.pool.cache_policy() != dmapool::CachePolicy::None {
            core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
        }
    }
}

/// Address reach of the bus a device sits on.
pub fn reach_for(bus: crate::BusKind) -> Reach {
    match bus {
        crate::BusKind::Legacy => Reach::Bits24,
        crate::BusKind::Structured => Reach::Bits32,
    }
}
