// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupt entry and deferral.
//!
//! The entry path does four things, in an order that is not negotiable:
//! read the device's interrupt status, acknowledge the asserted causes *at
//! the device*, enqueue work records for the worker, and only then signal
//! end-of-interrupt to the interrupt controller -- device ack must precede
//! controller EOI or edges get lost on edge-triggered controllers. With a
//! cascaded controller pair, the slave is signalled before the master.
//!
//! Nothing here selects register windows, performs cache maintenance, or
//! allocates; the status/ack register is window-independent and everything
//! else is deferred to the worker through the work ring. The entry runs in
//! bounded time.
//!
//! Lines 7 and 15 double as the controllers' spurious vectors: an entry on
//! one of those lines first consults the in-service register and, when the
//! assertion has evaporated, returns without any end-of-interrupt.

use core::sync::atomic::{AtomicU32, Ordering};

use drv_elink3_api::ErrorKind;
use workq::{Full, Producer};

use crate::regs::{Command, IntStatus, CMD_STATUS};
use crate::ElinkIo;

/// Index of a device within the host's device table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DevId(pub u8);

/// Deferred work, produced in interrupt context and consumed by the worker.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WorkItem {
    /// Received frame(s) are waiting in the data path.
    RxFrame(DevId),
    /// Transmit completions are waiting to be reclaimed.
    TxComplete(DevId),
    /// The on-card statistics counters are near overflow and need
    /// harvesting.
    Stats(DevId),
    /// The device reported a fault.
    Error(DevId, ErrorKind),
}

/// Capacity of the work ring.
pub const WORK_RING_DEPTH: usize = 32;

pub type WorkRing = workq::WorkQueue<WorkItem, WORK_RING_DEPTH>;
pub type WorkProducer<'q> = Producer<'q, WorkItem, WORK_RING_DEPTH>;
pub type WorkConsumer<'q> = workq::Consumer<'q, WorkItem, WORK_RING_DEPTH>;

/// Counters shared between the interrupt entry and the worker. The entry
/// only increments; the worker folds them into the device statistics.
#[derive(Debug, Default)]
pub struct IntrCounters {
    /// Work records rejected because the ring was full.
    pub work_dropped: AtomicU32,
    /// Spurious-line detections.
    pub spurious: AtomicU32,
    /// Entries on a shared line that this device had not asserted: nothing
    /// to acknowledge, but the controller is still owed its end-of-interrupt.
    pub not_ours: AtomicU32,
    /// End-of-interrupt signals issued.
    pub eoi: AtomicU32,
    /// Interrupts whose device causes were acknowledged.
    pub acked: AtomicU32,
}

impl IntrCounters {
    pub const fn new() -> Self {
        Self {
            work_dropped: AtomicU32::new(0),
            spurious: AtomicU32::new(0),
            not_ours: AtomicU32::new(0),
            eoi: AtomicU32::new(0),
            acked: AtomicU32::new(0),
        }
    }
}

/// System interrupt controller operations the entry path needs.
pub trait IrqController {
    /// Signals end-of-interrupt for `irq`. Implementations covering a
    /// cascaded pair must signal the slave before the master.
    fn end_of_interrupt(&self, irq: u8);
    /// Reads whether `irq` is currently marked in-service.
    fn in_service(&self, irq: u8) -> bool;
    fn mask(&self, irq: u8);
    fn unmask(&self, irq: u8);
}

/// The standard cascaded controller pair, driven over port I/O.
pub struct CascadedPic<B> {
    io: B,
}

const MASTER_CMD: u16 = 0x20;
const MASTER_DATA: u16 = 0x21;
const SLAVE_CMD: u16 = 0xA0;
const SLAVE_DATA: u16 = 0xA1;
/// Non-specific EOI.
const OCW2_EOI: u8 = 0x20;
/// Next command-port read returns the in-service register.
const OCW3_READ_ISR: u8 = 0x0B;

impl<B: ElinkIo> CascadedPic<B> {
    pub fn new(io: B) -> Self {
        Self { io }
    }
}

impl<B: ElinkIo> IrqController for CascadedPic<B> {
    fn end_of_interrupt(&self, irq: u8) {
        // Slave first, then master; a line behind the cascade needs both.
        if irq >= 8 {
            self.io.outb(SLAVE_CMD, OCW2_EOI);
        }
        self.io.outb(MASTER_CMD, OCW2_EOI);
    }

    fn in_service(&self, irq: u8) -> bool {
        let cmd = if irq < 8 { MASTER_CMD } else { SLAVE_CMD };
        self.io.outb(cmd, OCW3_READ_ISR);
        self.io.inb(cmd) & (1 << (irq & 7)) != 0
    }

    fn mask(&self, irq: u8) {
        let data = if irq < 8 { MASTER_DATA } else { SLAVE_DATA };
        let imr = self.io.inb(data);
        self.io.outb(data, imr | (1 << (irq & 7)));
    }

    fn unmask(&self, irq: u8) {
        let data = if irq < 8 { MASTER_DATA } else { SLAVE_DATA };
        let imr = self.io.inb(data);
        self.io.outb(data, imr & !(1 << (irq & 7)));
    }
}

/// The interrupt-side view of one device: just enough to acknowledge it and
/// describe the work. Constructed at activation; shares the I/O seam with
/// the worker-side driver by copy.
pub struct IrqGate<B> {
    io: B,
    io_base: u16,
    irq: u8,
    dev: DevId,
}

/// What an entry did; diagnostic.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IntrOutcome {
    /// Causes acknowledged and work enqueued.
    Serviced(IntStatus),
    /// The line was spurious; no EOI was signalled.
    Spurious,
    /// The device had nothing asserted; EOI only.
    NotOurs,
}

impl<B: ElinkIo> IrqGate<B> {
    pub fn new(io: B, io_base: u16, irq: u8, dev: DevId) -> Self {
        Self {
            io,
            io_base,
            irq,
            dev,
        }
    }

    pub fn irq(&self) -> u8 {
        self.irq
    }

    /// The interrupt entry. Bounded; no allocation, no window selects, no
    /// coherency work.
    pub fn on_interrupt<C: IrqController>(
        &mut self,
        pic: &C,
        q: &mut WorkProducer<'_>,
        counters: &IntrCounters,
    ) -> IntrOutcome {
        // Spurious vectors first: if the controller has nothing in service
        // the assertion evaporated, and no EOI is owed.
        if (self.irq == 7 || self.irq == 15) && !pic.in_service(self.irq) {
            counters.spurious.fetch_add(1, Ordering::Relaxed);
            return IntrOutcome::Spurious;
        }

        let status =
            IntStatus::from_bits_truncate(self.io.inw(self.io_base + CMD_STATUS));
        let causes = status & IntStatus::CAUSES;

        if causes.is_empty() {
            // Shared line, someone else's edge. Nothing to acknowledge, but
            // the controller was vectored and still gets its end-of-interrupt;
            // the separate count keeps the EOI ledger reconcilable.
            counters.not_ours.fetch_add(1, Ordering::Relaxed);
            pic.end_of_interrupt(self.irq);
            counters.eoi.fetch_add(1, Ordering::Relaxed);
            return IntrOutcome::NotOurs;
        }

        // Acknowledge at the device BEFORE the controller EOI.
        self.io.outw(
            self.io_base + CMD_STATUS,
            Command::AckIntr(causes).encode(),
        );
        counters.acked.fetch_add(1, Ordering::Relaxed);

        let mut push = |item| {
            if let Err(Full(_)) = q.push(item) {
                counters.work_dropped.fetch_add(1, Ordering::Relaxed);
            }
        };
        if causes.intersects(
            IntStatus::RX_COMPLETE | IntStatus::RX_EARLY | IntStatus::UP_COMPLETE,
        ) {
            push(WorkItem::RxFrame(self.dev));
        }
        if causes.intersects(
            IntStatus::TX_COMPLETE
                | IntStatus::TX_AVAILABLE
                | IntStatus::DOWN_COMPLETE
                | IntStatus::DMA_DONE,
        ) {
            push(WorkItem::TxComplete(self.dev));
        }
        if causes.contains(IntStatus::STATS_FULL) {
            push(WorkItem::Stats(self.dev));
        }
        if causes.contains(IntStatus::ADAPTER_FAILURE) {
            push(WorkItem::Error(self.dev, ErrorKind::AdapterFailure));
        }

        pic.end_of_interrupt(self.irq);
        counters.eoi.fetch_add(1, Ordering::Relaxed);
        IntrOutcome::Serviced(causes)
    }
}
