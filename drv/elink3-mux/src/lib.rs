// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host API multiplexer: many clients, one card.
//!
//! Clients register interest in an ethertype and get back a handle; received
//! frames are delivered to the first handle, in registration order, whose
//! filter matches. Transmits funnel through the same table. The external
//! entry point is a single operation-code dispatcher returning the classic
//! single-byte status codes; everything else here is the worker that drains
//! the interrupt core's work ring.
//!
//! Concurrency is the cooperative model: the worker owns `&mut PktMux` for
//! the duration of a pass, which *is* the device lock -- handle callbacks
//! receive only the frame bytes and therefore cannot re-enter the
//! multiplexer for the same device, and the interrupt entry shares nothing
//! with this module but the lock-free work ring and a few atomic counters.

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::Ordering;

use arrayvec::ArrayVec;
use num_traits::FromPrimitive;
use zerocopy::big_endian::U16 as U16be;
use zerocopy::{Immutable, IntoBytes};

use dmapool::DmaHost;
use drv_elink3::regs::{IntStatus, RxFilter};
use drv_elink3::{Clock, Elink3, ElinkIo, IntrCounters, IrqController, WorkConsumer, WorkItem};
use drv_elink3_api::{
    ApiError, DeviceState, DriverInfo, DriverOp, ErrorKind, HandleId, MacAddress, ReceiveMode,
    Stats, MAX_FRAME, TYPE_ANY,
};
use ringlog::{ringlog, ringlog_entry};

/// Receive callback: handle, frame bytes, caller context word.
pub type RxCallback = fn(HandleId, &[u8], usize);

/// Handles per device.
pub const MAX_HANDLES: usize = 16;

/// Driver identification returned by the `driver_info` operation.
pub const INFO: DriverInfo = DriverInfo {
    version: 0x0101,
    class: 1, // DIX Ethernet
    interfaces: 1,
    name: "elink3",
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Event {
    None,
    Registered { ethertype: u16 },
    Released { ethertype: u16 },
    NoHandler { ethertype: u16 },
    DeviceFault(ErrorKind),
}

ringlog!(Event, 16, Event::None);

struct HandleSlot {
    ethertype: u16,
    callback: RxCallback,
    user: usize,
    owner: &'static str,
    received: u32,
    dropped: u32,
}

/// Summary of one worker pass.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    pub items: u32,
    pub frames: u32,
}

const NO_SLOT: Option<HandleSlot> = None;

/// The multiplexer for one device.
pub struct PktMux<'m, B, H = dmapool::DirectHost> {
    dev: Elink3<'m, B, H>,
    slots: [Option<HandleSlot>; MAX_HANDLES],
    /// Live handle indices, oldest registration first.
    order: ArrayVec<u8, MAX_HANDLES>,
    mode: ReceiveMode,
    multicast_list: bool,
    staging: [u8; MAX_FRAME],
}

impl<'m, B: ElinkIo, H: DmaHost> PktMux<'m, B, H> {
    pub fn new(dev: Elink3<'m, B, H>) -> Self {
        Self {
            dev,
            slots: [NO_SLOT; MAX_HANDLES],
            order: ArrayVec::new(),
            mode: ReceiveMode::DirectBroadcast,
            multicast_list: false,
            staging: [0; MAX_FRAME],
        }
    }

    /// Brings the device active.
    ///
    /// The dispatch and transmit paths below are monomorphized over the
    /// port-I/O implementation and `#[inline]`-folded, so the per-device
    /// constants they lean on (I/O base, copy-break threshold) are loaded
    /// once and held in registers across a pass rather than re-read through
    /// memory each call.
    pub fn activate(&mut self, pic: &impl IrqController) -> Result<(), ErrorKind> {
        self.apply_filter();
        self.dev.activate(pic)
    }

    pub fn device(&self) -> &Elink3<'m, B, H> {
        &self.dev
    }

    pub fn device_mut(&mut self) -> &mut Elink3<'m, B, H> {
        &mut self.dev
    }

    // -- client operations --------------------------------------------------

    /// Registers a client for `ethertype` ([`TYPE_ANY`] matches every
    /// frame).
    pub fn access_type(
        &mut self,
        ethertype: u16,
        callback: RxCallback,
        user: usize,
        owner: &'static str,
    ) -> Result<HandleId, ApiError> {
        if ethertype != TYPE_ANY
            && self
                .live_handles()
                .any(|(_, s)| s.ethertype == ethertype)
        {
            return Err(ApiError::BadType);
        }
        let Some(idx) = self.slots.iter().position(Option::is_none) else {
            return Err(ApiError::NoSpace);
        };
        self.slots[idx] = Some(HandleSlot {
            ethertype,
            callback,
            user,
            owner,
            received: 0,
            dropped: 0,
        });
        self.order.push(idx as u8);
        ringlog_entry!(Event::Registered { ethertype });
        Ok(HandleId(idx as u8))
    }

    /// Releases a handle. No further callbacks occur for it.
    pub fn release_type(&mut self, handle: HandleId) -> Result<(), ApiError> {
        let idx = self.check_handle(handle)?;
        let ethertype = self.slots[idx].take().map(|s| s.ethertype).unwrap_or(0);
        self.order.retain(|i| usize::from(*i) != idx);
        ringlog_entry!(Event::Released { ethertype });
        Ok(())
    }

    /// Transmits `frame` on behalf of `handle`.
    pub fn send(&mut self, handle: HandleId, frame: &[u8]) -> Result<(), ApiError> {
        self.check_handle(handle)?;
        self.transmit(frame)
    }

    pub fn get_address(&self) -> MacAddress {
        self.dev.mac()
    }

    pub fn set_rcv_mode(&mut self, handle: HandleId, raw: u16) -> Result<(), ApiError> {
        self.check_handle(handle)?;
        self.mode = ReceiveMode::from_wire(raw).ok_or(ApiError::BadMode)?;
        self.apply_filter();
        Ok(())
    }

    pub fn get_rcv_mode(&self, handle: HandleId) -> Result<u16, ApiError> {
        self.check_handle(handle)?;
        Ok(self.mode as u16)
    }

    /// Points the hardware multicast filter at `list`. The filter is
    /// all-or-nothing, so a non-empty list opens the multicast bit and an
    /// empty list closes it again.
    pub fn set_multicast_list(
        &mut self,
        handle: HandleId,
        list: &[MacAddress],
    ) -> Result<(), ApiError> {
        self.check_handle(handle)?;
        if list.iter().any(|m| !m.is_multicast()) {
            return Err(ApiError::NoMulticast);
        }
        self.multicast_list = !list.is_empty();
        self.apply_filter();
        Ok(())
    }

    pub fn get_statistics(&self, handle: HandleId) -> Result<Stats, ApiError> {
        self.check_handle(handle)?;
        Ok(*self.dev.stats())
    }

    /// Per-handle receive/drop counters.
    pub fn handle_counts(&self, handle: HandleId) -> Result<(u32, u32), ApiError> {
        let idx = self.check_handle(handle)?;
        let s = self.slots[idx].as_ref().ok_or(ApiError::BadHandle)?;
        Ok((s.received, s.dropped))
    }

    /// Releases every handle sharing the caller's owner tag. If other
    /// owners' handles remain the device stays up and the call reports that
    /// it could not terminate; otherwise the device is suspended.
    pub fn terminate(&mut self, handle: HandleId) -> Result<(), ApiError> {
        let idx = self.check_handle(handle)?;
        let owner = self.slots[idx].as_ref().ok_or(ApiError::BadHandle)?.owner;
        for i in 0..MAX_HANDLES {
            if self.slots[i].as_ref().is_some_and(|s| s.owner == owner) {
                self.slots[i] = None;
                self.order.retain(|o| usize::from(*o) != i);
            }
        }
        if self.order.is_empty() {
            self.dev.suspend();
            Ok(())
        } else {
            Err(ApiError::CantTerminate)
        }
    }

    /// Resets and re-binds the data path; statistics and handles survive.
    pub fn reset_interface(&mut self) -> Result<(), ApiError> {
        self.dev.reset_interface().map_err(ApiError::from)
    }

    /// Rewrites the station address. Refused while the device is active
    /// with clients attached.
    pub fn set_address(&mut self, mac: MacAddress) -> Result<(), ApiError> {
        if self.dev.state() == DeviceState::Active && !self.order.is_empty() {
            return Err(ApiError::BadCommand);
        }
        self.dev.set_station_address(mac);
        Ok(())
    }

    /// Broadcasts a gratuitous ARP for `ipv4`, announcing this station's
    /// address (used when traffic fails over onto this device).
    pub fn announce(&mut self, ipv4: [u8; 4]) -> Result<(), ApiError> {
        let mac = self.dev.mac();
        let arp = GratuitousArp::for_station(mac, ipv4);
        let mut frame = [0u8; 60];
        frame[..core::mem::size_of::<GratuitousArp>()].copy_from_slice(arp.as_bytes());
        self.transmit(&frame)
    }

    // -- external entry -----------------------------------------------------

    /// The single dispatch entry: operation code plus parameter block, byte
    /// status code on failure.
    pub fn entry(&mut self, op: u16, args: OpArgs<'_>) -> Result<OpReply, u8> {
        let op = DriverOp::from_u16(op).ok_or(ApiError::BadCommand)?;
        let r = match (op, args) {
            (DriverOp::DriverInfo, OpArgs::None) => Ok(OpReply::Info(INFO)),
            (
                DriverOp::AccessType,
                OpArgs::AccessType {
                    ethertype,
                    callback,
                    user,
                    owner,
                },
            ) => self
                .access_type(ethertype, callback, user, owner)
                .map(OpReply::Handle),
            (DriverOp::ReleaseType, OpArgs::Handle(h)) => {
                self.release_type(h).map(|()| OpReply::None)
            }
            (DriverOp::SendPkt, OpArgs::Send { handle, frame }) => {
                self.send(handle, frame).map(|()| OpReply::None)
            }
            (DriverOp::Terminate, OpArgs::Handle(h)) => {
                self.terminate(h).map(|()| OpReply::None)
            }
            (DriverOp::GetAddress, OpArgs::None) => Ok(OpReply::Address(self.get_address())),
            (DriverOp::ResetInterface, OpArgs::None) => {
                self.reset_interface().map(|()| OpReply::None)
            }
            (DriverOp::SetRcvMode, OpArgs::HandleMode { handle, mode }) => {
                self.set_rcv_mode(handle, mode).map(|()| OpReply::None)
            }
            (DriverOp::GetRcvMode, OpArgs::Handle(h)) => {
                self.get_rcv_mode(h).map(OpReply::Mode)
            }
            (DriverOp::SetMulticastList, OpArgs::MulticastList { handle, list }) => {
                self.set_multicast_list(handle, list).map(|()| OpReply::None)
            }
            (DriverOp::GetStatistics, OpArgs::Handle(h)) => {
                self.get_statistics(h).map(OpReply::Stats)
            }
            (DriverOp::SetAddress, OpArgs::Address(mac)) => {
                self.set_address(mac).map(|()| OpReply::None)
            }
            _ => Err(ApiError::BadCommand),
        };
        r.map_err(u8::from)
    }

    // -- worker -------------------------------------------------------------

    /// One cooperative worker pass: folds the interrupt-side counters into
    /// the statistics, processes the work records that were queued when the
    /// pass began, then runs data-path maintenance. Holding `&mut self`
    /// through the pass is the device lock.
    pub fn worker_pass(
        &mut self,
        q: &mut WorkConsumer<'_>,
        counters: &IntrCounters,
        clock: &impl Clock,
    ) -> PassReport {
        let stats = self.dev.stats_mut();
        stats.work_ring_overflow += counters.work_dropped.swap(0, Ordering::Relaxed);
        stats.spurious_interrupts += counters.spurious.swap(0, Ordering::Relaxed);
        stats.not_ours_interrupts += counters.not_ours.swap(0, Ordering::Relaxed);
        stats.eoi_signals += counters.eoi.swap(0, Ordering::Relaxed);
        stats.acked_causes += counters.acked.swap(0, Ordering::Relaxed);

        let mut report = PassReport::default();
        let budget = q.len();
        for _ in 0..budget {
            let Some(item) = q.pop() else { break };
            report.items += 1;
            // Each record runs to completion before the next; the worker
            // yields only between records.
            match item {
                WorkItem::RxFrame(_) => {
                    if let Some(len) = self.dev.receive_poll(&mut self.staging) {
                        self.dispatch_frame(len);
                        report.frames += 1;
                    }
                }
                WorkItem::TxComplete(_) => {
                    self.dev.interrupt_work(
                        IntStatus::TX_COMPLETE
                            | IntStatus::TX_AVAILABLE
                            | IntStatus::DOWN_COMPLETE,
                        clock.now_us(),
                    );
                }
                WorkItem::Stats(_) => self.dev.harvest_stats(),
                WorkItem::Error(_, kind) => {
                    ringlog_entry!(Event::DeviceFault(kind));
                    self.dev.fail(kind);
                }
            }
        }

        let _ = self.dev.maintain(clock.now_us());
        report
    }

    /// Delivers one staged frame to the first matching handle in
    /// registration order.
    #[inline]
    fn dispatch_frame(&mut self, len: usize) {
        if self.dev.state() != DeviceState::Active {
            return;
        }
        if len < 14 {
            self.dev.stats_mut().errors_in += 1;
            return;
        }
        let ethertype = u16::from_be_bytes([self.staging[12], self.staging[13]]);

        let hit = self.order.iter().copied().find(|&i| {
            self.slots[usize::from(i)]
                .as_ref()
                .is_some_and(|s| s.ethertype == TYPE_ANY || s.ethertype == ethertype)
        });

        match hit {
            Some(i) => {
                let idx = usize::from(i);
                let (cb, user) = {
                    let s = self.slots[idx].as_mut().expect("live handle in order");
                    s.received += 1;
                    (s.callback, s.user)
                };
                cb(HandleId(i), &self.staging[..len], user);
            }
            None => {
                ringlog_entry!(Event::NoHandler { ethertype });
                self.dev.stats_mut().no_handler_drops += 1;
            }
        }
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<(), ApiError> {
        self.dev.transmit(frame).map(|_| ()).map_err(ApiError::from)
    }

    fn check_handle(&self, handle: HandleId) -> Result<usize, ApiError> {
        let idx = usize::from(handle.0);
        if idx >= MAX_HANDLES || self.slots[idx].is_none() {
            return Err(ApiError::BadHandle);
        }
        Ok(idx)
    }

    fn live_handles(&self) -> impl Iterator<Item = (usize, &HandleSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s)))
    }

    fn apply_filter(&mut self) {
        let mut f = match self.mode {
            ReceiveMode::Off => RxFilter::empty(),
            ReceiveMode::Direct => RxFilter::STATION,
            ReceiveMode::DirectBroadcast => RxFilter::STATION | RxFilter::BROADCAST,
            ReceiveMode::DirectBroadcastMulticast => {
                RxFilter::STATION | RxFilter::BROADCAST | RxFilter::MULTICAST
            }
            ReceiveMode::Promiscuous => {
                RxFilter::STATION
                    | RxFilter::BROADCAST
                    | RxFilter::MULTICAST
                    | RxFilter::PROMISCUOUS
            }
        };
        if self.multicast_list {
            f |= RxFilter::MULTICAST;
        }
        self.dev.set_rx_filter(f);
    }
}

/// Arguments to [`PktMux::entry`], one variant per parameter-block shape.
pub enum OpArgs<'a> {
    None,
    AccessType {
        ethertype: u16,
        callback: RxCallback,
        user: usize,
        owner: &'static str,
    },
    Handle(HandleId),
    Send {
        handle: HandleId,
        frame: &'a [u8],
    },
    HandleMode {
        handle: HandleId,
        mode: u16,
    },
    MulticastList {
        handle: HandleId,
        list: &'a [MacAddress],
    },
    Address(MacAddress),
}

/// Replies from [`PktMux::entry`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpReply {
    None,
    Info(DriverInfo),
    Handle(HandleId),
    Address(MacAddress),
    Mode(u16),
    Stats(Stats),
}

/// A gratuitous ARP request: broadcast, sender and target protocol address
/// both the announcing station's.
#[derive(IntoBytes, Immutable)]
#[repr(C)]
struct GratuitousArp {
    dst: [u8; 6],
    src: [u8; 6],
    ethertype: U16be,
    htype: U16be,
    ptype: U16be,
    hlen: u8,
    plen: u8,
    oper: U16be,
    sha: [u8; 6],
    spa: [u8; 4],
    tha: [u8; 6],
    tpa: [u8; 4],
}

impl GratuitousArp {
    fn for_station(mac: MacAddress, ipv4: [u8; 4]) -> Self {
        Self {
            dst: [0xFF; 6],
            src: mac.0,
            ethertype: U16be::new(0x0806),
            htype: U16be::new(1),
            ptype: U16be::new(0x0800),
            hlen: 6,
            plen: 4,
            oper: U16be::new(1),
            sha: mac.0,
            spa: ipv4,
            tha: [0; 6],
            tpa: ipv4,
        }
    }
}
