// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client-facing types for the EtherLink III driver core.
//!
//! This crate defines the vocabulary shared between the driver core, the
//! host API multiplexer, and external collaborators: card generations and
//! capability bits, station addresses, receive modes, statistics, and the
//! packet-driver operation and status codes. It contains no hardware access.

#![cfg_attr(not(test), no_std)]

use num_derive::FromPrimitive;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Minimum Ethernet frame length handled by the core (headers included).
pub const MIN_FRAME: usize = 14;
/// Maximum Ethernet frame length without VLAN (headers included).
pub const MAX_FRAME: usize = 1514;

/// The ethertype filter value that matches every frame ("promiscuous for
/// this handle"). 0xFFFF is reserved and never appears on the wire.
pub const TYPE_ANY: u16 = 0xFFFF;

/// A six-byte station address.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(transparent)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const BROADCAST: Self = Self([0xFF; 6]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 1 != 0
    }
}

impl core::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Card generation. Ordered: each generation is a strict superset of the
/// previous one's capabilities.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Generation {
    /// Original PIO-only cards.
    G1Basic,
    /// First bus-master generation, larger FIFOs.
    G2BusMaster,
    /// Permanent window 1, flow control, MII autonegotiation.
    G3Enhanced,
    /// Checksum offload, wake-on-LAN, full duplex.
    G4Advanced,
}

bitflags::bitflags! {
    /// Feature bits resolved from the card's generation.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct Capabilities: u16 {
        const BUS_MASTER         = 1 << 0;
        const PERMANENT_WINDOW_1 = 1 << 1;
        const FULL_DUPLEX        = 1 << 2;
        const FLOW_CONTROL       = 1 << 3;
        const HW_CHECKSUM        = 1 << 4;
        const WAKE_ON_LAN        = 1 << 5;
        const MII_AUTONEG        = 1 << 6;
        const LARGE_FIFO         = 1 << 7;
    }
}

impl Generation {
    /// Capability set for a generation. Monotonic: a later generation
    /// carries every earlier generation's bits.
    pub fn capabilities(self) -> Capabilities {
        let mut caps = Capabilities::empty();
        if self >= Generation::G2BusMaster {
            caps |= Capabilities::BUS_MASTER | Capabilities::LARGE_FIFO;
        }
        if self >= Generation::G3Enhanced {
            caps |= Capabilities::PERMANENT_WINDOW_1
                | Capabilities::FLOW_CONTROL
                | Capabilities::MII_AUTONEG;
        }
        if self >= Generation::G4Advanced {
            caps |= Capabilities::HW_CHECKSUM
                | Capabilities::WAKE_ON_LAN
                | Capabilities::FULL_DUPLEX;
        }
        caps
    }
}

/// Device lifecycle state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Uninit,
    Probed,
    Configured,
    Active,
    Suspended,
    Failed,
}

/// Receive modes, numbered per the packet-driver convention. Mode 4
/// (selective multicast) is folded into all-multicast: the hardware filter
/// has no multicast hash.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum ReceiveMode {
    Off = 1,
    Direct = 2,
    DirectBroadcast = 3,
    DirectBroadcastMulticast = 5,
    Promiscuous = 6,
}

impl ReceiveMode {
    /// Decodes a caller-supplied mode number; mode 4 is accepted and widened
    /// to all-multicast.
    pub fn from_wire(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::Off),
            2 => Some(Self::Direct),
            3 => Some(Self::DirectBroadcast),
            4 | 5 => Some(Self::DirectBroadcastMulticast),
            6 => Some(Self::Promiscuous),
            _ => None,
        }
    }
}

/// Error kinds raised inside the core, surfaced to collaborators through
/// STAT events and statistics counters.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NoDevice,
    EepromChecksum,
    EepromTimeout,
    DmaSelftestFail,
    NoDmaMemory,
    RingStall,
    FifoUnderrun,
    RxOverrun,
    WorkRingOverflow,
    SpuriousInterrupt,
    AdapterFailure,
    DeviceFailed,
}

/// Per-device statistics, as returned by `get_statistics`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub packets_in: u32,
    pub packets_out: u32,
    pub bytes_in: u32,
    pub bytes_out: u32,
    pub errors_in: u32,
    pub errors_out: u32,
    /// Frames that matched no registered handle.
    pub no_handler_drops: u32,
    /// Work records rejected because the deferral ring was full.
    pub work_ring_overflow: u32,
    pub dma_selftest_failures: u32,
    pub spurious_interrupts: u32,
    /// Interrupts taken on this device's line that it had not asserted
    /// (another device's edge on a shared line).
    pub not_ours_interrupts: u32,
    pub fifo_underruns: u32,
    pub ring_stalls: u32,
    pub rx_overruns: u32,
    /// End-of-interrupt signals emitted for this device's line.
    pub eoi_signals: u32,
    /// Interrupt causes acknowledged at the device.
    pub acked_causes: u32,
}

/// Identification returned by the `driver_info` operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DriverInfo {
    pub version: u16,
    /// Interface class: 1 = DIX Ethernet.
    pub class: u8,
    pub interfaces: u8,
    pub name: &'static str,
}

/// Operation codes accepted by the host API entry point.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum DriverOp {
    DriverInfo = 1,
    AccessType = 2,
    ReleaseType = 3,
    SendPkt = 4,
    Terminate = 5,
    GetAddress = 6,
    ResetInterface = 7,
    SetRcvMode = 20,
    GetRcvMode = 21,
    SetMulticastList = 22,
    GetStatistics = 24,
    SetAddress = 25,
}

/// Single-byte status codes returned across the host API boundary.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ApiError {
    BadHandle = 1,
    NoClass = 2,
    NoType = 3,
    NoNumber = 4,
    BadType = 5,
    NoMulticast = 6,
    CantTerminate = 7,
    BadMode = 8,
    NoSpace = 9,
    BadCommand = 11,
    CantSend = 12,
}

/// The wire form of an error: its single status byte.
impl From<ApiError> for u8 {
    fn from(e: ApiError) -> Self {
        e as u8
    }
}

/// Core faults that reach the host boundary outside a specific operation's
/// contract (in practice, a failed device refusing further commands) all
/// surface as the generic bad-command status.
impl From<ErrorKind> for ApiError {
    fn from(_: ErrorKind) -> Self {
        ApiError::BadCommand
    }
}

/// A client registration identifier. Unique per device while the handle is
/// open; slots are reused after release.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HandleId(pub u8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_are_monotonic() {
        let gens = [
            Generation::G1Basic,
            Generation::G2BusMaster,
            Generation::G3Enhanced,
            Generation::G4Advanced,
        ];
        for w in gens.windows(2) {
            assert!(
                w[1].capabilities().contains(w[0].capabilities()),
                "{:?} must include {:?}",
                w[1],
                w[0]
            );
        }
        assert_eq!(Generation::G1Basic.capabilities(), Capabilities::empty());
        assert!(Generation::G2BusMaster
            .capabilities()
            .contains(Capabilities::BUS_MASTER | Capabilities::LARGE_FIFO));
        assert!(!Generation::G2BusMaster
            .capabilities()
            .contains(Capabilities::PERMANENT_WINDOW_1));
    }

    #[test]
    fn receive_mode_wire_decode() {
        assert_eq!(ReceiveMode::from_wire(1), Some(ReceiveMode::Off));
        assert_eq!(
            ReceiveMode::from_wire(4),
            Some(ReceiveMode::DirectBroadcastMulticast)
        );
        assert_eq!(ReceiveMode::from_wire(6), Some(ReceiveMode::Promiscuous));
        assert_eq!(ReceiveMode::from_wire(0), None);
        assert_eq!(ReceiveMode::from_wire(7), None);
    }

    #[test]
    fn mac_display_and_classes() {
        let mac = MacAddress([0x02, 0x60, 0x8C, 0x11, 0x22, 0x33]);
        assert!(!mac.is_broadcast());
        assert!(!mac.is_multicast());
        assert!(MacAddress::BROADCAST.is_multicast());
        assert_eq!(format!("{mac}"), "02:60:8c:11:22:33");
    }

    #[test]
    fn op_and_status_codes_decode() {
        use num_traits::FromPrimitive;
        assert_eq!(DriverOp::from_u16(4), Some(DriverOp::SendPkt));
        assert_eq!(DriverOp::from_u16(24), Some(DriverOp::GetStatistics));
        assert_eq!(DriverOp::from_u16(8), None);
        assert_eq!(ApiError::from_u8(12), Some(ApiError::CantSend));
        assert_eq!(ApiError::from_u8(10), None);
    }

    #[test]
    fn boundary_conversions() {
        assert_eq!(u8::from(ApiError::BadHandle), 1);
        assert_eq!(u8::from(ApiError::CantSend), 12);
        assert_eq!(
            ApiError::from(ErrorKind::DeviceFailed),
            ApiError::BadCommand
        );
    }
}
