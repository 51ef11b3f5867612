// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Structured-bus (PCI) enumeration.
//!
//! Devices on this bus are found by walking configuration space through the
//! standard address/data port pair, matching vendor and device identifiers
//! against the supported-device table, and pulling the I/O base and
//! interrupt line out of the configuration header. No isolation dance is
//! needed; the bus tells us what is there.

use crate::{BusKind, Candidate, ElinkIo};
use drv_elink3_api::Generation;

/// Configuration-space address and data ports.
const CONFIG_ADDRESS: u16 = 0x0CF8;
const CONFIG_DATA: u16 = 0x0CFC;

/// The vendor identifier all supported structured-bus cards carry.
pub const VENDOR_ID: u16 = 0x10B7;

/// Buses and device slots walked by [`enumerate`].
const MAX_BUS: u8 = 4;
const DEVICES_PER_BUS: u8 = 32;

/// Configuration header offsets.
const CFG_ID: u8 = 0x00;
const CFG_BAR0: u8 = 0x10;
const CFG_INT_LINE: u8 = 0x3C;

/// Device-identifier classification.
///
/// The 0x9000-series identifiers cover both the first bus-master design and
/// its early fast-Ethernet spins; both program identically, so the whole
/// series (including the 0x905x spins) classifies as the bus-master
/// generation. The 0x92xx series and the hot-pluggable variants are the
/// enhanced design; 0x93xx is the advanced one.
pub fn generation_for_device(device: u16) -> Option<Generation> {
    match device {
        0x5900 | 0x5920 | 0x5950 | 0x5951 | 0x5952 => Some(Generation::G2BusMaster),
        0x9000 | 0x9001 | 0x9004 | 0x9005 | 0x9006 => Some(Generation::G2BusMaster),
        0x9050 | 0x9051 | 0x9055 | 0x9058 => Some(Generation::G2BusMaster),
        0x9200 | 0x9201 | 0x9202 => Some(Generation::G3Enhanced),
        0x5057 | 0x5157 | 0x5257 | 0x6056 | 0x6057 | 0x6560 => Some(Generation::G3Enhanced),
        0x9300 | 0x9301 | 0x9302 => Some(Generation::G4Advanced),
        _ => None,
    }
}

fn config_read_u32<B: ElinkIo>(io: &B, bus: u8, dev: u8, func: u8, offset: u8) -> u32 {
    let addr = 0x8000_0000
        | (u32::from(bus) << 16)
        | (u32::from(dev) << 11)
        | (u32::from(func) << 8)
        | u32::from(offset & 0xFC);
    io.outl(CONFIG_ADDRESS, addr);
    io.inl(CONFIG_DATA)
}

/// Walks configuration space and appends one candidate per supported device.
/// Stops when `out` is full.
pub fn enumerate<B: ElinkIo, const N: usize>(io: &B, out: &mut heapless::Vec<Candidate, N>) {
    for bus in 0..MAX_BUS {
        for dev in 0..DEVICES_PER_BUS {
            let id = config_read_u32(io, bus, dev, 0, CFG_ID);
            let vendor = id as u16;
            let device = (id >> 16) as u16;
            if vendor != VENDOR_ID {
                continue;
            }
            if generation_for_device(device).is_none() {
                continue;
            }

            let bar0 = config_read_u32(io, bus, dev, 0, CFG_BAR0);
            if bar0 & 1 == 0 {
                // Not an I/O resource; this family always maps its window
                // into I/O space.
                continue;
            }
            let io_base = (bar0 & 0xFFFC) as u16;
            let irq = config_read_u32(io, bus, dev, 0, CFG_INT_LINE) as u8;

            let cand = Candidate {
                bus: BusKind::Structured,
                io_base,
                irq,
                product: device,
                slot: Some((bus, dev, 0)),
                conflict: false,
            };
            if out.push(cand).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_table_families() {
        assert_eq!(generation_for_device(0x5900), Some(Generation::G2BusMaster));
        assert_eq!(generation_for_device(0x9001), Some(Generation::G2BusMaster));
        // The borderline 0x905x spins classify with the bus-master series.
        assert_eq!(generation_for_device(0x9055), Some(Generation::G2BusMaster));
        assert_eq!(generation_for_device(0x9200), Some(Generation::G3Enhanced));
        // Hot-pluggable variants are enhanced-class.
        assert_eq!(generation_for_device(0x5157), Some(Generation::G3Enhanced));
        assert_eq!(generation_for_device(0x9302), Some(Generation::G4Advanced));
        assert_eq!(generation_for_device(0xBEEF), None);
    }
}
