// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bus-master descriptor records and ring bookkeeping.
//!
//! The card walks singly-linked lists of 16-byte descriptors out of shared
//! memory: a download list for transmit and an upload list for receive. In
//! this module the lists live as indexed arrays inside a reserved region of
//! the DMA pool; descriptor indices are the working currency, and physical
//! list addresses are materialized only at the moment a hardware-visible
//! field is written. The module itself never touches the card -- like the
//! buffer pool underneath it, it just moves memory around very carefully.

use dmapool::{DmaMem, RingRegion};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// One hardware descriptor.
///
/// `status` is written by the card on completion; `frag_len` carries the
/// LAST_FRAG marker because every frame is carried in a single fragment
/// here.
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Desc {
    pub next: U32,
    pub status: U32,
    pub frag_addr: U32,
    pub frag_len: U32,
}

pub const DESC_SIZE: usize = 16;
static_assertions::const_assert_eq!(core::mem::size_of::<Desc>(), DESC_SIZE);

/// Marks the final fragment of a frame in `frag_len`.
pub const LAST_FRAG: u32 = 1 << 31;

/// Transmit `status`: set by the card when the frame has been sent.
pub const TX_DONE: u32 = 1 << 31;

/// Receive `status`: set by the card when a frame has landed.
pub const RX_DONE: u32 = 1 << 15;
/// Receive `status`: the landed frame is bad.
pub const RX_ERROR: u32 = 1 << 14;
/// Receive `status`: length of the landed frame.
pub const RX_LEN_MASK: u32 = 0x1FFF;

/// An indexed view of `count` descriptors inside a ring region.
pub struct DescRing<'m> {
    mem: DmaMem<'m>,
    phys: u32,
    bus: u32,
    count: usize,
}

impl<'m> DescRing<'m> {
    /// Lays a ring of `count` zeroed descriptors over `region`.
    ///
    /// # Panics
    ///
    /// If the region is too small or misaligned; both indicate a broken
    /// caller, not a runtime condition.
    pub fn new(mem: DmaMem<'m>, region: &RingRegion, count: usize) -> Self {
        assert!(region.len as usize >= count * DESC_SIZE);
        assert_eq!(region.phys % 16, 0);
        let ring = Self {
            mem,
            phys: region.phys,
            bus: region.bus,
            count,
        };
        for i in 0..count {
            ring.write(i, &Desc::default());
        }
        ring
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Physical address of descriptor `i`.
    pub fn phys_of(&self, i: usize) -> u32 {
        assert!(i < self.count);
        self.phys + (i * DESC_SIZE) as u32
    }

    /// Address of descriptor `i` as the device must see it.
    pub fn bus_of(&self, i: usize) -> u32 {
        assert!(i < self.count);
        self.bus + (i * DESC_SIZE) as u32
    }

    /// Maps a device-visible descriptor address back to its index.
    pub fn index_of(&self, bus_addr: u32) -> Option<usize> {
        let off = bus_addr.checked_sub(self.bus)? as usize;
        if off % DESC_SIZE != 0 {
            return None;
        }
        let i = off / DESC_SIZE;
        (i < self.count).then_some(i)
    }

    pub fn read(&self, i: usize) -> Desc {
        let p = self.phys_of(i);
        Desc {
            next: U32::new(self.mem.read_u32(p)),
            status: U32::new(self.mem.read_u32(p + 4)),
            frag_addr: U32::new(self.mem.read_u32(p + 8)),
            frag_len: U32::new(self.mem.read_u32(p + 12)),
        }
    }

    pub fn write(&self, i: usize, d: &Desc) {
        self.mem.write(self.phys_of(i), d.as_bytes());
    }

    pub fn read_status(&self, i: usize) -> u32 {
        self.mem.read_u32(self.phys_of(i) + 4)
    }

    pub fn write_status(&self, i: usize, v: u32) {
        self.mem.write_u32(self.phys_of(i) + 4, v);
    }

    /// Writes the link field of descriptor `i`. This is the publication
    /// store: every other field of the descriptor being linked must already
    /// be in memory, which the caller guarantees by fencing first.
    pub fn write_next(&self, i: usize, bus_addr: u32) {
        self.mem.write_u32(self.phys_of(i), bus_addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmapool::{CachePolicy, DirectHost, DmaPolicy, DmaPool, Reach};

    #[test]
    fn descriptors_round_trip_through_memory() {
        let mut backing = vec![0u8; 8192];
        let mem = DmaMem::new(backing.as_mut_slice(), 0x10000);
        let mut pool = DmaPool::new(
            mem,
            DirectHost,
            DmaPolicy::Direct,
            CachePolicy::None,
            Reach::Bits32,
            1024,
        );
        let region = pool.alloc_ring(16 * DESC_SIZE as u32).unwrap();
        let ring = DescRing::new(pool.mem(), &region, 16);

        assert_eq!(ring.count(), 16);
        assert_eq!(ring.phys_of(0) % 16, 0);
        assert_eq!(ring.bus_of(3), ring.bus_of(0) + 48);
        assert_eq!(ring.index_of(ring.bus_of(5)), Some(5));
        assert_eq!(ring.index_of(ring.bus_of(0) + 7), None);
        assert_eq!(ring.index_of(ring.bus_of(0).wrapping_sub(16)), None);

        let d = Desc {
            next: U32::new(ring.bus_of(1)),
            status: U32::new(0x1234),
            frag_addr: U32::new(0xDEAD_BEE0),
            frag_len: U32::new(600 | LAST_FRAG),
        };
        ring.write(0, &d);
        let back = ring.read(0);
        assert_eq!(back.next.get(), ring.bus_of(1));
        assert_eq!(back.status.get(), 0x1234);
        assert_eq!(back.frag_addr.get(), 0xDEAD_BEE0);
        assert_eq!(back.frag_len.get(), 600 | LAST_FRAG);

        ring.write_status(0, RX_DONE | 60);
        assert_eq!(ring.read_status(0), RX_DONE | 60);
        ring.write_next(0, ring.bus_of(2));
        assert_eq!(ring.read(0).next.get(), ring.bus_of(2));
    }

    #[test]
    fn descriptor_layout_is_hardware_shaped() {
        // The card reads these fields at fixed byte offsets.
        let d = Desc {
            next: U32::new(0x0102_0304),
            status: U32::new(0x0506_0708),
            frag_addr: U32::new(0x090A_0B0C),
            frag_len: U32::new(0x0D0E_0F10),
        };
        let bytes = d.as_bytes();
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..8], &[0x08, 0x07, 0x06, 0x05]);
        assert_eq!(&bytes[8..12], &[0x0C, 0x0B, 0x0A, 0x09]);
        assert_eq!(&bytes[12..16], &[0x10, 0x0F, 0x0E, 0x0D]);
    }
}
