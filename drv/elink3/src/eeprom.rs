// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-card configuration memory and capability resolution.
//!
//! Every generation reads its EEPROM the same way: write the read opcode and
//! word index to the window-0 command register, poll the busy bit, collect
//! the word from the data register. Sixteen words matter here; the last is a
//! checksum over the first fifteen. From the image we pull the station
//! address, the product identifier, and from the latter the generation and
//! capability set that steer the rest of bring-up.

use crate::pci;
use crate::regs::{w0, WindowedIo};
use crate::{BusKind, ElinkIo};
use drv_elink3_api::{Capabilities, Generation, MacAddress};

pub const EEPROM_WORDS: usize = 16;

/// Poll cadence for the EEPROM busy bit.
pub const POLL_INTERVAL_US: u32 = 162;
/// Poll budget; past this the card is not answering.
pub const MAX_POLLS: u32 = 1620;

/// Word index of the product identifier.
pub const WORD_PRODUCT: usize = 3;
/// Word index of the manufacturer identifier.
pub const WORD_MFG: usize = 7;
/// Manufacturer identifier of the EtherLink III family.
pub const MFG_ID: u16 = 0x6D50;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EepromError {
    /// The busy bit never cleared.
    Timeout,
    /// The image checksum did not verify.
    Checksum,
    /// The product identifier maps to no known generation.
    UnknownProduct(u16),
}

/// Reads one EEPROM word.
pub fn read_word<B: ElinkIo>(win: &WindowedIo<B>, index: u8) -> Result<u16, EepromError> {
    win.eeprom_command(w0::EEPROM_READ | u16::from(index));
    for _ in 0..MAX_POLLS {
        if !win.eeprom_busy() {
            return Ok(win.eeprom_data());
        }
        win.io().delay_us(POLL_INTERVAL_US);
    }
    Err(EepromError::Timeout)
}

/// Reads the full sixteen-word image and verifies its checksum: the XOR of
/// words 0..14 must equal word 15.
pub fn read_image<B: ElinkIo>(win: &WindowedIo<B>) -> Result<[u16; EEPROM_WORDS], EepromError> {
    let mut image = [0u16; EEPROM_WORDS];
    for (i, w) in image.iter_mut().enumerate() {
        *w = read_word(win, i as u8)?;
    }
    if checksum(&image[..EEPROM_WORDS - 1]) != image[EEPROM_WORDS - 1] {
        return Err(EepromError::Checksum);
    }
    Ok(image)
}

/// XOR checksum over an image prefix.
pub fn checksum(words: &[u16]) -> u16 {
    words.iter().fold(0, |a, w| a ^ w)
}

/// Everything bring-up needs to know about a card, resolved from its EEPROM.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Ident {
    pub mac: MacAddress,
    pub product: u16,
    pub generation: Generation,
    pub capabilities: Capabilities,
}

/// Reads and classifies one card. The station address lives in words 0..2,
/// high byte first within each word.
pub fn resolve<B: ElinkIo>(win: &WindowedIo<B>, bus: BusKind) -> Result<Ident, EepromError> {
    let image = read_image(win)?;

    let mut mac = MacAddress::default();
    for i in 0..3 {
        mac.0[2 * i] = (image[i] >> 8) as u8;
        mac.0[2 * i + 1] = image[i] as u8;
    }

    let product = image[WORD_PRODUCT];
    let generation =
        generation_for(bus, product).ok_or(EepromError::UnknownProduct(product))?;

    Ok(Ident {
        mac,
        product,
        generation,
        capabilities: generation.capabilities(),
    })
}

/// Product-identifier classification.
///
/// Legacy-bus products encode the media option in the second nibble, so the
/// lookup masks it out: the 0x9x50 family is the original PIO design, the
/// 0x5x51 family its bus-mastering successor. Structured-bus identifiers are
/// matched exactly against the table in [`pci`].
pub fn generation_for(bus: BusKind, product: u16) -> Option<Generation> {
    match bus {
        BusKind::Legacy => match product & 0xF0FF {
            0x9050 => Some(Generation::G1Basic),
            0x5051 => Some(Generation::G2BusMaster),
            _ => None,
        },
        BusKind::Structured => pci::generation_for_device(product),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_xor() {
        let words = [0x1234, 0x00FF, 0x8000];
        assert_eq!(checksum(&words), 0x1234 ^ 0x00FF ^ 0x8000);
        assert_eq!(checksum(&[]), 0);
    }

    #[test]
    fn legacy_products_classify_by_masked_id() {
        for media in 0..16u16 {
            let id = 0x9050 | (media << 8);
            assert_eq!(
                generation_for(BusKind::Legacy, id),
                Some(Generation::G1Basic),
                "{id:#06x}"
            );
            let id = 0x5051 | (media << 8);
            assert_eq!(
                generation_for(BusKind::Legacy, id),
                Some(Generation::G2BusMaster),
                "{id:#06x}"
            );
        }
        assert_eq!(generation_for(BusKind::Legacy, 0x1234), None);
    }
}
