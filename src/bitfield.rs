// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::BitfieldError;

/// Fixed-length bit vector, one bit per piece. Bit 0 is the high bit of the first byte,
/// matching the peer-wire bitfield layout.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bitfield {
    bytes: Vec<u8>,
    len: u32,
}

fn byte_len(len: u32) -> usize {
    (len as usize).div_ceil(8)
}

impl Bitfield {
    pub fn new(len: u32) -> Self {
        Self {
            bytes: vec![0; byte_len(len)],
            len,
        }
    }

    /// Rebuilds a bitfield from its wire/persisted form. Spare bits past `len` are cleared.
    pub fn from_bytes(bytes: &[u8], len: u32) -> Result<Self, BitfieldError> {
        let expected = byte_len(len);
        if bytes.len() != expected {
            return Err(BitfieldError::InvalidLength {
                expected,
                actual: bytes.len(),
            });
        }
        let mut bf = Self {
            bytes: bytes.to_vec(),
            len,
        };
        bf.clear_spare_bits();
        Ok(bf)
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn set(&mut self, index: u32) {
        if index < self.len {
            self.bytes[(index / 8) as usize] |= 1 << (7 - (index % 8));
        }
    }

    pub fn clear(&mut self, index: u32) {
        if index < self.len {
            self.bytes[(index / 8) as usize] &= !(1 << (7 - (index % 8)));
        }
    }

    /// Out-of-range indexes read as unset.
    pub fn test(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        self.bytes[(index / 8) as usize] & (1 << (7 - (index % 8))) != 0
    }

    pub fn set_all(&mut self) {
        self.bytes.fill(0xFF);
        self.clear_spare_bits();
    }

    pub fn clear_all(&mut self) {
        self.bytes.fill(0);
    }

    pub fn count(&self) -> u32 {
        self.bytes.iter().map(|b| b.count_ones()).sum()
    }

    /// A zero-length bitfield is trivially complete.
    pub fn all(&self) -> bool {
        self.count() == self.len
    }

    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(move |&i| self.test(i))
    }

    fn clear_spare_bits(&mut self) {
        let spare = (self.bytes.len() * 8) as u32 - self.len;
        if spare > 0 {
            if let Some(last) = self.bytes.last_mut() {
                *last &= 0xFFu8 << spare;
            }
        }
    }
}
