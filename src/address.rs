// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::error::AddressError;

/// Number of address slots on a bus. Address 0 is the default address and is never handed out.
pub const MAX_DEVICE_ADDRESSES: usize = 128;
pub const MAX_DEVICE_ADDRESS: u8 = 127;

/// Round robin device address allocator backed by a 128 bit map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressAllocator {
    map: [u64; 2],
    next: u8,
}

impl Default for AddressAllocator {
    fn default() -> Self {
        AddressAllocator::new()
    }
}

impl AddressAllocator {
    pub fn new() -> AddressAllocator {
        AddressAllocator { map: [0; 2], next: 1 }
    }

    /// Address the next scan starts from.
    pub fn cursor(&self) -> u8 {
        self.next
    }

    /// Move the round robin cursor. Values outside [1, 127] restart at 1.
    pub fn set_cursor(&mut self, addr: u8) {
        self.next = if addr == 0 || addr > MAX_DEVICE_ADDRESS {
            1
        } else {
            addr
        };
    }

    pub fn is_allocated(&self, addr: u8) -> bool {
        if addr as usize >= MAX_DEVICE_ADDRESSES {
            return false;
        }
        self.map[addr as usize / 64] & (1 << (addr % 64)) != 0
    }

    /// Number of addresses in use.
    pub fn allocated_count(&self) -> u32 {
        self.map[0].count_ones() + self.map[1].count_ones()
    }

    fn find_free(&self, from: u8, to: u8) -> Option<u8> {
        (from..=to).find(|&addr| !self.is_allocated(addr))
    }

    /// Hand out the first free address at or after the cursor, wrapping past 127 back to 1.
    pub fn allocate(&mut self) -> Result<u8, AddressError> {
        let addr = self
            .find_free(self.next, MAX_DEVICE_ADDRESS)
            .or_else(|| self.find_free(1, self.next - 1))
            .ok_or(AddressError::AddressSpaceExhausted)?;
        self.map[addr as usize / 64] |= 1 << (addr % 64);
        self.next = if addr >= MAX_DEVICE_ADDRESS { 1 } else { addr + 1 };
        Ok(addr)
    }

    /// Claim a specific address, used for the root hub. Returns false if it was already taken.
    pub fn claim(&mut self, addr: u8) -> bool {
        if addr == 0 || addr > MAX_DEVICE_ADDRESS || self.is_allocated(addr) {
            return false;
        }
        self.map[addr as usize / 64] |= 1 << (addr % 64);
        true
    }

    /// Return an address to the pool. Freeing a free address does nothing.
    pub fn free(&mut self, addr: u8) {
        if addr == 0 || addr > MAX_DEVICE_ADDRESS {
            warn!("ignoring free of invalid device address {}", addr);
            return;
        }
        if !self.is_allocated(addr) {
            debug!("device address {} already free", addr);
            return;
        }
        self.map[addr as usize / 64] &= !(1 << (addr % 64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn first_address_is_one() {
        let mut a = AddressAllocator::new();
        assert_eq!(a.allocate(), Ok(1));
        assert!(a.is_allocated(1));
        assert!(!a.is_allocated(0));
    }

    #[test]
    fn rewound_cursor_reuses_freed_address() {
        let mut a = AddressAllocator::new();
        assert!(a.claim(1));
        assert!(a.claim(2));
        assert_eq!(a.allocate(), Ok(3));
        a.free(2);
        a.set_cursor(1);
        assert_eq!(a.allocate(), Ok(2));
        assert_eq!(a.cursor(), 3);
    }

    #[test]
    fn allocate_after_held_addresses() {
        let mut a = AddressAllocator::new();
        assert!(a.claim(1));
        assert!(a.claim(2));
        a.set_cursor(1);
        assert_eq!(a.allocate(), Ok(3));
        a.free(2);
        // The cursor keeps moving forward; address 2 comes back once it wraps.
        for expected in 4..=MAX_DEVICE_ADDRESS {
            assert_eq!(a.allocate(), Ok(expected));
        }
        assert_eq!(a.allocate(), Ok(2));
        assert_eq!(
            a.allocate(),
            Err(AddressError::AddressSpaceExhausted)
        );
    }

    #[test]
    fn exhausted_after_127() {
        let mut a = AddressAllocator::new();
        for _ in 0..127 {
            a.allocate().unwrap();
        }
        assert_eq!(a.allocated_count(), 127);
        assert_eq!(a.allocate(), Err(AddressError::AddressSpaceExhausted));
        a.free(64);
        assert_eq!(a.allocate(), Ok(64));
    }

    #[test]
    fn free_is_idempotent() {
        let mut a = AddressAllocator::new();
        let addr = a.allocate().unwrap();
        a.free(addr);
        let snapshot = a.clone();
        a.free(addr);
        a.free(0);
        a.free(200);
        assert_eq!(a, snapshot);
    }

    #[test]
    fn claim_rejects_taken_and_reserved() {
        let mut a = AddressAllocator::new();
        assert!(!a.claim(0));
        assert!(a.claim(1));
        assert!(!a.claim(1));
        assert!(!a.claim(128));
    }

    proptest! {
        #[test]
        fn addresses_unique_and_in_range(ops in prop::collection::vec(any::<(bool, u8)>(), 0..400)) {
            let mut a = AddressAllocator::new();
            let mut held = HashSet::new();
            for (alloc, pick) in ops {
                if alloc || held.is_empty() {
                    match a.allocate() {
                        Ok(addr) => {
                            prop_assert!(addr >= 1 && addr <= MAX_DEVICE_ADDRESS);
                            prop_assert!(held.insert(addr));
                        }
                        Err(AddressError::AddressSpaceExhausted) => {
                            prop_assert_eq!(held.len(), 127);
                        }
                        Err(e) => prop_assert!(false, "unexpected {:?}", e),
                    }
                } else {
                    let victim = *held.iter().nth(pick as usize % held.len()).unwrap();
                    held.remove(&victim);
                    a.free(victim);
                }
                prop_assert_eq!(a.allocated_count() as usize, held.len());
            }
        }
    }
}
