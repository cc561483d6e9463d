// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::address::AddressAllocator;
use crate::bandwidth::BandwidthLedger;
use crate::device::{Device, DeviceId};
use crate::endpoint::Endpoint;
use crate::types::{DeviceState, Speed};

static NEXT_BUSNUM: AtomicU32 = AtomicU32::new(1);

/// Hub tiers are limited to five below the root hub.
pub const MAX_HUB_LEVEL: u8 = 6;

struct Slot {
    generation: u32,
    device: Option<Device>,
}

/// One usb bus: the device tree under a root hub, its address space and periodic bandwidth.
pub struct Bus {
    busnum: u32,
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    addresses: AddressAllocator,
    ledger: BandwidthLedger,
    root_hub: Option<DeviceId>,
    companion: Option<u32>,
    resuming_ports: u32,
}

impl Bus {
    /// Create a bus with the next free bus number.
    pub fn new(speed: Speed) -> Bus {
        Bus {
            busnum: NEXT_BUSNUM.fetch_add(1, Ordering::AcqRel),
            slots: Vec::new(),
            free_slots: Vec::new(),
            addresses: AddressAllocator::new(),
            ledger: BandwidthLedger::new(speed),
            root_hub: None,
            companion: None,
            resuming_ports: 0,
        }
    }

    pub fn busnum(&self) -> u32 {
        self.busnum
    }

    pub fn speed(&self) -> Speed {
        self.ledger.speed()
    }

    pub fn addresses(&self) -> &AddressAllocator {
        &self.addresses
    }

    pub(crate) fn addresses_mut(&mut self) -> &mut AddressAllocator {
        &mut self.addresses
    }

    pub fn ledger(&self) -> &BandwidthLedger {
        &self.ledger
    }

    pub(crate) fn ledger_mut(&mut self) -> &mut BandwidthLedger {
        &mut self.ledger
    }

    pub fn root_hub(&self) -> Option<DeviceId> {
        self.root_hub
    }

    /// Bus number of the paired companion bus, if any.
    pub fn companion(&self) -> Option<u32> {
        self.companion
    }

    pub(crate) fn set_companion(&mut self, busnum: Option<u32>) {
        self.companion = busnum;
    }

    /// Bitmap of root hub ports currently signalling resume.
    pub fn resuming_ports(&self) -> u32 {
        self.resuming_ports
    }

    pub fn set_port_resuming(&mut self, port: u8, resuming: bool) {
        if port >= 32 {
            warn!("bus {}: port {} out of range", self.busnum, port);
            return;
        }
        if resuming {
            self.resuming_ports |= 1 << port;
        } else {
            self.resuming_ports &= !(1 << port);
        }
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.device.as_ref())
    }

    pub fn device_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.device.as_mut())
    }

    /// Find an addressed device by bus address.
    pub fn device_by_address(&self, address: u8) -> Option<&Device> {
        if address == 0 {
            return None;
        }
        self.devices().find(|d| d.address() == address)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.slots.iter().filter_map(|slot| slot.device.as_ref())
    }

    pub fn device_count(&self) -> usize {
        self.devices().count()
    }

    /// Every endpoint of every device on the bus.
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.devices().flat_map(|d| d.endpoints()).collect()
    }

    fn next_id(&mut self) -> DeviceId {
        match self.free_slots.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                DeviceId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    device: None,
                });
                DeviceId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        }
    }

    fn insert(&mut self, device: Device) -> DeviceId {
        let id = device.id();
        self.slots[id.index as usize].device = Some(device);
        id
    }

    /// Create the root hub. It takes address 1 and is configured from the start.
    pub(crate) fn alloc_root_hub(&mut self, speed: Speed) -> Option<DeviceId> {
        if self.root_hub.is_some() {
            return self.root_hub;
        }
        if !self.addresses.claim(1) {
            error!("bus {}: address 1 taken before root hub", self.busnum);
            return None;
        }
        let id = self.next_id();
        let mut device = Device::new(id, None, 0, speed, true);
        device.set_address(1);
        self.insert(device);
        self.root_hub = Some(id);
        Some(id)
    }

    /// Create a device in the `Attached` state below `parent`. Returns None if the parent handle
    /// is stale, detached, or the tree would be too deep.
    pub(crate) fn alloc_device(
        &mut self,
        parent: DeviceId,
        port: u8,
        speed: Speed,
    ) -> Option<DeviceId> {
        let parent_level = {
            let parent = self.device(parent)?;
            if parent.state() == DeviceState::NotAttached {
                return None;
            }
            parent.level()
        };
        if parent_level + 1 > MAX_HUB_LEVEL {
            warn!("bus {}: hub tree too deep", self.busnum);
            return None;
        }
        let id = self.next_id();
        let device = Device::new(id, Some((parent, parent_level)), port, speed, false);
        self.insert(device);
        if let Some(parent) = self.device_mut(parent) {
            parent.add_child(id);
        }
        debug!(
            "bus {}: new {:?} speed device {:?} on port {}",
            self.busnum, speed, id, port
        );
        Some(id)
    }

    /// `id` and all devices below it, children before parents.
    pub fn subtree(&self, id: DeviceId) -> Vec<DeviceId> {
        let mut order = Vec::new();
        let mut stack = vec![(id, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                order.push(current);
                continue;
            }
            if let Some(device) = self.device(current) {
                stack.push((current, true));
                for child in device.children().iter().rev() {
                    stack.push((*child, false));
                }
            }
        }
        order
    }

    /// Remove `id` and its subtree from the arena, freeing their addresses. Returns the removed
    /// devices, children first.
    pub(crate) fn remove_subtree(&mut self, id: DeviceId) -> Vec<Device> {
        let order = self.subtree(id);
        if let Some(parent) = self.device(id).and_then(|d| d.parent()) {
            if let Some(parent) = self.device_mut(parent) {
                parent.remove_child(id);
            }
        }
        let mut removed = Vec::with_capacity(order.len());
        for current in order {
            let slot = &mut self.slots[current.index as usize];
            if let Some(device) = slot.device.take() {
                if device.address() != 0 {
                    self.addresses.free(device.address());
                }
                self.free_slots.push(current.index);
                removed.push(device);
            }
        }
        if self.root_hub == Some(id) {
            self.root_hub = None;
        }
        removed
    }
}
