// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::endpoint::Endpoint;
use crate::types::{
    Configuration, DeviceDescriptor, DeviceState, Direction, EndpointDescriptor, Speed,
    DESCRIPTOR_TYPE_DEVICE,
};

pub const MAX_ENDPOINTS: usize = 16;

/// Handle to a device in a bus arena. Stale handles (device removed, slot reused) never resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Periodic bandwidth held for one endpoint of the active configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BandwidthClaim {
    pub interface: u8,
    pub endpoint: EndpointDescriptor,
    pub us: u32,
}

/// A usb device on a bus.
pub struct Device {
    id: DeviceId,
    address: u8,
    speed: Speed,
    state: DeviceState,
    suspended_from: Option<DeviceState>,
    parent: Option<DeviceId>,
    children: Vec<DeviceId>,
    port: u8,
    level: u8,
    root_hub: bool,
    ep0: Arc<Endpoint>,
    ep_in: [Option<Arc<Endpoint>>; MAX_ENDPOINTS],
    ep_out: [Option<Arc<Endpoint>>; MAX_ENDPOINTS],
    descriptor: Option<DeviceDescriptor>,
    raw_descriptors: Vec<Vec<u8>>,
    active_config: Option<Configuration>,
    alt_settings: BTreeMap<u8, u8>,
    claims: Vec<BandwidthClaim>,
    urb_count: u64,
}

impl Device {
    pub(crate) fn new(
        id: DeviceId,
        parent: Option<(DeviceId, u8)>,
        port: u8,
        speed: Speed,
        root_hub: bool,
    ) -> Device {
        // Full/low speed devices start with an 8 byte ep0; high speed and above use 64.
        let ep0_max_packet = match speed {
            Speed::High | Speed::Super => 64,
            _ => 8,
        };
        let (parent, level) = match parent {
            Some((parent, parent_level)) => (Some(parent), parent_level + 1),
            None => (None, 0),
        };
        Device {
            id,
            address: 0,
            speed,
            state: if root_hub {
                DeviceState::Configured
            } else {
                DeviceState::Attached
            },
            suspended_from: None,
            parent,
            children: Vec::new(),
            port,
            level,
            root_hub,
            ep0: Endpoint::new(id, EndpointDescriptor::control(ep0_max_packet), root_hub),
            ep_in: Default::default(),
            ep_out: Default::default(),
            descriptor: None,
            raw_descriptors: Vec::new(),
            active_config: None,
            alt_settings: BTreeMap::new(),
            claims: Vec::new(),
            urb_count: 0,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Bus address; 0 until SET_ADDRESS succeeds.
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn parent(&self) -> Option<DeviceId> {
        self.parent
    }

    pub fn children(&self) -> &[DeviceId] {
        &self.children
    }

    /// Port on the parent hub, 0 for the root hub.
    pub fn port(&self) -> u8 {
        self.port
    }

    /// Depth in the tree; the root hub is level 0.
    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn is_root_hub(&self) -> bool {
        self.root_hub
    }

    pub fn ep0(&self) -> &Arc<Endpoint> {
        &self.ep0
    }

    /// Look up an endpoint by its address byte (number plus direction bit).
    pub fn endpoint(&self, address: u8) -> Option<Arc<Endpoint>> {
        let number = (address & 0x0f) as usize;
        if number == 0 {
            return Some(self.ep0.clone());
        }
        match Direction::from_address(address) {
            Direction::In => self.ep_in[number].clone(),
            Direction::Out => self.ep_out[number].clone(),
        }
    }

    /// All endpoints, ep0 first.
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        let mut endpoints = vec![self.ep0.clone()];
        endpoints.extend(self.ep_in.iter().chain(self.ep_out.iter()).flatten().cloned());
        endpoints
    }

    pub fn descriptor(&self) -> Option<&DeviceDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn raw_descriptors(&self) -> &[Vec<u8>] {
        &self.raw_descriptors
    }

    pub fn active_configuration(&self) -> Option<&Configuration> {
        self.active_config.as_ref()
    }

    pub fn alt_setting(&self, interface: u8) -> Option<u8> {
        self.alt_settings.get(&interface).cloned()
    }

    /// Urbs submitted to this device so far.
    pub fn urb_count(&self) -> u64 {
        self.urb_count
    }

    /// Whether an urb for endpoint `number` may be queued in the current state.
    pub(crate) fn accepts_transfers(&self, number: u8) -> bool {
        match self.state {
            DeviceState::Default => number == 0,
            DeviceState::Address | DeviceState::Configured => true,
            _ => false,
        }
    }

    pub(crate) fn count_urb(&mut self) {
        self.urb_count += 1;
    }

    /// Move to `state`. Enumeration moves forward one step at a time
    /// (attached, powered, default, address, configured); a reset or unconfigure may move back.
    /// `NotAttached` is terminal and reachable from anywhere. A suspended device only leaves
    /// through `resume` or disconnect.
    pub(crate) fn set_state(&mut self, state: DeviceState) -> bool {
        if self.state == state {
            return true;
        }
        let allowed = match (enumeration_step(self.state), enumeration_step(state)) {
            _ if self.state == DeviceState::NotAttached => false,
            _ if state == DeviceState::NotAttached => true,
            (Some(from), Some(to)) => to == from + 1 || to < from,
            _ => false,
        };
        if !allowed {
            debug!(
                "usb device {:?}: refusing state {:?} -> {:?}",
                self.id, self.state, state
            );
            return false;
        }
        debug!(
            "usb device {:?}: state {:?} -> {:?}",
            self.id, self.state, state
        );
        self.state = state;
        if state == DeviceState::NotAttached {
            self.suspended_from = None;
            for ep in self.endpoints() {
                ep.set_enabled(false);
            }
        }
        true
    }

    pub(crate) fn suspend(&mut self) -> bool {
        if !self.state.can_suspend() {
            return false;
        }
        self.suspended_from = Some(self.state);
        self.state = DeviceState::Suspended;
        true
    }

    pub(crate) fn resume(&mut self) -> bool {
        match self.suspended_from.take() {
            Some(state) if self.state == DeviceState::Suspended => {
                self.state = state;
                true
            }
            other => {
                self.suspended_from = other;
                false
            }
        }
    }

    pub(crate) fn set_address(&mut self, address: u8) {
        self.address = address;
    }

    pub(crate) fn add_child(&mut self, child: DeviceId) {
        self.children.push(child);
    }

    pub(crate) fn remove_child(&mut self, child: DeviceId) {
        self.children.retain(|c| *c != child);
    }

    /// Cache a descriptor read from the device. Device descriptors are also decoded.
    pub fn cache_descriptor(&mut self, raw: Vec<u8>) {
        if raw.len() > 1 && raw[1] == DESCRIPTOR_TYPE_DEVICE {
            match DeviceDescriptor::from_bytes(&raw) {
                Some(desc) => self.descriptor = Some(desc),
                None => warn!("usb device {:?}: malformed device descriptor", self.id),
            }
        }
        self.raw_descriptors.push(raw);
    }

    /// Create and enable an endpoint for `desc`. ep0 is fixed and cannot be replaced.
    pub(crate) fn add_endpoint(&mut self, desc: EndpointDescriptor) -> Option<Arc<Endpoint>> {
        let number = desc.number() as usize;
        if number == 0 {
            return None;
        }
        let ep = Endpoint::new(self.id, desc, self.root_hub);
        let slot = match desc.direction() {
            Direction::In => &mut self.ep_in[number],
            Direction::Out => &mut self.ep_out[number],
        };
        *slot = Some(ep.clone());
        Some(ep)
    }

    /// Detach an endpoint. The caller flushes its queue.
    pub(crate) fn remove_endpoint(&mut self, address: u8) -> Option<Arc<Endpoint>> {
        let number = (address & 0x0f) as usize;
        if number == 0 {
            return None;
        }
        let ep = match Direction::from_address(address) {
            Direction::In => self.ep_in[number].take(),
            Direction::Out => self.ep_out[number].take(),
        };
        if let Some(ep) = &ep {
            ep.set_enabled(false);
        }
        ep
    }

    pub(crate) fn set_active_config(&mut self, config: Option<Configuration>) {
        self.alt_settings.clear();
        if let Some(config) = &config {
            for interface in &config.interfaces {
                self.alt_settings.insert(interface.number, 0);
            }
        }
        self.active_config = config;
    }

    pub(crate) fn set_alt_setting(&mut self, interface: u8, alt: u8) {
        self.alt_settings.insert(interface, alt);
    }

    pub(crate) fn claims(&self) -> &[BandwidthClaim] {
        &self.claims
    }

    pub(crate) fn take_claims(&mut self) -> Vec<BandwidthClaim> {
        std::mem::replace(&mut self.claims, Vec::new())
    }

    pub(crate) fn set_claims(&mut self, claims: Vec<BandwidthClaim>) {
        self.claims = claims;
    }
}

fn enumeration_step(state: DeviceState) -> Option<u8> {
    match state {
        DeviceState::Attached => Some(0),
        DeviceState::Powered => Some(1),
        DeviceState::Default => Some(2),
        DeviceState::Address => Some(3),
        DeviceState::Configured => Some(4),
        DeviceState::NotAttached | DeviceState::Suspended => None,
    }
}
