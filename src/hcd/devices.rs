// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use super::HostController;
use crate::device::DeviceId;
use crate::endpoint::Endpoint;
use crate::error::{AddressError, BackendError, Error, Result};
use crate::types::{DeviceState, EndpointType, Speed};
use crate::urb::TransferStatus;

impl HostController {
    /// A device showed up on `port` of hub `parent`. It starts out `Attached` at address 0.
    pub fn alloc_device(
        &self,
        parent: DeviceId,
        port: u8,
        speed: Speed,
    ) -> std::result::Result<DeviceId, AddressError> {
        if self.is_dead() {
            return Err(AddressError::ControllerDead);
        }
        self.bus
            .lock()
            .alloc_device(parent, port, speed)
            .ok_or(AddressError::InvalidState)
    }

    /// Move a device along the chapter 9 state machine, e.g. to `Powered` or `Default` as the hub
    /// driver resets its port.
    pub fn set_device_state(&self, dev: DeviceId, state: DeviceState) -> Result<()> {
        match self.with_device(dev, |d| d.set_state(state)) {
            Some(true) => Ok(()),
            _ => Err(Error::BadState),
        }
    }

    pub fn suspend_device(&self, dev: DeviceId) -> Result<()> {
        match self.with_device(dev, |d| d.suspend()) {
            Some(true) => Ok(()),
            _ => Err(Error::BadState),
        }
    }

    pub fn resume_device(&self, dev: DeviceId) -> Result<()> {
        match self.with_device(dev, |d| d.resume()) {
            Some(true) => Ok(()),
            _ => Err(Error::BadState),
        }
    }

    pub fn cache_descriptor(&self, dev: DeviceId, raw: Vec<u8>) -> Result<()> {
        self.with_device(dev, |d| d.cache_descriptor(raw))
            .ok_or(Error::BadState)
    }

    /// Take the next free address on this bus.
    pub fn allocate_device_address(&self) -> std::result::Result<u8, AddressError> {
        if self.is_dead() {
            return Err(AddressError::ControllerDead);
        }
        self.bus.lock().addresses_mut().allocate()
    }

    pub fn free_device_address(&self, address: u8) {
        self.bus.lock().addresses_mut().free(address);
    }

    /// Give a device in the `Default` state its address. Only one device per bus pair is at
    /// address 0 at a time; `send_set_address` issues the SET_ADDRESS request for the chosen
    /// address and the allocation is undone if it fails.
    pub fn assign_address<F>(
        &self,
        dev: DeviceId,
        send_set_address: F,
    ) -> std::result::Result<u8, AddressError>
    where
        F: FnOnce(u8) -> std::result::Result<(), BackendError>,
    {
        let _address0 = self.locks.address0.lock();
        if self.is_dead() {
            return Err(AddressError::ControllerDead);
        }
        let address = {
            let mut bus = self.bus.lock();
            let device = bus.device(dev).ok_or(AddressError::InvalidState)?;
            if device.state() != DeviceState::Default || device.address() != 0 {
                return Err(AddressError::InvalidState);
            }
            bus.addresses_mut().allocate()?
        };

        if let Err(e) = send_set_address(address) {
            debug!(
                "{}: set address {} for {:?} failed: {}",
                self.config.product_desc, address, dev, e
            );
            self.bus.lock().addresses_mut().free(address);
            return Err(AddressError::Backend(e));
        }

        let mut bus = self.bus.lock();
        let assigned = match bus.device_mut(dev) {
            Some(device) if device.state() == DeviceState::Default => {
                device.set_address(address);
                device.set_state(DeviceState::Address);
                device.ep0().reset_toggles();
                true
            }
            _ => false,
        };
        if !assigned {
            // Gone or reset while the request was on the wire.
            bus.addresses_mut().free(address);
            return Err(AddressError::InvalidState);
        }
        debug!(
            "{}: device {:?} is now address {}",
            self.config.product_desc, dev, address
        );
        Ok(address)
    }

    /// Tear down `dev` and everything below it: no more transfers, queued urbs given back with
    /// `NoDevice`, bandwidth and addresses returned.
    pub fn disconnect_device(&self, dev: DeviceId) -> Result<()> {
        let mut session = self.bandwidth_session();
        let (endpoints, claims) = {
            let mut bus = self.bus.lock();
            if bus.device(dev).is_none() || bus.root_hub() == Some(dev) {
                return Err(Error::BadState);
            }
            let mut endpoints: Vec<Arc<Endpoint>> = Vec::new();
            let mut claims = Vec::new();
            for id in bus.subtree(dev) {
                if let Some(device) = bus.device_mut(id) {
                    device.set_state(DeviceState::NotAttached);
                    endpoints.extend(device.endpoints());
                    claims.extend(device.take_claims());
                }
            }
            (endpoints, claims)
        };

        for ep in &endpoints {
            self.flush_endpoint(ep, TransferStatus::NoDevice);
        }
        for claim in claims {
            session.release(claim.endpoint.ty(), claim.us);
        }
        session.commit();

        let removed = self.bus.lock().remove_subtree(dev);
        debug!(
            "{}: disconnected {} devices below {:?}",
            self.config.product_desc,
            removed.len(),
            dev
        );
        Ok(())
    }

    /// Set up `num_streams` bulk streams on `endpoint`.
    pub fn alloc_streams(&self, endpoint: &Arc<Endpoint>, num_streams: u16) -> Result<()> {
        if !self.config.can_do_streams
            || endpoint.ty() != EndpointType::Bulk
            || num_streams == 0
            || !endpoint.is_enabled()
        {
            return Err(Error::BadState);
        }
        self.driver
            .alloc_streams(endpoint, num_streams)
            .map_err(err_msg!(Error::Backend))?;
        endpoint.set_num_streams(num_streams);
        Ok(())
    }

    /// Drop back to a plain bulk endpoint. Fails while stream urbs are queued.
    pub fn free_streams(&self, endpoint: &Arc<Endpoint>) -> Result<()> {
        if endpoint.queued() > 0 {
            return Err(Error::BadState);
        }
        endpoint.set_num_streams(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HcdConfig;
    use crate::testing::{
        configured_device, running_hcd, running_hcd_with, CallbackLog, BULK_IN, BULK_OUT,
    };
    use crate::urb::{bulk_urb, TransferBuffer};

    fn default_state_device(hcd: &HostController) -> DeviceId {
        let root = hcd.root_hub().unwrap();
        let dev = hcd.alloc_device(root, 1, Speed::High).unwrap();
        hcd.set_device_state(dev, DeviceState::Powered).unwrap();
        hcd.set_device_state(dev, DeviceState::Default).unwrap();
        dev
    }

    #[test]
    fn assign_address_moves_to_address_state() {
        let (hcd, _driver) = running_hcd();
        let dev = default_state_device(&hcd);
        let mut sent = None;
        let address = hcd
            .assign_address(dev, |a| {
                sent = Some(a);
                Ok(())
            })
            .unwrap();
        assert_eq!(sent, Some(address));
        // The root hub holds address 1.
        assert_eq!(address, 2);
        hcd.with_device(dev, |d| {
            assert_eq!(d.address(), address);
            assert_eq!(d.state(), DeviceState::Address);
        })
        .unwrap();
        assert_eq!(hcd.bus().device_by_address(address).unwrap().id(), dev);

        // Already addressed.
        assert_eq!(
            hcd.assign_address(dev, |_| Ok(())),
            Err(AddressError::InvalidState)
        );
    }

    #[test]
    fn failed_set_address_frees_allocation() {
        let (hcd, _driver) = running_hcd();
        let dev = default_state_device(&hcd);
        assert_eq!(
            hcd.assign_address(dev, |_| Err(BackendError::TimedOut)),
            Err(AddressError::Backend(BackendError::TimedOut))
        );
        assert_eq!(hcd.bus().addresses().allocated_count(), 1);
        hcd.with_device(dev, |d| {
            assert_eq!(d.address(), 0);
            assert_eq!(d.state(), DeviceState::Default);
        })
        .unwrap();
    }

    #[test]
    fn device_must_be_in_default_state() {
        let (hcd, _driver) = running_hcd();
        let root = hcd.root_hub().unwrap();
        let dev = hcd.alloc_device(root, 1, Speed::Full).unwrap();
        assert_eq!(
            hcd.assign_address(dev, |_| Ok(())),
            Err(AddressError::InvalidState)
        );
    }

    #[test]
    fn address_space_runs_out() {
        let (hcd, _driver) = running_hcd();
        // Address 1 belongs to the root hub.
        let mut held = Vec::new();
        for _ in 0..126 {
            held.push(hcd.allocate_device_address().unwrap());
        }
        held.sort();
        held.dedup();
        assert_eq!(held.len(), 126);
        assert!(held.iter().all(|a| (2..=127).contains(a)));
        assert_eq!(
            hcd.allocate_device_address(),
            Err(AddressError::AddressSpaceExhausted)
        );
        hcd.free_device_address(40);
        assert_eq!(hcd.allocate_device_address(), Ok(40));
    }

    #[test]
    fn dead_controller_hands_out_nothing() {
        let (hcd, _driver) = running_hcd();
        let root = hcd.root_hub().unwrap();
        hcd.died();
        assert_eq!(
            hcd.allocate_device_address(),
            Err(AddressError::ControllerDead)
        );
        assert_eq!(
            hcd.alloc_device(root, 1, Speed::High),
            Err(AddressError::ControllerDead)
        );
    }

    #[test]
    fn disconnect_flushes_and_frees() {
        let (hcd, _driver) = running_hcd();
        let dev = configured_device(&hcd);
        let address = hcd.with_device(dev, |d| d.address()).unwrap();
        let child = hcd.alloc_device(dev, 1, Speed::Full).unwrap();
        assert!(hcd.bus().ledger().allocated() > 0);

        let log = CallbackLog::new();
        let ep = hcd.with_device(dev, |d| d.endpoint(BULK_IN)).unwrap().unwrap();
        let mut urb = bulk_urb(&ep, TransferBuffer::Flat(vec![0; 64]));
        urb.set_callback(log.callback());
        let urb = Arc::new(urb);
        hcd.submit(&urb).unwrap();

        hcd.disconnect_device(dev).unwrap();
        assert!(log.wait_for(1));
        assert_eq!(log.calls()[0], (TransferStatus::NoDevice, 0));
        assert!(!ep.is_enabled());
        assert_eq!(hcd.submit(&urb), Err(crate::error::SubmitError::InvalidState));

        let bus = hcd.bus();
        assert_eq!(bus.ledger().allocated(), 0);
        assert!(!bus.addresses().is_allocated(address));
        assert!(bus.device(dev).is_none());
        assert!(bus.device(child).is_none());
        assert_eq!(bus.device_count(), 1);
    }

    #[test]
    fn root_hub_cannot_be_disconnected() {
        let (hcd, _driver) = running_hcd();
        let root = hcd.root_hub().unwrap();
        assert_eq!(hcd.disconnect_device(root), Err(Error::BadState));
    }

    #[test]
    fn device_suspend_and_resume() {
        let (hcd, _driver) = running_hcd();
        let dev = configured_device(&hcd);
        hcd.suspend_device(dev).unwrap();
        assert_eq!(hcd.suspend_device(dev), Err(Error::BadState));
        assert_eq!(
            hcd.set_device_state(dev, DeviceState::Address),
            Err(Error::BadState)
        );
        hcd.resume_device(dev).unwrap();
        hcd.with_device(dev, |d| assert_eq!(d.state(), DeviceState::Configured))
            .unwrap();
    }

    #[test]
    fn streams_need_support_and_bulk() {
        let (hcd, _driver) = running_hcd();
        let dev = configured_device(&hcd);
        let bulk = hcd.with_device(dev, |d| d.endpoint(BULK_OUT)).unwrap().unwrap();
        assert_eq!(hcd.alloc_streams(&bulk, 4), Err(Error::BadState));

        let mut config = HcdConfig::default();
        config.can_do_streams = true;
        let (hcd, driver) = running_hcd_with(config);
        let dev = configured_device(&hcd);
        let bulk = hcd.with_device(dev, |d| d.endpoint(BULK_OUT)).unwrap().unwrap();
        let int = hcd
            .with_device(dev, |d| d.endpoint(crate::testing::INT_IN))
            .unwrap()
            .unwrap();
        assert_eq!(hcd.alloc_streams(&int, 4), Err(Error::BadState));
        hcd.alloc_streams(&bulk, 4).unwrap();
        assert_eq!(bulk.num_streams(), 4);
        assert_eq!(driver.streams(), vec![(BULK_OUT, 4)]);
        hcd.free_streams(&bulk).unwrap();
        assert_eq!(bulk.num_streams(), 0);
    }

    #[test]
    fn descriptors_are_cached() {
        let (hcd, _driver) = running_hcd();
        let dev = default_state_device(&hcd);
        hcd.cache_descriptor(
            dev,
            vec![18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01, 1, 2, 0, 1],
        )
        .unwrap();
        hcd.with_device(dev, |d| {
            let desc = d.descriptor().unwrap();
            assert_eq!(desc.vendor_id, 0x1234);
            assert_eq!(desc.product_id, 0x5678);
        })
        .unwrap();
    }
}
