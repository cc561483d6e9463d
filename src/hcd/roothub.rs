// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cmp::min;
use std::sync::Arc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};

use super::{HcdFlags, HostController};
use crate::error::{Error, Result, SubmitError};
use crate::types::{
    Direction, EndpointDescriptor, EndpointType, Speed, DESCRIPTOR_TYPE_DEVICE,
    DEVICE_DESCRIPTOR_LENGTH,
};
use crate::urb::{TransferStatus, Urb};

/// Address of the root hub status change endpoint.
pub const ROOT_HUB_STATUS_ENDPOINT: u8 = 0x81;

const ROOT_HUB_VENDOR_ID: u16 = 0x1d6b;
const HUB_CLASS: u8 = 0x09;

fn root_hub_device_descriptor(speed: Speed) -> Vec<u8> {
    let (usb_version, product_id, max_packet_size0) = match speed {
        Speed::Super => (0x0300, 0x0003, 9),
        Speed::High => (0x0200, 0x0002, 64),
        _ => (0x0110, 0x0001, 64),
    };
    let mut raw = vec![0u8; DEVICE_DESCRIPTOR_LENGTH];
    raw[0] = DEVICE_DESCRIPTOR_LENGTH as u8;
    raw[1] = DESCRIPTOR_TYPE_DEVICE;
    LittleEndian::write_u16(&mut raw[2..4], usb_version);
    raw[4] = HUB_CLASS;
    raw[7] = max_packet_size0;
    LittleEndian::write_u16(&mut raw[8..10], ROOT_HUB_VENDOR_ID);
    LittleEndian::write_u16(&mut raw[10..12], product_id);
    raw[17] = 1;
    raw
}

impl HostController {
    /// Create the root hub device, or reuse it after a restart.
    pub(super) fn register_root_hub(&self) -> Result<()> {
        let speed = self.config.speed;
        let mut bus = self.bus.lock();
        let root = bus.alloc_root_hub(speed).ok_or(Error::BadState)?;
        let device = bus.device_mut(root).ok_or(Error::BadState)?;
        if device.endpoint(ROOT_HUB_STATUS_ENDPOINT).is_none() {
            let interval = match speed {
                // 2^(12-1) microframes, 256ms.
                Speed::High | Speed::Super => 12,
                _ => 255,
            };
            device.add_endpoint(EndpointDescriptor::new(
                ROOT_HUB_STATUS_ENDPOINT,
                EndpointType::Interrupt,
                self.config.status_bitmap_len() as u16,
                interval,
            ));
            device.cache_descriptor(root_hub_device_descriptor(speed));
        }
        Ok(())
    }

    /// One tick of root hub polling. Completes the status urb when the backend reports a change,
    /// or remembers the change until one is submitted.
    pub(crate) fn poll_rh_status(&self) {
        if !self.flags.contains(HcdFlags::RH_RUNNING) {
            return;
        }
        let mut buf = vec![0u8; self.config.status_bitmap_len()];
        let length = if self.hw_accessible() {
            min(self.driver.hub_status_data(&mut buf), buf.len())
        } else {
            0
        };
        if length > 0 {
            let urb = {
                let mut status_urb = self.status_urb.lock();
                let urb = status_urb.take();
                if urb.is_some() {
                    self.flags.clear(HcdFlags::POLL_PENDING);
                } else {
                    self.flags.set(HcdFlags::POLL_PENDING);
                }
                urb
            };
            if let Some(urb) = urb {
                let copied = urb.buffer().write(&buf[..length]);
                if urb.mark_completing() {
                    self.giveback_urb(&urb, TransferStatus::Completed, copied);
                }
            }
        }
        if self.flags.contains(HcdFlags::POLL_RH) {
            self.rh_timer.arm(self.config.poll_interval);
        }
    }

    /// Root hub urbs never reach `HcDriver::enqueue`.
    pub(super) fn rh_urb_enqueue(&self, urb: &Arc<Urb>) -> std::result::Result<(), SubmitError> {
        match urb.transfer_type() {
            EndpointType::Interrupt => self.rh_queue_status(urb),
            EndpointType::Control => {
                self.rh_call_control(urb);
                Ok(())
            }
            _ => Err(SubmitError::InvalidState),
        }
    }

    fn rh_queue_status(&self, urb: &Arc<Urb>) -> std::result::Result<(), SubmitError> {
        if urb.transfer_length() < self.config.status_bitmap_len() {
            debug!(
                "{}: root hub status urb too short",
                self.config.product_desc
            );
            return Err(SubmitError::InvalidState);
        }
        {
            let mut status_urb = self.status_urb.lock();
            if status_urb.is_some() {
                return Err(SubmitError::Busy);
            }
            *status_urb = Some(urb.clone());
        }
        // A cancel between link and here found the slot empty.
        if let Some(status) = urb.unlink_status() {
            self.rh_urb_dequeue(urb, status);
            return Ok(());
        }
        if self.flags.contains(HcdFlags::POLL_PENDING) {
            self.rh_timer.arm(Duration::from_millis(0));
        }
        Ok(())
    }

    // Served synchronously; the callback still goes through the giveback queue.
    fn rh_call_control(&self, urb: &Arc<Urb>) {
        let setup = match urb.setup() {
            Some(setup) => setup,
            None => return,
        };
        let mut data = vec![0u8; urb.transfer_length()];
        if setup.direction() == Direction::Out {
            urb.buffer().read(&mut data);
        }
        let (status, length) = match self.driver.hub_control(&setup, &mut data) {
            Ok(length) => {
                let length = min(length, data.len());
                if setup.direction() == Direction::In {
                    urb.buffer().write(&data[..length]);
                }
                (TransferStatus::Completed, length)
            }
            Err(e) => {
                debug!(
                    "{}: root hub request {:#x} failed: {}",
                    self.config.product_desc, setup.request, e
                );
                (TransferStatus::from(e), 0)
            }
        };
        if urb.mark_completing() {
            self.giveback_urb(urb, status, length);
        }
    }

    pub(super) fn rh_urb_dequeue(&self, urb: &Arc<Urb>, status: TransferStatus) {
        let is_status_urb = {
            let mut status_urb = self.status_urb.lock();
            if status_urb.as_ref().map_or(false, |u| Arc::ptr_eq(u, urb)) {
                *status_urb = None;
                true
            } else {
                false
            }
        };
        if is_status_urb && urb.mark_completing() {
            self.giveback_urb(urb, status, 0);
        }
    }

    /// Give back everything queued on the root hub.
    pub(super) fn flush_root_hub(&self, status: TransferStatus) {
        let endpoints = {
            let bus = self.bus.lock();
            match bus.root_hub().and_then(|id| bus.device(id)) {
                Some(device) => device.endpoints(),
                None => return,
            }
        };
        for ep in endpoints {
            self.flush_endpoint(&ep, status);
        }
    }

    /// True while a status urb is waiting for a root hub change.
    pub fn status_urb_pending(&self) -> bool {
        self.status_urb.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HcdConfig;
    use crate::error::BackendError;
    use crate::testing::{running_hcd_with, CallbackLog};
    use crate::types::UsbRequestSetup;
    use crate::urb::{control_urb, interrupt_urb, TransferBuffer};

    fn quiet_config() -> HcdConfig {
        let mut config = HcdConfig::default();
        config.poll_interval = Duration::from_secs(60);
        config
    }

    fn status_urb(hcd: &HostController, log: &CallbackLog) -> Arc<Urb> {
        let root = hcd.root_hub().unwrap();
        let ep = hcd
            .with_device(root, |d| d.endpoint(ROOT_HUB_STATUS_ENDPOINT))
            .unwrap()
            .unwrap();
        let mut urb = interrupt_urb(&ep, TransferBuffer::Flat(vec![0; 1]));
        urb.set_callback(log.callback());
        Arc::new(urb)
    }

    #[test]
    fn root_hub_device() {
        let (hcd, _driver) = running_hcd_with(quiet_config());
        let root = hcd.root_hub().unwrap();
        hcd.with_device(root, |d| {
            assert_eq!(d.address(), 1);
            assert!(d.ep0().is_root_hub());
            let desc = d.descriptor().unwrap();
            assert_eq!(desc.vendor_id, ROOT_HUB_VENDOR_ID);
            assert_eq!(desc.product_id, 0x0002);
            assert_eq!(desc.device_class, HUB_CLASS);
        })
        .unwrap();
    }

    #[test]
    fn change_completes_status_urb() {
        let mut config = quiet_config();
        config.poll_interval = Duration::from_millis(5);
        let (hcd, driver) = running_hcd_with(config);
        let log = CallbackLog::new();
        let urb = status_urb(&hcd, &log);
        hcd.submit(&urb).unwrap();
        assert!(hcd.status_urb_pending());
        driver.set_hub_status(vec![0x02]);
        assert!(log.wait_for(1));
        assert_eq!(log.calls()[0], (TransferStatus::Completed, 1));
        assert_eq!(*urb.buffer(), TransferBuffer::Flat(vec![0x02]));
        assert!(driver.enqueued().is_empty());
    }

    #[test]
    fn pending_change_is_delivered_immediately() {
        let (hcd, driver) = running_hcd_with(quiet_config());
        driver.set_hub_status(vec![0x04]);
        hcd.poll_rh_status();
        assert!(hcd.flags().contains(HcdFlags::POLL_PENDING));

        let log = CallbackLog::new();
        let urb = status_urb(&hcd, &log);
        hcd.submit(&urb).unwrap();
        assert!(log.wait_for(1));
        assert_eq!(log.calls()[0], (TransferStatus::Completed, 1));
        assert!(!hcd.flags().contains(HcdFlags::POLL_PENDING));
    }

    #[test]
    fn quiet_poll_leaves_status_urb_queued() {
        let (hcd, _driver) = running_hcd_with(quiet_config());
        let log = CallbackLog::new();
        let urb = status_urb(&hcd, &log);
        hcd.submit(&urb).unwrap();
        hcd.poll_rh_status();
        hcd.flush_givebacks();
        assert_eq!(log.count(), 0);
        assert!(urb.is_queued());
        assert!(!hcd.flags().contains(HcdFlags::POLL_PENDING));
    }

    #[test]
    fn one_status_urb_at_a_time() {
        let (hcd, _driver) = running_hcd_with(quiet_config());
        let log = CallbackLog::new();
        let first = status_urb(&hcd, &log);
        let second = status_urb(&hcd, &log);
        hcd.submit(&first).unwrap();
        assert_eq!(hcd.submit(&second), Err(SubmitError::Busy));
        assert!(!second.is_in_flight());
        assert_eq!(second.use_count(), 0);

        hcd.cancel(&first).unwrap();
        assert!(log.wait_for(1));
        assert_eq!(log.calls()[0], (TransferStatus::Cancelled, 0));
        assert!(!hcd.status_urb_pending());
        hcd.submit(&second).unwrap();
    }

    #[test]
    fn cancel_before_status_urb_is_stored() {
        let (hcd, _driver) = running_hcd_with(quiet_config());
        let log = CallbackLog::new();
        let urb = status_urb(&hcd, &log);
        let ep = urb.endpoint().clone();
        urb.get();
        hcd.link_urb(&urb, &ep).unwrap();
        hcd.cancel(&urb).unwrap();
        assert!(!hcd.status_urb_pending());

        hcd.rh_urb_enqueue(&urb).unwrap();
        assert!(log.wait_for(1));
        assert_eq!(log.calls()[0], (TransferStatus::Cancelled, 0));
        assert!(!hcd.status_urb_pending());
        hcd.flush_givebacks();
        assert!(!urb.is_in_flight());
        assert_eq!(urb.use_count(), 0);
    }

    #[test]
    fn short_status_urb_rejected() {
        let mut config = quiet_config();
        config.root_hub_ports = 15;
        let (hcd, _driver) = running_hcd_with(config);
        let log = CallbackLog::new();
        let urb = status_urb(&hcd, &log);
        assert_eq!(hcd.submit(&urb), Err(SubmitError::InvalidState));
    }

    #[test]
    fn control_served_by_hub_control() {
        let (hcd, driver) = running_hcd_with(quiet_config());
        let root = hcd.root_hub().unwrap();
        let ep0 = hcd.with_device(root, |d| d.ep0().clone()).unwrap();
        let log = CallbackLog::new();

        driver.set_hub_control_reply(Ok(vec![0x01, 0x01, 0x00, 0x00]));
        // GET_STATUS, port 1.
        let mut urb = control_urb(&ep0, UsbRequestSetup::new(0xa3, 0x00, 0, 1, 4));
        urb.set_callback(log.callback());
        let urb = Arc::new(urb);
        hcd.submit(&urb).unwrap();
        assert!(log.wait_for(1));
        assert_eq!(log.calls()[0], (TransferStatus::Completed, 4));
        assert_eq!(
            *urb.buffer(),
            TransferBuffer::Flat(vec![0x01, 0x01, 0x00, 0x00])
        );

        driver.set_hub_control_reply(Err(BackendError::Stall));
        hcd.submit(&urb).unwrap();
        assert!(log.wait_for(2));
        assert_eq!(log.calls()[1], (TransferStatus::Stall, 0));
        assert!(driver.enqueued().is_empty());
    }

    #[test]
    fn halt_gives_back_status_urb() {
        let (hcd, _driver) = running_hcd_with(quiet_config());
        let log = CallbackLog::new();
        let urb = status_urb(&hcd, &log);
        hcd.submit(&urb).unwrap();
        hcd.halt();
        assert!(log.wait_for(1));
        assert_eq!(log.calls()[0], (TransferStatus::Cancelled, 0));
        assert!(!hcd.status_urb_pending());
    }

    #[test]
    fn no_polling_while_suspended() {
        let (hcd, driver) = running_hcd_with(quiet_config());
        hcd.suspend().unwrap();
        driver.set_hub_status(vec![0x02]);
        hcd.poll_rh_status();
        assert!(!hcd.flags().contains(HcdFlags::POLL_PENDING));
    }
}
