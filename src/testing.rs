// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fakes shared by the unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use sync::{Condvar, Mutex};

use crate::config::HcdConfig;
use crate::device::DeviceId;
use crate::driver::HcDriver;
use crate::endpoint::Endpoint;
use crate::error::BackendError;
use crate::hcd::HostController;
use crate::types::{
    AltSetting, Configuration, DeviceState, EndpointDescriptor, EndpointType, Interface, Speed,
    UsbRequestSetup,
};
use crate::urb::{TransferStatus, Urb};

pub const BULK_IN: u8 = 0x81;
pub const BULK_OUT: u8 = 0x02;
pub const INT_IN: u8 = 0x83;

pub fn test_device_id() -> DeviceId {
    DeviceId {
        index: 0,
        generation: 0,
    }
}

#[derive(Default)]
struct FakeState {
    enqueued: Vec<Arc<Urb>>,
    dequeued: Vec<(Arc<Urb>, TransferStatus)>,
    fail_enqueue: Option<BackendError>,
    fail_dequeue: Option<BackendError>,
    fail_suspend: Option<BackendError>,
    fail_resume: Option<BackendError>,
    hub_status: Vec<u8>,
    hub_control_reply: Option<Result<Vec<u8>, BackendError>>,
    streams: Vec<(u8, u16)>,
    complete_on_dequeue: Weak<HostController>,
}

/// Backend that records what the core asks of it. Nothing completes unless a test calls
/// `HostController::complete`, or `set_complete_on_dequeue` is used.
pub struct FakeDriver {
    state: Mutex<FakeState>,
    started: AtomicBool,
}

impl FakeDriver {
    pub fn new() -> FakeDriver {
        FakeDriver {
            state: Mutex::new(FakeState::default()),
            started: AtomicBool::new(false),
        }
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn enqueued(&self) -> Vec<Arc<Urb>> {
        self.state.lock().enqueued.clone()
    }

    pub fn dequeued(&self) -> Vec<(Arc<Urb>, TransferStatus)> {
        self.state.lock().dequeued.clone()
    }

    pub fn streams(&self) -> Vec<(u8, u16)> {
        self.state.lock().streams.clone()
    }

    pub fn fail_enqueue(&self, err: Option<BackendError>) {
        self.state.lock().fail_enqueue = err;
    }

    pub fn fail_dequeue(&self, err: Option<BackendError>) {
        self.state.lock().fail_dequeue = err;
    }

    pub fn fail_suspend(&self, err: Option<BackendError>) {
        self.state.lock().fail_suspend = err;
    }

    pub fn fail_resume(&self, err: Option<BackendError>) {
        self.state.lock().fail_resume = err;
    }

    /// Complete dequeued urbs right away, the way real hardware finishes an unlink.
    pub fn set_complete_on_dequeue(&self, hcd: &Arc<HostController>) {
        self.state.lock().complete_on_dequeue = Arc::downgrade(hcd);
    }

    pub fn set_hub_status(&self, data: Vec<u8>) {
        self.state.lock().hub_status = data;
    }

    pub fn set_hub_control_reply(&self, reply: Result<Vec<u8>, BackendError>) {
        self.state.lock().hub_control_reply = Some(reply);
    }
}

impl HcDriver for FakeDriver {
    fn start(&self) -> Result<(), BackendError> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    fn enqueue(&self, urb: Arc<Urb>) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if let Some(e) = state.fail_enqueue {
            return Err(e);
        }
        state.enqueued.push(urb);
        Ok(())
    }

    fn dequeue(&self, urb: &Arc<Urb>, status: TransferStatus) -> Result<(), BackendError> {
        let hcd = {
            let mut state = self.state.lock();
            if let Some(e) = state.fail_dequeue {
                return Err(e);
            }
            state.dequeued.push((urb.clone(), status));
            state.complete_on_dequeue.upgrade()
        };
        if let Some(hcd) = hcd {
            hcd.complete(urb, status, 0);
        }
        Ok(())
    }

    fn get_frame_number(&self) -> u32 {
        0x123
    }

    fn hub_status_data(&self, buf: &mut [u8]) -> usize {
        let state = self.state.lock();
        let len = state.hub_status.len().min(buf.len());
        buf[..len].copy_from_slice(&state.hub_status[..len]);
        len
    }

    fn hub_control(&self, _setup: &UsbRequestSetup, buf: &mut [u8]) -> Result<usize, BackendError> {
        match self.state.lock().hub_control_reply.clone() {
            Some(Ok(data)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
            Some(Err(e)) => Err(e),
            None => Err(BackendError::Stall),
        }
    }

    fn bus_suspend(&self) -> Result<(), BackendError> {
        match self.state.lock().fail_suspend {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn bus_resume(&self) -> Result<(), BackendError> {
        match self.state.lock().fail_resume {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn alloc_streams(&self, endpoint: &Arc<Endpoint>, num_streams: u16) -> Result<(), BackendError> {
        self.state
            .lock()
            .streams
            .push((endpoint.address(), num_streams));
        Ok(())
    }
}

pub fn running_hcd_with(config: HcdConfig) -> (Arc<HostController>, Arc<FakeDriver>) {
    let driver = Arc::new(FakeDriver::new());
    let hcd = HostController::new(config, driver.clone()).unwrap();
    hcd.start().unwrap();
    (hcd, driver)
}

pub fn running_hcd() -> (Arc<HostController>, Arc<FakeDriver>) {
    running_hcd_with(HcdConfig::default())
}

/// Bulk in/out plus an interrupt in endpoint on interface 0.
pub fn test_configuration() -> Configuration {
    Configuration {
        value: 1,
        interfaces: vec![Interface {
            number: 0,
            alt_settings: vec![AltSetting {
                alternate_setting: 0,
                endpoints: vec![
                    EndpointDescriptor::new(BULK_IN, EndpointType::Bulk, 512, 0),
                    EndpointDescriptor::new(BULK_OUT, EndpointType::Bulk, 512, 0),
                    EndpointDescriptor::new(INT_IN, EndpointType::Interrupt, 64, 4),
                ],
            }],
        }],
    }
}

/// Enumerate a high speed device on root hub port 1 and select `test_configuration`.
pub fn configured_device(hcd: &HostController) -> DeviceId {
    let root = hcd.root_hub().unwrap();
    let dev = hcd.alloc_device(root, 1, Speed::High).unwrap();
    hcd.set_device_state(dev, DeviceState::Powered).unwrap();
    hcd.set_device_state(dev, DeviceState::Default).unwrap();
    hcd.assign_address(dev, |_| Ok(())).unwrap();
    hcd.set_configuration(dev, Some(&test_configuration()), || Ok(()))
        .unwrap();
    dev
}

type Calls = (Mutex<Vec<(TransferStatus, usize)>>, Condvar);

/// Records (status, actual length) of every callback.
#[derive(Clone)]
pub struct CallbackLog {
    inner: Arc<Calls>,
}

impl CallbackLog {
    pub fn new() -> CallbackLog {
        CallbackLog {
            inner: Arc::new((Mutex::new(Vec::new()), Condvar::new())),
        }
    }

    pub fn callback(&self) -> impl FnMut(&Arc<Urb>) + Send + 'static {
        let inner = self.inner.clone();
        move |urb: &Arc<Urb>| {
            let (calls, cvar) = &*inner;
            calls.lock().push((urb.status(), urb.actual_length()));
            cvar.notify_all();
        }
    }

    /// Wait up to five seconds for at least `count` callbacks.
    pub fn wait_for(&self, count: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        let (calls, cvar) = &*self.inner;
        let mut guard = calls.lock();
        while guard.len() < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = cvar.wait_timeout(guard, deadline - now).0;
        }
        true
    }

    pub fn calls(&self) -> Vec<(TransferStatus, usize)> {
        self.inner.0.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.inner.0.lock().len()
    }
}
