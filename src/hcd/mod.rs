// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host controller core. Owns the bus of one controller and sits between class drivers, which
//! submit and cancel urbs, and the chip specific `HcDriver`, which moves them over the wire.

mod config_change;
mod devices;
mod flags;
mod roothub;
mod transfer;

pub use self::config_change::BandwidthSession;
pub use self::flags::{AtomicHcdFlags, AtomicRunState, HcdFlags, RunState};
pub use self::roothub::ROOT_HUB_STATUS_ENDPOINT;

use std::sync::{Arc, MutexGuard, Weak};

use sync::{Condvar, Mutex};

use crate::bus::Bus;
use crate::config::HcdConfig;
use crate::device::{Device, DeviceId};
use crate::driver::HcDriver;
use crate::error::{Error, Result};
use crate::giveback::GivebackQueue;
use crate::timer::{PollTimer, TimerHandler};
use crate::urb::{TransferStatus, Urb};

/// Mutexes shared by a primary controller and its companion.
#[derive(Default)]
pub(crate) struct ConfigLocks {
    /// Serializes enumeration of devices still at address 0.
    address0: Mutex<()>,
    /// Serializes periodic bandwidth changes.
    bandwidth: Mutex<()>,
}

/// Waiters in `kill` sleep here until an urb's use count drops to zero.
#[derive(Default)]
struct KillWaitQueue {
    lock: Mutex<()>,
    cvar: Condvar,
}

impl KillWaitQueue {
    fn wake_all(&self) {
        let _guard = self.lock.lock();
        self.cvar.notify_all();
    }
}

pub struct HostController {
    config: HcdConfig,
    driver: Arc<dyn HcDriver>,
    flags: AtomicHcdFlags,
    state: AtomicRunState,
    bus: Mutex<Bus>,
    locks: Arc<ConfigLocks>,
    primary: Weak<HostController>,
    shared: Mutex<Weak<HostController>>,
    giveback: GivebackQueue,
    rh_timer: PollTimer,
    status_urb: Mutex<Option<Arc<Urb>>>,
    kill_queue: Arc<KillWaitQueue>,
}

impl HostController {
    /// Create a primary controller in the `Halted` state.
    pub fn new(config: HcdConfig, driver: Arc<dyn HcDriver>) -> Result<Arc<HostController>> {
        HostController::create(config, driver, Arc::new(ConfigLocks::default()), Weak::new())
    }

    /// Create the companion of `primary`. The pair shares the address-zero and bandwidth
    /// mutexes, and the companion dies with the primary.
    pub fn new_shared(
        primary: &Arc<HostController>,
        config: HcdConfig,
        driver: Arc<dyn HcDriver>,
    ) -> Result<Arc<HostController>> {
        if !primary.is_primary() {
            error!("{}: companion of a companion", config.product_desc);
            return Err(Error::BadState);
        }
        let hcd = HostController::create(
            config,
            driver,
            primary.locks.clone(),
            Arc::downgrade(primary),
        )?;
        *primary.shared.lock() = Arc::downgrade(&hcd);
        let primary_bus = {
            let mut bus = primary.bus.lock();
            bus.set_companion(Some(hcd.busnum()));
            bus.busnum()
        };
        hcd.bus.lock().set_companion(Some(primary_bus));
        Ok(hcd)
    }

    fn create(
        config: HcdConfig,
        driver: Arc<dyn HcDriver>,
        locks: Arc<ConfigLocks>,
        primary: Weak<HostController>,
    ) -> Result<Arc<HostController>> {
        let giveback = GivebackQueue::start(&format!("{} giveback", config.product_desc))
            .map_err(|e| {
                error!("{}: cannot start giveback worker: {}", config.product_desc, e);
                Error::SpawnThread
            })?;
        let rh_timer = PollTimer::start(&format!("{} rh poll", config.product_desc)).map_err(
            |e| {
                error!("{}: cannot start root hub timer: {}", config.product_desc, e);
                Error::SpawnThread
            },
        )?;
        let mut flags = HcdFlags::empty();
        if config.interfaces_authorized {
            flags |= HcdFlags::INTF_AUTHORIZED;
        }
        let hcd = Arc::new(HostController {
            bus: Mutex::new(Bus::new(config.speed)),
            config,
            driver,
            flags: AtomicHcdFlags::new(flags),
            state: AtomicRunState::new(RunState::Halted),
            locks,
            primary,
            shared: Mutex::new(Weak::new()),
            giveback,
            rh_timer,
            status_urb: Mutex::new(None),
            kill_queue: Arc::new(KillWaitQueue::default()),
        });
        let handler: Arc<dyn TimerHandler> = hcd.clone();
        hcd.rh_timer.set_handler(Arc::downgrade(&handler));
        debug!("{}: created bus {}", hcd.config.product_desc, hcd.busnum());
        Ok(hcd)
    }

    pub fn config(&self) -> &HcdConfig {
        &self.config
    }

    pub fn driver(&self) -> &Arc<dyn HcDriver> {
        &self.driver
    }

    pub fn flags(&self) -> HcdFlags {
        self.flags.load()
    }

    pub fn run_state(&self) -> RunState {
        self.state.load()
    }

    pub fn is_dead(&self) -> bool {
        self.flags.contains(HcdFlags::DEAD)
    }

    pub fn hw_accessible(&self) -> bool {
        self.flags.contains(HcdFlags::HW_ACCESSIBLE)
    }

    /// Default authorization of interfaces of newly connected devices.
    pub fn interfaces_authorized(&self) -> bool {
        self.flags.contains(HcdFlags::INTF_AUTHORIZED)
    }

    pub fn set_interfaces_authorized(&self, authorized: bool) {
        if authorized {
            self.flags.set(HcdFlags::INTF_AUTHORIZED);
        } else {
            self.flags.clear(HcdFlags::INTF_AUTHORIZED);
        }
    }

    pub fn is_primary(&self) -> bool {
        self.primary.upgrade().is_none()
    }

    /// The primary of a companion controller.
    pub fn primary(&self) -> Option<Arc<HostController>> {
        self.primary.upgrade()
    }

    /// The companion of a primary controller.
    pub fn shared(&self) -> Option<Arc<HostController>> {
        self.shared.lock().upgrade()
    }

    pub fn busnum(&self) -> u32 {
        self.bus.lock().busnum()
    }

    pub fn root_hub(&self) -> Option<DeviceId> {
        self.bus.lock().root_hub()
    }

    /// Lock the bus. No other `HostController` method may be called while the guard is held.
    pub fn bus(&self) -> MutexGuard<'_, Bus> {
        self.bus.lock()
    }

    /// Run `f` on a device, if the handle is still valid.
    pub fn with_device<R, F: FnOnce(&mut Device) -> R>(&self, id: DeviceId, f: F) -> Option<R> {
        self.bus.lock().device_mut(id).map(f)
    }

    /// Wait for every queued callback to return. Returns at once when called from a callback.
    pub fn flush_givebacks(&self) {
        self.giveback.flush();
    }

    /// Start the controller: backend first, then the root hub and its polling.
    pub fn start(&self) -> Result<()> {
        if self.is_dead() {
            return Err(Error::BadState);
        }
        if self.run_state() != RunState::Halted {
            return Err(Error::BadState);
        }
        self.driver.start().map_err(err_msg!(Error::Backend))?;
        self.flags.set(HcdFlags::HW_ACCESSIBLE);
        if let Err(e) = self.register_root_hub() {
            self.flags.clear(HcdFlags::HW_ACCESSIBLE);
            self.driver.stop();
            return Err(e);
        }
        self.state.store(RunState::Running);
        self.flags.set(HcdFlags::RH_RUNNING);
        if self.config.poll_root_hub {
            self.flags.set(HcdFlags::POLL_RH);
            self.rh_timer.arm(self.config.poll_interval);
        }
        debug!("{}: running", self.config.product_desc);
        Ok(())
    }

    /// Stop the controller from any state. Root hub urbs are given back as cancelled.
    pub fn halt(&self) {
        self.flags
            .clear(HcdFlags::RH_RUNNING | HcdFlags::POLL_RH | HcdFlags::POLL_PENDING);
        self.rh_timer.cancel();
        self.state.store(RunState::Halted);
        self.driver.stop();
        self.flags.clear(HcdFlags::HW_ACCESSIBLE);
        self.flush_root_hub(TransferStatus::Cancelled);
        debug!("{}: halted", self.config.product_desc);
    }

    /// Running -> Quiescing -> Suspended. A backend failure goes back to Running.
    pub fn suspend(&self) -> Result<()> {
        self.state
            .transition(RunState::Running, RunState::Quiescing)
            .map_err(|state| {
                debug!("{}: cannot suspend from {:?}", self.config.product_desc, state);
                Error::BadState
            })?;
        if let Err(e) = self.driver.bus_suspend() {
            error!("{}: bus suspend failed: {}", self.config.product_desc, e);
            self.state.store(RunState::Running);
            return Err(Error::Backend(e));
        }
        self.rh_timer.cancel();
        self.flags.clear(HcdFlags::HW_ACCESSIBLE);
        if let Some(root) = self.root_hub() {
            self.with_device(root, |d| d.suspend());
        }
        self.state.store(RunState::Suspended);
        debug!("{}: suspended", self.config.product_desc);
        Ok(())
    }

    /// Suspended -> Resuming -> Running. A backend failure goes back to Suspended.
    pub fn resume(&self) -> Result<()> {
        if self.is_dead() {
            return Err(Error::BadState);
        }
        self.state
            .transition(RunState::Suspended, RunState::Resuming)
            .map_err(|state| {
                debug!("{}: cannot resume from {:?}", self.config.product_desc, state);
                Error::BadState
            })?;
        self.flags.set(HcdFlags::HW_ACCESSIBLE);
        if let Err(e) = self.driver.bus_resume() {
            error!("{}: bus resume failed: {}", self.config.product_desc, e);
            self.flags.clear(HcdFlags::HW_ACCESSIBLE);
            self.state.store(RunState::Suspended);
            return Err(Error::Backend(e));
        }
        if let Some(root) = self.root_hub() {
            self.with_device(root, |d| d.resume());
        }
        self.state.store(RunState::Running);
        self.flags.clear(HcdFlags::WAKEUP_PENDING);
        if self.flags.contains(HcdFlags::POLL_RH) {
            // Pick up whatever changed while asleep.
            self.rh_timer.arm(std::time::Duration::from_millis(0));
        }
        debug!("{}: resumed", self.config.product_desc);
        Ok(())
    }

    /// Record a remote wakeup signalled by the hardware. Returns true if the bus is suspended and
    /// the caller should schedule `resume`.
    pub fn remote_wakeup(&self) -> bool {
        if !self.flags.contains(HcdFlags::RH_RUNNING) {
            return false;
        }
        if self.flags.test_and_set(HcdFlags::WAKEUP_PENDING) {
            return false;
        }
        debug!("{}: remote wakeup", self.config.product_desc);
        self.run_state().is_suspended()
    }

    pub fn wakeup_handled(&self) {
        self.flags.clear(HcdFlags::WAKEUP_PENDING);
    }

    /// The hardware is gone. Every queued urb is given back with `ControllerDead` and nothing new
    /// is accepted until `reinit`. A primary takes its companion down too.
    pub fn died(&self) {
        if self.flags.test_and_set(HcdFlags::DEAD) {
            return;
        }
        error!("{}: host controller died, cleaning up", self.config.product_desc);
        self.flags.clear(
            HcdFlags::HW_ACCESSIBLE
                | HcdFlags::RH_RUNNING
                | HcdFlags::POLL_RH
                | HcdFlags::POLL_PENDING,
        );
        self.rh_timer.cancel();
        let endpoints = self.bus.lock().endpoints();
        for ep in endpoints {
            self.flush_endpoint(&ep, TransferStatus::ControllerDead);
        }
        if let Some(shared) = self.shared() {
            shared.died();
        }
    }

    /// Clear the dead flag of a halted controller so it can be started again.
    pub fn reinit(&self) -> Result<()> {
        if self.run_state() != RunState::Halted {
            return Err(Error::BadState);
        }
        if !self.flags.test_and_clear(HcdFlags::DEAD) {
            return Err(Error::BadState);
        }
        debug!("{}: re-initialized", self.config.product_desc);
        Ok(())
    }

    /// Current frame number. Fails while the hardware is not accessible.
    pub fn get_frame_number(&self) -> Result<u32> {
        if !self.hw_accessible() {
            return Err(Error::BadState);
        }
        Ok(self.driver.get_frame_number())
    }
}

impl TimerHandler for HostController {
    fn on_timer(&self) {
        self.poll_rh_status();
    }
}

impl Drop for HostController {
    fn drop(&mut self) {
        self.rh_timer.shutdown();
        self.giveback.stop();
    }
}
