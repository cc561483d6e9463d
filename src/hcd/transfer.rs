// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use super::{HostController, RunState};
use crate::endpoint::Endpoint;
use crate::error::{BackendError, CancelError, SubmitError};
use crate::giveback::Priority;
use crate::urb::{TransferStatus, Urb, UrbFlags};

impl HostController {
    /// Queue `urb` on its endpoint and hand it to the backend. On `Ok` the callback will run
    /// exactly once; on `Err` it will not run for this submission.
    pub fn submit(&self, urb: &Arc<Urb>) -> Result<(), SubmitError> {
        if urb.is_rejected() {
            return Err(SubmitError::Rejected);
        }
        if self.is_dead() {
            return Err(SubmitError::ControllerDead);
        }
        urb.validate()?;
        let endpoint = urb.endpoint().clone();
        {
            let mut bus = self.bus.lock();
            let device = bus
                .device_mut(endpoint.device())
                .ok_or(SubmitError::InvalidState)?;
            if !device.accepts_transfers(endpoint.number()) {
                debug!(
                    "submit to ep {:#x} of device in state {:?}",
                    endpoint.address(),
                    device.state()
                );
                return Err(SubmitError::InvalidState);
            }
        }

        urb.get();
        if let Err(e) = self.link_urb(urb, &endpoint) {
            urb.put();
            self.kill_queue.wake_all();
            return Err(e);
        }
        if let Some(device) = self.bus.lock().device_mut(endpoint.device()) {
            device.count_urb();
        }

        if endpoint.is_root_hub() {
            return match self.rh_urb_enqueue(urb) {
                Ok(()) => Ok(()),
                Err(e) => self.unlink_refused(urb, &endpoint, e),
            };
        }
        match self.driver.enqueue(urb.clone()) {
            Ok(()) => {
                // A cancel that ran between link and enqueue could not reach the backend.
                if let Some(status) = urb.unlink_status() {
                    if urb.is_queued() {
                        self.dequeue_quietly(urb, status);
                    }
                }
                Ok(())
            }
            Err(e) => {
                error!(
                    "{}: enqueue on ep {:#x} failed: {}",
                    self.config.product_desc,
                    endpoint.address(),
                    e
                );
                self.unlink_refused(urb, &endpoint, SubmitError::Backend(e))
            }
        }
    }

    // Everything a cancel or a dying controller could race with is checked under the endpoint
    // lock, which both of them also take.
    pub(super) fn link_urb(
        &self,
        urb: &Arc<Urb>,
        endpoint: &Arc<Endpoint>,
    ) -> Result<(), SubmitError> {
        let mut queue = endpoint.lock_queue();
        if urb.is_rejected() {
            return Err(SubmitError::Rejected);
        }
        if self.is_dead() {
            return Err(SubmitError::ControllerDead);
        }
        if self.run_state() != RunState::Running || !endpoint.is_enabled() {
            return Err(SubmitError::InvalidState);
        }
        if !urb.mark_queued() {
            return Err(SubmitError::Busy);
        }
        urb.reset_for_submit();
        queue.link(urb.clone());
        Ok(())
    }

    // The urb was linked but the backend (or root hub) refused it. If a completion already won
    // the race, the submission stands and the callback will run.
    fn unlink_refused(
        &self,
        urb: &Arc<Urb>,
        endpoint: &Arc<Endpoint>,
        err: SubmitError,
    ) -> Result<(), SubmitError> {
        {
            let mut queue = endpoint.lock_queue();
            if !urb.mark_unqueued() {
                return Ok(());
            }
            queue.unlink(urb);
        }
        urb.put();
        self.kill_queue.wake_all();
        Err(err)
    }

    // For paths with no caller to report to. `NotFound` means the backend already finished it.
    fn dequeue_quietly(&self, urb: &Arc<Urb>, status: TransferStatus) {
        match self.driver.dequeue(urb, status) {
            Ok(()) | Err(BackendError::NotFound) => {}
            Err(_) if !urb.is_queued() => {}
            Err(e) => error!(
                "{}: dequeue on ep {:#x} failed: {}",
                self.config.product_desc,
                urb.endpoint().address(),
                e
            ),
        }
    }

    /// Ask for `urb` to be given back early. Sets the reject flag so that resubmission fails
    /// until `Urb::unpoison`. Cancelling an urb that is not queued does nothing.
    pub fn cancel(&self, urb: &Arc<Urb>) -> Result<(), CancelError> {
        urb.poison();
        self.unlink(urb, TransferStatus::Cancelled)
    }

    fn unlink(&self, urb: &Arc<Urb>, status: TransferStatus) -> Result<(), CancelError> {
        let endpoint = urb.endpoint().clone();
        {
            let queue = endpoint.lock_queue();
            if !urb.is_queued() || !queue.contains(urb) {
                return Ok(());
            }
            if !urb.set_unlinked(status) {
                // Someone else is already unlinking it.
                return Ok(());
            }
        }
        if endpoint.is_root_hub() {
            self.rh_urb_dequeue(urb, status);
            return Ok(());
        }
        match self.driver.dequeue(urb, status) {
            Ok(()) => Ok(()),
            Err(_) if !urb.is_queued() => Ok(()),
            // Not handed to the backend yet; submit retries the dequeue.
            Err(BackendError::NotFound) => Ok(()),
            Err(e) => {
                error!(
                    "{}: dequeue on ep {:#x} failed: {}",
                    self.config.product_desc,
                    endpoint.address(),
                    e
                );
                Err(CancelError::Backend(e))
            }
        }
    }

    /// Cancel `urb` and wait until its callback has returned. Must not be called from an urb
    /// callback.
    pub fn kill(&self, urb: &Arc<Urb>) -> Result<(), CancelError> {
        self.cancel(urb)?;
        let mut guard = self.kill_queue.lock.lock();
        while urb.use_count() > 0 {
            guard = self.kill_queue.cvar.wait(guard);
        }
        Ok(())
    }

    /// Backend entry point: the transfer of `urb` finished. Safe to call from any thread and
    /// never blocks on callbacks. A second completion of the same submission is ignored.
    pub fn complete(&self, urb: &Arc<Urb>, status: TransferStatus, actual_length: usize) {
        if !urb.mark_completing() {
            warn!(
                "{}: ignoring completion of urb on ep {:#x} that is not queued",
                self.config.product_desc,
                urb.endpoint().address()
            );
            return;
        }
        self.giveback_urb(urb, status, actual_length);
    }

    // Caller has won the queued -> completing transition.
    pub(crate) fn giveback_urb(&self, urb: &Arc<Urb>, status: TransferStatus, actual_length: usize) {
        let endpoint = urb.endpoint().clone();
        let lane = {
            let mut queue = endpoint.lock_queue();
            if !queue.unlink(urb) {
                error!(
                    "{}: completed urb was not linked on ep {:#x}",
                    self.config.product_desc,
                    endpoint.address()
                );
            }
            let preferred = if urb.flags().contains(UrbFlags::NO_INTERRUPT) {
                Priority::Low
            } else {
                Priority::High
            };
            queue.route_giveback(preferred)
        };
        if endpoint.is_root_hub() {
            let mut status_urb = self.status_urb.lock();
            if status_urb.as_ref().map_or(false, |u| Arc::ptr_eq(u, urb)) {
                *status_urb = None;
            }
        }
        let status = urb.final_status(status, actual_length);
        urb.finish(status, actual_length);

        let urb = urb.clone();
        let kill_queue = self.kill_queue.clone();
        self.giveback.queue_job(lane, move || {
            urb.enter_callback();
            urb.invoke_callback();
            urb.leave_callback();
            urb.endpoint().lock_queue().giveback_done();
            urb.put();
            kill_queue.wake_all();
        });
    }

    /// Give back every urb queued on `endpoint` with `status`, without waiting for callbacks.
    pub(crate) fn flush_endpoint(&self, endpoint: &Arc<Endpoint>, status: TransferStatus) {
        let urbs = endpoint.queued_urbs();
        if urbs.is_empty() {
            return;
        }
        debug!(
            "{}: flushing {} urbs from ep {:#x} with {:?}",
            self.config.product_desc,
            urbs.len(),
            endpoint.address(),
            status
        );
        for urb in urbs {
            urb.set_unlinked(status);
            if !endpoint.is_root_hub() {
                // The backend may complete it from here; whoever gets there first wins.
                self.dequeue_quietly(&urb, status);
            }
            if urb.mark_completing() {
                self.giveback_urb(&urb, status, 0);
            }
        }
    }
}
