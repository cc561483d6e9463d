// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use crate::endpoint::Endpoint;
use crate::error::BackendError;
use crate::types::UsbRequestSetup;
use crate::urb::{TransferStatus, Urb};

/// Chip specific half of a host controller. The core calls in with no core locks held; the
/// backend reports finished transfers through `HostController::complete`, from any thread.
pub trait HcDriver: Send + Sync {
    /// Bring the hardware up. Called from `HostController::start`.
    fn start(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Halt the hardware. Urbs still queued are completed by the backend or flushed by the
    /// core later.
    fn stop(&self) {}

    /// Schedule `urb`. It is already linked on its endpoint; on `Ok` the backend owns the clone
    /// until it calls `complete`.
    fn enqueue(&self, urb: Arc<Urb>) -> Result<(), BackendError>;

    /// Unlink `urb` early. The backend completes it later (normally with `status`). Returns
    /// `NotFound` if the urb already finished.
    fn dequeue(&self, urb: &Arc<Urb>, status: TransferStatus) -> Result<(), BackendError>;

    /// Current (micro)frame counter.
    fn get_frame_number(&self) -> u32;

    /// Fill `buf` with the root hub status change bitmap. Returns the number of bytes written, 0
    /// when nothing changed.
    fn hub_status_data(&self, buf: &mut [u8]) -> usize;

    /// Serve a control request addressed to the root hub. Returns the data stage length.
    fn hub_control(
        &self,
        _setup: &UsbRequestSetup,
        _buf: &mut [u8],
    ) -> Result<usize, BackendError> {
        Err(BackendError::Stall)
    }

    fn bus_suspend(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn bus_resume(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Prepare `endpoint` for `num_streams` bulk streams.
    fn alloc_streams(&self, _endpoint: &Arc<Endpoint>, _num_streams: u16) -> Result<(), BackendError> {
        Err(BackendError::Other(-1))
    }
}
