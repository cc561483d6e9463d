// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host side usb core: urb submission and completion, host controller state, device tree,
//! address allocation, periodic bandwidth and root hub polling.

#[macro_use]
extern crate log;

#[macro_use]
pub mod error;

pub mod address;
pub mod bandwidth;
pub mod bus;
pub mod config;
pub mod device;
pub mod driver;
pub mod endpoint;
pub mod giveback;
pub mod hcd;
pub mod timer;
pub mod types;
pub mod urb;

#[cfg(test)]
mod testing;

pub use crate::address::AddressAllocator;
pub use crate::bandwidth::BandwidthLedger;
pub use crate::bus::Bus;
pub use crate::config::HcdConfig;
pub use crate::device::{Device, DeviceId};
pub use crate::driver::HcDriver;
pub use crate::endpoint::Endpoint;
pub use crate::error::{
    AddressError, BackendError, BandwidthError, CancelError, Error, Result, SubmitError,
};
pub use crate::hcd::{BandwidthSession, HcdFlags, HostController, RunState};
pub use crate::urb::{TransferBuffer, TransferStatus, Urb, UrbFlags};
