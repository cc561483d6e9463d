// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt::{self, Display};

/// Failure reported synchronously by a host controller backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendError {
    /// The backend does not know about this urb (already given back or never queued).
    NotFound,
    /// The backend ran out of schedule or descriptor memory.
    NoMemory,
    /// Endpoint halted.
    Stall,
    /// The operation did not finish in time.
    TimedOut,
    /// Device is gone.
    NoDevice,
    /// Controller cannot accept new work (halted or powering down).
    Shutdown,
    /// Chip specific error code.
    Other(i32),
}

impl Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::BackendError::*;

        match self {
            NotFound => write!(f, "urb is not queued on the backend"),
            NoMemory => write!(f, "backend out of schedule memory"),
            Stall => write!(f, "endpoint stalled"),
            TimedOut => write!(f, "backend operation timed out"),
            NoDevice => write!(f, "device not present"),
            Shutdown => write!(f, "controller is shutting down"),
            Other(code) => write!(f, "backend error {}", code),
        }
    }
}

impl std::error::Error for BackendError {}

/// Errors returned by `HostController::submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The urb was cancelled; submissions fail until it is unpoisoned.
    Rejected,
    /// The controller died and has not been re-initialized.
    ControllerDead,
    /// Controller, device or endpoint is not ready, or the urb is malformed.
    InvalidState,
    /// The urb is already queued.
    Busy,
    /// The backend refused to queue the urb.
    Backend(BackendError),
}

impl Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::SubmitError::*;

        match self {
            Rejected => write!(f, "urb submission rejected"),
            ControllerDead => write!(f, "host controller is dead"),
            InvalidState => write!(f, "target not in a state that accepts transfers"),
            Busy => write!(f, "urb is already queued"),
            Backend(e) => write!(f, "backend enqueue failed: {}", e),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Errors returned by `HostController::cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelError {
    /// The backend failed to unlink an urb that is still queued.
    Backend(BackendError),
}

impl Display for CancelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CancelError::Backend(e) => write!(f, "backend dequeue failed: {}", e),
        }
    }
}

impl std::error::Error for CancelError {}

/// Errors for device address management.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressError {
    /// All 127 device addresses on the bus are in use.
    AddressSpaceExhausted,
    /// Controller is dead.
    ControllerDead,
    /// The device handle is stale or in the wrong state.
    InvalidState,
    /// SET_ADDRESS failed on the wire.
    Backend(BackendError),
}

impl Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::AddressError::*;

        match self {
            AddressSpaceExhausted => write!(f, "no free device address on bus"),
            ControllerDead => write!(f, "host controller is dead"),
            InvalidState => write!(f, "device not in a state to be addressed"),
            Backend(e) => write!(f, "set address failed: {}", e),
        }
    }
}

impl std::error::Error for AddressError {}

/// Errors for periodic bandwidth accounting and configuration changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandwidthError {
    /// The reservation would push the bus past its periodic ceiling.
    BandwidthExceeded,
    /// Controller is dead.
    ControllerDead,
    /// The device handle is stale or in the wrong state.
    InvalidState,
    /// The control transfer that applies the change failed.
    Backend(BackendError),
}

impl Display for BandwidthError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::BandwidthError::*;

        match self {
            BandwidthExceeded => write!(f, "periodic bandwidth exceeded"),
            ControllerDead => write!(f, "host controller is dead"),
            InvalidState => write!(f, "device not in a state to be configured"),
            Backend(e) => write!(f, "configuration request failed: {}", e),
        }
    }
}

impl std::error::Error for BandwidthError {}

/// Crate wide error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    Submit(SubmitError),
    Cancel(CancelError),
    Address(AddressError),
    Bandwidth(BandwidthError),
    Backend(BackendError),
    /// Run-state transition not allowed from the current state.
    BadState,
    /// A worker thread could not be created.
    SpawnThread,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Error::*;

        match self {
            Submit(e) => write!(f, "{}", e),
            Cancel(e) => write!(f, "{}", e),
            Address(e) => write!(f, "{}", e),
            Bandwidth(e) => write!(f, "{}", e),
            Backend(e) => write!(f, "{}", e),
            BadState => write!(f, "host controller in wrong state for this operation"),
            SpawnThread => write!(f, "failed to spawn worker thread"),
        }
    }
}

impl std::error::Error for Error {}

impl From<SubmitError> for Error {
    fn from(e: SubmitError) -> Self {
        Error::Submit(e)
    }
}

impl From<CancelError> for Error {
    fn from(e: CancelError) -> Self {
        Error::Cancel(e)
    }
}

impl From<AddressError> for Error {
    fn from(e: AddressError) -> Self {
        Error::Address(e)
    }
}

impl From<BandwidthError> for Error {
    fn from(e: BandwidthError) -> Self {
        Error::Bandwidth(e)
    }
}

impl From<BackendError> for Error {
    fn from(e: BackendError) -> Self {
        Error::Backend(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// err_msg would be used with Result::map_err. It would print the current error, and map it if
/// needed. Using this macro because:
/// An error message is printed where the error happens, and file name, line number is included.
/// Easy to write, no need to use match just for print error.
#[macro_export]
macro_rules! err_msg {
    () => {
        |e| {
            error!("usb error: {}", e);
            e
        }
    };
    ($err:path) => {
        |e| {
            error!("usb error: {}", e);
            $err(e)
        }
    };
    ($err:path, $($arg:tt)* ) => {
        |e| {
            error!("usb error: {}. {}", e, format!($($arg)*));
            $err(e)
        }
    };
}
