// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Periodic bandwidth accounting for one bus.
//!
//! Interrupt and isochronous transfers get guaranteed time in every frame. The ledger adds up what
//! has been promised so far and refuses reservations past the USB 2.0 limits: 90% of a frame for
//! full/low speed, 80% for high speed. Control and bulk traffic uses whatever is left and is not
//! accounted.

use crate::error::BandwidthError;
use crate::types::{Direction, EndpointType, Speed};

/// Length of a (micro)frame group, in microseconds.
pub const FRAME_TIME_US: u32 = 1000;

// Bus time constants, in nanoseconds. USB spec. rev. 2.0 5.11.3.
const BW_HOST_DELAY: u64 = 1000;
const BW_HUB_LS_SETUP: u64 = 333;
const USB2_HOST_DELAY: u64 = 5;

/// Bit stuffing worst case: 7/6 of the raw bits.
fn bit_time(bytes: u64) -> u64 {
    7 * 8 * bytes / 6
}

/// Worst case time one transaction of `bytes` takes on the wire, in nanoseconds.
pub fn bus_time_ns(speed: Speed, direction: Direction, ty: EndpointType, bytes: usize) -> u64 {
    let bytes = bytes as u64;
    let is_input = direction == Direction::In;
    let isoc = ty == EndpointType::Isochronous;
    match speed {
        Speed::Low => {
            if is_input {
                let tmp = (67667 * (31 + 10 * bit_time(bytes))) / 1000;
                64060 + 2 * BW_HUB_LS_SETUP + BW_HOST_DELAY + tmp
            } else {
                let tmp = (66700 * (31 + 10 * bit_time(bytes))) / 1000;
                64107 + 2 * BW_HUB_LS_SETUP + BW_HOST_DELAY + tmp
            }
        }
        Speed::Full | Speed::Unknown => {
            let tmp = (8354 * (31 + 10 * bit_time(bytes))) / 1000;
            if isoc {
                (if is_input { 7268 } else { 6265 }) + BW_HOST_DELAY + tmp
            } else {
                9107 + BW_HOST_DELAY + tmp
            }
        }
        Speed::High | Speed::Super => {
            let overhead = if isoc { 38 * 8 * 2083 } else { 55 * 8 * 2083 };
            (overhead + 2083 * (3 + bit_time(bytes))) / 1000 + USB2_HOST_DELAY
        }
    }
}

/// `bus_time_ns` rounded up to whole microseconds.
pub fn bus_time_us(speed: Speed, direction: Direction, ty: EndpointType, bytes: usize) -> u32 {
    ((bus_time_ns(speed, direction, ty, bytes) + 999) / 1000) as u32
}

/// Highest number of microseconds per frame that may be reserved for periodic transfers.
pub fn ceiling(speed: Speed) -> u32 {
    match speed {
        Speed::High | Speed::Super => FRAME_TIME_US * 80 / 100,
        Speed::Low | Speed::Full | Speed::Unknown => FRAME_TIME_US * 90 / 100,
    }
}

/// Per bus periodic bandwidth bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandwidthLedger {
    speed: Speed,
    allocated: u32,
    int_reqs: u32,
    isoc_reqs: u32,
}

impl BandwidthLedger {
    pub fn new(speed: Speed) -> BandwidthLedger {
        BandwidthLedger {
            speed,
            allocated: 0,
            int_reqs: 0,
            isoc_reqs: 0,
        }
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    /// Microseconds per frame currently promised to periodic transfers.
    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    pub fn ceiling(&self) -> u32 {
        ceiling(self.speed)
    }

    pub fn interrupt_requests(&self) -> u32 {
        self.int_reqs
    }

    pub fn isoc_requests(&self) -> u32 {
        self.isoc_reqs
    }

    /// Claim `us` microseconds per frame for one periodic request.
    pub fn reserve(&mut self, kind: EndpointType, us: u32) -> Result<(), BandwidthError> {
        if !kind.is_periodic() {
            return Ok(());
        }
        let total = self.allocated.saturating_add(us);
        if total > self.ceiling() {
            debug!(
                "bandwidth: {:?} request of {}us refused, {}/{} in use",
                kind,
                us,
                self.allocated,
                self.ceiling()
            );
            return Err(BandwidthError::BandwidthExceeded);
        }
        self.allocated = total;
        match kind {
            EndpointType::Interrupt => self.int_reqs += 1,
            _ => self.isoc_reqs += 1,
        }
        Ok(())
    }

    /// Give back a reservation made with `reserve`. Releasing more than is held is a caller bug;
    /// the ledger clamps at zero instead of wrapping.
    pub fn release(&mut self, kind: EndpointType, us: u32) {
        if !kind.is_periodic() {
            return;
        }
        if us > self.allocated {
            error!(
                "bandwidth: releasing {}us with only {}us allocated",
                us, self.allocated
            );
        }
        self.allocated = self.allocated.saturating_sub(us);
        let counter = match kind {
            EndpointType::Interrupt => &mut self.int_reqs,
            _ => &mut self.isoc_reqs,
        };
        if *counter == 0 {
            error!("bandwidth: {:?} request count underflow", kind);
        }
        *counter = counter.saturating_sub(1);
    }
}
