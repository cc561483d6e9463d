// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::time::Duration;

use crate::types::Speed;

/// Root hub status is polled every quarter second unless the backend reports changes by
/// interrupt.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Static parameters of one host controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HcdConfig {
    /// Human readable controller name, used in log messages and thread names.
    pub product_desc: String,
    /// Speed of the root hub and of the bus.
    pub speed: Speed,
    pub poll_interval: Duration,
    /// Poll the root hub for port changes on a timer.
    pub poll_root_hub: bool,
    /// Interfaces of new devices are authorized by default.
    pub interfaces_authorized: bool,
    /// The backend can run bulk streams.
    pub can_do_streams: bool,
    pub root_hub_ports: u8,
}

impl Default for HcdConfig {
    fn default() -> Self {
        HcdConfig {
            product_desc: "usb host controller".to_string(),
            speed: Speed::High,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_root_hub: true,
            interfaces_authorized: true,
            can_do_streams: false,
            root_hub_ports: 4,
        }
    }
}

impl HcdConfig {
    /// Bytes in a hub status change bitmap: one bit for the hub, one per port.
    pub fn status_bitmap_len(&self) -> usize {
        (usize::from(self.root_hub_ports) + 1 + 7) / 8
    }
}
