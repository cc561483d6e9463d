// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::{Arc, MutexGuard};

use super::HostController;
use crate::device::{BandwidthClaim, DeviceId};
use crate::endpoint::Endpoint;
use crate::error::{BackendError, BandwidthError};
use crate::types::{Configuration, DeviceState, EndpointDescriptor, EndpointType, Speed};
use crate::urb::TransferStatus;

#[derive(Debug, Clone, Copy)]
enum LedgerChange {
    Reserved(EndpointType, u32),
    Released(EndpointType, u32),
}

/// Exclusive access to the periodic bandwidth of a bus (and of its companion). Changes made
/// through the session are undone when it is dropped without `commit`.
pub struct BandwidthSession<'a> {
    hcd: &'a HostController,
    _guard: MutexGuard<'a, ()>,
    journal: Vec<LedgerChange>,
    committed: bool,
}

impl<'a> BandwidthSession<'a> {
    pub fn reserve(&mut self, kind: EndpointType, us: u32) -> Result<(), BandwidthError> {
        if self.hcd.is_dead() {
            return Err(BandwidthError::ControllerDead);
        }
        self.hcd.bus.lock().ledger_mut().reserve(kind, us)?;
        self.journal.push(LedgerChange::Reserved(kind, us));
        Ok(())
    }

    pub fn release(&mut self, kind: EndpointType, us: u32) {
        self.hcd.bus.lock().ledger_mut().release(kind, us);
        self.journal.push(LedgerChange::Released(kind, us));
    }

    /// Microseconds per frame in use, including this session's changes.
    pub fn allocated(&self) -> u32 {
        self.hcd.bus.lock().ledger().allocated()
    }

    /// Keep every change made through this session.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl<'a> Drop for BandwidthSession<'a> {
    fn drop(&mut self) {
        if self.committed || self.journal.is_empty() {
            return;
        }
        debug!(
            "{}: rolling back {} bandwidth changes",
            self.hcd.config.product_desc,
            self.journal.len()
        );
        let mut bus = self.hcd.bus.lock();
        let ledger = bus.ledger_mut();
        for change in self.journal.drain(..).rev() {
            match change {
                LedgerChange::Reserved(kind, us) => ledger.release(kind, us),
                LedgerChange::Released(kind, us) => {
                    if let Err(e) = ledger.reserve(kind, us) {
                        error!("bandwidth: cannot restore {}us: {}", us, e);
                    }
                }
            }
        }
    }
}

// Bandwidth claims for `endpoints`, made through `session`.
fn claim_endpoints(
    session: &mut BandwidthSession<'_>,
    speed: Speed,
    interface: u8,
    endpoints: &[EndpointDescriptor],
) -> Result<Vec<BandwidthClaim>, BandwidthError> {
    let mut claims = Vec::new();
    for endpoint in endpoints {
        let us = endpoint.periodic_load_us(speed);
        if us == 0 {
            continue;
        }
        session.reserve(endpoint.ty(), us)?;
        claims.push(BandwidthClaim {
            interface,
            endpoint: *endpoint,
            us,
        });
    }
    Ok(claims)
}

impl HostController {
    /// Take the bandwidth mutex. Must not be called while holding the bus lock.
    pub fn bandwidth_session(&self) -> BandwidthSession<'_> {
        BandwidthSession {
            hcd: self,
            _guard: self.locks.bandwidth.lock(),
            journal: Vec::new(),
            committed: false,
        }
    }

    /// One-shot reservation outside of a configuration change.
    pub fn reserve_bandwidth(&self, kind: EndpointType, us: u32) -> Result<(), BandwidthError> {
        let mut session = self.bandwidth_session();
        session.reserve(kind, us)?;
        session.commit();
        Ok(())
    }

    pub fn release_bandwidth(&self, kind: EndpointType, us: u32) {
        let mut session = self.bandwidth_session();
        session.release(kind, us);
        session.commit();
    }

    // Stop old endpoints from taking urbs and give back what they hold.
    fn quiesce_endpoints(&self, endpoints: &[Arc<Endpoint>]) {
        for ep in endpoints {
            ep.set_enabled(false);
        }
        for ep in endpoints {
            self.flush_endpoint(ep, TransferStatus::Cancelled);
        }
    }

    /// Select `config` (None to unconfigure). `send` issues SET_CONFIGURATION; bandwidth for the
    /// new configuration is reserved before it is called and released again if it fails.
    pub fn set_configuration<F>(
        &self,
        dev: DeviceId,
        config: Option<&Configuration>,
        send: F,
    ) -> Result<(), BandwidthError>
    where
        F: FnOnce() -> Result<(), BackendError>,
    {
        let mut session = self.bandwidth_session();
        if self.is_dead() {
            return Err(BandwidthError::ControllerDead);
        }
        let (speed, old_claims, old_endpoints) = {
            let bus = self.bus.lock();
            let device = bus.device(dev).ok_or(BandwidthError::InvalidState)?;
            match device.state() {
                DeviceState::Address | DeviceState::Configured => {}
                _ => return Err(BandwidthError::InvalidState),
            }
            let endpoints: Vec<Arc<Endpoint>> = device
                .endpoints()
                .into_iter()
                .filter(|ep| ep.number() != 0)
                .collect();
            (device.speed(), device.claims().to_vec(), endpoints)
        };

        for claim in &old_claims {
            session.release(claim.endpoint.ty(), claim.us);
        }
        let mut new_claims = Vec::new();
        if let Some(config) = config {
            for interface in &config.interfaces {
                let alt = interface
                    .alt_setting(0)
                    .or_else(|| interface.alt_settings.first());
                if let Some(alt) = alt {
                    new_claims.extend(claim_endpoints(
                        &mut session,
                        speed,
                        interface.number,
                        &alt.endpoints,
                    )?);
                }
            }
        }

        self.quiesce_endpoints(&old_endpoints);
        if let Err(e) = send() {
            debug!(
                "{}: set configuration of {:?} failed: {}",
                self.config.product_desc, dev, e
            );
            for ep in &old_endpoints {
                ep.set_enabled(true);
            }
            return Err(BandwidthError::Backend(e));
        }

        {
            let mut bus = self.bus.lock();
            let device = bus.device_mut(dev).ok_or(BandwidthError::InvalidState)?;
            for ep in &old_endpoints {
                device.remove_endpoint(ep.address());
            }
            if let Some(config) = config {
                for desc in config.default_endpoints() {
                    device.add_endpoint(desc);
                }
            }
            device.set_active_config(config.cloned());
            device.set_state(match config {
                Some(_) => DeviceState::Configured,
                None => DeviceState::Address,
            });
            device.set_claims(new_claims);
        }
        session.commit();
        Ok(())
    }

    /// Switch `interface` of the active configuration to `alt`. `send` issues SET_INTERFACE.
    pub fn set_interface<F>(
        &self,
        dev: DeviceId,
        interface: u8,
        alt: u8,
        send: F,
    ) -> Result<(), BandwidthError>
    where
        F: FnOnce() -> Result<(), BackendError>,
    {
        let mut session = self.bandwidth_session();
        if self.is_dead() {
            return Err(BandwidthError::ControllerDead);
        }
        let (speed, old_claims, old_endpoints, new_descs) = {
            let bus = self.bus.lock();
            let device = bus.device(dev).ok_or(BandwidthError::InvalidState)?;
            if device.state() != DeviceState::Configured {
                return Err(BandwidthError::InvalidState);
            }
            let intf = device
                .active_configuration()
                .and_then(|c| c.interface(interface))
                .ok_or(BandwidthError::InvalidState)?;
            let new_descs = intf
                .alt_setting(alt)
                .ok_or(BandwidthError::InvalidState)?
                .endpoints
                .clone();
            let current = device.alt_setting(interface).unwrap_or(0);
            let old_endpoints: Vec<Arc<Endpoint>> = intf
                .alt_setting(current)
                .map(|a| {
                    a.endpoints
                        .iter()
                        .filter_map(|d| device.endpoint(d.address))
                        .filter(|ep| ep.number() != 0)
                        .collect()
                })
                .unwrap_or_default();
            let old_claims: Vec<BandwidthClaim> = device
                .claims()
                .iter()
                .filter(|c| c.interface == interface)
                .cloned()
                .collect();
            (device.speed(), old_claims, old_endpoints, new_descs)
        };

        for claim in &old_claims {
            session.release(claim.endpoint.ty(), claim.us);
        }
        let new_claims = claim_endpoints(&mut session, speed, interface, &new_descs)?;

        self.quiesce_endpoints(&old_endpoints);
        if let Err(e) = send() {
            debug!(
                "{}: set interface {} alt {} of {:?} failed: {}",
                self.config.product_desc, interface, alt, dev, e
            );
            for ep in &old_endpoints {
                ep.set_enabled(true);
            }
            return Err(BandwidthError::Backend(e));
        }

        {
            let mut bus = self.bus.lock();
            let device = bus.device_mut(dev).ok_or(BandwidthError::InvalidState)?;
            for ep in &old_endpoints {
                device.remove_endpoint(ep.address());
            }
            for desc in &new_descs {
                device.add_endpoint(*desc);
            }
            device.set_alt_setting(interface, alt);
            let mut claims: Vec<BandwidthClaim> = device
                .claims()
                .iter()
                .filter(|c| c.interface != interface)
                .cloned()
                .collect();
            claims.extend(new_claims);
            device.set_claims(claims);
        }
        session.commit();
        Ok(())
    }
}
