// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Controller wide state bits. Changed only by atomic fetch-or / fetch-and.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HcdFlags: u32 {
        /// Registers may be touched; cleared while suspended.
        const HW_ACCESSIBLE = 1 << 0;
        /// Root hub status is polled on the timer.
        const POLL_RH = 1 << 2;
        /// A status change is waiting for a status urb.
        const POLL_PENDING = 1 << 3;
        /// Remote wakeup signalled and not handled yet.
        const WAKEUP_PENDING = 1 << 4;
        const RH_RUNNING = 1 << 5;
        /// Controller died. Terminal until re-initialized.
        const DEAD = 1 << 6;
        /// Interfaces of new devices are authorized by default.
        const INTF_AUTHORIZED = 1 << 7;
    }
}

#[derive(Debug)]
pub struct AtomicHcdFlags(AtomicU32);

impl AtomicHcdFlags {
    pub fn new(flags: HcdFlags) -> AtomicHcdFlags {
        AtomicHcdFlags(AtomicU32::new(flags.bits()))
    }

    pub fn load(&self) -> HcdFlags {
        HcdFlags::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    pub fn contains(&self, flags: HcdFlags) -> bool {
        self.load().contains(flags)
    }

    /// Set `flags`, returning the previous value.
    pub fn set(&self, flags: HcdFlags) -> HcdFlags {
        HcdFlags::from_bits_truncate(self.0.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// Clear `flags`, returning the previous value.
    pub fn clear(&self, flags: HcdFlags) -> HcdFlags {
        HcdFlags::from_bits_truncate(self.0.fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    /// Set `flag` and report whether it was already set.
    pub fn test_and_set(&self, flag: HcdFlags) -> bool {
        self.set(flag).contains(flag)
    }

    /// Clear `flag` and report whether it was set.
    pub fn test_and_clear(&self, flag: HcdFlags) -> bool {
        self.clear(flag).contains(flag)
    }
}

const STATE_ACTIVE: u8 = 0x01;
const STATE_SUSPEND: u8 = 0x04;
const STATE_TRANSIENT: u8 = 0x80;

/// Controller run state. Each value is a composite of the active, suspend and transient bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Halted,
    Running,
    /// On the way from running to suspended.
    Quiescing,
    /// On the way from suspended to running.
    Resuming,
    Suspended,
}

impl RunState {
    pub fn bits(self) -> u8 {
        match self {
            RunState::Halted => 0,
            RunState::Running => STATE_ACTIVE,
            RunState::Quiescing => STATE_SUSPEND | STATE_TRANSIENT | STATE_ACTIVE,
            RunState::Resuming => STATE_SUSPEND | STATE_TRANSIENT,
            RunState::Suspended => STATE_SUSPEND,
        }
    }

    pub fn from_bits(bits: u8) -> Option<RunState> {
        [
            RunState::Halted,
            RunState::Running,
            RunState::Quiescing,
            RunState::Resuming,
            RunState::Suspended,
        ]
        .iter()
        .cloned()
        .find(|s| s.bits() == bits)
    }

    /// Hardware is (still) processing schedules. True while quiescing.
    pub fn is_running(self) -> bool {
        self.bits() & STATE_ACTIVE != 0
    }

    pub fn is_suspended(self) -> bool {
        self.bits() & STATE_SUSPEND != 0 && !self.is_running()
    }

    pub fn is_transient(self) -> bool {
        self.bits() & STATE_TRANSIENT != 0
    }
}

#[derive(Debug)]
pub struct AtomicRunState(AtomicU8);

impl AtomicRunState {
    pub fn new(state: RunState) -> AtomicRunState {
        AtomicRunState(AtomicU8::new(state.bits()))
    }

    pub fn load(&self) -> RunState {
        // Only valid encodings are ever stored.
        RunState::from_bits(self.0.load(Ordering::Acquire)).unwrap_or(RunState::Halted)
    }

    pub fn store(&self, state: RunState) {
        self.0.store(state.bits(), Ordering::Release);
    }

    /// Move from `from` to `to`. On failure returns the state actually found.
    pub fn transition(&self, from: RunState, to: RunState) -> Result<(), RunState> {
        self.0
            .compare_exchange(from.bits(), to.bits(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|bits| RunState::from_bits(bits).unwrap_or(RunState::Halted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_match_layout() {
        assert_eq!(HcdFlags::HW_ACCESSIBLE.bits(), 0x01);
        assert_eq!(HcdFlags::POLL_RH.bits(), 0x04);
        assert_eq!(HcdFlags::DEAD.bits(), 0x40);
        assert_eq!(HcdFlags::INTF_AUTHORIZED.bits(), 0x80);
    }

    #[test]
    fn test_and_set_reports_previous() {
        let flags = AtomicHcdFlags::new(HcdFlags::empty());
        assert!(!flags.test_and_set(HcdFlags::DEAD));
        assert!(flags.test_and_set(HcdFlags::DEAD));
        flags.set(HcdFlags::POLL_RH | HcdFlags::RH_RUNNING);
        assert!(flags.test_and_clear(HcdFlags::POLL_RH));
        assert!(!flags.test_and_clear(HcdFlags::POLL_RH));
        assert_eq!(flags.load(), HcdFlags::DEAD | HcdFlags::RH_RUNNING);
    }

    #[test]
    fn run_state_encoding() {
        assert_eq!(RunState::Halted.bits(), 0x00);
        assert_eq!(RunState::Running.bits(), 0x01);
        assert_eq!(RunState::Quiescing.bits(), 0x85);
        assert_eq!(RunState::Resuming.bits(), 0x84);
        assert_eq!(RunState::Suspended.bits(), 0x04);
        assert!(RunState::Quiescing.is_running());
        assert!(!RunState::Resuming.is_running());
        assert!(RunState::Suspended.is_suspended());
        assert!(!RunState::Quiescing.is_suspended());
        assert!(RunState::Resuming.is_transient());
        assert_eq!(RunState::from_bits(0x85), Some(RunState::Quiescing));
        assert_eq!(RunState::from_bits(0x02), None);
    }

    #[test]
    fn transition_is_compare_and_swap() {
        let state = AtomicRunState::new(RunState::Halted);
        assert_eq!(
            state.transition(RunState::Running, RunState::Quiescing),
            Err(RunState::Halted)
        );
        state.transition(RunState::Halted, RunState::Running).unwrap();
        assert_eq!(state.load(), RunState::Running);
    }
}
