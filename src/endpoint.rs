// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use std::sync::{Arc, MutexGuard};

use sync::Mutex;

use crate::device::DeviceId;
use crate::giveback::Priority;
use crate::types::{Direction, EndpointDescriptor, EndpointType};
use crate::urb::Urb;

/// Urbs queued on one endpoint, in submission order. Stream 0 is the main queue.
#[derive(Default)]
pub(crate) struct EndpointQueue {
    urbs: VecDeque<Arc<Urb>>,
    streams: BTreeMap<u16, VecDeque<Arc<Urb>>>,
    giveback_lane: Option<Priority>,
    pending_givebacks: usize,
}

impl EndpointQueue {
    fn lane_mut(&mut self, stream_id: u16) -> &mut VecDeque<Arc<Urb>> {
        if stream_id == 0 {
            &mut self.urbs
        } else {
            self.streams.entry(stream_id).or_insert_with(VecDeque::new)
        }
    }

    pub(crate) fn link(&mut self, urb: Arc<Urb>) {
        self.lane_mut(urb.stream_id()).push_back(urb);
    }

    /// Remove `urb`. Returns false if it was not linked here.
    pub(crate) fn unlink(&mut self, urb: &Arc<Urb>) -> bool {
        let stream_id = urb.stream_id();
        let lane = self.lane_mut(stream_id);
        let found = match lane.iter().position(|u| Arc::ptr_eq(u, urb)) {
            Some(pos) => {
                lane.remove(pos);
                true
            }
            None => false,
        };
        if stream_id != 0 && self.streams.get(&stream_id).map_or(false, |q| q.is_empty()) {
            self.streams.remove(&stream_id);
        }
        found
    }

    pub(crate) fn contains(&self, urb: &Arc<Urb>) -> bool {
        let lane = if urb.stream_id() == 0 {
            Some(&self.urbs)
        } else {
            self.streams.get(&urb.stream_id())
        };
        lane.map_or(false, |q| q.iter().any(|u| Arc::ptr_eq(u, urb)))
    }

    pub(crate) fn len(&self) -> usize {
        self.urbs.len() + self.streams.values().map(|q| q.len()).sum::<usize>()
    }

    /// Every queued urb, main queue first, then streams in id order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Urb>> {
        self.urbs
            .iter()
            .chain(self.streams.values().flat_map(|q| q.iter()))
            .cloned()
            .collect()
    }

    /// Pick the lane for a new giveback. While earlier callbacks of this endpoint are still
    /// pending, stay on their lane so they run in order.
    pub(crate) fn route_giveback(&mut self, preferred: Priority) -> Priority {
        let lane = match self.giveback_lane {
            Some(lane) if self.pending_givebacks > 0 => lane,
            _ => preferred,
        };
        self.giveback_lane = Some(lane);
        self.pending_givebacks += 1;
        lane
    }

    pub(crate) fn giveback_done(&mut self) {
        if self.pending_givebacks == 0 {
            error!("endpoint giveback count underflow");
            return;
        }
        self.pending_givebacks -= 1;
        if self.pending_givebacks == 0 {
            self.giveback_lane = None;
        }
    }
}

/// One endpoint of a device: a queue of urbs for a single (device, direction, number) tuple.
pub struct Endpoint {
    device: DeviceId,
    desc: EndpointDescriptor,
    root_hub: bool,
    enabled: AtomicBool,
    // Bit 0 is the OUT toggle, bit 1 the IN toggle. Only control endpoints use both.
    toggles: AtomicU8,
    num_streams: AtomicU16,
    queue: Mutex<EndpointQueue>,
    hcpriv: Mutex<Option<Box<dyn Any + Send>>>,
}

impl Endpoint {
    pub(crate) fn new(device: DeviceId, desc: EndpointDescriptor, root_hub: bool) -> Arc<Endpoint> {
        Arc::new(Endpoint {
            device,
            desc,
            root_hub,
            enabled: AtomicBool::new(true),
            toggles: AtomicU8::new(0),
            num_streams: AtomicU16::new(0),
            queue: Mutex::new(EndpointQueue::default()),
            hcpriv: Mutex::new(None),
        })
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.desc
    }

    pub fn address(&self) -> u8 {
        self.desc.address
    }

    pub fn number(&self) -> u8 {
        self.desc.number()
    }

    pub fn direction(&self) -> Direction {
        self.desc.direction()
    }

    pub fn ty(&self) -> EndpointType {
        self.desc.ty()
    }

    /// True for endpoints of the virtual root hub; their urbs never reach `HcDriver::enqueue`.
    pub fn is_root_hub(&self) -> bool {
        self.root_hub
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    fn toggle_bit(&self, direction: Direction) -> u8 {
        // Non control endpoints only move data one way; keep their toggle in one slot.
        let direction = if self.ty() == EndpointType::Control {
            direction
        } else {
            self.direction()
        };
        1 << (direction as u8)
    }

    pub fn toggle(&self, direction: Direction) -> bool {
        self.toggles.load(Ordering::Acquire) & self.toggle_bit(direction) != 0
    }

    pub fn set_toggle(&self, direction: Direction, value: bool) {
        let bit = self.toggle_bit(direction);
        if value {
            self.toggles.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.toggles.fetch_and(!bit, Ordering::AcqRel);
        }
    }

    /// Flip the toggle after a successful data packet. Returns the new value.
    pub fn flip_toggle(&self, direction: Direction) -> bool {
        let bit = self.toggle_bit(direction);
        self.toggles.fetch_xor(bit, Ordering::AcqRel) & bit == 0
    }

    /// Back to DATA0, as after SET_CONFIGURATION, SET_INTERFACE or CLEAR_FEATURE(HALT).
    pub fn reset_toggles(&self) {
        self.toggles.store(0, Ordering::Release);
    }

    pub fn num_streams(&self) -> u16 {
        self.num_streams.load(Ordering::Acquire)
    }

    pub(crate) fn set_num_streams(&self, num_streams: u16) {
        self.num_streams.store(num_streams, Ordering::Release);
    }

    /// Number of urbs currently queued.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// The urbs currently queued, in submission order.
    pub fn queued_urbs(&self) -> Vec<Arc<Urb>> {
        self.queue.lock().snapshot()
    }

    pub(crate) fn lock_queue(&self) -> MutexGuard<'_, EndpointQueue> {
        self.queue.lock()
    }

    /// Attach backend private state.
    pub fn set_hcpriv(&self, data: Box<dyn Any + Send>) {
        *self.hcpriv.lock() = Some(data);
    }

    pub fn take_hcpriv(&self) -> Option<Box<dyn Any + Send>> {
        self.hcpriv.lock().take()
    }

    /// Run `f` with the backend private state downcast to `T`, if present and of that type.
    pub fn with_hcpriv<T: Any, R, F: FnOnce(&mut T) -> R>(&self, f: F) -> Option<R> {
        let mut hcpriv = self.hcpriv.lock();
        hcpriv
            .as_mut()
            .and_then(|data| data.downcast_mut::<T>())
            .map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_device_id;
    use crate::types::EndpointType;
    use crate::urb::{bulk_urb, TransferBuffer};

    fn bulk_in() -> Arc<Endpoint> {
        Endpoint::new(
            test_device_id(),
            EndpointDescriptor::new(0x81, EndpointType::Bulk, 512, 0),
            false,
        )
    }

    #[test]
    fn control_endpoint_has_two_toggles() {
        let ep = Endpoint::new(test_device_id(), EndpointDescriptor::control(64), false);
        assert!(!ep.toggle(Direction::In));
        assert!(ep.flip_toggle(Direction::In));
        assert!(ep.toggle(Direction::In));
        assert!(!ep.toggle(Direction::Out));
        ep.set_toggle(Direction::Out, true);
        ep.reset_toggles();
        assert!(!ep.toggle(Direction::In));
        assert!(!ep.toggle(Direction::Out));
    }

    #[test]
    fn bulk_endpoint_has_one_toggle() {
        let ep = bulk_in();
        ep.set_toggle(Direction::In, true);
        // Direction is ignored for non control endpoints.
        assert!(ep.toggle(Direction::Out));
        assert!(!ep.flip_toggle(Direction::In));
    }

    #[test]
    fn queue_keeps_order_and_streams() {
        let ep = bulk_in();
        ep.set_num_streams(4);
        let a = Arc::new(bulk_urb(&ep, TransferBuffer::Flat(vec![0; 8])));
        let mut b = bulk_urb(&ep, TransferBuffer::Flat(vec![0; 8]));
        b.set_stream_id(2);
        let b = Arc::new(b);
        let c = Arc::new(bulk_urb(&ep, TransferBuffer::Flat(vec![0; 8])));
        {
            let mut queue = ep.lock_queue();
            queue.link(a.clone());
            queue.link(b.clone());
            queue.link(c.clone());
            assert!(queue.contains(&b));
            assert_eq!(queue.len(), 3);
        }
        let order = ep.queued_urbs();
        assert!(Arc::ptr_eq(&order[0], &a));
        assert!(Arc::ptr_eq(&order[1], &c));
        assert!(Arc::ptr_eq(&order[2], &b));

        let mut queue = ep.lock_queue();
        assert!(queue.unlink(&b));
        assert!(!queue.unlink(&b));
        assert!(!queue.contains(&b));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn giveback_lane_is_sticky_while_pending() {
        let ep = bulk_in();
        let mut queue = ep.lock_queue();
        assert_eq!(queue.route_giveback(Priority::Low), Priority::Low);
        assert_eq!(queue.route_giveback(Priority::High), Priority::Low);
        queue.giveback_done();
        queue.giveback_done();
        assert_eq!(queue.route_giveback(Priority::High), Priority::High);
    }

    #[test]
    fn hcpriv_downcast() {
        let ep = bulk_in();
        assert_eq!(ep.with_hcpriv(|slot: &mut u32| *slot), None);
        ep.set_hcpriv(Box::new(7u32));
        assert_eq!(ep.with_hcpriv(|slot: &mut u32| *slot += 1), Some(()));
        assert_eq!(ep.with_hcpriv(|slot: &mut u32| *slot), Some(8));
        assert_eq!(ep.with_hcpriv(|_: &mut String| ()), None);
        assert!(ep.take_hcpriv().is_some());
    }
}
