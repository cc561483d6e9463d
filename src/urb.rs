// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::any::Any;
use std::cmp::min;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, MutexGuard};
use std::thread::{self, ThreadId};

use bitflags::bitflags;
use sync::Mutex;

use crate::endpoint::Endpoint;
use crate::error::{BackendError, SubmitError};
use crate::types::{Direction, EndpointType, UsbRequestSetup};

bitflags! {
    /// Transfer flags set by the submitting driver.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UrbFlags: u32 {
        /// A short IN transfer is an error.
        const SHORT_NOT_OK = 0x0001;
        /// Start an isochronous transfer at the next available frame.
        const ISO_ASAP = 0x0002;
        /// Terminate a bulk OUT that is a multiple of max packet with a zero length packet.
        const ZERO_PACKET = 0x0040;
        /// The driver does not need a prompt callback; give back on the low lane.
        const NO_INTERRUPT = 0x0080;
    }
}

/// Status of an urb, as seen by the completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Not completed yet.
    InProgress,
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
    /// Short IN transfer with `SHORT_NOT_OK` set.
    ShortPacket,
    /// The host controller died with the urb queued.
    ControllerDead,
}

impl From<BackendError> for TransferStatus {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Stall => TransferStatus::Stall,
            BackendError::TimedOut => TransferStatus::TimedOut,
            BackendError::NoDevice => TransferStatus::NoDevice,
            BackendError::Shutdown => TransferStatus::ControllerDead,
            BackendError::NotFound | BackendError::NoMemory | BackendError::Other(_) => {
                TransferStatus::Error
            }
        }
    }
}

/// Data stage memory of an urb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferBuffer {
    Flat(Vec<u8>),
    /// Segments are transferred back to back.
    ScatterGather(Vec<Vec<u8>>),
}

impl Default for TransferBuffer {
    fn default() -> Self {
        TransferBuffer::Flat(Vec::new())
    }
}

impl TransferBuffer {
    /// Total len of this buffer.
    pub fn len(&self) -> usize {
        match self {
            TransferBuffer::Flat(v) => v.len(),
            TransferBuffer::ScatterGather(segments) => segments.iter().map(|s| s.len()).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read content to buffer, return read size.
    pub fn read(&self, buffer: &mut [u8]) -> usize {
        let mut total_size = 0usize;
        let mut remaining: &mut [u8] = buffer;
        for segment in self.segments() {
            if remaining.is_empty() {
                break;
            }
            let len = min(segment.len(), remaining.len());
            let (cur, rest) = remaining.split_at_mut(len);
            cur.copy_from_slice(&segment[..len]);
            total_size += len;
            remaining = rest;
        }
        total_size
    }

    /// Write content from buffer, return write size.
    pub fn write(&mut self, buffer: &[u8]) -> usize {
        let mut total_size = 0usize;
        let mut remaining: &[u8] = buffer;
        for segment in self.segments_mut() {
            if remaining.is_empty() {
                break;
            }
            let len = min(segment.len(), remaining.len());
            let (cur, rest) = remaining.split_at(len);
            segment[..len].copy_from_slice(cur);
            total_size += len;
            remaining = rest;
        }
        total_size
    }

    fn segments(&self) -> Vec<&[u8]> {
        match self {
            TransferBuffer::Flat(v) => vec![v.as_slice()],
            TransferBuffer::ScatterGather(segments) => {
                segments.iter().map(|s| s.as_slice()).collect()
            }
        }
    }

    fn segments_mut(&mut self) -> Vec<&mut [u8]> {
        match self {
            TransferBuffer::Flat(v) => vec![v.as_mut_slice()],
            TransferBuffer::ScatterGather(segments) => {
                segments.iter_mut().map(|s| s.as_mut_slice()).collect()
            }
        }
    }
}

/// One packet of an isochronous urb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacketDescriptor {
    pub offset: usize,
    pub length: usize,
    pub actual_length: usize,
    pub status: TransferStatus,
}

impl IsoPacketDescriptor {
    pub fn new(offset: usize, length: usize) -> Self {
        IsoPacketDescriptor {
            offset,
            length,
            actual_length: 0,
            status: TransferStatus::InProgress,
        }
    }
}

// Lifecycle states. An urb is in exactly one of these.
const URB_IDLE: u8 = 0;
const URB_QUEUED: u8 = 1;
const URB_COMPLETING: u8 = 2;
const URB_IN_CALLBACK: u8 = 3;

type UrbCompletionCallback = dyn FnMut(&Arc<Urb>) + Send + 'static;

/// Usb request block: one asynchronous transfer on one endpoint.
pub struct Urb {
    endpoint: Arc<Endpoint>,
    direction: Direction,
    setup: Option<UsbRequestSetup>,
    flags: UrbFlags,
    stream_id: u16,
    interval: u32,
    buffer: Mutex<TransferBuffer>,
    iso_packets: Mutex<Vec<IsoPacketDescriptor>>,
    start_frame: AtomicU32,
    status: Mutex<TransferStatus>,
    actual_length: AtomicUsize,
    error_count: AtomicU32,
    unlinked: Mutex<Option<TransferStatus>>,
    use_count: AtomicUsize,
    reject: AtomicBool,
    state: AtomicU8,
    callback: Mutex<Option<Box<UrbCompletionCallback>>>,
    callback_thread: Mutex<Option<ThreadId>>,
    hcpriv: Mutex<Option<Box<dyn Any + Send>>>,
}

/// Build a control urb for `endpoint`, normally ep0. The data stage is `setup.length` bytes.
pub fn control_urb(endpoint: &Arc<Endpoint>, setup: UsbRequestSetup) -> Urb {
    let len = setup.data_length();
    let mut urb = Urb::new(endpoint, TransferBuffer::Flat(vec![0; len]));
    urb.direction = setup.direction();
    urb.setup = Some(setup);
    urb
}

/// Build a bulk urb.
pub fn bulk_urb(endpoint: &Arc<Endpoint>, buffer: TransferBuffer) -> Urb {
    Urb::new(endpoint, buffer)
}

/// Build an interrupt urb. The polling interval defaults to the endpoint's.
pub fn interrupt_urb(endpoint: &Arc<Endpoint>, buffer: TransferBuffer) -> Urb {
    let mut urb = Urb::new(endpoint, buffer);
    urb.interval = u32::from(endpoint.descriptor().interval);
    urb
}

/// Build an isochronous urb with one descriptor per packet.
pub fn iso_urb(
    endpoint: &Arc<Endpoint>,
    buffer: TransferBuffer,
    packets: Vec<IsoPacketDescriptor>,
) -> Urb {
    let mut urb = Urb::new(endpoint, buffer);
    urb.interval = u32::from(endpoint.descriptor().interval);
    urb.iso_packets = Mutex::new(packets);
    urb
}

impl Urb {
    fn new(endpoint: &Arc<Endpoint>, buffer: TransferBuffer) -> Urb {
        Urb {
            endpoint: endpoint.clone(),
            direction: endpoint.direction(),
            setup: None,
            flags: UrbFlags::empty(),
            stream_id: 0,
            interval: 0,
            buffer: Mutex::new(buffer),
            iso_packets: Mutex::new(Vec::new()),
            start_frame: AtomicU32::new(0),
            status: Mutex::new(TransferStatus::InProgress),
            actual_length: AtomicUsize::new(0),
            error_count: AtomicU32::new(0),
            unlinked: Mutex::new(None),
            use_count: AtomicUsize::new(0),
            reject: AtomicBool::new(false),
            state: AtomicU8::new(URB_IDLE),
            callback: Mutex::new(None),
            callback_thread: Mutex::new(None),
            hcpriv: Mutex::new(None),
        }
    }

    /// Set callback function for urb completion. Runs on the giveback thread.
    pub fn set_callback<C: 'static + FnMut(&Arc<Urb>) + Send>(&mut self, cb: C) {
        *self.callback.get_mut() = Some(Box::new(cb));
    }

    pub fn set_flags(&mut self, flags: UrbFlags) {
        self.flags = flags;
    }

    pub fn set_stream_id(&mut self, stream_id: u16) {
        self.stream_id = stream_id;
    }

    pub fn set_interval(&mut self, interval: u32) {
        self.interval = interval;
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn transfer_type(&self) -> EndpointType {
        self.endpoint.ty()
    }

    pub fn setup(&self) -> Option<UsbRequestSetup> {
        self.setup
    }

    pub fn flags(&self) -> UrbFlags {
        self.flags
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Requested length of the data stage.
    pub fn transfer_length(&self) -> usize {
        let len = self.buffer.lock().len();
        match self.setup {
            Some(setup) => min(len, setup.data_length()),
            None => len,
        }
    }

    /// Lock the data buffer. Backends copy in or out of it; drivers read results in the callback.
    pub fn buffer(&self) -> MutexGuard<'_, TransferBuffer> {
        self.buffer.lock()
    }

    pub fn iso_packets(&self) -> MutexGuard<'_, Vec<IsoPacketDescriptor>> {
        self.iso_packets.lock()
    }

    pub fn start_frame(&self) -> u32 {
        self.start_frame.load(Ordering::Acquire)
    }

    /// Backends record the frame an `ISO_ASAP` urb was scheduled for.
    pub fn set_start_frame(&self, frame: u32) {
        self.start_frame.store(frame, Ordering::Release);
    }

    /// Get the transfer status of this urb.
    pub fn status(&self) -> TransferStatus {
        *self.status.lock()
    }

    /// Get actual length of data that was transferred.
    pub fn actual_length(&self) -> usize {
        self.actual_length.load(Ordering::Acquire)
    }

    /// Isochronous packets that did not complete cleanly.
    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Acquire)
    }

    /// Number of submissions whose callback has not returned yet.
    pub fn use_count(&self) -> usize {
        self.use_count.load(Ordering::Acquire)
    }

    pub fn is_rejected(&self) -> bool {
        self.reject.load(Ordering::Acquire)
    }

    /// Allow submissions again after a cancel or kill.
    pub fn unpoison(&self) {
        self.reject.store(false, Ordering::Release);
    }

    /// True from a successful submit until the backend completes it.
    pub fn is_queued(&self) -> bool {
        self.state.load(Ordering::Acquire) == URB_QUEUED
    }

    /// True from submit until the callback is about to run.
    pub fn is_in_flight(&self) -> bool {
        self.state.load(Ordering::Acquire) != URB_IDLE
    }

    /// Status recorded by a cancel that is still in progress.
    pub fn unlink_status(&self) -> Option<TransferStatus> {
        *self.unlinked.lock()
    }

    pub fn set_hcpriv(&self, data: Box<dyn Any + Send>) {
        *self.hcpriv.lock() = Some(data);
    }

    pub fn take_hcpriv(&self) -> Option<Box<dyn Any + Send>> {
        self.hcpriv.lock().take()
    }

    /// Reject malformed urbs before they are queued.
    pub(crate) fn validate(&self) -> Result<(), SubmitError> {
        match self.transfer_type() {
            EndpointType::Control => {
                let setup = self.setup.ok_or(SubmitError::InvalidState)?;
                if setup.data_length() > self.buffer.lock().len() {
                    return Err(SubmitError::InvalidState);
                }
            }
            EndpointType::Isochronous => {
                let len = self.buffer.lock().len();
                let packets = self.iso_packets.lock();
                let overruns = packets.iter().any(|p| {
                    p.offset
                        .checked_add(p.length)
                        .map_or(true, |end| end > len)
                });
                if packets.is_empty() || overruns {
                    return Err(SubmitError::InvalidState);
                }
            }
            EndpointType::Bulk | EndpointType::Interrupt => {}
        }
        if self.stream_id > self.endpoint.num_streams() {
            return Err(SubmitError::InvalidState);
        }
        Ok(())
    }

    pub(crate) fn get(&self) {
        self.use_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn put(&self) {
        if self.use_count.fetch_sub(1, Ordering::AcqRel) == 0 {
            error!("urb use count underflow");
            self.use_count.store(0, Ordering::Release);
        }
    }

    /// Set the reject flag. Returns the previous value.
    pub(crate) fn poison(&self) -> bool {
        self.reject.swap(true, Ordering::AcqRel)
    }

    /// Idle -> queued. Fails if the urb is queued or its callback is still pending, unless the
    /// caller is that callback.
    pub(crate) fn mark_queued(&self) -> bool {
        if self
            .state
            .compare_exchange(URB_IDLE, URB_QUEUED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return true;
        }
        let owner = self.callback_thread.lock();
        *owner == Some(thread::current().id())
            && self
                .state
                .compare_exchange(
                    URB_IN_CALLBACK,
                    URB_QUEUED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
    }

    /// Queued -> completing. Exactly one caller wins per submission.
    pub(crate) fn mark_completing(&self) -> bool {
        self.state
            .compare_exchange(
                URB_QUEUED,
                URB_COMPLETING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Queued -> idle, undoing a submission the backend refused. Fails if it already completed.
    pub(crate) fn mark_unqueued(&self) -> bool {
        let owner = self.callback_thread.lock();
        let previous = if *owner == Some(thread::current().id()) {
            URB_IN_CALLBACK
        } else {
            URB_IDLE
        };
        self.state
            .compare_exchange(URB_QUEUED, previous, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Completing -> in callback. Only the current thread may resubmit until `leave_callback`.
    pub(crate) fn enter_callback(&self) {
        *self.callback_thread.lock() = Some(thread::current().id());
        self.state.store(URB_IN_CALLBACK, Ordering::Release);
    }

    /// In callback -> idle. Leaves the state alone if the callback resubmitted.
    pub(crate) fn leave_callback(&self) {
        let mut owner = self.callback_thread.lock();
        *owner = None;
        if self
            .state
            .compare_exchange(URB_IN_CALLBACK, URB_IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("urb on ep {:#x} resubmitted by its callback", self.endpoint.address());
        }
    }

    /// Record an unlink. Returns false if one was already recorded.
    pub(crate) fn set_unlinked(&self, status: TransferStatus) -> bool {
        let mut unlinked = self.unlinked.lock();
        if unlinked.is_some() {
            return false;
        }
        *unlinked = Some(status);
        true
    }

    pub(crate) fn reset_for_submit(&self) {
        *self.status.lock() = TransferStatus::InProgress;
        *self.unlinked.lock() = None;
        self.actual_length.store(0, Ordering::Release);
        self.error_count.store(0, Ordering::Release);
        for packet in self.iso_packets.lock().iter_mut() {
            packet.actual_length = 0;
            packet.status = TransferStatus::InProgress;
        }
    }

    /// Compute the status the callback will see from what the backend reported.
    pub(crate) fn final_status(&self, status: TransferStatus, actual_length: usize) -> TransferStatus {
        if let Some(unlinked) = self.unlink_status() {
            return unlinked;
        }
        if status == TransferStatus::Completed
            && self.direction == Direction::In
            && self.flags.contains(UrbFlags::SHORT_NOT_OK)
            && actual_length < self.transfer_length()
        {
            return TransferStatus::ShortPacket;
        }
        status
    }

    pub(crate) fn finish(&self, status: TransferStatus, actual_length: usize) {
        let actual_length = min(actual_length, self.transfer_length());
        self.actual_length.store(actual_length, Ordering::Release);
        let errors = self
            .iso_packets
            .lock()
            .iter()
            .filter(|p| p.status != TransferStatus::Completed)
            .count();
        self.error_count.store(errors as u32, Ordering::Release);
        *self.status.lock() = status;
    }

    pub(crate) fn invoke_callback(self: &Arc<Self>) {
        let mut callback = self.callback.lock();
        match callback.as_mut() {
            Some(cb) => cb(self),
            None => debug!(
                "urb on ep {:#x} completed with no callback",
                self.endpoint.address()
            ),
        }
    }
}

impl Debug for Urb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Urb")
            .field("endpoint", &self.endpoint.address())
            .field("direction", &self.direction)
            .field("flags", &self.flags)
            .field("stream_id", &self.stream_id)
            .field("status", &self.status())
            .field("actual_length", &self.actual_length())
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}
