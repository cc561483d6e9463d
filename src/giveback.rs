// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use sync::{Condvar, Mutex};

/// Which giveback lane a job goes to. The worker always drains `High` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Low,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Lanes {
    high: VecDeque<Job>,
    low: VecDeque<Job>,
    running: bool,
    stopped: bool,
}

impl Lanes {
    fn pop(&mut self) -> Option<Job> {
        match self.high.pop_front() {
            Some(job) => Some(job),
            None => self.low.pop_front(),
        }
    }

    fn is_idle(&self) -> bool {
        !self.running && self.high.is_empty() && self.low.is_empty()
    }
}

struct Shared {
    lanes: Mutex<Lanes>,
    work: Condvar,
    idle: Condvar,
}

/// Deferred completion queue. Jobs run one at a time on a dedicated worker thread, so urb
/// callbacks never run in the context that called `complete`.
pub struct GivebackQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl GivebackQueue {
    /// Spawn the worker thread.
    pub fn start(name: &str) -> io::Result<GivebackQueue> {
        let shared = Arc::new(Shared {
            lanes: Mutex::new(Lanes::default()),
            work: Condvar::new(),
            idle: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_jobs(&worker_shared))?;
        let worker_id = handle.thread().id();
        Ok(GivebackQueue {
            shared,
            worker: Mutex::new(Some(handle)),
            worker_id,
        })
    }

    pub fn queue_job<T: FnOnce() + Send + 'static>(&self, priority: Priority, cb: T) {
        let mut lanes = self.shared.lanes.lock();
        if lanes.stopped {
            // Still run it; a completion must never be lost.
            warn!("giveback queue stopped, running job inline");
            drop(lanes);
            cb();
            return;
        }
        match priority {
            Priority::High => lanes.high.push_back(Box::new(cb)),
            Priority::Low => lanes.low.push_back(Box::new(cb)),
        }
        self.shared.work.notify_one();
    }

    /// Number of jobs waiting to run, not counting one that is running.
    pub fn pending(&self) -> usize {
        let lanes = self.shared.lanes.lock();
        lanes.high.len() + lanes.low.len()
    }

    /// Block until both lanes are empty and no job is running. Returns immediately when called
    /// from a job.
    pub fn flush(&self) {
        if thread::current().id() == self.worker_id {
            return;
        }
        let mut lanes = self.shared.lanes.lock();
        while !lanes.is_idle() {
            lanes = self.shared.idle.wait(lanes);
        }
    }

    /// Run what is queued, then stop the worker. Safe to call more than once.
    pub fn stop(&self) {
        {
            let mut lanes = self.shared.lanes.lock();
            lanes.stopped = true;
            self.shared.work.notify_all();
        }
        // The last reference may be dropped from inside a job; the worker then exits on its own.
        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("giveback worker panicked");
            }
        }
    }
}

impl Drop for GivebackQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_jobs(shared: &Shared) {
    loop {
        let job = {
            let mut lanes = shared.lanes.lock();
            loop {
                if let Some(job) = lanes.pop() {
                    lanes.running = true;
                    break job;
                }
                lanes.running = false;
                shared.idle.notify_all();
                if lanes.stopped {
                    return;
                }
                lanes = shared.work.wait(lanes);
            }
        };
        job();
    }
}
