// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use sync::{Condvar, Mutex};

/// Interface for whoever owns the timer. Called on the timer thread with no timer lock held, so
/// the handler may re-arm.
pub trait TimerHandler: Send + Sync {
    fn on_timer(&self);
}

struct TimerState {
    deadline: Option<Instant>,
    handler: Option<Weak<dyn TimerHandler>>,
    stopped: bool,
}

struct Shared {
    state: Mutex<TimerState>,
    cvar: Condvar,
}

/// One shot timer backed by its own thread. `arm` replaces any pending deadline.
pub struct PollTimer {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl PollTimer {
    pub fn start(name: &str) -> io::Result<PollTimer> {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState {
                deadline: None,
                handler: None,
                stopped: false,
            }),
            cvar: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_timer(&worker_shared))?;
        let worker_id = handle.thread().id();
        Ok(PollTimer {
            shared,
            worker: Mutex::new(Some(handle)),
            worker_id,
        })
    }

    /// Set the handler. A handler that has been dropped is skipped silently.
    pub fn set_handler(&self, handler: Weak<dyn TimerHandler>) {
        self.shared.state.lock().handler = Some(handler);
    }

    /// Fire once after `delay`.
    pub fn arm(&self, delay: Duration) {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return;
        }
        state.deadline = Some(Instant::now() + delay);
        self.shared.cvar.notify_one();
    }

    /// Drop the pending deadline, if any. A firing already in progress still completes.
    pub fn cancel(&self) {
        self.shared.state.lock().deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.shared.state.lock().deadline.is_some()
    }

    /// Stop the thread. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            state.deadline = None;
            self.shared.cvar.notify_all();
        }
        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("poll timer thread panicked");
            }
        }
    }
}

impl Drop for PollTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_timer(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        if state.stopped {
            return;
        }
        let deadline = match state.deadline {
            Some(deadline) => deadline,
            None => {
                state = shared.cvar.wait(state);
                continue;
            }
        };
        let now = Instant::now();
        if now < deadline {
            state = shared.cvar.wait_timeout(state, deadline - now).0;
            continue;
        }
        state.deadline = None;
        let handler = state.handler.as_ref().and_then(|h| h.upgrade());
        drop(state);
        if let Some(handler) = handler {
            handler.on_timer();
        }
        state = shared.state.lock();
    }
}
