/*
 * Copyright (C) 2017 Genymobile
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use log::*;
use mio::Events;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use super::selector::Selector;
use crate::error::RelayError;

const TAG: &str = "eventloop";

const EVENTS_CAPACITY: usize = 1024;
// poll timeout right after a pass which dispatched events
const BUSY_POLL_TIMEOUT: Duration = Duration::from_millis(0);
// poll timeout once the loop went idle, also bounds the reaction time to a stop request
const IDLE_POLL_TIMEOUT: Duration = Duration::from_millis(50);

pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

/// Single-threaded dispatch loop.
///
/// The loop itself is bound to the thread which created it (handlers are `Rc`), only its
/// `Closer` may be sent to other threads.
pub struct EventLoop {
    selector: Selector,
    events: Events,
    stop: Arc<AtomicBool>,
    exited: Sender<()>,
    exited_receiver: Option<Receiver<()>>,
}

/// Request an `EventLoop` to stop, from any thread.
pub struct Closer {
    stop: Arc<AtomicBool>,
    exited: Receiver<()>,
}

impl EventLoop {
    pub fn new(selector: Selector) -> Self {
        let (exited, exited_receiver) = mpsc::channel();
        Self {
            selector,
            events: Events::with_capacity(EVENTS_CAPACITY),
            stop: Arc::new(AtomicBool::new(false)),
            exited,
            exited_receiver: Some(exited_receiver),
        }
    }

    pub fn selector(&mut self) -> &mut Selector {
        &mut self.selector
    }

    /// Return the closer of this loop. It may be retrieved only once.
    pub fn closer(&mut self) -> Option<Closer> {
        let stop = self.stop.clone();
        self.exited_receiver
            .take()
            .map(|exited| Closer { stop, exited })
    }

    /// Poll and dispatch events until a stop is requested.
    ///
    /// `tick` is called on every iteration, with or without events, for periodic maintenance.
    pub fn run<F>(&mut self, mut tick: F) -> io::Result<()>
    where
        F: FnMut(&mut Selector),
    {
        let mut timeout = IDLE_POLL_TIMEOUT;
        while !self.stop.load(Ordering::Acquire) {
            let count = match self.selector.poll(&mut self.events, Some(timeout)) {
                Ok(count) => count,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(target: TAG, "Cannot poll: {}", err);
                    return Err(err);
                }
            };

            tick(&mut self.selector);

            if count == 0 {
                timeout = IDLE_POLL_TIMEOUT;
                continue;
            }
            timeout = BUSY_POLL_TIMEOUT;
            self.selector.run_handlers(&self.events);
        }
        info!(target: TAG, "Event loop stopped");
        Ok(())
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // the poll is released right after
        let _ = self.exited.send(());
    }
}

impl Closer {
    pub fn close(&self) -> Result<(), RelayError> {
        self.close_timeout(SHUTDOWN_TIMEOUT)
    }

    /// Request the loop to stop and wait for it to be dropped.
    ///
    /// On timeout, the stop request is withdrawn: the loop keeps running and the caller may
    /// retry.
    pub fn close_timeout(&self, timeout: Duration) -> Result<(), RelayError> {
        self.stop.store(true, Ordering::Release);
        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Ok(()),
            Err(RecvTimeoutError::Timeout) => {
                self.stop.store(false, Ordering::Release);
                warn!(target: TAG, "Event loop did not stop within {:?}", timeout);
                Err(RelayError::ShutdownTimeout(timeout))
            }
        }
    }
}
