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
use mio::unix::UnixReady;
use mio::{Events, Evented, Poll, PollOpt, Ready, Token};
use slab::Slab;
use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::rc::Rc;
use std::time::Duration;

const TAG: &str = "eventloop";

/// Readiness bits, independent of the poll backend.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness(u8);

impl Readiness {
    pub const READABLE: Readiness = Readiness(0x01);
    pub const WRITABLE: Readiness = Readiness(0x04);
    pub const ERROR: Readiness = Readiness(0x08);
    pub const HUP: Readiness = Readiness(0x10);

    pub fn empty() -> Self {
        Readiness(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Readiness) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_readable(self) -> bool {
        self.contains(Self::READABLE)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    pub fn is_error(self) -> bool {
        self.contains(Self::ERROR)
    }

    pub fn is_hup(self) -> bool {
        self.contains(Self::HUP)
    }

    fn to_mio(self) -> Ready {
        let mut ready = Ready::empty();
        if self.is_readable() {
            ready = ready | Ready::readable();
        }
        if self.is_writable() {
            ready = ready | Ready::writable();
        }
        if self.is_error() {
            ready = ready | Ready::from(UnixReady::error());
        }
        if self.is_hup() {
            ready = ready | Ready::from(UnixReady::hup());
        }
        ready
    }

    fn from_mio(ready: Ready) -> Self {
        let unix_ready = UnixReady::from(ready);
        let mut readiness = Readiness::empty();
        if ready.is_readable() {
            readiness |= Readiness::READABLE;
        }
        if ready.is_writable() {
            readiness |= Readiness::WRITABLE;
        }
        if unix_ready.is_error() {
            readiness |= Readiness::ERROR;
        }
        if unix_ready.is_hup() {
            readiness |= Readiness::HUP;
        }
        readiness
    }
}

impl BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, other: Readiness) -> Readiness {
        Readiness(self.0 | other.0)
    }
}

impl BitOrAssign for Readiness {
    fn bitor_assign(&mut self, other: Readiness) {
        self.0 |= other.0;
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let flags = [
            (Readiness::READABLE, "READABLE"),
            (Readiness::WRITABLE, "WRITABLE"),
            (Readiness::ERROR, "ERROR"),
            (Readiness::HUP, "HUP"),
        ];
        let mut first = true;
        for &(flag, name) in &flags {
            if self.contains(flag) {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "(empty)")?;
        }
        Ok(())
    }
}

pub trait EventHandler {
    fn on_ready(&self, selector: &mut Selector, ready: Readiness);
}

impl<F> EventHandler for F
where
    F: Fn(&mut Selector, Readiness),
{
    fn on_ready(&self, selector: &mut Selector, ready: Readiness) {
        self(selector, ready);
    }
}

struct Registration {
    handler: Rc<dyn EventHandler>,
    // None once deregistered, until the token is actually released
    interest: Option<Readiness>,
}

/// Registration table and dispatcher on top of `mio::Poll`.
///
/// Every handle is registered level-triggered, so a handler which does not consume all the
/// available data is notified again on the next poll.
pub struct Selector {
    poll: Poll,
    registrations: Slab<Registration>,
    // tokens to be removed after all the current poll events are executed
    tokens_to_remove: Vec<Token>,
}

impl Selector {
    pub fn new() -> io::Result<Self> {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            registrations: Slab::with_capacity(capacity),
            tokens_to_remove: Vec::new(),
        })
    }

    pub fn register<E, H>(
        &mut self,
        handle: &E,
        handler: H,
        interest: Readiness,
    ) -> io::Result<Token>
    where
        E: Evented + ?Sized,
        H: EventHandler + 'static,
    {
        let token = Token(self.registrations.insert(Registration {
            handler: Rc::new(handler),
            interest: Some(interest),
        }));
        if let Err(err) = self
            .poll
            .register(handle, token, interest.to_mio(), PollOpt::level())
        {
            // remove the token we just added
            self.registrations.remove(token.0);
            Err(err)
        } else {
            debug!(target: TAG, "Register {:?}: {:?}", token, interest);
            Ok(token)
        }
    }

    /// Change the interest of a registered handle. Nothing is done if it is unchanged.
    pub fn reregister<E>(&mut self, handle: &E, token: Token, interest: Readiness) -> io::Result<()>
    where
        E: Evented + ?Sized,
    {
        let registration = match self.registrations.get_mut(token.0) {
            Some(registration) if registration.interest.is_some() => registration,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{:?} is not registered", token),
                ))
            }
        };
        if registration.interest == Some(interest) {
            return Ok(());
        }
        self.poll
            .reregister(handle, token, interest.to_mio(), PollOpt::level())?;
        registration.interest = Some(interest);
        debug!(target: TAG, "Reregister {:?}: {:?}", token, interest);
        Ok(())
    }

    /// Remove a handle from the poll. Deregistering an unknown token is a no-op.
    pub fn deregister<E>(&mut self, handle: &E, token: Token) -> io::Result<()>
    where
        E: Evented + ?Sized,
    {
        match self.registrations.get_mut(token.0) {
            Some(registration) if registration.interest.is_some() => {
                registration.interest = None;
            }
            _ => {
                debug!(target: TAG, "Deregister unknown {:?}, ignoring", token);
                return Ok(());
            }
        }
        // remove them before next poll()
        self.tokens_to_remove.push(token);
        match self.poll.deregister(handle) {
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            result => result,
        }
    }

    pub fn interest(&self, token: Token) -> Option<Readiness> {
        self.registrations
            .get(token.0)
            .and_then(|registration| registration.interest)
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.interest(token).is_some()
    }

    fn clean_removed_tokens(&mut self) {
        for &token in &self.tokens_to_remove {
            self.registrations.remove(token.0);
        }
        self.tokens_to_remove.clear();
    }

    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        self.poll.poll(events, timeout)
    }

    pub fn run_handlers(&mut self, events: &Events) {
        for event in events {
            let token = event.token();
            let ready = Readiness::from_mio(event.readiness());
            trace!(target: TAG, "{:?}: {:?}", token, ready);
            let handler = match self.registrations.get(token.0) {
                Some(Registration {
                    handler,
                    interest: Some(_),
                }) => handler.clone(),
                Some(_) => {
                    debug!(target: TAG, "{:?} deregistered during this pass, drop event", token);
                    continue;
                }
                None => {
                    warn!(target: TAG, "Event for unknown {:?}, drop event", token);
                    continue;
                }
            };
            handler.on_ready(self, ready);
        }

        // remove the tokens marked as removed
        self.clean_removed_tokens();
    }
}
