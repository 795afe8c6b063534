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

use chrono::Local;
use log::*;
use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::config::Config;
use super::event_loop::{Closer, EventLoop, SHUTDOWN_TIMEOUT};
use super::selector::Selector;
use super::tcp_relay::TcpRelay;
use super::udp_relay::UdpRelay;
use crate::error::RelayError;

const TAG: &str = "eventloop";
const CLEANING_INTERVAL_SECONDS: i64 = 60;

/// TCP and UDP relays sharing one event loop, in a dedicated thread.
pub struct Relay {
    config: Config,
}

/// Handle to a started relay.
///
/// Dropping it closes the relay.
pub struct RelayHandle {
    closer: Closer,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

// sent back by the relay thread once both relays are listening
struct Started {
    closer: Closer,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
}

struct Relays {
    event_loop: EventLoop,
    tcp_relay: Rc<RefCell<TcpRelay>>,
    udp_relay: Rc<RefCell<UdpRelay>>,
}

impl Relay {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Bind both listening sockets and start relaying.
    ///
    /// Return once the relay is listening, or with the error which prevented it to start.
    pub fn start(self) -> Result<RelayHandle, RelayError> {
        let (sender, receiver) = mpsc::channel();
        let config = self.config;
        let thread = thread::Builder::new()
            .name(String::from("relay"))
            .spawn(move || run(config, sender))?;
        match receiver.recv() {
            Ok(Ok(started)) => Ok(RelayHandle {
                closer: started.closer,
                tcp_addr: started.tcp_addr,
                udp_addr: started.udp_addr,
                thread: Some(thread),
            }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(RelayError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "Relay thread exited before starting",
                )))
            }
        }
    }
}

fn init(config: &Config) -> Result<(Relays, Started), RelayError> {
    // two registrations per connection pair
    let selector = Selector::with_capacity(2 * config.handler_capacity())?;
    let mut event_loop = EventLoop::new(selector);
    let tcp_relay = TcpRelay::create(config.clone())?;
    let udp_relay = UdpRelay::create(config.clone())?;
    TcpRelay::add_to_loop(&tcp_relay, event_loop.selector())?;
    UdpRelay::add_to_loop(&udp_relay, event_loop.selector())?;

    let tcp_addr = tcp_relay.borrow().local_addr()?;
    let udp_addr = udp_relay.borrow().local_addr()?;
    let closer = event_loop.closer().ok_or_else(|| {
        io::Error::new(io::ErrorKind::Other, "Event loop closer already taken")
    })?;
    let relays = Relays {
        event_loop,
        tcp_relay,
        udp_relay,
    };
    let started = Started {
        closer,
        tcp_addr,
        udp_addr,
    };
    Ok((relays, started))
}

fn run(config: Config, started: Sender<Result<Started, RelayError>>) {
    let Relays {
        mut event_loop,
        tcp_relay,
        udp_relay,
    } = match init(&config) {
        Ok((relays, info)) => {
            if started.send(Ok(info)).is_err() {
                return;
            }
            relays
        }
        Err(err) => {
            error!(target: TAG, "Cannot start relay: {}", err);
            let _ = started.send(Err(err));
            return;
        }
    };
    info!(target: TAG, "Relay started");

    let udp_idle_timeout = config.udp_idle_timeout();
    // no session may expire before the UDP idle timeout delay
    let mut next_cleaning_deadline =
        Local::now().timestamp() + udp_idle_timeout.map_or(0, |t| t.as_secs() as i64);
    let result = event_loop.run(|selector| {
        if let Some(timeout) = udp_idle_timeout {
            let now = Local::now().timestamp();
            if now >= next_cleaning_deadline {
                udp_relay
                    .borrow_mut()
                    .clean_expired_sessions(selector, timeout);
                next_cleaning_deadline = now + CLEANING_INTERVAL_SECONDS;
            }
        }
    });
    if let Err(err) = result {
        error!(target: TAG, "Event loop failed: {}", err);
    }

    // release every socket before the closer is notified
    tcp_relay.borrow_mut().close(event_loop.selector());
    udp_relay.borrow_mut().close(event_loop.selector());
    info!(target: TAG, "Relay stopped");
}

impl RelayHandle {
    pub fn tcp_local_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn udp_local_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn close(&mut self) -> Result<(), RelayError> {
        self.close_timeout(SHUTDOWN_TIMEOUT)
    }

    /// Stop the relay and wait for every socket to be closed.
    ///
    /// On `ShutdownTimeout`, the relay keeps running: closing may be retried.
    pub fn close_timeout(&mut self, timeout: Duration) -> Result<(), RelayError> {
        self.closer.close_timeout(timeout)?;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(target: TAG, "Relay thread panicked");
            }
        }
        Ok(())
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if let Err(err) = self.close() {
                error!(target: TAG, "Cannot close relay: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::config::RemoteAddress;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn local_config() -> Config {
        let listen = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
        let remote = RemoteAddress::new(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9));
        Config::new(listen, remote)
    }

    #[test]
    fn start_and_close() {
        let mut handle = Relay::new(local_config()).start().unwrap();
        assert_ne!(0, handle.tcp_local_addr().port());
        assert_ne!(0, handle.udp_local_addr().port());
        handle.close().unwrap();
        // closing again is harmless
        handle.close().unwrap();
    }

    #[test]
    fn start_on_busy_port() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let listen = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        let remote = RemoteAddress::new(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9));
        match Relay::new(Config::new(listen, remote)).start() {
            Err(RelayError::Bind(err)) => assert_eq!(listen, err.addr()),
            Err(err) => panic!("Unexpected error: {}", err),
            Ok(_) => panic!("Start should fail"),
        }
    }
}
