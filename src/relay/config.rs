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

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_HANDLER_CAPACITY: usize = 1024;

/// Relay configuration, read-only once the relay is started.
///
/// The only mutable part is the remote IP address, shared with the resolver thread through
/// `RemoteAddress`.
#[derive(Clone, Debug)]
pub struct Config {
    listen: SocketAddrV4,
    remote: RemoteAddress,
    handler_capacity: usize,
    udp_idle_timeout: Option<Duration>,
}

impl Config {
    pub fn new(listen: SocketAddrV4, remote: RemoteAddress) -> Self {
        Self {
            listen,
            remote,
            handler_capacity: DEFAULT_HANDLER_CAPACITY,
            udp_idle_timeout: None,
        }
    }

    /// Pre-size the handler tables. This is not a limit.
    pub fn with_handler_capacity(mut self, handler_capacity: usize) -> Self {
        self.handler_capacity = handler_capacity;
        self
    }

    /// Expire UDP sessions idle for longer than `timeout`. Sessions never expire by default.
    pub fn with_udp_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.udp_idle_timeout = timeout;
        self
    }

    pub fn listen(&self) -> SocketAddrV4 {
        self.listen
    }

    pub fn remote(&self) -> &RemoteAddress {
        &self.remote
    }

    pub fn handler_capacity(&self) -> usize {
        self.handler_capacity
    }

    pub fn udp_idle_timeout(&self) -> Option<Duration> {
        self.udp_idle_timeout
    }
}

/// Remote endpoint whose IP may be refreshed from another thread.
///
/// Clones share the same underlying address.
#[derive(Clone, Debug)]
pub struct RemoteAddress {
    ip: Arc<AtomicU32>,
    port: u16,
}

impl RemoteAddress {
    pub fn new(addr: SocketAddrV4) -> Self {
        Self {
            ip: Arc::new(AtomicU32::new(u32::from(*addr.ip()))),
            port: addr.port(),
        }
    }

    pub fn get(&self) -> SocketAddrV4 {
        let ip = Ipv4Addr::from(self.ip.load(Ordering::Acquire));
        SocketAddrV4::new(ip, self.port)
    }

    pub fn set_ip(&self, ip: Ipv4Addr) {
        self.ip.store(u32::from(ip), Ordering::Release);
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}
