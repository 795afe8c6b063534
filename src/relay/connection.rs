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

use std::fmt;
use std::net::{SocketAddr, SocketAddrV4};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// Identify a connection pair (or a UDP session) in the logs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionId {
    protocol: Protocol,
    number: u64,
    client: SocketAddr,
    remote: SocketAddrV4,
    id_string: String,
}

impl ConnectionId {
    pub fn new(protocol: Protocol, number: u64, client: SocketAddr, remote: SocketAddrV4) -> Self {
        let id_string = format!("{} #{} {} -> {}", protocol, number, client, remote);
        Self {
            protocol,
            number,
            client,
            remote,
            id_string,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn client(&self) -> SocketAddr {
        self.client
    }

    pub fn remote(&self) -> SocketAddrV4 {
        self.remote
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.id_string)
    }
}

// macros to log connection id along with the message

macro_rules! cx_format {
    ($id:tt, $str:tt, $($arg:tt)+) => {
        format!(concat!("{} ", $str), $id, $($arg)+)
    };
    ($id:tt, $str:tt) => {
        format!(concat!("{} ", $str), $id)
    };
}

macro_rules! cx_trace {
    (target: $target:expr, $id:expr, $($arg:tt)*) => {
        log::trace!(target: $target, "{}", cx_format!($id, $($arg)+))
    }
}

macro_rules! cx_debug {
    (target: $target:expr, $id:expr, $($arg:tt)*) => {
        log::debug!(target: $target, "{}", cx_format!($id, $($arg)+))
    }
}

macro_rules! cx_info {
    (target: $target:expr, $id:expr, $($arg:tt)*) => {
        log::info!(target: $target, "{}", cx_format!($id, $($arg)+))
    }
}

macro_rules! cx_warn {
    (target: $target:expr, $id:expr, $($arg:tt)*) => {
        log::warn!(target: $target, "{}", cx_format!($id, $($arg)+))
    }
}

macro_rules! cx_error {
    (target: $target:expr, $id:expr, $($arg:tt)*) => {
        log::error!(target: $target, "{}", cx_format!($id, $($arg)+))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn connection_id_display() {
        let client = "127.0.0.1:50000".parse().unwrap();
        let remote = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 19002);
        let id = ConnectionId::new(Protocol::Tcp, 3, client, remote);
        assert_eq!("TCP #3 127.0.0.1:50000 -> 10.0.0.2:19002", id.to_string());
        assert_eq!(Protocol::Tcp, id.protocol());
        assert_eq!(client, id.client());
        assert_eq!(remote, id.remote());
    }

    #[test]
    fn format_with_connection_id() {
        let client = "127.0.0.1:50000".parse().unwrap();
        let remote = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 19012);
        let id = ConnectionId::new(Protocol::Udp, 1, client, remote);
        assert_eq!(
            "UDP #1 127.0.0.1:50000 -> 127.0.0.1:19012 Close",
            cx_format!(id, "Close")
        );
        assert_eq!(
            "UDP #1 127.0.0.1:50000 -> 127.0.0.1:19012 Read 42 bytes",
            cx_format!(id, "Read {} bytes", 42)
        );
    }
}
