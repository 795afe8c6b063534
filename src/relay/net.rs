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

use mio::net::{TcpListener, TcpStream, UdpSocket};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::error::{RelayError, SocketError};

const LISTEN_BACKLOG: i32 = 128;

/// Would-block (and interrupted) results only mean "wait for the next readiness event".
pub fn is_transient(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::Interrupted
}

pub fn to_socket_addr_v4(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(addr) => Some(addr),
        SocketAddr::V6(_) => None,
    }
}

/// Create a non-blocking TCP listening socket.
pub fn bind_tcp_listener(addr: SocketAddrV4) -> Result<TcpListener, RelayError> {
    let bind_error = |err| RelayError::Bind(SocketError::new(addr, err));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(bind_error)?;
    socket.set_reuse_address(true).map_err(bind_error)?;
    socket.set_nonblocking(true).map_err(bind_error)?;
    socket
        .bind(&SocketAddr::V4(addr).into())
        .map_err(bind_error)?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|err| RelayError::Listen(SocketError::new(addr, err)))?;
    TcpListener::from_std(socket.into()).map_err(RelayError::Io)
}

/// Create a non-blocking UDP socket bound to `addr`.
pub fn bind_udp(addr: SocketAddrV4) -> Result<UdpSocket, RelayError> {
    let bind_error = |err| RelayError::Bind(SocketError::new(addr, err));
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_error)?;
    socket.set_reuse_address(true).map_err(bind_error)?;
    socket.set_nonblocking(true).map_err(bind_error)?;
    socket
        .bind(&SocketAddr::V4(addr).into())
        .map_err(bind_error)?;
    UdpSocket::from_socket(socket.into()).map_err(RelayError::Io)
}

/// Create a non-blocking UDP socket on an ephemeral port, for a session to the remote.
pub fn bind_udp_ephemeral() -> io::Result<UdpSocket> {
    let autobind_addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0);
    UdpSocket::bind(&autobind_addr)
}

/// Start a non-blocking connection. Its completion (or failure) is reported by the poll.
pub fn connect_tcp(addr: SocketAddrV4) -> io::Result<TcpStream> {
    TcpStream::connect(&SocketAddr::V4(addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_busy_port_fails() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = to_socket_addr_v4(taken.local_addr().unwrap()).unwrap();
        match bind_tcp_listener(addr) {
            Err(RelayError::Bind(err)) => assert_eq!(addr, err.addr()),
            Err(err) => panic!("Unexpected error: {}", err),
            Ok(_) => panic!("Bind should fail"),
        }
    }

    #[test]
    fn bind_ephemeral_udp() {
        let socket = bind_udp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        assert_ne!(0, socket.local_addr().unwrap().port());
    }

    #[test]
    fn transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::ConnectionReset)));
    }
}
