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

use mio::net::TcpStream;
use mio::Token;
use std::cell::RefCell;
use std::fmt;
use std::io::{self, Read};
use std::rc::{Rc, Weak};

use super::byte_buffer::ByteBuffer;
use super::connection::ConnectionId;
use super::flow::{Direction, Flow, WaitStatus};
use super::net;
use super::selector::{Readiness, Selector};
use super::tcp_relay::TcpRelay;

const TAG: &str = "tcp_relay";

// client to remote
const UPSTREAM_BUFFER_SIZE: usize = 16 * 1024;
// remote to client, larger since most traffic is downloaded
const DOWNSTREAM_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Local,
    Remote,
}

impl Side {
    // direction of the data read from this side
    fn read_direction(self) -> Direction {
        match self {
            Side::Local => Direction::Upstream,
            Side::Remote => Direction::Downstream,
        }
    }

    // direction of the data written to this side
    fn write_direction(self) -> Direction {
        match self {
            Side::Local => Direction::Downstream,
            Side::Remote => Direction::Upstream,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Side::Local => write!(f, "local"),
            Side::Remote => write!(f, "remote"),
        }
    }
}

fn buffer_size(direction: Direction) -> usize {
    match direction {
        Direction::Upstream => UPSTREAM_BUFFER_SIZE,
        Direction::Downstream => DOWNSTREAM_BUFFER_SIZE,
    }
}

/// Relay the bytes of one accepted client connection to its outbound connection, and back.
///
/// Both sockets are owned by the handler. Once closed, the sockets are released and the handler
/// removes itself from its relay.
pub struct TcpRelayHandler {
    id: ConnectionId,
    key: usize,
    relay: Weak<RefCell<TcpRelay>>,
    local: Option<TcpStream>,
    remote: Option<TcpStream>,
    local_token: Token,
    remote_token: Token,
    flow: Flow,
    closed: bool,
}

impl TcpRelayHandler {
    /// Register both sockets of the pair, so that both sides may be read immediately.
    ///
    /// `key` identifies the handler in the relay table.
    pub fn create(
        selector: &mut Selector,
        id: ConnectionId,
        key: usize,
        relay: Weak<RefCell<TcpRelay>>,
        local: TcpStream,
        remote: TcpStream,
    ) -> io::Result<Rc<RefCell<Self>>> {
        cx_info!(target: TAG, id, "Open");
        let flow = Flow::new();
        let local_interest = flow.local_interest();
        let remote_interest = flow.remote_interest();
        let rc = Rc::new(RefCell::new(Self {
            id,
            key,
            relay,
            local: None,
            remote: None,
            local_token: Token(0),  // default value, will be set afterwards
            remote_token: Token(0), // default value, will be set afterwards
            flow,
            closed: false,
        }));

        let rc2 = rc.clone();
        let local_handler = move |selector: &mut Selector, ready: Readiness| {
            rc2.borrow_mut().on_ready(selector, Side::Local, ready)
        };
        let local_token = selector.register(&local, local_handler, local_interest)?;

        let rc2 = rc.clone();
        let remote_handler = move |selector: &mut Selector, ready: Readiness| {
            rc2.borrow_mut().on_ready(selector, Side::Remote, ready)
        };
        let remote_token = match selector.register(&remote, remote_handler, remote_interest) {
            Ok(token) => token,
            Err(err) => {
                // the local socket must not stay registered without its pair
                selector.deregister(&local, local_token)?;
                return Err(err);
            }
        };

        {
            let mut self_ref = rc.borrow_mut();
            self_ref.local = Some(local);
            self_ref.remote = Some(remote);
            self_ref.local_token = local_token;
            self_ref.remote_token = remote_token;
        }
        Ok(rc)
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.closed
    }

    fn on_ready(&mut self, selector: &mut Selector, side: Side, ready: Readiness) {
        if self.closed {
            cx_debug!(target: TAG, self.id, "Event on closed connection, ignoring");
            return;
        }
        cx_trace!(target: TAG, self.id, "{} ready: {:?}", side, ready);
        self.process(selector, side, ready);
        if self.closed {
            self.remove_from_relay();
        }
    }

    fn process(&mut self, selector: &mut Selector, side: Side, ready: Readiness) {
        if ready.is_error() {
            let cause = self.take_error(side);
            cx_warn!(target: TAG, self.id, "Error on {} socket: {}", side, cause);
            self.close(selector);
            return;
        }
        if ready.is_hup() && !ready.is_readable() && !self.is_reading(side) {
            // the peer is gone, and nothing may be read from it anymore
            cx_info!(target: TAG, self.id, "{} socket hung up", side);
            self.close(selector);
            return;
        }
        if ready.is_readable() || ready.is_hup() {
            self.process_read(selector, side);
            if self.closed {
                return;
            }
        }
        if ready.is_writable() {
            self.process_flush(selector, side.write_direction());
        }
    }

    fn is_reading(&self, side: Side) -> bool {
        let interest = match side {
            Side::Local => self.flow.local_interest(),
            Side::Remote => self.flow.remote_interest(),
        };
        interest.is_readable()
    }

    fn take_error(&self, side: Side) -> String {
        let stream = match side {
            Side::Local => self.local.as_ref(),
            Side::Remote => self.remote.as_ref(),
        };
        match stream.map(TcpStream::take_error) {
            Some(Ok(Some(err))) => err.to_string(),
            Some(Err(err)) => err.to_string(),
            _ => String::from("unknown error"),
        }
    }

    fn process_read(&mut self, selector: &mut Selector, side: Side) {
        let direction = side.read_direction();
        let mut buf = [0u8; DOWNSTREAM_BUFFER_SIZE];
        let buf = &mut buf[..buffer_size(direction)];
        let stream = match side {
            Side::Local => self.local.as_mut(),
            Side::Remote => self.remote.as_mut(),
        };
        let result = match stream {
            Some(stream) => stream.read(buf),
            None => return,
        };
        match result {
            Ok(0) => {
                // half-close is not supported, the whole pair is closed
                cx_info!(target: TAG, self.id, "{} socket reached end of stream", side);
                self.close(selector);
            }
            Ok(r) => {
                cx_trace!(target: TAG, self.id, "Read {} bytes from {}", r, side);
                self.write_to_sock(selector, direction, &buf[..r]);
            }
            Err(ref err) if net::is_transient(err) => {
                cx_debug!(target: TAG, self.id, "Spurious read event, ignoring")
            }
            Err(err) => {
                cx_warn!(target: TAG, self.id, "Cannot read from {}: {}", side, err);
                self.close(selector);
            }
        }
    }

    // pending writes of `direction` along with the socket they are written to
    fn pending_and_destination(
        &mut self,
        direction: Direction,
    ) -> (&mut ByteBuffer, Option<&mut TcpStream>) {
        let destination = match direction {
            Direction::Upstream => self.remote.as_mut(),
            Direction::Downstream => self.local.as_mut(),
        };
        (self.flow.pending_mut(direction), destination)
    }

    /// Send `data` in `direction`, in a single attempt.
    ///
    /// What is not sent is kept (after any older pending bytes) until the destination becomes
    /// writable.
    fn write_to_sock(&mut self, selector: &mut Selector, direction: Direction, data: &[u8]) {
        let result = match self.pending_and_destination(direction) {
            (pending, Some(destination)) => pending.write_through(destination, data),
            (_, None) => return,
        };
        self.after_write(selector, direction, result);
    }

    fn process_flush(&mut self, selector: &mut Selector, direction: Direction) {
        let result = match self.pending_and_destination(direction) {
            (pending, Some(destination)) => pending.flush_to(destination),
            (_, None) => return,
        };
        self.after_write(selector, direction, result);
    }

    fn after_write(
        &mut self,
        selector: &mut Selector,
        direction: Direction,
        result: io::Result<bool>,
    ) {
        match result {
            Ok(true) => self.update_flow(selector, direction, WaitStatus::Reading),
            Ok(false) => {
                cx_debug!(
                    target: TAG,
                    self.id,
                    "{} bytes pending {:?}",
                    self.flow.pending(direction).len(),
                    direction
                );
                self.update_flow(selector, direction, WaitStatus::Writing);
            }
            Err(err) => {
                cx_warn!(target: TAG, self.id, "Cannot write {:?}: {}", direction, err);
                self.close(selector);
            }
        }
    }

    fn update_flow(&mut self, selector: &mut Selector, direction: Direction, status: WaitStatus) {
        if self.flow.update(direction, status) {
            self.update_interests(selector);
        }
    }

    fn update_interests(&mut self, selector: &mut Selector) {
        let local_interest = self.flow.local_interest();
        let remote_interest = self.flow.remote_interest();
        cx_debug!(
            target: TAG,
            self.id,
            "interests: local={:?}, remote={:?}",
            local_interest,
            remote_interest
        );
        let mut result = Ok(());
        if let Some(ref local) = self.local {
            result = selector.reregister(local, self.local_token, local_interest);
        }
        if result.is_ok() {
            if let Some(ref remote) = self.remote {
                result = selector.reregister(remote, self.remote_token, remote_interest);
            }
        }
        if let Err(err) = result {
            cx_error!(target: TAG, self.id, "Cannot update interests: {}", err);
            self.close(selector);
        }
    }

    fn remove_from_relay(&self) {
        // the relay may already be gone while it closes all its handlers
        if let Some(relay) = self.relay.upgrade() {
            relay.borrow_mut().remove_handler(self.key);
        }
    }

    /// Deregister and close both sockets. Closing twice is a no-op.
    ///
    /// The relay table is not touched: the caller is responsible for forgetting the handler.
    pub fn close(&mut self, selector: &mut Selector) {
        if self.closed {
            return;
        }
        cx_info!(target: TAG, self.id, "Close");
        self.closed = true;
        if let Some(local) = self.local.take() {
            if let Err(err) = selector.deregister(&local, self.local_token) {
                cx_warn!(target: TAG, self.id, "Cannot deregister local socket: {}", err);
            }
            // socket will be closed by RAII
        }
        if let Some(remote) = self.remote.take() {
            if let Err(err) = selector.deregister(&remote, self.remote_token) {
                cx_warn!(target: TAG, self.id, "Cannot deregister remote socket: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::connection::Protocol;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    fn connected_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (TcpStream::from_stream(server).unwrap(), client)
    }

    fn create_handler(selector: &mut Selector) -> Rc<RefCell<TcpRelayHandler>> {
        let (local, _) = connected_pair();
        let (remote, _) = connected_pair();
        let client: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let remote_addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 19002);
        let id = ConnectionId::new(Protocol::Tcp, 1, client, remote_addr);
        TcpRelayHandler::create(selector, id, 0, Weak::new(), local, remote).unwrap()
    }

    #[test]
    fn both_sides_read_initially() {
        let mut selector = Selector::new().unwrap();
        let handler = create_handler(&mut selector);
        let handler = handler.borrow();
        let both = Readiness::READABLE | Readiness::ERROR;
        assert_eq!(Some(both), selector.interest(handler.local_token));
        assert_eq!(Some(both), selector.interest(handler.remote_token));
    }

    #[test]
    fn close_twice() {
        let mut selector = Selector::new().unwrap();
        let handler = create_handler(&mut selector);
        let mut handler = handler.borrow_mut();
        handler.close(&mut selector);
        assert!(handler.is_closed());
        assert!(!selector.is_registered(handler.local_token));
        assert!(!selector.is_registered(handler.remote_token));
        handler.close(&mut selector);
        assert!(handler.is_closed());
    }

    #[test]
    fn blocked_upstream_stops_reading_client() {
        let mut selector = Selector::new().unwrap();
        let handler = create_handler(&mut selector);
        let mut handler = handler.borrow_mut();
        handler.update_flow(&mut selector, Direction::Upstream, WaitStatus::Writing);
        assert_eq!(
            Some(Readiness::ERROR),
            selector.interest(handler.local_token)
        );
        assert_eq!(
            Some(Readiness::READABLE | Readiness::WRITABLE | Readiness::ERROR),
            selector.interest(handler.remote_token)
        );

        handler.update_flow(&mut selector, Direction::Upstream, WaitStatus::Reading);
        assert_eq!(
            Some(Readiness::READABLE | Readiness::ERROR),
            selector.interest(handler.local_token)
        );
    }
}
