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

use mio::net::UdpSocket;
use mio::Token;
use std::cell::RefCell;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use super::connection::ConnectionId;
use super::datagram_queue::{DatagramQueue, Delivery, MAX_DATAGRAM_LENGTH};
use super::flow::{Direction, Flow, WaitStatus};
use super::net;
use super::selector::{Readiness, Selector};
use super::udp_relay::{SessionKey, UdpRelay};

const TAG: &str = "udp_relay";

const QUEUE_CAPACITY: usize = 4 * MAX_DATAGRAM_LENGTH;

/// Dedicated outbound socket of one client of the UDP relay.
///
/// Datagrams from the client are sent to the remote through this socket, and the replies it
/// receives are sent back to the client through the relay listening socket.
pub struct UdpSession {
    id: ConnectionId,
    key: SessionKey,
    relay: Weak<RefCell<UdpRelay>>,
    socket: Option<UdpSocket>,
    token: Token,
    client: SocketAddrV4,
    destination: SocketAddrV4,
    // only the remote side of the flow is owned by the session
    flow: Flow,
    to_remote: DatagramQueue,
    closed: bool,
    idle_since: Instant,
}

impl UdpSession {
    pub fn create(
        selector: &mut Selector,
        id: ConnectionId,
        client: SocketAddrV4,
        destination: SocketAddrV4,
        relay: Weak<RefCell<UdpRelay>>,
    ) -> io::Result<Rc<RefCell<Self>>> {
        cx_info!(target: TAG, id, "Open");
        let socket = net::bind_udp_ephemeral()?;
        let flow = Flow::new();
        let interest = flow.remote_interest();
        let rc = Rc::new(RefCell::new(Self {
            id,
            key: SessionKey::new(client),
            relay,
            socket: None,
            token: Token(0), // default value, will be set afterwards
            client,
            destination,
            flow,
            to_remote: DatagramQueue::new(QUEUE_CAPACITY),
            closed: false,
            idle_since: Instant::now(),
        }));

        let rc2 = rc.clone();
        let handler =
            move |selector: &mut Selector, ready: Readiness| rc2.borrow_mut().on_ready(selector, ready);
        let token = selector.register(&socket, handler, interest)?;
        {
            let mut self_ref = rc.borrow_mut();
            self_ref.socket = Some(socket);
            self_ref.token = token;
        }
        Ok(rc)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.idle_since.elapsed() > timeout
    }

    fn touch(&mut self) {
        self.idle_since = Instant::now();
    }

    /// Send a datagram from the client to the remote, or queue it if the socket would block.
    ///
    /// On a hard error, the session is closed: the caller must check `is_closed()`.
    pub fn send_to_remote(&mut self, selector: &mut Selector, datagram: &[u8]) {
        if self.closed {
            return;
        }
        self.touch();
        let result = match self.socket {
            Some(ref mut socket) => self.to_remote.send_or_queue(socket, self.destination, datagram),
            None => return,
        };
        match result {
            Ok(Delivery::Sent) => {
                cx_trace!(target: TAG, self.id, "Sent {} bytes to remote", datagram.len())
            }
            Ok(Delivery::Queued) => cx_debug!(
                target: TAG,
                self.id,
                "{} datagrams pending to remote",
                self.to_remote.len()
            ),
            Ok(Delivery::Dropped) => (),
            Err(err) => {
                cx_warn!(target: TAG, self.id, "Cannot send to remote: {}", err);
                self.close(selector);
                return;
            }
        }
        self.update_upstream(selector);
    }

    fn on_ready(&mut self, selector: &mut Selector, ready: Readiness) {
        if self.closed {
            cx_debug!(target: TAG, self.id, "Event on closed session, ignoring");
            return;
        }
        cx_trace!(target: TAG, self.id, "ready: {:?}", ready);
        self.process(selector, ready);
        if self.closed {
            self.remove_from_relay();
        }
    }

    fn process(&mut self, selector: &mut Selector, ready: Readiness) {
        if ready.is_error() {
            let cause = match self.socket.as_ref().map(UdpSocket::take_error) {
                Some(Ok(Some(err))) | Some(Err(err)) => err.to_string(),
                _ => String::from("unknown error"),
            };
            cx_warn!(target: TAG, self.id, "Error on socket: {}", cause);
            self.close(selector);
            return;
        }
        if ready.is_writable() {
            self.process_send(selector);
            if self.closed {
                return;
            }
        }
        if ready.is_readable() {
            self.process_receive(selector);
        }
    }

    fn process_send(&mut self, selector: &mut Selector) {
        let result = match self.socket {
            Some(ref mut socket) => self.to_remote.flush_to(socket),
            None => return,
        };
        match result {
            Ok(_) => self.update_upstream(selector),
            Err((destination, err)) => {
                cx_warn!(target: TAG, self.id, "Cannot send to {}: {}", destination, err);
                self.close(selector);
            }
        }
    }

    fn process_receive(&mut self, selector: &mut Selector) {
        let mut buf = [0u8; MAX_DATAGRAM_LENGTH];
        let result = match self.socket {
            Some(ref socket) => socket.recv_from(&mut buf),
            None => return,
        };
        let (len, source) = match result {
            Ok(received) => received,
            Err(ref err) if net::is_transient(err) => {
                cx_debug!(target: TAG, self.id, "Spurious read event, ignoring");
                return;
            }
            Err(err) => {
                cx_warn!(target: TAG, self.id, "Cannot read: {}", err);
                self.close(selector);
                return;
            }
        };
        if source != SocketAddr::V4(self.destination) {
            // some servers answer from another port or address
            cx_trace!(target: TAG, self.id, "Reply from {}", source);
        }
        self.touch();
        let relay = match self.relay.upgrade() {
            Some(relay) => relay,
            None => return,
        };
        let sent = relay
            .borrow_mut()
            .send_to_client(selector, self.client, &buf[..len]);
        if let Err(err) = sent {
            cx_warn!(target: TAG, self.id, "Cannot send to client: {}", err);
            self.close(selector);
        }
    }

    fn update_upstream(&mut self, selector: &mut Selector) {
        let status = if self.to_remote.is_empty() {
            WaitStatus::Reading
        } else {
            WaitStatus::Writing
        };
        if self.flow.update(Direction::Upstream, status) {
            self.update_interests(selector);
        }
    }

    fn update_interests(&mut self, selector: &mut Selector) {
        let interest = self.flow.remote_interest();
        cx_debug!(target: TAG, self.id, "interests: {:?}", interest);
        let result = match self.socket {
            Some(ref socket) => selector.reregister(socket, self.token, interest),
            None => return,
        };
        if let Err(err) = result {
            cx_error!(target: TAG, self.id, "Cannot update interests: {}", err);
            self.close(selector);
        }
    }

    fn remove_from_relay(&self) {
        if let Some(relay) = self.relay.upgrade() {
            relay.borrow_mut().remove_session(&self.key);
        }
    }

    /// Deregister and close the socket, dropping any pending datagram. Closing twice is a no-op.
    pub fn close(&mut self, selector: &mut Selector) {
        if self.closed {
            return;
        }
        cx_info!(target: TAG, self.id, "Close");
        self.closed = true;
        self.to_remote.clear();
        if let Some(socket) = self.socket.take() {
            if let Err(err) = selector.deregister(&socket, self.token) {
                cx_warn!(target: TAG, self.id, "Cannot deregister socket: {}", err);
            }
            // socket will be closed by RAII
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::connection::Protocol;
    use std::net::Ipv4Addr;
    use std::thread;

    fn create_session(selector: &mut Selector, remote: SocketAddrV4) -> Rc<RefCell<UdpSession>> {
        let client = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 50000);
        let id = ConnectionId::new(Protocol::Udp, 1, SocketAddr::V4(client), remote);
        UdpSession::create(selector, id, client, remote, Weak::new()).unwrap()
    }

    #[test]
    fn send_datagram_to_remote() {
        let remote = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let remote_addr = net::to_socket_addr_v4(remote.local_addr().unwrap()).unwrap();
        let mut selector = Selector::new().unwrap();
        let session = create_session(&mut selector, remote_addr);
        session.borrow_mut().send_to_remote(&mut selector, b"hello");

        let mut buf = [0u8; 16];
        remote
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let (len, _) = remote.recv_from(&mut buf).unwrap();
        assert_eq!(b"hello", &buf[..len]);
        assert!(!session.borrow().is_closed());
    }

    #[test]
    fn expiration() {
        let mut selector = Selector::new().unwrap();
        let session = create_session(&mut selector, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9));
        assert!(!session.borrow().is_expired(Duration::from_secs(60)));
        thread::sleep(Duration::from_millis(20));
        assert!(session.borrow().is_expired(Duration::from_millis(10)));
    }

    #[test]
    fn pending_datagrams_request_writable() {
        let remote = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let remote_addr = net::to_socket_addr_v4(remote.local_addr().unwrap()).unwrap();
        let mut selector = Selector::new().unwrap();
        let session = create_session(&mut selector, remote_addr);
        let mut session = session.borrow_mut();
        let token = session.token;
        assert_eq!(
            Some(Readiness::READABLE | Readiness::ERROR),
            selector.interest(token)
        );

        session.to_remote.push(remote_addr, b"pending").unwrap();
        session.update_upstream(&mut selector);
        assert_eq!(
            Some(Readiness::READABLE | Readiness::WRITABLE | Readiness::ERROR),
            selector.interest(token)
        );

        session.process_send(&mut selector);
        assert!(session.to_remote.is_empty());
        assert_eq!(
            Some(Readiness::READABLE | Readiness::ERROR),
            selector.interest(token)
        );

        let mut buf = [0u8; 16];
        remote
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let (len, _) = remote.recv_from(&mut buf).unwrap();
        assert_eq!(b"pending", &buf[..len]);
    }

    #[test]
    fn close_twice() {
        let mut selector = Selector::new().unwrap();
        let session = create_session(&mut selector, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9));
        let mut session = session.borrow_mut();
        let token = session.token;
        session.close(&mut selector);
        assert!(!selector.is_registered(token));
        session.close(&mut selector);
        assert!(session.is_closed());
        // nothing is sent once closed
        session.send_to_remote(&mut selector, b"ignored");
    }
}
