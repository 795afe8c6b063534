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
use mio::net::UdpSocket;
use mio::Token;
use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::rc::{Rc, Weak};
use std::time::Duration;

use super::config::Config;
use super::connection::{ConnectionId, Protocol};
use super::datagram_queue::{DatagramQueue, Delivery, MAX_DATAGRAM_LENGTH};
use super::net;
use super::selector::{Readiness, Selector};
use super::udp_session::UdpSession;
use crate::error::RelayError;

const TAG: &str = "udp_relay";

const QUEUE_CAPACITY: usize = 4 * MAX_DATAGRAM_LENGTH;

/// Client address a UDP session is bound to.
///
/// Equality compares the full address, so distinct clients never share a session even if their
/// hashes collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionKey {
    ip: [u8; 4],
    port: u16,
}

impl SessionKey {
    pub fn new(client: SocketAddrV4) -> Self {
        Self {
            ip: client.ip().octets(),
            port: client.port(),
        }
    }

    pub fn client(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.ip), self.port)
    }
}

impl Hash for SessionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // address bytes followed by the port
        state.write(&self.ip);
        state.write_u16(self.port);
    }
}

/// Relay the datagrams received on the listening socket to the remote, through one session per
/// client address.
pub struct UdpRelay {
    self_weak: Weak<RefCell<UdpRelay>>,
    config: Config,
    socket: Option<UdpSocket>,
    token: Option<Token>,
    sessions: HashMap<SessionKey, Rc<RefCell<UdpSession>>>,
    // replies waiting for the listening socket to become writable
    to_clients: DatagramQueue,
    buf: Box<[u8]>,
    next_id: u64,
}

impl UdpRelay {
    pub fn create(config: Config) -> Result<Rc<RefCell<Self>>, RelayError> {
        let socket = net::bind_udp(config.listen())?;
        info!(target: TAG, "Listening on {}", config.listen());
        let sessions = HashMap::with_capacity(config.handler_capacity());
        let rc = Rc::new(RefCell::new(Self {
            self_weak: Weak::new(),
            config,
            socket: Some(socket),
            token: None,
            sessions,
            to_clients: DatagramQueue::new(QUEUE_CAPACITY),
            buf: vec![0; MAX_DATAGRAM_LENGTH].into_boxed_slice(),
            next_id: 0,
        }));
        // keep a shared reference to this
        rc.borrow_mut().self_weak = Rc::downgrade(&rc);
        Ok(rc)
    }

    /// Register the listening socket, for READABLE and ERROR.
    pub fn add_to_loop(rc: &Rc<RefCell<Self>>, selector: &mut Selector) -> Result<(), RelayError> {
        let mut self_ref = rc.borrow_mut();
        if self_ref.token.is_some() {
            return Err(RelayError::AlreadyRegistered);
        }
        let rc2 = rc.clone();
        let handler =
            move |selector: &mut Selector, ready: Readiness| rc2.borrow_mut().on_ready(selector, ready);
        let token = match self_ref.socket {
            Some(ref socket) => selector
                .register(socket, handler, Readiness::READABLE | Readiness::ERROR)
                .map_err(RelayError::Registration)?,
            None => return Err(RelayError::Io(closed_error())),
        };
        self_ref.token = Some(token);
        Ok(())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.socket {
            Some(ref socket) => socket.local_addr(),
            None => Err(closed_error()),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn on_ready(&mut self, selector: &mut Selector, ready: Readiness) {
        if ready.is_error() {
            // a datagram socket is not broken by an error, the relay keeps running
            let cause = match self.socket.as_ref().map(UdpSocket::take_error) {
                Some(Ok(Some(err))) | Some(Err(err)) => err.to_string(),
                _ => String::from("unknown error"),
            };
            error!(target: TAG, "Error on listening socket: {}", cause);
        }
        if ready.is_writable() {
            self.process_send(selector);
        }
        if ready.is_readable() {
            self.process_receive(selector);
        }
    }

    fn process_receive(&mut self, selector: &mut Selector) {
        let result = match self.socket {
            Some(ref socket) => socket.recv_from(&mut self.buf),
            None => return,
        };
        let (len, source) = match result {
            Ok(received) => received,
            Err(ref err) if net::is_transient(err) => {
                debug!(target: TAG, "Spurious read event, ignoring");
                return;
            }
            Err(err) => {
                warn!(target: TAG, "Cannot receive datagram: {}", err);
                return;
            }
        };
        let client = match net::to_socket_addr_v4(source) {
            Some(client) => client,
            None => {
                debug!(target: TAG, "Datagram from IPv6 {}, dropping", source);
                return;
            }
        };
        let session = match self.get_or_create_session(selector, client) {
            Some(session) => session,
            None => return,
        };
        let closed = {
            let mut session = session.borrow_mut();
            session.send_to_remote(selector, &self.buf[..len]);
            session.is_closed()
        };
        if closed {
            self.remove_session(&SessionKey::new(client));
        }
    }

    fn get_or_create_session(
        &mut self,
        selector: &mut Selector,
        client: SocketAddrV4,
    ) -> Option<Rc<RefCell<UdpSession>>> {
        let key = SessionKey::new(client);
        if let Some(session) = self.sessions.get(&key) {
            return Some(session.clone());
        }
        // read the remote address now, it may have been refreshed since the last session
        let destination = self.config.remote().get();
        self.next_id += 1;
        let id = ConnectionId::new(Protocol::Udp, self.next_id, SocketAddr::V4(client), destination);
        match UdpSession::create(selector, id, client, destination, self.self_weak.clone()) {
            Ok(session) => {
                self.sessions.insert(key, session.clone());
                Some(session)
            }
            Err(err) => {
                error!(target: TAG, "Cannot open session for {}: {}", client, err);
                None
            }
        }
    }

    /// Send a reply to `client` through the listening socket, or queue it if the socket would
    /// block.
    pub fn send_to_client(
        &mut self,
        selector: &mut Selector,
        client: SocketAddrV4,
        datagram: &[u8],
    ) -> io::Result<()> {
        let delivery = match self.socket {
            Some(ref mut socket) => self.to_clients.send_or_queue(socket, client, datagram)?,
            None => return Err(closed_error()),
        };
        if delivery == Delivery::Queued {
            debug!(
                target: TAG,
                "{} datagrams pending to clients",
                self.to_clients.len()
            );
            self.update_interests(selector);
        }
        Ok(())
    }

    fn process_send(&mut self, selector: &mut Selector) {
        loop {
            let result = match self.socket {
                Some(ref mut socket) => self.to_clients.flush_to(socket),
                None => return,
            };
            match result {
                Ok(_) => break,
                Err((client, err)) => {
                    // the failing datagram is dropped, flush the next ones
                    warn!(target: TAG, "Cannot send to client {}: {}", client, err);
                    self.close_session(selector, client);
                }
            }
        }
        self.update_interests(selector);
    }

    fn update_interests(&mut self, selector: &mut Selector) {
        let mut interest = Readiness::READABLE | Readiness::ERROR;
        if !self.to_clients.is_empty() {
            interest |= Readiness::WRITABLE;
        }
        if let (Some(socket), Some(token)) = (&self.socket, self.token) {
            if let Err(err) = selector.reregister(socket, token, interest) {
                error!(target: TAG, "Cannot update interests: {}", err);
            }
        }
    }

    fn close_session(&mut self, selector: &mut Selector, client: SocketAddrV4) {
        if let Some(session) = self.sessions.remove(&SessionKey::new(client)) {
            session.borrow_mut().close(selector);
        }
    }

    /// Forget a closed session.
    pub fn remove_session(&mut self, key: &SessionKey) {
        if self.sessions.remove(key).is_none() {
            warn!(
                target: TAG,
                "Remove unknown session for {}, ignoring",
                key.client()
            );
        }
    }

    /// Close the sessions which have not relayed any datagram for `timeout`.
    pub fn clean_expired_sessions(&mut self, selector: &mut Selector, timeout: Duration) {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| {
            let mut session = session.borrow_mut();
            if session.is_expired(timeout) {
                session.close(selector);
                false
            } else {
                true
            }
        });
        let removed = before - self.sessions.len();
        if removed > 0 {
            debug!(target: TAG, "Removed {} expired sessions", removed);
        }
    }

    /// Close every session, then the listening socket.
    pub fn close(&mut self, selector: &mut Selector) {
        for (_, session) in self.sessions.drain() {
            session.borrow_mut().close(selector);
        }
        self.to_clients.clear();
        if let Some(socket) = self.socket.take() {
            if let Some(token) = self.token.take() {
                if let Err(err) = selector.deregister(&socket, token) {
                    warn!(target: TAG, "Cannot deregister listening socket: {}", err);
                }
            }
            info!(target: TAG, "Closed");
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "UDP relay is closed")
}
