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
use mio::net::TcpListener;
use mio::Token;
use slab::Slab;
use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use super::config::Config;
use super::connection::{ConnectionId, Protocol};
use super::net;
use super::selector::{Readiness, Selector};
use super::tcp_relay_handler::TcpRelayHandler;
use crate::error::RelayError;

const TAG: &str = "tcp_relay";

/// Accept client connections and relay each of them to a new connection to the remote.
pub struct TcpRelay {
    self_weak: Weak<RefCell<TcpRelay>>,
    config: Config,
    listener: Option<TcpListener>,
    token: Option<Token>,
    handlers: Slab<Rc<RefCell<TcpRelayHandler>>>,
    next_id: u64,
}

impl TcpRelay {
    /// Bind and listen on the configured address. The relay does nothing until added to a loop.
    pub fn create(config: Config) -> Result<Rc<RefCell<Self>>, RelayError> {
        let listener = net::bind_tcp_listener(config.listen())?;
        info!(target: TAG, "Listening on {}", config.listen());
        let handlers = Slab::with_capacity(config.handler_capacity());
        let rc = Rc::new(RefCell::new(Self {
            self_weak: Weak::new(),
            config,
            listener: Some(listener),
            token: None,
            handlers,
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
        let token = match self_ref.listener {
            Some(ref listener) => selector
                .register(listener, handler, Readiness::READABLE | Readiness::ERROR)
                .map_err(RelayError::Registration)?,
            None => return Err(RelayError::Io(closed_error())),
        };
        self_ref.token = Some(token);
        Ok(())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.listener {
            Some(ref listener) => listener.local_addr(),
            None => Err(closed_error()),
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    fn on_ready(&mut self, selector: &mut Selector, ready: Readiness) {
        if ready.is_error() {
            let cause = match self.listener.as_ref().map(TcpListener::take_error) {
                Some(Ok(Some(err))) | Some(Err(err)) => err.to_string(),
                _ => String::from("unknown error"),
            };
            error!(target: TAG, "Error on listening socket: {}", cause);
            self.close(selector);
            return;
        }
        if ready.is_readable() {
            // one connection per event, the poll will report the next ones
            self.accept(selector);
        }
    }

    fn accept(&mut self, selector: &mut Selector) {
        let accepted = match self.listener {
            Some(ref listener) => listener.accept(),
            None => return,
        };
        let (local, client) = match accepted {
            Ok(accepted) => accepted,
            Err(ref err) if net::is_transient(err) => {
                debug!(target: TAG, "Spurious accept event, ignoring");
                return;
            }
            Err(err) => {
                warn!(target: TAG, "Cannot accept connection: {}", err);
                return;
            }
        };

        // read the remote address now, it may have been refreshed since the last connection
        let remote_addr = self.config.remote().get();
        self.next_id += 1;
        let id = ConnectionId::new(Protocol::Tcp, self.next_id, client, remote_addr);
        let remote = match net::connect_tcp(remote_addr) {
            Ok(remote) => remote,
            Err(err) => {
                cx_warn!(target: TAG, id, "Cannot connect to remote: {}", err);
                // the accepted socket is closed by RAII
                return;
            }
        };

        let entry = self.handlers.vacant_entry();
        let key = entry.key();
        match TcpRelayHandler::create(selector, id, key, self.self_weak.clone(), local, remote) {
            Ok(handler) => {
                entry.insert(handler);
            }
            Err(err) => {
                error!(target: TAG, "Cannot register connection from {}: {}", client, err);
            }
        }
    }

    /// Forget a closed handler.
    pub fn remove_handler(&mut self, key: usize) {
        if self.handlers.contains(key) {
            self.handlers.remove(key);
        } else {
            warn!(target: TAG, "Remove unknown handler {}, ignoring", key);
        }
    }

    /// Close every connection pair, then the listening socket.
    pub fn close(&mut self, selector: &mut Selector) {
        for handler in self.handlers.drain() {
            handler.borrow_mut().close(selector);
        }
        if let Some(listener) = self.listener.take() {
            if let Some(token) = self.token.take() {
                if let Err(err) = selector.deregister(&listener, token) {
                    warn!(target: TAG, "Cannot deregister listening socket: {}", err);
                }
            }
            info!(target: TAG, "Closed");
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "TCP relay is closed")
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
    fn add_to_loop_twice() {
        let mut selector = Selector::new().unwrap();
        let relay = TcpRelay::create(local_config()).unwrap();
        TcpRelay::add_to_loop(&relay, &mut selector).unwrap();
        match TcpRelay::add_to_loop(&relay, &mut selector) {
            Err(RelayError::AlreadyRegistered) => (),
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn close_releases_listener() {
        let mut selector = Selector::new().unwrap();
        let relay = TcpRelay::create(local_config()).unwrap();
        TcpRelay::add_to_loop(&relay, &mut selector).unwrap();
        let token = relay.borrow().token.unwrap();
        assert!(selector.is_registered(token));
        assert_ne!(0, relay.borrow().local_addr().unwrap().port());

        relay.borrow_mut().close(&mut selector);
        assert!(!selector.is_registered(token));
        assert!(relay.borrow().local_addr().is_err());
        assert_eq!(0, relay.borrow().handler_count());

        // closing twice is harmless
        relay.borrow_mut().close(&mut selector);
    }
}
