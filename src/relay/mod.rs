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

pub use self::byte_buffer::ByteBuffer;
pub use self::config::{Config, RemoteAddress, DEFAULT_HANDLER_CAPACITY};
pub use self::connection::{ConnectionId, Protocol};
pub use self::event_loop::{Closer, EventLoop, SHUTDOWN_TIMEOUT};
pub use self::flow::{Direction, Flow, WaitStatus};
pub use self::relay::{Relay, RelayHandle};
pub use self::selector::{EventHandler, Readiness, Selector};
pub use self::tcp_relay::TcpRelay;
pub use self::udp_relay::{SessionKey, UdpRelay};

mod byte_buffer;
mod config;
#[macro_use]
mod connection;
mod datagram_queue;
mod event_loop;
mod flow;
mod net;
#[allow(clippy::module_inception)] // relay.rs is in relay/
mod relay;
mod selector;
mod tcp_relay;
mod tcp_relay_handler;
mod udp_relay;
mod udp_session;
