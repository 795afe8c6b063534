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
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};

use super::net;

pub const MAX_DATAGRAM_LENGTH: usize = 1 << 16;

const TAG: &str = "udp_relay";

pub trait DatagramSender {
    fn send_datagram(&mut self, buf: &[u8], destination: SocketAddrV4) -> io::Result<usize>;
}

// Expose UdpSocket as DatagramSender
impl DatagramSender for UdpSocket {
    fn send_datagram(&mut self, buf: &[u8], destination: SocketAddrV4) -> io::Result<usize> {
        self.send_to(buf, &SocketAddr::V4(destination))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Queued,
    Dropped,
}

/// FIFO of datagrams waiting for their socket to become writable.
///
/// Each datagram keeps its destination, since a connectionless socket may send to several peers.
/// The total payload size is bounded: a datagram which does not fit is dropped.
pub struct DatagramQueue {
    datagrams: VecDeque<(SocketAddrV4, Box<[u8]>)>,
    size: usize,
    capacity: usize,
}

impl DatagramQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            datagrams: VecDeque::new(),
            size: 0,
            capacity,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.datagrams.is_empty()
    }

    pub fn len(&self) -> usize {
        self.datagrams.len()
    }

    pub fn has_enough_space_for(&self, datagram_length: usize) -> bool {
        self.size + datagram_length <= self.capacity
    }

    pub fn push(&mut self, destination: SocketAddrV4, datagram: &[u8]) -> io::Result<()> {
        assert!(
            datagram.len() <= MAX_DATAGRAM_LENGTH,
            "Datagram length may not be greater than {} bytes",
            MAX_DATAGRAM_LENGTH
        );
        if !self.has_enough_space_for(datagram.len()) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "Datagram queue is full",
            ));
        }
        self.size += datagram.len();
        self.datagrams.push_back((destination, datagram.into()));
        Ok(())
    }

    /// Send `datagram` immediately if nothing is queued, otherwise (or if the sender would
    /// block) append it to the queue.
    pub fn send_or_queue<S: DatagramSender>(
        &mut self,
        sender: &mut S,
        destination: SocketAddrV4,
        datagram: &[u8],
    ) -> io::Result<Delivery> {
        if self.is_empty() {
            match sender.send_datagram(datagram, destination) {
                Ok(_) => return Ok(Delivery::Sent),
                Err(ref err) if net::is_transient(err) => (),
                Err(err) => return Err(err),
            }
        }
        match self.push(destination, datagram) {
            Ok(_) => Ok(Delivery::Queued),
            Err(err) => {
                warn!(
                    target: TAG,
                    "Cannot queue datagram for {}, drop it: {}", destination, err
                );
                Ok(Delivery::Dropped)
            }
        }
    }

    /// Send the queued datagrams in order, until the queue is empty or the sender would block.
    ///
    /// On a hard error, the datagram which failed is dropped, and returned with the error so
    /// that the caller knows which peer is affected. Return `true` if the queue is empty.
    pub fn flush_to<S: DatagramSender>(
        &mut self,
        sender: &mut S,
    ) -> Result<bool, (SocketAddrV4, io::Error)> {
        while let Some((destination, datagram)) = self.datagrams.pop_front() {
            match sender.send_datagram(&datagram, destination) {
                Ok(_) => self.size -= datagram.len(),
                Err(ref err) if net::is_transient(err) => {
                    self.datagrams.push_front((destination, datagram));
                    return Ok(false);
                }
                Err(err) => {
                    self.size -= datagram.len();
                    return Err((destination, err));
                }
            }
        }
        Ok(true)
    }

    pub fn clear(&mut self) {
        self.datagrams.clear();
        self.size = 0;
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    // Mock datagram socket to be used in other tests
    pub struct MockDatagramSocket {
        sent: Vec<(SocketAddrV4, Vec<u8>)>,
        budget: usize,
        fail_for: Option<SocketAddrV4>,
    }

    impl MockDatagramSocket {
        pub fn new(budget: usize) -> Self {
            Self {
                sent: Vec::new(),
                budget,
                fail_for: None,
            }
        }

        pub fn failing_for(destination: SocketAddrV4) -> Self {
            Self {
                sent: Vec::new(),
                budget: usize::MAX,
                fail_for: Some(destination),
            }
        }

        pub fn sent(&self) -> &[(SocketAddrV4, Vec<u8>)] {
            &self.sent
        }

        pub fn grant(&mut self, budget: usize) {
            self.budget += budget;
        }
    }

    impl DatagramSender for MockDatagramSocket {
        fn send_datagram(&mut self, buf: &[u8], destination: SocketAddrV4) -> io::Result<usize> {
            if self.fail_for == Some(destination) {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            if self.budget == 0 {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            self.budget -= 1;
            self.sent.push((destination, buf.to_vec()));
            Ok(buf.len())
        }
    }

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    #[test]
    fn send_immediately_when_queue_is_empty() {
        let mut queue = DatagramQueue::new(1024);
        let mut socket = MockDatagramSocket::new(1);
        let delivery = queue.send_or_queue(&mut socket, addr(1), b"a").unwrap();
        assert_eq!(Delivery::Sent, delivery);
        assert!(queue.is_empty());
        assert_eq!(&[(addr(1), b"a".to_vec())], socket.sent());
    }

    #[test]
    fn queue_on_would_block_and_flush_in_order() {
        let mut queue = DatagramQueue::new(1024);
        let mut socket = MockDatagramSocket::new(0);
        assert_eq!(
            Delivery::Queued,
            queue.send_or_queue(&mut socket, addr(1), b"a").unwrap()
        );
        socket.grant(1);
        // must not overtake the queued datagram
        assert_eq!(
            Delivery::Queued,
            queue.send_or_queue(&mut socket, addr(2), b"b").unwrap()
        );
        assert!(socket.sent().is_empty());
        assert_eq!(2, queue.len());

        assert!(!queue.flush_to(&mut socket).unwrap());
        assert_eq!(&[(addr(1), b"a".to_vec())], socket.sent());

        socket.grant(10);
        assert!(queue.flush_to(&mut socket).unwrap());
        assert_eq!(
            &[(addr(1), b"a".to_vec()), (addr(2), b"b".to_vec())],
            socket.sent()
        );
    }

    #[test]
    fn drop_when_full() {
        let mut queue = DatagramQueue::new(4);
        let mut socket = MockDatagramSocket::new(0);
        assert_eq!(
            Delivery::Queued,
            queue.send_or_queue(&mut socket, addr(1), b"abc").unwrap()
        );
        assert_eq!(
            Delivery::Dropped,
            queue.send_or_queue(&mut socket, addr(1), b"de").unwrap()
        );
        assert_eq!(1, queue.len());
    }

    #[test]
    fn hard_error_reports_destination() {
        let mut queue = DatagramQueue::new(1024);
        queue.push(addr(1), b"a").unwrap();
        queue.push(addr(2), b"b").unwrap();
        queue.push(addr(3), b"c").unwrap();

        let mut socket = MockDatagramSocket::failing_for(addr(2));
        match queue.flush_to(&mut socket) {
            Err((destination, _)) => assert_eq!(addr(2), destination),
            Ok(_) => panic!("Flush should fail"),
        }
        assert_eq!(&[(addr(1), b"a".to_vec())], socket.sent());

        // the failed datagram is dropped, the next one is still queued
        assert!(queue.flush_to(&mut socket).unwrap());
        assert_eq!(addr(3), socket.sent()[1].0);
    }
}
