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

use super::byte_buffer::ByteBuffer;
use super::selector::Readiness;

/// Transfer direction of a connection pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// local (client) to remote
    Upstream,
    /// remote to local (client)
    Downstream,
}

/// What a direction is waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    Init,
    Reading,
    Writing,
    ReadWriting,
}

impl WaitStatus {
    pub fn is_reading(self) -> bool {
        self == WaitStatus::Reading || self == WaitStatus::ReadWriting
    }

    pub fn is_writing(self) -> bool {
        self == WaitStatus::Writing || self == WaitStatus::ReadWriting
    }
}

/// State of the two directions of a connection pair, with their pending writes.
///
/// A `Flow` never touches the sockets: it only tells which readiness each of the two sockets must
/// be interested in.
pub struct Flow {
    upstream: WaitStatus,
    downstream: WaitStatus,
    // pending writes to the local socket (downstream)
    to_local: ByteBuffer,
    // pending writes to the remote socket (upstream)
    to_remote: ByteBuffer,
}

impl Flow {
    pub fn new() -> Self {
        Self {
            upstream: WaitStatus::Reading,
            downstream: WaitStatus::Reading,
            to_local: ByteBuffer::new(),
            to_remote: ByteBuffer::new(),
        }
    }

    pub fn status(&self, direction: Direction) -> WaitStatus {
        match direction {
            Direction::Upstream => self.upstream,
            Direction::Downstream => self.downstream,
        }
    }

    /// Change the status of `direction`.
    ///
    /// Return `true` if it changed, i.e. if the interests of the sockets must be recomputed.
    pub fn update(&mut self, direction: Direction, status: WaitStatus) -> bool {
        let current = match direction {
            Direction::Upstream => &mut self.upstream,
            Direction::Downstream => &mut self.downstream,
        };
        if *current == status {
            return false;
        }
        *current = status;
        true
    }

    /// Interests of the local (client) socket.
    pub fn local_interest(&self) -> Readiness {
        let mut interest = Readiness::ERROR;
        if self.downstream.is_writing() {
            interest |= Readiness::WRITABLE;
        }
        // strictly reading: no more data is accepted from the client while upstream is blocked
        if self.upstream == WaitStatus::Reading {
            interest |= Readiness::READABLE;
        }
        interest
    }

    /// Interests of the remote socket.
    pub fn remote_interest(&self) -> Readiness {
        let mut interest = Readiness::ERROR;
        if self.downstream.is_reading() {
            interest |= Readiness::READABLE;
        }
        if self.upstream.is_writing() {
            interest |= Readiness::WRITABLE;
        }
        interest
    }

    /// Pending writes of `direction`, i.e. to the remote socket for `Upstream`.
    pub fn pending(&self, direction: Direction) -> &ByteBuffer {
        match direction {
            Direction::Upstream => &self.to_remote,
            Direction::Downstream => &self.to_local,
        }
    }

    pub fn pending_mut(&mut self, direction: Direction) -> &mut ByteBuffer {
        match direction {
            Direction::Upstream => &mut self.to_remote,
            Direction::Downstream => &mut self.to_local,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initially_both_sides_read() {
        let flow = Flow::new();
        assert_eq!(WaitStatus::Reading, flow.status(Direction::Upstream));
        assert_eq!(WaitStatus::Reading, flow.status(Direction::Downstream));
        assert_eq!(Readiness::READABLE | Readiness::ERROR, flow.local_interest());
        assert_eq!(Readiness::READABLE | Readiness::ERROR, flow.remote_interest());
    }

    #[test]
    fn update_same_status_is_noop() {
        let mut flow = Flow::new();
        assert!(!flow.update(Direction::Upstream, WaitStatus::Reading));
        assert!(flow.update(Direction::Upstream, WaitStatus::Writing));
        assert!(!flow.update(Direction::Upstream, WaitStatus::Writing));
    }

    #[test]
    fn upstream_blocked() {
        let mut flow = Flow::new();
        flow.update(Direction::Upstream, WaitStatus::Writing);
        // stop reading from the client, wait for the remote to be writable
        assert_eq!(Readiness::ERROR, flow.local_interest());
        assert_eq!(
            Readiness::READABLE | Readiness::WRITABLE | Readiness::ERROR,
            flow.remote_interest()
        );
    }

    #[test]
    fn downstream_blocked() {
        let mut flow = Flow::new();
        flow.update(Direction::Downstream, WaitStatus::Writing);
        // stop reading from the remote, wait for the client to be writable
        assert_eq!(
            Readiness::READABLE | Readiness::WRITABLE | Readiness::ERROR,
            flow.local_interest()
        );
        assert_eq!(Readiness::ERROR, flow.remote_interest());
    }

    #[test]
    fn read_writing_upstream() {
        let mut flow = Flow::new();
        flow.update(Direction::Upstream, WaitStatus::ReadWriting);
        // the local socket requires upstream to be strictly reading
        assert_eq!(Readiness::ERROR, flow.local_interest());
        assert!(flow.remote_interest().is_writable());
    }

    #[test]
    fn init_requests_only_errors() {
        let mut flow = Flow::new();
        flow.update(Direction::Upstream, WaitStatus::Init);
        flow.update(Direction::Downstream, WaitStatus::Init);
        assert_eq!(Readiness::ERROR, flow.local_interest());
        assert_eq!(Readiness::ERROR, flow.remote_interest());
    }

    #[test]
    fn pending_buffers_per_direction() {
        let mut flow = Flow::new();
        flow.pending_mut(Direction::Upstream).append(b"up");
        flow.pending_mut(Direction::Downstream).append(b"down");
        assert_eq!(b"up", flow.pending(Direction::Upstream).peek());
        assert_eq!(b"down", flow.pending(Direction::Downstream).peek());
    }
}
