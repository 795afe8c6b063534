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

use std::io;

use super::net;

/// Bytes of a stream waiting for their destination to become writable.
///
/// Data is only ever appended at the end and consumed from the front.
pub struct ByteBuffer {
    buf: Vec<u8>,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn peek(&self) -> &[u8] {
        &self.buf
    }

    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn consume(&mut self, length: usize) {
        assert!(self.buf.len() >= length);
        // Before:
        //
        //  consumed                  old_len
        // |        |....................|
        //  <------>
        //   length
        //
        // After:
        //
        //                  new_len (= old_len - length)
        // |....................|
        self.buf.copy_within(length.., 0);
        let remaining = self.buf.len() - length;
        self.buf.truncate(remaining);
    }

    /// Write `data` to `destination` in a single attempt, keeping what could not be written.
    ///
    /// If some bytes are already pending, `data` is queued behind them and the pending bytes are
    /// written first. Return `true` if nothing remains pending.
    pub fn write_through<W: io::Write>(
        &mut self,
        destination: &mut W,
        data: &[u8],
    ) -> io::Result<bool> {
        if !self.is_empty() {
            self.append(data);
            return self.flush_to(destination);
        }
        match destination.write(data) {
            Ok(w) => self.append(&data[w..]),
            Err(ref err) if net::is_transient(err) => self.append(data),
            Err(err) => return Err(err),
        }
        Ok(self.is_empty())
    }

    /// Write the pending bytes to `destination` in a single attempt.
    ///
    /// Return `true` if nothing remains pending.
    pub fn flush_to<W: io::Write>(&mut self, destination: &mut W) -> io::Result<bool> {
        if self.is_empty() {
            return Ok(true);
        }
        match destination.write(&self.buf) {
            Ok(w) => self.consume(w),
            Err(ref err) if net::is_transient(err) => (),
            Err(err) => return Err(err),
        }
        Ok(self.is_empty())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// Writer accepting a limited number of bytes before blocking.
    pub struct MockStream {
        data: Vec<u8>,
        budget: usize,
        fail: bool,
    }

    impl MockStream {
        pub fn new(budget: usize) -> Self {
            Self {
                data: Vec::new(),
                budget,
                fail: false,
            }
        }

        pub fn broken() -> Self {
            Self {
                data: Vec::new(),
                budget: 0,
                fail: true,
            }
        }

        pub fn data(&self) -> &[u8] {
            &self.data
        }

        pub fn grant(&mut self, budget: usize) {
            self.budget += budget;
        }
    }

    impl io::Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail {
                return Err(io::Error::from(io::ErrorKind::ConnectionReset));
            }
            if self.budget == 0 {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let len = self.budget.min(buf.len());
            self.data.extend_from_slice(&buf[..len]);
            self.budget -= len;
            Ok(len)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn produce_consume_byte_buffer() {
        let mut byte_buffer = ByteBuffer::new();
        byte_buffer.append(b"hello, world!");
        assert_eq!(b"hello, world!", byte_buffer.peek());

        byte_buffer.consume(7);
        assert_eq!(b"world!", byte_buffer.peek());

        byte_buffer.append(b"hello");
        assert_eq!(b"world!hello", byte_buffer.peek());
    }

    #[test]
    fn complete_write_leaves_nothing_pending() {
        let mut byte_buffer = ByteBuffer::new();
        let mut stream = MockStream::new(1024);
        assert!(byte_buffer.write_through(&mut stream, b"ping").unwrap());
        assert_eq!(b"ping", stream.data());
        assert!(byte_buffer.is_empty());
    }

    #[test]
    fn partial_write_keeps_unsent_suffix() {
        let mut byte_buffer = ByteBuffer::new();
        let mut stream = MockStream::new(3);
        assert!(!byte_buffer.write_through(&mut stream, b"abcdefgh").unwrap());
        assert_eq!(b"abc", stream.data());
        assert_eq!(b"defgh", byte_buffer.peek());
    }

    #[test]
    fn would_block_keeps_everything() {
        let mut byte_buffer = ByteBuffer::new();
        let mut stream = MockStream::new(0);
        assert!(!byte_buffer.write_through(&mut stream, b"abc").unwrap());
        assert!(stream.data().is_empty());
        assert_eq!(b"abc", byte_buffer.peek());
    }

    #[test]
    fn pending_bytes_are_flushed_before_newer_data() {
        let mut byte_buffer = ByteBuffer::new();
        let mut stream = MockStream::new(2);
        assert!(!byte_buffer.write_through(&mut stream, b"0123").unwrap());
        assert_eq!(b"23", byte_buffer.peek());

        // newer data while still blocked is queued behind the pending bytes
        assert!(!byte_buffer.write_through(&mut stream, b"45").unwrap());
        assert_eq!(b"2345", byte_buffer.peek());

        stream.grant(3);
        assert!(!byte_buffer.flush_to(&mut stream).unwrap());
        assert_eq!(b"01234", stream.data());

        stream.grant(16);
        assert!(byte_buffer.flush_to(&mut stream).unwrap());
        assert_eq!(b"012345", stream.data());
        assert!(byte_buffer.is_empty());
    }

    #[test]
    fn flush_empty_buffer() {
        let mut byte_buffer = ByteBuffer::new();
        let mut stream = MockStream::broken();
        assert!(byte_buffer.flush_to(&mut stream).unwrap());
    }

    #[test]
    fn hard_error_is_reported() {
        let mut byte_buffer = ByteBuffer::new();
        let mut stream = MockStream::broken();
        assert!(byte_buffer.write_through(&mut stream, b"abc").is_err());
    }
}
