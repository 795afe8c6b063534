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

use std::error;
use std::fmt;
use std::io;
use std::net::SocketAddrV4;
use std::time::Duration;

/// Relay-level failures.
///
/// Faults affecting a single connection pair or UDP session never show up here: they are logged
/// and contained by the handler that owns the sockets.
#[derive(Debug)]
pub enum RelayError {
    Bind(SocketError),
    Listen(SocketError),
    Registration(io::Error),
    AlreadyRegistered,
    ShutdownTimeout(Duration),
    Resolution(ResolutionError),
    Io(io::Error),
}

#[derive(Debug)]
pub struct SocketError {
    addr: SocketAddrV4,
    error: io::Error,
}

#[derive(Debug)]
pub struct ResolutionError {
    host: String,
    error: io::Error,
}

impl SocketError {
    pub fn new(addr: SocketAddrV4, error: io::Error) -> Self {
        Self { addr, error }
    }

    pub fn addr(&self) -> SocketAddrV4 {
        self.addr
    }
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.addr, self.error)
    }
}

impl error::Error for SocketError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&self.error)
    }
}

impl ResolutionError {
    pub fn new<S: Into<String>>(host: S, error: io::Error) -> Self {
        Self {
            host: host.into(),
            error,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Cannot resolve \"{}\": {}", self.host, self.error)
    }
}

impl error::Error for ResolutionError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&self.error)
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            RelayError::Bind(ref err) => write!(f, "Cannot bind {}", err),
            RelayError::Listen(ref err) => write!(f, "Cannot listen on {}", err),
            RelayError::Registration(ref err) => write!(f, "Cannot register on poll: {}", err),
            RelayError::AlreadyRegistered => write!(f, "Already registered on an event loop"),
            RelayError::ShutdownTimeout(timeout) => {
                write!(f, "Event loop did not stop within {:?}", timeout)
            }
            RelayError::Resolution(ref err) => write!(f, "{}", err),
            RelayError::Io(ref err) => write!(f, "IO error: {}", err),
        }
    }
}

impl error::Error for RelayError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            RelayError::Bind(ref err) | RelayError::Listen(ref err) => Some(err),
            RelayError::Registration(ref err) | RelayError::Io(ref err) => Some(err),
            RelayError::Resolution(ref err) => Some(err),
            RelayError::AlreadyRegistered | RelayError::ShutdownTimeout(_) => None,
        }
    }
}

impl From<ResolutionError> for RelayError {
    fn from(error: ResolutionError) -> Self {
        RelayError::Resolution(error)
    }
}

impl From<io::Error> for RelayError {
    fn from(error: io::Error) -> Self {
        RelayError::Io(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::net::Ipv4Addr;

    #[test]
    fn display_bind_error() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 19001);
        let io_error = io::Error::new(io::ErrorKind::AddrInUse, "address in use");
        let err = RelayError::Bind(SocketError::new(addr, io_error));
        assert_eq!("Cannot bind 127.0.0.1:19001: address in use", err.to_string());
        assert!(err.source().is_some());
    }

    #[test]
    fn shutdown_timeout_has_no_source() {
        let err = RelayError::ShutdownTimeout(Duration::from_secs(15));
        assert!(err.source().is_none());
    }
}
