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
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::ResolutionError;
use crate::relay::RemoteAddress;

const TAG: &str = "resolver";

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Resolve `host` to an IPv4 address. An IPv4 literal is returned as is.
pub fn resolve(host: &str, port: u16) -> Result<Ipv4Addr, ResolutionError> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|err| ResolutionError::new(host, err))?;
    for addr in addrs {
        if let SocketAddr::V4(addr) = addr {
            return Ok(*addr.ip());
        }
    }
    Err(ResolutionError::new(
        host,
        io::Error::new(io::ErrorKind::NotFound, "no IPv4 address"),
    ))
}

/// Tell whether `host` must be resolved, i.e. is not an IP literal.
pub fn is_hostname(host: &str) -> bool {
    host.parse::<IpAddr>().is_err()
}

/// Re-resolve `host` every `interval`, and store the result in `remote`.
///
/// New connections and sessions use the refreshed address, existing ones are not affected. On
/// failure, the last address is kept.
pub fn spawn_refresh(
    host: String,
    remote: RemoteAddress,
    interval: Duration,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(String::from("resolver"))
        .spawn(move || loop {
            thread::sleep(interval);
            refresh(&host, &remote);
        })
}

fn refresh(host: &str, remote: &RemoteAddress) {
    match resolve(host, remote.port()) {
        Ok(ip) => {
            let previous = *remote.get().ip();
            if previous != ip {
                info!(target: TAG, "{} now resolves to {} (was {})", host, ip, previous);
                remote.set_ip(ip);
            } else {
                debug!(target: TAG, "{} still resolves to {}", host, ip);
            }
        }
        Err(err) => {
            error!(
                target: TAG,
                "{}, keeping {}",
                err,
                remote.get().ip()
            );
        }
    }
}
