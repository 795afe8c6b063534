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

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::net::Ipv4Addr;
use std::time::Duration;

pub const DEFAULT_LISTEN_PORT: u16 = 9001;
pub const DEFAULT_HANDLER_CAPACITY: usize = 2048;

pub fn build() -> Command {
    Command::new("portrelay")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Relay the TCP and UDP traffic of a local port to a remote address")
        .arg(
            Arg::new("listen-addr")
                .short('l')
                .long("listen-addr")
                .value_name("IPV4")
                .value_parser(value_parser!(Ipv4Addr))
                .default_value("0.0.0.0")
                .help("Local address to listen on"),
        )
        .arg(
            Arg::new("listen-port")
                .short('p')
                .long("listen-port")
                .value_name("PORT")
                .value_parser(value_parser!(u16).range(1..))
                .default_value("9001")
                .help("Local port to listen on, for both TCP and UDP"),
        )
        .arg(
            Arg::new("remote-addr")
                .short('r')
                .long("remote-addr")
                .value_name("HOST")
                .help("Remote IPv4 address or hostname"),
        )
        .arg(
            Arg::new("remote-port")
                .short('P')
                .long("remote-port")
                .value_name("PORT")
                .value_parser(value_parser!(u16).range(1..))
                .help("Remote port"),
        )
        .arg(
            Arg::new("handler-capacity")
                .long("handler-capacity")
                .value_name("COUNT")
                .value_parser(value_parser!(usize))
                .default_value("2048")
                .help("Expected number of simultaneous connections (not a limit)"),
        )
        .arg(
            Arg::new("udp-timeout")
                .long("udp-timeout")
                .value_name("SECONDS")
                .value_parser(value_parser!(u64).range(1..))
                .help("Close UDP sessions idle for this delay (never by default)"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable debug logs"),
        )
}

#[derive(Clone, Debug)]
pub struct Args {
    listen_addr: Ipv4Addr,
    listen_port: u16,
    remote_addr: Option<String>,
    remote_port: Option<u16>,
    handler_capacity: usize,
    udp_timeout: Option<Duration>,
    verbose: bool,
}

impl Args {
    pub fn listen_addr(&self) -> Ipv4Addr {
        self.listen_addr
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    pub fn remote_port(&self) -> Option<u16> {
        self.remote_port
    }

    pub fn handler_capacity(&self) -> usize {
        self.handler_capacity
    }

    pub fn udp_timeout(&self) -> Option<Duration> {
        self.udp_timeout
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }
}

impl From<&ArgMatches> for Args {
    fn from(matches: &ArgMatches) -> Self {
        Self {
            listen_addr: matches
                .get_one::<Ipv4Addr>("listen-addr")
                .copied()
                .unwrap_or(Ipv4Addr::UNSPECIFIED),
            listen_port: matches
                .get_one::<u16>("listen-port")
                .copied()
                .unwrap_or(DEFAULT_LISTEN_PORT),
            remote_addr: matches.get_one::<String>("remote-addr").cloned(),
            remote_port: matches.get_one::<u16>("remote-port").copied(),
            handler_capacity: matches
                .get_one::<usize>("handler-capacity")
                .copied()
                .unwrap_or(DEFAULT_HANDLER_CAPACITY),
            udp_timeout: matches
                .get_one::<u64>("udp-timeout")
                .map(|&seconds| Duration::from_secs(seconds)),
            verbose: matches.get_flag("verbose"),
        }
    }
}
