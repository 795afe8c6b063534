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

mod cli_args;
mod logger;

use crate::cli_args::Args;
use log::*;
use relaylib::{resolver, Config, RelayError, RemoteAddress};
use std::io;
use std::net::SocketAddrV4;
use std::process::exit;
use std::sync::mpsc;

const TAG: &str = "main";

fn run(args: &Args, host: &str, port: u16) -> Result<(), RelayError> {
    let ip = resolver::resolve(host, port)?;
    let remote = RemoteAddress::new(SocketAddrV4::new(ip, port));
    if resolver::is_hostname(host) {
        info!(target: TAG, "{} resolved to {}", host, ip);
        resolver::spawn_refresh(host.to_string(), remote.clone(), resolver::REFRESH_INTERVAL)?;
    }

    let listen = SocketAddrV4::new(args.listen_addr(), args.listen_port());
    let config = Config::new(listen, remote)
        .with_handler_capacity(args.handler_capacity())
        .with_udp_idle_timeout(args.udp_timeout());
    info!(target: TAG, "Relaying {} to {}:{}", listen, host, port);
    let mut handle = relaylib::relay(config)?;

    let (interrupted, interrupt_receiver) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = interrupted.send(());
    })
    .map_err(|err| RelayError::Io(io::Error::new(io::ErrorKind::Other, err)))?;

    // block until Ctrl+C
    let _ = interrupt_receiver.recv();
    info!(target: TAG, "Interrupted, stopping relay");
    handle.close()
}

fn main() {
    let matches = cli_args::build().get_matches();
    let args = Args::from(&matches);
    let threshold = if args.verbose() {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if let Err(err) = logger::init(threshold) {
        eprintln!("Cannot initialize logger: {}", err);
        exit(1);
    }

    let (host, port) = match (args.remote_addr(), args.remote_port()) {
        (Some(host), Some(port)) => (host, port),
        _ => {
            error!(target: TAG, "Remote address and port are required (-r and -P)");
            exit(1);
        }
    };

    if let Err(err) = run(&args, host, port) {
        error!(target: TAG, "{}", err);
        exit(1);
    }
}
