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

use chrono::prelude::Local;
use log::*;
use std::fmt;
use std::io::{self, Write};

static LOGGER: SimpleLogger = SimpleLogger;

pub struct SimpleLogger;

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let date = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        // write errors are ignored
        let _ = if record.level() == Level::Error {
            write_record(&mut io::stderr().lock(), &date, record)
        } else {
            write_record(&mut io::stdout().lock(), &date, record)
        };
    }

    fn flush(&self) {
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();
    }
}

fn write_record<W: Write, D: fmt::Display>(out: &mut W, date: &D, record: &Record) -> io::Result<()> {
    writeln!(
        out,
        "{} {:<5} {}: {}",
        date,
        record.level(),
        record.target(),
        record.args()
    )
}

pub fn init(threshold: LevelFilter) -> Result<(), SetLoggerError> {
    set_max_level(threshold);
    set_logger(&LOGGER)
}
