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

pub mod error;
pub mod relay;
pub mod resolver;

pub use crate::error::{RelayError, ResolutionError, SocketError};
pub use crate::relay::{Config, Relay, RelayHandle, RemoteAddress};

/// Start relaying TCP and UDP from `config.listen()` to `config.remote()`.
///
/// The relay runs in its own thread until the returned handle is closed.
pub fn relay(config: Config) -> Result<RelayHandle, RelayError> {
    Relay::new(config).start()
}
