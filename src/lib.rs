/*
 * Copyright (C) 2020-2021 Fanout, Inc.
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

pub mod config;
pub mod connection;
pub mod core;
pub mod hpack;
pub mod http2;
pub mod server;
pub mod websocket;

use crate::config::ServerConfig;
use crate::server::{HandlerFactory, Server};
use log::info;
use std::error::Error;

pub fn run(config: ServerConfig, factory: HandlerFactory) -> Result<(), Box<dyn Error>> {
    info!("starting...");

    let mut server = Server::bind(config)?;

    info!("started");

    server.run(factory)?;

    info!("stopped");

    Ok(())
}
