/*
 * Copyright (C) 2020-2022 Fanout, Inc.
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

use clap::Parser;
use ferrohttp::config::{get_config_file, ServerConfig};
use ferrohttp::connection::{Handler, HandlerResult};
use ferrohttp::core::http1::params::encode_params;
use ferrohttp::core::http1::request::Request;
use ferrohttp::core::http1::response::Response;
use ferrohttp::core::log::{
    ensure_init_simple_logger, get_simple_logger, level_filter, local_offset_check,
};
use ferrohttp::server::HandlerFactory;
use ferrohttp::websocket::{Message, WebSocket, WebSocketHandler};
use log::{debug, info};
use std::env;
use std::error::Error;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "ferrohttp",
    version,
    about = "HTTP/1.1 server with WebSocket support."
)]
struct CliArgs {
    /// Set path to the configuration file
    #[arg(short, long, value_name = "file")]
    config: Option<PathBuf>,

    /// Override the listen address (host:port)
    #[arg(long, value_name = "addr")]
    listen: Option<String>,

    /// Set log level (0=error, 1=warn, 2=info, 3=debug, 4=trace)
    #[arg(short = 'L', long, value_name = "x", value_parser = clap::value_parser!(u8).range(0..=4))]
    loglevel: Option<u8>,

    /// Set path to the log file
    #[arg(short = 'l', long, value_name = "file")]
    logfile: Option<PathBuf>,
}

struct DemoHandler;

impl Handler for DemoHandler {
    fn on_request(
        &mut self,
        req: &Request,
        resp: &mut Response,
    ) -> Result<HandlerResult, Box<dyn Error>> {
        match req.path.as_str() {
            "/" => Ok(HandlerResult::Body(format!(
                "hello from ferrohttp, {}\n",
                req.client_ip.as_deref().unwrap_or("stranger")
            ))),
            "/params" => {
                resp.set_header("Content-Type", "application/x-www-form-urlencoded")?;

                Ok(HandlerResult::Body(encode_params(&req.params)))
            }
            "/stream" => {
                resp.set_header("Content-Type", "text/plain")?;

                for i in 1..=3 {
                    resp.stream_async(Box::new(move |r: &mut Response| {
                        if let Err(e) = r.write(format!("part {}\n", i).as_bytes()) {
                            debug!("stream write failed: {}", e);
                        }
                    }))?;
                }

                Ok(HandlerResult::Done)
            }
            _ => Ok(HandlerResult::NotFound),
        }
    }

    fn on_upgrade(&mut self, req: &Request) -> Option<Box<dyn WebSocketHandler>> {
        if req.path == "/echo" {
            Some(Box::new(EchoHandler))
        } else {
            None
        }
    }
}

struct EchoHandler;

impl WebSocketHandler for EchoHandler {
    fn on_message(&mut self, ws: &mut WebSocket, msg: Message) {
        let ret = match msg {
            Message::Text(s) => ws.send_text(&s),
            Message::Binary(b) => ws.send_binary(&b),
        };

        if let Err(e) = ret {
            debug!("echo failed: {}", e);
        }
    }
}

fn load_config(args: &CliArgs) -> Result<ServerConfig, Box<dyn Error>> {
    let work_dir = env::current_dir()?;

    let mut config = match get_config_file(&work_dir, args.config.clone()) {
        Ok(path) => {
            let config = ServerConfig::new(&path)?;
            info!("using config: {}", path.display());

            config
        }
        // an explicit file must exist
        Err(e) if args.config.is_some() => return Err(e),
        Err(_) => ServerConfig::default(),
    };

    if let Some(listen) = &args.listen {
        config.listen = listen.clone();
    }

    if let Some(level) = args.loglevel {
        config.log_level = level;
    }

    Ok(config)
}

fn process_args_and_run(args: CliArgs) -> Result<(), Box<dyn Error>> {
    let log_file = match &args.logfile {
        Some(path) => match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => Some(f),
            Err(e) => {
                eprintln!("unable to open log file: {}. logging to standard out.", e);
                None
            }
        },
        None => None,
    };

    ensure_init_simple_logger(log_file);
    log::set_logger(get_simple_logger())?;

    // until the config is read
    log::set_max_level(level_filter(args.loglevel.unwrap_or(2)));

    let config = load_config(&args)?;

    log::set_max_level(level_filter(config.log_level));

    local_offset_check();

    let factory: HandlerFactory = Arc::new(|| -> Box<dyn Handler> { Box::new(DemoHandler) });

    ferrohttp::run(config, factory)
}

fn main() {
    let args = CliArgs::parse();

    if let Err(e) = process_args_and_run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
