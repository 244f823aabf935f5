/*
 * Copyright (C) 2023 Fastly, Inc.
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

use crate::core::http1::protocol::{
    ParseLimits, DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_HEADERS_SIZE,
};
use crate::core::http1::response::DEFAULT_KEEP_ALIVE_TIMEOUT;
use crate::hpack::DEFAULT_TABLE_SIZE;
use crate::websocket::{ExtensionRegistry, DEFAULT_FRAME_SIZE_LIMIT};
use config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "ferrohttp.conf";

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen: String,
    pub keep_alive_timeout: u64,
    pub ws_ping_interval: u64,
    pub ws_pong_interval: u64,
    pub message_size_limit: usize,
    pub frame_size_limit: usize,
    pub hpack_table_size: usize,
    pub max_headers_size: usize,
    pub max_body_size: usize,
    pub log_level: u8,

    #[serde(skip, default = "ExtensionRegistry::with_defaults")]
    pub extensions: ExtensionRegistry,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: String::from("0.0.0.0:3000"),
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
            ws_ping_interval: 45,
            ws_pong_interval: 0,
            message_size_limit: 0,
            frame_size_limit: DEFAULT_FRAME_SIZE_LIMIT,
            hpack_table_size: DEFAULT_TABLE_SIZE,
            max_headers_size: DEFAULT_MAX_HEADERS_SIZE,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            log_level: 2,
            extensions: ExtensionRegistry::with_defaults(),
        }
    }
}

impl From<ServerConfig> for config::ValueKind {
    fn from(server: ServerConfig) -> Self {
        let mut properties = std::collections::HashMap::new();
        properties.insert("listen".to_string(), config::Value::from(server.listen));
        properties.insert(
            "keep_alive_timeout".to_string(),
            config::Value::from(server.keep_alive_timeout),
        );
        properties.insert(
            "ws_ping_interval".to_string(),
            config::Value::from(server.ws_ping_interval),
        );
        properties.insert(
            "ws_pong_interval".to_string(),
            config::Value::from(server.ws_pong_interval),
        );
        properties.insert(
            "message_size_limit".to_string(),
            config::Value::from(server.message_size_limit as u64),
        );
        properties.insert(
            "frame_size_limit".to_string(),
            config::Value::from(server.frame_size_limit as u64),
        );
        properties.insert(
            "hpack_table_size".to_string(),
            config::Value::from(server.hpack_table_size as u64),
        );
        properties.insert(
            "max_headers_size".to_string(),
            config::Value::from(server.max_headers_size as u64),
        );
        properties.insert(
            "max_body_size".to_string(),
            config::Value::from(server.max_body_size as u64),
        );
        properties.insert(
            "log_level".to_string(),
            config::Value::from(server.log_level as u64),
        );

        Self::Table(properties)
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    server: ServerConfig,
}

impl ServerConfig {
    pub fn new(config_file: &Path) -> Result<ServerConfig, ConfigError> {
        let path = config_file.to_string_lossy();

        Self::build(File::with_name(&path).format(FileFormat::Ini))
    }

    /// Parse settings from INI text. Missing settings take their defaults.
    pub fn from_ini_str(s: &str) -> Result<ServerConfig, ConfigError> {
        Self::build(File::from_str(s, FileFormat::Ini))
    }

    fn build<T>(source: T) -> Result<ServerConfig, ConfigError>
    where
        T: config::Source + Send + Sync + 'static,
    {
        let config = Config::builder()
            .add_source(source)
            .set_default("server", ServerConfig::default())?
            .build()?;

        let c: ConfigFile = config.try_deserialize()?;

        if c.server.log_level > 4 {
            return Err(ConfigError::Message(format!(
                "log_level must be between 0 and 4, got {}",
                c.server.log_level
            )));
        }

        Ok(c.server)
    }

    pub fn parse_limits(&self) -> ParseLimits {
        ParseLimits {
            max_headers_size: self.max_headers_size,
            max_body_size: self.max_body_size,
        }
    }

    /// `None` when pings are disabled.
    pub fn ping_interval(&self) -> Option<Duration> {
        if self.ws_ping_interval > 0 {
            Some(Duration::from_secs(self.ws_ping_interval))
        } else {
            None
        }
    }

    /// Interval for unsolicited pongs, used as a one-way heartbeat. `None`
    /// when disabled.
    pub fn pong_interval(&self) -> Option<Duration> {
        if self.ws_pong_interval > 0 {
            Some(Duration::from_secs(self.ws_pong_interval))
        } else {
            None
        }
    }
}

pub fn get_config_file(
    work_dir: &Path,
    arg_config: Option<PathBuf>,
) -> Result<PathBuf, Box<dyn Error>> {
    let mut config_files: Vec<PathBuf> = vec![];
    match arg_config {
        Some(x) => config_files.push(x),
        None => {
            // ./config
            config_files.push(work_dir.join("config").join(CONFIG_FILE_NAME));
            // working dir
            config_files.push(work_dir.join(CONFIG_FILE_NAME));
        }
    }

    let mut config_file = "";
    for cf in config_files.iter() {
        if cf.is_file() {
            config_file = cf.to_str().unwrap_or("");
            break;
        }
    }

    if config_file.is_empty() {
        return Err(format!(
            "no configuration file found. Tried: {}",
            config_files
                .iter()
                .map(|path_buf| path_buf.display().to_string())
                .collect::<Vec<String>>()
                .join(" ")
        )
        .into());
    }

    Ok(config_file.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use test_log::test;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "ferrohttp-config-{}-{}",
            name,
            std::process::id()
        ));

        fs::create_dir_all(dir.join("config")).unwrap();

        dir
    }

    #[test]
    fn defaults() {
        let c = ServerConfig::from_ini_str("").unwrap();

        assert_eq!(c.listen, "0.0.0.0:3000");
        assert_eq!(c.keep_alive_timeout, 5);
        assert_eq!(c.ws_ping_interval, 45);
        assert_eq!(c.message_size_limit, 0);
        assert_eq!(c.frame_size_limit, 17_895_697);
        assert_eq!(c.hpack_table_size, 4096);
        assert_eq!(c.max_headers_size, 10_000);
        assert_eq!(c.max_body_size, 16 * 1024 * 1024);
        assert_eq!(c.log_level, 2);
        assert_eq!(c.extensions.names(), vec!["permessage-deflate"]);
        assert_eq!(c.ping_interval(), Some(Duration::from_secs(45)));
        assert_eq!(c.pong_interval(), None);
    }

    #[test]
    fn overrides() {
        let c = ServerConfig::from_ini_str(
            "[server]\n\
             listen=127.0.0.1:8080\n\
             ws_ping_interval=0\n\
             ws_pong_interval=30\n\
             message_size_limit=1024\n\
             max_headers_size=2000\n",
        )
        .unwrap();

        assert_eq!(c.listen, "127.0.0.1:8080");
        assert_eq!(c.ping_interval(), None);
        assert_eq!(c.pong_interval(), Some(Duration::from_secs(30)));
        assert_eq!(c.message_size_limit, 1024);
        assert_eq!(c.parse_limits().max_headers_size, 2000);
        assert_eq!(c.parse_limits().max_body_size, 16 * 1024 * 1024);

        // untouched settings keep their defaults
        assert_eq!(c.keep_alive_timeout, 5);
    }

    #[test]
    fn invalid_values() {
        assert!(ServerConfig::from_ini_str("[server]\nlog_level=9\n").is_err());
        assert!(ServerConfig::from_ini_str("[server]\nkeep_alive_timeout=soon\n").is_err());
    }

    #[test]
    fn load_file() {
        let dir = test_dir("load");
        let path = dir.join("config").join(CONFIG_FILE_NAME);
        fs::write(&path, "[server]\nkeep_alive_timeout=30\n").unwrap();

        let c = ServerConfig::new(&path).unwrap();
        assert_eq!(c.keep_alive_timeout, 30);

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn config_file_lookup() {
        struct TestArgs {
            name: &'static str,
            create: Option<PathBuf>,
            input: Option<PathBuf>,
            output: Result<PathBuf, String>,
        }

        let dir = test_dir("lookup");
        let in_config = dir.join("config").join(CONFIG_FILE_NAME);
        let in_work_dir = dir.join(CONFIG_FILE_NAME);
        let missing = dir.join("missing.conf");

        let test_args = vec![
            TestArgs {
                name: "explicit path",
                create: Some(in_work_dir.clone()),
                input: Some(in_work_dir.clone()),
                output: Ok(in_work_dir.clone()),
            },
            TestArgs {
                name: "config dir preferred",
                create: Some(in_config.clone()),
                input: None,
                output: Ok(in_config.clone()),
            },
            TestArgs {
                name: "explicit path missing",
                create: None,
                input: Some(missing.clone()),
                output: Err(format!(
                    "no configuration file found. Tried: {}",
                    missing.display()
                )),
            },
        ];

        for test_arg in test_args.iter() {
            if let Some(p) = &test_arg.create {
                fs::write(p, "").unwrap();
            }

            match get_config_file(&dir, test_arg.input.clone()) {
                Ok(p) => assert_eq!(
                    Ok(p),
                    test_arg.output,
                    "test={}",
                    test_arg.name
                ),
                Err(e) => assert_eq!(
                    Err(e.to_string()),
                    test_arg.output,
                    "test={}",
                    test_arg.name
                ),
            }
        }

        fs::remove_dir_all(dir).unwrap();
    }
}
