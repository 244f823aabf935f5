/*
 * Copyright (C) 2020-2023 Fanout, Inc.
 * Copyright (C) 2024 Fastly, Inc.
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

use crate::core::http1::util::parse_header_value;
use crate::websocket::{Error, OPCODE_BINARY, OPCODE_TEXT};
use log::debug;
use miniz_oxide::deflate;
use miniz_oxide::inflate::stream::{inflate, InflateState};
use miniz_oxide::{DataFormat, MZError, MZFlush, MZStatus};
use std::fmt;
use std::fmt::Write;
use std::sync::Arc;

pub const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

pub const RSV1: u8 = 0x40;

const DEFAULT_MAX_WINDOW_BITS: u8 = 15;
const DEFLATE_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

// smaller messages are not worth compressing
const COMPRESS_MIN: usize = 64;

const STREAM_BUF_SIZE: usize = 16_384;

/// A negotiated per-connection WebSocket extension.
///
/// Extensions transform message payloads and claim some of the reserved
/// header bits. They hold per-connection state and are never shared.
pub trait Extension {
    fn name(&self) -> &str;

    /// Value for the `Sec-WebSocket-Extensions` response header.
    fn response_header(&self) -> String;

    /// Reserved bits (as positioned in the first header byte) this
    /// extension may set.
    fn rsv_bits(&self) -> u8;

    /// Transform an outgoing data message. Returns the new payload and the
    /// reserved bits to set on its first frame.
    fn encode(&mut self, opcode: u8, payload: Vec<u8>) -> Result<(Vec<u8>, u8), Error>;

    /// Transform an incoming message whose first frame carried `rsv`.
    /// `limit` caps the output size, 0 meaning unlimited.
    fn decode(&mut self, rsv: u8, payload: Vec<u8>, limit: usize) -> Result<Vec<u8>, Error>;
}

/// Builds an extension from the parameters a client offered, or returns
/// `None` if the offer can't be accepted.
pub type ExtensionFactory =
    Arc<dyn Fn(&[(String, String)]) -> Option<Box<dyn Extension>> + Send + Sync>;

/// Extensions the server is willing to negotiate, by name.
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    factories: Vec<(String, ExtensionFactory)>,
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry offering `permessage-deflate`.
    pub fn with_defaults() -> Self {
        let mut r = Self::new();

        r.register(PERMESSAGE_DEFLATE, Arc::new(permessage_deflate_factory));

        r
    }

    /// Add or replace the factory for `name`.
    pub fn register(&mut self, name: &str, factory: ExtensionFactory) {
        let name = name.to_ascii_lowercase();

        match self.factories.iter_mut().find(|(n, _)| *n == name) {
            Some((_, f)) => *f = factory,
            None => self.factories.push((name, factory)),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Accept offers from a `Sec-WebSocket-Extensions` header value. The
    /// first acceptable offer per name wins, and an extension whose
    /// reserved bits clash with one already accepted is skipped.
    pub fn negotiate(&self, header: &str) -> Vec<Box<dyn Extension>> {
        let mut accepted: Vec<Box<dyn Extension>> = Vec::new();

        for offer in parse_header_value(header) {
            let (name, params) = match offer {
                Ok(offer) => offer,
                Err(_) => {
                    debug!("malformed extension offer, ignoring rest");
                    break;
                }
            };

            let name = name.to_ascii_lowercase();

            let factory = match self.factories.iter().find(|(n, _)| *n == name) {
                Some((_, f)) => f,
                None => continue,
            };

            if accepted.iter().any(|e| e.name() == name) {
                continue;
            }

            let mut owned = Vec::new();
            let mut valid = true;

            for p in params {
                match p {
                    Ok((k, v)) => owned.push((k.to_string(), v.to_string())),
                    Err(_) => {
                        valid = false;
                        break;
                    }
                }
            }

            if !valid {
                continue;
            }

            if let Some(ext) = factory(&owned) {
                let used = accepted.iter().fold(0, |acc, e| acc | e.rsv_bits());

                if ext.rsv_bits() & used != 0 {
                    debug!("extension {} rsv bits in use, skipping", name);
                    continue;
                }

                accepted.push(ext);
            }
        }

        accepted
    }
}

fn parse_empty(s: &str, dest: &mut bool) -> Result<(), Error> {
    // must not be set yet and value must be empty
    if *dest || !s.is_empty() {
        return Err(Error::InvalidExtensionParams);
    }

    *dest = true;

    Ok(())
}

// set default to allow the param with no value
fn parse_bits(s: &str, dest: &mut Option<u8>, default: Option<u8>) -> Result<(), Error> {
    if dest.is_some() {
        return Err(Error::InvalidExtensionParams);
    }

    if s.is_empty() {
        if let Some(x) = default {
            *dest = Some(x);
            return Ok(());
        }
    }

    let x: u8 = s.parse().map_err(|_| Error::InvalidExtensionParams)?;

    if (8..=15).contains(&x) {
        *dest = Some(x);
        return Ok(());
    }

    Err(Error::InvalidExtensionParams)
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerMessageDeflateConfig {
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool,
    pub client_max_window_bits: u8,
    pub server_max_window_bits: u8,
}

impl PerMessageDeflateConfig {
    pub fn from_params(params: &[(String, String)]) -> Result<Self, Error> {
        let mut client_no_context_takeover = false;
        let mut server_no_context_takeover = false;
        let mut client_max_window_bits = None;
        let mut server_max_window_bits = None;

        for (k, v) in params {
            match k.as_str() {
                "client_no_context_takeover" => parse_empty(v, &mut client_no_context_takeover)?,
                "server_no_context_takeover" => parse_empty(v, &mut server_no_context_takeover)?,
                "client_max_window_bits" => parse_bits(v, &mut client_max_window_bits, Some(15))?,
                "server_max_window_bits" => parse_bits(v, &mut server_max_window_bits, None)?,
                _ => return Err(Error::InvalidExtensionParams),
            }
        }

        Ok(Self {
            client_no_context_takeover,
            server_no_context_takeover,
            client_max_window_bits: client_max_window_bits.unwrap_or(DEFAULT_MAX_WINDOW_BITS),
            server_max_window_bits: server_max_window_bits.unwrap_or(DEFAULT_MAX_WINDOW_BITS),
        })
    }

    /// The server's answer to a client offer. Fails if the client asks for
    /// a smaller server window, which we don't support.
    pub fn create_response(&self) -> Result<Self, Error> {
        if self.server_max_window_bits != DEFAULT_MAX_WINDOW_BITS {
            return Err(Error::InvalidExtensionParams);
        }

        Ok(Self {
            client_no_context_takeover: self.client_no_context_takeover,
            server_no_context_takeover: self.server_no_context_takeover,
            client_max_window_bits: DEFAULT_MAX_WINDOW_BITS,
            server_max_window_bits: DEFAULT_MAX_WINDOW_BITS,
        })
    }

    pub fn serialize(&self) -> String {
        let mut out = String::from(PERMESSAGE_DEFLATE);

        if self.client_no_context_takeover {
            out.push_str("; client_no_context_takeover");
        }

        if self.server_no_context_takeover {
            out.push_str("; server_no_context_takeover");
        }

        if self.client_max_window_bits != DEFAULT_MAX_WINDOW_BITS {
            let _ = write!(out, "; client_max_window_bits={}", self.client_max_window_bits);
        }

        if self.server_max_window_bits != DEFAULT_MAX_WINDOW_BITS {
            let _ = write!(out, "; server_max_window_bits={}", self.server_max_window_bits);
        }

        out
    }
}

impl Default for PerMessageDeflateConfig {
    fn default() -> Self {
        Self {
            client_no_context_takeover: false,
            server_no_context_takeover: false,
            client_max_window_bits: DEFAULT_MAX_WINDOW_BITS,
            server_max_window_bits: DEFAULT_MAX_WINDOW_BITS,
        }
    }
}

fn permessage_deflate_factory(params: &[(String, String)]) -> Option<Box<dyn Extension>> {
    let offer = match PerMessageDeflateConfig::from_params(params) {
        Ok(config) => config,
        Err(e) => {
            debug!("rejecting permessage-deflate offer: {}", e);
            return None;
        }
    };

    let config = offer.create_response().ok()?;

    Some(Box::new(PerMessageDeflate::new(config)))
}

/// `permessage-deflate` (RFC 7692) using raw DEFLATE streams.
pub struct PerMessageDeflate {
    config: PerMessageDeflateConfig,
    enc: Box<deflate::core::CompressorOxide>,
    dec: Box<InflateState>,
}

impl PerMessageDeflate {
    pub fn new(config: PerMessageDeflateConfig) -> Self {
        let mut enc = Box::new(deflate::core::CompressorOxide::default());

        enc.set_format_and_level(
            DataFormat::Raw,
            deflate::CompressionLevel::DefaultLevel as u8,
        );

        Self {
            config,
            enc,
            dec: InflateState::new_boxed(DataFormat::Raw),
        }
    }

    pub fn config(&self) -> &PerMessageDeflateConfig {
        &self.config
    }

    fn compress(&mut self, src: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(src.len() / 2 + 16);
        let mut buf = vec![0; STREAM_BUF_SIZE];
        let mut input = src;

        loop {
            let result = deflate::stream::deflate(&mut self.enc, input, &mut buf, MZFlush::Sync);

            match result.status {
                Ok(MZStatus::Ok) | Ok(MZStatus::StreamEnd) | Err(MZError::Buf) => {}
                _ => return Err(Error::CompressionError),
            }

            out.extend_from_slice(&buf[..result.bytes_written]);
            input = &input[result.bytes_consumed..];

            if input.is_empty() && result.bytes_written < buf.len() {
                break;
            }

            if result.bytes_consumed == 0 && result.bytes_written == 0 {
                return Err(Error::CompressionError);
            }
        }

        if out.ends_with(&DEFLATE_SUFFIX) {
            out.truncate(out.len() - DEFLATE_SUFFIX.len());
        }

        if self.config.server_no_context_takeover {
            self.enc.reset();
        }

        Ok(out)
    }

    fn decompress(&mut self, src: &[u8], limit: usize) -> Result<Vec<u8>, Error> {
        let mut data = Vec::with_capacity(src.len() + DEFLATE_SUFFIX.len());
        data.extend_from_slice(src);
        data.extend_from_slice(&DEFLATE_SUFFIX);

        let mut out = Vec::new();
        let mut buf = vec![0; STREAM_BUF_SIZE];
        let mut input = &data[..];

        loop {
            let result = inflate(&mut self.dec, input, &mut buf, MZFlush::None);

            match result.status {
                Ok(MZStatus::Ok) | Ok(MZStatus::StreamEnd) | Err(MZError::Buf) => {}
                _ => return Err(Error::CompressionError),
            }

            out.extend_from_slice(&buf[..result.bytes_written]);
            input = &input[result.bytes_consumed..];

            if limit > 0 && out.len() > limit {
                return Err(Error::MessageTooLarge);
            }

            if input.is_empty() && result.bytes_written < buf.len() {
                break;
            }

            if result.bytes_consumed == 0 && result.bytes_written == 0 {
                return Err(Error::CompressionError);
            }
        }

        if self.config.client_no_context_takeover {
            self.dec.reset(DataFormat::Raw);
        }

        Ok(out)
    }
}

impl Extension for PerMessageDeflate {
    fn name(&self) -> &str {
        PERMESSAGE_DEFLATE
    }

    fn response_header(&self) -> String {
        self.config.serialize()
    }

    fn rsv_bits(&self) -> u8 {
        RSV1
    }

    fn encode(&mut self, opcode: u8, payload: Vec<u8>) -> Result<(Vec<u8>, u8), Error> {
        if (opcode != OPCODE_TEXT && opcode != OPCODE_BINARY) || payload.len() < COMPRESS_MIN {
            return Ok((payload, 0));
        }

        Ok((self.compress(&payload)?, RSV1))
    }

    fn decode(&mut self, rsv: u8, payload: Vec<u8>, limit: usize) -> Result<Vec<u8>, Error> {
        if rsv & RSV1 == 0 {
            return Ok(payload);
        }

        self.decompress(&payload, limit)
    }
}
