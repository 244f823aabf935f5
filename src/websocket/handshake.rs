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

use crate::core::http1::request::{Method, Request};
use crate::core::http1::util::{header_contains_param, parse_as_int};
use crate::websocket::extension::{Extension, ExtensionRegistry};
use log::debug;
use sha1::{Digest, Sha1};

pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
pub const WS_VERSION: &str = "13";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandshakeError {
    #[error("not a websocket upgrade")]
    NotUpgrade,

    #[error("websocket request must be a GET without a body")]
    InvalidRequest,

    #[error("unsupported websocket version")]
    UnsupportedVersion,

    #[error("missing Sec-WebSocket-Key")]
    MissingKey,
}

pub fn calculate_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let digest = hasher.finalize();

    base64::encode(digest)
}

/// Whether the request asks to switch to WebSocket.
pub fn is_upgrade_request(req: &Request) -> bool {
    let upgrade = match req.headers.get("upgrade") {
        Some(v) => v,
        None => return false,
    };

    let connection = match req.headers.get("connection") {
        Some(v) => v,
        None => return false,
    };

    header_contains_param(&upgrade, "websocket", true)
        && connection.to_ascii_lowercase().contains("upgrade")
}

/// Check a WebSocket upgrade request and return the accept value.
pub fn validate(req: &Request) -> Result<String, HandshakeError> {
    if !is_upgrade_request(req) {
        return Err(HandshakeError::NotUpgrade);
    }

    // some clients send "Content-Length: 0", which we'll allow.
    // chunked encoding will be rejected.
    let has_body = req.headers.contains("transfer-encoding")
        || match req.headers.get("content-length") {
            Some(v) => parse_as_int(&v) != Some(0),
            None => false,
        };

    if req.method != Method::Get || has_body {
        return Err(HandshakeError::InvalidRequest);
    }

    match req.headers.get("sec-websocket-version") {
        Some(v) if v.trim() == WS_VERSION => {}
        _ => return Err(HandshakeError::UnsupportedVersion),
    }

    let key = match req.headers.get("sec-websocket-key") {
        Some(v) if !v.trim().is_empty() => v,
        _ => return Err(HandshakeError::MissingKey),
    };

    Ok(calculate_accept(key.trim()))
}

pub fn accept_response(accept: &str, extensions: &[Box<dyn Extension>]) -> Vec<u8> {
    let mut s = String::from(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n",
    );

    s.push_str(&format!("Sec-WebSocket-Accept: {}\r\n", accept));

    if !extensions.is_empty() {
        let values: Vec<String> = extensions.iter().map(|e| e.response_header()).collect();

        s.push_str(&format!("Sec-WebSocket-Extensions: {}\r\n", values.join(", ")));
    }

    s.push_str("\r\n");

    s.into_bytes()
}

/// 400 response listing what the server supports.
pub fn refuse_response(registry: &ExtensionRegistry) -> Vec<u8> {
    let mut s = String::from("HTTP/1.1 400 Bad Request\r\n");

    if !registry.is_empty() {
        s.push_str(&format!(
            "Sec-WebSocket-Extensions: {}\r\n",
            registry.names().join(", ")
        ));
    }

    s.push_str(&format!("Sec-WebSocket-Version: {}\r\n", WS_VERSION));
    s.push_str("Content-Length: 0\r\nConnection: close\r\n\r\n");

    s.into_bytes()
}

/// A successful handshake: the 101 response to send and the extensions
/// negotiated for the connection.
pub struct Accepted {
    pub response: Vec<u8>,
    pub extensions: Vec<Box<dyn Extension>>,
}

pub fn handshake(req: &Request, registry: &ExtensionRegistry) -> Result<Accepted, HandshakeError> {
    let accept = validate(req)?;

    let extensions = match req.headers.get("sec-websocket-extensions") {
        Some(v) => registry.negotiate(&v),
        None => Vec::new(),
    };

    debug!(
        "websocket handshake accepted, extensions={:?}",
        extensions.iter().map(|e| e.name()).collect::<Vec<&str>>()
    );

    let response = accept_response(&accept, &extensions);

    Ok(Accepted {
        response,
        extensions,
    })
}
