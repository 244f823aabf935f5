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
//! A small blocking WebSocket client, mainly for exercising servers.

use super::handshake::{calculate_accept, WS_VERSION};
use super::{
    encode_message, write_frame, Error, Event, FrameParser, Message, CONTROL_FRAME_PAYLOAD_MAX,
    OPCODE_BINARY, OPCODE_CLOSE, OPCODE_PING, OPCODE_PONG, OPCODE_TEXT,
};
use crate::core::buffer::ByteCursor;
use log::debug;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use url::Url;

const HEADERS_MAX: usize = 64;
const RESPONSE_HEAD_MAX: usize = 16_384;
const READ_SIZE: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("url has no host")]
    MissingHost,

    #[error("invalid handshake response")]
    InvalidResponse,

    #[error("upgrade refused with status {0}")]
    Refused(u16),

    #[error("Sec-WebSocket-Accept mismatch")]
    AcceptMismatch,

    #[error("connection closed during handshake")]
    HandshakeClosed,

    #[error(transparent)]
    WebSocket(#[from] Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A random `Sec-WebSocket-Key`.
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();

    base64::encode(nonce)
}

/// The client's upgrade request and the check of the server's reply.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    key: String,
    request: Vec<u8>,
}

impl ClientHandshake {
    pub fn new(url: &Url, headers: &[(&str, &str)]) -> Result<Self, ClientError> {
        Self::with_key(url, headers, generate_key())
    }

    pub fn with_key(url: &Url, headers: &[(&str, &str)], key: String) -> Result<Self, ClientError> {
        let origin_scheme = match url.scheme() {
            "ws" | "http" => "http",
            "wss" | "https" => "https",
            s => return Err(ClientError::UnsupportedScheme(s.to_string())),
        };

        let host = url.host_str().ok_or(ClientError::MissingHost)?;

        let host_header = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let mut target = url.path().to_string();

        if target.is_empty() {
            target.push('/');
        }

        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }

        let mut request = format!(
            "GET {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Origin: {}://{}\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: {}\r\n",
            target, host_header, origin_scheme, host, key, WS_VERSION
        );

        for (name, value) in headers {
            request.push_str(&format!("{}: {}\r\n", name, value));
        }

        request.push_str("\r\n");

        Ok(Self {
            key,
            request: request.into_bytes(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn request(&self) -> &[u8] {
        &self.request
    }

    /// Check the server's reply at the start of `buf`. Returns the size of
    /// the response head once complete, or `None` if more data is needed.
    pub fn check_response(&self, buf: &[u8]) -> Result<Option<usize>, ClientError> {
        let mut headers = [httparse::EMPTY_HEADER; HEADERS_MAX];
        let mut resp = httparse::Response::new(&mut headers);

        let size = match resp.parse(buf) {
            Ok(httparse::Status::Complete(size)) => size,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => {
                debug!("bad handshake response: {}", e);
                return Err(ClientError::InvalidResponse);
            }
        };

        let code = resp.code.ok_or(ClientError::InvalidResponse)?;

        if code != 101 {
            return Err(ClientError::Refused(code));
        }

        let accept = resp
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("sec-websocket-accept"))
            .map(|h| String::from_utf8_lossy(h.value).trim().to_string());

        match accept {
            Some(accept) if accept == calculate_accept(&self.key) => Ok(Some(size)),
            _ => Err(ClientError::AcceptMismatch),
        }
    }
}

/// A connected client. Outgoing frames are masked with a fresh key each.
pub struct Client<S> {
    stream: S,
    parser: FrameParser,
    input: ByteCursor,
    close_sent: bool,
    eof: bool,
}

impl Client<TcpStream> {
    /// Connect to a `ws://` url and complete the handshake.
    pub fn connect(url: &str) -> Result<Self, ClientError> {
        let url = Url::parse(url)?;

        if url.scheme() != "ws" {
            return Err(ClientError::UnsupportedScheme(url.scheme().to_string()));
        }

        let host = url.host_str().ok_or(ClientError::MissingHost)?;
        let port = url.port_or_known_default().unwrap_or(80);

        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;

        let handshake = ClientHandshake::new(&url, &[])?;

        Self::handshake(stream, &handshake)
    }
}

impl<S: Read + Write> Client<S> {
    /// Send the upgrade request over `stream` and wait for the reply.
    pub fn handshake(mut stream: S, handshake: &ClientHandshake) -> Result<Self, ClientError> {
        stream.write_all(handshake.request())?;
        stream.flush()?;

        let mut head = Vec::new();
        let mut buf = [0; READ_SIZE];

        let size = loop {
            if let Some(size) = handshake.check_response(&head)? {
                break size;
            }

            if head.len() > RESPONSE_HEAD_MAX {
                return Err(ClientError::InvalidResponse);
            }

            let n = stream.read(&mut buf)?;

            if n == 0 {
                return Err(ClientError::HandshakeClosed);
            }

            head.extend_from_slice(&buf[..n]);
        };

        debug!("websocket client connected");

        let mut input = ByteCursor::new();

        // frames may follow the reply in the same read
        input.push(&head[size..]);

        Ok(Self {
            stream,
            parser: FrameParser::new(0),
            input,
            close_sent: false,
            eof: false,
        })
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn is_closed(&self) -> bool {
        self.close_sent || self.eof
    }

    fn send(&mut self, opcode: u8, payload: &[u8]) -> Result<(), ClientError> {
        if self.close_sent {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
        }

        let mask: [u8; 4] = rand::random();

        let mut out = Vec::new();
        encode_message(opcode, payload, 0, 0, Some(mask), &mut out);

        self.stream.write_all(&out)?;
        self.stream.flush()?;

        Ok(())
    }

    fn send_control(&mut self, opcode: u8, payload: &[u8]) -> Result<(), ClientError> {
        if payload.len() > CONTROL_FRAME_PAYLOAD_MAX {
            return Err(Error::InvalidControlFrame.into());
        }

        self.send(opcode, payload)
    }

    pub fn send_text(&mut self, text: &str) -> Result<(), ClientError> {
        self.send(OPCODE_TEXT, text.as_bytes())
    }

    pub fn send_binary(&mut self, data: &[u8]) -> Result<(), ClientError> {
        self.send(OPCODE_BINARY, data)
    }

    pub fn ping(&mut self, payload: &[u8]) -> Result<(), ClientError> {
        self.send_control(OPCODE_PING, payload)
    }

    /// Start the close handshake. Further `recv` calls drain the
    /// connection until the server's close arrives.
    pub fn close(&mut self) -> Result<(), ClientError> {
        if self.close_sent {
            return Ok(());
        }

        let mask: [u8; 4] = rand::random();

        let mut out = Vec::new();
        write_frame(true, 0, OPCODE_CLOSE, &[], Some(mask), &mut out);

        self.close_sent = true;

        self.stream.write_all(&out)?;
        self.stream.flush()?;

        Ok(())
    }

    /// Wait for the next message. Pings are answered along the way.
    /// Returns `None` once the connection has closed.
    pub fn recv(&mut self) -> Result<Option<Message>, ClientError> {
        let mut buf = [0; READ_SIZE];

        loop {
            let event = match self.parser.parse(&mut self.input, &mut [])? {
                Some(event) => event,
                None => {
                    if self.eof {
                        return Ok(None);
                    }

                    let size = self.stream.read(&mut buf)?;

                    if size == 0 {
                        self.eof = true;
                    } else {
                        self.input.push(&buf[..size]);
                    }

                    continue;
                }
            };

            match event {
                Event::Message(msg) => return Ok(Some(msg)),
                Event::Ping(payload) => {
                    if !self.close_sent {
                        self.send_control(OPCODE_PONG, &payload)?;
                    }
                }
                Event::Pong(_) => {}
                Event::Close(_) => {
                    debug!("websocket client received close");

                    self.close()?;
                    self.eof = true;

                    return Ok(None);
                }
            }
        }
    }
}
