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

use crate::core::buffer::ByteCursor;
use crate::core::http1::cookie::{parse_cookie_header, parse_set_cookie};
use crate::core::http1::multipart::decode_multipart_into;
use crate::core::http1::params::{add_param_or_raw, decode_params_into, from_json};
use crate::core::http1::request::{Method, Request};
use crate::core::http1::util::{header_contains_param, header_params, parse_as_int};
use log::{debug, warn};

pub const CHUNK_SIZE_MAX: usize = 0xffff;
pub const CHUNKED_TERMINATOR: &[u8] = b"0\r\n\r\n";

// longest chunk size line we wait for, extensions included
const CHUNK_HEADER_SIZE_MAX: usize = 1024;

pub const DEFAULT_MAX_HEADERS_SIZE: usize = 10_000;
pub const DEFAULT_MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("invalid request line")]
    InvalidRequestLine,

    #[error("unknown method")]
    UnknownMethod,

    #[error("invalid version")]
    InvalidVersion,

    #[error("invalid content length")]
    InvalidContentLength,

    #[error("unsupported transfer encoding")]
    UnsupportedTransferEncoding,

    #[error("invalid chunk size")]
    InvalidChunkSize,

    #[error("invalid chunk framing")]
    InvalidChunkFraming,

    #[error("both transfer-encoding and content-length present")]
    ConflictingFraming,

    #[error("headers too large")]
    HeadersTooLarge,

    #[error("body too large")]
    BodyTooLarge,
}

#[derive(Debug, Clone, Copy)]
pub struct ParseLimits {
    pub max_headers_size: usize,
    pub max_body_size: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_headers_size: DEFAULT_MAX_HEADERS_SIZE,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

#[derive(Debug)]
pub enum ParseOutcome {
    NeedMoreData,
    RequestComplete(Box<Request>),
    ProtocolError(Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    RequestLine,
    Headers,
    ChunkSize,
    ChunkData(usize),
    ChunkDataEnd,
    ChunkTrailer,
    Body(usize),
    BodyLines,
    Failed,
}

enum Step {
    Continue,
    NeedMoreData,
    Complete,
}

/// Resumable HTTP/1.x request parser. Bytes are buffered across calls to
/// `feed` and nothing is consumed until a whole line, chunk header or body
/// span is available. Bytes following a complete request stay buffered for
/// the next one.
pub struct RequestParser {
    buf: ByteCursor,
    state: State,
    req: Option<Request>,
    limits: ParseLimits,
    headers_size: usize,
    peer_addr: Option<String>,
    secure: bool,
    error: Option<Error>,
}

impl RequestParser {
    pub fn new(limits: ParseLimits) -> Self {
        Self {
            buf: ByteCursor::new(),
            state: State::RequestLine,
            req: None,
            limits,
            headers_size: 0,
            peer_addr: None,
            secure: false,
            error: None,
        }
    }

    /// Address and TLS status of the peer, used for request metadata.
    pub fn set_peer(&mut self, peer_addr: Option<String>, secure: bool) {
        self.peer_addr = peer_addr;
        self.secure = secure;
    }

    pub fn has_buffered(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Hand over any bytes buffered past the last complete request, e.g.
    /// after a protocol upgrade.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        self.buf.take_up_to(usize::MAX)
    }

    pub fn feed(&mut self, data: &[u8]) -> ParseOutcome {
        if let Some(e) = &self.error {
            return ParseOutcome::ProtocolError(e.clone());
        }

        self.buf.push(data);

        loop {
            let ret = match self.state {
                State::RequestLine => self.process_request_line(),
                State::Headers => self.process_header_line(),
                State::ChunkSize => self.process_chunk_size(),
                State::ChunkData(left) => Ok(self.process_body_data(left, true)),
                State::ChunkDataEnd => self.process_chunk_data_end(),
                State::ChunkTrailer => self.process_chunk_trailer(),
                State::Body(left) => Ok(self.process_body_data(left, false)),
                State::BodyLines => self.process_body_line(),
                State::Failed => Err(Error::InvalidRequestLine),
            };

            match ret {
                Ok(Step::Continue) => {}
                Ok(Step::NeedMoreData) => return ParseOutcome::NeedMoreData,
                Ok(Step::Complete) => {
                    return match self.finish_request() {
                        Some(req) => ParseOutcome::RequestComplete(Box::new(req)),
                        None => ParseOutcome::NeedMoreData,
                    }
                }
                Err(e) => {
                    debug!("request parse error: {}", e);

                    self.state = State::Failed;
                    self.error = Some(e.clone());

                    return ParseOutcome::ProtocolError(e);
                }
            }
        }
    }

    fn need_header_line(&mut self) -> Result<Option<String>, Error> {
        let line = match self.buf.read_line() {
            Some(line) => line,
            None => {
                if self.headers_size + self.buf.len() > self.limits.max_headers_size {
                    return Err(Error::HeadersTooLarge);
                }

                return Ok(None);
            }
        };

        self.headers_size += line.len() + 2;

        if self.headers_size > self.limits.max_headers_size {
            return Err(Error::HeadersTooLarge);
        }

        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    fn process_request_line(&mut self) -> Result<Step, Error> {
        let line = match self.need_header_line()? {
            Some(line) => line,
            None => return Ok(Step::NeedMoreData),
        };

        // tolerate empty lines between requests
        if line.trim().is_empty() {
            self.headers_size = 0;
            return Ok(Step::Continue);
        }

        let parts: Vec<&str> = line.split_whitespace().collect();

        let (method, target, version) = match parts.as_slice() {
            [method, target] => (*method, *target, (1, 1)),
            [method, target, version] => (*method, *target, parse_version(version)?),
            _ => return Err(Error::InvalidRequestLine),
        };

        let method: Method = method.parse().map_err(|_| Error::UnknownMethod)?;

        self.req = Some(Request::new(method, target, version));
        self.state = State::Headers;

        Ok(Step::Continue)
    }

    fn process_header_line(&mut self) -> Result<Step, Error> {
        let line = match self.need_header_line()? {
            Some(line) => line,
            None => return Ok(Step::NeedMoreData),
        };

        if line.is_empty() {
            return self.start_body();
        }

        let req = match self.req.as_mut() {
            Some(req) => req,
            None => return Err(Error::InvalidRequestLine),
        };

        add_header_line(req, &line);

        Ok(Step::Continue)
    }

    fn start_body(&mut self) -> Result<Step, Error> {
        let req = match self.req.as_mut() {
            Some(req) => req,
            None => return Err(Error::InvalidRequestLine),
        };

        req.headers_complete = true;

        let transfer_encoding = req.headers.get("transfer-encoding");
        let content_length = req.headers.get("content-length");

        if let Some(te) = transfer_encoding {
            if content_length.is_some() {
                return Err(Error::ConflictingFraming);
            }

            if !header_contains_param(&te, "chunked", true) {
                return Err(Error::UnsupportedTransferEncoding);
            }

            self.state = State::ChunkSize;
            return Ok(Step::Continue);
        }

        if let Some(len) = content_length {
            let len = parse_as_int(&len).ok_or(Error::InvalidContentLength)?;

            if len > self.limits.max_body_size as u64 {
                return Err(Error::BodyTooLarge);
            }

            if len > 0 {
                self.state = State::Body(len as usize);
                return Ok(Step::Continue);
            }

            return Ok(Step::Complete);
        }

        if req.headers.contains("content-type") {
            self.state = State::BodyLines;
            return Ok(Step::Continue);
        }

        Ok(Step::Complete)
    }

    fn process_chunk_size(&mut self) -> Result<Step, Error> {
        let (consumed, size) = match httparse::parse_chunk_size(self.buf.remaining()) {
            Ok(httparse::Status::Complete(ret)) => ret,
            Ok(httparse::Status::Partial) => {
                if self.buf.len() > CHUNK_HEADER_SIZE_MAX {
                    return Err(Error::InvalidChunkSize);
                }

                return Ok(Step::NeedMoreData);
            }
            Err(_) => return Err(Error::InvalidChunkSize),
        };

        self.buf.advance(consumed);

        if size == 0 {
            self.state = State::ChunkTrailer;
            return Ok(Step::Continue);
        }

        let body_len = self.req.as_ref().map(|r| r.body.len()).unwrap_or(0);

        match size.checked_add(body_len as u64) {
            Some(total) if total <= self.limits.max_body_size as u64 => {}
            _ => return Err(Error::BodyTooLarge),
        }

        self.state = State::ChunkData(size as usize);

        Ok(Step::Continue)
    }

    fn process_body_data(&mut self, left: usize, chunked: bool) -> Step {
        let data = self.buf.take_up_to(left);
        let left = left - data.len();

        if let Some(req) = self.req.as_mut() {
            req.body.extend_from_slice(&data);
        }

        if left > 0 {
            self.state = if chunked {
                State::ChunkData(left)
            } else {
                State::Body(left)
            };

            return Step::NeedMoreData;
        }

        if chunked {
            self.state = State::ChunkDataEnd;
            Step::Continue
        } else {
            Step::Complete
        }
    }

    fn process_chunk_data_end(&mut self) -> Result<Step, Error> {
        if self.buf.starts_with(b"\n") {
            self.buf.advance(1);
        } else if self.buf.len() < 2 {
            if !self.buf.is_empty() && !self.buf.starts_with(b"\r") {
                return Err(Error::InvalidChunkFraming);
            }

            return Ok(Step::NeedMoreData);
        } else if self.buf.starts_with(b"\r\n") {
            self.buf.advance(2);
        } else {
            return Err(Error::InvalidChunkFraming);
        }

        self.state = State::ChunkSize;

        Ok(Step::Continue)
    }

    fn process_chunk_trailer(&mut self) -> Result<Step, Error> {
        let line = match self.need_header_line()? {
            Some(line) => line,
            None => return Ok(Step::NeedMoreData),
        };

        if line.is_empty() {
            return Ok(Step::Complete);
        }

        if let Some(req) = self.req.as_mut() {
            add_header_line(req, &line);
        }

        Ok(Step::Continue)
    }

    fn process_body_line(&mut self) -> Result<Step, Error> {
        let body_len = self.req.as_ref().map(|r| r.body.len()).unwrap_or(0);

        let line = match self.buf.read_line() {
            Some(line) => line,
            None => {
                // an unterminated line counts against the body cap too
                if body_len + self.buf.len() > self.limits.max_body_size {
                    return Err(Error::BodyTooLarge);
                }

                return Ok(Step::NeedMoreData);
            }
        };

        if line.is_empty() {
            return Ok(Step::Complete);
        }

        if body_len + line.len() + 2 > self.limits.max_body_size {
            return Err(Error::BodyTooLarge);
        }

        if let Some(req) = self.req.as_mut() {
            req.body.extend_from_slice(&line);
            req.body.extend_from_slice(b"\r\n");
        }

        Ok(Step::Continue)
    }

    fn finish_request(&mut self) -> Option<Request> {
        self.state = State::RequestLine;
        self.headers_size = 0;

        let mut req = self.req.take()?;

        req.body_complete = true;
        req.apply_metadata(self.peer_addr.as_deref(), self.secure);

        let query = req.query.clone();
        decode_params_into(&mut req.params, &query);

        decode_body_params(&mut req);

        Some(req)
    }
}

fn parse_version(s: &str) -> Result<(u8, u8), Error> {
    let v = s.strip_prefix("HTTP/").ok_or(Error::InvalidVersion)?;

    let (major, minor) = match v.find('.') {
        Some(pos) => (&v[..pos], &v[(pos + 1)..]),
        None => return Err(Error::InvalidVersion),
    };

    let major = major.parse().map_err(|_| Error::InvalidVersion)?;
    let minor = minor.parse().map_err(|_| Error::InvalidVersion)?;

    Ok((major, minor))
}

fn add_header_line(req: &mut Request, line: &str) {
    // obsolete line folding
    if line.starts_with(' ') || line.starts_with('\t') {
        match req.headers.last_value_mut() {
            Some(v) => {
                v.push(' ');
                v.push_str(line.trim());
            }
            None => debug!("ignoring folded line without a header"),
        }

        return;
    }

    let pos = match line.find(':') {
        Some(pos) => pos,
        None => {
            debug!("ignoring malformed header line");
            return;
        }
    };

    let name = line[..pos].trim();
    let value = line[(pos + 1)..].trim();

    if name.is_empty() {
        return;
    }

    if name.eq_ignore_ascii_case("cookie") {
        for (k, v) in parse_cookie_header(value) {
            req.add_cookie(k, v);
        }
    } else if name.eq_ignore_ascii_case("set-cookie") {
        if let Some((k, v)) = parse_set_cookie(value) {
            req.add_cookie(k, v);
        }
    }

    req.headers.append(name, value.to_string());
}

fn decode_body_params(req: &mut Request) {
    if req.body.is_empty() {
        return;
    }

    let (mime, ct_params) = match req.headers.get("content-type").as_deref().and_then(header_params) {
        Some(ret) => ret,
        None => return,
    };

    if mime == "application/x-www-form-urlencoded" {
        let body = String::from_utf8_lossy(&req.body).into_owned();
        decode_params_into(&mut req.params, &body);
    } else if mime.starts_with("multipart/") {
        match ct_params.iter().find(|(k, _)| k == "boundary") {
            Some((_, boundary)) => {
                decode_multipart_into(&mut req.params, &req.body, boundary, None)
            }
            None => warn!("multipart body without boundary"),
        }
    } else if mime == "application/json" || mime.ends_with("+json") {
        match serde_json::from_slice::<serde_json::Value>(&req.body) {
            Ok(serde_json::Value::Object(members)) => {
                for (name, value) in members {
                    let raw = value.to_string();

                    if let Some(value) = from_json(value) {
                        add_param_or_raw(&mut req.params, &name, value, &raw);
                    }
                }
            }
            Ok(_) => debug!("json body is not an object, no params"),
            Err(e) => warn!("invalid json body: {}", e),
        }
    }
}

/// Append `data` as a single chunk. Empty data writes nothing, since a
/// zero-size chunk ends the body.
pub fn write_chunk(data: &[u8], dest: &mut Vec<u8>) {
    if data.is_empty() {
        return;
    }

    dest.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    dest.extend_from_slice(data);
    dest.extend_from_slice(b"\r\n");
}

/// Append `data` split into chunks of at most `CHUNK_SIZE_MAX` bytes.
pub fn write_chunks(data: &[u8], dest: &mut Vec<u8>) {
    for chunk in data.chunks(CHUNK_SIZE_MAX) {
        write_chunk(chunk, dest);
    }
}
