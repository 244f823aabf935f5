/*
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

use crate::core::http1::cookie::{format_http_date, is_valid_cookie_name, serialize_cookie, CookieOptions};
use crate::core::http1::protocol::{write_chunks, CHUNKED_TERMINATOR};
use crate::core::http1::request::Request;
use crate::core::http1::util::{header_contains_param, parse_as_int};
use crate::core::reactor::{write_all, TransportRef};
use log::debug;
use std::fmt::Write;
use std::io;
use time::OffsetDateTime;

pub const FLASH_PREFIX: &str = "magic_flash_";
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error("headers already sent")]
    HeadersSent,

    #[error("response already finished")]
    AlreadyFinished,

    #[error("illegal cookie name: {0:?}")]
    IllegalCookieName(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        102 => "Processing",
        103 => "Early Hints",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        207 => "Multi-Status",
        208 => "Already Reported",
        226 => "IM Used",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        421 => "Misdirected Request",
        422 => "Unprocessable Entity",
        423 => "Locked",
        424 => "Failed Dependency",
        425 => "Too Early",
        426 => "Upgrade Required",
        428 => "Precondition Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        451 => "Unavailable For Legal Reasons",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        506 => "Variant Also Negotiates",
        507 => "Insufficient Storage",
        508 => "Loop Detected",
        510 => "Not Extended",
        511 => "Network Authentication Required",
        _ => "unknown",
    }
}

fn status_allows_body(code: u16) -> bool {
    !((100..200).contains(&code) || code == 204 || code == 304)
}

/// A block of streamed output, run later by the connection's reactor.
pub type StreamBlock = Box<dyn FnOnce(&mut Response)>;

/// Response to one request.
///
/// Until the head is written, headers, cookies and body are buffered. After
/// that, headers and cookies are frozen and body writes go straight to the
/// transport, chunked when the length wasn't known up front.
pub struct Response {
    transport: TransportRef,
    status: u16,
    headers: Vec<(String, String)>,
    cookies: Vec<(String, String)>,
    body: Vec<u8>,

    version: (u8, u8),
    head_request: bool,
    keep_alive: bool,
    keep_alive_timeout: u64,

    headers_sent: bool,
    finished: bool,
    chunked: bool,
    send_body: bool,

    incoming_flash: Vec<(String, String)>,
    flash: Vec<(String, String)>,

    streaming: bool,
    blocks_outstanding: usize,
    pending_blocks: Vec<StreamBlock>,

    bytes_sent: usize,
}

impl Response {
    pub fn new(transport: TransportRef, req: &Request, keep_alive_timeout: u64) -> Self {
        let connection = req.header("connection").unwrap_or_default();

        let keep_alive = if req.version >= (1, 1) {
            !header_contains_param(&connection, "close", true)
        } else {
            header_contains_param(&connection, "keep-alive", true)
        };

        let incoming_flash = req
            .cookies
            .iter()
            .filter_map(|(name, value)| {
                name.strip_prefix(FLASH_PREFIX)
                    .map(|n| (n.to_string(), value.clone()))
            })
            .collect();

        Self {
            transport,
            status: 200,
            headers: Vec::new(),
            cookies: Vec::new(),
            body: Vec::new(),
            version: req.version,
            head_request: req.is_head(),
            keep_alive,
            keep_alive_timeout,
            headers_sent: false,
            finished: false,
            chunked: false,
            send_body: true,
            incoming_flash,
            flash: Vec::new(),
            streaming: false,
            blocks_outstanding: 0,
            pending_blocks: Vec::new(),
            bytes_sent: 0,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    fn check_mutable(&self) -> Result<(), ResponseError> {
        if self.headers_sent {
            return Err(ResponseError::HeadersSent);
        }

        Ok(())
    }

    pub fn set_status(&mut self, status: u16) -> Result<(), ResponseError> {
        self.check_mutable()?;

        self.status = status;

        Ok(())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set a header, replacing any previous value under the same name.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), ResponseError> {
        self.check_mutable()?;

        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, v)) => *v = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }

        Ok(())
    }

    pub fn remove_header(&mut self, name: &str) -> Result<(), ResponseError> {
        self.check_mutable()?;

        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));

        Ok(())
    }

    /// Set a cookie. A `None` value deletes it on the client.
    pub fn set_cookie(
        &mut self,
        name: &str,
        value: Option<&str>,
        opts: &CookieOptions,
    ) -> Result<(), ResponseError> {
        self.check_mutable()?;

        if !is_valid_cookie_name(name) {
            return Err(ResponseError::IllegalCookieName(name.to_string()));
        }

        let s = serialize_cookie(name, value, opts, OffsetDateTime::now_utc());

        match self.cookies.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = s,
            None => self.cookies.push((name.to_string(), s)),
        }

        Ok(())
    }

    pub fn delete_cookie(&mut self, name: &str) -> Result<(), ResponseError> {
        self.set_cookie(name, None, &CookieOptions::default())
    }

    /// Serialized `Set-Cookie` value queued for `name`, if any.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Flash value sent by the previous response.
    pub fn flash(&self, name: &str) -> Option<&str> {
        self.incoming_flash
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Set a flash value for the next request to see.
    pub fn set_flash(&mut self, name: &str, value: &str) -> Result<(), ResponseError> {
        self.check_mutable()?;

        if !is_valid_cookie_name(&format!("{}{}", FLASH_PREFIX, name)) {
            return Err(ResponseError::IllegalCookieName(name.to_string()));
        }

        match self.flash.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value.to_string(),
            None => self.flash.push((name.to_string(), value.to_string())),
        }

        Ok(())
    }

    /// Drop everything buffered so far, for replacing the response with an
    /// error page.
    pub fn clear(&mut self) -> Result<(), ResponseError> {
        self.check_mutable()?;

        self.status = 200;
        self.headers.clear();
        self.cookies.clear();
        self.body.clear();

        Ok(())
    }

    // incoming flash cookies not renewed are expired, new ones are set.
    // must run before the head is frozen
    fn apply_flash(&mut self) -> Result<(), ResponseError> {
        let expired: Vec<String> = self
            .incoming_flash
            .iter()
            .filter(|(name, _)| !self.flash.iter().any(|(n, _)| n == name))
            .map(|(name, _)| format!("{}{}", FLASH_PREFIX, name))
            .collect();

        for name in expired {
            if self.cookie(&name).is_none() {
                self.delete_cookie(&name)?;
            }
        }

        let opts = CookieOptions::default();

        for (name, value) in std::mem::take(&mut self.flash) {
            let cookie_name = format!("{}{}", FLASH_PREFIX, name);
            self.set_cookie(&cookie_name, Some(&value), &opts)?;
        }

        Ok(())
    }

    /// Freeze headers and cookies and serialize the response head.
    /// `content_length` is the full body size when known; otherwise the
    /// body is sent chunked, or close-delimited for HTTP/1.0 clients.
    pub fn serialize_head(&mut self, content_length: Option<usize>) -> Result<Vec<u8>, ResponseError> {
        self.check_mutable()?;

        self.apply_flash()?;

        let allows_body = status_allows_body(self.status);
        self.send_body = allows_body && !self.head_request;

        let user_length = self.header("content-length").and_then(parse_as_int);

        let mut length_header = None;
        let mut close_delimited = false;

        if allows_body && user_length.is_none() {
            match content_length {
                Some(len) => length_header = Some(len),
                None => {
                    if self.version >= (1, 1) {
                        self.chunked = true;
                    } else {
                        close_delimited = true;
                    }
                }
            }
        }

        if let Some(conn) = self.header("connection") {
            self.keep_alive = !header_contains_param(conn, "close", true);
        }

        // only closing the connection can end the body
        if close_delimited {
            self.keep_alive = false;
        }

        let own_connection = close_delimited || self.header("connection").is_none();

        let mut out = String::new();

        let _ = write!(
            out,
            "HTTP/1.1 {} {}\r\n",
            self.status,
            reason_phrase(self.status)
        );

        let _ = write!(out, "Date: {}\r\n", format_http_date(OffsetDateTime::now_utc()));

        if own_connection {
            if self.keep_alive {
                let _ = write!(
                    out,
                    "Connection: Keep-Alive\r\nKeep-Alive: timeout={}\r\n",
                    self.keep_alive_timeout
                );
            } else {
                out.push_str("Connection: close\r\n");
            }
        }

        if self.chunked {
            out.push_str("Transfer-Encoding: chunked\r\n");
        } else if let Some(len) = length_header {
            let _ = write!(out, "Content-Length: {}\r\n", len);
        }

        for (name, value) in self.headers.iter() {
            if !own_connection || !name.eq_ignore_ascii_case("connection") {
                let _ = write!(out, "{}: {}\r\n", name, value);
            }
        }

        if self.header("cache-control").is_none() {
            out.push_str("Cache-Control: max-age=0, no-cache\r\n");
        }

        for (_, value) in self.cookies.iter() {
            let _ = write!(out, "Set-Cookie: {}\r\n", value);
        }

        out.push_str("\r\n");

        self.headers_sent = true;

        Ok(out.into_bytes())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), ResponseError> {
        if data.is_empty() {
            return Ok(());
        }

        write_all(&self.transport, data)?;

        self.bytes_sent += data.len();

        Ok(())
    }

    // framed body bytes for data written after the head
    fn frame_body(&self, data: &[u8], dest: &mut Vec<u8>) {
        if !self.send_body {
            return;
        }

        if self.chunked {
            write_chunks(data, dest);
        } else {
            dest.extend_from_slice(data);
        }
    }

    /// Send the head now, with unknown body length, followed by anything
    /// buffered so far.
    pub fn write_head(&mut self) -> Result<(), ResponseError> {
        let mut out = self.serialize_head(None)?;

        let body = std::mem::take(&mut self.body);
        self.frame_body(&body, &mut out);

        self.send(&out)
    }

    /// Append body data. Buffered until the head is written, sent directly
    /// afterwards.
    pub fn write(&mut self, data: &[u8]) -> Result<(), ResponseError> {
        if self.finished {
            return Err(ResponseError::AlreadyFinished);
        }

        if !self.headers_sent {
            self.body.extend_from_slice(data);
            return Ok(());
        }

        let mut out = Vec::new();
        self.frame_body(data, &mut out);

        self.send(&out)
    }

    /// Complete the response. Closes the transport unless the connection
    /// is kept alive.
    pub fn finish(&mut self) -> Result<(), ResponseError> {
        if self.finished {
            return Err(ResponseError::AlreadyFinished);
        }

        let mut out = Vec::new();

        if !self.headers_sent {
            out = self.serialize_head(Some(self.body.len()))?;

            if self.send_body {
                out.extend_from_slice(&self.body);
            }
        } else if self.chunked && self.send_body {
            out.extend_from_slice(CHUNKED_TERMINATOR);
        }

        self.finished = true;
        self.streaming = false;

        let ret = self.send(&out);

        if !self.keep_alive {
            debug!("closing connection after response");
            self.transport.borrow_mut().close();
        }

        ret
    }

    /// Send the head right away and keep the response open for body data
    /// pushed later.
    pub fn start_streaming(&mut self) -> Result<(), ResponseError> {
        self.write_head()?;

        self.streaming = true;

        Ok(())
    }

    /// Queue a block that writes more of the body later. Streaming starts
    /// if it hasn't already.
    pub fn stream_async(&mut self, block: StreamBlock) -> Result<(), ResponseError> {
        if self.finished {
            return Err(ResponseError::AlreadyFinished);
        }

        if !self.streaming {
            self.start_streaming()?;
        }

        self.pending_blocks.push(block);
        self.blocks_outstanding += 1;

        Ok(())
    }

    pub fn blocks_outstanding(&self) -> usize {
        self.blocks_outstanding
    }

    pub(crate) fn take_pending_blocks(&mut self) -> Vec<StreamBlock> {
        std::mem::take(&mut self.pending_blocks)
    }

    pub(crate) fn block_done(&mut self) {
        self.blocks_outstanding = self.blocks_outstanding.saturating_sub(1);
    }

    /// Finish a streamed response. Returns `Ok(false)` without doing
    /// anything while streamed blocks are still outstanding.
    pub fn finish_streaming(&mut self) -> Result<bool, ResponseError> {
        if self.finished {
            return Err(ResponseError::AlreadyFinished);
        }

        if self.blocks_outstanding > 0 {
            return Ok(false);
        }

        self.finish()?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::http1::request::Method;
    use crate::core::test::MemTransport;
    use std::cell::RefCell;
    use std::rc::Rc;
    use test_log::test;

    fn request(method: Method, version: (u8, u8), headers: &[(&str, &str)]) -> Request {
        let mut req = Request::new(method, "/", version);

        for (name, value) in headers {
            req.headers.append(name, value.to_string());
        }

        req
    }

    fn setup(req: &Request) -> (Rc<RefCell<MemTransport>>, Response) {
        let (t, tref) = MemTransport::new_pair();

        (t, Response::new(tref, req, DEFAULT_KEEP_ALIVE_TIMEOUT))
    }

    // head lines minus the Date header
    fn head_lines(data: &str) -> Vec<String> {
        let head = match data.find("\r\n\r\n") {
            Some(pos) => &data[..pos],
            None => data,
        };

        head.split("\r\n")
            .filter(|l| !l.starts_with("Date: "))
            .map(|l| l.to_string())
            .collect()
    }

    fn body_of(data: &str) -> &str {
        match data.find("\r\n\r\n") {
            Some(pos) => &data[(pos + 4)..],
            None => "",
        }
    }

    #[test]
    fn buffered_response() {
        let req = request(Method::Get, (1, 1), &[]);
        let (t, mut resp) = setup(&req);

        resp.set_header("Content-Type", "text/plain").unwrap();
        resp.write(b"hello ").unwrap();
        resp.write(b"world").unwrap();
        resp.finish().unwrap();

        let out = t.borrow().written_str();

        assert_eq!(
            head_lines(&out),
            vec![
                "HTTP/1.1 200 OK",
                "Connection: Keep-Alive",
                "Keep-Alive: timeout=5",
                "Content-Length: 11",
                "Content-Type: text/plain",
                "Cache-Control: max-age=0, no-cache",
            ]
        );
        assert_eq!(body_of(&out), "hello world");
        assert!(!t.borrow().closed);
        assert_eq!(resp.bytes_sent(), out.len());
    }

    #[test]
    fn keep_alive_rules() {
        struct Test {
            name: &'static str,
            version: (u8, u8),
            req_headers: Vec<(&'static str, &'static str)>,
            resp_connection: Option<&'static str>,
            keep_alive: bool,
        }

        let tests = [
            Test {
                name: "http11-default",
                version: (1, 1),
                req_headers: vec![],
                resp_connection: None,
                keep_alive: true,
            },
            Test {
                name: "http11-close",
                version: (1, 1),
                req_headers: vec![("Connection", "close")],
                resp_connection: None,
                keep_alive: false,
            },
            Test {
                name: "http10-default",
                version: (1, 0),
                req_headers: vec![],
                resp_connection: None,
                keep_alive: false,
            },
            Test {
                name: "http10-keep-alive",
                version: (1, 0),
                req_headers: vec![("Connection", "Keep-Alive")],
                resp_connection: None,
                keep_alive: true,
            },
            Test {
                name: "explicit-response-header",
                version: (1, 1),
                req_headers: vec![],
                resp_connection: Some("close"),
                keep_alive: false,
            },
        ];

        for test in tests.iter() {
            let req = request(Method::Get, test.version, &test.req_headers);
            let (t, mut resp) = setup(&req);

            if let Some(v) = test.resp_connection {
                resp.set_header("Connection", v).unwrap();
            }

            resp.finish().unwrap();

            assert_eq!(resp.keep_alive(), test.keep_alive, "test={}", test.name);
            assert_eq!(t.borrow().closed, !test.keep_alive, "test={}", test.name);

            let out = t.borrow().written_str();
            let lines = head_lines(&out);

            if test.resp_connection.is_none() {
                let expected = if test.keep_alive {
                    "Connection: Keep-Alive"
                } else {
                    "Connection: close"
                };

                assert!(lines.iter().any(|l| l == expected), "test={}", test.name);
            }
        }
    }

    #[test]
    fn headers_freeze() {
        let req = request(Method::Get, (1, 1), &[]);
        let (_t, mut resp) = setup(&req);

        resp.write_head().unwrap();

        assert!(matches!(
            resp.set_header("X-Late", "1"),
            Err(ResponseError::HeadersSent)
        ));
        assert!(matches!(resp.remove_header("X-Late"), Err(ResponseError::HeadersSent)));
        assert!(matches!(resp.set_status(500), Err(ResponseError::HeadersSent)));
        assert!(matches!(
            resp.set_cookie("a", Some("b"), &CookieOptions::default()),
            Err(ResponseError::HeadersSent)
        ));
        assert!(matches!(resp.set_flash("n", "v"), Err(ResponseError::HeadersSent)));
        assert!(matches!(resp.write_head(), Err(ResponseError::HeadersSent)));
    }

    #[test]
    fn double_finish() {
        let req = request(Method::Get, (1, 1), &[]);
        let (_t, mut resp) = setup(&req);

        resp.finish().unwrap();

        assert!(matches!(resp.finish(), Err(ResponseError::AlreadyFinished)));
        assert!(matches!(resp.write(b"x"), Err(ResponseError::AlreadyFinished)));
    }

    #[test]
    fn illegal_cookie_name() {
        let req = request(Method::Get, (1, 1), &[]);
        let (_t, mut resp) = setup(&req);

        assert!(matches!(
            resp.set_cookie("bad name", Some("v"), &CookieOptions::default()),
            Err(ResponseError::IllegalCookieName(_))
        ));
    }

    #[test]
    fn chunked_after_head() {
        let req = request(Method::Get, (1, 1), &[]);
        let (t, mut resp) = setup(&req);

        resp.write(b"early").unwrap();
        resp.write_head().unwrap();
        resp.write(b"later").unwrap();
        resp.finish().unwrap();

        let out = t.borrow().written_str();

        assert!(head_lines(&out).contains(&"Transfer-Encoding: chunked".to_string()));
        assert_eq!(body_of(&out), "5\r\nearly\r\n5\r\nlater\r\n0\r\n\r\n");
    }

    #[test]
    fn http10_close_delimited() {
        let req = request(Method::Get, (1, 0), &[("Connection", "keep-alive")]);
        let (t, mut resp) = setup(&req);

        resp.write_head().unwrap();
        resp.write(b"data").unwrap();
        resp.finish().unwrap();

        let out = t.borrow().written_str();
        let lines = head_lines(&out);

        assert!(!lines.iter().any(|l| l.starts_with("Transfer-Encoding")));
        assert!(lines.contains(&"Connection: close".to_string()));
        assert_eq!(body_of(&out), "data");
        assert!(t.borrow().closed);
    }

    #[test]
    fn http10_close_delimited_overrides_keep_alive() {
        let req = request(Method::Get, (1, 0), &[("Connection", "keep-alive")]);
        let (t, mut resp) = setup(&req);

        resp.set_header("Connection", "keep-alive").unwrap();
        resp.write_head().unwrap();
        resp.write(b"data").unwrap();
        resp.finish().unwrap();

        let out = t.borrow().written_str();
        let lines = head_lines(&out);

        assert!(!lines.iter().any(|l| l.starts_with("Content-Length")));
        assert!(!lines.iter().any(|l| l.starts_with("Transfer-Encoding")));
        assert!(!lines.contains(&"Connection: keep-alive".to_string()));
        assert!(lines.contains(&"Connection: close".to_string()));
        assert_eq!(body_of(&out), "data");
        assert!(!resp.keep_alive());
        assert!(t.borrow().closed);
    }

    #[test]
    fn http10_known_length_keeps_alive() {
        let req = request(Method::Get, (1, 0), &[("Connection", "keep-alive")]);
        let (t, mut resp) = setup(&req);

        resp.set_header("Connection", "keep-alive").unwrap();
        resp.write(b"data").unwrap();
        resp.finish().unwrap();

        let out = t.borrow().written_str();
        let lines = head_lines(&out);

        assert!(lines.contains(&"Content-Length: 4".to_string()));
        assert!(lines.contains(&"Connection: keep-alive".to_string()));
        assert!(resp.keep_alive());
        assert!(!t.borrow().closed);
    }

    #[test]
    fn no_body_statuses() {
        for (method, status) in [(Method::Get, 204), (Method::Get, 304), (Method::Head, 200)] {
            let req = request(method, (1, 1), &[]);
            let (t, mut resp) = setup(&req);

            resp.set_status(status).unwrap();
            resp.write(b"ignored").unwrap();
            resp.finish().unwrap();

            let out = t.borrow().written_str();

            assert_eq!(body_of(&out), "", "status={}", status);

            let has_length = head_lines(&out).iter().any(|l| l.starts_with("Content-Length"));
            assert_eq!(has_length, method == Method::Head, "status={}", status);
        }
    }

    #[test]
    fn cookies_and_flash() {
        let mut req = request(Method::Get, (1, 1), &[]);
        req.cookies.push(("magic_flash_notice".to_string(), "saved".to_string()));
        req.cookies.push(("magic_flash_keep".to_string(), "old".to_string()));

        let (t, mut resp) = setup(&req);

        assert_eq!(resp.flash("notice"), Some("saved"));
        assert_eq!(resp.flash("missing"), None);

        resp.set_flash("keep", "new").unwrap();
        resp.set_cookie("sid", Some("x y"), &CookieOptions {
            max_age: Some(10),
            ..Default::default()
        })
        .unwrap();
        resp.finish().unwrap();

        let out = t.borrow().written_str();
        let cookies: Vec<String> = head_lines(&out)
            .into_iter()
            .filter(|l| l.starts_with("Set-Cookie: "))
            .collect();

        assert_eq!(cookies.len(), 3);
        assert_eq!(cookies[0], "Set-Cookie: sid=x%20y; Max-Age=10; Path=/");
        assert!(cookies[1].starts_with("Set-Cookie: magic_flash_notice=deleted; Expires="));
        assert!(cookies[2].starts_with("Set-Cookie: magic_flash_keep=new; Expires="));
    }

    #[test]
    fn streaming_blocks() {
        let req = request(Method::Get, (1, 1), &[]);
        let (t, mut resp) = setup(&req);

        resp.stream_async(Box::new(|r: &mut Response| {
            r.write(b"one").unwrap();
        }))
        .unwrap();

        assert!(resp.is_streaming());
        assert!(resp.headers_sent());
        assert_eq!(resp.blocks_outstanding(), 1);

        // finishing waits for the block
        assert!(!resp.finish_streaming().unwrap());
        assert!(!resp.is_finished());

        for block in resp.take_pending_blocks() {
            block(&mut resp);
            resp.block_done();
        }

        assert!(resp.finish_streaming().unwrap());
        assert!(resp.is_finished());

        let out = t.borrow().written_str();
        assert_eq!(body_of(&out), "3\r\none\r\n0\r\n\r\n");
    }

    #[test]
    fn reason_phrases() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(418), "unknown");
        assert_eq!(reason_phrase(511), "Network Authentication Required");
    }
}
