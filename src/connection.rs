/*
 * Copyright (C) 2020-2023 Fanout, Inc.
 * Copyright (C) 2023-2024 Fastly, Inc.
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

//! Per-connection protocol driver.
//!
//! A connection starts out speaking HTTP/1.x and may switch to WebSocket
//! (after a successful handshake) or HTTP/2 (after an `h2c` upgrade, or
//! immediately if the client opens with the HTTP/2 preface). The caller
//! owns the socket: it passes received bytes to [`Connection::on_data`],
//! runs the reactor, and calls [`Connection::resume`] after reactor work
//! so that pipelined requests held back by a streamed response proceed.

use crate::config::ServerConfig;
use crate::core::buffer::ByteCursor;
use crate::core::http1::request::{Method, Request};
use crate::core::http1::response::{Response, ResponseError};
use crate::core::http1::util::header_contains_param;
use crate::core::http1::{ParseOutcome, RequestParser};
use crate::core::reactor::{write_all, PeriodicTask, ReactorRef, TransportRef};
use crate::http2;
use crate::websocket::handshake::{self, refuse_response};
use crate::websocket::hub::{Hub, SharedHandler, SharedSocket};
use crate::websocket::{
    self, Event, FrameParser, WebSocket, WebSocketHandler, PING_FRAME, PONG_FRAME,
};
use log::{debug, error, info, warn};
use std::cell::RefCell;
use std::error::Error;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const ALLOWED_METHODS: &str = "GET,HEAD,POST,PUT,DELETE,OPTIONS";

const NOT_FOUND_BODY: &str = "Not Found";
const INTERNAL_ERROR_BODY: &str = "Internal Server Error";

/// What a handler did with a request.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerResult {
    /// Append this to the body and finish the response.
    Body(String),

    /// Nothing matched; a 404 is sent.
    NotFound,

    /// The handler wrote (or is streaming) the response itself.
    Done,
}

pub trait Handler {
    fn on_request(
        &mut self,
        req: &Request,
        resp: &mut Response,
    ) -> Result<HandlerResult, Box<dyn Error>>;

    /// Called for WebSocket upgrade requests. Returning `None` refuses the
    /// upgrade.
    fn on_upgrade(&mut self, _req: &Request) -> Option<Box<dyn WebSocketHandler>> {
        None
    }
}

// what the access log needs once a response completes
struct AccessInfo {
    client_ip: String,
    method: Method,
    path: String,
    version: String,
    received: Instant,
}

impl AccessInfo {
    fn new(req: &Request) -> Self {
        Self {
            client_ip: req.client_ip.clone().unwrap_or_else(|| "-".to_string()),
            method: req.method,
            path: req.original_path.clone(),
            version: req.version_str(),
            received: req.received,
        }
    }

    fn log(&self, resp: &Response) {
        info!(
            "{} \"{} {} {}\" {} {} {}ms",
            self.client_ip,
            self.method,
            self.path,
            self.version,
            resp.status(),
            resp.bytes_sent(),
            self.received.elapsed().as_millis()
        );
    }

    fn log_upgrade(&self) {
        info!(
            "{} \"{} {} {}\" 101 0 {}ms",
            self.client_ip,
            self.method,
            self.path,
            self.version,
            self.received.elapsed().as_millis()
        );
    }
}

struct ActiveResponse {
    resp: Rc<RefCell<Response>>,
    access: AccessInfo,
}

struct WsSession {
    parser: FrameParser,
    input: ByteCursor,
    ws: SharedSocket,
    handler: SharedHandler,
    heartbeats: Vec<PeriodicTask>,
}

struct Http2Session {
    session: http2::Session,
    input: ByteCursor,
}

enum Mode {
    Http1,
    WebSocket(Box<WsSession>),
    Http2(Box<Http2Session>),
    Closed,
}

pub struct Connection {
    transport: TransportRef,
    reactor: ReactorRef,
    config: Arc<ServerConfig>,
    handler: Box<dyn Handler>,
    parser: RequestParser,
    mode: Mode,

    // looking for the HTTP/2 preface at the start of the connection
    sniffing: bool,
    sniffed: Vec<u8>,

    active: Option<ActiveResponse>,
    held_input: Vec<u8>,

    hub: Option<Hub>,
}

impl Connection {
    pub fn new(
        transport: TransportRef,
        reactor: ReactorRef,
        config: Arc<ServerConfig>,
        handler: Box<dyn Handler>,
    ) -> Self {
        let parser = RequestParser::new(config.parse_limits());

        Self {
            transport,
            reactor,
            config,
            handler,
            parser,
            mode: Mode::Http1,
            sniffing: true,
            sniffed: Vec::new(),
            active: None,
            held_input: Vec::new(),
            hub: None,
        }
    }

    /// Make this connection reachable by broadcasts once it upgrades to
    /// WebSocket.
    pub fn set_hub(&mut self, hub: Hub) {
        self.hub = Some(hub);
    }

    /// Address and TLS status of the peer, for request metadata.
    pub fn set_peer(&mut self, peer_addr: Option<String>, secure: bool) {
        self.parser.set_peer(peer_addr, secure);
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.mode, Mode::Closed)
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self.mode, Mode::WebSocket(_))
    }

    pub fn is_http2(&self) -> bool {
        matches!(self.mode, Mode::Http2(_))
    }

    /// Whether a streamed response is still in progress.
    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    pub fn on_data(&mut self, data: &[u8]) {
        if !self.is_closed() && self.transport.borrow().is_closed() {
            self.shutdown();
        }

        match &self.mode {
            Mode::Closed => {}
            Mode::WebSocket(_) => self.websocket_data(data),
            Mode::Http2(_) => self.http2_data(data),
            Mode::Http1 => {
                if self.sniffing {
                    self.sniffed.extend_from_slice(data);

                    let avail = self.sniffed.len().min(http2::PREFACE.len());

                    if self.sniffed[..avail] == http2::PREFACE[..avail] {
                        if avail < http2::PREFACE.len() {
                            return;
                        }

                        debug!("http2 prior knowledge");

                        self.sniffing = false;
                        self.start_http2();

                        let data = std::mem::take(&mut self.sniffed);
                        self.http2_data(&data);

                        return;
                    }

                    self.sniffing = false;

                    let data = std::mem::take(&mut self.sniffed);
                    self.http1_data(&data);

                    return;
                }

                self.http1_data(data);
            }
        }
    }

    /// The peer closed its side or the socket failed.
    pub fn on_close(&mut self) {
        self.shutdown();
    }

    /// Check on a streamed response and continue with any requests held
    /// back while it was in progress.
    pub fn resume(&mut self) {
        let done = match &self.active {
            Some(active) => active.resp.borrow().is_finished(),
            None => false,
        };

        if !done {
            return;
        }

        if let Some(active) = self.active.take() {
            active.access.log(&active.resp.borrow());
        }

        if self.transport.borrow().is_closed() {
            self.shutdown();
            return;
        }

        let held = std::mem::take(&mut self.held_input);
        self.http1_data(&held);
    }

    fn close(&mut self) {
        self.transport.borrow_mut().close();
        self.shutdown();
    }

    fn shutdown(&mut self) {
        match std::mem::replace(&mut self.mode, Mode::Closed) {
            Mode::WebSocket(s) => {
                for task in s.heartbeats.iter() {
                    task.cancel();
                }

                let mut ws = s.ws.borrow_mut();

                if let Some(hub) = &self.hub {
                    hub.leave(&ws.id());
                }

                ws.abort();
                s.handler.borrow_mut().on_close();
            }
            Mode::Http2(_) | Mode::Http1 | Mode::Closed => {}
        }

        self.transport.borrow_mut().close();
    }

    fn http1_data(&mut self, data: &[u8]) {
        if self.active.is_some() {
            self.held_input.extend_from_slice(data);
            return;
        }

        let mut outcome = self.parser.feed(data);

        loop {
            match outcome {
                ParseOutcome::NeedMoreData => break,
                ParseOutcome::ProtocolError(e) => {
                    debug!("closing connection on protocol error: {}", e);

                    self.close();
                    break;
                }
                ParseOutcome::RequestComplete(req) => {
                    self.dispatch(*req);

                    if !matches!(self.mode, Mode::Http1) || self.active.is_some() {
                        break;
                    }

                    if self.transport.borrow().is_closed() {
                        self.shutdown();
                        break;
                    }

                    outcome = self.parser.feed(&[]);
                }
            }
        }
    }

    fn dispatch(&mut self, req: Request) {
        debug!("request: {} {}", req.method, req.target);

        match req.method {
            Method::Trace => {
                debug!("TRACE request, closing");

                self.close();
                return;
            }
            Method::Options => {
                if let Err(e) = self.respond_options(&req) {
                    debug!("failed to write response: {}", e);
                    self.close();
                }

                return;
            }
            _ => {}
        }

        if handshake::is_upgrade_request(&req) {
            self.upgrade_websocket(&req);
            return;
        }

        if is_h2c_upgrade(&req) {
            self.upgrade_http2();
            return;
        }

        let access = AccessInfo::new(&req);

        let resp = Rc::new(RefCell::new(Response::new(
            self.transport.clone(),
            &req,
            self.config.keep_alive_timeout,
        )));

        let ret = {
            let mut r = resp.borrow_mut();

            self.handler.on_request(&req, &mut r)
        };

        if let Err(e) = self.complete(&resp, ret) {
            debug!("failed to write response: {}", e);
            self.close();
            return;
        }

        if self.transport.borrow().is_closed() {
            access.log(&resp.borrow());
            self.shutdown();
            return;
        }

        let (streaming, finished) = {
            let r = resp.borrow();
            (r.is_streaming(), r.is_finished())
        };

        if streaming && !finished {
            schedule_blocks(&self.reactor, &resp);

            self.active = Some(ActiveResponse { resp, access });
        } else {
            access.log(&resp.borrow());
        }
    }

    fn complete(
        &mut self,
        resp: &Rc<RefCell<Response>>,
        ret: Result<HandlerResult, Box<dyn Error>>,
    ) -> Result<(), ResponseError> {
        let mut resp = resp.borrow_mut();

        match ret {
            Ok(HandlerResult::Body(body)) => {
                resp.write(body.as_bytes())?;

                if !resp.is_streaming() {
                    resp.finish()?;
                }
            }
            Ok(HandlerResult::NotFound) => {
                if resp.headers_sent() {
                    debug!("handler gave up after sending headers");
                    self.transport.borrow_mut().close();
                    return Ok(());
                }

                resp.clear()?;
                resp.set_status(404)?;
                resp.write(NOT_FOUND_BODY.as_bytes())?;
                resp.finish()?;
            }
            Ok(HandlerResult::Done) => {
                if !resp.is_finished() && !resp.is_streaming() {
                    resp.finish()?;
                }
            }
            Err(e) => {
                error!("request handler failed: {}", e);

                if resp.headers_sent() {
                    self.transport.borrow_mut().close();
                    return Ok(());
                }

                resp.clear()?;
                resp.set_status(500)?;
                resp.write(INTERNAL_ERROR_BODY.as_bytes())?;
                resp.finish()?;
            }
        }

        // streaming without anything left to run
        if resp.is_streaming() && !resp.is_finished() && resp.blocks_outstanding() == 0 {
            resp.finish_streaming()?;
        }

        Ok(())
    }

    fn respond_options(&mut self, req: &Request) -> Result<(), ResponseError> {
        let mut resp = Response::new(self.transport.clone(), req, self.config.keep_alive_timeout);

        resp.set_header("Allow", ALLOWED_METHODS)?;
        resp.set_header("Access-Control-Allow-Origin", "*")?;
        resp.finish()?;

        AccessInfo::new(req).log(&resp);

        Ok(())
    }

    fn refuse_websocket(&mut self) {
        let out = refuse_response(&self.config.extensions);

        if let Err(e) = write_all(&self.transport, &out) {
            debug!("failed to write websocket refusal: {}", e);
        }

        self.close();
    }

    fn upgrade_websocket(&mut self, req: &Request) {
        let accepted = match handshake::handshake(req, &self.config.extensions) {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!("websocket handshake failed: {}", e);
                self.refuse_websocket();
                return;
            }
        };

        let mut handler = match self.handler.on_upgrade(req) {
            Some(h) => h,
            None => {
                debug!("websocket upgrade refused by handler");
                self.refuse_websocket();
                return;
            }
        };

        if let Err(e) = write_all(&self.transport, &accepted.response) {
            debug!("failed to write handshake response: {}", e);
            self.close();
            return;
        }

        AccessInfo::new(req).log_upgrade();

        let mut ws = WebSocket::new(
            self.transport.clone(),
            accepted.extensions,
            self.config.frame_size_limit,
        );

        let mut heartbeats = Vec::new();

        if let Some(interval) = self.config.ping_interval() {
            heartbeats.push(self.heartbeat(interval, PING_FRAME));
        }

        if let Some(interval) = self.config.pong_interval() {
            heartbeats.push(self.heartbeat(interval, PONG_FRAME));
        }

        if let Some(hub) = &self.hub {
            ws.set_hub(hub.clone());
        }

        handler.on_open(&mut ws);

        let id = ws.id();
        let ws = Rc::new(RefCell::new(ws));
        let handler = Rc::new(RefCell::new(handler));

        if let Some(hub) = &self.hub {
            hub.join(id, &ws, &handler);
        }

        self.mode = Mode::WebSocket(Box::new(WsSession {
            parser: FrameParser::new(self.config.message_size_limit),
            input: ByteCursor::new(),
            ws,
            handler,
            heartbeats,
        }));

        let leftover = self.parser.take_buffered();

        if !leftover.is_empty() || self.transport.borrow().is_closed() {
            self.websocket_data(&leftover);
        }
    }

    // write a bare control frame every interval until the connection closes
    fn heartbeat(&self, interval: Duration, frame: &'static [u8]) -> PeriodicTask {
        let transport = self.transport.clone();

        PeriodicTask::start(self.reactor.clone(), interval, move || {
            if transport.borrow().is_closed() {
                return;
            }

            if let Err(e) = write_all(&transport, frame) {
                debug!("failed to send websocket heartbeat: {}", e);
            }
        })
    }

    fn websocket_data(&mut self, data: &[u8]) {
        let s = match &mut self.mode {
            Mode::WebSocket(s) => &mut **s,
            _ => return,
        };

        s.input.push(data);

        let mut ws = s.ws.borrow_mut();
        let mut closed = ws.is_closed();

        while !closed {
            let event = match s.parser.parse(&mut s.input, ws.extensions_mut()) {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    match e {
                        websocket::Error::MessageTooLarge => {
                            warn!("websocket message too large, dropping connection")
                        }
                        e => debug!("websocket protocol error: {}", e),
                    }

                    ws.abort();
                    closed = true;
                    break;
                }
            };

            match event {
                Event::Message(msg) => s.handler.borrow_mut().on_message(&mut ws, msg),
                Event::Ping(payload) => {
                    let sock = Rc::clone(&s.ws);

                    self.reactor.schedule(Box::new(move || {
                        let mut sock = sock.borrow_mut();

                        if sock.is_closed() {
                            return;
                        }

                        if let Err(e) = sock.pong(&payload) {
                            debug!("failed to send pong: {}", e);
                        }
                    }));
                }
                Event::Pong(_) => {}
                Event::Close(_) => {
                    debug!("websocket close received");

                    if let Err(e) = ws.close() {
                        debug!("failed to echo close: {}", e);
                    }
                }
            }

            closed = ws.is_closed();
        }

        drop(ws);

        if closed {
            self.shutdown();
        }
    }

    fn start_http2(&mut self) {
        self.mode = Mode::Http2(Box::new(Http2Session {
            session: http2::Session::new(self.transport.clone(), self.config.hpack_table_size),
            input: ByteCursor::new(),
        }));
    }

    fn upgrade_http2(&mut self) {
        debug!("h2c upgrade");

        if let Err(e) = write_all(&self.transport, http2::h2c_upgrade_response()) {
            debug!("failed to write upgrade response: {}", e);
            self.close();
            return;
        }

        self.start_http2();

        // the server's SETTINGS come first after the 101
        if let Mode::Http2(h) = &mut self.mode {
            if let Err(e) = h.session.send_settings() {
                debug!("failed to send settings: {}", e);
                self.close();
                return;
            }
        }

        let leftover = self.parser.take_buffered();

        if !leftover.is_empty() {
            self.http2_data(&leftover);
        }
    }

    fn http2_data(&mut self, data: &[u8]) {
        let h = match &mut self.mode {
            Mode::Http2(h) => &mut **h,
            _ => return,
        };

        h.input.push(data);

        match h.session.process(&mut h.input) {
            Ok(events) => {
                for event in events {
                    match event {
                        http2::Event::Request { stream_id, headers, .. } => {
                            let path = headers
                                .iter()
                                .find(|(n, _)| n == ":path")
                                .map(|(_, v)| v.as_str())
                                .unwrap_or("-");

                            info!("http2 request on stream {} refused: {}", stream_id, path);
                        }
                        http2::Event::GoAway { .. } => {}
                    }
                }
            }
            Err(e) => debug!("http2 session ended: {}", e),
        }

        if h.session.is_closed() {
            self.shutdown();
        }
    }
}

fn is_h2c_upgrade(req: &Request) -> bool {
    match req.headers.get("upgrade") {
        Some(v) => header_contains_param(&v, "h2c", true) && req.headers.contains("http2-settings"),
        None => false,
    }
}

// run each queued block on the reactor, then try to finish the response
fn schedule_blocks(reactor: &ReactorRef, resp: &Rc<RefCell<Response>>) {
    let blocks = resp.borrow_mut().take_pending_blocks();

    for block in blocks {
        let r = Rc::clone(resp);
        let reactor_ref = Rc::clone(reactor);

        reactor.schedule(Box::new(move || {
            {
                let mut resp = r.borrow_mut();

                if resp.is_finished() {
                    return;
                }

                block(&mut resp);
                resp.block_done();
            }

            // blocks may queue more blocks
            schedule_blocks(&reactor_ref, &r);

            let mut resp = r.borrow_mut();

            if !resp.is_finished() {
                if let Err(e) = resp.finish_streaming() {
                    debug!("failed to finish streamed response: {}", e);
                }
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::reactor::LocalReactor;
    use crate::core::test::MemTransport;
    use crate::websocket::{encode_message, write_frame, Message, OPCODE_CLOSE, OPCODE_PING};
    use std::cell::Cell;
    use test_log::test;

    const MASK: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

    #[derive(Default)]
    struct Calls {
        requests: Cell<usize>,
        ws_closed: Cell<bool>,
    }

    struct TestHandler {
        calls: Rc<Calls>,
        allow_ws: bool,
    }

    impl Handler for TestHandler {
        fn on_request(
            &mut self,
            req: &Request,
            resp: &mut Response,
        ) -> Result<HandlerResult, Box<dyn Error>> {
            self.calls.requests.set(self.calls.requests.get() + 1);

            match req.path.as_str() {
                "/hello" => Ok(HandlerResult::Body("hello".to_string())),
                "/fail" => Err("boom".into()),
                "/fail-late" => {
                    resp.start_streaming()?;
                    Err("boom".into())
                }
                "/stream" => {
                    resp.stream_async(Box::new(|r: &mut Response| {
                        r.write(b"one ").unwrap();

                        r.stream_async(Box::new(|r: &mut Response| {
                            r.write(b"three").unwrap();
                        }))
                        .unwrap();
                    }))?;
                    resp.stream_async(Box::new(|r: &mut Response| {
                        r.write(b"two ").unwrap();
                    }))?;

                    Ok(HandlerResult::Done)
                }
                "/manual" => {
                    resp.set_status(201)?;
                    resp.write(b"made")?;
                    resp.finish()?;

                    Ok(HandlerResult::Done)
                }
                _ => Ok(HandlerResult::NotFound),
            }
        }

        fn on_upgrade(&mut self, _req: &Request) -> Option<Box<dyn WebSocketHandler>> {
            if self.allow_ws {
                Some(Box::new(EchoHandler {
                    calls: self.calls.clone(),
                }))
            } else {
                None
            }
        }
    }

    struct EchoHandler {
        calls: Rc<Calls>,
    }

    impl WebSocketHandler for EchoHandler {
        fn on_message(&mut self, ws: &mut WebSocket, msg: Message) {
            match msg {
                Message::Text(s) if s == "bye" => ws.close().unwrap(),
                Message::Text(s) if s.starts_with("all:") => {
                    ws.broadcast(&s[4..]);
                }
                Message::Text(s) => ws.send_text(&s).unwrap(),
                Message::Binary(b) => ws.send_binary(&b).unwrap(),
            }
        }

        fn on_broadcast(&mut self, ws: &mut WebSocket, data: &str) {
            ws.send_text(&format!("peer: {}", data)).unwrap();
        }

        fn on_close(&mut self) {
            self.calls.ws_closed.set(true);
        }
    }

    struct Setup {
        t: Rc<RefCell<MemTransport>>,
        reactor: Rc<LocalReactor>,
        calls: Rc<Calls>,
        conn: Connection,
    }

    fn setup_with(config: ServerConfig, allow_ws: bool) -> Setup {
        let (t, tref) = MemTransport::new_pair();
        let reactor = Rc::new(LocalReactor::new());
        let calls = Rc::new(Calls::default());

        let handler = TestHandler {
            calls: calls.clone(),
            allow_ws,
        };

        let conn = Connection::new(tref, reactor.clone(), Arc::new(config), Box::new(handler));

        Setup {
            t,
            reactor,
            calls,
            conn,
        }
    }

    fn setup() -> Setup {
        setup_with(ServerConfig::default(), true)
    }

    fn status_line(data: &str) -> &str {
        data.split("\r\n").next().unwrap_or("")
    }

    fn body_of(data: &str) -> &str {
        match data.find("\r\n\r\n") {
            Some(pos) => &data[(pos + 4)..],
            None => "",
        }
    }

    const WS_REQUEST: &[u8] = b"GET /ws HTTP/1.1\r\n\
        Host: example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        \r\n";

    #[test]
    fn simple_responses() {
        struct Test {
            name: &'static str,
            request: &'static str,
            status: &'static str,
            body: &'static str,
        }

        let tests = [
            Test {
                name: "body",
                request: "GET /hello HTTP/1.1\r\nHost: a\r\n\r\n",
                status: "HTTP/1.1 200 OK",
                body: "hello",
            },
            Test {
                name: "not-found",
                request: "GET /nope HTTP/1.1\r\nHost: a\r\n\r\n",
                status: "HTTP/1.1 404 Not Found",
                body: "Not Found",
            },
            Test {
                name: "handler-error",
                request: "GET /fail HTTP/1.1\r\nHost: a\r\n\r\n",
                status: "HTTP/1.1 500 Internal Server Error",
                body: "Internal Server Error",
            },
            Test {
                name: "handler-finished",
                request: "POST /manual HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi",
                status: "HTTP/1.1 201 Created",
                body: "made",
            },
        ];

        for test in tests.iter() {
            let mut s = setup();

            s.conn.on_data(test.request.as_bytes());

            let out = s.t.borrow().written_str();

            assert_eq!(status_line(&out), test.status, "test={}", test.name);
            assert_eq!(body_of(&out), test.body, "test={}", test.name);
            assert!(!s.t.borrow().closed, "test={}", test.name);
            assert_eq!(s.calls.requests.get(), 1, "test={}", test.name);
        }
    }

    #[test]
    fn options_bypasses_handler() {
        let mut s = setup();

        s.conn.on_data(b"OPTIONS /anything HTTP/1.1\r\nHost: a\r\n\r\n");

        let out = s.t.borrow().written_str();

        assert_eq!(status_line(&out), "HTTP/1.1 200 OK");
        assert!(out.contains("\r\nAllow: GET,HEAD,POST,PUT,DELETE,OPTIONS\r\n"));
        assert!(out.contains("\r\nContent-Length: 0\r\n"));
        assert_eq!(s.calls.requests.get(), 0);
    }

    #[test]
    fn trace_closes() {
        let mut s = setup();

        s.conn.on_data(b"TRACE / HTTP/1.1\r\n\r\n");

        assert!(s.t.borrow().written.is_empty());
        assert!(s.t.borrow().closed);
        assert!(s.conn.is_closed());
        assert_eq!(s.calls.requests.get(), 0);
    }

    #[test]
    fn error_after_headers_closes() {
        let mut s = setup();

        s.conn.on_data(b"GET /fail-late HTTP/1.1\r\n\r\n");

        let out = s.t.borrow().written_str();

        assert_eq!(status_line(&out), "HTTP/1.1 200 OK");
        assert!(!out.contains("Internal Server Error"));
        assert!(s.t.borrow().closed);
    }

    #[test]
    fn protocol_error_closes() {
        let mut s = setup();

        s.conn.on_data(b"BREW /pot HTTP/1.1\r\n\r\n");

        assert!(s.t.borrow().written.is_empty());
        assert!(s.conn.is_closed());
    }

    #[test]
    fn pipelined_requests() {
        let mut s = setup();

        s.conn.on_data(
            b"GET /hello HTTP/1.1\r\n\r\n\
              GET /nope HTTP/1.1\r\n\r\n\
              GET /hello HTTP/1.1\r\nConnection: close\r\n\r\n",
        );

        let out = s.t.borrow().written_str();

        let statuses: Vec<&str> = out
            .split("\r\n")
            .filter(|l| l.starts_with("HTTP/1.1 "))
            .collect();

        assert_eq!(
            statuses,
            vec!["HTTP/1.1 200 OK", "HTTP/1.1 404 Not Found", "HTTP/1.1 200 OK"]
        );
        assert_eq!(s.calls.requests.get(), 3);
        assert!(s.t.borrow().closed);
        assert!(s.conn.is_closed());
    }

    #[test]
    fn streamed_response_holds_pipeline() {
        let mut s = setup();

        s.conn
            .on_data(b"GET /stream HTTP/1.1\r\n\r\nGET /hello HTTP/1.1\r\n\r\n");

        assert!(s.conn.is_busy());
        assert_eq!(s.calls.requests.get(), 1);

        let out = s.t.borrow_mut().take_written();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("Transfer-Encoding: chunked"));
        assert_eq!(body_of(&out), "");

        s.reactor.run_pending();

        let out = s.t.borrow_mut().take_written();
        assert_eq!(out, b"4\r\none \r\n4\r\ntwo \r\n5\r\nthree\r\n0\r\n\r\n".to_vec());

        s.conn.resume();

        assert!(!s.conn.is_busy());
        assert_eq!(s.calls.requests.get(), 2);

        let out = s.t.borrow().written_str();
        assert_eq!(body_of(&out), "hello");
    }

    #[test]
    fn websocket_echo() {
        let mut s = setup();

        s.conn.on_data(WS_REQUEST);

        assert!(s.conn.is_websocket());

        let out = String::from_utf8(s.t.borrow_mut().take_written()).unwrap();
        assert!(out.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(out.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

        let mut data = Vec::new();
        encode_message(websocket::OPCODE_TEXT, b"hi", 0, 0, Some(MASK), &mut data);
        write_frame(true, 0, OPCODE_PING, b"p", Some(MASK), &mut data);

        // split mid-frame
        s.conn.on_data(&data[..3]);
        s.conn.on_data(&data[3..]);

        // the pong goes out on the next reactor pass
        assert_eq!(s.t.borrow_mut().take_written(), b"\x81\x02hi".to_vec());

        s.reactor.run_pending();

        assert_eq!(s.t.borrow_mut().take_written(), b"\x8a\x01p".to_vec());

        let mut data = Vec::new();
        write_frame(true, 0, OPCODE_CLOSE, b"", Some(MASK), &mut data);
        s.conn.on_data(&data);

        assert_eq!(s.t.borrow().written, b"\x88\x00".to_vec());
        assert!(s.t.borrow().closed);
        assert!(s.conn.is_closed());
        assert!(s.calls.ws_closed.get());
    }

    #[test]
    fn websocket_handler_close() {
        let mut s = setup();

        s.conn.on_data(WS_REQUEST);
        s.t.borrow_mut().take_written();

        let mut data = Vec::new();
        encode_message(websocket::OPCODE_TEXT, b"bye", 0, 0, Some(MASK), &mut data);
        s.conn.on_data(&data);

        assert_eq!(s.t.borrow().written, b"\x88\x00".to_vec());
        assert!(s.conn.is_closed());
        assert!(s.calls.ws_closed.get());
    }

    #[test]
    fn websocket_refused() {
        let mut s = setup_with(ServerConfig::default(), false);

        s.conn.on_data(WS_REQUEST);

        let out = s.t.borrow().written_str();

        assert_eq!(status_line(&out), "HTTP/1.1 400 Bad Request");
        assert!(out.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(out.contains("Sec-WebSocket-Extensions: permessage-deflate\r\n"));
        assert!(s.conn.is_closed());
    }

    #[test]
    fn websocket_message_too_large() {
        let config = ServerConfig {
            message_size_limit: 4,
            ..Default::default()
        };

        let mut s = setup_with(config, true);

        s.conn.on_data(WS_REQUEST);
        s.t.borrow_mut().take_written();

        let mut data = Vec::new();
        encode_message(websocket::OPCODE_BINARY, b"too long", 0, 0, Some(MASK), &mut data);
        s.conn.on_data(&data);

        // no close handshake
        assert!(s.t.borrow().written.is_empty());
        assert!(s.t.borrow().closed);
        assert!(s.conn.is_closed());
    }

    #[test]
    fn websocket_pings() {
        let config = ServerConfig {
            ws_ping_interval: 1,
            ..Default::default()
        };

        let mut s = setup_with(config, true);

        s.conn.on_data(WS_REQUEST);
        s.t.borrow_mut().take_written();

        s.reactor.run_due(Instant::now() + Duration::from_secs(2));

        assert_eq!(s.t.borrow_mut().take_written(), PING_FRAME.to_vec());

        s.conn.on_close();
        assert!(s.calls.ws_closed.get());

        s.reactor.run_due(Instant::now() + Duration::from_secs(10));

        assert!(s.t.borrow().written.is_empty());
        assert!(s.reactor.is_idle());
    }

    #[test]
    fn websocket_pong_after_close() {
        let mut s = setup();

        s.conn.on_data(WS_REQUEST);
        s.t.borrow_mut().take_written();

        let mut data = Vec::new();
        write_frame(true, 0, OPCODE_PING, b"p", Some(MASK), &mut data);
        write_frame(true, 0, OPCODE_CLOSE, b"", Some(MASK), &mut data);
        s.conn.on_data(&data);

        assert!(s.conn.is_closed());

        s.reactor.run_pending();

        // only the close reply
        assert_eq!(s.t.borrow().written, b"\x88\x00".to_vec());
    }

    #[test]
    fn websocket_autopong() {
        let config = ServerConfig {
            ws_ping_interval: 0,
            ws_pong_interval: 2,
            ..Default::default()
        };

        let mut s = setup_with(config, true);

        s.conn.on_data(WS_REQUEST);
        s.t.borrow_mut().take_written();

        s.reactor.run_due(Instant::now() + Duration::from_secs(1));
        assert!(s.t.borrow().written.is_empty());

        s.reactor.run_due(Instant::now() + Duration::from_secs(3));
        assert_eq!(s.t.borrow_mut().take_written(), PONG_FRAME.to_vec());

        s.conn.on_close();

        s.reactor.run_due(Instant::now() + Duration::from_secs(10));

        assert!(s.t.borrow().written.is_empty());
        assert!(s.reactor.is_idle());
    }

    #[test]
    fn websocket_broadcast() {
        let mut a = setup();
        let hub = Hub::new(a.reactor.clone());
        a.conn.set_hub(hub.clone());

        let (b_t, b_tref) = MemTransport::new_pair();
        let b_handler = TestHandler {
            calls: Rc::new(Calls::default()),
            allow_ws: true,
        };
        let mut b_conn = Connection::new(
            b_tref,
            a.reactor.clone(),
            Arc::new(ServerConfig::default()),
            Box::new(b_handler),
        );
        b_conn.set_hub(hub.clone());

        a.conn.on_data(WS_REQUEST);
        b_conn.on_data(WS_REQUEST);

        assert_eq!(hub.len(), 2);

        a.t.borrow_mut().take_written();
        b_t.borrow_mut().take_written();

        let mut data = Vec::new();
        encode_message(websocket::OPCODE_TEXT, b"all:hey", 0, 0, Some(MASK), &mut data);
        a.conn.on_data(&data);

        a.reactor.run_pending();

        assert!(a.t.borrow().written.is_empty());
        assert_eq!(b_t.borrow_mut().take_written(), b"\x81\x09peer: hey".to_vec());

        b_conn.on_close();
        assert_eq!(hub.len(), 1);

        a.conn.on_data(&data);
        a.reactor.run_pending();

        assert!(b_t.borrow().written.is_empty());
    }

    #[test]
    fn http2_prior_knowledge() {
        let mut s = setup();

        s.conn.on_data(&http2::PREFACE[..5]);
        assert!(!s.conn.is_http2());
        assert!(s.t.borrow().written.is_empty());

        s.conn.on_data(&http2::PREFACE[5..]);
        assert!(s.conn.is_http2());

        let out = s.t.borrow().written.clone();
        let h = http2::FrameHeader::parse(&out).unwrap();
        assert_eq!(h.frame_type, http2::FRAME_SETTINGS);
    }

    #[test]
    fn h2c_upgrade() {
        let mut s = setup();

        s.conn.on_data(
            b"GET / HTTP/1.1\r\n\
              Host: a\r\n\
              Connection: Upgrade, HTTP2-Settings\r\n\
              Upgrade: h2c\r\n\
              HTTP2-Settings: AAMAAABkAAQAAP__\r\n\
              \r\n",
        );

        assert!(s.conn.is_http2());
        assert_eq!(s.calls.requests.get(), 0);

        let out = s.t.borrow().written.clone();
        let head = http2::h2c_upgrade_response();

        assert!(out.starts_with(head));

        let h = http2::FrameHeader::parse(&out[head.len()..]).unwrap();
        assert_eq!(h.frame_type, http2::FRAME_SETTINGS);

        // the preface must follow, anything else ends the session
        s.conn.on_data(b"GET / HTTP/1.1\r\n");
        assert!(s.conn.is_closed());
    }
}
