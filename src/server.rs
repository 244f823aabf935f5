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
use crate::config::ServerConfig;
use crate::connection::{Connection, Handler};
use crate::core::reactor::{CancelToken, LocalReactor, Reactor, ReactorRef, Transport};
use crate::websocket::Hub;
use log::{debug, error, info, warn};
use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

const READ_BUFFER_SIZE: usize = 16_384;
const EVENTS_MAX: usize = 1024;

// safety values
const CONNS_MAX: usize = 10_000;
const WRITE_BUFFER_MAX: usize = 64 * 1024 * 1024;

const LISTENER: Token = Token(0);

fn conn_token(key: usize) -> Token {
    Token(key + 1)
}

pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn Handler> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A non-blocking socket. Writes the kernel won't take yet are kept and
/// flushed when the socket becomes writable. A close shuts the socket down
/// once everything pending has gone out.
pub struct TcpTransport {
    stream: TcpStream,
    pending: Vec<u8>,
    closing: bool,
    shut: bool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            pending: Vec::new(),
            closing: false,
            shut: false,
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
        self.stream.read(buf)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Closed, with nothing left to send.
    pub fn is_finished(&self) -> bool {
        self.closing && self.pending.is_empty()
    }

    /// Write out as much pending data as the socket accepts.
    pub fn flush_pending(&mut self) -> Result<(), io::Error> {
        while !self.pending.is_empty() {
            match self.stream.write(&self.pending) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(size) => {
                    self.pending.drain(..size);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        if self.closing {
            self.shutdown();
        }

        Ok(())
    }

    /// Close right away, dropping anything not yet sent.
    pub fn abort(&mut self) {
        self.closing = true;
        self.pending.clear();
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.shut {
            return;
        }

        self.shut = true;

        // the peer may already be gone
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Transport for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        if self.closing {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }

        if self.pending.len() + buf.len() > WRITE_BUFFER_MAX {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "write buffer limit exceeded",
            ));
        }

        self.pending.extend_from_slice(buf);
        self.flush_pending()?;

        Ok(buf.len())
    }

    fn close(&mut self) {
        if self.closing {
            return;
        }

        self.closing = true;

        if let Err(e) = self.flush_pending() {
            debug!("flush on close failed: {}", e);
            self.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.closing
    }
}

impl Source for TcpTransport {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> Result<(), io::Error> {
        self.stream.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> Result<(), io::Error> {
        self.stream.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> Result<(), io::Error> {
        self.stream.deregister(registry)
    }
}

struct ConnectionEntry {
    conn: Connection,
    transport: Rc<RefCell<TcpTransport>>,
    peer: SocketAddr,
    last_activity: Rc<Cell<Instant>>,
    idle_check: CancelToken,
}

// closes idle keep-alive connections. a fired check reports the key in
// `expired` and the event loop decides what to do with it
fn schedule_idle_check(
    reactor: ReactorRef,
    delay: Duration,
    timeout: Duration,
    key: usize,
    last_activity: Rc<Cell<Instant>>,
    token: CancelToken,
    expired: Rc<RefCell<Vec<usize>>>,
) {
    let r = Rc::clone(&reactor);

    reactor.schedule_after(
        delay,
        Box::new(move || {
            if token.is_cancelled() {
                return;
            }

            let deadline = last_activity.get() + timeout;
            let now = Instant::now();

            if now >= deadline {
                expired.borrow_mut().push(key);
            } else {
                schedule_idle_check(
                    r,
                    deadline - now,
                    timeout,
                    key,
                    last_activity,
                    token,
                    expired,
                );
            }
        }),
    );
}

/// The connections served by one event loop, keyed by their slab index.
struct Connections {
    config: Arc<ServerConfig>,
    reactor: Rc<LocalReactor>,
    hub: Hub,
    entries: Slab<ConnectionEntry>,

    // connections with a streamed response in progress
    busy: HashSet<usize>,

    expired: Rc<RefCell<Vec<usize>>>,
}

impl Connections {
    fn new(config: Arc<ServerConfig>) -> Self {
        let reactor = Rc::new(LocalReactor::new());
        let hub = Hub::new(reactor.clone());

        Self {
            config,
            reactor,
            hub,
            entries: Slab::new(),
            busy: HashSet::new(),
            expired: Rc::new(RefCell::new(Vec::new())),
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn keep_alive(&self) -> Option<Duration> {
        if self.config.keep_alive_timeout > 0 {
            Some(Duration::from_secs(self.config.keep_alive_timeout))
        } else {
            None
        }
    }

    fn add(
        &mut self,
        registry: &Registry,
        stream: TcpStream,
        peer: SocketAddr,
        handler: Box<dyn Handler>,
    ) -> Result<(), io::Error> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("conn {}: set_nodelay failed: {}", peer, e);
        }

        let idle_timeout = self.keep_alive();

        let entry = self.entries.vacant_entry();
        let key = entry.key();

        let transport = Rc::new(RefCell::new(TcpTransport::new(stream)));

        registry.register(
            &mut *transport.borrow_mut(),
            conn_token(key),
            Interest::READABLE | Interest::WRITABLE,
        )?;

        let reactor: ReactorRef = self.reactor.clone();

        let mut conn = Connection::new(
            transport.clone(),
            reactor.clone(),
            Arc::clone(&self.config),
            handler,
        );
        conn.set_peer(Some(peer.ip().to_string()), false);
        conn.set_hub(self.hub.clone());

        let last_activity = Rc::new(Cell::new(Instant::now()));
        let idle_check = CancelToken::new();

        if let Some(timeout) = idle_timeout {
            schedule_idle_check(
                reactor,
                timeout,
                timeout,
                key,
                Rc::clone(&last_activity),
                idle_check.clone(),
                Rc::clone(&self.expired),
            );
        }

        entry.insert(ConnectionEntry {
            conn,
            transport,
            peer,
            last_activity,
            idle_check,
        });

        debug!("conn {}: accepted (key={})", peer, key);

        Ok(())
    }

    fn readable(&mut self, registry: &Registry, key: usize, buf: &mut [u8]) {
        let e = match self.entries.get_mut(key) {
            Some(e) => e,
            None => return,
        };

        // readiness is edge-triggered, so read until the socket runs dry
        while !e.conn.is_closed() {
            let ret = e.transport.borrow_mut().read(buf);

            match ret {
                Ok(0) => {
                    debug!("conn {}: peer closed", e.peer);
                    e.conn.on_close();
                }
                Ok(size) => {
                    e.last_activity.set(Instant::now());
                    e.conn.on_data(&buf[..size]);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!("conn {}: read failed: {}", e.peer, err);
                    e.transport.borrow_mut().abort();
                    e.conn.on_close();
                }
            }
        }

        if e.conn.is_busy() {
            self.busy.insert(key);
        }

        self.remove_if_done(registry, key);
    }

    fn writable(&mut self, registry: &Registry, key: usize) {
        let e = match self.entries.get_mut(key) {
            Some(e) => e,
            None => return,
        };

        let ret = e.transport.borrow_mut().flush_pending();

        if let Err(err) = ret {
            debug!("conn {}: write failed: {}", e.peer, err);
            e.transport.borrow_mut().abort();
            e.conn.on_close();
        }

        self.remove_if_done(registry, key);
    }

    /// Run due tasks and timers, then let connections with streamed
    /// responses continue.
    fn run_reactor(&mut self, registry: &Registry) {
        loop {
            let count = self.reactor.run_due(Instant::now());

            let busy: Vec<usize> = self.busy.iter().copied().collect();

            for key in busy {
                match self.entries.get_mut(key) {
                    Some(e) => {
                        e.conn.resume();

                        if !e.conn.is_busy() {
                            self.busy.remove(&key);
                        }
                    }
                    None => {
                        self.busy.remove(&key);
                    }
                }

                self.remove_if_done(registry, key);
            }

            if count == 0 {
                break;
            }

            // tasks may have closed any connection, e.g. from on_broadcast
            let keys: Vec<usize> = self.entries.iter().map(|(key, _)| key).collect();

            for key in keys {
                self.remove_if_done(registry, key);
            }
        }

        self.expire_idle(registry);
    }

    fn expire_idle(&mut self, registry: &Registry) {
        let expired: Vec<usize> = self.expired.borrow_mut().drain(..).collect();

        let timeout = match self.keep_alive() {
            Some(d) => d,
            None => return,
        };

        for key in expired {
            let e = match self.entries.get_mut(key) {
                Some(e) => e,
                None => continue,
            };

            // websocket liveness is covered by pings
            if e.conn.is_websocket() {
                continue;
            }

            if e.conn.is_busy() {
                e.last_activity.set(Instant::now());

                schedule_idle_check(
                    self.reactor.clone(),
                    timeout,
                    timeout,
                    key,
                    Rc::clone(&e.last_activity),
                    e.idle_check.clone(),
                    Rc::clone(&self.expired),
                );

                continue;
            }

            debug!("conn {}: idle timeout", e.peer);

            e.conn.on_close();

            self.remove_if_done(registry, key);
        }
    }

    fn remove_if_done(&mut self, registry: &Registry, key: usize) {
        let e = match self.entries.get_mut(key) {
            Some(e) => e,
            None => return,
        };

        // the response layer may close the transport on its own
        if !e.conn.is_closed() && e.transport.borrow().is_closed() {
            e.conn.on_close();
        }

        if !e.conn.is_closed() || !e.transport.borrow().is_finished() {
            return;
        }

        let e = self.entries.remove(key);

        e.idle_check.cancel();
        self.busy.remove(&key);

        if let Err(err) = registry.deregister(&mut *e.transport.borrow_mut()) {
            debug!("conn {}: deregister failed: {}", e.peer, err);
        }

        debug!("conn {}: closed (key={})", e.peer, key);
    }

    fn next_timeout(&self) -> Option<Duration> {
        self.reactor
            .next_deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

pub struct Server {
    config: Arc<ServerConfig>,
    poll: Poll,
    listener: TcpListener,
}

impl Server {
    pub fn bind(config: ServerConfig) -> Result<Self, Error> {
        let bind_err = |source: io::Error| Error::Bind {
            addr: config.listen.clone(),
            source,
        };

        let addr = match config.listen.to_socket_addrs().map_err(bind_err)?.next() {
            Some(addr) => addr,
            None => {
                return Err(bind_err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "no address to bind",
                )))
            }
        };

        let mut listener = TcpListener::bind(addr).map_err(bind_err)?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        Ok(Self {
            config: Arc::new(config),
            poll,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    fn accept(&mut self, conns: &mut Connections, factory: &HandlerFactory) {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(ret) => ret,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept failed: {}", e);
                    break;
                }
            };

            if conns.len() >= CONNS_MAX {
                warn!("too many connections, refusing {}", peer);
                continue;
            }

            if let Err(e) = conns.add(self.poll.registry(), stream, peer, factory()) {
                error!("conn {}: failed to register: {}", peer, e);
            }
        }
    }

    /// Serve connections on the calling thread until polling fails.
    pub fn run(&mut self, factory: HandlerFactory) -> Result<(), Error> {
        info!("listening on {}", self.local_addr()?);

        let mut conns = Connections::new(Arc::clone(&self.config));
        let mut events = Events::with_capacity(EVENTS_MAX);
        let mut buf = vec![0; READ_BUFFER_SIZE];

        loop {
            conns.run_reactor(self.poll.registry());

            match self.poll.poll(&mut events, conns.next_timeout()) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(&mut conns, &factory),
                    Token(t) => {
                        let key = t - 1;

                        if event.is_writable() {
                            conns.writable(self.poll.registry(), key);
                        }

                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            conns.readable(self.poll.registry(), key, &mut buf);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::HandlerResult;
    use crate::core::http1::request::Request;
    use crate::core::http1::response::Response;
    use crate::websocket::client::Client;
    use crate::websocket::{Message, WebSocket, WebSocketHandler};
    use std::net;
    use std::thread;
    use test_log::test;

    struct TestHandler;

    impl Handler for TestHandler {
        fn on_request(
            &mut self,
            req: &Request,
            _resp: &mut Response,
        ) -> Result<HandlerResult, Box<dyn std::error::Error>> {
            match req.path.as_str() {
                "/big" => Ok(HandlerResult::Body("x".repeat(4 * 1024 * 1024))),
                _ => Ok(HandlerResult::Body(format!("hello {}", req.path))),
            }
        }

        fn on_upgrade(&mut self, _req: &Request) -> Option<Box<dyn WebSocketHandler>> {
            Some(Box::new(ChatHandler))
        }
    }

    struct ChatHandler;

    impl WebSocketHandler for ChatHandler {
        fn on_message(&mut self, ws: &mut WebSocket, msg: Message) {
            match msg {
                Message::Text(s) if s.starts_with("all:") => {
                    ws.broadcast(&s[4..]);
                }
                Message::Text(s) => ws.send_text(&s).unwrap(),
                Message::Binary(b) => ws.send_binary(&b).unwrap(),
            }
        }

        fn on_broadcast(&mut self, ws: &mut WebSocket, data: &str) {
            ws.send_text(data).unwrap();
        }
    }

    fn start_server(config: ServerConfig) -> SocketAddr {
        let mut config = config;
        config.listen = "127.0.0.1:0".to_string();

        let mut server = Server::bind(config).unwrap();
        let addr = server.local_addr().unwrap();

        thread::spawn(move || {
            let factory: HandlerFactory = Arc::new(|| -> Box<dyn Handler> { Box::new(TestHandler) });
            server.run(factory).unwrap();
        });

        addr
    }

    fn connect(addr: SocketAddr) -> net::TcpStream {
        let client = net::TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();

        client
    }

    fn read_response(client: &mut net::TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0; 4096];

        loop {
            let size = client.read(&mut buf).unwrap();
            assert!(size > 0, "unexpected eof");

            data.extend_from_slice(&buf[..size]);

            let s = String::from_utf8_lossy(&data).to_string();

            if let Some(pos) = s.find("\r\n\r\n") {
                let len: usize = s[..pos]
                    .split("\r\n")
                    .find_map(|l| l.strip_prefix("Content-Length: "))
                    .map(|v| v.parse().unwrap())
                    .unwrap_or(0);

                if data.len() >= pos + 4 + len {
                    return s;
                }
            }
        }
    }

    #[test]
    fn bind_failure() {
        let mut config = ServerConfig::default();
        config.listen = "not an address".to_string();

        match Server::bind(config) {
            Err(Error::Bind { addr, .. }) => assert_eq!(addr, "not an address"),
            _ => panic!("expected bind error"),
        }
    }

    #[test]
    fn serve_request() {
        let addr = start_server(ServerConfig::default());

        let mut client = connect(addr);

        client
            .write_all(b"GET /world HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
            .unwrap();

        let mut data = Vec::new();
        client.read_to_end(&mut data).unwrap();

        let data = String::from_utf8(data).unwrap();

        assert!(data.starts_with("HTTP/1.1 200 OK\r\n"), "{}", data);
        assert!(data.ends_with("\r\n\r\nhello /world"), "{}", data);
    }

    #[test]
    fn keep_alive_and_concurrent_clients() {
        let addr = start_server(ServerConfig::default());

        let mut a = connect(addr);
        let mut b = connect(addr);

        for i in 0..3 {
            a.write_all(format!("GET /a{} HTTP/1.1\r\nHost: x\r\n\r\n", i).as_bytes())
                .unwrap();
            b.write_all(format!("GET /b{} HTTP/1.1\r\nHost: x\r\n\r\n", i).as_bytes())
                .unwrap();

            let ra = read_response(&mut a);
            let rb = read_response(&mut b);

            assert!(ra.ends_with(&format!("hello /a{}", i)), "{}", ra);
            assert!(rb.ends_with(&format!("hello /b{}", i)), "{}", rb);
        }
    }

    #[test]
    fn large_response_is_flushed() {
        let addr = start_server(ServerConfig::default());

        let mut client = connect(addr);

        client
            .write_all(b"GET /big HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .unwrap();

        let mut data = Vec::new();
        client.read_to_end(&mut data).unwrap();

        let pos = data.windows(4).position(|w| w == b"\r\n\r\n").unwrap();

        assert_eq!(data.len() - (pos + 4), 4 * 1024 * 1024);
    }

    #[test]
    fn idle_connection_closed() {
        let mut config = ServerConfig::default();
        config.keep_alive_timeout = 1;

        let addr = start_server(config);

        let mut client = connect(addr);

        let start = Instant::now();

        let mut data = Vec::new();
        client.read_to_end(&mut data).unwrap();

        assert!(data.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[test]
    fn websocket_clients() {
        let addr = start_server(ServerConfig::default());
        let url = format!("ws://{}/chat", addr);

        let mut a = Client::connect(&url).unwrap();
        let mut b = Client::connect(&url).unwrap();

        for c in [&a, &b] {
            c.get_ref()
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();
        }

        a.send_text("echo me").unwrap();
        assert_eq!(a.recv().unwrap(), Some(Message::Text("echo me".to_string())));

        a.send_text("all:hi").unwrap();
        assert_eq!(b.recv().unwrap(), Some(Message::Text("hi".to_string())));

        a.close().unwrap();
        assert_eq!(a.recv().unwrap(), None);
    }

    #[test]
    fn transport_buffers_and_closes() {
        let listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = net::TcpStream::connect(addr).unwrap();
        let (mut accepted, _) = listener.accept().unwrap();

        client.set_nonblocking(true).unwrap();

        let mut t = TcpTransport::new(TcpStream::from_std(client));
        assert!(!t.is_closed());

        assert_eq!(t.write(b"hello").unwrap(), 5);
        assert!(!t.has_pending());

        t.close();
        assert!(t.is_closed());
        assert!(t.is_finished());

        let e = t.write(b"x").unwrap_err();
        assert_eq!(e.kind(), io::ErrorKind::BrokenPipe);

        let mut data = Vec::new();
        accepted.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"hello");
    }
}
