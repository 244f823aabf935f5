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

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub type Task = Box<dyn FnOnce()>;

/// The byte sink of one connection.
///
/// Writes are expected to be non-blocking at the transport layer. The
/// reading side is driven by whoever owns the connection and feeds data in.
pub trait Transport {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error>;

    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

pub type TransportRef = Rc<RefCell<dyn Transport>>;

pub fn write_all(transport: &TransportRef, mut buf: &[u8]) -> Result<(), io::Error> {
    let mut t = transport.borrow_mut();

    if t.is_closed() {
        return Err(io::Error::from(io::ErrorKind::NotConnected));
    }

    while !buf.is_empty() {
        let size = t.write(buf)?;

        if size == 0 {
            return Err(io::Error::from(io::ErrorKind::WriteZero));
        }

        buf = &buf[size..];
    }

    Ok(())
}

/// Deferred work queue offered by the surrounding event loop.
pub trait Reactor {
    fn schedule(&self, task: Task);

    fn schedule_after(&self, delay: Duration, task: Task);
}

pub type ReactorRef = Rc<dyn Reactor>;

struct Timer {
    expires: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.expires == other.expires && self.seq == other.seq
    }
}

impl Eq for Timer {}

// reversed, so the max-heap yields the earliest expiry first. ties go to
// the timer scheduled first
impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .expires
            .cmp(&self.expires)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Single-threaded reactor: a run queue plus a heap of timers.
pub struct LocalReactor {
    queue: RefCell<VecDeque<Task>>,
    timers: RefCell<BinaryHeap<Timer>>,
    next_seq: Cell<u64>,
    start_time: Instant,
}

impl LocalReactor {
    pub fn new() -> Self {
        Self::new_with_time(Instant::now())
    }

    pub fn new_with_time(start_time: Instant) -> Self {
        Self {
            queue: RefCell::new(VecDeque::new()),
            timers: RefCell::new(BinaryHeap::new()),
            next_seq: Cell::new(0),
            start_time,
        }
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// Run queued tasks, including any queued while running. Returns the
    /// number of tasks run.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;

        loop {
            // don't hold the borrow while the task runs
            let task = self.queue.borrow_mut().pop_front();

            match task {
                Some(task) => {
                    task();
                    count += 1;
                }
                None => break,
            }
        }

        count
    }

    /// Move timers expiring at or before `now` to the run queue, then run
    /// everything pending.
    pub fn run_due(&self, now: Instant) -> usize {
        {
            let mut timers = self.timers.borrow_mut();
            let mut queue = self.queue.borrow_mut();

            while timers.peek().map_or(false, |t| t.expires <= now) {
                if let Some(t) = timers.pop() {
                    queue.push_back(t.task);
                }
            }
        }

        self.run_pending()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.borrow().peek().map(|t| t.expires)
    }

    pub fn is_idle(&self) -> bool {
        self.queue.borrow().is_empty() && self.timers.borrow().is_empty()
    }
}

impl Default for LocalReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor for LocalReactor {
    fn schedule(&self, task: Task) {
        self.queue.borrow_mut().push_back(task);
    }

    fn schedule_after(&self, delay: Duration, task: Task) {
        let expires = Instant::now() + delay;

        let seq = self.next_seq.get();
        self.next_seq.set(seq.wrapping_add(1));

        self.timers.borrow_mut().push(Timer { expires, seq, task });
    }
}

#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Rc<Cell<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

/// A task that runs every `interval` until its token is cancelled.
///
/// Each tick checks the token before running and again before
/// rescheduling, so cancellation takes effect at the next tick at the
/// latest.
pub struct PeriodicTask {
    token: CancelToken,
}

impl PeriodicTask {
    pub fn start<F>(reactor: ReactorRef, interval: Duration, f: F) -> Self
    where
        F: Fn() + 'static,
    {
        let token = CancelToken::new();

        schedule_tick(reactor, interval, token.clone(), Rc::new(f));

        Self { token }
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

fn schedule_tick(reactor: ReactorRef, interval: Duration, token: CancelToken, f: Rc<dyn Fn()>) {
    let r = Rc::clone(&reactor);

    reactor.schedule_after(
        interval,
        Box::new(move || {
            if token.is_cancelled() {
                return;
            }

            f();

            if !token.is_cancelled() {
                schedule_tick(r, interval, token, f);
            }
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_queue_order() {
        let reactor = LocalReactor::new();
        let out = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let out = Rc::clone(&out);
            reactor.schedule(Box::new(move || out.borrow_mut().push(i)));
        }

        assert_eq!(reactor.run_pending(), 3);
        assert_eq!(*out.borrow(), vec![0, 1, 2]);
        assert!(reactor.is_idle());
    }

    #[test]
    fn timers_fire_when_due() {
        let reactor = LocalReactor::new();
        let fired = Rc::new(Cell::new(false));

        {
            let fired = Rc::clone(&fired);
            reactor.schedule_after(Duration::from_secs(10), Box::new(move || fired.set(true)));
        }

        assert_eq!(reactor.run_due(Instant::now()), 0);
        assert!(!fired.get());
        assert!(reactor.next_deadline().is_some());

        assert_eq!(reactor.run_due(Instant::now() + Duration::from_secs(11)), 1);
        assert!(fired.get());
        assert!(reactor.next_deadline().is_none());
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let reactor = LocalReactor::new();
        let out = Rc::new(RefCell::new(Vec::new()));

        for (name, secs) in [("c", 3), ("a", 1), ("b", 2), ("a2", 1)] {
            let out = Rc::clone(&out);
            reactor.schedule_after(
                Duration::from_secs(secs),
                Box::new(move || out.borrow_mut().push(name)),
            );
        }

        let now = Instant::now();

        assert_eq!(reactor.run_due(now + Duration::from_millis(1500)), 2);
        assert_eq!(*out.borrow(), vec!["a", "a2"]);

        assert_eq!(reactor.run_due(now + Duration::from_secs(5)), 2);
        assert_eq!(*out.borrow(), vec!["a", "a2", "b", "c"]);
        assert!(reactor.is_idle());
    }

    #[test]
    fn periodic_task_reschedules_until_cancelled() {
        let reactor = Rc::new(LocalReactor::new());
        let count = Rc::new(Cell::new(0));

        let task = {
            let count = Rc::clone(&count);
            PeriodicTask::start(reactor.clone(), Duration::from_secs(1), move || {
                count.set(count.get() + 1)
            })
        };

        let mut now = Instant::now();
        for _ in 0..3 {
            now += Duration::from_secs(2);
            reactor.run_due(now);
        }

        assert_eq!(count.get(), 3);

        task.cancel();

        now += Duration::from_secs(2);
        reactor.run_due(now);

        assert_eq!(count.get(), 3);
        assert!(reactor.is_idle());
    }

    #[test]
    fn write_all_fails_when_closed() {
        struct Sink {
            closed: bool,
        }

        impl Transport for Sink {
            fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
                Ok(buf.len())
            }

            fn close(&mut self) {
                self.closed = true;
            }

            fn is_closed(&self) -> bool {
                self.closed
            }
        }

        let t: TransportRef = Rc::new(RefCell::new(Sink { closed: false }));
        assert!(write_all(&t, b"hello").is_ok());

        t.borrow_mut().close();

        let e = write_all(&t, b"hello").unwrap_err();
        assert_eq!(e.kind(), io::ErrorKind::NotConnected);
    }
}
