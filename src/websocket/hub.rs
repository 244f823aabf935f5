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
use super::{WebSocket, WebSocketHandler};
use crate::core::reactor::ReactorRef;
use log::{debug, trace};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use uuid::Uuid;

pub type SharedSocket = Rc<RefCell<WebSocket>>;
pub type SharedHandler = Rc<RefCell<Box<dyn WebSocketHandler>>>;

struct Member {
    ws: Weak<RefCell<WebSocket>>,
    handler: Weak<RefCell<Box<dyn WebSocketHandler>>>,
}

/// The open WebSocket connections of one event loop, addressable by id.
///
/// Broadcasts and unicasts go to the receiving handler's `on_broadcast`,
/// not to the remote client. Delivery is queued on the reactor, so the
/// sender's current callback always completes first.
#[derive(Clone)]
pub struct Hub {
    reactor: ReactorRef,
    members: Rc<RefCell<HashMap<Uuid, Member>>>,
}

impl Hub {
    pub fn new(reactor: ReactorRef) -> Self {
        Self {
            reactor,
            members: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    pub fn join(&self, id: Uuid, ws: &SharedSocket, handler: &SharedHandler) {
        trace!("hub: {} joined", id);

        self.members.borrow_mut().insert(
            id,
            Member {
                ws: Rc::downgrade(ws),
                handler: Rc::downgrade(handler),
            },
        );
    }

    pub fn leave(&self, id: &Uuid) {
        if self.members.borrow_mut().remove(id).is_some() {
            trace!("hub: {} left", id);
        }
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.members.borrow().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.members.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.borrow().is_empty()
    }

    /// Queue `data` for every member except `except`. Returns the number of
    /// recipients.
    pub fn broadcast(&self, data: &str, except: Option<&Uuid>) -> usize {
        let data: Rc<str> = Rc::from(data);
        let members = self.members.borrow();

        let mut count = 0;

        for (id, member) in members.iter() {
            if Some(id) == except {
                continue;
            }

            self.deliver(member, Rc::clone(&data));
            count += 1;
        }

        debug!("hub: broadcast to {} connections", count);

        count
    }

    /// Queue `data` for the member with the given id. Returns false if no
    /// such connection is open.
    pub fn unicast(&self, id: &Uuid, data: &str) -> bool {
        let members = self.members.borrow();

        match members.get(id) {
            Some(member) => {
                self.deliver(member, Rc::from(data));

                true
            }
            None => false,
        }
    }

    fn deliver(&self, member: &Member, data: Rc<str>) {
        let ws = Weak::clone(&member.ws);
        let handler = Weak::clone(&member.handler);

        self.reactor.schedule(Box::new(move || {
            let (ws, handler) = match (ws.upgrade(), handler.upgrade()) {
                (Some(ws), Some(handler)) => (ws, handler),
                _ => return,
            };

            if ws.borrow().is_closed() {
                return;
            }

            let mut ws = ws.borrow_mut();
            handler.borrow_mut().on_broadcast(&mut ws, &data);
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::reactor::LocalReactor;
    use crate::core::test::MemTransport;
    use crate::websocket::Message;
    use test_log::test;

    struct Recorder {
        got: Rc<RefCell<Vec<String>>>,
    }

    impl WebSocketHandler for Recorder {
        fn on_message(&mut self, _ws: &mut WebSocket, _msg: Message) {}

        fn on_broadcast(&mut self, ws: &mut WebSocket, data: &str) {
            self.got.borrow_mut().push(data.to_string());
            ws.send_text(data).unwrap();
        }
    }

    struct Peer {
        t: Rc<RefCell<MemTransport>>,
        ws: SharedSocket,
        _handler: SharedHandler,
        got: Rc<RefCell<Vec<String>>>,
    }

    fn add_peer(hub: &Hub) -> Peer {
        let (t, tref) = MemTransport::new_pair();
        let got = Rc::new(RefCell::new(Vec::new()));

        let mut ws = WebSocket::new(tref, Vec::new(), 0);
        ws.set_hub(hub.clone());

        let ws = Rc::new(RefCell::new(ws));
        let handler: Box<dyn WebSocketHandler> = Box::new(Recorder { got: got.clone() });
        let handler = Rc::new(RefCell::new(handler));

        hub.join(ws.borrow().id(), &ws, &handler);

        Peer {
            t,
            ws,
            _handler: handler,
            got,
        }
    }

    #[test]
    fn broadcast_skips_sender() {
        let reactor = Rc::new(LocalReactor::new());
        let hub = Hub::new(reactor.clone());

        let a = add_peer(&hub);
        let b = add_peer(&hub);
        let c = add_peer(&hub);

        assert_eq!(hub.len(), 3);

        assert_eq!(a.ws.borrow().broadcast("news"), 2);

        // nothing happens until the reactor runs
        assert!(b.got.borrow().is_empty());

        reactor.run_pending();

        assert!(a.got.borrow().is_empty());
        assert_eq!(*b.got.borrow(), vec!["news".to_string()]);
        assert_eq!(*c.got.borrow(), vec!["news".to_string()]);

        // delivered to the handler, which chose to forward it
        assert_eq!(b.t.borrow_mut().take_written(), b"\x81\x04news".to_vec());
        assert!(a.t.borrow().written.is_empty());
    }

    #[test]
    fn unicast_by_id() {
        let reactor = Rc::new(LocalReactor::new());
        let hub = Hub::new(reactor.clone());

        let a = add_peer(&hub);
        let b = add_peer(&hub);

        let b_id = b.ws.borrow().id();
        assert_ne!(a.ws.borrow().id(), b_id);

        assert!(a.ws.borrow().unicast(&b_id, "psst"));
        assert!(!a.ws.borrow().unicast(&Uuid::new_v4(), "psst"));

        reactor.run_pending();

        assert!(a.got.borrow().is_empty());
        assert_eq!(*b.got.borrow(), vec!["psst".to_string()]);
    }

    #[test]
    fn departed_and_closed_members() {
        let reactor = Rc::new(LocalReactor::new());
        let hub = Hub::new(reactor.clone());

        let a = add_peer(&hub);
        let b = add_peer(&hub);
        let c = add_peer(&hub);

        hub.leave(&b.ws.borrow().id());
        assert!(!hub.contains(&b.ws.borrow().id()));
        assert_eq!(hub.len(), 2);

        // closed after the broadcast was queued
        assert_eq!(a.ws.borrow().broadcast("x"), 1);
        c.ws.borrow_mut().abort();

        reactor.run_pending();

        assert!(b.got.borrow().is_empty());
        assert!(c.got.borrow().is_empty());
    }

    #[test]
    fn without_hub() {
        let (_t, tref) = MemTransport::new_pair();
        let ws = WebSocket::new(tref, Vec::new(), 0);

        assert_eq!(ws.broadcast("x"), 0);
        assert!(!ws.unicast(&Uuid::new_v4(), "x"));
    }
}
