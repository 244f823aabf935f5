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

pub mod client;
pub mod extension;
pub mod handshake;
pub mod hub;

use crate::core::buffer::ByteCursor;
use crate::core::reactor::{write_all, TransportRef};
use arrayvec::ArrayVec;
use log::{debug, trace};
use std::io;
use uuid::Uuid;

pub use self::extension::{Extension, ExtensionFactory, ExtensionRegistry};
pub use self::handshake::HandshakeError;
pub use self::hub::Hub;

// 1 byte flags + 9 bytes payload size + 4 bytes mask
pub const HEADER_SIZE_MAX: usize = 14;

const PSIZE_3BYTE: usize = 126;
const PSIZE_9BYTE: usize = 65536;

pub const OPCODE_CONTINUATION: u8 = 0;
pub const OPCODE_TEXT: u8 = 1;
pub const OPCODE_BINARY: u8 = 2;
pub const OPCODE_CLOSE: u8 = 8;
pub const OPCODE_PING: u8 = 9;
pub const OPCODE_PONG: u8 = 10;

pub const CONTROL_FRAME_PAYLOAD_MAX: usize = 125;

pub const DEFAULT_FRAME_SIZE_LIMIT: usize = 17_895_697;

pub const PING_FRAME: &[u8] = b"\x89\x00";
pub const PONG_FRAME: &[u8] = b"\x8a\x00";
pub const CLOSE_FRAME: &[u8] = b"\x88\x00";

const RSV_MASK: u8 = 0x70;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid control frame")]
    InvalidControlFrame,

    #[error("unexpected opcode")]
    UnexpectedOpcode,

    #[error("reserved bits set")]
    ReservedBitsSet,

    #[error("message too large")]
    MessageTooLarge,

    #[error("compression error")]
    CompressionError,

    #[error("invalid extension parameters")]
    InvalidExtensionParams,

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn is_control(opcode: u8) -> bool {
    opcode & 0x08 != 0
}

pub fn header_size(payload_size: usize, masked: bool) -> usize {
    let size = if payload_size < PSIZE_3BYTE {
        1 + 1
    } else if payload_size < PSIZE_9BYTE {
        1 + 3
    } else {
        1 + 9
    };

    if masked {
        size + 4
    } else {
        size
    }
}

pub fn write_header(
    fin: bool,
    rsv: u8,
    opcode: u8,
    payload_size: usize,
    mask: Option<[u8; 4]>,
) -> ArrayVec<u8, HEADER_SIZE_MAX> {
    let mut h = ArrayVec::new();

    let mut b0 = rsv & RSV_MASK;
    if fin {
        b0 |= 0x80;
    }
    b0 |= opcode & 0x0f;

    h.push(b0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0 };

    if payload_size < PSIZE_3BYTE {
        h.push(mask_bit | payload_size as u8);
    } else if payload_size < PSIZE_9BYTE {
        h.push(mask_bit | PSIZE_3BYTE as u8);
        h.extend((payload_size as u16).to_be_bytes());
    } else {
        h.push(mask_bit | 0x7f);
        h.extend((payload_size as u64).to_be_bytes());
    }

    if let Some(mask) = mask {
        h.extend(mask);
    }

    h
}

pub fn apply_mask(buf: &mut [u8], mask: [u8; 4], offset: usize) {
    for (i, c) in buf.iter_mut().enumerate() {
        *c ^= mask[(offset + i) % 4];
    }
}

/// Append one frame to `dest`.
pub fn write_frame(
    fin: bool,
    rsv: u8,
    opcode: u8,
    payload: &[u8],
    mask: Option<[u8; 4]>,
    dest: &mut Vec<u8>,
) {
    dest.extend_from_slice(&write_header(fin, rsv, opcode, payload.len(), mask));

    let start = dest.len();
    dest.extend_from_slice(payload);

    if let Some(mask) = mask {
        apply_mask(&mut dest[start..], mask, 0);
    }
}

/// Append a whole message to `dest`, split into frames of at most
/// `frame_size_limit` payload bytes (0 means no splitting). Only the first
/// frame carries `opcode` and `rsv`, and only the last has `fin` set.
pub fn encode_message(
    opcode: u8,
    payload: &[u8],
    rsv: u8,
    frame_size_limit: usize,
    mask: Option<[u8; 4]>,
    dest: &mut Vec<u8>,
) {
    if frame_size_limit == 0 || payload.len() <= frame_size_limit || is_control(opcode) {
        write_frame(true, rsv, opcode, payload, mask, dest);
        return;
    }

    let count = (payload.len() + frame_size_limit - 1) / frame_size_limit;

    for (i, part) in payload.chunks(frame_size_limit).enumerate() {
        let (opcode, rsv) = if i == 0 {
            (opcode, rsv)
        } else {
            (OPCODE_CONTINUATION, 0)
        };

        write_frame(i == count - 1, rsv, opcode, part, mask, dest);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Message(Message),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Stage {
    Opcode,
    LengthIndicator,
    ExtendedLength,
    MaskKey,
    Payload,
}

/// Incremental frame parser. Frames may arrive split across any number
/// of reads; state persists between calls to `parse`. Fragmented messages
/// are reassembled and delivered whole, typed by their first frame.
pub struct FrameParser {
    stage: Stage,
    fin: bool,
    rsv: u8,
    opcode: u8,
    masked: bool,
    length_indicator: u8,
    mask: Option<[u8; 4]>,
    declared_len: usize,
    payload: Vec<u8>,

    message: Vec<u8>,
    first_opcode: Option<u8>,
    message_rsv: u8,
    message_size_limit: usize,
}

impl FrameParser {
    /// `message_size_limit` of 0 means unlimited.
    pub fn new(message_size_limit: usize) -> Self {
        Self {
            stage: Stage::Opcode,
            fin: false,
            rsv: 0,
            opcode: 0,
            masked: false,
            length_indicator: 0,
            mask: None,
            declared_len: 0,
            payload: Vec::new(),
            message: Vec::new(),
            first_opcode: None,
            message_rsv: 0,
            message_size_limit,
        }
    }

    fn reset_frame(&mut self) {
        self.stage = Stage::Opcode;
        self.fin = false;
        self.rsv = 0;
        self.opcode = 0;
        self.masked = false;
        self.length_indicator = 0;
        self.mask = None;
        self.declared_len = 0;
        self.payload = Vec::new();
    }

    fn check_size(&self, size: usize) -> Result<(), Error> {
        if self.message_size_limit > 0 && size > self.message_size_limit {
            return Err(Error::MessageTooLarge);
        }

        Ok(())
    }

    /// Consume bytes from `src` until one event is complete. Returns
    /// `Ok(None)` when more data is needed. Any error is fatal for the
    /// connection.
    pub fn parse(
        &mut self,
        src: &mut ByteCursor,
        exts: &mut [Box<dyn Extension>],
    ) -> Result<Option<Event>, Error> {
        loop {
            match self.stage {
                Stage::Opcode => {
                    let b0 = match src.read_exact(1) {
                        Some(b) => b[0],
                        None => return Ok(None),
                    };

                    self.fin = b0 & 0x80 != 0;
                    self.rsv = b0 & RSV_MASK;
                    self.opcode = b0 & 0x0f;

                    self.check_opcode(exts)?;

                    self.stage = Stage::LengthIndicator;
                }
                Stage::LengthIndicator => {
                    let b1 = match src.read_exact(1) {
                        Some(b) => b[0],
                        None => return Ok(None),
                    };

                    self.masked = b1 & 0x80 != 0;
                    self.length_indicator = b1 & 0x7f;

                    if is_control(self.opcode)
                        && self.length_indicator as usize > CONTROL_FRAME_PAYLOAD_MAX
                    {
                        return Err(Error::InvalidControlFrame);
                    }

                    if (self.length_indicator as usize) < PSIZE_3BYTE {
                        self.declared_len = self.length_indicator as usize;
                        self.length_known()?;
                    } else {
                        self.stage = Stage::ExtendedLength;
                    }
                }
                Stage::ExtendedLength => {
                    let size = if self.length_indicator as usize == PSIZE_3BYTE {
                        2
                    } else {
                        8
                    };

                    let data = match src.read_exact(size) {
                        Some(data) => data,
                        None => return Ok(None),
                    };

                    let len = data.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);

                    // payloads must fit in memory
                    if len > usize::MAX as u64 {
                        return Err(Error::MessageTooLarge);
                    }

                    self.declared_len = len as usize;
                    self.length_known()?;
                }
                Stage::MaskKey => {
                    let data = match src.read_exact(4) {
                        Some(data) => data,
                        None => return Ok(None),
                    };

                    let mut mask = [0; 4];
                    mask.copy_from_slice(&data);
                    self.mask = Some(mask);

                    self.stage = Stage::Payload;
                }
                Stage::Payload => {
                    let offset = self.payload.len();
                    let mut data = src.take_up_to(self.declared_len - offset);

                    if let Some(mask) = self.mask {
                        apply_mask(&mut data, mask, offset);
                    }

                    self.payload.extend_from_slice(&data);

                    if self.payload.len() < self.declared_len {
                        return Ok(None);
                    }

                    if let Some(event) = self.frame_complete(exts)? {
                        return Ok(Some(event));
                    }
                }
            }
        }
    }

    fn check_opcode(&self, exts: &[Box<dyn Extension>]) -> Result<(), Error> {
        match self.opcode {
            OPCODE_CONTINUATION => {
                if self.first_opcode.is_none() {
                    return Err(Error::UnexpectedOpcode);
                }
            }
            OPCODE_TEXT | OPCODE_BINARY => {
                if self.first_opcode.is_some() {
                    return Err(Error::UnexpectedOpcode);
                }
            }
            OPCODE_CLOSE | OPCODE_PING | OPCODE_PONG => {
                if !self.fin {
                    return Err(Error::InvalidControlFrame);
                }
            }
            _ => return Err(Error::UnexpectedOpcode),
        }

        if self.rsv != 0 {
            let allowed = exts.iter().fold(0, |acc, e| acc | e.rsv_bits());

            // extensions apply per message, so only on its first frame
            let first_data_frame = self.opcode == OPCODE_TEXT || self.opcode == OPCODE_BINARY;

            if !first_data_frame || self.rsv & !allowed != 0 {
                return Err(Error::ReservedBitsSet);
            }
        }

        Ok(())
    }

    fn length_known(&mut self) -> Result<(), Error> {
        if !is_control(self.opcode) {
            self.check_size(self.message.len() + self.declared_len)?;
        }

        self.payload.reserve(self.declared_len.min(PSIZE_9BYTE));

        self.stage = if self.masked {
            Stage::MaskKey
        } else {
            Stage::Payload
        };

        Ok(())
    }

    fn frame_complete(&mut self, exts: &mut [Box<dyn Extension>]) -> Result<Option<Event>, Error> {
        let opcode = self.opcode;
        let fin = self.fin;
        let rsv = self.rsv;
        let payload = std::mem::take(&mut self.payload);

        self.reset_frame();

        trace!("frame opcode={} fin={} len={}", opcode, fin, payload.len());

        match opcode {
            OPCODE_CLOSE => return Ok(Some(Event::Close(payload))),
            OPCODE_PING => return Ok(Some(Event::Ping(payload))),
            OPCODE_PONG => return Ok(Some(Event::Pong(payload))),
            _ => {}
        }

        if self.first_opcode.is_none() {
            self.first_opcode = Some(opcode);
            self.message_rsv = rsv;
        }

        self.message.extend_from_slice(&payload);

        if !fin {
            return Ok(None);
        }

        let first_opcode = self.first_opcode.take().unwrap_or(opcode);
        let message_rsv = std::mem::replace(&mut self.message_rsv, 0);
        let mut data = std::mem::take(&mut self.message);

        if message_rsv != 0 {
            for ext in exts.iter_mut().rev() {
                if ext.rsv_bits() & message_rsv != 0 {
                    data = ext.decode(message_rsv, data, self.message_size_limit)?;
                }
            }

            self.check_size(data.len())?;
        }

        let msg = if first_opcode == OPCODE_TEXT {
            Message::Text(String::from_utf8_lossy(&data).into_owned())
        } else {
            Message::Binary(data)
        };

        Ok(Some(Event::Message(msg)))
    }
}

/// Server side of an established WebSocket connection, as seen by handlers.
pub struct WebSocket {
    id: Uuid,
    transport: TransportRef,
    extensions: Vec<Box<dyn Extension>>,
    frame_size_limit: usize,
    close_sent: bool,
    hub: Option<Hub>,
}

impl WebSocket {
    pub fn new(
        transport: TransportRef,
        extensions: Vec<Box<dyn Extension>>,
        frame_size_limit: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            transport,
            extensions,
            frame_size_limit,
            close_sent: false,
            hub: None,
        }
    }

    /// Identifies this connection for unicasts.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn set_hub(&mut self, hub: Hub) {
        self.hub = Some(hub);
    }

    /// Send `data` to the `on_broadcast` of every other connection on this
    /// event loop. Returns the number of recipients.
    pub fn broadcast(&self, data: &str) -> usize {
        match &self.hub {
            Some(hub) => hub.broadcast(data, Some(&self.id)),
            None => 0,
        }
    }

    /// Send `data` to the `on_broadcast` of the connection with the given
    /// id. Returns false if it isn't open.
    pub fn unicast(&self, id: &Uuid, data: &str) -> bool {
        match &self.hub {
            Some(hub) => hub.unicast(id, data),
            None => false,
        }
    }

    pub fn extensions_mut(&mut self) -> &mut [Box<dyn Extension>] {
        &mut self.extensions
    }

    pub fn is_closed(&self) -> bool {
        self.close_sent || self.transport.borrow().is_closed()
    }

    fn send_message(&mut self, opcode: u8, payload: Vec<u8>) -> Result<(), Error> {
        let mut payload = payload;
        let mut rsv = 0;

        for ext in self.extensions.iter_mut() {
            let (p, bits) = ext.encode(opcode, payload)?;
            payload = p;
            rsv |= bits;
        }

        let mut out = Vec::with_capacity(payload.len() + HEADER_SIZE_MAX);
        encode_message(opcode, &payload, rsv, self.frame_size_limit, None, &mut out);

        write_all(&self.transport, &out)?;

        Ok(())
    }

    fn send_control(&mut self, opcode: u8, payload: &[u8]) -> Result<(), Error> {
        if payload.len() > CONTROL_FRAME_PAYLOAD_MAX {
            return Err(Error::InvalidControlFrame);
        }

        let mut out = Vec::with_capacity(payload.len() + 2);
        write_frame(true, 0, opcode, payload, None, &mut out);

        write_all(&self.transport, &out)?;

        Ok(())
    }

    pub fn send_text(&mut self, text: &str) -> Result<(), Error> {
        self.send_message(OPCODE_TEXT, text.as_bytes().to_vec())
    }

    pub fn send_binary(&mut self, data: &[u8]) -> Result<(), Error> {
        self.send_message(OPCODE_BINARY, data.to_vec())
    }

    pub fn ping(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.send_control(OPCODE_PING, payload)
    }

    pub fn pong(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.send_control(OPCODE_PONG, payload)
    }

    /// Send a close frame, once, and close the transport.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.close_sent {
            return Ok(());
        }

        self.close_sent = true;

        debug!("websocket closing");

        let ret = write_all(&self.transport, CLOSE_FRAME);
        self.transport.borrow_mut().close();

        Ok(ret?)
    }

    /// Close the transport without the close handshake.
    pub fn abort(&mut self) {
        self.close_sent = true;
        self.transport.borrow_mut().close();
    }
}

/// Application callbacks for an upgraded connection.
pub trait WebSocketHandler {
    fn on_open(&mut self, _ws: &mut WebSocket) {}

    fn on_message(&mut self, ws: &mut WebSocket, msg: Message);

    /// Data from another connection's broadcast or unicast. Nothing is
    /// sent to the client unless the handler writes it.
    fn on_broadcast(&mut self, _ws: &mut WebSocket, _data: &str) {}

    fn on_close(&mut self) {}
}
