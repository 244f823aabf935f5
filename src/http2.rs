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

//! HTTP/2 connection framing. Frames are read and connection-level
//! frames answered, but streams are never processed: every request is
//! refused with `REFUSED_STREAM`.

use crate::core::buffer::ByteCursor;
use crate::core::reactor::{write_all, TransportRef};
use crate::hpack::{self, HeaderField};
use log::{debug, warn};
use std::io;

pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const FRAME_HEADER_SIZE: usize = 9;
pub const MAX_FRAME_SIZE: usize = 16_384;

pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_PRIORITY: u8 = 0x2;
pub const FRAME_RST_STREAM: u8 = 0x3;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FRAME_PUSH_PROMISE: u8 = 0x5;
pub const FRAME_PING: u8 = 0x6;
pub const FRAME_GOAWAY: u8 = 0x7;
pub const FRAME_WINDOW_UPDATE: u8 = 0x8;
pub const FRAME_CONTINUATION: u8 = 0x9;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

pub const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
pub const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;

const SETTING_SIZE: usize = 6;
const PING_SIZE: usize = 8;
const PRIORITY_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn from_u32(v: u32) -> Option<Self> {
        let code = match v {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => return None,
        };

        Some(code)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection error: {0:?}")]
    Connection(ErrorCode),

    #[error("frame of {0} bytes exceeds maximum size")]
    FrameTooLarge(usize),

    #[error("header compression: {0}")]
    Hpack(#[from] hpack::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Connection(code) => *code,
            Self::FrameTooLarge(_) => ErrorCode::FrameSizeError,
            Self::Hpack(_) => ErrorCode::CompressionError,
            Self::Io(_) => ErrorCode::InternalError,
        }
    }
}

fn protocol_error() -> Error {
    Error::Connection(ErrorCode::ProtocolError)
}

fn frame_size_error() -> Error {
    Error::Connection(ErrorCode::FrameSizeError)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameHeader {
    pub length: usize,
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn parse(src: &[u8]) -> Option<Self> {
        if src.len() < FRAME_HEADER_SIZE {
            return None;
        }

        let length = ((src[0] as usize) << 16) | ((src[1] as usize) << 8) | (src[2] as usize);

        // reserved bit ignored
        let stream_id = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) & 0x7fff_ffff;

        Some(Self {
            length,
            frame_type: src[3],
            flags: src[4],
            stream_id,
        })
    }

    pub fn write(&self, dest: &mut Vec<u8>) {
        let len = (self.length as u32).to_be_bytes();

        dest.extend_from_slice(&len[1..]);
        dest.push(self.frame_type);
        dest.push(self.flags);
        dest.extend_from_slice(&(self.stream_id & 0x7fff_ffff).to_be_bytes());
    }
}

pub fn write_frame(frame_type: u8, flags: u8, stream_id: u32, payload: &[u8], dest: &mut Vec<u8>) {
    let h = FrameHeader {
        length: payload.len(),
        frame_type,
        flags,
        stream_id,
    };

    h.write(dest);
    dest.extend_from_slice(payload);
}

/// Bytes to send in answer to an `Upgrade: h2c` request.
pub fn h2c_upgrade_response() -> &'static [u8] {
    b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n"
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Request {
        stream_id: u32,
        headers: Vec<HeaderField>,
        end_stream: bool,
    },
    GoAway {
        last_stream_id: u32,
        code: Option<ErrorCode>,
    },
}

struct PendingHeaders {
    stream_id: u32,
    block: Vec<u8>,
    end_stream: bool,
}

pub struct Session {
    transport: TransportRef,
    decoder: hpack::Decoder,
    table_size: usize,
    preface_received: bool,
    settings_sent: bool,
    pending: Option<PendingHeaders>,
    last_stream_id: u32,
    closed: bool,
}

impl Session {
    pub fn new(transport: TransportRef, table_size: usize) -> Self {
        Self {
            transport,
            decoder: hpack::Decoder::new(table_size),
            table_size,
            preface_received: false,
            settings_sent: false,
            pending: None,
            last_stream_id: 0,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn last_stream_id(&self) -> u32 {
        self.last_stream_id
    }

    /// Send the server's initial SETTINGS frame, once.
    pub fn send_settings(&mut self) -> Result<(), Error> {
        if self.settings_sent {
            return Ok(());
        }

        self.settings_sent = true;

        let mut payload = Vec::with_capacity(SETTING_SIZE * 2);

        for (id, value) in [
            (SETTINGS_HEADER_TABLE_SIZE, self.table_size as u32),
            (SETTINGS_MAX_FRAME_SIZE, MAX_FRAME_SIZE as u32),
        ] {
            payload.extend_from_slice(&id.to_be_bytes());
            payload.extend_from_slice(&value.to_be_bytes());
        }

        self.send(FRAME_SETTINGS, 0, 0, &payload)
    }

    fn send(&self, frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Result<(), Error> {
        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        write_frame(frame_type, flags, stream_id, payload, &mut out);

        write_all(&self.transport, &out)?;

        Ok(())
    }

    /// Read whatever complete frames `src` holds. On error the connection
    /// has been torn down: a GOAWAY is sent first unless the peer sent an
    /// oversized frame, in which case the transport is simply closed.
    pub fn process(&mut self, src: &mut ByteCursor) -> Result<Vec<Event>, Error> {
        if self.closed {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();

        match self.process_frames(src, &mut events) {
            Ok(()) => Ok(events),
            Err(e) => {
                self.fail(&e);

                Err(e)
            }
        }
    }

    fn fail(&mut self, e: &Error) {
        warn!("http2 connection error: {}", e);

        if !matches!(e, Error::FrameTooLarge(_) | Error::Io(_)) {
            let mut payload = Vec::with_capacity(8);
            payload.extend_from_slice(&self.last_stream_id.to_be_bytes());
            payload.extend_from_slice(&(e.code() as u32).to_be_bytes());

            if let Err(e) = self.send(FRAME_GOAWAY, 0, 0, &payload) {
                debug!("failed to send goaway: {}", e);
            }
        }

        self.closed = true;
        self.transport.borrow_mut().close();
    }

    fn process_frames(&mut self, src: &mut ByteCursor, events: &mut Vec<Event>) -> Result<(), Error> {
        if !self.preface_received {
            let avail = src.len().min(PREFACE.len());

            if src.remaining()[..avail] != PREFACE[..avail] {
                return Err(protocol_error());
            }

            if avail < PREFACE.len() {
                return Ok(());
            }

            src.advance(PREFACE.len());
            self.preface_received = true;

            debug!("http2 preface received");

            self.send_settings()?;
        }

        while !self.closed {
            let h = match FrameHeader::parse(src.remaining()) {
                Some(h) => h,
                None => break,
            };

            if h.length > MAX_FRAME_SIZE {
                return Err(Error::FrameTooLarge(h.length));
            }

            if src.len() < FRAME_HEADER_SIZE + h.length {
                break;
            }

            src.advance(FRAME_HEADER_SIZE);

            let payload = match src.read_exact(h.length) {
                Some(p) => p,
                None => return Err(protocol_error()),
            };

            if let Some(event) = self.handle_frame(&h, payload)? {
                events.push(event);
            }
        }

        Ok(())
    }

    fn handle_frame(&mut self, h: &FrameHeader, payload: Vec<u8>) -> Result<Option<Event>, Error> {
        debug!(
            "http2 frame type={} flags={:#x} stream={} len={}",
            h.frame_type, h.flags, h.stream_id, h.length
        );

        // a header block must not be interrupted
        if let Some(pending) = &self.pending {
            if h.frame_type != FRAME_CONTINUATION || h.stream_id != pending.stream_id {
                return Err(protocol_error());
            }
        }

        match h.frame_type {
            FRAME_SETTINGS => {
                self.handle_settings(h, &payload)?;

                Ok(None)
            }
            FRAME_PING => {
                if h.stream_id != 0 {
                    return Err(protocol_error());
                }

                if payload.len() != PING_SIZE {
                    return Err(frame_size_error());
                }

                if h.flags & FLAG_ACK == 0 {
                    self.send(FRAME_PING, FLAG_ACK, 0, &payload)?;
                }

                Ok(None)
            }
            FRAME_HEADERS => {
                if h.stream_id == 0 {
                    return Err(protocol_error());
                }

                let block = strip_headers_payload(h.flags, payload)?;

                self.pending = Some(PendingHeaders {
                    stream_id: h.stream_id,
                    block,
                    end_stream: h.flags & FLAG_END_STREAM != 0,
                });

                if h.flags & FLAG_END_HEADERS != 0 {
                    return self.headers_complete().map(Some);
                }

                Ok(None)
            }
            FRAME_CONTINUATION => {
                match &mut self.pending {
                    Some(pending) => pending.block.extend_from_slice(&payload),
                    None => return Err(protocol_error()),
                }

                if h.flags & FLAG_END_HEADERS != 0 {
                    return self.headers_complete().map(Some);
                }

                Ok(None)
            }
            FRAME_GOAWAY => {
                if payload.len() < 8 {
                    return Err(frame_size_error());
                }

                let last_stream_id =
                    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff;
                let code = ErrorCode::from_u32(u32::from_be_bytes([
                    payload[4], payload[5], payload[6], payload[7],
                ]));

                debug!("http2 goaway received, code={:?}", code);

                self.closed = true;
                self.transport.borrow_mut().close();

                Ok(Some(Event::GoAway {
                    last_stream_id,
                    code,
                }))
            }
            FRAME_PUSH_PROMISE => Err(protocol_error()),
            // stream-level frames for streams we have refused
            FRAME_DATA | FRAME_PRIORITY | FRAME_RST_STREAM | FRAME_WINDOW_UPDATE => Ok(None),
            // unknown frame types must be ignored
            _ => Ok(None),
        }
    }

    fn handle_settings(&mut self, h: &FrameHeader, payload: &[u8]) -> Result<(), Error> {
        if h.stream_id != 0 {
            return Err(protocol_error());
        }

        if h.flags & FLAG_ACK != 0 {
            if !payload.is_empty() {
                return Err(frame_size_error());
            }

            return Ok(());
        }

        if payload.len() % SETTING_SIZE != 0 {
            return Err(frame_size_error());
        }

        for s in payload.chunks(SETTING_SIZE) {
            let id = u16::from_be_bytes([s[0], s[1]]);
            let value = u32::from_be_bytes([s[2], s[3], s[4], s[5]]);

            debug!("http2 setting {}={}", id, value);
        }

        self.send(FRAME_SETTINGS, FLAG_ACK, 0, &[])
    }

    fn headers_complete(&mut self) -> Result<Event, Error> {
        let pending = match self.pending.take() {
            Some(p) => p,
            None => return Err(protocol_error()),
        };

        let headers = self.decoder.decode(&pending.block)?;

        if pending.stream_id > self.last_stream_id {
            self.last_stream_id = pending.stream_id;
        }

        debug!(
            "http2 request on stream {} refused, {} headers",
            pending.stream_id,
            headers.len()
        );

        self.send(
            FRAME_RST_STREAM,
            0,
            pending.stream_id,
            &(ErrorCode::RefusedStream as u32).to_be_bytes(),
        )?;

        Ok(Event::Request {
            stream_id: pending.stream_id,
            headers,
            end_stream: pending.end_stream,
        })
    }
}

// remove padding and priority fields from a HEADERS payload
fn strip_headers_payload(flags: u8, mut payload: Vec<u8>) -> Result<Vec<u8>, Error> {
    let mut start = 0;

    if flags & FLAG_PADDED != 0 {
        let pad_len = match payload.first() {
            Some(&b) => b as usize,
            None => return Err(frame_size_error()),
        };

        start = 1;

        if pad_len > payload.len() - start {
            return Err(protocol_error());
        }

        payload.truncate(payload.len() - pad_len);
    }

    if flags & FLAG_PRIORITY != 0 {
        if payload.len() < start + PRIORITY_SIZE {
            return Err(frame_size_error());
        }

        start += PRIORITY_SIZE;
    }

    Ok(payload.split_off(start))
}
