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

use std::cmp;

// compact once at least this many consumed bytes sit at the front
const COMPACT_MIN: usize = 4096;

/// A resumable read cursor over an accumulating byte buffer.
///
/// Data is appended with [`ByteCursor::push`] as it arrives from the
/// transport. Reads never block: if not enough bytes are available, the
/// read returns `None` and the cursor position is left untouched, so the
/// same read can be retried after more data has been pushed.
#[derive(Debug, Default)]
pub struct ByteCursor {
    buf: Vec<u8>,
    pos: usize,
}

impl ByteCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        if self.pos >= COMPACT_MIN && self.pos * 2 >= self.buf.len() {
            self.compact();
        }

        self.buf.extend_from_slice(data);
    }

    /// Unread bytes.
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    pub fn len(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn advance(&mut self, amount: usize) {
        assert!(amount <= self.len());

        self.pos += amount;

        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
    }

    /// Reads one line terminated by `\n`, returning it without the line
    /// ending. A trailing `\r` is stripped. Returns `None` if no complete
    /// line is buffered yet.
    pub fn read_line(&mut self) -> Option<Vec<u8>> {
        let src = self.remaining();

        let end = src.iter().position(|b| *b == b'\n')?;

        let mut line = &src[..end];
        if let Some((b'\r', rest)) = line.split_last() {
            line = rest;
        }

        let line = line.to_vec();

        self.advance(end + 1);

        Some(line)
    }

    /// Reads exactly `size` bytes, or nothing if fewer are buffered.
    pub fn read_exact(&mut self, size: usize) -> Option<Vec<u8>> {
        if self.len() < size {
            return None;
        }

        let out = self.remaining()[..size].to_vec();

        self.advance(size);

        Some(out)
    }

    /// Reads up to `max` bytes, possibly none.
    pub fn take_up_to(&mut self, max: usize) -> Vec<u8> {
        let size = cmp::min(self.len(), max);

        let out = self.remaining()[..size].to_vec();

        self.advance(size);

        out
    }

    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.remaining().starts_with(prefix)
    }

    fn compact(&mut self) {
        self.buf.drain(..self.pos);
        self.pos = 0;
    }
}
