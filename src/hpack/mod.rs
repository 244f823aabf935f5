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

//! HPACK header compression (RFC 7541).
//!
//! Field representations are told apart by the high bits of their first
//! byte:
//!
//! ```text
//! 1xxxxxxx  indexed field, 7-bit index
//! 01xxxxxx  literal with incremental indexing, 6-bit name index
//! 001xxxxx  dynamic table size update, 5-bit size
//! 0001xxxx  literal never indexed, 4-bit name index
//! 0000xxxx  literal without indexing, 4-bit name index
//! ```

pub mod huffman;
pub mod table;

use log::debug;
use std::borrow::Cow;
use table::{IndexTable, Match};

pub use table::DEFAULT_TABLE_SIZE;

pub type HeaderField = (String, String);

// set-cookie is the only name whose values are kept out of the table
const SET_COOKIE: &str = "set-cookie";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    #[error("integer overflow")]
    IntegerOverflow,

    #[error("header block truncated")]
    Truncated,

    #[error("invalid table index {0}")]
    InvalidIndex(usize),

    #[error("invalid huffman code")]
    InvalidHuffmanCode,

    #[error("invalid huffman padding")]
    InvalidPadding,

    #[error("table size update {0} exceeds allowed maximum")]
    TableSizeExceeded(usize),
}

pub fn encode_integer(value: usize, prefix_bits: u8, flags: u8, dest: &mut Vec<u8>) {
    assert!(prefix_bits >= 1 && prefix_bits <= 8);

    let max = (1usize << prefix_bits) - 1;

    if value < max {
        dest.push(flags | value as u8);
        return;
    }

    dest.push(flags | max as u8);

    let mut value = value - max;

    while value >= 0x80 {
        dest.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }

    dest.push(value as u8);
}

/// Returns the value and the number of bytes it occupied.
pub fn decode_integer(src: &[u8], prefix_bits: u8) -> Result<(usize, usize), Error> {
    assert!(prefix_bits >= 1 && prefix_bits <= 8);

    let first = match src.first() {
        Some(b) => *b,
        None => return Err(Error::Truncated),
    };

    let max = (1usize << prefix_bits) - 1;

    let mut value = first as usize & max;
    if value < max {
        return Ok((value, 1));
    }

    let mut shift = 0;

    for (i, b) in src[1..].iter().enumerate() {
        if shift > usize::BITS - 8 {
            return Err(Error::IntegerOverflow);
        }

        value = value
            .checked_add(((b & 0x7f) as usize) << shift)
            .ok_or(Error::IntegerOverflow)?;

        if b & 0x80 == 0 {
            return Ok((value, i + 2));
        }

        shift += 7;
    }

    Err(Error::Truncated)
}

pub fn encode_string(s: &str, use_huffman: bool, dest: &mut Vec<u8>) {
    let s = s.as_bytes();

    if use_huffman {
        let len = huffman::encoded_len(s);

        if len < s.len() {
            encode_integer(len, 7, 0x80, dest);
            huffman::encode(s, dest);
            return;
        }
    }

    encode_integer(s.len(), 7, 0, dest);
    dest.extend_from_slice(s);
}

pub fn decode_string(src: &[u8]) -> Result<(String, usize), Error> {
    let is_huffman = match src.first() {
        Some(b) => b & 0x80 != 0,
        None => return Err(Error::Truncated),
    };

    let (len, offset) = decode_integer(src, 7)?;

    let end = offset.checked_add(len).ok_or(Error::IntegerOverflow)?;
    if end > src.len() {
        return Err(Error::Truncated);
    }

    let data = &src[offset..end];

    let s = if is_huffman {
        let mut out = Vec::with_capacity(len * 8 / 5);
        huffman::decode(data, &mut out)?;

        String::from_utf8_lossy(&out).into_owned()
    } else {
        String::from_utf8_lossy(data).into_owned()
    };

    Ok((s, end))
}

pub struct Decoder {
    table: IndexTable,
    max_allowed: usize,
}

impl Decoder {
    pub fn new(max_allowed: usize) -> Self {
        Self {
            table: IndexTable::new(max_allowed),
            max_allowed,
        }
    }

    pub fn table(&self) -> &IndexTable {
        &self.table
    }

    /// Set the largest table size the peer may switch to. Shrinks the
    /// table right away if needed.
    pub fn set_max_allowed(&mut self, max_allowed: usize) {
        self.max_allowed = max_allowed;

        if self.table.max_size() > max_allowed {
            self.table.set_max_size(max_allowed);
        }
    }

    pub fn decode(&mut self, mut src: &[u8]) -> Result<Vec<HeaderField>, Error> {
        let mut fields = Vec::new();

        while let Some(&b) = src.first() {
            let size = if b & 0x80 != 0 {
                let (index, size) = decode_integer(src, 7)?;

                let (name, value) = self.table.get(index).ok_or(Error::InvalidIndex(index))?;
                fields.push((name.to_string(), value.to_string()));

                size
            } else if b & 0xc0 == 0x40 {
                let (name, value, size) = self.read_literal(src, 6)?;

                self.table.insert(name.clone(), value.clone());
                fields.push((name, value));

                size
            } else if b & 0xe0 == 0x20 {
                let (max_size, size) = decode_integer(src, 5)?;

                if max_size > self.max_allowed {
                    return Err(Error::TableSizeExceeded(max_size));
                }

                debug!("hpack: table size update {}", max_size);

                self.table.set_max_size(max_size);

                size
            } else {
                // without indexing and never indexed share the same layout
                let (name, value, size) = self.read_literal(src, 4)?;
                fields.push((name, value));

                size
            };

            src = &src[size..];
        }

        Ok(fields)
    }

    fn read_literal(&self, src: &[u8], prefix_bits: u8) -> Result<(String, String, usize), Error> {
        let (index, mut pos) = decode_integer(src, prefix_bits)?;

        let name = if index == 0 {
            let (name, size) = decode_string(&src[pos..])?;
            pos += size;

            name
        } else {
            match self.table.get(index) {
                Some((name, _)) => name.to_string(),
                None => return Err(Error::InvalidIndex(index)),
            }
        };

        let (value, size) = decode_string(&src[pos..])?;
        pos += size;

        Ok((name, value, pos))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE_SIZE)
    }
}

pub struct Encoder {
    table: IndexTable,
    use_huffman: bool,
    pending_size_update: Option<usize>,
}

impl Encoder {
    pub fn new(max_size: usize, use_huffman: bool) -> Self {
        Self {
            table: IndexTable::new(max_size),
            use_huffman,
            pending_size_update: None,
        }
    }

    pub fn table(&self) -> &IndexTable {
        &self.table
    }

    /// Change the table size. The update is signaled at the start of the
    /// next header block.
    pub fn set_max_size(&mut self, max_size: usize) {
        self.table.set_max_size(max_size);
        self.pending_size_update = Some(max_size);
    }

    pub fn encode<'a, I>(&mut self, fields: I, dest: &mut Vec<u8>)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        if let Some(size) = self.pending_size_update.take() {
            encode_integer(size, 5, 0x20, dest);
        }

        for (name, value) in fields {
            let name = lowercase(name);

            self.encode_field(&name, value, dest);
        }
    }

    fn encode_field(&mut self, name: &str, value: &str, dest: &mut Vec<u8>) {
        let found = self.table.find(name, value);

        if name == SET_COOKIE {
            let index = match found {
                Some(Match::Full(i)) | Some(Match::Name(i)) => i,
                None => 0,
            };

            self.write_literal(index, 4, 0x00, name, value, dest);
            return;
        }

        match found {
            Some(Match::Full(index)) => encode_integer(index, 7, 0x80, dest),
            Some(Match::Name(index)) => {
                self.write_literal(index, 6, 0x40, name, value, dest);
                self.table.insert(name.to_string(), value.to_string());
            }
            None => {
                self.write_literal(0, 6, 0x40, name, value, dest);
                self.table.insert(name.to_string(), value.to_string());
            }
        }
    }

    fn write_literal(
        &self,
        name_index: usize,
        prefix_bits: u8,
        flags: u8,
        name: &str,
        value: &str,
        dest: &mut Vec<u8>,
    ) {
        encode_integer(name_index, prefix_bits, flags, dest);

        if name_index == 0 {
            encode_string(name, self.use_huffman, dest);
        }

        encode_string(value, self.use_huffman, dest);
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE_SIZE, true)
    }
}

fn lowercase(s: &str) -> Cow<'_, str> {
    if s.bytes().any(|b| b.is_ascii_uppercase()) {
        Cow::Owned(s.to_ascii_lowercase())
    } else {
        Cow::Borrowed(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn fields(v: &[(&str, &str)]) -> Vec<HeaderField> {
        v.iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn integer_vectors() {
        assert_eq!(decode_integer(b"\xfe", 7), Ok((126, 1)));
        assert_eq!(decode_integer(b"\xff\x00", 7), Ok((127, 2)));
        assert_eq!(decode_integer(b"\xff\x80\x01", 7), Ok((255, 3)));
        assert_eq!(decode_integer(b"\x1f\x9a\x0a", 5), Ok((1337, 3)));
        assert_eq!(decode_integer(b"\xff\x80", 7), Err(Error::Truncated));
        assert_eq!(decode_integer(b"", 7), Err(Error::Truncated));

        let mut out = Vec::new();
        encode_integer(16800722, 7, 0x80, &mut out);
        assert_eq!(out, b"\xff\xd3\xb6\x81\x08");

        let mut out = Vec::new();
        encode_integer(1337, 5, 0, &mut out);
        assert_eq!(out, b"\x1f\x9a\x0a");
    }

    #[test]
    fn integer_overflow() {
        let mut src = vec![0xff];
        src.extend(std::iter::repeat(0xff).take(12));
        src.push(0x01);

        assert_eq!(decode_integer(&src, 7), Err(Error::IntegerOverflow));
    }

    #[test]
    fn integer_round_trip() {
        let mut buf = Vec::with_capacity(8);

        for prefix in 1..=7 {
            for n in 0..(1 << 20) {
                buf.clear();
                encode_integer(n, prefix, 0, &mut buf);

                assert_eq!(decode_integer(&buf, prefix), Ok((n, buf.len())));
            }
        }
    }

    #[test]
    fn decode_static_entries() {
        let mut dec = Decoder::default();

        assert_eq!(
            dec.decode(b"\x82").unwrap(),
            fields(&[(":method", "GET")])
        );
        assert_eq!(
            dec.decode(b"\x86").unwrap(),
            fields(&[(":scheme", "http")])
        );
        assert!(dec.table().is_empty());
    }

    #[test]
    fn decode_literals() {
        let mut dec = Decoder::default();

        assert_eq!(
            dec.decode(b"@\ncustom-key\rcustom-header").unwrap(),
            fields(&[("custom-key", "custom-header")])
        );
        assert_eq!(dec.table().len(), 1);
        assert_eq!(dec.table().size(), 55);

        // without indexing, name from the static table
        assert_eq!(
            dec.decode(b"\x04\x0c/sample/path").unwrap(),
            fields(&[(":path", "/sample/path")])
        );
        assert_eq!(dec.table().len(), 1);

        // never indexed, literal name
        assert_eq!(
            dec.decode(b"\x10\x08password\x06secret").unwrap(),
            fields(&[("password", "secret")])
        );
        assert_eq!(dec.table().len(), 1);
    }

    #[test]
    fn decode_huffman_request() {
        let mut dec = Decoder::default();

        let out = dec
            .decode(b"\x82\x86\x84A\x8c\xf1\xe3\xc2\xe5\xf2:k\xa0\xab\x90\xf4\xff")
            .unwrap();

        assert_eq!(
            out,
            fields(&[
                (":method", "GET"),
                (":scheme", "http"),
                (":path", "/"),
                (":authority", "www.example.com"),
            ])
        );

        assert_eq!(dec.table().get(62), Some((":authority", "www.example.com")));
    }

    #[test]
    fn decode_errors() {
        let mut dec = Decoder::default();
        assert_eq!(dec.decode(b"\xbe"), Err(Error::InvalidIndex(62)));
        assert_eq!(dec.decode(b"\x80"), Err(Error::InvalidIndex(0)));
        assert_eq!(dec.decode(b"\x41\x05abc"), Err(Error::Truncated));

        let mut dec = Decoder::new(256);
        assert_eq!(
            dec.decode(b"\x3f\xe1\x1f"),
            Err(Error::TableSizeExceeded(4096))
        );

        let mut dec = Decoder::default();
        assert_eq!(dec.decode(b"\x3f\xe1\x1f"), Ok(Vec::new()));
        assert_eq!(dec.decode(b"\x20"), Ok(Vec::new()));
        assert_eq!(dec.table().max_size(), 0);
    }

    // RFC 7541 appendix C.4: three requests sharing one connection
    const REQUESTS: &[(&[(&str, &str)], &[u8])] = &[
        (
            &[
                (":method", "GET"),
                (":scheme", "http"),
                (":path", "/"),
                (":authority", "www.example.com"),
            ],
            b"\x82\x86\x84\x41\x8c\xf1\xe3\xc2\xe5\xf2\x3a\x6b\xa0\xab\x90\xf4\xff",
        ),
        (
            &[
                (":method", "GET"),
                (":scheme", "http"),
                (":path", "/"),
                (":authority", "www.example.com"),
                ("cache-control", "no-cache"),
            ],
            b"\x82\x86\x84\xbe\x58\x86\xa8\xeb\x10\x64\x9c\xbf",
        ),
        (
            &[
                (":method", "GET"),
                (":scheme", "https"),
                (":path", "/index.html"),
                (":authority", "www.example.com"),
                ("custom-key", "custom-value"),
            ],
            b"\x82\x87\x85\xbf\x40\x88\x25\xa8\x49\xe9\x5b\xa9\x7d\x7f\x89\x25\xa8\x49\xe9\x5b\xb8\xe8\xb4\xbf",
        ),
    ];

    #[test]
    fn encode_request_sequence() {
        let mut enc = Encoder::default();

        for (headers, expected) in REQUESTS {
            let mut out = Vec::new();
            enc.encode(headers.iter().copied(), &mut out);

            assert_eq!(&out, expected);
        }

        assert_eq!(enc.table().len(), 3);
        assert_eq!(enc.table().size(), 164);
    }

    #[test]
    fn decode_request_sequence() {
        let mut dec = Decoder::default();

        for (headers, block) in REQUESTS {
            assert_eq!(dec.decode(block).unwrap(), fields(headers));
        }

        assert_eq!(dec.table().get(62), Some(("custom-key", "custom-value")));
        assert_eq!(dec.table().get(63), Some(("cache-control", "no-cache")));
        assert_eq!(dec.table().get(64), Some((":authority", "www.example.com")));
        assert_eq!(dec.table().size(), 164);
    }

    #[test]
    fn set_cookie_never_enters_table() {
        let mut enc = Encoder::new(DEFAULT_TABLE_SIZE, false);
        let mut dec = Decoder::default();

        let headers = [("set-cookie", "id=abc; Path=/"), ("Set-Cookie", "b=2")];

        let mut out = Vec::new();
        enc.encode(headers.iter().copied(), &mut out);

        // literal without indexing, static name index 55
        assert_eq!(&out[..2], b"\x0f\x28");
        assert!(enc.table().is_empty());

        assert_eq!(
            dec.decode(&out).unwrap(),
            fields(&[("set-cookie", "id=abc; Path=/"), ("set-cookie", "b=2")])
        );
        assert!(dec.table().is_empty());
    }

    #[test]
    fn size_update_is_signaled() {
        let mut enc = Encoder::new(DEFAULT_TABLE_SIZE, false);
        let mut dec = Decoder::default();

        enc.set_max_size(0);

        let mut out = Vec::new();
        enc.encode([("x-a", "1")].iter().copied(), &mut out);

        assert_eq!(out[0], 0x20);
        assert_eq!(dec.decode(&out).unwrap(), fields(&[("x-a", "1")]));
        assert_eq!(dec.table().max_size(), 0);
        assert!(dec.table().is_empty());
    }
}
