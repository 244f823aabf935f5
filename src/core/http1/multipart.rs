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

//! `multipart/form-data` body decoding.
//!
//! Plain fields become ordinary params. A part carrying its own
//! `Content-Type` is stored as a sub-map: `name[data]` holds the raw bytes,
//! `name[type]` the content type, and every other disposition parameter
//! (usually `filename`) sits beside them. Nested multipart parts are
//! decoded recursively with the parent field name as prefix.

use crate::core::http1::params::{
    add_param, add_param_or_raw, coerce_value, ParamMap, ParamValue,
};
use crate::core::http1::util::header_params;
use log::{debug, warn};
use std::str;

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() || needle.is_empty() {
        return None;
    }

    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| from + pos)
}

/// Split a body into the raw contents of each part, headers included.
fn split_parts<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let delim = format!("--{}", boundary);
    let delim = delim.as_bytes();

    let mut parts = Vec::new();

    let mut pos = match find(body, delim, 0) {
        Some(pos) => pos + delim.len(),
        None => return parts,
    };

    loop {
        // closing delimiter
        if body[pos..].starts_with(b"--") {
            break;
        }

        let start = match find(body, b"\n", pos) {
            Some(nl) => nl + 1,
            None => break,
        };

        let mut next_delim = Vec::with_capacity(delim.len() + 2);
        next_delim.extend_from_slice(b"\r\n");
        next_delim.extend_from_slice(delim);

        let end = match find(body, &next_delim, start) {
            Some(end) => end,
            None => {
                warn!("multipart: unterminated part");
                break;
            }
        };

        parts.push(&body[start..end]);

        pos = end + next_delim.len();
    }

    parts
}

struct Part<'a> {
    headers: Vec<(String, String)>,
    data: &'a [u8],
}

impl<'a> Part<'a> {
    fn parse(raw: &'a [u8]) -> Self {
        let (head, data) = if raw.starts_with(b"\r\n") {
            (&raw[..0], &raw[2..])
        } else {
            match find(raw, b"\r\n\r\n", 0) {
                Some(pos) => (&raw[..pos], &raw[(pos + 4)..]),
                None => (raw, &raw[raw.len()..]),
            }
        };

        let mut headers = Vec::new();

        for line in String::from_utf8_lossy(head).split("\r\n") {
            if let Some(pos) = line.find(':') {
                headers.push((
                    line[..pos].trim().to_ascii_lowercase(),
                    line[(pos + 1)..].trim().to_string(),
                ));
            }
        }

        Self { headers, data }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn add_or_warn(map: &mut ParamMap, name: &str, value: ParamValue) {
    if let Err(e) = add_param(map, name, value) {
        warn!("multipart field {:?}: {}", name, e);
    }
}

fn decode_part(map: &mut ParamMap, part: &Part, prefix: Option<&str>) {
    let disposition = part.header("content-disposition").and_then(header_params);
    let disp_params = disposition.map(|(_, params)| params).unwrap_or_default();

    let name = match (param(&disp_params, "name"), prefix) {
        (Some(name), Some(prefix)) => format!("{}[{}]", prefix, name),
        (Some(name), None) => name.to_string(),
        (None, Some(prefix)) => format!("{}[]", prefix),
        (None, None) => {
            warn!("multipart: part without a field name, skipping");
            return;
        }
    };

    let content_type = match part.header("content-type") {
        Some(ct) => ct,
        None => {
            let s = String::from_utf8_lossy(part.data).into_owned();
            add_param_or_raw(map, &name, coerce_value(s.clone()), &s);
            return;
        }
    };

    if let Some((mime, ct_params)) = header_params(content_type) {
        if mime.starts_with("multipart/") {
            match param(&ct_params, "boundary") {
                Some(boundary) => decode_multipart_into(map, part.data, boundary, Some(&name)),
                None => warn!("multipart: nested part {:?} has no boundary", name),
            }

            return;
        }
    }

    add_or_warn(
        map,
        &format!("{}[data]", name),
        ParamValue::Bytes(part.data.to_vec()),
    );
    add_or_warn(map, &format!("{}[type]", name), content_type.into());

    for (k, v) in disp_params.iter().filter(|(k, _)| k != "name") {
        add_or_warn(map, &format!("{}[{}]", name, k), v.as_str().into());
    }
}

/// Decode a multipart body into `map`. Malformed parts are logged and
/// skipped.
pub fn decode_multipart_into(map: &mut ParamMap, body: &[u8], boundary: &str, prefix: Option<&str>) {
    let parts = split_parts(body, boundary);

    debug!("multipart: {} parts", parts.len());

    for raw in parts {
        decode_part(map, &Part::parse(raw), prefix);
    }
}
