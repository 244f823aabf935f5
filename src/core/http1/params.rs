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

//! Query string and form parameter decoding.
//!
//! Names use bracket notation to build nested values: `a[b][c]=1` nests
//! maps, a purely numeric segment such as `a[0]` becomes an integer key,
//! and a trailing `a[]` appends to a list. Writing a name that already
//! holds a value turns it into a list of all values, in arrival order.

use log::warn;
use percent_encoding::percent_decode_str;
use std::fmt;
use std::mem;
use url::form_urlencoded::byte_serialize;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParamError {
    #[error("invalid parameter name")]
    InvalidName,

    #[error("parameter conflicts with an existing value")]
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamKey {
    Name(String),
    Index(i64),
}

impl From<&str> for ParamKey {
    fn from(s: &str) -> Self {
        Self::Name(s.to_string())
    }
}

impl From<i64> for ParamKey {
    fn from(i: i64) -> Self {
        Self::Index(i)
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(s) => f.write_str(s),
            Self::Index(i) => write!(f, "{}", i),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Bytes(Vec<u8>),
    List(Vec<ParamValue>),
    Map(ParamMap),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ParamMap> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ParamValue]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<i64> for ParamValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Insertion-ordered map of parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamMap {
    entries: Vec<(ParamKey, ParamValue)>,
}

impl ParamMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<K: Into<ParamKey>>(&self, key: K) -> Option<&ParamValue> {
        let key = key.into();

        self.entries.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &ParamKey) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Set a value, replacing any previous one.
    pub fn insert(&mut self, key: ParamKey, value: ParamValue) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParamKey, &ParamValue)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn get_or_insert_with<F>(&mut self, key: ParamKey, f: F) -> &mut ParamValue
    where
        F: FnOnce() -> ParamValue,
    {
        let pos = match self.entries.iter().position(|(k, _)| *k == key) {
            Some(pos) => pos,
            None => {
                self.entries.push((key, f()));
                self.entries.len() - 1
            }
        };

        &mut self.entries[pos].1
    }

    /// Write a value under `key`, turning an existing value into a list
    /// rather than replacing it.
    pub fn coalesce(&mut self, key: ParamKey, value: ParamValue) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, ParamValue::List(l))) => l.push(value),
            Some((_, existing)) => {
                let old = mem::replace(existing, ParamValue::List(Vec::new()));
                *existing = ParamValue::List(vec![old, value]);
            }
            None => self.entries.push((key, value)),
        }
    }
}

/// `"true"` and `"false"` become booleans and all-digit strings become
/// integers. Everything else stays a string.
pub fn coerce_value(s: String) -> ParamValue {
    match s.as_str() {
        "true" => return ParamValue::Bool(true),
        "false" => return ParamValue::Bool(false),
        _ => {}
    }

    if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(i) = s.parse() {
            return ParamValue::Int(i);
        }
    }

    ParamValue::Str(s)
}

/// Decode `+` as space, then percent escapes, then numeric character
/// references such as `&#233;`.
pub fn form_decode(s: &str) -> String {
    let s = s.replace('+', " ");
    let s = percent_decode_str(&s).decode_utf8_lossy();

    decode_char_refs(&s)
}

fn decode_char_refs(s: &str) -> String {
    if !s.contains("&#") {
        return s.to_string();
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(pos) = rest.find("&#") {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];

        let decoded = rest[2..].find(';').and_then(|end| {
            let digits = &rest[2..(2 + end)];

            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }

            let c = digits.parse::<u32>().ok().and_then(char::from_u32)?;

            Some((c, 2 + end + 1))
        });

        match decoded {
            Some((c, size)) => {
                out.push(c);
                rest = &rest[size..];
            }
            None => {
                out.push_str("&#");
                rest = &rest[2..];
            }
        }
    }

    out.push_str(rest);

    out
}

fn to_key(seg: &str) -> ParamKey {
    if !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(i) = seg.parse() {
            return ParamKey::Index(i);
        }
    }

    ParamKey::Name(seg.to_string())
}

// split "a[b][]" into ("a", ["b", ""])
fn split_name(name: &str) -> Result<(&str, Vec<&str>), ParamError> {
    let (base, mut rest) = match name.find('[') {
        Some(pos) => (&name[..pos], &name[pos..]),
        None => (name, ""),
    };

    if base.is_empty() {
        return Err(ParamError::InvalidName);
    }

    let mut segs = Vec::new();

    while !rest.is_empty() {
        if !rest.starts_with('[') {
            return Err(ParamError::InvalidName);
        }

        let end = rest.find(']').ok_or(ParamError::InvalidName)?;

        segs.push(&rest[1..end]);
        rest = &rest[(end + 1)..];
    }

    Ok((base, segs))
}

fn insert_path(
    map: &mut ParamMap,
    key: ParamKey,
    segs: &[&str],
    value: ParamValue,
) -> Result<(), ParamError> {
    let (seg, rest) = match segs.split_first() {
        Some(s) => s,
        None => {
            map.coalesce(key, value);
            return Ok(());
        }
    };

    if seg.is_empty() {
        let slot = map.get_or_insert_with(key, || ParamValue::List(Vec::new()));

        if rest.is_empty() {
            match slot {
                ParamValue::List(l) => l.push(value),
                ParamValue::Map(_) => return Err(ParamError::Conflict),
                other => {
                    let old = mem::replace(other, ParamValue::List(Vec::new()));
                    *other = ParamValue::List(vec![old, value]);
                }
            }

            return Ok(());
        }

        // list of maps, as in a[][name]=x
        let list = match slot {
            ParamValue::List(l) => l,
            _ => return Err(ParamError::Conflict),
        };

        if rest[0].is_empty() {
            return Err(ParamError::InvalidName);
        }

        let next_key = to_key(rest[0]);

        let start_new = match list.last() {
            Some(ParamValue::Map(m)) => m.contains_key(&next_key),
            _ => true,
        };

        if start_new {
            list.push(ParamValue::Map(ParamMap::new()));
        }

        return match list.last_mut() {
            Some(ParamValue::Map(m)) => insert_path(m, next_key, &rest[1..], value),
            _ => Err(ParamError::Conflict),
        };
    }

    match map.get_or_insert_with(key, || ParamValue::Map(ParamMap::new())) {
        ParamValue::Map(child) => insert_path(child, to_key(seg), rest, value),
        _ => Err(ParamError::Conflict),
    }
}

/// Insert one decoded parameter, interpreting bracket notation in `name`.
pub fn add_param(map: &mut ParamMap, name: &str, value: ParamValue) -> Result<(), ParamError> {
    let (base, segs) = split_name(name)?;

    insert_path(map, ParamKey::Name(base.to_string()), &segs, value)
}

/// Insert a parameter, falling back to storing `raw_value` under the
/// literal `name` if the bracket notation can't be applied.
pub fn add_param_or_raw(map: &mut ParamMap, name: &str, value: ParamValue, raw_value: &str) {
    if let Err(e) = add_param(map, name, value) {
        warn!("param {:?}: {}, storing raw value", name, e);

        map.coalesce(ParamKey::Name(name.to_string()), raw_value.into());
    }
}

/// Decode a query string or `application/x-www-form-urlencoded` body into
/// `map`. Pairs are separated by `&` or `;`.
pub fn decode_params_into(map: &mut ParamMap, raw: &str) {
    for pair in raw.split(|c| c == '&' || c == ';') {
        if pair.is_empty() {
            continue;
        }

        let (raw_name, raw_value) = match pair.find('=') {
            Some(pos) => (&pair[..pos], &pair[(pos + 1)..]),
            None => (pair, ""),
        };

        let name = form_decode(raw_name);
        if name.is_empty() {
            continue;
        }

        let value = coerce_value(form_decode(raw_value));

        add_param_or_raw(map, &name, value, raw_value);
    }
}

pub fn decode_params(raw: &str) -> ParamMap {
    let mut map = ParamMap::new();

    decode_params_into(&mut map, raw);

    map
}

fn encode_component(s: &str) -> String {
    byte_serialize(s.as_bytes()).collect()
}

fn encode_value(prefix: &str, value: &ParamValue, out: &mut Vec<String>) {
    match value {
        ParamValue::Str(s) => out.push(format!("{}={}", prefix, encode_component(s))),
        ParamValue::Int(i) => out.push(format!("{}={}", prefix, i)),
        ParamValue::Bool(b) => out.push(format!("{}={}", prefix, b)),
        ParamValue::Bytes(b) => out.push(format!(
            "{}={}",
            prefix,
            byte_serialize(b).collect::<String>()
        )),
        ParamValue::List(items) => {
            let prefix = format!("{}[]", prefix);

            for item in items {
                encode_value(&prefix, item, out);
            }
        }
        ParamValue::Map(m) => {
            for (k, v) in m.iter() {
                let prefix = format!("{}[{}]", prefix, encode_component(&k.to_string()));

                encode_value(&prefix, v, out);
            }
        }
    }
}

/// Encode a parameter tree in bracket notation.
pub fn encode_params(map: &ParamMap) -> String {
    let mut out = Vec::new();

    for (k, v) in map.iter() {
        encode_value(&encode_component(&k.to_string()), v, &mut out);
    }

    out.join("&")
}

/// Convert JSON into a parameter value. `null` has no counterpart and
/// yields `None`, which drops it from any enclosing object or array.
pub fn from_json(value: serde_json::Value) -> Option<ParamValue> {
    use serde_json::Value;

    let v = match value {
        Value::Null => return None,
        Value::Bool(b) => ParamValue::Bool(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => ParamValue::Int(i),
            None => ParamValue::Str(n.to_string()),
        },
        Value::String(s) => ParamValue::Str(s),
        Value::Array(a) => ParamValue::List(a.into_iter().filter_map(from_json).collect()),
        Value::Object(o) => {
            let mut m = ParamMap::new();

            for (k, v) in o {
                if let Some(v) = from_json(v) {
                    m.insert(ParamKey::Name(k), v);
                }
            }

            ParamValue::Map(m)
        }
    };

    Some(v)
}

impl From<&ParamValue> for serde_json::Value {
    fn from(v: &ParamValue) -> Self {
        match v {
            ParamValue::Str(s) => Self::String(s.clone()),
            ParamValue::Int(i) => Self::from(*i),
            ParamValue::Bool(b) => Self::Bool(*b),
            ParamValue::Bytes(b) => Self::String(String::from_utf8_lossy(b).into_owned()),
            ParamValue::List(l) => Self::Array(l.iter().map(Self::from).collect()),
            ParamValue::Map(m) => Self::from(m),
        }
    }
}

impl From<&ParamMap> for serde_json::Value {
    fn from(m: &ParamMap) -> Self {
        Self::Object(
            m.iter()
                .map(|(k, v)| (k.to_string(), Self::from(v)))
                .collect(),
        )
    }
}
