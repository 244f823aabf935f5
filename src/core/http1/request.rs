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

use crate::core::http1::params::ParamMap;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Trace,
    Options,
    Connect,
    Patch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Trace => "TRACE",
            Self::Options => "OPTIONS",
            Self::Connect => "CONNECT",
            Self::Patch => "PATCH",
        }
    }
}

impl FromStr for Method {
    type Err = ();

    // case-sensitive, as methods are
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Self::Get),
            "HEAD" => Ok(Self::Head),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "TRACE" => Ok(Self::Trace),
            "OPTIONS" => Ok(Self::Options),
            "CONNECT" => Ok(Self::Connect),
            "PATCH" => Ok(Self::Patch),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered multimap of lower-cased header names to their values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(String, Vec<String>)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: &str, value: String) {
        let name = name.to_ascii_lowercase();

        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((name, vec![value])),
        }
    }

    /// All values of a header, in arrival order.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    /// The combined value of a header. Repeated `Cookie` headers are joined
    /// with `"; "`, `Set-Cookie` yields only its first value, and anything
    /// else is joined with `", "`.
    pub fn get(&self, name: &str) -> Option<String> {
        let values = self.get_all(name);

        if values.is_empty() {
            return None;
        }

        if name.eq_ignore_ascii_case("set-cookie") {
            return Some(values[0].clone());
        }

        let sep = if name.eq_ignore_ascii_case("cookie") {
            "; "
        } else {
            ", "
        };

        Some(values.join(sep))
    }

    pub fn contains(&self, name: &str) -> bool {
        !self.get_all(name).is_empty()
    }

    pub(crate) fn last_value_mut(&mut self) -> Option<&mut String> {
        self.entries.last_mut().and_then(|(_, v)| v.last_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(n, values)| values.iter().map(move |v| (n.as_str(), v.as_str())))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One parsed HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub target: String,
    pub version: (u8, u8),
    pub headers: Headers,
    // first occurrence of a name wins
    pub cookies: Vec<(String, String)>,
    pub params: ParamMap,
    pub body: Vec<u8>,

    pub client_ip: Option<String>,
    pub scheme: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: String,
    pub original_path: String,
    pub query: String,

    pub headers_complete: bool,
    pub body_complete: bool,
    pub received: Instant,

    /// Caller-defined data attached to the request.
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

impl Request {
    pub fn new(method: Method, target: &str, version: (u8, u8)) -> Self {
        Self {
            method,
            target: target.to_string(),
            version,
            headers: Headers::new(),
            cookies: Vec::new(),
            params: ParamMap::new(),
            body: Vec::new(),
            client_ip: None,
            scheme: "http".to_string(),
            host: None,
            port: None,
            path: String::new(),
            original_path: String::new(),
            query: String::new(),
            headers_complete: false,
            body_complete: false,
            received: Instant::now(),
            extensions: serde_json::Map::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers.get(name)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::Head
    }

    pub fn version_str(&self) -> String {
        format!("HTTP/{}.{}", self.version.0, self.version.1)
    }

    pub(crate) fn add_cookie(&mut self, name: String, value: String) {
        if self.cookie(&name).is_none() {
            self.cookies.push((name, value));
        }
    }

    /// Derive the connection metadata from the request line and headers.
    pub(crate) fn apply_metadata(&mut self, peer_addr: Option<&str>, secure: bool) {
        self.client_ip = match self.headers.get("x-forwarded-for") {
            Some(v) => v.split(',').next().map(|s| s.trim().to_string()),
            None => peer_addr.map(|s| s.to_string()),
        };

        self.scheme = match self.headers.get("x-forwarded-proto") {
            Some(v) => v.split(',').next().unwrap_or("").trim().to_ascii_lowercase(),
            None if secure => "https".to_string(),
            None => "http".to_string(),
        };

        if let Some(host) = self.headers.get("host") {
            let (host, port) = split_host_port(host.trim());
            self.host = Some(host.to_string());
            self.port = port;
        }

        let (path, query) = match self.target.find('?') {
            Some(pos) => (&self.target[..pos], &self.target[(pos + 1)..]),
            None => (self.target.as_str(), ""),
        };

        self.original_path = path.to_string();
        self.query = query.to_string();

        self.path = if path.len() > 1 && path.ends_with('/') {
            path[..(path.len() - 1)].to_string()
        } else {
            path.to_string()
        };
    }
}

fn split_host_port(s: &str) -> (&str, Option<u16>) {
    // bracketed ipv6 literal
    if s.starts_with('[') {
        if let Some(end) = s.find(']') {
            let port = s[(end + 1)..].strip_prefix(':').and_then(|p| p.parse().ok());
            return (&s[..=end], port);
        }
    }

    match s.rfind(':') {
        Some(pos) if !s[..pos].contains(':') => (&s[..pos], s[(pos + 1)..].parse().ok()),
        _ => (s, None),
    }
}
