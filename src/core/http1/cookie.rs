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

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::fmt::Write;
use time::macros::format_description;
use time::{Duration, OffsetDateTime};

// everything but [A-Za-z0-9*._-] is escaped
const COOKIE_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'*')
    .remove(b'.')
    .remove(b'_')
    .remove(b'-');

pub const DELETED_VALUE: &str = "deleted";

fn ten_years() -> Duration {
    Duration::days(3650)
}

pub fn format_http_date(t: OffsetDateTime) -> String {
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );

    t.to_offset(time::UtcOffset::UTC)
        .format(&format)
        .unwrap_or_default()
}

/// Cookie names may not contain controls, whitespace or separators.
pub fn is_valid_cookie_name(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b > 0x20 && b != 0x7f && !b"()<>@,;:\\\"/[]?={}".contains(&b)
        })
}

pub fn encode_cookie_value(s: &str) -> String {
    utf8_percent_encode(s, COOKIE_VALUE).to_string()
}

pub fn decode_cookie_value(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

/// Split a `Cookie` header into percent-decoded pairs. Pairs are
/// separated by `;` or `,`.
pub fn parse_cookie_header(value: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();

    for part in value.split(|c| c == ';' || c == ',') {
        let part = part.trim_start();

        let (name, value) = match part.find('=') {
            Some(pos) => (&part[..pos], &part[(pos + 1)..]),
            None => (part, ""),
        };

        let name = name.trim();
        if name.is_empty() {
            continue;
        }

        out.push((decode_cookie_value(name), decode_cookie_value(value.trim_end())));
    }

    out
}

/// The `name=value` part of a `Set-Cookie` header, without attributes.
pub fn parse_set_cookie(value: &str) -> Option<(String, String)> {
    let first = value.split(';').next()?;
    let pos = first.find('=')?;

    let name = first[..pos].trim();
    if name.is_empty() {
        return None;
    }

    Some((
        decode_cookie_value(name),
        decode_cookie_value(first[(pos + 1)..].trim()),
    ))
}

#[derive(Debug, Clone)]
pub struct CookieOptions {
    pub max_age: Option<u64>,
    pub expires: Option<OffsetDateTime>,
    pub path: String,
    pub domain: Option<String>,
    pub secure: bool,
    pub http_only: bool,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            max_age: None,
            expires: None,
            path: "/".to_string(),
            domain: None,
            secure: false,
            http_only: false,
        }
    }
}

/// Serialize a cookie for `Set-Cookie`, minus the header name. A `None`
/// value deletes the cookie by expiring it in the past. The caller has
/// already validated the name.
pub fn serialize_cookie(
    name: &str,
    value: Option<&str>,
    opts: &CookieOptions,
    now: OffsetDateTime,
) -> String {
    let mut out = String::new();

    let expires = match value {
        Some(v) => {
            out.push_str(name);
            out.push('=');
            out.push_str(&encode_cookie_value(v));

            opts.expires.unwrap_or(now + ten_years())
        }
        None => {
            out.push_str(name);
            out.push('=');
            out.push_str(DELETED_VALUE);

            now - ten_years()
        }
    };

    match (value, opts.max_age) {
        (Some(_), Some(max_age)) => {
            let _ = write!(out, "; Max-Age={}", max_age);
        }
        _ => {
            let _ = write!(out, "; Expires={}", format_http_date(expires));
        }
    }

    let _ = write!(out, "; Path={}", opts.path);

    if let Some(domain) = &opts.domain {
        let _ = write!(out, "; Domain={}", domain);
    }

    if opts.secure {
        out.push_str("; Secure");
    }

    if opts.http_only {
        out.push_str("; HttpOnly");
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn http_date() {
        let t = datetime!(2013-10-21 20:13:21 UTC);
        assert_eq!(format_http_date(t), "Mon, 21 Oct 2013 20:13:21 GMT");
    }

    #[test]
    fn cookie_names() {
        assert!(is_valid_cookie_name("session_id"));
        assert!(is_valid_cookie_name("magic_flash_notice"));

        for name in ["", "a b", "a;b", "a=b", "a\tb", "a\"b", "(x)", "a/b", "a\x7f"] {
            assert!(!is_valid_cookie_name(name), "{:?}", name);
        }
    }

    #[test]
    fn parse_header() {
        let cookies = parse_cookie_header("a=1; b=hello%20world,c=x=y; d; a=2");

        assert_eq!(
            cookies,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "hello world".to_string()),
                ("c".to_string(), "x=y".to_string()),
                ("d".to_string(), "".to_string()),
                ("a".to_string(), "2".to_string()),
            ]
        );

        // no '+' decoding in cookies
        assert_eq!(parse_cookie_header("p=a+b")[0].1, "a+b");
    }

    #[test]
    fn parse_set_cookie_header() {
        assert_eq!(
            parse_set_cookie("id=a%3Bb; Path=/; HttpOnly"),
            Some(("id".to_string(), "a;b".to_string()))
        );
        assert_eq!(parse_set_cookie("garbage"), None);
    }

    #[test]
    fn serialize() {
        let now = datetime!(2020-01-01 00:00:00 UTC);

        let s = serialize_cookie("name", Some("a b;c"), &CookieOptions::default(), now);
        assert_eq!(
            s,
            "name=a%20b%3Bc; Expires=Sat, 30 Dec 2029 00:00:00 GMT; Path=/"
        );

        let opts = CookieOptions {
            max_age: Some(60),
            domain: Some("example.com".to_string()),
            secure: true,
            http_only: true,
            ..Default::default()
        };

        let s = serialize_cookie("n", Some("v*._-"), &opts, now);
        assert_eq!(
            s,
            "n=v*._-; Max-Age=60; Path=/; Domain=example.com; Secure; HttpOnly"
        );

        let s = serialize_cookie("n", None, &opts, now);
        assert_eq!(
            s,
            "n=deleted; Expires=Sun, 03 Jan 2010 00:00:00 GMT; Path=/; Domain=example.com; Secure; HttpOnly"
        );
    }
}
