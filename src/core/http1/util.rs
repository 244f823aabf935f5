/*
 * Copyright (C) 2020-2023 Fanout, Inc.
 * Copyright (C) 2023-2024 Fastly, Inc.
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

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("invalid header value")]
pub struct InvalidHeaderValue;

pub fn parse_as_int(src: &str) -> Option<u64> {
    let src = src.trim();

    if src.is_empty() || !src.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    src.parse().ok()
}

// check whether a comma-separated header value contains a token
pub fn header_contains_param(value: &str, param: &str, ignore_case: bool) -> bool {
    for part in value.split(',') {
        let part = part.trim();

        let matched = if ignore_case {
            part.eq_ignore_ascii_case(param)
        } else {
            part == param
        };

        if matched {
            return true;
        }
    }

    false
}

fn find_one_of(s: &str, values: &[u8]) -> Option<(usize, u8)> {
    s.bytes()
        .enumerate()
        .find(|(_, c)| values.contains(c))
}

fn skip_space(s: &str) -> &str {
    s.trim_start_matches(|c: char| c.is_ascii_whitespace())
}

// return (value, remainder). backslash escapes are kept as-is
fn parse_quoted(s: &str) -> Result<(&str, &str), InvalidHeaderValue> {
    let mut escaped = false;

    for (pos, c) in s.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            '"' if !escaped => return Ok((&s[..pos], &s[(pos + 1)..])),
            _ => escaped = false,
        }
    }

    Err(InvalidHeaderValue)
}

// return (value, remainder). remainder starts at the next ';' or ',' or
// is empty
fn parse_param_value(s: &str) -> Result<(&str, &str), InvalidHeaderValue> {
    let s = skip_space(s);

    if let Some(rest) = s.strip_prefix('"') {
        let (v, remainder) = parse_quoted(rest)?;

        Ok((v, skip_space(remainder)))
    } else {
        match find_one_of(s, b";,") {
            Some((pos, _)) => Ok((s[..pos].trim(), &s[pos..])),
            None => Ok((s.trim(), "")),
        }
    }
}

/// Iterates the `key=value` parameters following a header value element,
/// stopping at the next `,`.
pub struct HeaderParamsIterator<'a> {
    s: &'a str,
    done: bool,
}

impl<'a> HeaderParamsIterator<'a> {
    fn new(s: &'a str) -> Self {
        Self { s, done: false }
    }

    fn empty() -> Self {
        Self { s: "", done: true }
    }
}

impl<'a> Iterator for HeaderParamsIterator<'a> {
    type Item = Result<(&'a str, &'a str), InvalidHeaderValue>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let (k, v, remainder, done) = match find_one_of(self.s, b"=;,") {
            Some((pos, b'=')) => {
                let (v, remainder) = match parse_param_value(&self.s[(pos + 1)..]) {
                    Ok(ret) => ret,
                    Err(e) => return Some(Err(e)),
                };

                let (remainder, done) = match remainder.as_bytes().first() {
                    Some(b';') => (&remainder[1..], false),
                    Some(b',') => (remainder, true),
                    Some(_) => return Some(Err(InvalidHeaderValue)),
                    None => ("", true),
                };

                (&self.s[..pos], v, remainder, done)
            }
            Some((pos, b';')) => (&self.s[..pos], "", &self.s[(pos + 1)..], false),
            Some((pos, _)) => (&self.s[..pos], "", &self.s[pos..], true),
            None => (self.s, "", "", true),
        };

        let k = k.trim();

        if k.is_empty() {
            // tolerate a trailing ';'
            if done && v.is_empty() {
                self.done = true;
                self.s = remainder;
                return None;
            }

            return Some(Err(InvalidHeaderValue));
        }

        self.s = remainder;
        self.done = done;

        Some(Ok((k, v)))
    }
}

/// Iterates the comma-separated elements of a header value, each with its
/// parameters.
pub struct HeaderValueIterator<'a> {
    s: &'a str,
    done: bool,
}

impl<'a> Iterator for HeaderValueIterator<'a> {
    type Item = Result<(&'a str, HeaderParamsIterator<'a>), InvalidHeaderValue>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let (first_part, params, remainder, done) = match find_one_of(self.s, b";,") {
            Some((pos, b';')) => {
                // drive a throwaway iterator to find where the params end
                let mut scan = HeaderParamsIterator::new(&self.s[(pos + 1)..]);

                for p in scan.by_ref() {
                    if let Err(e) = p {
                        return Some(Err(e));
                    }
                }

                let (remainder, done) = match scan.s.strip_prefix(',') {
                    Some(rest) => (rest, false),
                    None => ("", true),
                };

                let params = HeaderParamsIterator::new(&self.s[(pos + 1)..]);

                (&self.s[..pos], params, remainder, done)
            }
            Some((pos, _)) => (
                &self.s[..pos],
                HeaderParamsIterator::empty(),
                &self.s[(pos + 1)..],
                false,
            ),
            None => (self.s, HeaderParamsIterator::empty(), "", true),
        };

        let first_part = first_part.trim();

        if first_part.is_empty() {
            return Some(Err(InvalidHeaderValue));
        }

        self.s = remainder;
        self.done = done;

        Some(Ok((first_part, params)))
    }
}

pub fn parse_header_value(s: &str) -> HeaderValueIterator<'_> {
    HeaderValueIterator {
        s,
        done: s.trim().is_empty(),
    }
}

/// Parameters of a single-element header such as `Content-Type` or
/// `Content-Disposition`, as owned pairs with lower-cased keys.
pub fn header_params(s: &str) -> Option<(String, Vec<(String, String)>)> {
    let (first, params) = parse_header_value(s).next()?.ok()?;

    let mut out = Vec::new();

    for p in params {
        let (k, v) = p.ok()?;
        out.push((k.to_ascii_lowercase(), v.to_string()));
    }

    Some((first.to_ascii_lowercase(), out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_param() {
        assert!(header_contains_param("keep-alive, Upgrade", "upgrade", true));
        assert!(!header_contains_param("keep-alive, Upgrade", "upgrade", false));
        assert!(header_contains_param("gzip, chunked", "chunked", false));
        assert!(!header_contains_param("gzip", "chunked", false));
    }

    #[test]
    fn int_parsing() {
        assert_eq!(parse_as_int(" 42 "), Some(42));
        assert_eq!(parse_as_int("-1"), None);
        assert_eq!(parse_as_int("1e3"), None);
        assert_eq!(parse_as_int(""), None);
    }

    #[test]
    fn header_value() {
        let mut it = parse_header_value(
            "permessage-deflate; client_max_window_bits; server_max_window_bits=10, x-foo",
        );

        let (name, params) = it.next().unwrap().unwrap();
        assert_eq!(name, "permessage-deflate");

        let params: Vec<(&str, &str)> = params.map(|p| p.unwrap()).collect();
        assert_eq!(
            params,
            vec![("client_max_window_bits", ""), ("server_max_window_bits", "10")]
        );

        let (name, params) = it.next().unwrap().unwrap();
        assert_eq!(name, "x-foo");
        assert_eq!(params.count(), 0);

        assert!(it.next().is_none());
    }

    #[test]
    fn header_value_quoted() {
        let (first, params) =
            header_params("form-data; name=\"field;1\"; filename=\"a \\\"b\\\".txt\"").unwrap();

        assert_eq!(first, "form-data");
        assert_eq!(
            params,
            vec![
                ("name".to_string(), "field;1".to_string()),
                ("filename".to_string(), "a \\\"b\\\".txt".to_string()),
            ]
        );
    }

    #[test]
    fn header_value_errors() {
        let mut it = parse_header_value("a; b=\"unterminated");
        assert!(it.next().unwrap().is_err());

        let mut it = parse_header_value(", a");
        assert!(it.next().unwrap().is_err());

        assert!(parse_header_value("  ").next().is_none());
    }
}
