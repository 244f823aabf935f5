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

use std::collections::VecDeque;

pub const DEFAULT_TABLE_SIZE: usize = 4096;

// per-entry accounting overhead, RFC 7541 section 4.1
pub const ENTRY_OVERHEAD: usize = 32;

pub const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

pub fn entry_size(name: &str, value: &str) -> usize {
    name.len() + value.len() + ENTRY_OVERHEAD
}

#[derive(Debug, PartialEq)]
pub enum Match {
    // name and value
    Full(usize),
    Name(usize),
}

/// The dynamic part of the index space. Index 1 of the combined space is
/// the first static entry; dynamic entries start right after the static
/// table, newest first.
#[derive(Debug)]
pub struct IndexTable {
    entries: VecDeque<(String, String)>,
    size: usize,
    max_size: usize,
}

impl IndexTable {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict();
    }

    /// Adds an entry as the newest, evicting the oldest entries until the
    /// table fits. An entry larger than the whole table empties it and is
    /// not kept.
    pub fn insert(&mut self, name: String, value: String) {
        self.size += entry_size(&name, &value);
        self.entries.push_front((name, value));
        self.evict();
    }

    /// Look up an entry in the combined static and dynamic index space.
    pub fn get(&self, index: usize) -> Option<(&str, &str)> {
        if index == 0 {
            return None;
        }

        if index <= STATIC_TABLE.len() {
            return Some(STATIC_TABLE[index - 1]);
        }

        self.entries
            .get(index - STATIC_TABLE.len() - 1)
            .map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Find the lowest index with the same name and value, or failing that
    /// the lowest index with the same name.
    pub fn find(&self, name: &str, value: &str) -> Option<Match> {
        let mut name_match = None;

        let dynamic = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, (n, v))| (i + STATIC_TABLE.len() + 1, n.as_str(), v.as_str()));

        let all = STATIC_TABLE
            .iter()
            .enumerate()
            .map(|(i, (n, v))| (i + 1, *n, *v))
            .chain(dynamic);

        for (index, n, v) in all {
            if n != name {
                continue;
            }

            if v == value {
                return Some(Match::Full(index));
            }

            if name_match.is_none() {
                name_match = Some(index);
            }
        }

        name_match.map(Match::Name)
    }

    fn evict(&mut self) {
        while self.size > self.max_size {
            match self.entries.pop_back() {
                Some((n, v)) => self.size -= entry_size(&n, &v),
                None => break,
            }
        }
    }
}

impl Default for IndexTable {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_lookup() {
        let t = IndexTable::default();

        assert_eq!(t.get(0), None);
        assert_eq!(t.get(2), Some((":method", "GET")));
        assert_eq!(t.get(6), Some((":scheme", "http")));
        assert_eq!(t.get(61), Some(("www-authenticate", "")));
        assert_eq!(t.get(62), None);
    }

    #[test]
    fn dynamic_indexing_newest_first() {
        let mut t = IndexTable::default();

        t.insert("a".to_string(), "1".to_string());
        t.insert("b".to_string(), "2".to_string());

        assert_eq!(t.get(62), Some(("b", "2")));
        assert_eq!(t.get(63), Some(("a", "1")));
        assert_eq!(t.size(), 2 * (2 + ENTRY_OVERHEAD));
    }

    #[test]
    fn eviction_keeps_size_within_max() {
        let mut t = IndexTable::new(100);

        t.insert("name1".to_string(), "value1".to_string()); // 43
        t.insert("name2".to_string(), "value2".to_string()); // 86
        assert_eq!(t.len(), 2);

        t.insert("name3".to_string(), "value3".to_string());
        assert_eq!(t.len(), 2);
        assert!(t.size() <= t.max_size());
        assert_eq!(t.get(62), Some(("name3", "value3")));
        assert_eq!(t.get(63), Some(("name2", "value2")));

        // too large to fit at all
        t.insert("x".repeat(60), "y".repeat(60));
        assert!(t.is_empty());
        assert_eq!(t.size(), 0);

        t.insert("name1".to_string(), "value1".to_string());
        t.set_max_size(0);
        assert!(t.is_empty());
    }

    #[test]
    fn find_prefers_full_match() {
        let mut t = IndexTable::default();

        assert_eq!(t.find(":method", "POST"), Some(Match::Full(3)));
        assert_eq!(t.find(":method", "PUT"), Some(Match::Name(2)));
        assert_eq!(t.find("x-custom", "1"), None);

        t.insert("x-custom".to_string(), "1".to_string());
        assert_eq!(t.find("x-custom", "1"), Some(Match::Full(62)));
        assert_eq!(t.find("x-custom", "2"), Some(Match::Name(62)));
    }
}
