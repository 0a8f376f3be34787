// Copyright 2024 Robin Dahl
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Parsed representation of one HTTP request.

use std::collections::HashMap;

/// A request as produced by the incremental parser. Fields are public so
/// handlers can inspect them directly.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Upper-cased request method.
    pub method: String,
    /// Percent-decoded request path (`+` is not decoded).
    pub path: String,
    /// `HTTP/1.0` or `HTTP/1.1`.
    pub version: String,
    pub headers: HashMap<String, String>,
    /// Query-string key/value pairs, split on `&` then `=`.
    pub params: HashMap<String, String>,
    /// Capture groups of the route pattern that matched `path`; index 0 is
    /// the whole path.
    pub matches: Vec<String>,
    pub body: String,
}

impl HttpRequest {
    pub fn new() -> HttpRequest {
        HttpRequest {
            method: String::new(),
            path: String::new(),
            version: String::from("HTTP/1.1"),
            headers: HashMap::new(),
            params: HashMap::new(),
            matches: Vec::new(),
            body: String::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = HttpRequest::new();
    }

    pub fn set_header(&mut self, key: &str, value: &str) {
        self.headers.insert(key.to_string(), value.to_string());
    }

    pub fn has_header(&self, key: &str) -> bool {
        self.headers.contains_key(key)
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn set_param(&mut self, key: &str, value: &str) {
        self.params.insert(key.to_string(), value.to_string());
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Body length announced by `Content-Length`; absent or malformed
    /// means zero.
    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Whether the client asked to keep the connection open.
    pub fn keep_alive(&self) -> bool {
        self.header("Connection") == Some("keep-alive")
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        HttpRequest::new()
    }
}
