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

//! Incremental HTTP/1.1 request parser.
//!
//! One context lives in each connection's context slot. `parse` consumes
//! whatever it can from the in-buffer and stops at the first incomplete
//! line or body, to be resumed when more bytes arrive. A finished pass
//! falls through line → headers → body so a request that arrives in one
//! read is parsed in one call.

use std::sync::OnceLock;

use regex::Regex;

use super::request::HttpRequest;
use super::util;
use crate::buffer::Buffer;

/// Longest accepted request or header line, in bytes. Longer input is
/// answered with 414.
pub const MAX_LINE_SIZE: usize = 8192;

/// Parser position within the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    Line,
    Headers,
    Body,
    Done,
    Error,
}

fn request_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^(GET|HEAD|POST|PUT|DELETE) ([^?]*)(?:\?(.*))? (HTTP/1\.[01])(?:\r?\n)?$")
            .expect("request line pattern must compile")
    })
}

/// Per-connection HTTP parse state.
#[derive(Debug)]
pub struct HttpContext {
    status: u16,
    state: RecvState,
    request: HttpRequest,
}

impl HttpContext {
    pub fn new() -> HttpContext {
        HttpContext {
            status: 200,
            state: RecvState::Line,
            request: HttpRequest::new(),
        }
    }

    /// Status to respond with; ≥ 400 once parsing has failed.
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn state(&self) -> RecvState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == RecvState::Done
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut HttpRequest {
        &mut self.request
    }

    /// Detaches the parsed request, leaving a fresh one behind.
    pub fn take_request(&mut self) -> HttpRequest {
        std::mem::take(&mut self.request)
    }

    /// Readies the context for the next request on the same connection.
    pub fn reset(&mut self) {
        self.status = 200;
        self.state = RecvState::Line;
        self.request.reset();
    }

    /// Feeds buffered bytes through the parser.
    pub fn parse(&mut self, buffer: &mut Buffer) {
        if self.state == RecvState::Line {
            self.recv_request_line(buffer);
        }
        if self.state == RecvState::Headers {
            self.recv_headers(buffer);
        }
        if self.state == RecvState::Body {
            self.recv_body(buffer);
        }
    }

    fn fail(&mut self, status: u16) {
        self.state = RecvState::Error;
        self.status = status;
    }

    fn recv_request_line(&mut self, buffer: &mut Buffer) {
        match buffer.take_line() {
            None => {
                // No complete line yet; an over-long prefix will never
                // become one.
                if buffer.readable_size() > MAX_LINE_SIZE {
                    self.fail(414);
                }
            }
            Some(line) => {
                if line.len() > MAX_LINE_SIZE {
                    return self.fail(414);
                }
                self.parse_request_line(&line);
            }
        }
    }

    fn parse_request_line(&mut self, line: &str) {
        let captures = match request_line_pattern().captures(line) {
            Some(captures) => captures,
            None => return self.fail(400),
        };
        self.request.method = captures[1].to_uppercase();
        self.request.path = util::url_decode(&captures[2], false);
        self.request.version = captures[4].to_string();
        if let Some(query) = captures.get(3) {
            for part in query.as_str().split('&').filter(|p| !p.is_empty()) {
                match part.split_once('=') {
                    Some((key, value)) => self.request.set_param(key, value),
                    None => return self.fail(400),
                }
            }
        }
        self.state = RecvState::Headers;
    }

    fn recv_headers(&mut self, buffer: &mut Buffer) {
        loop {
            match buffer.take_line() {
                None => {
                    if buffer.readable_size() > MAX_LINE_SIZE {
                        self.fail(414);
                    }
                    return;
                }
                Some(line) => {
                    if line.len() > MAX_LINE_SIZE {
                        return self.fail(414);
                    }
                    if line == "\r\n" || line == "\n" {
                        self.state = RecvState::Body;
                        return;
                    }
                    if !self.parse_header_line(&line) {
                        return;
                    }
                }
            }
        }
    }

    fn parse_header_line(&mut self, line: &str) -> bool {
        let line = line.trim_end_matches(['\n', '\r']);
        match line.split_once(": ") {
            Some((key, value)) => {
                self.request.set_header(key, value);
                true
            }
            None => {
                self.fail(400);
                false
            }
        }
    }

    fn recv_body(&mut self, buffer: &mut Buffer) {
        let content_length = self.request.content_length();
        if content_length == 0 {
            self.state = RecvState::Done;
            return;
        }
        let missing = content_length - self.request.body.len();
        if buffer.readable_size() >= missing {
            let chunk = buffer.read_string(missing);
            self.request.body.push_str(&chunk);
            self.state = RecvState::Done;
        } else {
            let len = buffer.readable_size();
            let chunk = buffer.read_string(len);
            self.request.body.push_str(&chunk);
        }
    }
}

impl Default for HttpContext {
    fn default() -> Self {
        HttpContext::new()
    }
}
