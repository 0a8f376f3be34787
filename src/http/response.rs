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

//! Response a handler fills in; serialized by the HTTP server.

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Set by [`set_redirect`](Self::set_redirect); serialized as the
    /// `Location` header.
    pub redirect_url: Option<String>,
}

impl HttpResponse {
    pub fn new() -> HttpResponse {
        HttpResponse::with_status(200)
    }

    pub fn with_status(status: u16) -> HttpResponse {
        HttpResponse {
            status,
            headers: HashMap::new(),
            body: Vec::new(),
            redirect_url: None,
        }
    }

    pub fn reset(&mut self) {
        *self = HttpResponse::new();
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

    /// Sets the body and its content type.
    pub fn set_content(&mut self, body: impl Into<Vec<u8>>, content_type: &str) {
        self.body = body.into();
        self.set_header("Content-Type", content_type);
    }

    /// Turns the response into a redirect with the given status.
    pub fn set_redirect(&mut self, url: &str, status: u16) {
        self.redirect_url = Some(url.to_string());
        self.status = status;
    }

    pub fn keep_alive(&self) -> bool {
        self.header("Connection") == Some("keep-alive")
    }
}

impl Default for HttpResponse {
    fn default() -> Self {
        HttpResponse::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_applies_the_given_status() {
        let mut rsp = HttpResponse::new();
        rsp.set_redirect("/login", 302);
        assert_eq!(rsp.status, 302);
        assert_eq!(rsp.redirect_url.as_deref(), Some("/login"));
    }

    #[test]
    fn set_content_tags_the_type() {
        let mut rsp = HttpResponse::new();
        rsp.set_content("hello", "text/plain");
        assert_eq!(rsp.body, b"hello");
        assert_eq!(rsp.header("Content-Type"), Some("text/plain"));
    }
}
