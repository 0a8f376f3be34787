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

//! HTTP server: routing tables, static files, response serialization.

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use super::context::HttpContext;
use super::request::HttpRequest;
use super::response::HttpResponse;
use super::util;
use crate::buffer::Buffer;
use crate::connection::ConnRef;
use crate::context::Context;
use crate::server::{ServerHandle, TcpServer};

/// Seconds of silence before an HTTP connection is released.
pub const DEFAULT_TIMEOUT: u32 = 10;

/// A route handler: inspects the request, fills in the response.
pub type Handler = Arc<dyn Fn(&HttpRequest, &mut HttpResponse) + Send + Sync>;

type RouteTable = Vec<(Regex, Handler)>;

#[derive(Default)]
struct Router {
    get: RouteTable,
    post: RouteTable,
    put: RouteTable,
    delete: RouteTable,
    base_path: Option<PathBuf>,
}

impl Router {
    /// Resolves a request to a handler and runs it. Misses are 404,
    /// unsupported methods 405.
    fn route(&self, request: &mut HttpRequest, response: &mut HttpResponse) {
        if let Some(path) = self.static_file_for(request) {
            return Self::file_handler(&path, response);
        }
        let table = match request.method.as_str() {
            "GET" | "HEAD" => &self.get,
            "POST" => &self.post,
            "PUT" => &self.put,
            "DELETE" => &self.delete,
            _ => {
                response.status = 405;
                return;
            }
        };
        for (pattern, handler) in table {
            let captures = match pattern.captures(&request.path) {
                Some(captures) => captures,
                None => continue,
            };
            let whole = captures.get(0).expect("group 0 always participates");
            // Route patterns match the full path, like a regex match over
            // the whole string, not a substring search.
            if whole.start() != 0 || whole.end() != request.path.len() {
                continue;
            }
            request.matches = captures
                .iter()
                .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect();
            return handler(request, response);
        }
        response.status = 404;
    }

    /// The on-disk file this request maps to, if it is a static resource
    /// request: a GET/HEAD under a configured base path, with no `..`
    /// escape, resolving to a regular file. A directory path serves its
    /// `index.html`.
    fn static_file_for(&self, request: &HttpRequest) -> Option<PathBuf> {
        let base = self.base_path.as_ref()?;
        if request.method != "GET" && request.method != "HEAD" {
            return None;
        }
        if !util::is_valid_path(&request.path) {
            return None;
        }
        let mut full = format!("{}{}", base.display(), request.path);
        if request.path.ends_with('/') {
            full.push_str("index.html");
        }
        let path = PathBuf::from(full);
        path.is_file().then_some(path)
    }

    fn file_handler(path: &PathBuf, response: &mut HttpResponse) {
        match fs::read(path) {
            Ok(bytes) => {
                response.body = bytes;
                response.set_header(
                    "Content-Type",
                    util::mime_for_path(&path.to_string_lossy()),
                );
            }
            Err(_) => response.status = 404,
        }
    }

    /// Drives the parser over the buffered bytes and answers every request
    /// that completes; pipelined requests are answered in order on the
    /// same connection.
    fn on_message(&self, conn: &ConnRef, buffer: &mut Buffer) {
        while buffer.readable_size() > 0 {
            let step = conn.with_context(|slot| {
                if slot.get::<HttpContext>().is_none() {
                    slot.set(HttpContext::new());
                }
                let ctx = slot
                    .get_mut::<HttpContext>()
                    .expect("context slot was just populated");
                ctx.parse(buffer);
                if ctx.status() >= 400 {
                    let status = ctx.status();
                    let request = ctx.take_request();
                    ctx.reset();
                    return Step::Fail(request, status);
                }
                if !ctx.is_done() {
                    return Step::Wait;
                }
                let request = ctx.take_request();
                ctx.reset();
                Step::Ready(request)
            });

            match step {
                Step::Wait => return,
                Step::Fail(request, status) => {
                    let mut response = HttpResponse::with_status(status);
                    error_page(&mut response);
                    write_response(conn, &request, &mut response, false);
                    // The byte stream is unparseable from here on.
                    let junk = buffer.readable_size();
                    buffer.advance_read(junk);
                    conn.shutdown();
                    return;
                }
                Step::Ready(mut request) => {
                    let mut response = HttpResponse::new();
                    self.route(&mut request, &mut response);
                    if response.status >= 400 && response.body.is_empty() {
                        error_page(&mut response);
                    }
                    let keep_alive = request.keep_alive() && response.status < 400;
                    write_response(conn, &request, &mut response, keep_alive);
                    if !keep_alive {
                        conn.shutdown();
                        return;
                    }
                }
            }
        }
    }
}

enum Step {
    Wait,
    Fail(HttpRequest, u16),
    Ready(HttpRequest),
}

/// Serializes the response and hands it to the connection.
fn write_response(conn: &ConnRef, request: &HttpRequest, response: &mut HttpResponse, keep_alive: bool) {
    let connection = if keep_alive { "keep-alive" } else { "close" };
    response.set_header("Connection", connection);
    if !response.body.is_empty() && !response.has_header("Content-Length") {
        let length = response.body.len().to_string();
        response.set_header("Content-Length", &length);
    }
    if !response.body.is_empty() && !response.has_header("Content-Type") {
        response.set_header("Content-Type", "application/octet-stream");
    }
    if let Some(url) = response.redirect_url.clone() {
        response.set_header("Location", &url);
    }

    let mut wire = Vec::with_capacity(256 + response.body.len());
    wire.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            request.version,
            response.status,
            util::status_text(response.status)
        )
        .as_bytes(),
    );
    for (key, value) in &response.headers {
        wire.extend_from_slice(format!("{key}: {value}\r\n").as_bytes());
    }
    wire.extend_from_slice(b"\r\n");
    wire.extend_from_slice(&response.body);
    conn.send(&wire);
}

/// The generated HTML error page: numeric status plus its description.
fn error_page(response: &mut HttpResponse) {
    let body = format!(
        "<html><head><meta http-equiv='Content-Type' \
         content='text/html;charset=utf-8'></head><body><h1 style='color:red'>{} {}</h1>\
         </body></html>",
        response.status,
        util::status_text(response.status)
    );
    response.set_content(body, "text/html");
}

/// An HTTP/1.1 server over [`TcpServer`].
///
/// Routes are regexes tried in registration order per method; anything the
/// tables miss can be served from a static base path. Connections idle for
/// [`DEFAULT_TIMEOUT`] seconds are released.
pub struct HttpServer {
    server: TcpServer,
    router: Router,
    timeout: u32,
}

impl HttpServer {
    pub fn new(port: u16) -> io::Result<HttpServer> {
        Ok(HttpServer {
            server: TcpServer::new(port)?,
            router: Router::default(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Overrides the idle timeout (seconds). Must precede `listen`.
    pub fn set_timeout(&mut self, seconds: u32) {
        self.timeout = seconds;
    }

    pub fn set_thread_num(&mut self, num: usize) {
        self.server.set_thread_num(num);
    }

    /// Serves static files from `path`, which must be a directory.
    pub fn set_base_path(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        assert!(path.is_dir(), "static base path must be a directory");
        self.router.base_path = Some(path);
    }

    pub fn get(
        &mut self,
        pattern: &str,
        handler: impl Fn(&HttpRequest, &mut HttpResponse) + Send + Sync + 'static,
    ) {
        let pattern = Regex::new(pattern).expect("invalid route pattern");
        self.router.get.push((pattern, Arc::new(handler)));
    }

    pub fn post(
        &mut self,
        pattern: &str,
        handler: impl Fn(&HttpRequest, &mut HttpResponse) + Send + Sync + 'static,
    ) {
        let pattern = Regex::new(pattern).expect("invalid route pattern");
        self.router.post.push((pattern, Arc::new(handler)));
    }

    pub fn put(
        &mut self,
        pattern: &str,
        handler: impl Fn(&HttpRequest, &mut HttpResponse) + Send + Sync + 'static,
    ) {
        let pattern = Regex::new(pattern).expect("invalid route pattern");
        self.router.put.push((pattern, Arc::new(handler)));
    }

    pub fn delete(
        &mut self,
        pattern: &str,
        handler: impl Fn(&HttpRequest, &mut HttpResponse) + Send + Sync + 'static,
    ) {
        let pattern = Regex::new(pattern).expect("invalid route pattern");
        self.router.delete.push((pattern, Arc::new(handler)));
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        self.server.handle()
    }

    /// Starts serving; blocks the calling thread on the base loop.
    pub fn listen(&mut self) {
        self.server.enable_inactive_release(self.timeout);
        self.server
            .set_connected_callback(|conn| conn.set_context(Context::new(HttpContext::new())));
        let router = Arc::new(std::mem::take(&mut self.router));
        self.server.set_message_callback(move |conn, buffer| {
            router.on_message(conn, buffer);
        });
        debug!(addr = %self.local_addr(), "http server listening");
        self.server.start();
    }
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("local_addr", &self.server.local_addr())
            .field("timeout", &self.timeout)
            .finish()
    }
}
