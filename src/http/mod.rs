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

//! HTTP/1.1 protocol layer on top of the TCP core.
//!
//! Each connection carries an [`HttpContext`] in its context slot; the
//! message callback feeds buffered bytes through its incremental parser
//! and routes finished requests through regex tables or the static file
//! handler.

mod context;
mod request;
mod response;
mod server;
pub mod util;

pub use context::{HttpContext, RecvState, MAX_LINE_SIZE};
pub use request::HttpRequest;
pub use response::HttpResponse;
pub use server::{Handler, HttpServer, DEFAULT_TIMEOUT};
