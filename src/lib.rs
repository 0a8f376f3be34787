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

#![warn(rust_2018_idioms)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! eddy is a one-loop-per-thread TCP server framework in the muduo style.
//!
//! A base event loop owns the listening socket and hands every accepted
//! connection to one of N worker loops, each running on its own thread.
//! Connections are pinned to their worker loop for life: every mutation is
//! either performed by that loop's event handlers or posted to its task
//! queue, so connection state never needs cross-thread synchronization.
//!
//! The [`http`] module layers an HTTP/1.1 server with regex routing and
//! static file serving on top of the TCP core.

mod acceptor;
mod buffer;
mod channel;
mod connection;
mod context;
mod event_loop;
mod loop_thread;
pub mod net;
mod poller;
mod server;
mod timer;

pub mod http;

pub use buffer::Buffer;
pub use connection::{
    AnyEventCallback, ClosedCallback, ConnRef, ConnState, ConnectedCallback, Connection,
    ConnectionCallbacks, MessageCallback,
};
pub use context::Context;
pub use event_loop::{EventLoop, LoopHandle};
pub use loop_thread::{LoopThread, LoopThreadPool};
pub use server::{ServerHandle, TcpServer};
