//! Listening-socket management for the base loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, error};

use crate::channel::{Channel, ChannelBuilder};
use crate::event_loop::LoopHandle;
use crate::net::Socket;

/// Watches the passive socket on the base loop and hands every accepted
/// socket to the server's new-connection callback.
pub(crate) struct Acceptor {
    socket: Arc<Socket>,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
}

impl Acceptor {
    pub(crate) fn new(
        base: &LoopHandle,
        port: u16,
        on_accept: impl Fn(Socket) + Send + Sync + 'static,
    ) -> io::Result<Acceptor> {
        let socket = Arc::new(Socket::create_server(port)?);
        let local_addr = socket.local_addr()?;
        let channel = {
            let socket = socket.clone();
            ChannelBuilder::new(socket.fd(), base.registration())
                .on_read(move || loop {
                    // Edge-triggered readiness: take everything queued.
                    match socket.accept() {
                        Ok(Some((conn, peer))) => {
                            debug!(%peer, "accepted connection");
                            on_accept(conn);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            error!(error = %e, "accept failed");
                            break;
                        }
                    }
                })
                .finish()
        };
        Ok(Acceptor {
            socket,
            channel,
            local_addr,
        })
    }

    /// Starts read monitoring on the listening socket.
    pub(crate) fn listen(&self) {
        self.channel.enable_read();
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.remove();
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("fd", &self.socket.fd())
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
