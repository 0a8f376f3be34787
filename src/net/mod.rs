//! Non-blocking socket plumbing.

mod socket;

pub use socket::Socket;
