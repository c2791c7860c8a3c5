use std::io;
use std::sync::Arc;

use auto_impl::auto_impl;

/// An already-established duplex connection to a server
///
/// Login, TLS and collation negotiation happen before a channel is handed to
/// [`Conn`](super::Conn). Reads and writes are only issued by the thread
/// holding the connection's execution lock.
#[auto_impl(Box, &mut)]
pub trait Channel: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    /// A handle that can signal attention from any thread
    fn attention(&self) -> io::Result<Arc<dyn Attention>>;

    /// Unblock pending reads and refuse further traffic
    fn shutdown(&mut self) -> io::Result<()>;
}

/// Out-of-band cancellation of the in-flight request
pub trait Attention: Send + Sync {
    /// Send an ATTENTION packet
    ///
    /// Must not interleave with a request being written on the same channel.
    fn send_attention(&self) -> io::Result<()>;

    /// Shut the channel down without holding the execution lock
    ///
    /// A thread blocked reading the channel wakes up with an error.
    fn abort(&self) -> io::Result<()>;
}

/// Adapts a channel to [`std::io::Read`]
pub struct ChannelRead<'a>(pub &'a mut dyn Channel);

impl io::Read for ChannelRead<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}
