use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};

use crate::protocol::packet::attention_packet;
use crate::sync::channel::{Attention, Channel};
use crate::sync::lock;

/// A socket channel
///
/// Reads go through a buffered clone of the socket; writes share one handle
/// with the attention sender so an ATTENTION packet never splits a request.
pub enum Stream {
    Tcp {
        reader: BufReader<TcpStream>,
        writer: Arc<Mutex<TcpStream>>,
    },
    Unix {
        reader: BufReader<UnixStream>,
        writer: Arc<Mutex<UnixStream>>,
    },
}

impl Stream {
    pub fn tcp(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        Ok(Self::Tcp {
            reader: BufReader::new(stream),
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    pub fn unix(stream: UnixStream) -> io::Result<Self> {
        let writer = stream.try_clone()?;
        Ok(Self::Unix {
            reader: BufReader::new(stream),
            writer: Arc::new(Mutex::new(writer)),
        })
    }
}

impl Channel for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp { reader, .. } => reader.read(buf),
            Self::Unix { reader, .. } => reader.read(buf),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Self::Tcp { writer, .. } => lock(writer).write_all(buf),
            Self::Unix { writer, .. } => lock(writer).write_all(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp { writer, .. } => lock(writer).flush(),
            Self::Unix { writer, .. } => lock(writer).flush(),
        }
    }

    fn attention(&self) -> io::Result<Arc<dyn Attention>> {
        let attention: Arc<dyn Attention> = match self {
            Self::Tcp { writer, .. } => Arc::new(SocketAttention(Arc::clone(writer))),
            Self::Unix { writer, .. } => Arc::new(SocketAttention(Arc::clone(writer))),
        };
        Ok(attention)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp { reader, .. } => reader.get_ref().shutdown(Shutdown::Both),
            Self::Unix { reader, .. } => reader.get_ref().shutdown(Shutdown::Both),
        }
    }
}

trait Socket: Write + Send {
    fn shutdown_both(&self) -> io::Result<()>;
}

impl Socket for TcpStream {
    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

impl Socket for UnixStream {
    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

struct SocketAttention<W>(Arc<Mutex<W>>);

impl<W: Socket> Attention for SocketAttention<W> {
    fn send_attention(&self) -> io::Result<()> {
        let mut writer = lock(&self.0);
        writer.write_all(&attention_packet())?;
        writer.flush()
    }

    fn abort(&self) -> io::Result<()> {
        lock(&self.0).shutdown_both()
    }
}
