use crate::protocol::packet::HEADER_LEN;

/// A set of reusable buffers for one connection's exchanges
///
/// The connection holds a single `BufferSet` behind its execution lock.
#[derive(Debug)]
pub struct BufferSet {
    /// Scratch space for decoding variable-length values
    /// Bytes are valid during a token decode.
    pub read_buffer: Vec<u8>,

    /// Request payload without packet headers
    /// Bytes are valid during an operation.
    write_buffer: Vec<u8>,

    /// Request payload split into packets, headers included
    frame_buffer: Vec<u8>,
}

impl BufferSet {
    /// Create a new empty buffer set
    pub fn new() -> Self {
        Self {
            read_buffer: Vec::new(),
            write_buffer: Vec::new(),
            frame_buffer: Vec::new(),
        }
    }

    /// Clear the write buffer and return mutable access.
    #[inline]
    pub fn new_write_buffer(&mut self) -> &mut Vec<u8> {
        self.write_buffer.clear();
        &mut self.write_buffer
    }

    /// Get the write buffer for reading.
    #[inline]
    pub fn write_buffer(&self) -> &[u8] {
        &self.write_buffer
    }

    /// Frame the write buffer into packets of at most `packet_size` bytes
    ///
    /// Returns the framed bytes ready to be written to the channel.
    pub fn frame(&mut self, packet_type: u8, packet_size: usize) -> &[u8] {
        crate::protocol::packet::frame_message(
            &mut self.frame_buffer,
            packet_type,
            &self.write_buffer,
            packet_size,
        );
        &self.frame_buffer
    }

    /// Largest capacity held by any of the buffers
    pub fn capacity(&self) -> usize {
        self.read_buffer
            .capacity()
            .max(self.write_buffer.capacity())
            .max(self.frame_buffer.capacity())
    }

    /// Number of packets the current payload needs
    pub fn packet_count(&self, packet_size: usize) -> usize {
        let chunk = packet_size - HEADER_LEN;
        self.write_buffer.len().div_ceil(chunk).max(1)
    }
}

impl Default for BufferSet {
    fn default() -> Self {
        Self::new()
    }
}
