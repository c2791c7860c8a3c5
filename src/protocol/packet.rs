use std::io::Read;

use zerocopy::byteorder::big_endian::U16 as U16BE;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::constant::{PacketStatus, PacketType};
use crate::error::{Error, Result};
use crate::protocol::primitive::WireRead;

pub const HEADER_LEN: usize = 8;

/// TDS packet header (zero-copy)
///
/// Layout matches the wire:
/// - type: 1 byte
/// - status: 1 byte
/// - length: 2 bytes (big-endian, header included)
/// - spid: 2 bytes (big-endian)
/// - packet id: 1 byte
/// - window: 1 byte
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, IntoBytes)]
pub struct PacketHeader {
    pub packet_type: u8,
    pub status: u8,
    pub length: U16BE,
    pub spid: U16BE,
    pub packet_id: u8,
    pub window: u8,
}

impl PacketHeader {
    pub fn encode(packet_type: u8, last: bool, length: usize, packet_id: u8) -> Self {
        let status = if last {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::empty()
        };
        Self {
            packet_type,
            status: status.bits(),
            length: U16BE::new(length as u16),
            spid: U16BE::new(0),
            packet_id,
            window: 0,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::InvalidPacket);
        }
        Self::ref_from_bytes(&data[..HEADER_LEN]).map_err(|_| Error::InvalidPacket)
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_u8(self.packet_type)
    }

    pub fn is_last(&self) -> bool {
        PacketStatus::from_bits_retain(self.status).contains(PacketStatus::END_OF_MESSAGE)
    }

    /// Payload bytes following the header
    pub fn payload_len(&self) -> Result<usize> {
        (self.length.get() as usize)
            .checked_sub(HEADER_LEN)
            .ok_or(Error::InvalidPacket)
    }
}

/// Split `payload` into packets of at most `packet_size` bytes, headers included
pub fn frame_message(out: &mut Vec<u8>, packet_type: u8, payload: &[u8], packet_size: usize) {
    out.clear();
    let chunk_size = packet_size - HEADER_LEN;
    let mut packet_id: u8 = 1;
    let mut rest = payload;
    loop {
        let n = rest.len().min(chunk_size);
        let (chunk, tail) = rest.split_at(n);
        let header = PacketHeader::encode(packet_type, tail.is_empty(), HEADER_LEN + n, packet_id);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(chunk);
        rest = tail;
        packet_id = packet_id.wrapping_add(1);
        if rest.is_empty() {
            break;
        }
    }
}

/// A complete ATTENTION message, which carries no payload
pub fn attention_packet() -> [u8; HEADER_LEN] {
    let header = PacketHeader::encode(PacketType::Attention as u8, true, HEADER_LEN, 1);
    let mut out = [0u8; HEADER_LEN];
    out.copy_from_slice(header.as_bytes());
    out
}

/// Framing state of the inbound message
///
/// Persists between token reads so a reply can be consumed across several
/// acquisitions of the execution lock.
#[derive(Debug, Default)]
pub struct Inbound {
    remaining: usize,
    last: bool,
    started: bool,
}

impl Inbound {
    /// Expect the first packet of a new message
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Every payload byte of the message has been consumed
    pub fn is_finished(&self) -> bool {
        self.started && self.last && self.remaining == 0
    }

    /// Read packet headers until payload bytes are available or the message ends
    pub fn prime<R: Read + ?Sized>(&mut self, src: &mut R) -> Result<()> {
        while self.remaining == 0 && !(self.started && self.last) {
            self.next_packet(src)?;
        }
        Ok(())
    }

    fn next_packet<R: Read + ?Sized>(&mut self, src: &mut R) -> Result<()> {
        let mut raw = [0u8; HEADER_LEN];
        Read::read_exact(src, &mut raw)?;
        let header = PacketHeader::from_bytes(&raw)?;
        if header.packet_type() != Some(PacketType::TabularResult) {
            return Err(Error::InvalidPacket);
        }
        self.remaining = header.payload_len()?;
        self.last = header.is_last();
        self.started = true;
        Ok(())
    }

    pub fn reader<'a, R: Read + ?Sized>(&'a mut self, src: &'a mut R) -> MessageReader<'a, R> {
        MessageReader { inbound: self, src }
    }
}

/// Reads payload bytes of one message, crossing packet boundaries
pub struct MessageReader<'a, R: ?Sized> {
    inbound: &'a mut Inbound,
    src: &'a mut R,
}

impl<R: Read + ?Sized> WireRead for MessageReader<'_, R> {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.inbound.remaining == 0 {
                if self.inbound.is_finished() {
                    return Err(Error::UnexpectedEof);
                }
                self.inbound.next_packet(self.src)?;
                continue;
            }
            let n = (buf.len() - filled).min(self.inbound.remaining);
            Read::read_exact(self.src, &mut buf[filled..filled + n])?;
            self.inbound.remaining -= n;
            filled += n;
        }
        Ok(())
    }
}

/// Read one complete message of any packet type
///
/// Used on the accepting side of a channel (proxies, in-process servers).
pub fn read_message<R: Read + ?Sized>(src: &mut R) -> Result<(PacketType, Vec<u8>)> {
    let mut payload = Vec::new();
    let mut packet_type = None;
    loop {
        let mut raw = [0u8; HEADER_LEN];
        Read::read_exact(src, &mut raw)?;
        let header = PacketHeader::from_bytes(&raw)?;
        let ty = header.packet_type().ok_or(Error::InvalidPacket)?;
        if packet_type.is_some_and(|t| t != ty) {
            return Err(Error::InvalidPacket);
        }
        packet_type = Some(ty);
        let start = payload.len();
        payload.resize(start + header.payload_len()?, 0);
        Read::read_exact(src, &mut payload[start..])?;
        if header.is_last() {
            return Ok((ty, payload));
        }
    }
}
