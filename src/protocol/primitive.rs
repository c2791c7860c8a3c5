use crate::error::{Error, Result};
use zerocopy::FromBytes;
use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE, U64 as U64LE};

/// Sequential reader over a message payload
///
/// Token decoding pulls exact byte counts; implementors decide where the
/// bytes come from (a slice, or packets arriving on a channel).
pub trait WireRead {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Read 1-byte integer
    fn read_int_1(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    /// Read 2-byte little-endian integer
    fn read_int_2(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(U16LE::ref_from_bytes(&buf)
            .map_err(|_| Error::InvalidPacket)?
            .get())
    }

    /// Read 4-byte little-endian integer
    fn read_int_4(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(U32LE::ref_from_bytes(&buf)
            .map_err(|_| Error::InvalidPacket)?
            .get())
    }

    /// Read 8-byte little-endian integer
    fn read_int_8(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(U64LE::ref_from_bytes(&buf)
            .map_err(|_| Error::InvalidPacket)?
            .get())
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_int_4()? as i32)
    }

    /// Append `len` bytes to `out`
    fn read_bytes(&mut self, len: usize, out: &mut Vec<u8>) -> Result<()> {
        let start = out.len();
        out.resize(start + len, 0);
        self.read_exact(&mut out[start..])
    }

    fn skip(&mut self, mut len: usize) -> Result<()> {
        let mut buf = [0u8; 64];
        while len > 0 {
            let n = len.min(buf.len());
            self.read_exact(&mut buf[..n])?;
            len -= n;
        }
        Ok(())
    }

    /// Read UCS-2 text of `chars` code units
    fn read_ucs2(&mut self, chars: usize) -> Result<String> {
        let mut bytes = Vec::with_capacity(chars * 2);
        self.read_bytes(chars * 2, &mut bytes)?;
        decode_ucs2(&bytes)
    }

    /// Read B_VARCHAR: 1-byte character count followed by UCS-2 text
    fn read_b_varchar(&mut self) -> Result<String> {
        let chars = self.read_int_1()? as usize;
        self.read_ucs2(chars)
    }

    /// Read US_VARCHAR: 2-byte character count followed by UCS-2 text
    fn read_us_varchar(&mut self) -> Result<String> {
        let chars = self.read_int_2()? as usize;
        self.read_ucs2(chars)
    }
}

impl WireRead for &[u8] {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.len() < buf.len() {
            return Err(Error::UnexpectedEof);
        }
        let (head, rest) = self.split_at(buf.len());
        buf.copy_from_slice(head);
        *self = rest;
        Ok(())
    }
}

pub fn decode_ucs2(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(Error::InvalidPacket);
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| Error::InvalidPacket)
}

/// Write 1-byte integer
pub fn write_int_1(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

/// Write 2-byte little-endian integer
pub fn write_int_2(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Write 4-byte little-endian integer
pub fn write_int_4(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Write 8-byte little-endian integer
pub fn write_int_8(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn write_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Write UCS-2 text without a length prefix, returning the number of code units
pub fn write_ucs2(out: &mut Vec<u8>, s: &str) -> usize {
    let mut units = 0;
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
        units += 1;
    }
    units
}

/// Number of UCS-2 code units of `s`
pub fn ucs2_len(s: &str) -> usize {
    s.encode_utf16().count()
}

/// Write B_VARCHAR
pub fn write_b_varchar(out: &mut Vec<u8>, s: &str) -> Result<()> {
    let chars = u8::try_from(ucs2_len(s))
        .map_err(|_| Error::BadUsageError(format!("identifier too long: {}", s)))?;
    write_int_1(out, chars);
    write_ucs2(out, s);
    Ok(())
}

/// Write US_VARCHAR
pub fn write_us_varchar(out: &mut Vec<u8>, s: &str) -> Result<()> {
    let chars = u16::try_from(ucs2_len(s))
        .map_err(|_| Error::BadUsageError("message text too long".to_string()))?;
    write_int_2(out, chars);
    write_ucs2(out, s);
    Ok(())
}
