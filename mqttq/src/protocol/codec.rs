//! MQTT packet encoding/decoding primitives.
//!
//! Fixed header layout: one byte (packet type in the high nibble, flags in
//! the low nibble) followed by the remaining length as a variable-length
//! integer of 1 to 4 bytes, 7 data bits per byte, high bit = continuation.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::types::{FixedHeader, PacketType};

/// Largest value a variable-length integer can carry.
pub const MAX_VARIABLE_INT: u32 = 268_435_455;

/// Read a variable-length integer (remaining length encoding).
///
/// Returns `Ok(Some((value, bytes_consumed)))`, `Ok(None)` if incomplete, or
/// an error when a fifth continuation byte would be needed.
pub fn read_variable_int(buf: &[u8]) -> Result<Option<(u32, usize)>> {
    let mut value = 0u32;

    for (i, &byte) in buf.iter().enumerate() {
        if i >= 4 {
            return Err(Error::Malformed("variable length integer exceeds 4 bytes"));
        }
        value |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }

    if buf.len() >= 4 {
        return Err(Error::Malformed("variable length integer exceeds 4 bytes"));
    }
    Ok(None)
}

/// Append a variable-length integer.
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<usize> {
    if value > MAX_VARIABLE_INT {
        return Err(Error::PacketTooLarge {
            size: value as usize,
            max: MAX_VARIABLE_INT as usize,
        });
    }

    let mut written = 0;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        written += 1;
        if value == 0 {
            return Ok(written);
        }
    }
}

/// Calculate the number of bytes needed for a variable-length integer.
pub const fn variable_int_len(value: u32) -> usize {
    if value < 128 {
        1
    } else if value < 128 * 128 {
        2
    } else if value < 128 * 128 * 128 {
        3
    } else {
        4
    }
}

/// Parse a fixed header from the start of `buf`.
pub fn read_fixed_header(buf: &[u8]) -> Result<FixedHeader> {
    let Some(&first_byte) = buf.first() else {
        return Err(Error::Incomplete { needed: 1 });
    };

    let (remaining_length, var_len) =
        read_variable_int(&buf[1..])?.ok_or(Error::Incomplete { needed: 1 })?;

    header_from_parts(first_byte, remaining_length, 1 + var_len)
}

/// Read a fixed header from an async stream, one byte at a time.
///
/// Returns `Ok(None)` on a clean end-of-stream before the first byte.
/// End-of-stream inside the header is reported as [`Error::ConnectionClosed`].
pub async fn read_fixed_header_from<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
) -> Result<Option<FixedHeader>> {
    let first_byte = match reader.read_u8().await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut value = 0u32;
    for i in 0..4 {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::ConnectionClosed);
            }
            Err(e) => return Err(e.into()),
        };
        value |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return header_from_parts(first_byte, value, 2 + i).map(Some);
        }
    }

    Err(Error::Malformed("variable length integer exceeds 4 bytes"))
}

fn header_from_parts(first_byte: u8, remaining_length: u32, header_length: usize) -> Result<FixedHeader> {
    let packet_type_byte = first_byte >> 4;
    let flags = first_byte & 0x0F;

    let packet_type = PacketType::from_u8(packet_type_byte)
        .ok_or_else(|| Error::Protocol(format!("invalid packet type {packet_type_byte}")))?;

    if let Some(required) = packet_type.required_flags() {
        if flags != required {
            return Err(Error::Protocol(format!(
                "invalid flags {flags:#06b} for {packet_type:?}"
            )));
        }
    }

    Ok(FixedHeader {
        packet_type,
        flags,
        remaining_length,
        header_length,
    })
}

/// Append a fixed header.
pub fn write_fixed_header(buf: &mut BytesMut, packet_type: PacketType, flags: u8, remaining_length: u32) -> Result<usize> {
    buf.put_u8(((packet_type as u8) << 4) | (flags & 0x0F));
    Ok(1 + write_variable_int(buf, remaining_length)?)
}

/// Append a complete frame: fixed header followed by `body`.
pub fn write_frame(buf: &mut BytesMut, packet_type: PacketType, flags: u8, body: &[u8]) -> Result<()> {
    let len = u32::try_from(body.len()).map_err(|_| Error::PacketTooLarge {
        size: body.len(),
        max: MAX_VARIABLE_INT as usize,
    })?;
    buf.reserve(1 + variable_int_len(len) + body.len());
    write_fixed_header(buf, packet_type, flags, len)?;
    buf.put_slice(body);
    Ok(())
}

/// Take a 2-byte big-endian u16.
pub fn get_u16(buf: &mut Bytes) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(Error::Incomplete { needed: 2 - buf.remaining() });
    }
    Ok(buf.get_u16())
}

/// Take a single byte.
pub fn get_u8(buf: &mut Bytes) -> Result<u8> {
    if !buf.has_remaining() {
        return Err(Error::Incomplete { needed: 1 });
    }
    Ok(buf.get_u8())
}

/// Take a non-zero packet identifier.
pub fn get_packet_id(buf: &mut Bytes) -> Result<u16> {
    match get_u16(buf)? {
        0 => Err(Error::Protocol("packet identifier 0".into())),
        id => Ok(id),
    }
}

/// Take binary data (2-byte length prefix + data).
pub fn get_binary(buf: &mut Bytes) -> Result<Bytes> {
    let len = get_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(Error::Incomplete { needed: len - buf.remaining() });
    }
    Ok(buf.split_to(len))
}

/// Take a UTF-8 string (2-byte length prefix + data).
pub fn get_string(buf: &mut Bytes) -> Result<String> {
    let raw = get_binary(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| Error::Malformed("invalid utf-8 string"))
}

/// Skip a v5 property block (variable-length prefix + properties).
pub fn skip_properties(buf: &mut Bytes) -> Result<()> {
    let (len, consumed) = read_variable_int(buf.chunk())?
        .ok_or(Error::Malformed("truncated property length"))?;
    buf.advance(consumed);
    let len = len as usize;
    if buf.remaining() < len {
        return Err(Error::Malformed("truncated properties"));
    }
    buf.advance(len);
    Ok(())
}

/// Append a UTF-8 string (2-byte length prefix + data).
pub fn put_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    put_binary(buf, s.as_bytes())
}

/// Append binary data (2-byte length prefix + data).
pub fn put_binary(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len()).map_err(|_| Error::PacketTooLarge {
        size: data.len(),
        max: u16::MAX as usize,
    })?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}
