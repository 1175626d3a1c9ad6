//! Multipart message framing over byte streams
//!
//! Each message is sent as:
//! - 1 byte: number of parts (1..=16)
//! - per part: 4 bytes payload length (big-endian u32) followed by the payload
//!
//! Frame deliveries are two-part messages (device tag, encoded frame);
//! replies and control requests are single-part.

use std::io::{self, Read, Write};

/// Maximum number of parts in one message.
pub const MAX_PARTS: usize = 16;

/// Maximum size of a single part (64 MB, room for uncompressed 4K frames)
pub const MAX_PART_SIZE: usize = 64 * 1024 * 1024;

/// Write a multipart message and flush it.
pub fn write_message<W: Write>(writer: &mut W, parts: &[&[u8]]) -> io::Result<()> {
    if parts.is_empty() || parts.len() > MAX_PARTS {
        return Err(invalid(format!(
            "message must have 1 to {} parts, got {}",
            MAX_PARTS,
            parts.len()
        )));
    }

    let total: usize = parts.iter().map(|part| 4 + part.len()).sum();
    let mut buf = Vec::with_capacity(1 + total);
    buf.push(parts.len() as u8);

    for part in parts {
        if part.len() > MAX_PART_SIZE {
            return Err(invalid(format!(
                "part too large: {} > {}",
                part.len(),
                MAX_PART_SIZE
            )));
        }
        buf.extend_from_slice(&(part.len() as u32).to_be_bytes());
        buf.extend_from_slice(part);
    }

    // One write per message so a peer never sees interleaved halves.
    writer.write_all(&buf)?;
    writer.flush()
}

/// Read one multipart message.
///
/// A clean end of stream before the first byte surfaces as
/// [`io::ErrorKind::UnexpectedEof`], like any other short read.
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<Vec<Vec<u8>>> {
    let mut count = [0u8; 1];
    reader.read_exact(&mut count)?;
    let count = count[0] as usize;

    if count == 0 || count > MAX_PARTS {
        return Err(invalid(format!("invalid part count {}", count)));
    }

    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len > MAX_PART_SIZE {
            return Err(invalid(format!(
                "part length exceeds maximum: {} > {}",
                len, MAX_PART_SIZE
            )));
        }

        let mut part = vec![0u8; len];
        reader.read_exact(&mut part)?;
        parts.push(part);
    }

    Ok(parts)
}

/// Whether an I/O error means a read deadline expired.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
