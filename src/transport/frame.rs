//! Length-prefixed bincode framing.
//!
//! ```text
//! +--------------------------+--------------------------+
//! | Length: u32, BigEndian   | bincode payload          |
//! +--------------------------+--------------------------+
//! ```
use crate::constants::MAX_FRAME_BYTES;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read, Write};

fn invalid<E: ToString>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

/// Encode `msg` and write it as one frame.
pub fn write_frame<W, T>(writer: &mut W, msg: &T) -> io::Result<()>
where
    W: Write,
    T: Serialize,
{
    let payload = bincode::serialize(msg).map_err(invalid)?;
    if payload.len() > MAX_FRAME_BYTES as usize {
        return Err(invalid(format!("frame of {} bytes exceeds limit", payload.len())));
    }
    writer.write_u32::<BigEndian>(payload.len() as u32)?;
    writer.write_all(&payload)?;
    writer.flush()
}

/// Read one frame and decode it.
pub fn read_frame<R, T>(reader: &mut R) -> io::Result<T>
where
    R: Read,
    T: DeserializeOwned,
{
    let len = reader.read_u32::<BigEndian>()?;
    if len > MAX_FRAME_BYTES {
        return Err(invalid(format!("frame of {} bytes exceeds limit", len)));
    }
    let mut buf = vec![0; len as usize];
    reader.read_exact(&mut buf)?;
    bincode::deserialize(&buf).map_err(invalid)
}
