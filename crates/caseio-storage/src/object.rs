//! Stored object framing
//!
//! Every object file starts with a small header naming the stored class,
//! so a reader can reject a file of the wrong type before touching the
//! payload. Object layout:
//! ```text
//! +-----------+-----------+-------+----------+------+-------------+---------+---------+
//! | "CASEOBJ1"| class len | class | note len | note | payload len | crc32c  | payload |
//! | 8B        | u16 LE    |       | u16 LE   |      | u64 LE      | u32 LE  |         |
//! +-----------+-----------+-------+----------+------+-------------+---------+---------+
//! ```
//! A file whose class is [`CONTAINER_CLASS`] carries a block container as
//! payload; each container slot is again a complete object.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use caseio_common::{Error, Result};
use std::path::Path;

/// Magic number for stored objects
pub const OBJECT_MAGIC: [u8; 8] = *b"CASEOBJ1";

/// Class name of objects wrapping a block container
pub const CONTAINER_CLASS: &str = "blockContainer";

/// Fixed bytes around the variable-length strings
const FIXED_HEADER_SIZE: usize = 8 + 2 + 2 + 8 + 4;

/// Header of a stored object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectHeader {
    /// Declared class of the payload
    pub class_name: String,
    /// Free-form note carried alongside the class
    pub note: String,
    /// Payload size in bytes
    pub payload_len: u64,
    /// CRC32C of the payload
    pub payload_checksum: u32,
}

impl ObjectHeader {
    /// Serialized size of this header
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER_SIZE + self.class_name.len() + self.note.len()
    }

    /// True when the payload is a block container
    #[must_use]
    pub fn is_container(&self) -> bool {
        self.class_name == CONTAINER_CLASS
    }

    /// Parse the header at the start of `data`; returns it with the
    /// offset of the payload
    pub fn parse(path: &Path, data: &[u8]) -> Result<(Self, usize)> {
        let mut buf = data;
        if buf.remaining() < 8 + 2 {
            return Err(Error::malformed(path, "file too short for object header"));
        }

        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != OBJECT_MAGIC {
            return Err(Error::malformed(path, "invalid object magic"));
        }

        let class_name = read_string(path, &mut buf, "class name")?;
        if buf.remaining() < 2 {
            return Err(Error::malformed(path, "truncated header"));
        }
        let note = read_string(path, &mut buf, "note")?;
        if buf.remaining() < 12 {
            return Err(Error::malformed(path, "truncated header"));
        }
        let payload_len = buf.get_u64_le();
        let payload_checksum = buf.get_u32_le();

        let header = Self {
            class_name,
            note,
            payload_len,
            payload_checksum,
        };
        let offset = header.encoded_len();
        Ok((header, offset))
    }

    /// Fail with `HeaderMismatch` unless the class is `expected`
    ///
    /// Container headers always pass; their slots carry the real class.
    pub fn expect_class(&self, path: &Path, expected: Option<&str>) -> Result<()> {
        if self.is_container() {
            return Ok(());
        }
        check_class(path, expected, &self.class_name)
    }

    /// Slice and verify the payload that follows the header
    pub fn read_payload(&self, path: &Path, data: &Bytes, offset: usize) -> Result<Bytes> {
        let available = data.len().saturating_sub(offset) as u64;
        if available != self.payload_len {
            return Err(Error::malformed(
                path,
                format!(
                    "payload length mismatch: header declares {}, file holds {available}",
                    self.payload_len
                ),
            ));
        }

        let payload = data.slice(offset..);
        if crc32c::crc32c(&payload) != self.payload_checksum {
            return Err(Error::malformed(path, "payload checksum mismatch"));
        }
        Ok(payload)
    }
}

fn check_class(path: &Path, expected: Option<&str>, found: &str) -> Result<()> {
    match expected {
        Some(expected) if expected != found => Err(Error::HeaderMismatch {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            found: found.to_string(),
        }),
        _ => Ok(()),
    }
}

fn read_string(path: &Path, buf: &mut &[u8], what: &str) -> Result<String> {
    let len = usize::from(buf.get_u16_le());
    if buf.remaining() < len {
        return Err(Error::malformed(path, format!("truncated {what}")));
    }
    let text = std::str::from_utf8(&buf[..len])
        .map_err(|_| Error::malformed(path, format!("{what} is not UTF-8")))?
        .to_string();
    buf.advance(len);
    Ok(text)
}

/// A typed payload as moved by the object store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    /// Declared class of the payload
    pub class_name: String,
    /// Free-form note
    pub note: String,
    /// Opaque payload bytes
    pub payload: Bytes,
}

impl StoredObject {
    /// Create an object without a note
    #[must_use]
    pub fn new(class_name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            class_name: class_name.into(),
            note: String::new(),
            payload: payload.into(),
        }
    }

    /// Attach a note
    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }

    /// Header describing this object
    pub fn header(&self) -> Result<ObjectHeader> {
        for (what, text) in [("class name", &self.class_name), ("note", &self.note)] {
            if text.len() > usize::from(u16::MAX) {
                return Err(Error::invalid_argument(format!(
                    "{what} longer than {} bytes",
                    u16::MAX
                )));
            }
        }
        Ok(ObjectHeader {
            class_name: self.class_name.clone(),
            note: self.note.clone(),
            payload_len: self.payload.len() as u64,
            payload_checksum: crc32c::crc32c(&self.payload),
        })
    }

    /// Serialize header and payload
    pub fn encode(&self) -> Result<Bytes> {
        let header = self.header()?;
        let mut buf = BytesMut::with_capacity(header.encoded_len() + self.payload.len());
        buf.put_slice(&OBJECT_MAGIC);
        buf.put_u16_le(self.class_name.len() as u16);
        buf.put_slice(self.class_name.as_bytes());
        buf.put_u16_le(self.note.len() as u16);
        buf.put_slice(self.note.as_bytes());
        buf.put_u64_le(header.payload_len);
        buf.put_u32_le(header.payload_checksum);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parse a complete object; `path` only labels errors
    pub fn decode(path: &Path, data: Bytes) -> Result<Self> {
        let (header, offset) = ObjectHeader::parse(path, &data)?;
        let payload = header.read_payload(path, &data, offset)?;
        Ok(Self {
            class_name: header.class_name,
            note: header.note,
            payload,
        })
    }

    /// Fail with `HeaderMismatch` unless the class is `expected`
    pub fn expect_class(&self, path: &Path, expected: Option<&str>) -> Result<()> {
        check_class(path, expected, &self.class_name)
    }
}
