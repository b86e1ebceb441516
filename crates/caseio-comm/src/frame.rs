//! Wire framing for collective messages
//!
//! Frame layout:
//! ```text
//! +------------+--------+----------------+-----------------+
//! | collective | kind   | payload length | payload         |
//! | u8         | u8     | u64 LE         | length bytes    |
//! +------------+--------+----------------+-----------------+
//! ```
//!
//! The length always travels ahead of the payload; a receiver never
//! assumes both ends agree on it.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed frame prefix
pub const FRAME_HEADER_SIZE: usize = 10;

/// Which collective a frame belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Collective {
    Broadcast = 1,
    Gather = 2,
}

impl Collective {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Broadcast),
            2 => Some(Self::Gather),
            _ => None,
        }
    }
}

/// Role of a frame within a collective
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Payload relayed along the tree
    Data = 1,
    /// Sender could not produce its payload
    Abort = 2,
    /// Subtree finished the data phase
    Ack = 3,
    /// Subtree failed the data phase
    Nack = 4,
    /// Root verdict: every rank succeeded
    Commit = 5,
    /// Root verdict: at least one rank failed
    Rollback = 6,
}

impl FrameKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Data),
            2 => Some(Self::Abort),
            3 => Some(Self::Ack),
            4 => Some(Self::Nack),
            5 => Some(Self::Commit),
            6 => Some(Self::Rollback),
            _ => None,
        }
    }
}

/// One decoded message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub collective: Collective,
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    /// Frame carrying a payload
    #[must_use]
    pub fn data(collective: Collective, payload: Bytes) -> Self {
        Self {
            collective,
            kind: FrameKind::Data,
            payload,
        }
    }

    /// Frame with no payload
    #[must_use]
    pub fn control(collective: Collective, kind: FrameKind) -> Self {
        Self {
            collective,
            kind,
            payload: Bytes::new(),
        }
    }

    /// Serialize to bytes
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.collective as u8);
        buf.put_u8(self.kind as u8);
        buf.put_u64_le(self.payload.len() as u64);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse from bytes
    pub fn decode(mut data: Bytes) -> Result<Self, String> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(format!("frame too short: {} bytes", data.len()));
        }

        let collective = data.get_u8();
        let collective =
            Collective::from_u8(collective).ok_or_else(|| format!("unknown collective {collective}"))?;
        let kind = data.get_u8();
        let kind = FrameKind::from_u8(kind).ok_or_else(|| format!("unknown frame kind {kind}"))?;

        let declared = data.get_u64_le();
        if declared != data.len() as u64 {
            return Err(format!(
                "payload length mismatch: declared {declared}, received {}",
                data.len()
            ));
        }

        Ok(Self {
            collective,
            kind,
            payload: data,
        })
    }
}
