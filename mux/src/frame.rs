use bytes::Bytes;

/// Stream id (4) + sequence number (8) + closing flag (1).
pub const FRAME_HEADER_LEN: usize = 13;

pub const CLOSING_NOTHING: u8 = 0;
pub const CLOSING_STREAM: u8 = 1;

/// One unit of multiplexed data belonging to a stream inside a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: u32,
    pub seq: u64,
    pub closing: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(stream_id: u32, seq: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            stream_id,
            seq,
            closing: CLOSING_NOTHING,
            payload: payload.into(),
        }
    }

    /// An empty frame telling the peer that `stream_id` is finished.
    pub fn closing(stream_id: u32, seq: u64) -> Self {
        Self {
            stream_id,
            seq,
            closing: CLOSING_STREAM,
            payload: Bytes::new(),
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing != CLOSING_NOTHING
    }
}
