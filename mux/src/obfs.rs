use crate::frame::{FRAME_HEADER_LEN, Frame};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest record a length prefixed read can return.
pub const MAX_RECORD_LEN: usize = u16::MAX as usize;

/// Turns a frame into the bytes put on the wire.
pub type Obfser = Arc<dyn Fn(&Frame) -> io::Result<Bytes> + Send + Sync>;

/// Turns one record read off the wire back into a frame.
pub type Deobfser = Arc<dyn Fn(&[u8]) -> io::Result<Frame> + Send + Sync>;

/// The transport connection a session reads from.
pub type RawConn = dyn AsyncRead + Unpin + Send;

/// Reads exactly one obfuscated record from the transport into `buf`.
#[async_trait]
pub trait ObfsedRead: Send + Sync {
    async fn read_obfsed(&self, conn: &mut RawConn, buf: &mut [u8]) -> io::Result<usize>;
}

/// Records carried as a big endian `u16` length followed by the body.
#[derive(Debug, Default, Clone, Copy)]
pub struct LengthPrefixedRead;

#[async_trait]
impl ObfsedRead for LengthPrefixedRead {
    async fn read_obfsed(&self, conn: &mut RawConn, buf: &mut [u8]) -> io::Result<usize> {
        let len = conn.read_u16().await? as usize;
        if len > buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record of {} bytes does not fit a {} byte buffer", len, buf.len()),
            ));
        }
        conn.read_exact(&mut buf[..len]).await?;
        Ok(len)
    }
}

/// Frame encoding without any disguise, framed for [`LengthPrefixedRead`].
pub fn plain_obfser() -> Obfser {
    Arc::new(|frame: &Frame| -> io::Result<Bytes> {
        let body_len = FRAME_HEADER_LEN + frame.payload.len();
        let prefix = u16::try_from(body_len).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds {}", body_len, MAX_RECORD_LEN),
            )
        })?;

        let mut out = BytesMut::with_capacity(2 + body_len);
        out.put_u16(prefix);
        out.put_u32(frame.stream_id);
        out.put_u64(frame.seq);
        out.put_u8(frame.closing);
        out.put_slice(&frame.payload);
        Ok(out.freeze())
    })
}

/// Inverse of [`plain_obfser`] for a record body with its prefix stripped.
pub fn plain_deobfser() -> Deobfser {
    Arc::new(|raw: &[u8]| -> io::Result<Frame> {
        if raw.len() < FRAME_HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record of {} bytes is shorter than a frame header", raw.len()),
            ));
        }
        let mut raw = raw;
        let stream_id = raw.get_u32();
        let seq = raw.get_u64();
        let closing = raw.get_u8();
        Ok(Frame {
            stream_id,
            seq,
            closing,
            payload: Bytes::copy_from_slice(raw),
        })
    })
}
